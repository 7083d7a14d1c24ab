/*
 * Copyright 2025 Carver Automation Corporation.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Agent connection pool (spec §4.3): one long-lived transport per agent
//! plus one to core, with liveness probing and reconnection.

use crate::error::{PollerError, Result};
use crate::security::Security;
use log::{info, warn};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::time::sleep;
use tonic::transport::{Channel, Endpoint};
use tonic_health::pb::health_client::HealthClient;
use tonic_health::pb::HealthCheckRequest;

const KEEPALIVE_IDLE: Duration = Duration::from_secs(10 * 60);
const MAX_CONNECTION_AGE: Duration = Duration::from_secs(24 * 60 * 60);
const CONNECTION_GRACE: Duration = Duration::from_secs(5 * 60);
const KEEPALIVE_PING: Duration = Duration::from_secs(120);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(20);
const RETRY_BUDGET: usize = 3;
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(32);

async fn build_endpoint(address: &str, security: &Security) -> Result<Endpoint> {
    let addr = if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{address}")
    };
    let mut endpoint = Channel::from_shared(addr)
        .map_err(|e| PollerError::Config(format!("invalid agent address {address}: {e}")))?
        .tcp_keepalive(Some(KEEPALIVE_IDLE))
        .keep_alive_timeout(KEEPALIVE_TIMEOUT)
        .http2_keep_alive_interval(KEEPALIVE_PING)
        .timeout(Duration::from_secs(30));

    let creds = security
        .client_credentials()
        .await
        .map_err(PollerError::Security)?;
    if let Some(tls) = creds.tls {
        endpoint = endpoint
            .tls_config(tls)
            .map_err(|e| PollerError::Transport {
                agent: address.to_string(),
                source: e,
            })?;
    }
    Ok(endpoint)
}

/// Returns `(stale, overdue)` for a transport of the given `age`: `stale`
/// once `age` reaches `MAX_CONNECTION_AGE` (spec §4.3's 24h cap — trips a
/// rebuild), `overdue` once `age` also exceeds `CONNECTION_GRACE` beyond
/// that (a reconnect attempt has had a full grace window to succeed).
fn connection_age_status(age: Duration) -> (bool, bool) {
    (age >= MAX_CONNECTION_AGE, age >= MAX_CONNECTION_AGE + CONNECTION_GRACE)
}

struct Transport {
    channel: Channel,
    address: String,
    security: Security,
    connected_at: Instant,
}

/// Long-lived transport to each configured agent plus one to core. Each
/// connection carries its own [`Security`] (the per-agent config schema
/// allows overriding the poller-wide default — spec §6). On health failure
/// the pool closes and rebuilds the transport under a write lock;
/// operations in flight observe the next successful cycle.
#[derive(Default)]
pub struct AgentConnectionPool {
    transports: RwLock<HashMap<String, Arc<Transport>>>,
}

impl AgentConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn connect(&self, name: &str, address: &str, security: Security) -> Result<()> {
        let channel = Self::dial(address, &security).await?;
        let mut transports = self.transports.write().await;
        transports.insert(
            name.to_string(),
            Arc::new(Transport {
                channel,
                address: address.to_string(),
                security,
                connected_at: Instant::now(),
            }),
        );
        Ok(())
    }

    /// Dials `address` with an exponential-backoff retry (base 1s, capped at
    /// 32s, jittered by up to 100ms) across `RETRY_BUDGET` attempts.
    async fn dial(address: &str, security: &Security) -> Result<Channel> {
        let endpoint = build_endpoint(address, security).await?;
        let mut attempt = 0;
        loop {
            match endpoint.connect().await {
                Ok(channel) => return Ok(channel),
                Err(e) if attempt < RETRY_BUDGET => {
                    attempt += 1;
                    let delay = BACKOFF_BASE.saturating_mul(1 << attempt).min(BACKOFF_MAX);
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..100));
                    warn!(
                        "connect attempt {attempt}/{RETRY_BUDGET} to {address} failed: {e}; retrying after {:.2}s",
                        (delay + jitter).as_secs_f32()
                    );
                    sleep(delay + jitter).await;
                }
                Err(e) => {
                    return Err(PollerError::Transport {
                        agent: address.to_string(),
                        source: e,
                    });
                }
            }
        }
    }

    pub async fn channel(&self, name: &str) -> Option<Channel> {
        self.transports.read().await.get(name).map(|t| t.channel.clone())
    }

    /// Probes `name`'s liveness and connection age and reconnects when
    /// either the health check fails or the transport has passed
    /// `MAX_CONNECTION_AGE` (spec §4.3). Failures are logged, not
    /// propagated: the cycle proceeds with whatever transport is current
    /// (spec: `AgentUnhealthy` is observed and logged, never fatal).
    pub async fn ensure_healthy(&self, name: &str) {
        let age = {
            let transports = self.transports.read().await;
            match transports.get(name) {
                Some(t) => t.connected_at.elapsed(),
                None => return,
            }
        };
        let (stale, overdue) = connection_age_status(age);

        let healthy = if stale { false } else { self.check_health(name, "").await };
        if healthy {
            return;
        }

        warn!("agent {name} unhealthy or past its connection-age cap; reconnecting");
        if let Err(e) = self.reconnect(name).await {
            if overdue {
                warn!("agent {name} is past its connection-age grace window and failed to reconnect: {e}");
            } else {
                warn!("failed to reconnect to agent {name}, will retry next cycle: {e}");
            }
        }
    }

    /// Probes liveness via the standard health service. Does not remove the
    /// agent from the pool on failure (spec: `AgentUnhealthy` is observed
    /// and logged; the cycle proceeds with the most recent transport).
    pub async fn check_health(&self, name: &str, service_name: &str) -> bool {
        let Some(channel) = self.channel(name).await else {
            return false;
        };
        let mut client = HealthClient::new(channel);
        let req = HealthCheckRequest {
            service: service_name.to_string(),
        };
        match client.check(req).await {
            Ok(resp) => resp.into_inner().status == 1, // SERVING
            Err(e) => {
                warn!("health check for agent {name} failed: {e}");
                false
            }
        }
    }

    /// Closes and rebuilds the transport for `name` under a write lock.
    pub async fn reconnect(&self, name: &str) -> Result<()> {
        let existing = {
            let transports = self.transports.read().await;
            transports.get(name).map(|t| (t.address.clone(), t.security.clone()))
        };
        let Some((address, security)) = existing else {
            return Err(PollerError::AgentUnhealthy(name.to_string()));
        };
        info!("reconnecting to agent {name} at {address}");
        let channel = Self::dial(&address, &security).await?;
        let mut transports = self.transports.write().await;
        transports.insert(
            name.to_string(),
            Arc::new(Transport {
                channel,
                address,
                security,
                connected_at: Instant::now(),
            }),
        );
        Ok(())
    }

    /// Closes all transports. Safe to call multiple times (spec §4.11).
    pub async fn close_all(&self) {
        let mut transports = self.transports.write().await;
        transports.clear();
    }
}
