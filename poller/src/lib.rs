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

//! ServiceRadar poller: dials a fleet of agents, runs a two-phase check
//! cycle, and reports enriched statuses to core.

pub mod agent_poller;
pub mod check;
pub mod clock;
pub mod completion;
pub mod enrich;
pub mod error;
pub mod identity;
pub mod lifecycle;
pub mod models;
pub mod pb;
pub mod reporter;
pub mod results_poller;
pub mod sanitize;
pub mod scheduler;
pub mod security;
pub mod transport;

use agent_poller::{AgentPoller, PollerContext};
use clock::Clock;
use completion::CompletionAggregator;
use error::Result;
use models::PollerConfig;
use security::Security;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use transport::AgentConnectionPool;

/// Owns everything a running poller needs: the agent pool, the shared
/// completion store, and the identifying fields stamped on outgoing reports.
pub struct Poller {
    poller_id: String,
    partition: String,
    source_ip: String,
    completions: CompletionAggregator,
    clock: Arc<dyn Clock>,
}

impl PollerContext for Poller {
    fn poller_id(&self) -> &str {
        &self.poller_id
    }

    fn partition(&self) -> &str {
        &self.partition
    }

    fn source_ip(&self) -> &str {
        &self.source_ip
    }

    fn completions(&self) -> &CompletionAggregator {
        &self.completions
    }

    fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }
}

/// Everything built from a [`PollerConfig`] and ready to hand to a
/// [`lifecycle::Lifecycle`].
pub struct PollerRuntime {
    pub ctx: Arc<Poller>,
    pub agents: Arc<Mutex<HashMap<String, AgentPoller>>>,
    pub pool: Arc<AgentConnectionPool>,
    pub core_channel: tonic::transport::Channel,
}

/// Name the core connection is stored under in the shared transport pool.
const CORE_TRANSPORT_NAME: &str = "__core__";

/// Builds the runtime from configuration: resolves the poller's source IP,
/// constructs one [`AgentPoller`] per configured agent, and connects the
/// shared transport pool (spec §3, §4.3, §4.6). Each agent may override the
/// poller-wide `security` block; absent an override, the top-level
/// configuration applies (spec §6). `clock` becomes the sole time source
/// the resulting [`Poller`] hands out through [`PollerContext::clock`].
pub async fn build_runtime(config: &PollerConfig, clock: Arc<dyn Clock>) -> Result<PollerRuntime> {
    let source_ip = identity::resolve_source_ip(&config.source_ip);
    let default_security = Security::from_config(config.security.clone())?;

    let pool = Arc::new(AgentConnectionPool::new());
    pool.connect(CORE_TRANSPORT_NAME, &config.core_address, default_security.clone())
        .await?;
    let core_channel = pool
        .channel(CORE_TRANSPORT_NAME)
        .await
        .expect("just connected the core transport");

    let mut agents = HashMap::new();
    for (name, agent_cfg) in &config.agents {
        let security = match &agent_cfg.security {
            Some(cfg) => Security::from_config(Some(cfg.clone()))?,
            None => default_security.clone(),
        };
        pool.connect(name, &agent_cfg.address, security).await?;
        let poller = AgentPoller::new(name, &agent_cfg.address, &source_ip, &agent_cfg.checks);
        agents.insert(name.clone(), poller);
    }

    let ctx = Arc::new(Poller {
        poller_id: config.poller_id.clone(),
        partition: config.partition.clone(),
        source_ip,
        completions: CompletionAggregator::new(),
        clock,
    });

    Ok(PollerRuntime {
        ctx,
        agents: Arc::new(Mutex::new(agents)),
        pool,
        core_channel,
    })
}