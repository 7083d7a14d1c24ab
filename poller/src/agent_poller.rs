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

//! AgentPoller (C6): per-agent fan-out of synchronous checks and bulk
//! results polling.

use crate::check::run_service_check;
use crate::clock::Clock;
use crate::completion::CompletionAggregator;
use crate::identity::resolve_agent_identity;
use crate::models::{AgentIdentity, Check, ServiceStatus, SweepCompletionStatus};
use crate::results_poller::poll_results;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tonic::transport::Channel;

const CHECK_FANOUT_DEADLINE: Duration = Duration::from_secs(30);

/// Dependency-injection seam replacing the back-reference a poller would
/// otherwise hold to its owner (spec §9). `clock()` is the sole time source
/// every scheduling decision reads from (spec §4.1): nothing downstream of
/// a `PollerContext` calls `Utc::now()`/`Instant::now()` directly.
pub trait PollerContext: Send + Sync {
    fn poller_id(&self) -> &str;
    fn partition(&self) -> &str;
    fn source_ip(&self) -> &str;
    fn completions(&self) -> &CompletionAggregator;
    fn clock(&self) -> &dyn Clock;
}

struct ResultsPollerState {
    check: Check,
    last_sequence: String,
    last_run: Option<DateTime<Utc>>,
    /// This agent's most recently observed sweep completion (spec §3, §4.5),
    /// cached locally alongside the push into the cross-agent aggregator.
    last_completion: Option<SweepCompletionStatus>,
}

/// Owns one agent's checks, partitioned at construction into synchronous
/// probes, bulk-results pollers, and config pollers (the latter tracked but
/// not polled here; GetConfig is out of the poller's hot path).
pub struct AgentPoller {
    pub agent_name: String,
    pub identity: AgentIdentity,
    sync_checks: Vec<Check>,
    results_pollers: Vec<ResultsPollerState>,
    config_checks: Vec<Check>,
}

impl AgentPoller {
    pub fn new(agent_name: &str, agent_address: &str, poller_source_ip: &str, checks: &[Check]) -> Self {
        let (device_ip, device_host) = resolve_agent_identity(agent_name, agent_address, poller_source_ip);

        let mut sync_checks = Vec::new();
        let mut results_pollers = Vec::new();
        let mut config_checks = Vec::new();

        for check in checks {
            if check.has_results_poller() {
                results_pollers.push(ResultsPollerState {
                    check: check.clone(),
                    last_sequence: String::new(),
                    last_run: None,
                    last_completion: None,
                });
            } else {
                sync_checks.push(check.clone());
            }
            if check.has_config_poller() {
                config_checks.push(check.clone());
            }
        }

        Self {
            agent_name: agent_name.to_string(),
            identity: AgentIdentity { device_ip, device_host },
            sync_checks,
            results_pollers,
            config_checks,
        }
    }

    /// Only checks matching `filter` are dispatched (used to restrict Phase A
    /// to sweep-typed checks).
    pub async fn execute_checks<F>(&self, channel: Channel, ctx: &dyn PollerContext, filter: F) -> Vec<ServiceStatus>
    where
        F: Fn(&Check) -> bool,
    {
        let checks: Vec<&Check> = self.sync_checks.iter().filter(|c| filter(c)).collect();
        if checks.is_empty() {
            return Vec::new();
        }

        let (tx, mut rx) = mpsc::channel(checks.len());
        for check in checks {
            let channel = channel.clone();
            let tx = tx.clone();
            let agent_name = self.agent_name.clone();
            let poller_id = ctx.poller_id().to_string();
            let partition = ctx.partition().to_string();
            let check = check.clone();
            tokio::spawn(async move {
                let outcome = timeout(
                    CHECK_FANOUT_DEADLINE,
                    run_service_check(channel, &agent_name, &poller_id, &partition, &check),
                )
                .await;
                if let Ok(status) = outcome {
                    let _ = tx.send(status).await;
                }
            });
        }
        drop(tx);

        let mut out = Vec::new();
        while let Some(status) = rx.recv().await {
            out.push(status);
        }
        out
    }

    /// Runs only the results pollers whose `results_interval` has elapsed
    /// and whose check passes `filter` (used to split sweep vs. non-sweep
    /// results pollers across the two scheduler phases).
    pub async fn execute_results<F>(&mut self, channel: Channel, ctx: &dyn PollerContext, filter: F) -> Vec<ServiceStatus>
    where
        F: Fn(&Check) -> bool,
    {
        let now = ctx.clock().now();
        let mut out = Vec::new();

        for poller in self.results_pollers.iter_mut() {
            if !filter(&poller.check) {
                continue;
            }
            let due = match poller.last_run {
                None => true,
                Some(last) => {
                    let interval = poller.check.results_interval.unwrap_or(0);
                    now.signed_duration_since(last).num_seconds() >= interval as i64
                }
            };
            if !due {
                continue;
            }

            let status = poll_results(
                channel.clone(),
                &self.agent_name,
                ctx.poller_id(),
                ctx.partition(),
                &poller.check,
                &mut poller.last_sequence,
                ctx.completions(),
            )
            .await;
            poller.last_run = Some(now);
            if let Some(completion) = ctx.completions().get(&self.agent_name).await {
                poller.last_completion = Some(completion);
            }

            if let Some(status) = status {
                out.push(status);
            }
        }

        out
    }

    pub fn has_sweep_work(&self) -> bool {
        self.sync_checks.iter().any(Check::is_sweep) || self.results_pollers.iter().any(|p| p.check.is_sweep())
    }

    pub fn config_checks(&self) -> &[Check] {
        &self.config_checks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(name: &str, check_type: &str, results_interval: Option<u64>) -> Check {
        Check {
            check_type: check_type.to_string(),
            name: name.to_string(),
            details: None,
            port: None,
            results_interval,
            config_interval: None,
        }
    }

    #[test]
    fn partitions_checks_at_construction() {
        let checks = vec![check("ping", "icmp", None), check("sweep", "sweep", Some(60))];
        let poller = AgentPoller::new("agent-1", "10.0.0.1:50051", "10.0.0.9", &checks);
        assert_eq!(poller.sync_checks.len(), 1);
        assert_eq!(poller.results_pollers.len(), 1);
    }

    #[test]
    fn has_sweep_work_detects_sweep_checks_and_pollers() {
        let checks = vec![check("ping", "icmp", None)];
        let poller = AgentPoller::new("agent-1", "10.0.0.1:50051", "10.0.0.9", &checks);
        assert!(!poller.has_sweep_work());

        let checks = vec![check("sweep", "sweep", Some(60))];
        let poller = AgentPoller::new("agent-1", "10.0.0.1:50051", "10.0.0.9", &checks);
        assert!(poller.has_sweep_work());
    }

    struct FakeAgentWithCompletion;

    #[tonic::async_trait]
    impl crate::pb::monitoring::agent_service_server::AgentService for FakeAgentWithCompletion {
        async fn get_status(
            &self,
            _request: tonic::Request<crate::pb::monitoring::StatusRequest>,
        ) -> Result<tonic::Response<crate::pb::monitoring::StatusResponse>, tonic::Status> {
            unimplemented!("not exercised by this test")
        }

        async fn get_results(
            &self,
            _request: tonic::Request<crate::pb::monitoring::ResultsRequest>,
        ) -> Result<tonic::Response<crate::pb::monitoring::ResultsResponse>, tonic::Status> {
            Ok(tonic::Response::new(crate::pb::monitoring::ResultsResponse {
                available: true,
                data: br#"{"ok":true}"#.to_vec(),
                current_sequence: "seq-1".to_string(),
                has_new_data: true,
                sweep_completion: Some(crate::pb::monitoring::SweepCompletionStatus {
                    status: 2,
                    target_sequence: "s1".to_string(),
                    total_targets: 4,
                    completed_targets: 4,
                    completion_time: 10,
                }),
                timestamp: 0,
                agent_id: "agent-1".to_string(),
                response_time: 0,
            }))
        }

        type StreamResultsStream =
            std::pin::Pin<Box<dyn futures::Stream<Item = Result<crate::pb::monitoring::ResultsChunk, tonic::Status>> + Send>>;

        async fn stream_results(
            &self,
            _request: tonic::Request<crate::pb::monitoring::ResultsRequest>,
        ) -> Result<tonic::Response<Self::StreamResultsStream>, tonic::Status> {
            unimplemented!("not exercised by this test")
        }

        async fn get_config(
            &self,
            _request: tonic::Request<crate::pb::monitoring::ConfigRequest>,
        ) -> Result<tonic::Response<crate::pb::monitoring::ConfigResponse>, tonic::Status> {
            unimplemented!("not exercised by this test")
        }
    }

    struct FakeCtx(CompletionAggregator);

    impl PollerContext for FakeCtx {
        fn poller_id(&self) -> &str {
            "poller-1"
        }
        fn partition(&self) -> &str {
            "default"
        }
        fn source_ip(&self) -> &str {
            "10.0.0.1"
        }
        fn completions(&self) -> &CompletionAggregator {
            &self.0
        }
        fn clock(&self) -> &dyn Clock {
            &crate::clock::SystemClock
        }
    }

    #[tokio::test]
    async fn execute_results_caches_last_completion_locally() {
        use crate::pb::monitoring::agent_service_server::AgentServiceServer;
        use tokio::net::TcpListener;
        use tokio_stream::wrappers::TcpListenerStream;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(AgentServiceServer::new(FakeAgentWithCompletion))
                .serve_with_incoming(TcpListenerStream::new(listener))
                .await
                .unwrap();
        });
        let channel = tonic::transport::Endpoint::from_shared(format!("http://{addr}"))
            .unwrap()
            .connect()
            .await
            .unwrap();

        let checks = vec![check("snmp-poll", "snmp", Some(30))];
        let mut poller = AgentPoller::new("agent-1", "http://ignored", "10.0.0.9", &checks);
        let ctx = FakeCtx(CompletionAggregator::new());

        poller.execute_results(channel, &ctx, |_| true).await;

        let cached = poller.results_pollers[0].last_completion.as_ref().expect("completion cached locally");
        assert_eq!(cached.status, crate::models::CompletionStatusKind::Completed);
        assert_eq!(cached.completed_targets, 4);
    }
}