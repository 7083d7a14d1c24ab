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

//! Two-phase scheduler (C8, spec §4.8): sweep phase, wait-for-completion,
//! sync-and-other phase, then handoff to the reporter.

use crate::agent_poller::{AgentPoller, PollerContext};
use crate::clock::Clock;
use crate::completion::CompletionAggregator;
use crate::enrich::enrich;
use crate::models::{CompletionStatusKind, ServiceStatus};
use crate::transport::AgentConnectionPool;
use log::{info, warn};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::watch;

const COMPLETION_POLL_INTERVAL: Duration = Duration::from_millis(500);
const MAX_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    SweepRunning,
    WaitingForCompletion,
    Completed,
    Timeout,
    SyncRunning,
    Reporting,
}

/// Runs one poll cycle across every configured agent (spec §4.8). Returns
/// the combined statuses ready for enrichment and reporting.
pub async fn run_cycle(
    agents: &mut HashMap<String, AgentPoller>,
    pool: &AgentConnectionPool,
    ctx: &dyn PollerContext,
    mut shutdown: watch::Receiver<bool>,
) -> Vec<ServiceStatus> {
    let mut state = CycleState::Idle;
    let mut collected = Vec::new();

    if *shutdown.borrow() {
        return collected;
    }

    for name in agents.keys() {
        pool.ensure_healthy(name).await;
    }

    state = CycleState::SweepRunning;
    info!("cycle: {state:?}");
    let mut any_sweep_work = false;
    for (name, poller) in agents.iter_mut() {
        if !poller.has_sweep_work() {
            continue;
        }
        any_sweep_work = true;
        let Some(channel) = pool.channel(name).await else {
            warn!("no transport for sweep agent {name}, skipping this cycle");
            continue;
        };
        collected.extend(poller.execute_checks(channel.clone(), ctx, |c| c.is_sweep()).await);
        collected.extend(poller.execute_results(channel, ctx, |c| c.is_sweep()).await);

        if *shutdown.borrow() {
            return finish(collected, CycleState::Reporting);
        }
    }

    if any_sweep_work {
        state = CycleState::WaitingForCompletion;
        info!("cycle: {state:?}");
        let completed = wait_for_completion(ctx.completions(), &mut shutdown, MAX_WAIT, ctx.clock()).await;
        state = if completed { CycleState::Completed } else { CycleState::Timeout };
        info!("cycle: {state:?}");
    } else {
        info!("cycle: no sweep work configured, skipping wait-for-completion");
    }

    if *shutdown.borrow() {
        return finish(collected, CycleState::Reporting);
    }

    state = CycleState::SyncRunning;
    info!("cycle: {state:?}");
    for (name, poller) in agents.iter_mut() {
        let Some(channel) = pool.channel(name).await else {
            warn!("no transport for agent {name}, skipping this cycle");
            continue;
        };
        collected.extend(poller.execute_checks(channel.clone(), ctx, |_| true).await);
        collected.extend(poller.execute_results(channel, ctx, |c| !c.is_sweep()).await);

        if *shutdown.borrow() {
            break;
        }
    }

    finish(collected, CycleState::Reporting)
}

fn finish(mut collected: Vec<ServiceStatus>, _state: CycleState) -> Vec<ServiceStatus> {
    for status in collected.iter_mut() {
        enrich(status);
    }
    collected
}

/// Polls the aggregator at `COMPLETION_POLL_INTERVAL` until it reports at
/// least `COMPLETED`, `max_wait` elapses, or shutdown is requested. The
/// returned bool is for observability only (spec §4.8): a timed-out
/// aggregate is still forwarded to Phase B with its partial counts.
/// `clock` is the sole time source for the deadline check (spec §4.1).
async fn wait_for_completion(
    completions: &CompletionAggregator,
    shutdown: &mut watch::Receiver<bool>,
    max_wait: Duration,
    clock: &dyn Clock,
) -> bool {
    let deadline = clock.now() + chrono::Duration::from_std(max_wait).unwrap_or(chrono::Duration::zero());

    loop {
        if let Some(status) = completions.aggregate().await {
            if status.status.rank() >= CompletionStatusKind::Completed.rank() {
                return true;
            }
        }

        if clock.now() >= deadline {
            return false;
        }

        tokio::select! {
            _ = tokio::time::sleep(COMPLETION_POLL_INTERVAL) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return false;
                }
            }
        }
    }
}
