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

//! Lifecycle controller (C11, spec §4.11): starts the cycle ticker, and
//! shuts everything down exactly once.

use crate::agent_poller::{AgentPoller, PollerContext};
use crate::clock::Clock;
use crate::reporter::report_cycle;
use crate::scheduler::run_cycle;
use crate::transport::AgentConnectionPool;
use log::{error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

const STOP_DEADLINE: Duration = Duration::from_secs(10);

/// Drives the periodic poll cycle and owns shutdown coordination.
pub struct Lifecycle {
    pool: Arc<AgentConnectionPool>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Lifecycle {
    pub fn new(pool: Arc<AgentConnectionPool>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            pool,
            shutdown_tx,
            shutdown_rx,
            handle: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Installs the ticker, runs one immediate cycle, then loops on ticks
    /// until shutdown. `ctx_for_report` supplies the identifying fields the
    /// reporter stamps on every upload.
    pub async fn start(
        &self,
        clock: Arc<dyn Clock>,
        poll_interval: Duration,
        agents: Arc<Mutex<HashMap<String, AgentPoller>>>,
        ctx: Arc<dyn PollerContext>,
        core_channel: tonic::transport::Channel,
    ) {
        let pool = self.pool.clone();
        let shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            run_cycle_and_report(&agents, &pool, ctx.as_ref(), &core_channel, shutdown_rx.clone()).await;

            let mut ticker = clock.ticker(poll_interval);
            let mut shutdown_rx = shutdown_rx;
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    tick = ticker.rx.recv() => {
                        if tick.is_none() {
                            break;
                        }
                        run_cycle_and_report(&agents, &pool, ctx.as_ref(), &core_channel, shutdown_rx.clone()).await;
                    }
                }
            }
            ticker.stop();
        });

        *self.handle.lock().await = Some(handle);
    }

    /// Closes the shutdown channel exactly once, joins the start task with
    /// a 10 s deadline, then closes all transports.
    pub async fn stop(&self) {
        if self.shutdown_tx.send(true).is_err() {
            warn!("shutdown channel already closed");
        }

        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            if tokio::time::timeout(STOP_DEADLINE, handle).await.is_err() {
                warn!("lifecycle start task did not exit within {STOP_DEADLINE:?}");
            }
        }

        self.close().await;
    }

    /// Idempotent; safe to call multiple times, including after `stop()`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pool.close_all().await;
        info!("lifecycle closed, all transports released");
    }
}

async fn run_cycle_and_report(
    agents: &Arc<Mutex<HashMap<String, AgentPoller>>>,
    pool: &Arc<AgentConnectionPool>,
    ctx: &dyn PollerContext,
    core_channel: &tonic::transport::Channel,
    shutdown_rx: watch::Receiver<bool>,
) {
    let mut agents = agents.lock().await;
    let statuses = run_cycle(&mut agents, pool, ctx, shutdown_rx).await;
    drop(agents);

    if statuses.is_empty() {
        return;
    }

    let timestamp = ctx.clock().now().timestamp_millis();
    if let Err(e) = report_cycle(
        core_channel.clone(),
        statuses,
        ctx.poller_id(),
        ctx.partition(),
        ctx.source_ip(),
        timestamp,
    )
    .await
    {
        error!("failed to report cycle to core: {e}");
    }
}
