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

//! Pluggable time source so cycle scheduling is deterministic under test.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// A tick receiver plus a stop handle, mirroring a periodic ticker.
pub struct Ticker {
    pub rx: mpsc::Receiver<Instant>,
    stop_tx: mpsc::Sender<()>,
}

impl Ticker {
    pub fn stop(&self) {
        let _ = self.stop_tx.try_send(());
    }
}

/// Abstraction over wall-clock time and periodic scheduling, so tests can
/// advance time deterministically instead of sleeping for real.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    fn ticker(&self, interval: Duration) -> Ticker;
}

/// The real, `tokio::time`-backed clock used in production.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn ticker(&self, interval: Duration) -> Ticker {
        let (tx, rx) = mpsc::channel(1);
        let (stop_tx, mut stop_rx) = mpsc::channel(1);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval);
            interval.tick().await; // first tick fires immediately; callers handle the immediate poll themselves
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    inst = interval.tick() => {
                        if tx.send(inst).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Ticker { rx, stop_tx }
    }
}

pub fn shared_system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}
