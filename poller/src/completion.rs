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

//! Cross-agent sweep-completion aggregator (C7, spec §4.7).

use crate::models::{CompletionStatusKind, SweepCompletionStatus};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Thread-safe `agent -> SweepCompletionStatus` map. Last writer per agent
/// wins; `aggregate()` folds all agents into a single cluster-wide view.
#[derive(Default)]
pub struct CompletionAggregator {
    statuses: RwLock<HashMap<String, SweepCompletionStatus>>,
}

impl CompletionAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn update(&self, agent: &str, status: SweepCompletionStatus) {
        self.statuses.write().await.insert(agent.to_string(), status);
    }

    /// Returns the most recent status reported by `agent` alone, distinct
    /// from `aggregate()`'s cluster-wide view (spec §4.5's per-poller local
    /// cache).
    pub async fn get(&self, agent: &str) -> Option<SweepCompletionStatus> {
        self.statuses.read().await.get(agent).cloned()
    }

    /// Folds all known agents' statuses into one. `None` if no agent has
    /// reported yet.
    pub async fn aggregate(&self) -> Option<SweepCompletionStatus> {
        let statuses = self.statuses.read().await;
        if statuses.is_empty() {
            return None;
        }

        let mut status = CompletionStatusKind::Unknown;
        let mut total_targets = 0i64;
        let mut completed_targets = 0i64;
        let mut completion_time = 0i64;
        let mut target_sequence = String::new();

        for s in statuses.values() {
            if s.status.rank() > status.rank() {
                status = s.status;
            }
            total_targets += s.total_targets;
            completed_targets += s.completed_targets;
            completion_time = completion_time.max(s.completion_time);
            if target_sequence.is_empty() && !s.target_sequence.is_empty() {
                target_sequence = s.target_sequence.clone();
            }
        }

        if status == CompletionStatusKind::Unknown && completed_targets > 0 {
            status = CompletionStatusKind::InProgress;
        }

        Some(SweepCompletionStatus {
            status,
            target_sequence,
            total_targets,
            completed_targets,
            completion_time,
        })
    }
}
