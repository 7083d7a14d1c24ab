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

//! Data model shared by every poller component (spec §3).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

fn default_partition() -> String {
    "default".to_string()
}

fn default_source_ip() -> String {
    "auto".to_string()
}

fn default_poll_interval_secs() -> u64 {
    300
}

/// One declared probe or bulk-results feed against an agent (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Check {
    #[serde(rename = "type")]
    pub check_type: String,
    pub name: String,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub port: Option<i32>,
    #[serde(default)]
    pub results_interval: Option<u64>,
    #[serde(default)]
    pub config_interval: Option<u64>,
}

impl Check {
    /// Presence of `results_interval` routes the check to a ResultsPoller.
    pub fn has_results_poller(&self) -> bool {
        self.results_interval.is_some()
    }

    /// Presence of `config_interval` routes the check to a ConfigPoller.
    pub fn has_config_poller(&self) -> bool {
        self.config_interval.is_some()
    }

    pub fn is_sweep(&self) -> bool {
        self.check_type.eq_ignore_ascii_case("sweep")
    }

    pub fn is_sync_type(&self) -> bool {
        self.check_type.eq_ignore_ascii_case("sync")
    }

    /// Streaming-decision predicate (spec §4.5, §9): deliberately permissive,
    /// overridable by callers that need a stricter rule.
    pub fn is_streaming_service(&self) -> bool {
        self.is_sweep() || self.is_sync_type() || self.name.to_lowercase().contains("sync")
    }

    pub fn reports_as_sync(&self) -> bool {
        self.name.to_lowercase().contains("sync")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentConfig {
    pub address: String,
    #[serde(default)]
    pub security: Option<crate::security::SecurityConfig>,
    pub checks: Vec<Check>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    pub poller_id: String,
    #[serde(default = "default_partition")]
    pub partition: String,
    #[serde(default = "default_source_ip")]
    pub source_ip: String,
    pub core_address: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub security: Option<crate::security::SecurityConfig>,
    pub agents: HashMap<String, AgentConfig>,
    #[serde(default)]
    pub kv_address: Option<String>,
    #[serde(default)]
    pub kv_domain: Option<String>,
}

impl PollerConfig {
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("failed to read config file {:?}: {e}", path.as_ref()))?;
        let cfg: Self = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("failed to parse config file: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.poller_id.is_empty() {
            anyhow::bail!("poller_id is required");
        }
        if self.core_address.is_empty() {
            anyhow::bail!("core_address is required");
        }
        if self.agents.is_empty() {
            anyhow::bail!("agents must be non-empty");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.poll_interval_secs)
    }
}

/// Sweep progress as emitted by a sweep-capable agent (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum CompletionStatusKind {
    Unknown = 0,
    InProgress = 1,
    Completed = 2,
    Failed = 3,
}

impl CompletionStatusKind {
    /// Total ordering: higher values dominate under aggregation (spec §3, §9).
    pub fn rank(self) -> i32 {
        self as i32
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepCompletionStatus {
    pub status: CompletionStatusKind,
    pub target_sequence: String,
    pub total_targets: i64,
    pub completed_targets: i64,
    /// unix millis
    pub completion_time: i64,
}

impl Default for SweepCompletionStatus {
    fn default() -> Self {
        Self {
            status: CompletionStatusKind::Unknown,
            target_sequence: String::new(),
            total_targets: 0,
            completed_targets: 0,
            completion_time: 0,
        }
    }
}

/// What is reported per service to core (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub service_name: String,
    pub service_type: String,
    pub available: bool,
    /// Raw bytes; enrichment (C9) guarantees this parses as JSON before upload.
    pub message: Vec<u8>,
    pub response_time_ns: i64,
    pub agent_id: String,
    pub poller_id: String,
    pub partition: String,
    pub source: StatusSource,
    pub kv_store_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StatusSource {
    GetStatus,
    Results,
    Config,
}

impl StatusSource {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusSource::GetStatus => "getStatus",
            StatusSource::Results => "results",
            StatusSource::Config => "config",
        }
    }
}

/// Derived agent identity, resolved once at AgentPoller construction (spec §3).
#[derive(Debug, Clone, Default)]
pub struct AgentIdentity {
    pub device_ip: String,
    pub device_host: String,
}