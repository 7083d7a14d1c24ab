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

//! Error taxonomy for the poller.

use thiserror::Error;

/// Result type for poller components.
pub type Result<T> = std::result::Result<T, PollerError>;

/// Errors recognized across the poller's components (spec §7).
#[derive(Error, Debug)]
pub enum PollerError {
    /// Invalid or missing configuration. Fatal at startup.
    #[error("config error: {0}")]
    Config(String),

    /// Connect/reconnect failure, keepalive loss. Recovered by reconnection.
    #[error("transport error for {agent}: {source}")]
    Transport {
        agent: String,
        #[source]
        source: tonic::transport::Error,
    },

    /// Per-call RPC failure, recoverable: callers convert this into an
    /// `available: false` ServiceStatus rather than aborting the cycle.
    #[error("rpc error: {0}")]
    Rpc(#[from] tonic::Status),

    /// The agent does not implement bulk results for this service.
    #[error("unimplemented")]
    Unimplemented,

    /// A results stream ended without a final chunk.
    #[error("stream truncated before final chunk for {service}")]
    StreamTruncated { service: String },

    /// Health probe failed; logged, cycle proceeds with stale transport.
    #[error("agent {0} unhealthy")]
    AgentUnhealthy(String),

    /// Failed to deliver a cycle's statuses to core.
    #[error("report to core failed: {0}")]
    Report(String),

    #[error("security error: {0}")]
    Security(#[from] SecurityError),
}

/// Errors specific to credential provisioning (spec §4.2).
#[derive(Error, Debug)]
pub enum SecurityError {
    #[error("config error: {0}")]
    Config(String),

    #[error("security role {role} has no credential recipe for mode {mode}")]
    ServiceRole { mode: &'static str, role: String },

    #[error("workload API error: {0}")]
    WorkloadApi(String),
}

impl PollerError {
    pub fn is_unimplemented(status: &tonic::Status) -> bool {
        status.code() == tonic::Code::Unimplemented
    }

    pub fn is_not_found(status: &tonic::Status) -> bool {
        status.code() == tonic::Code::NotFound
    }
}