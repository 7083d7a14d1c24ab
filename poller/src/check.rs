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

//! ServiceCheck (C4): one synchronous health probe against an agent.

use crate::models::{Check, ServiceStatus, StatusSource};
use crate::sanitize::sanitize_field;
use crate::pb::monitoring::agent_service_client::AgentServiceClient;
use crate::pb::monitoring::StatusRequest;
use log::warn;
use std::time::{Duration, Instant};
use tonic::transport::Channel;

const CHECK_TIMEOUT: Duration = Duration::from_secs(30);

const ERROR_SENTINEL: &[u8] = b"Service check failed";

/// Issues a synchronous GetStatus RPC for `check` against `agent_name` over
/// `channel`, producing a `ServiceStatus` (spec §4.4).
pub async fn run_service_check(
    channel: Channel,
    agent_name: &str,
    poller_id: &str,
    partition: &str,
    check: &Check,
) -> ServiceStatus {
    let mut client = AgentServiceClient::new(channel);

    let mut request = tonic::Request::new(StatusRequest {
        service_name: check.name.clone(),
        service_type: check.check_type.clone(),
        agent_id: agent_name.to_string(),
        poller_id: poller_id.to_string(),
        details: check.details.clone().unwrap_or_default(),
        port: if check.check_type.eq_ignore_ascii_case("port") {
            check.port.unwrap_or_default()
        } else {
            0
        },
    });
    request.set_timeout(CHECK_TIMEOUT);

    let started = Instant::now();
    let outcome = client.get_status(request).await;
    let elapsed = started.elapsed();

    match outcome {
        Ok(resp) => {
            let resp = resp.into_inner();
            let agent_id = if resp.agent_id.is_empty() {
                agent_name.to_string()
            } else {
                resp.agent_id
            };

            let message = if check.check_type.eq_ignore_ascii_case("grpc") {
                enrich_grpc_message(resp.message, check.details.as_deref())
            } else {
                resp.message
            };

            ServiceStatus {
                service_name: check.name.clone(),
                service_type: check.check_type.clone(),
                available: resp.available,
                message,
                response_time_ns: resp.response_time,
                agent_id,
                poller_id: poller_id.to_string(),
                partition: partition.to_string(),
                source: StatusSource::GetStatus,
                kv_store_id: String::new(),
            }
        }
        Err(status) => {
            warn!("service check {} against agent {agent_name} failed: {status}", check.name);
            ServiceStatus {
                service_name: check.name.clone(),
                service_type: check.check_type.clone(),
                available: false,
                message: error_body("Service check failed"),
                response_time_ns: elapsed.as_nanos() as i64,
                agent_id: agent_name.to_string(),
                poller_id: poller_id.to_string(),
                partition: partition.to_string(),
                source: StatusSource::GetStatus,
                kv_store_id: String::new(),
            }
        }
    }
}

/// Enriches a grpc check's response body with `host_ip`/`host_name` parsed
/// out of the check's `details`, when `details` carries a parseable host.
fn enrich_grpc_message(message: Vec<u8>, details: Option<&str>) -> Vec<u8> {
    let Some(details) = details else {
        return message;
    };
    let Some(host) = parse_host(details) else {
        return message;
    };

    let mut value: serde_json::Value = match serde_json::from_slice(&message) {
        Ok(v) => v,
        Err(_) if message.is_empty() => serde_json::json!({}),
        Err(_) => return message,
    };

    let Some(obj) = value.as_object_mut() else {
        return message;
    };

    let is_ip = host.parse::<std::net::IpAddr>().is_ok();
    if is_ip {
        obj.insert("host_ip".to_string(), serde_json::Value::String(sanitize_field(&host)));
    } else {
        obj.insert("host_name".to_string(), serde_json::Value::String(sanitize_field(&host)));
    }

    serde_json::to_vec(&value).unwrap_or(message)
}

fn parse_host(details: &str) -> Option<String> {
    let without_scheme = details
        .strip_prefix("grpc://")
        .or_else(|| details.strip_prefix("https://"))
        .or_else(|| details.strip_prefix("http://"))
        .unwrap_or(details);
    let host = without_scheme.split(':').next()?.trim();
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

/// Builds the JSON error body reported for a failed check. Falls back to
/// the plain sentinel string if marshalling the error message itself fails
/// (spec §4.4).
fn error_body(message: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({ "error": message })).unwrap_or_else(|_| error_sentinel().to_vec())
}

/// Plain-sentinel fallback for callers that build the error body themselves
/// and need a guaranteed-non-empty value if JSON construction fails.
pub fn error_sentinel() -> &'static [u8] {
    ERROR_SENTINEL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_wraps_message_as_json() {
        let body = error_body("boom");
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"], "boom");
    }

    #[test]
    fn parse_host_strips_scheme_and_port() {
        assert_eq!(parse_host("grpc://10.0.0.5:50051"), Some("10.0.0.5".to_string()));
        assert_eq!(parse_host("agent.internal:443"), Some("agent.internal".to_string()));
    }

    #[test]
    fn parse_host_rejects_empty() {
        assert_eq!(parse_host(""), None);
        assert_eq!(parse_host("://"), None);
    }

    #[test]
    fn enrich_grpc_message_adds_host_ip_for_ip_literal() {
        let body = br#"{"ok":true}"#.to_vec();
        let enriched = enrich_grpc_message(body, Some("10.0.0.5:50051"));
        let value: serde_json::Value = serde_json::from_slice(&enriched).unwrap();
        assert_eq!(value["host_ip"], "10.0.0.5");
        assert_eq!(value["ok"], true);
    }

    #[test]
    fn enrich_grpc_message_adds_host_name_for_dns_host() {
        let body = br#"{"ok":true}"#.to_vec();
        let enriched = enrich_grpc_message(body, Some("agent.internal:50051"));
        let value: serde_json::Value = serde_json::from_slice(&enriched).unwrap();
        assert_eq!(value["host_name"], "agent.internal");
    }

    #[test]
    fn enrich_grpc_message_leaves_non_json_body_untouched() {
        let body = b"not json".to_vec();
        let enriched = enrich_grpc_message(body.clone(), Some("10.0.0.5:50051"));
        assert_eq!(enriched, body);
    }

    #[test]
    fn enrich_grpc_message_without_details_is_a_no_op() {
        let body = br#"{"ok":true}"#.to_vec();
        assert_eq!(enrich_grpc_message(body.clone(), None), body);
    }
}