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

//! ResultsPoller (C5): bulk-results retrieval, unary or streamed, with
//! sweep-completion back-propagation to sync services.

use crate::completion::CompletionAggregator;
use crate::models::{Check, CompletionStatusKind, ServiceStatus, StatusSource, SweepCompletionStatus};
use crate::pb::monitoring::agent_service_client::AgentServiceClient;
use crate::pb::monitoring::{self as pb, ResultsRequest};
use crate::sanitize::extract_macs;
use log::warn;
use serde_json::{Map, Value};
use tonic::transport::Channel;

const MERGE_KEYS: [&str; 5] = ["hosts", "devices", "results", "entries", "data"];

fn to_proto_completion(status: &SweepCompletionStatus) -> pb::SweepCompletionStatus {
    pb::SweepCompletionStatus {
        status: status.status.rank(),
        target_sequence: status.target_sequence.clone(),
        total_targets: status.total_targets,
        completed_targets: status.completed_targets,
        completion_time: status.completion_time,
    }
}

fn from_proto_completion(status: &pb::SweepCompletionStatus) -> SweepCompletionStatus {
    let kind = match status.status {
        1 => CompletionStatusKind::InProgress,
        2 => CompletionStatusKind::Completed,
        3 => CompletionStatusKind::Failed,
        _ => CompletionStatusKind::Unknown,
    };
    SweepCompletionStatus {
        status: kind,
        target_sequence: status.target_sequence.clone(),
        total_targets: status.total_targets,
        completed_targets: status.completed_targets,
        completion_time: status.completion_time,
    }
}

fn error_status(check: &Check, agent_name: &str, poller_id: &str, partition: &str, message: &str) -> ServiceStatus {
    let body = serde_json::json!({ "error": message });
    ServiceStatus {
        service_name: check.name.clone(),
        service_type: check.check_type.clone(),
        available: false,
        message: serde_json::to_vec(&body).unwrap_or_else(|_| b"{\"error\":\"results poll failed\"}".to_vec()),
        response_time_ns: 0,
        agent_id: agent_name.to_string(),
        poller_id: poller_id.to_string(),
        partition: partition.to_string(),
        source: StatusSource::Results,
        kv_store_id: String::new(),
    }
}

fn service_type_for(check: &Check) -> String {
    if check.reports_as_sync() {
        "sync".to_string()
    } else {
        check.check_type.clone()
    }
}

/// Polls bulk results for `check` against `agent_name`. Returns `None` when
/// the agent does not implement bulk results (`Unimplemented`) or when the
/// submit-vs-skip policy decides to skip this cycle (spec §4.5).
pub async fn poll_results(
    channel: Channel,
    agent_name: &str,
    poller_id: &str,
    partition: &str,
    check: &Check,
    last_sequence: &mut String,
    completion: &CompletionAggregator,
) -> Option<ServiceStatus> {
    let is_sync = check.is_sync_type() || check.reports_as_sync();

    // Only sync requests ever attach the aggregated sweep completion, and
    // only when the aggregator actually has something to report (spec §4.5,
    // §8 invariant 4) — an empty aggregator means no field at all, not a
    // zero-valued one.
    let completion_status = if is_sync {
        completion.aggregate().await.map(|s| to_proto_completion(&s))
    } else {
        None
    };

    let request = ResultsRequest {
        service_name: check.name.clone(),
        service_type: check.check_type.clone(),
        agent_id: agent_name.to_string(),
        poller_id: poller_id.to_string(),
        details: check.details.clone().unwrap_or_default(),
        last_sequence: last_sequence.clone(),
        completion_status,
    };

    let mut client = AgentServiceClient::new(channel);

    if check.is_streaming_service() {
        poll_streaming(&mut client, request, check, agent_name, poller_id, partition, last_sequence).await
    } else {
        poll_unary(&mut client, request, check, agent_name, poller_id, partition, last_sequence, completion).await
    }
}

#[allow(clippy::too_many_arguments)]
async fn poll_unary(
    client: &mut AgentServiceClient<Channel>,
    request: ResultsRequest,
    check: &Check,
    agent_name: &str,
    poller_id: &str,
    partition: &str,
    last_sequence: &mut String,
    completion: &CompletionAggregator,
) -> Option<ServiceStatus> {
    let response = match client.get_results(request).await {
        Ok(r) => r.into_inner(),
        Err(status) if crate::error::PollerError::is_unimplemented(&status) => return None,
        Err(status) => {
            return Some(error_status(check, agent_name, poller_id, partition, &status.to_string()));
        }
    };

    if !response.current_sequence.is_empty() {
        *last_sequence = response.current_sequence.clone();
    }

    if let Some(sweep_completion) = response.sweep_completion.as_ref() {
        completion.update(agent_name, from_proto_completion(sweep_completion)).await;
    }

    let is_sync = check.is_sync_type() || check.reports_as_sync();
    if !is_sync && check.is_sweep() && !response.has_new_data {
        return None;
    }

    Some(ServiceStatus {
        service_name: check.name.clone(),
        service_type: service_type_for(check),
        available: response.available,
        message: response.data,
        response_time_ns: response.response_time,
        agent_id: if response.agent_id.is_empty() { agent_name.to_string() } else { response.agent_id },
        poller_id: poller_id.to_string(),
        partition: partition.to_string(),
        source: StatusSource::Results,
        kv_store_id: String::new(),
    })
}

async fn poll_streaming(
    client: &mut AgentServiceClient<Channel>,
    request: ResultsRequest,
    check: &Check,
    agent_name: &str,
    poller_id: &str,
    partition: &str,
    last_sequence: &mut String,
) -> Option<ServiceStatus> {
    let mut stream = match client.stream_results(request).await {
        Ok(r) => r.into_inner(),
        Err(status) if crate::error::PollerError::is_unimplemented(&status) => return None,
        Err(status) if crate::error::PollerError::is_not_found(&status) => {
            return Some(ServiceStatus {
                service_name: check.name.clone(),
                service_type: service_type_for(check),
                available: false,
                message: br#"{"error":"No sweep service configured"}"#.to_vec(),
                response_time_ns: 0,
                agent_id: agent_name.to_string(),
                poller_id: poller_id.to_string(),
                partition: partition.to_string(),
                source: StatusSource::Results,
                kv_store_id: String::new(),
            });
        }
        Err(status) => {
            return Some(error_status(check, agent_name, poller_id, partition, &status.to_string()));
        }
    };

    let mut metadata: Map<String, Value> = Map::new();
    let mut metadata_captured = false;
    let mut devices: Vec<Value> = Vec::new();
    let mut saw_final = false;
    let mut current_sequence = String::new();

    loop {
        use futures::StreamExt;
        let chunk = match stream.next().await {
            Some(Ok(chunk)) => chunk,
            Some(Err(status)) => {
                return Some(error_status(check, agent_name, poller_id, partition, &status.to_string()));
            }
            None => break,
        };

        if !chunk.current_sequence.is_empty() {
            current_sequence = chunk.current_sequence.clone();
        }

        match serde_json::from_slice::<Value>(&chunk.data) {
            Ok(Value::Array(arr)) => devices.extend(arr),
            Ok(Value::Object(mut obj)) => {
                let found = MERGE_KEYS.iter().find_map(|key| obj.remove(*key));
                if let Some(Value::Array(arr)) = found {
                    devices.extend(arr);
                }
                if !metadata_captured {
                    metadata = obj;
                    metadata_captured = true;
                }
            }
            Ok(_) | Err(_) => {
                warn!("results chunk {} for {} on agent {agent_name} was not a JSON array or object", chunk.chunk_index, check.name);
            }
        }

        if chunk.is_final {
            saw_final = true;
            break;
        }
    }

    if !saw_final {
        warn!("results stream for {} on agent {agent_name} ended without a final chunk", check.name);
        let err = crate::error::PollerError::StreamTruncated { service: check.name.clone() };
        return Some(error_status(
            check,
            agent_name,
            poller_id,
            partition,
            &err.to_string(),
        ));
    }

    if !current_sequence.is_empty() {
        *last_sequence = current_sequence;
    }

    let payload = if check.is_sweep() {
        normalize_device_macs(&mut devices);
        let mut obj = metadata;
        obj.insert("hosts".to_string(), Value::Array(devices));
        Value::Object(obj)
    } else {
        Value::Array(devices)
    };

    let message = serde_json::to_vec(&payload).unwrap_or_else(|_| b"[]".to_vec());

    Some(ServiceStatus {
        service_name: check.name.clone(),
        service_type: service_type_for(check),
        available: true,
        message,
        response_time_ns: 0,
        agent_id: agent_name.to_string(),
        poller_id: poller_id.to_string(),
        partition: partition.to_string(),
        source: StatusSource::Results,
        kv_store_id: String::new(),
    })
}

/// Normalizes each merged sweep device's `mac` field in place (spec §8):
/// every well-formed MAC in the raw string is extracted and uppercased,
/// duplicates collapsed, and re-joined. Devices without a `mac` string are
/// left untouched.
fn normalize_device_macs(devices: &mut [Value]) {
    for device in devices.iter_mut() {
        let Some(obj) = device.as_object_mut() else { continue };
        let Some(Value::String(raw)) = obj.get("mac") else { continue };
        let macs = extract_macs(raw);
        if !macs.is_empty() {
            obj.insert("mac".to_string(), Value::String(macs.join(",")));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sweep_check() -> Check {
        Check {
            check_type: "sweep".to_string(),
            name: "network-sweep".to_string(),
            details: None,
            port: None,
            results_interval: Some(60),
            config_interval: None,
        }
    }

    #[test]
    fn service_type_routes_sync_by_name() {
        let mut check = sweep_check();
        check.name = "device-sync".to_string();
        assert_eq!(service_type_for(&check), "sync");
    }

    #[test]
    fn service_type_keeps_configured_type_otherwise() {
        let check = sweep_check();
        assert_eq!(service_type_for(&check), "sweep");
    }

    #[test]
    fn proto_completion_round_trips_rank() {
        let status = SweepCompletionStatus {
            status: CompletionStatusKind::Completed,
            target_sequence: "seq-1".to_string(),
            total_targets: 10,
            completed_targets: 10,
            completion_time: 42,
        };
        let proto = to_proto_completion(&status);
        let back = from_proto_completion(&proto);
        assert_eq!(back, status);
    }

    #[tokio::test]
    async fn sync_request_omits_completion_when_aggregator_empty() {
        let aggregator = CompletionAggregator::new();
        let is_sync = true;
        let completion_status = if is_sync { aggregator.aggregate().await.map(|s| to_proto_completion(&s)) } else { None };
        assert!(completion_status.is_none());
    }

    #[tokio::test]
    async fn sync_request_attaches_completion_once_aggregator_has_entry() {
        let aggregator = CompletionAggregator::new();
        aggregator
            .update(
                "agent-1",
                SweepCompletionStatus {
                    status: CompletionStatusKind::InProgress,
                    target_sequence: "s1".to_string(),
                    total_targets: 10,
                    completed_targets: 5,
                    completion_time: 1,
                },
            )
            .await;
        let completion_status = aggregator.aggregate().await.map(|s| to_proto_completion(&s));
        assert!(completion_status.is_some());
    }

    #[test]
    fn error_status_body_is_valid_json() {
        let check = sweep_check();
        let status = error_status(&check, "agent-1", "poller-1", "default", "boom");
        let value: Value = serde_json::from_slice(&status.message).unwrap();
        assert_eq!(value["error"], "boom");
        assert!(!status.available);
    }

    #[test]
    fn normalize_device_macs_uppercases_and_dedupes() {
        let mut devices = vec![
            serde_json::json!({"id": "a", "mac": "aa:bb:cc:dd:ee:ff seen again as AA:BB:CC:DD:EE:FF"}),
            serde_json::json!({"id": "b"}),
        ];
        normalize_device_macs(&mut devices);
        assert_eq!(devices[0]["mac"], "AA:BB:CC:DD:EE:FF");
        assert_eq!(devices[1].get("mac"), None);
    }

    #[test]
    fn normalize_device_macs_leaves_devices_without_a_mac_field_alone() {
        let mut devices = vec![serde_json::json!({"id": "a", "hostname": "no-mac-here"})];
        normalize_device_macs(&mut devices);
        assert_eq!(devices[0]["hostname"], "no-mac-here");
        assert_eq!(devices[0].get("mac"), None);
    }
}