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

//! Payload enricher (C9, spec §4.9): wraps every non-sync status message in
//! a core-routable envelope and guarantees the result is valid JSON.

use crate::models::ServiceStatus;
use serde_json::{json, Value};

/// Enriches `status.message` in place unless it is a sync service, whose
/// payload contract is owned by the sync service itself.
pub fn enrich(status: &mut ServiceStatus) {
    if status.service_type.eq_ignore_ascii_case("sync") {
        return;
    }

    let data = to_data_value(&status.message);
    let envelope = json!({
        "poller_id": status.poller_id,
        "agent_id": status.agent_id,
        "partition": status.partition,
        "service_type": status.service_type,
        "service_name": status.service_name,
        "data": data,
    });

    status.message = serde_json::to_vec(&envelope).expect("envelope of serializable values is always valid JSON");
}

fn to_data_value(message: &[u8]) -> Value {
    if message.is_empty() {
        return json!({});
    }
    match serde_json::from_slice::<Value>(message) {
        Ok(v) => v,
        Err(_) => json!({ "message": String::from_utf8_lossy(message) }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StatusSource;

    fn status(service_type: &str, message: &[u8]) -> ServiceStatus {
        ServiceStatus {
            service_name: "svc".to_string(),
            service_type: service_type.to_string(),
            available: true,
            message: message.to_vec(),
            response_time_ns: 0,
            agent_id: "agent-1".to_string(),
            poller_id: "poller-1".to_string(),
            partition: "default".to_string(),
            source: StatusSource::GetStatus,
            kv_store_id: String::new(),
        }
    }

    #[test]
    fn wraps_valid_json_passthrough_as_data() {
        let mut s = status("icmp", br#"{"rtt_ms":3}"#);
        enrich(&mut s);
        let v: Value = serde_json::from_slice(&s.message).unwrap();
        assert_eq!(v["data"]["rtt_ms"], 3);
        assert_eq!(v["service_name"], "svc");
    }

    #[test]
    fn empty_message_becomes_empty_object() {
        let mut s = status("icmp", b"");
        enrich(&mut s);
        let v: Value = serde_json::from_slice(&s.message).unwrap();
        assert_eq!(v["data"], json!({}));
    }

    #[test]
    fn non_json_text_is_wrapped_in_message_key() {
        let mut s = status("icmp", b"connection refused");
        enrich(&mut s);
        let v: Value = serde_json::from_slice(&s.message).unwrap();
        assert_eq!(v["data"]["message"], "connection refused");
    }

    #[test]
    fn sync_services_pass_through_untouched() {
        let mut s = status("sync", b"raw sync payload");
        let original = s.message.clone();
        enrich(&mut s);
        assert_eq!(s.message, original);
    }

    #[test]
    fn double_enrichment_stays_valid_json() {
        let mut s = status("icmp", br#"{"rtt_ms":3}"#);
        enrich(&mut s);
        enrich(&mut s);
        let v: Value = serde_json::from_slice(&s.message).unwrap();
        assert!(v.get("data").is_some());
    }
}