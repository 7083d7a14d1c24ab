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

//! Source-IP and per-agent device identity resolution (spec §3, §6).

use log::warn;
use std::net::ToSocketAddrs;

/// Resolves the poller's own source IP. Order: `SERVICERADAR_SOURCE_IP`
/// override, then (if `configured == "auto"`) `POD_IP`/`HOST_IP`/`NODE_IP`,
/// then the literal configured value.
pub fn resolve_source_ip(configured: &str) -> String {
    if let Ok(v) = std::env::var("SERVICERADAR_SOURCE_IP") {
        if !v.trim().is_empty() {
            return v;
        }
    }
    if configured == "auto" {
        for var in ["POD_IP", "HOST_IP", "NODE_IP"] {
            if let Ok(v) = std::env::var(var) {
                if !v.trim().is_empty() {
                    return v;
                }
            }
        }
        warn!("source_ip=auto but no POD_IP/HOST_IP/NODE_IP set; leaving as \"auto\"");
    }
    configured.to_string()
}

/// Environment variable name for a per-agent IP override:
/// `SERVICERADAR_AGENT_<NAME>_IP`, with the name uppercased and
/// dashes replaced by underscores.
fn agent_env_var(agent_name: &str) -> String {
    let normalized = agent_name.to_uppercase().replace('-', "_");
    format!("SERVICERADAR_AGENT_{normalized}_IP")
}

/// Resolves `{device_ip, device_host}` for an agent (spec §3): environment
/// override, then the configured address host, then agent-name DNS, then
/// the poller's own source IP as a last resort.
pub fn resolve_agent_identity(agent_name: &str, agent_address: &str, poller_source_ip: &str) -> (String, String) {
    if let Ok(ip) = std::env::var(agent_env_var(agent_name)) {
        if !ip.trim().is_empty() {
            return (ip, agent_name.to_string());
        }
    }

    let host = address_host(agent_address).unwrap_or_else(|| agent_name.to_string());

    if let Some(ip) = host_is_ip(&host) {
        return (ip, host);
    }

    if let Some(ip) = dns_lookup(&host) {
        return (ip, host);
    }

    (poller_source_ip.to_string(), host)
}

fn address_host(address: &str) -> Option<String> {
    let without_scheme = address
        .strip_prefix("https://")
        .or_else(|| address.strip_prefix("http://"))
        .unwrap_or(address);
    without_scheme.split(':').next().map(|s| s.to_string()).filter(|s| !s.is_empty())
}

fn host_is_ip(host: &str) -> Option<String> {
    host.parse::<std::net::IpAddr>().ok().map(|ip| ip.to_string())
}

fn dns_lookup(host: &str) -> Option<String> {
    (host, 0u16)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .map(|addr| addr.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variable access is process-global; serialize these tests.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn agent_env_var_normalizes_name() {
        assert_eq!(agent_env_var("core-router"), "SERVICERADAR_AGENT_CORE_ROUTER_IP");
    }

    #[test]
    fn resolve_source_ip_prefers_explicit_override() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("SERVICERADAR_SOURCE_IP", "10.1.1.1");
        std::env::remove_var("POD_IP");
        assert_eq!(resolve_source_ip("auto"), "10.1.1.1");
        std::env::remove_var("SERVICERADAR_SOURCE_IP");
    }

    #[test]
    fn resolve_source_ip_falls_back_to_pod_ip() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("SERVICERADAR_SOURCE_IP");
        std::env::set_var("POD_IP", "10.0.0.5");
        assert_eq!(resolve_source_ip("auto"), "10.0.0.5");
        std::env::remove_var("POD_IP");
    }

    #[test]
    fn resolve_source_ip_keeps_literal_value() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("SERVICERADAR_SOURCE_IP");
        std::env::remove_var("POD_IP");
        std::env::remove_var("HOST_IP");
        std::env::remove_var("NODE_IP");
        assert_eq!(resolve_source_ip("192.168.1.1"), "192.168.1.1");
    }

    #[test]
    fn agent_identity_prefers_env_override() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("SERVICERADAR_AGENT_EDGE_1_IP", "172.16.0.9");
        let (ip, host) = resolve_agent_identity("edge-1", "edge-1.internal:50051", "10.0.0.1");
        assert_eq!(ip, "172.16.0.9");
        assert_eq!(host, "edge-1");
        std::env::remove_var("SERVICERADAR_AGENT_EDGE_1_IP");
    }

    #[test]
    fn agent_identity_extracts_ip_from_address() {
        let (ip, host) = resolve_agent_identity("edge-2", "10.2.2.2:50051", "10.0.0.1");
        assert_eq!(ip, "10.2.2.2");
        assert_eq!(host, "10.2.2.2");
    }

    #[test]
    fn agent_identity_falls_back_to_source_ip() {
        let (ip, _host) = resolve_agent_identity("edge-3", "unresolvable.invalid.:50051", "10.0.0.1");
        assert_eq!(ip, "10.0.0.1");
    }
}