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

//! Core reporter (C10, spec §4.10): delivers a cycle's statuses to core,
//! unary or streamed depending on estimated size.

use crate::error::{PollerError, Result};
use crate::models::ServiceStatus;
use crate::pb::poller::poller_service_client::PollerServiceClient;
use crate::pb::poller::{self as pb, PollerStatusChunk, PollerStatusRequest};
use log::{info, warn};
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;

const STREAMING_SIZE_THRESHOLD: usize = 3 * 1024 * 1024;
const STREAMING_COUNT_THRESHOLD: usize = 100;
const CHUNK_SIZE: usize = 100;
const LARGE_MESSAGE_THRESHOLD: usize = 1024 * 1024;
const PER_MESSAGE_OVERHEAD: usize = 200;

fn estimate_size(statuses: &[ServiceStatus]) -> usize {
    statuses.iter().map(|s| s.message.len() + PER_MESSAGE_OVERHEAD).sum()
}

fn to_proto(status: &ServiceStatus) -> pb::ServiceStatus {
    pb::ServiceStatus {
        service_name: status.service_name.clone(),
        service_type: status.service_type.clone(),
        available: status.available,
        message: status.message.clone(),
        response_time_ns: status.response_time_ns,
        agent_id: status.agent_id.clone(),
        poller_id: status.poller_id.clone(),
        partition: status.partition.clone(),
        source: status.source.as_str().to_string(),
        kv_store_id: status.kv_store_id.clone(),
    }
}

fn log_large_messages(statuses: &[ServiceStatus]) {
    for status in statuses {
        if status.message.len() > LARGE_MESSAGE_THRESHOLD {
            warn!(
                "service {} message is {} bytes, above the large-message threshold; not split across chunks",
                status.service_name,
                status.message.len()
            );
        }
    }
}

/// Delivers `statuses` for one cycle to core over `channel`.
pub async fn report_cycle(
    channel: Channel,
    statuses: Vec<ServiceStatus>,
    poller_id: &str,
    partition: &str,
    source_ip: &str,
    timestamp: i64,
) -> Result<()> {
    log_large_messages(&statuses);

    let use_streaming = estimate_size(&statuses) > STREAMING_SIZE_THRESHOLD || statuses.len() > STREAMING_COUNT_THRESHOLD;

    let mut client = PollerServiceClient::new(channel);

    if use_streaming {
        report_streaming(&mut client, statuses, poller_id, partition, source_ip, timestamp).await
    } else {
        report_unary(&mut client, statuses, poller_id, partition, source_ip, timestamp).await
    }
}

async fn report_unary(
    client: &mut PollerServiceClient<Channel>,
    statuses: Vec<ServiceStatus>,
    poller_id: &str,
    partition: &str,
    source_ip: &str,
    timestamp: i64,
) -> Result<()> {
    let request = PollerStatusRequest {
        services: statuses.iter().map(to_proto).collect(),
        poller_id: poller_id.to_string(),
        timestamp,
        partition: partition.to_string(),
        source_ip: source_ip.to_string(),
    };
    client
        .report_status(request)
        .await
        .map_err(|e| PollerError::Report(e.to_string()))?;
    Ok(())
}

async fn report_streaming(
    client: &mut PollerServiceClient<Channel>,
    statuses: Vec<ServiceStatus>,
    poller_id: &str,
    partition: &str,
    source_ip: &str,
    timestamp: i64,
) -> Result<()> {
    let chunks: Vec<&[ServiceStatus]> = statuses.chunks(CHUNK_SIZE).collect();
    let total_chunks = chunks.len() as i32;

    let (tx, rx) = tokio::sync::mpsc::channel(total_chunks.max(1) as usize);
    for (idx, chunk) in chunks.iter().enumerate() {
        let services = chunk.iter().map(to_proto).collect();
        let chunk_msg = PollerStatusChunk {
            services,
            poller_id: poller_id.to_string(),
            timestamp,
            partition: partition.to_string(),
            source_ip: source_ip.to_string(),
            chunk_index: idx as i32,
            total_chunks,
            is_final: idx as i32 == total_chunks - 1,
        };
        if tx.send(chunk_msg).await.is_err() {
            return Err(PollerError::Report("chunk channel closed before all chunks were sent".to_string()));
        }
    }
    drop(tx);

    info!("reporting {} statuses to core in {total_chunks} chunk(s)", statuses.len());

    client
        .stream_status(ReceiverStream::new(rx))
        .await
        .map_err(|e| PollerError::Report(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StatusSource;

    fn status(message_len: usize) -> ServiceStatus {
        ServiceStatus {
            service_name: "svc".to_string(),
            service_type: "icmp".to_string(),
            available: true,
            message: vec![0u8; message_len],
            response_time_ns: 0,
            agent_id: "agent-1".to_string(),
            poller_id: "poller-1".to_string(),
            partition: "default".to_string(),
            source: StatusSource::GetStatus,
            kv_store_id: String::new(),
        }
    }

    #[test]
    fn estimate_size_includes_per_message_overhead() {
        let statuses = vec![status(10), status(20)];
        assert_eq!(estimate_size(&statuses), 10 + 200 + 20 + 200);
    }

    #[test]
    fn streaming_threshold_boundary_on_count() {
        let at_limit = vec![status(1); 100];
        let over_limit = vec![status(1); 101];
        assert!(at_limit.len() <= STREAMING_COUNT_THRESHOLD);
        assert!(over_limit.len() > STREAMING_COUNT_THRESHOLD);
    }

    #[test]
    fn streaming_threshold_boundary_on_size() {
        let at_limit = vec![status(STREAMING_SIZE_THRESHOLD - PER_MESSAGE_OVERHEAD)];
        let over_limit = vec![status(STREAMING_SIZE_THRESHOLD - PER_MESSAGE_OVERHEAD + 1)];
        assert_eq!(estimate_size(&at_limit), STREAMING_SIZE_THRESHOLD);
        assert!(estimate_size(&over_limit) > STREAMING_SIZE_THRESHOLD);
    }

    #[test]
    fn to_proto_preserves_source_as_string() {
        let proto = to_proto(&status(0));
        assert_eq!(proto.source, "getStatus");
    }
}