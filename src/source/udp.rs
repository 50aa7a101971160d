//! UDP listener: one task reading datagrams into pooled buffers.

use std::sync::Arc;

use bytes::BytesMut;
use chrono::Utc;
use tokio::net::UdpSocket;
use tracing::error;

use super::{EnqueueResult, Packet, Pipeline, UDP_MAX_PACKET_SIZE};

/// Reads datagrams and feeds the ingress queue until shutdown.
///
/// Each datagram is carved off the staging buffer with `split_to`, so the
/// allocation is reused across reads instead of growing per packet.
pub(crate) async fn listen(socket: UdpSocket, pipeline: Arc<Pipeline>) {
    let mut buf = BytesMut::with_capacity(UDP_MAX_PACKET_SIZE);
    loop {
        buf.resize(UDP_MAX_PACKET_SIZE, 0);
        tokio::select! {
            _ = pipeline.shutdown.cancelled() => return,
            received = socket.recv_from(&mut buf) => {
                let (size, peer) = match received {
                    Ok(received) => received,
                    Err(error) => {
                        error!(message = "Failed to read UDP datagram.", %error);
                        continue;
                    }
                };
                pipeline.stats.record_udp_packet(size as u64);

                let payload = buf.split_to(size).freeze();
                let result = pipeline.enqueue(Packet {
                    payload,
                    received_at: Utc::now(),
                    source: peer.ip().to_string(),
                });
                match result {
                    EnqueueResult::Queued => {}
                    EnqueueResult::Dropped => pipeline.stats.record_udp_drop(),
                    EnqueueResult::Closed => return,
                }
            }
        }
    }
}
