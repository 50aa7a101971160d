//! TCP listener: an accept gate with a connection permit per slot, plus one
//! handler task per live connection.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use chrono::Utc;
use futures_util::StreamExt;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, info, warn};

use super::{EnqueueResult, Packet, Pipeline};

const MAX_LINE_LENGTH: usize = 64 * 1024;

pub(crate) struct TcpOptions {
    pub max_connections: usize,
    pub keep_alive: bool,
    pub keep_alive_period: Option<Duration>,
}

/// Accepts connections until shutdown. The semaphore is the admission gate:
/// no free permit means the connection is refused and closed immediately.
pub(crate) async fn listen(listener: TcpListener, options: TcpOptions, pipeline: Arc<Pipeline>) {
    let permits = Arc::new(Semaphore::new(options.max_connections));
    loop {
        let (stream, peer) = tokio::select! {
            _ = pipeline.shutdown.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(error) => {
                    pipeline.sink.add_error(Box::new(error));
                    return;
                }
            },
        };

        if options.keep_alive {
            if let Err(error) = crate::net::set_keepalive(&stream, options.keep_alive_period) {
                warn!(message = "Failed to enable TCP keepalive.", %error);
            }
        }

        match Arc::clone(&permits).try_acquire_owned() {
            Ok(permit) => {
                let id = connection_id();
                pipeline.remember(&id, peer);
                pipeline
                    .handlers
                    .spawn(handle_connection(stream, id, permit, Arc::clone(&pipeline)));
            }
            Err(_) => {
                info!(message = "Refused TCP connection.", peer = %peer);
                warn!(
                    message = "Maximum TCP connections reached; consider increasing max_tcp_connections."
                );
                drop(stream);
            }
        }
    }
}

/// Reads line-framed input from one connection and feeds the ingress queue.
/// Dropping the permit on exit frees the connection slot.
async fn handle_connection(
    stream: TcpStream,
    id: String,
    permit: OwnedSemaphorePermit,
    pipeline: Arc<Pipeline>,
) {
    pipeline.stats.connection_opened();
    let peer_ip = stream
        .peer_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_default();
    debug!(message = "Accepted TCP connection.", peer = %peer_ip, id = %id);

    let mut lines = FramedRead::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    loop {
        let line = tokio::select! {
            _ = pipeline.shutdown.cancelled() => break,
            next = lines.next() => match next {
                None => break,
                Some(Ok(line)) => line,
                Some(Err(error)) => {
                    debug!(message = "TCP connection error.", %error, id = %id);
                    break;
                }
            },
        };
        if line.is_empty() {
            continue;
        }
        pipeline.stats.record_tcp_packet(line.len() as u64);

        let mut payload = BytesMut::with_capacity(line.len() + 1);
        payload.extend_from_slice(line.as_bytes());
        payload.extend_from_slice(b"\n");
        let result = pipeline.enqueue(Packet {
            payload: payload.freeze(),
            received_at: Utc::now(),
            source: peer_ip.clone(),
        });
        if matches!(result, EnqueueResult::Closed) {
            break;
        }
    }

    drop(permit);
    pipeline.forget(&id);
    pipeline.stats.connection_closed();
    debug!(message = "Closed TCP connection.", id = %id);
}

fn connection_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_ids_are_six_alphanumeric_chars() {
        for _ in 0..32 {
            let id = connection_id();
            assert_eq!(id.len(), 6);
            assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        }
    }
}
