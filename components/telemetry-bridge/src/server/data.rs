//! Data output port.
//!
//! Every accepted connection becomes a [`ChannelSink`] in the broadcaster
//! and is served by its own task: payloads queued by `publish` are written
//! to the socket as raw 16-byte units with no framing or delimiter, in
//! publish order. Anything the consumer sends is read and ignored so a
//! closed peer is noticed promptly.

// Local crates
use crate::broadcaster::broadcaster::Broadcaster;
use crate::broadcaster::sink::{ChannelSink, SinkId, SinkReceiver};

// External crates
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::instrument;

/// Pause after a failed `accept` (e.g. out of file descriptors).
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Accept consumers on `listener` until `cancel` fires.
///
/// Connection tasks are spawned on `tracker` so teardown can wait for them.
#[instrument(
    name = "bridge_server::data",
    target = "server::data",
    skip_all,
    level = "debug"
)]
pub async fn serve_data(
    listener: TcpListener,
    broadcaster: Arc<Broadcaster>,
    queue_capacity: usize,
    tracker: TaskTracker,
    cancel: CancellationToken,
) {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(data_addr = %addr, "Data server listening");
    }

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                tracing::debug!("Data server stopped accepting consumers");
                break;
            }

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let id = broadcaster.next_sink_id();
                    let (sink, receiver) = ChannelSink::new(id, Some(peer), queue_capacity);
                    broadcaster.add_sink(sink);
                    tracing::info!(%peer, sink_id = id, "Consumer connected");

                    tracker.spawn(serve_consumer(
                        stream,
                        peer,
                        id,
                        receiver,
                        broadcaster.clone(),
                    ));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept consumer connection");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }
}

/// Drive one consumer connection until the peer goes away or the
/// broadcaster closes its sink.
///
/// Stopping the accept loop does not end existing connections; teardown
/// ends them through `Broadcaster::close_all`.
async fn serve_consumer(
    mut stream: TcpStream,
    peer: SocketAddr,
    id: SinkId,
    mut receiver: SinkReceiver,
    broadcaster: Arc<Broadcaster>,
) {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.split();
    let mut scratch = [0u8; 256];

    loop {
        tokio::select! {
            biased;

            _ = receiver.closed.cancelled() => break,

            next = receiver.rx.recv() => {
                let Some(payload) = next else { break };
                tokio::select! {
                    written = writer.write_all(payload.as_bytes()) => {
                        if let Err(e) = written {
                            tracing::debug!(%peer, error = %e, "Write to consumer failed");
                            break;
                        }
                    }
                    _ = receiver.closed.cancelled() => break,
                }
            }

            read = reader.read(&mut scratch) => match read {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(%peer, error = %e, "Read from consumer failed");
                    break;
                }
            }
        }
    }

    broadcaster.remove_sink(id);
    let _ = writer.shutdown().await;
    tracing::info!(%peer, sink_id = id, "Consumer disconnected");
}
