// Local crates
use crate::broadcaster::broadcaster::Broadcaster;
use crate::decoder::decoder::{DecodeStats, FrameDecoder};
use crate::metrics::metrics::CHUNKS_RECEIVED_TOTAL;

// External crates
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Single decode path between a notification source and the broadcaster.
///
/// Chunks are consumed strictly in the order the source queued them. Each
/// one is fed to the decoder and every payload it yields is published before
/// the next chunk is read. Returns the decoder counters once the source
/// closes its channel or `cancel` fires.
#[instrument(
    name = "bridge_pipeline::pump",
    target = "decoder::pump",
    skip_all,
    level = "debug"
)]
pub async fn run_pump(
    mut chunks: mpsc::Receiver<Bytes>,
    mut decoder: FrameDecoder,
    broadcaster: Arc<Broadcaster>,
    cancel: CancellationToken,
) -> DecodeStats {
    tracing::debug!("Decode pump started");

    loop {
        let chunk = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                tracing::debug!("Decode pump cancelled");
                break;
            }

            maybe_chunk = chunks.recv() => match maybe_chunk {
                Some(chunk) => chunk,
                None => {
                    tracing::warn!("Notification source closed its chunk channel");
                    break;
                }
            }
        };

        CHUNKS_RECEIVED_TOTAL.inc();
        tracing::trace!(chunk_len = chunk.len(), "Feeding notification chunk to decoder");

        for payload in decoder.feed(&chunk) {
            let delivered = broadcaster.publish(&payload);
            tracing::trace!(delivered, "Published payload");
        }
    }

    let stats = decoder.stats();
    tracing::info!(
        frames_decoded = stats.frames_decoded,
        checksum_errors = stats.checksum_errors,
        bytes_discarded = stats.bytes_discarded,
        buffered = decoder.buffered_len(),
        "Decode pump stopped"
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::sink::ChannelSink;
    use crate::decoder::frame::{Payload, encode_frame};

    #[tokio::test]
    async fn chunks_are_decoded_and_published_in_order() {
        let broadcaster = Arc::new(Broadcaster::new());
        let (sink, mut receiver) = ChannelSink::new(broadcaster.next_sink_id(), None, 16);
        broadcaster.add_sink(sink);

        let (tx, rx) = mpsc::channel(8);
        let pump = tokio::spawn(run_pump(
            rx,
            FrameDecoder::new(),
            broadcaster.clone(),
            CancellationToken::new(),
        ));

        let mut stream = Vec::new();
        for fill in 1..=3u8 {
            stream.extend_from_slice(&encode_frame(&Payload::new([fill; 16]), 0));
        }
        // Split across chunk boundaries that do not line up with frames.
        for piece in stream.chunks(7) {
            tx.send(Bytes::copy_from_slice(piece)).await.unwrap();
        }
        drop(tx);

        let stats = pump.await.unwrap();
        assert_eq!(stats.frames_decoded, 3);

        for fill in 1..=3u8 {
            assert_eq!(receiver.rx.recv().await.unwrap(), Payload::new([fill; 16]));
        }
    }

    #[tokio::test]
    async fn cancellation_stops_the_pump() {
        let (_tx, rx) = mpsc::channel::<Bytes>(1);
        let cancel = CancellationToken::new();
        let pump = tokio::spawn(run_pump(
            rx,
            FrameDecoder::new(),
            Arc::new(Broadcaster::new()),
            cancel.clone(),
        ));

        cancel.cancel();
        let stats = tokio::time::timeout(std::time::Duration::from_secs(1), pump)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats, DecodeStats::default());
    }
}
