//! Streaming decoder for the fixed 20-byte upstream frame.
//!
//! Raw notification chunks carry no alignment guarantee with frame
//! boundaries, so the decoder accumulates them in a `BytesMut` receive buffer
//! and repeatedly tries to cut a validated frame off its front:
//!
//! 1. fewer than 20 bytes buffered -> wait for more data
//! 2. no SOF anywhere -> the whole buffer is garbage, drop it
//! 3. SOF at offset n > 0 -> drop the n leading bytes (resync)
//! 4. byte 19 is not EOF -> false SOF match, drop one byte and retry
//! 5. checksum mismatch -> drop the whole 20-byte window
//! 6. otherwise emit bytes 2..=17 and drop the window
//!
//! `feed` never blocks and never performs I/O.

// Local crates
use crate::decoder::frame::{
    CHECKSUM_OFFSET, CHECKSUM_SPAN, EOF, EOF_OFFSET, FRAME_LEN, Payload, SOF, checksum,
};
use crate::metrics::metrics::{BYTES_DISCARDED_TOTAL, CHECKSUM_ERRORS_TOTAL, FRAMES_DECODED_TOTAL};

// External crates
use bytes::{Buf, BytesMut};

const INITIAL_CAPACITY: usize = 4 * FRAME_LEN;

/// Running counters for a single decoder instance.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DecodeStats {
    /// Frames that passed validation and were emitted.
    pub frames_decoded: u64,
    /// 20-byte windows dropped because the checksum byte did not match.
    pub checksum_errors: u64,
    /// Bytes dropped while resynchronising or discarding bad windows.
    pub bytes_discarded: u64,
}

/// Owns the receive buffer and turns raw chunks into validated payloads.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    stats: DecodeStats,
}

impl FrameDecoder {
    /// Create a decoder with an empty receive buffer.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_CAPACITY),
            stats: DecodeStats::default(),
        }
    }

    /// Append `chunk` to the receive buffer and return every payload that can
    /// be cut from it, in arrival order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Payload> {
        self.buffer.extend_from_slice(chunk);

        let mut payloads = Vec::new();

        while self.buffer.len() >= FRAME_LEN {
            let Some(sof_index) = self.buffer.iter().position(|&b| b == SOF) else {
                tracing::trace!(
                    discarded = self.buffer.len(),
                    "No SOF marker in receive buffer, discarding buffered bytes"
                );
                self.discard(self.buffer.len());
                break;
            };

            if sof_index > 0 {
                tracing::trace!(discarded = sof_index, "Resynchronising on next SOF marker");
                self.discard(sof_index);
            }

            if self.buffer.len() < FRAME_LEN {
                break;
            }

            if self.buffer[EOF_OFFSET] != EOF {
                // False SOF match; slide forward one byte at a time.
                self.discard(1);
                continue;
            }

            let received = self.buffer[CHECKSUM_OFFSET];
            let calculated = checksum(&self.buffer[..CHECKSUM_SPAN]);

            if received != calculated {
                tracing::warn!(received, calculated, "Checksum mismatch, discarding frame");
                self.stats.checksum_errors += 1;
                CHECKSUM_ERRORS_TOTAL.inc();
                self.discard(FRAME_LEN);
                continue;
            }

            payloads.push(Payload::from_frame(&self.buffer[..FRAME_LEN]));
            self.buffer.advance(FRAME_LEN);
            self.stats.frames_decoded += 1;
            FRAMES_DECODED_TOTAL.inc();
        }

        payloads
    }

    /// Counters accumulated since this decoder was created.
    pub fn stats(&self) -> DecodeStats {
        self.stats
    }

    /// Number of bytes currently held in the receive buffer.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    fn discard(&mut self, n: usize) {
        self.buffer.advance(n);
        self.stats.bytes_discarded += n as u64;
        BYTES_DISCARDED_TOTAL.inc_by(n as f64);
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::frame::{PAYLOAD_LEN, encode_frame};

    fn frame_of(fill: u8) -> [u8; FRAME_LEN] {
        encode_frame(&Payload::new([fill; PAYLOAD_LEN]), 0x00)
    }

    #[test]
    fn decodes_single_frame() {
        let mut frame = vec![0x02, 0x00];
        frame.extend([0x11; 16]);
        let cs = frame.iter().fold(0u8, |a, b| a ^ b);
        frame.push(cs);
        frame.push(0x03);

        let mut decoder = FrameDecoder::new();
        let payloads = decoder.feed(&frame);

        assert_eq!(payloads, vec![Payload::new([0x11; 16])]);
        assert_eq!(decoder.buffered_len(), 0);
        assert_eq!(decoder.stats().frames_decoded, 1);
    }

    #[test]
    fn waits_for_complete_frame() {
        let frame = frame_of(0x42);
        let mut decoder = FrameDecoder::new();

        assert!(decoder.feed(&frame[..19]).is_empty());
        assert_eq!(decoder.buffered_len(), 19);

        let payloads = decoder.feed(&frame[19..]);
        assert_eq!(payloads.len(), 1);
    }

    #[test]
    fn corrupted_checksum_drops_whole_window() {
        let mut bad = frame_of(0x11);
        bad[18] ^= 0x01;

        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(&bad).is_empty());

        let stats = decoder.stats();
        assert_eq!(stats.checksum_errors, 1);
        assert_eq!(stats.bytes_discarded, FRAME_LEN as u64);
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn checksum_error_does_not_stop_later_frames() {
        let mut bad = frame_of(0x11);
        bad[18] = 0xff;
        let good = frame_of(0x22);

        let mut stream = bad.to_vec();
        stream.extend_from_slice(&good);

        let mut decoder = FrameDecoder::new();
        let payloads = decoder.feed(&stream);

        assert_eq!(payloads, vec![Payload::new([0x22; 16])]);
        assert_eq!(decoder.stats().checksum_errors, 1);
    }

    #[test]
    fn leading_garbage_is_skipped() {
        let mut stream = vec![0xaa, 0xbb, 0xcc];
        stream.extend_from_slice(&frame_of(0x33));

        let mut decoder = FrameDecoder::new();
        let payloads = decoder.feed(&stream);

        assert_eq!(payloads.len(), 1);
        assert_eq!(decoder.stats().bytes_discarded, 3);
    }

    #[test]
    fn buffer_without_sof_is_discarded() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(&[0xee; 25]).is_empty());
        assert_eq!(decoder.buffered_len(), 0);
        assert_eq!(decoder.stats().bytes_discarded, 25);
    }

    #[test]
    fn short_noise_is_kept_until_enough_bytes() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(&[0xee; 5]).is_empty());
        assert_eq!(decoder.buffered_len(), 5);
    }

    #[test]
    fn false_sof_is_skipped_one_byte_at_a_time() {
        // A stray SOF directly before a real frame: byte 19 from the stray
        // position is not EOF, so only that single byte is dropped.
        let mut stream = vec![SOF];
        stream.extend_from_slice(&frame_of(0x44));

        let mut decoder = FrameDecoder::new();
        let payloads = decoder.feed(&stream);

        assert_eq!(payloads, vec![Payload::new([0x44; 16])]);
        assert_eq!(decoder.stats().bytes_discarded, 1);
    }

    #[test]
    fn one_byte_at_a_time() {
        let frames = [frame_of(0x01), frame_of(0x02), frame_of(0x03)];
        let mut decoder = FrameDecoder::new();
        let mut payloads = Vec::new();

        for frame in &frames {
            for b in frame {
                payloads.extend(decoder.feed(&[*b]));
            }
        }

        let fills: Vec<u8> = payloads.iter().map(|p| p.as_bytes()[0]).collect();
        assert_eq!(fills, vec![0x01, 0x02, 0x03]);
    }

    #[test]
    fn reserved_byte_is_ignored() {
        let frame = encode_frame(&Payload::new([0x09; PAYLOAD_LEN]), 0xa5);
        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.feed(&frame).len(), 1);
    }
}
