use proptest::prelude::*;
use telemetry_bridge::decoder::decoder::FrameDecoder;
use telemetry_bridge::decoder::frame::{FRAME_LEN, Payload, SOF, encode_frame};

fn payload() -> impl Strategy<Value = Payload> {
    prop::array::uniform16(any::<u8>()).prop_map(Payload::new)
}

/// Line noise that can never be mistaken for a frame start.
fn noise() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(
        (0u8..=254).prop_map(|b| if b >= SOF { b + 1 } else { b }),
        0..48,
    )
}

/// Feed `stream` to a fresh decoder, cut at the given offsets.
fn decode_split(stream: &[u8], cuts: &[usize]) -> Vec<Payload> {
    let mut offsets: Vec<usize> = cuts
        .iter()
        .map(|c| c % (stream.len() + 1))
        .chain([0, stream.len()])
        .collect();
    offsets.sort_unstable();
    offsets.dedup();

    let mut decoder = FrameDecoder::new();
    let mut out = Vec::new();
    for window in offsets.windows(2) {
        out.extend(decoder.feed(&stream[window[0]..window[1]]));
    }
    out
}

proptest! {
    #[test]
    fn frames_survive_noise_and_arbitrary_splits(
        frames in prop::collection::vec((noise(), payload(), any::<u8>()), 1..12),
        trailing in noise(),
        cuts in prop::collection::vec(any::<usize>(), 0..24),
    ) {
        let mut stream = Vec::new();
        for (gap, payload, reserved) in &frames {
            stream.extend_from_slice(gap);
            stream.extend_from_slice(&encode_frame(payload, *reserved));
        }
        stream.extend_from_slice(&trailing);

        let expected: Vec<Payload> = frames.iter().map(|(_, p, _)| *p).collect();
        prop_assert_eq!(decode_split(&stream, &cuts), expected);
    }

    #[test]
    fn corrupted_checksum_drops_only_that_frame(
        payloads in prop::collection::vec(payload(), 2..10),
        victim in any::<prop::sample::Index>(),
        flip in 1u8..=255,
        cuts in prop::collection::vec(any::<usize>(), 0..16),
    ) {
        let victim = victim.index(payloads.len());

        let mut stream = Vec::new();
        for (i, payload) in payloads.iter().enumerate() {
            let mut frame = encode_frame(payload, 0);
            if i == victim {
                frame[FRAME_LEN - 2] ^= flip;
            }
            stream.extend_from_slice(&frame);
        }

        let expected: Vec<Payload> = payloads
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != victim)
            .map(|(_, p)| *p)
            .collect();
        prop_assert_eq!(decode_split(&stream, &cuts), expected);
    }

    #[test]
    fn receive_buffer_stays_bounded(chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 0..64)) {
        let mut decoder = FrameDecoder::new();
        for chunk in &chunks {
            decoder.feed(chunk);
            prop_assert!(decoder.buffered_len() < FRAME_LEN);
        }
    }

    #[test]
    fn every_byte_is_accounted_for(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let mut decoder = FrameDecoder::new();
        let emitted = decoder.feed(&bytes).len();
        let stats = decoder.stats();

        prop_assert_eq!(stats.frames_decoded as usize, emitted);
        prop_assert_eq!(
            emitted * FRAME_LEN + stats.bytes_discarded as usize + decoder.buffered_len(),
            bytes.len()
        );
    }
}
