//! Conversions between the raw 16-byte payload and its typed sensor view.
//!
//! The bridge never interprets payloads itself; consumers agree out-of-band
//! on this little-endian layout:
//!
//! | bytes  | field      | type |
//! |--------|------------|------|
//! | 0..2   | `bcg`      | i16  |
//! | 2..4   | `ecg`      | i16  |
//! | 4..8   | `ppg_red`  | u32  |
//! | 8..12  | `ppg_ir`   | u32  |
//! | 12..14 | `temp_a`   | u16  |
//! | 14..16 | `temp_b`   | u16  |

use crate::decoder::frame::{PAYLOAD_LEN, Payload};

use serde::{Deserialize, Serialize};

/// One sample from the chair sensor board, decoded from a [`Payload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorSample {
    /// Ballistocardiogram channel.
    pub bcg: i16,
    /// Electrocardiogram channel.
    pub ecg: i16,
    /// PPG red LED reading.
    pub ppg_red: u32,
    /// PPG infrared LED reading.
    pub ppg_ir: u32,
    /// First raw temperature channel.
    pub temp_a: u16,
    /// Second raw temperature channel.
    pub temp_b: u16,
}

impl From<&Payload> for SensorSample {
    fn from(payload: &Payload) -> Self {
        let b = payload.as_bytes();
        Self {
            bcg: i16::from_le_bytes([b[0], b[1]]),
            ecg: i16::from_le_bytes([b[2], b[3]]),
            ppg_red: u32::from_le_bytes([b[4], b[5], b[6], b[7]]),
            ppg_ir: u32::from_le_bytes([b[8], b[9], b[10], b[11]]),
            temp_a: u16::from_le_bytes([b[12], b[13]]),
            temp_b: u16::from_le_bytes([b[14], b[15]]),
        }
    }
}

impl From<SensorSample> for Payload {
    fn from(sample: SensorSample) -> Self {
        let mut b = [0u8; PAYLOAD_LEN];
        b[0..2].copy_from_slice(&sample.bcg.to_le_bytes());
        b[2..4].copy_from_slice(&sample.ecg.to_le_bytes());
        b[4..8].copy_from_slice(&sample.ppg_red.to_le_bytes());
        b[8..12].copy_from_slice(&sample.ppg_ir.to_le_bytes());
        b[12..14].copy_from_slice(&sample.temp_a.to_le_bytes());
        b[14..16].copy_from_slice(&sample.temp_b.to_le_bytes());
        Payload::new(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_little_endian_fields() {
        let payload = Payload::new([
            0xff, 0xff, // bcg = -1
            0x10, 0x00, // ecg = 16
            0x01, 0x00, 0x01, 0x00, // ppg_red = 65537
            0x00, 0x00, 0x00, 0x80, // ppg_ir = 2^31
            0x2c, 0x01, // temp_a = 300
            0x00, 0x01, // temp_b = 256
        ]);

        let sample = SensorSample::from(&payload);

        assert_eq!(sample.bcg, -1);
        assert_eq!(sample.ecg, 16);
        assert_eq!(sample.ppg_red, 65_537);
        assert_eq!(sample.ppg_ir, 1 << 31);
        assert_eq!(sample.temp_a, 300);
        assert_eq!(sample.temp_b, 256);
    }

    #[test]
    fn sample_back_to_payload() {
        let sample = SensorSample {
            bcg: -1234,
            ecg: 987,
            ppg_red: 120_000,
            ppg_ir: 99_000,
            temp_a: 15_000,
            temp_b: 15_100,
        };
        let payload = Payload::from(sample);
        assert_eq!(SensorSample::from(&payload), sample);
    }
}
