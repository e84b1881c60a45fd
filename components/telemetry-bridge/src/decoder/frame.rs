//! Wire layout of the fixed 20-byte upstream frame.
//!
//! ```text
//! +-----+----------+------------------------+----------+-----+
//! | SOF | reserved |   payload (16 bytes)   | checksum | EOF |
//! | 0   | 1        | 2 ..= 17               | 18       | 19  |
//! +-----+----------+------------------------+----------+-----+
//! ```
//!
//! The checksum is the XOR of bytes 0 through 17.

/// Start-of-frame marker.
pub const SOF: u8 = 0x02;

/// End-of-frame marker.
pub const EOF: u8 = 0x03;

/// Total frame length in bytes.
pub const FRAME_LEN: usize = 20;

/// Application payload length in bytes.
pub const PAYLOAD_LEN: usize = 16;

/// Number of leading bytes covered by the checksum.
pub const CHECKSUM_SPAN: usize = 18;

pub(crate) const PAYLOAD_OFFSET: usize = 2;
pub(crate) const CHECKSUM_OFFSET: usize = 18;
pub(crate) const EOF_OFFSET: usize = 19;

/// XOR of every byte in `bytes`.
#[inline]
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc ^ b)
}

/// The 16 application bytes carried by a validated frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Payload([u8; PAYLOAD_LEN]);

impl Payload {
    /// Wrap raw payload bytes.
    pub const fn new(bytes: [u8; PAYLOAD_LEN]) -> Self {
        Self(bytes)
    }

    /// Borrow the raw bytes, exactly as they are forwarded to consumers.
    pub const fn as_bytes(&self) -> &[u8; PAYLOAD_LEN] {
        &self.0
    }

    /// Copy payload bytes out of a complete, already validated frame window.
    pub(crate) fn from_frame(frame: &[u8]) -> Self {
        let mut bytes = [0u8; PAYLOAD_LEN];
        bytes.copy_from_slice(&frame[PAYLOAD_OFFSET..PAYLOAD_OFFSET + PAYLOAD_LEN]);
        Self(bytes)
    }
}

impl From<[u8; PAYLOAD_LEN]> for Payload {
    fn from(bytes: [u8; PAYLOAD_LEN]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Payload {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Build a well-formed frame around `payload`.
pub fn encode_frame(payload: &Payload, reserved: u8) -> [u8; FRAME_LEN] {
    let mut frame = [0u8; FRAME_LEN];
    frame[0] = SOF;
    frame[1] = reserved;
    frame[PAYLOAD_OFFSET..PAYLOAD_OFFSET + PAYLOAD_LEN].copy_from_slice(payload.as_bytes());
    frame[CHECKSUM_OFFSET] = checksum(&frame[..CHECKSUM_SPAN]);
    frame[EOF_OFFSET] = EOF;
    frame
}
