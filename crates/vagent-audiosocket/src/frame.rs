//! AudioSocket wire framing (§4.3): a 3-byte header — `type(u8) |
//! length(u16 big-endian)` — followed by `length` payload bytes.

use crate::error::AudioSocketError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Terminate,
    Uuid,
    Dtmf,
    Pcm16(u32),
    Error,
}

impl FrameType {
    pub fn from_byte(b: u8) -> Result<Self, AudioSocketError> {
        Ok(match b {
            0x00 => FrameType::Terminate,
            0x01 => FrameType::Uuid,
            0x03 => FrameType::Dtmf,
            0x10 => FrameType::Pcm16(8_000),
            0x11 => FrameType::Pcm16(12_000),
            0x12 => FrameType::Pcm16(16_000),
            0x13 => FrameType::Pcm16(24_000),
            0x14 => FrameType::Pcm16(32_000),
            0x15 => FrameType::Pcm16(44_100),
            0x16 => FrameType::Pcm16(48_000),
            0x17 => FrameType::Pcm16(96_000),
            0x18 => FrameType::Pcm16(192_000),
            0xFF => FrameType::Error,
            other => return Err(AudioSocketError::UnknownFrameType(other)),
        })
    }

    pub fn to_byte(self) -> u8 {
        match self {
            FrameType::Terminate => 0x00,
            FrameType::Uuid => 0x01,
            FrameType::Dtmf => 0x03,
            FrameType::Pcm16(8_000) => 0x10,
            FrameType::Pcm16(12_000) => 0x11,
            FrameType::Pcm16(16_000) => 0x12,
            FrameType::Pcm16(24_000) => 0x13,
            FrameType::Pcm16(32_000) => 0x14,
            FrameType::Pcm16(44_100) => 0x15,
            FrameType::Pcm16(48_000) => 0x16,
            FrameType::Pcm16(96_000) => 0x17,
            FrameType::Pcm16(192_000) => 0x18,
            FrameType::Pcm16(_) => 0x12, // unreachable for rates we construct
            FrameType::Error => 0xFF,
        }
    }
}

/// Encode a frame header + payload for writing to the socket.
pub fn encode(frame_type: FrameType, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(3 + payload.len());
    out.push(frame_type.to_byte());
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_known_types() {
        for (byte, expected) in [
            (0x00u8, FrameType::Terminate),
            (0x01, FrameType::Uuid),
            (0x03, FrameType::Dtmf),
            (0x10, FrameType::Pcm16(8_000)),
            (0x12, FrameType::Pcm16(16_000)),
            (0x18, FrameType::Pcm16(192_000)),
            (0xFF, FrameType::Error),
        ] {
            let parsed = FrameType::from_byte(byte).unwrap();
            assert_eq!(parsed, expected);
            assert_eq!(parsed.to_byte(), byte);
        }
    }

    #[test]
    fn rejects_unknown_type() {
        assert!(matches!(
            FrameType::from_byte(0x42),
            Err(AudioSocketError::UnknownFrameType(0x42))
        ));
    }

    #[test]
    fn encode_emits_big_endian_length() {
        let out = encode(FrameType::Pcm16(16_000), &[1, 2, 3, 4]);
        assert_eq!(out, vec![0x12, 0x00, 0x04, 1, 2, 3, 4]);
    }

    #[test]
    fn encode_allows_empty_payload() {
        // L-boundary: a zero-length frame must not be rejected.
        let out = encode(FrameType::Terminate, &[]);
        assert_eq!(out, vec![0x00, 0x00, 0x00]);
    }
}
