use thiserror::Error;

#[derive(Debug, Error)]
pub enum AudioSocketError {
    #[error("audio received before the UUID handshake frame")]
    AudioBeforeHandshake,

    #[error("handshake payload must be exactly 16 bytes, got {0}")]
    BadHandshakeLength(usize),

    #[error("unknown frame type 0x{0:02X}")]
    UnknownFrameType(u8),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}
