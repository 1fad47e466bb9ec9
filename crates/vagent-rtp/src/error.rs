use thiserror::Error;

#[derive(Debug, Error)]
pub enum RtpError {
    #[error("RTP packet too short ({len} bytes)")]
    TooShort { len: usize },

    #[error("unsupported RTP version {0}")]
    UnsupportedVersion(u8),

    #[error("unsupported payload type {0} (only PCMU/0 is accepted)")]
    UnsupportedPayloadType(u8),

    #[error("no UDP port available in range {start}-{end}")]
    NoPortAvailable { start: u16, end: u16 },

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}
