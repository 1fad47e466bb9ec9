use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AudioError {
    #[error("odd-length mu-law/PCM16 buffer ({len} bytes)")]
    MalformedLength { len: usize },

    #[error("unsupported resample ratio {src}->{dst} Hz (only 8000/16000/24000 pairs are supported)")]
    UnsupportedResampleRatio { src: u32, dst: u32 },
}
