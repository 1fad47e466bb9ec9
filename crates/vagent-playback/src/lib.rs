//! Downstream audio delivery (§4.8): buffers or streams synthesized speech
//! out to the caller and owns the TTS gating refcount shared with
//! `vagent-gating` and `vagent-session`.

pub mod error;
pub mod manager;

pub use error::PlaybackError;
pub use manager::{DownstreamMode, PlaybackManager, PlaybackManagerConfig};
