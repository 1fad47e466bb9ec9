//! Length-prefixed TCP AudioSocket media-plane server (§4.3).
//!
//! There is no direct teacher analogue for this framing (the teacher stack
//! speaks SIP/RTP, not AudioSocket); the server loop is written in the same
//! idiom as `vagent-rtp::server` (config struct, `Arc` singleton, per-flow
//! ingress normalization shared via `vagent-audio::FlowAudioState`) so the
//! two media-plane servers read as one family.

pub mod error;
pub mod frame;
pub mod server;

pub use error::AudioSocketError;
pub use frame::{encode, FrameType};
pub use server::{
    AudioSocketConfig, AudioSocketEvent, AudioSocketServer, AudioSocketSink, EgressHandle,
    DEFAULT_EGRESS_STALL_TIMEOUT_MS,
};
