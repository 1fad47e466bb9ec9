//! mu-law/PCM16 codec, fixed-ratio resampling, and signal metrics shared by
//! the RTP and AudioSocket media-plane servers.
//!
//! Grounded on the G.711 companding implementation in the teacher's
//! `codec-core::codecs::g711` and the linear-interpolation resampler in
//! `audio-core::format::FormatConverter`, narrowed to exactly the
//! 8/16/24 kHz, mu-law-only surface this agent needs.

pub mod dcblock;
pub mod error;
pub mod frame;
pub mod metrics;
pub mod resample;
pub mod ulaw;
pub mod vad;

pub use dcblock::{dc_block, DcBlockState};
pub use error::AudioError;
pub use frame::{Frame, FlowAudioState};
pub use metrics::{clipping_ratio, dc_offset, looks_big_endian, rms};
pub use resample::resample_pcm16;
pub use ulaw::{pcm16_bytes_to_ulaw_bytes, pcm16_to_ulaw, ulaw_bytes_to_pcm16_bytes, ulaw_to_pcm16};
pub use vad::{LocalVad, VadConfig, VadEvent};
