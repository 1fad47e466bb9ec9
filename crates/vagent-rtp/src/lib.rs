//! UDP RTP (PCMU) media-plane server with per-SSRC jitter/loss accounting.
//!
//! Grounded on the teacher's `rtp-core::stats` module (`RtpStatsManager`,
//! `JitterEstimator`, sequence/loss tracking) and `rtp-core::packet`'s fixed
//! header parsing, narrowed to the PCMU-only, 20ms-packetization surface
//! this agent's media plane needs — no RTCP, no SRTP/DTLS.

pub mod error;
pub mod flow;
pub mod header;
pub mod server;

pub use error::RtpError;
pub use flow::{FlowRecord, JitterEstimator, SeqOutcome, SequenceTracker};
pub use header::{parse_header, RtpHeader, PCMU_PAYLOAD_TYPE};
pub use server::{RtpIngressFrame, RtpIngressSink, RtpServer, RtpServerConfig};
