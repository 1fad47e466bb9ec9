//! HTTP+WebSocket client for the Asterisk REST Interface (ARI) control plane
//! (§4.4). No teacher analogue exists (the rvoip stack owns SIP signalling
//! itself rather than delegating to a PBX's REST API); the retry/backoff
//! shapes follow the same bounded-attempts-then-surface-an-error discipline
//! `vagent-rtp::RtpServer::run` uses for its own socket rebind loop.

pub mod client;
pub mod error;
pub mod events;

pub use client::{AriClient, AriConfig, ExternalMediaFormat};
pub use error::AriError;
pub use events::{parse_event, AriEvent, Channel, Playback};
