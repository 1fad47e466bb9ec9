//! The `ProviderAdapter` contract (§4.6): the unified interface for STT,
//! LLM, TTS, and "full agent" providers, driven either directly (monolithic
//! adapters) or composed by `vagent-pipeline::PipelineOrchestrator`.

use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use vagent_session::TransportProfile;

/// Error taxonomy surfaced by adapters (§4.6); the Engine maps these onto
/// the §7 retry/surfacing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    TransientNetwork,
    Auth,
    Protocol,
    RateLimit,
    UnsupportedFormat,
    Cancelled,
}

#[derive(Debug, Error, Clone)]
#[error("provider error ({kind:?}): {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

/// Ordered event stream an adapter produces for one open session (§4.6).
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    AudioOut(Vec<u8>),
    PartialTranscript(String),
    FinalTranscript(String),
    ResponseStart,
    ResponseEnd,
    Error(ProviderErrorKind),
    SpeechStart,
    SpeechEnd,
    /// A provider may further constrain the negotiated profile exactly once,
    /// at session start (§3 `ProviderCapabilities::parseAck`).
    CapabilityAck(Option<TransportProfile>),
}

/// Static capability advertisement (§3). Distinct from
/// `vagent_session::ProviderCapabilities`, which models the *negotiable*
/// format/rate surface; this struct adds the two booleans the Engine needs
/// to pick a driving strategy (§4.6 variant 1 vs 2).
#[derive(Debug, Clone, Copy)]
pub struct AdapterCapabilities {
    pub server_side_turn_detection: bool,
    pub can_negotiate: bool,
    pub is_monolithic: bool,
    pub preferred_chunk_ms: u32,
}

pub struct OpenedSession {
    pub session_id: Uuid,
    pub events: mpsc::Receiver<ProviderEvent>,
}

/// Lifecycle + I/O contract every adapter implements, whether it is a
/// monolithic voice agent or one leg of a composed STT/LLM/TTS pipeline
/// (§4.6).
#[async_trait::async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn capabilities(&self) -> AdapterCapabilities;

    async fn open(&self, profile: TransportProfile, call_id: Uuid) -> Result<OpenedSession, ProviderError>;

    async fn close(&self, session_id: Uuid);

    /// Adapter is responsible for any conversion from the agreed
    /// `ingressFormat`.
    async fn feed_audio(&self, session_id: Uuid, pcm16: &[i16]) -> Result<(), ProviderError>;

    /// LLM-only input path; no-op for adapters without a text surface.
    async fn feed_text(&self, _session_id: Uuid, _text: &str) -> Result<(), ProviderError> {
        Ok(())
    }

    /// Only meaningful for providers without server-side turn detection;
    /// the Engine must not call this for a monolithic adapter whose
    /// capabilities advertise `server_side_turn_detection = true`.
    async fn request_response(&self, session_id: Uuid) -> Result<(), ProviderError>;
}
