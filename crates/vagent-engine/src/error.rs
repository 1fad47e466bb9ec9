use thiserror::Error;
use vagent_infra::Severity;
use vagent_provider::ProviderErrorKind;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("capability mismatch: requested profile has no match in provider capabilities")]
    UnsupportedFormat,

    #[error("ARI error: {0}")]
    Ari(#[from] vagent_ari::AriError),

    #[error("session error: {0}")]
    Session(#[from] vagent_session::SessionError),

    #[error("playback error: {0}")]
    Playback(#[from] vagent_playback::PlaybackError),

    #[error("provider error: {0:?}")]
    Provider(ProviderErrorKind),
}

/// §7 Kind→Severity mapping.
pub fn provider_kind_severity(kind: ProviderErrorKind) -> Severity {
    match kind {
        ProviderErrorKind::TransientNetwork | ProviderErrorKind::RateLimit => Severity::Transient,
        ProviderErrorKind::Auth => Severity::Fatal,
        ProviderErrorKind::Protocol => Severity::Protocol,
        ProviderErrorKind::UnsupportedFormat => Severity::Fatal,
        ProviderErrorKind::Cancelled => Severity::Protocol,
    }
}
