use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("no session for caller channel {0}")]
    NoSession(String),

    #[error("call has no AudioSocket binding, cannot stream")]
    NoStreamBinding,

    #[error("file staging failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("ARI error: {0}")]
    Ari(#[from] vagent_ari::AriError),
}
