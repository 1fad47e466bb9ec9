use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("no session for caller channel {0}")]
    NotFound(String),

    #[error("caller channel {0} already has an active session")]
    AlreadyExists(String),

    #[error("binding already set for caller channel {0}")]
    BindingAlreadySet(String),

    #[error("playback id {0} already registered")]
    PlaybackAlreadyRegistered(String),
}
