use thiserror::Error;
use vagent_infra::Severity;

#[derive(Debug, Error)]
pub enum AriError {
    #[error("ARI HTTP request failed after retries: {0}")]
    Http(#[from] reqwest::Error),

    #[error("ARI returned a terminal client error {status}: {body}")]
    Terminal4xx { status: u16, body: String },

    #[error("ARI websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("failed to (de)serialize ARI payload: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("ARI request timed out")]
    Timeout,
}

impl AriError {
    /// §7: 5xx and network errors are transient (retryable); 4xx is terminal.
    pub fn is_transient(&self) -> bool {
        match self {
            AriError::Http(e) => e.status().map(|s| s.is_server_error()).unwrap_or(true),
            AriError::Terminal4xx { .. } => false,
            AriError::WebSocket(_) | AriError::Timeout => true,
            AriError::Serde(_) => false,
        }
    }

    pub fn severity(&self) -> Severity {
        if self.is_transient() {
            Severity::Transient
        } else {
            Severity::Protocol
        }
    }
}
