//! HTTP+WebSocket client for the PBX's REST Interface (§4.4).
//!
//! Retry policy: each HTTP command gets up to 3 attempts with 100/300/900ms
//! backoff on transient errors; 4xx is terminal. The websocket reconnects
//! with exponential backoff capped at 30s plus jitter, and makes no attempt
//! to replay missed events (the Engine relies on `deadCallTimeoutMs`
//! instead, per §4.4).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::error::AriError;
use crate::events::{parse_event, AriEvent};

const HTTP_RETRY_BACKOFFS_MS: [u64; 3] = [100, 300, 900];
const WS_MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct AriConfig {
    pub base_url: String,
    pub ws_url: String,
    pub username: String,
    pub password: String,
    pub app: String,
}

#[derive(Debug, Clone)]
pub struct ExternalMediaFormat {
    pub encapsulation: String, // "rtp" | "audiosocket"
    pub codec: String,        // "ulaw" | "slin16"
    pub connection_type: String,
    pub direction: String,
}

pub struct AriClient {
    http: reqwest::Client,
    config: AriConfig,
    connected: Arc<AtomicBool>,
}

impl AriClient {
    pub fn new(config: AriConfig) -> Self {
        Self { http: reqwest::Client::new(), config, connected: Arc::new(AtomicBool::new(false)) }
    }

    /// Observability surface (SPEC_FULL §4.10 `/healthz`): whether the
    /// event websocket is currently connected. Flips to `false` the moment
    /// the read loop exits, before the reconnect backoff sleep begins.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn request_with_retry(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, AriError> {
        let url = format!("{}{}", self.config.base_url, path);
        let mut attempt = 0usize;
        loop {
            let mut req = self
                .http
                .request(method.clone(), &url)
                .basic_auth(&self.config.username, Some(&self.config.password));
            if let Some(ref b) = body {
                req = req.json(b);
            }
            let result = req.send().await;
            match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let text = resp.text().await?;
                        if text.is_empty() {
                            return Ok(Value::Null);
                        }
                        return Ok(serde_json::from_str(&text)?);
                    }
                    if status.is_client_error() {
                        let body = resp.text().await.unwrap_or_default();
                        return Err(AriError::Terminal4xx { status: status.as_u16(), body });
                    }
                    if attempt >= HTTP_RETRY_BACKOFFS_MS.len() {
                        return Err(AriError::Terminal4xx {
                            status: status.as_u16(),
                            body: "exhausted retries".to_string(),
                        });
                    }
                }
                Err(err) => {
                    if attempt >= HTTP_RETRY_BACKOFFS_MS.len() || err.status().map(StatusCode::is_client_error).unwrap_or(false) {
                        return Err(AriError::Http(err));
                    }
                }
            }
            let backoff = HTTP_RETRY_BACKOFFS_MS[attempt];
            debug!(attempt, backoff_ms = backoff, %path, "retrying ARI request");
            sleep(Duration::from_millis(backoff)).await;
            attempt += 1;
        }
    }

    pub async fn answer_channel(&self, channel_id: &str) -> Result<(), AriError> {
        self.request_with_retry(
            reqwest::Method::POST,
            &format!("/channels/{channel_id}/answer"),
            None,
        )
        .await?;
        Ok(())
    }

    pub async fn create_bridge(&self) -> Result<String, AriError> {
        let body = json!({ "type": "mixing" });
        let resp = self.request_with_retry(reqwest::Method::POST, "/bridges", Some(body)).await?;
        Ok(resp["id"].as_str().unwrap_or_default().to_string())
    }

    pub async fn add_channel_to_bridge(&self, bridge_id: &str, channel_id: &str) -> Result<(), AriError> {
        self.request_with_retry(
            reqwest::Method::POST,
            &format!("/bridges/{bridge_id}/addChannel?channel={channel_id}"),
            None,
        )
        .await?;
        Ok(())
    }

    /// Originate the secondary "external media" channel (§4.4).
    pub async fn originate_external_media(
        &self,
        external_host: &str,
        format: &ExternalMediaFormat,
    ) -> Result<String, AriError> {
        let body = json!({
            "app": self.config.app,
            "external_host": external_host,
            "encapsulation": format.encapsulation,
            "format": format.codec,
            "transport": format.connection_type,
            "direction": format.direction,
        });
        let resp = self
            .request_with_retry(reqwest::Method::POST, "/channels/externalMedia", Some(body))
            .await?;
        Ok(resp["id"].as_str().unwrap_or_default().to_string())
    }

    /// Issue a file playback on a channel or bridge, returning the
    /// `playbackId` from the HTTP response. Callers are responsible for
    /// registering this id into the `SessionStore`'s playback index
    /// immediately on return, before yielding control, to close the
    /// registration race documented in §4.4/§4.10.
    pub async fn play_on_channel_or_bridge(&self, target_id: &str, media_uri: &str) -> Result<String, AriError> {
        let body = json!({ "media": media_uri });
        let resp = self
            .request_with_retry(reqwest::Method::POST, &format!("/channels/{target_id}/play"), Some(body))
            .await?;
        Ok(resp["id"].as_str().unwrap_or_default().to_string())
    }

    pub async fn stop_playback(&self, playback_id: &str) -> Result<(), AriError> {
        self.request_with_retry(reqwest::Method::DELETE, &format!("/playbacks/{playback_id}"), None)
            .await?;
        Ok(())
    }

    pub async fn hangup_channel(&self, channel_id: &str) -> Result<(), AriError> {
        self.request_with_retry(reqwest::Method::DELETE, &format!("/channels/{channel_id}"), None)
            .await?;
        Ok(())
    }

    pub async fn delete_bridge(&self, bridge_id: &str) -> Result<(), AriError> {
        self.request_with_retry(reqwest::Method::DELETE, &format!("/bridges/{bridge_id}"), None)
            .await?;
        Ok(())
    }

    /// Connect to the event websocket and forward parsed events until the
    /// process is shut down, reconnecting with capped exponential backoff
    /// plus jitter on any disconnect. No replay of missed events.
    pub async fn run_event_loop(&self, sink: mpsc::Sender<AriEvent>) {
        let mut backoff = Duration::from_millis(200);
        loop {
            let url = format!(
                "{}?app={}&api_key={}:{}",
                self.config.ws_url, self.config.app, self.config.username, self.config.password
            );
            match connect_async(&url).await {
                Ok((mut ws, _)) => {
                    debug!("ARI websocket connected");
                    backoff = Duration::from_millis(200);
                    self.connected.store(true, Ordering::Relaxed);
                    while let Some(msg) = ws.next().await {
                        match msg {
                            Ok(Message::Text(text)) => {
                                let (event, _raw) = parse_event(&text);
                                if sink.send(event).await.is_err() {
                                    return;
                                }
                            }
                            Ok(Message::Ping(payload)) => {
                                let _ = ws.send(Message::Pong(payload)).await;
                            }
                            Ok(Message::Close(_)) => break,
                            Ok(_) => {}
                            Err(err) => {
                                warn!(error = %err, "ARI websocket read error");
                                break;
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, "ARI websocket connect failed");
                }
            }
            self.connected.store(false, Ordering::Relaxed);
            let jitter_ms = rand::thread_rng().gen_range(0..250);
            sleep(backoff + Duration::from_millis(jitter_ms)).await;
            backoff = (backoff * 2).min(WS_MAX_BACKOFF);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_error_classified_as_terminal() {
        let err = AriError::Terminal4xx { status: 404, body: "not found".to_string() };
        assert!(!err.is_transient());
    }
}
