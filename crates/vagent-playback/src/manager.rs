//! `PlaybackManager` (§4.8): two downstream delivery modes sharing one
//! refcount/gating discipline (I1, I5, P2).
//!
//! Acquire/release bookkeeping reuses `CallSession::{acquire,release}_tts_token`
//! (`vagent-session::model`) with string tokens: a `"response:<turn>"` token
//! brackets every turn's `ResponseStart`/`ResponseEnd`, and file mode adds one
//! more token per issued `playbackId`. This makes P2 ("ResponseStart+play
//! acquires == ResponseEnd+PlaybackFinished releases, plus at most one
//! watchdog release") fall out of plain `HashSet` membership instead of a
//! hand-rolled counter.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

use vagent_ari::AriClient;
use vagent_audiosocket::AudioSocketServer;
use vagent_gating::GatingCoordinator;
use vagent_session::{MediaBinding, SessionStore};

use crate::error::PlaybackError;

pub const DEFAULT_TTS_GATE_WATCHDOG_MS: u64 = 10_000;
pub const DEFAULT_FAREWELL_HANGUP_DELAY_MS: u64 = 2_500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownstreamMode {
    File,
    Stream,
}

struct TurnBuffer {
    bytes: Vec<u8>,
}

pub struct PlaybackManagerConfig {
    pub media_dir: PathBuf,
    pub watchdog: Duration,
    pub farewell_delay: Duration,
}

impl Default for PlaybackManagerConfig {
    fn default() -> Self {
        Self {
            media_dir: std::env::temp_dir().join("vagent-media"),
            watchdog: Duration::from_millis(DEFAULT_TTS_GATE_WATCHDOG_MS),
            farewell_delay: Duration::from_millis(DEFAULT_FAREWELL_HANGUP_DELAY_MS),
        }
    }
}

pub struct PlaybackManager {
    store: Arc<SessionStore>,
    gating: Arc<GatingCoordinator>,
    ari: Arc<AriClient>,
    audiosocket: Arc<AudioSocketServer>,
    config: PlaybackManagerConfig,
    buffers: DashMap<String, TurnBuffer>,
    watchdog_fired_total: std::sync::atomic::AtomicU64,
    duplicate_playback_finished_total: std::sync::atomic::AtomicU64,
}

impl PlaybackManager {
    pub fn new(
        store: Arc<SessionStore>,
        gating: Arc<GatingCoordinator>,
        ari: Arc<AriClient>,
        audiosocket: Arc<AudioSocketServer>,
        config: PlaybackManagerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            gating,
            ari,
            audiosocket,
            config,
            buffers: DashMap::new(),
            watchdog_fired_total: std::sync::atomic::AtomicU64::new(0),
            duplicate_playback_finished_total: std::sync::atomic::AtomicU64::new(0),
        })
    }

    pub fn watchdog_fired_total(&self) -> u64 {
        self.watchdog_fired_total.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn duplicate_playback_finished_total(&self) -> u64 {
        self.duplicate_playback_finished_total.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn response_token(turn: &Uuid) -> String {
        format!("response:{turn}")
    }

    fn stream_token(turn: &Uuid) -> String {
        format!("stream:{turn}")
    }

    /// `ResponseStart`: acquire the refcount (I1), close the gate, start the
    /// watchdog. Returns the turn token the caller must pass to subsequent
    /// calls for this turn.
    pub fn on_response_start(self: &Arc<Self>, caller_channel_id: &str, mode: DownstreamMode) -> Uuid {
        let turn = Uuid::new_v4();
        let token = match mode {
            DownstreamMode::File => Self::response_token(&turn),
            DownstreamMode::Stream => Self::stream_token(&turn),
        };
        self.store.update(caller_channel_id, |session| session.acquire_tts_token(token.clone()));
        self.gating.acquire(caller_channel_id);
        if mode == DownstreamMode::File {
            self.buffers.insert(turn.to_string(), TurnBuffer { bytes: Vec::new() });
        }
        self.spawn_watchdog(caller_channel_id.to_string(), token);
        turn
    }

    /// `AudioOut`: buffer (file mode) or forward immediately (stream mode).
    pub async fn on_audio_out(
        &self,
        caller_channel_id: &str,
        turn: Uuid,
        mode: DownstreamMode,
        pcm16_bytes: &[u8],
    ) -> Result<(), PlaybackError> {
        match mode {
            DownstreamMode::File => {
                if let Some(mut entry) = self.buffers.get_mut(&turn.to_string()) {
                    entry.bytes.extend_from_slice(pcm16_bytes);
                }
                Ok(())
            }
            DownstreamMode::Stream => {
                let session = self
                    .store
                    .get_by_caller_channel(caller_channel_id)
                    .ok_or_else(|| PlaybackError::NoSession(caller_channel_id.to_string()))?;
                let binding = session.lock().media_binding;
                let Some(MediaBinding::AudioSocket { uuid }) = binding else {
                    return Err(PlaybackError::NoStreamBinding);
                };
                let egress = self.audiosocket.egress(&uuid).ok_or(PlaybackError::NoStreamBinding)?;
                let sample_rate = session.lock().transport_profile.egress_sample_rate;
                let samples: Vec<i16> =
                    pcm16_bytes.chunks_exact(2).map(|c| i16::from_le_bytes([c[0], c[1]])).collect();
                egress.send_pcm16(sample_rate, &samples).await;
                Ok(())
            }
        }
    }

    /// `ResponseEnd`: for file mode, flush the buffered utterance to disk
    /// and issue a single `play`, registering the `playbackId` before
    /// returning (§4.4/§4.10 registration race). For stream mode, release
    /// the refcount directly and synthesize a `PlaybackFinished`.
    pub async fn on_response_end(
        &self,
        caller_channel_id: &str,
        turn: Uuid,
        mode: DownstreamMode,
    ) -> Result<Option<String>, PlaybackError> {
        match mode {
            DownstreamMode::File => {
                let response_token = Self::response_token(&turn);
                self.store
                    .update(caller_channel_id, |s| s.release_tts_token(&response_token))
                    .ok_or_else(|| PlaybackError::NoSession(caller_channel_id.to_string()))?;

                let Some((_, buffer)) = self.buffers.remove(&turn.to_string()) else {
                    return Ok(None);
                };
                if buffer.bytes.is_empty() {
                    self.maybe_release_gate(caller_channel_id);
                    return Ok(None);
                }
                let path = self.stage_file(caller_channel_id, &turn, &buffer.bytes).await?;
                let media_uri = format!("sound:{}", path.display());
                let playback_id = self.ari.play_on_channel_or_bridge(caller_channel_id, &media_uri).await?;

                self.store.register_playback(vagent_session::PlaybackRecord {
                    playback_id: playback_id.clone(),
                    caller_channel_id: caller_channel_id.to_string(),
                    media_path: Some(path.to_string_lossy().to_string()),
                    token: turn,
                    created_at: std::time::Instant::now(),
                })
                .ok();
                self.store.update(caller_channel_id, |s| s.acquire_tts_token(playback_id.clone()));
                self.spawn_watchdog(caller_channel_id.to_string(), playback_id.clone());
                self.maybe_release_gate(caller_channel_id);
                Ok(Some(playback_id))
            }
            DownstreamMode::Stream => {
                let token = Self::stream_token(&turn);
                self.store.update(caller_channel_id, |s| s.release_tts_token(&token));
                self.maybe_release_gate(caller_channel_id);
                Ok(None)
            }
        }
    }

    /// `PlaybackFinished(playbackId)`: release the file-mode token, delete
    /// the staged file. Returns `false` if the id is unknown (duplicate or
    /// already cleaned up), per L4/§4.10.
    pub async fn on_playback_finished(&self, playback_id: &str) -> bool {
        let Some(record) = self.store.complete_playback(playback_id) else {
            self.duplicate_playback_finished_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return false;
        };
        self.store.update(&record.caller_channel_id, |s| s.release_tts_token(playback_id));
        self.maybe_release_gate(&record.caller_channel_id);
        if let Some(path) = &record.media_path {
            let _ = tokio::fs::remove_file(path).await;
        }
        true
    }

    fn maybe_release_gate(&self, caller_channel_id: &str) {
        let zero = self.store.update(caller_channel_id, |s| s.tts_active_count == 0).unwrap_or(true);
        if zero {
            let released = self.gating.release(caller_channel_id);
            if released {
                debug!(caller_channel_id, "tts gate released");
            }
            self.maybe_apply_farewell(caller_channel_id);
        }
    }

    fn maybe_apply_farewell(&self, caller_channel_id: &str) {
        let farewell = self.store.update(caller_channel_id, |s| s.farewell_pending).unwrap_or(false);
        if !farewell {
            return;
        }
        let ari = self.ari.clone();
        let caller_channel_id = caller_channel_id.to_string();
        let delay = self.config.farewell_delay;
        tokio::spawn(async move {
            sleep(delay).await;
            if let Err(err) = ari.hangup_channel(&caller_channel_id).await {
                warn!(%caller_channel_id, error = %err, "farewell hangup failed");
            }
        });
    }

    /// §4.10 watchdog: if the token is still held after `ttsGateWatchdogMs`,
    /// force its release so a dropped `PlaybackFinished` cannot wedge the
    /// gate shut.
    fn spawn_watchdog(self: &Arc<Self>, caller_channel_id: String, token: String) {
        let this = self.clone();
        let watchdog = self.config.watchdog;
        tokio::spawn(async move {
            sleep(watchdog).await;
            let released = this
                .store
                .update(&caller_channel_id, |s| s.release_tts_token(&token))
                .unwrap_or(false);
            if released {
                this.watchdog_fired_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                warn!(caller_channel_id, token, "tts gate watchdog forced release");
                this.maybe_release_gate(&caller_channel_id);
            }
        });
    }

    async fn stage_file(&self, caller_channel_id: &str, turn: &Uuid, bytes: &[u8]) -> Result<PathBuf, PlaybackError> {
        tokio::fs::create_dir_all(&self.config.media_dir).await?;
        let file_name = format!("{caller_channel_id}-{turn}.raw");
        let path = self.config.media_dir.join(file_name);
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vagent_ari::AriConfig;
    use vagent_audiosocket::AudioSocketConfig;

    fn test_manager(store: Arc<SessionStore>) -> Arc<PlaybackManager> {
        let gating = Arc::new(GatingCoordinator::new());
        let ari = Arc::new(AriClient::new(AriConfig {
            base_url: "http://127.0.0.1:0".to_string(),
            ws_url: "ws://127.0.0.1:0".to_string(),
            username: "u".to_string(),
            password: "p".to_string(),
            app: "vagent".to_string(),
        }));
        let audiosocket = AudioSocketServer::new(AudioSocketConfig::default());
        PlaybackManager::new(store, gating, ari, audiosocket, PlaybackManagerConfig::default())
    }

    #[tokio::test]
    async fn stream_mode_round_trip_reopens_gate() {
        let store = SessionStore::new();
        store.create("c1").unwrap();
        let manager = test_manager(store.clone());
        manager.gating.register("c1");

        let turn = manager.on_response_start("c1", DownstreamMode::Stream);
        assert!(!manager.gating.audio_capture_enabled("c1"));
        assert_eq!(store.get_by_caller_channel("c1").unwrap().lock().tts_active_count, 1);

        manager.on_response_end("c1", turn, DownstreamMode::Stream).await.unwrap();
        assert!(manager.gating.audio_capture_enabled("c1"));
        assert_eq!(store.get_by_caller_channel("c1").unwrap().lock().tts_active_count, 0);
    }

    // §8 S3: the PBX drops a `PlaybackFinished`; at `ttsGateWatchdogMs` the
    // refcount is forced to zero, the gate reopens, and the call proceeds.
    #[tokio::test]
    async fn watchdog_forces_release_when_playback_finished_never_arrives() {
        let store = SessionStore::new();
        store.create("c1").unwrap();
        let mut manager_config = PlaybackManagerConfig::default();
        manager_config.watchdog = Duration::from_millis(20);
        let gating = Arc::new(GatingCoordinator::new());
        let ari = Arc::new(AriClient::new(AriConfig {
            base_url: "http://127.0.0.1:0".to_string(),
            ws_url: "ws://127.0.0.1:0".to_string(),
            username: "u".to_string(),
            password: "p".to_string(),
            app: "vagent".to_string(),
        }));
        let audiosocket = AudioSocketServer::new(AudioSocketConfig::default());
        let manager = PlaybackManager::new(store.clone(), gating.clone(), ari, audiosocket, manager_config);
        manager.gating.register("c1");

        store.register_playback(vagent_session::PlaybackRecord {
            playback_id: "pb1".to_string(),
            caller_channel_id: "c1".to_string(),
            media_path: None,
            token: Uuid::new_v4(),
            created_at: std::time::Instant::now(),
        })
        .unwrap();
        store.update("c1", |s| s.acquire_tts_token("pb1"));
        manager.gating.acquire("c1");
        manager.spawn_watchdog("c1".to_string(), "pb1".to_string());

        assert!(!gating.audio_capture_enabled("c1"));
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(gating.audio_capture_enabled("c1"));
        assert_eq!(manager.watchdog_fired_total(), 1);
        assert_eq!(store.get_by_caller_channel("c1").unwrap().lock().tts_active_count, 0);
    }

    #[tokio::test]
    async fn duplicate_playback_finished_is_counted_and_ignored() {
        let store = SessionStore::new();
        store.create("c1").unwrap();
        let manager = test_manager(store.clone());
        manager.gating.register("c1");

        store.register_playback(vagent_session::PlaybackRecord {
            playback_id: "pb1".to_string(),
            caller_channel_id: "c1".to_string(),
            media_path: None,
            token: Uuid::new_v4(),
            created_at: std::time::Instant::now(),
        })
        .unwrap();
        store.update("c1", |s| s.acquire_tts_token("pb1"));

        assert!(manager.on_playback_finished("pb1").await);
        assert!(!manager.on_playback_finished("pb1").await);
        assert_eq!(manager.duplicate_playback_finished_total(), 1);
    }
}
