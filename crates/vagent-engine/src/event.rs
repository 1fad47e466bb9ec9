//! Per-session event queue (§5, §9). Shared singletons never block on
//! call-specific work: they resolve an identifier to a `callerChannelId`
//! through `SessionStore` and post into this router, which forwards to the
//! one task driving that session's state machine.

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;
use vagent_ari::AriEvent;
use vagent_provider::ProviderEvent;

pub const SESSION_EVENT_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Ari(AriEvent),
    MediaFrame { pcm16: Vec<i16>, sample_rate: u32, likely_silence: bool },
    Dtmf { digit: char },
    Provider(ProviderEvent),
    /// Raised by `Engine`'s per-call `vagent_audio::LocalVad` on a confident
    /// speech onset during playback (§4.9 barge-in override). Only fed by
    /// `vagent_audio::LocalVad` frames; ignored entirely for providers that
    /// advertise `serverSideTurnDetection` (§6 `vad.*`).
    LocalSpeechStart,
}

/// `Arc<DashMap<callerChannelId, Sender<SessionEvent>>>` (SPEC_FULL §5
/// [ADD]): the one piece of process-wide routing state that sits alongside
/// `SessionStore`, used by ingress callbacks and the ARI/provider event
/// pumps to hand an event to the right session task without awaiting it.
#[derive(Default)]
pub struct EventRouter {
    senders: DashMap<String, mpsc::Sender<SessionEvent>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, caller_channel_id: &str) -> mpsc::Receiver<SessionEvent> {
        let (tx, rx) = mpsc::channel(SESSION_EVENT_QUEUE_DEPTH);
        self.senders.insert(caller_channel_id.to_string(), tx);
        rx
    }

    pub fn remove(&self, caller_channel_id: &str) {
        self.senders.remove(caller_channel_id);
    }

    /// Best-effort post: a full queue or a missing session both result in a
    /// silently dropped event plus a debug log, never a panic or a block
    /// (DESIGN NOTES §9: tolerate lookup misses).
    pub async fn post(&self, caller_channel_id: &str, event: SessionEvent) -> bool {
        let Some(sender) = self.senders.get(caller_channel_id).map(|e| e.clone()) else {
            debug!(caller_channel_id, "dropping event for unknown session");
            return false;
        };
        sender.send(event).await.is_ok()
    }
}
