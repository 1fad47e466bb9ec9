//! `GatingCoordinator` (§4.9): the single authority for `audio_capture_enabled`
//! / `tts_playing` per call, consulted by the RTP and AudioSocket ingress
//! paths before frames are forwarded to a provider.
//!
//! There is no direct teacher analogue (the rvoip stack has no agent-echo
//! feedback loop to guard against); the shape — one small `DashMap`-backed
//! coordinator consulted at the ingress boundary — follows the same
//! "process-wide singleton, per-call entries, no blocking on call-specific
//! work" pattern as `vagent-rtp::RtpServer` and `vagent-session::SessionStore`.

use dashmap::DashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default)]
struct GateState {
    audio_capture_enabled: bool,
    tts_playing: bool,
}

/// Process-wide gating singleton. One entry per active call, keyed by
/// `callerChannelId`. Never blocks on call-specific work.
#[derive(Default)]
pub struct GatingCoordinator {
    gates: DashMap<String, GateState>,
}

impl GatingCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, caller_channel_id: &str) {
        self.gates.insert(caller_channel_id.to_string(), GateState {
            audio_capture_enabled: false,
            tts_playing: false,
        });
    }

    pub fn remove(&self, caller_channel_id: &str) {
        self.gates.remove(caller_channel_id);
    }

    /// `ResponseStart`/first `play`: mark TTS active and close the gate.
    pub fn acquire(&self, caller_channel_id: &str) {
        self.gates.entry(caller_channel_id.to_string()).and_modify(|g| {
            g.tts_playing = true;
            g.audio_capture_enabled = false;
        });
    }

    /// `ResponseEnd`/`PlaybackFinished`/watchdog: reopen the gate. Returns
    /// `true` if the gate transitioned from closed to open (used by
    /// `vagent-playback` to decide whether to fire `TTSGateReleased`).
    pub fn release(&self, caller_channel_id: &str) -> bool {
        let mut released = false;
        self.gates.entry(caller_channel_id.to_string()).and_modify(|g| {
            released = g.tts_playing && !g.audio_capture_enabled;
            g.tts_playing = false;
            g.audio_capture_enabled = true;
        });
        released
    }

    /// Immediately opens the gate regardless of refcount, used when a local
    /// VAD detects a confident speech onset while the agent is speaking
    /// (§4.9 barge-in override).
    pub fn force_barge_in(&self, caller_channel_id: &str) {
        debug!(caller_channel_id, "forcing barge-in, gate opened ahead of refcount release");
        self.gates.entry(caller_channel_id.to_string()).and_modify(|g| {
            g.audio_capture_enabled = true;
        });
    }

    /// Consulted by RTPServer/AudioSocketServer ingress callbacks before
    /// forwarding a frame to the provider. Defaults to closed (frame
    /// dropped) for an unknown caller, since a session with no gate entry
    /// has not completed greeting yet.
    pub fn audio_capture_enabled(&self, caller_channel_id: &str) -> bool {
        self.gates
            .get(caller_channel_id)
            .map(|g| g.audio_capture_enabled)
            .unwrap_or(false)
    }

    pub fn tts_playing(&self, caller_channel_id: &str) -> bool {
        self.gates.get(caller_channel_id).map(|g| g.tts_playing).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_closes_then_release_reopens() {
        let gating = GatingCoordinator::new();
        gating.register("c1");
        assert!(!gating.audio_capture_enabled("c1"));
        gating.acquire("c1");
        assert!(!gating.audio_capture_enabled("c1"));
        assert!(gating.tts_playing("c1"));
        assert!(gating.release("c1"));
        assert!(gating.audio_capture_enabled("c1"));
        assert!(!gating.tts_playing("c1"));
    }

    #[test]
    fn force_barge_in_opens_gate_while_tts_active() {
        let gating = GatingCoordinator::new();
        gating.register("c1");
        gating.acquire("c1");
        gating.force_barge_in("c1");
        assert!(gating.audio_capture_enabled("c1"));
        assert!(gating.tts_playing("c1"));
    }

    #[test]
    fn unknown_caller_defaults_to_gated_closed() {
        let gating = GatingCoordinator::new();
        assert!(!gating.audio_capture_enabled("ghost"));
    }
}
