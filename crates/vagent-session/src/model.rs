//! The `CallSession` data model (§3) and its satellite types.

use std::collections::HashSet;
use std::time::Instant;

use uuid::Uuid;

/// One of the two ways inbound media resolves to a `CallSession` (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaBinding {
    Rtp { ssrc: u32 },
    AudioSocket { uuid: Uuid },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioFormat {
    #[default]
    Pcm16,
    Ulaw,
}

/// Selected by the Engine from the intersection of PBX dial parameters and
/// provider capabilities (§3). Locked at call start; mid-call renegotiation
/// is not permitted (open question in spec §9, resolved as "never" — see
/// DESIGN.md).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportProfile {
    pub ingress_format: AudioFormat,
    pub ingress_sample_rate: u32,
    pub egress_format: AudioFormat,
    pub egress_sample_rate: u32,
    pub chunk_ms: u32,
}

impl Default for TransportProfile {
    fn default() -> Self {
        Self {
            ingress_format: AudioFormat::Pcm16,
            ingress_sample_rate: 16_000,
            egress_format: AudioFormat::Pcm16,
            egress_sample_rate: 16_000,
            chunk_ms: 20,
        }
    }
}

/// Per-provider advertised capability set (§3). `parse_ack` is modeled at
/// the call site (`vagent-provider`) as a one-shot profile refinement, not
/// stored here.
#[derive(Debug, Clone)]
pub struct ProviderCapabilities {
    pub supported_input_formats: Vec<AudioFormat>,
    pub supported_output_formats: Vec<AudioFormat>,
    pub supported_sample_rates: Vec<u32>,
    pub preferred_chunk_ms: u32,
    pub server_side_turn_detection: bool,
    pub can_negotiate: bool,
    pub is_monolithic: bool,
}

impl ProviderCapabilities {
    /// Intersect with the PBX-side constraints one field at a time; `None`
    /// means the requested constraint (e.g. an explicit `egressFormat`) has
    /// no match in this provider's advertised set (§3, §8 S6).
    pub fn negotiate(&self, desired_sample_rate: u32, desired_format: AudioFormat) -> Option<TransportProfile> {
        if !self.supported_sample_rates.contains(&desired_sample_rate) {
            return None;
        }
        if !self.supported_output_formats.contains(&desired_format) {
            return None;
        }
        Some(TransportProfile {
            ingress_format: desired_format,
            ingress_sample_rate: desired_sample_rate,
            egress_format: desired_format,
            egress_sample_rate: desired_sample_rate,
            chunk_ms: self.preferred_chunk_ms,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    Setup,
    Greeting,
    Listening,
    Thinking,
    Speaking,
    Terminating,
}

impl ConversationState {
    /// I4: a session may not transition out of `Terminating` into any other
    /// state.
    pub fn can_transition_to(self, next: ConversationState) -> bool {
        !matches!(self, ConversationState::Terminating) || matches!(next, ConversationState::Terminating)
    }
}

/// `{playbackId, callerChannelId, mediaPath?, token, createdAt}` (§3).
#[derive(Debug, Clone)]
pub struct PlaybackRecord {
    pub playback_id: String,
    pub caller_channel_id: String,
    pub media_path: Option<String>,
    pub token: Uuid,
    pub created_at: Instant,
}

/// One active call, exclusively owned by the `SessionStore` (§3). All
/// mutation happens through `SessionStore::update`, which serializes access
/// per session.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub call_id: Uuid,
    pub caller_channel_id: String,
    pub bridge_id: Option<String>,
    pub media_leg_channel_id: Option<String>,
    pub media_binding: Option<MediaBinding>,
    pub transport_profile: TransportProfile,
    pub conversation_state: ConversationState,
    pub audio_capture_enabled: bool,
    pub tts_active_count: u32,
    pub tts_tokens: HashSet<String>,
    pub pending_response: bool,
    pub farewell_pending: bool,
    pub created_at: Instant,
    pub last_inbound_audio_at: Instant,
    pub last_outbound_audio_at: Instant,
}

impl CallSession {
    pub fn new(caller_channel_id: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            call_id: Uuid::new_v4(),
            caller_channel_id: caller_channel_id.into(),
            bridge_id: None,
            media_leg_channel_id: None,
            media_binding: None,
            transport_profile: TransportProfile::default(),
            conversation_state: ConversationState::Setup,
            audio_capture_enabled: false,
            tts_active_count: 0,
            tts_tokens: HashSet::new(),
            pending_response: false,
            farewell_pending: false,
            created_at: now,
            last_inbound_audio_at: now,
            last_outbound_audio_at: now,
        }
    }

    /// I1: `ttsActiveCount == 0 ⇔ audioCaptureEnabled == true`, modulo an
    /// explicit barge-in override applied by the caller.
    pub fn acquire_tts_token(&mut self, token: impl Into<String>) {
        self.tts_tokens.insert(token.into());
        self.tts_active_count = self.tts_tokens.len() as u32;
        if self.tts_active_count > 0 {
            self.audio_capture_enabled = false;
        }
    }

    /// Returns `true` if the token was present (idempotent per L4: releasing
    /// an unknown token is a no-op).
    pub fn release_tts_token(&mut self, token: &str) -> bool {
        let removed = self.tts_tokens.remove(token);
        self.tts_active_count = self.tts_tokens.len() as u32;
        if self.tts_active_count == 0 {
            self.audio_capture_enabled = true;
        }
        removed
    }

    pub fn force_barge_in(&mut self) {
        self.audio_capture_enabled = true;
    }

    pub fn transition(&mut self, next: ConversationState) -> bool {
        if self.conversation_state.can_transition_to(next) {
            self.conversation_state = next;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tts_token_refcount_gates_capture() {
        let mut session = CallSession::new("chan-1");
        session.audio_capture_enabled = true;
        session.acquire_tts_token("pb-1");
        assert!(!session.audio_capture_enabled);
        session.acquire_tts_token("pb-2");
        assert_eq!(session.tts_active_count, 2);
        assert!(session.release_tts_token("pb-1"));
        assert!(!session.audio_capture_enabled);
        assert!(session.release_tts_token("pb-2"));
        assert!(session.audio_capture_enabled);
    }

    #[test]
    fn releasing_unknown_token_is_noop() {
        let mut session = CallSession::new("chan-1");
        session.acquire_tts_token("pb-1");
        assert!(!session.release_tts_token("pb-unknown"));
        assert_eq!(session.tts_active_count, 1);
    }

    #[test]
    fn terminating_is_a_one_way_door() {
        let state = ConversationState::Terminating;
        assert!(!state.can_transition_to(ConversationState::Listening));
        assert!(state.can_transition_to(ConversationState::Terminating));
    }
}
