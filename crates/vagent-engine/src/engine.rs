//! The `Engine`: one process-wide driver wiring the control plane (ARI),
//! both media-plane servers, the provider adapter and `PlaybackManager`
//! together, and running the §4.10 conversation state machine
//! (`setup → greeting → listening → thinking → speaking → terminating`)
//! one task per call.
//!
//! There is no single teacher analogue for this struct (the rvoip stack
//! splits call control across `session-core`/`dialog-core`/`media-core`
//! rather than one engine owning every collaborator); the "singletons own
//! process-wide state, one spawned task drives each call via its own event
//! queue" shape is the same discipline `vagent-rtp::RtpServer` and
//! `vagent-session::SessionStore`'s docs call out (DESIGN NOTES §9:
//! identifier lookups, not cyclic references).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

use vagent_ari::{AriClient, AriEvent, ExternalMediaFormat};
use vagent_audio::{LocalVad, VadConfig, VadEvent};
use vagent_audiosocket::{AudioSocketEvent, AudioSocketServer, AudioSocketSink};
use vagent_gating::GatingCoordinator;
use vagent_infra::{MetricsCollector, Severity};
use vagent_playback::{DownstreamMode as PlaybackDownstreamMode, PlaybackManager};
use vagent_provider::{ProviderAdapter, ProviderErrorKind, ProviderEvent};
use vagent_rtp::{RtpIngressFrame, RtpIngressSink, RtpServer};
use vagent_session::{AudioFormat, ConversationState, MediaBinding, SessionStore, TransportProfile};

use crate::config::{AppConfig, AudioTransport};
use crate::error::provider_kind_severity;
use crate::event::{EventRouter, SessionEvent};
use crate::providers::declared_capabilities;

const SSRC_QUARANTINE_WINDOW: Duration = Duration::from_secs(5);
const UUID_QUARANTINE_WINDOW: Duration = Duration::from_secs(5);

fn downstream_mode_from_config(mode: &crate::config::DownstreamMode) -> PlaybackDownstreamMode {
    match mode {
        crate::config::DownstreamMode::File => PlaybackDownstreamMode::File,
        crate::config::DownstreamMode::Stream => PlaybackDownstreamMode::Stream,
    }
}

pub struct Engine {
    config: AppConfig,
    store: Arc<SessionStore>,
    gating: Arc<GatingCoordinator>,
    ari: Arc<AriClient>,
    rtp: Arc<RtpServer>,
    audiosocket: Arc<AudioSocketServer>,
    playback: Arc<PlaybackManager>,
    provider: Arc<dyn ProviderAdapter>,
    metrics: MetricsCollector,
    router: Arc<EventRouter>,
    downstream_mode: PlaybackDownstreamMode,
    active_turns: DashMap<String, Uuid>,
    dropped_unbound_frames_total: AtomicU64,
    ssrc_quarantine: DashMap<u32, Instant>,
    uuid_quarantine: DashMap<Uuid, Instant>,
    /// One `LocalVad` per call using a provider without server-side turn
    /// detection (§6 `vad.*`); absent entirely for calls on a provider that
    /// does its own turn detection.
    local_vad: DashMap<String, parking_lot::Mutex<LocalVad>>,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AppConfig,
        store: Arc<SessionStore>,
        gating: Arc<GatingCoordinator>,
        ari: Arc<AriClient>,
        rtp: Arc<RtpServer>,
        audiosocket: Arc<AudioSocketServer>,
        playback: Arc<PlaybackManager>,
        provider: Arc<dyn ProviderAdapter>,
        metrics: MetricsCollector,
    ) -> Arc<Self> {
        let downstream_mode = downstream_mode_from_config(&config.transport.downstream_mode);
        Arc::new(Self {
            config,
            store,
            gating,
            ari,
            rtp,
            audiosocket,
            playback,
            provider,
            metrics,
            router: Arc::new(EventRouter::new()),
            downstream_mode,
            active_turns: DashMap::new(),
            dropped_unbound_frames_total: AtomicU64::new(0),
            ssrc_quarantine: DashMap::new(),
            uuid_quarantine: DashMap::new(),
            local_vad: DashMap::new(),
        })
    }

    pub fn active_call_count(&self) -> usize {
        self.store.active_call_count()
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// `GET /healthz` snapshot (§6 Observable surface).
    pub fn health_snapshot(&self) -> crate::observability::HealthSnapshot {
        crate::observability::HealthSnapshot {
            pbx_connected: self.ari.is_connected(),
            rtp_ready: self.rtp.is_ready(),
            audiosocket_ready: self.audiosocket.is_ready(),
            active_calls: self.store.active_call_count(),
            provider_ready: true,
        }
    }

    pub fn dropped_unbound_frames_total(&self) -> u64 {
        self.dropped_unbound_frames_total.load(Ordering::Relaxed)
    }

    /// Consume ARI events until the sender side is dropped (process
    /// shutdown). One dispatch loop for the whole process; call setup work
    /// is spawned off so a slow `StasisStart` handler never delays the next
    /// event (§5).
    pub async fn dispatch_ari_events(self: Arc<Self>, mut rx: mpsc::Receiver<AriEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                AriEvent::StasisStart { channel, args } => {
                    let engine = self.clone();
                    tokio::spawn(async move { engine.setup_call(channel.id, args).await });
                }
                AriEvent::StasisEnd { channel } => {
                    if let Some(caller) = self.resolve_caller_channel(&channel.id) {
                        self.router.post(&caller, SessionEvent::Ari(AriEvent::StasisEnd { channel })).await;
                    }
                }
                AriEvent::ChannelDestroyed { channel } => {
                    if let Some(caller) = self.resolve_caller_channel(&channel.id) {
                        self.router
                            .post(&caller, SessionEvent::Ari(AriEvent::ChannelDestroyed { channel }))
                            .await;
                    }
                }
                AriEvent::PlaybackFinished { playback } => {
                    if let Some(session) = self.store.get_by_playback_id(&playback.id) {
                        let caller = session.lock().caller_channel_id.clone();
                        self.router
                            .post(&caller, SessionEvent::Ari(AriEvent::PlaybackFinished { playback }))
                            .await;
                    }
                }
                AriEvent::PlaybackStarted { .. } => {}
                AriEvent::ChannelDtmfReceived { channel, digit } => {
                    if let (Some(caller), Some(d)) = (self.resolve_caller_channel(&channel.id), digit.chars().next()) {
                        self.router.post(&caller, SessionEvent::Dtmf { digit: d }).await;
                    }
                }
                AriEvent::Other => {}
            }
        }
    }

    fn resolve_caller_channel(&self, channel_id: &str) -> Option<String> {
        if let Some(session) = self.store.get_by_caller_channel(channel_id) {
            return Some(session.lock().caller_channel_id.clone());
        }
        self.store
            .get_by_media_leg_channel(channel_id)
            .map(|session| session.lock().caller_channel_id.clone())
    }

    /// §4.10 `StasisStart` → `setup`: answer, bridge both legs, originate the
    /// media leg, negotiate a transport profile, open the provider and
    /// enqueue the greeting. Any failed step tears the call down instead of
    /// leaving it half-wired.
    async fn setup_call(self: Arc<Self>, caller_channel_id: String, _args: Vec<String>) {
        if self.store.create(&caller_channel_id).is_err() {
            debug!(caller_channel_id, "duplicate StasisStart for an already-known channel, ignoring");
            return;
        }
        self.gating.register(&caller_channel_id);
        self.metrics.set_gauge("active_calls", self.store.active_call_count() as f64);

        let rx = self.router.register(&caller_channel_id);
        let engine = self.clone();
        let caller = caller_channel_id.clone();
        tokio::spawn(async move { engine.drive_session(caller, rx).await });

        if let Err(err) = self.ari.answer_channel(&caller_channel_id).await {
            warn!(caller_channel_id, error = %err, "failed to answer channel");
            self.terminate_call(&caller_channel_id).await;
            return;
        }

        let bridge_id = match self.ari.create_bridge().await {
            Ok(id) => id,
            Err(err) => {
                warn!(caller_channel_id, error = %err, "failed to create bridge");
                self.terminate_call(&caller_channel_id).await;
                return;
            }
        };
        self.store.update(&caller_channel_id, |s| s.bridge_id = Some(bridge_id.clone()));
        if let Err(err) = self.ari.add_channel_to_bridge(&bridge_id, &caller_channel_id).await {
            warn!(caller_channel_id, error = %err, "failed to add caller channel to bridge");
            self.terminate_call(&caller_channel_id).await;
            return;
        }

        let format = self.external_media_format();
        let media_leg = match self.ari.originate_external_media(&self.external_host(), &format).await {
            Ok(id) => id,
            Err(err) => {
                warn!(caller_channel_id, error = %err, "failed to originate external media channel");
                self.terminate_call(&caller_channel_id).await;
                return;
            }
        };
        self.store.set_media_leg_channel(&caller_channel_id, &media_leg);
        self.store.update(&caller_channel_id, |s| s.media_leg_channel_id = Some(media_leg.clone()));
        if let Err(err) = self.ari.add_channel_to_bridge(&bridge_id, &media_leg).await {
            warn!(caller_channel_id, error = %err, "failed to add media leg to bridge");
            self.terminate_call(&caller_channel_id).await;
            return;
        }

        let profile = match self.negotiate_profile() {
            Some(profile) => profile,
            None => {
                // §8 S6: no match between PBX dial parameters and provider
                // capabilities — terminate straight from `setup`, skipping
                // `greeting` entirely.
                warn!(caller_channel_id, "no negotiated transport profile, terminating without greeting");
                self.terminate_call(&caller_channel_id).await;
                return;
            }
        };
        self.store.update(&caller_channel_id, |s| s.transport_profile = profile);

        let Some(call_id) = self.store.get_by_caller_channel(&caller_channel_id).map(|s| s.lock().call_id) else {
            return;
        };
        let opened = match self.provider.open(profile, call_id).await {
            Ok(opened) => opened,
            Err(err) => {
                warn!(caller_channel_id, error = %err, "provider failed to open session");
                self.terminate_call(&caller_channel_id).await;
                return;
            }
        };
        let router = self.router.clone();
        let caller_for_pump = caller_channel_id.clone();
        tokio::spawn(Self::pump_provider_events(router, caller_for_pump, opened.events));

        if !self.provider.capabilities().server_side_turn_detection {
            let vad_config =
                VadConfig { aggressiveness: self.config.vad.aggressiveness, start_frames: self.config.vad.start_frames, end_frames: self.config.vad.end_frames };
            self.local_vad.insert(caller_channel_id.clone(), parking_lot::Mutex::new(LocalVad::new(vad_config)));
        }

        self.store.update(&caller_channel_id, |s| s.transition(ConversationState::Greeting));
        let greeting = self.config.playback.greeting_text.clone();
        let _ = self.provider.feed_text(call_id, &greeting).await;
        if !self.provider.capabilities().server_side_turn_detection {
            let _ = self.provider.request_response(call_id).await;
        }
    }

    async fn pump_provider_events(
        router: Arc<EventRouter>,
        caller_channel_id: String,
        mut events: mpsc::Receiver<ProviderEvent>,
    ) {
        while let Some(event) = events.recv().await {
            if !router.post(&caller_channel_id, SessionEvent::Provider(event)).await {
                break;
            }
        }
    }

    fn negotiate_profile(&self) -> Option<TransportProfile> {
        let caps = declared_capabilities();
        let desired_rate = self.active_provider_sample_rate();
        caps.negotiate(desired_rate, AudioFormat::Pcm16)
    }

    fn active_provider_sample_rate(&self) -> u32 {
        let name: &str = if self.config.active_pipeline.is_some() { "pipeline" } else { &self.config.default_provider };
        self.config.providers.get(name).and_then(|p| p.sample_rate).unwrap_or(16_000)
    }

    fn external_media_format(&self) -> ExternalMediaFormat {
        match self.config.transport.audio_transport {
            AudioTransport::Rtp => ExternalMediaFormat {
                encapsulation: "rtp".to_string(),
                codec: "ulaw".to_string(),
                connection_type: "udp".to_string(),
                direction: "both".to_string(),
            },
            AudioTransport::Audiosocket => ExternalMediaFormat {
                encapsulation: "audiosocket".to_string(),
                codec: "slin16".to_string(),
                connection_type: "tcp".to_string(),
                direction: "both".to_string(),
            },
        }
    }

    fn external_host(&self) -> String {
        match self.config.transport.audio_transport {
            AudioTransport::Rtp => {
                format!("{}:{}", self.config.transport.rtp_bind_host, self.config.transport.rtp_port_range_start)
            }
            AudioTransport::Audiosocket => self.config.transport.audiosocket_bind_addr.clone(),
        }
    }

    /// One task per call: drains `SessionEvent`s, enforces `setupTimeoutMs`
    /// before the call leaves `setup`/`greeting`, and `deadCallTimeoutMs`
    /// since the last event of any kind (§4.10, §6).
    async fn drive_session(self: Arc<Self>, caller_channel_id: String, mut rx: mpsc::Receiver<SessionEvent>) {
        let setup_timeout = Duration::from_millis(self.config.timeouts.setup_timeout_ms);
        let dead_call_timeout = Duration::from_millis(self.config.timeouts.dead_call_timeout_ms);
        let setup_deadline = sleep(setup_timeout);
        tokio::pin!(setup_deadline);
        let dead_call_deadline = sleep(dead_call_timeout);
        tokio::pin!(dead_call_deadline);

        loop {
            let operational = self
                .store
                .update(&caller_channel_id, |s| {
                    !matches!(s.conversation_state, ConversationState::Setup | ConversationState::Greeting)
                })
                .unwrap_or(true);

            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    dead_call_deadline.as_mut().reset(tokio::time::Instant::now() + dead_call_timeout);
                    self.handle_session_event(&caller_channel_id, event).await;
                    if self.store.get_by_caller_channel(&caller_channel_id).is_none() {
                        break;
                    }
                }
                _ = &mut setup_deadline, if !operational => {
                    warn!(caller_channel_id, "setup timed out before reaching listening state");
                    self.terminate_call(&caller_channel_id).await;
                    break;
                }
                _ = &mut dead_call_deadline => {
                    warn!(caller_channel_id, "no activity within dead call timeout");
                    self.terminate_call(&caller_channel_id).await;
                    break;
                }
            }
        }
        self.router.remove(&caller_channel_id);
    }

    async fn handle_session_event(&self, caller_channel_id: &str, event: SessionEvent) {
        match event {
            SessionEvent::Ari(ari_event) => self.handle_ari_event(caller_channel_id, ari_event).await,
            SessionEvent::MediaFrame { pcm16, sample_rate: _, likely_silence: _ } => {
                let Some(call_id) = self.store.get_by_caller_channel(caller_channel_id).map(|s| s.lock().call_id)
                else {
                    return;
                };
                self.store.update(caller_channel_id, |s| s.last_inbound_audio_at = Instant::now());
                self.run_local_vad(caller_channel_id, call_id, &pcm16).await;
                if let Err(err) = self.provider.feed_audio(call_id, &pcm16).await {
                    self.handle_provider_error(caller_channel_id, err.kind).await;
                }
            }
            SessionEvent::Dtmf { digit } => {
                let Some(call_id) = self.store.get_by_caller_channel(caller_channel_id).map(|s| s.lock().call_id)
                else {
                    return;
                };
                let _ = self.provider.feed_text(call_id, &digit.to_string()).await;
            }
            SessionEvent::Provider(event) => self.handle_provider_event(caller_channel_id, event).await,
            SessionEvent::LocalSpeechStart => self.on_local_speech_start(caller_channel_id).await,
        }
    }

    /// §6 `vad.*`: advances this call's `LocalVad` (absent entirely for
    /// providers with `serverSideTurnDetection`) and turns its edges into
    /// the same barge-in path as `SessionEvent::LocalSpeechStart`, or into
    /// `ProviderAdapter::request_response` on a detected end of utterance
    /// (the only mechanism a server-side-turn-detection-less provider has
    /// to learn that the caller stopped talking).
    async fn run_local_vad(&self, caller_channel_id: &str, call_id: Uuid, pcm16: &[i16]) {
        // Resolve and release the DashMap shard guard before awaiting below
        // — holding it across an await could deadlock against a concurrent
        // `terminate_call` removing this same entry.
        let event = match self.local_vad.get(caller_channel_id) {
            Some(vad) => vad.lock().process(pcm16),
            None => return,
        };
        match event {
            Some(VadEvent::SpeechStart) => self.on_local_speech_start(caller_channel_id).await,
            Some(VadEvent::SpeechEnd) => {
                if let Err(err) = self.provider.request_response(call_id).await {
                    self.handle_provider_error(caller_channel_id, err.kind).await;
                }
            }
            None => {}
        }
    }

    async fn on_local_speech_start(&self, caller_channel_id: &str) {
        if self.gating.tts_playing(caller_channel_id) {
            self.gating.force_barge_in(caller_channel_id);
            self.store.update(caller_channel_id, |s| {
                s.force_barge_in();
                s.transition(ConversationState::Listening);
            });
        }
    }

    async fn handle_ari_event(&self, caller_channel_id: &str, event: AriEvent) {
        match event {
            AriEvent::StasisEnd { .. } | AriEvent::ChannelDestroyed { .. } => {
                self.terminate_call(caller_channel_id).await;
            }
            AriEvent::PlaybackFinished { playback } => {
                let was_known = self.playback.on_playback_finished(&playback.id).await;
                if was_known {
                    self.maybe_advance_after_playback(caller_channel_id).await;
                }
            }
            _ => {}
        }
    }

    /// After a real `PlaybackFinished` (file mode) fully reopens the gate,
    /// move a call out of `greeting` or `speaking` into `listening` (§4.10).
    async fn maybe_advance_after_playback(&self, caller_channel_id: &str) {
        if self.gating.tts_playing(caller_channel_id) {
            return;
        }
        self.store.update(caller_channel_id, |s| {
            if matches!(s.conversation_state, ConversationState::Greeting | ConversationState::Speaking) {
                s.transition(ConversationState::Listening);
            }
        });
    }

    async fn handle_provider_event(&self, caller_channel_id: &str, event: ProviderEvent) {
        match event {
            ProviderEvent::ResponseStart => {
                self.store.update(caller_channel_id, |s| s.transition(ConversationState::Speaking));
                let turn = self.playback.on_response_start(caller_channel_id, self.downstream_mode);
                self.active_turns.insert(caller_channel_id.to_string(), turn);
            }
            ProviderEvent::AudioOut(bytes) => {
                let turn = match self.active_turns.get(caller_channel_id).map(|e| *e.value()) {
                    Some(turn) => turn,
                    None => {
                        // Implicit ResponseStart (§8): a provider may emit
                        // AudioOut before ResponseStart.
                        self.store.update(caller_channel_id, |s| s.transition(ConversationState::Speaking));
                        let turn = self.playback.on_response_start(caller_channel_id, self.downstream_mode);
                        self.active_turns.insert(caller_channel_id.to_string(), turn);
                        turn
                    }
                };
                if let Err(err) =
                    self.playback.on_audio_out(caller_channel_id, turn, self.downstream_mode, &bytes).await
                {
                    warn!(caller_channel_id, error = %err, "failed to deliver synthesized audio");
                }
            }
            ProviderEvent::ResponseEnd => {
                if let Some((_, turn)) = self.active_turns.remove(caller_channel_id) {
                    if let Err(err) =
                        self.playback.on_response_end(caller_channel_id, turn, self.downstream_mode).await
                    {
                        warn!(caller_channel_id, error = %err, "failed to finalize turn playback");
                    }
                    // Stream mode has no further `PlaybackFinished`; its gate
                    // release is synthesized inside `on_response_end`. File
                    // mode waits for the real ARI event.
                    if self.downstream_mode == PlaybackDownstreamMode::Stream {
                        self.maybe_advance_after_playback(caller_channel_id).await;
                    }
                }
            }
            ProviderEvent::Error(kind) => self.handle_provider_error(caller_channel_id, kind).await,
            ProviderEvent::SpeechStart => {
                if self.gating.tts_playing(caller_channel_id) {
                    self.gating.force_barge_in(caller_channel_id);
                    self.store.update(caller_channel_id, |s| s.force_barge_in());
                }
            }
            ProviderEvent::FinalTranscript(_) => {
                // §4.10 `[listening] --FinalTranscript--> [thinking]`. A
                // transcript arriving while already `speaking`/`thinking`
                // (pipeline mode queued a second turn, §4.7 P3) does not
                // regress the state machine.
                self.store.update(caller_channel_id, |s| {
                    if s.conversation_state == ConversationState::Listening {
                        s.transition(ConversationState::Thinking);
                    }
                });
            }
            ProviderEvent::SpeechEnd | ProviderEvent::PartialTranscript(_) | ProviderEvent::CapabilityAck(_) => {}
        }
    }

    /// §7 Kind→Severity policy: fatal kinds end the call, transient kinds
    /// are logged and left to the adapter's own retry behavior, protocol
    /// kinds are counted and otherwise ignored unless they recur.
    async fn handle_provider_error(&self, caller_channel_id: &str, kind: ProviderErrorKind) {
        self.metrics.incr("provider_errors_total", 1);
        match provider_kind_severity(kind) {
            Severity::Fatal => {
                warn!(caller_channel_id, ?kind, "fatal provider error, terminating call");
                self.terminate_call(caller_channel_id).await;
            }
            Severity::Transient => {
                warn!(caller_channel_id, ?kind, "transient provider error");
            }
            Severity::Protocol => {
                debug!(caller_channel_id, ?kind, "protocol-level provider event");
            }
        }
    }

    /// §5 teardown order: stop driving the provider, stop any in-flight file
    /// playback, tear down both PBX legs, then drop the session. Idempotent:
    /// a second call (e.g. `StasisEnd` arriving after a timeout-triggered
    /// teardown) finds no session and returns immediately (L3).
    async fn terminate_call(&self, caller_channel_id: &str) {
        let Some(handle) = self.store.get_by_caller_channel(caller_channel_id) else {
            return;
        };
        let (call_id, bridge_id, media_leg) = {
            let session = handle.lock();
            (session.call_id, session.bridge_id.clone(), session.media_leg_channel_id.clone())
        };
        self.store.update(caller_channel_id, |s| {
            s.transition(ConversationState::Terminating);
        });

        self.provider.close(call_id).await;

        for record in self.store.playbacks_for(caller_channel_id) {
            let _ = self.ari.stop_playback(&record.playback_id).await;
        }

        if let Some(media_leg) = &media_leg {
            let _ = self.ari.hangup_channel(media_leg).await;
        }
        let _ = self.ari.hangup_channel(caller_channel_id).await;
        if let Some(bridge_id) = &bridge_id {
            let _ = self.ari.delete_bridge(bridge_id).await;
        }

        self.gating.remove(caller_channel_id);
        self.active_turns.remove(caller_channel_id);
        self.local_vad.remove(caller_channel_id);
        if self.store.delete(caller_channel_id).is_some() {
            self.metrics.set_gauge("active_calls", self.store.active_call_count() as f64);
        }
        self.router.remove(caller_channel_id);
    }

    fn try_resolve_ssrc(&self, ssrc: u32) -> Option<Arc<parking_lot::Mutex<vagent_session::CallSession>>> {
        if let Some(handle) = self.store.get_by_ssrc(ssrc) {
            return Some(handle);
        }
        let now = Instant::now();
        if let Some(quarantined_at) = self.ssrc_quarantine.get(&ssrc) {
            if now.duration_since(*quarantined_at) < SSRC_QUARANTINE_WINDOW {
                return None;
            }
        }
        if let Some(handle) = self.store.find_unbound_session() {
            let caller = handle.lock().caller_channel_id.clone();
            if self.store.bind(&caller, MediaBinding::Rtp { ssrc }).is_ok() {
                self.ssrc_quarantine.remove(&ssrc);
                return Some(handle);
            }
        }
        self.ssrc_quarantine.insert(ssrc, now);
        self.dropped_unbound_frames_total.fetch_add(1, Ordering::Relaxed);
        None
    }

    fn try_resolve_uuid(&self, uuid: Uuid) -> Option<Arc<parking_lot::Mutex<vagent_session::CallSession>>> {
        if let Some(handle) = self.store.get_by_uuid(&uuid) {
            return Some(handle);
        }
        let now = Instant::now();
        if let Some(quarantined_at) = self.uuid_quarantine.get(&uuid) {
            if now.duration_since(*quarantined_at) < UUID_QUARANTINE_WINDOW {
                return None;
            }
        }
        if let Some(handle) = self.store.find_unbound_session() {
            let caller = handle.lock().caller_channel_id.clone();
            if self.store.bind(&caller, MediaBinding::AudioSocket { uuid }).is_ok() {
                self.uuid_quarantine.remove(&uuid);
                return Some(handle);
            }
        }
        self.uuid_quarantine.insert(uuid, now);
        self.dropped_unbound_frames_total.fetch_add(1, Ordering::Relaxed);
        None
    }
}

#[async_trait::async_trait]
impl RtpIngressSink for Engine {
    async fn on_frame(&self, frame: RtpIngressFrame) {
        let Some(handle) = self.try_resolve_ssrc(frame.ssrc) else { return };
        let caller_channel_id = handle.lock().caller_channel_id.clone();
        self.store.update(&caller_channel_id, |s| s.last_inbound_audio_at = Instant::now());
        if !self.gating.audio_capture_enabled(&caller_channel_id) {
            return;
        }
        self.router
            .post(
                &caller_channel_id,
                SessionEvent::MediaFrame {
                    pcm16: frame.pcm16_16k,
                    sample_rate: 16_000,
                    likely_silence: frame.likely_silence,
                },
            )
            .await;
    }
}

#[async_trait::async_trait]
impl AudioSocketSink for Engine {
    async fn on_event(&self, event: AudioSocketEvent) {
        match event {
            AudioSocketEvent::Handshake { uuid } => {
                let _ = self.try_resolve_uuid(uuid);
            }
            AudioSocketEvent::Audio { uuid, pcm16, sample_rate } => {
                let Some(handle) = self.try_resolve_uuid(uuid) else { return };
                let caller_channel_id = handle.lock().caller_channel_id.clone();
                self.store.update(&caller_channel_id, |s| s.last_inbound_audio_at = Instant::now());
                if !self.gating.audio_capture_enabled(&caller_channel_id) {
                    return;
                }
                self.router
                    .post(
                        &caller_channel_id,
                        SessionEvent::MediaFrame { pcm16, sample_rate, likely_silence: false },
                    )
                    .await;
            }
            AudioSocketEvent::Dtmf { uuid, digit } => {
                if let Some(handle) = self.store.get_by_uuid(&uuid) {
                    let caller_channel_id = handle.lock().caller_channel_id.clone();
                    self.router.post(&caller_channel_id, SessionEvent::Dtmf { digit }).await;
                }
            }
            AudioSocketEvent::Disconnected { uuid } => {
                debug!(%uuid, "audiosocket connection closed");
            }
            AudioSocketEvent::ProtocolViolation { uuid, detail } => {
                self.metrics.incr("audiosocket_protocol_violations_total", 1);
                warn!(?uuid, detail, "audiosocket protocol violation");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vagent_ari::AriConfig;
    use vagent_playback::PlaybackManagerConfig;
    use vagent_provider::EchoProvider;
    use vagent_rtp::RtpServerConfig;

    /// An `Engine` fixture wired with fakes/no-op singletons: the ARI client
    /// points at an address nothing listens on (its HTTP/WS calls are never
    /// exercised by these tests, only the pure session/binding logic is).
    fn test_engine() -> Arc<Engine> {
        let mut config = AppConfig::default();
        config.default_provider = "echo".to_string();
        let store = SessionStore::new();
        let gating = Arc::new(GatingCoordinator::new());
        let ari = Arc::new(AriClient::new(AriConfig {
            base_url: "http://127.0.0.1:0".to_string(),
            ws_url: "ws://127.0.0.1:0".to_string(),
            username: "u".to_string(),
            password: "p".to_string(),
            app: "vagent".to_string(),
        }));
        let rtp = RtpServer::new(RtpServerConfig::default());
        let audiosocket = AudioSocketServer::new(vagent_audiosocket::AudioSocketConfig::default());
        let playback = PlaybackManager::new(
            store.clone(),
            gating.clone(),
            ari.clone(),
            audiosocket.clone(),
            PlaybackManagerConfig::default(),
        );
        let provider = EchoProvider::new();
        Engine::new(config, store, gating, ari, rtp, audiosocket, playback, provider, MetricsCollector::new())
    }

    fn with_unbound_media_leg(engine: &Engine, caller: &str) {
        engine.store.create(caller).unwrap();
        engine.gating.register(caller);
        engine.store.set_media_leg_channel(caller, format!("{caller}-media"));
        engine.store.update(caller, |s| s.media_leg_channel_id = Some(format!("{caller}-media")));
    }

    // §8 S5 (cross-call isolation): two concurrent calls each with distinct
    // SSRCs resolve to their own session and never cross-bind.
    #[test]
    fn first_media_frame_binding_picks_oldest_unbound_session_and_is_exclusive() {
        let engine = test_engine();
        with_unbound_media_leg(&engine, "c1");
        std::thread::sleep(Duration::from_millis(5));
        with_unbound_media_leg(&engine, "c2");

        let first = engine.try_resolve_ssrc(111).expect("first ssrc resolves to oldest unbound session");
        assert_eq!(first.lock().caller_channel_id, "c1");

        let second = engine.try_resolve_ssrc(222).expect("second ssrc resolves to the remaining session");
        assert_eq!(second.lock().caller_channel_id, "c2");

        // Re-delivering the first SSRC must resolve to the same session, not
        // re-run the unbound search (P5: a binding resolves to at most one session).
        let again = engine.try_resolve_ssrc(111).unwrap();
        assert_eq!(again.lock().caller_channel_id, "c1");
    }

    // Boundary behavior (§8): an unbound SSRC with no matching session is
    // quarantined, not discarded immediately, and the drop counter increments.
    #[test]
    fn unbound_ssrc_with_no_waiting_session_is_quarantined_and_counted() {
        let engine = test_engine();
        assert!(engine.try_resolve_ssrc(999).is_none());
        assert_eq!(engine.dropped_unbound_frames_total(), 1);

        // A second frame for the same SSRC within the quarantine window is
        // dropped again without incrementing a second time via the unbound
        // search path (it short-circuits on the quarantine entry).
        assert!(engine.try_resolve_ssrc(999).is_none());
        assert_eq!(engine.dropped_unbound_frames_total(), 1);
    }

    #[test]
    fn unbound_uuid_resolves_the_same_way_as_ssrc() {
        let engine = test_engine();
        with_unbound_media_leg(&engine, "c1");
        let uuid = Uuid::new_v4();
        let resolved = engine.try_resolve_uuid(uuid).expect("resolves to the only unbound session");
        assert_eq!(resolved.lock().caller_channel_id, "c1");
        assert!(matches!(
            engine.store.get_by_caller_channel("c1").unwrap().lock().media_binding,
            Some(MediaBinding::AudioSocket { uuid: bound }) if bound == uuid
        ));
    }

    // §8 S6 (capability mismatch): the configured provider only advertises
    // 8k/16k/24k, so a desired rate outside that set negotiates to `None`
    // and `setup_call` terminates before `greeting`.
    #[test]
    fn negotiate_profile_rejects_unsupported_sample_rate() {
        let mut config = AppConfig::default();
        config.default_provider = "echo".to_string();
        config.providers.insert(
            "echo".to_string(),
            crate::config::ProviderConfig { kind: "echo".to_string(), credentials: Default::default(), sample_rate: Some(48_000) },
        );
        let store = SessionStore::new();
        let gating = Arc::new(GatingCoordinator::new());
        let ari = Arc::new(AriClient::new(AriConfig {
            base_url: "http://127.0.0.1:0".to_string(),
            ws_url: "ws://127.0.0.1:0".to_string(),
            username: "u".to_string(),
            password: "p".to_string(),
            app: "vagent".to_string(),
        }));
        let rtp = RtpServer::new(RtpServerConfig::default());
        let audiosocket = AudioSocketServer::new(vagent_audiosocket::AudioSocketConfig::default());
        let playback = PlaybackManager::new(
            store.clone(),
            gating.clone(),
            ari.clone(),
            audiosocket.clone(),
            PlaybackManagerConfig::default(),
        );
        let engine = Engine::new(
            config,
            store,
            gating,
            ari,
            rtp,
            audiosocket,
            playback,
            EchoProvider::new(),
            MetricsCollector::new(),
        );
        assert!(engine.negotiate_profile().is_none());
    }

    #[test]
    fn negotiate_profile_accepts_supported_sample_rate() {
        let engine = test_engine();
        assert!(engine.negotiate_profile().is_some());
    }

    /// A no-op adapter without server-side turn detection, recording
    /// `request_response` calls so `run_local_vad`'s wiring can be asserted
    /// without a real STT/LLM/TTS backend.
    struct NoServerVadProvider {
        request_response_calls: std::sync::atomic::AtomicU32,
    }

    #[async_trait::async_trait]
    impl ProviderAdapter for NoServerVadProvider {
        fn capabilities(&self) -> vagent_provider::AdapterCapabilities {
            vagent_provider::AdapterCapabilities {
                server_side_turn_detection: false,
                can_negotiate: false,
                is_monolithic: false,
                preferred_chunk_ms: 20,
            }
        }

        async fn open(
            &self,
            _profile: TransportProfile,
            call_id: Uuid,
        ) -> Result<vagent_provider::OpenedSession, vagent_provider::ProviderError> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(vagent_provider::OpenedSession { session_id: call_id, events: rx })
        }

        async fn close(&self, _session_id: Uuid) {}

        async fn feed_audio(&self, _session_id: Uuid, _pcm16: &[i16]) -> Result<(), vagent_provider::ProviderError> {
            Ok(())
        }

        async fn request_response(&self, _session_id: Uuid) -> Result<(), vagent_provider::ProviderError> {
            self.request_response_calls.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    // §6 vad.*: a provider without server-side turn detection gets a
    // per-call LocalVad; a confident end-of-speech edge calls
    // ProviderAdapter::request_response exactly once per utterance.
    #[tokio::test]
    async fn local_vad_requests_a_response_on_speech_end_for_non_server_vad_providers() {
        let mut config = AppConfig::default();
        config.default_provider = "fake".to_string();
        config.vad.start_frames = 1;
        config.vad.end_frames = 1;
        let store = SessionStore::new();
        let gating = Arc::new(GatingCoordinator::new());
        let ari = Arc::new(AriClient::new(AriConfig {
            base_url: "http://127.0.0.1:0".to_string(),
            ws_url: "ws://127.0.0.1:0".to_string(),
            username: "u".to_string(),
            password: "p".to_string(),
            app: "vagent".to_string(),
        }));
        let rtp = RtpServer::new(RtpServerConfig::default());
        let audiosocket = AudioSocketServer::new(vagent_audiosocket::AudioSocketConfig::default());
        let playback = PlaybackManager::new(
            store.clone(),
            gating.clone(),
            ari.clone(),
            audiosocket.clone(),
            PlaybackManagerConfig::default(),
        );
        let provider = Arc::new(NoServerVadProvider { request_response_calls: std::sync::atomic::AtomicU32::new(0) });
        let engine =
            Engine::new(config, store, gating, ari, rtp, audiosocket, playback, provider.clone(), MetricsCollector::new());

        engine.store.create("c1").unwrap();
        engine.gating.register("c1");
        let call_id = engine.store.get_by_caller_channel("c1").unwrap().lock().call_id;
        engine.local_vad.insert("c1".to_string(), parking_lot::Mutex::new(LocalVad::new(VadConfig { aggressiveness: 0, start_frames: 1, end_frames: 1 })));

        let loud = vec![4000i16; 160];
        let quiet = vec![0i16; 160];
        engine.run_local_vad("c1", call_id, &loud).await;
        assert_eq!(provider.request_response_calls.load(Ordering::Relaxed), 0);
        engine.run_local_vad("c1", call_id, &quiet).await;
        assert_eq!(provider.request_response_calls.load(Ordering::Relaxed), 1);

        // A second full speech/silence cycle requests a response again.
        engine.run_local_vad("c1", call_id, &loud).await;
        engine.run_local_vad("c1", call_id, &quiet).await;
        assert_eq!(provider.request_response_calls.load(Ordering::Relaxed), 2);
    }

    // A call whose provider has server-side turn detection never gets a
    // LocalVad entry, so media frames never trigger request_response.
    #[tokio::test]
    async fn no_local_vad_entry_for_server_side_turn_detection_providers() {
        let engine = test_engine();
        engine.store.create("c1").unwrap();
        engine.gating.register("c1");
        let call_id = engine.store.get_by_caller_channel("c1").unwrap().lock().call_id;
        assert!(!engine.local_vad.contains_key("c1"));
        // run_local_vad is a no-op without an entry; this must not panic.
        engine.run_local_vad("c1", call_id, &[4000i16; 160]).await;
    }
}

/// Starts the RTP and AudioSocket ingress loops against this `Engine` as
/// their sink, returning the join handles so `main` can await them
/// alongside the ARI websocket loop.
pub fn spawn_media_servers(engine: Arc<Engine>) -> (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>) {
    let rtp = engine.rtp.clone();
    let rtp_sink: Arc<dyn RtpIngressSink> = engine.clone();
    let rtp_handle = tokio::spawn(async move {
        if let Err(err) = rtp.run(rtp_sink).await {
            warn!(error = %err, "rtp server exited");
        }
    });

    let audiosocket = engine.audiosocket.clone();
    let audiosocket_sink: Arc<dyn AudioSocketSink> = engine.clone();
    let audiosocket_handle = tokio::spawn(async move {
        if let Err(err) = audiosocket.run(audiosocket_sink).await {
            warn!(error = %err, "audiosocket server exited");
        }
    });

    (rtp_handle, audiosocket_handle)
}
