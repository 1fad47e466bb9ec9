//! `PipelineOrchestrator` (§4.7): composes separate STT/LLM/TTS
//! `ProviderAdapter`s into a synthetic monolithic adapter, enforcing
//! at-most-one-in-flight-response (P3) and best-effort barge-in
//! cancellation.
//!
//! There is no teacher analogue for turn-taking orchestration (the rvoip
//! stack has no LLM surface); the event-pump shape — one task per session
//! selecting over several channels and updating local state, never shared
//! `Mutex` state across tasks — follows the same single-writer-per-session
//! discipline `vagent-session::SessionStore` documents for `CallSession`.

use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use vagent_provider::{
    AdapterCapabilities, OpenedSession, ProviderAdapter, ProviderError, ProviderErrorKind, ProviderEvent,
};
use vagent_session::TransportProfile;

/// Split a running sentence buffer on `.`/`!`/`?`, returning any complete
/// sentences and leaving the remainder in `buf` for the next token.
fn split_sentences(buf: &mut String, incoming: &str) -> Vec<String> {
    buf.push_str(incoming);
    let mut sentences = Vec::new();
    loop {
        let Some(idx) = buf.find(['.', '!', '?']) else { break };
        let sentence: String = buf.drain(..=idx).collect();
        let trimmed = sentence.trim();
        if !trimmed.is_empty() {
            sentences.push(trimmed.to_string());
        }
    }
    sentences
}

struct PipelineSession {
    stt: OpenedSession,
    llm: OpenedSession,
    tts: OpenedSession,
    llm_adapter: Arc<dyn ProviderAdapter>,
    tts_adapter: Arc<dyn ProviderAdapter>,
    profile: TransportProfile,
    call_id: Uuid,
    out_tx: mpsc::Sender<ProviderEvent>,
}

/// Composes an STT, LLM and TTS `ProviderAdapter` into one session driver.
pub struct PipelineOrchestrator {
    stt: Arc<dyn ProviderAdapter>,
    llm: Arc<dyn ProviderAdapter>,
    tts: Arc<dyn ProviderAdapter>,
}

impl PipelineOrchestrator {
    pub fn new(stt: Arc<dyn ProviderAdapter>, llm: Arc<dyn ProviderAdapter>, tts: Arc<dyn ProviderAdapter>) -> Arc<Self> {
        Arc::new(Self { stt, llm, tts })
    }

    async fn drive(mut session: PipelineSession) {
        let mut response_in_flight = false;
        let mut turn_started = false;
        let mut llm_done = true;
        let mut pending_tts_sentences: u32 = 0;
        let mut sentence_buf = String::new();
        let mut queued_transcript: Option<String> = None;

        loop {
            tokio::select! {
                stt_event = session.stt.events.recv() => {
                    let Some(event) = stt_event else { break };
                    match event {
                        ProviderEvent::PartialTranscript(t) => {
                            let _ = session.out_tx.send(ProviderEvent::PartialTranscript(t)).await;
                        }
                        ProviderEvent::FinalTranscript(text) => {
                            if response_in_flight {
                                // "at most one queued transcript is kept; newer replaces older" (§4.7).
                                queued_transcript = Some(text);
                            } else {
                                response_in_flight = true;
                                turn_started = false;
                                llm_done = false;
                                pending_tts_sentences = 0;
                                sentence_buf.clear();
                                let _ = session.llm.feed_text(session.llm.session_id, &text).await;
                            }
                        }
                        ProviderEvent::SpeechStart => {
                            let _ = session.out_tx.send(ProviderEvent::SpeechStart).await;
                            if response_in_flight {
                                // Best-effort cancellation of the in-flight LLM/TTS
                                // turn: close and immediately reopen both
                                // sub-sessions, the same way a streaming LLM/TTS
                                // backend is cancelled by dropping its socket.
                                // Closing the receivers without reopening them
                                // would wedge every subsequent turn in the call
                                // shut, since `PipelineSession` holds one
                                // long-lived sub-session per adapter, not one
                                // per turn.
                                session.llm_adapter.close(session.llm.session_id).await;
                                session.tts_adapter.close(session.tts.session_id).await;
                                match (
                                    session.llm_adapter.open(session.profile, session.call_id).await,
                                    session.tts_adapter.open(session.profile, session.call_id).await,
                                ) {
                                    (Ok(llm), Ok(tts)) => {
                                        session.llm = llm;
                                        session.tts = tts;
                                    }
                                    _ => {
                                        let _ = session
                                            .out_tx
                                            .send(ProviderEvent::Error(ProviderErrorKind::TransientNetwork))
                                            .await;
                                    }
                                }
                                response_in_flight = false;
                                turn_started = false;
                                pending_tts_sentences = 0;
                                sentence_buf.clear();
                                let _ = session.out_tx.send(ProviderEvent::Error(ProviderErrorKind::Cancelled)).await;
                                let _ = session.out_tx.send(ProviderEvent::ResponseEnd).await;
                            }
                        }
                        ProviderEvent::SpeechEnd => {
                            let _ = session.out_tx.send(ProviderEvent::SpeechEnd).await;
                        }
                        ProviderEvent::Error(kind) => {
                            let _ = session.out_tx.send(ProviderEvent::Error(kind)).await;
                        }
                        _ => {}
                    }
                }
                llm_event = session.llm.events.recv(), if response_in_flight => {
                    let Some(event) = llm_event else { continue };
                    match event {
                        ProviderEvent::PartialTranscript(token) => {
                            for sentence in split_sentences(&mut sentence_buf, &token) {
                                pending_tts_sentences += 1;
                                let _ = session.tts.feed_text(session.tts.session_id, &sentence).await;
                            }
                        }
                        ProviderEvent::FinalTranscript(rest) => {
                            let mut tail = String::new();
                            for sentence in split_sentences(&mut tail, &rest) {
                                pending_tts_sentences += 1;
                                let _ = session.tts.feed_text(session.tts.session_id, &sentence).await;
                            }
                            let remainder = sentence_buf.trim().to_string();
                            if !remainder.is_empty() {
                                pending_tts_sentences += 1;
                                let _ = session.tts.feed_text(session.tts.session_id, &remainder).await;
                            }
                            sentence_buf.clear();
                            llm_done = true;
                            if pending_tts_sentences == 0 {
                                response_in_flight = false;
                                if turn_started {
                                    let _ = session.out_tx.send(ProviderEvent::ResponseEnd).await;
                                }
                                if let Some(next) = queued_transcript.take() {
                                    response_in_flight = true;
                                    turn_started = false;
                                    llm_done = false;
                                    let _ = session.llm.feed_text(session.llm.session_id, &next).await;
                                }
                            }
                        }
                        ProviderEvent::Error(kind) => {
                            let _ = session.out_tx.send(ProviderEvent::Error(kind)).await;
                        }
                        _ => {}
                    }
                }
                tts_event = session.tts.events.recv(), if pending_tts_sentences > 0 || turn_started => {
                    let Some(event) = tts_event else { continue };
                    match event {
                        ProviderEvent::ResponseStart => {
                            if !turn_started {
                                turn_started = true;
                                let _ = session.out_tx.send(ProviderEvent::ResponseStart).await;
                            }
                        }
                        ProviderEvent::AudioOut(bytes) => {
                            if !turn_started {
                                // "Provider emits AudioOut before ResponseStart — treat as implicit start" (§8).
                                turn_started = true;
                                let _ = session.out_tx.send(ProviderEvent::ResponseStart).await;
                            }
                            let _ = session.out_tx.send(ProviderEvent::AudioOut(bytes)).await;
                        }
                        ProviderEvent::ResponseEnd => {
                            pending_tts_sentences = pending_tts_sentences.saturating_sub(1);
                            if pending_tts_sentences == 0 && llm_done {
                                response_in_flight = false;
                                let _ = session.out_tx.send(ProviderEvent::ResponseEnd).await;
                                turn_started = false;
                                if let Some(next) = queued_transcript.take() {
                                    response_in_flight = true;
                                    llm_done = false;
                                    let _ = session.llm.feed_text(session.llm.session_id, &next).await;
                                }
                            }
                        }
                        ProviderEvent::Error(kind) => {
                            let _ = session.out_tx.send(ProviderEvent::Error(kind)).await;
                        }
                        _ => {}
                    }
                }
                else => break,
            }
        }
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for PipelineOrchestrator {
    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            server_side_turn_detection: false,
            can_negotiate: false,
            is_monolithic: true,
            preferred_chunk_ms: 20,
        }
    }

    async fn open(&self, profile: TransportProfile, call_id: Uuid) -> Result<OpenedSession, ProviderError> {
        let stt = self.stt.open(profile, call_id).await?;
        let llm = self.llm.open(profile, call_id).await?;
        let tts = self.tts.open(profile, call_id).await?;
        let (out_tx, out_rx) = mpsc::channel(128);
        let session = PipelineSession {
            stt,
            llm,
            tts,
            llm_adapter: self.llm.clone(),
            tts_adapter: self.tts.clone(),
            profile,
            call_id,
            out_tx,
        };
        tokio::spawn(Self::drive(session));
        Ok(OpenedSession { session_id: call_id, events: out_rx })
    }

    async fn close(&self, session_id: Uuid) {
        self.stt.close(session_id).await;
        self.llm.close(session_id).await;
        self.tts.close(session_id).await;
    }

    async fn feed_audio(&self, session_id: Uuid, pcm16: &[i16]) -> Result<(), ProviderError> {
        self.stt.feed_audio(session_id, pcm16).await
    }

    async fn feed_text(&self, session_id: Uuid, text: &str) -> Result<(), ProviderError> {
        self.stt.feed_text(session_id, text).await
    }

    async fn request_response(&self, session_id: Uuid) -> Result<(), ProviderError> {
        self.stt.request_response(session_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use parking_lot::Mutex;

    #[test]
    fn split_sentences_keeps_remainder() {
        let mut buf = String::new();
        let sentences = split_sentences(&mut buf, "Hello there. How are");
        assert_eq!(sentences, vec!["Hello there."]);
        assert_eq!(buf, " How are");
        let more = split_sentences(&mut buf, " you doing?");
        assert_eq!(more, vec!["How are you doing?"]);
        assert!(buf.is_empty());
    }

    /// A reference adapter for exercising `PipelineOrchestrator` in
    /// isolation: `feed_text` optionally auto-emits a canned response
    /// through the session's own event sender (standing in for an async
    /// backend that streams a reply back), and every open/close/feed_text
    /// call is recorded so tests can assert on adapter lifecycle.
    struct FakeAdapter {
        caps: AdapterCapabilities,
        auto_reply: Option<Vec<ProviderEvent>>,
        senders: Mutex<HashMap<Uuid, mpsc::Sender<ProviderEvent>>>,
        open_count: Mutex<u32>,
        fed_text: Mutex<Vec<String>>,
    }

    impl FakeAdapter {
        fn new(caps: AdapterCapabilities, auto_reply: Option<Vec<ProviderEvent>>) -> Arc<Self> {
            Arc::new(Self {
                caps,
                auto_reply,
                senders: Mutex::new(HashMap::new()),
                open_count: Mutex::new(0),
                fed_text: Mutex::new(Vec::new()),
            })
        }

        fn sender(&self, session_id: Uuid) -> mpsc::Sender<ProviderEvent> {
            self.senders.lock().get(&session_id).expect("session not open").clone()
        }

        fn open_count(&self) -> u32 {
            *self.open_count.lock()
        }

        fn fed_text(&self) -> Vec<String> {
            self.fed_text.lock().clone()
        }
    }

    #[async_trait::async_trait]
    impl ProviderAdapter for FakeAdapter {
        fn capabilities(&self) -> AdapterCapabilities {
            self.caps
        }

        async fn open(&self, _profile: TransportProfile, call_id: Uuid) -> Result<OpenedSession, ProviderError> {
            let (tx, rx) = mpsc::channel(32);
            self.senders.lock().insert(call_id, tx);
            *self.open_count.lock() += 1;
            Ok(OpenedSession { session_id: call_id, events: rx })
        }

        async fn close(&self, session_id: Uuid) {
            self.senders.lock().remove(&session_id);
        }

        async fn feed_audio(&self, _session_id: Uuid, _pcm16: &[i16]) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn feed_text(&self, session_id: Uuid, text: &str) -> Result<(), ProviderError> {
            self.fed_text.lock().push(text.to_string());
            if let Some(events) = &self.auto_reply {
                let sender = self.sender(session_id);
                for event in events {
                    let _ = sender.send(event.clone()).await;
                }
            }
            Ok(())
        }

        async fn request_response(&self, _session_id: Uuid) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    fn streaming_caps() -> AdapterCapabilities {
        AdapterCapabilities { server_side_turn_detection: false, can_negotiate: false, is_monolithic: false, preferred_chunk_ms: 20 }
    }

    // §8 P3 + turn-taking ordering: a final transcript drives exactly one
    // LLM request, one TTS request, and the downstream stream is bracketed
    // by ResponseStart before the first AudioOut and ResponseEnd after the last.
    #[tokio::test]
    async fn single_turn_emits_response_start_then_audio_then_response_end() {
        let stt = FakeAdapter::new(streaming_caps(), None);
        let llm = FakeAdapter::new(
            streaming_caps(),
            Some(vec![ProviderEvent::PartialTranscript("Hi there.".to_string()), ProviderEvent::FinalTranscript(String::new())]),
        );
        let tts = FakeAdapter::new(
            streaming_caps(),
            Some(vec![ProviderEvent::ResponseStart, ProviderEvent::AudioOut(vec![1, 2, 3]), ProviderEvent::ResponseEnd]),
        );
        let orchestrator = PipelineOrchestrator::new(stt.clone(), llm.clone(), tts.clone());
        let call_id = Uuid::new_v4();
        let mut opened = orchestrator.open(TransportProfile::default(), call_id).await.unwrap();

        let stt_tx = stt.sender(call_id);
        stt_tx.send(ProviderEvent::FinalTranscript("hello".to_string())).await.unwrap();

        assert!(matches!(opened.events.recv().await.unwrap(), ProviderEvent::ResponseStart));
        assert!(matches!(opened.events.recv().await.unwrap(), ProviderEvent::AudioOut(_)));
        assert!(matches!(opened.events.recv().await.unwrap(), ProviderEvent::ResponseEnd));
        assert_eq!(llm.fed_text(), vec!["hello"]);
        assert_eq!(tts.fed_text(), vec!["Hi there."]);
    }

    // §8 S2: barge-in mid-response cancels the in-flight LLM/TTS turn, and a
    // second, later turn still completes normally — i.e. cancellation does
    // not permanently wedge the pipeline (a real risk if the sub-adapter
    // sessions were torn down without being reopened).
    #[tokio::test]
    async fn barge_in_cancels_in_flight_turn_and_a_later_turn_still_completes() {
        let stt = FakeAdapter::new(streaming_caps(), None);
        // No auto-reply: this test drives the LLM/TTS senders by hand so it
        // can interleave a barge-in mid-turn.
        let llm = FakeAdapter::new(streaming_caps(), None);
        let tts = FakeAdapter::new(streaming_caps(), None);
        let orchestrator = PipelineOrchestrator::new(stt.clone(), llm.clone(), tts.clone());
        let call_id = Uuid::new_v4();
        let mut opened = orchestrator.open(TransportProfile::default(), call_id).await.unwrap();

        let stt_tx = stt.sender(call_id);
        stt_tx.send(ProviderEvent::FinalTranscript("tell me a long story".to_string())).await.unwrap();

        // Let the orchestrator's feed_text reach the LLM fake before we act on its session.
        tokio::task::yield_now().await;
        let llm_tx_turn1 = llm.sender(call_id);
        llm_tx_turn1.send(ProviderEvent::FinalTranscript("Once upon a time.".to_string())).await.unwrap();
        tokio::task::yield_now().await;

        let tts_tx_turn1 = tts.sender(call_id);
        tts_tx_turn1.send(ProviderEvent::ResponseStart).await.unwrap();
        assert!(matches!(opened.events.recv().await.unwrap(), ProviderEvent::ResponseStart));
        tts_tx_turn1.send(ProviderEvent::AudioOut(vec![9, 9])).await.unwrap();
        assert!(matches!(opened.events.recv().await.unwrap(), ProviderEvent::AudioOut(_)));

        // Mid-playback, the caller speaks again: barge-in.
        stt_tx.send(ProviderEvent::SpeechStart).await.unwrap();
        assert!(matches!(opened.events.recv().await.unwrap(), ProviderEvent::SpeechStart));
        assert!(matches!(opened.events.recv().await.unwrap(), ProviderEvent::Error(ProviderErrorKind::Cancelled)));
        assert!(matches!(opened.events.recv().await.unwrap(), ProviderEvent::ResponseEnd));

        // The cancelled turn's sub-sessions were closed and reopened, not
        // permanently torn down.
        assert_eq!(llm.open_count(), 2);
        assert_eq!(tts.open_count(), 2);

        // A second utterance still drives a fresh, complete turn.
        stt_tx.send(ProviderEvent::FinalTranscript("what's the weather".to_string())).await.unwrap();
        tokio::task::yield_now().await;
        let llm_tx_turn2 = llm.sender(call_id);
        llm_tx_turn2.send(ProviderEvent::FinalTranscript("Sunny today.".to_string())).await.unwrap();
        tokio::task::yield_now().await;
        let tts_tx_turn2 = tts.sender(call_id);
        tts_tx_turn2.send(ProviderEvent::ResponseStart).await.unwrap();
        tts_tx_turn2.send(ProviderEvent::AudioOut(vec![1])).await.unwrap();
        tts_tx_turn2.send(ProviderEvent::ResponseEnd).await.unwrap();

        assert!(matches!(opened.events.recv().await.unwrap(), ProviderEvent::ResponseStart));
        assert!(matches!(opened.events.recv().await.unwrap(), ProviderEvent::AudioOut(_)));
        assert!(matches!(opened.events.recv().await.unwrap(), ProviderEvent::ResponseEnd));
    }
}
