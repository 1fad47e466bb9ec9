//! AudioSocket TCP server (§4.3): one connection per call, bound to a
//! `CallSession` by its 16-byte UUID handshake frame.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use vagent_audio::FlowAudioState;

use crate::error::AudioSocketError;
use crate::frame::{encode, FrameType};

pub const DEFAULT_EGRESS_STALL_TIMEOUT_MS: u64 = 2000;

#[derive(Debug, Clone)]
pub enum AudioSocketEvent {
    Handshake { uuid: Uuid },
    Audio { uuid: Uuid, pcm16: Vec<i16>, sample_rate: u32 },
    Dtmf { uuid: Uuid, digit: char },
    Disconnected { uuid: Uuid },
    /// A frame type/ordering violation that does not tear down the
    /// connection (§4.3: "Audio frames before handshake are dropped").
    ProtocolViolation { uuid: Option<Uuid>, detail: String },
}

#[async_trait::async_trait]
pub trait AudioSocketSink: Send + Sync {
    async fn on_event(&self, event: AudioSocketEvent);
}

pub struct AudioSocketConfig {
    pub bind_addr: String,
    pub egress_stall_timeout: Duration,
    pub dc_block_enabled: bool,
}

impl Default for AudioSocketConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:40000".to_string(),
            egress_stall_timeout: Duration::from_millis(DEFAULT_EGRESS_STALL_TIMEOUT_MS),
            dc_block_enabled: true,
        }
    }
}

/// Egress handle for one connection: frames pushed here are written to the
/// TCP socket by the connection's dedicated egress task (§5: "one task for
/// AudioSocket egress per streaming call").
#[derive(Clone)]
pub struct EgressHandle {
    tx: mpsc::Sender<(FrameType, Vec<u8>)>,
    stalled: Arc<AtomicBool>,
}

impl EgressHandle {
    pub async fn send_pcm16(&self, sample_rate: u32, samples: &[i16]) -> bool {
        let frame_type = FrameType::Pcm16(sample_rate);
        let mut payload = Vec::with_capacity(samples.len() * 2);
        for s in samples {
            payload.extend_from_slice(&s.to_le_bytes());
        }
        self.tx.send((frame_type, payload)).await.is_ok()
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled.load(Ordering::Relaxed)
    }
}

pub struct AudioSocketServer {
    config: AudioSocketConfig,
    connections: DashMap<Uuid, EgressHandle>,
    ready: AtomicBool,
}

impl AudioSocketServer {
    pub fn new(config: AudioSocketConfig) -> Arc<Self> {
        Arc::new(Self { config, connections: DashMap::new(), ready: AtomicBool::new(false) })
    }

    /// Observability surface: whether the TCP listener is currently bound.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn egress(&self, uuid: &Uuid) -> Option<EgressHandle> {
        self.connections.get(uuid).map(|e| e.clone())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub async fn run(self: Arc<Self>, sink: Arc<dyn AudioSocketSink>) -> Result<(), AudioSocketError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        debug!(addr = %self.config.bind_addr, "audiosocket server listening");
        self.ready.store(true, Ordering::Relaxed);
        loop {
            let (stream, peer) = listener.accept().await?;
            debug!(%peer, "audiosocket connection accepted");
            let this = self.clone();
            let sink = sink.clone();
            tokio::spawn(async move {
                this.handle_connection(stream, sink).await;
            });
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, sink: Arc<dyn AudioSocketSink>) {
        let mut bound_uuid: Option<Uuid> = None;
        let mut audio_state = FlowAudioState::new(self.config.dc_block_enabled);
        let (egress_tx, mut egress_rx) = mpsc::channel::<(FrameType, Vec<u8>)>(64);
        let stalled = Arc::new(AtomicBool::new(false));
        let stall_timeout = self.config.egress_stall_timeout;

        let (mut read_half, mut write_half) = stream.into_split();

        let egress_stalled = stalled.clone();
        let egress_task = async move {
            while let Some((frame_type, payload)) = egress_rx.recv().await {
                let bytes = encode(frame_type, &payload);
                match timeout(stall_timeout, write_half.write_all(&bytes)).await {
                    Ok(Ok(())) => {
                        egress_stalled.store(false, Ordering::Relaxed);
                    }
                    Ok(Err(err)) => {
                        warn!(error = %err, "audiosocket write failed");
                        break;
                    }
                    Err(_) => {
                        egress_stalled.store(true, Ordering::Relaxed);
                    }
                }
            }
        };
        let egress_handle = tokio::spawn(egress_task);

        loop {
            match read_frame(&mut read_half).await {
                Ok(Some((frame_type, payload))) => {
                    match frame_type {
                        FrameType::Uuid => {
                            if payload.len() != 16 {
                                sink.on_event(AudioSocketEvent::ProtocolViolation {
                                    uuid: bound_uuid,
                                    detail: format!("bad handshake length {}", payload.len()),
                                })
                                .await;
                                continue;
                            }
                            let uuid = Uuid::from_slice(&payload).unwrap_or_else(|_| Uuid::nil());
                            // "handshake after audio frames resets the connection" (§4.3).
                            if bound_uuid.is_some() {
                                debug!(%uuid, "handshake received mid-connection, resetting binding");
                                if let Some(old) = bound_uuid.take() {
                                    self.connections.remove(&old);
                                }
                            }
                            bound_uuid = Some(uuid);
                            self.connections.insert(
                                uuid,
                                EgressHandle { tx: egress_tx.clone(), stalled: stalled.clone() },
                            );
                            sink.on_event(AudioSocketEvent::Handshake { uuid }).await;
                        }
                        FrameType::Pcm16(rate) => {
                            let Some(uuid) = bound_uuid else {
                                sink.on_event(AudioSocketEvent::ProtocolViolation {
                                    uuid: None,
                                    detail: "audio before handshake".to_string(),
                                })
                                .await;
                                continue;
                            };
                            let raw: Vec<i16> = payload
                                .chunks_exact(2)
                                .map(|c| i16::from_le_bytes([c[0], c[1]]))
                                .collect();
                            let normalized = audio_state.normalize(raw);
                            sink.on_event(AudioSocketEvent::Audio {
                                uuid,
                                pcm16: normalized,
                                sample_rate: rate,
                            })
                            .await;
                        }
                        FrameType::Dtmf => {
                            if let (Some(uuid), Some(&b)) = (bound_uuid, payload.first()) {
                                sink.on_event(AudioSocketEvent::Dtmf { uuid, digit: b as char }).await;
                            }
                        }
                        FrameType::Terminate => {
                            break;
                        }
                        FrameType::Error => {
                            sink.on_event(AudioSocketEvent::ProtocolViolation {
                                uuid: bound_uuid,
                                detail: "peer reported error frame".to_string(),
                            })
                            .await;
                        }
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    debug!(error = %err, "audiosocket frame read error, closing connection");
                    break;
                }
            }
        }

        if let Some(uuid) = bound_uuid {
            self.connections.remove(&uuid);
            sink.on_event(AudioSocketEvent::Disconnected { uuid }).await;
        }
        egress_handle.abort();
    }
}

/// Read exactly one frame: 3-byte header then `length` payload bytes.
/// Returns `Ok(None)` on clean EOF before any header bytes arrive.
async fn read_frame(
    read_half: &mut (impl AsyncReadExt + Unpin),
) -> std::io::Result<Option<(FrameType, Vec<u8>)>> {
    let mut header = [0u8; 3];
    match read_half.read_exact(&mut header).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let frame_type = match FrameType::from_byte(header[0]) {
        Ok(t) => t,
        Err(_) => {
            // Unknown type byte: still consume the declared length so the
            // stream stays framed, then surface as an error-shaped no-op.
            let len = u16::from_be_bytes([header[1], header[2]]) as usize;
            let mut discard = vec![0u8; len];
            read_half.read_exact(&mut discard).await?;
            return Ok(Some((FrameType::Error, Vec::new())));
        }
    };
    let len = u16::from_be_bytes([header[1], header[2]]) as usize;
    let mut payload = vec![0u8; len];
    if len > 0 {
        read_half.read_exact(&mut payload).await?;
    }
    Ok(Some((frame_type, payload)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn read_frame_handles_zero_length_payload() {
        let bytes = encode(FrameType::Terminate, &[]);
        let mut reader = BufReader::new(&bytes[..]);
        let (frame_type, payload) = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(frame_type, FrameType::Terminate);
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn read_frame_returns_none_on_clean_eof() {
        let bytes: Vec<u8> = Vec::new();
        let mut reader = BufReader::new(&bytes[..]);
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn read_frame_parses_uuid_handshake() {
        let uuid = Uuid::new_v4();
        let bytes = encode(FrameType::Uuid, uuid.as_bytes());
        let mut reader = BufReader::new(&bytes[..]);
        let (frame_type, payload) = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(frame_type, FrameType::Uuid);
        assert_eq!(payload.len(), 16);
    }
}
