//! UDP RTP (PCMU) media-plane server.
//!
//! Binds one socket in a configured port range, decodes inbound mu-law
//! payloads to PCM16@16kHz and forwards them to a registered ingress sink
//! along with the flow's SSRC, sequence number and arrival time. SSRC→call
//! binding is a callback decision (owned by the Engine / SessionStore); this
//! server only tracks flows it has already seen.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio::time::sleep;
use tracing::{debug, warn};

use vagent_audio::{resample_pcm16, rms, ulaw_bytes_to_pcm16_bytes};

use crate::error::RtpError;
use crate::flow::FlowRecord;
use crate::header::{parse_header, PCMU_PAYLOAD_TYPE};

/// Default silence-suppression RMS floor (§4.2): frames below this are still
/// forwarded but flagged, so the Engine can avoid waking a VAD on hum.
pub const DEFAULT_SILENCE_RMS_FLOOR: f64 = 100.0;

const MAX_UDP_DATAGRAM: usize = 2048;
const MAX_REBIND_BACKOFF: Duration = Duration::from_secs(5);

/// One decoded inbound RTP frame, normalized to PCM16 at 16 kHz.
#[derive(Debug, Clone)]
pub struct RtpIngressFrame {
    pub ssrc: u32,
    pub remote_addr: SocketAddr,
    pub sequence_number: u16,
    pub arrival: Instant,
    pub pcm16_16k: Vec<i16>,
    /// True if this frame's RMS is below the silence floor; still delivered,
    /// but the Engine should not use it to wake a VAD on its own.
    pub likely_silence: bool,
    /// True on the very first packet seen for this SSRC (the Engine resolves
    /// the binding lazily on this event; see RTPServer docs).
    pub first_packet_for_flow: bool,
}

#[async_trait::async_trait]
pub trait RtpIngressSink: Send + Sync {
    async fn on_frame(&self, frame: RtpIngressFrame);
}

pub struct RtpServerConfig {
    pub bind_host: String,
    pub port_range: (u16, u16),
    pub silence_rms_floor: f64,
    pub dc_block_enabled: bool,
}

impl Default for RtpServerConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port_range: (10000, 10010),
            silence_rms_floor: DEFAULT_SILENCE_RMS_FLOOR,
            dc_block_enabled: true,
        }
    }
}

/// Process-wide RTP server singleton. Owns all flow records; never mutates
/// `CallSession` state directly (see DESIGN NOTES §9: identifier lookups,
/// not cyclic references).
pub struct RtpServer {
    config: RtpServerConfig,
    flows: RwLock<HashMap<u32, FlowRecord>>,
    dropped_unknown_payload: std::sync::atomic::AtomicU64,
    ready: std::sync::atomic::AtomicBool,
}

impl RtpServer {
    pub fn new(config: RtpServerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            flows: RwLock::new(HashMap::new()),
            dropped_unknown_payload: std::sync::atomic::AtomicU64::new(0),
            ready: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn dropped_unknown_payload_count(&self) -> u64 {
        self.dropped_unknown_payload.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Observability surface: whether the UDP socket is currently bound.
    pub fn is_ready(&self) -> bool {
        self.ready.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Bind a UDP socket in the configured port range and run the receive
    /// loop until the process is shut down. Socket errors are logged and the
    /// socket is re-bound with exponential backoff capped at 5s (§4.2).
    pub async fn run(self: Arc<Self>, sink: Arc<dyn RtpIngressSink>) -> Result<(), RtpError> {
        let mut backoff = Duration::from_millis(100);
        loop {
            match self.bind_socket().await {
                Ok(socket) => {
                    backoff = Duration::from_millis(100);
                    self.ready.store(true, std::sync::atomic::Ordering::Relaxed);
                    if let Err(err) = self.receive_loop(&socket, &sink).await {
                        warn!(error = %err, "rtp socket error, rebinding");
                    }
                    self.ready.store(false, std::sync::atomic::Ordering::Relaxed);
                }
                Err(err) => {
                    warn!(error = %err, backoff_ms = backoff.as_millis() as u64, "rtp bind failed");
                }
            }
            sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_REBIND_BACKOFF);
        }
    }

    async fn bind_socket(&self) -> Result<UdpSocket, RtpError> {
        let (start, end) = self.config.port_range;
        for port in start..=end {
            let addr = format!("{}:{}", self.config.bind_host, port);
            if let Ok(socket) = UdpSocket::bind(&addr).await {
                debug!(%addr, "rtp server bound");
                return Ok(socket);
            }
        }
        Err(RtpError::NoPortAvailable { start, end })
    }

    async fn receive_loop(
        &self,
        socket: &UdpSocket,
        sink: &Arc<dyn RtpIngressSink>,
    ) -> Result<(), RtpError> {
        let mut buf = [0u8; MAX_UDP_DATAGRAM];
        loop {
            let (len, remote_addr) = socket.recv_from(&mut buf).await?;
            let arrival = Instant::now();
            if let Some(frame) = self.decode_packet(&buf[..len], remote_addr, arrival) {
                sink.on_frame(frame).await;
            }
        }
    }

    fn decode_packet(
        &self,
        packet: &[u8],
        remote_addr: SocketAddr,
        arrival: Instant,
    ) -> Option<RtpIngressFrame> {
        let (header, offset) = match parse_header(packet) {
            Ok(parsed) => parsed,
            Err(err) => {
                debug!(error = %err, "dropping malformed rtp packet");
                return None;
            }
        };
        if header.payload_type != PCMU_PAYLOAD_TYPE {
            self.dropped_unknown_payload
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            debug!(payload_type = header.payload_type, "dropping unknown rtp payload type");
            return None;
        }
        let payload = &packet[offset..];

        let mut flows = self.flows.write();
        let first_packet_for_flow = !flows.contains_key(&header.ssrc);
        let flow = flows.entry(header.ssrc).or_insert_with(|| {
            FlowRecord::new(header.ssrc, remote_addr, arrival, self.config.dc_block_enabled)
        });
        flow.observe(header.sequence_number, header.timestamp, arrival);

        let pcm16_8k_bytes = ulaw_bytes_to_pcm16_bytes(payload);
        let pcm16_8k: Vec<i16> = pcm16_8k_bytes
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        let normalized = flow.normalize_ingress(pcm16_8k);
        let pcm16_16k = resample_pcm16(&normalized, 8000, 16000).ok()?;
        let likely_silence = rms(&pcm16_16k) < self.config.silence_rms_floor;

        Some(RtpIngressFrame {
            ssrc: header.ssrc,
            remote_addr,
            sequence_number: header.sequence_number,
            arrival,
            pcm16_16k,
            likely_silence,
            first_packet_for_flow,
        })
    }

    /// Snapshot jitter/loss for a flow; read-only, never mutates (§5).
    pub fn flow_stats(&self, ssrc: u32) -> Option<(f64, u64, u64)> {
        self.flows
            .read()
            .get(&ssrc)
            .map(|f| (f.jitter(), f.loss_counter, f.expected_packets()))
    }

    pub fn remove_flow(&self, ssrc: u32) {
        self.flows.write().remove(&ssrc);
    }

    pub fn flow_count(&self) -> usize {
        self.flows.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pcmu_packet(seq: u16, ts: u32, ssrc: u32, ulaw_payload: &[u8]) -> Vec<u8> {
        let mut p = vec![0x80, PCMU_PAYLOAD_TYPE];
        p.extend_from_slice(&seq.to_be_bytes());
        p.extend_from_slice(&ts.to_be_bytes());
        p.extend_from_slice(&ssrc.to_be_bytes());
        p.extend_from_slice(ulaw_payload);
        p
    }

    struct CountingSink(AtomicUsize);
    #[async_trait::async_trait]
    impl RtpIngressSink for CountingSink {
        async fn on_frame(&self, _frame: RtpIngressFrame) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn decode_rejects_unknown_payload_type() {
        let server = RtpServer::new(RtpServerConfig::default());
        let mut p = pcmu_packet(1, 160, 0x1234, &[0xFF; 160]);
        p[1] = 0x80 | 8; // payload type 8, not PCMU
        let remote: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        assert!(server.decode_packet(&p, remote, Instant::now()).is_none());
        assert_eq!(server.dropped_unknown_payload_count(), 1);
    }

    #[test]
    fn decode_marks_first_packet_for_new_flow() {
        let server = RtpServer::new(RtpServerConfig::default());
        let remote: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let p1 = pcmu_packet(1, 160, 0xAAAA, &[0x7F; 160]);
        let frame1 = server.decode_packet(&p1, remote, Instant::now()).unwrap();
        assert!(frame1.first_packet_for_flow);

        let p2 = pcmu_packet(2, 320, 0xAAAA, &[0x7F; 160]);
        let frame2 = server.decode_packet(&p2, remote, Instant::now()).unwrap();
        assert!(!frame2.first_packet_for_flow);
        assert_eq!(server.flow_count(), 1);
    }
}
