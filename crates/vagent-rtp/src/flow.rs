//! Per-SSRC flow state: sequence/jitter/loss accounting plus the ingress
//! normalization state shared with `vagent-audiosocket`.

use std::net::SocketAddr;
use std::time::Instant;

use vagent_audio::FlowAudioState;

/// RFC 3550 §A.8 style jitter estimator, operating on RTP timestamp units
/// (8 kHz clock for PCMU, so jitter is directly in samples).
#[derive(Debug, Clone, Default)]
pub struct JitterEstimator {
    last_arrival: Option<Instant>,
    last_timestamp: Option<u32>,
    jitter: f64,
}

impl JitterEstimator {
    pub fn update(&mut self, timestamp: u32, arrival: Instant) -> f64 {
        if let (Some(last_arrival), Some(last_timestamp)) = (self.last_arrival, self.last_timestamp) {
            let arrival_diff_units =
                arrival.duration_since(last_arrival).as_secs_f64() * 8000.0;
            let timestamp_diff = timestamp as i64 - last_timestamp as i64;
            let d = (arrival_diff_units - timestamp_diff as f64).abs();
            self.jitter += (d - self.jitter) / 16.0;
        }
        self.last_arrival = Some(arrival);
        self.last_timestamp = Some(timestamp);
        self.jitter
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }
}

/// Sequence-number tracker tolerant of 16-bit wraparound (RFC 3550 §A.1).
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    base_seq: Option<u16>,
    highest_seq_ext: i64,
    received: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqOutcome {
    FirstPacket,
    InOrder,
    /// Reordered but still within the acceptable window.
    Reordered,
    /// Forward jump: `lost` packets are presumed lost.
    Gap { lost: u64 },
}

impl SequenceTracker {
    /// Extend a 16-bit sequence number into a monotonically increasing
    /// counter, accounting for wraparound, and classify the outcome.
    pub fn record(&mut self, seq: u16) -> SeqOutcome {
        self.received += 1;
        let Some(base) = self.base_seq else {
            self.base_seq = Some(seq);
            self.highest_seq_ext = seq as i64;
            return SeqOutcome::FirstPacket;
        };
        let _ = base;
        let highest_low16 = (self.highest_seq_ext & 0xFFFF) as i64;
        let mut ext = seq as i64 - highest_low16;
        // Pick the wraparound interpretation closest to the running extended
        // counter: forward wrap (+65536) or backward wrap (-65536).
        if ext < -32768 {
            ext += 65536;
        } else if ext > 32768 {
            ext -= 65536;
        }
        let candidate = self.highest_seq_ext + ext;
        if candidate > self.highest_seq_ext {
            let gap = candidate - self.highest_seq_ext;
            self.highest_seq_ext = candidate;
            if gap == 1 {
                SeqOutcome::InOrder
            } else {
                SeqOutcome::Gap { lost: (gap - 1) as u64 }
            }
        } else {
            SeqOutcome::Reordered
        }
    }

    pub fn expected(&self) -> u64 {
        match self.base_seq {
            Some(base) => (self.highest_seq_ext - base as i64 + 1).max(0) as u64,
            None => 0,
        }
    }

    pub fn received(&self) -> u64 {
        self.received
    }
}

/// One active RTP flow, keyed by SSRC. Owned by the `RTPServer`; the Engine
/// only ever reads a snapshot through the ingress callback (§5: "The
/// RTPServer owns flow records; the Engine reads them through a callback,
/// never mutates them").
pub struct FlowRecord {
    pub ssrc: u32,
    pub remote_addr: SocketAddr,
    pub created_at: Instant,
    pub last_arrival_at: Instant,
    sequence: SequenceTracker,
    jitter: JitterEstimator,
    pub loss_counter: u64,
    audio_state: FlowAudioState,
}

impl FlowRecord {
    pub fn new(ssrc: u32, remote_addr: SocketAddr, now: Instant, dc_block_enabled: bool) -> Self {
        Self {
            ssrc,
            remote_addr,
            created_at: now,
            last_arrival_at: now,
            sequence: SequenceTracker::default(),
            jitter: JitterEstimator::default(),
            loss_counter: 0,
            audio_state: FlowAudioState::new(dc_block_enabled),
        }
    }

    /// Feed one decoded packet's header fields through the sequence/jitter
    /// trackers, updating loss accounting, and return the observed outcome.
    pub fn observe(&mut self, seq: u16, timestamp: u32, arrival: Instant) -> SeqOutcome {
        self.last_arrival_at = arrival;
        let outcome = self.sequence.record(seq);
        if let SeqOutcome::Gap { lost } = outcome {
            self.loss_counter += lost;
        }
        self.jitter.update(timestamp, arrival);
        outcome
    }

    pub fn jitter(&self) -> f64 {
        self.jitter.jitter()
    }

    pub fn expected_packets(&self) -> u64 {
        self.sequence.expected()
    }

    pub fn received_packets(&self) -> u64 {
        self.sequence.received()
    }

    pub fn normalize_ingress(&mut self, samples: Vec<i16>) -> Vec<i16> {
        self.audio_state.normalize(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_tracks_in_order() {
        let mut t = SequenceTracker::default();
        assert_eq!(t.record(100), SeqOutcome::FirstPacket);
        assert_eq!(t.record(101), SeqOutcome::InOrder);
        assert_eq!(t.record(102), SeqOutcome::InOrder);
        assert_eq!(t.expected(), 3);
        assert_eq!(t.received(), 3);
    }

    #[test]
    fn sequence_detects_gap() {
        let mut t = SequenceTracker::default();
        t.record(10);
        assert_eq!(t.record(15), SeqOutcome::Gap { lost: 4 });
        assert_eq!(t.expected(), 6);
    }

    #[test]
    fn sequence_survives_wraparound() {
        let mut t = SequenceTracker::default();
        t.record(65534);
        assert_eq!(t.record(65535), SeqOutcome::InOrder);
        assert_eq!(t.record(0), SeqOutcome::InOrder);
        assert_eq!(t.record(1), SeqOutcome::InOrder);
        assert_eq!(t.expected(), 4);
    }

    #[test]
    fn sequence_flags_reorder() {
        let mut t = SequenceTracker::default();
        t.record(10);
        t.record(12);
        assert_eq!(t.record(11), SeqOutcome::Reordered);
    }
}
