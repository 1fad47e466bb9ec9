//! Local, energy-based voice activity detector (§4.10, §6 `vad.*`).
//!
//! Used by the Engine for providers whose capabilities do not include
//! `serverSideTurnDetection`: consecutive-frame hysteresis on RMS decides
//! when a caller started or stopped talking, so the Engine can trigger
//! barge-in or call `ProviderAdapter::request_response`. Per spec §6, this
//! detector is entirely bypassed for providers that advertise server-side
//! turn detection — callers construct one only when they need it.

use crate::metrics::rms;

#[derive(Debug, Clone, Copy)]
pub struct VadConfig {
    /// 0-3, coarser buckets of the underlying energy floor; higher values
    /// require a louder frame to count as speech (mirrors webrtcvad's
    /// aggressiveness knob without requiring the crate).
    pub aggressiveness: u8,
    /// Consecutive above-floor frames required to raise `SpeechStart`.
    pub start_frames: u32,
    /// Consecutive below-floor frames required to raise `SpeechEnd`.
    pub end_frames: u32,
}

impl VadConfig {
    fn energy_floor(&self) -> f64 {
        // Aggressiveness 0 is the most permissive (lowest floor); each step
        // roughly doubles the RMS required to count as speech.
        100.0 * 2f64.powi(self.aggressiveness.min(3) as i32)
    }
}

impl Default for VadConfig {
    fn default() -> Self {
        Self { aggressiveness: 2, start_frames: 3, end_frames: 8 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    SpeechStart,
    SpeechEnd,
}

/// Per-call VAD state. `process` is fed one inbound frame at a time and
/// returns at most one edge-triggered event per call.
#[derive(Debug)]
pub struct LocalVad {
    config: VadConfig,
    speaking: bool,
    run: u32,
}

impl LocalVad {
    pub fn new(config: VadConfig) -> Self {
        Self { config, speaking: false, run: 0 }
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Feed one frame's samples; returns `Some(SpeechStart)`/`Some(SpeechEnd)`
    /// exactly on the frame that crosses the hysteresis threshold, `None`
    /// otherwise.
    pub fn process(&mut self, samples: &[i16]) -> Option<VadEvent> {
        let above_floor = rms(samples) >= self.config.energy_floor();
        if above_floor == self.speaking {
            self.run = 0;
            return None;
        }
        self.run += 1;
        let threshold = if above_floor { self.config.start_frames } else { self.config.end_frames };
        if self.run < threshold {
            return None;
        }
        self.run = 0;
        self.speaking = above_floor;
        Some(if above_floor { VadEvent::SpeechStart } else { VadEvent::SpeechEnd })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loud_frame() -> Vec<i16> {
        vec![4000i16; 160]
    }

    fn quiet_frame() -> Vec<i16> {
        vec![0i16; 160]
    }

    #[test]
    fn raises_speech_start_after_consecutive_loud_frames() {
        let mut vad = LocalVad::new(VadConfig { aggressiveness: 2, start_frames: 3, end_frames: 8 });
        assert_eq!(vad.process(&loud_frame()), None);
        assert_eq!(vad.process(&loud_frame()), None);
        assert_eq!(vad.process(&loud_frame()), Some(VadEvent::SpeechStart));
        assert!(vad.is_speaking());
    }

    #[test]
    fn raises_speech_end_after_consecutive_quiet_frames_once_speaking() {
        let mut vad = LocalVad::new(VadConfig { aggressiveness: 2, start_frames: 1, end_frames: 2 });
        assert_eq!(vad.process(&loud_frame()), Some(VadEvent::SpeechStart));
        assert_eq!(vad.process(&quiet_frame()), None);
        assert_eq!(vad.process(&quiet_frame()), Some(VadEvent::SpeechEnd));
        assert!(!vad.is_speaking());
    }

    #[test]
    fn an_isolated_loud_frame_does_not_flip_state() {
        let mut vad = LocalVad::new(VadConfig { aggressiveness: 2, start_frames: 3, end_frames: 3 });
        assert_eq!(vad.process(&loud_frame()), None);
        assert_eq!(vad.process(&quiet_frame()), None);
        assert!(!vad.is_speaking());
    }

    #[test]
    fn higher_aggressiveness_requires_a_louder_floor() {
        let mid = vec![250i16; 160];
        let mut permissive = LocalVad::new(VadConfig { aggressiveness: 0, start_frames: 1, end_frames: 1 });
        let mut strict = LocalVad::new(VadConfig { aggressiveness: 3, start_frames: 1, end_frames: 1 });
        assert_eq!(permissive.process(&mid), Some(VadEvent::SpeechStart));
        assert_eq!(strict.process(&mid), None);
    }
}
