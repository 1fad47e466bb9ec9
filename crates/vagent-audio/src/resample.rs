//! Fixed-ratio resampling restricted to the 8/16/24 kHz family used by the
//! telephony and provider sides of the media plane.
//!
//! Grounded on the linear-interpolation resampler in the teacher's
//! `audio-core::format::FormatConverter::convert_sample_rate`: walk the
//! input at `1/ratio` steps and interpolate between the two neighboring
//! samples. A low-pass is applied on downsampling (8k/16k and 16k/24k are
//! all within a single octave, so a one-pole average is enough to tame
//! aliasing without a full FIR).

use crate::error::AudioError;

const SUPPORTED_RATES: [u32; 3] = [8000, 16000, 24000];

fn rate_supported(rate: u32) -> bool {
    SUPPORTED_RATES.contains(&rate)
}

/// Resample PCM16 samples between 8000/16000/24000 Hz. Any other pair is
/// rejected rather than silently mis-resampled.
pub fn resample_pcm16(samples: &[i16], src_rate: u32, dst_rate: u32) -> Result<Vec<i16>, AudioError> {
    if !rate_supported(src_rate) || !rate_supported(dst_rate) {
        return Err(AudioError::UnsupportedResampleRatio { src: src_rate, dst: dst_rate });
    }
    if src_rate == dst_rate {
        return Ok(samples.to_vec());
    }
    if samples.is_empty() {
        return Ok(Vec::new());
    }

    let filtered = if dst_rate < src_rate {
        low_pass_average(samples)
    } else {
        samples.to_vec()
    };

    let ratio = dst_rate as f64 / src_rate as f64;
    let output_len = ((filtered.len() as f64) * ratio).round() as usize;
    let mut out = Vec::with_capacity(output_len);

    let step = 1.0 / ratio;
    let mut pos = 0.0f64;
    while out.len() < output_len {
        let idx = pos.floor() as usize;
        let frac = pos - pos.floor();
        let s0 = filtered.get(idx).copied().unwrap_or(0) as f64;
        let s1 = filtered.get(idx + 1).copied().unwrap_or(s0 as i16) as f64;
        let interpolated = s0 + (s1 - s0) * frac;
        out.push(interpolated.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16);
        pos += step;
    }
    Ok(out)
}

/// Light one-pole moving average to suppress aliasing before decimation.
fn low_pass_average(samples: &[i16]) -> Vec<i16> {
    let mut out = Vec::with_capacity(samples.len());
    let mut prev = samples[0] as i32;
    for &s in samples {
        let avg = (prev + s as i32) / 2;
        out.push(avg as i16);
        prev = s as i32;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(sr: u32, freq: f64, n: usize) -> Vec<i16> {
        (0..n)
            .map(|i| (8000.0 * (2.0 * std::f64::consts::PI * freq * i as f64 / sr as f64).sin()) as i16)
            .collect()
    }

    fn rms(s: &[i16]) -> f64 {
        let sum_sq: f64 = s.iter().map(|&v| (v as f64) * (v as f64)).sum();
        (sum_sq / s.len().max(1) as f64).sqrt()
    }

    #[test]
    fn rejects_unsupported_ratio() {
        let err = resample_pcm16(&[0, 1, 2], 8000, 44100).unwrap_err();
        assert!(matches!(err, AudioError::UnsupportedResampleRatio { .. }));
    }

    #[test]
    fn round_trip_16k_8k_16k_preserves_energy() {
        // L2: x@16k -> 8k -> 16k round-trips energy within 3% for voice-band content.
        let original = tone(16000, 300.0, 1600);
        let down = resample_pcm16(&original, 16000, 8000).unwrap();
        let up = resample_pcm16(&down, 8000, 16000).unwrap();

        let rms_in = rms(&original);
        let rms_out = rms(&up);
        let delta = (rms_in - rms_out).abs() / rms_in;
        assert!(delta <= 0.03, "energy delta {delta} exceeds 3%");
    }

    #[test]
    fn same_rate_is_identity() {
        let s = vec![1, 2, 3, -4];
        assert_eq!(resample_pcm16(&s, 16000, 16000).unwrap(), s);
    }
}
