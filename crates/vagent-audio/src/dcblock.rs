//! First-order DC-blocking high-pass filter with per-flow state, for
//! optional use ahead of STT feeding (removes analog-trunk DC bias that
//! otherwise biases downstream VAD energy thresholds).

const DEFAULT_COEFFICIENT: f64 = 0.995;

/// Carries the single-sample history a DC blocker needs between calls; one
/// instance per RTP/AudioSocket flow.
#[derive(Debug, Clone, Copy, Default)]
pub struct DcBlockState {
    prev_in: f64,
    prev_out: f64,
}

/// Apply `y[n] = x[n] - x[n-1] + coeff * y[n-1]` in place, advancing `state`.
pub fn dc_block(samples: &[i16], state: &mut DcBlockState) -> Vec<i16> {
    dc_block_with_coefficient(samples, state, DEFAULT_COEFFICIENT)
}

pub fn dc_block_with_coefficient(samples: &[i16], state: &mut DcBlockState, coeff: f64) -> Vec<i16> {
    let mut out = Vec::with_capacity(samples.len());
    for &s in samples {
        let x = s as f64;
        let y = x - state.prev_in + coeff * state.prev_out;
        state.prev_in = x;
        state.prev_out = y;
        out.push(y.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removes_constant_dc_bias() {
        let mut state = DcBlockState::default();
        let biased = vec![1000i16; 400];
        let cleaned = dc_block(&biased, &mut state);
        // tail should have decayed close to zero once the filter settles
        let tail_avg: f64 = cleaned[300..].iter().map(|&s| s as f64).sum::<f64>() / 100.0;
        assert!(tail_avg.abs() < 50.0, "tail average {tail_avg} did not settle near zero");
    }
}
