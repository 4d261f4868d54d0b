use num_complex::Complex32;

use crate::DspError;

/// Output level the gain loop normalizes the envelope peak to. Callers that
/// want a unit peak multiply the output by `2 * sqrt(2)`.
const AGC_RESCALE: f32 = 0.353_553_4;

/// Configuration for the dual-envelope AGC.
///
/// Time constants are in samples. The fast envelope tracks short spikes, the
/// slow envelope the sustained signal level; the hang timer keeps the slow
/// envelope from decaying for `hang_max` samples after the input drops, which
/// prevents gain pumping between symbols.
#[derive(Debug, Clone)]
pub struct AgcParams {
    /// Envelope floor below which the gain stops increasing.
    pub threshold: f32,
    pub fast_rise_t: f32,
    pub fast_fall_t: f32,
    pub slow_rise_t: f32,
    pub slow_fall_t: f32,
    /// Hang time in samples before the slow envelope starts falling.
    pub hang_max: f32,
    /// Output delay, so the gain computed from a peak applies to the samples
    /// around it rather than only after it.
    pub delay_line_size: usize,
    /// Length of the magnitude window the peak detector looks at.
    pub mag_history_size: usize,
}

impl Default for AgcParams {
    fn default() -> Self {
        Self {
            threshold: 1e-4,
            fast_rise_t: 2.0,
            fast_fall_t: 4.0,
            slow_rise_t: 20.0,
            slow_fall_t: 40.0,
            hang_max: 1.0,
            delay_line_size: 1,
            mag_history_size: 1,
        }
    }
}

/// Automatic gain control with separate fast/slow envelopes and a hang timer.
pub struct Agc {
    delay: Vec<Complex32>,
    delay_ptr: usize,
    mag_history: Vec<f32>,
    mag_ptr: usize,
    fast: f32,
    slow: f32,
    fast_rise: f32,
    fast_fall: f32,
    slow_rise: f32,
    slow_fall: f32,
    hang: u32,
    hang_max: u32,
    threshold: f32,
}

/// One-pole coefficient for a time constant expressed in samples.
fn time_to_alpha(t: f32) -> f32 {
    1.0 - (-1.0 / t.max(1.0)).exp()
}

impl Agc {
    pub fn new(params: &AgcParams) -> Result<Self, DspError> {
        if params.fast_rise_t <= 0.0
            || params.fast_fall_t <= 0.0
            || params.slow_rise_t <= 0.0
            || params.slow_fall_t <= 0.0
        {
            return Err(DspError::InvalidParams("AGC time constants must be positive"));
        }
        if params.threshold <= 0.0 {
            return Err(DspError::InvalidParams("AGC threshold must be positive"));
        }

        Ok(Self {
            delay: vec![Complex32::new(0.0, 0.0); params.delay_line_size.max(1)],
            delay_ptr: 0,
            mag_history: vec![0.0; params.mag_history_size.max(1)],
            mag_ptr: 0,
            fast: 0.0,
            slow: 0.0,
            fast_rise: time_to_alpha(params.fast_rise_t),
            fast_fall: time_to_alpha(params.fast_fall_t),
            slow_rise: time_to_alpha(params.slow_rise_t),
            slow_fall: time_to_alpha(params.slow_fall_t),
            hang: 0,
            hang_max: params.hang_max.max(0.0) as u32,
            threshold: params.threshold,
        })
    }

    /// Process one sample. The returned sample lags the input by the delay
    /// line length and has its envelope normalized to [`AGC_RESCALE`].
    pub fn feed(&mut self, x: Complex32) -> Complex32 {
        let delayed = self.delay[self.delay_ptr];
        self.delay[self.delay_ptr] = x;
        self.delay_ptr = (self.delay_ptr + 1) % self.delay.len();

        self.mag_history[self.mag_ptr] = x.norm();
        self.mag_ptr = (self.mag_ptr + 1) % self.mag_history.len();
        let peak = self.mag_history.iter().cloned().fold(0.0f32, f32::max);

        if peak > self.fast {
            self.fast += self.fast_rise * (peak - self.fast);
        } else {
            self.fast += self.fast_fall * (peak - self.fast);
        }

        if peak > self.slow {
            self.slow += self.slow_rise * (peak - self.slow);
            self.hang = 0;
        } else if self.hang < self.hang_max {
            self.hang += 1;
        } else {
            self.slow += self.slow_fall * (peak - self.slow);
        }

        let env = self.fast.max(self.slow);
        let gain = AGC_RESCALE / env.max(self.threshold);

        delayed * gain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agc(delay: usize, hist: usize) -> Agc {
        Agc::new(&AgcParams {
            fast_rise_t: 4.0,
            fast_fall_t: 8.0,
            slow_rise_t: 40.0,
            slow_fall_t: 80.0,
            hang_max: 10.0,
            delay_line_size: delay,
            mag_history_size: hist,
            ..AgcParams::default()
        })
        .unwrap()
    }

    #[test]
    fn test_agc_gain_convergence() {
        let mut agc = agc(4, 4);

        // Feed a constant-amplitude signal
        let mut out = Complex32::new(0.0, 0.0);
        for _ in 0..2000 {
            out = agc.feed(Complex32::new(0.01, 0.0));
        }

        // After convergence the envelope sits at the rescale level, so
        // 2 * sqrt(2) brings the peak to ~1.
        let peak = out.norm() * 2.0 * std::f32::consts::SQRT_2;
        assert!(
            (peak - 1.0).abs() < 0.3,
            "normalized peak = {}, expected ~1.0",
            peak
        );
    }

    #[test]
    fn test_agc_tracks_level_step() {
        let mut agc = agc(2, 2);

        for _ in 0..1000 {
            agc.feed(Complex32::new(0.001, 0.0));
        }

        // Sudden strong signal: output must stay bounded and re-converge
        let mut out = Complex32::new(0.0, 0.0);
        for _ in 0..1000 {
            out = agc.feed(Complex32::new(0.5, 0.0));
            assert!(out.norm().is_finite());
        }
        let peak = out.norm() * 2.0 * std::f32::consts::SQRT_2;
        assert!(
            (peak - 1.0).abs() < 0.5,
            "normalized peak = {}, expected ~1.0",
            peak
        );
    }

    #[test]
    fn test_agc_silence_stays_silent() {
        let mut agc = agc(2, 2);
        for _ in 0..100 {
            let out = agc.feed(Complex32::new(0.0, 0.0));
            assert_eq!(out.norm(), 0.0);
        }
    }

    #[test]
    fn test_agc_rejects_bad_params() {
        let params = AgcParams {
            fast_rise_t: 0.0,
            ..AgcParams::default()
        };
        assert!(Agc::new(&params).is_err());
    }

    #[test]
    fn test_agc_output_is_delayed() {
        let mut agc = agc(8, 1);
        // First 8 outputs come from the zero-filled delay line
        for _ in 0..8 {
            let out = agc.feed(Complex32::new(1.0, 0.0));
            assert_eq!(out.norm(), 0.0);
        }
        let out = agc.feed(Complex32::new(1.0, 0.0));
        assert!(out.norm() > 0.0);
    }
}
