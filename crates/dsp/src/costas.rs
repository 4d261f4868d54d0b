use num_complex::Complex32;
use std::f32::consts::PI;

use crate::sampling::norm2ang_freq;
use crate::DspError;

/// Phase detector flavor of a [`Costas`] loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CostasKind {
    /// BPSK: error = re(z) * im(z)
    Bpsk,
    /// QPSK: decision-directed cross product
    Qpsk,
}

/// Cascade of identical one-pole low-pass sections used as a loop arm filter.
#[derive(Debug, Clone)]
struct ArmFilter {
    stages: Vec<f32>,
    alpha: f32,
}

impl ArmFilter {
    fn new(order: usize, cutoff_norm: f32) -> Self {
        // cutoff_norm is Nyquist-normalized; one-pole coefficient from the
        // equivalent cycles-per-sample cutoff
        let alpha = (1.0 - (-PI * cutoff_norm).exp()).clamp(1e-4, 1.0);
        Self {
            stages: vec![0.0; order],
            alpha,
        }
    }

    fn feed(&mut self, x: f32) -> f32 {
        let mut v = x;
        for stage in &mut self.stages {
            *stage += self.alpha * (v - *stage);
            v = *stage;
        }
        v
    }
}

/// Costas loop for suppressed-carrier recovery of PSK signals.
///
/// The loop de-rotates the input by its VCO phase, low-pass filters the I/Q
/// arms, derives a phase error from the filtered arms according to the
/// [`CostasKind`], and runs a proportional-plus-integral update on phase and
/// frequency. The most recent de-rotated sample is exposed as `y`.
pub struct Costas {
    kind: CostasKind,
    phase: f32,
    freq: f32,
    max_freq: f32,
    alpha: f32,
    beta: f32,
    arm_i: ArmFilter,
    arm_q: ArmFilter,
    /// Last carrier-corrected output sample.
    pub y: Complex32,
}

impl Costas {
    /// Create a loop.
    ///
    /// * `f0_norm` - initial VCO frequency, Nyquist-normalized
    /// * `arm_bw_norm` - arm filter bandwidth, Nyquist-normalized
    /// * `arm_order` - number of cascaded one-pole arm sections
    /// * `loop_gain` - natural frequency of the PI update
    pub fn new(
        kind: CostasKind,
        f0_norm: f32,
        arm_bw_norm: f32,
        arm_order: usize,
        loop_gain: f32,
    ) -> Result<Self, DspError> {
        if arm_bw_norm <= 0.0 || arm_bw_norm > 1.0 {
            return Err(DspError::InvalidParams("costas arm bandwidth out of range"));
        }
        if arm_order == 0 {
            return Err(DspError::InvalidParams("costas arm order must be >= 1"));
        }
        if loop_gain <= 0.0 {
            return Err(DspError::InvalidParams("costas loop gain must be positive"));
        }

        // Critically damped PI gains from the loop natural frequency
        let damping = std::f32::consts::FRAC_1_SQRT_2;
        let omega_n = loop_gain;
        let denom = 1.0 + 2.0 * damping * omega_n + omega_n * omega_n;
        let alpha = 4.0 * damping * omega_n / denom;
        let beta = 4.0 * omega_n * omega_n / denom;

        Ok(Self {
            kind,
            phase: 0.0,
            freq: norm2ang_freq(f0_norm),
            max_freq: norm2ang_freq(arm_bw_norm),
            alpha,
            beta,
            arm_i: ArmFilter::new(arm_order, arm_bw_norm),
            arm_q: ArmFilter::new(arm_order, arm_bw_norm),
            y: Complex32::new(0.0, 0.0),
        })
    }

    /// Current VCO frequency in radians per sample.
    pub fn freq(&self) -> f32 {
        self.freq
    }

    /// Run one sample through the loop and return the de-rotated output.
    pub fn feed(&mut self, x: Complex32) -> Complex32 {
        let z = x * Complex32::from_polar(1.0, -self.phase);

        let zi = self.arm_i.feed(z.re);
        let zq = self.arm_q.feed(z.im);

        let err = match self.kind {
            CostasKind::Bpsk => zi * zq,
            CostasKind::Qpsk => {
                let si = if zi >= 0.0 { 1.0 } else { -1.0 };
                let sq = if zq >= 0.0 { 1.0 } else { -1.0 };
                si * zq - sq * zi
            }
        }
        .clamp(-1.0, 1.0);

        self.freq = (self.freq + self.beta * err).clamp(-self.max_freq, self.max_freq);
        self.phase += self.freq + self.alpha * err;
        while self.phase > PI {
            self.phase -= 2.0 * PI;
        }
        while self.phase < -PI {
            self.phase += 2.0 * PI;
        }

        self.y = z;
        z
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bpsk_locks_to_carrier_offset() {
        let mut costas = Costas::new(CostasKind::Bpsk, 0.0, 0.2, 3, 0.02).unwrap();

        let offset = 0.01; // radians/sample
        let mut err_acc = 0.0;
        let mut count = 0;
        for n in 0..8000 {
            let phase = offset * n as f32 + 0.5;
            let y = costas.feed(Complex32::from_polar(1.0, phase));
            if n >= 7000 {
                err_acc += (y.im / y.norm().max(1e-6)).abs();
                count += 1;
            }
        }

        // Locked output sits near the real axis (either BPSK point)
        let avg = err_acc / count as f32;
        assert!(avg < 0.2, "residual quadrature after lock: {}", avg);
    }

    #[test]
    fn test_qpsk_locks_to_diagonal() {
        let mut costas = Costas::new(CostasKind::Qpsk, 0.0, 0.2, 3, 0.02).unwrap();

        let offset = 0.005;
        let base = std::f32::consts::FRAC_PI_4;
        let mut err_acc = 0.0;
        let mut count = 0;
        for n in 0..10000 {
            let phase = base + offset * n as f32;
            let y = costas.feed(Complex32::from_polar(1.0, phase));
            if n >= 9000 {
                err_acc += (y.re.abs() - y.im.abs()).abs() / y.norm().max(1e-6);
                count += 1;
            }
        }

        // Locked output sits near a 45-degree constellation point
        let avg = err_acc / count as f32;
        assert!(avg < 0.3, "residual diagonal error after lock: {}", avg);
    }

    #[test]
    fn test_magnitude_preserved() {
        let mut costas = Costas::new(CostasKind::Bpsk, 0.0, 0.25, 3, 0.02).unwrap();
        for n in 0..100 {
            let y = costas.feed(Complex32::from_polar(0.7, 0.03 * n as f32));
            assert!((y.norm() - 0.7).abs() < 1e-4);
        }
    }

    #[test]
    fn test_rejects_bad_params() {
        assert!(Costas::new(CostasKind::Bpsk, 0.0, 0.0, 3, 0.01).is_err());
        assert!(Costas::new(CostasKind::Bpsk, 0.0, 0.2, 0, 0.01).is_err());
        assert!(Costas::new(CostasKind::Qpsk, 0.0, 0.2, 3, 0.0).is_err());
    }
}
