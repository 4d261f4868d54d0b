use num_complex::Complex32;
use std::f32::consts::TAU;

use crate::sampling::norm2ang_freq;

/// Numerically-controlled oscillator.
///
/// Produces one unit-magnitude complex sample per `read()` call and advances
/// its phase accumulator by the configured angular step. Frequencies are
/// Nyquist-normalized (see [`crate::sampling`]).
#[derive(Debug, Clone)]
pub struct Nco {
    phase: f32,
    omega: f32,
}

impl Nco {
    pub fn new(freq_norm: f32) -> Self {
        Self {
            phase: 0.0,
            omega: norm2ang_freq(freq_norm),
        }
    }

    /// Retune without resetting the phase accumulator, so the output stays
    /// continuous across frequency changes.
    pub fn set_freq(&mut self, freq_norm: f32) {
        self.omega = norm2ang_freq(freq_norm);
    }

    /// Current angular frequency in radians per sample.
    pub fn omega(&self) -> f32 {
        self.omega
    }

    /// Emit the oscillator output for the current phase, then advance one
    /// sample.
    pub fn read(&mut self) -> Complex32 {
        let out = Complex32::from_polar(1.0, self.phase);
        self.phase += self.omega;
        if self.phase >= TAU {
            self.phase -= TAU;
        } else if self.phase < 0.0 {
            self.phase += TAU;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nco_dc() {
        let mut nco = Nco::new(0.0);
        for _ in 0..100 {
            let s = nco.read();
            assert!((s.re - 1.0).abs() < 1e-6);
            assert!(s.im.abs() < 1e-6);
        }
    }

    #[test]
    fn test_nco_phase_step() {
        // freq_norm 0.5 -> pi/2 radians per sample
        let mut nco = Nco::new(0.5);
        let a = nco.read();
        let b = nco.read();
        let step = (b * a.conj()).arg();
        assert!((step - std::f32::consts::FRAC_PI_2).abs() < 1e-4);
    }

    #[test]
    fn test_nco_unit_magnitude() {
        let mut nco = Nco::new(0.37);
        for _ in 0..1000 {
            assert!((nco.read().norm() - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_nco_retune_keeps_continuity() {
        let mut nco = Nco::new(0.25);
        for _ in 0..10 {
            nco.read();
        }
        nco.set_freq(-0.25);
        let a = nco.read();
        let b = nco.read();
        // One step of the *new* frequency between consecutive reads
        let step = (b * a.conj()).arg();
        assert!((step + std::f32::consts::FRAC_PI_4).abs() < 1e-4);
    }
}
