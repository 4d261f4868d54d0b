use num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

use crate::nco::Nco;
use crate::sampling::abs2norm_freq;
use crate::DspError;

/// Blind baud estimation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorMode {
    /// Autocorrelation of the windowed signal: the symbol clock shows up as
    /// the first strong off-zero correlation lag.
    Autocorrelation,
    /// Nonlinear differentiation: symbol transitions become energy spikes
    /// whose repetition rate shows up as a spectral line.
    NonlinearDiff,
}

#[derive(Debug, Clone)]
pub struct DetectorParams {
    pub mode: DetectorMode,
    /// Sample rate of the stream fed to the detector, Hz.
    pub samp_rate: f32,
    /// Channel center frequency, Hz (mixed down internally).
    pub fc: f32,
    /// Channel bandwidth, Hz (sets the pre-filter cutoff).
    pub bw: f32,
    /// Analysis window length in samples.
    pub window_size: usize,
    /// Spectral averaging coefficient across windows.
    pub alpha: f32,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            mode: DetectorMode::Autocorrelation,
            samp_rate: 1_000_000.0,
            fc: 0.0,
            bw: 0.0,
            window_size: 4096,
            alpha: 1e-4,
        }
    }
}

/// Ratio a spectral line must exceed over the band average to be believed.
const NLN_PEAK_RATIO: f32 = 2.0;
/// Fraction of the zero-lag energy an autocorrelation peak must reach.
const FAC_PEAK_RATIO: f32 = 0.15;

/// Per-channel detector: centers the channel at baseband, band-limits it and
/// estimates the symbol rate from successive analysis windows.
///
/// The most recent mixed-and-filtered sample is exposed via
/// [`last_window_sample`](Self::last_window_sample) so downstream stages can
/// reuse the detector's front end instead of duplicating it.
pub struct ChannelDetector {
    params: DetectorParams,
    lo: Nco,
    filt_state: Complex32,
    filt_alpha: f32,
    window: Vec<Complex32>,
    ptr: usize,
    fft: Arc<dyn Fft<f32>>,
    ifft: Option<Arc<dyn Fft<f32>>>,
    scratch: Vec<Complex32>,
    psd_avg: Vec<f32>,
    baud: f32,
    last_window_sample: Complex32,
    prev_sample: Complex32,
}

impl ChannelDetector {
    pub fn new(params: &DetectorParams) -> Result<Self, DspError> {
        if params.bw <= 0.0 || params.bw > params.samp_rate {
            return Err(DspError::InvalidParams("detector bandwidth out of range"));
        }
        if params.window_size < 16 {
            return Err(DspError::InvalidParams("detector window too short"));
        }
        if abs2norm_freq(params.samp_rate, params.fc).abs() > 1.0 {
            return Err(DspError::InvalidParams("center frequency beyond Nyquist"));
        }

        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(params.window_size);
        let ifft = match params.mode {
            DetectorMode::Autocorrelation => Some(planner.plan_fft_inverse(params.window_size)),
            DetectorMode::NonlinearDiff => None,
        };
        let scratch_len = ifft
            .as_ref()
            .map(|f| f.get_inplace_scratch_len())
            .unwrap_or(0)
            .max(fft.get_inplace_scratch_len());

        // One-pole channel filter matched to the channel bandwidth
        let cutoff = (params.bw / params.samp_rate).min(0.5);
        let filt_alpha = (1.0 - (-std::f32::consts::TAU * cutoff).exp()).clamp(1e-4, 1.0);

        Ok(Self {
            params: params.clone(),
            lo: Nco::new(abs2norm_freq(params.samp_rate, params.fc)),
            filt_state: Complex32::new(0.0, 0.0),
            filt_alpha,
            window: vec![Complex32::new(0.0, 0.0); params.window_size],
            ptr: 0,
            fft,
            ifft,
            scratch: vec![Complex32::new(0.0, 0.0); scratch_len],
            psd_avg: vec![0.0; params.window_size],
            baud: 0.0,
            last_window_sample: Complex32::new(0.0, 0.0),
            prev_sample: Complex32::new(0.0, 0.0),
        })
    }

    pub fn params(&self) -> &DetectorParams {
        &self.params
    }

    /// Latest baud rate estimate in Hz; 0 until the first confident window.
    pub fn baud(&self) -> f32 {
        self.baud
    }

    /// The channel-centered, band-limited rendition of the last input sample.
    pub fn last_window_sample(&self) -> Complex32 {
        self.last_window_sample
    }

    /// Feed one raw stream sample. Every `window_size` samples the baud
    /// estimate is refreshed.
    pub fn feed(&mut self, x: Complex32) -> Result<(), DspError> {
        if !x.re.is_finite() || !x.im.is_finite() {
            return Err(DspError::NonFinite);
        }

        let mixed = x * self.lo.read().conj();
        self.filt_state += self.filt_alpha * (mixed - self.filt_state);
        let s = self.filt_state;
        self.last_window_sample = s;

        self.window[self.ptr] = match self.params.mode {
            DetectorMode::Autocorrelation => s,
            DetectorMode::NonlinearDiff => {
                let d = s - self.prev_sample;
                self.prev_sample = s;
                Complex32::new(d.norm_sqr(), 0.0)
            }
        };

        self.ptr += 1;
        if self.ptr == self.window.len() {
            self.ptr = 0;
            self.analyze();
        }

        Ok(())
    }

    fn analyze(&mut self) {
        let mut buf = self.window.clone();
        self.fft.process_with_scratch(&mut buf, &mut self.scratch);

        for (avg, v) in self.psd_avg.iter_mut().zip(&buf) {
            *avg += self.params.alpha * (v.norm_sqr() - *avg);
        }

        match self.params.mode {
            DetectorMode::NonlinearDiff => self.analyze_spectral_line(),
            DetectorMode::Autocorrelation => self.analyze_autocorrelation(),
        }
    }

    /// Peak search over the averaged spectrum, skipping DC. The lowest
    /// strictly-maximal bin wins so the fundamental beats its harmonics.
    fn analyze_spectral_line(&mut self) {
        let n = self.psd_avg.len();
        let half = n / 2;

        let mut peak_bin = 0;
        let mut peak = 0.0f32;
        let mut acc = 0.0f32;
        for (bin, &p) in self.psd_avg[1..half].iter().enumerate() {
            if p > peak {
                peak = p;
                peak_bin = bin + 1;
            }
            acc += p;
        }

        let mean = acc / (half - 1) as f32;
        if peak_bin > 0 && peak > NLN_PEAK_RATIO * mean {
            self.baud = peak_bin as f32 * self.params.samp_rate / n as f32;
        }
    }

    /// Inverse transform of the averaged PSD gives the autocorrelation; the
    /// first dominant off-zero lag is the symbol period.
    fn analyze_autocorrelation(&mut self) {
        let ifft = self.ifft.as_ref().expect("FAC detector has an inverse plan");

        let mut corr: Vec<Complex32> = self
            .psd_avg
            .iter()
            .map(|&p| Complex32::new(p, 0.0))
            .collect();
        ifft.process_with_scratch(&mut corr, &mut self.scratch);

        let r0 = corr[0].norm();
        if r0 <= 0.0 {
            return;
        }

        // First local maximum above the confidence floor. Taking the first
        // rather than the global peak keeps period multiples from stealing
        // the estimate.
        let half = corr.len() / 2;
        for lag in 2..half.saturating_sub(1) {
            let m = corr[lag].norm();
            if m > FAC_PEAK_RATIO * r0
                && m > corr[lag - 1].norm()
                && m > corr[lag + 1].norm()
            {
                self.baud = self.params.samp_rate / lag as f32;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FS: f32 = 16_000.0;
    const WINDOW: usize = 4096;

    fn params(mode: DetectorMode) -> DetectorParams {
        DetectorParams {
            mode,
            samp_rate: FS,
            fc: 0.0,
            bw: FS / 4.0,
            window_size: WINDOW,
            alpha: 1e-4,
        }
    }

    /// Pulse train with one unit impulse every `period` samples.
    fn feed_pulse_train(det: &mut ChannelDetector, period: usize, count: usize) {
        for n in 0..count {
            let x = if n % period == 0 {
                Complex32::new(1.0, 0.0)
            } else {
                Complex32::new(0.0, 0.0)
            };
            det.feed(x).unwrap();
        }
    }

    #[test]
    fn test_nln_estimates_pulse_rate() {
        let mut det = ChannelDetector::new(&params(DetectorMode::NonlinearDiff)).unwrap();
        let period = 16; // -> 1000 Hz at 16 kHz
        feed_pulse_train(&mut det, period, WINDOW);

        let expected = FS / period as f32;
        assert!(
            (det.baud() - expected).abs() < FS / WINDOW as f32 + 1.0,
            "baud = {}, expected ~{}",
            det.baud(),
            expected
        );
    }

    #[test]
    fn test_fac_estimates_pulse_rate() {
        let mut det = ChannelDetector::new(&params(DetectorMode::Autocorrelation)).unwrap();
        let period = 16;
        feed_pulse_train(&mut det, period, WINDOW);

        let expected = FS / period as f32;
        assert!(
            (det.baud() - expected).abs() < 0.1 * expected,
            "baud = {}, expected ~{}",
            det.baud(),
            expected
        );
    }

    #[test]
    fn test_baud_zero_before_first_window() {
        let mut det = ChannelDetector::new(&params(DetectorMode::NonlinearDiff)).unwrap();
        feed_pulse_train(&mut det, 16, WINDOW - 1);
        assert_eq!(det.baud(), 0.0);
    }

    #[test]
    fn test_silence_keeps_estimate_at_zero() {
        let mut det = ChannelDetector::new(&params(DetectorMode::NonlinearDiff)).unwrap();
        for _ in 0..2 * WINDOW {
            det.feed(Complex32::new(0.0, 0.0)).unwrap();
        }
        assert_eq!(det.baud(), 0.0);
    }

    #[test]
    fn test_front_end_tracks_input() {
        let mut det = ChannelDetector::new(&params(DetectorMode::Autocorrelation)).unwrap();
        for _ in 0..200 {
            det.feed(Complex32::new(1.0, 0.0)).unwrap();
        }
        // fc = 0, wide filter: the front end converges to the input level
        let s = det.last_window_sample();
        assert!((s.re - 1.0).abs() < 0.05, "front end sample: {}", s);
        assert!(s.im.abs() < 0.05);
    }

    #[test]
    fn test_rejects_non_finite() {
        let mut det = ChannelDetector::new(&params(DetectorMode::NonlinearDiff)).unwrap();
        assert_eq!(
            det.feed(Complex32::new(f32::NAN, 0.0)),
            Err(DspError::NonFinite)
        );
    }

    #[test]
    fn test_rejects_bad_channel() {
        let p = DetectorParams {
            bw: 0.0,
            ..params(DetectorMode::Autocorrelation)
        };
        assert!(ChannelDetector::new(&p).is_err());
    }
}
