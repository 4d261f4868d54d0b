// Copyright 2025-2026 CEMAXECUTER LLC

//! Per-channel inspector: carrier recovery, AGC and symbol sampling.

use num_complex::Complex32;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use rk_dsp::agc::{Agc, AgcParams};
use rk_dsp::costas::{Costas, CostasKind};
use rk_dsp::detect::{ChannelDetector, DetectorMode, DetectorParams};
use rk_dsp::nco::Nco;
use rk_dsp::sampling::{abs2norm_baud, abs2norm_freq};
use rk_dsp::DspError;

use crate::consumer::TaskState;
use crate::msg::{Message, SampleBatchMsg};
use crate::worker::{WorkerContext, WorkerTask};

/// Index into the analyzer's inspector table. Stable for the process
/// lifetime; -1 is the never-valid sentinel.
pub type Handle = i32;

/// Spectral region an inspector operates on.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Channel {
    /// Center frequency, Hz.
    pub fc: f32,
    /// Bandwidth, Hz.
    pub bw: f32,
}

/// Carrier recovery variant applied after the mixer and AGC.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CarrierControl {
    /// Fixed offset and phase only (the NCO and rotor do all the work).
    #[default]
    Manual,
    /// BPSK Costas loop.
    Costas2,
    /// QPSK Costas loop.
    Costas4,
}

/// User-tunable inspector configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InspectorParams {
    /// Client-assigned label echoed in every outbound message.
    pub inspector_id: u32,
    pub fc_ctrl: CarrierControl,
    /// Additional carrier offset, Hz.
    pub fc_off: f32,
    /// Static carrier phase rotation, radians.
    pub fc_phi: f32,
    /// Expected baud rate, Hz; 0 disables the symbol sampler.
    pub baud: f32,
    /// Sampling phase within a symbol, in [0, 1).
    pub sym_phase: f32,
}

impl Default for InspectorParams {
    fn default() -> Self {
        Self {
            inspector_id: 0,
            fc_ctrl: CarrierControl::Manual,
            fc_off: 0.0,
            fc_phi: 0.0,
            baud: 0.0,
            sym_phase: 0.0,
        }
    }
}

/// Baud estimates from the two blind detectors.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BaudRateInfo {
    /// Autocorrelation estimate, Hz.
    pub fac: f32,
    /// Nonlinear-diff estimate, Hz.
    pub nln: f32,
}

/// Inspector lifecycle. Transitions are strictly monotonic.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InspectorState {
    Created = 0,
    Running = 1,
    Halting = 2,
    Halted = 3,
}

impl InspectorState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => InspectorState::Created,
            1 => InspectorState::Running,
            2 => InspectorState::Halting,
            _ => InspectorState::Halted,
        }
    }
}

/// Cross-thread half of an inspector. The analyzer's table holds this; the
/// DSP state itself travels with the worker task.
pub struct InspectorShared {
    state: AtomicU8,
    tuning: Mutex<Tuning>,
    info: Mutex<BaudRateInfo>,
}

struct Tuning {
    params: InspectorParams,
    generation: u64,
}

impl InspectorShared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(InspectorState::Created as u8),
            tuning: Mutex::new(Tuning {
                params: InspectorParams::default(),
                generation: 0,
            }),
            info: Mutex::new(BaudRateInfo::default()),
        })
    }

    pub fn state(&self) -> InspectorState {
        InspectorState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Advance the lifecycle. `fetch_max` keeps the transition monotonic no
    /// matter how analyzer and worker race.
    pub fn advance_state(&self, state: InspectorState) {
        self.state.fetch_max(state as u8, Ordering::AcqRel);
    }

    pub fn params(&self) -> InspectorParams {
        self.tuning.lock().unwrap().params
    }

    /// Publish new params; the worker picks them up on its next pass.
    pub fn update_params(&self, params: &InspectorParams) {
        let mut tuning = self.tuning.lock().unwrap();
        tuning.params = *params;
        tuning.generation += 1;
    }

    pub fn info(&self) -> BaudRateInfo {
        *self.info.lock().unwrap()
    }
}

/* Spike durations as fractions of the symbol period */
const FAST_RISE_FRAC: f32 = 3.9062e-1;
const FAST_FALL_FRAC: f32 = 2.0 * FAST_RISE_FRAC;
const SLOW_RISE_FRAC: f32 = 10.0 * FAST_RISE_FRAC;
const SLOW_FALL_FRAC: f32 = 10.0 * FAST_FALL_FRAC;
const HANG_MAX_FRAC: f32 = 0.19531;
const DELAY_LINE_FRAC: f32 = 0.39072;
const MAG_HISTORY_FRAC: f32 = 0.39072;

/// Smoothing coefficient handed to both channel detectors.
const DETECTOR_ALPHA: f32 = 1e-4;

/// Per-channel processing pipeline.
///
/// Owned by its worker task once registered; everything the analyzer thread
/// needs lives in [`InspectorShared`].
pub struct Inspector {
    shared: Arc<InspectorShared>,
    fac_baud_det: ChannelDetector,
    nln_baud_det: ChannelDetector,
    lo: Nco,
    phase: Complex32,
    agc: Agc,
    costas_2: Costas,
    costas_4: Costas,
    params: InspectorParams,
    applied_generation: u64,
    /// Samples per symbol; 0 disables the sampler.
    sym_period: f32,
    /// Accumulator in [0, sym_period).
    sym_phase: f32,
    sym_last_sample: Complex32,
    sym_sampler_output: Complex32,
    /// Set exactly when the sampler fired during the last `feed_bulk`.
    sym_new_sample: bool,
    pub(crate) task_state: TaskState,
}

impl Inspector {
    /// Build the full pipeline for `channel` on a stream at `samp_rate`.
    pub fn new(samp_rate: f32, channel: &Channel, window_size: usize) -> Result<Self, DspError> {
        let mut det_params = DetectorParams {
            mode: DetectorMode::Autocorrelation,
            samp_rate,
            fc: channel.fc,
            bw: channel.bw,
            window_size,
            alpha: DETECTOR_ALPHA,
        };

        let fac_baud_det = ChannelDetector::new(&det_params)?;
        det_params.mode = DetectorMode::NonlinearDiff;
        let nln_baud_det = ChannelDetector::new(&det_params)?;

        // Samples per symbol at the channel's nominal rate
        let tau = samp_rate / channel.bw;

        let agc_params = AgcParams {
            fast_rise_t: tau * FAST_RISE_FRAC,
            fast_fall_t: tau * FAST_FALL_FRAC,
            slow_rise_t: tau * SLOW_RISE_FRAC,
            slow_fall_t: tau * SLOW_FALL_FRAC,
            hang_max: tau * HANG_MAX_FRAC,
            delay_line_size: (tau * DELAY_LINE_FRAC).round() as usize,
            mag_history_size: (tau * MAG_HISTORY_FRAC).round() as usize,
            ..AgcParams::default()
        };
        let agc = Agc::new(&agc_params)?;

        let omega = abs2norm_freq(samp_rate, channel.bw);
        let costas_2 = Costas::new(CostasKind::Bpsk, 0.0, omega, 3, 1e-2 * omega)?;
        let costas_4 = Costas::new(CostasKind::Qpsk, 0.0, omega, 3, 1e-2 * omega)?;

        Ok(Self {
            shared: InspectorShared::new(),
            fac_baud_det,
            nln_baud_det,
            lo: Nco::new(0.0),
            phase: Complex32::new(1.0, 0.0),
            agc,
            costas_2,
            costas_4,
            params: InspectorParams::default(),
            applied_generation: 0,
            sym_period: 0.0,
            sym_phase: 0.0,
            sym_last_sample: Complex32::new(0.0, 0.0),
            sym_sampler_output: Complex32::new(0.0, 0.0),
            sym_new_sample: false,
            task_state: TaskState::default(),
        })
    }

    pub fn shared(&self) -> Arc<InspectorShared> {
        Arc::clone(&self.shared)
    }

    pub fn params(&self) -> &InspectorParams {
        &self.params
    }

    pub fn sym_period(&self) -> f32 {
        self.sym_period
    }

    pub fn sym_new_sample(&self) -> bool {
        self.sym_new_sample
    }

    pub fn sym_sampler_output(&self) -> Complex32 {
        self.sym_sampler_output
    }

    /// Unit-magnitude static carrier rotation.
    pub fn carrier_phase(&self) -> Complex32 {
        self.phase
    }

    /// Apply a new parameter set: derive the symbol period, retune the local
    /// oscillator and rebuild the phase rotor.
    pub fn set_params(&mut self, params: &InspectorParams) {
        self.params = *params;
        let fs = self.fac_baud_det.params().samp_rate;

        self.sym_period = if params.baud > 0.0 {
            1.0 / abs2norm_baud(fs, params.baud)
        } else {
            0.0
        };

        self.lo.set_freq(abs2norm_freq(fs, params.fc_off));
        self.phase = Complex32::from_polar(1.0, params.fc_phi);
    }

    /// Pull pending params published by the analyzer, if any.
    fn sync_params(&mut self) {
        let pending = {
            let tuning = self.shared.tuning.lock().unwrap();
            if tuning.generation == self.applied_generation {
                return;
            }
            self.applied_generation = tuning.generation;
            tuning.params
        };
        self.set_params(&pending);
    }

    /// Push the current baud estimates where the analyzer can read them.
    fn publish_info(&self) {
        *self.shared.info.lock().unwrap() = BaudRateInfo {
            fac: self.fac_baud_det.baud(),
            nln: self.nln_baud_det.baud(),
        };
    }

    /// Run the per-sample pipeline over `samples`, stopping as soon as one
    /// symbol sample has been produced. Returns the number of input samples
    /// consumed; on exit [`sym_new_sample`](Self::sym_new_sample) tells
    /// whether [`sym_sampler_output`](Self::sym_sampler_output) is fresh.
    pub fn feed_bulk(&mut self, samples: &[Complex32]) -> Result<usize, DspError> {
        let target = self.params.sym_phase * self.sym_period;
        self.sym_new_sample = false;

        let mut consumed = 0;
        for &x in samples {
            // Both detectors window the raw stream; the autocorrelation
            // detector's front end doubles as the channel filter.
            self.fac_baud_det.feed(x)?;
            self.nln_baud_det.feed(x)?;

            let mut det_x = self.fac_baud_det.last_window_sample();

            // Carrier mixing: offset NCO plus static rotation
            det_x = det_x * self.lo.read().conj() * self.phase;
            det_x = self.agc.feed(det_x) * (2.0 * std::f32::consts::SQRT_2);

            let sample = match self.params.fc_ctrl {
                CarrierControl::Manual => det_x,
                CarrierControl::Costas2 => {
                    self.costas_2.feed(det_x);
                    self.costas_2.y
                }
                CarrierControl::Costas4 => {
                    self.costas_4.feed(det_x);
                    self.costas_4.y
                }
            };

            if self.sym_period >= 1.0 {
                self.sym_phase += 1.0;
                if self.sym_phase >= self.sym_period {
                    self.sym_phase -= self.sym_period;
                }

                self.sym_new_sample = (self.sym_phase - target).floor() as i32 == 0;
                if self.sym_new_sample {
                    let alpha = self.sym_phase - self.sym_phase.floor();
                    self.sym_sampler_output =
                        (self.sym_last_sample * (1.0 - alpha) + sample * alpha) * 0.5;
                }
            }

            self.sym_last_sample = sample;
            consumed += 1;

            if self.sym_new_sample {
                break;
            }
        }

        Ok(consumed)
    }
}

/// Worker-side driver for one inspector: returns true to stay scheduled,
/// false to be dropped.
pub(crate) struct InspectorTask {
    insp: Inspector,
}

impl InspectorTask {
    pub fn new(insp: Inspector) -> Self {
        Self { insp }
    }

    fn pass(insp: &mut Inspector, ctx: &mut WorkerContext<'_>) -> bool {
        if insp.shared.state() == InspectorState::Halting {
            return false;
        }

        insp.sync_params();

        let Some((block, mut offset)) = ctx.consumer.assert_samples(&mut insp.task_state) else {
            // Stream is gone; unschedule.
            return false;
        };

        let mut batch: Option<SampleBatchMsg> = None;
        while offset < block.len() {
            let fed = match insp.feed_bulk(&block[offset..]) {
                Ok(fed) => fed,
                Err(e) => {
                    log::warn!(
                        "inspector {}: feed failed: {}",
                        insp.params.inspector_id,
                        e
                    );
                    return false;
                }
            };

            if insp.sym_new_sample {
                batch
                    .get_or_insert_with(|| SampleBatchMsg::new(insp.params.inspector_id))
                    .push(insp.sym_sampler_output);
            }

            insp.task_state.advance(fed);
            offset += fed;
        }

        insp.publish_info();

        if let Some(batch) = batch {
            ctx.mq_out.write(Message::Samples(batch));
        }

        true
    }
}

impl WorkerTask for InspectorTask {
    fn process(&mut self, ctx: &mut WorkerContext<'_>) -> bool {
        if !self.insp.task_state.is_bound() {
            ctx.consumer.add_task(&mut self.insp.task_state);
        }

        let restart = Self::pass(&mut self.insp, ctx);
        if !restart {
            self.insp.shared.advance_state(InspectorState::Halted);
            ctx.consumer.remove_task(&mut self.insp.task_state);
        }
        restart
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FS: f32 = 10_000.0;
    const WINDOW: usize = 1024;

    fn channel() -> Channel {
        Channel {
            fc: 0.0,
            bw: 1000.0,
        }
    }

    fn inspector() -> Inspector {
        Inspector::new(FS, &channel(), WINDOW).unwrap()
    }

    fn ones(n: usize) -> Vec<Complex32> {
        vec![Complex32::new(1.0, 0.0); n]
    }

    #[test]
    fn test_new_starts_created_with_sampler_off() {
        let insp = inspector();
        assert_eq!(insp.shared.state(), InspectorState::Created);
        assert_eq!(insp.sym_period(), 0.0);
        assert_eq!(insp.carrier_phase(), Complex32::new(1.0, 0.0));
    }

    #[test]
    fn test_new_rejects_bad_channel() {
        let bad = Channel { fc: 0.0, bw: 0.0 };
        assert!(Inspector::new(FS, &bad, WINDOW).is_err());
    }

    #[test]
    fn test_set_params_derives_symbol_period() {
        let mut insp = inspector();
        insp.set_params(&InspectorParams {
            baud: 1000.0,
            ..InspectorParams::default()
        });
        assert!((insp.sym_period() - 10.0).abs() < 1e-4);

        insp.set_params(&InspectorParams::default());
        assert_eq!(insp.sym_period(), 0.0);
    }

    #[test]
    fn test_set_params_phase_is_unit_magnitude() {
        let mut insp = inspector();
        for phi in [0.0f32, 0.5, -2.5, 3.14] {
            insp.set_params(&InspectorParams {
                fc_phi: phi,
                ..InspectorParams::default()
            });
            assert!((insp.carrier_phase().norm() - 1.0).abs() < 1e-5);
            assert!((insp.carrier_phase().arg() - phi).abs() < 1e-5);
        }
    }

    #[test]
    fn test_feed_bulk_empty_input() {
        let mut insp = inspector();
        assert_eq!(insp.feed_bulk(&[]).unwrap(), 0);
        assert!(!insp.sym_new_sample());
    }

    #[test]
    fn test_sampler_disabled_below_one_sample_per_symbol() {
        let mut insp = inspector();
        // More than one symbol per sample: sampler stays off
        insp.set_params(&InspectorParams {
            baud: 2.0 * FS,
            ..InspectorParams::default()
        });
        assert!(insp.sym_period() < 1.0);

        let consumed = insp.feed_bulk(&ones(64)).unwrap();
        assert_eq!(consumed, 64);
        assert!(!insp.sym_new_sample());
    }

    #[test]
    fn test_sampler_fires_once_per_symbol_period() {
        let mut insp = inspector();
        insp.set_params(&InspectorParams {
            baud: 1000.0, // sym_period = 10
            ..InspectorParams::default()
        });

        let samples = ones(25);
        let mut offset = 0;
        let mut emitted = 0;
        let mut calls = Vec::new();
        while offset < samples.len() {
            let fed = insp.feed_bulk(&samples[offset..]).unwrap();
            calls.push((fed, insp.sym_new_sample()));
            if insp.sym_new_sample() {
                emitted += 1;
            }
            offset += fed;
        }

        // Two symbols out of 25 samples at 10 samples/symbol
        assert_eq!(emitted, 2);
        assert_eq!(calls[0], (10, true));
        assert_eq!(calls[1], (10, true));
        assert_eq!(calls[2], (5, false));
    }

    #[test]
    fn test_sampler_respects_sampling_phase() {
        let mut insp = inspector();
        insp.set_params(&InspectorParams {
            baud: 1000.0,
            sym_phase: 0.5, // fire mid-symbol
            ..InspectorParams::default()
        });

        let fed = insp.feed_bulk(&ones(25)).unwrap();
        // target = 5 samples into the period
        assert_eq!(fed, 5);
        assert!(insp.sym_new_sample());
    }

    #[test]
    fn test_feed_bulk_rejects_non_finite() {
        let mut insp = inspector();
        let bad = vec![Complex32::new(f32::NAN, 0.0)];
        assert!(insp.feed_bulk(&bad).is_err());
    }

    #[test]
    fn test_pending_params_apply_on_sync() {
        let mut insp = inspector();
        let shared = insp.shared();
        shared.update_params(&InspectorParams {
            inspector_id: 9,
            baud: 500.0,
            ..InspectorParams::default()
        });

        assert_eq!(insp.sym_period(), 0.0);
        insp.sync_params();
        assert!((insp.sym_period() - 20.0).abs() < 1e-4);
        assert_eq!(insp.params().inspector_id, 9);
    }

    #[test]
    fn test_state_transitions_are_monotonic() {
        let insp = inspector();
        let shared = insp.shared();
        shared.advance_state(InspectorState::Running);
        shared.advance_state(InspectorState::Halting);
        // Trying to go backwards is a no-op
        shared.advance_state(InspectorState::Running);
        assert_eq!(shared.state(), InspectorState::Halting);
        shared.advance_state(InspectorState::Halted);
        assert_eq!(shared.state(), InspectorState::Halted);
    }
}
