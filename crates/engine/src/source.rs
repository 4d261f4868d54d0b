// Copyright 2025-2026 CEMAXECUTER LLC

//! Sample sources feeding the engine.
//!
//! A source runs on its own thread and broadcasts reference-counted blocks
//! of complex baseband samples to every worker's consumer channel.

use num_complex::Complex32;
use std::fs::File;
use std::io::{BufReader, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam::channel::Sender;

use crate::consumer::SampleBlock;

/// Default broadcast block size in complex samples. Inspectors also use this
/// as their detector window length.
pub const DEFAULT_BUFSIZ: usize = 4096;

/// Upstream sample producer.
pub trait SampleSource: Send {
    fn samp_rate(&self) -> f32;

    /// Produce blocks until exhausted or `running` clears. Send errors mean
    /// every consumer is gone and are a normal exit.
    fn run(&mut self, txs: &[Sender<SampleBlock>], running: &AtomicBool) -> Result<(), String>;
}

fn broadcast(txs: &[Sender<SampleBlock>], block: SampleBlock) -> bool {
    for tx in txs {
        if tx.send(Arc::clone(&block)).is_err() {
            return false;
        }
    }
    true
}

/// IQ sample format for file input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// Complex int8: pairs of i8
    Ci8,
    /// Complex int16: pairs of i16, little-endian
    Ci16,
    /// Complex float32: pairs of f32, little-endian
    Cf32,
}

impl SampleFormat {
    fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::Ci8 => 2,
            SampleFormat::Ci16 => 4,
            SampleFormat::Cf32 => 8,
        }
    }
}

/// IQ file reader: converts raw samples and broadcasts them in blocks.
pub struct FileSource {
    path: String,
    format: SampleFormat,
    samp_rate: f32,
    block_size: usize,
}

impl FileSource {
    pub fn new(path: impl Into<String>, format: SampleFormat, samp_rate: f32) -> Self {
        Self {
            path: path.into(),
            format,
            samp_rate,
            block_size: DEFAULT_BUFSIZ,
        }
    }

    pub fn set_block_size(&mut self, size: usize) {
        self.block_size = size;
    }

    fn convert(format: SampleFormat, raw: &[u8]) -> Vec<Complex32> {
        match format {
            SampleFormat::Ci8 => raw
                .chunks_exact(2)
                .map(|c| {
                    Complex32::new(
                        (c[0] as i8) as f32 / 128.0,
                        (c[1] as i8) as f32 / 128.0,
                    )
                })
                .collect(),
            SampleFormat::Ci16 => raw
                .chunks_exact(4)
                .map(|c| {
                    let i = i16::from_le_bytes([c[0], c[1]]);
                    let q = i16::from_le_bytes([c[2], c[3]]);
                    Complex32::new(i as f32 / 32768.0, q as f32 / 32768.0)
                })
                .collect(),
            SampleFormat::Cf32 => raw
                .chunks_exact(8)
                .map(|c| {
                    let i = f32::from_le_bytes([c[0], c[1], c[2], c[3]]);
                    let q = f32::from_le_bytes([c[4], c[5], c[6], c[7]]);
                    Complex32::new(i, q)
                })
                .collect(),
        }
    }
}

impl SampleSource for FileSource {
    fn samp_rate(&self) -> f32 {
        self.samp_rate
    }

    fn run(&mut self, txs: &[Sender<SampleBlock>], running: &AtomicBool) -> Result<(), String> {
        let file =
            File::open(&self.path).map_err(|e| format!("failed to open {}: {}", self.path, e))?;
        let mut reader = BufReader::with_capacity(1 << 20, file);

        log::info!(
            "reading IQ from {} ({:?}, {} Hz)",
            self.path,
            self.format,
            self.samp_rate
        );

        let chunk = self.block_size * self.format.bytes_per_sample();
        let mut raw = vec![0u8; chunk];

        while running.load(Ordering::Relaxed) {
            let n = reader
                .read(&mut raw)
                .map_err(|e| format!("read error on {}: {}", self.path, e))?;
            if n == 0 {
                log::info!("end of file: {}", self.path);
                break;
            }

            let usable = n - n % self.format.bytes_per_sample();
            let samples = Self::convert(self.format, &raw[..usable]);
            if samples.is_empty() {
                continue;
            }
            if !broadcast(txs, Arc::new(samples)) {
                break;
            }
        }

        Ok(())
    }
}

/// Synthetic BPSK source for demos and end-to-end checks: random symbols at
/// a fixed rate on a carrier offset, at unit amplitude.
pub struct ToneSource {
    samp_rate: f32,
    baud: f32,
    carrier_off: f32,
    amplitude: f32,
    block_size: usize,
    /// Total samples to emit; `None` streams until stopped.
    limit: Option<u64>,
}

impl ToneSource {
    pub fn new(samp_rate: f32, baud: f32, carrier_off: f32) -> Self {
        Self {
            samp_rate,
            baud,
            carrier_off,
            amplitude: 0.5,
            block_size: DEFAULT_BUFSIZ,
            limit: None,
        }
    }

    pub fn set_limit(&mut self, samples: u64) {
        self.limit = Some(samples);
    }
}

impl SampleSource for ToneSource {
    fn samp_rate(&self) -> f32 {
        self.samp_rate
    }

    fn run(&mut self, txs: &[Sender<SampleBlock>], running: &AtomicBool) -> Result<(), String> {
        if self.baud <= 0.0 || self.baud > self.samp_rate {
            return Err(format!("invalid synthetic baud rate: {}", self.baud));
        }

        let sym_period = self.samp_rate / self.baud;
        let omega = std::f32::consts::TAU * self.carrier_off / self.samp_rate;

        log::info!(
            "synthetic BPSK: {} baud, {} Hz offset at {} Hz",
            self.baud,
            self.carrier_off,
            self.samp_rate
        );

        let mut emitted: u64 = 0;
        let mut sym_clock = 0.0f32;
        let mut symbol = 1.0f32;
        let mut phase = 0.0f32;

        while running.load(Ordering::Relaxed) {
            if let Some(limit) = self.limit {
                if emitted >= limit {
                    break;
                }
            }

            let mut samples = Vec::with_capacity(self.block_size);
            for _ in 0..self.block_size {
                sym_clock += 1.0;
                if sym_clock >= sym_period {
                    sym_clock -= sym_period;
                    symbol = if rand::random::<bool>() { 1.0 } else { -1.0 };
                }
                let carrier = Complex32::from_polar(self.amplitude, phase);
                phase += omega;
                if phase >= std::f32::consts::TAU {
                    phase -= std::f32::consts::TAU;
                }
                samples.push(carrier * symbol);
            }

            emitted += samples.len() as u64;
            if !broadcast(txs, Arc::new(samples)) {
                break;
            }
        }

        Ok(())
    }
}

/// Endless zero samples; handy for exercising the control plane.
pub struct SilenceSource {
    samp_rate: f32,
    block_size: usize,
}

impl SilenceSource {
    pub fn new(samp_rate: f32) -> Self {
        Self {
            samp_rate,
            block_size: DEFAULT_BUFSIZ,
        }
    }
}

impl SampleSource for SilenceSource {
    fn samp_rate(&self) -> f32 {
        self.samp_rate
    }

    fn run(&mut self, txs: &[Sender<SampleBlock>], running: &AtomicBool) -> Result<(), String> {
        let block: SampleBlock = Arc::new(vec![Complex32::new(0.0, 0.0); self.block_size]);
        while running.load(Ordering::Relaxed) {
            if !broadcast(txs, Arc::clone(&block)) {
                break;
            }
        }
        Ok(())
    }
}
