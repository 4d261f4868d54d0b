//! Frequency and baud normalization helpers.
//!
//! Frequencies are normalized against the Nyquist rate (so 1.0 means
//! `samp_rate / 2`), baud rates against the sample rate (so 1.0 means one
//! symbol per sample). Angular frequency is radians per sample.

use std::f32::consts::PI;

/// Absolute frequency in Hz to Nyquist-normalized frequency.
#[inline]
pub fn abs2norm_freq(samp_rate: f32, freq: f32) -> f32 {
    2.0 * freq / samp_rate
}

/// Nyquist-normalized frequency back to absolute Hz.
#[inline]
pub fn norm2abs_freq(samp_rate: f32, freq_norm: f32) -> f32 {
    0.5 * freq_norm * samp_rate
}

/// Absolute baud rate to symbols per sample.
#[inline]
pub fn abs2norm_baud(samp_rate: f32, baud: f32) -> f32 {
    baud / samp_rate
}

/// Nyquist-normalized frequency to angular frequency (radians/sample).
#[inline]
pub fn norm2ang_freq(freq_norm: f32) -> f32 {
    PI * freq_norm
}
