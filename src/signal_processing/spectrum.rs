//! Spectral summary of conditioned blocks
//!
//! Optional output augmentation: a Hann-windowed FFT of each conditioned block,
//! reduced to the dominant frequency and classic EEG band powers.

use rustfft::{num_complex::Complex, FftPlanner};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::f64::consts::PI;

// Thread-local FFT planner so plans are cached per worker thread
thread_local! {
    static FFT_PLANNER: RefCell<FftPlanner<f64>> = RefCell::new(FftPlanner::new());
}

/// Absolute power per EEG band
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BandPower {
    /// 0.5 - 4 Hz
    pub delta: f64,
    /// 4 - 8 Hz
    pub theta: f64,
    /// 8 - 13 Hz
    pub alpha: f64,
    /// 13 - 30 Hz
    pub beta: f64,
    /// 30 - 45 Hz
    pub gamma: f64,
}

/// Spectral summary of one block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectrumSummary {
    pub dominant_hz: f64,
    pub frequency_resolution: f64,
    pub band_power: BandPower,
}

/// Compute the one-sided power spectrum of `signal` and summarize it.
///
/// Returns `None` for blocks too short to window (fewer than 4 samples).
pub fn summarize(signal: &[f32], sample_rate: f64) -> Option<SpectrumSummary> {
    let n = signal.len();
    if n < 4 || sample_rate <= 0.0 {
        return None;
    }

    let n_fft = n.next_power_of_two();
    let mean = signal.iter().map(|&x| x as f64).sum::<f64>() / n as f64;

    let mut input: Vec<Complex<f64>> = signal
        .iter()
        .enumerate()
        .map(|(i, &x)| {
            let window = 0.5 * (1.0 - (2.0 * PI * i as f64 / (n - 1) as f64).cos());
            Complex::new((x as f64 - mean) * window, 0.0)
        })
        .collect();
    input.resize(n_fft, Complex::new(0.0, 0.0));

    FFT_PLANNER.with(|planner| {
        let fft = planner.borrow_mut().plan_fft_forward(n_fft);
        fft.process(&mut input);
    });

    let n_positive = n_fft / 2 + 1;
    let resolution = sample_rate / n_fft as f64;
    let power: Vec<f64> = input[..n_positive]
        .iter()
        .map(|c| c.norm_sqr() / n_fft as f64)
        .collect();

    let dominant_bin = power
        .iter()
        .enumerate()
        .skip(1)
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
        .unwrap_or(0);

    let band = |low: f64, high: f64| -> f64 {
        power
            .iter()
            .enumerate()
            .filter(|(i, _)| {
                let f = *i as f64 * resolution;
                f >= low && f < high
            })
            .map(|(_, p)| p)
            .sum()
    };

    Some(SpectrumSummary {
        dominant_hz: dominant_bin as f64 * resolution,
        frequency_resolution: resolution,
        band_power: BandPower {
            delta: band(0.5, 4.0),
            theta: band(4.0, 8.0),
            alpha: band(8.0, 13.0),
            beta: band(13.0, 30.0),
            gamma: band(30.0, 45.0),
        },
    })
}
