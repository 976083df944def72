//! Digital Filter Implementations
//!
//! Implements IIR filters using second-order sections (biquads) for numerical stability.
//! Supports Butterworth highpass/lowpass and mains notch filters, applied either
//! causally (state carried between calls) or forward-backward (zero phase).

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use thiserror::Error;

/// Errors raised while designing or applying filters
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FilterError {
    #[error("filter output is not finite (non-finite value at sample {index})")]
    Unstable { index: usize },

    #[error("block of {len} samples is too short for zero-phase filtering (need more than {min})")]
    BlockTooShort { len: usize, min: usize },

    #[error("invalid filter configuration: {0}")]
    InvalidConfig(String),
}

pub type FilterResult<T> = Result<T, FilterError>;

/// Filter type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterType {
    Lowpass,
    Highpass,
    Notch,
}

/// Configuration for a single filter stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    pub filter_type: FilterType,
    /// Cutoff frequency in Hz (for lowpass/highpass) or center frequency (for notch)
    pub frequency: f64,
    /// Butterworth order (ignored for notch)
    pub order: usize,
    /// Quality factor (notch only)
    pub q_factor: f64,
    /// Sampling rate in Hz
    pub sample_rate: f64,
}

/// Second-order section (biquad) coefficients
/// Transfer function: H(z) = (b0 + b1*z^-1 + b2*z^-2) / (1 + a1*z^-1 + a2*z^-2)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiquadCoeffs {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

impl BiquadCoeffs {
    /// Both poles strictly inside the unit circle (stability triangle)
    pub fn is_stable(&self) -> bool {
        self.a2.abs() < 1.0 && self.a1.abs() < 1.0 + self.a2
    }
}

/// State for a single biquad section (Direct Form II Transposed)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BiquadState {
    z1: f64,
    z2: f64,
}

/// Single biquad filter section
#[derive(Debug, Clone)]
pub struct BiquadFilter {
    coeffs: BiquadCoeffs,
    state: BiquadState,
}

impl BiquadFilter {
    pub fn new(coeffs: BiquadCoeffs) -> Self {
        Self {
            coeffs,
            state: BiquadState::default(),
        }
    }

    pub fn coeffs(&self) -> &BiquadCoeffs {
        &self.coeffs
    }

    /// Process a single sample using Direct Form II Transposed
    #[inline]
    pub fn process(&mut self, input: f64) -> f64 {
        let output = self.coeffs.b0 * input + self.state.z1;
        self.state.z1 = self.coeffs.b1 * input - self.coeffs.a1 * output + self.state.z2;
        self.state.z2 = self.coeffs.b2 * input - self.coeffs.a2 * output;
        output
    }

    /// Reset filter state
    pub fn reset(&mut self) {
        self.state = BiquadState::default();
    }

    pub fn state(&self) -> &BiquadState {
        &self.state
    }
}

/// Cascaded second-order sections filter
#[derive(Debug, Clone)]
pub struct SosFilter {
    sections: Vec<BiquadFilter>,
    gain: f64,
}

impl SosFilter {
    pub fn new(sections: Vec<BiquadCoeffs>, gain: f64) -> Self {
        Self {
            sections: sections.into_iter().map(BiquadFilter::new).collect(),
            gain,
        }
    }

    pub fn sections(&self) -> &[BiquadFilter] {
        &self.sections
    }

    /// Process a single sample through all sections
    #[inline]
    pub fn process(&mut self, input: f64) -> f64 {
        let mut output = input * self.gain;
        for section in &mut self.sections {
            output = section.process(output);
        }
        output
    }

    /// Process an entire signal array in-place, carrying state
    pub fn process_signal(&mut self, signal: &mut [f64]) {
        for sample in signal.iter_mut() {
            *sample = self.process(*sample);
        }
    }

    /// Process a signal and return a new array (input unchanged)
    pub fn filter(&mut self, signal: &[f64]) -> Vec<f64> {
        signal.iter().map(|&s| self.process(s)).collect()
    }

    /// Odd-extension length used by [`filtfilt`](Self::filtfilt)
    pub fn padlen(&self) -> usize {
        3 * (2 * self.sections.len() + 1)
    }

    /// Zero-phase forward-backward filtering.
    ///
    /// Runs on a fresh zero-state copy of the sections; the streaming state of
    /// `self` is left untouched. The signal is odd-extended by [`padlen`](Self::padlen)
    /// samples at each end to absorb start-up transients, so it must be longer
    /// than that.
    pub fn filtfilt(&self, signal: &[f64]) -> FilterResult<Vec<f64>> {
        let pad = self.padlen();
        let n = signal.len();
        if n <= pad {
            return Err(FilterError::BlockTooShort { len: n, min: pad });
        }

        let first = signal[0];
        let last = signal[n - 1];
        let mut extended = Vec::with_capacity(n + 2 * pad);
        extended.extend((1..=pad).rev().map(|i| 2.0 * first - signal[i]));
        extended.extend_from_slice(signal);
        extended.extend((1..=pad).map(|i| 2.0 * last - signal[n - 1 - i]));

        let mut fresh = self.clone();
        fresh.reset();
        fresh.process_signal(&mut extended);

        extended.reverse();
        fresh.reset();
        fresh.process_signal(&mut extended);
        extended.reverse();

        Ok(extended[pad..pad + n].to_vec())
    }

    /// Reset all section states
    pub fn reset(&mut self) {
        for section in &mut self.sections {
            section.reset();
        }
    }
}

/// Butterworth filter designer
pub struct ButterworthFilter;

impl ButterworthFilter {
    /// Design a Butterworth lowpass filter
    pub fn lowpass(cutoff: f64, sample_rate: f64, order: usize) -> SosFilter {
        let wn = Self::prewarp(cutoff, sample_rate);
        SosFilter::new(Self::design_lowpass(wn, order), 1.0)
    }

    /// Design a Butterworth highpass filter
    pub fn highpass(cutoff: f64, sample_rate: f64, order: usize) -> SosFilter {
        let wn = Self::prewarp(cutoff, sample_rate);
        SosFilter::new(Self::design_highpass(wn, order), 1.0)
    }

    /// Prewarp frequency for bilinear transform
    fn prewarp(freq: f64, sample_rate: f64) -> f64 {
        (PI * freq / sample_rate).tan()
    }

    /// Damping term of the k-th conjugate pole pair: s^2 + d*s + 1
    fn damping(k: usize, order: usize) -> f64 {
        2.0 * (PI * (2.0 * k as f64 + 1.0) / (2.0 * order as f64)).sin()
    }

    /// Design lowpass second-order sections
    fn design_lowpass(wn: f64, order: usize) -> Vec<BiquadCoeffs> {
        let num_sections = (order + 1) / 2;
        let mut sections = Vec::with_capacity(num_sections);

        for k in 0..num_sections {
            // For odd order, last section is first-order: H(s) = wn / (s + wn)
            if order % 2 == 1 && k == num_sections - 1 {
                let k_coeff = wn / (1.0 + wn);
                sections.push(BiquadCoeffs {
                    b0: k_coeff,
                    b1: k_coeff,
                    b2: 0.0,
                    a1: (wn - 1.0) / (wn + 1.0),
                    a2: 0.0,
                });
            } else {
                let d = Self::damping(k, order);
                let wn2 = wn * wn;
                let denom = 1.0 + d * wn + wn2;

                sections.push(BiquadCoeffs {
                    b0: wn2 / denom,
                    b1: 2.0 * wn2 / denom,
                    b2: wn2 / denom,
                    a1: 2.0 * (wn2 - 1.0) / denom,
                    a2: (1.0 - d * wn + wn2) / denom,
                });
            }
        }

        sections
    }

    /// Design highpass second-order sections
    fn design_highpass(wn: f64, order: usize) -> Vec<BiquadCoeffs> {
        let num_sections = (order + 1) / 2;
        let mut sections = Vec::with_capacity(num_sections);

        for k in 0..num_sections {
            if order % 2 == 1 && k == num_sections - 1 {
                // First-order highpass: H(s) = s / (s + wn)
                let k_coeff = 1.0 / (1.0 + wn);
                sections.push(BiquadCoeffs {
                    b0: k_coeff,
                    b1: -k_coeff,
                    b2: 0.0,
                    a1: (wn - 1.0) / (wn + 1.0),
                    a2: 0.0,
                });
            } else {
                let d = Self::damping(k, order);
                let wn2 = wn * wn;
                let denom = 1.0 + d * wn + wn2;

                sections.push(BiquadCoeffs {
                    b0: 1.0 / denom,
                    b1: -2.0 / denom,
                    b2: 1.0 / denom,
                    a1: 2.0 * (wn2 - 1.0) / denom,
                    a2: (1.0 - d * wn + wn2) / denom,
                });
            }
        }

        sections
    }
}

/// Notch (band-reject) filter for removing mains interference
pub struct NotchFilter;

impl NotchFilter {
    /// Design a second-order IIR notch
    ///
    /// # Arguments
    /// * `center_freq` - Frequency to remove (Hz)
    /// * `sample_rate` - Sampling rate (Hz)
    /// * `q_factor` - Quality factor (higher = narrower notch, typical: 30)
    pub fn design(center_freq: f64, sample_rate: f64, q_factor: f64) -> SosFilter {
        let w0 = 2.0 * PI * center_freq / sample_rate;
        let bandwidth = w0 / q_factor;
        let gain = 1.0 / (1.0 + (bandwidth / 2.0).tan());
        let cos_w0 = w0.cos();

        let coeffs = BiquadCoeffs {
            b0: gain,
            b1: -2.0 * gain * cos_w0,
            b2: gain,
            a1: -2.0 * gain * cos_w0,
            a2: 2.0 * gain - 1.0,
        };

        SosFilter::new(vec![coeffs], 1.0)
    }
}

/// Create a filter from configuration
pub fn create_filter(config: &FilterConfig) -> FilterResult<SosFilter> {
    let nyquist = config.sample_rate / 2.0;

    if config.sample_rate <= 0.0 {
        return Err(FilterError::InvalidConfig(format!(
            "Sample rate must be positive, got {}",
            config.sample_rate
        )));
    }

    if config.frequency <= 0.0 || config.frequency >= nyquist {
        return Err(FilterError::InvalidConfig(format!(
            "{:?} frequency ({} Hz) must be between 0 and Nyquist ({} Hz)",
            config.filter_type, config.frequency, nyquist
        )));
    }

    match config.filter_type {
        FilterType::Lowpass | FilterType::Highpass if config.order == 0 => Err(
            FilterError::InvalidConfig("Butterworth order must be at least 1".to_string()),
        ),
        FilterType::Lowpass => Ok(ButterworthFilter::lowpass(
            config.frequency,
            config.sample_rate,
            config.order,
        )),
        FilterType::Highpass => Ok(ButterworthFilter::highpass(
            config.frequency,
            config.sample_rate,
            config.order,
        )),
        FilterType::Notch => {
            if config.q_factor <= 0.0 {
                return Err(FilterError::InvalidConfig(format!(
                    "Notch Q factor must be positive, got {}",
                    config.q_factor
                )));
            }
            Ok(NotchFilter::design(
                config.frequency,
                config.sample_rate,
                config.q_factor,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rms(signal: &[f64]) -> f64 {
        (signal.iter().map(|x| x * x).sum::<f64>() / signal.len() as f64).sqrt()
    }

    fn sine(freq: f64, sample_rate: f64, n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| (2.0 * PI * freq * i as f64 / sample_rate).sin())
            .collect()
    }

    #[test]
    fn test_lowpass_filter() {
        let mut filter = ButterworthFilter::lowpass(10.0, 100.0, 2);

        // DC should pass through once the transient settles
        let out = filter.filter(&vec![1.0; 200]);
        assert!((out[199] - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_highpass_removes_dc() {
        let mut filter = ButterworthFilter::highpass(1.0, 250.0, 2);
        let out = filter.filter(&vec![5.0; 2500]);
        assert!(out[2499].abs() < 1e-3, "residual DC {}", out[2499]);
    }

    #[test]
    fn test_designed_sections_are_stable() {
        for order in 1..=6 {
            for filter in [
                ButterworthFilter::lowpass(40.0, 250.0, order),
                ButterworthFilter::highpass(0.5, 250.0, order),
            ] {
                assert_eq!(filter.sections().len(), (order + 1) / 2);
                for section in filter.sections() {
                    assert!(section.coeffs().is_stable(), "order {} unstable", order);
                }
            }
        }
        let notch = NotchFilter::design(50.0, 250.0, 30.0);
        assert!(notch.sections()[0].coeffs().is_stable());
    }

    #[test]
    fn test_notch_filter() {
        let sample_rate = 250.0;
        let notch_freq = 50.0;
        let mut filter = NotchFilter::design(notch_freq, sample_rate, 30.0);

        let signal = sine(notch_freq, sample_rate, 2500);
        let filtered = filter.filter(&signal);

        // Skip the settling transient
        let input_rms = rms(&signal[1250..]);
        let output_rms = rms(&filtered[1250..]);

        assert!(
            output_rms < input_rms * 0.1,
            "Notch filter should attenuate 50Hz"
        );
    }

    #[test]
    fn test_notch_passes_alpha_band() {
        let mut filter = NotchFilter::design(50.0, 250.0, 30.0);
        let signal = sine(10.0, 250.0, 2500);
        let filtered = filter.filter(&signal);
        let ratio = rms(&filtered[1250..]) / rms(&signal[1250..]);
        assert!((ratio - 1.0).abs() < 0.02, "10 Hz gain {}", ratio);
    }

    #[test]
    fn test_filtfilt_has_no_phase_lag() {
        let filter = ButterworthFilter::lowpass(40.0, 250.0, 2);
        let signal = sine(5.0, 250.0, 500);
        let filtered = filter.filtfilt(&signal).unwrap();

        // Zero phase: the passband sine stays in place sample for sample
        let max_err = signal[50..450]
            .iter()
            .zip(&filtered[50..450])
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max);
        assert!(max_err < 0.02, "max error {}", max_err);
    }

    #[test]
    fn test_filtfilt_rejects_short_block() {
        let filter = ButterworthFilter::lowpass(40.0, 250.0, 2);
        let result = filter.filtfilt(&[1.0; 9]);
        assert_eq!(result, Err(FilterError::BlockTooShort { len: 9, min: 9 }));
    }

    #[test]
    fn test_create_filter_validates_cutoff() {
        let config = FilterConfig {
            filter_type: FilterType::Lowpass,
            frequency: 200.0,
            order: 2,
            q_factor: 30.0,
            sample_rate: 250.0,
        };
        assert!(matches!(
            create_filter(&config),
            Err(FilterError::InvalidConfig(_))
        ));
    }
}
