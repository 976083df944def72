//! Conditioning cascade
//!
//! Fixed-order chain of high-pass -> mains notch -> low-pass applied to the
//! re-referenced signal. Coefficients are designed once, when the cascade is
//! built for a session's sample rate, and reused for every block.

use super::filters::{create_filter, FilterConfig, FilterError, FilterResult, FilterType, SosFilter};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::warn;

/// How the cascade is applied to successive blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    /// Streaming recurrence with state carried across blocks (small constant phase delay)
    Causal,
    /// Forward-backward per block with fresh state (no phase distortion)
    ZeroPhase,
    /// No filtering (raw re-referenced output)
    Bypass,
}

impl Default for FilterMode {
    fn default() -> Self {
        Self::Causal
    }
}

impl FromStr for FilterMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.trim().to_lowercase()))
            .map_err(|_| format!("unknown filter mode '{}' (causal, zero_phase, bypass)", s))
    }
}

/// Cascade parameters, independent of the sample rate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadeConfig {
    pub mode: FilterMode,

    #[serde(default = "default_highpass")]
    pub highpass_hz: f64,

    #[serde(default = "default_lowpass")]
    pub lowpass_hz: f64,

    /// Butterworth order for the high- and low-pass stages
    #[serde(default = "default_order")]
    pub order: usize,

    /// Local mains frequency (50 or 60 Hz)
    #[serde(default = "default_mains")]
    pub mains_hz: f64,

    #[serde(default = "default_notch_q")]
    pub notch_q: f64,
}

fn default_highpass() -> f64 {
    1.0
}
fn default_lowpass() -> f64 {
    40.0
}
fn default_order() -> usize {
    2
}
fn default_mains() -> f64 {
    50.0
}
fn default_notch_q() -> f64 {
    30.0
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            mode: FilterMode::Causal,
            highpass_hz: default_highpass(),
            lowpass_hz: default_lowpass(),
            order: default_order(),
            mains_hz: default_mains(),
            notch_q: default_notch_q(),
        }
    }
}

/// Output of one cascade pass
#[derive(Debug, Clone, PartialEq)]
pub struct FilteredBlock {
    pub samples: Vec<f32>,
    /// Set when the block was passed through unfiltered
    pub degraded: bool,
}

/// Per-session filter bank with its streaming state
#[derive(Debug, Clone)]
pub struct FilterCascade {
    mode: FilterMode,
    sample_rate: f64,
    stages: Vec<(FilterType, SosFilter)>,
}

impl FilterCascade {
    /// Design the cascade for a fixed sample rate
    pub fn new(config: &CascadeConfig, sample_rate: f64) -> FilterResult<Self> {
        let nyquist = sample_rate / 2.0;
        if config.mode != FilterMode::Bypass && config.highpass_hz >= config.lowpass_hz {
            return Err(FilterError::InvalidConfig(format!(
                "High-pass cutoff ({} Hz) must be below low-pass cutoff ({} Hz)",
                config.highpass_hz, config.lowpass_hz
            )));
        }

        let stages = if config.mode == FilterMode::Bypass {
            Vec::new()
        } else {
            let specs = [
                (FilterType::Highpass, config.highpass_hz),
                (FilterType::Notch, config.mains_hz),
                (FilterType::Lowpass, config.lowpass_hz),
            ];
            let mut stages = Vec::with_capacity(specs.len());
            for (filter_type, frequency) in specs {
                let filter = create_filter(&FilterConfig {
                    filter_type,
                    frequency,
                    order: config.order,
                    q_factor: config.notch_q,
                    sample_rate,
                })
                .map_err(|e| match e {
                    FilterError::InvalidConfig(msg) => FilterError::InvalidConfig(format!(
                        "{} (Nyquist {} Hz)",
                        msg, nyquist
                    )),
                    other => other,
                })?;
                stages.push((filter_type, filter));
            }
            stages
        };

        Ok(Self {
            mode: config.mode,
            sample_rate,
            stages,
        })
    }

    pub fn mode(&self) -> FilterMode {
        self.mode
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Shortest block that can be filtered in zero-phase mode
    pub fn min_block_len(&self) -> usize {
        self.stages
            .iter()
            .map(|(_, filter)| filter.padlen() + 1)
            .max()
            .unwrap_or(1)
    }

    /// Filter one block.
    ///
    /// Non-finite output discards the block with [`FilterError::Unstable`]; in
    /// causal mode the poisoned delay registers are zeroed so the following
    /// block starts from a clean state.
    pub fn process(&mut self, input: &[f32]) -> FilterResult<FilteredBlock> {
        let mut signal: Vec<f64> = input.iter().map(|&x| x as f64).collect();
        let mut degraded = false;

        match self.mode {
            FilterMode::Bypass => {}
            FilterMode::Causal => {
                for (_, filter) in &mut self.stages {
                    filter.process_signal(&mut signal);
                }
            }
            FilterMode::ZeroPhase => {
                for (filter_type, filter) in &self.stages {
                    match filter.filtfilt(&signal) {
                        Ok(filtered) => signal = filtered,
                        Err(FilterError::BlockTooShort { len, min }) => {
                            warn!(
                                "Zero-phase {:?} stage skipped: block of {} samples needs more than {}; passing through unfiltered",
                                filter_type, len, min
                            );
                            degraded = true;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        let samples: Vec<f32> = signal.iter().map(|&x| x as f32).collect();
        if let Some(index) = samples.iter().position(|x| !x.is_finite()) {
            self.reset();
            return Err(FilterError::Unstable { index });
        }

        Ok(FilteredBlock { samples, degraded })
    }

    /// Zero all streaming state
    pub fn reset(&mut self) {
        for (_, filter) in &mut self.stages {
            filter.reset();
        }
    }
}
