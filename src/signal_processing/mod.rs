//! Signal Processing Module
//!
//! Provides the conditioning chain for the re-referenced EEG signal:
//! - Butterworth highpass/lowpass filters
//! - Notch filter for power line noise removal (50/60 Hz)
//! - Spectral summaries for optional output augmentation
//!
//! All filters use second-order sections (biquads) for numerical stability.

mod cascade;
mod filters;
pub mod spectrum;

pub use cascade::{CascadeConfig, FilterCascade, FilterMode, FilteredBlock};
pub use filters::{
    create_filter, BiquadCoeffs, BiquadFilter, ButterworthFilter, FilterConfig, FilterError,
    FilterResult, FilterType, NotchFilter, SosFilter,
};
pub use spectrum::{BandPower, SpectrumSummary};
