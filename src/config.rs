use crate::codec::DEFAULT_MAX_SAMPLES;
use crate::persistence::GatewayConfig;
use crate::signal_processing::{CascadeConfig, FilterMode};
use crate::streaming::{AlignmentPolicy, PipelineConfig, ReferenceScheme, SynchronizerConfig};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Relay configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Port to listen on
    pub port: u16,
    /// Bind address (0.0.0.0 for LAN, 127.0.0.1 for localhost)
    pub bind_addr: String,
    /// PostgreSQL database URL; persistence is disabled when unset
    pub database_url: Option<String>,
    /// Largest accepted sample count per inbound frame
    pub max_samples_per_frame: usize,
    pub alignment_policy: AlignmentPolicy,
    pub alignment_tolerance_ms: f64,
    pub alignment_retention_ms: f64,
    pub max_buffered_samples: usize,
    pub max_consecutive_overflows: usize,
    pub drift_compensation: bool,
    pub drift_max_lag_samples: usize,
    pub reference_scheme: ReferenceScheme,
    pub filter_mode: FilterMode,
    pub highpass_hz: f64,
    pub lowpass_hz: f64,
    pub filter_order: usize,
    pub mains_hz: f64,
    pub notch_q: f64,
    /// Send a spectrum summary after each conditioned block
    pub spectrum_enabled: bool,
    pub persist_batch_size: usize,
    pub persist_queue_capacity: usize,
    /// Idle time after which a device session is drained and closed
    pub session_idle_timeout_secs: u64,
    pub subscriber_queue_capacity: usize,
    pub subscriber_delivery_timeout_ms: u64,
    /// CORS allowed origins (comma-separated in env var, `*` for any)
    pub cors_origins: Vec<String>,
}

impl RelayConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let config = Self {
            port: var("RELAY_PORT")
                .unwrap_or_else(|| "8000".to_string())
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidPort)?,
            bind_addr: var("RELAY_BIND_ADDR").unwrap_or_else(|| "0.0.0.0".to_string()),
            database_url: var("DATABASE_URL"),
            max_samples_per_frame: parse(&var, "MAX_SAMPLES_PER_FRAME", DEFAULT_MAX_SAMPLES)?,
            alignment_policy: parse(&var, "ALIGNMENT_POLICY", AlignmentPolicy::Index)?,
            alignment_tolerance_ms: parse(&var, "ALIGNMENT_TOLERANCE_MS", 20.0)?,
            alignment_retention_ms: parse(&var, "ALIGNMENT_RETENTION_MS", 1000.0)?,
            max_buffered_samples: parse(&var, "MAX_BUFFERED_SAMPLES", 5000)?,
            max_consecutive_overflows: parse(&var, "MAX_CONSECUTIVE_OVERFLOWS", 50)?,
            drift_compensation: parse_flag(&var, "DRIFT_COMPENSATION", false),
            drift_max_lag_samples: parse(&var, "DRIFT_MAX_LAG_SAMPLES", 10)?,
            reference_scheme: parse(&var, "REFERENCE_SCHEME", ReferenceScheme::Subtract)?,
            filter_mode: parse(&var, "FILTER_MODE", FilterMode::Causal)?,
            highpass_hz: parse(&var, "HIGHPASS_HZ", 1.0)?,
            lowpass_hz: parse(&var, "LOWPASS_HZ", 40.0)?,
            filter_order: parse(&var, "FILTER_ORDER", 2)?,
            mains_hz: parse(&var, "MAINS_HZ", 50.0)?,
            notch_q: parse(&var, "NOTCH_Q", 30.0)?,
            spectrum_enabled: parse_flag(&var, "SPECTRUM_ENABLED", false),
            persist_batch_size: parse(&var, "PERSIST_BATCH_SIZE", 500)?,
            persist_queue_capacity: parse(&var, "PERSIST_QUEUE_CAPACITY", 256)?,
            session_idle_timeout_secs: parse(&var, "SESSION_IDLE_TIMEOUT_SECS", 30)?,
            subscriber_queue_capacity: parse(&var, "SUBSCRIBER_QUEUE_CAPACITY", 64)?,
            subscriber_delivery_timeout_ms: parse(&var, "SUBSCRIBER_DELIVERY_TIMEOUT_MS", 250)?,
            cors_origins: var("CORS_ORIGINS")
                .map(|s| {
                    s.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_else(|| vec!["*".to_string()]),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that do not depend on the sample rate
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_samples_per_frame == 0 || self.max_samples_per_frame > i16::MAX as usize {
            return Err(ConfigError::InvalidValue(format!(
                "MAX_SAMPLES_PER_FRAME must be in 1..={}",
                i16::MAX
            )));
        }
        if self.filter_mode != FilterMode::Bypass {
            if !(self.highpass_hz > 0.0 && self.highpass_hz < self.lowpass_hz) {
                return Err(ConfigError::InvalidValue(
                    "cutoffs must satisfy 0 < HIGHPASS_HZ < LOWPASS_HZ".to_string(),
                ));
            }
            if self.filter_order == 0 {
                return Err(ConfigError::InvalidValue(
                    "FILTER_ORDER must be at least 1".to_string(),
                ));
            }
            if self.mains_hz <= 0.0 || self.notch_q <= 0.0 {
                return Err(ConfigError::InvalidValue(
                    "MAINS_HZ and NOTCH_Q must be positive".to_string(),
                ));
            }
        }
        // Postgres caps a statement at 65535 bind parameters, three per row
        if self.persist_batch_size == 0 || self.persist_batch_size > 20_000 {
            return Err(ConfigError::InvalidValue(
                "PERSIST_BATCH_SIZE must be in 1..=20000".to_string(),
            ));
        }
        if self.session_idle_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "SESSION_IDLE_TIMEOUT_SECS must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Get the full bind address (addr:port)
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            max_samples_per_frame: self.max_samples_per_frame,
            synchronizer: SynchronizerConfig {
                policy: self.alignment_policy,
                tolerance_ms: self.alignment_tolerance_ms,
                retention_ms: self.alignment_retention_ms,
                max_buffered_samples: self.max_buffered_samples,
                drift_compensation: self.drift_compensation,
                max_lag_samples: self.drift_max_lag_samples,
            },
            reference_scheme: self.reference_scheme,
            cascade: CascadeConfig {
                mode: self.filter_mode,
                highpass_hz: self.highpass_hz,
                lowpass_hz: self.lowpass_hz,
                order: self.filter_order,
                mains_hz: self.mains_hz,
                notch_q: self.notch_q,
            },
            spectrum_enabled: self.spectrum_enabled,
            persist_batch_size: self.persist_batch_size,
            max_consecutive_overflows: self.max_consecutive_overflows,
        }
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            batch_size: self.persist_batch_size,
            ..GatewayConfig::default()
        }
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }

    pub fn subscriber_delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.subscriber_delivery_timeout_ms)
    }
}

fn parse<T, F>(var: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{}={}", key, raw))),
        None => Ok(default),
    }
}

fn parse_flag<F>(var: &F, key: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    var(key)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid port number")]
    InvalidPort,
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}
