// Common types for the streaming module

use crate::codec::DecodeError;
use crate::signal_processing::FilterError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for streaming operations
pub type StreamResult<T> = Result<T, StreamError>;

/// Errors that can occur while processing a session's blocks
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("unknown device id {0}")]
    UnknownDevice(u8),

    #[error("sample rate mismatch: session runs at {expected} Hz, block at {actual} Hz")]
    SampleRateMismatch { expected: i16, actual: i16 },

    #[error("filter error: {0}")]
    Filter(#[from] FilterError),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("session closed")]
    SessionClosed,
}

impl StreamError {
    /// Whether the error must tear the session down
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StreamError::ResourceExhausted(_) | StreamError::SessionClosed
        )
    }
}

/// Lifecycle of a device-pair session
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Connected, no valid packet yet
    AwaitingFirstPacket,

    /// Packets arriving, no aligned pair emitted yet
    Synchronizing,

    /// Aligned pairs flowing
    Active,

    /// Disconnect or idle timeout detected, flushing
    Draining,

    /// Terminal
    Closed,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::AwaitingFirstPacket
    }
}

/// Statistics about a session
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SessionStats {
    pub blocks_received: u64,
    pub blocks_rejected: u64,
    pub pairs_emitted: u64,
    pub samples_emitted: u64,
    pub blocks_unstable: u64,
    pub blocks_degraded: u64,
    pub samples_evicted: u64,
    pub rows_queued: u64,
    pub rows_dropped: u64,
}

/// One conditioned block as handed to persistence and broadcast
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionedBlock {
    pub pair_id: String,
    /// Emission index within the session, starting at 0
    pub sequence: u64,
    /// Absolute sample times in milliseconds
    pub timestamps: Vec<f64>,
    pub samples: Vec<f32>,
    /// Passed through unfiltered (block too short for zero-phase filtering)
    pub degraded: bool,
}
