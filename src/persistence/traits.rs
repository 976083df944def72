use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Result type for persistence operations
pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// Errors that can occur while talking to the sink
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Sink unavailable: {0}")]
    Unavailable(String),

    #[error("Batch of {rows} rows dropped after retry: {reason}")]
    BatchDropped { rows: usize, reason: String },
}

/// One persisted sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRow {
    /// Device pair the sample came from
    pub device_tag: String,
    pub timestamp: DateTime<Utc>,
    /// Conditioned value in microvolts
    pub value: f32,
}

/// A row read back from the sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSignal {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub value_uv: f32,
}

/// Factory for sink connections
#[async_trait]
pub trait SignalStore: Send + Sync {
    /// Open a fresh connection to the sink
    async fn connect(&self) -> PersistenceResult<Box<dyn SignalConnection>>;
}

/// A live connection able to durably append rows
#[async_trait]
pub trait SignalConnection: Send {
    /// Append all rows atomically, or fail
    async fn append_batch(&mut self, rows: &[SignalRow]) -> PersistenceResult<()>;
}

/// Read side used by the reporting endpoint
#[async_trait]
pub trait SignalQuery: Send + Sync {
    /// Most recent rows, newest first
    async fn recent_signals(&self, limit: i64) -> PersistenceResult<Vec<StoredSignal>>;
}
