use super::traits::{PersistenceError, PersistenceResult, SignalConnection, SignalRow, SignalStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Connection state of the persistence link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// No connection attempted yet
    Disconnected,
    Connected,
    /// Previous connection failed, a fresh one is being opened
    Reconnecting,
    /// Last batch was dropped; the next submit starts over with a new connection
    Failed,
}

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Maximum rows per transaction
    pub batch_size: usize,
    /// Upper bound on a single connect or append call
    pub operation_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            operation_timeout: Duration::from_secs(5),
        }
    }
}

/// Retrying, batching front for a [`SignalStore`]
pub struct PersistenceGateway {
    store: Arc<dyn SignalStore>,
    connection: Option<Box<dyn SignalConnection>>,
    state: LinkState,
    config: GatewayConfig,
}

impl PersistenceGateway {
    pub fn new(store: Arc<dyn SignalStore>, config: GatewayConfig) -> Self {
        Self {
            store,
            connection: None,
            state: LinkState::Disconnected,
            config: GatewayConfig {
                batch_size: config.batch_size.max(1),
                ..config
            },
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Append rows in chunks of at most `batch_size`.
    ///
    /// Each chunk is tried on the current connection and, if that fails, once
    /// more on a freshly opened connection. A chunk that fails twice is dropped
    /// together with the rest of the submission, and the link is marked
    /// [`LinkState::Failed`]. Returns the number of rows written.
    pub async fn submit_batch(&mut self, rows: &[SignalRow]) -> PersistenceResult<usize> {
        let mut written = 0;

        for chunk in rows.chunks(self.config.batch_size) {
            if let Err(e) = self.submit_chunk(chunk).await {
                let dropped = rows.len() - written;
                error!("Dropping {} rows: {}", dropped, e);
                return Err(PersistenceError::BatchDropped {
                    rows: dropped,
                    reason: e.to_string(),
                });
            }
            written += chunk.len();
        }

        Ok(written)
    }

    async fn submit_chunk(&mut self, chunk: &[SignalRow]) -> PersistenceResult<()> {
        let mut last_error = None;

        for attempt in 0..2 {
            if attempt > 0 || self.connection.is_none() {
                if let Err(e) = self.reconnect().await {
                    last_error = Some(e);
                    continue;
                }
            }

            let Some(connection) = self.connection.as_mut() else {
                continue;
            };

            let result = match timeout(self.config.operation_timeout, connection.append_batch(chunk)).await {
                Ok(result) => result,
                Err(_) => Err(PersistenceError::Unavailable(format!(
                    "append timed out after {:?}",
                    self.config.operation_timeout
                ))),
            };

            match result {
                Ok(()) => {
                    self.state = LinkState::Connected;
                    debug!("Persisted {} rows", chunk.len());
                    return Ok(());
                }
                Err(e) => {
                    warn!("Append of {} rows failed (attempt {}): {}", chunk.len(), attempt + 1, e);
                    self.connection = None;
                    self.state = LinkState::Reconnecting;
                    last_error = Some(e);
                }
            }
        }

        self.state = LinkState::Failed;
        Err(last_error.unwrap_or_else(|| PersistenceError::Unavailable("no connection".to_string())))
    }

    async fn reconnect(&mut self) -> PersistenceResult<()> {
        let previous = self.state;
        self.connection = None;
        if previous != LinkState::Disconnected {
            self.state = LinkState::Reconnecting;
        }

        let connected = match timeout(self.config.operation_timeout, self.store.connect()).await {
            Ok(result) => result,
            Err(_) => Err(PersistenceError::Unavailable(format!(
                "connect timed out after {:?}",
                self.config.operation_timeout
            ))),
        };

        match connected {
            Ok(connection) => {
                if previous != LinkState::Disconnected {
                    info!("Persistence link re-established");
                }
                self.connection = Some(connection);
                self.state = LinkState::Connected;
                Ok(())
            }
            Err(e) => {
                warn!("Failed to connect to signal store: {}", e);
                self.state = LinkState::Failed;
                Err(e)
            }
        }
    }
}
