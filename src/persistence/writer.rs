// Background writer decoupling the signal pipeline from the sink.
//
// Pipelines hand whole batches to a bounded queue and never await the
// database. A single task owns the gateway and drains the queue in order.

use super::gateway::{GatewayConfig, LinkState, PersistenceGateway};
use super::traits::{PersistenceError, SignalRow, SignalStore};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Snapshot of the writer's progress, reported on `/status`
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PersistenceStatus {
    pub enabled: bool,
    pub link_state: LinkState,
    pub batches_written: u64,
    pub batches_dropped: u64,
    pub rows_written: u64,
    pub rows_dropped: u64,
}

impl PersistenceStatus {
    fn new(enabled: bool) -> Self {
        Self {
            enabled,
            link_state: LinkState::Disconnected,
            batches_written: 0,
            batches_dropped: 0,
            rows_written: 0,
            rows_dropped: 0,
        }
    }
}

/// Cheap, cloneable submission side of the writer
#[derive(Clone)]
pub struct PersistenceHandle {
    sender: Option<mpsc::Sender<Vec<SignalRow>>>,
    status: Arc<RwLock<PersistenceStatus>>,
}

impl PersistenceHandle {
    /// Handle that accepts and discards everything
    pub fn disabled() -> Self {
        Self {
            sender: None,
            status: Arc::new(RwLock::new(PersistenceStatus::new(false))),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.sender.is_some()
    }

    /// Queue a batch without waiting. Returns false if the batch was dropped
    /// because the queue is full or the writer has stopped.
    pub fn submit(&self, rows: Vec<SignalRow>) -> bool {
        let Some(sender) = &self.sender else {
            return true;
        };
        if rows.is_empty() {
            return true;
        }

        let count = rows.len();
        match sender.try_send(rows) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Persistence queue full, dropping {} rows", count);
                self.record_drop(count);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Persistence writer stopped, dropping {} rows", count);
                self.record_drop(count);
                false
            }
        }
    }

    pub fn status(&self) -> PersistenceStatus {
        self.status.read().clone()
    }

    fn record_drop(&self, rows: usize) {
        let mut status = self.status.write();
        status.batches_dropped += 1;
        status.rows_dropped += rows as u64;
    }
}

pub struct PersistenceWriter;

impl PersistenceWriter {
    /// Spawn the writer task. The task exits once every handle is dropped and
    /// the queue is drained.
    pub fn spawn(
        store: Arc<dyn SignalStore>,
        config: GatewayConfig,
        queue_capacity: usize,
    ) -> (PersistenceHandle, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::channel::<Vec<SignalRow>>(queue_capacity.max(1));
        let status = Arc::new(RwLock::new(PersistenceStatus::new(true)));

        let handle = PersistenceHandle {
            sender: Some(sender),
            status: Arc::clone(&status),
        };

        let task = tokio::spawn(async move {
            let mut gateway = PersistenceGateway::new(store, config);

            while let Some(rows) = receiver.recv().await {
                let result = gateway.submit_batch(&rows).await;

                let mut current = status.write();
                current.link_state = gateway.state();
                match result {
                    Ok(written) => {
                        current.batches_written += 1;
                        current.rows_written += written as u64;
                    }
                    Err(e) => {
                        warn!("Persistence batch failed: {}", e);
                        // Chunks committed before the failure stay written
                        let dropped = match e {
                            PersistenceError::BatchDropped { rows: dropped, .. } => {
                                dropped.min(rows.len())
                            }
                            _ => rows.len(),
                        };
                        current.batches_dropped += 1;
                        current.rows_written += (rows.len() - dropped) as u64;
                        current.rows_dropped += dropped as u64;
                    }
                }
            }

            info!("Persistence writer stopped");
        });

        (handle, task)
    }
}
