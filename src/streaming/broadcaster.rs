// Fan-out of conditioned blocks to live observers
//
// Each subscriber owns a bounded queue drained by its own connection task.
// A broadcast pass never waits on a subscriber: a closed or full queue marks
// the subscriber dead, and dead subscribers are removed once the pass is over.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// Default per-subscriber queue depth
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 64;

/// A frame queued for one subscriber
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    /// Conditioned samples, headerless little-endian f32
    Samples(Bytes),
    /// JSON side channel (spectrum augmentation)
    Text(String),
}

/// Outcome of one broadcast pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub removed: usize,
}

struct Subscriber {
    sender: mpsc::Sender<OutboundFrame>,
    subscribed_at: chrono::DateTime<chrono::Utc>,
}

/// Shared subscriber registry
#[derive(Clone)]
pub struct Broadcaster {
    subscribers: Arc<RwLock<HashMap<Uuid, Subscriber>>>,
    capacity: usize,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    /// Create a broadcaster whose subscriber queues hold `capacity` frames
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Register a new observer and return its id and frame queue
    pub fn subscribe(&self) -> (Uuid, mpsc::Receiver<OutboundFrame>) {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let id = Uuid::new_v4();
        self.subscribers.write().insert(
            id,
            Subscriber {
                sender,
                subscribed_at: chrono::Utc::now(),
            },
        );
        info!("Subscriber {} added ({} live)", id, self.len());
        (id, receiver)
    }

    /// Remove an observer; returns whether it was still registered
    pub fn unsubscribe(&self, id: &Uuid) -> bool {
        let removed = self.subscribers.write().remove(id);
        if let Some(subscriber) = &removed {
            let connected_for = chrono::Utc::now() - subscriber.subscribed_at;
            info!(
                "Subscriber {} removed after {}s",
                id,
                connected_for.num_seconds()
            );
        }
        removed.is_some()
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }

    /// Deliver a frame to every live subscriber without blocking.
    ///
    /// The pass runs under the read lock; failed subscribers are collected and
    /// removed afterwards under the write lock, so the set never changes while
    /// it is being iterated.
    pub fn broadcast(&self, frame: OutboundFrame) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut dead = Vec::new();

        {
            let subscribers = self.subscribers.read();
            for (id, subscriber) in subscribers.iter() {
                match subscriber.sender.try_send(frame.clone()) {
                    Ok(()) => report.delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!("Subscriber {} is not keeping up, dropping it", id);
                        dead.push(*id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!("Subscriber {} disconnected", id);
                        dead.push(*id);
                    }
                }
            }
        }

        if !dead.is_empty() {
            let mut subscribers = self.subscribers.write();
            for id in &dead {
                if subscribers.remove(id).is_some() {
                    report.removed += 1;
                }
            }
        }

        report
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}
