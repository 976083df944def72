use crate::config::RelayConfig;
use crate::persistence::{PersistenceHandle, SignalQuery};
use crate::streaming::{Broadcaster, PipelineConfig, SessionRegistry};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Relay state shared across all handlers
#[derive(Clone)]
pub struct RelayState {
    pub registry: SessionRegistry,
    pub broadcaster: Broadcaster,
    pub persistence: PersistenceHandle,
    /// Read side of the sink; `None` when persistence is disabled
    pub signal_query: Option<Arc<dyn SignalQuery>>,
    pub pipeline_config: Arc<PipelineConfig>,
    pub idle_timeout: Duration,
    pub delivery_timeout: Duration,
    /// Root token; cancelled on server shutdown
    pub shutdown: CancellationToken,
    pub start_time: Instant,
}

impl RelayState {
    pub fn new(
        config: &RelayConfig,
        persistence: PersistenceHandle,
        signal_query: Option<Arc<dyn SignalQuery>>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry: SessionRegistry::new(),
            broadcaster: Broadcaster::with_capacity(config.subscriber_queue_capacity),
            persistence,
            signal_query,
            pipeline_config: Arc::new(config.pipeline_config()),
            idle_timeout: config.session_idle_timeout(),
            delivery_timeout: config.subscriber_delivery_timeout(),
            shutdown,
            start_time: Instant::now(),
        }
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
