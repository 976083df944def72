pub mod api;
pub mod cli;
pub mod codec;
pub mod config;
pub mod persistence;
pub mod signal_processing;
pub mod state;
pub mod streaming;
pub mod websocket;

pub use codec::{DecodeError, PacketCodec, SampleBlock};
pub use config::{ConfigError, RelayConfig};
pub use persistence::{
    PersistenceHandle, PersistenceWriter, PostgresSignalStore, SignalQuery, SignalStore,
};
pub use state::RelayState;
pub use streaming::{Broadcaster, PipelineConfig, SessionRegistry, StreamPipeline};

use axum::{http::HeaderValue, routing::get, Router};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// How often the registry is swept for idle sessions
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Build the relay router
pub fn build_router(state: RelayState, cors_origins: &[String]) -> Router {
    let cors = if cors_origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = cors_origins
            .iter()
            .filter_map(|origin| origin.parse::<HeaderValue>().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    };

    Router::new()
        .route("/ws", get(websocket::handle_ingest))
        .route("/ws/subscribe", get(websocket::handle_subscribe))
        .route("/health", get(api::health_check))
        .route("/status", get(api::relay_status))
        .route("/signals", get(api::recent_signals))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Spawn background task to cancel sessions idle beyond `idle_timeout`
pub fn spawn_session_sweeper(
    registry: SessionRegistry,
    idle_timeout: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let timeout_seconds = idle_timeout.as_secs().max(1) as i64;
    tokio::spawn(async move {
        let mut interval = time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let removed = registry.cleanup_stale(timeout_seconds);
                    if removed > 0 {
                        info!("Cancelled {} idle sessions", removed);
                    }
                }
            }
        }
    })
}
