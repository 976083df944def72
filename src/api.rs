use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::persistence::{PersistenceStatus, StoredSignal};
use crate::state::RelayState;
use crate::streaming::SessionInfo;

const DEFAULT_SIGNAL_LIMIT: i64 = 20;
const MAX_SIGNAL_LIMIT: i64 = 5_000;

/// Relay status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub sessions: Vec<SessionInfo>,
    pub subscribers: usize,
    pub persistence: PersistenceStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct SignalsParams {
    pub limit: Option<i64>,
}

/// Health check endpoint
pub async fn health_check() -> &'static str {
    "OK"
}

/// Live sessions, subscribers and persistence link
pub async fn relay_status(State(state): State<RelayState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.uptime_seconds(),
        sessions: state.registry.snapshot(),
        subscribers: state.broadcaster.len(),
        persistence: state.persistence.status(),
    })
}

/// Latest persisted rows, newest first
pub async fn recent_signals(
    Query(params): Query<SignalsParams>,
    State(state): State<RelayState>,
) -> Result<Json<Vec<StoredSignal>>, (StatusCode, Json<ErrorResponse>)> {
    let Some(query) = &state.signal_query else {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: "Persistence is not configured".to_string(),
                code: "PERSISTENCE_DISABLED".to_string(),
            }),
        ));
    };

    let limit = params
        .limit
        .unwrap_or(DEFAULT_SIGNAL_LIMIT)
        .clamp(1, MAX_SIGNAL_LIMIT);

    query.recent_signals(limit).await.map(Json).map_err(|e| {
        error!("Failed to read signals: {}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
                code: "QUERY_ERROR".to_string(),
            }),
        )
    })
}
