use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{Sink, SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::state::RelayState;
use crate::streaming::{status_message, OutboundFrame, RegistrationResult, StreamPipeline};

/// Pair id used when a device connects without one
pub const DEFAULT_PAIR_ID: &str = "pcb_001";

/// Why an outbound message was not delivered
#[derive(Debug, Error)]
pub enum SendError {
    #[error("send failed: {0}")]
    Failed(String),

    #[error("peer not reading, send timed out after {0:?}")]
    TimedOut(Duration),

    #[error("session cancelled")]
    Cancelled,
}

/// Send one message, giving up after `limit` or as soon as `cancel` fires.
///
/// A peer that stops reading leaves the sink pending on a full socket
/// buffer, so every send on a session task goes through here.
pub async fn send_bounded<S>(
    sink: &mut S,
    message: Message,
    limit: Duration,
    cancel: &CancellationToken,
) -> Result<(), SendError>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(SendError::Cancelled),
        sent = timeout(limit, sink.send(message)) => match sent {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SendError::Failed(e.to_string())),
            Err(_) => Err(SendError::TimedOut(limit)),
        },
    }
}

/// Best-effort close frame, bounded so a stalled peer cannot hold the task
async fn close_bounded<S>(sink: &mut S, limit: Duration)
where
    S: Sink<Message> + Unpin,
{
    if timeout(limit, sink.send(Message::Close(None))).await.is_err() {
        debug!("Close frame not delivered within {:?}", limit);
    }
}

#[derive(Debug, Deserialize)]
pub struct IngestParams {
    pub pair: Option<String>,
}

/// Handle device WebSocket upgrade
pub async fn handle_ingest(
    ws: WebSocketUpgrade,
    Query(params): Query<IngestParams>,
    State(state): State<RelayState>,
) -> Response {
    let pair_id = params
        .pair
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| DEFAULT_PAIR_ID.to_string());
    ws.on_upgrade(move |socket| handle_ingest_socket(socket, pair_id, state))
}

/// Drive one device session until disconnect, idle timeout, supersession,
/// shutdown or a fatal pipeline error.
async fn handle_ingest_socket(socket: WebSocket, pair_id: String, state: RelayState) {
    let (mut sender, mut receiver) = socket.split();
    let session_id = Uuid::new_v4();
    let cancel = state.shutdown.child_token();

    match state
        .registry
        .register(pair_id.clone(), session_id, cancel.clone())
    {
        RegistrationResult::Ok => {
            info!("Device pair {} connected", pair_id);
        }
        RegistrationResult::Replaced => {
            info!("Device pair {} reconnected, superseding previous session", pair_id);
        }
        RegistrationResult::AtCapacity => {
            warn!("Relay at capacity, rejecting pair: {}", pair_id);
            let reply = Message::Text("ERROR:server at capacity".into());
            if send_bounded(&mut sender, reply, state.delivery_timeout, &cancel)
                .await
                .is_ok()
            {
                close_bounded(&mut sender, state.delivery_timeout).await;
            }
            return;
        }
    }

    let mut pipeline = StreamPipeline::new(
        pair_id.clone(),
        (*state.pipeline_config).clone(),
        state.broadcaster.clone(),
        state.persistence.clone(),
    );

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => {
                info!("Session {} cancelled", pair_id);
                break;
            }
            next = timeout(state.idle_timeout, receiver.next()) => match next {
                Err(_) => {
                    info!("Session {} idle for {:?}, draining", pair_id, state.idle_timeout);
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    warn!("WebSocket error on session {}: {}", pair_id, e);
                    break;
                }
                Ok(Some(Ok(msg))) => msg,
            }
        };

        match msg {
            Message::Binary(data) => {
                let result = pipeline.handle_frame(&data);
                state
                    .registry
                    .touch(&pair_id, session_id, pipeline.state(), pipeline.stats());

                let reply = Message::Text(status_message(&result).into());
                if let Err(e) =
                    send_bounded(&mut sender, reply, state.delivery_timeout, &cancel).await
                {
                    error!("Failed to send status to {}: {}", pair_id, e);
                    break;
                }

                if let Err(e) = result {
                    if e.is_fatal() {
                        error!("Tearing down session {}: {}", pair_id, e);
                        break;
                    }
                }
            }
            Message::Text(_) => {
                let reply = Message::Text("ERROR:expected binary frame".into());
                if let Err(e) =
                    send_bounded(&mut sender, reply, state.delivery_timeout, &cancel).await
                {
                    error!("Failed to send status to {}: {}", pair_id, e);
                    break;
                }
            }
            Message::Ping(data) => {
                if let Err(e) =
                    send_bounded(&mut sender, Message::Pong(data), state.delivery_timeout, &cancel)
                        .await
                {
                    error!("Failed to send pong: {}", e);
                    break;
                }
            }
            Message::Close(_) => {
                info!("Device pair {} closed the connection", pair_id);
                break;
            }
            _ => {}
        }
    }

    pipeline.close();
    state.registry.remove(&pair_id, session_id);
    close_bounded(&mut sender, state.delivery_timeout).await;

    info!("Session {} terminated", pair_id);
}

/// Handle observer WebSocket upgrade
pub async fn handle_subscribe(ws: WebSocketUpgrade, State(state): State<RelayState>) -> Response {
    ws.on_upgrade(|socket| handle_subscriber_socket(socket, state))
}

/// Forward conditioned frames to one observer.
///
/// Each send is bounded by the delivery timeout; a subscriber that cannot keep
/// up is disconnected, and its queue closes so the broadcaster reaps it.
async fn handle_subscriber_socket(socket: WebSocket, state: RelayState) {
    let (mut sender, mut receiver) = socket.split();
    let (subscriber_id, mut frames) = state.broadcaster.subscribe();

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            frame = frames.recv() => {
                let Some(frame) = frame else {
                    debug!("Subscriber {} dropped by broadcaster", subscriber_id);
                    break;
                };
                let message = match frame {
                    OutboundFrame::Samples(bytes) => Message::Binary(bytes),
                    OutboundFrame::Text(text) => Message::Text(text.into()),
                };
                match send_bounded(&mut sender, message, state.delivery_timeout, &state.shutdown).await {
                    Ok(()) => {}
                    Err(SendError::TimedOut(limit)) => {
                        warn!(
                            "Subscriber {} exceeded delivery timeout of {:?}",
                            subscriber_id, limit
                        );
                        break;
                    }
                    Err(e) => {
                        debug!("Subscriber {} send stopped: {}", subscriber_id, e);
                        break;
                    }
                }
            }
            incoming = receiver.next() => match incoming {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            }
        }
    }

    state.broadcaster.unsubscribe(&subscriber_id);
    close_bounded(&mut sender, state.delivery_timeout).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::sink;
    use std::convert::Infallible;
    use std::future::pending;

    /// Sink whose every send stays pending, like a peer that stopped reading
    fn stalled_sink() -> impl Sink<Message, Error = Infallible> + Unpin {
        Box::pin(sink::unfold((), |(), _message: Message| async {
            pending::<Result<(), Infallible>>().await
        }))
    }

    #[tokio::test]
    async fn test_send_to_stalled_peer_times_out() {
        let mut sink = stalled_sink();
        let cancel = CancellationToken::new();

        let result = send_bounded(
            &mut sink,
            Message::Text("OK:250".into()),
            Duration::from_millis(50),
            &cancel,
        )
        .await;
        assert!(matches!(result, Err(SendError::TimedOut(_))));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_stalled_send() {
        let mut sink = stalled_sink();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result = send_bounded(
            &mut sink,
            Message::Text("OK:250".into()),
            Duration::from_secs(60),
            &cancel,
        )
        .await;
        assert!(matches!(result, Err(SendError::Cancelled)));
    }

    #[tokio::test]
    async fn test_close_to_stalled_peer_returns() {
        let mut sink = stalled_sink();
        tokio::time::timeout(
            Duration::from_secs(5),
            close_bounded(&mut sink, Duration::from_millis(50)),
        )
        .await
        .expect("close must be bounded");
    }

    #[tokio::test]
    async fn test_send_to_reading_peer() {
        let mut sink: Vec<Message> = Vec::new();
        let cancel = CancellationToken::new();

        send_bounded(
            &mut sink,
            Message::Text("OK:250".into()),
            Duration::from_secs(1),
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(sink.len(), 1);
    }
}
