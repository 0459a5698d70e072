use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::engine::locations::WatchTarget;
use crate::engine::registry::Sink;
use crate::error::AppError;
use crate::models::location::{Location, LocationUpdate, SubjectType};
use crate::state::AppState;

const WRITE_TIMEOUT: Duration = Duration::from_secs(15);

/// Location report sent over a socket. Identity comes from the socket's path,
/// so any subject fields in the frame are ignored.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboundReport {
    location: Location,
    #[serde(default)]
    order_id: Option<String>,
}

pub async fn location_ws_handler(
    ws: WebSocketUpgrade,
    Path((kind, id)): Path<(String, String)>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, AppError> {
    let target = WatchTarget::parse(&kind, &id)?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, target, state)))
}

pub async fn driver_ws_handler(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, AppError> {
    let target = WatchTarget::parse(SubjectType::Driver.as_str(), &id)?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, target, state)))
}

async fn handle_socket(socket: WebSocket, target: WatchTarget, state: Arc<AppState>) {
    let key = target.routing_key();
    let (sink, mut outbound) = Sink::channel(state.sink_buffer_size);
    state.registry.register(key.clone(), sink.clone()).await;

    info!(key = %key, "websocket client connected");

    let (mut sender, mut receiver) = socket.split();

    // Registered first, so anything routed meanwhile queues behind the snapshot.
    if !send_snapshot(&mut sender, &state, &target).await {
        state.registry.unregister(key.clone(), &sink).await;
        info!(key = %key, "websocket client disconnected");
        return;
    }

    let writer_key = key.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(payload) = outbound.recv().await {
            match tokio::time::timeout(WRITE_TIMEOUT, sender.send(Message::Text(payload))).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    debug!(key = %writer_key, error = %err, "websocket write failed");
                    return;
                }
                Err(_) => {
                    warn!(key = %writer_key, "websocket write timed out");
                    return;
                }
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    let reader_state = state.clone();
    let reader_target = target.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(frame) = receiver.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    handle_inbound(&reader_state, &reader_target, &text).await;
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    debug!(error = %err, "websocket read failed");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.registry.unregister(key.clone(), &sink).await;
    info!(key = %key, "websocket client disconnected");
}

/// Sends the stored location of the watched entity, if there is one.
/// Returns `false` once the client is gone.
async fn send_snapshot<S>(sender: &mut S, state: &AppState, target: &WatchTarget) -> bool
where
    S: futures::Sink<Message> + Unpin,
{
    match state.locations.snapshot(target).await {
        Ok(Some(snapshot)) => sender.send(Message::Text(snapshot)).await.is_ok(),
        Ok(None) => true,
        Err(err) => {
            warn!(key = %target.routing_key(), error = %err, "initial snapshot unavailable");
            true
        }
    }
}

/// Turns a text frame into an update for the socket's own subject.
/// Order observers do not report, and malformed frames are dropped.
fn inbound_update(target: &WatchTarget, text: &str) -> Option<LocationUpdate> {
    let WatchTarget::Subject(subject_type, subject_id) = target else {
        debug!("order observers do not send updates");
        return None;
    };

    let report: InboundReport = match serde_json::from_str(text) {
        Ok(report) => report,
        Err(err) => {
            warn!(subject_id = %subject_id, error = %err, "dropping malformed location update");
            return None;
        }
    };

    Some(LocationUpdate {
        subject_id: subject_id.clone(),
        subject_type: *subject_type,
        location: report.location,
        order_id: report.order_id,
    })
}

async fn handle_inbound(state: &AppState, target: &WatchTarget, text: &str) {
    let Some(update) = inbound_update(target, text) else {
        return;
    };

    let subject_id = update.subject_id.clone();
    if let Err(err) = state.ingest_location(update).await {
        warn!(subject_id = %subject_id, error = %err, "location update not recorded");
    }
}
