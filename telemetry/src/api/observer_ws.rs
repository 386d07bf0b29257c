//! WebSocket gateway for run observers.
//!
//! An observer connects to `/runs/{run_id}/ws`, joins the run's room and
//! receives every live message published after joining (plus the current
//! status). Over the same socket it may send control commands:
//!
//! ```json
//! {"type": "control", "command": "pause", "command_id": "c-1"}
//! ```
//!
//! Each command is answered with `control_received` as soon as the
//! coordinator has it, then `control_processed` once it was applied.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use shared_types::{CommandId, ControlAction, ControlCommand, LiveMessage, RunId};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::api::ApiState;
use crate::hub::Hub;
use crate::registry::{is_valid_run_id, RunHandle};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);
const REPLY_CAPACITY: usize = 32;

/// Frames an observer may send
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Control {
        command: ControlAction,
        #[serde(default)]
        command_id: Option<CommandId>,
        #[serde(default)]
        run_id: Option<RunId>,
    },
    Ping,
}

pub async fn observer_websocket(
    ws: WebSocketUpgrade,
    Path(run_id): Path<String>,
    State(state): State<ApiState>,
) -> Response {
    if !is_valid_run_id(&run_id) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid run id", "run_id": run_id })),
        )
            .into_response();
    }
    let Some(handle) = state.registry.get(&RunId(run_id.clone())) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "run not found", "run_id": run_id })),
        )
            .into_response();
    };

    let hub = state.registry.hub().clone();
    ws.on_upgrade(move |socket| handle_observer_socket(socket, hub, handle))
}

type ObserverSink = SplitSink<WebSocket, Message>;

/// Send one JSON frame; false once the socket is gone.
async fn send_json(sink: &mut ObserverSink, value: Value) -> bool {
    sink.send(Message::Text(value.to_string().into())).await.is_ok()
}

fn live_frame(run_id: &RunId, message: &LiveMessage) -> Value {
    let mut frame = serde_json::to_value(message).unwrap_or_else(|_| json!({ "type": "error" }));
    if let Value::Object(map) = &mut frame {
        map.insert("run_id".to_string(), json!(run_id));
    }
    frame
}

async fn handle_observer_socket(socket: WebSocket, hub: Hub, handle: RunHandle) {
    let run_id = handle.run_id.clone();
    let (mut sender, mut receiver) = socket.split();
    // Acks finishing in the background come back through here.
    let (reply_tx, mut reply_rx) = mpsc::channel::<Value>(REPLY_CAPACITY);

    let (subscriber, mut subscription) = hub.subscriber();
    if let Err(e) = hub.join(&run_id, &subscriber) {
        tracing::warn!(run_id = %run_id, error = %e, "Observer could not join room");
        send_json(&mut sender, json!({ "type": "error", "message": e.to_string() })).await;
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, sender.close()).await;
        return;
    }

    tracing::info!(run_id = %run_id, subscriber_id = %subscriber.id(), "Observer connected");
    let joined = json!({
        "type": "joined",
        "run_id": run_id,
        "subscriber_id": subscriber.id(),
    });

    // Live messages are only taken off the subscription once the previous
    // write has gone out, so a slow socket leaves them in the bounded queue.
    let mut open = send_json(&mut sender, joined).await;
    while open {
        open = tokio::select! {
            maybe_msg = receiver.next() => {
                match maybe_msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_text(text.as_str(), &handle, &mut sender, &reply_tx).await
                    }
                    Some(Ok(Message::Ping(data))) => sender.send(Message::Pong(data)).await.is_ok(),
                    Some(Ok(Message::Close(_))) | None => false,
                    Some(Ok(_)) => true,
                    Some(Err(e)) => {
                        tracing::warn!(run_id = %run_id, error = %e, "Observer websocket receive error");
                        false
                    }
                }
            }
            Some(reply) = reply_rx.recv() => send_json(&mut sender, reply).await,
            live = subscription.recv() => {
                match live {
                    Some(message) => send_json(&mut sender, live_frame(&run_id, &message)).await,
                    None => {
                        let reason = subscription.close_reason();
                        tracing::info!(run_id = %run_id, ?reason, "Observer subscription closed");
                        send_json(&mut sender, json!({
                            "type": "error",
                            "message": format!("subscription closed: {reason:?}"),
                        }))
                        .await;
                        false
                    }
                }
            }
        };
    }

    hub.leave(&run_id, subscriber.id());
    tracing::info!(
        run_id = %run_id,
        subscriber_id = %subscriber.id(),
        dropped = subscription.dropped(),
        "Observer disconnected"
    );
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, sender.close()).await;
}

/// Answer one client frame; false once the socket is gone.
async fn handle_client_text(
    text: &str,
    handle: &RunHandle,
    sender: &mut ObserverSink,
    reply_tx: &mpsc::Sender<Value>,
) -> bool {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            return send_json(
                sender,
                json!({ "type": "error", "message": format!("invalid frame: {e}") }),
            )
            .await;
        }
    };

    match frame {
        ClientFrame::Ping => send_json(sender, json!({ "type": "pong" })).await,
        ClientFrame::Control {
            command,
            command_id,
            run_id,
        } => {
            let command_id = command_id.unwrap_or_default();
            let run_id = run_id.unwrap_or_else(|| handle.run_id.clone());
            let control = ControlCommand::new(run_id, command_id.clone(), command);

            match handle.control.submit(control) {
                Ok(receipt) => {
                    let received = json!({
                        "type": "control_received",
                        "command_id": command_id,
                        "command": command,
                        "received_at": receipt.received_at(),
                    });
                    let reply_tx = reply_tx.clone();
                    tokio::spawn(async move {
                        let reply = match receipt.processed().await {
                            Ok(ack) => json!({
                                "type": "control_processed",
                                "command_id": ack.command_id,
                                "applied": ack.applied,
                                "outcome": ack.outcome,
                            }),
                            Err(e) => json!({ "type": "error", "message": e.to_string() }),
                        };
                        let _ = reply_tx.send(reply).await;
                    });
                    send_json(sender, received).await
                }
                Err(e) => {
                    send_json(
                        sender,
                        json!({
                            "type": "error",
                            "command_id": command_id,
                            "message": e.to_string(),
                        }),
                    )
                    .await
                }
            }
        }
    }
}
