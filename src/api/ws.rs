// =============================================================================
// WebSocket Handler — per-profile real-time channel
// =============================================================================
//
// Clients connect to `/api/v1/profiles/:id/ws?token=<token>` (or send an
// `auth` frame first) and then exchange JSON frames:
//
//   client → server: auth, ping, subscribe {events}, unsubscribe {events},
//                    request_positions, request_account
//   server → client: every Event Hub frame for the profile, plus connected,
//                    error, pong, positions_snapshot, account_snapshot
//
// The hub side is strictly non-blocking: this handler drains a bounded
// outbox, and falling behind gets the subscriber dropped by the hub — the
// socket then closes on the dead receiver.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::events::EventType;
use crate::model::Tenant;

use super::auth::resolve_token;

// =============================================================================
// Frames & query parameters
// =============================================================================

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// Frames the client may send.
#[derive(Debug, Deserialize)]
struct ClientFrame {
    #[serde(rename = "type")]
    kind: String,
    token: Option<String>,
    events: Option<Vec<EventType>>,
}

/// How long an unauthenticated socket may sit before being closed.
const AUTH_TIMEOUT_SECS: u64 = 10;

// =============================================================================
// Upgrade handler
// =============================================================================

/// Axum handler for the WebSocket upgrade request. A token supplied as a
/// query parameter authenticates immediately; otherwise the first client
/// frame must be `auth`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(profile_id): Path<Uuid>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let pre_auth = match &query.token {
        Some(token) => match authenticate(&state, token, profile_id).await {
            Some(tenant) => Some(tenant),
            None => {
                warn!(profile_id = %profile_id, "WebSocket rejected: invalid token");
                return (
                    axum::http::StatusCode::FORBIDDEN,
                    "Invalid or missing token",
                )
                    .into_response();
            }
        },
        None => None,
    };

    ws.on_upgrade(move |socket| handle_ws_connection(socket, state, profile_id, pre_auth))
        .into_response()
}

/// Resolve a token and check it may see this profile.
async fn authenticate(state: &Arc<AppState>, token: &str, profile_id: Uuid) -> Option<Tenant> {
    let tenant = resolve_token(state, token).await?;
    state
        .signal_gate
        .ensure_visible(&tenant, profile_id)
        .await
        .ok()?;
    Some(tenant)
}

// =============================================================================
// Connection handler
// =============================================================================

async fn handle_ws_connection(
    socket: WebSocket,
    state: Arc<AppState>,
    profile_id: Uuid,
    pre_auth: Option<Tenant>,
) {
    let (mut sender, mut receiver) = socket.split();

    // ── Authentication phase ────────────────────────────────────────────
    let tenant = match pre_auth {
        Some(tenant) => tenant,
        None => {
            let deadline = tokio::time::sleep(std::time::Duration::from_secs(AUTH_TIMEOUT_SECS));
            tokio::pin!(deadline);
            let tenant = loop {
                tokio::select! {
                    _ = &mut deadline => {
                        let _ = send_error(&mut sender, "auth_timeout", "No auth frame received").await;
                        return;
                    }
                    msg = receiver.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            let frame: Option<ClientFrame> = serde_json::from_str(&text).ok();
                            match frame {
                                Some(frame) if frame.kind == "auth" => {
                                    let token = frame.token.unwrap_or_default();
                                    match authenticate(&state, &token, profile_id).await {
                                        Some(tenant) => break tenant,
                                        None => {
                                            let _ = send_error(&mut sender, "auth_failed", "Invalid token").await;
                                            return;
                                        }
                                    }
                                }
                                _ => {
                                    let _ = send_error(&mut sender, "auth_required", "Send an auth frame first").await;
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => return,
                        Some(Ok(_)) => {}
                        Some(Err(_)) => return,
                    }
                }
            };
            tenant
        }
    };

    // ── Register with the hub and greet ─────────────────────────────────
    let subscriber_id = state.ids.mint();
    let mut outbox = state.hub.subscribe(profile_id, subscriber_id, None);

    info!(
        profile_id = %profile_id,
        tenant = %tenant.id,
        subscriber_id = %subscriber_id,
        "WebSocket subscriber connected"
    );

    let connected = json!({
        "type": "connected",
        "timestamp": state.clock.now_utc(),
        "profile_id": profile_id,
        "subscriber_id": subscriber_id,
    });
    if sender
        .send(Message::Text(connected.to_string()))
        .await
        .is_err()
    {
        state.hub.unsubscribe(subscriber_id);
        return;
    }

    // ── Pump loop ───────────────────────────────────────────────────────
    loop {
        tokio::select! {
            // Outbound: hub events for this subscriber.
            event = outbox.recv() => {
                match event {
                    Some(event) => {
                        let frame = event.frame();
                        if sender.send(Message::Text(frame.to_string())).await.is_err() {
                            debug!(subscriber_id = %subscriber_id, "WebSocket send failed — disconnecting");
                            break;
                        }
                    }
                    // Hub dropped us (slow subscriber or shutdown).
                    None => {
                        debug!(subscriber_id = %subscriber_id, "outbox closed by hub");
                        break;
                    }
                }
            }

            // Inbound: client frames.
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        state.hub.touch(subscriber_id);
                        let frame: Option<ClientFrame> = serde_json::from_str(&text).ok();
                        let Some(frame) = frame else {
                            let _ = send_error(&mut sender, "bad_frame", "Unparseable frame").await;
                            continue;
                        };
                        if handle_client_frame(&state, &mut sender, profile_id, subscriber_id, frame)
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        state.hub.touch(subscriber_id);
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        state.hub.touch(subscriber_id);
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!(subscriber_id = %subscriber_id, "WebSocket close frame received");
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!("WebSocket binary message ignored");
                    }
                    Some(Err(e)) => {
                        warn!(subscriber_id = %subscriber_id, error = %e, "WebSocket receive error");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    state.hub.unsubscribe(subscriber_id);
    info!(subscriber_id = %subscriber_id, "WebSocket connection closed — cleanup complete");
}

// =============================================================================
// Client frame dispatch
// =============================================================================

async fn handle_client_frame<S>(
    state: &Arc<AppState>,
    sender: &mut S,
    profile_id: Uuid,
    subscriber_id: Uuid,
    frame: ClientFrame,
) -> Result<(), axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    match frame.kind.as_str() {
        "ping" => {
            let pong = json!({
                "type": "pong",
                "timestamp": state.clock.now_utc(),
                "profile_id": profile_id,
            });
            sender.send(Message::Text(pong.to_string())).await?;
        }
        "pong" => {
            // Liveness already recorded by the caller's touch.
        }
        "subscribe" => {
            if let Some(events) = frame.events {
                state.hub.add_subscriptions(subscriber_id, &events);
            }
        }
        "unsubscribe" => {
            if let Some(events) = frame.events {
                state.hub.remove_subscriptions(subscriber_id, &events);
            }
        }
        "request_positions" => {
            let positions = state
                .repo
                .open_positions(profile_id)
                .await
                .unwrap_or_default();
            let total_profit: f64 = positions.iter().map(|p| p.profit).sum();
            let snapshot = json!({
                "type": "positions_snapshot",
                "timestamp": state.clock.now_utc(),
                "profile_id": profile_id,
                "positions": positions,
                "total_profit": total_profit,
            });
            sender.send(Message::Text(snapshot.to_string())).await?;
        }
        "request_account" => {
            let account = match state.repo.profile(profile_id).await {
                Ok(Some(profile)) => profile.account,
                _ => None,
            };
            let snapshot = json!({
                "type": "account_snapshot",
                "timestamp": state.clock.now_utc(),
                "profile_id": profile_id,
                "account": account,
            });
            sender.send(Message::Text(snapshot.to_string())).await?;
        }
        other => {
            debug!(kind = other, "unknown WebSocket frame type");
            let error = json!({
                "type": "error",
                "timestamp": state.clock.now_utc(),
                "profile_id": profile_id,
                "code": "unknown_frame",
                "message": format!("Unknown frame type '{other}'"),
            });
            sender.send(Message::Text(error.to_string())).await?;
        }
    }
    Ok(())
}

async fn send_error<S>(sender: &mut S, code: &str, message: &str) -> Result<(), axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    let frame = json!({
        "type": "error",
        "code": code,
        "message": message,
    });
    sender.send(Message::Text(frame.to_string())).await
}
