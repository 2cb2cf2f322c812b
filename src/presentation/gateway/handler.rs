//! Gateway Connection Handler
//!
//! WebSocket upgrade, identify handshake, and the per-connection dispatch
//! loop. Every event first consults the registry (who/where), then the
//! limiter (allowed?), then mutates roster state and triggers broadcasts.

use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::time::{interval, timeout, Instant};
use uuid::Uuid;

use super::events::{ClientEvent, ServerEvent};
use crate::application::services::auth_service::AccessContext;
use crate::domain::{knob_or, SanctionKind};
use crate::infrastructure::metrics;
use crate::startup::AppState;

/// Identify frame, the mandatory first message on a fresh socket.
#[derive(Debug, serde::Deserialize)]
struct IdentifyFrame {
    token: String,
}

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = Uuid::new_v4();
    tracing::debug!(connection_id = %connection_id, "New gateway connection");

    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();

    // Forward outbound events from the channel onto the socket.
    let sender_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(t) => t,
                Err(e) => {
                    tracing::error!("Failed to serialize event: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // The first frame must be an identify carrying a valid access token.
    let identify_timeout = Duration::from_secs(state.settings.gateway.identify_timeout_secs);
    let identify = match timeout(identify_timeout, read_identify(&mut receiver)).await {
        Ok(Some(frame)) => frame,
        Ok(None) => {
            tracing::debug!(connection_id = %connection_id, "Connection closed before identify");
            sender_task.abort();
            return;
        }
        Err(_) => {
            tracing::debug!(connection_id = %connection_id, "Identify timeout");
            let _ = tx.send(ServerEvent::deny("identify_timeout"));
            tokio::time::sleep(Duration::from_millis(100)).await;
            sender_task.abort();
            return;
        }
    };

    let ctx = match state.auth.validate_access(&identify.token).await {
        Ok(ctx) => ctx,
        Err(e) => {
            tracing::debug!(connection_id = %connection_id, error = %e, "Invalid gateway token");
            let _ = tx.send(ServerEvent::deny("unauthorized"));
            tokio::time::sleep(Duration::from_millis(100)).await;
            sender_task.abort();
            return;
        }
    };

    if let Err(reason) = state
        .lifecycle
        .on_connect(connection_id, &ctx.username, tx.clone())
        .await
    {
        let _ = tx.send(ServerEvent::deny(reason));
        tokio::time::sleep(Duration::from_millis(100)).await;
        sender_task.abort();
        return;
    }

    metrics::GATEWAY_CONNECTIONS.inc();
    let _ = tx.send(ServerEvent::Ready {
        username: ctx.username.clone(),
    });

    let heartbeat_ms = state.settings.gateway.heartbeat_interval_ms;
    let liveness_window = Duration::from_millis(heartbeat_ms + 10_000);
    let mut liveness_check = interval(liveness_window);
    liveness_check.tick().await;
    let mut last_frame = Instant::now();

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_frame = Instant::now();
                        if text.len() > state.settings.gateway.max_message_size {
                            let _ = tx.send(ServerEvent::deny("message_too_large"));
                            continue;
                        }
                        match serde_json::from_str::<ClientEvent>(&text) {
                            Ok(event) => {
                                dispatch(event, connection_id, &ctx, &state, &tx).await;
                            }
                            Err(e) => {
                                tracing::debug!(connection_id = %connection_id, error = %e, "Unparseable frame");
                                let _ = tx.send(ServerEvent::deny("bad_frame"));
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::debug!(connection_id = %connection_id, "Connection closed");
                        break;
                    }
                    Some(Ok(ref frame)) if is_liveness_frame(frame) => {
                        last_frame = Instant::now();
                    }
                    Some(Err(e)) => {
                        tracing::debug!(connection_id = %connection_id, error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }

            _ = liveness_check.tick() => {
                if last_frame.elapsed() > liveness_window {
                    tracing::info!(connection_id = %connection_id, "Liveness timeout, closing connection");
                    break;
                }
            }
        }
    }

    state.lifecycle.on_disconnect(connection_id).await;
    metrics::GATEWAY_CONNECTIONS.dec();
    sender_task.abort();
}

/// Control frames that prove the peer is alive without carrying an event.
/// A client answering server pings with pongs must not trip the liveness
/// timeout even if it sends nothing else.
fn is_liveness_frame(frame: &Message) -> bool {
    matches!(frame, Message::Ping(_) | Message::Pong(_))
}

async fn read_identify(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
) -> Option<IdentifyFrame> {
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if let Ok(payload) = serde_json::from_str::<serde_json::Value>(&text) {
                    if payload.get("op").and_then(|v| v.as_str()) == Some("identify") {
                        if let Some(d) = payload.get("d") {
                            if let Ok(frame) = serde_json::from_value::<IdentifyFrame>(d.clone()) {
                                return Some(frame);
                            }
                        }
                    }
                }
            }
            Ok(Message::Close(_)) => return None,
            Err(_) => return None,
            _ => continue,
        }
    }
    None
}

async fn dispatch(
    event: ClientEvent,
    connection_id: Uuid,
    ctx: &AccessContext,
    state: &AppState,
    tx: &UnboundedSender<ServerEvent>,
) {
    let username = ctx.username.as_str();
    match event {
        ClientEvent::Join { room } => {
            if let Err(e) = state.rooms.join(connection_id, username, &room).await {
                let _ = tx.send(ServerEvent::deny(e.reason()));
            }
        }

        ClientEvent::Leave => {
            state.rooms.leave(connection_id, username);
        }

        ClientEvent::Msg { text, encrypted } => {
            handle_msg(connection_id, username, text, encrypted, state, tx).await;
        }

        ClientEvent::VoiceJoin => {
            if let Err(reason) = state.rooms.voice_join(connection_id, username).await {
                let _ = tx.send(ServerEvent::deny(reason));
            }
        }

        ClientEvent::VoiceLeave => {
            state.rooms.voice_leave(connection_id, username);
        }

        ClientEvent::Offer {
            session_id,
            to,
            kind,
            payload,
        } => {
            match state
                .signaling
                .offer(&session_id, kind.into(), username, &to)
            {
                Ok(relay) => relay_signal(state, &relay.to, &session_id, username, "offer", payload),
                Err(_) => {
                    let _ = tx.send(ServerEvent::deny("not_visible"));
                }
            }
        }

        ClientEvent::Answer {
            session_id,
            payload,
        } => match state.signaling.answer(&session_id, username) {
            Ok(relay) => relay_signal(state, &relay.to, &session_id, username, "answer", payload),
            Err(_) => {
                let _ = tx.send(ServerEvent::deny("not_visible"));
            }
        },

        ClientEvent::Ice {
            session_id,
            payload,
        } => match state.signaling.ice(&session_id, username) {
            Ok(relay) => relay_signal(state, &relay.to, &session_id, username, "ice", payload),
            Err(_) => {
                let _ = tx.send(ServerEvent::deny("not_visible"));
            }
        },

        ClientEvent::Decline { session_id } => match state.signaling.decline(&session_id, username)
        {
            Ok(relay) => relay_signal(
                state,
                &relay.to,
                &session_id,
                username,
                "decline",
                serde_json::Value::Null,
            ),
            Err(_) => {
                let _ = tx.send(ServerEvent::deny("not_visible"));
            }
        },

        ClientEvent::End { session_id } => match state.signaling.end(&session_id, username) {
            Ok(relay) => relay_signal(
                state,
                &relay.to,
                &session_id,
                username,
                "end",
                serde_json::Value::Null,
            ),
            Err(_) => {
                let _ = tx.send(ServerEvent::deny("not_visible"));
            }
        },

        ClientEvent::Presence {
            presence,
            status_text,
        } => {
            let status = crate::domain::PresenceStatus::from_str(&presence);
            if let Err(e) = state.profiles.set_presence(username, status, status_text).await {
                tracing::warn!(username = username, error = %e, "Failed to persist presence");
                return;
            }
            state.presence.broadcast(username).await;
        }

        ClientEvent::Activity => {
            if let Some(session_id) = ctx.session_id {
                if let Err(e) = state.auth.touch_activity(session_id).await {
                    tracing::warn!(username = username, error = %e, "Activity ping failed");
                }
            }
        }

        ClientEvent::Ping => {
            let _ = tx.send(ServerEvent::Pong);
        }
    }
}

/// The room-message path: registry, then mute check, then the limiter
/// stack, then heuristics, then fan-out. Each denial feeds a strike.
async fn handle_msg(
    connection_id: Uuid,
    username: &str,
    text: String,
    encrypted: bool,
    state: &AppState,
    tx: &UnboundedSender<ServerEvent>,
) {
    let Some(room) = state.registry.current_room(connection_id) else {
        let _ = tx.send(ServerEvent::deny("not_in_room"));
        return;
    };

    // Fail closed on a sanction-store error.
    if state
        .sanctions
        .is_sanctioned(username, SanctionKind::Mute)
        .await
        .unwrap_or(true)
    {
        let _ = tx.send(ServerEvent::deny("muted"));
        return;
    }

    let exempt = state.abuse.is_exempt(username).await.unwrap_or(false);
    if !exempt {
        let limits = &state.settings.limits;
        let limit = knob_or(&*state.runtime, "room_msg_limit", limits.room_msg_limit).await;
        let window = knob_or(
            &*state.runtime,
            "room_msg_window_seconds",
            limits.room_msg_window_seconds,
        )
        .await;

        let decision = state
            .limiter
            .check(&format!("roommsg:{}", username), limit, window);
        if !decision.allowed {
            let _ = tx.send(ServerEvent::deny_retry("rate_limited", decision.retry_after_seconds));
            strike(state, tx, username, "rate_limited").await;
            return;
        }

        // Admin-assigned hourly quota; absent means unlimited.
        if let Ok(Some(quota)) = state.runtime.get_int(&format!("quota:{}", username)).await {
            let decision = state
                .limiter
                .check(&format!("quota:{}", username), quota, 3600);
            if !decision.allowed {
                let _ = tx.send(ServerEvent::deny_retry(
                    "quota_exceeded",
                    decision.retry_after_seconds,
                ));
                strike(state, tx, username, "quota_exceeded").await;
                return;
            }
        }

        let slowmode_seconds = state
            .rooms
            .room_info(&room)
            .await
            .ok()
            .flatten()
            .map(|info| info.slowmode_seconds)
            .unwrap_or(0);
        let decision = state.abuse.check_slowmode(username, &room, slowmode_seconds);
        if !decision.allowed {
            let _ = tx.send(ServerEvent::deny_retry("slowmode", decision.retry_after_seconds));
            strike(state, tx, username, "slowmode").await;
            return;
        }

        if !encrypted {
            if let Some(violation) = state.abuse.screen_message(username, &room, &text).await {
                let _ = tx.send(ServerEvent::deny(violation.kind()));
                strike(state, tx, username, violation.kind()).await;
                return;
            }
        }
    }

    let event = ServerEvent::RoomMsg {
        room: room.clone(),
        from: username.to_string(),
        text,
        encrypted,
    };
    for sender in state.registry.senders_in_room(&room) {
        let _ = sender.send(event.clone());
    }
}

async fn strike(state: &AppState, tx: &UnboundedSender<ServerEvent>, username: &str, reason: &str) {
    match state.abuse.record_strike(username, reason).await {
        Ok(true) => {
            let minutes = knob_or(
                &*state.runtime,
                "auto_mute_minutes",
                state.settings.limits.auto_mute_minutes,
            )
            .await;
            let _ = tx.send(ServerEvent::AutoMuted {
                minutes,
                reason: "automatically muted for repeated rate-limit violations".to_string(),
            });
        }
        Ok(false) => {}
        Err(e) => {
            tracing::warn!(username = username, error = %e, "Strike bookkeeping failed");
        }
    }
}

fn relay_signal(
    state: &AppState,
    to: &str,
    session_id: &str,
    from: &str,
    event: &'static str,
    payload: serde_json::Value,
) {
    let frame = ServerEvent::Signal {
        session_id: session_id.to_string(),
        from: from.to_string(),
        event,
        payload,
    };
    for sender in state.registry.senders_for_user(to) {
        let _ = sender.send(frame.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Bytes;

    #[test]
    fn ping_and_pong_frames_count_as_liveness() {
        assert!(is_liveness_frame(&Message::Ping(Bytes::new())));
        assert!(is_liveness_frame(&Message::Pong(Bytes::new())));
        assert!(!is_liveness_frame(&Message::Binary(Bytes::new())));
        assert!(!is_liveness_frame(&Message::Close(None)));
    }
}
