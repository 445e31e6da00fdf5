mod fanout;
mod fanout_dispatch;
mod ingress;
mod ingress_rate_limit;
mod presence;
mod registry;
mod typing;

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use parley_protocol::parse_envelope;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

pub(crate) use registry::{ChannelKey, RealtimeRegistry};
pub(crate) use typing::spawn_typing_sweeper;

use self::{
    ingress::{
        handle_ingress_command, parse_ingress_command, GatewaySession, IngressOutcome,
        IngressParseError,
    },
    ingress_rate_limit::allow_gateway_ingress,
    presence::{connection_closed, connection_opened},
};
use super::{
    auth::{authenticate_with_token, bearer_token},
    core::{AppState, AuthContext, ConnectionControl, GATEWAY_PING_INTERVAL_SECS},
    errors::ApiFailure,
    gateway_events,
    metrics::{
        record_gateway_event_dropped, record_gateway_event_emitted,
        record_gateway_ingress_rejected, record_ws_disconnect, GATEWAY_DROP_REASON_FULL_QUEUE,
    },
    storage::{repository, ChatPersistence},
    types::GatewayAuthQuery,
};

/// Upgrades to the gateway socket. The credential is checked before the
/// upgrade so a rejected client only ever sees a plain 401.
pub(crate) async fn gateway_ws(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
    Query(query): Query<GatewayAuthQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiFailure> {
    let token = query
        .access_token
        .or_else(|| bearer_token(&headers).map(ToOwned::to_owned))
        .ok_or(ApiFailure::Unauthorized)?;
    let auth = authenticate_with_token(&state, &token).await?;

    Ok(ws.on_upgrade(move |socket| async move {
        handle_gateway_connection(state, socket, auth).await;
    }))
}

#[allow(clippy::too_many_lines)]
pub(crate) async fn handle_gateway_connection(state: AppState, socket: WebSocket, auth: AuthContext) {
    let room_ids = match repository(&state).await {
        Ok(repo) => repo.member_room_ids(auth.user_id).await,
        Err(error) => Err(error),
    };
    let room_ids = match room_ids {
        Ok(room_ids) => room_ids,
        Err(error) => {
            tracing::warn!(event = "gateway.connect", outcome = "storage_error", user_id = %auth.user_id, error = %error);
            record_ws_disconnect("storage_error");
            return;
        }
    };

    let connection_id = Uuid::new_v4();
    let (mut sink, mut stream) = socket.split();
    let slow_consumer_disconnect = Arc::new(AtomicBool::new(false));
    let (outbound_tx, mut outbound_rx) =
        mpsc::channel::<String>(state.runtime.gateway_outbound_queue);
    let (control_tx, mut control_rx) = watch::channel(ConnectionControl::Open);

    // ready goes first so it precedes any fanout delivered after registration
    if let Some(ready) = gateway_events::ready(auth.user_id, &room_ids) {
        if outbound_tx.try_send(ready.payload).is_ok() {
            record_gateway_event_emitted("connection", ready.event_type);
        } else {
            record_gateway_event_dropped("connection", ready.event_type, GATEWAY_DROP_REASON_FULL_QUEUE);
        }
    }
    state
        .realtime
        .register(
            connection_id,
            auth.user_id,
            outbound_tx.clone(),
            control_tx,
            &room_ids,
        )
        .await;
    connection_opened(&state, auth.user_id).await;
    tracing::info!(
        event = "gateway.connect",
        outcome = "admitted",
        user_id = %auth.user_id,
        connection_id = %connection_id,
        rooms = room_ids.len()
    );

    let slow_consumer_disconnect_send = Arc::clone(&slow_consumer_disconnect);
    let send_task = tokio::spawn(async move {
        let mut ping_interval =
            tokio::time::interval(Duration::from_secs(GATEWAY_PING_INTERVAL_SECS));
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ping_interval.tick() => {
                    if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
                control_change = control_rx.changed() => {
                    if control_change.is_ok() && *control_rx.borrow() == ConnectionControl::Close {
                        slow_consumer_disconnect_send.store(true, Ordering::Relaxed);
                        record_ws_disconnect("slow_consumer");
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code: 1008,
                                reason: "slow_consumer".into(),
                            })))
                            .await;
                        break;
                    }
                }
                maybe_payload = outbound_rx.recv() => {
                    match maybe_payload {
                        Some(payload) => {
                            if sink.send(Message::Text(payload.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    });

    let session = GatewaySession {
        connection_id,
        auth,
        outbound_tx,
    };
    let mut ingress = VecDeque::new();
    let mut disconnect_reason = "connection_closed";
    while let Some(incoming) = stream.next().await {
        let Ok(message) = incoming else {
            disconnect_reason = "socket_error";
            break;
        };

        let payload: Vec<u8> = match message {
            Message::Text(text) => {
                if text.len() > state.runtime.max_gateway_event_bytes {
                    disconnect_reason = "event_too_large";
                    break;
                }
                text.as_bytes().to_vec()
            }
            Message::Binary(bytes) => {
                if bytes.len() > state.runtime.max_gateway_event_bytes {
                    disconnect_reason = "event_too_large";
                    break;
                }
                bytes.to_vec()
            }
            Message::Close(_) => {
                disconnect_reason = "client_close";
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        if !allow_gateway_ingress(
            &mut ingress,
            state.runtime.gateway_ingress_events_per_window,
            state.runtime.gateway_ingress_window,
        ) {
            disconnect_reason = "ingress_rate_limited";
            break;
        }

        let Ok(envelope) = parse_envelope(&payload) else {
            drop_ingress(&session, "unknown", "invalid_envelope");
            continue;
        };
        let event_type = envelope.t.as_str().to_owned();
        let command = match parse_ingress_command(envelope) {
            Ok(command) => command,
            Err(IngressParseError::InvalidPayload(reason)) => {
                drop_ingress(&session, &event_type, reason);
                continue;
            }
            Err(IngressParseError::UnknownEventType(_)) => {
                drop_ingress(&session, &event_type, "unknown_event");
                continue;
            }
        };

        match handle_ingress_command(&state, &session, command).await {
            IngressOutcome::Handled => {}
            IngressOutcome::Dropped(reason) => drop_ingress(&session, &event_type, reason),
            IngressOutcome::Close(reason) => {
                disconnect_reason = reason;
                break;
            }
        }
    }

    if !slow_consumer_disconnect.load(Ordering::Relaxed) {
        record_ws_disconnect(disconnect_reason);
    }
    tracing::info!(
        event = "gateway.disconnect",
        user_id = %session.auth.user_id,
        connection_id = %connection_id,
        reason = disconnect_reason
    );
    state.realtime.remove(connection_id).await;
    connection_closed(&state, session.auth.user_id).await;
    send_task.abort();
}

fn drop_ingress(session: &GatewaySession, event_type: &str, reason: &'static str) {
    let label = if parley_protocol::event_descriptor(event_type).is_some() {
        event_type
    } else {
        "unknown"
    };
    record_gateway_ingress_rejected(label, reason);
    tracing::debug!(
        event = "gateway.ingress.dropped",
        user_id = %session.auth.user_id,
        event_type,
        reason
    );
}
