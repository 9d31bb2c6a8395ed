//! The bidirectional channel: authentication, ingress demultiplexing, and
//! the per-channel egress loop.
//!
//! Each socket is processed sequentially (one in-flight inbound event at a
//! time) so a driver's position updates keep their causal order; distinct
//! sockets run concurrently. Outbound events flow through the registry's
//! bounded per-channel queue and are drained here by a dedicated sender
//! task, which is what linearises per-channel output and lets backpressure
//! close the channel deterministically.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use dispatch_core::auth::{Claims, Role};
use dispatch_core::connection::Identity;
use dispatch_core::error::DispatchError;
use dispatch_core::ids::{DriverId, OfferId};
use dispatch_core::position::PositionWrite;
use dispatch_core::protocol::{InboundEvent, OutboundEvent};
use dispatch_core::spatial::cell_of;

use crate::app::AppState;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    token: String,
}

/// Upgrade an authenticated connection. Identity is extracted once from the
/// token; individual frames are not revalidated.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let claims = state.signer.verify(&query.token, state.clock.now_ms())?;

    // Drivers must exist durably before they can open a channel.
    let driver_id = match claims.role {
        Role::Driver => {
            let driver = state
                .repo
                .find_by_user(claims.sub)
                .await?
                .ok_or_else(|| {
                    ApiError(DispatchError::AuthFailed("unknown driver identity".into()))
                })?;
            Some(driver.driver_id)
        }
        Role::Rider => None,
        Role::Admin => {
            return Err(ApiError(DispatchError::AuthFailed(
                "admin tokens cannot open channels".into(),
            )))
        }
    };

    Ok(ws.on_upgrade(move |socket| handle_socket(state, claims, driver_id, socket)))
}

async fn handle_socket(
    state: AppState,
    claims: Claims,
    driver_id: Option<DriverId>,
    socket: WebSocket,
) {
    let identity = Identity {
        user_id: claims.sub,
        role: claims.role,
    };
    let (handle, mut egress_rx) = state.registry.attach(identity);
    let channel_id = handle.channel_id();
    // The registry's clone must be the only live sender: once a detach
    // (backpressure, send error, or a replacing reconnect) removes it, the
    // egress loop below sees the queue close and shuts the socket.
    drop(handle);
    info!(user = %claims.sub, channel = %channel_id, role = ?claims.role, "channel attached");

    if let Some(driver_id) = driver_id {
        state.positions.set_connection(driver_id, Some(channel_id));
    }

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Egress: drain the bounded queue onto the socket. Ends when every
    // sender is gone (detach or replacement by a reconnect).
    let egress = tokio::spawn(async move {
        while let Some(event) = egress_rx.recv().await {
            let frame = match serde_json::to_string(&event) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "dropping unserializable outbound event");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    // Ingress: sequential per channel.
    while let Some(message) = ws_rx.next().await {
        let message = match message {
            Ok(m) => m,
            Err(e) => {
                debug!(channel = %channel_id, error = %e, "socket read failed");
                break;
            }
        };
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            // Pings are answered by axum; binary frames are not part of
            // the protocol.
            Message::Binary(_) => {
                warn!(channel = %channel_id, "binary frame is a protocol violation");
                break;
            }
            _ => continue,
        };

        let event: InboundEvent = match serde_json::from_str(&text) {
            Ok(event) => event,
            Err(e) => {
                warn!(channel = %channel_id, error = %e, "unparseable frame, closing channel");
                break;
            }
        };

        handle_event(&state, &claims, driver_id, channel_id, event).await;
    }

    // Detach only if this channel is still the identity's current one.
    state.registry.detach(claims.sub, channel_id);
    if let Some(driver_id) = driver_id {
        let still_connected = state
            .positions
            .get(driver_id)
            .and_then(|r| r.channel)
            .is_some_and(|c| c != channel_id);
        if !still_connected {
            state.positions.clear_on_disconnect(driver_id);
        }
    }
    egress.abort();
    info!(user = %claims.sub, channel = %channel_id, "channel detached");
}

async fn handle_event(
    state: &AppState,
    claims: &Claims,
    driver_id: Option<DriverId>,
    channel_id: dispatch_core::ids::ChannelId,
    event: InboundEvent,
) {
    match event {
        InboundEvent::UserRegister { role, coordinates } => {
            if role != claims.role {
                warn!(user = %claims.sub, "register role disagrees with token, using token role");
            }
            if let (Some(driver_id), Some(coordinates)) = (driver_id, coordinates) {
                write_position(state, claims, driver_id, coordinates);
            }
            state.registry.emit_to_user(
                claims.sub,
                OutboundEvent::UserRegistered {
                    success: true,
                    channel_id,
                },
            );
        }

        InboundEvent::LocationUpdate { coordinates } => {
            let Some(driver_id) = driver_id else {
                debug!(user = %claims.sub, "ignoring location update from non-driver");
                return;
            };
            write_position(state, claims, driver_id, coordinates);
            // The upsert preserves the channel; re-establish it in case the
            // record had expired in between.
            state.positions.set_connection(driver_id, Some(channel_id));
        }

        InboundEvent::RideAccept { request_id } => {
            let Some(driver_id) = driver_id else {
                return;
            };
            handle_accept(state, claims.sub, driver_id, request_id).await;
        }

        InboundEvent::RideReject { request_id } => {
            let Some(driver_id) = driver_id else {
                return;
            };
            if let Err(e) = state.offers.reject_offer(request_id, driver_id) {
                debug!(offer = %request_id, error = %e, "reject on missing offer");
            }
        }
    }
}

fn write_position(
    state: &AppState,
    claims: &Claims,
    driver_id: DriverId,
    coordinates: [f64; 2],
) {
    let cell = match cell_of(coordinates[1], coordinates[0]) {
        Ok(cell) => cell,
        Err(e) => {
            warn!(driver = %driver_id, error = %e, "rejecting position update");
            return;
        }
    };
    // Preserve availability across updates; a busy driver stays busy.
    let is_available = state
        .positions
        .get(driver_id)
        .map(|r| r.is_available)
        .unwrap_or(true);
    state.positions.upsert(PositionWrite {
        driver_id,
        user_id: claims.sub,
        coordinates,
        cell,
        is_online: true,
        is_available,
    });
}

async fn handle_accept(
    state: &AppState,
    user_id: dispatch_core::ids::UserId,
    driver_id: DriverId,
    request_id: OfferId,
) {
    match state.offers.accept_offer(request_id, driver_id).await {
        // The winner's success event is emitted by the offer manager.
        Ok(_) => {}
        Err(e) => {
            let message = match &e {
                DispatchError::Conflict(_) => "taken".to_string(),
                DispatchError::NotFound(_) => "expired_or_gone".to_string(),
                DispatchError::TransientStore(_) | DispatchError::Timeout(_) => {
                    "system_unavailable".to_string()
                }
                other => other.to_string(),
            };
            state.registry.emit_to_user(
                user_id,
                OutboundEvent::RideAcceptFailed {
                    request_id,
                    message,
                },
            );
        }
    }
}
