//! WebSocket signaling channel.
//!
//! One persistent duplex channel per participant sequences the whole media
//! setup: join → create/connect transports → produce/consume. Requests are
//! handled strictly in the order the participant sent them; participants on
//! different channels proceed concurrently. When the socket closes, for any
//! reason, the participant's transports, producers, and consumers are torn
//! down in dependency order and the room is removed if it ended up empty.

pub mod messages;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use shopstream_core::auth::Claims;
use shopstream_core::{metrics, Error};
use shopstream_sfu::{RoomId, Session, SfuManager};

use crate::http::{AppError, AppState};
use messages::{ClientEnvelope, ClientRequest, Reply};

/// Query parameters for the signaling connection
#[derive(Debug, Deserialize)]
pub struct SignalQuery {
    /// Signed credential binding the user to this room
    pub token: Option<String>,
}

/// WebSocket handler for the per-participant signaling channel.
///
/// Clients provide their access token via query parameter:
/// `ws://host/api/rooms/{room_id}/signal?token={token}`
pub async fn signaling_handler(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Query(query): Query<SignalQuery>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, AppError> {
    let token = query
        .token
        .ok_or_else(|| AppError::unauthorized("Missing token query parameter"))?;

    // Validate the credential (and its room binding) before upgrading.
    let claims = state.tokens.verify_for_room(&token, &room_id)?;

    // Signaling payloads are small; 64KB is generous.
    Ok(ws
        .max_message_size(64 * 1024)
        .on_upgrade(move |socket| handle_socket(socket, state, room_id, claims)))
}

async fn handle_socket(socket: WebSocket, state: AppState, room_id: String, claims: Claims) {
    let tenant = claims.tenant.clone();
    let user = claims.sub.clone();
    let (session, mut engine_events) = state.engine.connect(claims);

    metrics::record_connection(&tenant, &user, &room_id);
    info!(
        participant_id = %session.id(),
        user = %user,
        room_id = %room_id,
        "Signaling channel established"
    );

    let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
    let (mut ws_sink, mut ws_stream) = socket.split();

    // Writer task: everything leaving the server funnels through one sink.
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if ws_sink.send(message).await.is_err() {
                break;
            }
        }
    });

    // Event pump: engine notifications become server-initiated messages.
    let event_out = out_tx.clone();
    let pump = tokio::spawn(async move {
        while let Some(event) = engine_events.recv().await {
            let Ok(json) = serde_json::to_string(&event) else {
                continue;
            };
            if event_out.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // Request loop: strictly sequential per participant.
    while let Some(Ok(message)) = ws_stream.next().await {
        match message {
            Message::Text(text) => {
                let (reply, leaving) =
                    handle_text(&state.engine, &session, &room_id, text.as_str()).await;
                let Ok(json) = serde_json::to_string(&reply) else {
                    continue;
                };
                if out_tx.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
                if leaving {
                    break;
                }
            }
            Message::Close(_) => break,
            // Ping/pong are answered by axum; binary frames are not part of
            // the protocol.
            _ => {}
        }
    }

    // Full cascading teardown: transports → producers/consumers → room
    // membership, then room removal if it ended up empty.
    state.engine.disconnect(session.id()).await;
    metrics::record_disconnection(&tenant, &user, &room_id);

    pump.abort();
    writer.abort();

    info!(
        participant_id = %session.id(),
        user = %user,
        room_id = %room_id,
        "Signaling channel closed"
    );
}

async fn handle_text(
    engine: &Arc<SfuManager>,
    session: &Arc<Session>,
    room_id: &str,
    text: &str,
) -> (Reply, bool) {
    let envelope = match parse_envelope(text) {
        Ok(envelope) => envelope,
        Err((id, error)) => {
            debug!(participant_id = %session.id(), error = %error, "Rejected malformed request");
            return (Reply::failure(id, &error), false);
        }
    };

    let id = envelope.id;
    match dispatch(engine, session, room_id, envelope.request).await {
        Ok(Outcome::Data(data)) => (Reply::success(id, data), false),
        Ok(Outcome::Leaving) => (Reply::success(id, serde_json::json!({})), true),
        Err(error) => {
            warn!(
                participant_id = %session.id(),
                code = error.code(),
                error = %error,
                "Request failed"
            );
            (Reply::failure(id, &error), false)
        }
    }
}

enum Outcome {
    Data(serde_json::Value),
    Leaving,
}

async fn dispatch(
    engine: &Arc<SfuManager>,
    session: &Arc<Session>,
    room_id: &str,
    request: ClientRequest,
) -> Result<Outcome, Error> {
    match request {
        ClientRequest::JoinRoom => {
            let info = engine.join_room(session, RoomId::from(room_id)).await?;
            Ok(Outcome::Data(serde_json::to_value(info)?))
        }
        ClientRequest::CreateTransport { direction } => {
            let descriptor = engine.create_transport(session, direction).await?;
            Ok(Outcome::Data(serde_json::to_value(descriptor)?))
        }
        ClientRequest::ConnectTransport {
            transport_id,
            dtls_parameters,
        } => {
            engine
                .connect_transport(session, &transport_id, dtls_parameters)
                .await?;
            Ok(Outcome::Data(serde_json::json!({})))
        }
        ClientRequest::Produce {
            transport_id,
            kind,
            rtp_parameters,
        } => {
            if !session.claims().can_publish() {
                return Err(Error::Unauthorized(
                    "credential does not allow publishing".to_string(),
                ));
            }
            let producer = engine
                .produce(session, &transport_id, kind, rtp_parameters)
                .await?;
            Ok(Outcome::Data(
                serde_json::json!({ "producer_id": producer.id }),
            ))
        }
        ClientRequest::Consume {
            transport_id,
            producer_id,
        } => {
            // The packet stream is handed to the media edge out of band;
            // the signaling layer only relays the descriptor.
            let (descriptor, _packets) =
                engine.consume(session, &transport_id, &producer_id).await?;
            Ok(Outcome::Data(serde_json::to_value(descriptor)?))
        }
        ClientRequest::CloseProducer { producer_id } => {
            engine.close_producer(session, &producer_id).await?;
            Ok(Outcome::Data(serde_json::json!({})))
        }
        ClientRequest::Leave => Ok(Outcome::Leaving),
    }
}

/// Parse a request envelope, salvaging the correlation id from malformed
/// payloads where possible so the error reply still correlates.
fn parse_envelope(text: &str) -> Result<ClientEnvelope, (u64, Error)> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| (0, Error::Validation(format!("malformed payload: {e}"))))?;
    let id = value.get("id").and_then(serde_json::Value::as_u64).unwrap_or(0);
    serde_json::from_value(value).map_err(|e| (id, Error::Validation(format!("malformed payload: {e}"))))
}
