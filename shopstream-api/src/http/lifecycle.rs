//! Stream lifecycle routes consumed by the application layer.
//!
//! The marketplace backend announces broadcast lifecycle transitions here:
//! a room can be pre-warmed ahead of the first join (so the router already
//! exists when viewers arrive) and force-closed when the merchant ends the
//! stream.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use tracing::info;

use shopstream_sfu::{RoomId, RouterCapabilities};

use crate::http::error::AppResult;
use crate::http::AppState;

#[derive(Debug, Serialize)]
pub struct PrewarmResponse {
    pub room_id: RoomId,
    pub capabilities: RouterCapabilities,
}

#[derive(Debug, Serialize)]
pub struct EndResponse {
    pub room_id: RoomId,
    pub ended: bool,
}

/// `POST /api/rooms/{room_id}/prewarm`
pub async fn prewarm_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> AppResult<Json<PrewarmResponse>> {
    let room_id = RoomId::from(room_id);
    let capabilities = state.engine.prewarm(room_id.clone()).await?;
    info!(room_id = %room_id, "Room pre-warmed by application layer");
    Ok(Json(PrewarmResponse {
        room_id,
        capabilities,
    }))
}

/// `POST /api/rooms/{room_id}/end`
pub async fn end_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> AppResult<Json<EndResponse>> {
    let room_id = RoomId::from(room_id);
    state.engine.close_room(&room_id).await?;
    info!(room_id = %room_id, "Room ended by application layer");
    Ok(Json(EndResponse {
        room_id,
        ended: true,
    }))
}
