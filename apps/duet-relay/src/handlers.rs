use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use duet_proto::Role;
use serde::Serialize;

use crate::websocket::SignalingState;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub rooms: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMember {
    pub peer_identity: String,
    pub role: Role,
}

#[derive(Debug, Serialize)]
pub struct RoomStatus {
    pub exists: bool,
    pub members: Vec<RoomMember>,
}

pub async fn health_check(State(state): State<SignalingState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        rooms: state.rooms().room_count(),
    })
}

pub async fn room_status(
    Path(room_id): Path<String>,
    State(state): State<SignalingState>,
) -> Json<RoomStatus> {
    let members = state.rooms().snapshot(&room_id);
    Json(RoomStatus {
        exists: members.is_some(),
        members: members
            .unwrap_or_default()
            .into_iter()
            .map(|(peer_identity, role)| RoomMember {
                peer_identity,
                role,
            })
            .collect(),
    })
}

pub async fn metrics(State(state): State<SignalingState>) -> Response {
    match state.metrics_handle() {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}
