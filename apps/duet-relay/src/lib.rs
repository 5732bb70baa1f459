//! Room and role relay for two-party peer connections.
//!
//! Clients join a room over a WebSocket, receive a role derived from join
//! order, and exchange opaque handshake signals that the relay forwards to
//! the addressed member only.

pub mod cli;
pub mod config;
pub mod handlers;
pub mod metrics;
pub mod rooms;
pub mod websocket;

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use config::{Config, FullRoomPolicy};
pub use websocket::SignalingState;

pub fn router(state: SignalingState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/rooms/:room_id", get(handlers::room_status))
        .route("/metrics", get(handlers::metrics))
        .route("/ws", get(websocket::websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(listener: TcpListener, state: SignalingState) -> std::io::Result<()> {
    axum::serve(listener, router(state)).await
}
