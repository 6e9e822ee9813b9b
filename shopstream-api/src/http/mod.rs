// Module: http
// HTTP surface: signaling upgrade, lifecycle routes, metrics, health

pub mod error;
pub mod health;
pub mod lifecycle;
pub mod metrics;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use shopstream_core::auth::TokenService;
use shopstream_sfu::SfuManager;

pub use error::{AppError, AppResult};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SfuManager>,
    pub tokens: TokenService,
}

/// Create the HTTP router with all routes
pub fn create_router(engine: Arc<SfuManager>, tokens: TokenService) -> Router {
    let state = AppState { engine, tokens };

    Router::new()
        .merge(health::create_health_router())
        .route("/metrics", get(metrics::metrics_handler))
        // Signaling channel (WebSocket upgrade)
        .route(
            "/api/rooms/{room_id}/signal",
            get(crate::signaling::signaling_handler),
        )
        // Stream lifecycle notifications from the application layer
        .route("/api/rooms/{room_id}/prewarm", post(lifecycle::prewarm_room))
        .route("/api/rooms/{room_id}/end", post(lifecycle::end_room))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
