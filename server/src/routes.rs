use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;

use crate::app_state::SharedState;
use crate::{handlers, stream};

pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/ws", get(handlers::ws_handler))
        .route("/stream/{id}", get(stream::stream_track))
        .route("/health", get(handlers::health))
        .route("/admin/reload", post(handlers::admin_reload))
        // Browser clients fetch the stream proxy cross-origin.
        .layer(CorsLayer::permissive())
        .with_state(state)
}
