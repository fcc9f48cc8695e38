pub mod config;
pub mod handlers;
pub mod metrics;
pub mod relay;
pub mod session;
pub mod storage;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::relay::RelayState;
use crate::storage::SessionStore;

pub type SharedStore = Arc<dyn SessionStore>;

#[derive(Clone)]
pub struct AppState {
    pub store: SharedStore,
    pub relay: RelayState,
}

impl AppState {
    pub fn new(store: SharedStore, relay_idle_timeout: Duration) -> Self {
        Self {
            store,
            relay: RelayState::new(relay_idle_timeout),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_text))
        .route("/sessions", post(handlers::register_session))
        .route("/sessions/claim", post(handlers::claim_session))
        .route("/sessions/code/:code", get(handlers::lookup_code))
        .route("/sessions/:machine_id", get(handlers::get_session))
        .route("/ws/:machine_id", get(relay::websocket_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
