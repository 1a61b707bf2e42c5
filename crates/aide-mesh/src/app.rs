use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use aide_auth::NonceStore;
use aide_core::config::MeshConfig;
use aide_queue::OutboundLimiter;

use crate::receipts::DeliveryTracker;
use crate::state::ConfigState;
use crate::transport::SignalRpc;

/// Shared state for the mesh HTTP surface and receive loop.
pub struct MeshState {
    pub config: MeshConfig,
    pub state: Arc<ConfigState>,
    pub nonces: NonceStore,
    pub out_limiter: OutboundLimiter,
    pub delivery: DeliveryTracker,
    pub rpc: Arc<SignalRpc>,
}

/// Assemble the mesh router: health open, everything else signed.
pub fn build_router(state: Arc<MeshState>) -> Router {
    let signed = Router::new()
        .route(
            "/api/v1/message/outbound",
            post(crate::http::outbound::outbound_handler),
        )
        .route("/config/sync", post(crate::http::config::sync_handler))
        .route("/config/status", get(crate::http::config::status_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            crate::auth::require_signature,
        ));

    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .merge(signed)
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
