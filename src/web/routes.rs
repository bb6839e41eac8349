use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers;
use crate::state::AppState;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    // WHEP players and HLS players are served from other origins
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let ingress_routes = Router::new()
        .route("/ingress/whip", post(handlers::whip::whip_ingress))
        .route("/consumer/whip", post(handlers::legacy::consumer_whip));

    let egress_routes = Router::new()
        .route(
            "/egress/whep",
            post(handlers::whep::whep_egress).options(handlers::whep::whep_options),
        )
        .route("/egress/hls", get(handlers::hls::hls_manifest))
        .route("/egress/hls/:segment", get(handlers::hls::hls_segment));

    let api_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .merge(ingress_routes)
        .merge(egress_routes);

    Router::new()
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
