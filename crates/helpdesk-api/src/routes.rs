//! API routes

use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderName, HeaderValue, Method},
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::auth::{auth_middleware, AppState};
use crate::handlers::{attachments, channels, health, oauth, send, webhooks};

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    if state.api_token_hash.is_none() {
        warn!("No API token configured; management routes are unauthenticated");
    }

    // Health check routes (no auth required)
    let health_routes = Router::new()
        .route("/", get(health::health))
        .route("/live", get(health::liveness))
        .route("/ready", get(health::readiness));

    // Provider-facing routes authenticate by signature or OAuth state
    let public_v1 = Router::new()
        .route(
            "/webhooks/email/:channel_id",
            post(webhooks::receive_email).layer(DefaultBodyLimit::max(state.max_body_bytes)),
        )
        .route("/oauth/:provider/authorize", get(oauth::authorize))
        .route("/oauth/callback", get(oauth::callback));

    let protected_v1 = Router::new()
        .route("/channels/:channel_id/sync", post(channels::sync_channel))
        .route(
            "/channels/:channel_id/oauth/refresh",
            post(channels::refresh_token),
        )
        .route(
            "/send",
            post(send::send_email).layer(DefaultBodyLimit::max(state.max_body_bytes)),
        )
        .route("/attachments/:id/url", get(attachments::download_url))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .nest("/health", health_routes)
        .nest("/api/v1", public_v1.merge(protected_v1))
        .route("/metrics", get(health::metrics))
        .route("/files/*path", get(attachments::serve_file))
        .layer(cors_layer(&state.cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(%origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
            HeaderName::from_static("x-api-key"),
            HeaderName::from_static("x-webhook-signature"),
        ])
}
