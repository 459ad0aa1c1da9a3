//! API routes

use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::handlers::{health, messages, search};
use crate::state::AppState;

/// CORS layer for the configured origins; `*` allows any origin
fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    if origins.is_empty() {
        return None;
    }

    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    if origins.iter().any(|origin| origin == "*") {
        return Some(layer.allow_origin(Any));
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {:?}", origin);
                None
            }
        })
        .collect();
    Some(layer.allow_origin(allowed))
}

/// Create the API router
pub fn create_router(state: AppState, cors_origins: &[String]) -> Router {
    // Health check routes
    let health_routes = Router::new()
        .route("/", get(health::health))
        .route("/live", get(health::liveness))
        .route("/ready", get(health::readiness));

    // Message routes
    let message_routes = Router::new()
        .route("/:id", get(messages::get_message))
        .route("/:id/deliver", post(messages::deliver_message));

    let api = Router::new()
        .route("/search", post(search::search_messages))
        .route("/list", post(search::list_messages))
        .route("/fields", get(search::list_fields))
        .nest("/messages", message_routes);

    let router = Router::new()
        .nest("/health", health_routes)
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    match cors_layer(cors_origins) {
        Some(cors) => router.layer(cors),
        None => router,
    }
}
