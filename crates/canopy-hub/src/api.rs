//! HTTP API routes and handlers.
//!
//! - `health` - Service health checks
//! - `status` - Device status, client list and history
//! - `ws` - WebSocket endpoint into the connection hub
//! - `error` - API error types
//! - `openapi` - OpenAPI specification generation

use axum::http::HeaderValue;
use axum::routing::get;
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::state::SharedState;

pub mod error;
pub mod health;
pub mod openapi;
pub mod status;
pub mod ws;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use openapi::get_openapi_json;

/// Creates the combined router with all endpoints.
///
/// # Route Structure
///
/// ```text
/// /health                - Health check
/// /ws                    - WebSocket endpoint (hub.ws_path)
/// /docs                  - Swagger UI
/// /api
/// ├── /status            - Device status
/// ├── /clients           - Connected clients
/// ├── /history           - Recent telemetry
/// └── /openapi.json      - OpenAPI specification
/// ```
pub fn create_router(state: SharedState) -> Router {
    let ws_path = state.config().ws_path.clone();
    let cors = cors_layer(&state.config().allowed_origins);

    Router::new()
        .merge(SwaggerUi::new("/docs").url("/docs/openapi.json", openapi::ApiDoc::openapi()))
        .nest("/health", health::router())
        .route(&ws_path, get(ws::ws_handler))
        .nest(
            "/api",
            Router::new()
                .route("/status", get(status::get_status))
                .route("/clients", get(status::get_clients))
                .route("/history", get(status::get_history))
                .route("/openapi.json", get(openapi::get_openapi_spec)),
        )
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

/// CORS for the configured origins. An empty list allows any origin.
fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if allowed_origins.is_empty() {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(origins)
}
