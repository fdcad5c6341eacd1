//! OpenAPI specification generation for the canopy hub API.
//!
//! The document covers the read-only REST surface. The WebSocket endpoint
//! carries envelopes, whose schema is included for client generators.

use axum::Json;
use canopy_core::{ClientInfo, DeviceStatus, Envelope, HealthResponse, MessageType, Role};
use utoipa::OpenApi;

use super::error::ErrorResponse;
use super::status::{ClientsResponse, HistoryResponse};

/// Serve the OpenAPI specification as JSON at `/api/openapi.json`.
pub async fn get_openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Returns the OpenAPI specification as pretty JSON (for writing to file).
///
/// # Errors
///
/// Returns an error if the document cannot be serialized.
pub fn get_openapi_json() -> serde_json::Result<String> {
    ApiDoc::openapi().to_pretty_json()
}

/// Main OpenAPI document structure for the canopy hub.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "canopy hub API",
        version = "0.1.0",
        description = r#"
# canopy hub API

The hub relays telemetry and control commands between a lidar survey rig
(the edge), a Bluetooth actuator bridge and any number of viewers.

## Overview

- Devices and viewers connect to the WebSocket endpoint (`/ws` by default)
  and exchange JSON envelopes.
- Each session announces itself with `device_info`; its declared
  `deviceType` decides its role.
- `remote_control` envelopes are forwarded to the edge (or the bridge when
  `deviceType` names it). When no target is connected every session gets a
  failed `command_forwarded`.
- Scan, tree, height and sensor telemetry is kept in a bounded history that
  is replayed to new sessions and persisted to disk.

The REST endpoints below are read-only views of the hub.
"#,
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers(
        (url = "/", description = "Local canopy hub")
    ),
    tags(
        (
            name = "system",
            description = "Health checks"
        ),
        (
            name = "hub",
            description = "Connected devices, sessions and recorded telemetry"
        )
    ),
    paths(
        super::health::health_check,
        super::status::get_status,
        super::status::get_clients,
        super::status::get_history,
    ),
    components(
        schemas(
            ErrorResponse,
            HealthResponse,
            DeviceStatus,
            ClientInfo,
            ClientsResponse,
            HistoryResponse,
            Envelope,
            MessageType,
            Role,
        )
    )
)]
pub struct ApiDoc;
