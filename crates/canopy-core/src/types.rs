//! Shared types and OpenAPI schemas.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Last measurement flags reported by the edge through `status_update`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct MeasurementFlags {
    /// Lidar serial link is open.
    pub lidar_connected: bool,
    /// Height sensor serial link is open.
    pub stp23l_connected: bool,
    /// Continuous scanning is active.
    pub is_scanning: bool,
    /// Height measurement is active.
    pub is_measuring: bool,
}

/// Snapshot derived from the live sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    /// An edge-role session is connected.
    pub edge_connected: bool,
    /// A bridge-role session is connected.
    pub bridge_connected: bool,
    /// At least one viewer-role session is connected.
    pub viewer_connected: bool,
    /// Number of live sessions.
    pub sessions: usize,
    /// Last flags reported by the edge, reset when no edge remains.
    #[serde(flatten)]
    pub flags: MeasurementFlags,
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Service status.
    #[schema(example = "ok")]
    pub status: String,

    /// Service version.
    #[schema(example = "0.1.0")]
    pub version: String,

    /// Number of live sessions.
    #[schema(example = 3)]
    pub sessions: usize,
}
