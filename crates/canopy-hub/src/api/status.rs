//! Device status, client list and history endpoints.
//!
//! All three are read-only views of the connection hub.

use axum::extract::{Query, State};
use axum::Json;
use canopy_core::{ClientInfo, DeviceStatus, Envelope};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use super::error::{ApiResult, ErrorResponse};
use crate::state::SharedState;

/// Entries returned by `/api/history` when no limit is given.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

// ============================================================================
// Request/Response Types
// ============================================================================

/// Connected clients.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "count": 1,
    "clients": [{
        "id": "7c1e4b2a-0c55-4d0e-9a53-5d1f1f0f4f11",
        "role": "edge",
        "deviceType": "minipc",
        "deviceName": "Canopy edge",
        "remoteAddress": "10.0.0.12:51544",
        "connectedAt": "2026-03-01T09:00:00Z",
        "lastActivity": "2026-03-01T09:05:12Z"
    }]
}))]
pub struct ClientsResponse {
    /// Number of live sessions.
    pub count: usize,
    /// One row per session, in accept order.
    pub clients: Vec<ClientInfo>,
}

/// Query parameters for `/api/history`.
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct HistoryQuery {
    /// Number of newest entries to return (default 50, capped at the history capacity).
    #[param(minimum = 1, example = 50)]
    pub limit: Option<usize>,
}

/// Recent telemetry history.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HistoryResponse {
    /// Number of returned entries.
    pub count: usize,
    /// Entries currently retained by the hub.
    pub total: usize,
    /// Maximum retained entries.
    pub capacity: usize,
    /// Entries, oldest first.
    pub entries: Vec<Envelope>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Current device status.
#[utoipa::path(
    get,
    path = "/api/status",
    tag = "hub",
    operation_id = "getStatus",
    summary = "Get device status",
    description = "Which device roles are connected, how many sessions are live, and the \
        last measurement flags reported by the edge. Flags reset when no edge is connected.",
    responses(
        (status = 200, description = "Current status", body = DeviceStatus)
    )
)]
pub async fn get_status(State(state): State<SharedState>) -> Json<DeviceStatus> {
    Json(state.hub().await.snapshot())
}

/// Live client list.
#[utoipa::path(
    get,
    path = "/api/clients",
    tag = "hub",
    operation_id = "getClients",
    summary = "List connected clients",
    description = "The same rows broadcast to sessions in `client_list` envelopes.",
    responses(
        (status = 200, description = "Connected clients", body = ClientsResponse)
    )
)]
pub async fn get_clients(State(state): State<SharedState>) -> Json<ClientsResponse> {
    let clients = state.hub().await.clients();
    Json(ClientsResponse {
        count: clients.len(),
        clients,
    })
}

/// Newest history entries.
#[utoipa::path(
    get,
    path = "/api/history",
    tag = "hub",
    operation_id = "getHistory",
    summary = "Get recent telemetry",
    description = "Returns the newest recorded scan, tree, height and sensor envelopes, \
        oldest first. Limits above the history capacity are capped.",
    params(HistoryQuery),
    responses(
        (status = 200, description = "Recent history", body = HistoryResponse),
        (status = 400, description = "Invalid limit", body = ErrorResponse)
    )
)]
pub async fn get_history(
    State(state): State<SharedState>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<HistoryResponse>> {
    let hub = state.hub().await;
    let entries = hub.history_page(query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT))?;
    Ok(Json(HistoryResponse {
        count: entries.len(),
        total: hub.history_len(),
        capacity: hub.history_capacity(),
        entries,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_query_defaults_to_none() {
        let query = HistoryQuery::default();
        assert!(query.limit.is_none());
    }

    #[test]
    fn test_clients_response_serialization() {
        let response = ClientsResponse {
            count: 0,
            clients: Vec::new(),
        };
        let json = serde_json::to_string(&response).unwrap();
        assert_eq!(json, r#"{"count":0,"clients":[]}"#);
    }
}
