//! HTTP and WebSocket endpoint tests against an in-process server.

use axum_test::TestServer;
use canopy_core::{Envelope, HubConfig};
use canopy_hub::{create_router, AppState};
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::mpsc;

fn test_state(dir: &TempDir) -> AppState {
    AppState::new(HubConfig {
        data_file: dir.path().join("history.json"),
        history_capacity: 100,
        ..HubConfig::default()
    })
}

fn test_server(state: &AppState) -> TestServer {
    TestServer::new(create_router(state.clone())).unwrap()
}

/// Join an edge session directly on the hub and record `count` scans.
async fn seed_edge(state: &AppState, count: usize) -> mpsc::UnboundedReceiver<String> {
    let mut hub = state.hub().await;
    let (tx, rx) = mpsc::unbounded_channel();
    let id = hub.accept("10.0.0.7:5000", tx);
    let info = Envelope::device_info("minipc", "rig", "dev-7");
    hub.on_message(id, &info.to_json().unwrap());
    for n in 0..count {
        hub.on_message(id, &format!(r#"{{"type":"scan_data","data":{{"n":{n}}}}}"#));
    }
    rx
}

#[tokio::test]
async fn test_health_reports_sessions() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir);
    let _edge = seed_edge(&state, 0).await;
    let server = test_server(&state);

    let response = server.get("/health").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["sessions"], 1);
}

#[tokio::test]
async fn test_status_reflects_connected_roles() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir);
    let server = test_server(&state);

    let body: Value = server.get("/api/status").await.json();
    assert_eq!(body["edgeConnected"], false);
    assert_eq!(body["sessions"], 0);

    let _edge = seed_edge(&state, 0).await;
    let body: Value = server.get("/api/status").await.json();
    assert_eq!(body["edgeConnected"], true);
    assert_eq!(body["bridgeConnected"], false);
    assert_eq!(body["lidarConnected"], false);
}

#[tokio::test]
async fn test_clients_lists_identified_sessions() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir);
    let _edge = seed_edge(&state, 0).await;
    let server = test_server(&state);

    let body: Value = server.get("/api/clients").await.json();
    assert_eq!(body["count"], 1);
    assert_eq!(body["clients"][0]["role"], "edge");
    assert_eq!(body["clients"][0]["deviceName"], "rig");
    assert_eq!(body["clients"][0]["remoteAddress"], "10.0.0.7:5000");
}

#[tokio::test]
async fn test_history_defaults_and_limits() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir);
    let _edge = seed_edge(&state, 80).await;
    let server = test_server(&state);

    let body: Value = server.get("/api/history").await.json();
    assert_eq!(body["count"], 50);
    assert_eq!(body["total"], 80);
    assert_eq!(body["entries"][49]["data"]["n"], 79);

    let body: Value = server
        .get("/api/history")
        .add_query_param("limit", 5)
        .await
        .json();
    assert_eq!(body["count"], 5);
    assert_eq!(body["entries"][0]["data"]["n"], 75);

    // Capped at capacity.
    let body: Value = server
        .get("/api/history")
        .add_query_param("limit", 10_000)
        .await
        .json();
    assert_eq!(body["count"], 80);
    assert_eq!(body["capacity"], 100);
}

#[tokio::test]
async fn test_history_rejects_zero_limit() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir);
    let server = test_server(&state);

    let response = server.get("/api/history").add_query_param("limit", 0).await;
    response.assert_status_bad_request();
    let body: Value = response.json();
    assert_eq!(body["error"], "invalid_limit");
}

#[tokio::test]
async fn test_openapi_document_is_served() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir);
    let server = test_server(&state);

    let body: Value = server.get("/api/openapi.json").await.json();
    assert_eq!(body["info"]["title"], "canopy hub API");
    assert!(body["paths"]["/api/status"].is_object());
}

#[tokio::test]
async fn test_websocket_session_joins_hub() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir);
    let server = TestServer::builder()
        .http_transport()
        .build(create_router(state.clone()))
        .unwrap();

    let mut socket = server.get_websocket("/ws").await.into_websocket().await;

    let welcome: Value = socket.receive_json().await;
    assert_eq!(welcome["type"], "welcome");
    assert!(welcome["clientId"].is_string());
    let list: Value = socket.receive_json().await;
    assert_eq!(list["type"], "client_list");

    socket
        .send_text(r#"{"type":"device_info","deviceType":"web_client","deviceName":"viewer"}"#)
        .await;
    let list: Value = socket.receive_json().await;
    assert_eq!(list["type"], "client_list");
    assert_eq!(list["clients"][0]["role"], "viewer");

    socket.send_text(r#"{"type":"ping"}"#).await;
    let pong: Value = socket.receive_json().await;
    assert_eq!(pong["type"], "pong");

    assert!(state.hub().await.snapshot().viewer_connected);
}
