//! End-to-end routing scenarios through the connection hub.

use canopy_core::{ConnectionHub, Envelope, MessageType, SessionId};
use serde_json::json;
use tokio::sync::mpsc;

struct Peer {
    id: SessionId,
    rx: mpsc::UnboundedReceiver<String>,
}

impl Peer {
    fn join(hub: &mut ConnectionHub, device_type: &str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = hub.accept("10.0.0.2:50000", tx);
        let info = Envelope::device_info(device_type, device_type, "test-device");
        hub.on_message(id, &info.to_json().unwrap());
        let mut peer = Self { id, rx };
        peer.raw();
        peer
    }

    fn raw(&mut self) -> Vec<String> {
        std::iter::from_fn(|| self.rx.try_recv().ok()).collect()
    }

    fn envelopes(&mut self) -> Vec<Envelope> {
        self.raw()
            .iter()
            .map(|text| Envelope::from_json(text).unwrap())
            .collect()
    }
}

fn drain_all(peers: &mut [&mut Peer]) {
    for peer in peers {
        peer.raw();
    }
}

#[test]
fn test_remote_control_reaches_edge_verbatim() {
    let mut hub = ConnectionHub::default();
    let mut edge = Peer::join(&mut hub, "minipc");
    let mut viewer = Peer::join(&mut hub, "web_client");
    let mut other = Peer::join(&mut hub, "desktop_client");
    drain_all(&mut [&mut edge, &mut viewer, &mut other]);

    let command = r#"{"type":"remote_control","command":"start_scan","parameters":{"fast":true}}"#;
    hub.on_message(viewer.id, command);

    // The edge gets the command exactly as sent, and nothing else.
    assert_eq!(edge.raw(), vec![command.to_string()]);

    // Other sessions see a forwarded notice.
    let seen = other.envelopes();
    let notice = seen
        .iter()
        .find(|e| e.kind == MessageType::RemoteControl)
        .expect("forwarded notice");
    assert_eq!(notice.status.as_deref(), Some("forwarded"));
    let data = notice.data.as_ref().unwrap();
    assert_eq!(data["command"], "start_scan");
    assert_eq!(data["status"], "forwarded");
    assert_eq!(data["parameters"], json!({"fast": true}));
    assert_eq!(notice.client_id.as_deref(), Some(viewer.id.to_string().as_str()));

    // The issuer gets a success acknowledgement but not its own notice.
    let issuer = viewer.envelopes();
    assert!(issuer.iter().all(|e| e.kind != MessageType::RemoteControl));
    let ack = issuer
        .iter()
        .find(|e| e.kind == MessageType::CommandForwarded)
        .expect("acknowledgement");
    assert_eq!(ack.status.as_deref(), Some("success"));
}

#[test]
fn test_remote_control_without_target_fails_for_everyone() {
    let mut hub = ConnectionHub::default();
    let mut viewer = Peer::join(&mut hub, "web_client");
    let mut bridge = Peer::join(&mut hub, "bluetooth_bridge");
    drain_all(&mut [&mut viewer, &mut bridge]);

    hub.on_message(
        viewer.id,
        r#"{"type":"remote_control","command":"start_scan"}"#,
    );

    for peer in [&mut viewer, &mut bridge] {
        let got = peer.envelopes();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].kind, MessageType::CommandForwarded);
        assert_eq!(got[0].status.as_deref(), Some("failed"));
        assert!(got[0].error.is_some());
    }
}

#[test]
fn test_command_is_not_queued_for_a_late_target() {
    let mut hub = ConnectionHub::default();
    let viewer = Peer::join(&mut hub, "web_client");
    hub.on_message(
        viewer.id,
        r#"{"type":"remote_control","command":"get_status"}"#,
    );

    let mut edge = Peer::join(&mut hub, "minipc");
    hub.on_message(edge.id, r#"{"type":"ping"}"#);
    let kinds: Vec<_> = edge.envelopes().into_iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![MessageType::Pong]);
}

#[test]
fn test_history_never_exceeds_capacity() {
    let mut hub = ConnectionHub::new(1000, 50);
    let edge = Peer::join(&mut hub, "minipc");
    for n in 0..1500 {
        hub.on_message(
            edge.id,
            &format!(r#"{{"type":"sensor_data","data":{{"n":{n}}}}}"#),
        );
        assert!(hub.history_len() <= 1000);
    }
    let recent = hub.recent_history(1000);
    assert_eq!(recent.first().unwrap().data.as_ref().unwrap()["n"], 500);
    assert_eq!(recent.last().unwrap().data.as_ref().unwrap()["n"], 1499);
}

#[test]
fn test_device_status_tracks_sessions() {
    let mut hub = ConnectionHub::default();
    assert_eq!(hub.snapshot().sessions, 0);

    let edge = Peer::join(&mut hub, "minipc");
    let bridge = Peer::join(&mut hub, "bluetooth_bridge");
    let status = hub.snapshot();
    assert!(status.edge_connected);
    assert!(status.bridge_connected);
    assert!(!status.viewer_connected);
    assert_eq!(status.sessions, 2);

    hub.on_close(bridge.id);
    hub.on_close(edge.id);
    let status = hub.snapshot();
    assert!(!status.edge_connected);
    assert!(!status.bridge_connected);
    assert_eq!(status.sessions, 0);
}

#[test]
fn test_client_list_reflects_identification() {
    let mut hub = ConnectionHub::default();
    let mut viewer = Peer::join(&mut hub, "web_client");
    let _edge = Peer::join(&mut hub, "minipc");

    let lists: Vec<Envelope> = viewer
        .envelopes()
        .into_iter()
        .filter(|e| e.kind == MessageType::ClientList)
        .collect();
    let last = lists.last().unwrap().clients.as_ref().unwrap();
    assert_eq!(last.len(), 2);
    assert_eq!(last[1].device_type, "minipc");
    assert_eq!(last[1].role, canopy_core::Role::Edge);
}
