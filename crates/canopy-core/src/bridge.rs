//! The actuator bridge.
//!
//! [`ActuatorBridge`] sits between the hub and a serial actuator (typically a
//! Bluetooth SPP module). Hub `remote_control` commands are translated to
//! actuator tokens and sent as checksummed frames. Frames coming back are
//! dispatched by their command into hub envelopes, and unframed lines are
//! passed through as `bluetooth_response`.

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::command::{ControlCommand, Outcome};
use crate::config::BridgeConfig;
use crate::edge::forward;
use crate::envelope::{Envelope, MessageType};
use crate::frame::CommandFrame;
use crate::link::{ActuatorLink, ActuatorMessage, LinkEvent, LinkSession};

/// Device type announced by the bridge.
pub const BRIDGE_DEVICE_TYPE: &str = "bluetooth_bridge";

/// Identity and port details announced by the bridge.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// Display name announced to the hub.
    pub device_name: String,
    /// Identifier announced to the hub.
    pub device_id: String,
    /// Actuator port path, reported in `bluetooth_status`.
    pub port: String,
    /// Actuator baud rate, reported in `bluetooth_status`.
    pub baud_rate: u32,
}

impl BridgeSettings {
    /// Settings for the actuator found at `port`.
    #[must_use]
    pub fn new(config: &BridgeConfig, port: impl Into<String>) -> Self {
        Self {
            device_name: config.device_name.clone(),
            device_id: format!("bridge_{}", Uuid::new_v4().simple()),
            port: port.into(),
            baud_rate: config.baud_rate,
        }
    }
}

/// Relays commands and replies between the hub and the actuator.
#[derive(Debug)]
pub struct ActuatorBridge {
    settings: BridgeSettings,
    actuator: ActuatorLink,
    upstream: mpsc::UnboundedSender<Envelope>,
}

impl ActuatorBridge {
    /// Create a bridge over an actuator link.
    #[must_use]
    pub fn new(
        settings: BridgeSettings,
        actuator: ActuatorLink,
    ) -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (upstream, upstream_rx) = mpsc::unbounded_channel();
        (
            Self {
                settings,
                actuator,
                upstream,
            },
            upstream_rx,
        )
    }

    /// Announce this device after the hub link (re)opens.
    pub fn announce(&self) {
        self.emit(Envelope::device_info(
            BRIDGE_DEVICE_TYPE,
            &self.settings.device_name,
            &self.settings.device_id,
        ));
        self.emit_link_status(self.actuator.is_open());
    }

    /// Handle one envelope received from the hub.
    pub fn handle_envelope(&self, envelope: Envelope) {
        match envelope.kind {
            MessageType::RemoteControl if envelope.status.is_none() => {
                let command = envelope.command.unwrap_or_default();
                self.execute(&command, envelope.parameters.as_ref());
            }
            MessageType::Ping => self.emit(Envelope::new(MessageType::Pong)),
            kind => debug!(kind = %kind, "Ignoring hub message"),
        }
    }

    /// Translate and forward one command, emitting its `control_response`.
    pub fn execute(&self, command: &str, parameters: Option<&Value>) -> Outcome {
        let outcome = match command.parse::<ControlCommand>() {
            Err(e) => {
                warn!(error = %e, "Unknown control command");
                Outcome::UnknownCommand
            }
            Ok(_) if !self.actuator.is_open() => Outcome::ActuatorNotConnected,
            Ok(cmd) => match self.actuator.send_command(cmd.actuator_token(), parameters) {
                Ok(()) => Outcome::Forwarded,
                Err(e) => {
                    warn!(command, error = %e, "Actuator send failed");
                    Outcome::ActuatorNotConnected
                }
            },
        };
        info!(command, outcome = %outcome, "Control command handled");
        self.emit(Envelope::control_response(command, outcome.as_str()));
        outcome
    }

    /// Handle one event from the actuator link.
    pub fn handle_actuator_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::Opened => {
                info!(port = %self.settings.port, "Actuator connected");
                self.emit_link_status(true);
                if let Err(e) = self
                    .actuator
                    .send_command(ControlCommand::GetStatus.actuator_token(), None)
                {
                    warn!(error = %e, "Initial status request failed");
                }
            }
            LinkEvent::Closed => {
                warn!(port = %self.settings.port, "Actuator disconnected");
                self.emit_link_status(false);
            }
            LinkEvent::Message(line) => match ActuatorLink::decode(&line) {
                Some(ActuatorMessage::Frame(frame)) => self.dispatch(frame),
                Some(ActuatorMessage::Raw(text)) => self.emit(
                    Envelope::new(MessageType::BluetoothResponse).with_data(Value::String(text)),
                ),
                None => {}
            },
        }
    }

    fn dispatch(&self, frame: CommandFrame) {
        let kind = match frame.command.as_str() {
            "STATUS_RESPONSE" => MessageType::StatusUpdate,
            "SCAN_DATA" => MessageType::ScanData,
            "TREE_DATA" => MessageType::TreeData,
            "HEIGHT_DATA" => MessageType::HeightData,
            "ERROR_RESPONSE" => MessageType::ErrorResponse,
            other => {
                info!(command = other, "Unhandled actuator frame");
                return;
            }
        };
        debug!(command = %frame.command, kind = %kind, "Actuator frame dispatched");
        self.emit(Envelope::new(kind).with_data(frame.parameters.unwrap_or_else(|| json!({}))));
    }

    fn emit_link_status(&self, connected: bool) {
        self.emit(Envelope::new(MessageType::BluetoothStatus).with_data(json!({
            "connected": connected,
            "port": self.settings.port,
            "baudRate": self.settings.baud_rate,
        })));
    }

    fn emit(&self, envelope: Envelope) {
        if self.upstream.send(envelope).is_err() {
            debug!("Upstream closed, dropping envelope");
        }
    }

    /// Close the actuator link without reconnecting.
    pub fn shutdown(&self) {
        self.actuator.disconnect();
    }
}

/// Drive a bridge against a hub link until `shutdown` fires.
pub async fn run_bridge(
    bridge: ActuatorBridge,
    mut upstream: mpsc::UnboundedReceiver<Envelope>,
    mut actuator_events: mpsc::UnboundedReceiver<LinkEvent>,
    hub: LinkSession,
    mut hub_events: mpsc::UnboundedReceiver<LinkEvent>,
    shutdown: CancellationToken,
) {
    info!(device_id = %bridge.settings.device_id, port = %bridge.settings.port, "Bridge running");
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            event = hub_events.recv() => match event {
                Some(LinkEvent::Opened) => bridge.announce(),
                Some(LinkEvent::Message(text)) => match Envelope::from_json(&text) {
                    Ok(envelope) => bridge.handle_envelope(envelope),
                    Err(e) => warn!(error = %e, "Dropping malformed hub message"),
                },
                Some(LinkEvent::Closed) => info!("Hub link closed"),
                None => break,
            },
            Some(event) = actuator_events.recv() => bridge.handle_actuator_event(event),
            Some(envelope) = upstream.recv() => forward(&hub, &envelope),
        }
    }
    bridge.shutdown();
    hub.disconnect();
    info!("Bridge stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{checksum, FrameCodec};
    use crate::link::tests::{MockConnector, MockRemote};
    use crate::link::ReconnectPolicy;
    use std::time::Duration;

    struct Rig {
        bridge: ActuatorBridge,
        upstream: mpsc::UnboundedReceiver<Envelope>,
        events: mpsc::UnboundedReceiver<LinkEvent>,
        remote: Option<MockRemote>,
    }

    impl Rig {
        async fn new(attached: bool) -> Self {
            let (connector, mut remotes, _) = MockConnector::new(if attached { 0 } else { usize::MAX });
            let (actuator, mut events) = ActuatorLink::spawn(
                connector,
                ReconnectPolicy {
                    delay: Duration::from_secs(5),
                    enabled: true,
                },
            );
            let settings = BridgeSettings {
                device_name: "Bridge".into(),
                device_id: "bridge_test".into(),
                port: "/dev/rfcomm0".into(),
                baud_rate: 9600,
            };
            let (bridge, upstream) = ActuatorBridge::new(settings, actuator);

            let remote = if attached {
                let opened = events.recv().await.unwrap();
                bridge.handle_actuator_event(opened);
                Some(remotes.recv().await.unwrap())
            } else {
                None
            };
            Self {
                bridge,
                upstream,
                events,
                remote,
            }
        }

        fn drain(&mut self) -> Vec<Envelope> {
            std::iter::from_fn(|| self.upstream.try_recv().ok()).collect()
        }

        async fn actuator_line(&mut self) -> String {
            self.remote.as_mut().unwrap().from_link.recv().await.unwrap()
        }

        async fn reply(&mut self, line: &str) {
            self.remote
                .as_ref()
                .unwrap()
                .to_link
                .send(line.to_string())
                .unwrap();
            let event = self.events.recv().await.unwrap();
            self.bridge.handle_actuator_event(event);
        }
    }

    fn status_of(envelopes: &[Envelope]) -> Option<String> {
        envelopes
            .iter()
            .find(|e| e.kind == MessageType::ControlResponse)
            .map(|e| e.data.as_ref().unwrap()["status"].as_str().unwrap().to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_reports_status_and_requests_state() {
        let mut rig = Rig::new(true).await;
        let out = rig.drain();
        assert_eq!(out[0].kind, MessageType::BluetoothStatus);
        let data = out[0].data.as_ref().unwrap();
        assert_eq!(data["connected"], true);
        assert_eq!(data["baudRate"], 9600);

        assert!(rig.actuator_line().await.starts_with("GET_STATUS|"));
        rig.bridge.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_known_command_is_framed() {
        let mut rig = Rig::new(true).await;
        rig.actuator_line().await;
        rig.drain();

        let params = json!({"mode": "fast"});
        assert_eq!(rig.bridge.execute("start_scan", Some(&params)), Outcome::Forwarded);
        let wire = rig.actuator_line().await;
        match FrameCodec::decode(&wire).unwrap() {
            ActuatorMessage::Frame(frame) => {
                assert_eq!(frame.command, "LIDAR_START_SCAN");
                assert_eq!(frame.parameters, Some(params));
            }
            ActuatorMessage::Raw(raw) => panic!("expected frame, got {raw}"),
        }
        assert_eq!(status_of(&rig.drain()).as_deref(), Some("forwarded"));
        rig.bridge.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_actuator_not_connected() {
        let mut rig = Rig::new(false).await;
        assert_eq!(
            rig.bridge.execute("get_status", None),
            Outcome::ActuatorNotConnected
        );
        assert_eq!(
            status_of(&rig.drain()).as_deref(),
            Some("actuator_not_connected")
        );
        rig.bridge.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_command() {
        let mut rig = Rig::new(true).await;
        rig.drain();
        assert_eq!(rig.bridge.execute("warp", None), Outcome::UnknownCommand);
        assert_eq!(status_of(&rig.drain()).as_deref(), Some("unknown_command"));
        rig.bridge.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_dispatch_by_command() {
        let mut rig = Rig::new(true).await;
        rig.drain();

        let wire = FrameCodec::encode("STATUS_RESPONSE", Some(&json!({"isScanning": true})));
        rig.reply(&wire).await;
        let out = rig.drain();
        assert_eq!(out[0].kind, MessageType::StatusUpdate);
        assert_eq!(out[0].data.as_ref().unwrap()["isScanning"], true);

        rig.reply(&FrameCodec::encode("HEIGHT_DATA", Some(&json!({"currentHeight": 1.2}))))
            .await;
        assert_eq!(rig.drain()[0].kind, MessageType::HeightData);

        rig.reply(&FrameCodec::encode("HEARTBEAT", None)).await;
        assert!(rig.drain().is_empty());
        rig.bridge.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_raw_and_corrupt_lines() {
        let mut rig = Rig::new(true).await;
        rig.drain();

        rig.reply("OK READY").await;
        let out = rig.drain();
        assert_eq!(out[0].kind, MessageType::BluetoothResponse);
        assert_eq!(out[0].data, Some(Value::String("OK READY".into())));

        let bad_sum = checksum("SCAN_DATA").wrapping_add(1);
        rig.reply(&format!("SCAN_DATA|1|{bad_sum}")).await;
        assert!(rig.drain().is_empty());
        rig.bridge.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_forwarded_notice_is_ignored() {
        let mut rig = Rig::new(true).await;
        rig.drain();
        let mut notice = Envelope::remote_control("start_scan", None);
        notice.status = Some("forwarded".into());
        rig.bridge.handle_envelope(notice);
        assert!(rig.drain().is_empty());
        rig.bridge.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_announce() {
        let mut rig = Rig::new(false).await;
        rig.bridge.announce();
        let out = rig.drain();
        assert_eq!(out[0].device_type.as_deref(), Some(BRIDGE_DEVICE_TYPE));
        assert_eq!(out[1].data.as_ref().unwrap()["connected"], false);
        rig.bridge.shutdown();
    }
}
