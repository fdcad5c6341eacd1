//! The envelope: the unit of exchange on every hub link.
//!
//! Envelopes are JSON objects tagged by a closed `type` enumeration. They are
//! value objects: the hub never edits a received envelope, it builds a new one
//! when it needs to re-stamp or wrap a message.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::error::{CanopyError, Result};

/// Closed set of envelope `type` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// A link announces its role and display name.
    DeviceInfo,
    /// Sent by the hub to a freshly accepted session.
    Welcome,
    /// Replay of recent history to a freshly accepted session.
    History,
    /// Current set of sessions.
    ClientList,
    /// Measurement flags reported by a device.
    StatusUpdate,
    /// Raw lidar samples.
    ScanData,
    /// Objects found by cluster detection.
    TreeData,
    /// Height sensor readings.
    HeightData,
    /// Generic sensor payload.
    SensorData,
    /// Actuator link state reported by the bridge.
    BluetoothStatus,
    /// Unframed reply from the actuator.
    BluetoothResponse,
    /// Error reported by a device.
    ErrorResponse,
    /// Control command addressed to a device role.
    RemoteControl,
    /// Outcome of a control command.
    ControlResponse,
    /// Whether the hub managed to forward a control command.
    CommandForwarded,
    /// Heartbeat request.
    Ping,
    /// Heartbeat reply.
    Pong,
}

impl MessageType {
    /// Wire name of this type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DeviceInfo => "device_info",
            Self::Welcome => "welcome",
            Self::History => "history",
            Self::ClientList => "client_list",
            Self::StatusUpdate => "status_update",
            Self::ScanData => "scan_data",
            Self::TreeData => "tree_data",
            Self::HeightData => "height_data",
            Self::SensorData => "sensor_data",
            Self::BluetoothStatus => "bluetooth_status",
            Self::BluetoothResponse => "bluetooth_response",
            Self::ErrorResponse => "error_response",
            Self::RemoteControl => "remote_control",
            Self::ControlResponse => "control_response",
            Self::CommandForwarded => "command_forwarded",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }

    /// Telemetry the hub relays from one link to all others.
    #[must_use]
    pub const fn is_telemetry(self) -> bool {
        matches!(
            self,
            Self::ScanData
                | Self::TreeData
                | Self::HeightData
                | Self::SensorData
                | Self::BluetoothStatus
                | Self::StatusUpdate
                | Self::BluetoothResponse
                | Self::ErrorResponse
                | Self::ControlResponse
                | Self::CommandForwarded
        )
    }

    /// Telemetry that is also kept in the replay history.
    #[must_use]
    pub const fn is_recorded(self) -> bool {
        matches!(
            self,
            Self::ScanData | Self::TreeData | Self::HeightData | Self::SensorData
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a session's owner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// No identifying `device_info` seen yet, or an unrecognized one.
    #[default]
    Unknown,
    /// Data-collection unit driving the lidar and height sensor.
    Edge,
    /// Bluetooth bridge in front of the actuator.
    Bridge,
    /// Browser or desktop viewer.
    Viewer,
}

impl Role {
    /// Classify a declared `deviceType` string.
    #[must_use]
    pub fn from_device_type(device_type: &str) -> Self {
        match device_type.trim().to_ascii_lowercase().as_str() {
            "minipc" | "edge" => Self::Edge,
            "bluetooth_bridge" | "bridge" => Self::Bridge,
            "web_client" | "mobile_client" | "desktop_client" | "viewer" => Self::Viewer,
            _ => Self::Unknown,
        }
    }

    /// Roles that receive forwarded control commands.
    #[must_use]
    pub const fn is_control_target(self) -> bool {
        matches!(self, Self::Edge | Self::Bridge)
    }

    /// Lowercase name of the role.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Edge => "edge",
            Self::Bridge => "bridge",
            Self::Viewer => "viewer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of a `client_list` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    /// Session id assigned by the hub.
    #[schema(example = "0b5c3c9e-7f55-4b8e-9a62-3c1f1f6b2a10")]
    pub id: String,

    /// Role derived from the declared device type.
    pub role: Role,

    /// Device type as declared by the link.
    #[schema(example = "minipc")]
    pub device_type: String,

    /// Display name as declared by the link.
    #[schema(example = "Survey rig 1")]
    pub device_name: String,

    /// Remote address of the transport.
    #[schema(example = "192.168.1.20:51544")]
    pub remote_address: String,

    /// When the session was accepted.
    pub connected_at: DateTime<Utc>,

    /// When the session last sent anything.
    pub last_activity: DateTime<Utc>,
}

/// A typed message exchanged over any hub link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Message type.
    #[serde(rename = "type")]
    pub kind: MessageType,

    /// Command token for `remote_control` messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Command parameters for `remote_control` messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub parameters: Option<Value>,

    /// Opaque telemetry payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub data: Option<Value>,

    /// Declared device type (`device_info`) or target role (`remote_control`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,

    /// Declared display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,

    /// Device-chosen identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,

    /// Session id stamped by the hub.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Outcome or forwarding status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    /// Human-readable failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Free-form text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Session rows for `client_list`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clients: Option<Vec<ClientInfo>>,

    /// Creation time (RFC 3339).
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// An envelope of the given type stamped with the current time.
    #[must_use]
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            command: None,
            parameters: None,
            data: None,
            device_type: None,
            device_name: None,
            device_id: None,
            client_id: None,
            status: None,
            error: None,
            message: None,
            clients: None,
            timestamp: Utc::now(),
        }
    }

    /// Parse an envelope from raw JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`CanopyError::MalformedEnvelope`] if the text is not JSON or
    /// its `type` is not a recognized value.
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| CanopyError::MalformedEnvelope(e.to_string()))
    }

    /// Serialize to compact JSON text.
    ///
    /// # Errors
    ///
    /// Returns an error if a payload value cannot be represented as JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| CanopyError::MalformedEnvelope(e.to_string()))
    }

    /// Build a `remote_control` command.
    #[must_use]
    pub fn remote_control(command: impl Into<String>, parameters: Option<Value>) -> Self {
        Self {
            command: Some(command.into()),
            parameters,
            ..Self::new(MessageType::RemoteControl)
        }
    }

    /// Build a `control_response` with the command name and outcome token.
    #[must_use]
    pub fn control_response(command: &str, status: &str) -> Self {
        Self::new(MessageType::ControlResponse).with_data(serde_json::json!({
            "command": command,
            "status": status,
        }))
    }

    /// Build a `device_info` announcement.
    #[must_use]
    pub fn device_info(device_type: &str, device_name: &str, device_id: &str) -> Self {
        Self {
            device_type: Some(device_type.to_string()),
            device_name: Some(device_name.to_string()),
            device_id: Some(device_id.to_string()),
            ..Self::new(MessageType::DeviceInfo)
        }
    }

    /// Attach a payload.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Stamp the originating session id.
    #[must_use]
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Attach a status token.
    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// Attach a failure reason.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Attach free-form text.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Attach the session rows of a `client_list`.
    #[must_use]
    pub fn with_clients(mut self, clients: Vec<ClientInfo>) -> Self {
        self.clients = Some(clients);
        self
    }

    /// Attach the command token.
    #[must_use]
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    /// Role addressed by a `remote_control` envelope.
    ///
    /// Commands default to the edge unless `deviceType` names the bridge.
    #[must_use]
    pub fn target_role(&self) -> Role {
        match self.device_type.as_deref().map(Role::from_device_type) {
            Some(Role::Bridge) => Role::Bridge,
            _ => Role::Edge,
        }
    }
}
