//! The connection hub: session registry, role detection and routing.
//!
//! [`ConnectionHub`] is a plain state machine. The transport layer calls
//! [`accept`](ConnectionHub::accept), [`on_message`](ConnectionHub::on_message)
//! and [`on_close`](ConnectionHub::on_close), and the hub writes outbound JSON
//! text into each session's outbox channel. Callers serialize access (the
//! server keeps the hub behind a `tokio::sync::Mutex`), so every mutation
//! happens one message at a time.
//!
//! # Routing
//!
//! | inbound | action |
//! |---|---|
//! | `device_info` | set role (while still unknown) and name, broadcast `client_list` |
//! | telemetry | re-stamp, record `scan/tree/height/sensor_data`, relay to every other session |
//! | `status_update` from edge/bridge | as telemetry, but never sent to sessions of the sender's role |
//! | `remote_control` | verbatim to the first session of the target role, `forwarded` notice to the rest |
//! | `ping` | `pong` to the sender |
//!
//! Only one session per control role is expected. When several sessions
//! declare the same role, the one accepted first receives forwarded commands.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::HubConfig;
use crate::envelope::{ClientInfo, Envelope, MessageType, Role};
use crate::error::{CanopyError, Result};
use crate::history::HistoryBuffer;
use crate::storage::PersistedHistory;
use crate::types::{DeviceStatus, MeasurementFlags};

/// Identifier assigned to each accepted session.
pub type SessionId = Uuid;

/// Channel receiving a session's outbound JSON text.
pub type Outbox = mpsc::UnboundedSender<String>;

/// Default number of entries replayed on accept.
pub const DEFAULT_REPLAY_COUNT: usize = 50;

#[derive(Debug)]
struct Session {
    id: SessionId,
    role: Role,
    device_type: String,
    device_name: String,
    remote_address: String,
    connected_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    outbox: Outbox,
}

impl Session {
    fn info(&self) -> ClientInfo {
        ClientInfo {
            id: self.id.to_string(),
            role: self.role,
            device_type: self.device_type.clone(),
            device_name: self.device_name.clone(),
            remote_address: self.remote_address.clone(),
            connected_at: self.connected_at,
            last_activity: self.last_activity,
        }
    }

    fn deliver(&self, text: &str) {
        if self.outbox.send(text.to_string()).is_err() {
            debug!(session_id = %self.id, "Dropping message for closed session");
        }
    }
}

/// Registry of live sessions plus the bounded replay history.
#[derive(Debug)]
pub struct ConnectionHub {
    sessions: Vec<Session>,
    history: HistoryBuffer,
    flags: MeasurementFlags,
    replay_count: usize,
}

impl Default for ConnectionHub {
    fn default() -> Self {
        Self::new(crate::history::DEFAULT_CAPACITY, DEFAULT_REPLAY_COUNT)
    }
}

impl ConnectionHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new(history_capacity: usize, replay_count: usize) -> Self {
        Self {
            sessions: Vec::new(),
            history: HistoryBuffer::new(history_capacity),
            flags: MeasurementFlags::default(),
            replay_count,
        }
    }

    /// Create a hub sized from configuration.
    #[must_use]
    pub fn from_config(config: &HubConfig) -> Self {
        Self::new(config.history_capacity, config.replay_count)
    }

    // =========================================================================
    // SESSION LIFECYCLE
    // =========================================================================

    /// Register a new session in role `unknown`.
    ///
    /// The session receives `welcome` and then one `history` replay of the
    /// most recent entries. Every session then receives the new client list.
    pub fn accept(&mut self, remote_address: impl Into<String>, outbox: Outbox) -> SessionId {
        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4(),
            role: Role::Unknown,
            device_type: String::new(),
            device_name: String::new(),
            remote_address: remote_address.into(),
            connected_at: now,
            last_activity: now,
            outbox,
        };
        let id = session.id;
        info!(session_id = %id, remote = %session.remote_address, "Session accepted");

        let welcome = Envelope::new(MessageType::Welcome)
            .with_client_id(id.to_string())
            .with_message("Connected to canopy hub");
        send_envelope(&session, &welcome);

        let recent = self.history.tail(self.replay_count);
        if !recent.is_empty() {
            match serde_json::to_value(&recent) {
                Ok(entries) => {
                    debug!(session_id = %id, count = recent.len(), "Replaying history");
                    send_envelope(&session, &Envelope::new(MessageType::History).with_data(entries));
                }
                Err(e) => warn!(session_id = %id, error = %e, "Failed to encode history replay"),
            }
        }

        self.sessions.push(session);
        self.broadcast_client_list();
        id
    }

    /// Remove a session. Returns `false` if it was already gone.
    pub fn on_close(&mut self, id: SessionId) -> bool {
        let Some(index) = self.position(id) else {
            return false;
        };
        let session = self.sessions.remove(index);
        info!(session_id = %id, role = %session.role, "Session closed");

        if !self.sessions.iter().any(|s| s.role == Role::Edge) {
            self.flags = MeasurementFlags::default();
        }
        self.broadcast_client_list();
        true
    }

    /// Handle one inbound payload from `id`.
    ///
    /// Malformed payloads are logged and dropped without affecting any
    /// other session.
    pub fn on_message(&mut self, id: SessionId, raw: &str) {
        let Some(index) = self.position(id) else {
            debug!(session_id = %id, "Message from unknown session");
            return;
        };
        self.sessions[index].last_activity = Utc::now();

        let envelope = match Envelope::from_json(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(session_id = %id, error = %e, "Dropping malformed envelope");
                return;
            }
        };

        let kind = envelope.kind;
        match kind {
            MessageType::DeviceInfo => self.identify(index, &envelope),
            MessageType::RemoteControl => self.route_control(index, raw, &envelope),
            MessageType::Ping => {
                send_envelope(&self.sessions[index], &Envelope::new(MessageType::Pong));
            }
            MessageType::Pong => {}
            kind if kind.is_telemetry() => self.relay(index, raw, envelope),
            kind => debug!(session_id = %id, kind = %kind, "Ignoring hub-only message"),
        }
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    /// Status derived from the live sessions.
    #[must_use]
    pub fn snapshot(&self) -> DeviceStatus {
        let has = |role| self.sessions.iter().any(|s| s.role == role);
        let edge_connected = has(Role::Edge);
        DeviceStatus {
            edge_connected,
            bridge_connected: has(Role::Bridge),
            viewer_connected: has(Role::Viewer),
            sessions: self.sessions.len(),
            flags: if edge_connected {
                self.flags
            } else {
                MeasurementFlags::default()
            },
        }
    }

    /// Rows of the client list, in accept order.
    #[must_use]
    pub fn clients(&self) -> Vec<ClientInfo> {
        self.sessions.iter().map(Session::info).collect()
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Role of a session, if it is live.
    #[must_use]
    pub fn role_of(&self, id: SessionId) -> Option<Role> {
        self.position(id).map(|i| self.sessions[i].role)
    }

    /// The newest `count` history entries, oldest first.
    #[must_use]
    pub fn recent_history(&self, count: usize) -> Vec<Envelope> {
        self.history.tail(count)
    }

    /// The newest `limit` history entries, oldest first, capped at capacity.
    ///
    /// # Errors
    ///
    /// Returns [`CanopyError::InvalidLimit`] when `limit` is zero.
    pub fn history_page(&self, limit: usize) -> Result<Vec<Envelope>> {
        if limit == 0 {
            return Err(CanopyError::InvalidLimit(
                "limit must be at least 1".into(),
            ));
        }
        Ok(self.history.tail(limit.min(self.history.capacity())))
    }

    /// Number of retained history entries.
    #[must_use]
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Maximum number of retained history entries.
    #[must_use]
    pub const fn history_capacity(&self) -> usize {
        self.history.capacity()
    }

    // =========================================================================
    // PERSISTENCE
    // =========================================================================

    /// Document to write to the history file.
    #[must_use]
    pub fn to_persisted(&self) -> PersistedHistory {
        PersistedHistory {
            timestamp: Utc::now(),
            history: self.history.to_vec(),
            device_status: self.snapshot(),
            clients: self.sessions.iter().map(|s| s.id.to_string()).collect(),
        }
    }

    /// Reload history from a saved document, keeping the newest entries.
    pub fn restore(&mut self, saved: PersistedHistory) {
        let offered = saved.history.len();
        self.history.restore(saved.history);
        info!(
            restored = self.history.len(),
            offered,
            saved_at = %saved.timestamp,
            "History restored"
        );
    }

    // =========================================================================
    // ROUTING
    // =========================================================================

    fn position(&self, id: SessionId) -> Option<usize> {
        self.sessions.iter().position(|s| s.id == id)
    }

    /// First session holding `role`, in accept order.
    fn find_by_role(&self, role: Role) -> Option<usize> {
        self.sessions.iter().position(|s| s.role == role)
    }

    fn identify(&mut self, index: usize, envelope: &Envelope) {
        let declared = envelope.device_type.clone().unwrap_or_default();
        let role = Role::from_device_type(&declared);

        let session = &mut self.sessions[index];
        if session.role == Role::Unknown {
            session.role = role;
            session.device_type = declared;
        } else if role != session.role {
            debug!(
                session_id = %session.id,
                current = %session.role,
                declared = %role,
                "Role already set, ignoring new declaration"
            );
        }
        if let Some(name) = &envelope.device_name {
            session.device_name.clone_from(name);
        }

        let (id, role) = (session.id, session.role);
        info!(session_id = %id, role = %role, name = %self.sessions[index].device_name, "Session identified");

        if role.is_control_target()
            && self
                .sessions
                .iter()
                .any(|s| s.id != id && s.role == role)
        {
            warn!(
                session_id = %id,
                role = %role,
                "Another session already holds this role; commands go to the first one"
            );
        }

        self.broadcast_client_list();
    }

    fn relay(&mut self, index: usize, raw: &str, inbound: Envelope) {
        let sender = &self.sessions[index];
        let (sender_id, sender_role) = (sender.id, sender.role);
        let kind = inbound.kind;

        let data = inbound
            .data
            .unwrap_or_else(|| serde_json::from_str(raw).unwrap_or(Value::Null));

        if kind == MessageType::StatusUpdate && sender_role == Role::Edge {
            match serde_json::from_value::<MeasurementFlags>(data.clone()) {
                Ok(flags) => self.flags = flags,
                Err(e) => warn!(session_id = %sender_id, error = %e, "Unreadable status flags"),
            }
        }

        let mut relayed = Envelope::new(kind)
            .with_data(data)
            .with_client_id(sender_id.to_string());
        relayed.command = inbound.command;
        relayed.status = inbound.status;
        relayed.error = inbound.error;
        relayed.message = inbound.message;

        if kind.is_recorded() {
            self.history.push(relayed.clone());
        }

        // A device's own status never echoes back to devices of its role.
        let skip_role = (kind == MessageType::StatusUpdate && sender_role.is_control_target())
            .then_some(sender_role);

        self.send_where(&relayed, |s| {
            s.id != sender_id && skip_role.map_or(true, |role| s.role != role)
        });
    }

    fn route_control(&mut self, index: usize, raw: &str, envelope: &Envelope) {
        let sender_id = self.sessions[index].id;
        let target_role = envelope.target_role();
        let command = envelope.command.clone().unwrap_or_default();

        let Some(target) = self.find_by_role(target_role) else {
            warn!(
                session_id = %sender_id,
                command = %command,
                target = %target_role,
                "No session holds the target role; command dropped"
            );
            let failed = Envelope::new(MessageType::CommandForwarded)
                .with_command(command)
                .with_status("failed")
                .with_error(format!("no {target_role} connected"));
            self.send_where(&failed, |_| true);
            return;
        };

        let target_id = self.sessions[target].id;
        self.sessions[target].deliver(raw);
        info!(
            session_id = %sender_id,
            target_id = %target_id,
            command = %command,
            "Control command forwarded"
        );

        let notice = Envelope::new(MessageType::RemoteControl)
            .with_client_id(sender_id.to_string())
            .with_status("forwarded")
            .with_data(json!({
                "command": command,
                "parameters": envelope.parameters,
                "status": "forwarded",
            }));
        self.send_where(&notice, |s| s.id != sender_id && s.role != target_role);

        let ack = Envelope::new(MessageType::CommandForwarded)
            .with_command(command.clone())
            .with_status("success")
            .with_data(json!({ "command": command, "target": target_role }));
        self.send_where(&ack, |s| s.role != target_role);
    }

    fn broadcast_client_list(&self) {
        let list = Envelope::new(MessageType::ClientList).with_clients(self.clients());
        self.send_where(&list, |_| true);
    }

    fn send_where(&self, envelope: &Envelope, include: impl Fn(&Session) -> bool) {
        let text = match envelope.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(kind = %envelope.kind, error = %e, "Failed to encode envelope");
                return;
            }
        };
        for session in self.sessions.iter().filter(|s| include(s)) {
            session.deliver(&text);
        }
    }
}

fn send_envelope(session: &Session, envelope: &Envelope) {
    match envelope.to_json() {
        Ok(text) => session.deliver(&text),
        Err(e) => warn!(session_id = %session.id, error = %e, "Failed to encode envelope"),
    }
}
