//! Reconnecting client links.
//!
//! A [`LinkSession`] owns one logical connection produced by a [`Connector`]
//! and drives it through `Connecting -> Open -> Closed`. After a close it
//! waits for the reconnect delay and starts over, unless reconnection is
//! disabled or [`LinkSession::disconnect`] was called. Both the connect
//! attempt and the delay race the session's cancellation token, so a
//! disconnect prevents any further attempt.
//!
//! Sends are accepted only while the link is `Open`. Nothing is buffered
//! across reconnects: payloads still queued when a connection closes are
//! discarded before the next connection opens.
//!
//! [`ActuatorLink`] layers [`FrameCodec`] on top of a line-oriented session.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LinkConfig;
use crate::frame::{Decoded, FrameCodec};

/// Errors raised by links and connectors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    /// A send was attempted while the link is not open.
    #[error("link is not connected")]
    NotConnected,

    /// The remote end closed the transport.
    #[error("transport closed")]
    TransportClosed,

    /// Opening the transport failed.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// The open transport reported an error.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Connection state of a [`LinkSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// A connect attempt is in progress.
    Connecting,
    /// The transport is usable.
    Open,
    /// No transport. A reconnect may be pending.
    Closed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
        })
    }
}

/// Notifications delivered to the owner of a [`LinkSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A connection opened. Emitted after every successful (re)connect.
    Opened,
    /// One whole payload arrived.
    Message(String),
    /// The open connection closed.
    Closed,
}

/// An open transport carrying whole text payloads.
#[async_trait]
pub trait Connection: Send {
    /// Send one payload.
    async fn send(&mut self, payload: &str) -> Result<(), LinkError>;

    /// Receive the next payload. `None` means the transport closed.
    ///
    /// Must be cancel-safe: it is polled inside `tokio::select!`.
    async fn recv(&mut self) -> Option<Result<String, LinkError>>;

    /// Release the transport.
    async fn close(&mut self) {}
}

/// Opens connections for a [`LinkSession`].
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connection type produced.
    type Conn: Connection + 'static;

    /// Open a new connection.
    async fn connect(&self) -> Result<Self::Conn, LinkError>;

    /// Human-readable target, for logs.
    fn describe(&self) -> String;
}

/// When and whether a closed link reopens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Wait between a close and the next connect attempt.
    pub delay: Duration,
    /// Whether to reopen at all.
    pub enabled: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&LinkConfig::default())
    }
}

impl From<&LinkConfig> for ReconnectPolicy {
    fn from(config: &LinkConfig) -> Self {
        Self {
            delay: config.reconnect_delay(),
            enabled: config.auto_reconnect,
        }
    }
}

/// Handle to a reconnecting link.
///
/// Clones share the same link. The driver task stops once
/// [`disconnect`](Self::disconnect) is called or every handle is dropped.
#[derive(Debug, Clone)]
pub struct LinkSession {
    outbound: mpsc::UnboundedSender<String>,
    state: watch::Receiver<LinkState>,
    cancel: CancellationToken,
}

impl LinkSession {
    /// Start driving `connector` and return the handle plus its event stream.
    pub fn spawn<C: Connector>(
        connector: C,
        policy: ReconnectPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
        let cancel = CancellationToken::new();

        let driver = Driver {
            connector,
            policy,
            outbound: outbound_rx,
            events: event_tx,
            state: state_tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(driver.run());

        (
            Self {
                outbound: outbound_tx,
                state: state_rx,
                cancel,
            },
            event_rx,
        )
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> LinkState {
        if self.cancel.is_cancelled() {
            LinkState::Closed
        } else {
            *self.state.borrow()
        }
    }

    /// Whether the link is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == LinkState::Open
    }

    /// Whether [`disconnect`](Self::disconnect) was called.
    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Queue one payload for the open connection.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::NotConnected`] unless the link is open.
    pub fn send(&self, payload: impl Into<String>) -> Result<(), LinkError> {
        if !self.is_open() {
            return Err(LinkError::NotConnected);
        }
        self.outbound
            .send(payload.into())
            .map_err(|_| LinkError::TransportClosed)
    }

    /// Close the link and suppress any further reconnect.
    pub fn disconnect(&self) {
        if !self.cancel.is_cancelled() {
            debug!("Link disconnect requested");
            self.cancel.cancel();
        }
    }
}

struct Driver<C: Connector> {
    connector: C,
    policy: ReconnectPolicy,
    outbound: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<LinkEvent>,
    state: watch::Sender<LinkState>,
    cancel: CancellationToken,
}

impl<C: Connector> Driver<C> {
    async fn run(mut self) {
        let target = self.connector.describe();

        loop {
            self.state.send_replace(LinkState::Connecting);
            debug!(target = %target, "Connecting");

            let attempt = tokio::select! {
                () = self.cancel.cancelled() => break,
                result = self.connector.connect() => result,
            };

            match attempt {
                Ok(mut conn) => {
                    // Payloads queued against the previous connection are stale.
                    while self.outbound.try_recv().is_ok() {}

                    self.state.send_replace(LinkState::Open);
                    info!(target = %target, "Link open");
                    let _ = self.events.send(LinkEvent::Opened);

                    let outcome = self.pump(&mut conn).await;
                    conn.close().await;
                    self.state.send_replace(LinkState::Closed);
                    let _ = self.events.send(LinkEvent::Closed);

                    match outcome {
                        Ok(()) => info!(target = %target, "Link closed"),
                        Err(e) => warn!(target = %target, error = %e, "Link lost"),
                    }
                }
                Err(e) => {
                    self.state.send_replace(LinkState::Closed);
                    warn!(target = %target, error = %e, "Connect attempt failed");
                }
            }

            if self.cancel.is_cancelled() || !self.policy.enabled {
                break;
            }

            debug!(
                target = %target,
                delay_ms = u64::try_from(self.policy.delay.as_millis()).unwrap_or(u64::MAX),
                "Reconnecting after delay"
            );
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(self.policy.delay) => {}
            }
        }

        self.state.send_replace(LinkState::Closed);
        debug!(target = %target, "Link driver stopped");
    }

    async fn pump(&mut self, conn: &mut C::Conn) -> Result<(), LinkError> {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return Ok(()),
                outbound = self.outbound.recv() => match outbound {
                    Some(payload) => conn.send(&payload).await?,
                    None => {
                        // Every handle is gone; nobody can send or disconnect.
                        self.cancel.cancel();
                        return Ok(());
                    }
                },
                inbound = conn.recv() => match inbound {
                    Some(Ok(payload)) => {
                        let _ = self.events.send(LinkEvent::Message(payload));
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Err(LinkError::TransportClosed),
                },
            }
        }
    }
}

// =============================================================================
// ACTUATOR LINK
// =============================================================================

/// A line received from the actuator.
pub type ActuatorMessage = Decoded;

/// Line-oriented [`LinkSession`] speaking the checksummed frame format.
#[derive(Debug, Clone)]
pub struct ActuatorLink {
    session: LinkSession,
}

impl ActuatorLink {
    /// Start driving a line-oriented connector.
    pub fn spawn<C: Connector>(
        connector: C,
        policy: ReconnectPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (session, events) = LinkSession::spawn(connector, policy);
        (Self { session }, events)
    }

    /// Encode and send one command frame.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::NotConnected`] unless the link is open.
    pub fn send_command(&self, command: &str, parameters: Option<&Value>) -> Result<(), LinkError> {
        let frame = FrameCodec::encode(command, parameters);
        debug!(command, "Sending actuator frame");
        self.session.send(frame)
    }

    /// Decode one received line. Corrupt or malformed frames are logged and dropped.
    #[must_use]
    pub fn decode(line: &str) -> Option<ActuatorMessage> {
        if line.trim().is_empty() {
            return None;
        }
        match FrameCodec::decode(line) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!(error = %e, line = line.trim_end(), "Dropping actuator frame");
                None
            }
        }
    }

    /// Whether the actuator link is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.session.is_open()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> LinkState {
        self.session.state()
    }

    /// Close the link and suppress any further reconnect.
    pub fn disconnect(&self) {
        self.session.disconnect();
    }
}
