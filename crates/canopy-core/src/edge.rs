//! The edge data-collection unit.
//!
//! [`EdgeController`] owns two independent capabilities, lidar scanning and
//! STP-23L height measurement, each moving through
//! `Disconnected -> Idle -> Active`. Commands arrive as `remote_control`
//! envelopes from the hub and every command answers with exactly one
//! `control_response`. Serial ports are reached through the [`SensorPorts`]
//! and [`SensorLink`] traits so the controller never touches the OS.
//!
//! Continuous scanning is a spawned task that writes `SCAN` to the lidar,
//! sleeps for the scan interval and repeats. The task rechecks the active
//! flag and its cancellation token each time it wakes, so `stop_scan`
//! prevents any further write even when a tick is already scheduled.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cluster::{ClusterDetector, DetectedObject, RangeSample};
use crate::command::{ControlCommand, Outcome};
use crate::config::EdgeConfig;
use crate::envelope::{Envelope, MessageType};
use crate::link::{LinkError, LinkEvent, LinkSession};

/// Device type announced by the edge.
pub const EDGE_DEVICE_TYPE: &str = "minipc";

/// Line written to the lidar for each continuous-scan tick.
pub const SCAN_REQUEST: &str = "SCAN";

/// Line written to the lidar for `single_scan`.
pub const SINGLE_SCAN_REQUEST: &str = "SINGLE_SCAN";

/// A sensor the edge drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Lidar scanning.
    Scan,
    /// STP-23L height measurement.
    Height,
}

impl Capability {
    const fn not_connected(self) -> Outcome {
        match self {
            Self::Scan => Outcome::LidarNotConnected,
            Self::Height => Outcome::Stp23lNotConnected,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Scan => "lidar",
            Self::Height => "stp23l",
        })
    }
}

/// Per-capability state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CapabilityState {
    /// No sensor link.
    #[default]
    Disconnected,
    /// Link open, not measuring.
    Idle,
    /// Link open and measuring.
    Active,
}

/// Something a sensor link reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SensorEvent {
    /// One newline-delimited line.
    Line {
        /// Source sensor.
        capability: Capability,
        /// Line text without the terminator.
        line: String,
    },
    /// The link closed on its own.
    Closed(Capability),
}

/// An open serial link to one sensor.
pub trait SensorLink: Send + Sync {
    /// Write one line. The terminator is added by the implementation.
    ///
    /// May block until the port's write timeout. The scan loop calls it from
    /// the blocking pool; one-off writes call it inline.
    ///
    /// # Errors
    ///
    /// Returns an error if the link is closed or the write fails.
    fn write_line(&self, line: &str) -> Result<(), LinkError>;

    /// Whether the link is still usable.
    fn is_open(&self) -> bool;

    /// Release the link.
    fn close(&self);
}

/// Locates and opens sensor ports.
#[async_trait]
pub trait SensorPorts: Send + Sync {
    /// Find a port for `capability`, if one is attached.
    fn locate(&self, capability: Capability) -> Option<String>;

    /// Open `port`. Received lines and the eventual close go to `events`.
    async fn open(
        &self,
        capability: Capability,
        port: &str,
        events: mpsc::UnboundedSender<SensorEvent>,
    ) -> Result<Arc<dyn SensorLink>, LinkError>;
}

/// Settings for an [`EdgeController`].
#[derive(Debug, Clone)]
pub struct EdgeSettings {
    /// Display name announced to the hub.
    pub device_name: String,
    /// Identifier announced to the hub.
    pub device_id: String,
    /// Wait between continuous-scan requests.
    pub scan_interval: Duration,
    /// Bound on retained lidar samples and height readings.
    pub max_scan_samples: usize,
}

impl From<&EdgeConfig> for EdgeSettings {
    fn from(config: &EdgeConfig) -> Self {
        Self {
            device_name: config.device_name.clone(),
            device_id: format!("{EDGE_DEVICE_TYPE}_{}", Uuid::new_v4().simple()),
            scan_interval: config.scan_interval(),
            max_scan_samples: config.max_scan_samples.max(1),
        }
    }
}

impl Default for EdgeSettings {
    fn default() -> Self {
        Self::from(&EdgeConfig::default())
    }
}

/// Receivers paired with an [`EdgeController`].
#[derive(Debug)]
pub struct EdgeChannels {
    /// Envelopes to send to the hub.
    pub upstream: mpsc::UnboundedReceiver<Envelope>,
    /// Lines and closes from the sensor links.
    pub sensors: mpsc::UnboundedReceiver<SensorEvent>,
}

#[derive(Default)]
struct Channel {
    state: CapabilityState,
    port: Option<String>,
    link: Option<Arc<dyn SensorLink>>,
    active: Arc<AtomicBool>,
    ticker: Option<CancellationToken>,
}

impl Channel {
    fn link_open(&self) -> bool {
        self.link.as_ref().is_some_and(|link| link.is_open())
    }

    fn set_active(&mut self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
        self.state = if active {
            CapabilityState::Active
        } else if self.link.is_some() {
            CapabilityState::Idle
        } else {
            CapabilityState::Disconnected
        };
        if !active {
            if let Some(ticker) = self.ticker.take() {
                ticker.cancel();
            }
        }
    }

    fn release(&mut self) {
        self.set_active(false);
        if let Some(link) = self.link.take() {
            link.close();
        }
        self.port = None;
        self.state = CapabilityState::Disconnected;
    }
}

/// Command state machine for the lidar and height sensor.
pub struct EdgeController {
    settings: EdgeSettings,
    ports: Arc<dyn SensorPorts>,
    upstream: mpsc::UnboundedSender<Envelope>,
    sensor_events: mpsc::UnboundedSender<SensorEvent>,
    lidar: Channel,
    stp23l: Channel,
    samples: VecDeque<RangeSample>,
    heights: VecDeque<f64>,
    last_trees: Vec<DetectedObject>,
}

impl fmt::Debug for EdgeController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EdgeController")
            .field("device_id", &self.settings.device_id)
            .field("lidar", &self.lidar.state)
            .field("stp23l", &self.stp23l.state)
            .field("samples", &self.samples.len())
            .finish_non_exhaustive()
    }
}

impl EdgeController {
    /// Create a controller and the channels it feeds.
    #[must_use]
    pub fn new(settings: EdgeSettings, ports: Arc<dyn SensorPorts>) -> (Self, EdgeChannels) {
        let (upstream_tx, upstream_rx) = mpsc::unbounded_channel();
        let (sensor_tx, sensor_rx) = mpsc::unbounded_channel();
        (
            Self {
                settings,
                ports,
                upstream: upstream_tx,
                sensor_events: sensor_tx,
                lidar: Channel::default(),
                stp23l: Channel::default(),
                samples: VecDeque::new(),
                heights: VecDeque::new(),
                last_trees: Vec::new(),
            },
            EdgeChannels {
                upstream: upstream_rx,
                sensors: sensor_rx,
            },
        )
    }

    /// State of one capability.
    #[must_use]
    pub fn state(&self, capability: Capability) -> CapabilityState {
        self.channel(capability).state
    }

    /// Number of retained lidar samples.
    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Objects found by the last `detect_trees`.
    #[must_use]
    pub fn last_trees(&self) -> &[DetectedObject] {
        &self.last_trees
    }

    /// Announce this device after the hub link (re)opens.
    pub fn announce(&self) {
        self.emit(Envelope::device_info(
            EDGE_DEVICE_TYPE,
            &self.settings.device_name,
            &self.settings.device_id,
        ));
        self.emit_status();
    }

    /// Handle one envelope received from the hub.
    pub async fn handle_envelope(&mut self, envelope: Envelope) {
        match envelope.kind {
            // Notices about commands sent to another device carry a status.
            MessageType::RemoteControl if envelope.status.is_none() => {
                let command = envelope.command.unwrap_or_default();
                self.execute(&command).await;
            }
            MessageType::Ping => self.emit(Envelope::new(MessageType::Pong)),
            kind => debug!(kind = %kind, "Ignoring hub message"),
        }
    }

    /// Run one command token and emit its `control_response`.
    pub async fn execute(&mut self, command: &str) -> Outcome {
        let outcome = match command.parse::<ControlCommand>() {
            Ok(cmd) => self.apply(cmd).await,
            Err(e) => {
                warn!(error = %e, "Unknown control command");
                Outcome::UnknownCommand
            }
        };
        info!(command, outcome = %outcome, "Control command handled");
        self.emit(Envelope::control_response(command, outcome.as_str()));
        outcome
    }

    async fn apply(&mut self, command: ControlCommand) -> Outcome {
        match command {
            ControlCommand::ConnectLidar => self.connect(Capability::Scan).await,
            ControlCommand::DisconnectLidar => self.disconnect(Capability::Scan),
            ControlCommand::StartScan => self.start(Capability::Scan),
            ControlCommand::StopScan => self.stop(Capability::Scan),
            ControlCommand::SingleScan => self.single_scan(),
            ControlCommand::DetectTrees => self.detect_trees(),
            ControlCommand::ClearTrees => {
                self.samples.clear();
                self.last_trees.clear();
                Outcome::Success
            }
            ControlCommand::ConnectStp23l => self.connect(Capability::Height).await,
            ControlCommand::DisconnectStp23l => self.disconnect(Capability::Height),
            ControlCommand::StartHeightMeasure => self.start(Capability::Height),
            ControlCommand::StopHeightMeasure => self.stop(Capability::Height),
            ControlCommand::GetStatus => {
                self.emit_status();
                Outcome::Success
            }
            ControlCommand::ResetSystem => {
                self.reset();
                self.emit_status();
                Outcome::Success
            }
        }
    }

    // =========================================================================
    // CAPABILITY TRANSITIONS
    // =========================================================================

    async fn connect(&mut self, capability: Capability) -> Outcome {
        if self.channel(capability).state != CapabilityState::Disconnected {
            return Outcome::AlreadyConnected;
        }
        let Some(port) = self.ports.locate(capability) else {
            info!(capability = %capability, "No compatible port found");
            return Outcome::NoDeviceFound;
        };

        match self
            .ports
            .open(capability, &port, self.sensor_events.clone())
            .await
        {
            Ok(link) => {
                info!(capability = %capability, port = %port, "Sensor connected");
                let channel = self.channel_mut(capability);
                channel.link = Some(link);
                channel.port = Some(port);
                channel.state = CapabilityState::Idle;
                self.emit_status();
                Outcome::Success
            }
            Err(e) => {
                warn!(capability = %capability, port = %port, error = %e, "Failed to open sensor port");
                Outcome::Error
            }
        }
    }

    fn disconnect(&mut self, capability: Capability) -> Outcome {
        self.channel_mut(capability).release();
        info!(capability = %capability, "Sensor disconnected");
        self.emit_status();
        Outcome::Success
    }

    fn start(&mut self, capability: Capability) -> Outcome {
        let channel = self.channel(capability);
        if !channel.link_open() {
            return capability.not_connected();
        }
        if channel.state == CapabilityState::Active {
            return Outcome::Success;
        }

        self.channel_mut(capability).set_active(true);
        if capability == Capability::Scan {
            self.spawn_scan_loop();
        }
        self.emit_status();
        Outcome::Success
    }

    fn stop(&mut self, capability: Capability) -> Outcome {
        if self.channel(capability).state == CapabilityState::Active {
            self.channel_mut(capability).set_active(false);
            self.emit_status();
        }
        Outcome::Success
    }

    fn single_scan(&self) -> Outcome {
        let Some(link) = self.lidar.link.as_ref().filter(|l| l.is_open()) else {
            return Outcome::LidarNotConnected;
        };
        match link.write_line(SINGLE_SCAN_REQUEST) {
            Ok(()) => Outcome::Success,
            Err(e) => {
                warn!(error = %e, "Single scan request failed");
                Outcome::Error
            }
        }
    }

    fn detect_trees(&mut self) -> Outcome {
        if self.samples.is_empty() {
            return Outcome::NoScanData;
        }
        let samples: Vec<RangeSample> = self.samples.iter().copied().collect();
        self.last_trees = ClusterDetector::detect(&samples);

        #[allow(clippy::cast_precision_loss)]
        let avg_diameter = if self.last_trees.is_empty() {
            0.0
        } else {
            self.last_trees.iter().map(|t| t.diameter).sum::<f64>() / self.last_trees.len() as f64
        };
        info!(
            samples = samples.len(),
            trees = self.last_trees.len(),
            "Tree detection finished"
        );

        self.emit(Envelope::new(MessageType::TreeData).with_data(json!({
            "trees": self.last_trees,
            "treeCount": self.last_trees.len(),
            "avgDiameter": avg_diameter,
        })));
        Outcome::Success
    }

    fn reset(&mut self) {
        self.lidar.release();
        self.stp23l.release();
        self.samples.clear();
        self.heights.clear();
        self.last_trees.clear();
        info!("System reset");
    }

    /// Stop every loop and release both sensors.
    pub fn shutdown(&mut self) {
        self.reset();
    }

    fn spawn_scan_loop(&mut self) {
        let Some(link) = self.lidar.link.clone() else {
            return;
        };
        let ticker = CancellationToken::new();
        self.lidar.ticker = Some(ticker.clone());
        let active = self.lidar.active.clone();
        let interval = self.settings.scan_interval;

        tokio::spawn(async move {
            loop {
                if ticker.is_cancelled() || !active.load(Ordering::SeqCst) {
                    break;
                }
                let writer = link.clone();
                match tokio::task::spawn_blocking(move || writer.write_line(SCAN_REQUEST)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(error = %e, "Scan request failed, stopping scan loop");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Scan write task failed, stopping scan loop");
                        break;
                    }
                }
                tokio::select! {
                    () = ticker.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
            }
            debug!("Scan loop stopped");
        });
    }

    // =========================================================================
    // SENSOR INPUT
    // =========================================================================

    /// Handle one event from a sensor link.
    pub fn handle_sensor_event(&mut self, event: SensorEvent) {
        match event {
            SensorEvent::Line {
                capability: Capability::Scan,
                line,
            } => self.on_lidar_line(&line),
            SensorEvent::Line {
                capability: Capability::Height,
                line,
            } => self.on_height_line(&line),
            SensorEvent::Closed(capability) => {
                let channel = self.channel_mut(capability);
                // A close from a link that was already replaced or released is stale.
                if channel.link.is_none() || channel.link_open() {
                    return;
                }
                warn!(capability = %capability, "Sensor link closed unexpectedly");
                channel.release();
                self.emit_status();
            }
        }
    }

    fn on_lidar_line(&mut self, line: &str) {
        let points = parse_lidar_line(line);
        if points.is_empty() {
            debug!(line, "Dropping unparseable lidar line");
            return;
        }
        for point in &points {
            if self.samples.len() == self.settings.max_scan_samples {
                self.samples.pop_front();
            }
            self.samples.push_back(*point);
        }
        self.emit(Envelope::new(MessageType::ScanData).with_data(json!({
            "timestamp": Utc::now(),
            "points": points,
            "pointCount": points.len(),
        })));
    }

    fn on_height_line(&mut self, line: &str) {
        let Some((height, _quality)) = parse_height_line(line) else {
            debug!(line, "Dropping unparseable height line");
            return;
        };
        if self.heights.len() == self.settings.max_scan_samples {
            self.heights.pop_front();
        }
        self.heights.push_back(height);

        if self.stp23l.state != CapabilityState::Active {
            return;
        }
        #[allow(clippy::cast_precision_loss)]
        let avg = self.heights.iter().sum::<f64>() / self.heights.len() as f64;
        self.emit(Envelope::new(MessageType::HeightData).with_data(json!({
            "currentHeight": height,
            "avgHeight": avg,
            "heightCount": self.heights.len(),
        })));
    }

    // =========================================================================
    // OUTPUT
    // =========================================================================

    /// Current flags as sent in `status_update`.
    #[must_use]
    pub fn status_payload(&self) -> Value {
        json!({
            "lidarConnected": self.lidar.link.is_some(),
            "stp23lConnected": self.stp23l.link.is_some(),
            "isScanning": self.lidar.state == CapabilityState::Active,
            "isMeasuring": self.stp23l.state == CapabilityState::Active,
            "lidarPort": self.lidar.port,
            "stp23lPort": self.stp23l.port,
        })
    }

    fn emit_status(&self) {
        self.emit(Envelope::new(MessageType::StatusUpdate).with_data(self.status_payload()));
    }

    fn emit(&self, envelope: Envelope) {
        if self.upstream.send(envelope).is_err() {
            debug!("Upstream closed, dropping envelope");
        }
    }

    const fn channel(&self, capability: Capability) -> &Channel {
        match capability {
            Capability::Scan => &self.lidar,
            Capability::Height => &self.stp23l,
        }
    }

    fn channel_mut(&mut self, capability: Capability) -> &mut Channel {
        match capability {
            Capability::Scan => &mut self.lidar,
            Capability::Height => &mut self.stp23l,
        }
    }
}

/// Parse `angle,distance[,quality]` entries separated by `;`.
#[must_use]
pub fn parse_lidar_line(line: &str) -> Vec<RangeSample> {
    line.split(';')
        .filter_map(|entry| {
            let mut fields = entry.trim().split(',').map(str::trim);
            let angle = fields.next()?.parse::<f64>().ok()?;
            let distance = fields.next()?.parse::<f64>().ok()?;
            let quality = match fields.next() {
                Some(q) => q.parse::<f64>().ok()?,
                None => 0.0,
            };
            Some(RangeSample::new(angle, distance, quality))
        })
        .collect()
}

/// Parse `height[,quality]`.
#[must_use]
pub fn parse_height_line(line: &str) -> Option<(f64, f64)> {
    let mut fields = line.trim().split(',').map(str::trim);
    let height = fields.next()?.parse::<f64>().ok()?;
    let quality = match fields.next() {
        Some(q) => q.parse::<f64>().ok()?,
        None => 0.0,
    };
    Some((height, quality))
}

/// Drive an edge controller against a hub link until `shutdown` fires.
pub async fn run_edge(
    mut controller: EdgeController,
    mut channels: EdgeChannels,
    hub: LinkSession,
    mut hub_events: mpsc::UnboundedReceiver<LinkEvent>,
    shutdown: CancellationToken,
) {
    info!(device_id = %controller.settings.device_id, "Edge controller running");
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            event = hub_events.recv() => match event {
                Some(LinkEvent::Opened) => controller.announce(),
                Some(LinkEvent::Message(text)) => match Envelope::from_json(&text) {
                    Ok(envelope) => controller.handle_envelope(envelope).await,
                    Err(e) => warn!(error = %e, "Dropping malformed hub message"),
                },
                Some(LinkEvent::Closed) => info!("Hub link closed"),
                None => break,
            },
            Some(event) = channels.sensors.recv() => controller.handle_sensor_event(event),
            Some(envelope) = channels.upstream.recv() => forward(&hub, &envelope),
        }
    }
    controller.shutdown();
    hub.disconnect();
    info!("Edge controller stopped");
}

/// Send an envelope to the hub, dropping it if the link is down.
pub(crate) fn forward(hub: &LinkSession, envelope: &Envelope) {
    let text = match envelope.to_json() {
        Ok(text) => text,
        Err(e) => {
            warn!(kind = %envelope.kind, error = %e, "Failed to encode envelope");
            return;
        }
    };
    if let Err(e) = hub.send(text) {
        debug!(kind = %envelope.kind, error = %e, "Hub link down, dropping envelope");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockLink {
        closed: AtomicBool,
        written: Mutex<Vec<String>>,
        write_delay: Duration,
    }

    impl MockLink {
        fn writes(&self, line: &str) -> usize {
            self.written.lock().unwrap().iter().filter(|l| *l == line).count()
        }
    }

    impl SensorLink for MockLink {
        fn write_line(&self, line: &str) -> Result<(), LinkError> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(LinkError::NotConnected);
            }
            if !self.write_delay.is_zero() {
                std::thread::sleep(self.write_delay);
            }
            self.written.lock().unwrap().push(line.to_string());
            Ok(())
        }

        fn is_open(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct MockPorts {
        attached: Mutex<HashMap<Capability, String>>,
        opened: Mutex<HashMap<Capability, Arc<MockLink>>>,
        write_delay: Duration,
    }

    impl MockPorts {
        fn with(capabilities: &[Capability]) -> Arc<Self> {
            Self::slow(capabilities, Duration::ZERO)
        }

        fn slow(capabilities: &[Capability], write_delay: Duration) -> Arc<Self> {
            let ports = Self {
                write_delay,
                ..Self::default()
            };
            for cap in capabilities {
                ports
                    .attached
                    .lock()
                    .unwrap()
                    .insert(*cap, format!("/dev/tty-{cap}"));
            }
            Arc::new(ports)
        }

        fn link(&self, capability: Capability) -> Arc<MockLink> {
            self.opened.lock().unwrap()[&capability].clone()
        }
    }

    #[async_trait]
    impl SensorPorts for MockPorts {
        fn locate(&self, capability: Capability) -> Option<String> {
            self.attached.lock().unwrap().get(&capability).cloned()
        }

        async fn open(
            &self,
            capability: Capability,
            _port: &str,
            _events: mpsc::UnboundedSender<SensorEvent>,
        ) -> Result<Arc<dyn SensorLink>, LinkError> {
            let link = Arc::new(MockLink {
                write_delay: self.write_delay,
                ..MockLink::default()
            });
            self.opened.lock().unwrap().insert(capability, link.clone());
            Ok(link)
        }
    }

    fn settings() -> EdgeSettings {
        EdgeSettings {
            device_name: "Rig".into(),
            device_id: "minipc_test".into(),
            scan_interval: Duration::from_millis(100),
            max_scan_samples: 10,
        }
    }

    fn controller(ports: Arc<MockPorts>) -> (EdgeController, EdgeChannels) {
        EdgeController::new(settings(), ports)
    }

    fn drain(channels: &mut EdgeChannels) -> Vec<Envelope> {
        std::iter::from_fn(|| channels.upstream.try_recv().ok()).collect()
    }

    fn responses(envelopes: &[Envelope]) -> Vec<(String, String)> {
        envelopes
            .iter()
            .filter(|e| e.kind == MessageType::ControlResponse)
            .map(|e| {
                let data = e.data.as_ref().unwrap();
                (
                    data["command"].as_str().unwrap().to_string(),
                    data["status"].as_str().unwrap().to_string(),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_connect_without_device() {
        let (mut edge, mut ch) = controller(MockPorts::with(&[]));
        assert_eq!(edge.execute("connect_lidar").await, Outcome::NoDeviceFound);
        assert_eq!(edge.state(Capability::Scan), CapabilityState::Disconnected);
        assert_eq!(
            responses(&drain(&mut ch)),
            vec![("connect_lidar".into(), "no_device_found".into())]
        );
    }

    #[tokio::test]
    async fn test_connect_twice_is_already_connected() {
        let (mut edge, _ch) = controller(MockPorts::with(&[Capability::Scan]));
        assert_eq!(edge.execute("connect_lidar").await, Outcome::Success);
        assert_eq!(edge.state(Capability::Scan), CapabilityState::Idle);
        assert_eq!(edge.execute("connect_lidar").await, Outcome::AlreadyConnected);
        assert_eq!(edge.state(Capability::Scan), CapabilityState::Idle);
    }

    #[tokio::test]
    async fn test_start_requires_open_link() {
        let (mut edge, _ch) = controller(MockPorts::with(&[]));
        assert_eq!(edge.execute("start_scan").await, Outcome::LidarNotConnected);
        assert_eq!(
            edge.execute("start_height_measure").await,
            Outcome::Stp23lNotConnected
        );
        assert_eq!(edge.execute("single_scan").await, Outcome::LidarNotConnected);
    }

    #[tokio::test]
    async fn test_stop_scan_while_idle_is_idempotent() {
        let (mut edge, mut ch) = controller(MockPorts::with(&[Capability::Scan]));
        edge.execute("connect_lidar").await;
        drain(&mut ch);

        assert_eq!(edge.execute("stop_scan").await, Outcome::Success);
        assert_eq!(edge.state(Capability::Scan), CapabilityState::Idle);
        let out = drain(&mut ch);
        assert_eq!(out.len(), 1, "only the control response, no status change");
        assert_eq!(responses(&out), vec![("stop_scan".into(), "success".into())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_loop_runs_until_stopped() {
        let ports = MockPorts::with(&[Capability::Scan]);
        let (mut edge, _ch) = controller(ports.clone());
        edge.execute("connect_lidar").await;
        assert_eq!(edge.execute("start_scan").await, Outcome::Success);
        assert_eq!(edge.state(Capability::Scan), CapabilityState::Active);

        tokio::time::sleep(Duration::from_millis(350)).await;
        let link = ports.link(Capability::Scan);
        let during = link.writes(SCAN_REQUEST);
        assert!(during >= 3, "expected repeated scan requests, got {during}");

        assert_eq!(edge.execute("stop_scan").await, Outcome::Success);
        assert_eq!(edge.state(Capability::Scan), CapabilityState::Idle);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(link.writes(SCAN_REQUEST), during);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_while_active_keeps_one_loop() {
        let ports = MockPorts::with(&[Capability::Scan]);
        let (mut edge, _ch) = controller(ports.clone());
        edge.execute("connect_lidar").await;
        edge.execute("start_scan").await;
        assert_eq!(edge.execute("start_scan").await, Outcome::Success);

        tokio::time::sleep(Duration::from_millis(1050)).await;
        let writes = ports.link(Capability::Scan).writes(SCAN_REQUEST);
        assert!(writes <= 12, "a second loop would double the rate, got {writes}");
        edge.execute("stop_scan").await;
    }

    #[tokio::test]
    async fn test_slow_scan_writes_do_not_stall_the_runtime() {
        let ports = MockPorts::slow(&[Capability::Scan], Duration::from_millis(300));
        let (mut edge, _ch) = controller(ports.clone());
        edge.execute("connect_lidar").await;
        edge.execute("start_scan").await;

        let started = std::time::Instant::now();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(
            started.elapsed() < Duration::from_millis(250),
            "scan write ran on the runtime thread"
        );

        edge.execute("stop_scan").await;
    }

    #[tokio::test]
    async fn test_single_scan_writes_request() {
        let ports = MockPorts::with(&[Capability::Scan]);
        let (mut edge, _ch) = controller(ports.clone());
        edge.execute("connect_lidar").await;
        assert_eq!(edge.execute("single_scan").await, Outcome::Success);
        assert_eq!(ports.link(Capability::Scan).writes(SINGLE_SCAN_REQUEST), 1);
    }

    #[tokio::test]
    async fn test_lidar_lines_become_scan_data() {
        let (mut edge, mut ch) = controller(MockPorts::with(&[]));
        edge.handle_sensor_event(SensorEvent::Line {
            capability: Capability::Scan,
            line: "10.5,1200,90;11.0,1210".into(),
        });
        let out = drain(&mut ch);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, MessageType::ScanData);
        let data = out[0].data.as_ref().unwrap();
        assert_eq!(data["pointCount"], 2);
        assert_eq!(data["points"][1]["quality"], 0.0);
        assert_eq!(edge.sample_count(), 2);

        edge.handle_sensor_event(SensorEvent::Line {
            capability: Capability::Scan,
            line: "garbage".into(),
        });
        assert!(drain(&mut ch).is_empty());
    }

    #[tokio::test]
    async fn test_sample_buffer_is_bounded() {
        let (mut edge, _ch) = controller(MockPorts::with(&[]));
        for i in 0..25 {
            edge.handle_sensor_event(SensorEvent::Line {
                capability: Capability::Scan,
                line: format!("{i},1000,90"),
            });
        }
        assert_eq!(edge.sample_count(), 10);
    }

    #[tokio::test]
    async fn test_height_forwarded_only_while_measuring() {
        let (mut edge, mut ch) = controller(MockPorts::with(&[Capability::Height]));
        let line = |l: &str| SensorEvent::Line {
            capability: Capability::Height,
            line: l.into(),
        };

        edge.handle_sensor_event(line("1.0,80"));
        assert!(drain(&mut ch).is_empty());

        edge.execute("connect_stp23l").await;
        edge.execute("start_height_measure").await;
        drain(&mut ch);

        edge.handle_sensor_event(line("3.0,80"));
        let out = drain(&mut ch);
        assert_eq!(out[0].kind, MessageType::HeightData);
        let data = out[0].data.as_ref().unwrap();
        assert_eq!(data["currentHeight"], 3.0);
        assert_eq!(data["avgHeight"], 2.0);
        assert_eq!(data["heightCount"], 2);
    }

    #[tokio::test]
    async fn test_detect_trees() {
        let (mut edge, mut ch) = controller(MockPorts::with(&[]));
        assert_eq!(edge.execute("detect_trees").await, Outcome::NoScanData);

        let line: Vec<String> = (0..8).map(|i| format!("{i},{},90", 1000 + i)).collect();
        edge.handle_sensor_event(SensorEvent::Line {
            capability: Capability::Scan,
            line: line.join(";"),
        });
        drain(&mut ch);

        assert_eq!(edge.execute("detect_trees").await, Outcome::Success);
        let out = drain(&mut ch);
        assert_eq!(out[0].kind, MessageType::TreeData);
        assert_eq!(out[0].data.as_ref().unwrap()["treeCount"], 1);
        assert_eq!(edge.last_trees().len(), 1);

        assert_eq!(edge.execute("clear_trees").await, Outcome::Success);
        assert_eq!(edge.sample_count(), 0);
        assert!(edge.last_trees().is_empty());
    }

    #[tokio::test]
    async fn test_reset_releases_everything() {
        let ports = MockPorts::with(&[Capability::Scan, Capability::Height]);
        let (mut edge, _ch) = controller(ports.clone());
        edge.execute("connect_lidar").await;
        edge.execute("connect_stp23l").await;
        edge.execute("start_height_measure").await;

        assert_eq!(edge.execute("reset_system").await, Outcome::Success);
        assert_eq!(edge.state(Capability::Scan), CapabilityState::Disconnected);
        assert_eq!(edge.state(Capability::Height), CapabilityState::Disconnected);
        assert!(!ports.link(Capability::Scan).is_open());
        assert!(!ports.link(Capability::Height).is_open());
    }

    #[tokio::test]
    async fn test_unexpected_close_disconnects() {
        let ports = MockPorts::with(&[Capability::Scan]);
        let (mut edge, _ch) = controller(ports.clone());
        edge.execute("connect_lidar").await;
        edge.execute("start_scan").await;

        ports.link(Capability::Scan).close();
        edge.handle_sensor_event(SensorEvent::Closed(Capability::Scan));
        assert_eq!(edge.state(Capability::Scan), CapabilityState::Disconnected);
        assert_eq!(edge.status_payload()["isScanning"], false);
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let (mut edge, mut ch) = controller(MockPorts::with(&[]));
        assert_eq!(edge.execute("launch").await, Outcome::UnknownCommand);
        assert_eq!(
            responses(&drain(&mut ch)),
            vec![("launch".into(), "unknown_command".into())]
        );
    }

    #[tokio::test]
    async fn test_forwarded_notices_are_ignored() {
        let (mut edge, mut ch) = controller(MockPorts::with(&[]));
        let mut notice = Envelope::remote_control("get_status", None);
        notice.status = Some("forwarded".into());
        edge.handle_envelope(notice).await;
        assert!(drain(&mut ch).is_empty());

        edge.handle_envelope(Envelope::remote_control("get_status", None))
            .await;
        let kinds: Vec<_> = drain(&mut ch).into_iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![MessageType::StatusUpdate, MessageType::ControlResponse]
        );
    }

    #[tokio::test]
    async fn test_announce() {
        let (edge, mut ch) = controller(MockPorts::with(&[]));
        edge.announce();
        let out = drain(&mut ch);
        assert_eq!(out[0].kind, MessageType::DeviceInfo);
        assert_eq!(out[0].device_type.as_deref(), Some(EDGE_DEVICE_TYPE));
        assert_eq!(out[1].kind, MessageType::StatusUpdate);
    }

    #[test]
    fn test_parse_height_line() {
        assert_eq!(parse_height_line("1.25,77"), Some((1.25, 77.0)));
        assert_eq!(parse_height_line(" 2 "), Some((2.0, 0.0)));
        assert_eq!(parse_height_line("tall"), None);
    }
}
