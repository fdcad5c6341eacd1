//! # canopy-core
//!
//! Core logic for canopy, a real-time relay between lidar survey rigs, an
//! actuator bridge and viewers.
//!
//! This crate provides:
//! - The envelope model exchanged over every hub link
//! - The connection hub: session registry, role detection, routing and bounded history
//! - The checksummed frame codec used on the actuator serial link
//! - Point-cluster detection over lidar sweeps
//! - Reconnecting client links and the edge/bridge device controllers
//! - Configuration and history persistence
//!
//! ## Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`envelope`] - Envelope, message types and roles
//! - [`hub`] - The connection hub
//! - [`history`] - Bounded FIFO history buffer
//! - [`frame`] - Actuator frame codec
//! - [`cluster`] - Cluster detection
//! - [`command`] - Control command and outcome tokens
//! - [`link`] - Reconnecting link sessions and the actuator link
//! - [`edge`] - Edge controller (lidar and height sensor)
//! - [`bridge`] - Actuator bridge
//! - [`config`] - Layered configuration loading and validation
//! - [`storage`] - History file persistence
//! - [`error`] - Unified error types for the crate
//! - [`types`] - Shared types and OpenAPI schemas

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod bridge;
pub mod cluster;
pub mod command;
pub mod config;
pub mod edge;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod history;
pub mod hub;
pub mod link;
pub mod storage;
pub mod types;

// Re-export primary types for convenience
pub use bridge::{run_bridge, ActuatorBridge, BridgeSettings, BRIDGE_DEVICE_TYPE};
pub use cluster::{ClusterCenter, ClusterDetector, DetectedObject, RangeSample};
pub use command::{ControlCommand, Outcome, UnknownCommand};
pub use config::{
    BridgeConfig, CanopyConfig, ConfigError, ConfigResult, EdgeConfig, HubConfig, LinkConfig,
};
pub use edge::{
    run_edge, Capability, CapabilityState, EdgeChannels, EdgeController, EdgeSettings,
    SensorEvent, SensorLink, SensorPorts, EDGE_DEVICE_TYPE,
};
pub use envelope::{ClientInfo, Envelope, MessageType, Role};
pub use error::{CanopyError, Result};
pub use frame::{CommandFrame, Decoded, FrameCodec, FrameError};
pub use history::HistoryBuffer;
pub use hub::{ConnectionHub, Outbox, SessionId};
pub use link::{
    ActuatorLink, ActuatorMessage, Connection, Connector, LinkError, LinkEvent, LinkSession,
    LinkState, ReconnectPolicy,
};
pub use storage::{default_history_path, HistoryStore, PersistedHistory, StorageError};
pub use types::{DeviceStatus, HealthResponse, MeasurementFlags};
