//! # canopy-agent
//!
//! Device-side process for canopy.
//!
//! This crate provides the transports the core controllers run on:
//! - [`ws`] - hub connector over WebSocket
//! - [`serial`] - line-oriented serial connections for sensors and the actuator
//! - [`ports`] - serial port discovery by description hints
//! - [`mode`] - which controller the agent runs

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod error;
pub mod mode;
pub mod ports;
pub mod serial;
pub mod ws;

pub use error::{AgentError, AgentResult};
pub use mode::AgentMode;
pub use ports::{PortSpec, SerialPorts};
pub use serial::{SerialLineConnector, SerialSensorLink};
pub use ws::WsConnector;
