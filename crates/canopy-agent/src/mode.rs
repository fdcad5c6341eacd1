//! Agent mode selection.

use std::fmt;
use std::str::FromStr;

use crate::error::AgentError;

/// Environment variable selecting the mode.
pub const MODE_ENV: &str = "CANOPY_AGENT_MODE";

/// Which controller the agent runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AgentMode {
    /// Drive the lidar and height sensor.
    #[default]
    Edge,
    /// Relay commands to the actuator.
    Bridge,
}

impl AgentMode {
    /// Read the mode from `CANOPY_AGENT_MODE`, defaulting to edge.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::InvalidMode`] for unrecognized values.
    pub fn from_env() -> Result<Self, AgentError> {
        match std::env::var(MODE_ENV) {
            Ok(value) if !value.trim().is_empty() => value.parse(),
            _ => Ok(Self::default()),
        }
    }
}

impl FromStr for AgentMode {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "edge" | "minipc" => Ok(Self::Edge),
            "bridge" | "bluetooth_bridge" => Ok(Self::Bridge),
            other => Err(AgentError::InvalidMode(other.to_string())),
        }
    }
}

impl fmt::Display for AgentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Edge => "edge",
            Self::Bridge => "bridge",
        })
    }
}
