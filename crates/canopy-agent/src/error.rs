//! Agent error types.

use thiserror::Error;

/// Result alias for agent operations.
pub type AgentResult<T> = std::result::Result<T, AgentError>;

/// Errors raised while setting up the agent.
#[derive(Debug, Error)]
pub enum AgentError {
    /// `CANOPY_AGENT_MODE` holds an unknown value.
    #[error("Unknown agent mode '{0}'. Expected 'edge' or 'bridge'.")]
    InvalidMode(String),

    /// The configured hub URL cannot be used.
    #[error("Invalid hub URL '{url}': {reason}")]
    InvalidHubUrl {
        /// The configured value.
        url: String,
        /// What is wrong with it.
        reason: String,
    },

    /// No serial port is attached.
    #[error("No serial port found")]
    NoSerialPort,

    /// Serial port enumeration or open failed.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),
}
