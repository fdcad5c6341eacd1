//! Control command tokens and their outcome tokens.

use std::fmt;
use std::str::FromStr;

/// Commands a viewer may address to a device through `remote_control`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlCommand {
    /// Open the lidar link.
    ConnectLidar,
    /// Release the lidar link.
    DisconnectLidar,
    /// Begin continuous scanning.
    StartScan,
    /// End continuous scanning.
    StopScan,
    /// Request one scan.
    SingleScan,
    /// Cluster the accumulated samples.
    DetectTrees,
    /// Forget samples and detections.
    ClearTrees,
    /// Open the height sensor link.
    ConnectStp23l,
    /// Release the height sensor link.
    DisconnectStp23l,
    /// Begin forwarding height readings.
    StartHeightMeasure,
    /// Stop forwarding height readings.
    StopHeightMeasure,
    /// Report current flags.
    GetStatus,
    /// Stop and release everything.
    ResetSystem,
}

impl ControlCommand {
    /// Every command, in wire-documentation order.
    pub const ALL: [Self; 13] = [
        Self::ConnectLidar,
        Self::DisconnectLidar,
        Self::StartScan,
        Self::StopScan,
        Self::SingleScan,
        Self::DetectTrees,
        Self::ClearTrees,
        Self::ConnectStp23l,
        Self::DisconnectStp23l,
        Self::StartHeightMeasure,
        Self::StopHeightMeasure,
        Self::GetStatus,
        Self::ResetSystem,
    ];

    /// Hub-side token.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConnectLidar => "connect_lidar",
            Self::DisconnectLidar => "disconnect_lidar",
            Self::StartScan => "start_scan",
            Self::StopScan => "stop_scan",
            Self::SingleScan => "single_scan",
            Self::DetectTrees => "detect_trees",
            Self::ClearTrees => "clear_trees",
            Self::ConnectStp23l => "connect_stp23l",
            Self::DisconnectStp23l => "disconnect_stp23l",
            Self::StartHeightMeasure => "start_height_measure",
            Self::StopHeightMeasure => "stop_height_measure",
            Self::GetStatus => "get_status",
            Self::ResetSystem => "reset_system",
        }
    }

    /// Token understood by the actuator firmware on the framed serial link.
    #[must_use]
    pub const fn actuator_token(self) -> &'static str {
        match self {
            Self::ConnectLidar => "LIDAR_CONNECT",
            Self::DisconnectLidar => "LIDAR_DISCONNECT",
            Self::StartScan => "LIDAR_START_SCAN",
            Self::StopScan => "LIDAR_STOP_SCAN",
            Self::SingleScan => "LIDAR_SINGLE_SCAN",
            Self::DetectTrees => "LIDAR_DETECT_TREES",
            Self::ClearTrees => "LIDAR_CLEAR_TREES",
            Self::ConnectStp23l => "STP23L_CONNECT",
            Self::DisconnectStp23l => "STP23L_DISCONNECT",
            Self::StartHeightMeasure => "STP23L_START_MEASURE",
            Self::StopHeightMeasure => "STP23L_STOP_MEASURE",
            Self::GetStatus => "GET_STATUS",
            Self::ResetSystem => "RESET_SYSTEM",
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a command token is not recognized.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown command token: '{0}'")]
pub struct UnknownCommand(pub String);

impl FromStr for ControlCommand {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| UnknownCommand(s.to_string()))
    }
}

/// Outcome token carried by a `control_response`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// The transition happened (or was already in effect).
    Success,
    /// `connect` while the link is already open.
    AlreadyConnected,
    /// No compatible port was found.
    NoDeviceFound,
    /// Lidar link is not open.
    LidarNotConnected,
    /// Height sensor link is not open.
    Stp23lNotConnected,
    /// Actuator link behind the bridge is not open.
    ActuatorNotConnected,
    /// Tree detection requested with no samples.
    NoScanData,
    /// The bridge handed the command to the actuator.
    Forwarded,
    /// The operation failed.
    Error,
    /// The command token is not recognized.
    UnknownCommand,
}

impl Outcome {
    /// Wire token.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::AlreadyConnected => "already_connected",
            Self::NoDeviceFound => "no_device_found",
            Self::LidarNotConnected => "lidar_not_connected",
            Self::Stp23lNotConnected => "stp23l_not_connected",
            Self::ActuatorNotConnected => "actuator_not_connected",
            Self::NoScanData => "no_scan_data",
            Self::Forwarded => "forwarded",
            Self::Error => "error",
            Self::UnknownCommand => "unknown_command",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_token_parses_back() {
        for cmd in ControlCommand::ALL {
            assert_eq!(cmd.as_str().parse::<ControlCommand>(), Ok(cmd));
        }
    }

    #[test]
    fn test_unknown_token() {
        let err = "launch_rocket".parse::<ControlCommand>().unwrap_err();
        assert_eq!(err, UnknownCommand("launch_rocket".into()));
    }

    #[test]
    fn test_actuator_tokens() {
        assert_eq!(ControlCommand::StartScan.actuator_token(), "LIDAR_START_SCAN");
        assert_eq!(
            ControlCommand::StartHeightMeasure.actuator_token(),
            "STP23L_START_MEASURE"
        );
        assert_eq!(ControlCommand::GetStatus.actuator_token(), "GET_STATUS");
    }

    #[test]
    fn test_outcome_tokens() {
        assert_eq!(Outcome::LidarNotConnected.to_string(), "lidar_not_connected");
        assert_eq!(Outcome::Stp23lNotConnected.as_str(), "stp23l_not_connected");
        assert_eq!(Outcome::UnknownCommand.as_str(), "unknown_command");
    }
}
