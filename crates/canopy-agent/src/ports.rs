//! Serial port discovery.
//!
//! Ports are matched by case-insensitive substring hints against the port
//! name and, for USB ports, the manufacturer, product and serial number.

use std::sync::Arc;

use async_trait::async_trait;
use canopy_core::{Capability, EdgeConfig, LinkError, SensorEvent, SensorLink, SensorPorts};
use serialport::{SerialPortInfo, SerialPortType};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{AgentError, AgentResult};
use crate::serial::SerialSensorLink;

/// How to find and open one kind of device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
    /// Substrings identifying the device.
    pub hints: Vec<String>,
    /// Baud rate to open it at.
    pub baud_rate: u32,
}

/// Searchable text describing a port, lowercased.
#[must_use]
pub fn describe_port(info: &SerialPortInfo) -> String {
    let mut parts = vec![info.port_name.clone()];
    if let SerialPortType::UsbPort(usb) = &info.port_type {
        parts.extend(
            [&usb.manufacturer, &usb.product, &usb.serial_number]
                .into_iter()
                .flatten()
                .cloned(),
        );
    }
    parts.join(" ").to_lowercase()
}

/// First port whose description contains any of `hints`.
#[must_use]
pub fn find_port<'a>(ports: &'a [SerialPortInfo], hints: &[String]) -> Option<&'a SerialPortInfo> {
    ports.iter().find(|info| {
        let description = describe_port(info);
        hints
            .iter()
            .any(|hint| !hint.is_empty() && description.contains(&hint.to_lowercase()))
    })
}

/// Locate the actuator port.
///
/// Falls back to the first available port when nothing matches, since
/// serial Bluetooth adapters often report no descriptive metadata.
///
/// # Errors
///
/// Returns [`AgentError::NoSerialPort`] when no port exists at all, or the
/// enumeration error.
pub fn locate_actuator(hints: &[String]) -> AgentResult<String> {
    let ports = serialport::available_ports()?;
    log_ports(&ports);
    find_port(&ports, hints)
        .or_else(|| ports.first())
        .map(|info| info.port_name.clone())
        .ok_or(AgentError::NoSerialPort)
}

fn log_ports(ports: &[SerialPortInfo]) {
    debug!(count = ports.len(), "Enumerated serial ports");
    for info in ports {
        debug!(port = %info.port_name, description = %describe_port(info), "Serial port");
    }
}

/// [`SensorPorts`] backed by the host's serial ports.
#[derive(Debug, Clone)]
pub struct SerialPorts {
    lidar: PortSpec,
    stp23l: PortSpec,
}

impl SerialPorts {
    /// Ports described by the edge configuration.
    #[must_use]
    pub fn new(config: &EdgeConfig) -> Self {
        Self {
            lidar: PortSpec {
                hints: config.lidar_port_hints.clone(),
                baud_rate: config.lidar_baud_rate,
            },
            stp23l: PortSpec {
                hints: config.stp23l_port_hints.clone(),
                baud_rate: config.stp23l_baud_rate,
            },
        }
    }

    /// Spec used for `capability`.
    #[must_use]
    pub const fn spec(&self, capability: Capability) -> &PortSpec {
        match capability {
            Capability::Scan => &self.lidar,
            Capability::Height => &self.stp23l,
        }
    }
}

#[async_trait]
impl SensorPorts for SerialPorts {
    fn locate(&self, capability: Capability) -> Option<String> {
        let ports = match serialport::available_ports() {
            Ok(ports) => ports,
            Err(e) => {
                warn!(%capability, error = %e, "Serial port enumeration failed");
                return None;
            }
        };
        log_ports(&ports);
        find_port(&ports, &self.spec(capability).hints).map(|info| info.port_name.clone())
    }

    async fn open(
        &self,
        capability: Capability,
        port: &str,
        events: mpsc::UnboundedSender<SensorEvent>,
    ) -> Result<Arc<dyn SensorLink>, LinkError> {
        let baud_rate = self.spec(capability).baud_rate;
        let path = port.to_string();
        let link = tokio::task::spawn_blocking(move || {
            SerialSensorLink::open(capability, &path, baud_rate, events)
        })
        .await
        .map_err(|e| LinkError::ConnectFailed(e.to_string()))?
        .map_err(|e| LinkError::ConnectFailed(e.to_string()))?;
        Ok(link as Arc<dyn SensorLink>)
    }
}
