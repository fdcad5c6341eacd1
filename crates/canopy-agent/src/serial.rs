//! Line-oriented serial connections.
//!
//! Ports are opened 8N1 without flow control. A blocking reader thread per
//! port splits the byte stream on `\n` and hands complete lines to the async
//! side over a channel; the read timeout bounds how long a requested close
//! takes to be noticed.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use canopy_core::{
    Capability, Connection, Connector, LinkError, SensorEvent, SensorLink,
};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Read timeout of the reader threads.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Open `path` at `baud_rate`, 8N1, no flow control.
///
/// # Errors
///
/// Returns the serialport error if the port cannot be opened.
pub fn open_port(path: &str, baud_rate: u32) -> serialport::Result<Box<dyn SerialPort>> {
    let port = serialport::new(path, baud_rate)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .timeout(READ_TIMEOUT)
        .open()?;
    info!(port = %path, baud_rate, "Opened serial port");
    Ok(port)
}

// =============================================================================
// LINE SPLITTING
// =============================================================================

/// Accumulates bytes and yields complete `\n`-terminated lines.
///
/// Trailing `\r` is stripped and empty lines are skipped. Invalid UTF-8 is
/// replaced rather than rejected.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Feed bytes, returning every line they complete.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(end) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=end).collect();
            let line = String::from_utf8_lossy(&raw[..end]);
            let line = line.trim_end_matches('\r');
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }
}

/// Read lines from `port` until `running` clears or the port fails.
fn read_lines(
    mut port: Box<dyn SerialPort>,
    running: &AtomicBool,
    mut on_line: impl FnMut(String) -> bool,
) -> io::Result<()> {
    let mut buffer = LineBuffer::default();
    let mut chunk = [0u8; 1024];

    while running.load(Ordering::SeqCst) {
        match port.read(&mut chunk) {
            Ok(0) => {}
            Ok(n) => {
                for line in buffer.push(&chunk[..n]) {
                    if !on_line(line) {
                        return Ok(());
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn write_line(port: &mut dyn SerialPort, line: &str) -> io::Result<()> {
    port.write_all(line.as_bytes())?;
    if !line.ends_with('\n') {
        port.write_all(b"\n")?;
    }
    port.flush()
}

// =============================================================================
// ACTUATOR CONNECTOR
// =============================================================================

/// Opens the actuator serial port as a [`Connection`] of text lines.
#[derive(Debug, Clone)]
pub struct SerialLineConnector {
    path: String,
    baud_rate: u32,
}

impl SerialLineConnector {
    /// Connector for `path` at `baud_rate`.
    #[must_use]
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
        }
    }
}

/// An open actuator port.
pub struct SerialLineConnection {
    writer: Arc<Mutex<Box<dyn SerialPort>>>,
    lines: mpsc::UnboundedReceiver<Result<String, LinkError>>,
    running: Arc<AtomicBool>,
}

#[async_trait]
impl Connector for SerialLineConnector {
    type Conn = SerialLineConnection;

    async fn connect(&self) -> Result<Self::Conn, LinkError> {
        let (path, baud_rate) = (self.path.clone(), self.baud_rate);
        let port = tokio::task::spawn_blocking(move || {
            let port = open_port(&path, baud_rate)?;
            let reader = port.try_clone()?;
            Ok::<_, serialport::Error>((port, reader))
        })
        .await
        .map_err(|e| LinkError::ConnectFailed(e.to_string()))?
        .map_err(|e| LinkError::ConnectFailed(e.to_string()))?;
        let (writer, reader) = port;

        let running = Arc::new(AtomicBool::new(true));
        let (tx, lines) = mpsc::unbounded_channel();
        let flag = running.clone();
        let path = self.path.clone();
        std::thread::Builder::new()
            .name("actuator-reader".into())
            .spawn(move || {
                let result = read_lines(reader, &flag, |line| tx.send(Ok(line)).is_ok());
                if let Err(e) = result {
                    warn!(port = %path, error = %e, "Serial read failed");
                    let _ = tx.send(Err(LinkError::Transport(e.to_string())));
                }
                debug!(port = %path, "Serial reader stopped");
            })
            .map_err(|e| LinkError::ConnectFailed(e.to_string()))?;

        Ok(SerialLineConnection {
            writer: Arc::new(Mutex::new(writer)),
            lines,
            running,
        })
    }

    fn describe(&self) -> String {
        format!("{}@{}", self.path, self.baud_rate)
    }
}

#[async_trait]
impl Connection for SerialLineConnection {
    async fn send(&mut self, payload: &str) -> Result<(), LinkError> {
        let writer = self.writer.clone();
        let line = payload.to_string();
        tokio::task::spawn_blocking(move || {
            let mut port = writer.lock().map_err(|_| LinkError::TransportClosed)?;
            write_line(port.as_mut(), &line).map_err(|e| LinkError::Transport(e.to_string()))
        })
        .await
        .map_err(|e| LinkError::Transport(e.to_string()))?
    }

    async fn recv(&mut self) -> Option<Result<String, LinkError>> {
        self.lines.recv().await
    }

    async fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

impl Drop for SerialLineConnection {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

// =============================================================================
// SENSOR LINK
// =============================================================================

/// An open sensor port.
///
/// Lines are delivered as [`SensorEvent::Line`]; when the port fails on its
/// own a single [`SensorEvent::Closed`] follows.
pub struct SerialSensorLink {
    capability: Capability,
    writer: Mutex<Box<dyn SerialPort>>,
    running: Arc<AtomicBool>,
}

impl SerialSensorLink {
    /// Open `path` for `capability` and start its reader.
    ///
    /// # Errors
    ///
    /// Returns the serialport error if the port cannot be opened or cloned.
    pub fn open(
        capability: Capability,
        path: &str,
        baud_rate: u32,
        events: mpsc::UnboundedSender<SensorEvent>,
    ) -> serialport::Result<Arc<Self>> {
        let writer = open_port(path, baud_rate)?;
        let reader = writer.try_clone()?;
        let running = Arc::new(AtomicBool::new(true));

        let flag = running.clone();
        let path = path.to_string();
        std::thread::Builder::new()
            .name(format!("{capability}-reader"))
            .spawn(move || {
                let result = read_lines(reader, &flag, |line| {
                    events.send(SensorEvent::Line { capability, line }).is_ok()
                });
                let requested = !flag.swap(false, Ordering::SeqCst);
                match result {
                    Err(e) => warn!(port = %path, %capability, error = %e, "Sensor port failed"),
                    Ok(()) => debug!(port = %path, %capability, requested, "Sensor reader stopped"),
                }
                let _ = events.send(SensorEvent::Closed(capability));
            })?;

        Ok(Arc::new(Self {
            capability,
            writer: Mutex::new(writer),
            running,
        }))
    }
}

impl SensorLink for SerialSensorLink {
    fn write_line(&self, line: &str) -> Result<(), LinkError> {
        if !self.is_open() {
            return Err(LinkError::NotConnected);
        }
        let mut port = self.writer.lock().map_err(|_| LinkError::TransportClosed)?;
        write_line(port.as_mut(), line).map_err(|e| {
            warn!(capability = %self.capability, error = %e, "Sensor write failed");
            LinkError::Transport(e.to_string())
        })
    }

    fn is_open(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_buffer_splits_complete_lines() {
        let mut buffer = LineBuffer::default();
        assert!(buffer.push(b"12.5,300").is_empty());
        assert_eq!(buffer.push(b",40\r\n13.0,"), vec!["12.5,300,40"]);
        assert_eq!(buffer.push(b"310\n\nSTATUS|1\n"), vec!["13.0,310", "STATUS|1"]);
    }

    #[test]
    fn test_line_buffer_tolerates_invalid_utf8() {
        let mut buffer = LineBuffer::default();
        let lines = buffer.push(b"ok\xff\n");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("ok"));
    }

    #[test]
    fn test_connector_describes_port() {
        let connector = SerialLineConnector::new("/dev/rfcomm0", 9600);
        assert_eq!(connector.describe(), "/dev/rfcomm0@9600");
    }

    #[tokio::test]
    async fn test_connect_to_missing_port_fails() {
        let connector = SerialLineConnector::new("/dev/canopy-missing-port", 9600);
        let err = connector.connect().await.err().unwrap();
        assert!(matches!(err, LinkError::ConnectFailed(_)));
    }
}
