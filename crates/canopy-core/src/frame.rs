//! Checksummed command frames for the actuator serial link.
//!
//! Wire format, one frame per line:
//!
//! ```text
//! COMMAND[:jsonParameters]|timestampMillis|checksum\n
//! ```
//!
//! The checksum is the sum of the UTF-16 code units of `COMMAND[:json]`
//! modulo 256. It catches line noise, nothing more: any corruption that
//! preserves the 8-bit sum goes undetected.
//!
//! Lines without any `|` are not frames at all. They decode to
//! [`Decoded::Raw`] so simple devices that answer in plain text still work.

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;

/// Errors produced while decoding a frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The checksum segment does not match the payload.
    #[error("frame checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Checksum recomputed from the payload.
        expected: u8,
        /// Checksum carried by the frame.
        actual: u8,
    },

    /// The line has frame structure but cannot be parsed.
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Result alias for frame decoding.
pub type FrameResult<T> = std::result::Result<T, FrameError>;

/// A decoded or about-to-be-sent command frame.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandFrame {
    /// Command token.
    pub command: String,
    /// Optional JSON parameters.
    pub parameters: Option<Value>,
    /// Milliseconds since the Unix epoch at send time.
    pub sent_at: i64,
    /// Additive checksum of the command and parameters.
    pub checksum: u8,
}

/// Result of decoding one line from the actuator.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A framed, verified command.
    Frame(CommandFrame),
    /// An unframed line passed through untouched.
    Raw(String),
}

/// 8-bit additive checksum over UTF-16 code units.
#[must_use]
pub fn checksum(payload: &str) -> u8 {
    payload
        .encode_utf16()
        .fold(0u8, |acc, unit| acc.wrapping_add((unit & 0xFF) as u8))
}

/// Encoder/decoder for the actuator frame format.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Encode a command stamped with the current time.
    #[must_use]
    pub fn encode(command: &str, parameters: Option<&Value>) -> String {
        Self::encode_at(command, parameters, Utc::now().timestamp_millis())
    }

    /// Encode a command with an explicit send time.
    #[must_use]
    pub fn encode_at(command: &str, parameters: Option<&Value>, sent_at: i64) -> String {
        let payload = match parameters {
            Some(params) => format!("{command}:{params}"),
            None => command.to_string(),
        };
        let sum = checksum(&payload);
        format!("{payload}|{sent_at}|{sum}\n")
    }

    /// Decode one received line.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::ChecksumMismatch`] when a checksum segment is
    /// present and wrong, and [`FrameError::Malformed`] when the line is
    /// empty or its segments cannot be parsed.
    pub fn decode(line: &str) -> FrameResult<Decoded> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Err(FrameError::Malformed("empty line".into()));
        }
        if !line.contains('|') {
            return Ok(Decoded::Raw(line.to_string()));
        }

        // Segments are taken from the right so that parameters containing
        // '|' inside JSON strings survive.
        let (payload, sent_at, carried) = split_segments(line)?;

        if let Some(actual) = carried {
            let expected = checksum(payload);
            if expected != actual {
                return Err(FrameError::ChecksumMismatch { expected, actual });
            }
        }

        let (command, parameters) = match payload.split_once(':') {
            Some((command, json)) => {
                let params = serde_json::from_str(json).map_err(|e| {
                    FrameError::Malformed(format!("invalid parameters for {command}: {e}"))
                })?;
                (command, Some(params))
            }
            None => (payload, None),
        };

        if command.is_empty() {
            return Err(FrameError::Malformed("empty command".into()));
        }

        Ok(Decoded::Frame(CommandFrame {
            command: command.to_string(),
            parameters,
            sent_at,
            checksum: carried.unwrap_or_else(|| checksum(payload)),
        }))
    }
}

fn split_segments(line: &str) -> FrameResult<(&str, i64, Option<u8>)> {
    let mut from_right = line.rsplitn(3, '|');
    let last = from_right.next().unwrap_or_default();
    let middle = from_right.next();
    let rest = from_right.next();

    if let (Some(middle), Some(rest)) = (middle, rest) {
        // A timestamp in the middle means the last segment is a checksum,
        // which must parse as a byte.
        if let Ok(sent_at) = middle.trim().parse::<i64>() {
            let sum = last.trim().parse::<u8>().map_err(|_| {
                FrameError::Malformed(format!("invalid checksum '{}' in '{line}'", last.trim()))
            })?;
            return Ok((rest, sent_at, Some(sum)));
        }
    }

    // Two segments: COMMAND|timestamp with no checksum.
    let (payload, sent_at) = line
        .rsplit_once('|')
        .ok_or_else(|| FrameError::Malformed("missing timestamp segment".into()))?;
    let sent_at = sent_at
        .trim()
        .parse::<i64>()
        .map_err(|_| FrameError::Malformed(format!("invalid timestamp or checksum in '{line}'")))?;
    Ok((payload, sent_at, None))
}
