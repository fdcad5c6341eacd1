//! Persistent storage for the hub history.
//!
//! The file is one JSON object rewritten wholesale on every save:
//!
//! ```json
//! { "timestamp": "...", "history": [ ... ], "deviceStatus": { ... }, "clients": [ ... ] }
//! ```

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::envelope::Envelope;
use crate::types::DeviceStatus;

/// Errors raised while reading or writing the history file.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The file exists but could not be read.
    #[error("failed to read {}: {source}", path.display())]
    ReadError {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The file could not be written.
    #[error("failed to write {}: {source}", path.display())]
    WriteError {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The file is not a valid history document.
    #[error("failed to parse {}: {source}", path.display())]
    ParseError {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: serde_json::Error,
    },

    /// The document could not be serialized.
    #[error("failed to serialize history: {0}")]
    SerializeError(#[from] serde_json::Error),

    /// The parent directory could not be created.
    #[error("failed to create directory {}: {source}", path.display())]
    CreateDirError {
        /// Directory path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
}

/// Result alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// On-disk shape of the history file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedHistory {
    /// When the file was written.
    pub timestamp: DateTime<Utc>,
    /// Oldest-first history entries.
    #[serde(default)]
    pub history: Vec<Envelope>,
    /// Status at save time. Informational only.
    #[serde(default)]
    pub device_status: DeviceStatus,
    /// Session ids connected at save time.
    #[serde(default)]
    pub clients: Vec<String>,
}

/// JSON file holding the persisted history.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    path: PathBuf,
}

impl HistoryStore {
    /// Create a store backed by `path`.
    #[must_use]
    pub const fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// File path of this store.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the history file.
    ///
    /// Returns `Ok(None)` when the file does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(&self) -> StorageResult<Option<PersistedHistory>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path).map_err(|source| StorageError::ReadError {
            path: self.path.clone(),
            source,
        })?;
        let doc = serde_json::from_str(&content).map_err(|source| StorageError::ParseError {
            path: self.path.clone(),
            source,
        })?;
        Ok(Some(doc))
    }

    /// Write the history file, replacing any previous contents.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be written.
    pub fn save(&self, doc: &PersistedHistory) -> StorageResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StorageError::CreateDirError {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let content = serde_json::to_string_pretty(doc)?;
        std::fs::write(&self.path, content).map_err(|source| StorageError::WriteError {
            path: self.path.clone(),
            source,
        })
    }
}

/// Default location of the history file.
///
/// On Linux: `/var/lib/canopy/history.json`
/// Elsewhere: the platform data directory.
#[must_use]
pub fn default_history_path() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/var/lib/canopy/history.json")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "canopy").map_or_else(
            || PathBuf::from("canopy-history.json"),
            |dirs| dirs.data_dir().join("history.json"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MessageType;
    use serde_json::json;
    use tempfile::TempDir;

    fn sample_doc() -> PersistedHistory {
        PersistedHistory {
            timestamp: Utc::now(),
            history: vec![
                Envelope::new(MessageType::ScanData).with_data(json!({"points": []})),
                Envelope::new(MessageType::HeightData).with_data(json!({"currentHeight": 1.5})),
            ],
            device_status: DeviceStatus {
                edge_connected: true,
                sessions: 1,
                ..DeviceStatus::default()
            },
            clients: vec!["abc".into()],
        }
    }

    #[test]
    fn test_missing_file_is_fresh_start() {
        let dir = TempDir::new().unwrap();
        let store = HistoryStore::new(dir.path().join("history.json"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let store = HistoryStore::new(dir.path().join("nested/deeper/history.json"));
        store.save(&sample_doc()).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.history.len(), 2);
        assert_eq!(loaded.history[1].kind, MessageType::HeightData);
        assert!(loaded.device_status.edge_connected);
        assert_eq!(loaded.clients, vec!["abc".to_string()]);
    }

    #[test]
    fn test_file_uses_camel_case_keys() {
        let dir = TempDir::new().unwrap();
        let store = HistoryStore::new(dir.path().join("history.json"));
        store.save(&sample_doc()).unwrap();

        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("\"deviceStatus\""));
        assert!(raw.contains("\"history\""));
    }

    #[test]
    fn test_corrupt_file_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = HistoryStore::new(path).load().unwrap_err();
        assert!(matches!(err, StorageError::ParseError { .. }));
    }

    #[test]
    fn test_save_overwrites() {
        let dir = TempDir::new().unwrap();
        let store = HistoryStore::new(dir.path().join("history.json"));
        store.save(&sample_doc()).unwrap();

        let mut smaller = sample_doc();
        smaller.history.truncate(0);
        store.save(&smaller).unwrap();
        assert!(store.load().unwrap().unwrap().history.is_empty());
    }
}
