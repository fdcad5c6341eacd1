//! Application configuration management.
//!
//! Configuration is layered, lowest priority first:
//! - built-in defaults
//! - a TOML file (explicit path, else `CANOPY_CONFIG`, else the platform
//!   config directory; only an explicit path must exist)
//! - environment variables `CANOPY_<SECTION>__<KEY>`, e.g.
//!   `CANOPY_HUB__BIND_ADDRESS=127.0.0.1:9000`
//!
//! Sections:
//! - `hub`: listener, history and persistence
//! - `link`: reconnection policy shared by every client link
//! - `edge`: data-collection unit (lidar and height sensor)
//! - `bridge`: actuator bridge

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::default_history_path;

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_ENV: &str = "CANOPY_CONFIG";

/// Prefix of per-key environment overrides.
pub const ENV_PREFIX: &str = "CANOPY";

/// Errors raised while loading, validating or saving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An explicitly requested file does not exist.
    #[error("configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The file could not be written.
    #[error("failed to write {}: {source}", path.display())]
    WriteError {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// A source could not be read or deserialized.
    #[error("failed to parse configuration: {0}")]
    ParseError(String),

    /// The configuration could not be rendered as TOML.
    #[error("failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// One field holds an invalid value.
    #[error("{field}: {message}")]
    ValidationError {
        /// Dotted field path.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields hold invalid values.
    #[error("{} validation errors", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),
}

impl From<::config::ConfigError> for ConfigError {
    fn from(err: ::config::ConfigError) -> Self {
        Self::ParseError(err.to_string())
    }
}

/// Result alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Main application configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanopyConfig {
    /// Hub server settings.
    pub hub: HubConfig,
    /// Client link reconnection policy.
    pub link: LinkConfig,
    /// Edge agent settings.
    pub edge: EdgeConfig,
    /// Bridge agent settings.
    pub bridge: BridgeConfig,
}

/// Hub server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Listen address.
    pub bind_address: String,
    /// WebSocket upgrade path.
    pub ws_path: String,
    /// Maximum retained history entries.
    pub history_capacity: usize,
    /// Entries replayed to a freshly accepted session.
    pub replay_count: usize,
    /// Seconds between history saves.
    pub save_interval_secs: u64,
    /// History file location.
    pub data_file: PathBuf,
    /// CORS origins. Empty allows any origin.
    pub allowed_origins: Vec<String>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".into(),
            ws_path: "/ws".into(),
            history_capacity: 1000,
            replay_count: 50,
            save_interval_secs: 300,
            data_file: default_history_path(),
            allowed_origins: Vec::new(),
        }
    }
}

/// Reconnection policy for client links.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Delay before reopening a closed link.
    pub reconnect_delay_ms: u64,
    /// Whether closed links reopen on their own.
    pub auto_reconnect: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: 5000,
            auto_reconnect: true,
        }
    }
}

/// Edge agent settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    /// Hub WebSocket URL.
    pub hub_url: String,
    /// Display name announced in `device_info`.
    pub device_name: String,
    /// Milliseconds between scan requests while scanning.
    pub scan_interval_ms: u64,
    /// Lidar serial baud rate.
    pub lidar_baud_rate: u32,
    /// Height sensor serial baud rate.
    pub stp23l_baud_rate: u32,
    /// Substrings matched against serial port descriptions to find the lidar.
    pub lidar_port_hints: Vec<String>,
    /// Substrings matched against serial port descriptions to find the height sensor.
    pub stp23l_port_hints: Vec<String>,
    /// Maximum retained lidar samples.
    pub max_scan_samples: usize,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            hub_url: "ws://127.0.0.1:8080/ws".into(),
            device_name: "Canopy edge".into(),
            scan_interval_ms: 100,
            lidar_baud_rate: 115_200,
            stp23l_baud_rate: 230_400,
            lidar_port_hints: vec!["hokuyo".into(), "urg".into(), "lidar".into()],
            stp23l_port_hints: vec!["stp".into(), "23l".into(), "height".into()],
            max_scan_samples: 5000,
        }
    }
}

/// Bridge agent settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Hub WebSocket URL.
    pub hub_url: String,
    /// Display name announced in `device_info`.
    pub device_name: String,
    /// Actuator serial baud rate.
    pub baud_rate: u32,
    /// Substrings matched against serial port descriptions to find the actuator.
    pub port_hints: Vec<String>,
    /// Fixed actuator port, bypassing discovery.
    pub port: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            hub_url: "ws://127.0.0.1:8080/ws".into(),
            device_name: "Canopy bridge".into(),
            baud_rate: 9600,
            port_hints: vec![
                "hc-05".into(),
                "bluetooth".into(),
                "ch340".into(),
                "cp210".into(),
            ],
            port: None,
        }
    }
}

impl LinkConfig {
    /// Reconnect delay as a [`Duration`].
    #[must_use]
    pub const fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl HubConfig {
    /// Save interval as a [`Duration`].
    #[must_use]
    pub const fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_interval_secs)
    }
}

impl EdgeConfig {
    /// Scan interval as a [`Duration`].
    #[must_use]
    pub const fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }
}

impl CanopyConfig {
    /// Load configuration from defaults, file and environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotFound`] if `path` is given and missing, and
    /// [`ConfigError::ParseError`] if any source cannot be deserialized.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let file = match path {
            Some(p) if !p.exists() => return Err(ConfigError::NotFound(p.to_path_buf())),
            Some(p) => Some((p.to_path_buf(), true)),
            None => std::env::var_os(CONFIG_PATH_ENV)
                .map(|p| (PathBuf::from(p), true))
                .or_else(|| Self::config_path().map(|p| (p, false))),
        };

        let mut builder =
            ::config::Config::builder().add_source(::config::Config::try_from(&Self::default())?);

        if let Some((file, required)) = file {
            tracing::debug!(path = %file.display(), required, "Reading configuration file");
            builder = builder.add_source(
                ::config::File::from(file)
                    .format(::config::FileFormat::Toml)
                    .required(required),
            );
        }

        let config: Self = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("hub.allowed_origins")
                    .with_list_parse_key("edge.lidar_port_hints")
                    .with_list_parse_key("edge.stp23l_port_hints")
                    .with_list_parse_key("bridge.port_hints")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        Ok(config)
    }

    /// Save configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::WriteError {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::WriteError {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check every field, reporting all violations at once.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MultipleValidationErrors`] listing each invalid field.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();
        let mut check = |ok: bool, field: &str, message: &str| {
            if !ok {
                errors.push(ConfigError::ValidationError {
                    field: field.into(),
                    message: message.into(),
                });
            }
        };

        check(
            self.hub.bind_address.parse::<SocketAddr>().is_ok(),
            "hub.bind_address",
            "must be a socket address such as 0.0.0.0:8080",
        );
        check(
            self.hub.ws_path.starts_with('/'),
            "hub.ws_path",
            "must start with '/'",
        );
        check(
            self.hub.history_capacity > 0,
            "hub.history_capacity",
            "must be greater than zero",
        );
        check(
            self.hub.replay_count <= self.hub.history_capacity,
            "hub.replay_count",
            "must not exceed hub.history_capacity",
        );
        check(
            self.hub.save_interval_secs > 0,
            "hub.save_interval_secs",
            "must be greater than zero",
        );
        check(
            self.link.reconnect_delay_ms > 0,
            "link.reconnect_delay_ms",
            "must be greater than zero",
        );
        check(
            is_ws_url(&self.edge.hub_url),
            "edge.hub_url",
            "must start with ws:// or wss://",
        );
        check(
            self.edge.scan_interval_ms > 0,
            "edge.scan_interval_ms",
            "must be greater than zero",
        );
        check(
            self.edge.lidar_baud_rate > 0 && self.edge.stp23l_baud_rate > 0,
            "edge.baud_rate",
            "baud rates must be greater than zero",
        );
        check(
            self.edge.max_scan_samples > 0,
            "edge.max_scan_samples",
            "must be greater than zero",
        );
        check(
            is_ws_url(&self.bridge.hub_url),
            "bridge.hub_url",
            "must start with ws:// or wss://",
        );
        check(
            self.bridge.baud_rate > 0,
            "bridge.baud_rate",
            "must be greater than zero",
        );

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::MultipleValidationErrors(errors))
        }
    }

    /// Default configuration file path.
    ///
    /// On Linux: `/etc/canopy/config.toml`
    /// Elsewhere: the platform config directory.
    #[must_use]
    pub fn config_path() -> Option<PathBuf> {
        #[cfg(target_os = "linux")]
        {
            Some(PathBuf::from("/etc/canopy/config.toml"))
        }
        #[cfg(not(target_os = "linux"))]
        {
            directories::ProjectDirs::from("", "", "canopy")
                .map(|dirs| dirs.config_dir().join("config.toml"))
        }
    }
}

fn is_ws_url(url: &str) -> bool {
    url.starts_with("ws://") || url.starts_with("wss://")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = CanopyConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.hub.history_capacity, 1000);
        assert_eq!(config.hub.replay_count, 50);
        assert_eq!(config.link.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(config.edge.scan_interval(), Duration::from_millis(100));
        assert_eq!(config.bridge.baud_rate, 9600);
    }

    #[test]
    fn test_validate_collects_every_violation() {
        let mut config = CanopyConfig::default();
        config.hub.ws_path = "ws".into();
        config.hub.replay_count = 5000;
        config.edge.hub_url = "http://hub".into();

        match config.validate().unwrap_err() {
            ConfigError::MultipleValidationErrors(errors) => {
                assert_eq!(errors.len(), 3);
                let text: Vec<String> = errors.iter().map(ToString::to_string).collect();
                assert!(text.iter().any(|t| t.starts_with("hub.ws_path")));
                assert!(text.iter().any(|t| t.starts_with("hub.replay_count")));
                assert!(text.iter().any(|t| t.starts_with("edge.hub_url")));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_missing_explicit_file() {
        let dir = TempDir::new().unwrap();
        let err = CanopyConfig::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("canopy.toml");
        std::fs::write(
            &path,
            "[hub]\nbind_address = \"127.0.0.1:9100\"\nreplay_count = 10\n\n[link]\nauto_reconnect = false\n",
        )
        .unwrap();

        let config = CanopyConfig::load(Some(&path)).unwrap();
        assert_eq!(config.hub.bind_address, "127.0.0.1:9100");
        assert_eq!(config.hub.replay_count, 10);
        assert!(!config.link.auto_reconnect);
        // Untouched keys keep their defaults.
        assert_eq!(config.hub.ws_path, "/ws");
        assert_eq!(config.edge.max_scan_samples, 5000);
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub/config.toml");
        let mut config = CanopyConfig::default();
        config.bridge.port = Some("/dev/rfcomm0".into());
        config.edge.lidar_port_hints = vec!["ust".into()];
        config.save(&path).unwrap();

        let loaded = CanopyConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded.bridge.port.as_deref(), Some("/dev/rfcomm0"));
        assert_eq!(loaded.edge.lidar_port_hints, vec!["ust".to_string()]);
    }

    #[test]
    fn test_bad_toml_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[hub\nbind_address = ").unwrap();
        let err = CanopyConfig::load(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }
}
