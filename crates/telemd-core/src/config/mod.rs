//! Configuration parsing.
//!
//! The collector reads a single TOML file with three sections. Every key has
//! a default, so an empty file (or no file at all) is a valid configuration:
//!
//! ```toml
//! [daemon]
//! socket_path = "/run/telemd/telemd.sock"
//! spool_dir = "/var/spool/telemetry"
//! max_connections = 64
//! client_timeout_secs = 30
//! tick_interval_secs = 5
//! idle_exit_secs = 0
//!
//! [identity]
//! machine_id_file = "/var/lib/telemetry/machine_id"
//! override_file = "/etc/telemetrics/opt-in-static-machine-id"
//! expiry_secs = 259200
//!
//! [limits]
//! max_payload_length = 8192
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::identity::{DEFAULT_MACHINE_ID_EXPIRY, DEFAULT_MACHINE_ID_FILE, DEFAULT_OVERRIDE_FILE};
use crate::record::{DEFAULT_MAX_PAYLOAD_LENGTH, HeaderRegistry, RecordLimits};
use crate::staging::DEFAULT_SPOOL_DIR;

/// Default listening socket.
pub const DEFAULT_SOCKET_PATH: &str = "/run/telemd/telemd.sock";

/// Top-level collector configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollectorConfig {
    /// Socket, spool and event loop settings.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Machine identity settings.
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Record size limits.
    #[serde(default)]
    pub limits: LimitsConfig,
}

impl CollectorConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or a value is out of range.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Reject values the daemon cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] naming the offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.tick_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "daemon.tick_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.daemon.max_connections == 0 {
            return Err(ConfigError::Validation(
                "daemon.max_connections must be greater than zero".to_string(),
            ));
        }
        if self.limits.max_payload_length == 0 {
            return Err(ConfigError::Validation(
                "limits.max_payload_length must be greater than zero".to_string(),
            ));
        }
        // The record size bound must stay representable in the 32-bit prefix.
        let max_record = RecordLimits::for_registry(
            &HeaderRegistry::default(),
            self.limits.max_payload_length,
        )
        .max_record_size();
        if u32::try_from(max_record).is_err() {
            return Err(ConfigError::Validation(format!(
                "limits.max_payload_length too large: records of {max_record} bytes exceed the \
                 32-bit size prefix"
            )));
        }
        Ok(())
    }
}

/// Daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    /// Listening Unix socket.
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Directory staged records are published into.
    #[serde(default = "default_spool_dir")]
    pub spool_dir: PathBuf,

    /// Clients beyond this many are accepted and closed immediately.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Clients silent for this long are disconnected. Zero disables reaping.
    #[serde(default = "default_client_timeout_secs")]
    pub client_timeout_secs: u64,

    /// Upper bound on how long the event loop sleeps between maintenance
    /// passes.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    /// Exit after this long without any client. Zero runs forever.
    #[serde(default)]
    pub idle_exit_secs: u64,
}

impl DaemonConfig {
    /// Event loop tick.
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    /// Client idle timeout, if enabled.
    #[must_use]
    pub const fn client_timeout(&self) -> Option<Duration> {
        match self.client_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Daemon idle exit, if enabled.
    #[must_use]
    pub const fn idle_exit(&self) -> Option<Duration> {
        match self.idle_exit_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            spool_dir: default_spool_dir(),
            max_connections: default_max_connections(),
            client_timeout_secs: default_client_timeout_secs(),
            tick_interval_secs: default_tick_interval_secs(),
            idle_exit_secs: 0,
        }
    }
}

fn default_socket_path() -> PathBuf {
    PathBuf::from(DEFAULT_SOCKET_PATH)
}

fn default_spool_dir() -> PathBuf {
    PathBuf::from(DEFAULT_SPOOL_DIR)
}

const fn default_max_connections() -> usize {
    64
}

const fn default_client_timeout_secs() -> u64 {
    30
}

const fn default_tick_interval_secs() -> u64 {
    5
}

/// Machine identity configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentityConfig {
    /// File holding the persisted machine identifier.
    #[serde(default = "default_machine_id_file")]
    pub machine_id_file: PathBuf,

    /// Optional static identifier that takes precedence.
    #[serde(default = "default_override_file")]
    pub override_file: PathBuf,

    /// Age after which the persisted identifier is regenerated.
    #[serde(default = "default_expiry_secs")]
    pub expiry_secs: u64,
}

impl IdentityConfig {
    /// Identifier lifetime.
    #[must_use]
    pub const fn expiry(&self) -> Duration {
        Duration::from_secs(self.expiry_secs)
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            machine_id_file: default_machine_id_file(),
            override_file: default_override_file(),
            expiry_secs: default_expiry_secs(),
        }
    }
}

fn default_machine_id_file() -> PathBuf {
    PathBuf::from(DEFAULT_MACHINE_ID_FILE)
}

fn default_override_file() -> PathBuf {
    PathBuf::from(DEFAULT_OVERRIDE_FILE)
}

const fn default_expiry_secs() -> u64 {
    DEFAULT_MACHINE_ID_EXPIRY.as_secs()
}

/// Record size limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitsConfig {
    /// Largest accepted payload. Together with the header count this bounds
    /// the record size.
    #[serde(default = "default_max_payload_length")]
    pub max_payload_length: usize,
}

impl LimitsConfig {
    /// Size limits for records matching `registry`.
    #[must_use]
    pub fn record_limits(&self, registry: &HeaderRegistry) -> RecordLimits {
        RecordLimits::for_registry(registry, self.max_payload_length)
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_payload_length: default_max_payload_length(),
        }
    }
}

const fn default_max_payload_length() -> usize {
    DEFAULT_MAX_PAYLOAD_LENGTH
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = CollectorConfig::from_toml("").unwrap();

        assert_eq!(config, CollectorConfig::default());
        assert_eq!(
            config.daemon.socket_path,
            PathBuf::from("/run/telemd/telemd.sock")
        );
        assert_eq!(config.daemon.spool_dir, PathBuf::from("/var/spool/telemetry"));
        assert_eq!(config.daemon.max_connections, 64);
        assert_eq!(config.daemon.tick_interval(), Duration::from_secs(5));
        assert_eq!(config.daemon.client_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.daemon.idle_exit(), None);
        assert_eq!(config.identity.expiry(), Duration::from_secs(259_200));
        assert_eq!(config.limits.max_payload_length, 8192);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [daemon]
            socket_path = "/tmp/telemd/test.sock"
            spool_dir = "/tmp/spool"
            max_connections = 4
            client_timeout_secs = 0
            tick_interval_secs = 1
            idle_exit_secs = 60

            [identity]
            machine_id_file = "/tmp/machine_id"
            override_file = "/tmp/override"
            expiry_secs = 10

            [limits]
            max_payload_length = 1024
        "#;

        let config = CollectorConfig::from_toml(toml).unwrap();
        assert_eq!(config.daemon.socket_path, PathBuf::from("/tmp/telemd/test.sock"));
        assert_eq!(config.daemon.spool_dir, PathBuf::from("/tmp/spool"));
        assert_eq!(config.daemon.max_connections, 4);
        assert_eq!(config.daemon.client_timeout(), None);
        assert_eq!(config.daemon.idle_exit(), Some(Duration::from_secs(60)));
        assert_eq!(config.identity.machine_id_file, PathBuf::from("/tmp/machine_id"));
        assert_eq!(config.identity.override_file, PathBuf::from("/tmp/override"));
        assert_eq!(config.identity.expiry(), Duration::from_secs(10));

        let limits = config.limits.record_limits(&HeaderRegistry::default());
        assert_eq!(limits.max_payload_length(), 1024);
        assert_eq!(limits.num_headers(), 15);
    }

    #[test]
    fn test_zero_tick_interval_is_rejected() {
        let result = CollectorConfig::from_toml("[daemon]\ntick_interval_secs = 0\n");
        match result {
            Err(ConfigError::Validation(msg)) => {
                assert!(msg.contains("tick_interval_secs"), "unexpected message: {msg}");
            },
            other => panic!("Expected ConfigError::Validation, got {other:?}"),
        }
    }

    #[test]
    fn test_zero_max_connections_is_rejected() {
        assert!(matches!(
            CollectorConfig::from_toml("[daemon]\nmax_connections = 0\n"),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_zero_payload_length_is_rejected() {
        assert!(matches!(
            CollectorConfig::from_toml("[limits]\nmax_payload_length = 0\n"),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        assert!(matches!(
            CollectorConfig::from_toml("[daemon]\nsocket = \"/tmp/x.sock\"\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = CollectorConfig::default();
        config.daemon.max_connections = 7;
        let text = config.to_toml().unwrap();
        assert_eq!(CollectorConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_from_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("telemd.toml");
        std::fs::write(&path, "[limits]\nmax_payload_length = 16\n").unwrap();

        let config = CollectorConfig::from_file(&path).unwrap();
        assert_eq!(config.limits.max_payload_length, 16);

        assert!(matches!(
            CollectorConfig::from_file(&tmp.path().join("missing.toml")),
            Err(ConfigError::Io(_))
        ));
    }
}
