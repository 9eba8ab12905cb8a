//! Session and registry configuration.
//!
//! Timeouts are serialized as integer milliseconds so configuration files
//! stay readable:
//!
//! ```toml
//! event_capacity = 256
//!
//! [session]
//! connect_timeout_ms = 15000
//! operation_timeout_ms = 5000
//! disconnect_timeout_ms = 250
//! verbose_characteristic_changed = false
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default time allowed for connect plus service discovery.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default time allowed for a read, write, notification change or RSSI read.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time to wait for the transport to confirm a solicited disconnect.
pub const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_millis(250);

/// Default capacity of the broadcast event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 100;

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Per-session timeouts and logging switches.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use gattkit_core::SessionConfig;
///
/// let config = SessionConfig::default()
///     .connect_timeout(Duration::from_secs(30))
///     .operation_timeout(Duration::from_secs(10));
/// assert_eq!(config.disconnect_timeout, Duration::from_millis(250));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Time allowed for the link to come up and services to be discovered.
    #[serde(rename = "connect_timeout_ms", with = "millis")]
    pub connect_timeout: Duration,
    /// Time allowed for each read, write, notification change or RSSI read.
    #[serde(rename = "operation_timeout_ms", with = "millis")]
    pub operation_timeout: Duration,
    /// Time to wait for the transport to confirm a solicited disconnect.
    #[serde(rename = "disconnect_timeout_ms", with = "millis")]
    pub disconnect_timeout: Duration,
    /// Trace every characteristic-changed notification.
    pub verbose_characteristic_changed: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            disconnect_timeout: DEFAULT_DISCONNECT_TIMEOUT,
            verbose_characteristic_changed: false,
        }
    }
}

impl SessionConfig {
    /// Create a new session config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorter timeouts for devices that are close by and responsive.
    pub fn fast() -> Self {
        Self {
            connect_timeout: Duration::from_secs(8),
            operation_timeout: Duration::from_secs(2),
            ..Self::default()
        }
    }

    /// Longer timeouts for noisy RF environments.
    ///
    /// Connecting can take well over 30 seconds on some stacks.
    pub fn challenging_environment() -> Self {
        Self {
            connect_timeout: Duration::from_secs(60),
            operation_timeout: Duration::from_secs(15),
            disconnect_timeout: Duration::from_secs(1),
            ..Self::default()
        }
    }

    /// Set the connect timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the per-operation timeout.
    #[must_use]
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Set the disconnect confirmation timeout.
    #[must_use]
    pub fn disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    /// Enable or disable per-notification tracing.
    #[must_use]
    pub fn verbose_characteristic_changed(mut self, verbose: bool) -> Self {
        self.verbose_characteristic_changed = verbose;
        self
    }

    /// Validate session configuration.
    pub fn validate(&self, prefix: &str) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        for (field, value) in [
            ("connect_timeout_ms", self.connect_timeout),
            ("operation_timeout_ms", self.operation_timeout),
            ("disconnect_timeout_ms", self.disconnect_timeout),
        ] {
            if value.is_zero() {
                errors.push(ValidationError {
                    field: format!("{}.{}", prefix, field),
                    message: "timeout must be greater than zero".to_string(),
                });
            }
        }
        errors
    }
}

/// Configuration for a [`GattManager`](crate::GattManager).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Defaults applied to every session the registry creates.
    pub session: SessionConfig,
    /// Event channel capacity.
    pub event_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl ManagerConfig {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<string>"),
            source: e,
        })
    }

    /// Serialize configuration to TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Validate the configuration and return any errors.
    ///
    /// This checks:
    /// - All session timeouts are non-zero
    /// - The event channel capacity is non-zero
    ///
    /// # Example
    ///
    /// ```
    /// use gattkit_core::ManagerConfig;
    ///
    /// let config = ManagerConfig::default();
    /// config.validate().expect("Default config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = self.session.validate("session");

        if self.event_capacity == 0 {
            errors.push(ValidationError {
                field: "event_capacity".to_string(),
                message: "capacity must be greater than zero".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path (e.g., `session.connect_timeout_ms`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}
