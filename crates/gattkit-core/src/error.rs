//! Error types for gattkit-core.
//!
//! Only failures that are detected synchronously surface as [`Error`]:
//! invalid arguments, unmet preconditions and transport primitives that
//! refuse a request outright. Anything that goes wrong after an operation
//! has been queued is reported to listeners as a completion event with
//! `success == false`, or through the timeout hook.
//!
//! | Error | Raised by | Meaning |
//! |-------|-----------|---------|
//! | [`Error::InvalidAddress`] | registry lookup | malformed, zero or broadcast address |
//! | [`Error::AdapterUnavailable`] | every operation | the radio is off or missing |
//! | [`Error::AlreadyConnected`] | `connect` | a link is already being set up or is up |
//! | [`Error::NotConnected`] | read/write/notify/RSSI | no link to run the operation on |
//! | [`Error::Disconnecting`] | every operation | a solicited disconnect is in progress |
//! | [`Error::SessionClosed`] | every operation | the session worker has gone away |
//! | [`Error::Transport`] | transport implementations | a primitive refused the request |
//! | [`Error::NoRuntime`] | registry construction | called outside a tokio runtime |
//! | [`Error::Config`] | registry construction | the configuration failed validation |

use thiserror::Error;

use gattkit_types::{BluetoothAddress, ParseError};

use crate::config::ConfigError;

/// Errors that can occur when driving a GATT session.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth Low Energy error.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// The device address is malformed or reserved.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// A characteristic value could not be encoded.
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// No Bluetooth adapter, or the adapter is powered off.
    #[error("Bluetooth adapter unavailable")]
    AdapterUnavailable,

    /// The transport does not know the device.
    #[error("Device not found: {0}")]
    DeviceNotFound(BluetoothAddress),

    /// The session is already connecting or connected.
    #[error("Already connecting or connected")]
    AlreadyConnected,

    /// Operation attempted while not connected to device.
    #[error("Not connected to device")]
    NotConnected,

    /// A solicited disconnect is in progress.
    #[error("Disconnect in progress")]
    Disconnecting,

    /// The session's background worker is no longer running.
    #[error("Session closed")]
    SessionClosed,

    /// No tokio runtime to run session tasks on.
    #[error("No tokio runtime available")]
    NoRuntime,

    /// A transport primitive refused the request.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Configuration file could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// Create a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Whether the error reports an unmet session-state precondition.
    #[must_use]
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Error::AdapterUnavailable
                | Error::AlreadyConnected
                | Error::NotConnected
                | Error::Disconnecting
                | Error::SessionClosed
        )
    }
}

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::InvalidAddress(_) | ParseError::ReservedAddress(_) => {
                Error::InvalidAddress(err.to_string())
            }
            // Handle future ParseError variants (non_exhaustive)
            _ => Error::InvalidValue(err.to_string()),
        }
    }
}

/// Result type alias using gattkit-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;
