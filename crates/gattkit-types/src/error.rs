//! Error types for parsing and encoding in gattkit-types.

use thiserror::Error;

/// Errors that can occur when parsing addresses or encoding characteristic
/// values.
///
/// This error type is platform-agnostic and does not include
/// transport errors (those belong in gattkit-core).
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ParseError {
    /// The text is not a colon-delimited 48-bit address.
    #[error("Invalid address '{0}': expected six colon-separated hex octets")]
    InvalidAddress(String),

    /// The address is well formed but reserved (all zeros or broadcast).
    #[error("Reserved address {0} cannot identify a device")]
    ReservedAddress(String),

    /// The value does not fit the requested format.
    #[error("Value {value} out of range for {format}")]
    ValueOutOfRange {
        /// The rejected value.
        value: i64,
        /// The target format name.
        format: &'static str,
    },

    /// Invalid data.
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Result type alias using gattkit-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
