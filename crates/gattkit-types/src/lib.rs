//! Platform-agnostic types for Bluetooth GATT sessions.
//!
//! This crate provides the vocabulary shared by the session engine in
//! `gattkit-core` and by transport implementations.
//!
//! # Features
//!
//! - 48-bit device addresses with validation
//! - Operation kinds, disconnect reasons, write and notification types
//! - GATT status codes with known-issue annotations
//! - The discovered service/characteristic model
//! - Bluetooth SIG assigned-number UUIDs
//! - Little-endian integer and IEEE-11073 float value encoders
//!
//! # Example
//!
//! ```
//! use gattkit_types::{BluetoothAddress, uuids};
//!
//! let address = BluetoothAddress::parse_device("AA:BB:CC:DD:EE:FF").unwrap();
//! assert_eq!(uuids::lookup_name(uuids::BATTERY_LEVEL), Some("Battery Level"));
//! # let _ = address;
//! ```

pub mod address;
pub mod error;
pub mod types;
pub mod uuid;
pub mod value;

pub use address::BluetoothAddress;
pub use error::{ParseError, ParseResult};
pub use types::{
    ConnectionState, DisconnectReason, GattCharacteristic, GattOperation, GattService, GattStatus,
    NotificationDescriptorType, WriteType,
};
pub use uuid as uuids;
pub use value::{FloatFormat, IntFormat};
