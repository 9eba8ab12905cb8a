//! The transport capability a session drives.
//!
//! A transport exposes non-blocking GATT primitives. Each primitive either
//! refuses the request immediately with an `Err`, or accepts it and later
//! reports the outcome through the [`GattCallback`] handed to
//! [`GattTransport::connect`]. Callbacks may arrive on any thread or task.
//!
//! Implementations:
//! - [`BtleplugTransport`](crate::BtleplugTransport) for real adapters
//! - [`MockTransport`](crate::MockTransport) for tests

use std::sync::Arc;

use bytes::Bytes;
use uuid::Uuid;

use gattkit_types::{
    BluetoothAddress, ConnectionState, GattCharacteristic, GattService, GattStatus, WriteType,
};

use crate::error::Result;

/// Factory for links to remote devices.
pub trait GattTransport: Send + Sync {
    /// Whether the radio is present and powered.
    fn is_enabled(&self) -> bool;

    /// Start connecting to `address`.
    ///
    /// Must not invoke `callback` before returning. On success the returned
    /// link reports the connection outcome through
    /// [`GattCallback::on_connection_state_change`].
    fn connect(
        &self,
        address: BluetoothAddress,
        auto_connect: bool,
        callback: Arc<dyn GattCallback>,
    ) -> Result<Arc<dyn GattLink>>;
}

/// An established or establishing link to one device.
///
/// Every method returns without waiting for the peer.
pub trait GattLink: Send + Sync {
    /// Start tearing the link down.
    fn disconnect(&self) -> Result<()>;

    /// Release the link's resources. No callbacks follow.
    fn close(&self) -> Result<()>;

    /// Start service discovery.
    fn discover_services(&self) -> Result<()>;

    /// Services found by the last discovery.
    fn services(&self) -> Vec<GattService>;

    /// Start reading a characteristic.
    fn read_characteristic(&self, characteristic: &GattCharacteristic) -> Result<()>;

    /// Start writing a characteristic.
    fn write_characteristic(
        &self,
        characteristic: &GattCharacteristic,
        value: Bytes,
        write_type: WriteType,
    ) -> Result<()>;

    /// Toggle local delivery of value changes for a characteristic.
    ///
    /// Completes synchronously; there is no callback.
    fn set_characteristic_notification(
        &self,
        characteristic: &GattCharacteristic,
        enable: bool,
    ) -> Result<()>;

    /// Start writing a descriptor of a characteristic.
    fn write_descriptor(
        &self,
        characteristic: &GattCharacteristic,
        descriptor: Uuid,
        value: Bytes,
    ) -> Result<()>;

    /// Start reading the signal strength of the link.
    fn read_remote_rssi(&self) -> Result<()>;
}

/// Completion callbacks from a transport.
pub trait GattCallback: Send + Sync {
    /// The link state changed, or a connect attempt failed.
    fn on_connection_state_change(&self, status: GattStatus, state: ConnectionState);

    /// Service discovery finished.
    fn on_services_discovered(&self, status: GattStatus);

    /// A characteristic read finished.
    fn on_characteristic_read(
        &self,
        characteristic: GattCharacteristic,
        value: Bytes,
        status: GattStatus,
    );

    /// A characteristic write finished.
    fn on_characteristic_write(&self, characteristic: GattCharacteristic, status: GattStatus);

    /// A descriptor write finished.
    fn on_descriptor_write(
        &self,
        characteristic: GattCharacteristic,
        descriptor: Uuid,
        status: GattStatus,
    );

    /// The peer pushed a notification or indication.
    fn on_characteristic_changed(&self, characteristic: GattCharacteristic, value: Bytes);

    /// An RSSI read finished.
    fn on_read_remote_rssi(&self, rssi: i16, status: GattStatus);
}
