//! Core types shared by GATT sessions and transports.

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::uuid::CLIENT_CHARACTERISTIC_CONFIG;

/// Kind of GATT operation tracked by a session.
///
/// Used as the key for operation timing and to classify timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum GattOperation {
    /// Establishing the link.
    Connect,
    /// Discovering services after the link comes up.
    DiscoverServices,
    /// Reading a characteristic value.
    CharacteristicRead,
    /// Writing a characteristic value.
    CharacteristicWrite,
    /// Enabling or disabling notifications or indications.
    CharacteristicSetNotification,
    /// Reading the remote RSSI.
    ReadRemoteRssi,
}

impl GattOperation {
    /// All operation kinds, in lifecycle order.
    pub const ALL: [GattOperation; 6] = [
        GattOperation::Connect,
        GattOperation::DiscoverServices,
        GattOperation::CharacteristicRead,
        GattOperation::CharacteristicWrite,
        GattOperation::CharacteristicSetNotification,
        GattOperation::ReadRemoteRssi,
    ];
}

impl fmt::Display for GattOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GattOperation::Connect => "Connect",
            GattOperation::DiscoverServices => "DiscoverServices",
            GattOperation::CharacteristicRead => "CharacteristicRead",
            GattOperation::CharacteristicWrite => "CharacteristicWrite",
            GattOperation::CharacteristicSetNotification => "CharacteristicSetNotification",
            GattOperation::ReadRemoteRssi => "ReadRemoteRssi",
        };
        f.write_str(name)
    }
}

/// Why a session's link went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum DisconnectReason {
    /// The transport refused to start the connection.
    ConnectFailed,
    /// This session asked for the disconnect and the transport confirmed it
    /// (or the request itself failed).
    SolicitedDisconnect,
    /// This session asked for the disconnect but the transport never confirmed
    /// it within the disconnect timeout.
    SolicitedDisconnectTimeout,
    /// The link was lost without being asked to disconnect.
    UnsolicitedDisconnect,
}

impl DisconnectReason {
    /// Whether this session requested the disconnect.
    #[must_use]
    pub fn is_solicited(self) -> bool {
        matches!(
            self,
            DisconnectReason::SolicitedDisconnect | DisconnectReason::SolicitedDisconnectTimeout
        )
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DisconnectReason::ConnectFailed => "ConnectFailed",
            DisconnectReason::SolicitedDisconnect => "SolicitedDisconnect",
            DisconnectReason::SolicitedDisconnectTimeout => "SolicitedDisconnectTimeout",
            DisconnectReason::UnsolicitedDisconnect => "UnsolicitedDisconnect",
        };
        f.write_str(name)
    }
}

/// How a characteristic write is acknowledged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum WriteType {
    /// Write request; the peer acknowledges.
    #[default]
    DefaultWithResponse,
    /// Write command; no acknowledgement.
    WithoutResponse,
    /// Signed write command.
    Signed,
}

/// Value written to the Client Characteristic Configuration descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum NotificationDescriptorType {
    /// Turn notifications and indications off.
    Disable,
    /// Enable notifications (unacknowledged).
    EnableWithoutResponse,
    /// Enable indications (acknowledged).
    EnableWithResponse,
}

impl NotificationDescriptorType {
    /// Whether the local notification flag should be set.
    #[must_use]
    pub fn is_enable(self) -> bool {
        !matches!(self, NotificationDescriptorType::Disable)
    }

    /// The two-byte little-endian CCCD value.
    #[must_use]
    pub fn descriptor_value(self) -> [u8; 2] {
        match self {
            NotificationDescriptorType::Disable => [0x00, 0x00],
            NotificationDescriptorType::EnableWithoutResponse => [0x01, 0x00],
            NotificationDescriptorType::EnableWithResponse => [0x02, 0x00],
        }
    }
}

/// Profile connection state reported by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[repr(u8)]
pub enum ConnectionState {
    /// No link.
    Disconnected = 0,
    /// Link is being established.
    Connecting = 1,
    /// Link is up.
    Connected = 2,
    /// Link is being torn down.
    Disconnecting = 3,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "STATE_DISCONNECTED",
            ConnectionState::Connecting => "STATE_CONNECTING",
            ConnectionState::Connected => "STATE_CONNECTED",
            ConnectionState::Disconnecting => "STATE_DISCONNECTING",
        };
        write!(f, "{}({})", name, *self as u8)
    }
}

/// Status code reported with a GATT completion.
///
/// Codes follow the ATT/GATT stack numbering; zero is success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct GattStatus(pub i32);

impl GattStatus {
    /// Operation completed.
    pub const SUCCESS: Self = Self(0);
    /// Attribute cannot be read.
    pub const READ_NOT_PERMITTED: Self = Self(0x02);
    /// Attribute cannot be written.
    pub const WRITE_NOT_PERMITTED: Self = Self(0x03);
    /// Link must be authenticated.
    pub const INSUFFICIENT_AUTHENTICATION: Self = Self(0x05);
    /// Peer does not support the request.
    pub const REQUEST_NOT_SUPPORTED: Self = Self(0x06);
    /// Offset beyond the attribute value.
    pub const INVALID_OFFSET: Self = Self(0x07);
    /// Link supervision timed out; the peer went out of range.
    pub const CONNECTION_TIMEOUT: Self = Self(0x08);
    /// Value length is wrong for the attribute.
    pub const INVALID_ATTRIBUTE_LENGTH: Self = Self(0x0D);
    /// Link must be encrypted.
    pub const INSUFFICIENT_ENCRYPTION: Self = Self(0x0F);
    /// Generic stack error, often seen when too many links are open.
    pub const ERROR: Self = Self(133);
    /// Link is congested.
    pub const CONNECTION_CONGESTED: Self = Self(0x8F);
    /// Generic failure, often seen when close races a pending disconnect.
    pub const FAILURE: Self = Self(257);

    /// Whether the status reports success.
    #[must_use]
    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    /// Known platform issue associated with this status, if any.
    #[must_use]
    pub fn known_issue(self) -> Option<&'static str> {
        match self.0 {
            133 => Some(
                "status 133 (too many connections?); see https://code.google.com/p/android/issues/detail?id=58381",
            ),
            257 => Some(
                "status 257 (disconnect() followed by close()); see https://code.google.com/p/android/issues/detail?id=183108",
            ),
            _ => None,
        }
    }

    fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::SUCCESS => "GATT_SUCCESS",
            Self::READ_NOT_PERMITTED => "GATT_READ_NOT_PERMITTED",
            Self::WRITE_NOT_PERMITTED => "GATT_WRITE_NOT_PERMITTED",
            Self::INSUFFICIENT_AUTHENTICATION => "GATT_INSUFFICIENT_AUTHENTICATION",
            Self::REQUEST_NOT_SUPPORTED => "GATT_REQUEST_NOT_SUPPORTED",
            Self::INVALID_OFFSET => "GATT_INVALID_OFFSET",
            Self::CONNECTION_TIMEOUT => "GATT_CONNECTION_TIMEOUT",
            Self::INVALID_ATTRIBUTE_LENGTH => "GATT_INVALID_ATTRIBUTE_LENGTH",
            Self::INSUFFICIENT_ENCRYPTION => "GATT_INSUFFICIENT_ENCRYPTION",
            Self::ERROR => "GATT_ERROR",
            Self::CONNECTION_CONGESTED => "GATT_CONNECTION_CONGESTED",
            Self::FAILURE => "GATT_FAILURE",
            _ => return None,
        })
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}({})", name, self.0),
            None => write!(f, "GATT_UNKNOWN({})", self.0),
        }
    }
}

impl From<i32> for GattStatus {
    fn from(code: i32) -> Self {
        Self(code)
    }
}

/// A characteristic as seen through a discovered service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GattCharacteristic {
    /// UUID of the owning service.
    pub service_uuid: Uuid,
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// UUIDs of the characteristic's descriptors.
    pub descriptors: Vec<Uuid>,
}

impl GattCharacteristic {
    /// A characteristic with no known descriptors.
    ///
    /// Sessions use this to describe the target of an operation that failed
    /// before the real characteristic could be resolved.
    pub fn new(service_uuid: Uuid, uuid: Uuid) -> Self {
        Self {
            service_uuid,
            uuid,
            descriptors: Vec::new(),
        }
    }

    /// Add a descriptor UUID.
    #[must_use]
    pub fn with_descriptor(mut self, descriptor: Uuid) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    /// Whether the characteristic carries the given descriptor.
    #[must_use]
    pub fn has_descriptor(&self, descriptor: Uuid) -> bool {
        self.descriptors.contains(&descriptor)
    }

    /// Whether the characteristic has a Client Characteristic Configuration
    /// descriptor.
    #[must_use]
    pub fn has_client_config(&self) -> bool {
        self.has_descriptor(CLIENT_CHARACTERISTIC_CONFIG)
    }
}

/// A discovered primary service.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GattService {
    /// Service UUID.
    pub uuid: Uuid,
    /// Characteristics, in discovery order.
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    /// A service with no characteristics.
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            characteristics: Vec::new(),
        }
    }

    /// Add a characteristic, fixing up its service UUID.
    #[must_use]
    pub fn with_characteristic(mut self, mut characteristic: GattCharacteristic) -> Self {
        characteristic.service_uuid = self.uuid;
        self.characteristics.push(characteristic);
        self
    }

    /// Look up a characteristic by UUID.
    #[must_use]
    pub fn characteristic(&self, uuid: Uuid) -> Option<&GattCharacteristic> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}
