//! 48-bit Bluetooth device addresses.

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{ParseError, ParseResult};

const ADDRESS_MASK: u64 = 0xFFFF_FFFF_FFFF;

/// A Bluetooth device address held in the low 48 bits of a `u64`.
///
/// Displayed as six uppercase, colon-separated octets
/// (`AA:BB:CC:DD:EE:FF`), most significant octet first.
///
/// # Examples
///
/// ```
/// use gattkit_types::BluetoothAddress;
///
/// let address: BluetoothAddress = "aa:bb:cc:dd:ee:ff".parse().unwrap();
/// assert_eq!(address.as_u64(), 0xAABB_CCDD_EEFF);
/// assert_eq!(address.to_string(), "AA:BB:CC:DD:EE:FF");
/// assert!(address.is_valid());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BluetoothAddress(u64);

impl BluetoothAddress {
    /// The all-zero address.
    pub const ZERO: Self = Self(0);

    /// The broadcast address `FF:FF:FF:FF:FF:FF`.
    pub const BROADCAST: Self = Self(ADDRESS_MASK);

    /// Create an address from the low 48 bits of `value`.
    #[must_use]
    pub const fn from_u64(value: u64) -> Self {
        Self(value & ADDRESS_MASK)
    }

    /// Create an address from six octets, most significant first.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 6]) -> Self {
        let mut value = 0u64;
        let mut i = 0;
        while i < 6 {
            value = (value << 8) | bytes[i] as u64;
            i += 1;
        }
        Self(value)
    }

    /// The address as a `u64`.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The six address octets, most significant first.
    #[must_use]
    pub const fn to_bytes(self) -> [u8; 6] {
        let v = self.0;
        [
            (v >> 40) as u8,
            (v >> 32) as u8,
            (v >> 24) as u8,
            (v >> 16) as u8,
            (v >> 8) as u8,
            v as u8,
        ]
    }

    /// Whether the address can identify a remote device.
    ///
    /// Zero and broadcast addresses are rejected.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0 && self.0 != ADDRESS_MASK
    }

    /// Parse and reject zero/broadcast addresses in one step.
    pub fn parse_device(s: &str) -> ParseResult<Self> {
        let address: Self = s.parse()?;
        address.validate()
    }

    /// Return `self` if it is a usable device address.
    pub fn validate(self) -> ParseResult<Self> {
        if self.is_valid() {
            Ok(self)
        } else {
            Err(ParseError::ReservedAddress(self.to_string()))
        }
    }
}

impl FromStr for BluetoothAddress {
    type Err = ParseError;

    fn from_str(s: &str) -> ParseResult<Self> {
        let invalid = || ParseError::InvalidAddress(s.to_string());

        let mut bytes = [0u8; 6];
        let mut parts = s.trim().split(':');
        for byte in &mut bytes {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(Self::from_bytes(bytes))
    }
}

impl fmt::Display for BluetoothAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.to_bytes();
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl fmt::Debug for BluetoothAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BluetoothAddress({})", self)
    }
}

impl From<[u8; 6]> for BluetoothAddress {
    fn from(bytes: [u8; 6]) -> Self {
        Self::from_bytes(bytes)
    }
}

impl From<BluetoothAddress> for [u8; 6] {
    fn from(address: BluetoothAddress) -> Self {
        address.to_bytes()
    }
}

#[cfg(feature = "serde")]
impl Serialize for BluetoothAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(feature = "serde")]
impl<'de> Deserialize<'de> for BluetoothAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
