//! Bluetooth SIG assigned-number UUIDs.
//!
//! Standard GATT services, characteristics and descriptors are 16-bit
//! assigned numbers embedded in the Bluetooth base UUID
//! `0000xxxx-0000-1000-8000-00805f9b34fb`.

use uuid::{Uuid, uuid};

const BASE_UUID_HIGH_LOW_BITS: u64 = 0x1000;
const BASE_UUID_LEAST_SIGNIFICANT_BITS: u64 = 0x8000_0080_5f9b_34fb;

/// Expand a 16-bit assigned number into a full 128-bit UUID.
///
/// ```
/// use gattkit_types::uuids::{assigned_number_to_uuid, BATTERY_SERVICE};
///
/// assert_eq!(assigned_number_to_uuid(0x180f), BATTERY_SERVICE);
/// ```
#[must_use]
pub const fn assigned_number_to_uuid(assigned_number: u16) -> Uuid {
    Uuid::from_u64_pair(
        ((assigned_number as u64) << 32) | BASE_UUID_HIGH_LOW_BITS,
        BASE_UUID_LEAST_SIGNIFICANT_BITS,
    )
}

/// Extract the 16-bit assigned number from a UUID.
///
/// Only meaningful for UUIDs built on the Bluetooth base UUID; see
/// [`is_assigned_number`].
#[must_use]
pub fn uuid_to_assigned_number(uuid: Uuid) -> u16 {
    let (high, _) = uuid.as_u64_pair();
    ((high & 0x0000_FFFF_0000_0000) >> 32) as u16
}

/// Whether the UUID is built on the Bluetooth base UUID.
#[must_use]
pub fn is_assigned_number(uuid: Uuid) -> bool {
    let (high, low) = uuid.as_u64_pair();
    high & 0xFFFF_0000_FFFF_FFFF == BASE_UUID_HIGH_LOW_BITS
        && low == BASE_UUID_LEAST_SIGNIFICANT_BITS
}

// --- Alert Notification ---

/// Alert Notification service.
pub const ALERT_NOTIFICATION_SERVICE: Uuid = uuid!("00001811-0000-1000-8000-00805f9b34fb");
/// Alert Category ID characteristic.
pub const ALERT_CATEGORY_ID: Uuid = uuid!("00002a43-0000-1000-8000-00805f9b34fb");
/// Alert Category ID Bit Mask characteristic.
pub const ALERT_CATEGORY_ID_BIT_MASK: Uuid = uuid!("00002a42-0000-1000-8000-00805f9b34fb");
/// Alert Level characteristic.
pub const ALERT_LEVEL: Uuid = uuid!("00002a06-0000-1000-8000-00805f9b34fb");
/// Alert Notification Control Point characteristic.
pub const ALERT_NOTIFICATION_CONTROL_POINT: Uuid =
    uuid!("00002a44-0000-1000-8000-00805f9b34fb");
/// Alert Status characteristic.
pub const ALERT_STATUS: Uuid = uuid!("00002a3f-0000-1000-8000-00805f9b34fb");
/// New Alert characteristic.
pub const NEW_ALERT: Uuid = uuid!("00002a46-0000-1000-8000-00805f9b34fb");

/// Alert Level value: no alert.
pub const ALERT_LEVEL_NONE: u8 = 0x00;
/// Alert Level value: mild alert.
pub const ALERT_LEVEL_MILD: u8 = 0x01;
/// Alert Level value: high alert.
pub const ALERT_LEVEL_HIGH: u8 = 0x02;

// --- Battery ---

/// Battery service.
pub const BATTERY_SERVICE: Uuid = uuid!("0000180f-0000-1000-8000-00805f9b34fb");
/// Battery Level characteristic.
pub const BATTERY_LEVEL: Uuid = uuid!("00002a19-0000-1000-8000-00805f9b34fb");

// --- Blood Pressure ---

/// Blood Pressure service.
pub const BLOOD_PRESSURE_SERVICE: Uuid = uuid!("00001810-0000-1000-8000-00805f9b34fb");
/// Blood Pressure Measurement characteristic.
pub const BLOOD_PRESSURE_MEASUREMENT: Uuid = uuid!("00002a35-0000-1000-8000-00805f9b34fb");

// --- Cycling Speed and Cadence ---

/// Cycling Speed and Cadence service.
pub const CYCLING_SPEED_AND_CADENCE_SERVICE: Uuid =
    uuid!("00001816-0000-1000-8000-00805f9b34fb");
/// CSC Measurement characteristic.
pub const CYCLING_SPEED_AND_CADENCE_MEASUREMENT: Uuid =
    uuid!("00002a5b-0000-1000-8000-00805f9b34fb");
/// CSC Feature characteristic.
pub const CYCLING_SPEED_AND_CADENCE_FEATURE: Uuid =
    uuid!("00002a5c-0000-1000-8000-00805f9b34fb");
/// SC Control Point characteristic.
pub const CYCLING_SPEED_AND_CADENCE_CONTROL_POINT: Uuid =
    uuid!("00002a55-0000-1000-8000-00805f9b34fb");
/// Sensor Location characteristic.
pub const SENSOR_LOCATION: Uuid = uuid!("00002a5d-0000-1000-8000-00805f9b34fb");

// --- Device Information ---

/// Device Information service.
pub const DEVICE_INFORMATION_SERVICE: Uuid = uuid!("0000180a-0000-1000-8000-00805f9b34fb");
/// Manufacturer Name String characteristic.
pub const MANUFACTURER_NAME: Uuid = uuid!("00002a29-0000-1000-8000-00805f9b34fb");
/// Model Number String characteristic.
pub const MODEL_NUMBER: Uuid = uuid!("00002a24-0000-1000-8000-00805f9b34fb");
/// Serial Number String characteristic.
pub const SERIAL_NUMBER: Uuid = uuid!("00002a25-0000-1000-8000-00805f9b34fb");
/// Hardware Revision String characteristic.
pub const HARDWARE_REVISION: Uuid = uuid!("00002a27-0000-1000-8000-00805f9b34fb");
/// Firmware Revision String characteristic.
pub const FIRMWARE_REVISION: Uuid = uuid!("00002a26-0000-1000-8000-00805f9b34fb");
/// Software Revision String characteristic.
pub const SOFTWARE_REVISION: Uuid = uuid!("00002a28-0000-1000-8000-00805f9b34fb");
/// PnP ID characteristic.
pub const PNP_ID: Uuid = uuid!("00002a50-0000-1000-8000-00805f9b34fb");

// --- Environmental Sensing ---

/// Environmental Sensing service.
pub const ENVIRONMENTAL_SENSING_SERVICE: Uuid = uuid!("0000181a-0000-1000-8000-00805f9b34fb");
/// Temperature characteristic.
pub const TEMPERATURE: Uuid = uuid!("00002a6e-0000-1000-8000-00805f9b34fb");

// --- Generic Access / Generic Attribute ---

/// Generic Access service.
pub const GENERIC_ACCESS_SERVICE: Uuid = uuid!("00001800-0000-1000-8000-00805f9b34fb");
/// Device Name characteristic.
pub const DEVICE_NAME: Uuid = uuid!("00002a00-0000-1000-8000-00805f9b34fb");
/// Appearance characteristic.
pub const APPEARANCE: Uuid = uuid!("00002a01-0000-1000-8000-00805f9b34fb");
/// Peripheral Preferred Connection Parameters characteristic.
pub const PERIPHERAL_PREFERRED_CONNECTION_PARAMETERS: Uuid =
    uuid!("00002a04-0000-1000-8000-00805f9b34fb");
/// Service Changed characteristic.
pub const SERVICE_CHANGED: Uuid = uuid!("00002a05-0000-1000-8000-00805f9b34fb");
/// Generic Attribute service.
pub const GENERIC_ATTRIBUTE_SERVICE: Uuid = uuid!("00001801-0000-1000-8000-00805f9b34fb");

// --- Heart Rate ---

/// Heart Rate service.
pub const HEART_RATE_SERVICE: Uuid = uuid!("0000180d-0000-1000-8000-00805f9b34fb");
/// Heart Rate Measurement characteristic.
pub const HEART_RATE_MEASUREMENT: Uuid = uuid!("00002a37-0000-1000-8000-00805f9b34fb");
/// Body Sensor Location characteristic.
pub const BODY_SENSOR_LOCATION: Uuid = uuid!("00002a38-0000-1000-8000-00805f9b34fb");

// --- Descriptors ---

/// Client Characteristic Configuration descriptor (CCCD).
pub const CLIENT_CHARACTERISTIC_CONFIG: Uuid = uuid!("00002902-0000-1000-8000-00805f9b34fb");

// --- Proximity ---

/// Immediate Alert service.
pub const IMMEDIATE_ALERT_SERVICE: Uuid = uuid!("00001802-0000-1000-8000-00805f9b34fb");
/// Link Loss service.
pub const LINK_LOSS_SERVICE: Uuid = uuid!("00001803-0000-1000-8000-00805f9b34fb");
/// Tx Power service.
pub const TX_POWER_SERVICE: Uuid = uuid!("00001804-0000-1000-8000-00805f9b34fb");
/// Tx Power Level characteristic.
pub const TX_POWER_LEVEL: Uuid = uuid!("00002a07-0000-1000-8000-00805f9b34fb");

// --- Running Speed and Cadence ---

/// Running Speed and Cadence service.
pub const RUNNING_SPEED_AND_CADENCE_SERVICE: Uuid =
    uuid!("00001814-0000-1000-8000-00805f9b34fb");
/// RSC Measurement characteristic.
pub const RUNNING_SPEED_AND_CADENCE_MEASUREMENT: Uuid =
    uuid!("00002a53-0000-1000-8000-00805f9b34fb");

const NAMES: &[(Uuid, &str)] = &[
    (ALERT_NOTIFICATION_SERVICE, "Alert Notification Service"),
    (ALERT_CATEGORY_ID, "Alert Category ID"),
    (ALERT_CATEGORY_ID_BIT_MASK, "Alert Category ID Bit Mask"),
    (ALERT_LEVEL, "Alert Level"),
    (ALERT_NOTIFICATION_CONTROL_POINT, "Alert Notification Control Point"),
    (ALERT_STATUS, "Alert Status"),
    (NEW_ALERT, "New Alert"),
    (BATTERY_SERVICE, "Battery Service"),
    (BATTERY_LEVEL, "Battery Level"),
    (BLOOD_PRESSURE_SERVICE, "Blood Pressure Service"),
    (BLOOD_PRESSURE_MEASUREMENT, "Blood Pressure Measurement"),
    (CYCLING_SPEED_AND_CADENCE_SERVICE, "Cycling Speed and Cadence Service"),
    (CYCLING_SPEED_AND_CADENCE_MEASUREMENT, "Cycling Speed and Cadence Measurement"),
    (CYCLING_SPEED_AND_CADENCE_FEATURE, "Cycling Speed and Cadence Feature"),
    (CYCLING_SPEED_AND_CADENCE_CONTROL_POINT, "Speed and Cadence Control Point"),
    (SENSOR_LOCATION, "Sensor Location"),
    (DEVICE_INFORMATION_SERVICE, "Device Information Service"),
    (MANUFACTURER_NAME, "Manufacturer Name String"),
    (MODEL_NUMBER, "Model Number String"),
    (SERIAL_NUMBER, "Serial Number String"),
    (HARDWARE_REVISION, "Hardware Revision String"),
    (FIRMWARE_REVISION, "Firmware Revision String"),
    (SOFTWARE_REVISION, "Software Revision String"),
    (PNP_ID, "PnP ID"),
    (ENVIRONMENTAL_SENSING_SERVICE, "Environmental Sensing Service"),
    (TEMPERATURE, "Temperature"),
    (GENERIC_ACCESS_SERVICE, "Generic Access Service"),
    (DEVICE_NAME, "Device Name"),
    (APPEARANCE, "Appearance"),
    (
        PERIPHERAL_PREFERRED_CONNECTION_PARAMETERS,
        "Peripheral Preferred Connection Parameters",
    ),
    (SERVICE_CHANGED, "Service Changed"),
    (GENERIC_ATTRIBUTE_SERVICE, "Generic Attribute Service"),
    (HEART_RATE_SERVICE, "Heart Rate Service"),
    (HEART_RATE_MEASUREMENT, "Heart Rate Measurement"),
    (BODY_SENSOR_LOCATION, "Body Sensor Location"),
    (CLIENT_CHARACTERISTIC_CONFIG, "Client Characteristic Config"),
    (IMMEDIATE_ALERT_SERVICE, "Immediate Alert Service"),
    (LINK_LOSS_SERVICE, "Link Loss Service"),
    (TX_POWER_SERVICE, "Tx Power Service"),
    (TX_POWER_LEVEL, "Tx Power Level"),
    (RUNNING_SPEED_AND_CADENCE_SERVICE, "Running Speed and Cadence Service"),
    (
        RUNNING_SPEED_AND_CADENCE_MEASUREMENT,
        "Running Speed and Cadence Measurement",
    ),
];

/// Human-readable name of a well-known UUID.
#[must_use]
pub fn lookup_name(uuid: Uuid) -> Option<&'static str> {
    NAMES.iter().find(|(u, _)| *u == uuid).map(|(_, name)| *name)
}

/// Short description for logs: the known name, the 16-bit number for other
/// assigned numbers, or the full UUID.
#[must_use]
pub fn describe(uuid: Uuid) -> String {
    match lookup_name(uuid) {
        Some(name) => format!("{} (0x{:04x})", name, uuid_to_assigned_number(uuid)),
        None if is_assigned_number(uuid) => format!("0x{:04x}", uuid_to_assigned_number(uuid)),
        None => uuid.to_string(),
    }
}
