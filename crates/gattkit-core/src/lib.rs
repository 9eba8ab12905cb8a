//! Serialized, timeout-guarded GATT sessions.
//!
//! This crate turns a transport's fire-and-callback GATT primitives into
//! per-device sessions that run one operation at a time, bound every
//! operation by a timeout, and report results to listeners in completion
//! order.
//!
//! # Features
//!
//! - **Session registry**: one [`GattSession`] per device address, shared by
//!   every caller through a [`GattManager`]
//! - **Single in-flight operation**: a per-session worker and a
//!   [`PendingOperationGate`] serialize connect, discovery, reads, writes,
//!   notification setup and RSSI reads
//! - **Timeouts with veto**: a stalled operation disconnects the link unless
//!   a listener asks to keep it
//! - **Exactly-once teardown**: every connection ends with one
//!   [`GattEvent::Disconnected`] carrying a [`DisconnectReason`]
//! - **Listener fan-out**: [`GattListener`]s may attach and detach while
//!   events are being delivered
//! - **Pluggable transports**: [`BtleplugTransport`] for real adapters,
//!   [`MockTransport`] for tests
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use gattkit_core::{BtleplugTransport, GattEvent, GattManager, ListenerAction, OperationOptions};
//! use gattkit_core::uuids::{BATTERY_LEVEL, BATTERY_SERVICE};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(BtleplugTransport::new().await?);
//!     let manager = GattManager::new(transport)?;
//!     let session = manager.get_session("AA:BB:CC:DD:EE:FF")?;
//!
//!     session.add_listener_fn(|session, event: &GattEvent| {
//!         if let GattEvent::ServicesDiscovered { success: true, .. } = event {
//!             let _ = session.characteristic_read(
//!                 BATTERY_SERVICE,
//!                 BATTERY_LEVEL,
//!                 OperationOptions::new(),
//!             );
//!         }
//!         if let GattEvent::CharacteristicRead { value, .. } = event {
//!             println!("Battery: {}%", value.first().copied().unwrap_or_default());
//!         }
//!         ListenerAction::Continue
//!     });
//!
//!     session.connect(false, OperationOptions::new())?;
//!     tokio::time::sleep(std::time::Duration::from_secs(20)).await;
//!     manager.close();
//!     Ok(())
//! }
//! ```

pub mod btleplug_transport;
pub mod config;
mod delivery;
pub mod error;
pub mod events;
pub mod gate;
pub mod listeners;
pub mod manager;
pub mod metrics;
pub mod mock;
pub mod session;
pub mod transport;

// Core exports
pub use error::{Error, Result};
pub use manager::GattManager;
pub use session::{AfterSuccess, GattSession, OperationOptions};

pub use btleplug_transport::BtleplugTransport;
pub use config::{ConfigError, ManagerConfig, SessionConfig, ValidationError};
pub use events::{
    EventDispatcher, EventReceiver, EventSender, GattEvent, GattListener, ListenerAction,
    SessionEvent,
};
pub use gate::{PendingOperationGate, WaitOutcome};
pub use listeners::ListenerSet;
pub use metrics::{OperationMetrics, SessionMetrics, SessionMetricsSummary};
pub use mock::{MockCall, MockTransport, MockTransportBuilder};
pub use transport::{GattCallback, GattLink, GattTransport};

// Re-export from gattkit-types
pub use gattkit_types::uuids;
pub use gattkit_types::{
    BluetoothAddress, ConnectionState, DisconnectReason, FloatFormat, GattCharacteristic,
    GattOperation, GattService, GattStatus, IntFormat, NotificationDescriptorType, WriteType,
};
