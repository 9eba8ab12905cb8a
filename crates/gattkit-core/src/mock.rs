//! Scriptable in-memory transport for tests.
//!
//! [`MockTransport`] implements [`GattTransport`] without hardware. Every
//! accepted primitive answers through a spawned tokio task after the
//! configured latency, so callbacks never run inside the primitive call.
//!
//! # Features
//!
//! - **Scripted GATT database**: services, characteristic values and RSSI
//! - **Failure injection**: refuse a primitive, answer with an error status,
//!   or never answer at all
//! - **Disconnect scripting**: refuse disconnects or never confirm them
//! - **Link events**: simulate link loss and notifications
//! - **Observation**: a log of every primitive call and the peak number of
//!   operations in flight at once

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI16, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use uuid::Uuid;

use gattkit_types::uuids::{
    BATTERY_LEVEL, BATTERY_SERVICE, CLIENT_CHARACTERISTIC_CONFIG, DEVICE_INFORMATION_SERVICE,
    MANUFACTURER_NAME,
};
use gattkit_types::{
    BluetoothAddress, ConnectionState, GattCharacteristic, GattOperation, GattService, GattStatus,
    WriteType,
};

use crate::error::{Error, Result};
use crate::transport::{GattCallback, GattLink, GattTransport};

/// A primitive call recorded by [`MockTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Connect {
        address: BluetoothAddress,
        auto_connect: bool,
    },
    Disconnect {
        address: BluetoothAddress,
    },
    Close {
        address: BluetoothAddress,
    },
    DiscoverServices {
        address: BluetoothAddress,
    },
    ReadCharacteristic {
        address: BluetoothAddress,
        characteristic: Uuid,
    },
    WriteCharacteristic {
        address: BluetoothAddress,
        characteristic: Uuid,
        value: Bytes,
        write_type: WriteType,
    },
    SetNotification {
        address: BluetoothAddress,
        characteristic: Uuid,
        enable: bool,
    },
    WriteDescriptor {
        address: BluetoothAddress,
        characteristic: Uuid,
        descriptor: Uuid,
        value: Bytes,
    },
    ReadRemoteRssi {
        address: BluetoothAddress,
    },
}

#[derive(Default)]
struct Script {
    /// Primitives that return `Err` immediately.
    refused: HashSet<GattOperation>,
    /// Primitives that are accepted but never answered.
    silent: HashSet<GattOperation>,
    /// Non-success statuses to answer with.
    statuses: HashMap<GattOperation, GattStatus>,
}

struct MockShared {
    enabled: AtomicBool,
    latency_ms: AtomicU64,
    services: Mutex<Vec<GattService>>,
    values: Mutex<HashMap<Uuid, Bytes>>,
    rssi: AtomicI16,
    script: Mutex<Script>,
    refuse_disconnect: AtomicBool,
    confirm_disconnect: AtomicBool,
    calls: Mutex<Vec<MockCall>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    links: Mutex<HashMap<BluetoothAddress, Arc<MockLink>>>,
}

impl MockShared {
    fn log(&self, call: MockCall) {
        self.calls.lock().push(call);
    }

    fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms.load(Ordering::Relaxed))
    }

    fn refuses(&self, operation: GattOperation) -> Result<()> {
        if self.script.lock().refused.contains(&operation) {
            Err(Error::transport(format!("mock refused {}", operation)))
        } else {
            Ok(())
        }
    }

    fn is_silent(&self, operation: GattOperation) -> bool {
        self.script.lock().silent.contains(&operation)
    }

    fn status(&self, operation: GattOperation) -> GattStatus {
        self.script
            .lock()
            .statuses
            .get(&operation)
            .copied()
            .unwrap_or(GattStatus::SUCCESS)
    }
}

/// A mock transport for testing.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use gattkit_core::{GattManager, MockTransport, OperationOptions};
/// use gattkit_types::GattOperation;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> gattkit_core::Result<()> {
/// let transport = Arc::new(MockTransport::builder().silent(GattOperation::CharacteristicRead).build());
/// let manager = GattManager::new(transport.clone())?;
/// let session = manager.get_session_for(MockTransport::random_address())?;
/// session.connect(false, OperationOptions::new())?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MockTransport {
    shared: Arc<MockShared>,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("enabled", &self.shared.enabled.load(Ordering::Relaxed))
            .field("links", &self.shared.links.lock().len())
            .field("calls", &self.shared.calls.lock().len())
            .finish()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// A transport exposing a Battery service (87%) and a Device
    /// Information service.
    pub fn new() -> Self {
        MockTransportBuilder::new().build()
    }

    /// Start building a scripted transport.
    pub fn builder() -> MockTransportBuilder {
        MockTransportBuilder::new()
    }

    /// A random valid device address.
    pub fn random_address() -> BluetoothAddress {
        loop {
            let address = BluetoothAddress::from_u64(rand::random::<u64>());
            if address.is_valid() {
                return address;
            }
        }
    }

    /// The default GATT database.
    pub fn default_services() -> Vec<GattService> {
        vec![
            GattService::new(BATTERY_SERVICE).with_characteristic(
                GattCharacteristic::new(BATTERY_SERVICE, BATTERY_LEVEL)
                    .with_descriptor(CLIENT_CHARACTERISTIC_CONFIG),
            ),
            GattService::new(DEVICE_INFORMATION_SERVICE).with_characteristic(
                GattCharacteristic::new(DEVICE_INFORMATION_SERVICE, MANUFACTURER_NAME),
            ),
        ]
    }

    // ==================== Scripting ====================

    /// Power the simulated radio on or off.
    pub fn set_enabled(&self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Delay before every callback.
    pub fn set_latency(&self, latency: Duration) {
        self.shared
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Value returned by reads of `characteristic`.
    pub fn set_value(&self, characteristic: Uuid, value: impl Into<Bytes>) {
        self.shared.values.lock().insert(characteristic, value.into());
    }

    /// Current value of `characteristic`, including written values.
    pub fn value(&self, characteristic: Uuid) -> Option<Bytes> {
        self.shared.values.lock().get(&characteristic).cloned()
    }

    /// RSSI returned by RSSI reads.
    pub fn set_rssi(&self, rssi: i16) {
        self.shared.rssi.store(rssi, Ordering::Relaxed);
    }

    /// Make the primitive for `operation` return `Err` immediately.
    pub fn set_refused(&self, operation: GattOperation, refused: bool) {
        let mut script = self.shared.script.lock();
        if refused {
            script.refused.insert(operation);
        } else {
            script.refused.remove(&operation);
        }
    }

    /// Accept the primitive for `operation` but never answer it.
    pub fn set_silent(&self, operation: GattOperation, silent: bool) {
        let mut script = self.shared.script.lock();
        if silent {
            script.silent.insert(operation);
        } else {
            script.silent.remove(&operation);
        }
    }

    /// Answer `operation` with `status`, or with success for `None`.
    pub fn set_status(&self, operation: GattOperation, status: Option<GattStatus>) {
        let mut script = self.shared.script.lock();
        match status {
            Some(status) => script.statuses.insert(operation, status),
            None => script.statuses.remove(&operation),
        };
    }

    /// Make disconnect requests fail immediately.
    pub fn set_refuse_disconnect(&self, refuse: bool) {
        self.shared.refuse_disconnect.store(refuse, Ordering::Relaxed);
    }

    /// Whether accepted disconnect requests are confirmed.
    pub fn set_confirm_disconnect(&self, confirm: bool) {
        self.shared.confirm_disconnect.store(confirm, Ordering::Relaxed);
    }

    // ==================== Link events ====================

    /// Drop the link to `address` as if the peer went away.
    ///
    /// Returns `false` if there is no open link.
    pub fn simulate_link_loss(&self, address: BluetoothAddress, status: GattStatus) -> bool {
        match self.link(address) {
            Some(link) => {
                link.callback
                    .on_connection_state_change(status, ConnectionState::Disconnected);
                true
            }
            None => false,
        }
    }

    /// Push a value change for `characteristic` on the link to `address`.
    ///
    /// Returns `false` if there is no open link or the characteristic is
    /// not in the GATT database.
    pub fn simulate_notification(
        &self,
        address: BluetoothAddress,
        characteristic: Uuid,
        value: impl Into<Bytes>,
    ) -> bool {
        let Some(link) = self.link(address) else {
            return false;
        };
        let found = self
            .shared
            .services
            .lock()
            .iter()
            .find_map(|s| s.characteristic(characteristic).cloned());
        match found {
            Some(characteristic) => {
                link.callback
                    .on_characteristic_changed(characteristic, value.into());
                true
            }
            None => false,
        }
    }

    // ==================== Observation ====================

    /// All primitive calls so far.
    pub fn calls(&self) -> Vec<MockCall> {
        self.shared.calls.lock().clone()
    }

    /// Number of calls matching `predicate`.
    pub fn count_calls(&self, predicate: impl Fn(&MockCall) -> bool) -> usize {
        self.shared.calls.lock().iter().filter(|c| predicate(c)).count()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        self.shared.calls.lock().clear();
    }

    /// Operations accepted but not yet answered.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Peak number of operations in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.shared.max_in_flight.load(Ordering::SeqCst)
    }

    /// Whether the link to `address` has local delivery enabled for
    /// `characteristic`.
    pub fn notifications_enabled(&self, address: BluetoothAddress, characteristic: Uuid) -> bool {
        self.link(address)
            .is_some_and(|l| l.notifications.lock().contains(&characteristic))
    }

    /// Whether a link to `address` is open.
    pub fn has_link(&self, address: BluetoothAddress) -> bool {
        self.link(address).is_some()
    }

    fn link(&self, address: BluetoothAddress) -> Option<Arc<MockLink>> {
        self.shared.links.lock().get(&address).cloned()
    }
}

impl GattTransport for MockTransport {
    fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::Relaxed)
    }

    fn connect(
        &self,
        address: BluetoothAddress,
        auto_connect: bool,
        callback: Arc<dyn GattCallback>,
    ) -> Result<Arc<dyn GattLink>> {
        self.shared.log(MockCall::Connect {
            address,
            auto_connect,
        });
        if !self.is_enabled() {
            return Err(Error::AdapterUnavailable);
        }
        self.shared.refuses(GattOperation::Connect)?;

        let link = Arc::new(MockLink {
            address,
            shared: Arc::clone(&self.shared),
            callback,
            closed: Arc::new(AtomicBool::new(false)),
            notifications: Mutex::new(HashSet::new()),
        });
        self.shared.links.lock().insert(address, Arc::clone(&link));

        if !self.shared.is_silent(GattOperation::Connect) {
            let status = self.shared.status(GattOperation::Connect);
            let state = if status.is_success() {
                ConnectionState::Connected
            } else {
                ConnectionState::Disconnected
            };
            link.answer(false, move |cb| cb.on_connection_state_change(status, state));
        }
        Ok(link)
    }
}

struct MockLink {
    address: BluetoothAddress,
    shared: Arc<MockShared>,
    callback: Arc<dyn GattCallback>,
    closed: Arc<AtomicBool>,
    notifications: Mutex<HashSet<Uuid>>,
}

impl MockLink {
    /// Run `answer` against the callback after the configured latency.
    fn answer<F>(&self, tracked: bool, answer: F)
    where
        F: FnOnce(&dyn GattCallback) + Send + 'static,
    {
        if tracked {
            let now = self.shared.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.shared.max_in_flight.fetch_max(now, Ordering::SeqCst);
        }
        let latency = self.shared.latency();
        let shared = Arc::clone(&self.shared);
        let callback = Arc::clone(&self.callback);
        let closed = Arc::clone(&self.closed);
        tokio::spawn(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            if tracked {
                shared.in_flight.fetch_sub(1, Ordering::SeqCst);
            }
            if !closed.load(Ordering::SeqCst) {
                answer(callback.as_ref());
            }
        });
    }

    fn operation(&self, operation: GattOperation) -> Result<Option<GattStatus>> {
        self.shared.refuses(operation)?;
        if self.shared.is_silent(operation) {
            if operation != GattOperation::DiscoverServices {
                let now = self.shared.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.shared.max_in_flight.fetch_max(now, Ordering::SeqCst);
            }
            return Ok(None);
        }
        Ok(Some(self.shared.status(operation)))
    }
}

impl GattLink for MockLink {
    fn disconnect(&self) -> Result<()> {
        self.shared.log(MockCall::Disconnect {
            address: self.address,
        });
        if self.shared.refuse_disconnect.load(Ordering::Relaxed) {
            return Err(Error::transport("mock refused disconnect"));
        }
        if self.shared.confirm_disconnect.load(Ordering::Relaxed) {
            self.answer(false, |cb| {
                cb.on_connection_state_change(GattStatus::SUCCESS, ConnectionState::Disconnected)
            });
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.shared.log(MockCall::Close {
            address: self.address,
        });
        self.closed.store(true, Ordering::SeqCst);
        let mut links = self.shared.links.lock();
        let is_current = links
            .get(&self.address)
            .is_some_and(|l| Arc::ptr_eq(&l.closed, &self.closed));
        if is_current {
            links.remove(&self.address);
        }
        Ok(())
    }

    fn discover_services(&self) -> Result<()> {
        self.shared.log(MockCall::DiscoverServices {
            address: self.address,
        });
        if let Some(status) = self.operation(GattOperation::DiscoverServices)? {
            self.answer(false, move |cb| cb.on_services_discovered(status));
        }
        Ok(())
    }

    fn services(&self) -> Vec<GattService> {
        self.shared.services.lock().clone()
    }

    fn read_characteristic(&self, characteristic: &GattCharacteristic) -> Result<()> {
        self.shared.log(MockCall::ReadCharacteristic {
            address: self.address,
            characteristic: characteristic.uuid,
        });
        if let Some(status) = self.operation(GattOperation::CharacteristicRead)? {
            let value = if status.is_success() {
                self.shared
                    .values
                    .lock()
                    .get(&characteristic.uuid)
                    .cloned()
                    .unwrap_or_default()
            } else {
                Bytes::new()
            };
            let characteristic = characteristic.clone();
            self.answer(true, move |cb| {
                cb.on_characteristic_read(characteristic, value, status)
            });
        }
        Ok(())
    }

    fn write_characteristic(
        &self,
        characteristic: &GattCharacteristic,
        value: Bytes,
        write_type: WriteType,
    ) -> Result<()> {
        self.shared.log(MockCall::WriteCharacteristic {
            address: self.address,
            characteristic: characteristic.uuid,
            value: value.clone(),
            write_type,
        });
        if let Some(status) = self.operation(GattOperation::CharacteristicWrite)? {
            if status.is_success() {
                self.shared.values.lock().insert(characteristic.uuid, value);
            }
            let characteristic = characteristic.clone();
            self.answer(true, move |cb| cb.on_characteristic_write(characteristic, status));
        }
        Ok(())
    }

    fn set_characteristic_notification(
        &self,
        characteristic: &GattCharacteristic,
        enable: bool,
    ) -> Result<()> {
        self.shared.log(MockCall::SetNotification {
            address: self.address,
            characteristic: characteristic.uuid,
            enable,
        });
        self.shared
            .refuses(GattOperation::CharacteristicSetNotification)?;
        let mut notifications = self.notifications.lock();
        if enable {
            notifications.insert(characteristic.uuid);
        } else {
            notifications.remove(&characteristic.uuid);
        }
        Ok(())
    }

    fn write_descriptor(
        &self,
        characteristic: &GattCharacteristic,
        descriptor: Uuid,
        value: Bytes,
    ) -> Result<()> {
        self.shared.log(MockCall::WriteDescriptor {
            address: self.address,
            characteristic: characteristic.uuid,
            descriptor,
            value,
        });
        if self.shared.is_silent(GattOperation::CharacteristicSetNotification) {
            return Ok(());
        }
        let status = self.shared.status(GattOperation::CharacteristicSetNotification);
        let characteristic = characteristic.clone();
        self.answer(true, move |cb| {
            cb.on_descriptor_write(characteristic, descriptor, status)
        });
        Ok(())
    }

    fn read_remote_rssi(&self) -> Result<()> {
        self.shared.log(MockCall::ReadRemoteRssi {
            address: self.address,
        });
        if let Some(status) = self.operation(GattOperation::ReadRemoteRssi)? {
            let rssi = self.shared.rssi.load(Ordering::Relaxed);
            self.answer(true, move |cb| cb.on_read_remote_rssi(rssi, status));
        }
        Ok(())
    }
}

/// Builder for creating mock transports with custom settings.
#[derive(Debug)]
pub struct MockTransportBuilder {
    enabled: bool,
    latency: Duration,
    services: Vec<GattService>,
    values: HashMap<Uuid, Bytes>,
    rssi: i16,
    refused: HashSet<GattOperation>,
    silent: HashSet<GattOperation>,
    statuses: HashMap<GattOperation, GattStatus>,
    refuse_disconnect: bool,
    confirm_disconnect: bool,
}

impl Default for MockTransportBuilder {
    fn default() -> Self {
        let mut values = HashMap::new();
        values.insert(BATTERY_LEVEL, Bytes::from_static(&[87]));
        values.insert(MANUFACTURER_NAME, Bytes::from_static(b"gattkit"));
        Self {
            enabled: true,
            latency: Duration::ZERO,
            services: MockTransport::default_services(),
            values,
            rssi: -60,
            refused: HashSet::new(),
            silent: HashSet::new(),
            statuses: HashMap::new(),
            refuse_disconnect: false,
            confirm_disconnect: true,
        }
    }
}

impl MockTransportBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set whether the radio starts powered.
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the callback latency.
    #[must_use]
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Replace the GATT database.
    #[must_use]
    pub fn services(mut self, services: Vec<GattService>) -> Self {
        self.services = services;
        self
    }

    /// Set the value of a characteristic.
    #[must_use]
    pub fn value(mut self, characteristic: Uuid, value: impl Into<Bytes>) -> Self {
        self.values.insert(characteristic, value.into());
        self
    }

    /// Set the RSSI reported by RSSI reads.
    #[must_use]
    pub fn rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    /// Refuse the primitive for `operation`.
    #[must_use]
    pub fn refuse(mut self, operation: GattOperation) -> Self {
        self.refused.insert(operation);
        self
    }

    /// Never answer the primitive for `operation`.
    #[must_use]
    pub fn silent(mut self, operation: GattOperation) -> Self {
        self.silent.insert(operation);
        self
    }

    /// Answer `operation` with `status`.
    #[must_use]
    pub fn status(mut self, operation: GattOperation, status: GattStatus) -> Self {
        self.statuses.insert(operation, status);
        self
    }

    /// Refuse disconnect requests.
    #[must_use]
    pub fn refuse_disconnect(mut self) -> Self {
        self.refuse_disconnect = true;
        self
    }

    /// Accept disconnect requests but never confirm them.
    #[must_use]
    pub fn unconfirmed_disconnect(mut self) -> Self {
        self.confirm_disconnect = false;
        self
    }

    /// Build the transport.
    pub fn build(self) -> MockTransport {
        MockTransport {
            shared: Arc::new(MockShared {
                enabled: AtomicBool::new(self.enabled),
                latency_ms: AtomicU64::new(self.latency.as_millis() as u64),
                services: Mutex::new(self.services),
                values: Mutex::new(self.values),
                rssi: AtomicI16::new(self.rssi),
                script: Mutex::new(Script {
                    refused: self.refused,
                    silent: self.silent,
                    statuses: self.statuses,
                }),
                refuse_disconnect: AtomicBool::new(self.refuse_disconnect),
                confirm_disconnect: AtomicBool::new(self.confirm_disconnect),
                calls: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                links: Mutex::new(HashMap::new()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Seen {
        State(GattStatus, ConnectionState),
        Discovered(GattStatus),
        Read(Uuid, Bytes, GattStatus),
        Write(Uuid, GattStatus),
        Descriptor(Uuid, GattStatus),
        Changed(Uuid, Bytes),
        Rssi(i16, GattStatus),
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Seen>>);

    impl Recorder {
        fn seen(&self) -> Vec<Seen> {
            self.0.lock().clone()
        }
    }

    impl GattCallback for Recorder {
        fn on_connection_state_change(&self, status: GattStatus, state: ConnectionState) {
            self.0.lock().push(Seen::State(status, state));
        }
        fn on_services_discovered(&self, status: GattStatus) {
            self.0.lock().push(Seen::Discovered(status));
        }
        fn on_characteristic_read(&self, c: GattCharacteristic, value: Bytes, status: GattStatus) {
            self.0.lock().push(Seen::Read(c.uuid, value, status));
        }
        fn on_characteristic_write(&self, c: GattCharacteristic, status: GattStatus) {
            self.0.lock().push(Seen::Write(c.uuid, status));
        }
        fn on_descriptor_write(&self, _: GattCharacteristic, descriptor: Uuid, status: GattStatus) {
            self.0.lock().push(Seen::Descriptor(descriptor, status));
        }
        fn on_characteristic_changed(&self, c: GattCharacteristic, value: Bytes) {
            self.0.lock().push(Seen::Changed(c.uuid, value));
        }
        fn on_read_remote_rssi(&self, rssi: i16, status: GattStatus) {
            self.0.lock().push(Seen::Rssi(rssi, status));
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn battery_level() -> GattCharacteristic {
        GattCharacteristic::new(BATTERY_SERVICE, BATTERY_LEVEL)
    }

    #[tokio::test]
    async fn test_connect_answers_asynchronously() {
        let transport = MockTransport::new();
        let recorder = Arc::new(Recorder::default());
        let address = MockTransport::random_address();

        let _link = transport.connect(address, false, recorder.clone()).unwrap();
        assert!(recorder.seen().is_empty());
        settle().await;
        assert_eq!(
            recorder.seen(),
            vec![Seen::State(GattStatus::SUCCESS, ConnectionState::Connected)]
        );
        assert!(transport.has_link(address));
    }

    #[tokio::test]
    async fn test_disabled_radio_refuses_connect() {
        let transport = MockTransport::builder().enabled(false).build();
        let result = transport.connect(
            MockTransport::random_address(),
            false,
            Arc::new(Recorder::default()),
        );
        assert!(matches!(result, Err(Error::AdapterUnavailable)));
    }

    #[tokio::test]
    async fn test_read_write_round_trip() {
        let transport = MockTransport::new();
        let recorder = Arc::new(Recorder::default());
        let link = transport
            .connect(MockTransport::random_address(), false, recorder.clone())
            .unwrap();

        link.write_characteristic(
            &battery_level(),
            Bytes::from_static(&[42]),
            WriteType::DefaultWithResponse,
        )
        .unwrap();
        settle().await;
        link.read_characteristic(&battery_level()).unwrap();
        settle().await;

        let seen = recorder.seen();
        assert!(seen.contains(&Seen::Write(BATTERY_LEVEL, GattStatus::SUCCESS)));
        assert!(seen.contains(&Seen::Read(
            BATTERY_LEVEL,
            Bytes::from_static(&[42]),
            GattStatus::SUCCESS
        )));
        assert_eq!(transport.value(BATTERY_LEVEL), Some(Bytes::from_static(&[42])));
        assert_eq!(transport.in_flight(), 0);
        assert_eq!(transport.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let transport = MockTransport::builder()
            .refuse(GattOperation::CharacteristicWrite)
            .silent(GattOperation::CharacteristicRead)
            .status(GattOperation::ReadRemoteRssi, GattStatus::FAILURE)
            .build();
        let recorder = Arc::new(Recorder::default());
        let link = transport
            .connect(MockTransport::random_address(), false, recorder.clone())
            .unwrap();
        settle().await;

        assert!(
            link.write_characteristic(&battery_level(), Bytes::new(), WriteType::WithoutResponse)
                .is_err()
        );
        link.read_characteristic(&battery_level()).unwrap();
        link.read_remote_rssi().unwrap();
        settle().await;

        let seen = recorder.seen();
        assert!(seen.contains(&Seen::Rssi(-60, GattStatus::FAILURE)));
        assert!(!seen.iter().any(|s| matches!(s, Seen::Read(..))));
        assert_eq!(transport.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_descriptor_write_and_notifications() {
        let transport = MockTransport::new();
        let recorder = Arc::new(Recorder::default());
        let address = MockTransport::random_address();
        let link = transport.connect(address, false, recorder.clone()).unwrap();

        link.set_characteristic_notification(&battery_level(), true)
            .unwrap();
        link.write_descriptor(
            &battery_level(),
            CLIENT_CHARACTERISTIC_CONFIG,
            Bytes::from_static(&[1, 0]),
        )
        .unwrap();
        settle().await;
        assert!(transport.notifications_enabled(address, BATTERY_LEVEL));
        assert!(transport.simulate_notification(address, BATTERY_LEVEL, vec![50u8]));
        assert!(!transport.simulate_notification(
            address,
            gattkit_types::uuids::HEART_RATE_MEASUREMENT,
            vec![1u8]
        ));

        let seen = recorder.seen();
        assert!(seen.contains(&Seen::Descriptor(
            CLIENT_CHARACTERISTIC_CONFIG,
            GattStatus::SUCCESS
        )));
        assert!(seen.contains(&Seen::Changed(BATTERY_LEVEL, Bytes::from_static(&[50]))));
    }

    #[tokio::test]
    async fn test_disconnect_and_close() {
        let transport = MockTransport::builder().unconfirmed_disconnect().build();
        let recorder = Arc::new(Recorder::default());
        let address = MockTransport::random_address();
        let link = transport.connect(address, false, recorder.clone()).unwrap();
        settle().await;

        link.disconnect().unwrap();
        settle().await;
        assert_eq!(recorder.seen().len(), 1);

        link.close().unwrap();
        assert!(!transport.has_link(address));
        assert!(!transport.simulate_link_loss(address, GattStatus::ERROR));
        assert_eq!(
            transport.count_calls(|c| matches!(c, MockCall::Close { .. })),
            1
        );

        // Nothing is delivered after close.
        link.read_remote_rssi().unwrap();
        settle().await;
        assert_eq!(recorder.seen().len(), 1);
    }

    #[test]
    fn test_random_address_is_valid() {
        for _ in 0..100 {
            assert!(MockTransport::random_address().is_valid());
        }
    }
}
