//! [`GattTransport`] over a btleplug adapter.
//!
//! btleplug exposes async request/response calls; this module turns each
//! accepted primitive into a spawned task that reports through the link's
//! [`GattCallback`]. Local notification toggles filter the peripheral's
//! notification stream, and Client Characteristic Configuration writes map
//! to btleplug subscribe/unsubscribe.
//!
//! Peripherals are matched by MAC address, so this transport suits Linux and
//! Windows. On macOS CoreBluetooth hides addresses and lookups fail with
//! [`Error::DeviceNotFound`].

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use btleplug::api::{
    BDAddr, Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    WriteType as BtleWriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use gattkit_types::uuids::CLIENT_CHARACTERISTIC_CONFIG;
use gattkit_types::{
    BluetoothAddress, ConnectionState, GattCharacteristic, GattService, GattStatus, WriteType,
};

use crate::error::{Error, Result};
use crate::transport::{GattCallback, GattLink, GattTransport};

/// How long to scan for a peripheral the adapter has not seen yet.
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(10);

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Get the first available Bluetooth adapter.
pub async fn get_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;

    adapters.into_iter().next().ok_or(Error::AdapterUnavailable)
}

/// Transport backed by a btleplug [`Adapter`].
#[derive(Clone)]
pub struct BtleplugTransport {
    adapter: Adapter,
    runtime: Handle,
    scan_timeout: Duration,
    /// Last power state reported by the adapter.
    powered: Arc<AtomicBool>,
}

impl std::fmt::Debug for BtleplugTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtleplugTransport")
            .field("scan_timeout", &self.scan_timeout)
            .field("powered", &self.powered.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl BtleplugTransport {
    /// Use the first adapter on the system.
    ///
    /// # Errors
    ///
    /// [`Error::AdapterUnavailable`] if there is no adapter, or
    /// [`Error::Bluetooth`] if the platform stack cannot be opened.
    pub async fn new() -> Result<Self> {
        let adapter = get_adapter().await?;
        Self::from_adapter(adapter)
    }

    /// Wrap an existing adapter.
    ///
    /// The adapter's power state is tracked in the background from then on.
    ///
    /// # Errors
    ///
    /// [`Error::NoRuntime`] if called outside a tokio runtime.
    pub fn from_adapter(adapter: Adapter) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let powered = Arc::new(AtomicBool::new(true));
        runtime.spawn(track_power(adapter.clone(), Arc::downgrade(&powered)));
        Ok(Self {
            adapter,
            runtime,
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            powered,
        })
    }

    /// Set how long connects scan for an unknown peripheral.
    #[must_use]
    pub fn with_scan_timeout(mut self, scan_timeout: Duration) -> Self {
        self.scan_timeout = scan_timeout;
        self
    }

    /// The wrapped adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }
}

impl GattTransport for BtleplugTransport {
    fn is_enabled(&self) -> bool {
        self.powered.load(Ordering::SeqCst)
    }

    fn connect(
        &self,
        address: BluetoothAddress,
        auto_connect: bool,
        callback: Arc<dyn GattCallback>,
    ) -> Result<Arc<dyn GattLink>> {
        if auto_connect {
            debug!(%address, "auto_connect is not supported by btleplug, connecting directly");
        }

        let link = Arc::new(BtleplugLink {
            address,
            adapter: self.adapter.clone(),
            runtime: self.runtime.clone(),
            callback,
            peripheral: Mutex::new(None),
            notifying: Arc::new(Mutex::new(HashSet::new())),
            closed: Arc::new(AtomicBool::new(false)),
            disconnect_reported: Arc::new(AtomicBool::new(false)),
            disconnect_requested: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
        });

        let task = self
            .runtime
            .spawn(Arc::clone(&link).establish(self.scan_timeout));
        link.tasks.lock().push(task);
        Ok(link)
    }
}

/// `Unknown` counts as powered; some platforms never report a state.
fn is_powered(state: &CentralState) -> bool {
    !matches!(*state, CentralState::PoweredOff)
}

/// Follow the adapter's power state until the transport is dropped.
async fn track_power(adapter: Adapter, powered: Weak<AtomicBool>) {
    let mut events = match adapter.events().await {
        Ok(events) => events,
        Err(e) => {
            warn!(error = %e, "Cannot watch adapter power state");
            return;
        }
    };

    match adapter.adapter_state().await {
        Ok(state) => {
            let Some(flag) = powered.upgrade() else {
                return;
            };
            flag.store(is_powered(&state), Ordering::SeqCst);
            debug!(?state, "Adapter state");
        }
        Err(e) => debug!(error = %e, "Adapter state unavailable, assuming powered"),
    }

    while let Some(event) = events.next().await {
        let Some(flag) = powered.upgrade() else {
            break;
        };
        if let CentralEvent::StateUpdate(state) = event {
            let on = is_powered(&state);
            if flag.swap(on, Ordering::SeqCst) != on {
                info!(?state, "Adapter power changed");
            }
        }
    }
}

struct BtleplugLink {
    address: BluetoothAddress,
    adapter: Adapter,
    runtime: Handle,
    callback: Arc<dyn GattCallback>,
    peripheral: Mutex<Option<Peripheral>>,
    /// Characteristics with local delivery enabled.
    notifying: Arc<Mutex<HashSet<Uuid>>>,
    closed: Arc<AtomicBool>,
    disconnect_reported: Arc<AtomicBool>,
    disconnect_requested: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BtleplugLink {
    async fn establish(self: Arc<Self>, scan_timeout: Duration) {
        let peripheral = match self.find_peripheral(scan_timeout).await {
            Ok(peripheral) => peripheral,
            Err(e) => {
                warn!(address = %self.address, error = %e, "Peripheral lookup failed");
                self.report_disconnected(GattStatus::FAILURE);
                return;
            }
        };

        // Watch for link loss before connecting so no event is missed.
        match self.adapter.events().await {
            Ok(events) => self.watch_link(events, peripheral.id()),
            Err(e) => warn!(address = %self.address, error = %e, "Cannot watch adapter events"),
        }

        if let Err(e) = peripheral.connect().await {
            warn!(address = %self.address, error = %e, "Connect failed");
            self.report_disconnected(GattStatus::ERROR);
            return;
        }

        match peripheral.notifications().await {
            Ok(stream) => self.forward_notifications(stream, peripheral.clone()),
            Err(e) => warn!(address = %self.address, error = %e, "Cannot open notification stream"),
        }

        *self.peripheral.lock() = Some(peripheral);
        info!(address = %self.address, "Link established");
        if !self.closed.load(Ordering::SeqCst) {
            self.callback
                .on_connection_state_change(GattStatus::SUCCESS, ConnectionState::Connected);
        }
    }

    async fn find_peripheral(&self, scan_timeout: Duration) -> Result<Peripheral> {
        let target = BDAddr::from(self.address.to_bytes());
        if let Some(peripheral) = self.known_peripheral(target).await? {
            return Ok(peripheral);
        }

        debug!(address = %self.address, "Peripheral not cached, scanning");
        self.adapter.start_scan(ScanFilter::default()).await?;
        let found = tokio::time::timeout(scan_timeout, async {
            loop {
                tokio::time::sleep(SCAN_POLL_INTERVAL).await;
                if let Some(peripheral) = self.known_peripheral(target).await? {
                    return Ok::<_, Error>(peripheral);
                }
            }
        })
        .await;
        if let Err(e) = self.adapter.stop_scan().await {
            warn!(error = %e, "Failed to stop scan");
        }

        match found {
            Ok(result) => result,
            Err(_) => Err(Error::DeviceNotFound(self.address)),
        }
    }

    async fn known_peripheral(&self, target: BDAddr) -> Result<Option<Peripheral>> {
        for peripheral in self.adapter.peripherals().await? {
            if let Ok(Some(properties)) = peripheral.properties().await
                && properties.address == target
            {
                return Ok(Some(peripheral));
            }
        }
        Ok(None)
    }

    fn watch_link<S>(&self, mut events: S, id: btleplug::platform::PeripheralId)
    where
        S: futures::Stream<Item = CentralEvent> + Send + Unpin + 'static,
    {
        let callback = Arc::clone(&self.callback);
        let closed = Arc::clone(&self.closed);
        let reported = Arc::clone(&self.disconnect_reported);
        let requested = Arc::clone(&self.disconnect_requested);
        let task = self.runtime.spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(gone) = event
                    && gone == id
                {
                    let status = if requested.load(Ordering::SeqCst) {
                        GattStatus::SUCCESS
                    } else {
                        GattStatus::CONNECTION_TIMEOUT
                    };
                    if !closed.load(Ordering::SeqCst) && !reported.swap(true, Ordering::SeqCst) {
                        callback.on_connection_state_change(status, ConnectionState::Disconnected);
                    }
                    break;
                }
            }
        });
        self.tasks.lock().push(task);
    }

    fn forward_notifications<S>(&self, mut stream: S, peripheral: Peripheral)
    where
        S: futures::Stream<Item = btleplug::api::ValueNotification> + Send + Unpin + 'static,
    {
        let callback = Arc::clone(&self.callback);
        let closed = Arc::clone(&self.closed);
        let notifying = Arc::clone(&self.notifying);
        let task = self.runtime.spawn(async move {
            while let Some(notification) = stream.next().await {
                if closed.load(Ordering::SeqCst) {
                    break;
                }
                if !notifying.lock().contains(&notification.uuid) {
                    continue;
                }
                let characteristic = peripheral
                    .characteristics()
                    .into_iter()
                    .find(|c| c.uuid == notification.uuid);
                if let Some(characteristic) = characteristic {
                    callback.on_characteristic_changed(
                        convert_characteristic(&characteristic),
                        Bytes::from(notification.value),
                    );
                }
            }
        });
        self.tasks.lock().push(task);
    }

    fn report_disconnected(&self, status: GattStatus) {
        if !self.closed.load(Ordering::SeqCst)
            && !self.disconnect_reported.swap(true, Ordering::SeqCst)
        {
            self.callback
                .on_connection_state_change(status, ConnectionState::Disconnected);
        }
    }

    fn connected_peripheral(&self) -> Result<Peripheral> {
        self.peripheral.lock().clone().ok_or(Error::NotConnected)
    }

    fn resolve(
        peripheral: &Peripheral,
        characteristic: &GattCharacteristic,
    ) -> Result<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic.uuid && c.service_uuid == characteristic.service_uuid)
            .ok_or_else(|| {
                Error::transport(format!("characteristic {} not discovered", characteristic.uuid))
            })
    }

    /// Run `work` on the runtime, then hand its result to `answer` unless
    /// the link was closed meanwhile.
    fn spawn_answer<T, W, A>(&self, work: W, answer: A)
    where
        T: Send + 'static,
        W: Future<Output = T> + Send + 'static,
        A: FnOnce(&dyn GattCallback, T) + Send + 'static,
    {
        let callback = Arc::clone(&self.callback);
        let closed = Arc::clone(&self.closed);
        let task = self.runtime.spawn(async move {
            let result = work.await;
            if !closed.load(Ordering::SeqCst) {
                answer(callback.as_ref(), result);
            }
        });
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }
}

fn status_of<T>(result: &std::result::Result<T, btleplug::Error>) -> GattStatus {
    match result {
        Ok(_) => GattStatus::SUCCESS,
        Err(btleplug::Error::NotConnected) => GattStatus::CONNECTION_TIMEOUT,
        Err(btleplug::Error::PermissionDenied) => GattStatus::INSUFFICIENT_AUTHENTICATION,
        Err(btleplug::Error::NotSupported(_)) => GattStatus::REQUEST_NOT_SUPPORTED,
        Err(_) => GattStatus::FAILURE,
    }
}

fn convert_characteristic(characteristic: &Characteristic) -> GattCharacteristic {
    GattCharacteristic {
        service_uuid: characteristic.service_uuid,
        uuid: characteristic.uuid,
        descriptors: characteristic.descriptors.iter().map(|d| d.uuid).collect(),
    }
}

impl GattLink for BtleplugLink {
    fn disconnect(&self) -> Result<()> {
        self.disconnect_requested.store(true, Ordering::SeqCst);
        let Some(peripheral) = self.peripheral.lock().clone() else {
            // Still looking for the peripheral; abandon the attempt.
            for task in self.tasks.lock().drain(..) {
                task.abort();
            }
            let reported = Arc::clone(&self.disconnect_reported);
            self.spawn_answer(async {}, move |cb, ()| {
                if !reported.swap(true, Ordering::SeqCst) {
                    cb.on_connection_state_change(GattStatus::SUCCESS, ConnectionState::Disconnected);
                }
            });
            return Ok(());
        };

        let address = self.address;
        let reported = Arc::clone(&self.disconnect_reported);
        self.spawn_answer(
            async move { peripheral.disconnect().await },
            move |cb, result| match result {
                Ok(()) => {
                    if !reported.swap(true, Ordering::SeqCst) {
                        cb.on_connection_state_change(
                            GattStatus::SUCCESS,
                            ConnectionState::Disconnected,
                        );
                    }
                }
                // Left to the session's disconnect timer.
                Err(e) => warn!(%address, error = %e, "Disconnect failed"),
            },
        );
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(peripheral) = self.peripheral.lock().take()
            && !self.disconnect_reported.load(Ordering::SeqCst)
        {
            // Best effort; nothing is reported after close.
            let address = self.address;
            self.runtime.spawn(async move {
                if let Err(e) = peripheral.disconnect().await {
                    debug!(%address, error = %e, "Disconnect on close failed");
                }
            });
        }
        Ok(())
    }

    fn discover_services(&self) -> Result<()> {
        let peripheral = self.connected_peripheral()?;
        self.spawn_answer(
            async move { peripheral.discover_services().await },
            |cb, result| cb.on_services_discovered(status_of(&result)),
        );
        Ok(())
    }

    fn services(&self) -> Vec<GattService> {
        let Some(peripheral) = self.peripheral.lock().clone() else {
            return Vec::new();
        };
        peripheral
            .services()
            .into_iter()
            .map(|service| GattService {
                uuid: service.uuid,
                characteristics: service
                    .characteristics
                    .iter()
                    .map(convert_characteristic)
                    .collect(),
            })
            .collect()
    }

    fn read_characteristic(&self, characteristic: &GattCharacteristic) -> Result<()> {
        let peripheral = self.connected_peripheral()?;
        let target = Self::resolve(&peripheral, characteristic)?;
        let characteristic = characteristic.clone();
        self.spawn_answer(
            async move { peripheral.read(&target).await },
            move |cb, result| {
                let status = status_of(&result);
                let value = result.map(Bytes::from).unwrap_or_default();
                cb.on_characteristic_read(characteristic, value, status);
            },
        );
        Ok(())
    }

    fn write_characteristic(
        &self,
        characteristic: &GattCharacteristic,
        value: Bytes,
        write_type: WriteType,
    ) -> Result<()> {
        let peripheral = self.connected_peripheral()?;
        let target = Self::resolve(&peripheral, characteristic)?;
        let write_type = match write_type {
            WriteType::WithoutResponse => BtleWriteType::WithoutResponse,
            WriteType::DefaultWithResponse => BtleWriteType::WithResponse,
            WriteType::Signed => {
                debug!("Signed writes are not supported by btleplug, writing with response");
                BtleWriteType::WithResponse
            }
        };
        let characteristic = characteristic.clone();
        self.spawn_answer(
            async move { peripheral.write(&target, &value, write_type).await },
            move |cb, result| cb.on_characteristic_write(characteristic, status_of(&result)),
        );
        Ok(())
    }

    fn set_characteristic_notification(
        &self,
        characteristic: &GattCharacteristic,
        enable: bool,
    ) -> Result<()> {
        let mut notifying = self.notifying.lock();
        if enable {
            notifying.insert(characteristic.uuid);
        } else {
            notifying.remove(&characteristic.uuid);
        }
        Ok(())
    }

    fn write_descriptor(
        &self,
        characteristic: &GattCharacteristic,
        descriptor: Uuid,
        value: Bytes,
    ) -> Result<()> {
        let peripheral = self.connected_peripheral()?;
        let target = Self::resolve(&peripheral, characteristic)?;
        let characteristic = characteristic.clone();

        if descriptor == CLIENT_CHARACTERISTIC_CONFIG {
            let enable = value.iter().any(|b| *b != 0);
            self.spawn_answer(
                async move {
                    if enable {
                        peripheral.subscribe(&target).await
                    } else {
                        peripheral.unsubscribe(&target).await
                    }
                },
                move |cb, result| {
                    cb.on_descriptor_write(characteristic, descriptor, status_of(&result))
                },
            );
            return Ok(());
        }

        let target = target
            .descriptors
            .iter()
            .find(|d| d.uuid == descriptor)
            .cloned()
            .ok_or_else(|| Error::transport(format!("descriptor {} not discovered", descriptor)))?;
        self.spawn_answer(
            async move { peripheral.write_descriptor(&target, &value).await },
            move |cb, result| cb.on_descriptor_write(characteristic, descriptor, status_of(&result)),
        );
        Ok(())
    }

    fn read_remote_rssi(&self) -> Result<()> {
        let peripheral = self.connected_peripheral()?;
        self.spawn_answer(
            async move { peripheral.properties().await },
            |cb, result| match result {
                Ok(Some(properties)) => match properties.rssi {
                    Some(rssi) => cb.on_read_remote_rssi(rssi, GattStatus::SUCCESS),
                    None => cb.on_read_remote_rssi(0, GattStatus::REQUEST_NOT_SUPPORTED),
                },
                Ok(None) => cb.on_read_remote_rssi(0, GattStatus::FAILURE),
                Err(e) => cb.on_read_remote_rssi(0, status_of::<()>(&Err(e))),
            },
        );
        Ok(())
    }
}

impl Drop for BtleplugLink {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}
