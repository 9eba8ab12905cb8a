//! Per-device GATT sessions.
//!
//! A [`GattSession`] owns one device link. Every request is queued to the
//! session's worker task, which runs them one at a time: it arms the
//! [`PendingOperationGate`], starts the transport primitive and parks until
//! the transport's completion callback signals the gate, the operation's
//! timeout passes, or a disconnect cancels the wait. Results are posted to
//! the registry's delivery context, which fans them out to listeners.
//!
//! Timeouts and reported elapsed times start when the worker picks an
//! operation up, so time spent queued behind other operations never counts
//! against it.
//!
//! Public operations only check preconditions before queueing. Anything
//! that fails after that point is reported to listeners as an event with
//! `success == false`, or through the timeout hook.
//!
//! All ways a link can end (connect refused, solicited disconnect, lost
//! link, unconfirmed disconnect) go through a single teardown path that
//! emits exactly one [`GattEvent::Disconnected`] per connection.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use gattkit_types::uuids::{self, CLIENT_CHARACTERISTIC_CONFIG};
use gattkit_types::{
    BluetoothAddress, ConnectionState, DisconnectReason, FloatFormat, GattCharacteristic,
    GattOperation, GattService, GattStatus, IntFormat, NotificationDescriptorType, WriteType,
    value,
};

use crate::config::SessionConfig;
use crate::delivery::{Delivery, DeliverySender};
use crate::error::{Error, Result};
use crate::events::{GattEvent, GattListener, ListenerAction};
use crate::gate::{PendingOperationGate, WaitOutcome};
use crate::listeners::ListenerSet;
use crate::manager::RegistryInner;
use crate::metrics::SessionMetrics;
use crate::transport::{GattCallback, GattLink, GattTransport};

/// Hook run on the delivery context after an operation succeeds.
pub type AfterSuccess = Box<dyn FnOnce(&GattSession, &GattEvent) + Send>;

/// Per-call options for session operations.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use gattkit_core::OperationOptions;
///
/// let options = OperationOptions::new()
///     .timeout(Duration::from_secs(10))
///     .after_success(|session, event| {
///         println!("{}: {:?}", session.address(), event);
///     });
/// # let _ = options;
/// ```
#[derive(Default)]
pub struct OperationOptions {
    timeout: Option<Duration>,
    after_success: Option<AfterSuccess>,
}

impl OperationOptions {
    /// Options using the session's default timeout and no hook.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the session's default timeout for this operation.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Run `hook` on the delivery context after the operation succeeds,
    /// once all listeners have seen the completion event.
    #[must_use]
    pub fn after_success<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(&GattSession, &GattEvent) + Send + 'static,
    {
        self.after_success = Some(Box::new(hook));
        self
    }
}

impl From<Duration> for OperationOptions {
    fn from(timeout: Duration) -> Self {
        Self::new().timeout(timeout)
    }
}

impl fmt::Debug for OperationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationOptions")
            .field("timeout", &self.timeout)
            .field("after_success", &self.after_success.is_some())
            .finish()
    }
}

enum Request {
    Read,
    Write {
        value: Bytes,
        write_type: WriteType,
    },
    SetNotification {
        kind: NotificationDescriptorType,
        write_descriptor: bool,
    },
}

impl Request {
    fn operation(&self) -> GattOperation {
        match self {
            Request::Read => GattOperation::CharacteristicRead,
            Request::Write { .. } => GattOperation::CharacteristicWrite,
            Request::SetNotification { .. } => GattOperation::CharacteristicSetNotification,
        }
    }
}

enum ConnectStart {
    Started,
    Stale,
    Solicited,
    Refused(Error),
}

enum Command {
    Connect {
        epoch: u64,
        auto_connect: bool,
        options: OperationOptions,
    },
    Disconnect {
        epoch: u64,
        timeout: Duration,
    },
    Characteristic {
        service: Uuid,
        characteristic: Uuid,
        request: Request,
        options: OperationOptions,
    },
    ReadRemoteRssi {
        options: OperationOptions,
    },
}

type CommandSender = mpsc::UnboundedSender<(Arc<GattSession>, Command)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Connecting,
    Connected,
}

struct LinkState {
    phase: Phase,
    handle: Option<Arc<dyn GattLink>>,
    /// A disconnect was requested and has not completed yet.
    solicited: bool,
    /// Bumped on every connect; callbacks and timers carry the epoch they
    /// were created for.
    epoch: u64,
}

struct PendingOperation {
    operation: GattOperation,
    /// Service and characteristic UUIDs of a characteristic operation.
    target: Option<(Uuid, Uuid)>,
    after_success: Option<AfterSuccess>,
}

/// A GATT session with one remote device.
///
/// Obtained from [`GattManager::get_session`](crate::GattManager::get_session);
/// the registry hands out the same instance for the same address.
pub struct GattSession {
    address: BluetoothAddress,
    config: SessionConfig,
    transport: Arc<dyn GattTransport>,
    runtime: Handle,
    commands: CommandSender,
    delivery: DeliverySender,
    registry: Weak<RegistryInner>,
    me: Weak<GattSession>,
    link: Mutex<LinkState>,
    gate: PendingOperationGate,
    pending: Mutex<Option<PendingOperation>>,
    timers: Mutex<HashMap<GattOperation, Instant>>,
    awaiting_descriptor_write: AtomicBool,
    disconnect_timer: Mutex<Option<CancellationToken>>,
    listeners: Mutex<ListenerSet<dyn GattListener>>,
    metrics: SessionMetrics,
}

impl fmt::Debug for GattSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GattSession")
            .field("address", &self.address)
            .field("state", &self.state())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

async fn run_worker(mut commands: mpsc::UnboundedReceiver<(Arc<GattSession>, Command)>) {
    while let Some((session, command)) = commands.recv().await {
        session.execute(command).await;
    }
}

impl GattSession {
    pub(crate) fn new(
        address: BluetoothAddress,
        config: SessionConfig,
        transport: Arc<dyn GattTransport>,
        runtime: Handle,
        delivery: DeliverySender,
        registry: Weak<RegistryInner>,
    ) -> Arc<Self> {
        let (commands, receiver) = mpsc::unbounded_channel();
        runtime.spawn(run_worker(receiver));

        Arc::new_cyclic(|me| Self {
            address,
            config,
            transport,
            runtime,
            commands,
            delivery,
            registry,
            me: me.clone(),
            link: Mutex::new(LinkState {
                phase: Phase::Idle,
                handle: None,
                solicited: false,
                epoch: 0,
            }),
            gate: PendingOperationGate::new(),
            pending: Mutex::new(None),
            timers: Mutex::new(HashMap::new()),
            awaiting_descriptor_write: AtomicBool::new(false),
            disconnect_timer: Mutex::new(None),
            listeners: Mutex::new(ListenerSet::new()),
            metrics: SessionMetrics::new(),
        })
    }

    /// The device address.
    pub fn address(&self) -> BluetoothAddress {
        self.address
    }

    /// The session's configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Operation metrics for this session.
    pub fn metrics(&self) -> &SessionMetrics {
        &self.metrics
    }

    // ==================== State queries ====================

    /// Current connection state.
    ///
    /// A session with a disconnect in flight reports
    /// [`ConnectionState::Disconnecting`].
    pub fn state(&self) -> ConnectionState {
        let link = self.link.lock();
        match link.phase {
            Phase::Idle => ConnectionState::Disconnected,
            _ if link.solicited => ConnectionState::Disconnecting,
            Phase::Connecting => ConnectionState::Connecting,
            Phase::Connected => ConnectionState::Connected,
        }
    }

    /// Whether the link is up and no disconnect has been requested.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Whether the session is connecting or connected and no disconnect has
    /// been requested.
    pub fn is_connecting_or_connected_and_not_disconnecting(&self) -> bool {
        let link = self.link.lock();
        link.phase != Phase::Idle && !link.solicited
    }

    /// Whether the session is disconnected or a disconnect is in flight.
    pub fn is_disconnecting_or_disconnected(&self) -> bool {
        let link = self.link.lock();
        link.phase == Phase::Idle || link.solicited
    }

    /// Whether a disconnect is in flight.
    pub fn is_disconnecting(&self) -> bool {
        let link = self.link.lock();
        link.phase != Phase::Idle && link.solicited
    }

    /// Whether the session has no link.
    pub fn is_disconnected(&self) -> bool {
        self.link.lock().phase == Phase::Idle
    }

    /// Services found by the last discovery, if the link is up.
    pub fn services(&self) -> Vec<GattService> {
        let handle = self.link.lock().handle.clone();
        handle.map(|h| h.services()).unwrap_or_default()
    }

    // ==================== Listeners ====================

    /// Attach a listener. Attaching the same `Arc` twice has no effect.
    pub fn add_listener(&self, listener: Arc<dyn GattListener>) {
        self.listeners.lock().attach(listener);
    }

    /// Attach a closure as a listener and return its handle for removal.
    pub fn add_listener_fn<F>(&self, listener: F) -> Arc<dyn GattListener>
    where
        F: Fn(&GattSession, &GattEvent) -> ListenerAction + Send + Sync + 'static,
    {
        let listener: Arc<dyn GattListener> = Arc::new(listener);
        self.add_listener(Arc::clone(&listener));
        listener
    }

    /// Detach a listener.
    pub fn remove_listener(&self, listener: &Arc<dyn GattListener>) {
        self.listeners.lock().detach(listener);
    }

    /// Detach all listeners.
    pub fn clear_listeners(&self) {
        self.listeners.lock().clear();
    }

    /// Number of attached listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    pub(crate) fn begin_traversing(&self) -> Vec<Arc<dyn GattListener>> {
        self.listeners.lock().begin_traversing()
    }

    pub(crate) fn end_traversing(&self) {
        self.listeners.lock().end_traversing();
    }

    // ==================== Operations ====================

    /// Connect to the device and discover its services.
    ///
    /// The timeout (default [`SessionConfig::connect_timeout`]) covers both
    /// the link coming up and service discovery. Listeners see
    /// [`GattEvent::Connecting`], [`GattEvent::Connected`] and
    /// [`GattEvent::ServicesDiscovered`], or a [`GattEvent::Disconnected`].
    ///
    /// # Errors
    ///
    /// - [`Error::AdapterUnavailable`] if the radio is off
    /// - [`Error::Disconnecting`] if a disconnect is still in flight
    /// - [`Error::AlreadyConnected`] if the session is connecting or connected
    #[tracing::instrument(level = "debug", skip_all, fields(address = %self.address))]
    pub fn connect(&self, auto_connect: bool, options: OperationOptions) -> Result<()> {
        if !self.transport.is_enabled() {
            return Err(Error::AdapterUnavailable);
        }

        let epoch = {
            let mut link = self.link.lock();
            if link.solicited {
                return Err(Error::Disconnecting);
            }
            if link.phase != Phase::Idle {
                return Err(Error::AlreadyConnected);
            }
            link.phase = Phase::Connecting;
            link.epoch = link.epoch.wrapping_add(1);
            link.epoch
        };

        let queued = self.enqueue(Command::Connect {
            epoch,
            auto_connect,
            options,
        });
        if queued.is_err() {
            let mut link = self.link.lock();
            if link.epoch == epoch {
                link.phase = Phase::Idle;
            }
        }
        queued
    }

    /// Disconnect with the default disconnect timeout.
    ///
    /// Returns `false` if the session is already disconnected or a
    /// disconnect is already in flight.
    pub fn disconnect(&self) -> bool {
        self.disconnect_with_timeout(self.config.disconnect_timeout)
    }

    /// Disconnect, waiting at most `timeout` for the transport to confirm.
    ///
    /// Any in-flight operation wait is released immediately. If the
    /// transport does not confirm within `timeout`, the session tears the
    /// link down itself with [`DisconnectReason::SolicitedDisconnectTimeout`].
    #[tracing::instrument(level = "debug", skip_all, fields(address = %self.address))]
    pub fn disconnect_with_timeout(&self, timeout: Duration) -> bool {
        self.request_disconnect(timeout, None)
    }

    /// Disconnect only if the link of `epoch` is still the current one.
    pub(crate) fn disconnect_link(&self, epoch: u64) -> bool {
        self.request_disconnect(self.config.disconnect_timeout, Some(epoch))
    }

    fn request_disconnect(&self, timeout: Duration, expected: Option<u64>) -> bool {
        let epoch = {
            let mut link = self.link.lock();
            if link.phase == Phase::Idle || link.solicited {
                return false;
            }
            if expected.is_some_and(|e| e != link.epoch) {
                return false;
            }
            link.solicited = true;
            link.epoch
        };
        self.gate.cancel();

        if let Err(e) = self.enqueue(Command::Disconnect { epoch, timeout }) {
            warn!(address = %self.address, error = %e, "Failed to queue disconnect");
            let mut link = self.link.lock();
            if link.epoch == epoch {
                link.solicited = false;
            }
            return false;
        }
        true
    }

    /// Read a characteristic.
    ///
    /// Completes with [`GattEvent::CharacteristicRead`].
    #[tracing::instrument(level = "debug", skip_all, fields(address = %self.address, characteristic = %uuids::describe(characteristic)))]
    pub fn characteristic_read(
        &self,
        service: Uuid,
        characteristic: Uuid,
        options: OperationOptions,
    ) -> Result<()> {
        self.check_ready()?;
        self.enqueue(Command::Characteristic {
            service,
            characteristic,
            request: Request::Read,
            options,
        })
    }

    /// Write a characteristic.
    ///
    /// Completes with [`GattEvent::CharacteristicWrite`].
    #[tracing::instrument(level = "debug", skip_all, fields(address = %self.address, characteristic = %uuids::describe(characteristic)))]
    pub fn characteristic_write(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: impl Into<Bytes>,
        write_type: WriteType,
        options: OperationOptions,
    ) -> Result<()> {
        self.check_ready()?;
        self.enqueue(Command::Characteristic {
            service,
            characteristic,
            request: Request::Write {
                value: value.into(),
                write_type,
            },
            options,
        })
    }

    /// Write an integer value with a response.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidValue`] if `value` does not fit `format`, plus the
    /// preconditions of [`characteristic_write`](Self::characteristic_write).
    pub fn characteristic_write_int(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: i64,
        format: IntFormat,
        options: OperationOptions,
    ) -> Result<()> {
        let bytes = value::encode_int(value, format, 0)?;
        self.characteristic_write(
            service,
            characteristic,
            bytes,
            WriteType::DefaultWithResponse,
            options,
        )
    }

    /// Write an IEEE-11073 float value with a response.
    pub fn characteristic_write_float(
        &self,
        service: Uuid,
        characteristic: Uuid,
        mantissa: i32,
        exponent: i32,
        format: FloatFormat,
        options: OperationOptions,
    ) -> Result<()> {
        let bytes = value::encode_float(mantissa, exponent, format, 0)?;
        self.characteristic_write(
            service,
            characteristic,
            bytes,
            WriteType::DefaultWithResponse,
            options,
        )
    }

    /// Write a UTF-8 string value with a response.
    pub fn characteristic_write_str(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: &str,
        options: OperationOptions,
    ) -> Result<()> {
        self.characteristic_write(
            service,
            characteristic,
            value::encode_str(value),
            WriteType::DefaultWithResponse,
            options,
        )
    }

    /// Enable or disable notifications or indications.
    ///
    /// With `write_descriptor`, the Client Characteristic Configuration
    /// descriptor is written and the operation completes when the peer
    /// acknowledges it; otherwise only local delivery is toggled.
    /// Completes with [`GattEvent::CharacteristicSetNotification`].
    #[tracing::instrument(level = "debug", skip_all, fields(address = %self.address, characteristic = %uuids::describe(characteristic), kind = ?kind))]
    pub fn characteristic_set_notification(
        &self,
        service: Uuid,
        characteristic: Uuid,
        kind: NotificationDescriptorType,
        write_descriptor: bool,
        options: OperationOptions,
    ) -> Result<()> {
        self.check_ready()?;
        self.enqueue(Command::Characteristic {
            service,
            characteristic,
            request: Request::SetNotification {
                kind,
                write_descriptor,
            },
            options,
        })
    }

    /// Read the link's signal strength.
    ///
    /// Completes with [`GattEvent::RemoteRssiRead`].
    #[tracing::instrument(level = "debug", skip_all, fields(address = %self.address))]
    pub fn read_remote_rssi(&self, options: OperationOptions) -> Result<()> {
        self.check_ready()?;
        self.enqueue(Command::ReadRemoteRssi { options })
    }

    /// Remove this session from its registry and disconnect it.
    ///
    /// Returns whether a disconnect was started.
    pub fn close(&self) -> bool {
        if let Some(registry) = self.registry.upgrade() {
            registry.forget(self);
        }
        self.disconnect()
    }

    fn check_ready(&self) -> Result<()> {
        if !self.transport.is_enabled() {
            return Err(Error::AdapterUnavailable);
        }
        let link = self.link.lock();
        if link.solicited {
            return Err(Error::Disconnecting);
        }
        if link.phase == Phase::Idle {
            return Err(Error::NotConnected);
        }
        Ok(())
    }

    fn enqueue(&self, command: Command) -> Result<()> {
        let session = self.me.upgrade().ok_or(Error::SessionClosed)?;
        self.commands
            .send((session, command))
            .map_err(|_| Error::SessionClosed)
    }

    // ==================== Worker ====================

    async fn execute(self: &Arc<Self>, command: Command) {
        match command {
            Command::Connect {
                epoch,
                auto_connect,
                options,
            } => self.run_connect(epoch, auto_connect, options).await,
            Command::Disconnect { epoch, timeout } => self.run_disconnect(epoch, timeout),
            Command::Characteristic {
                service,
                characteristic,
                request,
                options,
            } => {
                self.run_characteristic(service, characteristic, request, options)
                    .await
            }
            Command::ReadRemoteRssi { options } => self.run_read_remote_rssi(options).await,
        }
    }

    async fn run_connect(self: &Arc<Self>, epoch: u64, auto_connect: bool, options: OperationOptions) {
        let solicited = {
            let link = self.link.lock();
            if link.epoch != epoch || link.phase != Phase::Connecting {
                return;
            }
            link.solicited
        };
        if solicited {
            debug!(address = %self.address, "Connect abandoned, disconnect requested");
            self.on_disconnected(epoch, None, Some(DisconnectReason::SolicitedDisconnect), false);
            return;
        }

        let timeout = options.timeout.unwrap_or(self.config.connect_timeout);
        let started = self.start_timer(GattOperation::Connect);
        self.post_event(GattEvent::Connecting, None);

        // The connect wait is released by service discovery completing.
        self.arm(GattOperation::DiscoverServices, None, started, options.after_success);

        let callback: Arc<dyn GattCallback> = Arc::new(SessionCallback {
            session: self.me.clone(),
            epoch,
        });
        let start = {
            let mut link = self.link.lock();
            if link.epoch != epoch || link.phase != Phase::Connecting {
                ConnectStart::Stale
            } else if link.solicited {
                ConnectStart::Solicited
            } else {
                match self.transport.connect(self.address, auto_connect, callback) {
                    Ok(handle) => {
                        link.handle = Some(handle);
                        ConnectStart::Started
                    }
                    Err(e) => ConnectStart::Refused(e),
                }
            }
        };

        match start {
            ConnectStart::Started => {}
            ConnectStart::Stale => {
                self.abandon(GattOperation::DiscoverServices);
                return;
            }
            ConnectStart::Solicited => {
                self.on_disconnected(epoch, None, Some(DisconnectReason::SolicitedDisconnect), false);
                return;
            }
            ConnectStart::Refused(e) => {
                warn!(address = %self.address, error = %e, "Transport refused connect");
                self.metrics.connect.record(false, started.elapsed());
                self.on_disconnected(epoch, None, Some(DisconnectReason::ConnectFailed), false);
                return;
            }
        }

        info!(
            address = %self.address,
            auto_connect,
            timeout_ms = timeout.as_millis() as u64,
            "Connecting"
        );
        self.wait_pending(GattOperation::Connect, timeout).await;
    }

    fn run_disconnect(self: &Arc<Self>, epoch: u64, timeout: Duration) {
        let handle = {
            let link = self.link.lock();
            if link.epoch != epoch || link.phase == Phase::Idle {
                debug!(address = %self.address, "Disconnect skipped, already disconnected");
                return;
            }
            link.handle.clone()
        };

        let Some(handle) = handle else {
            self.on_disconnected(epoch, None, Some(DisconnectReason::SolicitedDisconnect), false);
            return;
        };

        if let Err(e) = handle.disconnect() {
            warn!(address = %self.address, error = %e, "Transport refused disconnect");
            self.on_disconnected(epoch, None, Some(DisconnectReason::SolicitedDisconnect), false);
            return;
        }

        debug!(
            address = %self.address,
            timeout_ms = timeout.as_millis() as u64,
            "Waiting for disconnect confirmation"
        );
        let token = CancellationToken::new();
        if let Some(previous) = self.disconnect_timer.lock().replace(token.clone()) {
            previous.cancel();
        }
        // The timer owns the session until the link is torn down, so a
        // session dropped by its registry still reports its disconnect.
        let session = Arc::clone(self);
        let delivery = self.delivery.clone();
        self.runtime.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    let _ = delivery.send(Delivery::DisconnectTimeout { session, epoch });
                }
            }
        });
    }

    async fn run_characteristic(
        self: &Arc<Self>,
        service: Uuid,
        uuid: Uuid,
        request: Request,
        options: OperationOptions,
    ) {
        let operation = request.operation();
        let timeout = options.timeout.unwrap_or(self.config.operation_timeout);
        let started = self.start_timer(operation);
        self.arm(operation, Some((service, uuid)), started, options.after_success);

        let Some(link) = self.active_link() else {
            debug!(address = %self.address, %operation, "Skipping operation, not connected");
            self.abandon(operation);
            return;
        };

        let Some(characteristic) = find_characteristic(&link.services(), service, uuid) else {
            warn!(
                address = %self.address,
                %operation,
                service = %uuids::describe(service),
                characteristic = %uuids::describe(uuid),
                "Characteristic not found"
            );
            self.fail_characteristic(operation, GattCharacteristic::new(service, uuid));
            self.wait_pending(operation, timeout).await;
            return;
        };

        let accepted = match request {
            Request::Read => link.read_characteristic(&characteristic),
            Request::Write { value, write_type } => {
                let len = value.len();
                let result = link.write_characteristic(&characteristic, value, write_type);
                if result.is_ok() {
                    self.metrics.record_bytes_written(len);
                }
                result
            }
            Request::SetNotification {
                kind,
                write_descriptor,
            } => self.start_set_notification(link.as_ref(), &characteristic, kind, write_descriptor),
        };

        if let Err(e) = accepted {
            warn!(address = %self.address, %operation, error = %e, "Transport refused request");
            self.fail_characteristic(operation, characteristic);
        }
        self.wait_pending(operation, timeout).await;
    }

    fn start_set_notification(
        &self,
        link: &dyn GattLink,
        characteristic: &GattCharacteristic,
        kind: NotificationDescriptorType,
        write_descriptor: bool,
    ) -> Result<()> {
        link.set_characteristic_notification(characteristic, kind.is_enable())?;

        if !write_descriptor {
            self.complete(
                GattOperation::CharacteristicSetNotification,
                Some(target_of(characteristic)),
                true,
                |elapsed| GattEvent::CharacteristicSetNotification {
                    characteristic: characteristic.clone(),
                    success: true,
                    elapsed,
                },
            );
            return Ok(());
        }

        if !characteristic.has_client_config() {
            return Err(Error::transport(format!(
                "{} has no client characteristic configuration descriptor",
                uuids::describe(characteristic.uuid)
            )));
        }

        self.awaiting_descriptor_write.store(true, Ordering::SeqCst);
        let result = link.write_descriptor(
            characteristic,
            CLIENT_CHARACTERISTIC_CONFIG,
            Bytes::copy_from_slice(&kind.descriptor_value()),
        );
        if result.is_err() {
            self.awaiting_descriptor_write.store(false, Ordering::SeqCst);
        }
        result
    }

    async fn run_read_remote_rssi(self: &Arc<Self>, options: OperationOptions) {
        let operation = GattOperation::ReadRemoteRssi;
        let timeout = options.timeout.unwrap_or(self.config.operation_timeout);
        let started = self.start_timer(operation);
        self.arm(operation, None, started, options.after_success);

        let Some(link) = self.active_link() else {
            debug!(address = %self.address, %operation, "Skipping operation, not connected");
            self.abandon(operation);
            return;
        };

        if let Err(e) = link.read_remote_rssi() {
            warn!(address = %self.address, %operation, error = %e, "Transport refused request");
            self.complete(operation, None, false, |elapsed| GattEvent::RemoteRssiRead {
                rssi: 0,
                success: false,
                elapsed,
            });
        }
        self.wait_pending(operation, timeout).await;
    }

    /// Park on the gate and route a timed out or canceled wait to the
    /// listeners' veto hook.
    async fn wait_pending(self: &Arc<Self>, operation: GattOperation, timeout: Duration) {
        let epoch = self.link.lock().epoch;
        let outcome = self.gate.wait_one(timeout).await;
        if operation == GattOperation::CharacteristicSetNotification {
            self.awaiting_descriptor_write.store(false, Ordering::SeqCst);
        }
        // Drops the after-success hook of an operation that did not complete.
        self.pending.lock().take();

        match outcome {
            Some(WaitOutcome::Signaled(_)) => {}
            Some(WaitOutcome::TimedOut(elapsed)) => {
                let operation = self.classify_connect(operation);
                if operation != GattOperation::Connect {
                    self.stop_timer(operation);
                }
                warn!(
                    address = %self.address,
                    %operation,
                    timeout_ms = timeout.as_millis() as u64,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Operation timed out"
                );
                self.metrics.operation(operation).record_timeout(elapsed);
                self.post_timeout(epoch, operation, timeout, elapsed);
            }
            Some(WaitOutcome::Canceled(elapsed)) => {
                let operation = self.classify_connect(operation);
                debug!(
                    address = %self.address,
                    %operation,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Operation wait canceled"
                );
                self.post_timeout(epoch, operation, timeout, elapsed);
            }
            None => error!(address = %self.address, %operation, "Waited on a disarmed gate"),
        }
    }

    /// A connect wait that ends after the link came up was waiting on
    /// service discovery.
    fn classify_connect(&self, operation: GattOperation) -> GattOperation {
        if operation == GattOperation::Connect && self.link.lock().phase == Phase::Connected {
            GattOperation::DiscoverServices
        } else {
            operation
        }
    }

    fn post_timeout(
        self: &Arc<Self>,
        epoch: u64,
        operation: GattOperation,
        timeout: Duration,
        elapsed: Duration,
    ) {
        self.post(Delivery::OperationTimeout {
            session: Arc::clone(self),
            epoch,
            operation,
            timeout,
            elapsed,
        });
    }

    fn arm(
        &self,
        operation: GattOperation,
        target: Option<(Uuid, Uuid)>,
        started: Instant,
        after_success: Option<AfterSuccess>,
    ) {
        *self.pending.lock() = Some(PendingOperation {
            operation,
            target,
            after_success,
        });
        self.gate.reset(started);
    }

    fn abandon(&self, operation: GattOperation) {
        self.pending.lock().take();
        self.stop_timer(operation);
        self.gate.cancel();
    }

    /// Resolve the pending operation and post its completion event.
    ///
    /// Completions for an operation that is no longer pending (timed out,
    /// canceled, a different kind or a different characteristic) are dropped.
    fn complete(
        &self,
        operation: GattOperation,
        target: Option<(Uuid, Uuid)>,
        success: bool,
        event: impl FnOnce(Duration) -> GattEvent,
    ) {
        let after_success = {
            let mut pending = self.pending.lock();
            let is_pending = pending.as_ref().is_some_and(|p| {
                p.operation == operation
                    && (p.target.is_none() || target.is_none() || p.target == target)
            });
            if !is_pending || !self.gate.signal() {
                warn!(address = %self.address, %operation, "Ignoring completion, operation not pending");
                return;
            }
            pending.take().and_then(|p| p.after_success)
        };

        let elapsed = self.stop_timer(operation).unwrap_or_default();
        self.metrics.operation(operation).record(success, elapsed);
        debug!(
            address = %self.address,
            %operation,
            success,
            elapsed_ms = elapsed.as_millis() as u64,
            "Operation complete"
        );
        self.post_event(event(elapsed), after_success.filter(|_| success));
    }

    fn fail_characteristic(&self, operation: GattOperation, characteristic: GattCharacteristic) {
        let target = target_of(&characteristic);
        self.complete(operation, Some(target), false, |elapsed| match operation {
            GattOperation::CharacteristicRead => GattEvent::CharacteristicRead {
                characteristic,
                value: Bytes::new(),
                success: false,
                elapsed,
            },
            GattOperation::CharacteristicWrite => GattEvent::CharacteristicWrite {
                characteristic,
                success: false,
                elapsed,
            },
            _ => GattEvent::CharacteristicSetNotification {
                characteristic,
                success: false,
                elapsed,
            },
        });
    }

    // ==================== Teardown ====================

    /// Tear the link down and emit [`GattEvent::Disconnected`].
    ///
    /// `reason` of `None` classifies by whether a disconnect was requested.
    /// A no-op if the link of `epoch` is already gone.
    fn on_disconnected(
        &self,
        epoch: u64,
        status: Option<GattStatus>,
        reason: Option<DisconnectReason>,
        log_status: bool,
    ) {
        let (handle, reason, elapsed) = {
            let mut link = self.link.lock();
            if link.epoch != epoch || link.phase == Phase::Idle {
                debug!(address = %self.address, "Already disconnected");
                return;
            }
            let reason = reason.unwrap_or(if link.solicited {
                DisconnectReason::SolicitedDisconnect
            } else {
                DisconnectReason::UnsolicitedDisconnect
            });
            link.phase = Phase::Idle;
            link.solicited = false;
            let handle = link.handle.take();

            self.gate.cancel();
            if let Some(token) = self.disconnect_timer.lock().take() {
                token.cancel();
            }
            let elapsed = {
                let mut timers = self.timers.lock();
                let elapsed = timers.get(&GattOperation::Connect).map(|t| t.elapsed());
                timers.clear();
                elapsed
            };
            self.awaiting_descriptor_write.store(false, Ordering::SeqCst);
            self.pending.lock().take();
            (handle, reason, elapsed)
        };

        if log_status {
            if let Some(status) = status.filter(|s| !s.is_success()) {
                match status.known_issue() {
                    Some(issue) => error!(address = %self.address, %status, issue, "Link error"),
                    None => error!(address = %self.address, %status, "Link error"),
                }
            }
        }

        if let Some(handle) = handle {
            if let Err(e) = handle.close() {
                warn!(address = %self.address, error = %e, "Failed to close link");
            }
        }

        self.metrics.mark_disconnected();
        info!(address = %self.address, %reason, "Disconnected");
        self.post_event(
            GattEvent::Disconnected {
                status,
                reason,
                elapsed,
            },
            None,
        );
    }

    /// The transport did not confirm a solicited disconnect in time.
    pub(crate) fn on_disconnect_timeout(&self, epoch: u64) {
        let expired = {
            let link = self.link.lock();
            link.epoch == epoch && link.phase != Phase::Idle && link.solicited
        };
        if expired {
            warn!(address = %self.address, "Disconnect not confirmed, closing link");
            self.on_disconnected(
                epoch,
                None,
                Some(DisconnectReason::SolicitedDisconnectTimeout),
                false,
            );
        }
    }

    // ==================== Transport callbacks ====================

    fn on_connection_state_change(&self, epoch: u64, status: GattStatus, state: ConnectionState) {
        if !(status.is_success() && state == ConnectionState::Connected) {
            if state != ConnectionState::Disconnected {
                error!(address = %self.address, %status, %state, "Unexpected connection state");
            }
            self.on_disconnected(epoch, Some(status), None, true);
            return;
        }

        let handle = {
            let mut link = self.link.lock();
            if link.epoch != epoch {
                return;
            }
            if link.phase != Phase::Connecting || link.solicited {
                debug!(
                    address = %self.address,
                    phase = ?link.phase,
                    solicited = link.solicited,
                    "Ignoring connected state"
                );
                return;
            }
            link.phase = Phase::Connected;
            link.handle.clone()
        };

        let elapsed = self
            .timer_started(GattOperation::Connect)
            .map(|t| t.elapsed())
            .unwrap_or_default();
        self.metrics.connect.record(true, elapsed);
        self.metrics.mark_connected();
        info!(address = %self.address, elapsed_ms = elapsed.as_millis() as u64, "Connected");
        self.post_event(GattEvent::Connected { elapsed }, None);

        self.start_timer(GattOperation::DiscoverServices);
        let started = handle
            .ok_or(Error::NotConnected)
            .and_then(|h| h.discover_services());
        if let Err(e) = started {
            warn!(address = %self.address, error = %e, "Transport refused service discovery");
            self.on_disconnected(epoch, None, None, false);
        }
    }

    fn on_services_discovered(&self, epoch: u64, status: GattStatus) {
        let Some(handle) = self.current_handle(epoch) else {
            return;
        };
        let success = status.is_success();
        if !success {
            warn!(address = %self.address, %status, "Service discovery failed");
        }
        let services = if success { handle.services() } else { Vec::new() };
        self.complete(GattOperation::DiscoverServices, None, success, |elapsed| {
            GattEvent::ServicesDiscovered {
                services,
                success,
                elapsed,
            }
        });
    }

    fn on_characteristic_read(
        &self,
        epoch: u64,
        characteristic: GattCharacteristic,
        value: Bytes,
        status: GattStatus,
    ) {
        if !self.is_current(epoch) {
            return;
        }
        let success = status.is_success();
        let target = target_of(&characteristic);
        self.complete(GattOperation::CharacteristicRead, Some(target), success, |elapsed| {
            if success {
                self.metrics.record_bytes_read(value.len());
            }
            GattEvent::CharacteristicRead {
                characteristic,
                value,
                success,
                elapsed,
            }
        });
    }

    fn on_characteristic_write(
        &self,
        epoch: u64,
        characteristic: GattCharacteristic,
        status: GattStatus,
    ) {
        if !self.is_current(epoch) {
            return;
        }
        let success = status.is_success();
        let target = target_of(&characteristic);
        self.complete(GattOperation::CharacteristicWrite, Some(target), success, |elapsed| {
            GattEvent::CharacteristicWrite {
                characteristic,
                success,
                elapsed,
            }
        });
    }

    fn on_descriptor_write(
        &self,
        epoch: u64,
        characteristic: GattCharacteristic,
        descriptor: Uuid,
        status: GattStatus,
    ) {
        if !self.is_current(epoch) {
            return;
        }
        if !self.awaiting_descriptor_write.swap(false, Ordering::SeqCst) {
            debug!(
                address = %self.address,
                descriptor = %uuids::describe(descriptor),
                "Ignoring unexpected descriptor write"
            );
            return;
        }
        let success = status.is_success();
        let target = target_of(&characteristic);
        self.complete(
            GattOperation::CharacteristicSetNotification,
            Some(target),
            success,
            |elapsed| GattEvent::CharacteristicSetNotification {
                characteristic,
                success,
                elapsed,
            },
        );
    }

    fn on_characteristic_changed(&self, epoch: u64, characteristic: GattCharacteristic, value: Bytes) {
        if !self.is_current(epoch) || self.is_disconnecting_or_disconnected() {
            trace!(address = %self.address, "Dropping notification, disconnecting");
            return;
        }
        if self.config.verbose_characteristic_changed {
            trace!(
                address = %self.address,
                characteristic = %uuids::describe(characteristic.uuid),
                len = value.len(),
                "Characteristic changed"
            );
        }
        self.post_event(
            GattEvent::CharacteristicChanged {
                characteristic,
                value,
            },
            None,
        );
    }

    fn on_read_remote_rssi(&self, epoch: u64, rssi: i16, status: GattStatus) {
        if !self.is_current(epoch) {
            return;
        }
        let success = status.is_success();
        self.complete(GattOperation::ReadRemoteRssi, None, success, |elapsed| {
            GattEvent::RemoteRssiRead {
                rssi,
                success,
                elapsed,
            }
        });
    }

    // ==================== Helpers ====================

    fn is_current(&self, epoch: u64) -> bool {
        let link = self.link.lock();
        link.epoch == epoch && link.phase != Phase::Idle
    }

    fn current_handle(&self, epoch: u64) -> Option<Arc<dyn GattLink>> {
        let link = self.link.lock();
        if link.epoch == epoch && link.phase != Phase::Idle {
            link.handle.clone()
        } else {
            None
        }
    }

    fn active_link(&self) -> Option<Arc<dyn GattLink>> {
        let link = self.link.lock();
        if link.solicited {
            None
        } else {
            link.handle.clone()
        }
    }

    fn start_timer(&self, operation: GattOperation) -> Instant {
        let now = Instant::now();
        self.timers.lock().insert(operation, now);
        now
    }

    fn timer_started(&self, operation: GattOperation) -> Option<Instant> {
        self.timers.lock().get(&operation).copied()
    }

    fn stop_timer(&self, operation: GattOperation) -> Option<Duration> {
        self.timers.lock().remove(&operation).map(|t| t.elapsed())
    }

    fn post_event(&self, event: GattEvent, after_success: Option<AfterSuccess>) {
        if let Some(session) = self.me.upgrade() {
            self.post(Delivery::Event {
                session,
                event,
                after_success,
            });
        }
    }

    fn post(&self, delivery: Delivery) {
        if self.delivery.send(delivery).is_err() {
            debug!(address = %self.address, "Delivery context closed, dropping event");
        }
    }
}

impl Drop for GattSession {
    fn drop(&mut self) {
        if let Some(token) = self.disconnect_timer.get_mut().take() {
            token.cancel();
        }
        if let Some(handle) = self.link.get_mut().handle.take() {
            warn!(
                address = %self.address,
                "Session dropped without disconnecting - closing link"
            );
            if let Err(e) = handle.close() {
                warn!(address = %self.address, error = %e, "Failed to close link");
            }
        }
    }
}

fn find_characteristic(
    services: &[GattService],
    service: Uuid,
    characteristic: Uuid,
) -> Option<GattCharacteristic> {
    services
        .iter()
        .find(|s| s.uuid == service)
        .and_then(|s| s.characteristic(characteristic))
        .cloned()
}

fn target_of(characteristic: &GattCharacteristic) -> (Uuid, Uuid) {
    (characteristic.service_uuid, characteristic.uuid)
}

/// Routes transport callbacks to the session and link they were created for.
struct SessionCallback {
    session: Weak<GattSession>,
    epoch: u64,
}

impl GattCallback for SessionCallback {
    fn on_connection_state_change(&self, status: GattStatus, state: ConnectionState) {
        if let Some(session) = self.session.upgrade() {
            session.on_connection_state_change(self.epoch, status, state);
        }
    }

    fn on_services_discovered(&self, status: GattStatus) {
        if let Some(session) = self.session.upgrade() {
            session.on_services_discovered(self.epoch, status);
        }
    }

    fn on_characteristic_read(
        &self,
        characteristic: GattCharacteristic,
        value: Bytes,
        status: GattStatus,
    ) {
        if let Some(session) = self.session.upgrade() {
            session.on_characteristic_read(self.epoch, characteristic, value, status);
        }
    }

    fn on_characteristic_write(&self, characteristic: GattCharacteristic, status: GattStatus) {
        if let Some(session) = self.session.upgrade() {
            session.on_characteristic_write(self.epoch, characteristic, status);
        }
    }

    fn on_descriptor_write(
        &self,
        characteristic: GattCharacteristic,
        descriptor: Uuid,
        status: GattStatus,
    ) {
        if let Some(session) = self.session.upgrade() {
            session.on_descriptor_write(self.epoch, characteristic, descriptor, status);
        }
    }

    fn on_characteristic_changed(&self, characteristic: GattCharacteristic, value: Bytes) {
        if let Some(session) = self.session.upgrade() {
            session.on_characteristic_changed(self.epoch, characteristic, value);
        }
    }

    fn on_read_remote_rssi(&self, rssi: i16, status: GattStatus) {
        if let Some(session) = self.session.upgrade() {
            session.on_read_remote_rssi(self.epoch, rssi, status);
        }
    }
}
