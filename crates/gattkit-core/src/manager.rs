//! Session registry.
//!
//! A [`GattManager`] owns the sessions for one transport, keyed by device
//! address, and the delivery context their events are dispatched on.
//! Sessions are created on first lookup and live until closed.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, info};

use gattkit_types::BluetoothAddress;

use crate::config::{ManagerConfig, SessionConfig};
use crate::delivery::{self, DeliverySender};
use crate::error::{Error, Result};
use crate::events::{EventDispatcher, EventReceiver};
use crate::session::GattSession;
use crate::transport::GattTransport;

pub(crate) struct RegistryInner {
    sessions: Mutex<HashMap<BluetoothAddress, Arc<GattSession>>>,
    transport: Arc<dyn GattTransport>,
    config: ManagerConfig,
    runtime: Handle,
    delivery: DeliverySender,
    events: EventDispatcher,
}

impl RegistryInner {
    /// Drop `session` from the map if it is still the registered instance.
    pub(crate) fn forget(&self, session: &GattSession) {
        let mut sessions = self.sessions.lock();
        let registered = sessions
            .get(&session.address())
            .is_some_and(|s| std::ptr::eq(Arc::as_ptr(s), session));
        if registered {
            sessions.remove(&session.address());
            debug!(address = %session.address(), "Session removed from registry");
        }
    }
}

/// Registry of GATT sessions sharing one transport and delivery context.
///
/// Cloning a manager yields another handle to the same registry.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use gattkit_core::{GattManager, MockTransport};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> gattkit_core::Result<()> {
/// let manager = GattManager::new(Arc::new(MockTransport::new()))?;
/// let first = manager.get_session("AA:BB:CC:DD:EE:FF")?;
/// let second = manager.get_session("aa:bb:cc:dd:ee:ff")?;
/// assert!(Arc::ptr_eq(&first, &second));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct GattManager {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for GattManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GattManager")
            .field("sessions", &self.len())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl GattManager {
    /// Create a registry with the default configuration.
    ///
    /// # Errors
    ///
    /// [`Error::NoRuntime`] if called outside a tokio runtime.
    pub fn new(transport: Arc<dyn GattTransport>) -> Result<Self> {
        Self::with_config(transport, ManagerConfig::default())
    }

    /// Create a registry with a custom configuration.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if the configuration is invalid, or
    /// [`Error::NoRuntime`] if called outside a tokio runtime.
    pub fn with_config(transport: Arc<dyn GattTransport>, config: ManagerConfig) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        Self::with_runtime(transport, config, runtime)
    }

    /// Create a registry whose tasks run on `runtime`.
    pub fn with_runtime(
        transport: Arc<dyn GattTransport>,
        config: ManagerConfig,
        runtime: Handle,
    ) -> Result<Self> {
        config.validate()?;
        let events = EventDispatcher::new(config.event_capacity);
        let delivery = delivery::spawn(&runtime, events.clone());

        Ok(Self {
            inner: Arc::new(RegistryInner {
                sessions: Mutex::new(HashMap::new()),
                transport,
                config,
                runtime,
                delivery,
                events,
            }),
        })
    }

    /// Get the event dispatcher.
    pub fn events(&self) -> &EventDispatcher {
        &self.inner.events
    }

    /// Subscribe to every session's events.
    pub fn subscribe(&self) -> EventReceiver {
        self.inner.events.subscribe()
    }

    /// Get the registry configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Get the session for `address`, creating it if needed.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidAddress`] if the address is malformed, all zero or
    /// broadcast.
    pub fn get_session(&self, address: &str) -> Result<Arc<GattSession>> {
        let address = BluetoothAddress::parse_device(address)?;
        self.get_session_for(address)
    }

    /// Get the session for a parsed address, creating it if needed.
    pub fn get_session_for(&self, address: BluetoothAddress) -> Result<Arc<GattSession>> {
        self.get_session_with_config(address, self.inner.config.session.clone())
    }

    /// Get the session for `address`, creating it with `config` if needed.
    ///
    /// An existing session keeps the configuration it was created with.
    pub fn get_session_with_config(
        &self,
        address: BluetoothAddress,
        config: SessionConfig,
    ) -> Result<Arc<GattSession>> {
        address.validate()?;

        let mut sessions = self.inner.sessions.lock();
        if let Some(session) = sessions.get(&address) {
            return Ok(Arc::clone(session));
        }

        let session = GattSession::new(
            address,
            config,
            Arc::clone(&self.inner.transport),
            self.inner.runtime.clone(),
            self.inner.delivery.clone(),
            Arc::downgrade(&self.inner),
        );
        sessions.insert(address, Arc::clone(&session));
        debug!(%address, "Session created");
        Ok(session)
    }

    /// Get the session for `address` without creating one.
    pub fn session(&self, address: BluetoothAddress) -> Option<Arc<GattSession>> {
        self.inner.sessions.lock().get(&address).cloned()
    }

    /// Remove the session for `address` and disconnect it.
    pub fn remove_session(&self, address: BluetoothAddress) -> Option<Arc<GattSession>> {
        let session = self.inner.sessions.lock().remove(&address)?;
        session.disconnect();
        Some(session)
    }

    /// Addresses of all registered sessions.
    pub fn addresses(&self) -> Vec<BluetoothAddress> {
        self.inner.sessions.lock().keys().copied().collect()
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    /// Whether no sessions are registered.
    pub fn is_empty(&self) -> bool {
        self.inner.sessions.lock().is_empty()
    }

    /// Disconnect and remove every session.
    ///
    /// Returns how many sessions were removed. Listeners stay attached, so
    /// each connected session still reports its
    /// [`GattEvent::Disconnected`](crate::GattEvent::Disconnected).
    pub fn close(&self) -> usize {
        // Drain under the lock, disconnect outside it.
        let sessions: Vec<_> = self.inner.sessions.lock().drain().map(|(_, s)| s).collect();
        let count = sessions.len();
        for session in sessions {
            session.disconnect();
        }
        info!(count, "Registry closed");
        count
    }
}
