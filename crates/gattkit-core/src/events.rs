//! Session events and the listener contract.
//!
//! Every session event is delivered twice on the registry's delivery
//! context: first to the session's attached [`GattListener`]s in
//! registration order, then as a [`SessionEvent`] on the registry's
//! broadcast channel for observers that prefer streams.

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::broadcast;

use gattkit_types::{
    BluetoothAddress, DisconnectReason, GattCharacteristic, GattOperation, GattService, GattStatus,
};

use crate::session::GattSession;

/// Events emitted by a session.
///
/// All events are serializable for logging, persistence, and IPC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum GattEvent {
    /// A connect request has been handed to the transport.
    Connecting,
    /// The link is up; service discovery is starting.
    Connected { elapsed: Duration },
    /// The link is gone. Always the last event of a connection.
    Disconnected {
        /// Transport status, if the transport reported one.
        status: Option<GattStatus>,
        reason: DisconnectReason,
        /// Time since the connect request, if one was made.
        elapsed: Option<Duration>,
    },
    /// Service discovery finished.
    ServicesDiscovered {
        services: Vec<GattService>,
        success: bool,
        elapsed: Duration,
    },
    /// A characteristic read finished.
    CharacteristicRead {
        characteristic: GattCharacteristic,
        value: Bytes,
        success: bool,
        elapsed: Duration,
    },
    /// A characteristic write finished.
    CharacteristicWrite {
        characteristic: GattCharacteristic,
        success: bool,
        elapsed: Duration,
    },
    /// A notification or indication change finished.
    CharacteristicSetNotification {
        characteristic: GattCharacteristic,
        success: bool,
        elapsed: Duration,
    },
    /// The peer pushed a new characteristic value.
    CharacteristicChanged {
        characteristic: GattCharacteristic,
        value: Bytes,
    },
    /// An RSSI read finished.
    RemoteRssiRead {
        rssi: i16,
        success: bool,
        elapsed: Duration,
    },
}

impl GattEvent {
    /// The operation this event completes, if any.
    #[must_use]
    pub fn operation(&self) -> Option<GattOperation> {
        match self {
            GattEvent::ServicesDiscovered { .. } => Some(GattOperation::DiscoverServices),
            GattEvent::CharacteristicRead { .. } => Some(GattOperation::CharacteristicRead),
            GattEvent::CharacteristicWrite { .. } => Some(GattOperation::CharacteristicWrite),
            GattEvent::CharacteristicSetNotification { .. } => {
                Some(GattOperation::CharacteristicSetNotification)
            }
            GattEvent::RemoteRssiRead { .. } => Some(GattOperation::ReadRemoteRssi),
            _ => None,
        }
    }

    /// The completion outcome, for events that complete an operation.
    #[must_use]
    pub fn success(&self) -> Option<bool> {
        match self {
            GattEvent::ServicesDiscovered { success, .. }
            | GattEvent::CharacteristicRead { success, .. }
            | GattEvent::CharacteristicWrite { success, .. }
            | GattEvent::CharacteristicSetNotification { success, .. }
            | GattEvent::RemoteRssiRead { success, .. } => Some(*success),
            _ => None,
        }
    }

    /// Whether this is the [`GattEvent::Disconnected`] event.
    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        matches!(self, GattEvent::Disconnected { .. })
    }
}

/// What a listener wants the session to do after handling an event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ListenerAction {
    /// Keep going.
    #[default]
    Continue,
    /// Disconnect the session. Ignored for [`GattEvent::Disconnected`].
    Disconnect,
    /// Detach this listener from the session.
    Detach,
}

/// Receives a session's events on the delivery context.
///
/// Closures of the form `Fn(&GattSession, &GattEvent) -> ListenerAction`
/// implement this trait.
///
/// # Example
///
/// ```
/// use gattkit_core::{GattEvent, GattSession, ListenerAction};
///
/// let one_shot = |_: &GattSession, event: &GattEvent| {
///     if event.is_disconnected() {
///         ListenerAction::Detach
///     } else {
///         ListenerAction::Continue
///     }
/// };
/// # let _ = one_shot;
/// ```
pub trait GattListener: Send + Sync {
    /// Handle an event.
    fn on_event(&self, session: &GattSession, event: &GattEvent) -> ListenerAction {
        let _ = (session, event);
        ListenerAction::Continue
    }

    /// An operation's wait ended without a completion, either because its
    /// timeout passed or because a disconnect released it.
    ///
    /// Return `true` to keep the connection. The session disconnects unless
    /// at least one listener returns `true`; a link that is already gone
    /// is left alone.
    fn on_operation_timeout(
        &self,
        session: &GattSession,
        operation: GattOperation,
        timeout: Duration,
        elapsed: Duration,
    ) -> bool {
        let _ = (session, operation, timeout, elapsed);
        false
    }
}

impl<F> GattListener for F
where
    F: Fn(&GattSession, &GattEvent) -> ListenerAction + Send + Sync,
{
    fn on_event(&self, session: &GattSession, event: &GattEvent) -> ListenerAction {
        self(session, event)
    }
}

/// A session event tagged with its device and delivery time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub address: BluetoothAddress,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub event: GattEvent,
}

impl SessionEvent {
    /// Stamp `event` with the current time.
    pub fn now(address: BluetoothAddress, event: GattEvent) -> Self {
        Self {
            address,
            timestamp: OffsetDateTime::now_utc(),
            event,
        }
    }
}

/// Sender for session events.
pub type EventSender = broadcast::Sender<SessionEvent>;

/// Receiver for session events.
pub type EventReceiver = broadcast::Receiver<SessionEvent>;

/// Event dispatcher for sending events to multiple receivers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    /// Create a new event dispatcher.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: SessionEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Get the sender for direct use.
    pub fn sender(&self) -> EventSender {
        self.sender.clone()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_EVENT_CAPACITY)
    }
}
