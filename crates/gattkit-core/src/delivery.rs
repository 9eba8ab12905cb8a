//! The registry's delivery context.
//!
//! One task per registry runs every listener callback, timeout veto and
//! disconnect-confirmation timer, so a session's events reach listeners in
//! the order they completed and listeners never run concurrently.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use gattkit_types::GattOperation;

use crate::events::{EventDispatcher, GattEvent, ListenerAction, SessionEvent};
use crate::session::{AfterSuccess, GattSession};

/// Work posted to the delivery context.
pub(crate) enum Delivery {
    Event {
        session: Arc<GattSession>,
        event: GattEvent,
        after_success: Option<AfterSuccess>,
    },
    OperationTimeout {
        session: Arc<GattSession>,
        epoch: u64,
        operation: GattOperation,
        timeout: Duration,
        elapsed: Duration,
    },
    DisconnectTimeout {
        session: Arc<GattSession>,
        epoch: u64,
    },
}

pub(crate) type DeliverySender = mpsc::UnboundedSender<Delivery>;

/// Start the delivery task. It stops once every sender is gone.
pub(crate) fn spawn(runtime: &Handle, events: EventDispatcher) -> DeliverySender {
    let (sender, mut receiver) = mpsc::unbounded_channel();
    runtime.spawn(async move {
        while let Some(delivery) = receiver.recv().await {
            dispatch(delivery, &events);
        }
        debug!("Delivery context stopped");
    });
    sender
}

fn dispatch(delivery: Delivery, events: &EventDispatcher) {
    match delivery {
        Delivery::Event {
            session,
            event,
            after_success,
        } => deliver_event(&session, event, after_success, events),
        Delivery::OperationTimeout {
            session,
            epoch,
            operation,
            timeout,
            elapsed,
        } => deliver_timeout(&session, epoch, operation, timeout, elapsed),
        Delivery::DisconnectTimeout { session, epoch } => session.on_disconnect_timeout(epoch),
    }
}

fn deliver_event(
    session: &GattSession,
    event: GattEvent,
    after_success: Option<AfterSuccess>,
    events: &EventDispatcher,
) {
    if matches!(event, GattEvent::CharacteristicChanged { .. })
        && session.is_disconnecting_or_disconnected()
    {
        trace!(address = %session.address(), "Dropping queued notification, disconnecting");
        return;
    }

    // A failed completion disconnects unless it is the disconnect itself.
    let mut disconnect = event.success() == Some(false);
    let listeners = session.begin_traversing();
    for listener in &listeners {
        match listener.on_event(session, &event) {
            ListenerAction::Continue => {}
            ListenerAction::Disconnect => disconnect = true,
            ListenerAction::Detach => session.remove_listener(listener),
        }
    }
    session.end_traversing();

    if let Some(hook) = after_success {
        hook(session, &event);
    }

    if disconnect && !event.is_disconnected() {
        debug!(address = %session.address(), "Disconnecting after event");
        session.disconnect();
    }

    events.send(SessionEvent::now(session.address(), event));
}

fn deliver_timeout(
    session: &GattSession,
    epoch: u64,
    operation: GattOperation,
    timeout: Duration,
    elapsed: Duration,
) {
    let listeners = session.begin_traversing();
    // Every listener sees the timeout; any one of them can keep the link.
    let keep = listeners.iter().fold(false, |keep, listener| {
        listener.on_operation_timeout(session, operation, timeout, elapsed) | keep
    });
    session.end_traversing();

    if keep {
        info!(address = %session.address(), %operation, "Listener kept connection after timeout");
    } else {
        // A wait released by the link going away has nothing left to tear down.
        session.disconnect_link(epoch);
    }
}
