//! Single-slot completion gate for in-flight GATT operations.
//!
//! A session's worker arms the gate with [`PendingOperationGate::reset`],
//! starts a transport primitive, then parks in
//! [`PendingOperationGate::wait_one`]. The transport's completion callback
//! calls [`PendingOperationGate::signal`] from whatever context it runs on.
//! A disconnect calls [`PendingOperationGate::cancel`] to release the worker
//! early.
//!
//! Waiting clears the gate, so a completion that arrives after its wait has
//! already timed out finds the gate disarmed and is ignored.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

/// How a [`PendingOperationGate::wait_one`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The operation completed; elapsed time since the gate was armed.
    Signaled(Duration),
    /// The deadline passed without a completion.
    TimedOut(Duration),
    /// The wait was released by [`PendingOperationGate::cancel`] or re-armed.
    Canceled(Duration),
}

impl WaitOutcome {
    /// Time since the gate was armed.
    #[must_use]
    pub fn elapsed(self) -> Duration {
        match self {
            WaitOutcome::Signaled(d) | WaitOutcome::TimedOut(d) | WaitOutcome::Canceled(d) => d,
        }
    }

    /// Whether the operation completed.
    #[must_use]
    pub fn is_signaled(self) -> bool {
        matches!(self, WaitOutcome::Signaled(_))
    }

    /// Elapsed milliseconds, negative unless the operation completed.
    #[must_use]
    pub fn signed_millis(self) -> i64 {
        let millis = self.elapsed().as_millis() as i64;
        if self.is_signaled() { millis } else { -millis }
    }
}

#[derive(Debug, Default)]
struct GateState {
    started: Option<Instant>,
    signaled: bool,
    canceled: bool,
    epoch: u64,
}

/// Auto-resetting event guarding one outstanding operation.
#[derive(Debug, Default)]
pub struct PendingOperationGate {
    state: Mutex<GateState>,
    notify: Notify,
}

impl PendingOperationGate {
    /// Create a disarmed gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the gate for a new operation that started at `started`.
    ///
    /// Any waiter still parked on a previous arming is released as canceled.
    pub fn reset(&self, started: Instant) {
        {
            let mut state = self.state.lock();
            state.started = Some(started);
            state.signaled = false;
            state.canceled = false;
            state.epoch = state.epoch.wrapping_add(1);
        }
        self.notify.notify_waiters();
    }

    /// Release the current waiter without a completion.
    pub fn cancel(&self) {
        {
            let mut state = self.state.lock();
            if state.started.is_none() {
                return;
            }
            state.canceled = true;
        }
        self.notify.notify_waiters();
    }

    /// Record a completion.
    ///
    /// Returns `false` when the gate is not armed, was canceled or has already
    /// been signaled for this arming.
    pub fn signal(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.started.is_none() || state.signaled || state.canceled {
                return false;
            }
            state.signaled = true;
        }
        self.notify.notify_waiters();
        true
    }

    /// Whether an operation is armed and not yet resolved.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        let state = self.state.lock();
        state.started.is_some() && !state.signaled && !state.canceled
    }

    /// Wait until the armed operation completes, is canceled, or `timeout`
    /// has passed since it started.
    ///
    /// Returns `None` if the gate is not armed. The gate is disarmed on
    /// return unless it was re-armed in the meantime.
    pub async fn wait_one(&self, timeout: Duration) -> Option<WaitOutcome> {
        let (started, epoch) = {
            let state = self.state.lock();
            (state.started?, state.epoch)
        };
        let deadline = started + timeout;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.state.lock();
                if state.epoch != epoch || state.signaled || state.canceled {
                    break;
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        let mut state = self.state.lock();
        let elapsed = Instant::now().saturating_duration_since(started);
        if state.epoch != epoch {
            return Some(WaitOutcome::Canceled(elapsed));
        }

        let outcome = if state.signaled {
            WaitOutcome::Signaled(elapsed)
        } else if elapsed >= timeout {
            WaitOutcome::TimedOut(elapsed)
        } else {
            WaitOutcome::Canceled(elapsed)
        };

        state.started = None;
        state.signaled = false;
        state.canceled = false;
        Some(outcome)
    }
}
