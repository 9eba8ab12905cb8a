//! Per-session operation metrics.
//!
//! Each session records the outcome and latency of every operation it
//! completes or times out. Snapshots are serializable for export.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use gattkit_types::GattOperation;

/// Metrics for a single operation type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationMetrics {
    /// Total number of operations.
    pub count: u64,
    /// Number of successful operations.
    pub success_count: u64,
    /// Number of failed operations, timeouts included.
    pub failure_count: u64,
    /// Number of operations whose wait timed out.
    pub timeout_count: u64,
    /// Total duration of all operations.
    pub total_duration_ms: u64,
    /// Minimum operation duration.
    pub min_duration_ms: Option<u64>,
    /// Maximum operation duration.
    pub max_duration_ms: Option<u64>,
    /// Average operation duration.
    pub avg_duration_ms: Option<f64>,
}

/// Lock-free counters for one operation type.
#[derive(Debug)]
pub struct AtomicOperationMetrics {
    count: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    timeout_count: AtomicU64,
    total_duration_ms: AtomicU64,
    min_duration_ms: AtomicU64,
    max_duration_ms: AtomicU64,
}

impl Default for AtomicOperationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AtomicOperationMetrics {
    /// Create new empty metrics.
    pub fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            timeout_count: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            min_duration_ms: AtomicU64::new(u64::MAX),
            max_duration_ms: AtomicU64::new(0),
        }
    }

    /// Record a completed operation.
    pub fn record(&self, success: bool, duration: Duration) {
        if success {
            self.success_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failure_count.fetch_add(1, Ordering::Relaxed);
        }
        self.record_duration(duration);
    }

    /// Record an operation whose wait timed out.
    pub fn record_timeout(&self, duration: Duration) {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        self.timeout_count.fetch_add(1, Ordering::Relaxed);
        self.record_duration(duration);
    }

    fn record_duration(&self, duration: Duration) {
        let ms = duration.as_millis() as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_duration_ms.fetch_add(ms, Ordering::Relaxed);
        self.min_duration_ms.fetch_min(ms, Ordering::Relaxed);
        self.max_duration_ms.fetch_max(ms, Ordering::Relaxed);
    }

    /// Get a snapshot of the current metrics.
    pub fn snapshot(&self) -> OperationMetrics {
        let count = self.count.load(Ordering::Relaxed);
        let total_duration_ms = self.total_duration_ms.load(Ordering::Relaxed);
        let (min_duration_ms, max_duration_ms, avg_duration_ms) = if count == 0 {
            (None, None, None)
        } else {
            (
                Some(self.min_duration_ms.load(Ordering::Relaxed)),
                Some(self.max_duration_ms.load(Ordering::Relaxed)),
                Some(total_duration_ms as f64 / count as f64),
            )
        };

        OperationMetrics {
            count,
            success_count: self.success_count.load(Ordering::Relaxed),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            timeout_count: self.timeout_count.load(Ordering::Relaxed),
            total_duration_ms,
            min_duration_ms,
            max_duration_ms,
            avg_duration_ms,
        }
    }

    /// Reset all metrics to zero.
    pub fn reset(&self) {
        for counter in [
            &self.count,
            &self.success_count,
            &self.failure_count,
            &self.timeout_count,
            &self.total_duration_ms,
            &self.max_duration_ms,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.min_duration_ms.store(u64::MAX, Ordering::Relaxed);
    }
}

/// Operation metrics for one session.
#[derive(Debug, Default)]
pub struct SessionMetrics {
    connected_at: Mutex<Option<Instant>>,
    /// Connect requests, measured up to the link coming up.
    pub connect: AtomicOperationMetrics,
    /// Service discovery.
    pub discover_services: AtomicOperationMetrics,
    /// Characteristic reads.
    pub reads: AtomicOperationMetrics,
    /// Characteristic writes.
    pub writes: AtomicOperationMetrics,
    /// Notification changes.
    pub set_notification: AtomicOperationMetrics,
    /// RSSI reads.
    pub rssi: AtomicOperationMetrics,
    /// Number of times the link went away.
    disconnects: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl SessionMetrics {
    /// Create new empty session metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// The counters for `operation`.
    pub fn operation(&self, operation: GattOperation) -> &AtomicOperationMetrics {
        match operation {
            GattOperation::Connect => &self.connect,
            GattOperation::DiscoverServices => &self.discover_services,
            GattOperation::CharacteristicRead => &self.reads,
            GattOperation::CharacteristicWrite => &self.writes,
            GattOperation::CharacteristicSetNotification => &self.set_notification,
            GattOperation::ReadRemoteRssi => &self.rssi,
        }
    }

    /// Mark the link as up.
    pub fn mark_connected(&self) {
        *self.connected_at.lock() = Some(Instant::now());
    }

    /// Mark the link as gone.
    pub fn mark_disconnected(&self) {
        if self.connected_at.lock().take().is_some() {
            self.disconnects.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Time since the link came up, if it is up.
    pub fn uptime(&self) -> Option<Duration> {
        self.connected_at.lock().map(|t| t.elapsed())
    }

    /// Record bytes read.
    pub fn record_bytes_read(&self, bytes: usize) {
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record bytes written.
    pub fn record_bytes_written(&self, bytes: usize) {
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Get a summary of all metrics.
    pub fn summary(&self) -> SessionMetricsSummary {
        SessionMetricsSummary {
            uptime_ms: self.uptime().map(|d| d.as_millis() as u64),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            connect: self.connect.snapshot(),
            discover_services: self.discover_services.snapshot(),
            reads: self.reads.snapshot(),
            writes: self.writes.snapshot(),
            set_notification: self.set_notification.snapshot(),
            rssi: self.rssi.snapshot(),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }

    /// Reset all metrics.
    pub fn reset(&self) {
        *self.connected_at.lock() = None;
        for operation in GattOperation::ALL {
            self.operation(operation).reset();
        }
        self.disconnects.store(0, Ordering::Relaxed);
        self.bytes_read.store(0, Ordering::Relaxed);
        self.bytes_written.store(0, Ordering::Relaxed);
    }
}

/// Serializable summary of session metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetricsSummary {
    /// Link uptime in milliseconds.
    pub uptime_ms: Option<u64>,
    /// Number of disconnects after the link had come up.
    pub disconnects: u64,
    pub connect: OperationMetrics,
    pub discover_services: OperationMetrics,
    pub reads: OperationMetrics,
    pub writes: OperationMetrics,
    pub set_notification: OperationMetrics,
    pub rssi: OperationMetrics,
    /// Total bytes read.
    pub bytes_read: u64,
    /// Total bytes written.
    pub bytes_written: u64,
}
