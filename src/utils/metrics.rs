//! Observability and Metrics
//!
//! This module provides metrics collection and observability features
//! for monitoring connection, conversation and dispatch health.
//!
//! Uses atomic counters for thread-safe metrics collection. A `Metrics`
//! instance is created by the host and shared through `Arc`; there is no
//! process-wide instance.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Metrics collector for protocol operations
#[derive(Debug)]
pub struct Metrics {
    /// Total connections established
    pub connections_total: AtomicU64,
    /// Currently active connections
    pub connections_active: AtomicU64,
    /// Total handshake attempts
    pub handshakes_total: AtomicU64,
    /// Handshakes that reached Ready
    pub handshakes_success: AtomicU64,
    /// Handshakes that ended in Aborted
    pub handshakes_failed: AtomicU64,
    /// Total frames sent
    pub frames_sent: AtomicU64,
    /// Total frames received
    pub frames_received: AtomicU64,
    /// Total bytes sent (encoded)
    pub bytes_sent: AtomicU64,
    /// Total bytes received (encoded)
    pub bytes_received: AtomicU64,
    /// Conversation ids handed out
    pub conversations_allocated: AtomicU64,
    /// Allocation attempts that exhausted every retry
    pub conversation_id_exhausted: AtomicU64,
    /// Waiters resumed with a cancelled result
    pub waits_cancelled: AtomicU64,
    /// Work items accepted into the backlog
    pub work_enqueued: AtomicU64,
    /// Work items dropped because the backlog was full
    pub work_dropped: AtomicU64,
    /// Handler or continuation faults caught at the dispatch boundary
    pub handler_faults: AtomicU64,
    /// Protocol errors
    pub protocol_errors: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            handshakes_total: AtomicU64::new(0),
            handshakes_success: AtomicU64::new(0),
            handshakes_failed: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            conversations_allocated: AtomicU64::new(0),
            conversation_id_exhausted: AtomicU64::new(0),
            waits_cancelled: AtomicU64::new(0),
            work_enqueued: AtomicU64::new(0),
            work_dropped: AtomicU64::new(0),
            handler_faults: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a new connection
    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection closed
    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a handshake attempt
    pub fn handshake_attempt(&self) {
        self.handshakes_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful handshake
    pub fn handshake_success(&self) {
        self.handshakes_success.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed handshake
    pub fn handshake_failed(&self) {
        self.handshakes_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a frame written to a channel
    pub fn frame_sent(&self, byte_count: u64) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a frame read from a channel
    pub fn frame_received(&self, byte_count: u64) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn conversation_allocated(&self) {
        self.conversations_allocated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn conversation_exhausted(&self) {
        self.conversation_id_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn wait_cancelled(&self) {
        self.waits_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn work_enqueued(&self) {
        self.work_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn work_dropped(&self) {
        self.work_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handler_fault(&self) {
        self.handler_faults.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a protocol error
    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            handshakes_total: self.handshakes_total.load(Ordering::Relaxed),
            handshakes_success: self.handshakes_success.load(Ordering::Relaxed),
            handshakes_failed: self.handshakes_failed.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            conversations_allocated: self.conversations_allocated.load(Ordering::Relaxed),
            conversation_id_exhausted: self.conversation_id_exhausted.load(Ordering::Relaxed),
            waits_cancelled: self.waits_cancelled.load(Ordering::Relaxed),
            work_enqueued: self.work_enqueued.load(Ordering::Relaxed),
            work_dropped: self.work_dropped.load(Ordering::Relaxed),
            handler_faults: self.handler_faults.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            handshakes_total = snapshot.handshakes_total,
            handshakes_success = snapshot.handshakes_success,
            handshakes_failed = snapshot.handshakes_failed,
            frames_sent = snapshot.frames_sent,
            frames_received = snapshot.frames_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            conversations_allocated = snapshot.conversations_allocated,
            conversation_id_exhausted = snapshot.conversation_id_exhausted,
            waits_cancelled = snapshot.waits_cancelled,
            work_enqueued = snapshot.work_enqueued,
            work_dropped = snapshot.work_dropped,
            handler_faults = snapshot.handler_faults,
            protocol_errors = snapshot.protocol_errors,
            uptime_seconds = snapshot.uptime_seconds,
            "Protocol metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub handshakes_total: u64,
    pub handshakes_success: u64,
    pub handshakes_failed: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub conversations_allocated: u64,
    pub conversation_id_exhausted: u64,
    pub waits_cancelled: u64,
    pub work_enqueued: u64,
    pub work_dropped: u64,
    pub handler_faults: u64,
    pub protocol_errors: u64,
    pub uptime_seconds: u64,
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start timing an operation
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        debug!(
            operation = self.operation,
            duration_ms = duration.as_millis(),
            "Operation completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_gauge() {
        let metrics = Metrics::new();
        metrics.connection_established();
        metrics.connection_established();
        metrics.connection_closed();

        let snap = metrics.snapshot();
        assert_eq!(snap.connections_total, 2);
        assert_eq!(snap.connections_active, 1);
    }

    #[test]
    fn test_frame_counters_accumulate_bytes() {
        let metrics = Metrics::new();
        metrics.frame_sent(10);
        metrics.frame_sent(5);
        metrics.frame_received(3);

        let snap = metrics.snapshot();
        assert_eq!(snap.frames_sent, 2);
        assert_eq!(snap.bytes_sent, 15);
        assert_eq!(snap.bytes_received, 3);
    }
}
