//! Observability and Metrics
//!
//! This module provides metrics collection and observability features
//! for monitoring dispatch, broadcast, and handoff health.
//!
//! Uses atomic counters for thread-safe metrics collection. There is no
//! global instance; the engine owns one behind an `Arc` and hands clones
//! to whoever needs to observe it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Metrics collector for the protocol core
#[derive(Debug)]
pub struct Metrics {
    /// Total client sessions accepted
    pub sessions_opened: AtomicU64,
    /// Total client sessions torn down
    pub sessions_closed: AtomicU64,
    /// Frames dispatched to a handler
    pub frames_dispatched: AtomicU64,
    /// Frames or handshakes that violated the protocol
    pub protocol_violations: AtomicU64,
    /// Rejection frames sent before a forced close
    pub rejects_sent: AtomicU64,
    /// Broadcast operations performed
    pub broadcasts: AtomicU64,
    /// Frames queued across all broadcast recipients
    pub broadcast_frames: AtomicU64,
    /// Handoff nodes created (login, logout, map change)
    pub handoffs_begun: AtomicU64,
    /// Handoff nodes completed by a backend acknowledgement
    pub handoffs_completed: AtomicU64,
    /// Handoff nodes evicted by the staleness sweeper
    pub handoffs_evicted: AtomicU64,
    /// Frames received over the backend link
    pub backend_frames: AtomicU64,
    /// Times the backend link reached ready (first connect included)
    pub backend_reconnects: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions_opened: AtomicU64::new(0),
            sessions_closed: AtomicU64::new(0),
            frames_dispatched: AtomicU64::new(0),
            protocol_violations: AtomicU64::new(0),
            rejects_sent: AtomicU64::new(0),
            broadcasts: AtomicU64::new(0),
            broadcast_frames: AtomicU64::new(0),
            handoffs_begun: AtomicU64::new(0),
            handoffs_completed: AtomicU64::new(0),
            handoffs_evicted: AtomicU64::new(0),
            backend_frames: AtomicU64::new(0),
            backend_reconnects: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn inc_sessions_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sessions_closed(&self) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_frames_dispatched(&self) {
        self.frames_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_protocol_violations(&self) {
        self.protocol_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rejects_sent(&self) {
        self.rejects_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_broadcasts(&self) {
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record how many recipients one broadcast reached
    pub fn add_broadcast_frames(&self, count: u64) {
        self.broadcast_frames.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_handoffs_begun(&self) {
        self.handoffs_begun.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_handoffs_completed(&self) {
        self.handoffs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_handoffs_evicted(&self) {
        self.handoffs_evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_backend_frames(&self) {
        self.backend_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_backend_reconnects(&self) {
        self.backend_reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            frames_dispatched: self.frames_dispatched.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
            rejects_sent: self.rejects_sent.load(Ordering::Relaxed),
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
            broadcast_frames: self.broadcast_frames.load(Ordering::Relaxed),
            handoffs_begun: self.handoffs_begun.load(Ordering::Relaxed),
            handoffs_completed: self.handoffs_completed.load(Ordering::Relaxed),
            handoffs_evicted: self.handoffs_evicted.load(Ordering::Relaxed),
            backend_frames: self.backend_frames.load(Ordering::Relaxed),
            backend_reconnects: self.backend_reconnects.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            sessions_opened = snapshot.sessions_opened,
            sessions_closed = snapshot.sessions_closed,
            frames_dispatched = snapshot.frames_dispatched,
            protocol_violations = snapshot.protocol_violations,
            rejects_sent = snapshot.rejects_sent,
            broadcasts = snapshot.broadcasts,
            broadcast_frames = snapshot.broadcast_frames,
            handoffs_begun = snapshot.handoffs_begun,
            handoffs_completed = snapshot.handoffs_completed,
            handoffs_evicted = snapshot.handoffs_evicted,
            backend_frames = snapshot.backend_frames,
            backend_reconnects = snapshot.backend_reconnects,
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
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub frames_dispatched: u64,
    pub protocol_violations: u64,
    pub rejects_sent: u64,
    pub broadcasts: u64,
    pub broadcast_frames: u64,
    pub handoffs_begun: u64,
    pub handoffs_completed: u64,
    pub handoffs_evicted: u64,
    pub backend_frames: u64,
    pub backend_reconnects: u64,
    pub uptime_seconds: u64,
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start timing an operation
    #[must_use]
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }

    /// Elapsed time so far, in microseconds
    #[must_use]
    pub fn elapsed_micros(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        debug!(
            operation = self.operation,
            duration_us = self.elapsed_micros(),
            "operation timed"
        );
    }
}
