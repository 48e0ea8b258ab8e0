//! Observability for dispatch runs.
//!
//! Provides run metrics, a timer, and (with the `tracing` feature) a
//! subscriber installer.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::errors::{MailerErrorKind, MailerResult};

#[cfg(feature = "tracing")]
pub mod logging;

#[cfg(feature = "tracing")]
pub use logging::{LogFormat, LogLevel, LoggingConfig};

/// Dispatch metrics collector.
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    /// Batches accepted by the relay.
    pub batches_sent: AtomicU64,
    /// Batches that failed for any reason.
    pub batches_failed: AtomicU64,
    /// Failures due to an invalid address.
    pub invalid_addresses: AtomicU64,
    /// Failures due to the send timeout.
    pub timeouts: AtomicU64,
    /// Failures due to rejected credentials.
    pub auth_failures: AtomicU64,
    /// Sessions that ran over TLS.
    pub tls_upgrades: AtomicU64,
    /// Runs that emitted `Completed`.
    pub runs_completed: AtomicU64,
}

impl DispatchMetrics {
    /// Creates a new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the outcome of one batch.
    pub fn record_outcome(&self, outcome: &MailerResult<()>) {
        match outcome {
            Ok(()) => {
                self.batches_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => self.record_failure(e.kind()),
        }
    }

    /// Records a failed batch.
    pub fn record_failure(&self, kind: MailerErrorKind) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
        let counter = match kind {
            MailerErrorKind::InvalidAddress => &self.invalid_addresses,
            MailerErrorKind::Timeout => &self.timeouts,
            MailerErrorKind::AuthFailure => &self.auth_failures,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a TLS session.
    pub fn record_tls_upgrade(&self) {
        self.tls_upgrades.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a finished run.
    pub fn record_run_completed(&self) {
        self.runs_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            invalid_addresses: self.invalid_addresses.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            tls_upgrades: self.tls_upgrades.load(Ordering::Relaxed),
            runs_completed: self.runs_completed.load(Ordering::Relaxed),
        }
    }

    /// Resets all metrics.
    pub fn reset(&self) {
        for counter in [
            &self.batches_sent,
            &self.batches_failed,
            &self.invalid_addresses,
            &self.timeouts,
            &self.auth_failures,
            &self.tls_upgrades,
            &self.runs_completed,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Batches accepted by the relay.
    pub batches_sent: u64,
    /// Batches that failed.
    pub batches_failed: u64,
    /// Failures due to an invalid address.
    pub invalid_addresses: u64,
    /// Failures due to the send timeout.
    pub timeouts: u64,
    /// Failures due to rejected credentials.
    pub auth_failures: u64,
    /// Sessions that ran over TLS.
    pub tls_upgrades: u64,
    /// Finished runs.
    pub runs_completed: u64,
}

impl MetricsSnapshot {
    /// Share of batches that were sent; 1.0 when nothing was attempted.
    pub fn success_rate(&self) -> f64 {
        let total = self.batches_sent + self.batches_failed;
        if total == 0 {
            1.0
        } else {
            self.batches_sent as f64 / total as f64
        }
    }
}

/// Timer for measuring operation duration.
#[derive(Debug)]
pub struct Timer {
    start: Instant,
    name: String,
}

impl Timer {
    /// Creates and starts a new timer.
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            name: name.into(),
        }
    }

    /// Returns the elapsed time.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stops the timer and returns the duration.
    pub fn stop(self) -> Duration {
        let elapsed = self.start.elapsed();

        #[cfg(feature = "tracing")]
        tracing::debug!(
            timer = %self.name,
            duration_ms = elapsed.as_millis() as u64,
            "Timer stopped"
        );

        elapsed
    }
}
