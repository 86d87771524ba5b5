//! Runtime counters for the SMTP and POP3 servers and the retention scanner

use crate::storage::ScanSummary;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Smtp,
    Pop3,
}

/// Connection counters of one listener
#[derive(Default)]
pub struct ConnectionMetrics {
    /// Connections accepted since start
    pub connects_total: AtomicU64,
    /// Sessions currently open
    pub connects_current: AtomicU64,
}

/// Shared metrics collector
pub struct Metrics {
    pub smtp_connections: ConnectionMetrics,
    /// One per accepted recipient of a delivered message
    pub smtp_received_total: AtomicU64,
    /// Failed deliveries and broken connections
    pub smtp_errors_total: AtomicU64,
    /// Commands answered with a 4xx or 5xx reply
    pub smtp_warns_total: AtomicU64,
    pub pop3_connections: ConnectionMetrics,
    pub pop3_retrieved_total: AtomicU64,
    /// Messages removed by QUIT
    pub pop3_deleted_total: AtomicU64,
    pub retention_deletes_total: AtomicU64,
    pub retention_period_secs: AtomicU64,
    /// Messages kept by the last complete scan
    pub retained_current: AtomicU64,
    pub retained_bytes: AtomicU64,
    /// Unix time in milliseconds of the last complete scan, 0 if none
    pub retention_scan_completed_millis: AtomicU64,
    start_time: Instant,
}

/// Marks a session as open until dropped.
pub struct ConnectionGuard {
    metrics: Arc<Metrics>,
    protocol: Protocol,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.metrics
            .connections(self.protocol)
            .connects_current
            .fetch_sub(1, Ordering::Relaxed);
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            smtp_connections: ConnectionMetrics::default(),
            smtp_received_total: AtomicU64::new(0),
            smtp_errors_total: AtomicU64::new(0),
            smtp_warns_total: AtomicU64::new(0),
            pop3_connections: ConnectionMetrics::default(),
            pop3_retrieved_total: AtomicU64::new(0),
            pop3_deleted_total: AtomicU64::new(0),
            retention_deletes_total: AtomicU64::new(0),
            retention_period_secs: AtomicU64::new(0),
            retained_current: AtomicU64::new(0),
            retained_bytes: AtomicU64::new(0),
            retention_scan_completed_millis: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn connections(&self, protocol: Protocol) -> &ConnectionMetrics {
        match protocol {
            Protocol::Smtp => &self.smtp_connections,
            Protocol::Pop3 => &self.pop3_connections,
        }
    }

    /// Counts a new connection; it stays current until the guard is dropped.
    pub fn connected(self: &Arc<Self>, protocol: Protocol) -> ConnectionGuard {
        let counters = self.connections(protocol);
        counters.connects_total.fetch_add(1, Ordering::Relaxed);
        counters.connects_current.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            metrics: Arc::clone(self),
            protocol,
        }
    }

    pub fn add_received(&self, mailboxes: usize) {
        self.smtp_received_total
            .fetch_add(mailboxes as u64, Ordering::Relaxed);
    }

    pub fn inc_smtp_errors(&self) {
        self.smtp_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_smtp_warns(&self) {
        self.smtp_warns_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_retrieved(&self) {
        self.pop3_retrieved_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_pop3_deleted(&self, count: usize) {
        self.pop3_deleted_total
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn set_retention_period(&self, secs: u64) {
        self.retention_period_secs.store(secs, Ordering::Relaxed);
    }

    /// Records one retention pass. Retained totals are only replaced by a
    /// scan that visited every mailbox.
    pub fn record_scan(&self, summary: &ScanSummary) {
        self.retention_deletes_total
            .fetch_add(summary.removed as u64, Ordering::Relaxed);
        if summary.aborted {
            return;
        }
        self.retained_current
            .store(summary.retained as u64, Ordering::Relaxed);
        self.retained_bytes
            .store(summary.retained_bytes, Ordering::Relaxed);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        self.retention_scan_completed_millis
            .store(now, Ordering::Relaxed);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Format metrics in Prometheus text format
    pub fn to_prometheus(&self) -> String {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let rows = [
            ("smtp_connects_total", "counter", load(&self.smtp_connections.connects_total)),
            ("smtp_connects_current", "gauge", load(&self.smtp_connections.connects_current)),
            ("smtp_received_total", "counter", load(&self.smtp_received_total)),
            ("smtp_errors_total", "counter", load(&self.smtp_errors_total)),
            ("smtp_warns_total", "counter", load(&self.smtp_warns_total)),
            ("pop3_connects_total", "counter", load(&self.pop3_connections.connects_total)),
            ("pop3_connects_current", "gauge", load(&self.pop3_connections.connects_current)),
            ("pop3_retrieved_total", "counter", load(&self.pop3_retrieved_total)),
            ("pop3_deleted_total", "counter", load(&self.pop3_deleted_total)),
            ("retention_deletes_total", "counter", load(&self.retention_deletes_total)),
            ("retention_period_seconds", "gauge", load(&self.retention_period_secs)),
            ("retention_retained_current", "gauge", load(&self.retained_current)),
            ("retention_retained_bytes", "gauge", load(&self.retained_bytes)),
            (
                "retention_scan_completed_millis",
                "gauge",
                load(&self.retention_scan_completed_millis),
            ),
            ("uptime_seconds", "gauge", self.uptime_seconds()),
        ];

        rows.iter()
            .map(|(name, kind, value)| {
                format!(
                    "# TYPE mail_catcher_{name} {kind}\nmail_catcher_{name} {value}\n",
                    name = name,
                    kind = kind,
                    value = value
                )
            })
            .collect()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
