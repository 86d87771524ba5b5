//! Background removal of expired messages

use super::Store;
use crate::error::Result;
use crate::metrics::Metrics;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Scans never start more often than this
pub const MIN_SCAN_INTERVAL: Duration = Duration::from_secs(60);

/// Outcome of one pass over the store
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanSummary {
    pub removed: usize,
    pub retained: usize,
    pub retained_bytes: u64,
    /// The pass was stopped by shutdown before visiting every mailbox
    pub aborted: bool,
}

/// Periodically removes messages older than the retention period.
pub struct RetentionScanner {
    store: Arc<dyn Store>,
    period: Duration,
    pause: Duration,
    metrics: Arc<Metrics>,
    handle: Option<JoinHandle<()>>,
}

impl RetentionScanner {
    /// A zero `period` disables the scanner. `pause` is slept between mailboxes.
    pub fn new(
        store: Arc<dyn Store>,
        period: Duration,
        pause: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        metrics.set_retention_period(period.as_secs());
        Self {
            store,
            period,
            pause,
            metrics,
            handle: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.period.is_zero()
    }

    /// Spawns the scan loop. Does nothing when disabled or already started.
    pub fn start(&mut self, cancel: CancellationToken) {
        if !self.is_enabled() {
            info!("Retention scanner disabled");
            return;
        }
        if self.handle.is_some() {
            return;
        }

        let store = Arc::clone(&self.store);
        let period = self.period;
        let pause = self.pause;
        let metrics = Arc::clone(&self.metrics);
        info!(period_secs = period.as_secs(), "Retention scanner started");

        self.handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MIN_SCAN_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let before = cutoff(Utc::now(), period);
                let scan_store = Arc::clone(&store);
                let scan_cancel = cancel.clone();
                let outcome = tokio::task::spawn_blocking(move || {
                    Self::scan(scan_store.as_ref(), before, pause, &scan_cancel)
                })
                .await;

                match outcome {
                    Ok(Ok(summary)) => {
                        metrics.record_scan(&summary);
                        info!(
                            removed = summary.removed,
                            retained = summary.retained,
                            retained_bytes = summary.retained_bytes,
                            "Retention scan complete"
                        );
                        if summary.aborted {
                            break;
                        }
                    }
                    Ok(Err(e)) => error!("Retention scan failed: {}", e),
                    Err(e) => error!("Retention scan task failed: {}", e),
                }
            }
            info!("Retention scanner stopped");
        }));
    }

    /// Waits for the scan loop to exit after its token was cancelled.
    pub async fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                error!("Retention scanner panicked: {}", e);
            }
        }
    }

    /// Runs one pass, removing every message received before `cutoff`.
    ///
    /// Blocks the calling thread. Must not be called from within an async
    /// task; the scan loop runs it on the blocking pool.
    pub fn scan(
        store: &dyn Store,
        cutoff: DateTime<Utc>,
        pause: Duration,
        cancel: &CancellationToken,
    ) -> Result<ScanSummary> {
        let mut summary = ScanSummary::default();
        debug!(cutoff = %cutoff, "Retention scan starting");

        store.visit_mailboxes(&mut |messages| {
            if cancel.is_cancelled() {
                summary.aborted = true;
                return false;
            }
            for message in messages {
                if message.date() < cutoff {
                    debug!(mailbox = %message.mailbox(), id = %message.id(), "Purging expired message");
                    match store.remove_message(message.mailbox(), message.id()) {
                        Ok(()) => summary.removed += 1,
                        // Already deleted by someone else
                        Err(e) if e.is_not_found() => {}
                        Err(e) => warn!(
                            mailbox = %message.mailbox(),
                            id = %message.id(),
                            "Failed to purge expired message: {}",
                            e
                        ),
                    }
                } else {
                    summary.retained += 1;
                    summary.retained_bytes += message.size();
                }
            }
            if !pause_between(pause, cancel) {
                summary.aborted = true;
                return false;
            }
            true
        })?;

        Ok(summary)
    }
}

fn cutoff(now: DateTime<Utc>, period: Duration) -> DateTime<Utc> {
    match chrono::Duration::from_std(period) {
        Ok(period) => now - period,
        Err(_) => DateTime::<Utc>::MIN_UTC,
    }
}

/// Sleeps for `pause` unless cancelled first. Returns false on cancellation.
fn pause_between(pause: Duration, cancel: &CancellationToken) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    if pause.is_zero() {
        return true;
    }
    match Handle::try_current() {
        Ok(handle) => handle.block_on(async {
            tokio::select! {
                _ = cancel.cancelled() => false,
                _ = tokio::time::sleep(pause) => true,
            }
        }),
        Err(_) => {
            std::thread::sleep(pause);
            !cancel.is_cancelled()
        }
    }
}
