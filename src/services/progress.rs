//! Incremental, monotonic progress reporting for a running scan.

use std::sync::Arc;

use tokio::time::{Duration, Instant};
use uuid::Uuid;

use crate::ledger::ScanLedger;

/// Persists progress for one scan, never letting the stored figure regress.
///
/// Samples below the high-water mark are coerced up to it. Writes are best
/// effort: a failed write is logged and the scan carries on.
///
/// Unchanged samples are skipped, except that the row is rewritten at least
/// once per `heartbeat` so its `updated_at` shows the scan is alive.
pub struct ProgressReporter {
    ledger: Arc<dyn ScanLedger>,
    scan_id: Uuid,
    percent: u8,
    step: String,
    heartbeat: Duration,
    last_write: Option<Instant>,
}

impl ProgressReporter {
    pub fn new(ledger: Arc<dyn ScanLedger>, scan_id: Uuid, heartbeat: Duration) -> Self {
        Self {
            ledger,
            scan_id,
            percent: 0,
            step: String::new(),
            heartbeat,
            last_write: None,
        }
    }

    /// Highest percentage reported so far.
    pub fn percent(&self) -> u8 {
        self.percent
    }

    /// Report a sample. Returns the effective (coerced) percentage.
    pub async fn report(&mut self, percent: u8, step: &str) -> u8 {
        let effective = percent.min(100).max(self.percent);
        let heartbeat_due = self
            .last_write
            .map_or(true, |at| at.elapsed() >= self.heartbeat);
        if effective == self.percent && step == self.step && !heartbeat_due {
            return effective;
        }

        self.percent = effective;
        self.step = step.to_string();
        self.last_write = Some(Instant::now());

        match self.ledger.record_progress(self.scan_id, effective, step).await {
            Ok(Some(stored)) => {
                // Another write may already have pushed the row higher.
                self.percent = self.percent.max(stored.clamp(0, 100) as u8);
                tracing::debug!(scan_id = %self.scan_id, progress = self.percent, step, "Progress");
            }
            Ok(None) => {
                tracing::debug!(scan_id = %self.scan_id, "Progress ignored; scan not in progress");
            }
            Err(e) => {
                tracing::warn!(scan_id = %self.scan_id, error = %e, "Failed to record progress");
            }
        }
        self.percent
    }
}

/// Passive analysis estimate from the record backlog.
///
/// `floor((peak - backlog) / peak * 100)`, capped at 99; completion is
/// decided by the caller. Zero until a backlog has been observed.
pub fn passive_percent(peak: u64, backlog: u64) -> u8 {
    if peak == 0 {
        return 0;
    }
    let drained = peak.saturating_sub(backlog);
    let pct = drained.saturating_mul(100) / peak;
    pct.min(99) as u8
}
