//! Reconciliation of orphaned scans and the periodic pending-job sweep.
//!
//! Several processes may share one ledger. A running scan rewrites its row
//! at least once per heartbeat, so an InProgress row that has not been
//! touched for `stale_after` belongs to a worker that is gone.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::errors::AppError;
use crate::ledger::ScanLedger;
use crate::models::scan::ScanStatus;
use crate::services::dispatcher::Dispatcher;

pub const INTERRUPTED: &str = "interrupted: worker stopped before completion";

/// Fail InProgress scans whose row has gone stale. Scans for which
/// `is_local` holds are running in this process and are left alone.
/// Returns how many were moved.
pub async fn reconcile_interrupted(
    ledger: &dyn ScanLedger,
    stale_after: Duration,
    is_local: impl Fn(Uuid) -> bool,
) -> Result<usize, AppError> {
    let stale_after = chrono::Duration::from_std(stale_after)
        .map_err(|e| AppError::Internal(format!("stale_after out of range: {e}")))?;
    let cutoff = Utc::now() - stale_after;

    let mut failed = 0;
    for job in ledger.list_by_status(ScanStatus::InProgress).await? {
        if job.updated_at > cutoff || is_local(job.id) {
            continue;
        }
        if ledger
            .transition(job.id, ScanStatus::InProgress, ScanStatus::Failed, Some(INTERRUPTED))
            .await?
        {
            tracing::warn!(scan_id = %job.id, progress = job.progress, "Interrupted scan marked failed");
            failed += 1;
        }
    }
    Ok(failed)
}

/// Queue Pending scans this process is not already tracking.
pub async fn sweep_pending(
    ledger: &dyn ScanLedger,
    dispatcher: &Dispatcher,
) -> Result<usize, AppError> {
    let mut queued = 0;
    for job in ledger.list_by_status(ScanStatus::Pending).await? {
        if dispatcher.is_tracked(job.id) {
            continue;
        }
        dispatcher.submit(job.id).await?;
        queued += 1;
    }
    if queued > 0 {
        tracing::info!(queued, "Queued pending scans");
    }
    Ok(queued)
}

/// Every `interval` until `shutdown` fires: fail orphaned scans, then
/// queue Pending ones.
pub fn spawn_pending_sweep(
    ledger: Arc<dyn ScanLedger>,
    dispatcher: Dispatcher,
    interval: Duration,
    stale_after: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(interval_secs = interval.as_secs(), "Pending sweep started");
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reconciled =
                        reconcile_interrupted(ledger.as_ref(), stale_after, |id| dispatcher.is_tracked(id)).await;
                    match reconciled {
                        Ok(0) => {}
                        Ok(n) => tracing::warn!(reconciled = n, "Failed orphaned scans"),
                        Err(e) => tracing::error!(error = %e, "Orphan reconciliation failed"),
                    }
                    if let Err(e) = sweep_pending(ledger.as_ref(), &dispatcher).await {
                        tracing::error!(error = %e, "Pending sweep failed");
                    }
                }
                _ = shutdown.cancelled() => {
                    tracing::info!("Pending sweep shutting down");
                    break;
                }
            }
        }
    })
}
