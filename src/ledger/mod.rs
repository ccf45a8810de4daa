//! Durable scan ledger: scan job rows and their findings.
//!
//! Workers own a job's row while it is InProgress; every conditional write
//! below is guarded by the expected current status so a stale writer can
//! never resurrect or overwrite a terminal row.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::pagination::Pagination;
use crate::models::scan::{NewScanJob, ScanFilters, ScanJob, ScanStats, ScanStatus};
use crate::models::scan_finding::{NewScanFinding, RiskCounts, ScanFinding};

pub use memory::MemoryLedger;
pub use postgres::PgLedger;

/// Outcome of the atomic count-and-insert performed at admission.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Admitted(ScanJob),
    Rejected { active: i64 },
}

/// What the final write of a finished scan did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Findings and counters stored; the scan is Completed.
    Completed,
    /// A cancel request won the race; the scan is Cancelled with no findings.
    Cancelled,
    /// The scan had already left InProgress and nothing was written.
    Skipped,
}

/// Scan ledger storage interface.
#[async_trait]
pub trait ScanLedger: Send + Sync {
    /// Count the owner's Pending/InProgress scans and insert a Pending row if
    /// the count is below `limit`, serialized against concurrent admissions
    /// for the same owner.
    async fn insert_within_quota(
        &self,
        new: &NewScanJob,
        limit: i64,
    ) -> Result<Admission, AppError>;

    async fn get(&self, id: Uuid) -> Result<Option<ScanJob>, AppError>;

    /// An owner's scans, newest first, with the total matching count.
    async fn list(
        &self,
        owner_id: Uuid,
        filters: &ScanFilters,
        pagination: &Pagination,
    ) -> Result<(Vec<ScanJob>, i64), AppError>;

    /// Every scan currently in `status`, oldest first.
    async fn list_by_status(&self, status: ScanStatus) -> Result<Vec<ScanJob>, AppError>;

    /// Move a scan from `from` to `to`. Returns `false` when the row is
    /// missing or no longer in `from`.
    async fn transition(
        &self,
        id: Uuid,
        from: ScanStatus,
        to: ScanStatus,
        error_message: Option<&str>,
    ) -> Result<bool, AppError>;

    async fn set_engine_handle(&self, id: Uuid, handle: &str) -> Result<(), AppError>;

    /// Store progress for an InProgress scan, never lowering the persisted
    /// value. Returns the stored percentage, or `None` if the scan is not
    /// InProgress.
    async fn record_progress(
        &self,
        id: Uuid,
        percent: u8,
        step: &str,
    ) -> Result<Option<i32>, AppError>;

    /// Record a cancel request on an InProgress scan. Returns `false` when
    /// the scan is missing or not InProgress.
    async fn request_cancel(&self, id: Uuid) -> Result<bool, AppError>;

    /// Bulk-insert findings, write aggregate counters and mark the scan
    /// Completed in one transaction.
    ///
    /// Serialized with [`ScanLedger::request_cancel`]: a scan with a
    /// recorded cancel request becomes Cancelled instead and the findings
    /// are discarded.
    async fn complete(
        &self,
        id: Uuid,
        findings: Vec<NewScanFinding>,
        counts: RiskCounts,
    ) -> Result<Completion, AppError>;

    /// Delete a scan and its findings. Refused with `Conflict` while InProgress.
    async fn delete(&self, id: Uuid) -> Result<(), AppError>;

    async fn findings(&self, scan_id: Uuid) -> Result<Vec<ScanFinding>, AppError>;

    async fn stats(&self, owner_id: Uuid) -> Result<ScanStats, AppError>;
}
