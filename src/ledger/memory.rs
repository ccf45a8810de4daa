//! In-process ledger used by tests and local dry runs.
//!
//! A single async mutex serializes every operation, which gives the same
//! atomicity the Postgres ledger gets from transactions.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{Admission, Completion, ScanLedger};
use crate::errors::AppError;
use crate::models::pagination::Pagination;
use crate::models::scan::{NewScanJob, ScanFilters, ScanJob, ScanStats, ScanStatus};
use crate::models::scan_finding::{NewScanFinding, RiskCounts, ScanFinding};
use crate::services::lifecycle;

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<Uuid, ScanJob>,
    findings: HashMap<Uuid, Vec<ScanFinding>>,
    transitions: HashMap<Uuid, Vec<(ScanStatus, ScanStatus)>>,
    progress_samples: HashMap<Uuid, Vec<i32>>,
}

#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<MemoryState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Status edges applied to a scan, in order.
    pub async fn transitions(&self, id: Uuid) -> Vec<(ScanStatus, ScanStatus)> {
        let state = self.state.lock().await;
        state.transitions.get(&id).cloned().unwrap_or_default()
    }

    /// Every persisted progress value for a scan, in write order.
    pub async fn progress_samples(&self, id: Uuid) -> Vec<i32> {
        let state = self.state.lock().await;
        state.progress_samples.get(&id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl ScanLedger for MemoryLedger {
    async fn insert_within_quota(
        &self,
        new: &NewScanJob,
        limit: i64,
    ) -> Result<Admission, AppError> {
        let mut state = self.state.lock().await;
        let active = state
            .jobs
            .values()
            .filter(|j| j.owner_id == new.owner_id && j.status.is_active())
            .count() as i64;
        if active >= limit {
            return Ok(Admission::Rejected { active });
        }
        let job = ScanJob::pending(new, Utc::now());
        state.jobs.insert(job.id, job.clone());
        Ok(Admission::Admitted(job))
    }

    async fn get(&self, id: Uuid) -> Result<Option<ScanJob>, AppError> {
        Ok(self.state.lock().await.jobs.get(&id).cloned())
    }

    async fn list(
        &self,
        owner_id: Uuid,
        filters: &ScanFilters,
        pagination: &Pagination,
    ) -> Result<(Vec<ScanJob>, i64), AppError> {
        let state = self.state.lock().await;
        let mut matching: Vec<ScanJob> = state
            .jobs
            .values()
            .filter(|j| j.owner_id == owner_id)
            .filter(|j| filters.status.map_or(true, |s| j.status == s))
            .filter(|j| filters.kind.map_or(true, |k| j.kind == k))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        let total = matching.len() as i64;
        let items = matching
            .into_iter()
            .skip(pagination.offset() as usize)
            .take(pagination.limit() as usize)
            .collect();
        Ok((items, total))
    }

    async fn list_by_status(&self, status: ScanStatus) -> Result<Vec<ScanJob>, AppError> {
        let state = self.state.lock().await;
        let mut jobs: Vec<ScanJob> = state
            .jobs
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    async fn transition(
        &self,
        id: Uuid,
        from: ScanStatus,
        to: ScanStatus,
        error_message: Option<&str>,
    ) -> Result<bool, AppError> {
        lifecycle::validate_transition(from, to)?;
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.status != from {
            return Ok(false);
        }
        let now = Utc::now();
        job.status = to;
        job.updated_at = now;
        if to == ScanStatus::InProgress {
            job.started_at = Some(now);
        }
        if to.is_terminal() {
            job.completed_at = Some(now);
            job.error_message = error_message.map(str::to_string);
        }
        state.transitions.entry(id).or_default().push((from, to));
        Ok(true)
    }

    async fn set_engine_handle(&self, id: Uuid, handle: &str) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound("Scan not found".to_string()))?;
        job.engine_handle = Some(handle.to_string());
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn record_progress(
        &self,
        id: Uuid,
        percent: u8,
        step: &str,
    ) -> Result<Option<i32>, AppError> {
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        if job.status != ScanStatus::InProgress {
            return Ok(None);
        }
        job.progress = job.progress.max(i32::from(percent.min(100)));
        job.current_step = Some(step.to_string());
        job.updated_at = Utc::now();
        let stored = job.progress;
        state.progress_samples.entry(id).or_default().push(stored);
        Ok(Some(stored))
    }

    async fn request_cancel(&self, id: Uuid) -> Result<bool, AppError> {
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.status != ScanStatus::InProgress {
            return Ok(false);
        }
        let now = Utc::now();
        job.cancel_requested_at.get_or_insert(now);
        job.updated_at = now;
        Ok(true)
    }

    async fn complete(
        &self,
        id: Uuid,
        findings: Vec<NewScanFinding>,
        counts: RiskCounts,
    ) -> Result<Completion, AppError> {
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(Completion::Skipped);
        };
        if job.status != ScanStatus::InProgress {
            return Ok(Completion::Skipped);
        }
        let now = Utc::now();
        job.completed_at = Some(now);
        job.updated_at = now;

        if job.cancel_requested_at.is_some() {
            job.status = ScanStatus::Cancelled;
            job.error_message = Some(lifecycle::CANCELLED_BY_CALLER.to_string());
            state
                .transitions
                .entry(id)
                .or_default()
                .push((ScanStatus::InProgress, ScanStatus::Cancelled));
            return Ok(Completion::Cancelled);
        }

        job.total_findings = findings.len() as i32;
        job.high_count = counts.high;
        job.medium_count = counts.medium;
        job.low_count = counts.low;
        job.info_count = counts.informational;
        job.status = ScanStatus::Completed;
        job.progress = 100;
        job.current_step = Some("Completed".to_string());

        let rows = findings.into_iter().map(|f| f.into_row(id, now)).collect();
        state.findings.insert(id, rows);
        state
            .transitions
            .entry(id)
            .or_default()
            .push((ScanStatus::InProgress, ScanStatus::Completed));
        Ok(Completion::Completed)
    }

    async fn delete(&self, id: Uuid) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        let status = state
            .jobs
            .get(&id)
            .map(|j| j.status)
            .ok_or_else(|| AppError::NotFound("Scan not found".to_string()))?;
        if !lifecycle::is_deletable(status) {
            return Err(AppError::Conflict(
                "Cannot delete scan in progress. Cancel it first".to_string(),
            ));
        }
        state.jobs.remove(&id);
        state.findings.remove(&id);
        state.transitions.remove(&id);
        state.progress_samples.remove(&id);
        Ok(())
    }

    async fn findings(&self, scan_id: Uuid) -> Result<Vec<ScanFinding>, AppError> {
        let state = self.state.lock().await;
        Ok(state.findings.get(&scan_id).cloned().unwrap_or_default())
    }

    async fn stats(&self, owner_id: Uuid) -> Result<ScanStats, AppError> {
        let state = self.state.lock().await;
        let mut stats = ScanStats::default();
        for job in state.jobs.values().filter(|j| j.owner_id == owner_id) {
            stats.total_scans += 1;
            match job.status {
                ScanStatus::Pending => stats.pending_scans += 1,
                ScanStatus::InProgress => stats.in_progress_scans += 1,
                ScanStatus::Completed => {
                    stats.completed_scans += 1;
                    stats.total_findings += i64::from(job.total_findings);
                    stats.high_risk_findings += i64::from(job.high_count);
                    stats.medium_risk_findings += i64::from(job.medium_count);
                    stats.low_risk_findings += i64::from(job.low_count);
                    stats.info_findings += i64::from(job.info_count);
                }
                ScanStatus::Failed => stats.failed_scans += 1,
                ScanStatus::Cancelled => stats.cancelled_scans += 1,
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::scan::ScanKind;

    fn new_job(owner: Uuid) -> NewScanJob {
        NewScanJob {
            owner_id: owner,
            target_url: "https://example.com".to_string(),
            kind: ScanKind::Basic,
            config: serde_json::json!({}),
        }
    }

    async fn admitted(ledger: &MemoryLedger, owner: Uuid) -> ScanJob {
        match ledger.insert_within_quota(&new_job(owner), 5).await.unwrap() {
            Admission::Admitted(job) => job,
            other => panic!("expected admission, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn transition_sets_timestamps() {
        let ledger = MemoryLedger::new();
        let job = admitted(&ledger, Uuid::new_v4()).await;

        assert!(ledger
            .transition(job.id, ScanStatus::Pending, ScanStatus::InProgress, None)
            .await
            .unwrap());
        let started = ledger.get(job.id).await.unwrap().unwrap();
        assert!(started.started_at.is_some());
        assert!(started.completed_at.is_none());

        assert!(ledger
            .transition(job.id, ScanStatus::InProgress, ScanStatus::Failed, Some("boom"))
            .await
            .unwrap());
        let failed = ledger.get(job.id).await.unwrap().unwrap();
        assert!(failed.completed_at.is_some());
        assert_eq!(failed.error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn stale_transition_is_refused() {
        let ledger = MemoryLedger::new();
        let job = admitted(&ledger, Uuid::new_v4()).await;
        ledger
            .transition(job.id, ScanStatus::Pending, ScanStatus::Cancelled, Some("cancelled by caller"))
            .await
            .unwrap();

        let moved = ledger
            .transition(job.id, ScanStatus::Pending, ScanStatus::InProgress, None)
            .await
            .unwrap();
        assert!(!moved);
        assert_eq!(
            ledger.get(job.id).await.unwrap().unwrap().status,
            ScanStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn invalid_edge_is_an_error() {
        let ledger = MemoryLedger::new();
        let job = admitted(&ledger, Uuid::new_v4()).await;
        let result = ledger
            .transition(job.id, ScanStatus::Completed, ScanStatus::InProgress, None)
            .await;
        assert!(matches!(result, Err(AppError::InvalidTransition(_))));
    }

    #[tokio::test]
    async fn progress_never_regresses() {
        let ledger = MemoryLedger::new();
        let job = admitted(&ledger, Uuid::new_v4()).await;
        ledger
            .transition(job.id, ScanStatus::Pending, ScanStatus::InProgress, None)
            .await
            .unwrap();

        assert_eq!(ledger.record_progress(job.id, 40, "Discovery").await.unwrap(), Some(40));
        assert_eq!(ledger.record_progress(job.id, 25, "Discovery").await.unwrap(), Some(40));
        assert_eq!(ledger.progress_samples(job.id).await, vec![40, 40]);
    }

    #[tokio::test]
    async fn progress_ignored_outside_in_progress() {
        let ledger = MemoryLedger::new();
        let job = admitted(&ledger, Uuid::new_v4()).await;
        assert_eq!(ledger.record_progress(job.id, 10, "Discovery").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_refused_while_in_progress() {
        let ledger = MemoryLedger::new();
        let job = admitted(&ledger, Uuid::new_v4()).await;
        ledger
            .transition(job.id, ScanStatus::Pending, ScanStatus::InProgress, None)
            .await
            .unwrap();
        assert!(matches!(ledger.delete(job.id).await, Err(AppError::Conflict(_))));

        ledger
            .transition(job.id, ScanStatus::InProgress, ScanStatus::Failed, Some("x"))
            .await
            .unwrap();
        ledger.delete(job.id).await.unwrap();
        assert!(ledger.get(job.id).await.unwrap().is_none());
        assert!(matches!(ledger.delete(job.id).await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn quota_rejects_at_limit() {
        let ledger = MemoryLedger::new();
        let owner = Uuid::new_v4();
        for _ in 0..5 {
            admitted(&ledger, owner).await;
        }
        let result = ledger.insert_within_quota(&new_job(owner), 5).await.unwrap();
        assert_eq!(result, Admission::Rejected { active: 5 });
        assert_eq!(ledger.stats(owner).await.unwrap().pending_scans, 5);
    }

    #[tokio::test]
    async fn delete_drops_recorded_history() {
        let ledger = MemoryLedger::new();
        let job = admitted(&ledger, Uuid::new_v4()).await;
        ledger
            .transition(job.id, ScanStatus::Pending, ScanStatus::InProgress, None)
            .await
            .unwrap();
        ledger.record_progress(job.id, 30, "Discovery: 75%").await.unwrap();
        ledger
            .transition(job.id, ScanStatus::InProgress, ScanStatus::Failed, Some("boom"))
            .await
            .unwrap();

        ledger.delete(job.id).await.unwrap();
        assert!(ledger.transitions(job.id).await.is_empty());
        assert!(ledger.progress_samples(job.id).await.is_empty());
        assert!(ledger.state.lock().await.findings.is_empty());
    }

    #[tokio::test]
    async fn cancel_request_needs_a_running_scan() {
        let ledger = MemoryLedger::new();
        let job = admitted(&ledger, Uuid::new_v4()).await;
        assert!(!ledger.request_cancel(job.id).await.unwrap());
        assert!(!ledger.request_cancel(Uuid::new_v4()).await.unwrap());

        ledger
            .transition(job.id, ScanStatus::Pending, ScanStatus::InProgress, None)
            .await
            .unwrap();
        assert!(ledger.request_cancel(job.id).await.unwrap());
        let first = ledger.get(job.id).await.unwrap().unwrap().cancel_requested_at;
        assert!(first.is_some());

        // Repeated requests keep the original timestamp.
        assert!(ledger.request_cancel(job.id).await.unwrap());
        assert_eq!(ledger.get(job.id).await.unwrap().unwrap().cancel_requested_at, first);
    }

    #[tokio::test]
    async fn complete_honors_a_recorded_cancel() {
        let ledger = MemoryLedger::new();
        let job = admitted(&ledger, Uuid::new_v4()).await;
        ledger
            .transition(job.id, ScanStatus::Pending, ScanStatus::InProgress, None)
            .await
            .unwrap();
        ledger.request_cancel(job.id).await.unwrap();

        let finding = crate::services::ingestion::normalize(crate::engine::RawFinding {
            alert: Some("XSS".to_string()),
            risk: Some(serde_json::json!("3")),
            ..Default::default()
        });
        let counts = RiskCounts {
            high: 1,
            ..Default::default()
        };
        let completion = ledger.complete(job.id, vec![finding], counts).await.unwrap();
        assert_eq!(completion, Completion::Cancelled);

        let stored = ledger.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ScanStatus::Cancelled);
        assert_eq!(stored.error_message.as_deref(), Some(lifecycle::CANCELLED_BY_CALLER));
        assert_eq!(stored.total_findings, 0);
        assert!(ledger.findings(job.id).await.unwrap().is_empty());

        let again = ledger.complete(job.id, vec![], RiskCounts::default()).await.unwrap();
        assert_eq!(again, Completion::Skipped);
    }
}
