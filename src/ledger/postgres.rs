//! PostgreSQL-backed scan ledger.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{Admission, Completion, ScanLedger};
use crate::errors::AppError;
use crate::models::pagination::Pagination;
use crate::models::scan::{NewScanJob, ScanFilters, ScanJob, ScanStats, ScanStatus};
use crate::models::scan_finding::{NewScanFinding, RiskCounts, ScanFinding};
use crate::services::lifecycle;

const SCAN_COLUMNS: &str = "id, owner_id, target_url, kind, status, config, progress, \
     current_step, total_findings, high_count, medium_count, low_count, info_count, \
     error_message, engine_handle, cancel_requested_at, created_at, started_at, completed_at, updated_at";

#[derive(Debug, Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Serialize admissions for one owner until the transaction ends.
    async fn lock_owner(tx: &mut Transaction<'_, Postgres>, owner_id: Uuid) -> Result<(), AppError> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1::text, 0))")
            .bind(owner_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn insert_findings(
        tx: &mut Transaction<'_, Postgres>,
        scan_id: Uuid,
        findings: &[NewScanFinding],
    ) -> Result<u64, AppError> {
        if findings.is_empty() {
            return Ok(0);
        }

        let mut ids = Vec::with_capacity(findings.len());
        let mut names = Vec::with_capacity(findings.len());
        let mut risks = Vec::with_capacity(findings.len());
        let mut confidences = Vec::with_capacity(findings.len());
        let mut descriptions = Vec::with_capacity(findings.len());
        let mut solutions = Vec::with_capacity(findings.len());
        let mut references = Vec::with_capacity(findings.len());
        let mut cwe_ids = Vec::with_capacity(findings.len());
        let mut wasc_ids = Vec::with_capacity(findings.len());
        let mut urls = Vec::with_capacity(findings.len());
        let mut methods = Vec::with_capacity(findings.len());
        let mut params = Vec::with_capacity(findings.len());
        let mut attacks = Vec::with_capacity(findings.len());
        let mut evidences = Vec::with_capacity(findings.len());
        let mut other_infos = Vec::with_capacity(findings.len());
        let mut tags = Vec::with_capacity(findings.len());

        for f in findings {
            ids.push(Uuid::now_v7());
            names.push(f.name.clone());
            risks.push(f.risk_level.as_str().to_string());
            confidences.push(f.confidence.clone());
            descriptions.push(f.description.clone());
            solutions.push(f.solution.clone());
            references.push(f.reference.clone());
            cwe_ids.push(f.cwe_id.clone());
            wasc_ids.push(f.wasc_id.clone());
            urls.push(f.url.clone());
            methods.push(f.method.clone());
            params.push(f.param.clone());
            attacks.push(f.attack.clone());
            evidences.push(f.evidence.clone());
            other_infos.push(f.other_info.clone());
            tags.push(f.tags.clone());
        }

        let result = sqlx::query(
            r#"
            INSERT INTO scan_findings (
                id, scan_id, name, risk_level, confidence,
                description, solution, reference, cwe_id, wasc_id,
                url, method, param, attack, evidence, other_info, tags
            )
            SELECT u.id, $1, u.name, u.risk::risk_level, u.confidence,
                   u.description, u.solution, u.reference, u.cwe_id, u.wasc_id,
                   u.url, u.method, u.param, u.attack, u.evidence, u.other_info, u.tags
            FROM UNNEST(
                $2::uuid[], $3::text[], $4::text[], $5::text[],
                $6::text[], $7::text[], $8::text[], $9::text[], $10::text[],
                $11::text[], $12::text[], $13::text[], $14::text[], $15::text[],
                $16::text[], $17::jsonb[]
            ) AS u(
                id, name, risk, confidence,
                description, solution, reference, cwe_id, wasc_id,
                url, method, param, attack, evidence, other_info, tags
            )
            "#,
        )
        .bind(scan_id)
        .bind(&ids)
        .bind(&names)
        .bind(&risks)
        .bind(&confidences)
        .bind(&descriptions)
        .bind(&solutions)
        .bind(&references)
        .bind(&cwe_ids)
        .bind(&wasc_ids)
        .bind(&urls)
        .bind(&methods)
        .bind(&params)
        .bind(&attacks)
        .bind(&evidences)
        .bind(&other_infos)
        .bind(&tags)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ScanLedger for PgLedger {
    async fn insert_within_quota(
        &self,
        new: &NewScanJob,
        limit: i64,
    ) -> Result<Admission, AppError> {
        let mut tx = self.pool.begin().await?;
        Self::lock_owner(&mut tx, new.owner_id).await?;

        let active = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM scan_jobs WHERE owner_id = $1 AND status IN ('pending', 'in_progress')",
        )
        .bind(new.owner_id)
        .fetch_one(&mut *tx)
        .await?;

        if active >= limit {
            tx.rollback().await?;
            return Ok(Admission::Rejected { active });
        }

        let job = ScanJob::pending(new, chrono::Utc::now());
        let job = sqlx::query_as::<_, ScanJob>(&format!(
            r#"
            INSERT INTO scan_jobs (id, owner_id, target_url, kind, status, config, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            RETURNING {SCAN_COLUMNS}
            "#
        ))
        .bind(job.id)
        .bind(job.owner_id)
        .bind(&job.target_url)
        .bind(job.kind)
        .bind(job.status)
        .bind(&job.config)
        .bind(job.created_at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Admission::Admitted(job))
    }

    async fn get(&self, id: Uuid) -> Result<Option<ScanJob>, AppError> {
        let job = sqlx::query_as::<_, ScanJob>(&format!(
            "SELECT {SCAN_COLUMNS} FROM scan_jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    async fn list(
        &self,
        owner_id: Uuid,
        filters: &ScanFilters,
        pagination: &Pagination,
    ) -> Result<(Vec<ScanJob>, i64), AppError> {
        let mut conditions: Vec<String> = vec!["owner_id = $1".to_string()];
        let mut param_index = 1u32;

        if filters.status.is_some() {
            param_index += 1;
            conditions.push(format!("status = ${param_index}"));
        }
        if filters.kind.is_some() {
            param_index += 1;
            conditions.push(format!("kind = ${param_index}"));
        }

        let where_clause = format!("WHERE {}", conditions.join(" AND "));
        let count_sql = format!("SELECT COUNT(*) FROM scan_jobs {where_clause}");
        let data_sql = format!(
            "SELECT {SCAN_COLUMNS} FROM scan_jobs {where_clause} \
             ORDER BY created_at DESC, id DESC \
             LIMIT {} OFFSET {}",
            pagination.limit(),
            pagination.offset()
        );

        let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql).bind(owner_id);
        let mut data_query = sqlx::query_as::<_, ScanJob>(&data_sql).bind(owner_id);

        macro_rules! bind_both {
            ($val:expr) => {
                count_query = count_query.bind($val);
                data_query = data_query.bind($val);
            };
        }

        if let Some(status) = filters.status {
            bind_both!(status);
        }
        if let Some(kind) = filters.kind {
            bind_both!(kind);
        }

        let total = count_query.fetch_one(&self.pool).await?;
        let items = data_query.fetch_all(&self.pool).await?;
        Ok((items, total))
    }

    async fn list_by_status(&self, status: ScanStatus) -> Result<Vec<ScanJob>, AppError> {
        let jobs = sqlx::query_as::<_, ScanJob>(&format!(
            "SELECT {SCAN_COLUMNS} FROM scan_jobs WHERE status = $1 ORDER BY created_at, id"
        ))
        .bind(status)
        .fetch_all(&self.pool)
        .await?;
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

        let result = sqlx::query(
            r#"
            UPDATE scan_jobs
            SET status = $3,
                started_at = CASE WHEN $3 = 'in_progress'::scan_status THEN NOW() ELSE started_at END,
                completed_at = CASE WHEN $4 THEN NOW() ELSE completed_at END,
                error_message = CASE WHEN $4 THEN $5 ELSE error_message END,
                updated_at = NOW()
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(from)
        .bind(to)
        .bind(to.is_terminal())
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn set_engine_handle(&self, id: Uuid, handle: &str) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE scan_jobs SET engine_handle = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(handle)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound("Scan not found".to_string()));
        }
        Ok(())
    }

    async fn record_progress(
        &self,
        id: Uuid,
        percent: u8,
        step: &str,
    ) -> Result<Option<i32>, AppError> {
        let stored = sqlx::query_scalar::<_, i32>(
            r#"
            UPDATE scan_jobs
            SET progress = GREATEST(progress, $2), current_step = $3, updated_at = NOW()
            WHERE id = $1 AND status = 'in_progress'
            RETURNING progress
            "#,
        )
        .bind(id)
        .bind(i32::from(percent.min(100)))
        .bind(step)
        .fetch_optional(&self.pool)
        .await?;
        Ok(stored)
    }

    async fn request_cancel(&self, id: Uuid) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE scan_jobs
            SET cancel_requested_at = COALESCE(cancel_requested_at, NOW()), updated_at = NOW()
            WHERE id = $1 AND status = 'in_progress'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn complete(
        &self,
        id: Uuid,
        findings: Vec<NewScanFinding>,
        counts: RiskCounts,
    ) -> Result<Completion, AppError> {
        let mut tx = self.pool.begin().await?;

        // The row lock orders this write against `request_cancel`.
        let row = sqlx::query_as::<_, (ScanStatus, Option<DateTime<Utc>>)>(
            "SELECT status, cancel_requested_at FROM scan_jobs WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        match row {
            Some((ScanStatus::InProgress, None)) => {}
            Some((ScanStatus::InProgress, Some(_))) => {
                sqlx::query(
                    r#"
                    UPDATE scan_jobs
                    SET status = 'cancelled', error_message = $2,
                        completed_at = NOW(), updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(lifecycle::CANCELLED_BY_CALLER)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                return Ok(Completion::Cancelled);
            }
            _ => {
                tx.rollback().await?;
                return Ok(Completion::Skipped);
            }
        }

        let inserted = Self::insert_findings(&mut tx, id, &findings).await?;
        tracing::debug!(scan_id = %id, inserted, "Bulk inserted scan findings");

        sqlx::query(
            r#"
            UPDATE scan_jobs
            SET total_findings = $2, high_count = $3, medium_count = $4,
                low_count = $5, info_count = $6,
                status = 'completed', progress = 100, current_step = 'Completed',
                completed_at = NOW(), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(findings.len() as i32)
        .bind(counts.high)
        .bind(counts.medium)
        .bind(counts.low)
        .bind(counts.informational)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Completion::Completed)
    }

    async fn delete(&self, id: Uuid) -> Result<(), AppError> {
        let deleted = sqlx::query_scalar::<_, Uuid>(
            "DELETE FROM scan_jobs WHERE id = $1 AND status <> 'in_progress' RETURNING id",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        if deleted.is_some() {
            return Ok(());
        }

        match self.get(id).await? {
            Some(_) => Err(AppError::Conflict(
                "Cannot delete scan in progress. Cancel it first".to_string(),
            )),
            None => Err(AppError::NotFound("Scan not found".to_string())),
        }
    }

    async fn findings(&self, scan_id: Uuid) -> Result<Vec<ScanFinding>, AppError> {
        let findings = sqlx::query_as::<_, ScanFinding>(
            r#"
            SELECT id, scan_id, name, risk_level, confidence, description, solution,
                   reference, cwe_id, wasc_id, url, method, param, attack, evidence,
                   other_info, tags, created_at
            FROM scan_findings
            WHERE scan_id = $1
            ORDER BY risk_level, name, id
            "#,
        )
        .bind(scan_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(findings)
    }

    async fn stats(&self, owner_id: Uuid) -> Result<ScanStats, AppError> {
        let row = sqlx::query_as::<_, (i64, i64, i64, i64, i64, i64, i64, i64, i64, i64, i64)>(
            r#"
            SELECT
                COUNT(*),
                COUNT(*) FILTER (WHERE status = 'pending'),
                COUNT(*) FILTER (WHERE status = 'in_progress'),
                COUNT(*) FILTER (WHERE status = 'completed'),
                COUNT(*) FILTER (WHERE status = 'failed'),
                COUNT(*) FILTER (WHERE status = 'cancelled'),
                COALESCE(SUM(total_findings) FILTER (WHERE status = 'completed'), 0)::BIGINT,
                COALESCE(SUM(high_count) FILTER (WHERE status = 'completed'), 0)::BIGINT,
                COALESCE(SUM(medium_count) FILTER (WHERE status = 'completed'), 0)::BIGINT,
                COALESCE(SUM(low_count) FILTER (WHERE status = 'completed'), 0)::BIGINT,
                COALESCE(SUM(info_count) FILTER (WHERE status = 'completed'), 0)::BIGINT
            FROM scan_jobs
            WHERE owner_id = $1
            "#,
        )
        .bind(owner_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(ScanStats {
            total_scans: row.0,
            pending_scans: row.1,
            in_progress_scans: row.2,
            completed_scans: row.3,
            failed_scans: row.4,
            cancelled_scans: row.5,
            total_findings: row.6,
            high_risk_findings: row.7,
            medium_risk_findings: row.8,
            low_risk_findings: row.9,
            info_findings: row.10,
        })
    }
}
