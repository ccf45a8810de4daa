//! Result ingestion: normalize raw engine alerts, map risk, and persist the
//! findings together with the scan's aggregate counters in one write.

use serde_json::Value;
use uuid::Uuid;

use crate::engine::RawFinding;
use crate::errors::AppError;
use crate::ledger::{Completion, ScanLedger};
use crate::models::scan_finding::{NewScanFinding, RiskCounts, RiskLevel};

const UNKNOWN_ALERT: &str = "Unknown Alert";
const UNKNOWN_CONFIDENCE: &str = "Unknown";

/// Summary of an ingestion run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestionSummary {
    pub total: i32,
    pub counts: RiskCounts,
    /// Findings are stored only for [`Completion::Completed`].
    pub completion: Completion,
}

/// Map engine risk to a level.
///
/// Accepts numeric codes (`"3"` / `3` high down to `"0"` informational) and
/// labels. Anything else is treated as informational.
pub fn map_risk(risk: Option<&Value>) -> RiskLevel {
    let label = match risk {
        Some(Value::String(s)) => s.trim().to_ascii_lowercase(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return RiskLevel::Informational,
    };

    match label.as_str() {
        "3" | "high" => RiskLevel::High,
        "2" | "medium" => RiskLevel::Medium,
        "1" | "low" => RiskLevel::Low,
        _ => RiskLevel::Informational,
    }
}

/// Engines report CWE/WASC ids as strings or numbers; `-1`, `0` and blanks
/// mean "none".
fn identifier(value: Option<&Value>) -> Option<String> {
    let raw = match value? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    match raw.as_str() {
        "" | "-1" | "0" => None,
        _ => Some(raw),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

/// Normalize one raw alert into a storable finding.
pub fn normalize(raw: RawFinding) -> NewScanFinding {
    let name = raw.title().unwrap_or(UNKNOWN_ALERT).to_string();
    let risk_level = map_risk(raw.risk.as_ref());

    NewScanFinding {
        name,
        risk_level,
        confidence: non_empty(raw.confidence).unwrap_or_else(|| UNKNOWN_CONFIDENCE.to_string()),
        description: non_empty(raw.description),
        solution: non_empty(raw.solution),
        reference: non_empty(raw.reference),
        cwe_id: identifier(raw.cweid.as_ref()),
        wasc_id: identifier(raw.wascid.as_ref()),
        url: raw.url.unwrap_or_default(),
        method: non_empty(raw.method),
        param: non_empty(raw.param),
        attack: non_empty(raw.attack),
        evidence: non_empty(raw.evidence),
        other_info: non_empty(raw.other),
        tags: raw.tags.filter(|t| !t.is_null()),
    }
}

/// Normalize and persist a completed scan's findings.
///
/// Findings, counters and the Completed transition are written by a single
/// ledger call, so a failure leaves neither findings nor counters behind. A
/// cancel recorded before that write turns it into a Cancelled transition.
pub async fn ingest(
    ledger: &dyn ScanLedger,
    scan_id: Uuid,
    raw: Vec<RawFinding>,
) -> Result<IngestionSummary, AppError> {
    let findings: Vec<NewScanFinding> = raw.into_iter().map(normalize).collect();
    let counts = RiskCounts::tally(&findings);
    let total = counts.total();

    let completion = ledger.complete(scan_id, findings, counts).await?;
    match completion {
        Completion::Completed => tracing::info!(
            scan_id = %scan_id,
            total,
            high = counts.high,
            medium = counts.medium,
            low = counts.low,
            informational = counts.informational,
            "Findings ingested"
        ),
        Completion::Cancelled => {
            tracing::info!(scan_id = %scan_id, discarded = total, "Cancelled during ingestion; findings discarded");
        }
        Completion::Skipped => {
            tracing::warn!(scan_id = %scan_id, "Scan left in_progress before ingestion; findings discarded");
        }
    }

    Ok(IngestionSummary {
        total,
        counts,
        completion,
    })
}
