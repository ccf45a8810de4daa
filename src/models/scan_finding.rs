//! Normalized scan findings and risk aggregation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "risk_level", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    High,
    Medium,
    Low,
    Informational,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Informational => "informational",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct ScanFinding {
    pub id: Uuid,
    pub scan_id: Uuid,
    pub name: String,
    pub risk_level: RiskLevel,
    pub confidence: String,
    pub description: Option<String>,
    pub solution: Option<String>,
    pub reference: Option<String>,
    pub cwe_id: Option<String>,
    pub wasc_id: Option<String>,
    pub url: String,
    pub method: Option<String>,
    pub param: Option<String>,
    pub attack: Option<String>,
    pub evidence: Option<String>,
    pub other_info: Option<String>,
    pub tags: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Finding normalized from engine output, not yet persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewScanFinding {
    pub name: String,
    pub risk_level: RiskLevel,
    pub confidence: String,
    pub description: Option<String>,
    pub solution: Option<String>,
    pub reference: Option<String>,
    pub cwe_id: Option<String>,
    pub wasc_id: Option<String>,
    pub url: String,
    pub method: Option<String>,
    pub param: Option<String>,
    pub attack: Option<String>,
    pub evidence: Option<String>,
    pub other_info: Option<String>,
    pub tags: Option<serde_json::Value>,
}

impl NewScanFinding {
    /// Materialize the persisted row for a scan.
    pub fn into_row(self, scan_id: Uuid, created_at: DateTime<Utc>) -> ScanFinding {
        ScanFinding {
            id: Uuid::now_v7(),
            scan_id,
            name: self.name,
            risk_level: self.risk_level,
            confidence: self.confidence,
            description: self.description,
            solution: self.solution,
            reference: self.reference,
            cwe_id: self.cwe_id,
            wasc_id: self.wasc_id,
            url: self.url,
            method: self.method,
            param: self.param,
            attack: self.attack,
            evidence: self.evidence,
            other_info: self.other_info,
            tags: self.tags,
            created_at,
        }
    }
}

/// Finding counts per risk level.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RiskCounts {
    pub high: i32,
    pub medium: i32,
    pub low: i32,
    pub informational: i32,
}

impl RiskCounts {
    pub fn record(&mut self, level: RiskLevel) {
        match level {
            RiskLevel::High => self.high += 1,
            RiskLevel::Medium => self.medium += 1,
            RiskLevel::Low => self.low += 1,
            RiskLevel::Informational => self.informational += 1,
        }
    }

    pub fn total(&self) -> i32 {
        self.high + self.medium + self.low + self.informational
    }

    pub fn tally<'a>(findings: impl IntoIterator<Item = &'a NewScanFinding>) -> Self {
        let mut counts = Self::default();
        for finding in findings {
            counts.record(finding.risk_level);
        }
        counts
    }
}
