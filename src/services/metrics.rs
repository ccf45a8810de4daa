//! Process-wide scan counters with a Prometheus text rendering.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::models::scan_finding::RiskCounts;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScanMetricsSnapshot {
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Wall time summed over every finished run, whatever its outcome.
    pub duration_ms_total: u64,
    pub alerts_high: u64,
    pub alerts_medium: u64,
    pub alerts_low: u64,
    pub alerts_informational: u64,
}

impl ScanMetricsSnapshot {
    pub fn finished(&self) -> u64 {
        self.completed + self.failed + self.cancelled
    }

    pub fn total_alerts(&self) -> u64 {
        self.alerts_high + self.alerts_medium + self.alerts_low + self.alerts_informational
    }

    /// Completed share of finished runs, 0.0 before anything finished.
    pub fn success_rate(&self) -> f64 {
        match self.finished() {
            0 => 0.0,
            n => self.completed as f64 / n as f64,
        }
    }

    pub fn avg_duration_secs(&self) -> f64 {
        match self.finished() {
            0 => 0.0,
            n => self.duration_ms_total as f64 / n as f64 / 1000.0,
        }
    }

    /// Prometheus text exposition of the snapshot.
    pub fn prometheus(&self) -> String {
        let gauges: [(&str, &str, &str, String); 8] = [
            ("scan_active_total", "gauge", "Scans currently running", self.active.to_string()),
            ("scan_completed_total", "counter", "Scans completed", self.completed.to_string()),
            ("scan_failed_total", "counter", "Scans failed", self.failed.to_string()),
            ("scan_cancelled_total", "counter", "Scans cancelled", self.cancelled.to_string()),
            (
                "scan_duration_seconds_avg",
                "gauge",
                "Average scan duration",
                format!("{:.3}", self.avg_duration_secs()),
            ),
            ("scan_alerts_total", "counter", "Alerts stored by completed scans", self.total_alerts().to_string()),
            ("scan_alerts_high_risk", "counter", "High risk alerts stored", self.alerts_high.to_string()),
            (
                "scan_success_rate",
                "gauge",
                "Completed share of finished scans",
                format!("{:.4}", self.success_rate()),
            ),
        ];

        let mut out = String::new();
        for (name, kind, help, value) in gauges {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} {kind}");
            let _ = writeln!(out, "{name} {value}");
        }
        out
    }
}

#[derive(Debug, Default)]
pub struct ScanMetrics {
    active: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    duration_ms_total: AtomicU64,
    alerts_high: AtomicU64,
    alerts_medium: AtomicU64,
    alerts_low: AtomicU64,
    alerts_informational: AtomicU64,
}

impl ScanMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_started(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_completed(&self, elapsed: Duration, counts: RiskCounts) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.alerts_high
            .fetch_add(counts.high.max(0) as u64, Ordering::Relaxed);
        self.alerts_medium
            .fetch_add(counts.medium.max(0) as u64, Ordering::Relaxed);
        self.alerts_low
            .fetch_add(counts.low.max(0) as u64, Ordering::Relaxed);
        self.alerts_informational
            .fetch_add(counts.informational.max(0) as u64, Ordering::Relaxed);
        self.on_finished(elapsed);
    }

    pub fn on_failed(&self, elapsed: Duration) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.on_finished(elapsed);
    }

    pub fn on_cancelled(&self, elapsed: Duration) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
        self.on_finished(elapsed);
    }

    /// A started run that ended without a terminal write of its own.
    pub fn on_abandoned(&self) {
        self.leave_active();
    }

    fn on_finished(&self, elapsed: Duration) {
        let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.duration_ms_total.fetch_add(ms, Ordering::Relaxed);
        self.leave_active();
    }

    fn leave_active(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
    }

    pub fn snapshot(&self) -> ScanMetricsSnapshot {
        ScanMetricsSnapshot {
            active: self.active.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            duration_ms_total: self.duration_ms_total.load(Ordering::Relaxed),
            alerts_high: self.alerts_high.load(Ordering::Relaxed),
            alerts_medium: self.alerts_medium.load(Ordering::Relaxed),
            alerts_low: self.alerts_low.load(Ordering::Relaxed),
            alerts_informational: self.alerts_informational.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_snapshot_has_zero_rates() {
        let snapshot = ScanMetrics::new().snapshot();
        assert_eq!(snapshot, ScanMetricsSnapshot::default());
        assert_eq!(snapshot.success_rate(), 0.0);
        assert_eq!(snapshot.avg_duration_secs(), 0.0);
    }

    #[test]
    fn outcomes_feed_rates_and_alert_totals() {
        let metrics = ScanMetrics::new();
        for _ in 0..4 {
            metrics.on_started();
        }
        metrics.on_completed(
            Duration::from_secs(30),
            RiskCounts {
                high: 2,
                medium: 1,
                low: 0,
                informational: 3,
            },
        );
        metrics.on_failed(Duration::from_secs(10));
        metrics.on_cancelled(Duration::from_secs(20));

        let s = metrics.snapshot();
        assert_eq!(s.active, 1);
        assert_eq!((s.completed, s.failed, s.cancelled), (1, 1, 1));
        assert_eq!(s.total_alerts(), 6);
        assert_eq!(s.alerts_high, 2);
        assert!((s.success_rate() - 1.0 / 3.0).abs() < 1e-9);
        assert!((s.avg_duration_secs() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn active_never_underflows() {
        let metrics = ScanMetrics::new();
        metrics.on_abandoned();
        metrics.on_failed(Duration::ZERO);
        assert_eq!(metrics.snapshot().active, 0);
    }

    #[test]
    fn prometheus_text_lists_every_series() {
        let metrics = ScanMetrics::new();
        metrics.on_started();
        metrics.on_started();
        metrics.on_completed(
            Duration::from_millis(1500),
            RiskCounts {
                high: 1,
                ..Default::default()
            },
        );

        let text = metrics.snapshot().prometheus();
        assert!(text.contains("# TYPE scan_active_total gauge\nscan_active_total 1\n"));
        assert!(text.contains("scan_completed_total 1\n"));
        assert!(text.contains("scan_duration_seconds_avg 1.500\n"));
        assert!(text.contains("scan_alerts_total 1\n"));
        assert!(text.contains("scan_alerts_high_risk 1\n"));
        assert!(text.contains("scan_success_rate 1.0000\n"));
    }
}
