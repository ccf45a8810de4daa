//! Scan lifecycle state machine and per-kind phase plans.
//!
//! Ledger status follows `Pending -> InProgress -> {Completed | Failed | Cancelled}`
//! with `Pending -> Cancelled` for scans cancelled before a worker picks them
//! up. `Pending -> Failed` exists for one case only: the dispatcher refused
//! to queue a scan that admission had already written (the pool is shut
//! down), and the row must not count against the owner's quota forever.
//!
//! Phases inside InProgress are only visible as progress and the current
//! step; their weights turn per-phase samples into one percentage.

use serde::Serialize;

use crate::errors::AppError;
use crate::models::scan::{ScanKind, ScanStatus};

/// Error message stored on scans cancelled by their owner.
pub const CANCELLED_BY_CALLER: &str = "cancelled by caller";

/// Check whether a status transition is valid per the state machine graph.
pub fn is_valid_transition(from: ScanStatus, to: ScanStatus) -> bool {
    matches!(
        (from, to),
        (ScanStatus::Pending, ScanStatus::InProgress)
            | (ScanStatus::Pending, ScanStatus::Cancelled)
            | (ScanStatus::Pending, ScanStatus::Failed)
            | (ScanStatus::InProgress, ScanStatus::Completed)
            | (ScanStatus::InProgress, ScanStatus::Failed)
            | (ScanStatus::InProgress, ScanStatus::Cancelled)
    )
}

/// Validate a transition, returning `InvalidTransition` if the edge is absent.
pub fn validate_transition(from: ScanStatus, to: ScanStatus) -> Result<(), AppError> {
    if !is_valid_transition(from, to) {
        return Err(AppError::InvalidTransition(format!(
            "Cannot transition from {from} to {to}"
        )));
    }
    Ok(())
}

/// Statuses from which a caller may cancel.
pub fn is_cancellable(status: ScanStatus) -> bool {
    status.is_active()
}

/// Statuses in which a scan row may be deleted.
pub fn is_deletable(status: ScanStatus) -> bool {
    status != ScanStatus::InProgress
}

/// Engine-side phase of a running scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Phase {
    Discovery,
    SecondaryDiscovery,
    PassiveAnalysis,
    ActiveTesting,
}

impl Phase {
    pub fn is_discovery(&self) -> bool {
        matches!(self, Self::Discovery | Self::SecondaryDiscovery)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Discovery => "Discovery",
            Self::SecondaryDiscovery => "Secondary discovery",
            Self::PassiveAnalysis => "Passive analysis",
            Self::ActiveTesting => "Active testing",
        }
    }
}

/// Ordered phases of a scan kind with their progress weights.
#[derive(Debug, Clone, PartialEq)]
pub struct PhasePlan {
    phases: Vec<(Phase, f64)>,
}

impl PhasePlan {
    /// Phase weights for a scan kind.
    ///
    /// Basic is 40/60 discovery/passive, Full is 20/20/60 with active testing.
    /// The secondary discovery sub-phase shares the discovery band: Full
    /// becomes 15/15/15/55, Basic splits its 40 into 20/20.
    pub fn for_kind(kind: ScanKind, secondary_discovery: bool) -> Self {
        let phases = match (kind, secondary_discovery) {
            (ScanKind::Basic, false) => vec![
                (Phase::Discovery, 0.4),
                (Phase::PassiveAnalysis, 0.6),
            ],
            (ScanKind::Basic, true) => vec![
                (Phase::Discovery, 0.2),
                (Phase::SecondaryDiscovery, 0.2),
                (Phase::PassiveAnalysis, 0.6),
            ],
            (ScanKind::Full, false) => vec![
                (Phase::Discovery, 0.2),
                (Phase::PassiveAnalysis, 0.2),
                (Phase::ActiveTesting, 0.6),
            ],
            (ScanKind::Full, true) => vec![
                (Phase::Discovery, 0.15),
                (Phase::SecondaryDiscovery, 0.15),
                (Phase::PassiveAnalysis, 0.15),
                (Phase::ActiveTesting, 0.55),
            ],
        };
        Self { phases }
    }

    pub fn phases(&self) -> impl Iterator<Item = Phase> + '_ {
        self.phases.iter().map(|(phase, _)| *phase)
    }

    pub fn weight(&self, phase: Phase) -> f64 {
        self.phases
            .iter()
            .find(|(p, _)| *p == phase)
            .map_or(0.0, |(_, w)| *w)
    }

    /// Weighted progress: `round(sum(weight * percent))`, clamped to 0..=100.
    ///
    /// Phases absent from `samples` contribute zero.
    pub fn combined_progress(&self, samples: &[(Phase, u8)]) -> u8 {
        let total: f64 = samples
            .iter()
            .map(|(phase, pct)| self.weight(*phase) * f64::from((*pct).min(100)))
            .sum();
        total.round().clamp(0.0, 100.0) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -- Valid transitions --

    #[test]
    fn pending_to_in_progress() {
        assert!(is_valid_transition(ScanStatus::Pending, ScanStatus::InProgress));
    }

    #[test]
    fn pending_to_cancelled_before_pickup() {
        assert!(is_valid_transition(ScanStatus::Pending, ScanStatus::Cancelled));
    }

    #[test]
    fn pending_to_failed_when_queueing_is_refused() {
        assert!(is_valid_transition(ScanStatus::Pending, ScanStatus::Failed));
    }

    #[test]
    fn in_progress_to_every_terminal() {
        for to in [ScanStatus::Completed, ScanStatus::Failed, ScanStatus::Cancelled] {
            assert!(
                is_valid_transition(ScanStatus::InProgress, to),
                "Expected in_progress -> {to} to be valid"
            );
        }
    }

    // -- Invalid transitions --

    #[test]
    fn terminal_states_are_never_exited() {
        for from in ScanStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in ScanStatus::ALL {
                assert!(
                    !is_valid_transition(from, to),
                    "Expected {from} -> {to} to be invalid"
                );
            }
        }
    }

    #[test]
    fn pending_cannot_complete_directly() {
        assert!(!is_valid_transition(ScanStatus::Pending, ScanStatus::Completed));
    }

    #[test]
    fn in_progress_cannot_regress_to_pending() {
        assert!(!is_valid_transition(ScanStatus::InProgress, ScanStatus::Pending));
    }

    #[test]
    fn validate_transition_reports_edge() {
        let err = validate_transition(ScanStatus::Completed, ScanStatus::InProgress).unwrap_err();
        assert!(err.to_string().contains("completed to in_progress"));
    }

    #[test]
    fn cancel_and_delete_guards() {
        assert!(is_cancellable(ScanStatus::Pending));
        assert!(is_cancellable(ScanStatus::InProgress));
        assert!(!is_cancellable(ScanStatus::Failed));
        assert!(!is_deletable(ScanStatus::InProgress));
        assert!(is_deletable(ScanStatus::Completed));
    }

    // -- Phase plans --

    #[test]
    fn weights_sum_to_one_for_every_plan() {
        for kind in [ScanKind::Basic, ScanKind::Full] {
            for secondary in [false, true] {
                let plan = PhasePlan::for_kind(kind, secondary);
                let sum: f64 = plan.phases().map(|p| plan.weight(p)).sum();
                assert!((sum - 1.0).abs() < 1e-9, "{kind:?}/{secondary}: {sum}");
            }
        }
    }

    #[test]
    fn basic_plan_has_no_active_testing() {
        let plan = PhasePlan::for_kind(ScanKind::Basic, false);
        assert!(!plan.phases().any(|p| p == Phase::ActiveTesting));
        assert_eq!(
            plan.phases().collect::<Vec<_>>(),
            vec![Phase::Discovery, Phase::PassiveAnalysis]
        );
    }

    #[test]
    fn basic_combined_progress() {
        let plan = PhasePlan::for_kind(ScanKind::Basic, false);
        // 0.4 * 50 + 0.6 * 25 = 35
        assert_eq!(
            plan.combined_progress(&[(Phase::Discovery, 50), (Phase::PassiveAnalysis, 25)]),
            35
        );
        assert_eq!(
            plan.combined_progress(&[(Phase::Discovery, 100), (Phase::PassiveAnalysis, 100)]),
            100
        );
    }

    #[test]
    fn full_combined_progress_rounds() {
        let plan = PhasePlan::for_kind(ScanKind::Full, false);
        // 0.2 * 33 + 0.2 * 0 + 0.6 * 1 = 7.2
        assert_eq!(
            plan.combined_progress(&[
                (Phase::Discovery, 33),
                (Phase::PassiveAnalysis, 0),
                (Phase::ActiveTesting, 1),
            ]),
            7
        );
    }

    #[test]
    fn full_with_secondary_uses_shared_discovery_band() {
        let plan = PhasePlan::for_kind(ScanKind::Full, true);
        assert_eq!(plan.weight(Phase::Discovery), 0.15);
        assert_eq!(plan.weight(Phase::SecondaryDiscovery), 0.15);
        assert_eq!(plan.weight(Phase::PassiveAnalysis), 0.15);
        assert_eq!(plan.weight(Phase::ActiveTesting), 0.55);
    }

    #[test]
    fn samples_for_unplanned_phases_are_ignored() {
        let plan = PhasePlan::for_kind(ScanKind::Basic, false);
        assert_eq!(plan.combined_progress(&[(Phase::ActiveTesting, 100)]), 0);
    }
}
