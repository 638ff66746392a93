// =============================================================================
// Startup State Machine — phase transitions + timeouts (C7)
// =============================================================================
//
// Observes (and, in ACTIVE mode, drives) one BrowserInstance from REGISTERED
// through READY. Transitions are monotonic: the only way back to an earlier
// phase is the discrete restart action, which destroys the instance and
// starts a new one at REGISTERED.
// =============================================================================

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::FleetError;
use crate::types::StartupMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Phase {
    Registered,
    Launching,
    Connecting,
    LoadingPage,
    Authenticating,
    Ready,
    Failed,
}

impl Phase {
    /// Ordered phases a healthy startup passes through, excluding the
    /// terminal `Failed` phase.
    pub const SEQUENCE: [Phase; 6] = [
        Phase::Registered,
        Phase::Launching,
        Phase::Connecting,
        Phase::LoadingPage,
        Phase::Authenticating,
        Phase::Ready,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Ready | Phase::Failed)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Registered => "REGISTERED",
            Phase::Launching => "LAUNCHING",
            Phase::Connecting => "CONNECTING",
            Phase::LoadingPage => "LOADING_PAGE",
            Phase::Authenticating => "AUTHENTICATING",
            Phase::Ready => "READY",
            Phase::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

/// Per-phase timeout budget. Soft warning fires at 50%, hard failure at 100%.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PhaseBudget {
    pub phase: Phase,
    pub budget: Duration,
}

/// Default per-phase budgets; sum is exactly the default 120s total startup
/// budget (spec §4.7).
pub fn default_phase_budgets() -> Vec<PhaseBudget> {
    vec![
        PhaseBudget {
            phase: Phase::Launching,
            budget: Duration::from_secs(20),
        },
        PhaseBudget {
            phase: Phase::Connecting,
            budget: Duration::from_secs(20),
        },
        PhaseBudget {
            phase: Phase::LoadingPage,
            budget: Duration::from_secs(30),
        },
        PhaseBudget {
            phase: Phase::Authenticating,
            budget: Duration::from_secs(40),
        },
        PhaseBudget {
            phase: Phase::Ready,
            budget: Duration::from_secs(10),
        },
    ]
}

pub const DEFAULT_TOTAL_BUDGET: Duration = Duration::from_secs(120);

/// Tracks one instance's progress through the phase sequence and enforces
/// per-phase timeouts.
pub struct StartupTracker {
    current: Phase,
    phase_started_at: Instant,
    budgets: Vec<PhaseBudget>,
    mode: StartupMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutCheck {
    Ok,
    SoftWarning,
    HardFailure,
}

impl StartupTracker {
    pub fn new(mode: StartupMode) -> Self {
        Self {
            current: Phase::Registered,
            phase_started_at: Instant::now(),
            budgets: default_phase_budgets(),
            mode,
        }
    }

    pub fn with_budgets(mode: StartupMode, budgets: Vec<PhaseBudget>) -> Self {
        Self {
            current: Phase::Registered,
            phase_started_at: Instant::now(),
            budgets,
            mode,
        }
    }

    pub fn phase(&self) -> Phase {
        self.current
    }

    /// Milliseconds spent in the current phase so far, for the completed
    /// phase's duration to be folded into the metrics board on transition.
    pub fn phase_elapsed_ms(&self) -> u64 {
        self.phase_started_at.elapsed().as_millis() as u64
    }

    pub fn mode(&self) -> StartupMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: StartupMode) {
        self.mode = mode;
    }

    fn budget_for(&self, phase: Phase) -> Option<Duration> {
        self.budgets
            .iter()
            .find(|b| b.phase == phase)
            .map(|b| b.budget)
    }

    /// Advance to the next phase in sequence. Panics in debug builds if
    /// called out of order — transitions must come from the driver, which
    /// already validates ordering against [`Phase::SEQUENCE`].
    pub fn advance(&mut self, next: Phase) {
        if self.mode == StartupMode::Disabled {
            return;
        }
        info!(from = %self.current, to = %next, "startup phase transition");
        self.current = next;
        self.phase_started_at = Instant::now();
    }

    /// Check the current phase's elapsed time against its budget.
    pub fn check_timeout(&self) -> TimeoutCheck {
        if self.mode == StartupMode::Disabled {
            return TimeoutCheck::Ok;
        }
        let Some(budget) = self.budget_for(self.current) else {
            return TimeoutCheck::Ok;
        };
        let elapsed = self.phase_started_at.elapsed();
        if elapsed >= budget {
            TimeoutCheck::HardFailure
        } else if elapsed >= budget / 2 {
            TimeoutCheck::SoftWarning
        } else {
            TimeoutCheck::Ok
        }
    }

    /// Called by the driver when [`Self::check_timeout`] reports
    /// [`TimeoutCheck::HardFailure`]. Transitions to the terminal `Failed`
    /// phase and returns the error the supervisor should act on.
    pub fn fail(&mut self, reason: impl Into<String>) -> FleetError {
        let reason = reason.into();
        warn!(phase = %self.current, %reason, "startup phase hard-timed-out");
        let phase = self.current;
        self.current = Phase::Failed;
        FleetError::StartupFailed { phase, reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_is_monotonic_and_ends_ready() {
        assert_eq!(Phase::SEQUENCE.first(), Some(&Phase::Registered));
        assert_eq!(Phase::SEQUENCE.last(), Some(&Phase::Ready));
    }

    #[test]
    fn phase_budgets_sum_to_default_total() {
        let total: Duration = default_phase_budgets().iter().map(|b| b.budget).sum();
        assert_eq!(total, DEFAULT_TOTAL_BUDGET);
    }

    #[test]
    fn disabled_mode_never_transitions() {
        let mut tracker = StartupTracker::new(StartupMode::Disabled);
        tracker.advance(Phase::Launching);
        assert_eq!(tracker.phase(), Phase::Registered);
        assert_eq!(tracker.check_timeout(), TimeoutCheck::Ok);
    }

    #[test]
    fn hard_timeout_moves_to_failed() {
        let mut tracker = StartupTracker::with_budgets(
            StartupMode::Active,
            vec![PhaseBudget {
                phase: Phase::Launching,
                budget: Duration::from_millis(1),
            }],
        );
        tracker.advance(Phase::Launching);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(tracker.check_timeout(), TimeoutCheck::HardFailure);
        let err = tracker.fail("pid never observed on port");
        assert_eq!(tracker.phase(), Phase::Failed);
        match err {
            FleetError::StartupFailed { phase, .. } => assert_eq!(phase, Phase::Launching),
            _ => panic!("expected StartupFailed"),
        }
    }

    #[test]
    fn soft_warning_before_hard_failure() {
        let mut tracker = StartupTracker::with_budgets(
            StartupMode::Active,
            vec![PhaseBudget {
                phase: Phase::Launching,
                budget: Duration::from_millis(20),
            }],
        );
        tracker.advance(Phase::Launching);
        std::thread::sleep(Duration::from_millis(12));
        assert_eq!(tracker.check_timeout(), TimeoutCheck::SoftWarning);
    }
}
