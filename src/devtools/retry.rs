// =============================================================================
// Retry & Backoff Policy — per operation-class attempt budgets
// =============================================================================
//
// CRITICAL / IMPORTANT / NON_CRITICAL govern retry count, per-attempt
// timeout, backoff shape, and circuit threshold. Transport failures are
// retried according to this table; JavaScript errors never are (see
// `FleetError::is_retryable`).
// =============================================================================

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Coarse policy category governing retries, timeouts, backoff, and circuit
/// thresholds for a `safe_evaluate` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationClass {
    Critical,
    Important,
    NonCritical,
}

impl std::fmt::Display for OperationClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Critical => "CRITICAL",
            Self::Important => "IMPORTANT",
            Self::NonCritical => "NON_CRITICAL",
        };
        write!(f, "{s}")
    }
}

/// Which backoff shape to apply after a failed attempt.
#[derive(Debug, Clone, Copy)]
pub enum BackoffShape {
    /// No delay before the next attempt.
    None,
    /// A fixed delay plus up to 100ms of jitter.
    Immediate { jitter_ms: u64 },
    /// Exponential backoff: `base * 2^attempt`, capped at `cap`.
    Exponential { base: Duration, cap: Duration },
}

/// Fully resolved policy for one operation class.
#[derive(Debug, Clone, Copy)]
pub struct Policy {
    pub max_attempts: u32,
    pub per_attempt_timeout: Duration,
    pub transport_backoff: BackoffShape,
    pub busy_backoff: BackoffShape,
    pub circuit_threshold: u32,
}

/// Default cooldown before an OPEN breaker allows a HALF_OPEN trial (shared
/// across all operation classes — see spec §4.3).
pub const CIRCUIT_COOLDOWN: Duration = Duration::from_secs(30);

impl OperationClass {
    /// Built-in policy table (spec §4.2), before any `PolicyOverrides` file
    /// is applied.
    pub const fn default_policy(self) -> Policy {
        match self {
            OperationClass::Critical => Policy {
                max_attempts: 3,
                per_attempt_timeout: Duration::from_secs(10),
                transport_backoff: BackoffShape::Immediate { jitter_ms: 100 },
                busy_backoff: BackoffShape::Exponential {
                    base: Duration::from_millis(250),
                    cap: Duration::from_secs(2),
                },
                circuit_threshold: 3,
            },
            OperationClass::Important => Policy {
                max_attempts: 2,
                per_attempt_timeout: Duration::from_secs(5),
                transport_backoff: BackoffShape::Immediate { jitter_ms: 250 },
                busy_backoff: BackoffShape::Exponential {
                    base: Duration::from_millis(500),
                    cap: Duration::from_secs(4),
                },
                circuit_threshold: 5,
            },
            OperationClass::NonCritical => Policy {
                max_attempts: 1,
                per_attempt_timeout: Duration::from_secs(2),
                transport_backoff: BackoffShape::None,
                busy_backoff: BackoffShape::None,
                circuit_threshold: 10,
            },
        }
    }
}

/// Compute the delay for attempt number `attempt` (0-indexed) under `shape`.
/// `rand_fraction` is a caller-supplied value in `[0.0, 1.0)` used for
/// jitter — kept as a parameter so tests can drive it deterministically
/// instead of pulling in a dedicated RNG dependency for a single use site.
pub fn backoff_delay(shape: BackoffShape, attempt: u32, rand_fraction: f64) -> Duration {
    match shape {
        BackoffShape::None => Duration::ZERO,
        BackoffShape::Immediate { jitter_ms } => {
            Duration::from_millis((jitter_ms as f64 * rand_fraction) as u64)
        }
        BackoffShape::Exponential { base, cap } => {
            let exp = base.saturating_mul(1u32 << attempt.min(16));
            exp.min(cap)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_policy_matches_spec_table() {
        let p = OperationClass::Critical.default_policy();
        assert_eq!(p.max_attempts, 3);
        assert_eq!(p.per_attempt_timeout, Duration::from_secs(10));
        assert_eq!(p.circuit_threshold, 3);
    }

    #[test]
    fn important_policy_matches_spec_table() {
        let p = OperationClass::Important.default_policy();
        assert_eq!(p.max_attempts, 2);
        assert_eq!(p.per_attempt_timeout, Duration::from_secs(5));
        assert_eq!(p.circuit_threshold, 5);
    }

    #[test]
    fn non_critical_policy_matches_spec_table() {
        let p = OperationClass::NonCritical.default_policy();
        assert_eq!(p.max_attempts, 1);
        assert_eq!(p.per_attempt_timeout, Duration::from_secs(2));
        assert_eq!(p.circuit_threshold, 10);
    }

    #[test]
    fn exponential_backoff_caps() {
        let shape = BackoffShape::Exponential {
            base: Duration::from_millis(250),
            cap: Duration::from_secs(2),
        };
        assert_eq!(backoff_delay(shape, 0, 0.0), Duration::from_millis(250));
        assert_eq!(backoff_delay(shape, 1, 0.0), Duration::from_millis(500));
        assert_eq!(backoff_delay(shape, 10, 0.0), Duration::from_secs(2));
    }

    #[test]
    fn immediate_backoff_respects_jitter_bound() {
        let shape = BackoffShape::Immediate { jitter_ms: 100 };
        assert_eq!(backoff_delay(shape, 0, 0.0), Duration::ZERO);
        assert_eq!(backoff_delay(shape, 0, 0.999), Duration::from_millis(99));
    }
}
