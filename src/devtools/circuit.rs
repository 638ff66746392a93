// =============================================================================
// Circuit Breaker — per (tab, op_class) failure isolator
// =============================================================================
//
// CLOSED, on failure: consecutive_failures++; >= threshold -> OPEN.
// OPEN, on call: short-circuit until `cooldown` has elapsed, then admit one
// HALF_OPEN trial. HALF_OPEN: at most one concurrent trial; success -> CLOSED
// (counters reset); failure -> OPEN with a fresh `opened_at`.
//
// One breaker instance guards one (tab, op_class) pair. The registry that
// owns the `HashMap` of breakers lives in `AppState` (see spec design notes
// on breaking cyclic references via a keyed registry rather than direct refs).
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::devtools::retry::{OperationClass, CIRCUIT_COOLDOWN};
use crate::types::TabId;

/// Observable state of a circuit breaker, as reported through the control
/// surface (C12).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        };
        write!(f, "{s}")
    }
}

/// The decision returned by [`CircuitBreaker::admit`].
pub enum Admission {
    /// The call may proceed.
    Allowed,
    /// The call is short-circuited; includes when the breaker opened and how
    /// long until the next HALF_OPEN trial is considered.
    Rejected {
        opened_at: Instant,
        retry_after: Duration,
    },
}

/// A single breaker guarding one (tab, op_class) pair.
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// `true` while a HALF_OPEN trial is in flight — admits only one at a time.
    half_open_trial_in_flight: bool,
    threshold: u32,
    cooldown: Duration,
    label: String,
}

impl CircuitBreaker {
    pub fn new(label: impl Into<String>, threshold: u32) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            half_open_trial_in_flight: false,
            threshold,
            cooldown: CIRCUIT_COOLDOWN,
            label: label.into(),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn opened_at(&self) -> Option<Instant> {
        self.opened_at
    }

    /// Decide whether a call may proceed, transitioning OPEN -> HALF_OPEN if
    /// the cooldown has elapsed. Call this immediately before dispatching.
    pub fn admit(&mut self) -> Admission {
        match self.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::HalfOpen => {
                if self.half_open_trial_in_flight {
                    // Only one trial at a time; treat a second caller as if
                    // the breaker were still open.
                    let opened_at = self.opened_at.unwrap_or_else(Instant::now);
                    Admission::Rejected {
                        opened_at,
                        retry_after: self.cooldown,
                    }
                } else {
                    self.half_open_trial_in_flight = true;
                    Admission::Allowed
                }
            }
            CircuitState::Open => {
                let opened_at = self.opened_at.unwrap_or_else(Instant::now);
                if opened_at.elapsed() >= self.cooldown {
                    self.state = CircuitState::HalfOpen;
                    self.half_open_trial_in_flight = true;
                    info!(tab_op = %self.label, "circuit cooldown elapsed — admitting HALF_OPEN trial");
                    Admission::Allowed
                } else {
                    Admission::Rejected {
                        opened_at,
                        retry_after: self.cooldown.saturating_sub(opened_at.elapsed()),
                    }
                }
            }
        }
    }

    /// Record a successful call outcome.
    pub fn on_success(&mut self) {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                info!(tab_op = %self.label, "HALF_OPEN trial succeeded — closing circuit");
                self.state = CircuitState::Closed;
                self.consecutive_failures = 0;
                self.opened_at = None;
                self.half_open_trial_in_flight = false;
            }
            CircuitState::Open => {
                // Shouldn't happen (admit() would have moved us to HALF_OPEN
                // first), but treat it the same as a HALF_OPEN success.
                self.state = CircuitState::Closed;
                self.consecutive_failures = 0;
                self.opened_at = None;
            }
        }
    }

    /// Record a failed call outcome. Returns `true` if this call tripped the
    /// breaker open (CLOSED -> OPEN or HALF_OPEN -> OPEN), so the caller can
    /// fold a circuit-trip event into the metrics board.
    pub fn on_failure(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.threshold {
                    warn!(
                        tab_op = %self.label,
                        consecutive_failures = self.consecutive_failures,
                        threshold = self.threshold,
                        "circuit tripped OPEN"
                    );
                    self.state = CircuitState::Open;
                    self.opened_at = Some(Instant::now());
                    return true;
                }
                false
            }
            CircuitState::HalfOpen => {
                warn!(tab_op = %self.label, "HALF_OPEN trial failed — reopening circuit");
                self.state = CircuitState::Open;
                self.opened_at = Some(Instant::now());
                self.half_open_trial_in_flight = false;
                true
            }
            CircuitState::Open => {
                // Already open; refresh opened_at so cooldown restarts.
                self.opened_at = Some(Instant::now());
                false
            }
        }
    }
}

/// Registry of breakers keyed by (tab, op_class), owned centrally so that
/// the supervisor, sessions, and evaluator never hold direct references to
/// each other's breakers — only a key to look one up in the registry.
#[derive(Default)]
pub struct CircuitRegistry {
    breakers: RwLock<HashMap<(TabId, OperationClass), Mutex<CircuitBreaker>>>,
}

impl CircuitRegistry {
    pub fn new() -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
        }
    }

    fn ensure(&self, tab: &TabId, op_class: OperationClass) {
        let key = (tab.clone(), op_class);
        if self.breakers.read().contains_key(&key) {
            return;
        }
        let mut write = self.breakers.write();
        write.entry(key).or_insert_with(|| {
            let threshold = op_class.default_policy().circuit_threshold;
            Mutex::new(CircuitBreaker::new(format!("{tab}/{op_class}"), threshold))
        });
    }

    /// Decide admission for (tab, op_class), creating the breaker on first use.
    pub fn admit(&self, tab: &TabId, op_class: OperationClass) -> Admission {
        self.ensure(tab, op_class);
        let read = self.breakers.read();
        let mut guard = read.get(&(tab.clone(), op_class)).unwrap().lock();
        guard.admit()
    }

    pub fn on_success(&self, tab: &TabId, op_class: OperationClass) {
        self.ensure(tab, op_class);
        let read = self.breakers.read();
        read.get(&(tab.clone(), op_class)).unwrap().lock().on_success();
    }

    /// Returns `true` if this failure tripped the breaker open, so the
    /// evaluator can fold a circuit-trip event into the metrics board.
    pub fn on_failure(&self, tab: &TabId, op_class: OperationClass) -> bool {
        self.ensure(tab, op_class);
        let read = self.breakers.read();
        read.get(&(tab.clone(), op_class)).unwrap().lock().on_failure()
    }

    /// Snapshot every known breaker's state, keyed by `"<tab>/<op_class>"`,
    /// for the control surface (C12).
    pub fn snapshot(&self) -> HashMap<String, CircuitState> {
        self.breakers
            .read()
            .iter()
            .map(|((tab, op_class), cb)| (format!("{tab}/{op_class}"), cb.lock().state()))
            .collect()
    }

    /// State of a single (tab, op_class) pair, for per-session reporting.
    pub fn state_of(&self, tab: &TabId, op_class: OperationClass) -> CircuitState {
        self.ensure(tab, op_class);
        let read = self.breakers.read();
        read.get(&(tab.clone(), op_class)).unwrap().lock().state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn closed_to_open_at_threshold() {
        let mut cb = CircuitBreaker::new("t", 3);
        for _ in 0..2 {
            cb.on_failure();
            assert_eq!(cb.state(), CircuitState::Closed);
        }
        cb.on_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn success_resets_consecutive_failures_in_closed() {
        let mut cb = CircuitBreaker::new("t", 3);
        cb.on_failure();
        cb.on_failure();
        cb.on_success();
        assert_eq!(cb.consecutive_failures(), 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn open_rejects_until_cooldown() {
        let mut cb = CircuitBreaker::new("t", 1);
        cb.cooldown = Duration::from_millis(20);
        cb.on_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        match cb.admit() {
            Admission::Rejected { .. } => {}
            Admission::Allowed => panic!("expected rejection before cooldown"),
        }
        sleep(Duration::from_millis(30));
        match cb.admit() {
            Admission::Allowed => {}
            Admission::Rejected { .. } => panic!("expected admission after cooldown"),
        }
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_success_closes_and_resets() {
        let mut cb = CircuitBreaker::new("t", 1);
        cb.cooldown = Duration::from_millis(1);
        cb.on_failure();
        sleep(Duration::from_millis(5));
        assert!(matches!(cb.admit(), Admission::Allowed));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.on_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
    }

    #[test]
    fn half_open_failure_reopens_with_fresh_timestamp() {
        let mut cb = CircuitBreaker::new("t", 1);
        cb.cooldown = Duration::from_millis(1);
        cb.on_failure();
        let first_opened = cb.opened_at().unwrap();
        sleep(Duration::from_millis(5));
        assert!(matches!(cb.admit(), Admission::Allowed));
        sleep(Duration::from_millis(5));
        cb.on_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.opened_at().unwrap() > first_opened);
    }

    #[test]
    fn only_one_half_open_trial_admitted_concurrently() {
        let mut cb = CircuitBreaker::new("t", 1);
        cb.cooldown = Duration::from_millis(1);
        cb.on_failure();
        sleep(Duration::from_millis(5));
        assert!(matches!(cb.admit(), Admission::Allowed));
        // A second caller while the first trial is still in flight is
        // rejected even though we're past cooldown.
        assert!(matches!(cb.admit(), Admission::Rejected { .. }));
    }

    #[test]
    fn registry_creates_independent_breakers_per_key() {
        let registry = CircuitRegistry::new();
        let tab_a = TabId("a".to_string());
        let tab_b = TabId("b".to_string());

        for _ in 0..3 {
            registry.on_failure(&tab_a, OperationClass::Critical);
        }
        assert_eq!(
            registry.state_of(&tab_a, OperationClass::Critical),
            CircuitState::Open
        );
        // A different tab, or a different op_class on the same tab, is
        // unaffected.
        assert_eq!(
            registry.state_of(&tab_b, OperationClass::Critical),
            CircuitState::Closed
        );
        assert_eq!(
            registry.state_of(&tab_a, OperationClass::Important),
            CircuitState::Closed
        );
    }
}
