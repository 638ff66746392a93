// =============================================================================
// Structured Logging & Metrics — append-only event log + derived counters
// =============================================================================
//
// Every safe_evaluate call emits a structured `pre_execute`/`post_execute`
// tracing event (via `#[instrument]` + explicit `info!`/`warn!` calls in the
// evaluator) and folds its outcome into a `CounterBoard`, modeled on
// `binance/rate_limit.rs`'s atomic-counter + `snapshot()` pattern.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;
use serde::Serialize;

use crate::devtools::retry::OperationClass;
use crate::supervisor::startup::Phase;
use crate::types::AccountId;

/// A recorded error event for the dashboard error log (`GET /api/errors`).
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub ts_ms: i64,
    pub category: String,
    pub severity: Severity,
    pub account: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

/// Per-operation-class counters: attempted / succeeded / failed / retried.
#[derive(Debug, Default, Serialize, Clone)]
pub struct ClassCounters {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
}

struct AtomicClassCounters {
    attempted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
}

impl AtomicClassCounters {
    fn new() -> Self {
        Self {
            attempted: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
        }
    }

    fn snapshot(&self) -> ClassCounters {
        ClassCounters {
            attempted: self.attempted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
        }
    }
}

/// Central counters board: operations per op_class, circuit trips, restarts
/// per account, and startup durations per phase.
pub struct CounterBoard {
    started_at: Instant,
    by_class: [AtomicClassCounters; 3],
    circuit_trips: AtomicU64,
    restarts_per_account: RwLock<HashMap<AccountId, u64>>,
    startup_phase_durations_ms: RwLock<HashMap<Phase, Vec<u64>>>,
    errors: RwLock<Vec<ErrorRecord>>,
}

/// Serializable snapshot of [`CounterBoard`], returned by `GET /api/health`
/// and `GET /api/errors`.
#[derive(Debug, Serialize)]
pub struct CounterSnapshot {
    pub uptime_seconds: u64,
    pub by_class: HashMap<String, ClassCounters>,
    pub circuit_trips: u64,
    pub restarts_per_account: HashMap<String, u64>,
    pub startup_phase_avg_ms: HashMap<String, u64>,
}

impl CounterBoard {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            by_class: [
                AtomicClassCounters::new(),
                AtomicClassCounters::new(),
                AtomicClassCounters::new(),
            ],
            circuit_trips: AtomicU64::new(0),
            restarts_per_account: RwLock::new(HashMap::new()),
            startup_phase_durations_ms: RwLock::new(HashMap::new()),
            errors: RwLock::new(Vec::new()),
        }
    }

    fn class_index(op_class: OperationClass) -> usize {
        match op_class {
            OperationClass::Critical => 0,
            OperationClass::Important => 1,
            OperationClass::NonCritical => 2,
        }
    }

    pub fn record_attempt(&self, op_class: OperationClass) {
        self.by_class[Self::class_index(op_class)]
            .attempted
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self, op_class: OperationClass) {
        self.by_class[Self::class_index(op_class)]
            .retried
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self, op_class: OperationClass) {
        self.by_class[Self::class_index(op_class)]
            .succeeded
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self, op_class: OperationClass) {
        self.by_class[Self::class_index(op_class)]
            .failed
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_circuit_trip(&self) {
        self.circuit_trips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_restart(&self, account: &AccountId) {
        *self
            .restarts_per_account
            .write()
            .entry(account.clone())
            .or_insert(0) += 1;
    }

    pub fn record_startup_phase_duration(&self, phase: Phase, duration_ms: u64) {
        self.startup_phase_durations_ms
            .write()
            .entry(phase)
            .or_default()
            .push(duration_ms);
    }

    pub fn record_error(&self, record: ErrorRecord) {
        let mut errors = self.errors.write();
        errors.push(record);
        // Bound memory: keep the most recent 5000 events.
        if errors.len() > 5000 {
            let excess = errors.len() - 5000;
            errors.drain(0..excess);
        }
    }

    pub fn errors_since(&self, cutoff_ms: i64) -> Vec<ErrorRecord> {
        self.errors
            .read()
            .iter()
            .filter(|e| e.ts_ms >= cutoff_ms)
            .cloned()
            .collect()
    }

    pub fn clear_errors_older_than(&self, cutoff_ms: i64) -> usize {
        let mut errors = self.errors.write();
        let before = errors.len();
        errors.retain(|e| e.ts_ms >= cutoff_ms);
        before - errors.len()
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let mut by_class = HashMap::new();
        for op_class in [
            OperationClass::Critical,
            OperationClass::Important,
            OperationClass::NonCritical,
        ] {
            by_class.insert(
                op_class.to_string(),
                self.by_class[Self::class_index(op_class)].snapshot(),
            );
        }

        let restarts_per_account = self
            .restarts_per_account
            .read()
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect();

        let startup_phase_avg_ms = self
            .startup_phase_durations_ms
            .read()
            .iter()
            .map(|(phase, samples)| {
                let avg = if samples.is_empty() {
                    0
                } else {
                    samples.iter().sum::<u64>() / samples.len() as u64
                };
                (format!("{phase:?}"), avg)
            })
            .collect();

        CounterSnapshot {
            uptime_seconds: self.started_at.elapsed().as_secs(),
            by_class,
            circuit_trips: self.circuit_trips.load(Ordering::Relaxed),
            restarts_per_account,
            startup_phase_avg_ms,
        }
    }

    /// Health score per spec §6.1: start at 100, subtract 10/critical,
    /// 5/error, 1/warning in the last `window`, floor at 0.
    pub fn health_score(&self, window_ms: i64, now_ms: i64) -> u32 {
        let cutoff = now_ms - window_ms;
        let mut score: i64 = 100;
        for e in self.errors_since(cutoff) {
            score -= match e.severity {
                Severity::Critical => 10,
                Severity::Error => 5,
                Severity::Warning => 1,
            };
        }
        score.max(0) as u32
    }
}

impl Default for CounterBoard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_success_failure_counted_independently_per_class() {
        let board = CounterBoard::new();
        board.record_attempt(OperationClass::Critical);
        board.record_attempt(OperationClass::Critical);
        board.record_success(OperationClass::Critical);
        board.record_failure(OperationClass::Important);

        let snap = board.snapshot();
        assert_eq!(snap.by_class["CRITICAL"].attempted, 2);
        assert_eq!(snap.by_class["CRITICAL"].succeeded, 1);
        assert_eq!(snap.by_class["IMPORTANT"].failed, 1);
        assert_eq!(snap.by_class["NON_CRITICAL"].attempted, 0);
    }

    #[test]
    fn health_score_floors_at_zero() {
        let board = CounterBoard::new();
        for _ in 0..20 {
            board.record_error(ErrorRecord {
                ts_ms: 1000,
                category: "test".to_string(),
                severity: Severity::Critical,
                account: None,
                message: "boom".to_string(),
            });
        }
        assert_eq!(board.health_score(60_000, 1500), 0);
    }

    #[test]
    fn health_score_buckets_match_spec_thresholds() {
        let board = CounterBoard::new();
        // One warning: 100 - 1 = 99 (>= 90 -> HEALTHY bucket upstream).
        board.record_error(ErrorRecord {
            ts_ms: 1000,
            category: "test".to_string(),
            severity: Severity::Warning,
            account: None,
            message: "minor".to_string(),
        });
        assert_eq!(board.health_score(60_000, 1500), 99);
    }

    #[test]
    fn clear_errors_older_than_drops_only_stale_entries() {
        let board = CounterBoard::new();
        board.record_error(ErrorRecord {
            ts_ms: 1000,
            category: "a".to_string(),
            severity: Severity::Warning,
            account: None,
            message: "old".to_string(),
        });
        board.record_error(ErrorRecord {
            ts_ms: 9000,
            category: "a".to_string(),
            severity: Severity::Warning,
            account: None,
            message: "new".to_string(),
        });
        let removed = board.clear_errors_older_than(5000);
        assert_eq!(removed, 1);
        assert_eq!(board.errors_since(0).len(), 1);
    }

    #[test]
    fn restarts_tracked_per_account_independently() {
        let board = CounterBoard::new();
        let a = AccountId::from("alpha");
        let b = AccountId::from("bravo");
        board.record_restart(&a);
        board.record_restart(&a);
        board.record_restart(&b);
        let snap = board.snapshot();
        assert_eq!(snap.restarts_per_account["alpha"], 2);
        assert_eq!(snap.restarts_per_account["bravo"], 1);
    }
}
