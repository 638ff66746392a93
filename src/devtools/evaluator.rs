// =============================================================================
// Safe Evaluator — composes C1 (classifier) + C2 (retry/backoff) + C3 (circuit)
// =============================================================================
//
// `safe_evaluate` is the single path every higher layer uses to run JS inside
// a tab. It never lets a caller touch a `DevToolsConnection` directly: admit
// through the circuit registry, run with a per-attempt timeout, classify the
// result, retry transport failures per the operation class's policy, and
// record the outcome back into the registry and counters.
// =============================================================================

use std::time::Instant;

use chrono::Utc;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::devtools::circuit::{Admission, CircuitRegistry};
use crate::devtools::classifier::{classify, Classified};
use crate::devtools::retry::{backoff_delay, OperationClass};
use crate::devtools::transport::DevToolsConnection;
use crate::error::{FleetError, FleetResult};
use crate::metrics::{CounterBoard, ErrorRecord, Severity};
use crate::types::TabId;

/// First `fingerprint_len` bytes of `code`, for tracing events — never log
/// full JS source, which may embed account credentials or order payloads.
fn fingerprint(code: &str) -> String {
    const FINGERPRINT_LEN: usize = 64;
    if code.len() <= FINGERPRINT_LEN {
        code.to_string()
    } else {
        format!("{}…", &code[..FINGERPRINT_LEN])
    }
}

/// Run `js_code` in `tab` under `op_class`'s retry/timeout/circuit policy.
///
/// `expected_type` is an optional JS `typeof` string the result must match
/// (see [`classify`]). `description` is a short human label used only in
/// tracing events, never sent to the tab.
#[instrument(skip(connection, circuits, counters, js_code), fields(tab = %tab, op_class = %op_class, description = %description))]
pub async fn safe_evaluate(
    tab: &TabId,
    connection: &DevToolsConnection,
    circuits: &CircuitRegistry,
    counters: &CounterBoard,
    js_code: &str,
    description: &str,
    op_class: OperationClass,
    expected_type: Option<&str>,
) -> FleetResult<Value> {
    match circuits.admit(tab, op_class) {
        Admission::Allowed => {}
        Admission::Rejected {
            opened_at,
            retry_after,
        } => {
            return Err(FleetError::CircuitOpen {
                tab: tab.to_string(),
                op_class,
                opened_at,
                retry_after,
                state: circuits.state_of(tab, op_class),
            });
        }
    }

    let policy = op_class.default_policy();
    let started = Instant::now();

    info!(
        code_fingerprint = %fingerprint(js_code),
        max_attempts = policy.max_attempts,
        "pre_execute"
    );

    let mut last_err: Option<FleetError> = None;

    for attempt in 0..policy.max_attempts {
        counters.record_attempt(op_class);
        if attempt > 0 {
            counters.record_retry(op_class);
        }

        let outcome = tokio::time::timeout(
            policy.per_attempt_timeout,
            connection.evaluate(js_code, policy.per_attempt_timeout),
        )
        .await;

        let envelope = match outcome {
            Ok(Ok(envelope)) => envelope,
            Ok(Err(transport_err)) => {
                let err = FleetError::Transport {
                    tab: tab.to_string(),
                    reason: transport_err.to_string(),
                };
                last_err = Some(retry_or_settle(
                    tab, circuits, counters, op_class, attempt, policy.max_attempts, err,
                    &policy.transport_backoff,
                )
                .await);
                if matches!(last_err, Some(FleetError::Transport { .. })) && attempt + 1 < policy.max_attempts {
                    continue;
                }
                break;
            }
            Err(_elapsed) => {
                let err = FleetError::Transport {
                    tab: tab.to_string(),
                    reason: format!("evaluate timed out after {:?}", policy.per_attempt_timeout),
                };
                last_err = Some(retry_or_settle(
                    tab, circuits, counters, op_class, attempt, policy.max_attempts, err,
                    &policy.transport_backoff,
                )
                .await);
                if matches!(last_err, Some(FleetError::Transport { .. })) && attempt + 1 < policy.max_attempts {
                    continue;
                }
                break;
            }
        };

        match classify(tab.as_str(), &envelope, expected_type) {
            Classified::Ok(value) => {
                circuits.on_success(tab, op_class);
                counters.record_success(op_class);
                info!(
                    attempts = attempt + 1,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "post_execute success"
                );
                return Ok(value);
            }
            Classified::Error(err) => {
                // Non-transport errors (JS exceptions, malformed envelopes,
                // undefined results, type mismatches) are never retried.
                if circuits.on_failure(tab, op_class) {
                    counters.record_circuit_trip();
                }
                counters.record_failure(op_class);
                warn!(
                    attempts = attempt + 1,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = %err,
                    "post_execute non_retryable_error"
                );
                counters.record_error(ErrorRecord {
                    ts_ms: Utc::now().timestamp_millis(),
                    category: "classify".to_string(),
                    severity: Severity::Error,
                    account: None,
                    message: err.to_string(),
                });
                return Err(err);
            }
        }
    }

    counters.record_failure(op_class);
    let err = last_err.unwrap_or_else(|| FleetError::Transport {
        tab: tab.to_string(),
        reason: "exhausted retries with no recorded error".to_string(),
    });
    warn!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        error = %err,
        "post_execute retries_exhausted"
    );
    counters.record_error(ErrorRecord {
        ts_ms: Utc::now().timestamp_millis(),
        category: "transport".to_string(),
        severity: Severity::Error,
        account: None,
        message: err.to_string(),
    });
    Err(err)
}

/// Record the failure into the circuit registry and, if attempts remain,
/// sleep the backoff delay before the caller retries. Returns the error so
/// the caller can decide whether to loop again.
#[allow(clippy::too_many_arguments)]
async fn retry_or_settle(
    tab: &TabId,
    circuits: &CircuitRegistry,
    counters: &CounterBoard,
    op_class: OperationClass,
    attempt: u32,
    max_attempts: u32,
    err: FleetError,
    backoff: &crate::devtools::retry::BackoffShape,
) -> FleetError {
    if circuits.on_failure(tab, op_class) {
        counters.record_circuit_trip();
    }
    counters.record_failure(op_class);
    if attempt + 1 < max_attempts {
        let jitter = fastrand_fraction(attempt);
        let delay = backoff_delay(*backoff, attempt, jitter);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
    err
}

/// Deterministic pseudo-jitter derived from the attempt counter and current
/// time, avoiding a dedicated RNG dependency for this single use site.
fn fastrand_fraction(attempt: u32) -> f64 {
    let nanos = Instant::now().elapsed().subsec_nanos() as u64;
    let mixed = nanos.wrapping_add(attempt as u64 * 2_654_435_761);
    (mixed % 1000) as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_truncates_long_code() {
        let code = "a".repeat(200);
        let fp = fingerprint(&code);
        assert!(fp.len() < code.len());
        assert!(fp.ends_with('…'));
    }

    #[test]
    fn fingerprint_preserves_short_code() {
        let code = "1+1";
        assert_eq!(fingerprint(code), "1+1");
    }

    #[test]
    fn fastrand_fraction_stays_in_unit_range() {
        for attempt in 0..20 {
            let f = fastrand_fraction(attempt);
            assert!((0.0..1.0).contains(&f));
        }
    }
}
