// =============================================================================
// Error taxonomy shared across the fleet
// =============================================================================
//
// Every kind here corresponds to a named failure mode from the design: most
// are non-retryable by construction (the caller already ran whatever retry
// loop applies before producing one of these). `anyhow` is still used at the
// binary edges (config load, process spawn) where attaching a one-off detail
// is cheaper than minting a new variant.
// =============================================================================

use std::time::Duration;

use crate::devtools::circuit::CircuitState;
use crate::supervisor::startup::Phase;

/// Unified error type for fleet operations.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    /// Network/socket/timeout talking to the browser. Recoverable via retry;
    /// surfaced only once the retry budget (C2) is exhausted.
    #[error("transport error talking to tab {tab}: {reason}")]
    Transport { tab: String, reason: String },

    /// The in-page code threw, or returned Chrome's `{subtype: "error"}`
    /// result shape. Never retried.
    #[error("javascript error on tab {tab}: {message}")]
    JavaScript { tab: String, message: String },

    /// The breaker for (tab, op_class) is open or half-open and already has
    /// a trial in flight.
    #[error("circuit open for tab {tab} ({op_class:?}) since {opened_at:?}, retry after {retry_after:?}")]
    CircuitOpen {
        tab: String,
        op_class: crate::devtools::retry::OperationClass,
        opened_at: std::time::Instant,
        retry_after: Duration,
        state: CircuitState,
    },

    /// An operation targeted the protected port. Never executed.
    #[error("port {port} is protected and cannot be launched, killed, or restarted")]
    PortProtected { port: u16 },

    /// A startup phase exceeded its budget or failed its check.
    #[error("startup failed in phase {phase:?}: {reason}")]
    StartupFailed { phase: Phase, reason: String },

    /// A signal matched no accounts.
    #[error("signal matched no accounts for strategy_tag {strategy_tag:?}")]
    RoutingEmpty { strategy_tag: Option<String> },

    /// The venue or in-page validator rejected the order.
    #[error("order rejected: {reason}")]
    OrderRejected { reason: String },

    /// The request-wide deadline was reached before all legs were dispatched.
    #[error("deadline of {deadline:?} exceeded with {remaining} accounts undispatched")]
    DeadlineExceeded {
        deadline: Duration,
        remaining: usize,
    },

    /// A static configuration problem detected at load time.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The DevTools envelope itself was missing or not an object.
    #[error("malformed devtools response on tab {tab}: {reason}")]
    Malformed { tab: String, reason: String },

    /// Result type did not match the caller's expected type.
    #[error("expected result type {expected} on tab {tab}, got {actual}")]
    TypeMismatch {
        tab: String,
        expected: String,
        actual: String,
    },

    /// `result.type == "undefined"` — the page function returned nothing.
    #[error("evaluation on tab {tab} returned undefined")]
    UndefinedResult { tab: String },
}

impl FleetError {
    /// Whether this error kind is eligible for retry at the C2 layer.
    /// JavaScript-shaped failures and protocol-level rejections never are.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FleetError::Transport { .. })
    }
}

pub type FleetResult<T> = Result<T, FleetError>;
