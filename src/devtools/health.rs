// =============================================================================
// Tab Health Probe — four independent liveness checks per attached tab
// =============================================================================
//
// Each probe runs four checks against the tab: a bare `1+1` eval, the current
// URL against the expected trading host, `document.readyState`, and the
// page-driver function presence check. The checks are independent — a tab can
// answer evals fine while having navigated off the trading host (a login
// redirect) or while `document.readyState` still reports `loading`. The
// derived status folds them in priority order: unresponsive first (nothing
// else is trustworthy if the eval itself failed), then misauthenticated
// (redirected to a login path), then degraded, then healthy.
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::devtools::circuit::CircuitRegistry;
use crate::devtools::evaluator::safe_evaluate;
use crate::devtools::retry::OperationClass;
use crate::devtools::transport::DevToolsConnection;
use crate::metrics::CounterBoard;
use crate::session::page_driver::{
    current_url_expression, document_ready_expression, required_functions_expression,
};
use crate::types::TabId;

pub const PROBE_INTERVAL: Duration = Duration::from_secs(15);
pub const UNHEALTHY_THRESHOLD: u32 = 3;

/// URL path fragments that indicate the tab landed on a login page instead of
/// the trading surface.
const LOGIN_PATH_MARKERS: [&str; 2] = ["/login", "/auth"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Misauthenticated,
    Unresponsive,
}

/// Result of the four independent checks for a single probe, plus the
/// status derived from them.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub basic_eval_ok: bool,
    pub url_matches_expected_host: bool,
    pub document_ready: bool,
    pub required_page_functions_present: bool,
    pub status: HealthStatus,
}

fn looks_like_login_path(url: &str) -> bool {
    LOGIN_PATH_MARKERS.iter().any(|marker| url.contains(marker))
}

fn derive_status(
    basic_eval_ok: bool,
    url_matches_expected_host: bool,
    on_login_path: bool,
    document_ready: bool,
    required_page_functions_present: bool,
) -> HealthStatus {
    if !basic_eval_ok {
        return HealthStatus::Unresponsive;
    }
    if on_login_path {
        return HealthStatus::Misauthenticated;
    }
    if url_matches_expected_host && document_ready && required_page_functions_present {
        return HealthStatus::Healthy;
    }
    HealthStatus::Degraded
}

/// Run the four checks against `tab` and derive its [`HealthReport`].
pub async fn check_health(
    tab: &TabId,
    connection: &DevToolsConnection,
    circuits: &CircuitRegistry,
    counters: &CounterBoard,
    expected_host: &str,
) -> HealthReport {
    let eval_result = safe_evaluate(
        tab,
        connection,
        circuits,
        counters,
        "1+1",
        "health probe: basic eval",
        OperationClass::NonCritical,
        Some("number"),
    )
    .await;
    let basic_eval_ok = eval_result.is_ok();

    if !basic_eval_ok {
        return HealthReport {
            basic_eval_ok,
            url_matches_expected_host: false,
            document_ready: false,
            required_page_functions_present: false,
            status: HealthStatus::Unresponsive,
        };
    }

    let url = safe_evaluate(
        tab,
        connection,
        circuits,
        counters,
        current_url_expression(),
        "health probe: current url",
        OperationClass::NonCritical,
        Some("string"),
    )
    .await
    .ok()
    .and_then(|v| v.as_str().map(str::to_string))
    .unwrap_or_default();

    let on_login_path = looks_like_login_path(&url);
    let url_matches_expected_host = url.contains(expected_host);

    let document_ready = safe_evaluate(
        tab,
        connection,
        circuits,
        counters,
        document_ready_expression(),
        "health probe: document ready",
        OperationClass::NonCritical,
        Some("boolean"),
    )
    .await
    .ok()
    .and_then(|v| v.as_bool())
    .unwrap_or(false);

    let required_page_functions_present = safe_evaluate(
        tab,
        connection,
        circuits,
        counters,
        &required_functions_expression(),
        "health probe: required functions",
        OperationClass::NonCritical,
        Some("boolean"),
    )
    .await
    .ok()
    .and_then(|v| v.as_bool())
    .unwrap_or(false);

    let status = derive_status(
        basic_eval_ok,
        url_matches_expected_host,
        on_login_path,
        document_ready,
        required_page_functions_present,
    );

    HealthReport {
        basic_eval_ok,
        url_matches_expected_host,
        document_ready,
        required_page_functions_present,
        status,
    }
}

struct TrackedHealth {
    consecutive_unhealthy: u32,
    last_report: HealthReport,
}

fn default_report() -> HealthReport {
    HealthReport {
        basic_eval_ok: true,
        url_matches_expected_host: true,
        document_ready: true,
        required_page_functions_present: true,
        status: HealthStatus::Healthy,
    }
}

/// Tracks consecutive unhealthy probe outcomes per tab and exposes a
/// restart recommendation, independent of the circuit breaker (which guards
/// individual operation classes, not overall tab liveness).
pub struct HealthTracker {
    tabs: Mutex<HashMap<TabId, TrackedHealth>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            tabs: Mutex::new(HashMap::new()),
        }
    }

    /// Run one probe for `tab` and update its tracked status.
    pub async fn probe(
        &self,
        tab: &TabId,
        connection: &DevToolsConnection,
        circuits: &CircuitRegistry,
        counters: &CounterBoard,
        expected_host: &str,
    ) -> HealthReport {
        let report = check_health(tab, connection, circuits, counters, expected_host).await;

        let mut tabs = self.tabs.lock();
        let entry = tabs.entry(tab.clone()).or_insert_with(|| TrackedHealth {
            consecutive_unhealthy: 0,
            last_report: default_report(),
        });

        if report.status == HealthStatus::Healthy {
            if entry.consecutive_unhealthy > 0 {
                info!(tab = %tab, "tab health probe recovered");
            }
            entry.consecutive_unhealthy = 0;
        } else {
            entry.consecutive_unhealthy += 1;
            warn!(
                tab = %tab,
                status = ?report.status,
                consecutive_unhealthy = entry.consecutive_unhealthy,
                basic_eval_ok = report.basic_eval_ok,
                url_matches_expected_host = report.url_matches_expected_host,
                document_ready = report.document_ready,
                required_page_functions_present = report.required_page_functions_present,
                "tab health probe reported non-healthy status"
            );
        }
        entry.last_report = report.clone();

        report
    }

    pub fn status_of(&self, tab: &TabId) -> HealthStatus {
        self.tabs
            .lock()
            .get(tab)
            .map(|h| h.last_report.status)
            .unwrap_or(HealthStatus::Healthy)
    }

    /// Whether `tab` has crossed the consecutive-unhealthy-probe threshold
    /// and should be handed to the supervisor for a restart.
    pub fn should_restart(&self, tab: &TabId) -> bool {
        self.tabs
            .lock()
            .get(tab)
            .map(|h| h.consecutive_unhealthy >= UNHEALTHY_THRESHOLD)
            .unwrap_or(false)
    }

    pub fn forget(&self, tab: &TabId) {
        self.tabs.lock().remove(tab);
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_tab_reports_healthy_by_default() {
        let tracker = HealthTracker::new();
        assert_eq!(
            tracker.status_of(&TabId("x".to_string())),
            HealthStatus::Healthy
        );
    }

    #[test]
    fn forget_clears_tracked_state() {
        let tracker = HealthTracker::new();
        let tab = TabId("x".to_string());
        tracker.tabs.lock().insert(
            tab.clone(),
            TrackedHealth {
                consecutive_unhealthy: 5,
                last_report: HealthReport {
                    basic_eval_ok: false,
                    url_matches_expected_host: false,
                    document_ready: false,
                    required_page_functions_present: false,
                    status: HealthStatus::Unresponsive,
                },
            },
        );
        tracker.forget(&tab);
        assert_eq!(tracker.status_of(&tab), HealthStatus::Healthy);
    }

    #[test]
    fn should_restart_once_threshold_crossed() {
        let tracker = HealthTracker::new();
        let tab = TabId("x".to_string());
        tracker.tabs.lock().insert(
            tab.clone(),
            TrackedHealth {
                consecutive_unhealthy: UNHEALTHY_THRESHOLD,
                last_report: HealthReport {
                    basic_eval_ok: true,
                    url_matches_expected_host: false,
                    document_ready: true,
                    required_page_functions_present: false,
                    status: HealthStatus::Degraded,
                },
            },
        );
        assert!(tracker.should_restart(&tab));
    }

    #[test]
    fn derive_status_unresponsive_wins_over_everything() {
        let status = derive_status(false, true, false, true, true);
        assert_eq!(status, HealthStatus::Unresponsive);
    }

    #[test]
    fn derive_status_misauthenticated_on_login_path() {
        let status = derive_status(true, false, true, true, false);
        assert_eq!(status, HealthStatus::Misauthenticated);
    }

    #[test]
    fn derive_status_healthy_when_all_checks_pass() {
        let status = derive_status(true, true, false, true, true);
        assert_eq!(status, HealthStatus::Healthy);
    }

    #[test]
    fn derive_status_degraded_when_host_mismatch_without_login_redirect() {
        let status = derive_status(true, false, false, true, true);
        assert_eq!(status, HealthStatus::Degraded);
    }

    #[test]
    fn looks_like_login_path_matches_known_markers() {
        assert!(looks_like_login_path("https://trader.tradovate.com/login"));
        assert!(looks_like_login_path("https://trader.tradovate.com/auth/sso"));
        assert!(!looks_like_login_path("https://trader.tradovate.com/welcome"));
    }
}
