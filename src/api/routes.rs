// =============================================================================
// Control Surface — stable HTTP endpoints for status/health/trade/signal (C12)
// =============================================================================
//
// Modeled directly on `api/rest.rs`'s `Router::new()` + `CorsLayer` + shared
// `Arc<AppState>` construction. Authentication is not carried over: spec §6.1
// defines no auth surface for this control API, so the teacher's
// `AuthBearer` extractor is intentionally dropped (see DESIGN.md).
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::error::FleetError;
use crate::metrics::CounterSnapshot;
use crate::signal::composer::Signal;
use crate::state::AppState;
use crate::types::{AccountId, StartupMode};

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/errors", get(errors))
        .route("/api/errors/clear", post(clear_errors))
        .route("/api/signal", post(signal))
        .route("/api/trade", post(trade))
        .route("/api/startup-monitoring", get(startup_monitoring))
        .route("/api/startup-monitoring/control", post(startup_monitoring_control))
        .layer(cors)
        .with_state(state)
}

fn health_status_for_score(score: u32) -> &'static str {
    match score {
        90..=100 => "HEALTHY",
        70..=89 => "DEGRADED",
        50..=69 => "WARNING",
        _ => "CRITICAL",
    }
}

#[derive(Serialize)]
struct SystemHealth {
    score: u32,
    status: &'static str,
    uptime_seconds: u64,
}

#[derive(Serialize)]
struct HealthResponse {
    system_health: SystemHealth,
    counters: CounterSnapshot,
    sessions: Vec<SessionSummary>,
    error_summary: ErrorSummary,
    error_rates: ErrorRates,
}

#[derive(Serialize)]
struct SessionSummary {
    account: String,
    phase: String,
}

#[derive(Serialize)]
struct ErrorSummary {
    total: usize,
    by_severity: HashMap<String, usize>,
    by_category: HashMap<String, usize>,
}

#[derive(Serialize)]
struct ErrorRates {
    critical_per_minute: f64,
    error_per_minute: f64,
    warning_per_minute: f64,
}

/// Window the health endpoint looks back over for its error summary/rates —
/// the same window `health_score` weighs.
const HEALTH_ERROR_WINDOW_MS: i64 = 5 * 60 * 1000;

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let now_ms = Utc::now().timestamp_millis();
    let score = state.counters.health_score(HEALTH_ERROR_WINDOW_MS, now_ms);
    let counters = state.counters.snapshot();
    let phases = state.phases_snapshot();
    let sessions = phases
        .into_iter()
        .map(|(account, phase)| SessionSummary {
            account,
            phase: phase.to_string(),
        })
        .collect();

    let recent_errors = state.counters.errors_since(now_ms - HEALTH_ERROR_WINDOW_MS);
    let mut by_severity: HashMap<String, usize> = HashMap::new();
    let mut by_category: HashMap<String, usize> = HashMap::new();
    let mut critical = 0usize;
    let mut error = 0usize;
    let mut warning = 0usize;
    for e in &recent_errors {
        let severity_key = format!("{:?}", e.severity).to_uppercase();
        *by_severity.entry(severity_key).or_insert(0) += 1;
        *by_category.entry(e.category.clone()).or_insert(0) += 1;
        match e.severity {
            crate::metrics::Severity::Critical => critical += 1,
            crate::metrics::Severity::Error => error += 1,
            crate::metrics::Severity::Warning => warning += 1,
        }
    }
    let window_minutes = HEALTH_ERROR_WINDOW_MS as f64 / 60_000.0;

    Json(HealthResponse {
        system_health: SystemHealth {
            score,
            status: health_status_for_score(score),
            uptime_seconds: counters.uptime_seconds,
        },
        counters,
        sessions,
        error_summary: ErrorSummary {
            total: recent_errors.len(),
            by_severity,
            by_category,
        },
        error_rates: ErrorRates {
            critical_per_minute: critical as f64 / window_minutes,
            error_per_minute: error as f64 / window_minutes,
            warning_per_minute: warning as f64 / window_minutes,
        },
    })
}

#[derive(Deserialize)]
struct ErrorsQuery {
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    window: Option<i64>,
}

async fn errors(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ErrorsQuery>,
) -> impl IntoResponse {
    let now_ms = Utc::now().timestamp_millis();
    let window_ms = query.window.unwrap_or(60).max(1) * 60_000;
    let mut events = state.counters.errors_since(now_ms - window_ms);
    if let Some(category) = query.category {
        events.retain(|e| e.category == category);
    }
    Json(serde_json::json!({ "count": events.len(), "events": events }))
}

#[derive(Deserialize)]
struct ClearErrorsRequest {
    hours: i64,
}

async fn clear_errors(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ClearErrorsRequest>,
) -> impl IntoResponse {
    let now_ms = Utc::now().timestamp_millis();
    let cutoff = now_ms - body.hours.max(0) * 3_600_000;
    let removed = state.counters.clear_errors_older_than(cutoff);
    Json(serde_json::json!({ "removed": removed }))
}

impl IntoResponse for FleetError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            FleetError::RoutingEmpty { .. } => StatusCode::CONFLICT,
            FleetError::ConfigInvalid(_) => StatusCode::BAD_REQUEST,
            FleetError::PortProtected { .. } => StatusCode::BAD_REQUEST,
            FleetError::DeadlineExceeded { .. } => StatusCode::OK,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

async fn signal(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Signal>,
) -> impl IntoResponse {
    let sessions = state.sessions.read().clone();
    match state.executor.dispatch(&body, &sessions, &state.config, None).await {
        Ok(report) => {
            let status = if report.reports.is_empty() {
                // No session was healthy/present enough to even attempt
                // dispatch — distinct from a dispatched order being rejected.
                StatusCode::SERVICE_UNAVAILABLE
            } else if report.reports.iter().any(|r| r.success) {
                StatusCode::OK
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            for r in report.reports.iter().filter(|r| r.success) {
                state.record_active_symbol(&r.account, &body.symbol);
            }
            state.record_signal_processed(format!(
                "{} {} {}",
                body.symbol,
                body.action,
                body.strategy_tag.as_deref().unwrap_or("-")
            ));
            (status, Json(report)).into_response()
        }
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
struct TradeRequest {
    #[serde(flatten)]
    signal: Signal,
    accounts: Vec<String>,
}

async fn trade(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TradeRequest>,
) -> impl IntoResponse {
    let sessions = state.sessions.read().clone();
    let explicit = body.accounts.into_iter().map(AccountId::from).collect();
    match state
        .executor
        .dispatch(&body.signal, &sessions, &state.config, Some(explicit))
        .await
    {
        Ok(report) => {
            for r in report.reports.iter().filter(|r| r.success) {
                state.record_active_symbol(&r.account, &body.signal.symbol);
            }
            state.record_signal_processed(format!(
                "{} {} {}",
                body.signal.symbol,
                body.signal.action,
                body.signal.strategy_tag.as_deref().unwrap_or("-")
            ));
            (StatusCode::OK, Json(report)).into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn startup_monitoring(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let phases = state.phases_snapshot();
    Json(phases)
}

#[derive(Deserialize)]
struct StartupModeRequest {
    mode: StartupMode,
}

async fn startup_monitoring_control(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StartupModeRequest>,
) -> impl IntoResponse {
    info!(mode = %body.mode, "startup monitoring mode changed via control surface");
    state.set_startup_mode(body.mode);
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_status_buckets_match_spec_thresholds() {
        assert_eq!(health_status_for_score(100), "HEALTHY");
        assert_eq!(health_status_for_score(90), "HEALTHY");
        assert_eq!(health_status_for_score(89), "DEGRADED");
        assert_eq!(health_status_for_score(70), "DEGRADED");
        assert_eq!(health_status_for_score(69), "WARNING");
        assert_eq!(health_status_for_score(50), "WARNING");
        assert_eq!(health_status_for_score(49), "CRITICAL");
        assert_eq!(health_status_for_score(0), "CRITICAL");
    }
}
