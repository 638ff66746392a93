// =============================================================================
// Tradovate Fleet — Main Entry Point
// =============================================================================
//
// Brings up the process supervisor, drives each configured account through
// the startup state machine, then serves the control surface. Exit codes
// (spec §6.1): 0 clean, 1 unrecoverable startup, 2 config invalid, 3
// protected-port violation attempted.
// =============================================================================

mod api;
mod config;
mod devtools;
mod error;
mod metrics;
mod persistence;
mod session;
mod signal;
mod state;
mod supervisor;
mod types;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::{resolve_credentials, CONFIG_PATH_ENV};
use devtools::circuit::CircuitRegistry;
use devtools::health::HealthTracker;
use devtools::transport::{list_targets, open_tab, DevToolsConnection};
use metrics::{CounterBoard, ErrorRecord, Severity};
use persistence::{load_if_recent, write_atomic, PersistedState};
use session::AccountSession;
use signal::executor::ExecutionCoordinator;
use signal::router::SignalRouter;
use state::AppState;
use supervisor::process::ProcessSupervisor;
use supervisor::startup::{Phase, StartupTracker};
use types::{AccountId, StartupMode, TabId};

const EXIT_CLEAN: i32 = 0;
const EXIT_UNRECOVERABLE_STARTUP: i32 = 1;
const EXIT_CONFIG_INVALID: i32 = 2;
const EXIT_PROTECTED_PORT_VIOLATION: i32 = 3;

#[tokio::main]
async fn main() {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("tradovate fleet starting up");

    let config_path = std::env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./fleet-config.json"));

    let config = match config::FleetConfig::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, path = %config_path.display(), "failed to load config");
            std::process::exit(EXIT_CONFIG_INVALID);
        }
    };

    let protected_port = config::protected_port_from_env(config.protected_port);
    if config.accounts.iter().any(|a| a.assigned_port == protected_port) {
        error!(protected_port, "an account is configured on the protected port; refusing to start");
        std::process::exit(EXIT_PROTECTED_PORT_VIOLATION);
    }

    let supervisor_config = config::SupervisorConfig {
        protected_port,
        ..config.supervisor_config()
    };

    let supervisor = Arc::new(ProcessSupervisor::new(&supervisor_config));
    let circuits = Arc::new(CircuitRegistry::new());
    let counters = Arc::new(CounterBoard::new());
    let health = Arc::new(HealthTracker::new());
    let router = SignalRouter::new(config.strategy_map_as_ids(), config.default_accounts_as_ids());
    let executor = ExecutionCoordinator::new(router, std::time::Duration::from_secs(config.request_deadline_seconds));

    let now_ms = chrono::Utc::now().timestamp_millis();
    let recovered = load_if_recent(
        &config.persistence_path,
        config.persistence_max_age_minutes as i64 * 60_000,
        now_ms,
    )
    .unwrap_or_else(|e| {
        warn!(error = %e, "failed to load persisted state, starting clean");
        None
    });
    if let Some(snapshot) = &recovered {
        info!(snapshot_at_ms = snapshot.snapshot_at_ms, "resuming from persisted snapshot");
    }

    let mut startup_trackers = HashMap::new();
    for account in &config.accounts {
        let account_id = AccountId::from(account.display_name.as_str());
        supervisor.register(
            account_id.clone(),
            account.assigned_port,
            PathBuf::from(format!("./profiles/{}", account.display_name)),
        );
        startup_trackers.insert(account_id, StartupTracker::new(StartupMode::Active));
    }

    let state = Arc::new(AppState {
        config: config.clone(),
        supervisor: supervisor.clone(),
        circuits: circuits.clone(),
        counters: counters.clone(),
        health: health.clone(),
        sessions: parking_lot::RwLock::new(HashMap::new()),
        startup_trackers: parking_lot::RwLock::new(startup_trackers),
        executor,
        started_at_ms: now_ms,
        last_signal: parking_lot::RwLock::new(None),
        last_active_symbol: parking_lot::RwLock::new(HashMap::new()),
    });

    // ── Drive each account through the startup state machine ────────────
    let mut bootstrap_handles = Vec::new();
    for account in &config.accounts {
        let account_id = AccountId::from(account.display_name.as_str());
        let port = account.assigned_port;
        let credentials_ref = account.credentials_ref.clone();
        let state = state.clone();
        bootstrap_handles.push(tokio::spawn(bootstrap_account(
            state,
            account_id,
            port,
            credentials_ref,
        )));
    }

    let mut ready_count = 0usize;
    for handle in bootstrap_handles {
        if let Ok(true) = handle.await {
            ready_count += 1;
        }
    }

    if ready_count == 0 && !config.accounts.is_empty() {
        error!("no account reached READY during startup, refusing to serve traffic");
        std::process::exit(EXIT_UNRECOVERABLE_STARTUP);
    }
    info!(ready_count, total = config.accounts.len(), "startup complete");

    // ── Periodic health probe loop ───────────────────────────────────────
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(devtools::health::PROBE_INTERVAL);
            loop {
                interval.tick().await;
                let sessions = state.sessions.read().clone();
                for (account_id, session) in sessions.iter() {
                    if !state.supervisor.poll_alive(account_id) {
                        warn!(account = %account_id, "browser process no longer alive, restarting");
                        restart_account(state.clone(), account_id.clone()).await;
                        continue;
                    }

                    let report = state
                        .health
                        .probe(
                            &session.tab,
                            &session.connection_handle(),
                            &state.circuits,
                            &state.counters,
                            &state.config.trading_host,
                        )
                        .await;
                    if report.status != devtools::health::HealthStatus::Healthy {
                        warn!(account = %account_id, status = ?report.status, "session reported non-healthy by probe");
                    }
                    if state.health.should_restart(&session.tab) {
                        warn!(account = %account_id, "health probe threshold exceeded, restarting session");
                        restart_account(state.clone(), account_id.clone()).await;
                    }
                }
            }
        });
    }

    // ── Periodic persistence snapshot loop ───────────────────────────────
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                interval.tick().await;
                let snapshot = PersistedState {
                    snapshot_at_ms: chrono::Utc::now().timestamp_millis(),
                    last_active_symbol: state.last_active_symbol_snapshot(),
                    last_signal_id: state.last_signal_snapshot(),
                    circuit_states: state.circuits.snapshot(),
                };
                if let Err(e) = write_atomic(&state.config.persistence_path, &snapshot) {
                    warn!(error = %e, "failed to write persistence snapshot");
                }
            }
        });
    }

    // ── Serve the control surface ────────────────────────────────────────
    let bind_addr = std::env::var("FLEET_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8787".to_string());
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, addr = %bind_addr, "failed to bind control surface");
            std::process::exit(EXIT_UNRECOVERABLE_STARTUP);
        }
    };
    info!(addr = %bind_addr, "control surface listening");

    let app = api::routes::router(state.clone());
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "control surface server failed");
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            warn!("shutdown signal received");
        }
        _ = server => {
            error!("control surface server exited unexpectedly");
        }
    }

    info!("tradovate fleet shut down complete");
    std::process::exit(EXIT_CLEAN);
}

const TRADING_HOST_WAIT: Duration = Duration::from_secs(25);
const AUTHENTICATION_WAIT: Duration = Duration::from_secs(35);
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Poll until the tab's URL contains `trading_host`, or time out — the
/// LOADING_PAGE gate (spec §4.7 item 4).
async fn wait_for_trading_host(session: &AccountSession, trading_host: &str) -> Result<(), String> {
    let deadline = Instant::now() + TRADING_HOST_WAIT;
    loop {
        match session.current_url().await {
            Ok(url) if url.contains(trading_host) => return Ok(()),
            Ok(url) => {
                if Instant::now() >= deadline {
                    return Err(format!("tab url {url:?} never matched trading host {trading_host}"));
                }
            }
            Err(e) => {
                if Instant::now() >= deadline {
                    return Err(format!("failed to read tab url: {e}"));
                }
            }
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Poll until the login form is no longer present, or time out — the
/// AUTHENTICATING gate (spec §4.7 item 5).
async fn wait_for_authentication(session: &AccountSession) -> Result<(), String> {
    let deadline = Instant::now() + AUTHENTICATION_WAIT;
    loop {
        match session.login_form_present().await {
            Ok(false) => return Ok(()),
            Ok(true) => {
                if Instant::now() >= deadline {
                    return Err("login form still present after waiting for authentication".to_string());
                }
            }
            Err(e) => {
                if Instant::now() >= deadline {
                    return Err(format!("failed to check login form presence: {e}"));
                }
            }
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Drive one account's browser instance from REGISTERED through READY (or
/// FAILED). Returns `true` if the account reached READY.
async fn bootstrap_account(
    state: Arc<AppState>,
    account_id: AccountId,
    port: u16,
    credentials_ref: String,
) -> bool {
    let advance = |phase: Phase| {
        let completed = {
            let mut trackers = state.startup_trackers.write();
            let Some(tracker) = trackers.get_mut(&account_id) else {
                return;
            };
            let completed_phase = tracker.phase();
            let elapsed_ms = tracker.phase_elapsed_ms();
            tracker.advance(phase);
            (completed_phase, elapsed_ms)
        };
        state.counters.record_startup_phase_duration(completed.0, completed.1);
    };

    if port == state.supervisor.protected_port() {
        warn!(account = %account_id, "account is on the protected port, skipping bootstrap entirely");
        return false;
    }

    advance(Phase::Launching);
    if let Err(e) = state.supervisor.launch(&account_id).await {
        error!(account = %account_id, error = %e, "failed to launch browser instance");
        fail_account(&state, &account_id, e.to_string());
        return false;
    }

    tokio::time::sleep(Duration::from_secs(2)).await;

    advance(Phase::Connecting);
    let targets = match list_targets(port).await {
        Ok(t) => t,
        Err(e) => {
            fail_account(&state, &account_id, format!("devtools target discovery failed: {e}"));
            return false;
        }
    };
    let target = match targets.into_iter().find(|t| !t.ws_url.is_empty()) {
        Some(t) => t,
        None => match open_tab(port, &format!("https://{}", state.config.trading_host)).await {
            Ok(t) => t,
            Err(e) => {
                fail_account(&state, &account_id, format!("failed to open trading tab: {e}"));
                return false;
            }
        },
    };

    let connection = match DevToolsConnection::connect(&target.ws_url).await {
        Ok(c) => c,
        Err(e) => {
            fail_account(&state, &account_id, format!("devtools websocket connect failed: {e}"));
            return false;
        }
    };

    advance(Phase::LoadingPage);
    let tab = TabId(target.id.clone());
    let session = Arc::new(AccountSession::new(
        account_id.clone(),
        tab,
        connection,
        state.circuits.clone(),
        state.counters.clone(),
    ));

    if let Err(reason) = wait_for_trading_host(&session, &state.config.trading_host).await {
        fail_account(&state, &account_id, reason);
        return false;
    }

    let script_dir = state.config.page_script_dir.clone();
    let load_script =
        move |name: &str| -> String { std::fs::read_to_string(script_dir.join(name)).unwrap_or_default() };
    if let Err(e) = session.inject_scripts(load_script).await {
        fail_account(&state, &account_id, format!("page script injection failed: {e}"));
        return false;
    }

    advance(Phase::Authenticating);
    let credentials = match resolve_credentials(&credentials_ref) {
        Ok(c) => c,
        Err(e) => {
            fail_account(&state, &account_id, format!("failed to resolve credentials: {e}"));
            return false;
        }
    };
    if let Err(e) = session
        .inject_credentials(&credentials.username, &credentials.password)
        .await
    {
        fail_account(&state, &account_id, format!("credential injection failed: {e}"));
        return false;
    }
    if let Err(reason) = wait_for_authentication(&session).await {
        fail_account(&state, &account_id, reason);
        return false;
    }

    match session.required_functions_present().await {
        Ok(true) => {}
        Ok(false) => {
            fail_account(&state, &account_id, "required page driver functions not present".to_string());
            return false;
        }
        Err(e) => {
            fail_account(&state, &account_id, format!("readiness probe failed: {e}"));
            return false;
        }
    }
    if let Err(e) = session.suppress_alert_dialogs().await {
        fail_account(&state, &account_id, format!("failed to suppress alert dialogs: {e}"));
        return false;
    }

    advance(Phase::Ready);
    state.sessions.write().insert(account_id.clone(), session);
    info!(account = %account_id, "account session READY");
    true
}

fn fail_account(state: &Arc<AppState>, account_id: &AccountId, reason: String) {
    if let Some(tracker) = state.startup_trackers.write().get_mut(account_id) {
        let _ = tracker.fail(reason.clone());
    }
    state.counters.record_error(ErrorRecord {
        ts_ms: chrono::Utc::now().timestamp_millis(),
        category: "startup".to_string(),
        severity: Severity::Critical,
        account: Some(account_id.to_string()),
        message: reason,
    });
}

/// Restart `account_id`'s browser instance (subject to the supervisor's
/// restart budget) and re-run it through the startup state machine.
async fn restart_account(state: Arc<AppState>, account_id: AccountId) {
    let Some(account_cfg) = state
        .config
        .accounts
        .iter()
        .find(|a| a.display_name == account_id.0)
        .cloned()
    else {
        error!(account = %account_id, "restart requested for unknown account");
        return;
    };

    let old_tab = state.sessions.read().get(&account_id).map(|s| s.tab.clone());

    match state.supervisor.restart(&account_id).await {
        Ok(()) => {
            info!(account = %account_id, "browser instance restarted, re-bootstrapping session");
            state.counters.record_restart(&account_id);
            state.sessions.write().remove(&account_id);
            if let Some(tab) = old_tab {
                state.health.forget(&tab);
            }
            if let Some(tracker) = state.startup_trackers.write().get_mut(&account_id) {
                *tracker = StartupTracker::new(StartupMode::Active);
            }
            tokio::spawn(bootstrap_account(
                state.clone(),
                account_id,
                account_cfg.assigned_port,
                account_cfg.credentials_ref,
            ));
        }
        Err(e) => {
            error!(account = %account_id, error = %e, "failed to restart browser instance");
            state.counters.record_error(ErrorRecord {
                ts_ms: chrono::Utc::now().timestamp_millis(),
                category: "restart".to_string(),
                severity: Severity::Critical,
                account: Some(account_id.to_string()),
                message: e.to_string(),
            });
        }
    }
}
