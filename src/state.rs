// =============================================================================
// AppState — shared handles wired together at startup
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::FleetConfig;
use crate::devtools::circuit::CircuitRegistry;
use crate::devtools::health::HealthTracker;
use crate::metrics::CounterBoard;
use crate::session::AccountSession;
use crate::signal::executor::ExecutionCoordinator;
use crate::supervisor::process::ProcessSupervisor;
use crate::supervisor::startup::{Phase, StartupTracker};
use crate::types::{AccountId, StartupMode};

pub struct AppState {
    pub config: FleetConfig,
    pub supervisor: Arc<ProcessSupervisor>,
    pub circuits: Arc<CircuitRegistry>,
    pub counters: Arc<CounterBoard>,
    pub health: Arc<HealthTracker>,
    pub sessions: RwLock<HashMap<AccountId, Arc<AccountSession>>>,
    pub startup_trackers: RwLock<HashMap<AccountId, StartupTracker>>,
    pub executor: ExecutionCoordinator,
    pub started_at_ms: i64,
    /// A short descriptor of the last signal successfully dispatched, for
    /// the crash-recovery snapshot (spec §4.15).
    pub last_signal: RwLock<Option<String>>,
    /// Last symbol each account traded, also feeding the recovery snapshot.
    pub last_active_symbol: RwLock<HashMap<AccountId, String>>,
}

impl AppState {
    pub fn phases_snapshot(&self) -> HashMap<String, Phase> {
        self.startup_trackers
            .read()
            .iter()
            .map(|(id, tracker)| (id.to_string(), tracker.phase()))
            .collect()
    }

    pub fn set_startup_mode(&self, mode: StartupMode) {
        let mut trackers = self.startup_trackers.write();
        for tracker in trackers.values_mut() {
            tracker.set_mode(mode);
        }
    }

    pub fn record_signal_processed(&self, descriptor: String) {
        *self.last_signal.write() = Some(descriptor);
    }

    pub fn record_active_symbol(&self, account: &AccountId, symbol: &str) {
        self.last_active_symbol.write().insert(account.clone(), symbol.to_string());
    }

    pub fn last_signal_snapshot(&self) -> Option<String> {
        self.last_signal.read().clone()
    }

    pub fn last_active_symbol_snapshot(&self) -> HashMap<String, String> {
        self.last_active_symbol
            .read()
            .iter()
            .map(|(account, symbol)| (account.to_string(), symbol.clone()))
            .collect()
    }
}
