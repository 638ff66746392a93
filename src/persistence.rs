// =============================================================================
// Persistent State — crash-recovery snapshot (C15)
// =============================================================================
//
// Written atomically (temp-file + rename) on every meaningful transition:
// READY reached, last symbol changed, last signal processed, circuit
// tripped. On startup, a recent-enough snapshot seeds in-memory state.
// Credentials are never persisted here.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::devtools::circuit::CircuitState;
use crate::error::{FleetError, FleetResult};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PersistedState {
    pub snapshot_at_ms: i64,
    pub last_active_symbol: HashMap<String, String>,
    pub last_signal_id: Option<String>,
    pub circuit_states: HashMap<String, CircuitState>,
}

/// Write `state` to `path` via a temp-file-then-rename, so a crash mid-write
/// never leaves a half-written snapshot behind.
pub fn write_atomic(path: &Path, state: &PersistedState) -> FleetResult<()> {
    let json = serde_json::to_vec_pretty(state)
        .map_err(|e| FleetError::ConfigInvalid(format!("failed to serialize persisted state: {e}")))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| FleetError::ConfigInvalid(format!("failed to create state dir: {e}")))?;
    }

    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, &json)
        .map_err(|e| FleetError::ConfigInvalid(format!("failed to write temp state file: {e}")))?;
    std::fs::rename(&tmp_path, path)
        .map_err(|e| FleetError::ConfigInvalid(format!("failed to rename temp state file into place: {e}")))?;

    Ok(())
}

/// Load `path` if it exists and is no older than `max_age_ms`. Tolerates
/// absence (fresh install) and staleness (crash long ago) by returning
/// `Ok(None)` rather than an error.
pub fn load_if_recent(path: &Path, max_age_ms: i64, now_ms: i64) -> FleetResult<Option<PersistedState>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)
        .map_err(|e| FleetError::ConfigInvalid(format!("failed to read persisted state: {e}")))?;
    let state: PersistedState = serde_json::from_str(&raw)
        .map_err(|e| FleetError::ConfigInvalid(format!("malformed persisted state: {e}")))?;

    if now_ms - state.snapshot_at_ms > max_age_ms {
        warn!(
            age_ms = now_ms - state.snapshot_at_ms,
            max_age_ms, "persisted state is too stale, ignoring"
        );
        return Ok(None);
    }

    info!(snapshot_at_ms = state.snapshot_at_ms, "seeding state from recovery snapshot");
    Ok(Some(state))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_load_round_trips() {
        let dir = std::env::temp_dir().join(format!("fleet-persist-test-{}", std::process::id()));
        let path = dir.join("state.json");

        let mut state = PersistedState::default();
        state.snapshot_at_ms = 1_000_000;
        state.last_signal_id = Some("sig-1".to_string());
        state
            .last_active_symbol
            .insert("alpha".to_string(), "NQH5".to_string());

        write_atomic(&path, &state).unwrap();
        let loaded = load_if_recent(&path, 60_000, 1_030_000).unwrap().unwrap();
        assert_eq!(loaded.last_signal_id, Some("sig-1".to_string()));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn stale_snapshot_is_ignored() {
        let dir = std::env::temp_dir().join(format!("fleet-persist-test-stale-{}", std::process::id()));
        let path = dir.join("state.json");
        let state = PersistedState {
            snapshot_at_ms: 0,
            ..Default::default()
        };
        write_atomic(&path, &state).unwrap();
        let loaded = load_if_recent(&path, 1000, 1_000_000).unwrap();
        assert!(loaded.is_none());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_file_is_tolerated() {
        let path = Path::new("/nonexistent/fleet-state-does-not-exist.json");
        let loaded = load_if_recent(path, 60_000, 0).unwrap();
        assert!(loaded.is_none());
    }

}
