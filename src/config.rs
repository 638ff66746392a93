// =============================================================================
// Configuration — typed config load + defaults + validation (C13)
// =============================================================================
//
// Loaded once at startup; a change requires a process restart (spec §4.13).
// Modeled on `runtime_config.rs`'s `#[serde(default = "...")]` pattern for
// forward-compatible config files, and on `app_state.rs`'s single
// construct-once-at-startup config object.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FleetError, FleetResult};
use crate::signal::composer::RootSymbolSpec;
use crate::types::AccountId;

fn default_protected_port() -> u16 {
    9222
}

fn default_trading_host() -> String {
    "trader.tradovate.com".to_string()
}

fn default_startup_budget_seconds() -> u64 {
    120
}

fn default_request_deadline_seconds() -> u64 {
    30
}

fn default_restart_window_minutes() -> u64 {
    10
}

fn default_restart_max_attempts() -> u32 {
    3
}

fn default_tp_enabled() -> bool {
    true
}

fn default_sl_enabled() -> bool {
    true
}

fn default_browser_binary() -> String {
    "google-chrome".to_string()
}

fn default_page_script_dir() -> PathBuf {
    PathBuf::from("./page-scripts")
}

fn default_persistence_path() -> PathBuf {
    PathBuf::from("./state/fleet-state.json")
}

fn default_persistence_max_age_minutes() -> u64 {
    15
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccountConfig {
    pub display_name: String,
    /// Reference to where credentials live (e.g. an env var name or a path
    /// into a secrets file); never the credential itself.
    pub credentials_ref: String,
    pub assigned_port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FleetConfig {
    pub accounts: Vec<AccountConfig>,

    #[serde(default)]
    pub strategy_map: HashMap<String, Vec<String>>,

    #[serde(default)]
    pub default_accounts: Vec<String>,

    #[serde(default = "default_protected_port")]
    pub protected_port: u16,

    #[serde(default = "default_trading_host")]
    pub trading_host: String,

    #[serde(default)]
    pub root_symbols: HashMap<String, RootSymbolSpec>,

    #[serde(default = "default_tp_enabled")]
    pub tp_enabled_default: bool,

    #[serde(default = "default_sl_enabled")]
    pub sl_enabled_default: bool,

    #[serde(default = "default_startup_budget_seconds")]
    pub startup_budget_seconds: u64,

    #[serde(default = "default_request_deadline_seconds")]
    pub request_deadline_seconds: u64,

    #[serde(default = "default_restart_window_minutes")]
    pub restart_window_minutes: u64,

    #[serde(default = "default_restart_max_attempts")]
    pub restart_max_attempts: u32,

    #[serde(default = "default_browser_binary")]
    pub browser_binary: String,

    #[serde(default = "default_page_script_dir")]
    pub page_script_dir: PathBuf,

    #[serde(default = "default_persistence_path")]
    pub persistence_path: PathBuf,

    #[serde(default = "default_persistence_max_age_minutes")]
    pub persistence_max_age_minutes: u64,
}

/// Config subset the process supervisor needs, extracted at startup so C6
/// never holds a reference to the whole `FleetConfig`.
pub struct SupervisorConfig {
    pub protected_port: u16,
    pub browser_binary: String,
    pub restart_window: Duration,
    pub restart_max_attempts: u32,
}

impl FleetConfig {
    /// Load and validate a config file from `path`. Never performs network
    /// I/O — the binary must be able to fail fast on a bad config before any
    /// browser is launched (spec §6.4).
    pub fn load(path: &Path) -> FleetResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| FleetError::ConfigInvalid(format!("cannot read {}: {e}", path.display())))?;
        let config: FleetConfig = serde_json::from_str(&raw)
            .map_err(|e| FleetError::ConfigInvalid(format!("malformed config {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> FleetResult<()> {
        let mut ports = std::collections::HashSet::new();
        for account in &self.accounts {
            if !ports.insert(account.assigned_port) {
                return Err(FleetError::ConfigInvalid(format!(
                    "duplicate assigned_port {} across accounts",
                    account.assigned_port
                )));
            }
            if account.display_name.trim().is_empty() {
                return Err(FleetError::ConfigInvalid(
                    "account display_name must not be empty".to_string(),
                ));
            }
        }
        for (tag, names) in &self.strategy_map {
            for name in names {
                if !self.accounts.iter().any(|a| &a.display_name == name) {
                    return Err(FleetError::ConfigInvalid(format!(
                        "strategy_map[{tag}] references unknown account {name}"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn account_ids(&self) -> Vec<AccountId> {
        self.accounts.iter().map(|a| AccountId::from(a.display_name.as_str())).collect()
    }

    pub fn strategy_map_as_ids(&self) -> HashMap<String, Vec<AccountId>> {
        self.strategy_map
            .iter()
            .map(|(tag, names)| (tag.clone(), names.iter().map(|n| AccountId::from(n.as_str())).collect()))
            .collect()
    }

    pub fn default_accounts_as_ids(&self) -> Vec<AccountId> {
        self.default_accounts.iter().map(|n| AccountId::from(n.as_str())).collect()
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            protected_port: self.protected_port,
            browser_binary: self.browser_binary.clone(),
            restart_window: Duration::from_secs(self.restart_window_minutes * 60),
            restart_max_attempts: self.restart_max_attempts,
        }
    }
}

/// Optional per-op_class numeric override file (spec §6.3).
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PolicyOverrides {
    #[serde(default)]
    pub critical: Option<PolicyOverride>,
    #[serde(default)]
    pub important: Option<PolicyOverride>,
    #[serde(default)]
    pub non_critical: Option<PolicyOverride>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolicyOverride {
    pub max_attempts: Option<u32>,
    pub per_attempt_timeout_secs: Option<u64>,
    pub circuit_threshold: Option<u32>,
}

impl PolicyOverrides {
    pub fn load_if_present(path: &Path) -> FleetResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| FleetError::ConfigInvalid(format!("cannot read {}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| FleetError::ConfigInvalid(format!("malformed policy overrides {}: {e}", path.display())))
    }
}

/// Resolved login credentials for one account. Never `Debug`/`Serialize` —
/// must never reach a log line or an API response.
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Resolve `credentials_ref` as an environment variable name holding
/// `"username:password"`. The credential file/store format itself is out of
/// scope; only this one env-var convention is supported.
pub fn resolve_credentials(credentials_ref: &str) -> FleetResult<Credentials> {
    let raw = std::env::var(credentials_ref).map_err(|_| {
        FleetError::ConfigInvalid(format!("credentials_ref {credentials_ref} is not set in the environment"))
    })?;
    let (username, password) = raw.split_once(':').ok_or_else(|| {
        FleetError::ConfigInvalid(format!("{credentials_ref} must be formatted as username:password"))
    })?;
    if username.is_empty() || password.is_empty() {
        return Err(FleetError::ConfigInvalid(format!(
            "{credentials_ref} must not have an empty username or password"
        )));
    }
    Ok(Credentials {
        username: username.to_string(),
        password: password.to_string(),
    })
}

/// The protected-port environment variable name (spec §6.4).
pub const PROTECTED_PORT_ENV: &str = "TRADOVATE_PROTECTED_PORT";
pub const CONFIG_PATH_ENV: &str = "FLEET_CONFIG_PATH";

/// Resolve the protected port from the environment, falling back to the
/// config file's value when unset.
pub fn protected_port_from_env(config_default: u16) -> u16 {
    std::env::var(PROTECTED_PORT_ENV)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(config_default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> FleetConfig {
        FleetConfig {
            accounts: vec![AccountConfig {
                display_name: "alpha".to_string(),
                credentials_ref: "ALPHA_CREDS".to_string(),
                assigned_port: 9300,
            }],
            strategy_map: HashMap::new(),
            default_accounts: vec![],
            protected_port: 9222,
            trading_host: default_trading_host(),
            root_symbols: HashMap::new(),
            tp_enabled_default: true,
            sl_enabled_default: true,
            startup_budget_seconds: 120,
            request_deadline_seconds: 30,
            restart_window_minutes: 10,
            restart_max_attempts: 3,
            browser_binary: default_browser_binary(),
            page_script_dir: default_page_script_dir(),
            persistence_path: default_persistence_path(),
            persistence_max_age_minutes: 15,
        }
    }

    #[test]
    fn duplicate_assigned_ports_are_rejected() {
        let mut config = base_config();
        config.accounts.push(AccountConfig {
            display_name: "bravo".to_string(),
            credentials_ref: "BRAVO_CREDS".to_string(),
            assigned_port: 9300,
        });
        assert!(matches!(config.validate(), Err(FleetError::ConfigInvalid(_))));
    }

    #[test]
    fn strategy_map_referencing_unknown_account_is_rejected() {
        let mut config = base_config();
        config
            .strategy_map
            .insert("momentum".to_string(), vec!["ghost".to_string()]);
        assert!(matches!(config.validate(), Err(FleetError::ConfigInvalid(_))));
    }

    #[test]
    fn valid_config_passes() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn env_override_wins_over_config_default() {
        std::env::set_var(PROTECTED_PORT_ENV, "9999");
        assert_eq!(protected_port_from_env(9222), 9999);
        std::env::remove_var(PROTECTED_PORT_ENV);
    }

    #[test]
    fn resolve_credentials_splits_username_and_password() {
        std::env::set_var("FLEET_TEST_CREDS_A", "trader1:hunter2");
        let creds = resolve_credentials("FLEET_TEST_CREDS_A").unwrap();
        assert_eq!(creds.username, "trader1");
        assert_eq!(creds.password, "hunter2");
        std::env::remove_var("FLEET_TEST_CREDS_A");
    }

    #[test]
    fn resolve_credentials_rejects_missing_env_var() {
        std::env::remove_var("FLEET_TEST_CREDS_MISSING");
        assert!(matches!(
            resolve_credentials("FLEET_TEST_CREDS_MISSING"),
            Err(FleetError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn resolve_credentials_rejects_missing_separator() {
        std::env::set_var("FLEET_TEST_CREDS_B", "no-colon-here");
        assert!(matches!(
            resolve_credentials("FLEET_TEST_CREDS_B"),
            Err(FleetError::ConfigInvalid(_))
        ));
        std::env::remove_var("FLEET_TEST_CREDS_B");
    }
}
