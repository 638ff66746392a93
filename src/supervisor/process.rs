// =============================================================================
// Process Supervisor — launch, detect, kill, restart browser instances (C6)
// =============================================================================
//
// Owns BrowserInstance rows keyed by account. Enforces the one hard rule of
// the whole system: the protected port is never touched by spawn/kill/
// restart. Modeled on `route_quality/prober.rs`'s `tokio::process::Command`
// usage for external-process control and on `binance/rate_limit.rs`'s
// windowed-counter shape for the restart budget.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::config::SupervisorConfig;
use crate::error::{FleetError, FleetResult};
use crate::types::AccountId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InstanceState {
    Registered,
    Running,
    Stopped,
    Crashed,
}

pub struct BrowserInstance {
    pub account_id: AccountId,
    pub port: u16,
    pub profile_path: std::path::PathBuf,
    pub state: InstanceState,
    pub started_at: Option<Instant>,
    pub launch_attempts: u32,
    pub last_error: Option<String>,
    child: Option<Child>,
}

impl BrowserInstance {
    fn new(account_id: AccountId, port: u16, profile_path: std::path::PathBuf) -> Self {
        Self {
            account_id,
            port,
            profile_path,
            state: InstanceState::Registered,
            started_at: None,
            launch_attempts: 0,
            last_error: None,
            child: None,
        }
    }

    pub fn os_pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }
}

/// Bounded restart budget per account over a rolling window (spec §4.6
/// default: 3 per 10 minutes).
struct RestartBudget {
    window: Duration,
    max_in_window: u32,
    attempts: VecDeque<Instant>,
}

impl RestartBudget {
    fn new(window: Duration, max_in_window: u32) -> Self {
        Self {
            window,
            max_in_window,
            attempts: VecDeque::new(),
        }
    }

    fn record_and_check(&mut self) -> bool {
        let now = Instant::now();
        while let Some(&front) = self.attempts.front() {
            if now.duration_since(front) > self.window {
                self.attempts.pop_front();
            } else {
                break;
            }
        }
        if self.attempts.len() as u32 >= self.max_in_window {
            return false;
        }
        self.attempts.push_back(now);
        true
    }
}

pub struct ProcessSupervisor {
    protected_port: u16,
    browser_binary: String,
    instances: RwLock<HashMap<AccountId, BrowserInstance>>,
    restart_budgets: RwLock<HashMap<AccountId, RestartBudget>>,
    restart_window: Duration,
    restart_max: u32,
}

impl ProcessSupervisor {
    pub fn new(config: &SupervisorConfig) -> Self {
        Self {
            protected_port: config.protected_port,
            browser_binary: config.browser_binary.clone(),
            instances: RwLock::new(HashMap::new()),
            restart_budgets: RwLock::new(HashMap::new()),
            restart_window: config.restart_window,
            restart_max: config.restart_max_attempts,
        }
    }

    fn guard_protected_port(&self, port: u16) -> FleetResult<()> {
        if port == self.protected_port {
            warn!(port, "refused supervisor action on protected port");
            return Err(FleetError::PortProtected { port });
        }
        Ok(())
    }

    pub fn register(&self, account_id: AccountId, port: u16, profile_path: std::path::PathBuf) {
        self.instances
            .write()
            .entry(account_id.clone())
            .or_insert_with(|| BrowserInstance::new(account_id, port, profile_path));
    }

    /// Launch the browser for `account_id` with remote debugging on its
    /// assigned port. Refuses and returns `PortProtected` if that port is
    /// the protected one.
    pub async fn launch(&self, account_id: &AccountId) -> FleetResult<()> {
        let port = {
            let instances = self.instances.read();
            let inst = instances
                .get(account_id)
                .ok_or_else(|| FleetError::ConfigInvalid(format!("unknown account {account_id}")))?;
            inst.port
        };
        self.guard_protected_port(port)?;

        let profile_path = {
            let instances = self.instances.read();
            instances.get(account_id).unwrap().profile_path.clone()
        };

        info!(account = %account_id, port, "launching browser instance");
        let child = Command::new(&self.browser_binary)
            .arg(format!("--remote-debugging-port={port}"))
            .arg(format!("--user-data-dir={}", profile_path.display()))
            .arg("--no-first-run")
            .spawn()
            .map_err(|e| FleetError::StartupFailed {
                phase: crate::supervisor::startup::Phase::Launching,
                reason: format!("failed to spawn browser: {e}"),
            })?;

        let mut instances = self.instances.write();
        if let Some(inst) = instances.get_mut(account_id) {
            inst.child = Some(child);
            inst.state = InstanceState::Running;
            inst.started_at = Some(Instant::now());
            inst.launch_attempts += 1;
        }
        Ok(())
    }

    /// Whether the OS process behind `account_id` has exited since the last
    /// check. Never touches the protected port's instance state beyond
    /// reading it (observation of a protected-port account is permitted).
    pub fn poll_alive(&self, account_id: &AccountId) -> bool {
        let mut instances = self.instances.write();
        let Some(inst) = instances.get_mut(account_id) else {
            return false;
        };
        match inst.child.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(Some(status)) => {
                    warn!(account = %account_id, ?status, "browser process exited");
                    inst.state = InstanceState::Crashed;
                    false
                }
                Ok(None) => true,
                Err(e) => {
                    inst.last_error = Some(e.to_string());
                    false
                }
            },
            None => false,
        }
    }

    /// Terminate the instance: SIGTERM, then SIGKILL after a grace period.
    /// Refuses on the protected port.
    pub async fn kill(&self, account_id: &AccountId) -> FleetResult<()> {
        let port = {
            let instances = self.instances.read();
            instances
                .get(account_id)
                .map(|i| i.port)
                .ok_or_else(|| FleetError::ConfigInvalid(format!("unknown account {account_id}")))?
        };
        self.guard_protected_port(port)?;

        let mut child = {
            let mut instances = self.instances.write();
            instances.get_mut(account_id).and_then(|i| i.child.take())
        };

        if let Some(child) = child.as_mut() {
            #[cfg(unix)]
            if let Some(pid) = child.id() {
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(pid as i32),
                    nix::sys::signal::Signal::SIGTERM,
                );
            }
            let grace = Duration::from_secs(5);
            let exited = tokio::time::timeout(grace, child.wait()).await;
            if exited.is_err() {
                warn!(account = %account_id, "grace period elapsed, sending SIGKILL");
                let _ = child.kill().await;
            }
        }

        let mut instances = self.instances.write();
        if let Some(inst) = instances.get_mut(account_id) {
            inst.state = InstanceState::Stopped;
        }
        Ok(())
    }

    /// Restart the instance, subject to the rolling-window budget. Refuses
    /// on the protected port before even checking the budget.
    pub async fn restart(&self, account_id: &AccountId) -> FleetResult<()> {
        let port = {
            let instances = self.instances.read();
            instances
                .get(account_id)
                .map(|i| i.port)
                .ok_or_else(|| FleetError::ConfigInvalid(format!("unknown account {account_id}")))?
        };
        self.guard_protected_port(port)?;

        let allowed = {
            let mut budgets = self.restart_budgets.write();
            let budget = budgets
                .entry(account_id.clone())
                .or_insert_with(|| RestartBudget::new(self.restart_window, self.restart_max));
            budget.record_and_check()
        };
        if !allowed {
            return Err(FleetError::StartupFailed {
                phase: crate::supervisor::startup::Phase::Registered,
                reason: format!(
                    "restart budget exhausted for account {account_id} ({} per {:?})",
                    self.restart_max, self.restart_window
                ),
            });
        }

        let _ = self.kill(account_id).await;
        self.launch(account_id).await
    }

    pub fn state_of(&self, account_id: &AccountId) -> Option<InstanceState> {
        self.instances.read().get(account_id).map(|i| i.state)
    }

    pub fn protected_port(&self) -> u16 {
        self.protected_port
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor(protected_port: u16) -> ProcessSupervisor {
        ProcessSupervisor::new(&SupervisorConfig {
            protected_port,
            browser_binary: "/bin/true".to_string(),
            restart_window: Duration::from_secs(600),
            restart_max_attempts: 3,
        })
    }

    #[tokio::test]
    async fn launch_refuses_protected_port() {
        let sup = supervisor(9222);
        let acc = AccountId::from("a");
        sup.register(acc.clone(), 9222, "/tmp/profile-a".into());
        let err = sup.launch(&acc).await.unwrap_err();
        assert!(matches!(err, FleetError::PortProtected { port: 9222 }));
    }

    #[tokio::test]
    async fn kill_refuses_protected_port() {
        let sup = supervisor(9222);
        let acc = AccountId::from("a");
        sup.register(acc.clone(), 9222, "/tmp/profile-a".into());
        let err = sup.kill(&acc).await.unwrap_err();
        assert!(matches!(err, FleetError::PortProtected { .. }));
    }

    #[tokio::test]
    async fn restart_budget_exhausts_after_max_attempts() {
        let sup = supervisor(9222);
        let acc = AccountId::from("a");
        sup.register(acc.clone(), 9300, "/tmp/profile-a".into());

        for _ in 0..3 {
            let budgets = sup.restart_budgets.write();
            drop(budgets);
            let mut budgets = sup.restart_budgets.write();
            let budget = budgets
                .entry(acc.clone())
                .or_insert_with(|| RestartBudget::new(Duration::from_secs(600), 3));
            assert!(budget.record_and_check());
        }
        let mut budgets = sup.restart_budgets.write();
        let budget = budgets.get_mut(&acc).unwrap();
        assert!(!budget.record_and_check());
    }

    #[test]
    fn register_is_idempotent() {
        let sup = supervisor(9222);
        let acc = AccountId::from("a");
        sup.register(acc.clone(), 9300, "/tmp/a".into());
        sup.register(acc.clone(), 9999, "/tmp/a-different".into());
        // Second register() call does not overwrite the first registration.
        assert_eq!(sup.instances.read().get(&acc).unwrap().port, 9300);
    }
}
