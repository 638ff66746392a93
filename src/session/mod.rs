// =============================================================================
// Account Session — binds a tab to an account identity (C8)
// =============================================================================
//
// Exists only while the owning instance's phase is READY. Owns script
// injection/version tracking and serializes CRITICAL operations through a
// single async mutex per session, mirroring `execution.rs`'s per-symbol
// lock-before-submit discipline in the teacher repo, generalized from one
// lock per symbol to one lock per account session.
// =============================================================================

pub mod page_driver;

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument};

use crate::devtools::circuit::CircuitRegistry;
use crate::devtools::evaluator::safe_evaluate;
use crate::devtools::retry::OperationClass;
use crate::devtools::transport::DevToolsConnection;
use crate::error::{FleetError, FleetResult};
use crate::metrics::CounterBoard;
use crate::session::page_driver::{
    autotrade_expression, click_exit_expression, get_market_data_expression, update_symbol_expression,
    ExitAlias, MarketDataPayload, OrderFeedback,
};
use crate::types::{Action, AccountId, MarketSnapshot, OrderType, TabId};

/// Fixed injection order: console interceptor, trading driver, then
/// account/risk helpers (spec §4.8, §9's "first injected script" note).
pub const PAGE_SCRIPT_BUNDLE: [&str; 3] = [
    "console-interceptor.js",
    "trading-driver.js",
    "account-risk-helpers.js",
];

pub struct AccountSession {
    pub account_id: AccountId,
    pub tab: TabId,
    connection: Arc<DevToolsConnection>,
    circuits: Arc<CircuitRegistry>,
    counters: Arc<CounterBoard>,
    /// Serializes CRITICAL operations: at most one in flight per session.
    critical_lock: tokio::sync::Mutex<()>,
    injected_scripts_version: parking_lot::Mutex<u32>,
}

impl AccountSession {
    pub fn new(
        account_id: AccountId,
        tab: TabId,
        connection: Arc<DevToolsConnection>,
        circuits: Arc<CircuitRegistry>,
        counters: Arc<CounterBoard>,
    ) -> Self {
        Self {
            account_id,
            tab,
            connection,
            circuits,
            counters,
            critical_lock: tokio::sync::Mutex::new(()),
            injected_scripts_version: parking_lot::Mutex::new(0),
        }
    }

    pub fn scripts_version(&self) -> u32 {
        *self.injected_scripts_version.lock()
    }

    /// The underlying DevTools connection, for callers outside the session
    /// (the health probe) that need to run their own `safe_evaluate` call
    /// against this tab.
    pub fn connection_handle(&self) -> Arc<DevToolsConnection> {
        self.connection.clone()
    }

    /// Inject the fixed script bundle in order and bump the version. Called
    /// on session creation and again after any tab-invalidating event
    /// (navigation, reload, crash-restart).
    #[instrument(skip(self, script_source))]
    pub async fn inject_scripts(&self, script_source: impl Fn(&str) -> String) -> FleetResult<()> {
        for name in PAGE_SCRIPT_BUNDLE {
            let src = script_source(name);
            safe_evaluate(
                &self.tab,
                &self.connection,
                &self.circuits,
                &self.counters,
                &src,
                &format!("inject {name}"),
                OperationClass::Important,
                None,
            )
            .await?;
        }
        let mut version = self.injected_scripts_version.lock();
        *version += 1;
        info!(account = %self.account_id, version = *version, "page scripts (re)injected");
        Ok(())
    }

    async fn require_value(
        &self,
        js: &str,
        description: &str,
        op_class: OperationClass,
    ) -> FleetResult<serde_json::Value> {
        safe_evaluate(
            &self.tab,
            &self.connection,
            &self.circuits,
            &self.counters,
            js,
            description,
            op_class,
            None,
        )
        .await
    }

    /// CRITICAL: submit one bracket leg via the page's `autoTrade`.
    pub async fn place_order(
        &self,
        symbol: &str,
        quantity: f64,
        action: Action,
        tp_ticks: Option<f64>,
        sl_ticks: Option<f64>,
        tick_size: f64,
        order_type: Option<OrderType>,
    ) -> FleetResult<OrderFeedback> {
        let _guard = self.critical_lock.lock().await;
        let expr = autotrade_expression(symbol, quantity, action, tp_ticks, sl_ticks, tick_size, order_type);
        let value = self
            .require_value(&expr, "autoTrade", OperationClass::Critical)
            .await?;
        serde_json::from_value(value).map_err(|e| FleetError::Malformed {
            tab: self.tab.to_string(),
            reason: format!("autoTrade result did not match OrderFeedback: {e}"),
        })
    }

    /// CRITICAL: exit/reverse/cancel positions for a symbol.
    pub async fn exit_positions(&self, symbol: &str, alias: ExitAlias) -> FleetResult<bool> {
        let _guard = self.critical_lock.lock().await;
        let expr = click_exit_expression(symbol, alias);
        let value = self
            .require_value(&expr, "clickExitForSymbol", OperationClass::Critical)
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    /// IMPORTANT: update a page selector's value (e.g. active symbol field).
    pub async fn update_symbol(&self, selector: &str, value: &str) -> FleetResult<()> {
        let expr = update_symbol_expression(selector, value);
        self.require_value(&expr, "updateSymbol", OperationClass::Important)
            .await?;
        Ok(())
    }

    /// IMPORTANT: read the current bid/ask for a symbol. A missing snapshot
    /// must never be papered over — returning `None` here is a hard error at
    /// the composer, not a fallback to stale data.
    pub async fn market_data(&self, symbol: &str) -> FleetResult<Option<MarketSnapshot>> {
        let expr = get_market_data_expression(symbol);
        let value = self
            .require_value(&expr, "getMarketData", OperationClass::Important)
            .await?;
        if value.is_null() {
            return Ok(None);
        }
        let payload: MarketDataPayload = serde_json::from_value(value).map_err(|e| FleetError::Malformed {
            tab: self.tab.to_string(),
            reason: format!("getMarketData result did not match expected shape: {e}"),
        })?;
        Ok(Some(MarketSnapshot {
            bid: payload.bid_price,
            ask: payload.offer_price,
        }))
    }

    /// NON_CRITICAL: read the captured console log (fed by the console
    /// interceptor script into an append-only buffer on the page).
    pub async fn read_console_log(&self) -> FleetResult<Vec<String>> {
        let value = self
            .require_value(
                "window.__fleetConsoleBuffer || []",
                "read console log",
                OperationClass::NonCritical,
            )
            .await?;
        let lines: Vec<String> = serde_json::from_value(value).unwrap_or_default();
        Ok(lines)
    }

    /// NON_CRITICAL: read the account table rendered in the page UI.
    pub async fn read_account_table(&self) -> FleetResult<serde_json::Value> {
        self.require_value(
            "window.__fleetAccountTable || null",
            "read account table",
            OperationClass::Important,
        )
        .await
    }

    /// Suppress native `alert()`/`confirm()` dialogs, the final READY gate
    /// in spec §4.7.
    pub async fn suppress_alert_dialogs(&self) -> FleetResult<()> {
        self.require_value(
            "window.alert = () => {}; window.confirm = () => true; true",
            "suppress alert dialogs",
            OperationClass::Important,
        )
        .await?;
        Ok(())
    }

    /// Probe the page for the required globally-named functions — the READY
    /// gate (spec §4.7 item 6); the health probe (C5) runs the same check.
    pub async fn required_functions_present(&self) -> FleetResult<bool> {
        let expr = crate::session::page_driver::required_functions_expression();
        let value = self
            .require_value(&expr, "check required functions", OperationClass::Important)
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    /// Read `window.location.href` — used to confirm the tab navigated to
    /// the configured trading host (LOADING_PAGE gate, spec §4.7 item 4) and
    /// to detect a login redirect (C5's MISAUTHENTICATED check).
    pub async fn current_url(&self) -> FleetResult<String> {
        let expr = crate::session::page_driver::current_url_expression();
        let value = self
            .require_value(expr, "read current url", OperationClass::NonCritical)
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    /// CRITICAL: submit credentials to the page's login form. Never logs the
    /// password; only the JS expression embeds it, which the evaluator's own
    /// tracing only ever fingerprints.
    pub async fn inject_credentials(&self, username: &str, password: &str) -> FleetResult<()> {
        let _guard = self.critical_lock.lock().await;
        let expr = crate::session::page_driver::submit_login_expression(username, password);
        self.require_value(&expr, "submit login credentials", OperationClass::Critical)
            .await?;
        Ok(())
    }

    /// IMPORTANT: whether the login form is still present — the
    /// AUTHENTICATING gate (spec §4.7 item 5) polls this until it clears.
    pub async fn login_form_present(&self) -> FleetResult<bool> {
        let expr = crate::session::page_driver::login_form_present_expression();
        let value = self
            .require_value(expr, "check login form presence", OperationClass::Important)
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }
}

pub const REQUEST_DEADLINE: Duration = Duration::from_secs(30);

#[cfg(test)]
mod tests {
    use super::PAGE_SCRIPT_BUNDLE;

    #[test]
    fn script_bundle_injects_console_interceptor_first() {
        assert_eq!(PAGE_SCRIPT_BUNDLE[0], "console-interceptor.js");
        assert_eq!(PAGE_SCRIPT_BUNDLE[1], "trading-driver.js");
    }
}
