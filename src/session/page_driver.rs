// =============================================================================
// In-page driver contract (C6.2) — consumed, never implemented, by us
// =============================================================================
//
// The Tampermonkey UI panel and DOM driver live in the browser page and are
// out of scope; this module only types the JS-callable functions we invoke
// and the payload shapes we parse back out of `Runtime.evaluate` results.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::{Action, OrderType};

/// `actionAlias` argument to the page's `clickExitForSymbol`.
#[derive(Debug, Clone, Copy, Serialize)]
pub enum ExitAlias {
    Exit,
    Reverse,
    CancelAll,
    CancelBids,
    CancelOffers,
}

impl std::fmt::Display for ExitAlias {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Exit => "exit",
            Self::Reverse => "reverse",
            Self::CancelAll => "cancel-all",
            Self::CancelBids => "cancel-bids",
            Self::CancelOffers => "cancel-offers",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FillRatio {
    pub filled: u32,
    pub total: u32,
    #[serde(rename = "isPartial")]
    pub is_partial: bool,
    #[serde(rename = "percentFilled")]
    pub percent_filled: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FillEvent {
    pub timestamp: i64,
    pub id: String,
    pub price: f64,
    pub quantity: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BracketOrderRef {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "orderId")]
    pub order_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimingMetrics {
    #[serde(rename = "submittedAt")]
    pub submitted_at: i64,
    #[serde(rename = "firstFillAt")]
    pub first_fill_at: Option<i64>,
    #[serde(rename = "completedAt")]
    pub completed_at: Option<i64>,
    #[serde(rename = "riskCheckTime")]
    pub risk_check_time: Option<i64>,
    #[serde(rename = "totalDuration")]
    pub total_duration: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeeLine {
    pub amount: f64,
    pub description: String,
    pub timestamp: i64,
}

/// Payload returned by the page's `autoTrade` function, one per leg
/// submitted. Field names mirror the in-page contract exactly (spec §6.2);
/// our serde renames bridge camelCase JS to snake_case Rust.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderFeedback {
    pub success: bool,
    #[serde(rename = "orderId")]
    pub order_id: Option<String>,
    #[serde(rename = "orderType")]
    pub order_type: String,
    #[serde(rename = "orderAction")]
    pub order_action: String,
    #[serde(rename = "orderQuantity")]
    pub order_quantity: f64,
    #[serde(rename = "requestedPrice")]
    pub requested_price: Option<f64>,
    #[serde(rename = "averageFillPrice")]
    pub average_fill_price: Option<f64>,
    #[serde(rename = "fillRatio")]
    pub fill_ratio: Option<FillRatio>,
    #[serde(rename = "fillEvents", default)]
    pub fill_events: Vec<FillEvent>,
    #[serde(rename = "bracketOrders", default)]
    pub bracket_orders: Vec<BracketOrderRef>,
    #[serde(rename = "rejectionReason")]
    pub rejection_reason: Option<String>,
    #[serde(rename = "timingMetrics")]
    pub timing_metrics: TimingMetrics,
    pub commission: Option<f64>,
    #[serde(default)]
    pub fees: Vec<FeeLine>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketDataPayload {
    pub symbol: String,
    #[serde(rename = "bidPrice")]
    pub bid_price: f64,
    #[serde(rename = "offerPrice")]
    pub offer_price: f64,
}

/// Build the JS expression for `autoTrade`. `tp_ticks`/`sl_ticks` are passed
/// through as `null` when the corresponding leg is disabled.
pub fn autotrade_expression(
    symbol: &str,
    quantity: f64,
    action: Action,
    tp_ticks: Option<f64>,
    sl_ticks: Option<f64>,
    tick_size: f64,
    order_type: Option<OrderType>,
) -> String {
    let action_js = match action {
        Action::Buy => "\"Buy\"",
        Action::Sell => "\"Sell\"",
    };
    let tp_js = tp_ticks.map(|v| v.to_string()).unwrap_or_else(|| "null".to_string());
    let sl_js = sl_ticks.map(|v| v.to_string()).unwrap_or_else(|| "null".to_string());
    let order_type_js = order_type
        .map(|t| format!("\"{t}\""))
        .unwrap_or_else(|| "null".to_string());
    format!(
        "autoTrade({symbol:?}, {quantity}, {action_js}, {tp_js}, {sl_js}, {tick_size}, {order_type_js})"
    )
}

pub fn click_exit_expression(symbol: &str, alias: ExitAlias) -> String {
    let alias_str = alias.to_string();
    format!("clickExitForSymbol({symbol:?}, {alias_str:?})")
}

pub fn update_symbol_expression(selector: &str, value: &str) -> String {
    format!("updateSymbol({selector:?}, {value:?})")
}

pub fn get_market_data_expression(symbol: &str) -> String {
    format!("getMarketData({symbol:?})")
}

/// Selector `updateSymbol` uses to push a LIMIT/STOP entry price into the
/// order ticket before `autoTrade` submits it.
pub const ENTRY_PRICE_SELECTOR: &str = "price-input";

/// `typeof window.X === 'function'` conjunction for every page-driver
/// function the READY gate (and the health probe) requires.
pub fn required_functions_expression() -> String {
    [
        "autoTrade",
        "clickExitForSymbol",
        "updateSymbol",
        "getMarketData",
        "getNQFrontMonth",
    ]
    .iter()
    .map(|name| format!("typeof window.{name} === 'function'"))
    .collect::<Vec<_>>()
    .join(" && ")
}

pub fn current_url_expression() -> &'static str {
    "window.location.href"
}

pub fn document_ready_expression() -> &'static str {
    "document.readyState === 'complete'"
}

/// Submit credentials to the login form via the page's own submit handler.
/// The form fields and submit wiring are out of scope; this only invokes the
/// globally-named hook the page is expected to expose.
pub fn submit_login_expression(username: &str, password: &str) -> String {
    format!("window.__fleetSubmitLogin && window.__fleetSubmitLogin({username:?}, {password:?})")
}

/// Whether the login form is still present (credentials not yet accepted, or
/// not yet submitted).
pub fn login_form_present_expression() -> &'static str {
    "typeof window.__fleetLoginFormPresent === 'function' && window.__fleetLoginFormPresent()"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn autotrade_expression_uses_null_for_disabled_legs() {
        let expr = autotrade_expression("NQH5", 1.0, Action::Buy, None, None, 0.25, None);
        assert!(expr.contains("null, null"));
        assert!(expr.contains("\"NQH5\""));
    }

    #[test]
    fn required_functions_expression_checks_all_five() {
        let expr = required_functions_expression();
        assert!(expr.contains("autoTrade"));
        assert!(expr.contains("getNQFrontMonth"));
        assert_eq!(expr.matches("&&").count(), 4);
    }

    #[test]
    fn submit_login_expression_quotes_credentials() {
        let expr = submit_login_expression("trader1", "hunter2");
        assert!(expr.contains("\"trader1\""));
        assert!(expr.contains("\"hunter2\""));
    }

    #[test]
    fn click_exit_expression_quotes_alias() {
        let expr = click_exit_expression("NQH5", ExitAlias::CancelAll);
        assert!(expr.contains("\"cancel-all\""));
    }

    #[test]
    fn order_feedback_parses_camelcase_payload() {
        let json = serde_json::json!({
            "success": true,
            "orderId": "123",
            "orderType": "MARKET",
            "orderAction": "Buy",
            "orderQuantity": 1.0,
            "averageFillPrice": 19000.0,
            "timingMetrics": {"submittedAt": 1, "totalDuration": 5}
        });
        let fb: OrderFeedback = serde_json::from_value(json).unwrap();
        assert!(fb.success);
        assert_eq!(fb.average_fill_price, Some(19000.0));
    }
}
