// =============================================================================
// Order Composer — builds a NormalizedOrderIntent from a Signal (C10)
// =============================================================================

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{FleetError, FleetResult};
use crate::signal::contract::front_quarter_contract;
use crate::types::{Action, MarketSnapshot, OrderType};

/// Per-root-symbol contract facts: tick size and precision are properties
/// of the instrument, never a user preference (spec §4.10 item 2).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RootSymbolSpec {
    pub tick_size: f64,
    pub decimal_precision: u32,
    pub default_tp_ticks: f64,
    pub default_sl_ticks: f64,
}

impl Default for RootSymbolSpec {
    fn default() -> Self {
        Self {
            tick_size: 0.25,
            decimal_precision: 2,
            default_tp_ticks: 15.0,
            default_sl_ticks: 15.0,
        }
    }
}

/// Inbound trading signal, as received from the webhook (spec §3).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Signal {
    pub symbol: String,
    pub action: Action,
    pub quantity: f64,
    #[serde(default)]
    pub strategy_tag: Option<String>,
    #[serde(default)]
    pub entry_price: Option<f64>,
    #[serde(default)]
    pub tp_ticks: Option<f64>,
    #[serde(default)]
    pub sl_ticks: Option<f64>,
    #[serde(default)]
    pub order_type: Option<OrderType>,
    #[serde(default)]
    pub tp_enabled: Option<bool>,
    #[serde(default)]
    pub sl_enabled: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NormalizedOrderIntent {
    pub contract_symbol: String,
    pub action: Action,
    pub quantity: f64,
    pub order_type: OrderType,
    pub entry_price: Option<f64>,
    pub tp_price: Option<f64>,
    pub sl_price: Option<f64>,
    /// Ticks from entry the page driver's `autoTrade` should use for the TP
    /// leg — distinct from `tp_price`, which is only for reporting back to
    /// the caller (spec Testable Property 5).
    pub tp_ticks: Option<f64>,
    pub sl_ticks: Option<f64>,
    pub tick_size: f64,
    pub decimal_precision: u32,
}

fn round_to(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    (value * factor).round() / factor
}

/// Resolve `symbol` to its front-quarter contract code if it's a 1-3 letter
/// root, else return it uppercased verbatim (spec §4.10 item 1).
pub fn normalize_symbol(symbol: &str, today: NaiveDate) -> String {
    let upper = symbol.to_uppercase();
    if upper.len() >= 1 && upper.len() <= 3 && upper.chars().all(|c| c.is_ascii_alphabetic()) {
        let fc = front_quarter_contract(today);
        format!("{upper}{fc}")
    } else {
        upper
    }
}

/// Build a [`NormalizedOrderIntent`] from `signal`, the account's root-symbol
/// spec, a config-level default for TP/SL enablement, and the current market
/// snapshot (always required — a missing snapshot is a hard error, never
/// papered over with stale data).
pub fn compose(
    signal: &Signal,
    spec: &RootSymbolSpec,
    config_tp_enabled_default: bool,
    config_sl_enabled_default: bool,
    market: Option<MarketSnapshot>,
    today: NaiveDate,
) -> FleetResult<NormalizedOrderIntent> {
    let market = market.ok_or_else(|| FleetError::OrderRejected {
        reason: "no market snapshot available; refusing to trade on stale data".to_string(),
    })?;

    let contract_symbol = normalize_symbol(&signal.symbol, today);

    // Open Question resolution: explicit order_type wins over any
    // contradictory entry_price-implied type.
    let order_type = match signal.order_type {
        Some(explicit) => explicit,
        None => infer_order_type(signal.action, signal.entry_price, market),
    };

    let entry_price = if order_type == OrderType::Market {
        None
    } else {
        signal.entry_price
    };

    // Open Question resolution: per-signal enable flag wins over config
    // default when present.
    let tp_enabled = signal.tp_enabled.unwrap_or(config_tp_enabled_default);
    let sl_enabled = signal.sl_enabled.unwrap_or(config_sl_enabled_default);

    let reference_price = entry_price.unwrap_or(match signal.action {
        Action::Buy => market.ask,
        Action::Sell => market.bid,
    });

    let tp_ticks = signal.tp_ticks.unwrap_or(spec.default_tp_ticks);
    let sl_ticks = signal.sl_ticks.unwrap_or(spec.default_sl_ticks);

    let tp_price = if tp_enabled {
        Some(round_to(
            derive_bracket_price(signal.action, reference_price, spec.tick_size, tp_ticks, true),
            spec.decimal_precision,
        ))
    } else {
        None
    };
    let sl_price = if sl_enabled {
        Some(round_to(
            derive_bracket_price(signal.action, reference_price, spec.tick_size, sl_ticks, false),
            spec.decimal_precision,
        ))
    } else {
        None
    };

    Ok(NormalizedOrderIntent {
        contract_symbol,
        action: signal.action,
        quantity: signal.quantity,
        order_type,
        entry_price: entry_price.map(|p| round_to(p, spec.decimal_precision)),
        tp_price,
        sl_price,
        tp_ticks: if tp_enabled { Some(tp_ticks) } else { None },
        sl_ticks: if sl_enabled { Some(sl_ticks) } else { None },
        tick_size: spec.tick_size,
        decimal_precision: spec.decimal_precision,
    })
}

fn infer_order_type(action: Action, entry_price: Option<f64>, market: MarketSnapshot) -> OrderType {
    let Some(entry) = entry_price else {
        return OrderType::Market;
    };
    match action {
        Action::Buy => {
            if entry < market.ask {
                OrderType::Limit
            } else {
                OrderType::Stop
            }
        }
        Action::Sell => {
            if entry > market.bid {
                OrderType::Limit
            } else {
                OrderType::Stop
            }
        }
    }
}

fn derive_bracket_price(action: Action, reference: f64, tick_size: f64, ticks: f64, is_take_profit: bool) -> f64 {
    let favorable = match (action, is_take_profit) {
        (Action::Buy, true) => true,
        (Action::Buy, false) => false,
        (Action::Sell, true) => false,
        (Action::Sell, false) => true,
    };
    if favorable {
        reference + ticks * tick_size
    } else {
        reference - ticks * tick_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn nq_spec() -> RootSymbolSpec {
        RootSymbolSpec {
            tick_size: 0.25,
            decimal_precision: 2,
            default_tp_ticks: 15.0,
            default_sl_ticks: 15.0,
        }
    }

    #[test]
    fn scenario_3_bracket_from_market_with_defaults() {
        let signal = Signal {
            symbol: "NQ".to_string(),
            action: Action::Buy,
            quantity: 1.0,
            strategy_tag: None,
            entry_price: None,
            tp_ticks: None,
            sl_ticks: None,
            order_type: None,
            tp_enabled: None,
            sl_enabled: None,
        };
        let market = MarketSnapshot {
            bid: 18999.75,
            ask: 19000.00,
        };
        let intent = compose(&signal, &nq_spec(), true, true, Some(market), date(2025, 1, 15)).unwrap();
        assert_eq!(intent.order_type, OrderType::Market);
        assert_eq!(intent.entry_price, None);
        assert_eq!(intent.tp_price, Some(19003.75));
        assert_eq!(intent.sl_price, Some(18996.25));
        assert_eq!(intent.contract_symbol, "NQH5");
    }

    #[test]
    fn scenario_4_limit_stop_inference_buy() {
        let market = MarketSnapshot {
            bid: 18999.75,
            ask: 19000.0,
        };
        let buy_limit = Signal {
            symbol: "NQ".to_string(),
            action: Action::Buy,
            quantity: 1.0,
            strategy_tag: None,
            entry_price: Some(18900.0),
            tp_ticks: None,
            sl_ticks: None,
            order_type: None,
            tp_enabled: Some(false),
            sl_enabled: Some(false),
        };
        let intent = compose(&buy_limit, &nq_spec(), true, true, Some(market), date(2025, 1, 15)).unwrap();
        assert_eq!(intent.order_type, OrderType::Limit);

        let buy_stop = Signal {
            entry_price: Some(19100.0),
            ..buy_limit
        };
        let intent = compose(&buy_stop, &nq_spec(), true, true, Some(market), date(2025, 1, 15)).unwrap();
        assert_eq!(intent.order_type, OrderType::Stop);
    }

    #[test]
    fn scenario_4_limit_stop_inference_sell() {
        let market = MarketSnapshot {
            bid: 18999.75,
            ask: 19000.0,
        };
        let sell_limit = Signal {
            symbol: "NQ".to_string(),
            action: Action::Sell,
            quantity: 1.0,
            strategy_tag: None,
            entry_price: Some(19100.0),
            tp_ticks: None,
            sl_ticks: None,
            order_type: None,
            tp_enabled: Some(false),
            sl_enabled: Some(false),
        };
        let intent = compose(&sell_limit, &nq_spec(), true, true, Some(market), date(2025, 1, 15)).unwrap();
        assert_eq!(intent.order_type, OrderType::Limit);

        let sell_stop = Signal {
            entry_price: Some(18900.0),
            ..sell_limit
        };
        let intent = compose(&sell_stop, &nq_spec(), true, true, Some(market), date(2025, 1, 15)).unwrap();
        assert_eq!(intent.order_type, OrderType::Stop);
    }

    #[test]
    fn explicit_order_type_wins_over_entry_price_inference() {
        // Open question resolution: explicit order_type always wins, even
        // when contradictory with what entry_price would imply.
        let market = MarketSnapshot {
            bid: 18999.75,
            ask: 19000.0,
        };
        let signal = Signal {
            symbol: "NQ".to_string(),
            action: Action::Buy,
            quantity: 1.0,
            strategy_tag: None,
            entry_price: Some(18900.0), // would imply LIMIT
            tp_ticks: None,
            sl_ticks: None,
            order_type: Some(OrderType::Stop), // explicit STOP wins
            tp_enabled: Some(false),
            sl_enabled: Some(false),
        };
        let intent = compose(&signal, &nq_spec(), true, true, Some(market), date(2025, 1, 15)).unwrap();
        assert_eq!(intent.order_type, OrderType::Stop);
    }

    #[test]
    fn per_signal_enable_flag_overrides_config_default() {
        let market = MarketSnapshot { bid: 100.0, ask: 100.25 };
        let signal = Signal {
            symbol: "NQ".to_string(),
            action: Action::Buy,
            quantity: 1.0,
            strategy_tag: None,
            entry_price: None,
            tp_ticks: None,
            sl_ticks: None,
            order_type: None,
            tp_enabled: Some(false),
            sl_enabled: None,
        };
        // config default is tp=true, sl=true, but per-signal tp_enabled=false wins
        let intent = compose(&signal, &nq_spec(), true, true, Some(market), date(2025, 1, 15)).unwrap();
        assert!(intent.tp_price.is_none());
        assert!(intent.sl_price.is_some());
    }

    #[test]
    fn missing_market_snapshot_is_a_hard_error() {
        let signal = Signal {
            symbol: "NQ".to_string(),
            action: Action::Buy,
            quantity: 1.0,
            strategy_tag: None,
            entry_price: None,
            tp_ticks: None,
            sl_ticks: None,
            order_type: None,
            tp_enabled: None,
            sl_enabled: None,
        };
        let err = compose(&signal, &nq_spec(), true, true, None, date(2025, 1, 15)).unwrap_err();
        assert!(matches!(err, FleetError::OrderRejected { .. }));
    }

    #[test]
    fn non_root_symbol_passes_through_uppercased() {
        assert_eq!(normalize_symbol("esz24", date(2025, 1, 15)), "ESZ24");
    }
}
