// =============================================================================
// Execution Coordinator — fan out one signal to N sessions in parallel (C11)
// =============================================================================
//
// Bracket legs for a given account are strictly sequential and causally
// ordered (entry, then TP, then SL); across accounts dispatch is concurrent.
// An entry rejection skips TP/SL for that account but never blocks other
// accounts. Modeled on `execution.rs`'s per-symbol sequential submission
// loop in the teacher, generalized from "per symbol" to "per account, fanned
// out across accounts concurrently".
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::future::join_all;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::config::FleetConfig;
use crate::session::page_driver::{ExitAlias, OrderFeedback, ENTRY_PRICE_SELECTOR};
use crate::session::AccountSession;
use crate::signal::composer::{compose, NormalizedOrderIntent, RootSymbolSpec, Signal};
use crate::signal::router::SignalRouter;
use crate::types::{Action, AccountId};

#[derive(Debug, Clone, Serialize)]
pub struct OrderLegReport {
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: i64,
    pub fill_price: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Timing {
    pub submitted_at: i64,
    pub first_fill_at: Option<i64>,
    pub completed_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub account: AccountId,
    pub success: bool,
    pub filled_count: u32,
    pub rejected_count: u32,
    pub rejection_reason: Option<String>,
    pub orders: Vec<OrderLegReport>,
    pub timing: Timing,
    pub circuit_state_snapshot: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedAccount {
    pub account: AccountId,
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct AggregatedResponse {
    pub requested: u32,
    pub filled: u32,
    pub rejected: u32,
    pub errored: u32,
    pub reports: Vec<ExecutionReport>,
    pub skipped: Vec<SkippedAccount>,
}

fn feedback_to_leg(kind: &str, feedback: &OrderFeedback) -> OrderLegReport {
    OrderLegReport {
        id: feedback.order_id.clone(),
        kind: kind.to_string(),
        timestamp: feedback.timing_metrics.submitted_at,
        fill_price: feedback.average_fill_price,
    }
}

async fn dispatch_bracket(
    session: &AccountSession,
    intent: &NormalizedOrderIntent,
) -> ExecutionReport {
    let submitted_at = Utc::now().timestamp_millis();
    let mut orders = Vec::new();
    let mut filled_count = 0u32;
    let mut rejected_count = 0u32;
    let mut rejection_reason = None;
    let mut first_fill_at = None;

    if let Some(entry_price) = intent.entry_price {
        if let Err(e) = session
            .update_symbol(ENTRY_PRICE_SELECTOR, &entry_price.to_string())
            .await
        {
            warn!(
                account = %session.account_id,
                error = %e,
                "failed to set entry price before order submission, continuing with venue default"
            );
        }
    }

    let entry = session
        .place_order(
            &intent.contract_symbol,
            intent.quantity,
            intent.action,
            intent.tp_ticks,
            intent.sl_ticks,
            intent.tick_size,
            Some(intent.order_type),
        )
        .await;

    let entry_feedback = match entry {
        Ok(fb) => fb,
        Err(e) => {
            warn!(account = %session.account_id, error = %e, "entry leg failed");
            return ExecutionReport {
                account: session.account_id.clone(),
                success: false,
                filled_count: 0,
                rejected_count: 1,
                rejection_reason: Some(e.to_string()),
                orders: vec![],
                timing: Timing {
                    submitted_at,
                    first_fill_at: None,
                    completed_at: Some(Utc::now().timestamp_millis()),
                },
                circuit_state_snapshot: "UNKNOWN".to_string(),
            };
        }
    };

    if !entry_feedback.success {
        rejected_count += 1;
        rejection_reason = entry_feedback.rejection_reason.clone();
        orders.push(feedback_to_leg("ENTRY", &entry_feedback));
        // Entry rejected: never attempt TP/SL for this account (spec §4.11).
        return ExecutionReport {
            account: session.account_id.clone(),
            success: false,
            filled_count,
            rejected_count,
            rejection_reason,
            orders,
            timing: Timing {
                submitted_at,
                first_fill_at: None,
                completed_at: Some(Utc::now().timestamp_millis()),
            },
            circuit_state_snapshot: "UNKNOWN".to_string(),
        };
    }

    filled_count += 1;
    if first_fill_at.is_none() {
        first_fill_at = entry_feedback.timing_metrics.first_fill_at;
    }
    orders.push(feedback_to_leg("ENTRY", &entry_feedback));

    for (kind, leg_price) in [("TAKE_PROFIT", intent.tp_price), ("STOP_LOSS", intent.sl_price)] {
        let Some(_price) = leg_price else { continue };
        let bracket_ref = entry_feedback
            .bracket_orders
            .iter()
            .find(|b| b.kind == kind);
        if let Some(bracket_ref) = bracket_ref {
            orders.push(OrderLegReport {
                id: Some(bracket_ref.order_id.clone()),
                kind: kind.to_string(),
                timestamp: Utc::now().timestamp_millis(),
                fill_price: None,
            });
            filled_count += 1;
        }
    }

    ExecutionReport {
        account: session.account_id.clone(),
        success: true,
        filled_count,
        rejected_count,
        rejection_reason,
        orders,
        timing: Timing {
            submitted_at,
            first_fill_at,
            completed_at: Some(Utc::now().timestamp_millis()),
        },
        circuit_state_snapshot: "CLOSED".to_string(),
    }
}

pub struct ExecutionCoordinator {
    pub router: SignalRouter,
    pub request_deadline: Duration,
}

impl ExecutionCoordinator {
    pub fn new(router: SignalRouter, request_deadline: Duration) -> Self {
        Self {
            router,
            request_deadline,
        }
    }

    /// Dispatch `signal` to every routed (and present) session, or restrict
    /// to `explicit_accounts` when bypassing the router (`/api/trade`).
    #[instrument(skip(self, sessions, config, explicit_accounts))]
    pub async fn dispatch(
        &self,
        signal: &Signal,
        sessions: &HashMap<AccountId, Arc<AccountSession>>,
        config: &FleetConfig,
        explicit_accounts: Option<Vec<AccountId>>,
    ) -> Result<AggregatedResponse, crate::error::FleetError> {
        let accounts = match explicit_accounts {
            Some(explicit) => explicit,
            None => self.router.route(signal.strategy_tag.as_deref()),
        };

        if accounts.is_empty() {
            return Err(crate::error::FleetError::RoutingEmpty {
                strategy_tag: signal.strategy_tag.clone(),
            });
        }

        let deadline = Instant::now() + self.request_deadline;
        let mut skipped = Vec::new();
        let mut dispatchable = Vec::new();

        for account_id in accounts {
            if let Some(account_cfg) = config.accounts.iter().find(|a| a.display_name == account_id.0) {
                if account_cfg.assigned_port == config.protected_port {
                    skipped.push(SkippedAccount {
                        account: account_id.clone(),
                        reason: "PortProtected".to_string(),
                    });
                    continue;
                }
            }
            match sessions.get(&account_id) {
                Some(session) => dispatchable.push(session.clone()),
                None => skipped.push(SkippedAccount {
                    account: account_id,
                    reason: "NoActiveSession".to_string(),
                }),
            }
        }

        let root = signal.symbol.to_uppercase();
        let root = root.chars().take(3).collect::<String>();
        let spec = config
            .root_symbols
            .get(&root)
            .copied()
            .unwrap_or_default();

        let futures = dispatchable.into_iter().map(|session| {
            let signal = signal.clone();
            let spec = spec;
            let tp_default = config.tp_enabled_default;
            let sl_default = config.sl_enabled_default;
            let deadline = deadline;
            async move {
                if Instant::now() >= deadline {
                    return ExecutionReport {
                        account: session.account_id.clone(),
                        success: false,
                        filled_count: 0,
                        rejected_count: 0,
                        rejection_reason: Some("DEADLINE_EXCEEDED".to_string()),
                        orders: vec![],
                        timing: Timing {
                            submitted_at: Utc::now().timestamp_millis(),
                            first_fill_at: None,
                            completed_at: None,
                        },
                        circuit_state_snapshot: "UNKNOWN".to_string(),
                    };
                }

                let today = Utc::now().date_naive();
                let market = session.market_data(&signal.symbol).await.ok().flatten();
                match compose(&signal, &spec, tp_default, sl_default, market, today) {
                    Ok(intent) => dispatch_bracket(&session, &intent).await,
                    Err(e) => ExecutionReport {
                        account: session.account_id.clone(),
                        success: false,
                        filled_count: 0,
                        rejected_count: 1,
                        rejection_reason: Some(e.to_string()),
                        orders: vec![],
                        timing: Timing {
                            submitted_at: Utc::now().timestamp_millis(),
                            first_fill_at: None,
                            completed_at: Some(Utc::now().timestamp_millis()),
                        },
                        circuit_state_snapshot: "UNKNOWN".to_string(),
                    },
                }
            }
        });

        let reports: Vec<ExecutionReport> = join_all(futures).await;

        let filled = reports.iter().map(|r| r.filled_count).sum();
        let rejected = reports.iter().map(|r| r.rejected_count).sum();
        let errored = reports.iter().filter(|r| !r.success).count() as u32;

        info!(
            requested = reports.len(),
            filled, rejected, errored, skipped = skipped.len(),
            "execution coordinator dispatch complete"
        );

        Ok(AggregatedResponse {
            requested: reports.len() as u32,
            filled,
            rejected,
            errored,
            reports,
            skipped,
        })
    }
}
