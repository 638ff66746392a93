// =============================================================================
// Shared types used across the fleet
// =============================================================================

use serde::{Deserialize, Serialize};

/// Stable key for an account — the configured `display_name`, never a raw
/// index, so log lines and dashboard payloads stay meaningful across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(pub String);

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AccountId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AccountId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// DevTools target id for an attached tab (from `/json/new`'s `id` field).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TabId(pub String);

impl std::fmt::Display for TabId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TabId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Driving mode for the Startup State Machine (C7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartupMode {
    /// The machine neither observes nor drives any instance.
    Disabled,
    /// Observe phase transitions only; never initiate a restart.
    Passive,
    /// Observe and drive restarts on startup failure.
    Active,
}

impl Default for StartupMode {
    fn default() -> Self {
        Self::Passive
    }
}

impl std::fmt::Display for StartupMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => write!(f, "Disabled"),
            Self::Passive => write!(f, "Passive"),
            Self::Active => write!(f, "Active"),
        }
    }
}

/// Buy or sell side of a signal / order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Buy,
    Sell,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "Buy"),
            Self::Sell => write!(f, "Sell"),
        }
    }
}

/// Order type as placed on the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
    TrlStop,
    TrlStpLmt,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Market => "MARKET",
            Self::Limit => "LIMIT",
            Self::Stop => "STOP",
            Self::StopLimit => "STOP_LIMIT",
            Self::TrlStop => "TRL_STOP",
            Self::TrlStpLmt => "TRL_STP_LMT",
        };
        write!(f, "{s}")
    }
}

/// A market snapshot read from the page via `getMarketData` (an IMPORTANT op).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub bid: f64,
    pub ask: f64,
}
