//! Strategy types

use crate::store::StoreError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Recommended action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

impl fmt::Display for SignalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SignalAction::Buy => "buy",
            SignalAction::Sell => "sell",
            SignalAction::Hold => "hold",
        })
    }
}

/// A plugin's recommendation derived from one market update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingSignal {
    pub id: Uuid,
    pub strategy_id: String,
    pub symbol: String,
    pub action: SignalAction,
    /// Priority hint in [0, 1]; never used as a gate
    pub strength: Decimal,
    pub entry_price: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    /// Fraction of current capital to commit
    pub position_size: Option<Decimal>,
    pub reasoning: String,
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Scheduled token supply unlock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnlockEvent {
    /// Token ticker, matched against a market's base asset
    pub token_symbol: String,
    #[serde(default)]
    pub token_name: Option<String>,
    pub unlock_date: DateTime<Utc>,
    pub unlock_amount: Decimal,
    /// Percent of circulating supply (5 means 5%)
    pub percent_of_supply: Decimal,
    #[serde(default)]
    pub circulating_supply: Option<Decimal>,
    #[serde(default = "default_source")]
    pub source: String,
}

fn default_source() -> String {
    "manual".to_string()
}

/// Historical daily close
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceClose {
    /// Token ticker
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub close: Decimal,
}

/// Strategy errors
#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("strategy initialization failed: {0}")]
    Initialization(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}
