//! Market data types

use crate::exchange::{Candle, ExchangeError, OrderBook, Ticker};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Kind of data a subscription polls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    Ticker,
    Ohlcv,
    OrderBook,
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DataKind::Ticker => "ticker",
            DataKind::Ohlcv => "ohlcv",
            DataKind::OrderBook => "orderbook",
        })
    }
}

/// Subscription identity: `kind:symbol:exchange[:timeframe]`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    pub fn new(kind: DataKind, symbol: &str, exchange: &str, timeframe: Option<&str>) -> Self {
        match timeframe {
            Some(tf) => Self(format!("{kind}:{symbol}:{exchange}:{tf}")),
            None => Self(format!("{kind}:{symbol}:{exchange}")),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Description of an active subscription
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub kind: DataKind,
    pub symbol: String,
    /// Resolved exchange name
    pub exchange: String,
    /// Candle timeframe for OHLCV subscriptions
    pub timeframe: Option<String>,
    /// Depth for order book subscriptions
    pub depth: Option<u32>,
    pub interval: Duration,
    pub created_at: DateTime<Utc>,
}

/// Data carried by an update
#[derive(Debug, Clone, PartialEq)]
pub enum MarketPayload {
    Ticker(Ticker),
    Candle(Candle),
    OrderBook(OrderBook),
}

/// One successful poll result
#[derive(Debug, Clone, PartialEq)]
pub struct MarketDataUpdate {
    pub subscription_id: SubscriptionId,
    pub symbol: String,
    pub exchange: String,
    pub payload: MarketPayload,
    /// When the poll completed
    pub timestamp: DateTime<Utc>,
}

impl MarketDataUpdate {
    pub fn kind(&self) -> DataKind {
        match self.payload {
            MarketPayload::Ticker(_) => DataKind::Ticker,
            MarketPayload::Candle(_) => DataKind::Ohlcv,
            MarketPayload::OrderBook(_) => DataKind::OrderBook,
        }
    }

    pub fn ticker(&self) -> Option<&Ticker> {
        match &self.payload {
            MarketPayload::Ticker(t) => Some(t),
            _ => None,
        }
    }
}

/// Service lifecycle and poll-failure notifications
#[derive(Debug, Clone, PartialEq)]
pub enum MarketDataEvent {
    Started,
    Stopped,
    /// A poll failed; the subscription keeps polling
    Error {
        subscription_id: SubscriptionId,
        error: ExchangeError,
    },
}

/// Market data errors
#[derive(Debug, Error)]
pub enum MarketDataError {
    #[error("market data service is not running")]
    NotRunning,
    #[error("poll interval must be non-zero")]
    InvalidInterval,
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}
