//! Market data subscriptions
//!
//! Independent polling timers per (kind, symbol, exchange[, timeframe]) with a
//! broadcast channel per subscription.

mod service;
mod types;

pub use service::MarketDataService;
pub use types::{
    DataKind, MarketDataError, MarketDataEvent, MarketDataUpdate, MarketPayload, Subscription,
    SubscriptionId,
};
