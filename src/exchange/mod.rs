//! Exchange connectivity
//!
//! A uniform connector trait over spot exchanges, a signed REST connector for
//! Binance, an in-process paper connector, and the registry that routes calls
//! by exchange name.

mod binance;
mod paper;
mod registry;
mod types;

pub use binance::{BinanceConfig, BinanceConnector};
pub use paper::PaperConnector;
pub use registry::{build_connector, ExchangeRegistry};
pub use types::{
    Balance, BookLevel, Candle, ExchangeError, Fee, Order, OrderBook, OrderRequest, OrderSide,
    OrderStatus, OrderType, Ticker,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Result alias for connector calls
pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Uniform adapter over a single exchange
///
/// Implementations are safe for concurrent use. No method retries on its own;
/// errors surface with a transient/permanent classification via
/// [`ExchangeError::is_transient`].
#[async_trait]
pub trait ExchangeConnector: Send + Sync {
    /// Registry name of this connector
    fn name(&self) -> &str;

    /// Whether orders are simulated rather than sent to a real venue
    fn is_paper(&self) -> bool {
        false
    }

    /// Verify connectivity and credentials
    async fn connect(&self) -> ExchangeResult<()>;

    /// Release resources
    async fn disconnect(&self) -> ExchangeResult<()> {
        Ok(())
    }

    async fn fetch_ticker(&self, symbol: &str) -> ExchangeResult<Ticker>;

    /// Fetch candles in ascending time order
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        since: Option<DateTime<Utc>>,
        limit: Option<u32>,
    ) -> ExchangeResult<Vec<Candle>>;

    async fn fetch_order_book(&self, symbol: &str, limit: u32) -> ExchangeResult<OrderBook>;

    /// Balances keyed by asset
    async fn fetch_balance(&self) -> ExchangeResult<BTreeMap<String, Balance>>;

    /// Submit an order. Callers validate the request first.
    async fn create_order(&self, request: &OrderRequest) -> ExchangeResult<Order>;

    async fn cancel_order(&self, id: &str, symbol: &str) -> ExchangeResult<Order>;

    async fn fetch_order(&self, id: &str, symbol: &str) -> ExchangeResult<Order>;

    async fn fetch_open_orders(&self, symbol: Option<&str>) -> ExchangeResult<Vec<Order>>;
}

/// Base asset of a unified symbol ("ARB/USDT" -> "ARB")
pub fn base_asset(symbol: &str) -> &str {
    symbol.split('/').next().unwrap_or(symbol)
}

/// Quote asset of a unified symbol ("ARB/USDT" -> "USDT")
pub fn quote_asset(symbol: &str) -> Option<&str> {
    symbol.split_once('/').map(|(_, quote)| quote)
}
