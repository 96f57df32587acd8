//! Exchange types shared by every connector

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Get the opposite side
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    /// Market order (immediate execution, no price)
    Market,
    /// Limit order (price required)
    Limit,
    /// Stop order (stop price required)
    Stop,
    /// Stop-limit order (stop price required, limit price defaults to stop price)
    StopLimit,
}

/// Lifecycle status of an exchange order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Open,
    Closed,
    Canceled,
    Expired,
    Rejected,
}

/// 24h ticker snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    /// Unified symbol (e.g., "BTC/USDT")
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    /// Base-asset volume over the last 24h
    pub volume: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl Ticker {
    /// Approximate 24h volume in quote currency
    pub fn quote_volume(&self) -> Decimal {
        self.volume * self.last
    }
}

/// OHLCV candle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Candle open time
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// A single order book level
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Decimal,
    pub amount: Decimal,
}

/// Order book snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBook {
    pub symbol: String,
    /// Bids, best (highest) first
    pub bids: Vec<BookLevel>,
    /// Asks, best (lowest) first
    pub asks: Vec<BookLevel>,
    pub timestamp: DateTime<Utc>,
}

impl OrderBook {
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }
}

/// Balance of a single asset
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Balance {
    pub free: Decimal,
    pub locked: Decimal,
    pub total: Decimal,
}

impl Balance {
    pub fn new(free: Decimal, locked: Decimal) -> Self {
        Self {
            free,
            locked,
            total: free + locked,
        }
    }
}

/// An order to be submitted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub order_type: OrderType,
    pub side: OrderSide,
    /// Base-asset quantity
    pub amount: Decimal,
    /// Limit price
    pub price: Option<Decimal>,
    /// Trigger price for stop orders
    pub stop_price: Option<Decimal>,
}

impl OrderRequest {
    /// Create a market order request
    pub fn market(symbol: impl Into<String>, side: OrderSide, amount: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            order_type: OrderType::Market,
            side,
            amount,
            price: None,
            stop_price: None,
        }
    }

    /// Create a limit order request
    pub fn limit(symbol: impl Into<String>, side: OrderSide, amount: Decimal, price: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            order_type: OrderType::Limit,
            side,
            amount,
            price: Some(price),
            stop_price: None,
        }
    }

    /// Create a stop order request
    pub fn stop(
        symbol: impl Into<String>,
        side: OrderSide,
        amount: Decimal,
        stop_price: Decimal,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            order_type: OrderType::Stop,
            side,
            amount,
            price: None,
            stop_price: Some(stop_price),
        }
    }

    /// Check the request is well formed. Must run before any network call.
    pub fn validate(&self) -> Result<(), ExchangeError> {
        if self.symbol.trim().is_empty() {
            return Err(ExchangeError::InvalidOrder("symbol is empty".to_string()));
        }
        if self.amount <= Decimal::ZERO {
            return Err(ExchangeError::InvalidOrder(format!(
                "amount must be positive, got {}",
                self.amount
            )));
        }

        match self.order_type {
            OrderType::Market => Ok(()),
            OrderType::Limit => match self.price {
                Some(p) if p > Decimal::ZERO => Ok(()),
                Some(p) => Err(ExchangeError::InvalidOrder(format!(
                    "limit price must be positive, got {p}"
                ))),
                None => Err(ExchangeError::InvalidOrder(
                    "price required for limit order".to_string(),
                )),
            },
            OrderType::Stop | OrderType::StopLimit => match self.stop_price {
                Some(p) if p > Decimal::ZERO => Ok(()),
                Some(p) => Err(ExchangeError::InvalidOrder(format!(
                    "stop price must be positive, got {p}"
                ))),
                None => Err(ExchangeError::InvalidOrder(
                    "stop price required for stop order".to_string(),
                )),
            },
        }
    }
}

/// Fee charged on an order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fee {
    pub cost: Decimal,
    pub currency: String,
}

/// An order as reported by the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Exchange order identifier
    pub id: String,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub order_type: OrderType,
    pub side: OrderSide,
    /// Limit price, if any
    pub price: Option<Decimal>,
    /// Trigger price for stop orders
    pub stop_price: Option<Decimal>,
    /// Average fill price, if anything filled
    pub average: Option<Decimal>,
    pub amount: Decimal,
    pub filled: Decimal,
    pub remaining: Decimal,
    pub status: OrderStatus,
    pub fee: Option<Fee>,
    pub timestamp: DateTime<Utc>,
}

/// Exchange errors
///
/// Transient variants (rate limit, timeout, network) are safe to retry on the
/// next timer tick; connectors never retry on their own.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExchangeError {
    /// Request rate limit hit
    #[error("rate limited: {0}")]
    RateLimited(String),
    /// Request timed out
    #[error("request timed out: {0}")]
    Timeout(String),
    /// Connection or server-side failure
    #[error("network error: {0}")]
    Network(String),
    /// Credentials missing, invalid or revoked
    #[error("authentication failed: {0}")]
    Auth(String),
    /// Symbol unknown to the exchange
    #[error("invalid symbol: {0}")]
    InvalidSymbol(String),
    /// Not enough balance for the order
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    /// Exchange refused the request
    #[error("rejected by exchange: {0}")]
    Rejected(String),
    /// Malformed order parameters, raised before any I/O
    #[error("invalid order: {0}")]
    InvalidOrder(String),
    /// Exchange name not registered
    #[error("exchange {0} not connected")]
    NotConnected(String),
    /// No connector implementation for this exchange kind
    #[error("unsupported exchange: {0}")]
    UnsupportedExchange(String),
    /// Unexpected response payload
    #[error("failed to decode exchange response: {0}")]
    Decode(String),
}

impl ExchangeError {
    /// Whether the next tick may succeed without intervention
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExchangeError::RateLimited(_) | ExchangeError::Timeout(_) | ExchangeError::Network(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_market_order_needs_no_price() {
        let req = OrderRequest::market("BTC/USDT", OrderSide::Buy, dec!(0.5));
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_limit_order_requires_price() {
        let mut req = OrderRequest::market("BTC/USDT", OrderSide::Buy, dec!(1));
        req.order_type = OrderType::Limit;
        assert!(matches!(req.validate(), Err(ExchangeError::InvalidOrder(_))));

        let req = OrderRequest::limit("BTC/USDT", OrderSide::Buy, dec!(1), dec!(42000));
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_stop_orders_require_stop_price() {
        let mut req = OrderRequest::market("ETH/USDT", OrderSide::Sell, dec!(2));
        req.order_type = OrderType::Stop;
        assert!(req.validate().is_err());

        req.order_type = OrderType::StopLimit;
        req.price = Some(dec!(1900));
        assert!(req.validate().is_err());

        req.stop_price = Some(dec!(1950));
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_non_positive_amount_rejected() {
        let req = OrderRequest::market("BTC/USDT", OrderSide::Buy, dec!(0));
        assert!(req.validate().is_err());

        let req = OrderRequest::market("BTC/USDT", OrderSide::Buy, dec!(-1));
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_transient_classification() {
        assert!(ExchangeError::RateLimited("429".into()).is_transient());
        assert!(ExchangeError::Timeout("30s".into()).is_transient());
        assert!(ExchangeError::Network("reset".into()).is_transient());
        assert!(!ExchangeError::InsufficientFunds("USDT".into()).is_transient());
        assert!(!ExchangeError::Auth("revoked".into()).is_transient());
        assert!(!ExchangeError::NotConnected("kraken".into()).is_transient());
    }

    #[test]
    fn test_order_side_opposite() {
        assert_eq!(OrderSide::Buy.opposite(), OrderSide::Sell);
        assert_eq!(OrderSide::Sell.opposite(), OrderSide::Buy);
    }

    #[test]
    fn test_quote_volume() {
        let ticker = Ticker {
            symbol: "ARB/USDT".to_string(),
            bid: dec!(0.99),
            ask: dec!(1.01),
            last: dec!(1.00),
            high: dec!(1.10),
            low: dec!(0.95),
            volume: dec!(2500000),
            timestamp: Utc::now(),
        };
        assert_eq!(ticker.quote_volume(), dec!(2500000));
    }

    #[test]
    fn test_order_book_best_levels() {
        let book = OrderBook {
            symbol: "BTC/USDT".to_string(),
            bids: vec![BookLevel {
                price: dec!(100),
                amount: dec!(1),
            }],
            asks: vec![],
            timestamp: Utc::now(),
        };
        assert_eq!(book.best_bid(), Some(dec!(100)));
        assert_eq!(book.best_ask(), None);
    }
}
