//! Paper trading connector
//!
//! Prices are fed in by the caller. Market orders fill immediately at the last
//! price; limit and stop orders rest until a price update crosses them.

use super::{
    base_asset, quote_asset, Balance, Candle, ExchangeConnector, ExchangeError, ExchangeResult,
    Fee, Order, OrderBook, OrderRequest, OrderSide, OrderStatus, OrderType, Ticker,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

#[derive(Default)]
struct PaperState {
    tickers: HashMap<String, Ticker>,
    candles: HashMap<String, Vec<Candle>>,
    books: HashMap<String, OrderBook>,
    /// Injected market-data failures by symbol
    symbol_failures: HashMap<String, ExchangeError>,
    order_failure: Option<ExchangeError>,
    connect_failure: Option<ExchangeError>,
    balances: BTreeMap<String, Balance>,
    orders: Vec<Order>,
    next_id: u64,
}

/// Simulated exchange with deterministic fills
pub struct PaperConnector {
    name: String,
    fee_rate: Decimal,
    enforce_balances: bool,
    connected: AtomicBool,
    state: RwLock<PaperState>,
}

impl PaperConnector {
    /// Create a paper connector charging `fee_rate` of notional per fill
    pub fn new(name: impl Into<String>, fee_rate: Decimal) -> Self {
        Self {
            name: name.into(),
            fee_rate,
            enforce_balances: false,
            connected: AtomicBool::new(false),
            state: RwLock::new(PaperState::default()),
        }
    }

    /// Seed an asset balance. Once any balance is seeded, orders that exceed
    /// the free balance are rejected with `InsufficientFunds`.
    pub fn with_balance(mut self, asset: &str, amount: Decimal) -> Self {
        self.enforce_balances = true;
        self.state
            .get_mut()
            .balances
            .insert(asset.to_string(), Balance::new(amount, Decimal::ZERO));
        self
    }

    /// Set the full ticker for a symbol and trigger resting orders
    pub async fn set_ticker(&self, symbol: &str, last: Decimal, volume: Decimal) {
        let mut state = self.state.write().await;
        state.tickers.insert(
            symbol.to_string(),
            Ticker {
                symbol: symbol.to_string(),
                bid: last,
                ask: last,
                last,
                high: last,
                low: last,
                volume,
                timestamp: Utc::now(),
            },
        );
        self.trigger_resting(&mut state, symbol, last);
    }

    /// Move the last price, keeping the previous volume and extremes
    pub async fn set_price(&self, symbol: &str, last: Decimal) {
        let mut state = self.state.write().await;
        let ticker = state
            .tickers
            .entry(symbol.to_string())
            .or_insert_with(|| Ticker {
                symbol: symbol.to_string(),
                bid: last,
                ask: last,
                last,
                high: last,
                low: last,
                volume: Decimal::ZERO,
                timestamp: Utc::now(),
            });
        ticker.bid = last;
        ticker.ask = last;
        ticker.last = last;
        ticker.high = ticker.high.max(last);
        ticker.low = ticker.low.min(last);
        ticker.timestamp = Utc::now();
        self.trigger_resting(&mut state, symbol, last);
    }

    pub async fn set_candles(&self, symbol: &str, candles: Vec<Candle>) {
        self.state
            .write()
            .await
            .candles
            .insert(symbol.to_string(), candles);
    }

    pub async fn set_order_book(&self, book: OrderBook) {
        self.state
            .write()
            .await
            .books
            .insert(book.symbol.clone(), book);
    }

    /// Make market-data calls for `symbol` fail until cleared
    pub async fn fail_symbol(&self, symbol: &str, error: ExchangeError) {
        self.state
            .write()
            .await
            .symbol_failures
            .insert(symbol.to_string(), error);
    }

    pub async fn clear_failure(&self, symbol: &str) {
        self.state.write().await.symbol_failures.remove(symbol);
    }

    /// Make order placement fail until reset with `None`
    pub async fn fail_orders(&self, error: Option<ExchangeError>) {
        self.state.write().await.order_failure = error;
    }

    /// Make `connect` fail until reset with `None`
    pub async fn fail_connect(&self, error: Option<ExchangeError>) {
        self.state.write().await.connect_failure = error;
    }

    /// Every order placed, in submission order
    pub async fn orders(&self) -> Vec<Order> {
        self.state.read().await.orders.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn check_symbol(state: &PaperState, symbol: &str) -> ExchangeResult<()> {
        match state.symbol_failures.get(symbol) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn fill(&self, state: &mut PaperState, index: usize, price: Decimal) {
        let fee_rate = self.fee_rate;
        let enforce = self.enforce_balances;
        let order = &mut state.orders[index];

        let notional = order.amount * price;
        let fee = notional * fee_rate;
        order.average = Some(price);
        order.filled = order.amount;
        order.remaining = Decimal::ZERO;
        order.status = OrderStatus::Closed;
        order.fee = Some(Fee {
            cost: fee,
            currency: quote_asset(&order.symbol).unwrap_or("USDT").to_string(),
        });

        let side = order.side;
        let amount = order.amount;
        let base = base_asset(&order.symbol).to_string();
        let quote = quote_asset(&order.symbol).unwrap_or("USDT").to_string();

        if enforce {
            let (base_delta, quote_delta) = match side {
                OrderSide::Buy => (amount, -(notional + fee)),
                OrderSide::Sell => (-amount, notional - fee),
            };
            for (asset, delta) in [(base, base_delta), (quote, quote_delta)] {
                let balance = state.balances.entry(asset).or_default();
                *balance = Balance::new(balance.free + delta, balance.locked);
            }
        }
    }

    /// Fill resting orders crossed by a new last price
    fn trigger_resting(&self, state: &mut PaperState, symbol: &str, last: Decimal) {
        let crossed: Vec<(usize, Decimal)> = state
            .orders
            .iter()
            .enumerate()
            .filter(|(_, o)| o.symbol == symbol && o.status == OrderStatus::Open)
            .filter_map(|(i, o)| resting_fill_price(o, last).map(|p| (i, p)))
            .collect();

        for (index, price) in crossed {
            self.fill(state, index, price);
            tracing::info!(
                exchange = %self.name,
                order_id = %state.orders[index].id,
                price = %price,
                "Paper resting order filled"
            );
        }
    }
}

/// Price at which a resting order fills given the last trade, if crossed
fn resting_fill_price(order: &Order, last: Decimal) -> Option<Decimal> {
    match (order.order_type, order.side) {
        (OrderType::Limit, OrderSide::Buy) => order.price.filter(|p| last <= *p),
        (OrderType::Limit, OrderSide::Sell) => order.price.filter(|p| last >= *p),
        (OrderType::Stop | OrderType::StopLimit, side) => {
            let stop = order.stop_price?;
            let triggered = match side {
                OrderSide::Buy => last >= stop,
                OrderSide::Sell => last <= stop,
            };
            triggered.then(|| order.price.unwrap_or(last))
        }
        (OrderType::Market, _) => Some(last),
    }
}

#[async_trait]
impl ExchangeConnector for PaperConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_paper(&self) -> bool {
        true
    }

    async fn connect(&self) -> ExchangeResult<()> {
        if let Some(err) = self.state.read().await.connect_failure.clone() {
            return Err(err);
        }
        self.connected.store(true, Ordering::SeqCst);
        tracing::info!(exchange = %self.name, "Paper exchange connected");
        Ok(())
    }

    async fn disconnect(&self) -> ExchangeResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn fetch_ticker(&self, symbol: &str) -> ExchangeResult<Ticker> {
        let state = self.state.read().await;
        Self::check_symbol(&state, symbol)?;
        state
            .tickers
            .get(symbol)
            .cloned()
            .ok_or_else(|| ExchangeError::InvalidSymbol(symbol.to_string()))
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        _timeframe: &str,
        since: Option<DateTime<Utc>>,
        limit: Option<u32>,
    ) -> ExchangeResult<Vec<Candle>> {
        let state = self.state.read().await;
        Self::check_symbol(&state, symbol)?;

        let mut candles: Vec<Candle> = state
            .candles
            .get(symbol)
            .map(|c| {
                c.iter()
                    .filter(|candle| since.map_or(true, |s| candle.timestamp >= s))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some(limit) = limit {
            let excess = candles.len().saturating_sub(limit as usize);
            candles.drain(..excess);
        }
        Ok(candles)
    }

    async fn fetch_order_book(&self, symbol: &str, limit: u32) -> ExchangeResult<OrderBook> {
        let state = self.state.read().await;
        Self::check_symbol(&state, symbol)?;

        let mut book = state
            .books
            .get(symbol)
            .cloned()
            .ok_or_else(|| ExchangeError::InvalidSymbol(symbol.to_string()))?;
        book.bids.truncate(limit as usize);
        book.asks.truncate(limit as usize);
        Ok(book)
    }

    async fn fetch_balance(&self) -> ExchangeResult<BTreeMap<String, Balance>> {
        Ok(self.state.read().await.balances.clone())
    }

    async fn create_order(&self, request: &OrderRequest) -> ExchangeResult<Order> {
        request.validate()?;

        let mut state = self.state.write().await;
        if let Some(err) = state.order_failure.clone() {
            return Err(err);
        }

        let last = state
            .tickers
            .get(&request.symbol)
            .map(|t| t.last)
            .ok_or_else(|| ExchangeError::InvalidSymbol(request.symbol.clone()))?;

        if self.enforce_balances {
            let price = request.price.unwrap_or(last);
            let (asset, needed) = match request.side {
                OrderSide::Buy => (
                    quote_asset(&request.symbol).unwrap_or("USDT"),
                    request.amount * price * (Decimal::ONE + self.fee_rate),
                ),
                OrderSide::Sell => (base_asset(&request.symbol), request.amount),
            };
            let free = state.balances.get(asset).map(|b| b.free).unwrap_or_default();
            if free < needed {
                return Err(ExchangeError::InsufficientFunds(format!(
                    "{asset}: need {needed}, have {free}"
                )));
            }
        }

        state.next_id += 1;
        let order = Order {
            id: format!("paper-{}", state.next_id),
            client_order_id: None,
            symbol: request.symbol.clone(),
            order_type: request.order_type,
            side: request.side,
            price: match request.order_type {
                OrderType::StopLimit => request.price.or(request.stop_price),
                _ => request.price,
            },
            stop_price: request.stop_price,
            average: None,
            amount: request.amount,
            filled: Decimal::ZERO,
            remaining: request.amount,
            status: OrderStatus::Open,
            fee: None,
            timestamp: Utc::now(),
        };
        state.orders.push(order);
        let index = state.orders.len() - 1;

        if let Some(price) = resting_fill_price(&state.orders[index], last) {
            self.fill(&mut state, index, price);
        }

        let order = state.orders[index].clone();
        tracing::info!(
            exchange = %self.name,
            order_id = %order.id,
            symbol = %order.symbol,
            side = ?order.side,
            amount = %order.amount,
            average = ?order.average,
            status = ?order.status,
            "Paper order placed"
        );
        Ok(order)
    }

    async fn cancel_order(&self, id: &str, _symbol: &str) -> ExchangeResult<Order> {
        let mut state = self.state.write().await;
        let order = state
            .orders
            .iter_mut()
            .find(|o| o.id == id)
            .ok_or_else(|| ExchangeError::Rejected(format!("unknown order {id}")))?;

        if order.status != OrderStatus::Open {
            return Err(ExchangeError::Rejected(format!(
                "order {id} is {:?}",
                order.status
            )));
        }
        order.status = OrderStatus::Canceled;
        tracing::info!(exchange = %self.name, order_id = %id, "Paper order cancelled");
        Ok(order.clone())
    }

    async fn fetch_order(&self, id: &str, _symbol: &str) -> ExchangeResult<Order> {
        self.state
            .read()
            .await
            .orders
            .iter()
            .find(|o| o.id == id)
            .cloned()
            .ok_or_else(|| ExchangeError::Rejected(format!("unknown order {id}")))
    }

    async fn fetch_open_orders(&self, symbol: Option<&str>) -> ExchangeResult<Vec<Order>> {
        Ok(self
            .state
            .read()
            .await
            .orders
            .iter()
            .filter(|o| o.status == OrderStatus::Open)
            .filter(|o| symbol.map_or(true, |s| o.symbol == s))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    async fn connector() -> PaperConnector {
        let paper = PaperConnector::new("paper", dec!(0.001));
        paper.set_ticker("ARB/USDT", dec!(1.50), dec!(1000000)).await;
        paper
    }

    #[tokio::test]
    async fn test_market_order_fills_at_last() {
        let paper = connector().await;

        let order = paper
            .create_order(&OrderRequest::market("ARB/USDT", OrderSide::Buy, dec!(100)))
            .await
            .unwrap();

        assert_eq!(order.status, OrderStatus::Closed);
        assert_eq!(order.average, Some(dec!(1.50)));
        assert_eq!(order.filled, dec!(100));
        assert_eq!(order.fee.unwrap().cost, dec!(0.15)); // 100 * 1.50 * 0.001
    }

    #[tokio::test]
    async fn test_unknown_symbol_rejected() {
        let paper = connector().await;
        let result = paper
            .create_order(&OrderRequest::market("XYZ/USDT", OrderSide::Buy, dec!(1)))
            .await;
        assert!(matches!(result, Err(ExchangeError::InvalidSymbol(_))));
    }

    #[tokio::test]
    async fn test_invalid_order_never_recorded() {
        let paper = connector().await;
        let mut req = OrderRequest::market("ARB/USDT", OrderSide::Buy, dec!(1));
        req.order_type = OrderType::Limit;

        assert!(paper.create_order(&req).await.is_err());
        assert!(paper.orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_limit_order_rests_then_fills() {
        let paper = connector().await;
        let order = paper
            .create_order(&OrderRequest::limit(
                "ARB/USDT",
                OrderSide::Buy,
                dec!(10),
                dec!(1.40),
            ))
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Open);
        assert_eq!(paper.fetch_open_orders(Some("ARB/USDT")).await.unwrap().len(), 1);

        paper.set_price("ARB/USDT", dec!(1.39)).await;

        let order = paper.fetch_order(&order.id, "ARB/USDT").await.unwrap();
        assert_eq!(order.status, OrderStatus::Closed);
        assert_eq!(order.average, Some(dec!(1.40)));
        assert!(paper.fetch_open_orders(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_order_triggers_on_cross() {
        let paper = connector().await;
        let order = paper
            .create_order(&OrderRequest::stop("ARB/USDT", OrderSide::Sell, dec!(5), dec!(1.45)))
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Open);

        paper.set_price("ARB/USDT", dec!(1.47)).await;
        assert_eq!(
            paper.fetch_order(&order.id, "ARB/USDT").await.unwrap().status,
            OrderStatus::Open
        );

        paper.set_price("ARB/USDT", dec!(1.44)).await;
        let filled = paper.fetch_order(&order.id, "ARB/USDT").await.unwrap();
        assert_eq!(filled.status, OrderStatus::Closed);
        assert_eq!(filled.average, Some(dec!(1.44)));
    }

    #[tokio::test]
    async fn test_cancel_resting_order() {
        let paper = connector().await;
        let order = paper
            .create_order(&OrderRequest::limit(
                "ARB/USDT",
                OrderSide::Sell,
                dec!(10),
                dec!(2.00),
            ))
            .await
            .unwrap();

        let cancelled = paper.cancel_order(&order.id, "ARB/USDT").await.unwrap();
        assert_eq!(cancelled.status, OrderStatus::Canceled);

        // Second cancel is refused
        assert!(paper.cancel_order(&order.id, "ARB/USDT").await.is_err());
    }

    #[tokio::test]
    async fn test_balance_enforcement() {
        let paper = PaperConnector::new("paper", dec!(0)).with_balance("USDT", dec!(100));
        paper.set_ticker("ARB/USDT", dec!(2), dec!(1000)).await;

        let result = paper
            .create_order(&OrderRequest::market("ARB/USDT", OrderSide::Buy, dec!(60)))
            .await;
        assert!(matches!(result, Err(ExchangeError::InsufficientFunds(_))));

        paper
            .create_order(&OrderRequest::market("ARB/USDT", OrderSide::Buy, dec!(40)))
            .await
            .unwrap();
        let balances = paper.fetch_balance().await.unwrap();
        assert_eq!(balances["USDT"].free, dec!(20));
        assert_eq!(balances["ARB"].free, dec!(40));
    }

    #[tokio::test]
    async fn test_injected_symbol_failure() {
        let paper = connector().await;
        paper
            .fail_symbol("ARB/USDT", ExchangeError::Timeout("simulated".into()))
            .await;
        assert!(matches!(
            paper.fetch_ticker("ARB/USDT").await,
            Err(ExchangeError::Timeout(_))
        ));

        paper.clear_failure("ARB/USDT").await;
        assert!(paper.fetch_ticker("ARB/USDT").await.is_ok());
    }

    #[tokio::test]
    async fn test_ohlcv_since_and_limit() {
        let paper = connector().await;
        let base = Utc::now() - chrono::Duration::hours(5);
        let candles = (0..5)
            .map(|i| Candle {
                timestamp: base + chrono::Duration::hours(i),
                open: dec!(1),
                high: dec!(1),
                low: dec!(1),
                close: Decimal::from(i),
                volume: dec!(10),
            })
            .collect();
        paper.set_candles("ARB/USDT", candles).await;

        let latest = paper.fetch_ohlcv("ARB/USDT", "1h", None, Some(1)).await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].close, dec!(4));

        let since = paper
            .fetch_ohlcv("ARB/USDT", "1h", Some(base + chrono::Duration::hours(3)), None)
            .await
            .unwrap();
        assert_eq!(since.len(), 2);
    }
}
