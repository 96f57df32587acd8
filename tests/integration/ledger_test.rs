//! Integration tests for the position ledger

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::BTreeMap;
use std::sync::Arc;
use unlock_trader::exchange::{
    Balance, Candle, ExchangeConnector, ExchangeError, ExchangeRegistry, ExchangeResult, Order,
    OrderBook, OrderRequest, OrderSide, OrderStatus, PaperConnector, Ticker,
};
use unlock_trader::ledger::{
    CloseReason, LedgerError, OpenPositionRequest, PositionFilter, PositionLedger, PositionSide,
    PositionStatus,
};
use unlock_trader::store::InMemoryStore;

async fn setup() -> (Arc<PaperConnector>, PositionLedger) {
    let paper = Arc::new(PaperConnector::new("paper", dec!(0)));
    paper.set_ticker("BTC/USDT", dec!(100), dec!(5000)).await;

    let registry = Arc::new(ExchangeRegistry::new());
    registry.add_connector(paper.clone()).await.unwrap();
    let ledger = PositionLedger::new(registry, Arc::new(InMemoryStore::new()));
    (paper, ledger)
}

fn request(side: PositionSide, quantity: Decimal) -> OpenPositionRequest {
    OpenPositionRequest {
        strategy_id: "s1".to_string(),
        exchange: "paper".to_string(),
        symbol: "BTC/USDT".to_string(),
        side,
        quantity,
        stop_loss: None,
        take_profit: None,
    }
}

#[tokio::test]
async fn test_long_round_trip_pnl() {
    let (paper, ledger) = setup().await;
    let position = ledger.open(request(PositionSide::Long, dec!(2))).await.unwrap();
    assert_eq!(position.entry_price, dec!(100));

    paper.set_price("BTC/USDT", dec!(110)).await;
    let closed = ledger.close(position.id, CloseReason::Signal).await.unwrap();

    assert_eq!(closed.status, PositionStatus::Closed);
    assert_eq!(closed.pnl, dec!(20));
    assert_eq!(closed.pnl_percent, dec!(10));
    assert_eq!(closed.close_reason, Some(CloseReason::Signal));
    assert!(closed.closed_at.is_some());

    // Entry buy, exit sell
    let orders = paper.orders().await;
    assert_eq!(orders.len(), 2);
    assert_eq!(orders[0].side, OrderSide::Buy);
    assert_eq!(orders[1].side, OrderSide::Sell);
}

#[tokio::test]
async fn test_short_round_trip_pnl() {
    let (paper, ledger) = setup().await;
    let position = ledger.open(request(PositionSide::Short, dec!(2))).await.unwrap();

    paper.set_price("BTC/USDT", dec!(90)).await;
    let closed = ledger.close(position.id, CloseReason::Manual).await.unwrap();

    assert_eq!(closed.pnl, dec!(20));
    assert_eq!(paper.orders().await[1].side, OrderSide::Buy);
}

#[tokio::test]
async fn test_concurrent_close_is_safe() {
    let (paper, ledger) = setup().await;
    let position = ledger.open(request(PositionSide::Long, dec!(1))).await.unwrap();
    paper.set_price("BTC/USDT", dec!(105)).await;

    let (a, b) = tokio::join!(
        ledger.close(position.id, CloseReason::TakeProfit),
        ledger.close(position.id, CloseReason::Signal),
    );

    let (winner, loser) = match (a, b) {
        (Ok(p), Err(e)) | (Err(e), Ok(p)) => (p, e),
        other => panic!("expected exactly one close to succeed: {:?}", other),
    };
    assert!(matches!(loser, LedgerError::AlreadyClosed(id) if id == position.id));

    // Exactly one exit order, and the stored position is the winner's
    assert_eq!(paper.orders().await.len(), 2);
    let stored = ledger.get(position.id).await.unwrap();
    assert_eq!(stored, winner);
}

#[tokio::test]
async fn test_second_close_changes_nothing() {
    let (paper, ledger) = setup().await;
    let position = ledger.open(request(PositionSide::Long, dec!(1))).await.unwrap();
    let closed = ledger.close(position.id, CloseReason::Manual).await.unwrap();

    paper.set_price("BTC/USDT", dec!(150)).await;
    assert!(matches!(
        ledger.close(position.id, CloseReason::Manual).await,
        Err(LedgerError::AlreadyClosed(_))
    ));
    assert_eq!(ledger.get(position.id).await.unwrap(), closed);

    // Mark-to-market leaves closed positions alone
    assert_eq!(ledger.mark_to_market(position.id).await.unwrap(), closed);
}

#[tokio::test]
async fn test_take_profit_and_summary() {
    let (paper, ledger) = setup().await;
    paper.set_ticker("ETH/USDT", dec!(50), dec!(1000)).await;

    let mut winner = request(PositionSide::Long, dec!(1));
    winner.take_profit = Some(dec!(108));
    let winner = ledger.open(winner).await.unwrap();

    let mut loser = request(PositionSide::Short, dec!(2));
    loser.symbol = "ETH/USDT".to_string();
    loser.stop_loss = Some(dec!(55));
    let loser = ledger.open(loser).await.unwrap();

    paper.set_price("BTC/USDT", dec!(110)).await;
    paper.set_price("ETH/USDT", dec!(56)).await;

    let closed = ledger.check_stop_loss_and_take_profit(Some("s1")).await.unwrap();
    assert_eq!(closed.len(), 2);

    let by_id = |id| closed.iter().find(|p| p.id == id).unwrap();
    assert_eq!(by_id(winner.id).close_reason, Some(CloseReason::TakeProfit));
    assert_eq!(by_id(loser.id).close_reason, Some(CloseReason::StopLoss));
    assert_eq!(by_id(loser.id).pnl, dec!(-12));

    let summary = ledger.summary(Some("s1")).await.unwrap();
    assert_eq!(summary.closed_positions, 2);
    assert_eq!(summary.open_positions, 0);
    assert_eq!(summary.realized_pnl, dec!(-2));
    assert_eq!(summary.win_rate, dec!(50));
    assert_eq!(summary.avg_win, dec!(10));
    assert_eq!(summary.avg_loss, dec!(-12));
}

/// Paper venue whose market orders lapse without filling
struct LapsingVenue(PaperConnector);

#[async_trait]
impl ExchangeConnector for LapsingVenue {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn is_paper(&self) -> bool {
        true
    }

    async fn connect(&self) -> ExchangeResult<()> {
        self.0.connect().await
    }

    async fn fetch_ticker(&self, symbol: &str) -> ExchangeResult<Ticker> {
        self.0.fetch_ticker(symbol).await
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        since: Option<DateTime<Utc>>,
        limit: Option<u32>,
    ) -> ExchangeResult<Vec<Candle>> {
        self.0.fetch_ohlcv(symbol, timeframe, since, limit).await
    }

    async fn fetch_order_book(&self, symbol: &str, limit: u32) -> ExchangeResult<OrderBook> {
        self.0.fetch_order_book(symbol, limit).await
    }

    async fn fetch_balance(&self) -> ExchangeResult<BTreeMap<String, Balance>> {
        self.0.fetch_balance().await
    }

    async fn create_order(&self, request: &OrderRequest) -> ExchangeResult<Order> {
        let mut order = self.0.create_order(request).await?;
        order.status = OrderStatus::Expired;
        order.filled = Decimal::ZERO;
        order.remaining = order.amount;
        order.average = None;
        Ok(order)
    }

    async fn cancel_order(&self, id: &str, symbol: &str) -> ExchangeResult<Order> {
        self.0.cancel_order(id, symbol).await
    }

    async fn fetch_order(&self, id: &str, symbol: &str) -> ExchangeResult<Order> {
        self.0.fetch_order(id, symbol).await
    }

    async fn fetch_open_orders(&self, symbol: Option<&str>) -> ExchangeResult<Vec<Order>> {
        self.0.fetch_open_orders(symbol).await
    }
}

#[tokio::test]
async fn test_unfilled_entry_order_opens_nothing() {
    let paper = PaperConnector::new("paper", dec!(0));
    paper.set_ticker("BTC/USDT", dec!(100), dec!(5000)).await;
    let registry = Arc::new(ExchangeRegistry::new());
    registry.add_connector(Arc::new(LapsingVenue(paper))).await.unwrap();
    let ledger = PositionLedger::new(registry, Arc::new(InMemoryStore::new()));

    let err = ledger
        .open(request(PositionSide::Long, dec!(2)))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Exchange(ExchangeError::Rejected(_))));

    let positions = ledger.positions(&PositionFilter::strategy("s1")).await.unwrap();
    assert!(positions.is_empty());
}
