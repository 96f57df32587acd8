//! Integration tests for the strategy orchestrator

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;
use unlock_trader::engine::{
    EngineEvent, EngineSettings, RejectReason, SignalOutcome, SignalRecord, StrategyConfig,
    StrategyOrchestrator, StrategyState,
};
use unlock_trader::exchange::{ExchangeConnector, ExchangeError, ExchangeRegistry, PaperConnector};
use unlock_trader::ledger::{
    CloseReason, OpenPositionRequest, Position, PositionFilter, PositionLedger, PositionSide,
};
use unlock_trader::market_data::{
    DataKind, MarketDataService, MarketDataUpdate, MarketPayload, SubscriptionId,
};
use unlock_trader::store::{InMemoryStore, Store, StoreError};
use unlock_trader::strategy::{DefaultPluginFactory, PriceClose, UnlockEvent};

/// In-memory store whose state writes can be switched to fail
#[derive(Default)]
struct FlakyStore {
    inner: InMemoryStore,
    fail_state_writes: AtomicBool,
}

impl FlakyStore {
    fn fail_state_writes(&self, fail: bool) {
        self.fail_state_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn load_state(&self, strategy_id: &str) -> Result<Option<StrategyState>, StoreError> {
        self.inner.load_state(strategy_id).await
    }

    async fn save_state(&self, state: &StrategyState) -> Result<(), StoreError> {
        if self.fail_state_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("disk full".to_string()));
        }
        self.inner.save_state(state).await
    }

    async fn insert_position(&self, position: &Position) -> Result<(), StoreError> {
        self.inner.insert_position(position).await
    }

    async fn update_position(&self, position: &Position) -> Result<(), StoreError> {
        self.inner.update_position(position).await
    }

    async fn get_position(&self, id: Uuid) -> Result<Option<Position>, StoreError> {
        self.inner.get_position(id).await
    }

    async fn list_positions(&self, filter: &PositionFilter) -> Result<Vec<Position>, StoreError> {
        self.inner.list_positions(filter).await
    }

    async fn insert_signal(&self, record: &SignalRecord) -> Result<(), StoreError> {
        self.inner.insert_signal(record).await
    }

    async fn update_signal(&self, record: &SignalRecord) -> Result<(), StoreError> {
        self.inner.update_signal(record).await
    }

    async fn list_signals(
        &self,
        strategy_id: &str,
        limit: usize,
    ) -> Result<Vec<SignalRecord>, StoreError> {
        self.inner.list_signals(strategy_id, limit).await
    }

    async fn upcoming_unlocks(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        min_percent: Decimal,
    ) -> Result<Vec<UnlockEvent>, StoreError> {
        self.inner.upcoming_unlocks(from, to, min_percent).await
    }

    async fn price_closes(
        &self,
        symbol: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<PriceClose>, StoreError> {
        self.inner.price_closes(symbol, since).await
    }
}

struct Engine {
    orchestrator: Arc<StrategyOrchestrator>,
    paper: Arc<PaperConnector>,
    market_data: Arc<MarketDataService>,
    ledger: Arc<PositionLedger>,
    store: Arc<FlakyStore>,
}

fn unlock(token: &str, percent: Decimal) -> UnlockEvent {
    unlock_at(token, percent, Utc::now() + Duration::hours(24))
}

fn unlock_at(token: &str, percent: Decimal, at: DateTime<Utc>) -> UnlockEvent {
    UnlockEvent {
        token_symbol: token.to_string(),
        token_name: None,
        unlock_date: at,
        unlock_amount: dec!(50000000),
        percent_of_supply: percent,
        circulating_supply: None,
        source: "test".to_string(),
    }
}

/// Engine with polling and reconciliation timers far in the future, so tests
/// drive every tick explicitly
async fn engine() -> Engine {
    engine_with(vec![unlock("ARB", dec!(10)), unlock("OP", dec!(12))]).await
}

async fn engine_with(unlocks: Vec<UnlockEvent>) -> Engine {
    let paper = Arc::new(PaperConnector::new("paper", Decimal::ZERO));
    paper.set_ticker("ARB/USDT", dec!(2), dec!(10000000)).await;
    paper.set_ticker("OP/USDT", dec!(4), dec!(10000000)).await;

    let registry = Arc::new(ExchangeRegistry::new());
    registry.add_connector(paper.clone()).await.unwrap();

    let store = Arc::new(FlakyStore::default());
    store.inner.seed(unlocks, vec![]).await;

    let market_data = Arc::new(MarketDataService::new(registry.clone()));
    let ledger = Arc::new(PositionLedger::new(registry.clone(), store.clone()));
    let orchestrator = Arc::new(StrategyOrchestrator::new(
        registry,
        market_data.clone(),
        ledger.clone(),
        store.clone(),
        Arc::new(DefaultPluginFactory::new(store.clone())),
        EngineSettings {
            reconcile_interval_secs: 3600,
            ticker_interval_ms: 3_600_000,
            ..EngineSettings::default()
        },
    ));
    orchestrator.start();

    Engine {
        orchestrator,
        paper,
        market_data,
        ledger,
        store,
    }
}

fn strategy(id: &str) -> StrategyConfig {
    StrategyConfig::new(
        id,
        vec!["ARB/USDT".to_string(), "OP/USDT".to_string()],
        "paper",
    )
}

async fn tick(paper: &PaperConnector, symbol: &str) -> MarketDataUpdate {
    let ticker = paper.fetch_ticker(symbol).await.unwrap();
    MarketDataUpdate {
        subscription_id: SubscriptionId::new(DataKind::Ticker, symbol, "paper", None),
        symbol: symbol.to_string(),
        exchange: "paper".to_string(),
        payload: MarketPayload::Ticker(ticker),
        timestamp: Utc::now(),
    }
}

#[tokio::test]
async fn test_daily_loss_limit_blocks_buys_then_emergency_stops() {
    let e = engine().await;
    let mut events = e.orchestrator.subscribe_events();
    e.orchestrator.activate_strategy(strategy("s1")).await.unwrap();

    // 1000 USDT of ARB at 2
    let outcome = e
        .orchestrator
        .handle_market_update("s1", &tick(&e.paper, "ARB/USDT").await)
        .await
        .unwrap();
    assert!(matches!(outcome, SignalOutcome::Executed { .. }));

    // Halving the price loses 500 = 5% of 10000
    e.paper.set_price("ARB/USDT", dec!(1)).await;
    e.ledger.mark_all(Some("s1")).await;

    let outcome = e
        .orchestrator
        .handle_market_update("s1", &tick(&e.paper, "OP/USDT").await)
        .await
        .unwrap();
    let SignalOutcome::Rejected { reason, .. } = outcome else {
        panic!("expected rejection, got {:?}", outcome);
    };
    assert!(matches!(reason, RejectReason::DailyLossLimit { .. }));

    let state = e.orchestrator.reconcile("s1").await.unwrap();
    assert!(state.emergency_stop_triggered);
    assert!(!state.is_active);
    assert!(state.stop_reason.unwrap().contains("daily loss"));
    assert!(!e.orchestrator.is_active("s1").await);

    let mut saw_emergency = false;
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::EmergencyStop { strategy_id, .. } = event {
            assert_eq!(strategy_id, "s1");
            saw_emergency = true;
        }
    }
    assert!(saw_emergency);

    // Rejected signals are still audited
    let signals = e.orchestrator.recent_signals("s1", 10).await.unwrap();
    assert_eq!(signals.len(), 2);
    assert!(!signals[0].executed);
    assert!(matches!(
        signals[0].rejection,
        Some(RejectReason::DailyLossLimit { .. })
    ));
}

#[tokio::test]
async fn test_max_open_positions_rejection_holds_until_close() {
    let e = engine().await;
    let mut config = strategy("s1");
    config.max_open_positions = 1;
    e.orchestrator.activate_strategy(config).await.unwrap();

    let arb = e
        .orchestrator
        .handle_market_update("s1", &tick(&e.paper, "ARB/USDT").await)
        .await
        .unwrap();
    assert!(matches!(arb, SignalOutcome::Executed { .. }));

    for _ in 0..2 {
        let op = e
            .orchestrator
            .handle_market_update("s1", &tick(&e.paper, "OP/USDT").await)
            .await
            .unwrap();
        assert!(matches!(
            op,
            SignalOutcome::Rejected {
                reason: RejectReason::MaxOpenPositions { open: 1, max: 1 },
                ..
            }
        ));
    }

    // ARB stop-loss at 1.94; the ledger closes it on reconciliation
    e.paper.set_price("ARB/USDT", dec!(1.9)).await;
    let state = e.orchestrator.reconcile("s1").await.unwrap();
    assert_eq!(state.current_open_positions, 0);
    assert_eq!((state.total_trades, state.losing_trades), (1, 1));
    assert!(state.is_active);

    let closed = e
        .ledger
        .positions(&PositionFilter::strategy("s1").with_symbol("ARB/USDT"))
        .await
        .unwrap();
    assert_eq!(closed[0].close_reason, Some(CloseReason::StopLoss));

    let op = e
        .orchestrator
        .handle_market_update("s1", &tick(&e.paper, "OP/USDT").await)
        .await
        .unwrap();
    assert!(matches!(op, SignalOutcome::Executed { .. }));
}

#[tokio::test]
async fn test_open_count_matches_ledger_after_reconcile() {
    let e = engine().await;
    e.orchestrator.activate_strategy(strategy("s1")).await.unwrap();
    for symbol in ["ARB/USDT", "OP/USDT"] {
        e.orchestrator
            .handle_market_update("s1", &tick(&e.paper, symbol).await)
            .await
            .unwrap();
    }

    let state = e.orchestrator.reconcile("s1").await.unwrap();
    let live = e.ledger.open_positions("s1").await.unwrap();
    assert_eq!(state.current_open_positions, live.len());
    assert_eq!(state.current_open_positions, 2);
    // 10% of 10000 each
    assert_eq!(state.available_capital, dec!(8000));
}

#[tokio::test]
async fn test_shared_subscriptions_survive_until_last_strategy_stops() {
    let e = engine().await;
    e.orchestrator.activate_strategy(strategy("s1")).await.unwrap();
    e.orchestrator.activate_strategy(strategy("s2")).await.unwrap();
    assert_eq!(e.market_data.subscription_count().await, 2);
    assert_eq!(
        e.orchestrator.active_strategies().await,
        vec!["s1".to_string(), "s2".to_string()]
    );

    e.orchestrator.stop_strategy("s1").await.unwrap();
    assert_eq!(e.market_data.subscription_count().await, 2);

    e.orchestrator.stop_strategy("s2").await.unwrap();
    assert_eq!(e.market_data.subscription_count().await, 0);

    let state = e.orchestrator.strategy_state("s1").await.unwrap().unwrap();
    assert!(!state.is_active);
    assert!(!state.emergency_stop_triggered);
}

#[tokio::test]
async fn test_stop_force_closes_every_position() {
    let e = engine().await;
    e.orchestrator.activate_strategy(strategy("s1")).await.unwrap();
    for symbol in ["ARB/USDT", "OP/USDT"] {
        e.orchestrator
            .handle_market_update("s1", &tick(&e.paper, symbol).await)
            .await
            .unwrap();
    }

    let state = e.orchestrator.stop_strategy("s1").await.unwrap();
    assert!(!state.is_active);
    assert_eq!(state.current_open_positions, 0);

    let positions = e
        .ledger
        .positions(&PositionFilter::strategy("s1"))
        .await
        .unwrap();
    assert_eq!(positions.len(), 2);
    assert!(positions
        .iter()
        .all(|p| p.close_reason == Some(CloseReason::StrategyStopped)));

    assert!(e.orchestrator.stop_strategy("s1").await.is_err());
}

#[tokio::test]
async fn test_permanent_error_reported_strategy_stays_active() {
    let e = engine().await;
    let mut events = e.orchestrator.subscribe_events();
    e.orchestrator.activate_strategy(strategy("s1")).await.unwrap();
    e.paper
        .fail_orders(Some(ExchangeError::InsufficientFunds("USDT".into())))
        .await;

    let outcome = e
        .orchestrator
        .handle_market_update("s1", &tick(&e.paper, "ARB/USDT").await)
        .await
        .unwrap();
    assert!(matches!(outcome, SignalOutcome::Failed { .. }));
    assert!(e.orchestrator.is_active("s1").await);

    let mut errors = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, EngineEvent::ExecutionError { .. }) {
            errors += 1;
        }
    }
    assert_eq!(errors, 1);

    let record = &e.orchestrator.recent_signals("s1", 1).await.unwrap()[0];
    assert!(!record.executed);
    assert!(record.error.as_deref().unwrap().contains("insufficient"));

    // Nothing opened, so the next tick can retry
    e.paper.fail_orders(None).await;
    let outcome = e
        .orchestrator
        .handle_market_update("s1", &tick(&e.paper, "ARB/USDT").await)
        .await
        .unwrap();
    assert!(matches!(outcome, SignalOutcome::Executed { .. }));
}

#[tokio::test]
async fn test_transient_error_not_surfaced_as_event() {
    let e = engine().await;
    let mut events = e.orchestrator.subscribe_events();
    e.orchestrator.activate_strategy(strategy("s1")).await.unwrap();
    e.paper
        .fail_orders(Some(ExchangeError::Timeout("simulated".into())))
        .await;

    let outcome = e
        .orchestrator
        .handle_market_update("s1", &tick(&e.paper, "ARB/USDT").await)
        .await
        .unwrap();
    assert!(matches!(outcome, SignalOutcome::Failed { .. }));

    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, EngineEvent::ExecutionError { .. }));
    }
    assert!(e.orchestrator.is_active("s1").await);
}

#[tokio::test]
async fn test_resumed_position_exits_after_past_unlock() {
    let e = engine_with(vec![unlock_at("ARB", dec!(10), Utc::now() - Duration::hours(50))]).await;

    // Left open by an earlier run of the strategy
    e.ledger
        .open(OpenPositionRequest {
            strategy_id: "s1".to_string(),
            exchange: "paper".to_string(),
            symbol: "ARB/USDT".to_string(),
            side: PositionSide::Long,
            quantity: dec!(500),
            stop_loss: Some(dec!(1.94)),
            take_profit: Some(dec!(2.10)),
        })
        .await
        .unwrap();

    let state = e.orchestrator.activate_strategy(strategy("s1")).await.unwrap();
    assert_eq!(state.current_open_positions, 1);

    let outcome = e
        .orchestrator
        .handle_market_update("s1", &tick(&e.paper, "ARB/USDT").await)
        .await
        .unwrap();
    assert!(matches!(outcome, SignalOutcome::Executed { .. }));
    assert!(e.ledger.open_positions("s1").await.unwrap().is_empty());

    let positions = e
        .ledger
        .positions(&PositionFilter::strategy("s1"))
        .await
        .unwrap();
    assert_eq!(positions[0].close_reason, Some(CloseReason::Signal));
}

#[tokio::test]
async fn test_failed_activation_releases_subscriptions() {
    let e = engine().await;
    e.store.fail_state_writes(true);

    assert!(e.orchestrator.activate_strategy(strategy("s1")).await.is_err());
    assert!(!e.orchestrator.is_active("s1").await);
    assert_eq!(e.market_data.subscription_count().await, 0);

    // A later attempt starts clean
    e.store.fail_state_writes(false);
    e.orchestrator.activate_strategy(strategy("s1")).await.unwrap();
    assert_eq!(e.market_data.subscription_count().await, 2);
}

#[tokio::test]
async fn test_stop_completes_when_state_cannot_be_persisted() {
    let e = engine().await;
    let mut events = e.orchestrator.subscribe_events();
    e.orchestrator.activate_strategy(strategy("s1")).await.unwrap();
    e.orchestrator
        .handle_market_update("s1", &tick(&e.paper, "ARB/USDT").await)
        .await
        .unwrap();
    e.store.fail_state_writes(true);

    let state = e.orchestrator.stop_strategy("s1").await.unwrap();
    assert!(!state.is_active);
    assert!(state.stopped_at.is_some());
    assert_eq!(state.current_open_positions, 0);
    assert!(!e.orchestrator.is_active("s1").await);
    assert_eq!(e.market_data.subscription_count().await, 0);
    assert!(e.ledger.open_positions("s1").await.unwrap().is_empty());

    let mut stopped = false;
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::StrategyStopped { strategy_id, .. } = event {
            assert_eq!(strategy_id, "s1");
            stopped = true;
        }
    }
    assert!(stopped);
}
