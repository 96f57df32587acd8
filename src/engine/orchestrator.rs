//! Strategy orchestrator
//!
//! Owns the lifecycle of every active strategy: plugin, ticker listeners,
//! reconciliation timer, admission and execution. Listener and timer tasks
//! shut down cooperatively; every action they take runs under the strategy's
//! execution lock and re-checks the running flag, so nothing acts on a
//! strategy once `stop_strategy` has returned.

use super::admission::{admit, position_value, risk_breach, Admission};
use super::{
    EngineError, EngineEvent, EngineSettings, ExecutionMode, SignalOutcome, SignalRecord,
    StrategyConfig, StrategyState,
};
use crate::exchange::ExchangeRegistry;
use crate::ledger::{
    CloseReason, LedgerError, OpenPositionRequest, PositionFilter, PositionLedger, PositionSide,
    PositionSummary,
};
use crate::market_data::{MarketDataService, MarketDataUpdate, SubscriptionId};
use crate::store::Store;
use crate::strategy::{PluginFactory, SignalAction, StrategyPlugin, TradingSignal};
use crate::telemetry::{
    increment, record_latency, set_gauge, CounterMetric, GaugeMetric, LatencyMetric,
};
use chrono::{DateTime, NaiveTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::time::MissedTickBehavior;

/// Quantity precision for computed order sizes
const QUANTITY_DP: u32 = 8;

/// Runtime of one activated strategy
struct ActiveStrategy {
    config: StrategyConfig,
    plugin: Mutex<Box<dyn StrategyPlugin>>,
    state: Mutex<StrategyState>,
    /// Serializes signal handling, reconciliation and shutdown
    exec_lock: Mutex<()>,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
    subscriptions: Vec<SubscriptionId>,
}

impl ActiveStrategy {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Why a strategy is being stopped
enum StopCause {
    Operator,
    Shutdown,
    Emergency(String),
}

impl StopCause {
    fn reason(&self) -> Option<String> {
        match self {
            StopCause::Operator => None,
            StopCause::Shutdown => Some("engine shutdown".to_string()),
            StopCause::Emergency(reason) => Some(reason.clone()),
        }
    }
}

/// Runs strategies against the ledger and market data
pub struct StrategyOrchestrator {
    registry: Arc<ExchangeRegistry>,
    market_data: Arc<MarketDataService>,
    ledger: Arc<PositionLedger>,
    store: Arc<dyn Store>,
    factory: Arc<dyn PluginFactory>,
    settings: EngineSettings,
    strategies: RwLock<HashMap<String, Arc<ActiveStrategy>>>,
    /// Serializes activation and deactivation
    lifecycle: Mutex<()>,
    events: broadcast::Sender<EngineEvent>,
    running: AtomicBool,
}

impl StrategyOrchestrator {
    pub fn new(
        registry: Arc<ExchangeRegistry>,
        market_data: Arc<MarketDataService>,
        ledger: Arc<PositionLedger>,
        store: Arc<dyn Store>,
        factory: Arc<dyn PluginFactory>,
        settings: EngineSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(settings.event_buffer.max(1));
        Self {
            registry,
            market_data,
            ledger,
            store,
            factory,
            settings,
            strategies: RwLock::new(HashMap::new()),
            lifecycle: Mutex::new(()),
            events,
            running: AtomicBool::new(false),
        }
    }

    /// Start market data and accept activations
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("Orchestrator already running");
            return;
        }
        self.market_data.start();
        tracing::info!(
            reconcile_interval_secs = self.settings.reconcile_interval_secs,
            ticker_interval_ms = self.settings.ticker_interval_ms,
            "Orchestrator started"
        );
    }

    /// Stop every active strategy, then market data
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);

        let ids: Vec<String> = self.strategies.read().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.stop_with(&id, StopCause::Shutdown).await {
                tracing::warn!(strategy_id = %id, error = %e, "Failed to stop strategy");
            }
        }

        self.market_data.stop().await;
        tracing::info!("Orchestrator stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Activate a strategy. Re-activating an active strategy is a no-op.
    pub async fn activate_strategy(
        self: &Arc<Self>,
        config: StrategyConfig,
    ) -> Result<StrategyState, EngineError> {
        if !self.is_running() {
            return Err(EngineError::NotRunning);
        }
        config.validate()?;

        let _lifecycle = self.lifecycle.lock().await;

        if let Some(existing) = self.active(&config.id).await {
            tracing::warn!(strategy_id = %config.id, "Strategy already active");
            return Ok(existing.state.lock().await.clone());
        }

        let connector = self.registry.connector(Some(config.exchange.as_str())).await?;
        if connector.is_paper() != (config.mode == ExecutionMode::Paper) {
            return Err(EngineError::ModeMismatch {
                strategy_id: config.id.clone(),
                mode: config.mode,
                exchange: config.exchange.clone(),
            });
        }

        let now = Utc::now();
        let mut state = match self.store.load_state(&config.id).await? {
            Some(state) => state,
            None => StrategyState::new(&config, now),
        };
        if state.emergency_stop_triggered {
            tracing::warn!(
                strategy_id = %config.id,
                previous_reason = ?state.stop_reason,
                "Clearing emergency stop on reactivation"
            );
        }
        state.is_active = true;
        state.emergency_stop_triggered = false;
        state.stop_reason = None;
        state.allocated_capital = config.allocated_capital;
        state.activated_at = Some(now);
        state.stopped_at = None;

        let mut plugin = self.factory.create(&config)?;
        plugin.initialize(now).await?;
        for position in self.ledger.open_positions(&config.id).await? {
            plugin
                .adopt_position(&position.symbol, position.entry_price, position.opened_at)
                .await?;
        }

        let mut subscriptions = Vec::with_capacity(config.symbols.len());
        let mut receivers = Vec::with_capacity(config.symbols.len());
        for symbol in &config.symbols {
            let subscribed = self
                .market_data
                .subscribe_ticker(symbol, Some(config.exchange.as_str()), self.settings.ticker_interval())
                .await;
            let id = match subscribed {
                Ok(id) => id,
                Err(e) => {
                    self.release_subscriptions(&config.id, &subscriptions).await;
                    return Err(e.into());
                }
            };
            if let Some(rx) = self.market_data.listen(&id).await {
                receivers.push(rx);
            }
            subscriptions.push(id);
        }

        let persisted = async {
            let state = self.refresh_state(&config, state).await?;
            self.store.save_state(&state).await?;
            Ok::<_, EngineError>(state)
        }
        .await;
        let state = match persisted {
            Ok(state) => state,
            Err(e) => {
                self.release_subscriptions(&config.id, &subscriptions).await;
                return Err(e);
            }
        };

        let (shutdown, _) = watch::channel(false);
        let strategy = Arc::new(ActiveStrategy {
            config,
            plugin: Mutex::new(plugin),
            state: Mutex::new(state.clone()),
            exec_lock: Mutex::new(()),
            running: AtomicBool::new(true),
            shutdown,
            subscriptions,
        });

        let id = strategy.config.id.clone();
        for rx in receivers {
            tokio::spawn(listen_loop(
                Arc::downgrade(self),
                id.clone(),
                rx,
                strategy.shutdown.subscribe(),
            ));
        }
        tokio::spawn(reconcile_loop(
            Arc::downgrade(self),
            id.clone(),
            self.settings.reconcile_interval(),
            strategy.shutdown.subscribe(),
        ));

        tracing::info!(
            strategy_id = %id,
            exchange = %strategy.config.exchange,
            mode = %strategy.config.mode,
            symbols = ?strategy.config.symbols,
            allocated_capital = %state.allocated_capital,
            "Strategy activated"
        );
        self.strategies.write().await.insert(id.clone(), strategy);
        let _ = self.events.send(EngineEvent::StrategyActivated { strategy_id: id });
        Ok(state)
    }

    /// Deactivate a strategy and force-close its positions
    pub async fn stop_strategy(&self, strategy_id: &str) -> Result<StrategyState, EngineError> {
        self.stop_with(strategy_id, StopCause::Operator).await
    }

    async fn stop_with(
        &self,
        strategy_id: &str,
        cause: StopCause,
    ) -> Result<StrategyState, EngineError> {
        let _lifecycle = self.lifecycle.lock().await;

        let strategy = self
            .strategies
            .write()
            .await
            .remove(strategy_id)
            .ok_or_else(|| EngineError::StrategyNotFound(strategy_id.to_string()))?;

        strategy.running.store(false, Ordering::SeqCst);
        let _ = strategy.shutdown.send(true);
        let _exec = strategy.exec_lock.lock().await;

        self.release_subscriptions(strategy_id, &strategy.subscriptions)
            .await;

        // Past this point the strategy is already gone; failures are logged
        // and the stop still completes
        let open = match self.ledger.open_positions(strategy_id).await {
            Ok(open) => open,
            Err(e) => {
                tracing::error!(strategy_id, error = %e, "Failed to list positions on strategy stop");
                Vec::new()
            }
        };
        let mut closed = 0usize;
        for position in open {
            match self
                .ledger
                .close(position.id, CloseReason::StrategyStopped)
                .await
            {
                Ok(_) | Err(LedgerError::AlreadyClosed(_)) => {
                    closed += 1;
                    strategy
                        .plugin
                        .lock()
                        .await
                        .on_position_closed(&position.symbol);
                }
                Err(e) => tracing::error!(
                    strategy_id,
                    position_id = %position.id,
                    symbol = %position.symbol,
                    error = %e,
                    "Failed to close position on strategy stop"
                ),
            }
        }

        let reason = cause.reason();
        let current = strategy.state.lock().await.clone();
        let mut state = match self.refresh_state(&strategy.config, current.clone()).await {
            Ok(state) => state,
            Err(e) => {
                tracing::error!(strategy_id, error = %e, "Failed to refresh state on strategy stop");
                current
            }
        };
        state.is_active = false;
        state.stopped_at = Some(Utc::now());
        state.stop_reason = reason.clone();
        if let StopCause::Emergency(_) = cause {
            state.emergency_stop_triggered = true;
        }
        if let Err(e) = self.store.save_state(&state).await {
            tracing::error!(strategy_id, error = %e, "Failed to persist state on strategy stop");
        }
        *strategy.state.lock().await = state.clone();

        tracing::info!(
            strategy_id,
            closed_positions = closed,
            total_pnl = %state.total_pnl,
            reason = ?reason,
            "Strategy stopped"
        );
        let _ = self.events.send(EngineEvent::StrategyStopped {
            strategy_id: strategy_id.to_string(),
            reason,
        });
        Ok(state)
    }

    /// Flag the emergency stop, then deactivate
    async fn emergency_stop(&self, strategy_id: &str, reason: String) {
        tracing::error!(strategy_id, reason = %reason, "Emergency stop triggered");
        increment(CounterMetric::EmergencyStops, ("strategy", strategy_id));
        let _ = self.events.send(EngineEvent::EmergencyStop {
            strategy_id: strategy_id.to_string(),
            reason: reason.clone(),
        });

        if let Err(e) = self
            .stop_with(strategy_id, StopCause::Emergency(reason))
            .await
        {
            tracing::error!(strategy_id, error = %e, "Emergency stop failed to deactivate strategy");
        }
    }

    /// Evaluate one market update for a strategy and act on the resulting signal
    pub async fn handle_market_update(
        &self,
        strategy_id: &str,
        update: &MarketDataUpdate,
    ) -> Result<SignalOutcome, EngineError> {
        let strategy = self
            .active(strategy_id)
            .await
            .ok_or_else(|| EngineError::StrategyNotFound(strategy_id.to_string()))?;

        let _exec = strategy.exec_lock.lock().await;
        if !strategy.is_running() {
            return Ok(SignalOutcome::NoSignal);
        }
        let started = Instant::now();

        let signal = strategy
            .plugin
            .lock()
            .await
            .generate_signal(strategy_id, update);
        let Some(signal) = signal else {
            return Ok(SignalOutcome::NoSignal);
        };
        if signal.action == SignalAction::Hold {
            return Ok(SignalOutcome::NoSignal);
        }

        increment(CounterMetric::SignalsGenerated, ("strategy", strategy_id));
        tracing::info!(
            strategy_id,
            signal_id = %signal.id,
            symbol = %signal.symbol,
            action = %signal.action,
            strength = %signal.strength,
            reasoning = %signal.reasoning,
            "Signal generated"
        );

        let mut record = SignalRecord::new(signal.clone(), Utc::now());
        self.store.insert_signal(&record).await?;

        let outcome = self.admit_and_execute(&strategy, &signal, &mut record).await;
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                record.error = Some(e.to_string());
                self.report_execution_error(strategy_id, Some(signal.id), &e);
                SignalOutcome::Failed {
                    signal_id: signal.id,
                    error: e.to_string(),
                }
            }
        };

        if let Err(e) = self.store.update_signal(&record).await {
            tracing::error!(strategy_id, signal_id = %signal.id, error = %e, "Failed to update signal record");
        }
        record_latency(
            LatencyMetric::SignalHandling,
            ("strategy", strategy_id),
            started.elapsed(),
        );
        Ok(outcome)
    }

    async fn admit_and_execute(
        &self,
        strategy: &ActiveStrategy,
        signal: &TradingSignal,
        record: &mut SignalRecord,
    ) -> Result<SignalOutcome, EngineError> {
        let config = &strategy.config;

        let current = strategy.state.lock().await.clone();
        let state = self.refresh_state(config, current).await?;
        *strategy.state.lock().await = state.clone();

        let existing = self
            .ledger
            .positions(
                &PositionFilter::strategy(&config.id)
                    .with_symbol(&signal.symbol)
                    .only_active(),
            )
            .await?;

        if let Admission::Rejected(reason) = admit(signal, config, &state, !existing.is_empty()) {
            tracing::info!(
                strategy_id = %config.id,
                signal_id = %signal.id,
                symbol = %signal.symbol,
                reason = %reason,
                "Signal rejected"
            );
            increment(CounterMetric::SignalsRejected, ("reason", reason.label()));
            record.rejection = Some(reason.clone());
            return Ok(SignalOutcome::Rejected {
                signal_id: signal.id,
                reason,
            });
        }

        let position = match signal.action {
            SignalAction::Buy => {
                let value = position_value(signal, config, &state);
                let price = match signal.entry_price {
                    Some(price) if price > Decimal::ZERO => price,
                    _ => {
                        self.registry
                            .fetch_ticker(&signal.symbol, Some(config.exchange.as_str()))
                            .await?
                            .last
                    }
                };
                let quantity = if price > Decimal::ZERO {
                    (value / price).round_dp(QUANTITY_DP)
                } else {
                    Decimal::ZERO
                };

                let position = self
                    .ledger
                    .open(OpenPositionRequest {
                        strategy_id: config.id.clone(),
                        exchange: config.exchange.clone(),
                        symbol: signal.symbol.clone(),
                        side: PositionSide::Long,
                        quantity,
                        stop_loss: signal.stop_loss,
                        take_profit: signal.take_profit,
                    })
                    .await?;
                strategy.plugin.lock().await.on_position_opened(
                    &position.symbol,
                    position.entry_price,
                    position.opened_at,
                );
                position
            }
            _ => {
                let Some(open) = existing.first() else {
                    return Ok(SignalOutcome::NoSignal);
                };
                let position = self.ledger.close(open.id, CloseReason::Signal).await?;
                strategy
                    .plugin
                    .lock()
                    .await
                    .on_position_closed(&position.symbol);
                position
            }
        };

        let now = Utc::now();
        record.executed = true;
        record.executed_at = Some(now);
        record.position_id = Some(position.id);

        let current = strategy.state.lock().await.clone();
        let state = self.refresh_state(config, current).await?;
        self.store.save_state(&state).await?;
        *strategy.state.lock().await = state;

        increment(CounterMetric::SignalsExecuted, ("strategy", &config.id));
        tracing::info!(
            strategy_id = %config.id,
            signal_id = %signal.id,
            position_id = %position.id,
            symbol = %position.symbol,
            action = %signal.action,
            price = %position.current_price,
            quantity = %position.quantity,
            "Signal executed"
        );
        let _ = self.events.send(EngineEvent::SignalExecuted {
            strategy_id: config.id.clone(),
            signal_id: signal.id,
            symbol: position.symbol.clone(),
            action: signal.action,
            position_id: position.id,
        });

        Ok(SignalOutcome::Executed {
            signal_id: signal.id,
            position_id: position.id,
        })
    }

    /// Transient exchange failures are retried by the next tick; everything
    /// else is surfaced as an execution error
    fn report_execution_error(&self, strategy_id: &str, signal_id: Option<uuid::Uuid>, error: &EngineError) {
        let transient = matches!(
            error,
            EngineError::Exchange(e) | EngineError::Ledger(LedgerError::Exchange(e)) if e.is_transient()
        );
        if transient {
            tracing::warn!(strategy_id, signal_id = ?signal_id, error = %error, "Transient execution failure");
            return;
        }

        tracing::error!(strategy_id, signal_id = ?signal_id, error = %error, "Execution failed");
        increment(CounterMetric::ExecutionErrors, ("strategy", strategy_id));
        let _ = self.events.send(EngineEvent::ExecutionError {
            strategy_id: strategy_id.to_string(),
            signal_id,
            error: error.to_string(),
        });
    }

    /// One reconciliation tick: refresh plugin facts, enforce stop-loss and
    /// take-profit, mark to market, recompute state and check risk limits.
    pub async fn reconcile(&self, strategy_id: &str) -> Result<StrategyState, EngineError> {
        let strategy = self
            .active(strategy_id)
            .await
            .ok_or_else(|| EngineError::StrategyNotFound(strategy_id.to_string()))?;

        let (state, breach) = {
            let _exec = strategy.exec_lock.lock().await;
            if !strategy.is_running() {
                return Ok(strategy.state.lock().await.clone());
            }
            let started = Instant::now();
            let now = Utc::now();

            if let Err(e) = strategy.plugin.lock().await.refresh(now).await {
                tracing::warn!(strategy_id, error = %e, "Plugin refresh failed");
            }

            match self
                .ledger
                .check_stop_loss_and_take_profit(Some(strategy_id))
                .await
            {
                Ok(closed) => {
                    for position in closed {
                        tracing::info!(
                            strategy_id,
                            position_id = %position.id,
                            symbol = %position.symbol,
                            reason = ?position.close_reason,
                            pnl = %position.pnl,
                            "Position closed by ledger"
                        );
                    }
                }
                Err(e) => tracing::warn!(strategy_id, error = %e, "Stop-loss/take-profit check failed"),
            }

            self.ledger.mark_all(Some(strategy_id)).await;

            let open: HashSet<String> = self
                .ledger
                .open_positions(strategy_id)
                .await?
                .into_iter()
                .map(|p| p.symbol)
                .collect();
            {
                let mut plugin = strategy.plugin.lock().await;
                for symbol in plugin.tracked_symbols() {
                    if !open.contains(&symbol) {
                        plugin.on_position_closed(&symbol);
                    }
                }
            }

            let current = strategy.state.lock().await.clone();
            let state = self.refresh_state(&strategy.config, current).await?;
            self.store.save_state(&state).await?;
            *strategy.state.lock().await = state.clone();

            record_latency(
                LatencyMetric::Reconciliation,
                ("strategy", strategy_id),
                started.elapsed(),
            );
            let breach = risk_breach(&strategy.config, &state, self.settings.max_drawdown_pct);
            (state, breach)
        };

        if let Some(reason) = breach {
            self.emergency_stop(strategy_id, reason).await;
            return Ok(self
                .store
                .load_state(strategy_id)
                .await?
                .unwrap_or(state));
        }
        Ok(state)
    }

    /// Recompute capital, P&L and counts from the ledger
    async fn refresh_state(
        &self,
        config: &StrategyConfig,
        mut state: StrategyState,
    ) -> Result<StrategyState, EngineError> {
        let now = Utc::now();
        let positions = self
            .ledger
            .positions(&PositionFilter::strategy(&config.id))
            .await?;
        let summary = PositionSummary::from_positions(&positions);
        let daily = self.ledger.daily_pnl(&config.id, start_of_day(now)).await?;

        state.current_capital = state.allocated_capital + summary.realized_pnl;
        state.available_capital = state.current_capital - summary.open_exposure;
        state.realized_pnl = summary.realized_pnl;
        state.unrealized_pnl = summary.unrealized_pnl;
        state.total_pnl = summary.total_pnl;
        state.total_trades = summary.closed_positions;
        state.winning_trades = summary.winning_trades;
        state.losing_trades = summary.losing_trades;
        state.daily_loss_current = daily.min(Decimal::ZERO);
        state.current_open_positions = summary.open_positions;
        state.updated_at = now;

        set_gauge(
            GaugeMetric::OpenPositions,
            &config.id,
            state.current_open_positions as f64,
        );
        set_gauge(GaugeMetric::TotalPnl, &config.id, to_f64(state.total_pnl));
        set_gauge(
            GaugeMetric::DailyLoss,
            &config.id,
            to_f64(state.daily_loss_current),
        );
        set_gauge(
            GaugeMetric::AvailableCapital,
            &config.id,
            to_f64(state.available_capital),
        );
        Ok(state)
    }

    /// Unsubscribe feeds no other active strategy listens to
    async fn release_subscriptions(&self, strategy_id: &str, ids: &[SubscriptionId]) {
        let shared: HashSet<SubscriptionId> = self
            .strategies
            .read()
            .await
            .iter()
            .filter(|(id, _)| id.as_str() != strategy_id)
            .flat_map(|(_, s)| s.subscriptions.iter().cloned())
            .collect();

        for id in ids {
            if shared.contains(id) {
                tracing::debug!(strategy_id, subscription = %id, "Subscription still shared");
                continue;
            }
            self.market_data.unsubscribe(id).await;
        }
    }

    async fn active(&self, strategy_id: &str) -> Option<Arc<ActiveStrategy>> {
        self.strategies.read().await.get(strategy_id).cloned()
    }

    pub async fn is_active(&self, strategy_id: &str) -> bool {
        self.active(strategy_id)
            .await
            .is_some_and(|s| s.is_running())
    }

    /// Ids of active strategies, sorted
    pub async fn active_strategies(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.strategies.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Config of an active strategy
    pub async fn strategy(&self, strategy_id: &str) -> Option<StrategyConfig> {
        self.active(strategy_id).await.map(|s| s.config.clone())
    }

    /// Latest state, active or not
    pub async fn strategy_state(&self, strategy_id: &str) -> Result<Option<StrategyState>, EngineError> {
        if let Some(strategy) = self.active(strategy_id).await {
            return Ok(Some(strategy.state.lock().await.clone()));
        }
        Ok(self.store.load_state(strategy_id).await?)
    }

    /// Most recent signal records, newest first
    pub async fn recent_signals(
        &self,
        strategy_id: &str,
        limit: usize,
    ) -> Result<Vec<SignalRecord>, EngineError> {
        Ok(self.store.list_signals(strategy_id, limit).await?)
    }

    /// Subscriptions held by an active strategy
    pub async fn strategy_subscriptions(&self, strategy_id: &str) -> Vec<SubscriptionId> {
        self.active(strategy_id)
            .await
            .map(|s| s.subscriptions.clone())
            .unwrap_or_default()
    }
}

async fn listen_loop(
    orchestrator: Weak<StrategyOrchestrator>,
    strategy_id: String,
    mut updates: broadcast::Receiver<MarketDataUpdate>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => break,

            received = updates.recv() => match received {
                Ok(update) => {
                    let Some(orchestrator) = orchestrator.upgrade() else {
                        break;
                    };
                    match orchestrator.handle_market_update(&strategy_id, &update).await {
                        Ok(_) => {}
                        Err(EngineError::StrategyNotFound(_)) => break,
                        Err(e) => tracing::warn!(
                            strategy_id = %strategy_id,
                            symbol = %update.symbol,
                            error = %e,
                            "Market update handling failed"
                        ),
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(strategy_id = %strategy_id, skipped, "Listener lagged, skipping updates");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    tracing::debug!(strategy_id = %strategy_id, "Listener stopped");
}

async fn reconcile_loop(
    orchestrator: Weak<StrategyOrchestrator>,
    strategy_id: String,
    period: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => break,

            _ = ticker.tick() => {
                let Some(orchestrator) = orchestrator.upgrade() else {
                    break;
                };
                match orchestrator.reconcile(&strategy_id).await {
                    Ok(_) => {}
                    Err(EngineError::StrategyNotFound(_)) => break,
                    Err(e) => tracing::warn!(strategy_id = %strategy_id, error = %e, "Reconciliation failed"),
                }
            }
        }
    }
    tracing::debug!(strategy_id = %strategy_id, "Reconciliation timer stopped");
}

fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(NaiveTime::MIN).and_utc()
}

fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or_default()
}
