//! Polling subscription service
//!
//! Every subscription owns one timer task and one broadcast channel, so a slow
//! exchange or a lagging listener on one subscription never delays another.
//! Each task publishes through a gate that `unsubscribe`/`stop` close before
//! returning, which guarantees no update is delivered after those calls.

use super::{
    DataKind, MarketDataError, MarketDataEvent, MarketDataUpdate, MarketPayload, Subscription,
    SubscriptionId,
};
use crate::exchange::{ExchangeError, ExchangeRegistry};
use crate::telemetry::{increment, CounterMetric};
use chrono::Utc;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Buffered updates per subscription before slow listeners lag
const UPDATE_BUFFER: usize = 256;

/// Buffered lifecycle/error events
const EVENT_BUFFER: usize = 1024;

struct ActiveSubscription {
    info: Subscription,
    updates: broadcast::Sender<MarketDataUpdate>,
    /// `true` while publishing is allowed
    gate: Arc<Mutex<bool>>,
    handle: JoinHandle<()>,
}

impl ActiveSubscription {
    async fn cancel(self) {
        *self.gate.lock().await = false;
        self.handle.abort();
    }
}

/// Registry of polling subscriptions keyed by (kind, symbol, exchange[, timeframe])
pub struct MarketDataService {
    registry: Arc<ExchangeRegistry>,
    subscriptions: Mutex<HashMap<SubscriptionId, ActiveSubscription>>,
    events: broadcast::Sender<MarketDataEvent>,
    running: AtomicBool,
}

impl MarketDataService {
    pub fn new(registry: Arc<ExchangeRegistry>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            registry,
            subscriptions: Mutex::new(HashMap::new()),
            events,
            running: AtomicBool::new(false),
        }
    }

    /// Allow subscriptions
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("Market data service already running");
            return;
        }
        tracing::info!("Market data service started");
        let _ = self.events.send(MarketDataEvent::Started);
    }

    /// Cancel every subscription and refuse new ones until restarted
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);

        let drained: Vec<ActiveSubscription> = {
            let mut subscriptions = self.subscriptions.lock().await;
            subscriptions.drain().map(|(_, sub)| sub).collect()
        };
        let count = drained.len();
        join_all(drained.into_iter().map(ActiveSubscription::cancel)).await;

        tracing::info!(cancelled = count, "Market data service stopped");
        let _ = self.events.send(MarketDataEvent::Stopped);
    }

    pub fn is_active(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Poll the ticker of `symbol` every `interval`
    pub async fn subscribe_ticker(
        &self,
        symbol: &str,
        exchange: Option<&str>,
        interval: Duration,
    ) -> Result<SubscriptionId, MarketDataError> {
        self.subscribe(DataKind::Ticker, symbol, exchange, None, None, interval)
            .await
    }

    /// Poll the latest `timeframe` candle of `symbol` every `interval`
    pub async fn subscribe_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        exchange: Option<&str>,
        interval: Duration,
    ) -> Result<SubscriptionId, MarketDataError> {
        self.subscribe(
            DataKind::Ohlcv,
            symbol,
            exchange,
            Some(timeframe.to_string()),
            None,
            interval,
        )
        .await
    }

    /// Poll the top `depth` levels of the order book every `interval`
    pub async fn subscribe_order_book(
        &self,
        symbol: &str,
        exchange: Option<&str>,
        depth: u32,
        interval: Duration,
    ) -> Result<SubscriptionId, MarketDataError> {
        self.subscribe(
            DataKind::OrderBook,
            symbol,
            exchange,
            None,
            Some(depth),
            interval,
        )
        .await
    }

    async fn subscribe(
        &self,
        kind: DataKind,
        symbol: &str,
        exchange: Option<&str>,
        timeframe: Option<String>,
        depth: Option<u32>,
        interval: Duration,
    ) -> Result<SubscriptionId, MarketDataError> {
        if !self.is_active() {
            return Err(MarketDataError::NotRunning);
        }
        if interval.is_zero() {
            return Err(MarketDataError::InvalidInterval);
        }

        let exchange = self.registry.resolve_name(exchange).await?;
        let id = SubscriptionId::new(kind, symbol, &exchange, timeframe.as_deref());

        let mut subscriptions = self.subscriptions.lock().await;
        // `stop` may have drained the map while the exchange was resolved
        if !self.is_active() {
            return Err(MarketDataError::NotRunning);
        }
        if subscriptions.contains_key(&id) {
            tracing::debug!(subscription_id = %id, "Already subscribed");
            return Ok(id);
        }

        let info = Subscription {
            id: id.clone(),
            kind,
            symbol: symbol.to_string(),
            exchange,
            timeframe,
            depth,
            interval,
            created_at: Utc::now(),
        };
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);
        let gate = Arc::new(Mutex::new(true));

        let handle = tokio::spawn(poll_loop(
            Arc::clone(&self.registry),
            info.clone(),
            updates.clone(),
            self.events.clone(),
            Arc::clone(&gate),
        ));

        tracing::info!(
            subscription_id = %id,
            interval_ms = interval.as_millis() as u64,
            "Subscribed to market data"
        );
        subscriptions.insert(
            id.clone(),
            ActiveSubscription {
                info,
                updates,
                gate,
                handle,
            },
        );
        Ok(id)
    }

    /// Cancel a subscription. Returns false if it did not exist.
    pub async fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        let removed = self.subscriptions.lock().await.remove(id);
        match removed {
            Some(sub) => {
                sub.cancel().await;
                tracing::info!(subscription_id = %id, "Unsubscribed from market data");
                true
            }
            None => false,
        }
    }

    /// Cancel every subscription for `symbol` (on one exchange, or all).
    /// Returns how many were cancelled.
    pub async fn unsubscribe_symbol(&self, symbol: &str, exchange: Option<&str>) -> usize {
        let removed: Vec<ActiveSubscription> = {
            let mut subscriptions = self.subscriptions.lock().await;
            let ids: Vec<SubscriptionId> = subscriptions
                .values()
                .filter(|s| s.info.symbol == symbol)
                .filter(|s| exchange.map_or(true, |e| s.info.exchange == e))
                .map(|s| s.info.id.clone())
                .collect();
            ids.iter().filter_map(|id| subscriptions.remove(id)).collect()
        };

        let count = removed.len();
        for sub in removed {
            sub.cancel().await;
        }
        tracing::info!(symbol = %symbol, cancelled = count, "Unsubscribed symbol");
        count
    }

    /// Receive updates for one subscription
    pub async fn listen(&self, id: &SubscriptionId) -> Option<broadcast::Receiver<MarketDataUpdate>> {
        self.subscriptions
            .lock()
            .await
            .get(id)
            .map(|s| s.updates.subscribe())
    }

    /// Receive lifecycle and poll-failure events
    pub fn events(&self) -> broadcast::Receiver<MarketDataEvent> {
        self.events.subscribe()
    }

    pub async fn subscriptions(&self) -> Vec<Subscription> {
        let mut subs: Vec<Subscription> = self
            .subscriptions
            .lock()
            .await
            .values()
            .map(|s| s.info.clone())
            .collect();
        subs.sort_by(|a, b| a.id.cmp(&b.id));
        subs
    }

    pub async fn subscription(&self, id: &SubscriptionId) -> Option<Subscription> {
        self.subscriptions
            .lock()
            .await
            .get(id)
            .map(|s| s.info.clone())
    }

    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.lock().await.len()
    }
}

impl Drop for MarketDataService {
    fn drop(&mut self) {
        for (_, sub) in self.subscriptions.get_mut().drain() {
            sub.handle.abort();
        }
    }
}

async fn poll_loop(
    registry: Arc<ExchangeRegistry>,
    info: Subscription,
    updates: broadcast::Sender<MarketDataUpdate>,
    events: broadcast::Sender<MarketDataEvent>,
    gate: Arc<Mutex<bool>>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + info.interval, info.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let result = poll_once(&registry, &info).await;

        let open = gate.lock().await;
        if !*open {
            break;
        }

        match result {
            Ok(Some(payload)) => {
                // No listeners is not an error
                let _ = updates.send(MarketDataUpdate {
                    subscription_id: info.id.clone(),
                    symbol: info.symbol.clone(),
                    exchange: info.exchange.clone(),
                    payload,
                    timestamp: Utc::now(),
                });
            }
            Ok(None) => {}
            Err(error) => {
                increment(CounterMetric::PollFailures, ("exchange", info.exchange.as_str()));
                tracing::warn!(
                    subscription_id = %info.id,
                    error = %error,
                    transient = error.is_transient(),
                    "Market data poll failed"
                );
                let _ = events.send(MarketDataEvent::Error {
                    subscription_id: info.id.clone(),
                    error,
                });
            }
        }
    }
}

async fn poll_once(
    registry: &ExchangeRegistry,
    info: &Subscription,
) -> Result<Option<MarketPayload>, ExchangeError> {
    let exchange = Some(info.exchange.as_str());
    match info.kind {
        DataKind::Ticker => registry
            .fetch_ticker(&info.symbol, exchange)
            .await
            .map(|t| Some(MarketPayload::Ticker(t))),
        DataKind::Ohlcv => {
            let timeframe = info.timeframe.as_deref().unwrap_or("1m");
            let candles = registry
                .fetch_ohlcv(&info.symbol, timeframe, None, Some(1), exchange)
                .await?;
            Ok(candles.into_iter().last().map(MarketPayload::Candle))
        }
        DataKind::OrderBook => registry
            .fetch_order_book(&info.symbol, info.depth.unwrap_or(20), exchange)
            .await
            .map(|b| Some(MarketPayload::OrderBook(b))),
    }
}
