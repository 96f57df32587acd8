//! Named connector registry
//!
//! Holds connected connectors by name, resolves a default, and routes every
//! connector operation to the selected instance.

use super::{
    Balance, BinanceConfig, BinanceConnector, Candle, ExchangeConnector, ExchangeError,
    ExchangeResult, Order, OrderBook, OrderRequest, PaperConnector, Ticker,
};
use crate::config::ExchangeSettings;
use crate::telemetry::{record_latency, LatencyMetric};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Construct an unconnected connector for the configured exchange kind
pub fn build_connector(settings: &ExchangeSettings) -> ExchangeResult<Arc<dyn ExchangeConnector>> {
    match settings.kind() {
        "binance" => {
            let (api_key, api_secret) = settings.credentials();
            let mut config = if settings.testnet {
                BinanceConfig::testnet()
            } else {
                BinanceConfig::default()
            };
            config.name = settings.name.clone();
            config.api_key = api_key;
            config.api_secret = api_secret;
            config.timeout = Duration::from_millis(settings.timeout_ms);
            config.recv_window_ms = settings.recv_window_ms;
            if let Some(url) = &settings.base_url {
                config.base_url = url.clone();
            }
            Ok(Arc::new(BinanceConnector::new(config)?))
        }
        "paper" => Ok(Arc::new(PaperConnector::new(
            settings.name.clone(),
            settings.fee_rate,
        ))),
        other => Err(ExchangeError::UnsupportedExchange(other.to_string())),
    }
}

/// Registry of connected exchanges
#[derive(Default)]
pub struct ExchangeRegistry {
    connectors: RwLock<HashMap<String, Arc<dyn ExchangeConnector>>>,
    default_exchange: RwLock<Option<String>>,
}

impl ExchangeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build, connect and register a connector from settings.
    ///
    /// Nothing is registered unless `connect` succeeds.
    pub async fn add_exchange(&self, settings: &ExchangeSettings) -> ExchangeResult<()> {
        let connector = build_connector(settings)?;
        self.add_connector(connector).await
    }

    /// Connect and register a pre-built connector under its own name.
    ///
    /// The first registered exchange becomes the default. Re-adding a name
    /// replaces (and disconnects) the previous instance.
    pub async fn add_connector(&self, connector: Arc<dyn ExchangeConnector>) -> ExchangeResult<()> {
        let name = connector.name().to_string();

        if let Err(e) = connector.connect().await {
            tracing::error!(exchange = %name, error = %e, "Exchange connection failed");
            return Err(e);
        }

        let previous = self
            .connectors
            .write()
            .await
            .insert(name.clone(), connector);
        if let Some(previous) = previous {
            tracing::warn!(exchange = %name, "Replacing registered exchange");
            if let Err(e) = previous.disconnect().await {
                tracing::warn!(exchange = %name, error = %e, "Failed to disconnect replaced exchange");
            }
        }

        let mut default = self.default_exchange.write().await;
        if default.is_none() {
            *default = Some(name.clone());
        }

        tracing::info!(exchange = %name, "Exchange registered");
        Ok(())
    }

    /// Disconnect and drop an exchange. Returns false if it was not registered.
    pub async fn remove_exchange(&self, name: &str) -> bool {
        let Some(connector) = self.connectors.write().await.remove(name) else {
            return false;
        };

        if let Err(e) = connector.disconnect().await {
            tracing::warn!(exchange = %name, error = %e, "Error while disconnecting exchange");
        }

        let mut default = self.default_exchange.write().await;
        if default.as_deref() == Some(name) {
            *default = None;
        }

        tracing::info!(exchange = %name, "Exchange removed");
        true
    }

    /// Make a registered exchange the default
    pub async fn set_default(&self, name: &str) -> ExchangeResult<()> {
        if !self.connectors.read().await.contains_key(name) {
            return Err(ExchangeError::NotConnected(name.to_string()));
        }
        *self.default_exchange.write().await = Some(name.to_string());
        Ok(())
    }

    pub async fn default_exchange(&self) -> Option<String> {
        self.default_exchange.read().await.clone()
    }

    /// Resolve an optional exchange name to a registered name
    pub async fn resolve_name(&self, exchange: Option<&str>) -> ExchangeResult<String> {
        let name = match exchange {
            Some(name) => name.to_string(),
            None => self
                .default_exchange
                .read()
                .await
                .clone()
                .ok_or_else(|| ExchangeError::NotConnected("<default>".to_string()))?,
        };

        if self.connectors.read().await.contains_key(&name) {
            Ok(name)
        } else {
            Err(ExchangeError::NotConnected(name))
        }
    }

    /// Resolve an optional exchange name to its connector
    pub async fn connector(&self, exchange: Option<&str>) -> ExchangeResult<Arc<dyn ExchangeConnector>> {
        let name = self.resolve_name(exchange).await?;
        self.connectors
            .read()
            .await
            .get(&name)
            .cloned()
            .ok_or(ExchangeError::NotConnected(name))
    }

    pub async fn is_connected(&self, exchange: Option<&str>) -> bool {
        self.resolve_name(exchange).await.is_ok()
    }

    /// Names of all registered exchanges, sorted
    pub async fn connected_exchanges(&self) -> Vec<String> {
        let mut names: Vec<String> = self.connectors.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Disconnect and drop every exchange
    pub async fn disconnect_all(&self) {
        let drained: Vec<(String, Arc<dyn ExchangeConnector>)> =
            self.connectors.write().await.drain().collect();
        for (name, connector) in drained {
            if let Err(e) = connector.disconnect().await {
                tracing::warn!(exchange = %name, error = %e, "Error while disconnecting exchange");
            }
        }
        *self.default_exchange.write().await = None;
        tracing::info!("All exchanges disconnected");
    }

    pub async fn fetch_ticker(&self, symbol: &str, exchange: Option<&str>) -> ExchangeResult<Ticker> {
        let connector = self.connector(exchange).await?;
        timed(connector.name(), connector.fetch_ticker(symbol)).await
    }

    pub async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        since: Option<DateTime<Utc>>,
        limit: Option<u32>,
        exchange: Option<&str>,
    ) -> ExchangeResult<Vec<Candle>> {
        let connector = self.connector(exchange).await?;
        timed(
            connector.name(),
            connector.fetch_ohlcv(symbol, timeframe, since, limit),
        )
        .await
    }

    pub async fn fetch_order_book(
        &self,
        symbol: &str,
        limit: u32,
        exchange: Option<&str>,
    ) -> ExchangeResult<OrderBook> {
        let connector = self.connector(exchange).await?;
        timed(connector.name(), connector.fetch_order_book(symbol, limit)).await
    }

    pub async fn fetch_balance(
        &self,
        exchange: Option<&str>,
    ) -> ExchangeResult<BTreeMap<String, Balance>> {
        let connector = self.connector(exchange).await?;
        timed(connector.name(), connector.fetch_balance()).await
    }

    /// Validate and place an order
    pub async fn create_order(
        &self,
        request: &OrderRequest,
        exchange: Option<&str>,
    ) -> ExchangeResult<Order> {
        request.validate()?;
        let connector = self.connector(exchange).await?;
        timed(connector.name(), connector.create_order(request)).await
    }

    pub async fn cancel_order(
        &self,
        id: &str,
        symbol: &str,
        exchange: Option<&str>,
    ) -> ExchangeResult<Order> {
        let connector = self.connector(exchange).await?;
        timed(connector.name(), connector.cancel_order(id, symbol)).await
    }

    pub async fn fetch_order(
        &self,
        id: &str,
        symbol: &str,
        exchange: Option<&str>,
    ) -> ExchangeResult<Order> {
        let connector = self.connector(exchange).await?;
        timed(connector.name(), connector.fetch_order(id, symbol)).await
    }

    pub async fn fetch_open_orders(
        &self,
        symbol: Option<&str>,
        exchange: Option<&str>,
    ) -> ExchangeResult<Vec<Order>> {
        let connector = self.connector(exchange).await?;
        timed(connector.name(), connector.fetch_open_orders(symbol)).await
    }
}

async fn timed<T>(exchange: &str, call: impl Future<Output = ExchangeResult<T>>) -> ExchangeResult<T> {
    let started = Instant::now();
    let result = call.await;
    record_latency(LatencyMetric::ExchangeCall, ("exchange", exchange), started.elapsed());
    result
}
