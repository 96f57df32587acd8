//! Strategy plugins
//!
//! A plugin turns market updates into trading signals. Plugins never place
//! orders; the orchestrator validates and executes what they emit.

mod token_unlock;
mod types;

pub use token_unlock::{TokenUnlockConfig, TokenUnlockStrategy};
pub use types::{PriceClose, SignalAction, StrategyError, TradingSignal, UnlockEvent};

use crate::engine::StrategyConfig;
use crate::market_data::MarketDataUpdate;
use crate::store::Store;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;

/// Capability interface implemented by every strategy family
#[async_trait]
pub trait StrategyPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Load facts needed for signal generation
    async fn initialize(&mut self, now: DateTime<Utc>) -> Result<(), StrategyError>;

    /// Reload facts; called on each reconciliation tick
    async fn refresh(&mut self, _now: DateTime<Utc>) -> Result<(), StrategyError> {
        Ok(())
    }

    /// Decide on one update. `update.timestamp` is the decision time.
    fn generate_signal(&self, strategy_id: &str, update: &MarketDataUpdate)
        -> Option<TradingSignal>;

    fn on_position_opened(&mut self, symbol: &str, entry_price: Decimal, at: DateTime<Utc>);

    /// Resume tracking a position that was opened before this activation
    async fn adopt_position(
        &mut self,
        symbol: &str,
        entry_price: Decimal,
        opened_at: DateTime<Utc>,
    ) -> Result<(), StrategyError> {
        self.on_position_opened(symbol, entry_price, opened_at);
        Ok(())
    }

    fn on_position_closed(&mut self, symbol: &str);

    /// Symbols the plugin believes have an open position
    fn tracked_symbols(&self) -> Vec<String>;
}

/// Plugin selection and parameters
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PluginConfig {
    TokenUnlock(TokenUnlockConfig),
}

impl Default for PluginConfig {
    fn default() -> Self {
        PluginConfig::TokenUnlock(TokenUnlockConfig::default())
    }
}

/// Builds plugins for strategy activations
pub trait PluginFactory: Send + Sync {
    fn create(&self, config: &StrategyConfig) -> Result<Box<dyn StrategyPlugin>, StrategyError>;
}

/// Factory for the built-in plugins, reading facts from a store
pub struct DefaultPluginFactory {
    store: Arc<dyn Store>,
}

impl DefaultPluginFactory {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

impl PluginFactory for DefaultPluginFactory {
    fn create(&self, config: &StrategyConfig) -> Result<Box<dyn StrategyPlugin>, StrategyError> {
        match &config.plugin {
            PluginConfig::TokenUnlock(plugin) => {
                let mut plugin = plugin.clone();
                // Strategy-level risk settings win over plugin defaults
                if let Some(stop) = config.stop_loss {
                    plugin.stop_loss_pct = stop;
                }
                if let Some(target) = config.take_profit {
                    plugin.take_profit_pct = target;
                }
                plugin.position_size_pct = config.max_position_size;
                Ok(Box::new(TokenUnlockStrategy::new(
                    plugin,
                    Arc::clone(&self.store),
                )))
            }
        }
    }
}
