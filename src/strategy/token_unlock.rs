//! Token-unlock front-running strategy
//!
//! Large scheduled supply unlocks tend to be sold into. The strategy enters a
//! position shortly before a qualifying unlock and exits on a hard deadline
//! after it; stop-loss and take-profit are enforced by the position ledger.

use super::{SignalAction, StrategyError, StrategyPlugin, TradingSignal, UnlockEvent};
use crate::exchange::{base_asset, Ticker};
use crate::market_data::MarketDataUpdate;
use crate::store::Store;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// How far ahead unlock events are loaded
const LOOKAHEAD_DAYS: i64 = 30;

/// Trailing window for the trend filter
const TREND_DAYS: i64 = 7;

/// Token-unlock strategy parameters
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TokenUnlockConfig {
    /// Minimum unlock size as percent of circulating supply
    #[serde(default = "default_min_unlock_percent")]
    pub min_unlock_percent: Decimal,

    /// Ideal entry offset before the unlock (hours)
    #[serde(default = "default_entry_hours_before")]
    pub entry_hours_before: Decimal,

    /// Accepted deviation from the ideal entry offset (hours)
    #[serde(default = "default_entry_tolerance_hours")]
    pub entry_tolerance_hours: Decimal,

    /// Hard exit deadline after the unlock (hours)
    #[serde(default = "default_exit_hours_after")]
    pub exit_hours_after: Decimal,

    /// Stop-loss distance as a fraction of entry
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: Decimal,

    /// Take-profit distance as a fraction of entry
    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: Decimal,

    /// Minimum 24h quote volume
    #[serde(default = "default_min_daily_volume")]
    pub min_daily_volume: Decimal,

    /// Most negative 7-day price change (percent) still accepted
    #[serde(default = "default_max_price_decline_7d")]
    pub max_price_decline_7d: Decimal,

    /// Fraction of capital per position
    #[serde(default = "default_position_size_pct")]
    pub position_size_pct: Decimal,
}

fn default_min_unlock_percent() -> Decimal {
    dec!(5)
}
fn default_entry_hours_before() -> Decimal {
    dec!(24)
}
fn default_entry_tolerance_hours() -> Decimal {
    dec!(2)
}
fn default_exit_hours_after() -> Decimal {
    dec!(48)
}
fn default_stop_loss_pct() -> Decimal {
    dec!(0.03)
}
fn default_take_profit_pct() -> Decimal {
    dec!(0.05)
}
fn default_min_daily_volume() -> Decimal {
    dec!(1000000)
}
fn default_max_price_decline_7d() -> Decimal {
    dec!(-20)
}
fn default_position_size_pct() -> Decimal {
    dec!(0.10)
}

impl Default for TokenUnlockConfig {
    fn default() -> Self {
        Self {
            min_unlock_percent: default_min_unlock_percent(),
            entry_hours_before: default_entry_hours_before(),
            entry_tolerance_hours: default_entry_tolerance_hours(),
            exit_hours_after: default_exit_hours_after(),
            stop_loss_pct: default_stop_loss_pct(),
            take_profit_pct: default_take_profit_pct(),
            min_daily_volume: default_min_daily_volume(),
            max_price_decline_7d: default_max_price_decline_7d(),
            position_size_pct: default_position_size_pct(),
        }
    }
}

#[derive(Debug, Clone)]
struct TrackedPosition {
    entry_price: Decimal,
    opened_at: DateTime<Utc>,
    /// Unlock the position was entered for
    unlock: Option<UnlockEvent>,
}

/// Enters ahead of large unlocks, exits on a deadline after them
pub struct TokenUnlockStrategy {
    config: TokenUnlockConfig,
    store: Arc<dyn Store>,
    /// Earliest upcoming unlock per token
    unlocks: HashMap<String, UnlockEvent>,
    /// 7-day price change (percent) per token
    trends: HashMap<String, Decimal>,
    /// Open positions by market symbol
    tracked: HashMap<String, TrackedPosition>,
}

impl TokenUnlockStrategy {
    pub fn new(config: TokenUnlockConfig, store: Arc<dyn Store>) -> Self {
        Self {
            config,
            store,
            unlocks: HashMap::new(),
            trends: HashMap::new(),
            tracked: HashMap::new(),
        }
    }

    pub fn config(&self) -> &TokenUnlockConfig {
        &self.config
    }

    /// Earliest cached upcoming unlock for a market symbol's base asset
    pub fn unlock_for(&self, symbol: &str) -> Option<&UnlockEvent> {
        self.unlocks.get(base_asset(symbol))
    }

    async fn load_facts(&mut self, now: DateTime<Utc>) -> Result<(), StrategyError> {
        let events = self
            .store
            .upcoming_unlocks(
                now,
                now + Duration::days(LOOKAHEAD_DAYS),
                self.config.min_unlock_percent,
            )
            .await?;

        let mut unlocks: HashMap<String, UnlockEvent> = HashMap::new();
        for event in events {
            let keep_existing = unlocks
                .get(&event.token_symbol)
                .is_some_and(|existing| existing.unlock_date <= event.unlock_date);
            if !keep_existing {
                unlocks.insert(event.token_symbol.clone(), event);
            }
        }

        let mut trends = HashMap::new();
        for token in unlocks.keys() {
            let closes = self
                .store
                .price_closes(token, now - Duration::days(TREND_DAYS))
                .await?;
            if let (Some(first), Some(last)) = (closes.first(), closes.last()) {
                if closes.len() >= 2 && !first.close.is_zero() {
                    let change = (last.close - first.close) / first.close * dec!(100);
                    trends.insert(token.clone(), change.round_dp(4));
                }
            }
        }

        for (symbol, tracked) in self.tracked.iter_mut() {
            if tracked.unlock.is_none() {
                tracked.unlock = unlocks.get(base_asset(symbol)).cloned();
            }
        }

        tracing::info!(
            unlocks = unlocks.len(),
            with_trend = trends.len(),
            "Loaded token unlock schedule"
        );
        self.unlocks = unlocks;
        self.trends = trends;
        Ok(())
    }

    fn evaluate_entry(
        &self,
        strategy_id: &str,
        symbol: &str,
        ticker: &Ticker,
        now: DateTime<Utc>,
    ) -> Option<TradingSignal> {
        let token = base_asset(symbol);
        let unlock = self.unlocks.get(token)?;

        let hours_until = hours_between(now, unlock.unlock_date);
        let lower = self.config.entry_hours_before - self.config.entry_tolerance_hours;
        let upper = self.config.entry_hours_before + self.config.entry_tolerance_hours;
        if hours_until < lower || hours_until > upper {
            tracing::trace!(symbol, hours_until = %hours_until, "Outside entry window");
            return None;
        }

        if unlock.percent_of_supply < self.config.min_unlock_percent {
            return None;
        }

        let daily_volume = ticker.quote_volume();
        if daily_volume < self.config.min_daily_volume {
            tracing::debug!(symbol, daily_volume = %daily_volume, "Insufficient liquidity");
            return None;
        }

        let change_7d = self.trends.get(token).copied();
        if let Some(change) = change_7d {
            if change < self.config.max_price_decline_7d {
                tracing::debug!(symbol, change_7d = %change, "Trend filter rejected entry");
                return None;
            }
        }

        let entry = ticker.last;
        let stop_loss = entry * (Decimal::ONE - self.config.stop_loss_pct);
        let take_profit = entry * (Decimal::ONE + self.config.take_profit_pct);
        let strength = entry_strength(
            unlock.percent_of_supply,
            hours_until,
            self.config.entry_hours_before,
        );

        Some(TradingSignal {
            id: Uuid::new_v4(),
            strategy_id: strategy_id.to_string(),
            symbol: symbol.to_string(),
            action: SignalAction::Buy,
            strength,
            entry_price: Some(entry),
            stop_loss: Some(stop_loss),
            take_profit: Some(take_profit),
            position_size: Some(self.config.position_size_pct),
            reasoning: format!(
                "{}% of {} supply unlocks in {}h",
                unlock.percent_of_supply.normalize(),
                token,
                hours_until.round_dp(1)
            ),
            metadata: json!({
                "unlock_date": unlock.unlock_date.to_rfc3339(),
                "unlock_percent": unlock.percent_of_supply,
                "unlock_amount": unlock.unlock_amount,
                "hours_until_unlock": hours_until.round_dp(2),
                "daily_volume": daily_volume.round_dp(2),
                "price_change_7d": change_7d,
            }),
            timestamp: now,
        })
    }

    fn evaluate_exit(
        &self,
        strategy_id: &str,
        symbol: &str,
        ticker: &Ticker,
        tracked: &TrackedPosition,
        now: DateTime<Utc>,
    ) -> Option<TradingSignal> {
        let price = ticker.last;
        let pnl_percent = if tracked.entry_price.is_zero() {
            Decimal::ZERO
        } else {
            ((price - tracked.entry_price) / tracked.entry_price * dec!(100)).round_dp(4)
        };

        if let Some(unlock) = &tracked.unlock {
            let hours_after = hours_between(unlock.unlock_date, now);
            if hours_after > self.config.exit_hours_after {
                return Some(TradingSignal {
                    id: Uuid::new_v4(),
                    strategy_id: strategy_id.to_string(),
                    symbol: symbol.to_string(),
                    action: SignalAction::Sell,
                    strength: Decimal::ONE,
                    entry_price: Some(price),
                    stop_loss: None,
                    take_profit: None,
                    position_size: None,
                    reasoning: format!(
                        "Exit deadline passed {}h after unlock",
                        hours_after.round_dp(1)
                    ),
                    metadata: json!({
                        "exit_reason": "time_based",
                        "hours_after_unlock": hours_after.round_dp(2),
                        "pnl_percent": pnl_percent,
                        "held_hours": hours_between(tracked.opened_at, now).round_dp(2),
                    }),
                    timestamp: now,
                });
            }
        }

        // Price exits belong to the ledger; only observe here
        let stop = tracked.entry_price * (Decimal::ONE - self.config.stop_loss_pct);
        let target = tracked.entry_price * (Decimal::ONE + self.config.take_profit_pct);
        if price <= stop || price >= target {
            tracing::debug!(
                symbol,
                price = %price,
                pnl_percent = %pnl_percent,
                "Exit threshold reached, awaiting ledger"
            );
        }
        None
    }
}

/// Hours from `from` to `to` (negative if `to` is earlier)
fn hours_between(from: DateTime<Utc>, to: DateTime<Utc>) -> Decimal {
    Decimal::from((to - from).num_seconds()) / dec!(3600)
}

/// Blend of unlock size (capped at 20%) and closeness to the ideal offset
fn entry_strength(percent: Decimal, hours_until: Decimal, ideal_hours: Decimal) -> Decimal {
    let size_score = (percent / dec!(20)).min(Decimal::ONE);
    let timing_score = Decimal::ONE - ((hours_until - ideal_hours).abs() / dec!(12)).min(Decimal::ONE);
    (dec!(0.5) + dec!(0.3) * size_score + dec!(0.2) * timing_score)
        .clamp(Decimal::ZERO, Decimal::ONE)
        .round_dp(4)
}

#[async_trait]
impl StrategyPlugin for TokenUnlockStrategy {
    fn name(&self) -> &str {
        "token_unlock"
    }

    async fn initialize(&mut self, now: DateTime<Utc>) -> Result<(), StrategyError> {
        self.load_facts(now).await
    }

    async fn refresh(&mut self, now: DateTime<Utc>) -> Result<(), StrategyError> {
        self.load_facts(now).await
    }

    fn generate_signal(
        &self,
        strategy_id: &str,
        update: &MarketDataUpdate,
    ) -> Option<TradingSignal> {
        let ticker = update.ticker()?;
        let symbol = update.symbol.as_str();

        match self.tracked.get(symbol) {
            Some(tracked) => self.evaluate_exit(strategy_id, symbol, ticker, tracked, update.timestamp),
            None => self.evaluate_entry(strategy_id, symbol, ticker, update.timestamp),
        }
    }

    fn on_position_opened(&mut self, symbol: &str, entry_price: Decimal, at: DateTime<Utc>) {
        let unlock = self.unlock_for(symbol).cloned();
        self.tracked.insert(
            symbol.to_string(),
            TrackedPosition {
                entry_price,
                opened_at: at,
                unlock,
            },
        );
    }

    /// The unlock a resumed position was entered for may already be past, so
    /// it is looked up around the open time instead of in the upcoming cache:
    /// the first unlock at or after `opened_at`, else the latest one before it.
    async fn adopt_position(
        &mut self,
        symbol: &str,
        entry_price: Decimal,
        opened_at: DateTime<Utc>,
    ) -> Result<(), StrategyError> {
        let token = base_asset(symbol);
        let events = self
            .store
            .upcoming_unlocks(
                opened_at - Duration::days(LOOKAHEAD_DAYS),
                opened_at + Duration::days(LOOKAHEAD_DAYS),
                self.config.min_unlock_percent,
            )
            .await?;
        let (before, after): (Vec<UnlockEvent>, Vec<UnlockEvent>) = events
            .into_iter()
            .filter(|event| event.token_symbol == token)
            .partition(|event| event.unlock_date < opened_at);
        let unlock = after
            .into_iter()
            .next()
            .or_else(|| before.into_iter().last())
            .or_else(|| self.unlock_for(symbol).cloned());

        tracing::info!(
            symbol,
            entry_price = %entry_price,
            unlock_date = ?unlock.as_ref().map(|u| u.unlock_date),
            "Adopted open position"
        );
        self.tracked.insert(
            symbol.to_string(),
            TrackedPosition {
                entry_price,
                opened_at,
                unlock,
            },
        );
        Ok(())
    }

    fn on_position_closed(&mut self, symbol: &str) {
        self.tracked.remove(symbol);
    }

    fn tracked_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.tracked.keys().cloned().collect();
        symbols.sort();
        symbols
    }
}
