//! In-memory store

use super::{Store, StoreError};
use crate::engine::{SignalRecord, StrategyState};
use crate::ledger::{Position, PositionFilter};
use crate::strategy::{PriceClose, UnlockEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Store backed by process memory
#[derive(Default)]
pub struct InMemoryStore {
    states: RwLock<HashMap<String, StrategyState>>,
    positions: RwLock<HashMap<Uuid, Position>>,
    signals: RwLock<Vec<SignalRecord>>,
    unlocks: RwLock<Vec<UnlockEvent>>,
    prices: RwLock<Vec<PriceClose>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an unlock event
    pub async fn insert_unlock(&self, event: UnlockEvent) {
        self.unlocks.write().await.push(event);
    }

    /// Seed a historical close
    pub async fn insert_price_close(&self, close: PriceClose) {
        self.prices.write().await.push(close);
    }

    /// Seed many facts at once
    pub async fn seed(&self, unlocks: Vec<UnlockEvent>, prices: Vec<PriceClose>) {
        self.unlocks.write().await.extend(unlocks);
        self.prices.write().await.extend(prices);
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn load_state(&self, strategy_id: &str) -> Result<Option<StrategyState>, StoreError> {
        Ok(self.states.read().await.get(strategy_id).cloned())
    }

    async fn save_state(&self, state: &StrategyState) -> Result<(), StoreError> {
        self.states
            .write()
            .await
            .insert(state.strategy_id.clone(), state.clone());
        Ok(())
    }

    async fn insert_position(&self, position: &Position) -> Result<(), StoreError> {
        self.positions
            .write()
            .await
            .insert(position.id, position.clone());
        Ok(())
    }

    async fn update_position(&self, position: &Position) -> Result<(), StoreError> {
        let mut positions = self.positions.write().await;
        match positions.get_mut(&position.id) {
            Some(existing) => {
                *existing = position.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound {
                kind: "position",
                id: position.id.to_string(),
            }),
        }
    }

    async fn get_position(&self, id: Uuid) -> Result<Option<Position>, StoreError> {
        Ok(self.positions.read().await.get(&id).cloned())
    }

    async fn list_positions(&self, filter: &PositionFilter) -> Result<Vec<Position>, StoreError> {
        let mut positions: Vec<Position> = self
            .positions
            .read()
            .await
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect();
        positions.sort_by(|a, b| b.opened_at.cmp(&a.opened_at));
        Ok(positions)
    }

    async fn insert_signal(&self, record: &SignalRecord) -> Result<(), StoreError> {
        self.signals.write().await.push(record.clone());
        Ok(())
    }

    async fn update_signal(&self, record: &SignalRecord) -> Result<(), StoreError> {
        let mut signals = self.signals.write().await;
        match signals.iter_mut().find(|r| r.signal.id == record.signal.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound {
                kind: "signal",
                id: record.signal.id.to_string(),
            }),
        }
    }

    async fn list_signals(
        &self,
        strategy_id: &str,
        limit: usize,
    ) -> Result<Vec<SignalRecord>, StoreError> {
        // Insertion order is creation order
        Ok(self
            .signals
            .read()
            .await
            .iter()
            .rev()
            .filter(|r| r.signal.strategy_id == strategy_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn upcoming_unlocks(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        min_percent: Decimal,
    ) -> Result<Vec<UnlockEvent>, StoreError> {
        let mut events: Vec<UnlockEvent> = self
            .unlocks
            .read()
            .await
            .iter()
            .filter(|e| e.unlock_date >= from && e.unlock_date <= to)
            .filter(|e| e.percent_of_supply >= min_percent)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.unlock_date);
        Ok(events)
    }

    async fn price_closes(
        &self,
        symbol: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<PriceClose>, StoreError> {
        let mut closes: Vec<PriceClose> = self
            .prices
            .read()
            .await
            .iter()
            .filter(|c| c.symbol == symbol && c.timestamp >= since)
            .cloned()
            .collect();
        closes.sort_by_key(|c| c.timestamp);
        Ok(closes)
    }
}
