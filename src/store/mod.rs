//! Persistence boundary
//!
//! The engine treats storage as a key-value-by-id store with simple filter and
//! sort queries. `InMemoryStore` backs paper runs and tests.

mod memory;

pub use memory::InMemoryStore;

use crate::engine::{SignalRecord, StrategyState};
use crate::ledger::{Position, PositionFilter};
use crate::strategy::{PriceClose, UnlockEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Durable records consumed by the engine
#[async_trait]
pub trait Store: Send + Sync {
    /// Load the persisted state for a strategy
    async fn load_state(&self, strategy_id: &str) -> Result<Option<StrategyState>, StoreError>;

    /// Insert or replace strategy state
    async fn save_state(&self, state: &StrategyState) -> Result<(), StoreError>;

    async fn insert_position(&self, position: &Position) -> Result<(), StoreError>;

    /// Replace an existing position
    async fn update_position(&self, position: &Position) -> Result<(), StoreError>;

    async fn get_position(&self, id: Uuid) -> Result<Option<Position>, StoreError>;

    /// Positions matching `filter`, newest first
    async fn list_positions(&self, filter: &PositionFilter) -> Result<Vec<Position>, StoreError>;

    async fn insert_signal(&self, record: &SignalRecord) -> Result<(), StoreError>;

    /// Replace an existing signal record
    async fn update_signal(&self, record: &SignalRecord) -> Result<(), StoreError>;

    /// Most recent signal records for a strategy, newest first
    async fn list_signals(
        &self,
        strategy_id: &str,
        limit: usize,
    ) -> Result<Vec<SignalRecord>, StoreError>;

    /// Unlocks in `[from, to]` of at least `min_percent` of supply, earliest first
    async fn upcoming_unlocks(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        min_percent: Decimal,
    ) -> Result<Vec<UnlockEvent>, StoreError>;

    /// Historical closes for a symbol since `since`, oldest first
    async fn price_closes(
        &self,
        symbol: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<PriceClose>, StoreError>;
}
