//! Position ledger
//!
//! Opens and closes positions through the exchange registry and keeps the
//! stored records authoritative. `open` is serialized per (strategy, symbol);
//! `close` and `mark_to_market` are serialized per position id, so a second
//! concurrent close observes the first one's result and fails cleanly.

use super::locks::KeyedLocks;
use super::{
    CloseReason, LedgerError, OpenPositionRequest, Position, PositionFilter, PositionStatus,
    PositionSummary,
};
use crate::exchange::{ExchangeError, ExchangeRegistry, OrderRequest, OrderStatus};
use crate::store::Store;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

/// Owns the lifecycle of trading positions
pub struct PositionLedger {
    registry: Arc<ExchangeRegistry>,
    store: Arc<dyn Store>,
    position_locks: KeyedLocks<Uuid>,
    symbol_locks: KeyedLocks<(String, String)>,
}

impl PositionLedger {
    pub fn new(registry: Arc<ExchangeRegistry>, store: Arc<dyn Store>) -> Self {
        Self {
            registry,
            store,
            position_locks: KeyedLocks::new(),
            symbol_locks: KeyedLocks::new(),
        }
    }

    /// Place a market order and record the resulting position as open
    pub async fn open(&self, request: OpenPositionRequest) -> Result<Position, LedgerError> {
        if request.quantity <= Decimal::ZERO {
            return Err(LedgerError::InvalidQuantity(request.quantity));
        }

        let _guard = self
            .symbol_locks
            .lock(&(request.strategy_id.clone(), request.symbol.clone()))
            .await;

        let existing = self
            .store
            .list_positions(
                &PositionFilter::strategy(&request.strategy_id)
                    .with_symbol(&request.symbol)
                    .only_active(),
            )
            .await?;
        if !existing.is_empty() {
            return Err(LedgerError::PositionExists {
                strategy_id: request.strategy_id,
                symbol: request.symbol,
            });
        }

        let exchange = Some(request.exchange.as_str());
        let ticker = self.registry.fetch_ticker(&request.symbol, exchange).await?;
        let order = self
            .registry
            .create_order(
                &OrderRequest::market(
                    request.symbol.clone(),
                    request.side.entry_side(),
                    request.quantity,
                ),
                exchange,
            )
            .await?;

        if order.filled.is_zero()
            && matches!(
                order.status,
                OrderStatus::Canceled | OrderStatus::Expired | OrderStatus::Rejected
            )
        {
            tracing::warn!(
                strategy_id = %request.strategy_id,
                symbol = %request.symbol,
                order_id = %order.id,
                status = ?order.status,
                "Entry order ended without a fill"
            );
            return Err(LedgerError::Exchange(ExchangeError::Rejected(format!(
                "entry order {} ended {:?} without a fill",
                order.id, order.status
            ))));
        }

        let entry_price = order.average.unwrap_or(ticker.last);
        let quantity = if order.filled > Decimal::ZERO {
            order.filled
        } else {
            request.quantity
        };
        let now = Utc::now();

        let position = Position {
            id: Uuid::new_v4(),
            strategy_id: request.strategy_id,
            exchange: request.exchange,
            symbol: request.symbol,
            side: request.side,
            entry_price,
            quantity,
            current_price: entry_price,
            status: PositionStatus::Open,
            pnl: Decimal::ZERO,
            pnl_percent: Decimal::ZERO,
            stop_loss: request.stop_loss,
            take_profit: request.take_profit,
            entry_order_id: Some(order.id),
            exit_order_id: None,
            close_reason: None,
            opened_at: now,
            updated_at: now,
            closed_at: None,
        };

        if let Err(e) = self.store.insert_position(&position).await {
            // The order is already on the exchange; surface loudly
            tracing::error!(
                strategy_id = %position.strategy_id,
                symbol = %position.symbol,
                order_id = ?position.entry_order_id,
                error = %e,
                "Order filled but position could not be persisted"
            );
            return Err(e.into());
        }

        tracing::info!(
            position_id = %position.id,
            strategy_id = %position.strategy_id,
            symbol = %position.symbol,
            side = ?position.side,
            entry_price = %position.entry_price,
            quantity = %position.quantity,
            "Position opened"
        );
        Ok(position)
    }

    /// Close a position at market. Fails with `AlreadyClosed` if it is closed.
    pub async fn close(&self, id: Uuid, reason: CloseReason) -> Result<Position, LedgerError> {
        let _guard = self.position_locks.lock(&id).await;

        let mut position = self.get(id).await?;
        if position.is_closed() {
            tracing::warn!(position_id = %id, reason = %reason, "Close requested for closed position");
            return Err(LedgerError::AlreadyClosed(id));
        }

        let exchange = Some(position.exchange.as_str());
        let ticker = self.registry.fetch_ticker(&position.symbol, exchange).await?;
        let order = self
            .registry
            .create_order(
                &OrderRequest::market(
                    position.symbol.clone(),
                    position.side.exit_side(),
                    position.quantity,
                ),
                exchange,
            )
            .await?;

        let exit_price = order.average.unwrap_or(ticker.last);
        let now = Utc::now();
        position.mark(exit_price, now);
        position.status = PositionStatus::Closed;
        position.exit_order_id = Some(order.id);
        position.close_reason = Some(reason);
        position.closed_at = Some(now);

        self.store.update_position(&position).await?;

        tracing::info!(
            position_id = %position.id,
            strategy_id = %position.strategy_id,
            symbol = %position.symbol,
            exit_price = %exit_price,
            pnl = %position.pnl,
            pnl_percent = %position.pnl_percent,
            reason = %reason,
            "Position closed"
        );
        Ok(position)
    }

    /// Revalue a non-closed position at the live price. Closed positions are
    /// returned unchanged.
    pub async fn mark_to_market(&self, id: Uuid) -> Result<Position, LedgerError> {
        let _guard = self.position_locks.lock(&id).await;

        let mut position = self.get(id).await?;
        if position.is_closed() {
            return Ok(position);
        }

        let ticker = self
            .registry
            .fetch_ticker(&position.symbol, Some(position.exchange.as_str()))
            .await?;
        position.mark(ticker.last, Utc::now());
        self.store.update_position(&position).await?;

        tracing::debug!(
            position_id = %id,
            price = %ticker.last,
            pnl = %position.pnl,
            "Position marked to market"
        );
        Ok(position)
    }

    /// Mark every non-closed position. A failure on one position is logged
    /// and does not stop the others. Returns how many were updated.
    pub async fn mark_all(&self, strategy_id: Option<&str>) -> usize {
        let positions = match self.active_positions(strategy_id).await {
            Ok(positions) => positions,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list positions for mark-to-market");
                return 0;
            }
        };

        // Each position has its own lock, so marks run concurrently
        let results = join_all(positions.iter().map(|p| self.mark_to_market(p.id))).await;

        let mut updated = 0;
        for (position, result) in positions.iter().zip(results) {
            match result {
                Ok(p) if !p.is_closed() => updated += 1,
                Ok(_) => {}
                Err(e) => tracing::warn!(
                    position_id = %position.id,
                    symbol = %position.symbol,
                    error = %e,
                    "Mark-to-market failed"
                ),
            }
        }
        updated
    }

    /// Close every non-closed position whose stop-loss or take-profit has been
    /// crossed. Returns the positions closed by this call.
    pub async fn check_stop_loss_and_take_profit(
        &self,
        strategy_id: Option<&str>,
    ) -> Result<Vec<Position>, LedgerError> {
        let candidates = self
            .active_positions(strategy_id)
            .await?
            .into_iter()
            .filter(|p| p.stop_loss.is_some() || p.take_profit.is_some());

        let mut closed = Vec::new();
        for position in candidates {
            let ticker = match self
                .registry
                .fetch_ticker(&position.symbol, Some(position.exchange.as_str()))
                .await
            {
                Ok(ticker) => ticker,
                Err(e) => {
                    tracing::warn!(
                        position_id = %position.id,
                        symbol = %position.symbol,
                        error = %e,
                        "Price fetch failed during stop-loss/take-profit check"
                    );
                    continue;
                }
            };

            let Some(reason) = position.triggered_exit(ticker.last) else {
                continue;
            };

            tracing::info!(
                position_id = %position.id,
                symbol = %position.symbol,
                price = %ticker.last,
                reason = %reason,
                "Exit threshold crossed"
            );

            match self.close(position.id, reason).await {
                Ok(p) => closed.push(p),
                Err(LedgerError::AlreadyClosed(_)) => {}
                Err(e) => tracing::warn!(
                    position_id = %position.id,
                    error = %e,
                    "Failed to close position on threshold"
                ),
            }
        }
        Ok(closed)
    }

    /// Aggregate performance, optionally for one strategy
    pub async fn summary(&self, strategy_id: Option<&str>) -> Result<PositionSummary, LedgerError> {
        let filter = PositionFilter {
            strategy_id: strategy_id.map(str::to_string),
            ..PositionFilter::default()
        };
        let positions = self.store.list_positions(&filter).await?;
        Ok(PositionSummary::from_positions(&positions))
    }

    /// Realized P&L of positions closed since `since` plus unrealized P&L of
    /// open positions
    pub async fn daily_pnl(
        &self,
        strategy_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Decimal, LedgerError> {
        let positions = self
            .store
            .list_positions(&PositionFilter::strategy(strategy_id))
            .await?;

        Ok(positions
            .iter()
            .filter(|p| !p.is_closed() || p.closed_at.is_some_and(|at| at >= since))
            .map(|p| p.pnl)
            .sum())
    }

    pub async fn get(&self, id: Uuid) -> Result<Position, LedgerError> {
        self.store
            .get_position(id)
            .await?
            .ok_or(LedgerError::NotFound(id))
    }

    pub async fn positions(&self, filter: &PositionFilter) -> Result<Vec<Position>, LedgerError> {
        Ok(self.store.list_positions(filter).await?)
    }

    /// Non-closed positions of a strategy, newest first
    pub async fn open_positions(&self, strategy_id: &str) -> Result<Vec<Position>, LedgerError> {
        self.positions(&PositionFilter::strategy(strategy_id).only_active())
            .await
    }

    async fn active_positions(&self, strategy_id: Option<&str>) -> Result<Vec<Position>, LedgerError> {
        let filter = PositionFilter {
            strategy_id: strategy_id.map(str::to_string),
            active_only: true,
            ..PositionFilter::default()
        };
        self.positions(&filter).await
    }
}
