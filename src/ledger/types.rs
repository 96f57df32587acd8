//! Position ledger types

use crate::exchange::{ExchangeError, OrderSide};
use crate::store::StoreError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Direction of exposure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Order side that opens this position
    pub fn entry_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        }
    }

    /// Order side that closes this position
    pub fn exit_side(&self) -> OrderSide {
        self.entry_side().opposite()
    }
}

/// Position lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Partial,
    Closed,
}

/// Why a position was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    StopLoss,
    TakeProfit,
    /// Exit signal from the strategy plugin
    Signal,
    StrategyStopped,
    Manual,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::StopLoss => "stop_loss",
            CloseReason::TakeProfit => "take_profit",
            CloseReason::Signal => "signal",
            CloseReason::StrategyStopped => "strategy_stopped",
            CloseReason::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// A strategy's exposure to one symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub strategy_id: String,
    pub exchange: String,
    pub symbol: String,
    pub side: PositionSide,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    /// Last marked price (exit price once closed)
    pub current_price: Decimal,
    pub status: PositionStatus,
    /// Unrealized P&L while open, realized once closed
    pub pnl: Decimal,
    pub pnl_percent: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub entry_order_id: Option<String>,
    pub exit_order_id: Option<String>,
    pub close_reason: Option<CloseReason>,
    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    pub fn is_closed(&self) -> bool {
        self.status == PositionStatus::Closed
    }

    /// Entry notional
    pub fn cost_basis(&self) -> Decimal {
        self.entry_price * self.quantity
    }

    /// P&L if the position were valued at `price`
    pub fn pnl_at(&self, price: Decimal) -> Decimal {
        match self.side {
            PositionSide::Long => (price - self.entry_price) * self.quantity,
            PositionSide::Short => (self.entry_price - price) * self.quantity,
        }
    }

    /// `pnl` as a percentage of cost basis, rounded to 4 dp
    pub fn pnl_percent_of(&self, pnl: Decimal) -> Decimal {
        let basis = self.cost_basis();
        if basis.is_zero() {
            return Decimal::ZERO;
        }
        (pnl / basis * Decimal::ONE_HUNDRED).round_dp(4)
    }

    /// Revalue at `price` without changing status
    pub fn mark(&mut self, price: Decimal, at: DateTime<Utc>) {
        let pnl = self.pnl_at(price);
        self.current_price = price;
        self.pnl = pnl;
        self.pnl_percent = self.pnl_percent_of(pnl);
        self.updated_at = at;
    }

    /// Threshold crossed at `price`, if any. Stop-loss wins when both are.
    pub fn triggered_exit(&self, price: Decimal) -> Option<CloseReason> {
        let stop_hit = self.stop_loss.is_some_and(|stop| match self.side {
            PositionSide::Long => price <= stop,
            PositionSide::Short => price >= stop,
        });
        if stop_hit {
            return Some(CloseReason::StopLoss);
        }

        let target_hit = self.take_profit.is_some_and(|target| match self.side {
            PositionSide::Long => price >= target,
            PositionSide::Short => price <= target,
        });
        target_hit.then_some(CloseReason::TakeProfit)
    }
}

/// Query filter over stored positions
#[derive(Debug, Clone, Default)]
pub struct PositionFilter {
    pub strategy_id: Option<String>,
    pub exchange: Option<String>,
    pub symbol: Option<String>,
    pub status: Option<PositionStatus>,
    /// Only `open`/`partial` positions
    pub active_only: bool,
}

impl PositionFilter {
    pub fn strategy(strategy_id: &str) -> Self {
        Self {
            strategy_id: Some(strategy_id.to_string()),
            ..Self::default()
        }
    }

    pub fn active() -> Self {
        Self {
            active_only: true,
            ..Self::default()
        }
    }

    pub fn with_symbol(mut self, symbol: &str) -> Self {
        self.symbol = Some(symbol.to_string());
        self
    }

    pub fn only_active(mut self) -> Self {
        self.active_only = true;
        self
    }

    pub fn matches(&self, position: &Position) -> bool {
        self.strategy_id
            .as_deref()
            .map_or(true, |s| position.strategy_id == s)
            && self.exchange.as_deref().map_or(true, |e| position.exchange == e)
            && self.symbol.as_deref().map_or(true, |s| position.symbol == s)
            && self.status.map_or(true, |s| position.status == s)
            && (!self.active_only || !position.is_closed())
    }
}

/// Parameters for opening a position
#[derive(Debug, Clone)]
pub struct OpenPositionRequest {
    pub strategy_id: String,
    pub exchange: String,
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
}

/// Aggregate performance over a set of positions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionSummary {
    pub total_positions: usize,
    pub open_positions: usize,
    pub closed_positions: usize,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub total_pnl: Decimal,
    /// Winning closed positions as a percentage of closed positions
    pub win_rate: Decimal,
    pub avg_win: Decimal,
    pub avg_loss: Decimal,
    pub winning_trades: usize,
    pub losing_trades: usize,
    /// Cost basis of non-closed positions
    pub open_exposure: Decimal,
}

impl PositionSummary {
    pub fn from_positions<'a>(positions: impl IntoIterator<Item = &'a Position>) -> Self {
        let mut summary = Self::default();
        let mut total_wins = Decimal::ZERO;
        let mut total_losses = Decimal::ZERO;

        for position in positions {
            summary.total_positions += 1;
            if position.is_closed() {
                summary.closed_positions += 1;
                summary.realized_pnl += position.pnl;
                if position.pnl > Decimal::ZERO {
                    summary.winning_trades += 1;
                    total_wins += position.pnl;
                } else {
                    summary.losing_trades += 1;
                    total_losses += position.pnl;
                }
            } else {
                summary.open_positions += 1;
                summary.unrealized_pnl += position.pnl;
                summary.open_exposure += position.cost_basis();
            }
        }

        summary.total_pnl = summary.realized_pnl + summary.unrealized_pnl;
        if summary.closed_positions > 0 {
            summary.win_rate = (Decimal::from(summary.winning_trades)
                / Decimal::from(summary.closed_positions)
                * Decimal::ONE_HUNDRED)
                .round_dp(2);
        }
        if summary.winning_trades > 0 {
            summary.avg_win = total_wins / Decimal::from(summary.winning_trades);
        }
        if summary.losing_trades > 0 {
            summary.avg_loss = total_losses / Decimal::from(summary.losing_trades);
        }
        summary
    }
}

/// Position ledger errors
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("position {0} not found")]
    NotFound(Uuid),
    /// Closing a position that is already closed
    #[error("position {0} is already closed")]
    AlreadyClosed(Uuid),
    #[error("strategy {strategy_id} already has an open position in {symbol}")]
    PositionExists { strategy_id: String, symbol: String },
    #[error("invalid quantity: {0}")]
    InvalidQuantity(Decimal),
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
