//! Admission control and risk limits
//!
//! Pure checks over a freshly recomputed `StrategyState`. Checks run in a
//! fixed order and the first failure wins.

use super::{StrategyConfig, StrategyState};
use crate::strategy::{SignalAction, TradingSignal};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a signal was not executed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    StrategyInactive,
    EmergencyStop,
    DailyLossLimit { current: Decimal, limit: Decimal },
    MaxOpenPositions { open: usize, max: usize },
    InsufficientCapital { required: Decimal, available: Decimal },
    PositionExists { symbol: String },
    NoOpenPosition { symbol: String },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::StrategyInactive => write!(f, "strategy is not active"),
            RejectReason::EmergencyStop => write!(f, "emergency stop in effect"),
            RejectReason::DailyLossLimit { current, limit } => {
                write!(f, "daily loss {} breached limit -{}", current, limit)
            }
            RejectReason::MaxOpenPositions { open, max } => {
                write!(f, "{} of {} positions already open", open, max)
            }
            RejectReason::InsufficientCapital {
                required,
                available,
            } => write!(f, "position value {} exceeds available {}", required, available),
            RejectReason::PositionExists { symbol } => {
                write!(f, "position already open for {}", symbol)
            }
            RejectReason::NoOpenPosition { symbol } => {
                write!(f, "no open position for {}", symbol)
            }
        }
    }
}

impl RejectReason {
    /// Metric label
    pub fn label(&self) -> &'static str {
        match self {
            RejectReason::StrategyInactive => "inactive",
            RejectReason::EmergencyStop => "emergency_stop",
            RejectReason::DailyLossLimit { .. } => "daily_loss",
            RejectReason::MaxOpenPositions { .. } => "max_positions",
            RejectReason::InsufficientCapital { .. } => "capital",
            RejectReason::PositionExists { .. } => "position_exists",
            RejectReason::NoOpenPosition { .. } => "no_position",
        }
    }
}

/// Admission decision
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Approved,
    Rejected(RejectReason),
}

impl Admission {
    pub fn is_approved(&self) -> bool {
        matches!(self, Admission::Approved)
    }
}

/// Fraction of current capital a buy commits
pub fn position_fraction(signal: &TradingSignal, config: &StrategyConfig) -> Decimal {
    signal.position_size.unwrap_or(config.max_position_size)
}

/// Quote value of the position a buy would open
pub fn position_value(signal: &TradingSignal, config: &StrategyConfig, state: &StrategyState) -> Decimal {
    state.current_capital * position_fraction(signal, config)
}

/// Daily loss allowance in quote currency
pub fn daily_loss_allowance(config: &StrategyConfig, state: &StrategyState) -> Decimal {
    config.daily_loss_limit * state.allocated_capital
}

/// Decide whether `signal` may be executed.
///
/// `has_open_position` reports whether the strategy holds a non-closed
/// position in the signal's symbol.
pub fn admit(
    signal: &TradingSignal,
    config: &StrategyConfig,
    state: &StrategyState,
    has_open_position: bool,
) -> Admission {
    if !state.is_active {
        return Admission::Rejected(RejectReason::StrategyInactive);
    }

    if state.emergency_stop_triggered {
        return Admission::Rejected(RejectReason::EmergencyStop);
    }

    let allowance = daily_loss_allowance(config, state);
    if state.daily_loss_current <= -allowance {
        return Admission::Rejected(RejectReason::DailyLossLimit {
            current: state.daily_loss_current,
            limit: allowance,
        });
    }

    match signal.action {
        SignalAction::Buy => {
            if state.current_open_positions >= config.max_open_positions {
                return Admission::Rejected(RejectReason::MaxOpenPositions {
                    open: state.current_open_positions,
                    max: config.max_open_positions,
                });
            }

            let required = position_value(signal, config, state);
            if required > state.available_capital {
                return Admission::Rejected(RejectReason::InsufficientCapital {
                    required,
                    available: state.available_capital,
                });
            }

            if has_open_position {
                return Admission::Rejected(RejectReason::PositionExists {
                    symbol: signal.symbol.clone(),
                });
            }
        }
        SignalAction::Sell => {
            if !has_open_position {
                return Admission::Rejected(RejectReason::NoOpenPosition {
                    symbol: signal.symbol.clone(),
                });
            }
        }
        SignalAction::Hold => {}
    }

    Admission::Approved
}

/// Risk-limit breach that forces an emergency stop, if any
pub fn risk_breach(
    config: &StrategyConfig,
    state: &StrategyState,
    default_max_drawdown: Decimal,
) -> Option<String> {
    let allowance = daily_loss_allowance(config, state);
    if state.daily_loss_current <= -allowance {
        return Some(format!(
            "daily loss limit breached: {} <= -{}",
            state.daily_loss_current.round_dp(2),
            allowance.round_dp(2)
        ));
    }

    let ceiling = config.max_drawdown.unwrap_or(default_max_drawdown) * state.allocated_capital;
    if state.total_pnl <= -ceiling {
        return Some(format!(
            "max drawdown breached: {} <= -{}",
            state.total_pnl.round_dp(2),
            ceiling.round_dp(2)
        ));
    }

    None
}
