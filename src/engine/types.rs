//! Engine types

use super::RejectReason;
use crate::exchange::ExchangeError;
use crate::ledger::LedgerError;
use crate::market_data::MarketDataError;
use crate::store::StoreError;
use crate::strategy::{PluginConfig, SignalAction, StrategyError, TradingSignal};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Whether a strategy trades against a simulated or a real account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Paper,
    Live,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExecutionMode::Paper => "paper",
            ExecutionMode::Live => "live",
        })
    }
}

/// Activation parameters for one strategy
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StrategyConfig {
    pub id: String,
    /// Market symbols traded, e.g. `ARB/USDT`
    pub symbols: Vec<String>,
    /// Registered exchange name
    pub exchange: String,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default = "default_allocated_capital")]
    pub allocated_capital: Decimal,
    /// Default fraction of current capital per position
    #[serde(default = "default_max_position_size")]
    pub max_position_size: Decimal,
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: usize,
    /// Fraction of allocated capital that may be lost per UTC day
    #[serde(default = "default_daily_loss_limit")]
    pub daily_loss_limit: Decimal,
    /// Stop-loss fraction, overrides the plugin default
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    /// Take-profit fraction, overrides the plugin default
    #[serde(default)]
    pub take_profit: Option<Decimal>,
    /// Drawdown ceiling as a fraction of allocated capital
    #[serde(default)]
    pub max_drawdown: Option<Decimal>,
    #[serde(default)]
    pub plugin: PluginConfig,
}

fn default_allocated_capital() -> Decimal {
    dec!(10000)
}
fn default_max_position_size() -> Decimal {
    dec!(0.10)
}
fn default_max_open_positions() -> usize {
    3
}
fn default_daily_loss_limit() -> Decimal {
    dec!(0.05)
}

impl StrategyConfig {
    /// Paper config with default limits and plugin
    pub fn new(id: &str, symbols: Vec<String>, exchange: &str) -> Self {
        Self {
            id: id.to_string(),
            symbols,
            exchange: exchange.to_string(),
            mode: ExecutionMode::Paper,
            allocated_capital: default_allocated_capital(),
            max_position_size: default_max_position_size(),
            max_open_positions: default_max_open_positions(),
            daily_loss_limit: default_daily_loss_limit(),
            stop_loss: None,
            take_profit: None,
            max_drawdown: None,
            plugin: PluginConfig::default(),
        }
    }

    /// Check business invariants the engine relies on
    pub fn validate(&self) -> Result<(), EngineError> {
        let invalid = |msg: &str| Err(EngineError::InvalidConfig(format!("{}: {}", self.id, msg)));

        if self.id.is_empty() {
            return Err(EngineError::InvalidConfig("strategy id is empty".to_string()));
        }
        if self.symbols.is_empty() {
            return invalid("no symbols configured");
        }
        if self.allocated_capital <= Decimal::ZERO {
            return invalid("allocated capital must be positive");
        }
        if self.max_position_size <= Decimal::ZERO || self.max_position_size > Decimal::ONE {
            return invalid("max position size must be in (0, 1]");
        }
        if self.max_open_positions == 0 {
            return invalid("max open positions must be at least 1");
        }
        if self.daily_loss_limit <= Decimal::ZERO {
            return invalid("daily loss limit must be positive");
        }
        Ok(())
    }
}

/// Persisted execution state of a strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyState {
    pub strategy_id: String,
    pub is_active: bool,
    pub allocated_capital: Decimal,
    /// Allocated capital plus realized P&L
    pub current_capital: Decimal,
    /// Current capital minus open exposure
    pub available_capital: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub total_pnl: Decimal,
    /// Closed positions
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    /// Today's loss, never positive
    pub daily_loss_current: Decimal,
    pub current_open_positions: usize,
    pub emergency_stop_triggered: bool,
    pub stop_reason: Option<String>,
    pub activated_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl StrategyState {
    pub fn new(config: &StrategyConfig, now: DateTime<Utc>) -> Self {
        Self {
            strategy_id: config.id.clone(),
            is_active: false,
            allocated_capital: config.allocated_capital,
            current_capital: config.allocated_capital,
            available_capital: config.allocated_capital,
            realized_pnl: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            total_pnl: Decimal::ZERO,
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            daily_loss_current: Decimal::ZERO,
            current_open_positions: 0,
            emergency_stop_triggered: false,
            stop_reason: None,
            activated_at: None,
            stopped_at: None,
            updated_at: now,
        }
    }
}

/// Audit record of a non-hold signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRecord {
    pub signal: TradingSignal,
    pub executed: bool,
    pub executed_at: Option<DateTime<Utc>>,
    pub position_id: Option<Uuid>,
    pub rejection: Option<RejectReason>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl SignalRecord {
    pub fn new(signal: TradingSignal, now: DateTime<Utc>) -> Self {
        Self {
            signal,
            executed: false,
            executed_at: None,
            position_id: None,
            rejection: None,
            error: None,
            created_at: now,
        }
    }
}

/// Lifecycle and execution events for outer layers
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    StrategyActivated {
        strategy_id: String,
    },
    StrategyStopped {
        strategy_id: String,
        reason: Option<String>,
    },
    SignalExecuted {
        strategy_id: String,
        signal_id: Uuid,
        symbol: String,
        action: SignalAction,
        position_id: Uuid,
    },
    ExecutionError {
        strategy_id: String,
        signal_id: Option<Uuid>,
        error: String,
    },
    EmergencyStop {
        strategy_id: String,
        reason: String,
    },
}

impl EngineEvent {
    pub fn strategy_id(&self) -> &str {
        match self {
            EngineEvent::StrategyActivated { strategy_id }
            | EngineEvent::StrategyStopped { strategy_id, .. }
            | EngineEvent::SignalExecuted { strategy_id, .. }
            | EngineEvent::ExecutionError { strategy_id, .. }
            | EngineEvent::EmergencyStop { strategy_id, .. } => strategy_id,
        }
    }
}

/// What happened to one market update
#[derive(Debug, Clone, PartialEq)]
pub enum SignalOutcome {
    /// No signal, a hold, or the strategy is shutting down
    NoSignal,
    Rejected {
        signal_id: Uuid,
        reason: RejectReason,
    },
    Executed {
        signal_id: Uuid,
        position_id: Uuid,
    },
    Failed {
        signal_id: Uuid,
        error: String,
    },
}

/// Orchestrator tuning
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_ticker_interval_ms")]
    pub ticker_interval_ms: u64,
    /// Drawdown ceiling for strategies without their own
    #[serde(default = "default_max_drawdown_pct")]
    pub max_drawdown_pct: Decimal,
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_reconcile_interval_secs() -> u64 {
    5
}
fn default_ticker_interval_ms() -> u64 {
    1000
}
fn default_max_drawdown_pct() -> Decimal {
    dec!(0.20)
}
fn default_event_buffer() -> usize {
    1024
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: default_reconcile_interval_secs(),
            ticker_interval_ms: default_ticker_interval_ms(),
            max_drawdown_pct: default_max_drawdown_pct(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl EngineSettings {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn ticker_interval(&self) -> Duration {
        Duration::from_millis(self.ticker_interval_ms)
    }
}

/// Orchestrator errors
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("orchestrator is not running")]
    NotRunning,
    #[error("strategy {0} is not active")]
    StrategyNotFound(String),
    #[error("invalid strategy config: {0}")]
    InvalidConfig(String),
    #[error("strategy {strategy_id} is {mode} but exchange {exchange} is not")]
    ModeMismatch {
        strategy_id: String,
        mode: ExecutionMode,
        exchange: String,
    },
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    #[error(transparent)]
    MarketData(#[from] MarketDataError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Strategy(#[from] StrategyError),
}
