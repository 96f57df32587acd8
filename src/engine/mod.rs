//! Strategy execution engine
//!
//! Activates strategies, admits or rejects their signals against capital and
//! loss limits, executes through the position ledger and triggers emergency
//! stops on risk breaches.

mod admission;
mod orchestrator;
mod types;

pub use admission::{
    admit, daily_loss_allowance, position_fraction, position_value, risk_breach, Admission,
    RejectReason,
};
pub use orchestrator::StrategyOrchestrator;
pub use types::{
    EngineError, EngineEvent, EngineSettings, ExecutionMode, SignalOutcome, SignalRecord,
    StrategyConfig, StrategyState,
};
