//! Position ledger
//!
//! Position lifecycle, mark-to-market, stop-loss/take-profit enforcement and
//! performance aggregation.

mod locks;
mod manager;
mod types;

pub use locks::KeyedLocks;
pub use manager::PositionLedger;
pub use types::{
    CloseReason, LedgerError, OpenPositionRequest, Position, PositionFilter, PositionSide,
    PositionStatus, PositionSummary,
};
