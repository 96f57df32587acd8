//! unlock-trader: event-driven strategy execution engine for crypto spot markets
//!
//! This library provides the core components for:
//! - Exchange connectivity (Binance REST, paper trading) behind one trait
//! - A registry routing calls to named exchange connectors
//! - Polling market data subscriptions with per-subscription channels
//! - A position ledger with P&L, stop-loss and take-profit enforcement
//! - Strategy plugins, including a token-unlock front-runner
//! - An orchestrator with admission control and emergency stops
//! - Structured logging and Prometheus metrics

pub mod cli;
pub mod config;
pub mod engine;
pub mod exchange;
pub mod ledger;
pub mod market_data;
pub mod store;
pub mod strategy;
pub mod telemetry;
