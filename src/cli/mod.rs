//! CLI interface for unlock-trader
//!
//! Provides subcommands for:
//! - `run`: Activate strategies and trade until interrupted
//! - `check-exchange`: Connection test against one configured exchange
//! - `unlocks`: List upcoming token unlocks from the fact file
//! - `config`: Show effective configuration

mod check;
mod run;
mod unlocks;

pub use check::CheckArgs;
pub use run::RunArgs;
pub use unlocks::UnlocksArgs;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "unlock-trader")]
#[command(about = "Event-driven crypto strategy execution engine")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    pub config: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Activate strategies and trade until Ctrl-C
    Run(RunArgs),
    /// Connect to an exchange and print ticker and balances
    CheckExchange(CheckArgs),
    /// List upcoming token unlocks
    Unlocks(UnlocksArgs),
    /// Show effective configuration
    Config,
}
