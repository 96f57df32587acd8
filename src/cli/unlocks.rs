//! Upcoming unlock listing

use crate::config::{Config, FactFile};
use crate::store::{InMemoryStore, Store};
use anyhow::Context;
use chrono::{Duration, Utc};
use clap::Args;
use rust_decimal::Decimal;

#[derive(Args, Debug)]
pub struct UnlocksArgs {
    /// Look-ahead window in days
    #[arg(long, default_value_t = 30)]
    pub days: i64,

    /// Minimum unlock size in percent of supply
    #[arg(long)]
    pub min_percent: Option<Decimal>,
}

impl UnlocksArgs {
    pub async fn execute(&self, config: &Config) -> anyhow::Result<()> {
        let path = config
            .unlocks_file
            .as_ref()
            .context("No unlocks_file configured")?;

        let store = InMemoryStore::new();
        FactFile::load(path)?.seed(&store).await;

        let now = Utc::now();
        let events = store
            .upcoming_unlocks(
                now,
                now + Duration::days(self.days),
                self.min_percent.unwrap_or(Decimal::ZERO),
            )
            .await?;

        if events.is_empty() {
            println!("No unlocks in the next {} days", self.days);
            return Ok(());
        }

        println!("{:<8} {:<22} {:>10} {:>18} {:>8}", "TOKEN", "DATE", "SUPPLY %", "AMOUNT", "HOURS");
        for event in events {
            let hours = (event.unlock_date - now).num_hours();
            println!(
                "{:<8} {:<22} {:>10} {:>18} {:>8}",
                event.token_symbol,
                event.unlock_date.format("%Y-%m-%d %H:%M UTC").to_string(),
                event.percent_of_supply.round_dp(2),
                event.unlock_amount.round_dp(0),
                hours
            );
        }
        Ok(())
    }
}
