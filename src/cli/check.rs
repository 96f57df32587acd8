//! Exchange connection test

use crate::config::Config;
use crate::exchange::build_connector;
use anyhow::Context;
use clap::Args;

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Configured exchange name
    pub name: String,

    /// Symbol to fetch a ticker for
    #[arg(long, default_value = "BTC/USDT")]
    pub symbol: String,
}

impl CheckArgs {
    pub async fn execute(&self, config: &Config) -> anyhow::Result<()> {
        let settings = config
            .exchanges
            .iter()
            .find(|e| e.name == self.name)
            .with_context(|| format!("Exchange {} is not configured", self.name))?;

        let connector = build_connector(settings)?;
        connector
            .connect()
            .await
            .with_context(|| format!("Failed to connect to {}", self.name))?;
        println!("Connected to {} ({})", connector.name(), settings.kind());

        match connector.fetch_ticker(&self.symbol).await {
            Ok(ticker) => {
                println!("  {} last={} bid={} ask={}", ticker.symbol, ticker.last, ticker.bid, ticker.ask);
                println!("  24h high={} low={} volume={}", ticker.high, ticker.low, ticker.volume);
            }
            Err(e) => println!("  Ticker unavailable: {}", e),
        }

        let (api_key, _) = settings.credentials();
        if api_key.is_some() || connector.is_paper() {
            let balances = connector.fetch_balance().await?;
            if balances.is_empty() {
                println!("  No balances");
            }
            for (asset, balance) in balances {
                println!(
                    "  {:<8} free={} locked={} total={}",
                    asset, balance.free, balance.locked, balance.total
                );
            }
        } else {
            println!("  No credentials, skipping balances");
        }

        connector.disconnect().await?;
        Ok(())
    }
}
