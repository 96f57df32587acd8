use clap::Parser;
use unlock_trader::cli::{Cli, Commands};
use unlock_trader::config::Config;

const DEFAULT_CONFIG: &str = include_str!("../config.toml.example");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Warning: Could not load config from {}: {:#}", cli.config, e);
            eprintln!("Using default paper configuration");
            toml::from_str::<Config>(DEFAULT_CONFIG)?
        }
    };

    // Initialize telemetry
    let _telemetry = unlock_trader::telemetry::init_telemetry(&config.telemetry)?;

    match cli.command {
        Commands::Run(args) => {
            tracing::info!(strategies = config.strategies.len(), "Starting engine");
            args.execute(&config).await?;
        }
        Commands::CheckExchange(args) => {
            args.execute(&config).await?;
        }
        Commands::Unlocks(args) => {
            args.execute(&config).await?;
        }
        Commands::Config => {
            println!("Current configuration:");
            println!("  Telemetry: {:?}", config.telemetry);
            println!("  Engine: {:?}", config.engine);
            println!(
                "  Default exchange: {}",
                config.default_exchange.as_deref().unwrap_or("<first registered>")
            );
            for exchange in &config.exchanges {
                println!("  Exchange: {:?}", exchange);
            }
            for strategy in &config.strategies {
                println!(
                    "  Strategy: {} ({}) on {} symbols={:?} capital={} max_pos={}%",
                    strategy.id,
                    strategy.mode,
                    strategy.exchange,
                    strategy.symbols,
                    strategy.allocated_capital,
                    strategy.max_position_size * rust_decimal_macros::dec!(100)
                );
            }
            if let Some(path) = &config.unlocks_file {
                println!("  Unlocks file: {}", path.display());
            }
        }
    }

    Ok(())
}
