//! Run command implementation

use crate::config::{Config, FactFile};
use crate::engine::{EngineEvent, StrategyConfig, StrategyOrchestrator};
use crate::exchange::ExchangeRegistry;
use crate::ledger::PositionLedger;
use crate::market_data::MarketDataService;
use crate::store::InMemoryStore;
use crate::strategy::DefaultPluginFactory;
use anyhow::Context;
use clap::Args;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Strategy ids to activate (default: all configured)
    #[arg(short, long = "strategy")]
    pub strategies: Vec<String>,

    /// Stop after this many seconds
    #[arg(long)]
    pub duration_secs: Option<u64>,
}

impl RunArgs {
    pub async fn execute(&self, config: &Config) -> anyhow::Result<()> {
        let strategies = self.selected(config)?;

        let registry = Arc::new(ExchangeRegistry::new());
        for exchange in &config.exchanges {
            registry
                .add_exchange(exchange)
                .await
                .with_context(|| format!("Failed to connect exchange {}", exchange.name))?;
        }
        if let Some(default) = &config.default_exchange {
            registry.set_default(default).await?;
        }

        let store = Arc::new(InMemoryStore::new());
        if let Some(path) = &config.unlocks_file {
            FactFile::load(path)?.seed(&store).await;
        }

        let market_data = Arc::new(MarketDataService::new(registry.clone()));
        let ledger = Arc::new(PositionLedger::new(registry.clone(), store.clone()));
        let orchestrator = Arc::new(StrategyOrchestrator::new(
            registry.clone(),
            market_data,
            ledger.clone(),
            store.clone(),
            Arc::new(DefaultPluginFactory::new(store.clone())),
            config.engine.clone(),
        ));
        orchestrator.start();

        let mut events = orchestrator.subscribe_events();
        for strategy in strategies {
            match orchestrator.activate_strategy(strategy.clone()).await {
                Ok(state) => tracing::info!(
                    strategy_id = %state.strategy_id,
                    current_capital = %state.current_capital,
                    "Strategy running"
                ),
                Err(e) => tracing::error!(strategy_id = %strategy.id, error = %e, "Activation failed"),
            }
        }
        if orchestrator.active_strategies().await.is_empty() {
            tracing::warn!("No strategies active");
        }

        let duration = self.duration_secs.map(Duration::from_secs);
        let deadline = async move {
            match duration {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Shutdown requested");
                    break;
                }
                _ = &mut deadline => {
                    tracing::info!("Run duration elapsed");
                    break;
                }
                event = events.recv() => match event {
                    Ok(event) => log_event(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Event log lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        orchestrator.stop().await;
        let summary = ledger.summary(None).await?;
        tracing::info!(
            positions = summary.total_positions,
            realized_pnl = %summary.realized_pnl,
            win_rate = %summary.win_rate,
            "Session summary"
        );
        registry.disconnect_all().await;
        Ok(())
    }

    fn selected(&self, config: &Config) -> anyhow::Result<Vec<StrategyConfig>> {
        if self.strategies.is_empty() {
            return Ok(config.strategies.clone());
        }
        self.strategies
            .iter()
            .map(|id| {
                config
                    .strategy(id)
                    .cloned()
                    .with_context(|| format!("Unknown strategy: {}", id))
            })
            .collect()
    }
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::StrategyActivated { strategy_id } => {
            tracing::info!(strategy_id = %strategy_id, "Event: strategy activated");
        }
        EngineEvent::StrategyStopped {
            strategy_id,
            reason,
        } => {
            tracing::info!(strategy_id = %strategy_id, reason = ?reason, "Event: strategy stopped");
        }
        EngineEvent::SignalExecuted {
            strategy_id,
            symbol,
            action,
            position_id,
            ..
        } => {
            tracing::info!(
                strategy_id = %strategy_id,
                symbol = %symbol,
                action = %action,
                position_id = %position_id,
                "Event: signal executed"
            );
        }
        EngineEvent::ExecutionError {
            strategy_id,
            error,
            ..
        } => {
            tracing::error!(strategy_id = %strategy_id, error = %error, "Event: execution error");
        }
        EngineEvent::EmergencyStop {
            strategy_id,
            reason,
        } => {
            tracing::error!(strategy_id = %strategy_id, reason = %reason, "Event: emergency stop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selected_strategies() {
        let config = Config {
            strategies: vec![
                StrategyConfig::new("a", vec!["ARB/USDT".to_string()], "paper"),
                StrategyConfig::new("b", vec!["OP/USDT".to_string()], "paper"),
            ],
            ..Config::default()
        };

        let all = RunArgs {
            strategies: vec![],
            duration_secs: None,
        };
        assert_eq!(all.selected(&config).unwrap().len(), 2);

        let one = RunArgs {
            strategies: vec!["b".to_string()],
            duration_secs: None,
        };
        assert_eq!(one.selected(&config).unwrap()[0].id, "b");

        let unknown = RunArgs {
            strategies: vec!["c".to_string()],
            duration_secs: None,
        };
        assert!(unknown.selected(&config).is_err());
    }
}
