//! Integration tests for the shipped configuration and fact files

use chrono::{TimeZone, Utc};
use rust_decimal_macros::dec;
use tokio_test::{assert_err, assert_ok};
use unlock_trader::config::{Config, FactFile};
use unlock_trader::engine::ExecutionMode;
use unlock_trader::store::{InMemoryStore, Store};

const EXAMPLE_CONFIG: &str = include_str!("../../config.toml.example");
const EXAMPLE_FACTS: &str = include_str!("../../unlocks.toml.example");

#[test]
fn test_example_config_is_valid() {
    let config: Config = toml::from_str(EXAMPLE_CONFIG).unwrap();
    assert_ok!(config.validate());

    assert_eq!(config.default_exchange.as_deref(), Some("paper"));
    assert_eq!(config.exchanges.len(), 1);
    assert_eq!(config.exchanges[0].kind(), "paper");

    let strategy = config.strategy("unlock-paper").unwrap();
    assert_eq!(strategy.mode, ExecutionMode::Paper);
    assert_eq!(strategy.symbols, vec!["ARB/USDT", "OP/USDT"]);
    assert_eq!(strategy.allocated_capital, dec!(10000));
    assert_eq!(strategy.daily_loss_limit, dec!(0.05));
}

#[test]
fn test_live_strategy_on_unknown_exchange_rejected() {
    let mut config: Config = toml::from_str(EXAMPLE_CONFIG).unwrap();
    config.strategies[0].exchange = "binance".to_string();
    config.strategies[0].mode = ExecutionMode::Live;

    let err = assert_err!(config.validate());
    assert!(err.to_string().contains("binance"));
}

#[test]
fn test_zero_interval_rejected() {
    let mut config: Config = toml::from_str(EXAMPLE_CONFIG).unwrap();
    config.engine.reconcile_interval_secs = 0;
    assert_err!(config.validate());
}

#[tokio::test]
async fn test_fact_file_seeds_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("unlocks.toml");
    std::fs::write(&path, EXAMPLE_FACTS).unwrap();

    let facts = assert_ok!(FactFile::load(&path));
    assert_eq!(facts.unlocks.len(), 2);
    assert_eq!(facts.prices.len(), 2);

    let store = InMemoryStore::new();
    facts.seed(&store).await;

    let from = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
    let to = Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap();
    let unlocks = store.upcoming_unlocks(from, to, dec!(2.2)).await.unwrap();
    assert_eq!(unlocks.len(), 1);
    assert_eq!(unlocks[0].token_symbol, "OP");

    let closes = store.price_closes("ARB", from).await.unwrap();
    assert_eq!(closes.len(), 2);
    assert!(closes[0].timestamp < closes[1].timestamp);
    assert_eq!(closes[1].close, dec!(0.38));
}

#[test]
fn test_malformed_fact_file_reports_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.toml");
    std::fs::write(&path, "[[unlocks]]\ntoken_symbol = 7\n").unwrap();

    let err = assert_err!(FactFile::load(&path));
    assert!(err.to_string().contains("broken.toml"));
}
