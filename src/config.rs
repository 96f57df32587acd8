//! Configuration types for unlock-trader

use crate::engine::{EngineSettings, StrategyConfig};
use crate::store::InMemoryStore;
use crate::strategy::{PriceClose, UnlockEvent};
use crate::telemetry::LogFormat;
use anyhow::Context;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub engine: EngineSettings,
    /// Exchange used when a call names none; defaults to the first registered
    #[serde(default)]
    pub default_exchange: Option<String>,
    #[serde(default)]
    pub exchanges: Vec<ExchangeSettings>,
    #[serde(default)]
    pub strategies: Vec<StrategyConfig>,
    /// TOML fact file with `[[unlocks]]` and `[[prices]]`
    #[serde(default)]
    pub unlocks_file: Option<PathBuf>,
}

/// Telemetry configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
    /// Prometheus scrape port; no exporter when unset
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            metrics_port: None,
        }
    }
}

/// One exchange account
#[derive(Clone, Deserialize)]
pub struct ExchangeSettings {
    /// Registry name
    pub name: String,
    /// Connector kind (`binance` or `paper`); defaults to `name`
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_secret: Option<String>,
    /// Environment variable holding the API key
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Environment variable holding the API secret
    #[serde(default)]
    pub api_secret_env: Option<String>,
    #[serde(default)]
    pub testnet: bool,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_recv_window_ms")]
    pub recv_window_ms: u64,
    /// Override the REST base URL
    #[serde(default)]
    pub base_url: Option<String>,
    /// Paper fill fee rate
    #[serde(default = "default_fee_rate")]
    pub fee_rate: Decimal,
}

fn default_timeout_ms() -> u64 {
    30_000
}
fn default_recv_window_ms() -> u64 {
    5_000
}
fn default_fee_rate() -> Decimal {
    dec!(0.001) // 0.1% taker
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: None,
            api_key: None,
            api_secret: None,
            api_key_env: None,
            api_secret_env: None,
            testnet: false,
            timeout_ms: default_timeout_ms(),
            recv_window_ms: default_recv_window_ms(),
            base_url: None,
            fee_rate: default_fee_rate(),
        }
    }
}

impl fmt::Debug for ExchangeSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (api_key, api_secret) = self.credentials();
        f.debug_struct("ExchangeSettings")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("api_key", &api_key.map(|_| "<redacted>"))
            .field("api_secret", &api_secret.map(|_| "<redacted>"))
            .field("testnet", &self.testnet)
            .field("timeout_ms", &self.timeout_ms)
            .field("recv_window_ms", &self.recv_window_ms)
            .field("base_url", &self.base_url)
            .field("fee_rate", &self.fee_rate)
            .finish()
    }
}

impl ExchangeSettings {
    pub fn kind(&self) -> &str {
        self.kind.as_deref().unwrap_or(&self.name)
    }

    /// API key and secret, inline values first, then environment variables
    pub fn credentials(&self) -> (Option<String>, Option<String>) {
        let resolve = |inline: &Option<String>, env: &Option<String>| {
            inline
                .clone()
                .or_else(|| env.as_ref().and_then(|name| std::env::var(name).ok()))
                .filter(|value| !value.is_empty())
        };
        (
            resolve(&self.api_key, &self.api_key_env),
            resolve(&self.api_secret, &self.api_secret_env),
        )
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;

        // Fact file paths are relative to the config file
        if let (Some(file), Some(dir)) = (&config.unlocks_file, path.parent()) {
            if file.is_relative() {
                config.unlocks_file = Some(dir.join(file));
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate cross-references between sections
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut exchanges = HashSet::new();
        for exchange in &self.exchanges {
            if exchange.name.is_empty() {
                anyhow::bail!("Exchange name must not be empty");
            }
            if !exchanges.insert(exchange.name.as_str()) {
                anyhow::bail!("Duplicate exchange: {}", exchange.name);
            }
            if exchange.fee_rate < Decimal::ZERO {
                anyhow::bail!("Exchange {} has a negative fee rate", exchange.name);
            }
        }

        if let Some(default) = &self.default_exchange {
            if !exchanges.contains(default.as_str()) {
                anyhow::bail!("Default exchange {} is not configured", default);
            }
        }

        let mut strategies = HashSet::new();
        for strategy in &self.strategies {
            if !strategies.insert(strategy.id.as_str()) {
                anyhow::bail!("Duplicate strategy: {}", strategy.id);
            }
            if !exchanges.contains(strategy.exchange.as_str()) {
                anyhow::bail!(
                    "Strategy {} uses unconfigured exchange {}",
                    strategy.id,
                    strategy.exchange
                );
            }
            strategy.validate()?;
        }

        if self.engine.reconcile_interval_secs == 0 || self.engine.ticker_interval_ms == 0 {
            anyhow::bail!("Engine intervals must be positive");
        }
        Ok(())
    }

    pub fn strategy(&self, id: &str) -> Option<&StrategyConfig> {
        self.strategies.iter().find(|s| s.id == id)
    }
}

/// Strategy fact tables loaded from TOML
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FactFile {
    #[serde(default)]
    pub unlocks: Vec<UnlockEvent>,
    #[serde(default)]
    pub prices: Vec<PriceClose>,
}

impl FactFile {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read fact file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse fact file {}", path.display()))
    }

    /// Copy every fact into `store`
    pub async fn seed(self, store: &InMemoryStore) {
        tracing::info!(
            unlocks = self.unlocks.len(),
            prices = self.prices.len(),
            "Seeding strategy facts"
        );
        store.seed(self.unlocks, self.prices).await;
    }
}
