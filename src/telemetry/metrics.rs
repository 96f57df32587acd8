//! Prometheus metrics

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Latency metric types
#[derive(Debug, Clone, Copy)]
pub enum LatencyMetric {
    /// Connector round trip, labelled by exchange and operation
    ExchangeCall,
    /// Signal validation plus execution
    SignalHandling,
    /// One reconciliation tick
    Reconciliation,
}

/// Counter metric types
#[derive(Debug, Clone, Copy)]
pub enum CounterMetric {
    /// Non-hold signals produced by plugins
    SignalsGenerated,
    /// Signals refused by admission control
    SignalsRejected,
    /// Signals that resulted in an order
    SignalsExecuted,
    /// Failed order placements
    ExecutionErrors,
    /// Emergency stops fired
    EmergencyStops,
    /// Failed market-data polls
    PollFailures,
}

/// Per-strategy gauge metric types
#[derive(Debug, Clone, Copy)]
pub enum GaugeMetric {
    /// Open position count
    OpenPositions,
    /// Realized plus unrealized P&L
    TotalPnl,
    /// Daily loss accumulator (zero or negative)
    DailyLoss,
    /// Capital not tied up in open positions
    AvailableCapital,
}

impl LatencyMetric {
    fn name(self) -> &'static str {
        match self {
            LatencyMetric::ExchangeCall => "unlock_trader_exchange_call_seconds",
            LatencyMetric::SignalHandling => "unlock_trader_signal_handling_seconds",
            LatencyMetric::Reconciliation => "unlock_trader_reconciliation_seconds",
        }
    }
}

impl CounterMetric {
    fn name(self) -> &'static str {
        match self {
            CounterMetric::SignalsGenerated => "unlock_trader_signals_generated_total",
            CounterMetric::SignalsRejected => "unlock_trader_signals_rejected_total",
            CounterMetric::SignalsExecuted => "unlock_trader_signals_executed_total",
            CounterMetric::ExecutionErrors => "unlock_trader_execution_errors_total",
            CounterMetric::EmergencyStops => "unlock_trader_emergency_stops_total",
            CounterMetric::PollFailures => "unlock_trader_market_data_poll_failures_total",
        }
    }
}

impl GaugeMetric {
    fn name(self) -> &'static str {
        match self {
            GaugeMetric::OpenPositions => "unlock_trader_open_positions",
            GaugeMetric::TotalPnl => "unlock_trader_total_pnl",
            GaugeMetric::DailyLoss => "unlock_trader_daily_loss",
            GaugeMetric::AvailableCapital => "unlock_trader_available_capital",
        }
    }
}

/// Record a latency measurement with a single label
pub fn record_latency(metric: LatencyMetric, label: (&'static str, &str), duration: Duration) {
    let (key, value) = label;
    histogram!(metric.name(), key => value.to_string()).record(duration.as_secs_f64());
}

/// Increment a counter with a single label
pub fn increment(metric: CounterMetric, label: (&'static str, &str)) {
    let (key, value) = label;
    counter!(metric.name(), key => value.to_string()).increment(1);
}

/// Set a per-strategy gauge
pub fn set_gauge(metric: GaugeMetric, strategy_id: &str, value: f64) {
    gauge!(metric.name(), "strategy" => strategy_id.to_string()).set(value);
}

/// Install the Prometheus exporter with an HTTP scrape endpoint on `port`
pub fn init_metrics(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install metrics exporter: {}", e))?;

    tracing::info!(%addr, "Prometheus metrics endpoint listening");
    Ok(())
}
