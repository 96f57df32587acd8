//! Binance spot REST connector
//!
//! Public market data goes through unauthenticated endpoints. Account and order
//! endpoints are signed: the query string (with `timestamp` and `recvWindow`)
//! is signed with HMAC-SHA256 using the API secret and the hex digest is
//! appended as `signature`.

use super::{
    Balance, BookLevel, Candle, ExchangeConnector, ExchangeError, ExchangeResult, Fee, Order,
    OrderBook, OrderRequest, OrderSide, OrderStatus, OrderType, Ticker,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, Response};
use rust_decimal::Decimal;
use serde_json::Value;
use sha2::Sha256;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

/// Production REST endpoint
pub const BINANCE_API_URL: &str = "https://api.binance.com";

/// Spot testnet REST endpoint
pub const BINANCE_TESTNET_URL: &str = "https://testnet.binance.vision";

/// Quote assets tried, in order, when mapping a market id back to "BASE/QUOTE"
const KNOWN_QUOTES: &[&str] = &["USDT", "FDUSD", "USDC", "BUSD", "TUSD", "BTC", "ETH", "BNB", "EUR", "TRY"];

/// Kline intervals accepted by the exchange
const INTERVALS: &[&str] = &[
    "1s", "1m", "3m", "5m", "15m", "30m", "1h", "2h", "4h", "6h", "8h", "12h", "1d", "3d", "1w",
    "1M",
];

/// Configuration for the Binance connector
#[derive(Debug, Clone)]
pub struct BinanceConfig {
    /// Registry name
    pub name: String,
    /// Base URL for the REST API
    pub base_url: String,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    /// Request timeout
    pub timeout: Duration,
    /// Validity window for signed requests
    pub recv_window_ms: u64,
}

impl Default for BinanceConfig {
    fn default() -> Self {
        Self {
            name: "binance".to_string(),
            base_url: BINANCE_API_URL.to_string(),
            api_key: None,
            api_secret: None,
            timeout: Duration::from_secs(30),
            recv_window_ms: 5000,
        }
    }
}

impl BinanceConfig {
    /// Configuration pointed at the spot testnet
    pub fn testnet() -> Self {
        Self {
            base_url: BINANCE_TESTNET_URL.to_string(),
            ..Self::default()
        }
    }

    fn has_credentials(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
            && self.api_secret.as_deref().is_some_and(|s| !s.is_empty())
    }
}

/// Binance spot connector
pub struct BinanceConnector {
    config: BinanceConfig,
    client: Client,
    connected: AtomicBool,
}

impl BinanceConnector {
    pub fn new(config: BinanceConfig) -> ExchangeResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ExchangeError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            config,
            client,
            connected: AtomicBool::new(false),
        })
    }

    /// Whether `connect` has succeeded and `disconnect` has not been called since
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn public_get(&self, path: &str, params: &[(&str, String)]) -> ExchangeResult<Value> {
        let url = format!("{}{}", self.config.base_url, path);
        tracing::debug!(url = %url, "Binance public request");

        let response = self
            .client
            .get(&url)
            .query(params)
            .send()
            .await
            .map_err(map_transport_error)?;

        read_response(response).await
    }

    async fn signed(
        &self,
        method: Method,
        path: &str,
        mut params: Vec<(&str, String)>,
    ) -> ExchangeResult<Value> {
        let (Some(api_key), Some(api_secret)) = (
            self.config.api_key.as_deref(),
            self.config.api_secret.as_deref(),
        ) else {
            return Err(ExchangeError::Auth(
                "API credentials not configured".to_string(),
            ));
        };

        params.push(("recvWindow", self.config.recv_window_ms.to_string()));
        params.push(("timestamp", Utc::now().timestamp_millis().to_string()));

        let query = encode_query(&params);
        let signature = sign(api_secret, &query)?;
        let url = format!(
            "{}{}?{}&signature={}",
            self.config.base_url, path, query, signature
        );

        tracing::debug!(method = %method, path = %path, "Binance signed request");

        let response = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", api_key)
            .send()
            .await
            .map_err(map_transport_error)?;

        read_response(response).await
    }
}

#[async_trait]
impl ExchangeConnector for BinanceConnector {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn connect(&self) -> ExchangeResult<()> {
        self.public_get("/api/v3/ping", &[]).await?;

        // Verify credentials up front so a bad key fails registration
        if self.config.has_credentials() {
            self.signed(Method::GET, "/api/v3/account", vec![]).await?;
        }

        self.connected.store(true, Ordering::SeqCst);
        tracing::info!(
            exchange = %self.config.name,
            base_url = %self.config.base_url,
            authenticated = self.config.has_credentials(),
            "Connected to Binance"
        );
        Ok(())
    }

    async fn disconnect(&self) -> ExchangeResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        tracing::info!(exchange = %self.config.name, "Disconnected from Binance");
        Ok(())
    }

    async fn fetch_ticker(&self, symbol: &str) -> ExchangeResult<Ticker> {
        let body = self
            .public_get("/api/v3/ticker/24hr", &[("symbol", market_id(symbol))])
            .await?;
        parse_ticker(symbol, &body)
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        since: Option<DateTime<Utc>>,
        limit: Option<u32>,
    ) -> ExchangeResult<Vec<Candle>> {
        if !INTERVALS.contains(&timeframe) {
            return Err(ExchangeError::Rejected(format!(
                "unsupported timeframe {timeframe}"
            )));
        }

        let mut params = vec![
            ("symbol", market_id(symbol)),
            ("interval", timeframe.to_string()),
        ];
        if let Some(since) = since {
            params.push(("startTime", since.timestamp_millis().to_string()));
        }
        if let Some(limit) = limit {
            params.push(("limit", limit.to_string()));
        }

        let body = self.public_get("/api/v3/klines", &params).await?;
        parse_klines(&body)
    }

    async fn fetch_order_book(&self, symbol: &str, limit: u32) -> ExchangeResult<OrderBook> {
        let body = self
            .public_get(
                "/api/v3/depth",
                &[("symbol", market_id(symbol)), ("limit", limit.to_string())],
            )
            .await?;
        parse_order_book(symbol, &body)
    }

    async fn fetch_balance(&self) -> ExchangeResult<BTreeMap<String, Balance>> {
        let body = self.signed(Method::GET, "/api/v3/account", vec![]).await?;
        parse_balances(&body)
    }

    async fn create_order(&self, request: &OrderRequest) -> ExchangeResult<Order> {
        request.validate()?;

        let body = self
            .signed(Method::POST, "/api/v3/order", order_params(request))
            .await?;
        let order = parse_order(Some(&request.symbol), &body)?;

        tracing::info!(
            exchange = %self.config.name,
            order_id = %order.id,
            symbol = %order.symbol,
            side = ?order.side,
            amount = %order.amount,
            status = ?order.status,
            "Binance order placed"
        );
        Ok(order)
    }

    async fn cancel_order(&self, id: &str, symbol: &str) -> ExchangeResult<Order> {
        let body = self
            .signed(
                Method::DELETE,
                "/api/v3/order",
                vec![("symbol", market_id(symbol)), ("orderId", id.to_string())],
            )
            .await?;
        parse_order(Some(symbol), &body)
    }

    async fn fetch_order(&self, id: &str, symbol: &str) -> ExchangeResult<Order> {
        let body = self
            .signed(
                Method::GET,
                "/api/v3/order",
                vec![("symbol", market_id(symbol)), ("orderId", id.to_string())],
            )
            .await?;
        parse_order(Some(symbol), &body)
    }

    async fn fetch_open_orders(&self, symbol: Option<&str>) -> ExchangeResult<Vec<Order>> {
        let params = symbol
            .map(|s| vec![("symbol", market_id(s))])
            .unwrap_or_default();
        let body = self.signed(Method::GET, "/api/v3/openOrders", params).await?;

        body.as_array()
            .ok_or_else(|| ExchangeError::Decode("openOrders response is not an array".into()))?
            .iter()
            .map(|o| parse_order(symbol, o))
            .collect()
    }
}

/// "BTC/USDT" -> "BTCUSDT"
fn market_id(symbol: &str) -> String {
    symbol.replace('/', "").to_uppercase()
}

/// "BTCUSDT" -> "BTC/USDT" when the quote asset is recognised
fn unified_symbol(market_id: &str) -> String {
    KNOWN_QUOTES
        .iter()
        .find_map(|quote| {
            market_id
                .strip_suffix(quote)
                .filter(|base| !base.is_empty())
                .map(|base| format!("{base}/{quote}"))
        })
        .unwrap_or_else(|| market_id.to_string())
}

fn encode_query(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Hex HMAC-SHA256 of `payload` keyed by `secret`
fn sign(secret: &str, payload: &str) -> ExchangeResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ExchangeError::Auth(format!("invalid API secret: {e}")))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn order_params(request: &OrderRequest) -> Vec<(&'static str, String)> {
    let side = match request.side {
        OrderSide::Buy => "BUY",
        OrderSide::Sell => "SELL",
    };

    let mut params = vec![
        ("symbol", market_id(&request.symbol)),
        ("side", side.to_string()),
    ];

    match request.order_type {
        OrderType::Market => {
            params.push(("type", "MARKET".to_string()));
        }
        OrderType::Limit => {
            params.push(("type", "LIMIT".to_string()));
            params.push(("timeInForce", "GTC".to_string()));
            if let Some(price) = request.price {
                params.push(("price", price.normalize().to_string()));
            }
        }
        OrderType::Stop => {
            params.push(("type", "STOP_LOSS".to_string()));
            if let Some(stop) = request.stop_price {
                params.push(("stopPrice", stop.normalize().to_string()));
            }
        }
        OrderType::StopLimit => {
            params.push(("type", "STOP_LOSS_LIMIT".to_string()));
            params.push(("timeInForce", "GTC".to_string()));
            if let Some(price) = request.price.or(request.stop_price) {
                params.push(("price", price.normalize().to_string()));
            }
            if let Some(stop) = request.stop_price {
                params.push(("stopPrice", stop.normalize().to_string()));
            }
        }
    }

    params.push(("quantity", request.amount.normalize().to_string()));
    params.push(("newOrderRespType", "FULL".to_string()));
    params
}

fn map_transport_error(err: reqwest::Error) -> ExchangeError {
    if err.is_timeout() {
        ExchangeError::Timeout(err.to_string())
    } else if err.is_decode() {
        ExchangeError::Decode(err.to_string())
    } else {
        ExchangeError::Network(err.to_string())
    }
}

/// Classify an error response by HTTP status and Binance error code
fn map_api_error(status: u16, code: Option<i64>, msg: &str) -> ExchangeError {
    let detail = match code {
        Some(code) => format!("{code}: {msg}"),
        None => format!("HTTP {status}: {msg}"),
    };

    match (status, code) {
        (429 | 418, _) | (_, Some(-1003)) => ExchangeError::RateLimited(detail),
        (408, _) | (_, Some(-1007)) => ExchangeError::Timeout(detail),
        (500..=599, _) | (_, Some(-1001)) => ExchangeError::Network(detail),
        (401 | 403, _) | (_, Some(-1022 | -2014 | -2015)) => ExchangeError::Auth(detail),
        (_, Some(-1121)) => ExchangeError::InvalidSymbol(detail),
        (_, Some(-2010)) if msg.to_lowercase().contains("insufficient") => {
            ExchangeError::InsufficientFunds(detail)
        }
        _ => ExchangeError::Rejected(detail),
    }
}

async fn read_response(response: Response) -> ExchangeResult<Value> {
    let status = response.status();
    let text = response.text().await.map_err(map_transport_error)?;

    if status.is_success() {
        return serde_json::from_str(&text).map_err(|e| ExchangeError::Decode(e.to_string()));
    }

    let parsed: Option<Value> = serde_json::from_str(&text).ok();
    let code = parsed.as_ref().and_then(|v| v.get("code")).and_then(Value::as_i64);
    let msg = parsed
        .as_ref()
        .and_then(|v| v.get("msg"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or(text);

    let err = map_api_error(status.as_u16(), code, &msg);
    tracing::warn!(status = status.as_u16(), error = %err, "Binance request failed");
    Err(err)
}

fn decimal_value(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(s) => Decimal::from_str(s).ok(),
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    }
}

fn decimal_field(value: &Value, key: &str) -> ExchangeResult<Decimal> {
    value
        .get(key)
        .and_then(decimal_value)
        .ok_or_else(|| ExchangeError::Decode(format!("missing or invalid field {key}")))
}

fn millis(ms: i64) -> ExchangeResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| ExchangeError::Decode(format!("invalid timestamp {ms}")))
}

fn parse_ticker(symbol: &str, body: &Value) -> ExchangeResult<Ticker> {
    let timestamp = match body.get("closeTime").and_then(Value::as_i64) {
        Some(ms) => millis(ms)?,
        None => Utc::now(),
    };

    Ok(Ticker {
        symbol: symbol.to_string(),
        bid: decimal_field(body, "bidPrice")?,
        ask: decimal_field(body, "askPrice")?,
        last: decimal_field(body, "lastPrice")?,
        high: decimal_field(body, "highPrice")?,
        low: decimal_field(body, "lowPrice")?,
        volume: decimal_field(body, "volume")?,
        timestamp,
    })
}

fn parse_klines(body: &Value) -> ExchangeResult<Vec<Candle>> {
    let rows = body
        .as_array()
        .ok_or_else(|| ExchangeError::Decode("klines response is not an array".into()))?;

    rows.iter()
        .map(|row| {
            let cell = |i: usize| {
                row.get(i)
                    .and_then(decimal_value)
                    .ok_or_else(|| ExchangeError::Decode(format!("kline column {i} invalid")))
            };
            let open_time = row
                .get(0)
                .and_then(Value::as_i64)
                .ok_or_else(|| ExchangeError::Decode("kline open time invalid".into()))?;

            Ok(Candle {
                timestamp: millis(open_time)?,
                open: cell(1)?,
                high: cell(2)?,
                low: cell(3)?,
                close: cell(4)?,
                volume: cell(5)?,
            })
        })
        .collect()
}

fn parse_levels(body: &Value, key: &str) -> ExchangeResult<Vec<BookLevel>> {
    let Some(levels) = body.get(key).and_then(Value::as_array) else {
        return Err(ExchangeError::Decode(format!("depth field {key} missing")));
    };

    levels
        .iter()
        .map(|level| {
            let price = level.get(0).and_then(decimal_value);
            let amount = level.get(1).and_then(decimal_value);
            match (price, amount) {
                (Some(price), Some(amount)) => Ok(BookLevel { price, amount }),
                _ => Err(ExchangeError::Decode(format!("invalid {key} level"))),
            }
        })
        .collect()
}

fn parse_order_book(symbol: &str, body: &Value) -> ExchangeResult<OrderBook> {
    Ok(OrderBook {
        symbol: symbol.to_string(),
        bids: parse_levels(body, "bids")?,
        asks: parse_levels(body, "asks")?,
        timestamp: Utc::now(),
    })
}

fn parse_balances(body: &Value) -> ExchangeResult<BTreeMap<String, Balance>> {
    let entries = body
        .get("balances")
        .and_then(Value::as_array)
        .ok_or_else(|| ExchangeError::Decode("account balances missing".into()))?;

    let mut balances = BTreeMap::new();
    for entry in entries {
        let asset = entry
            .get("asset")
            .and_then(Value::as_str)
            .ok_or_else(|| ExchangeError::Decode("balance asset missing".into()))?;
        let balance = Balance::new(decimal_field(entry, "free")?, decimal_field(entry, "locked")?);
        if balance.total > Decimal::ZERO {
            balances.insert(asset.to_string(), balance);
        }
    }
    Ok(balances)
}

fn parse_status(status: &str) -> OrderStatus {
    match status {
        "NEW" | "PARTIALLY_FILLED" | "PENDING_NEW" => OrderStatus::Open,
        "FILLED" => OrderStatus::Closed,
        "CANCELED" | "PENDING_CANCEL" => OrderStatus::Canceled,
        "EXPIRED" | "EXPIRED_IN_MATCH" => OrderStatus::Expired,
        _ => OrderStatus::Rejected,
    }
}

fn parse_order_type(kind: &str) -> OrderType {
    match kind {
        "MARKET" => OrderType::Market,
        "STOP_LOSS" => OrderType::Stop,
        "STOP_LOSS_LIMIT" => OrderType::StopLimit,
        _ => OrderType::Limit,
    }
}

fn parse_order(symbol: Option<&str>, body: &Value) -> ExchangeResult<Order> {
    let str_field = |key: &str| body.get(key).and_then(Value::as_str);

    let id = match body.get("orderId") {
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => s.clone(),
        _ => return Err(ExchangeError::Decode("orderId missing".into())),
    };

    let symbol = match symbol {
        Some(s) => s.to_string(),
        None => unified_symbol(str_field("symbol").unwrap_or_default()),
    };

    let side = match str_field("side") {
        Some("BUY") => OrderSide::Buy,
        Some("SELL") => OrderSide::Sell,
        other => return Err(ExchangeError::Decode(format!("invalid side {other:?}"))),
    };

    let amount = decimal_field(body, "origQty")?;
    let filled = body
        .get("executedQty")
        .and_then(decimal_value)
        .unwrap_or(Decimal::ZERO);
    let quote_filled = body
        .get("cummulativeQuoteQty")
        .and_then(decimal_value)
        .unwrap_or(Decimal::ZERO);
    let average = (filled > Decimal::ZERO && quote_filled > Decimal::ZERO)
        .then(|| quote_filled / filled);
    let price = body
        .get("price")
        .and_then(decimal_value)
        .filter(|p| *p > Decimal::ZERO);
    let stop_price = body
        .get("stopPrice")
        .and_then(decimal_value)
        .filter(|p| *p > Decimal::ZERO);

    let fee = body.get("fills").and_then(Value::as_array).and_then(|fills| {
        let currency = fills
            .first()
            .and_then(|f| f.get("commissionAsset"))
            .and_then(Value::as_str)?
            .to_string();
        let cost: Decimal = fills
            .iter()
            .filter_map(|f| f.get("commission").and_then(decimal_value))
            .sum();
        Some(Fee { cost, currency })
    });

    let ts = ["transactTime", "updateTime", "time"]
        .iter()
        .find_map(|k| body.get(*k).and_then(Value::as_i64));
    let timestamp = match ts {
        Some(ms) => millis(ms)?,
        None => Utc::now(),
    };

    Ok(Order {
        id,
        client_order_id: str_field("clientOrderId").map(str::to_string),
        symbol,
        order_type: parse_order_type(str_field("type").unwrap_or("LIMIT")),
        side,
        price,
        stop_price,
        average,
        amount,
        filled,
        remaining: amount - filled,
        status: parse_status(str_field("status").unwrap_or_default()),
        fee,
        timestamp,
    })
}
