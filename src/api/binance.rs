use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::http::{check_status, http_client, parse_f64, rate_limiter, DirectRateLimiter};
use super::signing::{hmac_sha256_hex, timestamp_ms};
use super::{check_high_low_window, client_order_id, CandleSource, ExchangeGateway};
use crate::config::Credentials;
use crate::error::BotError;
use crate::models::{
    Candle, CloseAck, Granularity, HighLow, OpenRequest, Position, PositionDetails, Side,
};
use crate::Result;

const BINANCE_API_BASE: &str = "https://api.binance.com";
const BINANCE_TESTNET_BASE: &str = "https://testnet.binance.vision";
const KLINE_MAX_LIMIT: usize = 1000;
/// Base balances below this are dust, not positions
const MIN_NET_ASSET: f64 = 1e-5;
/// Leverage assumed for positions opened outside this process
const FALLBACK_LEVERAGE: f64 = 10.0;
const QUOTE_ASSET: &str = "USDT";

/// API-key format, signature and key-permission rejections
const AUTH_ERROR_CODES: [i64; 3] = [-2014, -2015, -1022];

#[derive(Debug, Deserialize)]
struct ApiError {
    code: i64,
    #[serde(default)]
    msg: String,
}

fn interval(granularity: Granularity) -> &'static str {
    match granularity {
        Granularity::OneMinute => "1m",
        Granularity::FiveMinutes => "5m",
    }
}

/// Map an error response, preferring Binance's own error code
fn check_response(status: reqwest::StatusCode, body: &str) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }
    if let Ok(err) = serde_json::from_str::<ApiError>(body) {
        if AUTH_ERROR_CODES.contains(&err.code) {
            return Err(BotError::Auth(format!("{}: {}", err.code, err.msg)));
        }
    }
    check_status(status, body)
}

fn value_f64(value: &Value, field: &str) -> Result<f64> {
    match value {
        Value::String(s) => parse_f64(s, field),
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| BotError::MalformedResponse(format!("{} out of range", field))),
        other => Err(BotError::MalformedResponse(format!(
            "{} has unexpected type: {}",
            field, other
        ))),
    }
}

fn parse_kline(row: &[Value]) -> Result<Candle> {
    if row.len() < 6 {
        return Err(BotError::MalformedResponse(format!(
            "kline row has {} fields",
            row.len()
        )));
    }
    let open_ms = row[0]
        .as_i64()
        .ok_or_else(|| BotError::MalformedResponse("kline open time is not an integer".into()))?;
    let open_time = Utc
        .timestamp_millis_opt(open_ms)
        .single()
        .ok_or_else(|| BotError::MalformedResponse(format!("bad kline open time {}", open_ms)))?;
    Ok(Candle {
        open_time,
        open: value_f64(&row[1], "open")?,
        high: value_f64(&row[2], "high")?,
        low: value_f64(&row[3], "low")?,
        close: value_f64(&row[4], "close")?,
        volume: value_f64(&row[5], "volume")?,
    })
}

/// Public Binance spot klines, the default source for entry decisions
#[derive(Clone)]
pub struct BinanceSpotCandles {
    client: Client,
    base_url: String,
    rate_limiter: Arc<DirectRateLimiter>,
}

impl BinanceSpotCandles {
    pub fn new(rate_limit_per_sec: u32) -> Result<Self> {
        Self::with_base_url(BINANCE_API_BASE, rate_limit_per_sec)
    }

    pub fn with_base_url(base_url: &str, rate_limit_per_sec: u32) -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            rate_limiter: rate_limiter(rate_limit_per_sec),
        })
    }

    async fn get_public<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        self.rate_limiter.until_ready().await;
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .query(query)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        check_response(status, &text)?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn klines(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Candle>> {
        let rows: Vec<Vec<Value>> = self
            .get_public(
                "/api/v3/klines",
                &[
                    ("symbol", symbol.to_uppercase()),
                    ("interval", interval.to_string()),
                    ("limit", limit.clamp(1, KLINE_MAX_LIMIT).to_string()),
                ],
            )
            .await?;
        rows.iter().map(|row| parse_kline(row)).collect()
    }

    /// Latest traded price
    pub async fn ticker_price(&self, symbol: &str) -> Result<f64> {
        #[derive(Deserialize)]
        struct Ticker {
            price: String,
        }
        let ticker: Ticker = self
            .get_public("/api/v3/ticker/price", &[("symbol", symbol.to_uppercase())])
            .await?;
        parse_f64(&ticker.price, "price")
    }

    pub async fn high_low(&self, symbol: &str, window_minutes: u32) -> Result<HighLow> {
        check_high_low_window(window_minutes)?;
        let candles = self.klines(symbol, "1m", window_minutes as usize).await?;
        crate::indicators::calculate_high_low(&candles)
            .ok_or_else(|| BotError::MalformedResponse(format!("no klines for {}", symbol)))
    }
}

#[async_trait]
impl CandleSource for BinanceSpotCandles {
    async fn get_candles(
        &self,
        symbol: &str,
        granularity: Granularity,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        self.klines(symbol, interval(granularity), limit).await
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarginAsset {
    asset: String,
    #[serde(default)]
    borrowed: String,
    #[serde(default)]
    free: String,
    #[serde(default)]
    interest: String,
    net_asset: String,
}

impl MarginAsset {
    fn owed(&self) -> Result<f64> {
        Ok(parse_f64(&self.borrowed, "borrowed")? + parse_f64(&self.interest, "interest")?)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IsolatedPair {
    symbol: String,
    base_asset: MarginAsset,
    quote_asset: MarginAsset,
}

#[derive(Debug, Deserialize)]
struct IsolatedAccount {
    assets: Vec<IsolatedPair>,
}

#[derive(Debug)]
struct LotSize {
    min_qty: f64,
    step_size: f64,
    /// Decimals implied by the step size
    precision: usize,
}

impl LotSize {
    /// Floor `quantity` to the step size, None when below the minimum lot
    fn adjust(&self, quantity: f64) -> Option<String> {
        let steps = (quantity / self.step_size + 1e-9).floor();
        let adjusted = steps * self.step_size;
        if adjusted < self.min_qty || adjusted <= 0.0 {
            return None;
        }
        Some(format!("{:.*}", self.precision, adjusted))
    }
}

fn step_precision(step: &str) -> usize {
    match step.split_once('.') {
        Some((_, decimals)) => decimals.trim_end_matches('0').len(),
        None => 0,
    }
}

fn format_amount(amount: f64) -> String {
    let formatted = format!("{:.8}", amount);
    formatted
        .trim_end_matches('0')
        .trim_end_matches('.')
        .to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderFill {
    price: String,
    qty: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: i64,
    #[serde(default)]
    executed_qty: String,
    #[serde(default)]
    cummulative_quote_qty: String,
    #[serde(default)]
    fills: Vec<OrderFill>,
}

impl OrderResponse {
    /// Quantity-weighted fill price
    fn average_price(&self) -> Option<f64> {
        let fills: Vec<(f64, f64)> = self
            .fills
            .iter()
            .filter_map(|f| Some((f.price.parse().ok()?, f.qty.parse().ok()?)))
            .collect();
        let total_qty: f64 = fills.iter().map(|(_, q)| q).sum();
        if total_qty > 0.0 {
            return Some(fills.iter().map(|(p, q)| p * q).sum::<f64>() / total_qty);
        }
        let quote: f64 = self.cummulative_quote_qty.parse().ok()?;
        let executed: f64 = self.executed_qty.parse().ok()?;
        (executed > 0.0).then(|| quote / executed)
    }
}

/// What this process knows about a position it opened
#[derive(Debug, Clone, PartialEq)]
struct EntryRecord {
    side: Side,
    entry_price: f64,
    leverage: f64,
}

/// Binance isolated-margin gateway.
///
/// Leverage is synthesized by borrowing before the order and repaying after
/// the close. Entry price and leverage are not reported by the exchange, so
/// they are recorded here at open time.
#[derive(Clone)]
pub struct BinanceMarginGateway {
    client: Client,
    base_url: String,
    credentials: Credentials,
    rate_limiter: Arc<DirectRateLimiter>,
    market: BinanceSpotCandles,
    entries: Arc<RwLock<HashMap<String, EntryRecord>>>,
}

impl BinanceMarginGateway {
    pub fn new(credentials: Credentials, testnet: bool, rate_limit_per_sec: u32) -> Result<Self> {
        let base_url = if testnet { BINANCE_TESTNET_BASE } else { BINANCE_API_BASE };
        Self::with_base_url(credentials, base_url, rate_limit_per_sec)
    }

    pub fn with_base_url(
        credentials: Credentials,
        base_url: &str,
        rate_limit_per_sec: u32,
    ) -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            rate_limiter: rate_limiter(rate_limit_per_sec),
            market: BinanceSpotCandles::with_base_url(base_url, rate_limit_per_sec)?,
            entries: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T> {
        self.rate_limiter.until_ready().await;

        let mut query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&format!("timestamp={}", timestamp_ms()));
        let signature = hmac_sha256_hex(&self.credentials.api_secret, &query)?;
        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);

        let response = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.credentials.api_key)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        if let Err(e) = check_response(status, &text) {
            if e.is_auth() {
                tracing::error!("Binance rejected credentials on {}: {}", path, e);
            }
            return Err(e);
        }
        Ok(serde_json::from_str(&text)?)
    }

    async fn isolated_account(&self, symbol: Option<&str>) -> Result<IsolatedAccount> {
        let params: Vec<(&str, String)> = symbol
            .map(|s| vec![("symbols", s.to_uppercase())])
            .unwrap_or_default();
        self.signed(Method::GET, "/sapi/v1/margin/isolated/account", &params)
            .await
    }

    async fn pair_account(&self, symbol: &str) -> Result<IsolatedPair> {
        self.isolated_account(Some(symbol))
            .await?
            .assets
            .into_iter()
            .next()
            .ok_or_else(|| BotError::MalformedResponse(format!("no isolated account for {}", symbol)))
    }

    async fn lot_size(&self, symbol: &str) -> Result<LotSize> {
        let info: Value = self
            .market
            .get_public("/api/v3/exchangeInfo", &[("symbol", symbol.to_uppercase())])
            .await?;
        let filter = info["symbols"][0]["filters"]
            .as_array()
            .and_then(|filters| filters.iter().find(|f| f["filterType"] == "LOT_SIZE"))
            .ok_or_else(|| BotError::MalformedResponse(format!("no LOT_SIZE for {}", symbol)))?;
        let step = filter["stepSize"]
            .as_str()
            .ok_or_else(|| BotError::MalformedResponse("LOT_SIZE.stepSize missing".into()))?;
        let min = filter["minQty"]
            .as_str()
            .ok_or_else(|| BotError::MalformedResponse("LOT_SIZE.minQty missing".into()))?;
        Ok(LotSize {
            min_qty: parse_f64(min, "minQty")?,
            step_size: parse_f64(step, "stepSize")?,
            precision: step_precision(step),
        })
    }

    async fn max_borrowable(&self, symbol: &str, asset: &str) -> Result<f64> {
        #[derive(Deserialize)]
        struct Amount {
            amount: String,
        }
        let amount: Amount = self
            .signed(
                Method::GET,
                "/sapi/v1/margin/maxBorrowable",
                &[
                    ("asset", asset.to_string()),
                    ("isolatedSymbol", symbol.to_string()),
                ],
            )
            .await?;
        parse_f64(&amount.amount, "amount")
    }

    async fn margin_transfer(&self, path: &str, symbol: &str, asset: &str, amount: f64) -> Result<()> {
        let _: Value = self
            .signed(
                Method::POST,
                path,
                &[
                    ("asset", asset.to_string()),
                    ("amount", format_amount(amount)),
                    ("symbol", symbol.to_string()),
                    ("isIsolated", "TRUE".to_string()),
                ],
            )
            .await?;
        tracing::info!(symbol = %symbol, "{} {} {}", path, format_amount(amount), asset);
        Ok(())
    }

    async fn market_order(&self, symbol: &str, side: Side, quantity: &str) -> Result<OrderResponse> {
        let side = match side {
            Side::Long => "BUY",
            Side::Short => "SELL",
        };
        self.signed(
            Method::POST,
            "/sapi/v1/margin/order",
            &[
                ("symbol", symbol.to_string()),
                ("side", side.to_string()),
                ("type", "MARKET".to_string()),
                ("quantity", quantity.to_string()),
                ("isIsolated", "TRUE".to_string()),
                ("newOrderRespType", "FULL".to_string()),
                ("newClientOrderId", client_order_id()),
            ],
        )
        .await
    }

    async fn normalize(&self, pair: &IsolatedPair) -> Result<Option<Position>> {
        let net_base = parse_f64(&pair.base_asset.net_asset, "netAsset")?;
        if net_base.abs() < MIN_NET_ASSET {
            return Ok(None);
        }
        let side = if net_base > 0.0 { Side::Long } else { Side::Short };
        let quantity = net_base.abs();
        let price = self.market.ticker_price(&pair.symbol).await?;

        let record = self
            .entries
            .read()
            .await
            .get(&pair.symbol)
            .filter(|r| r.side == side)
            .cloned();
        let (entry_price, leverage) = match record {
            Some(r) => (r.entry_price, r.leverage),
            None => {
                // Pin the first-seen price so later polls report the same entry
                tracing::info!(
                    symbol = %pair.symbol,
                    "No recorded entry for {} position, assuming {:.4} x{}",
                    side,
                    price,
                    FALLBACK_LEVERAGE
                );
                self.entries.write().await.insert(
                    pair.symbol.clone(),
                    EntryRecord {
                        side,
                        entry_price: price,
                        leverage: FALLBACK_LEVERAGE,
                    },
                );
                (price, FALLBACK_LEVERAGE)
            }
        };

        let unrealized_pnl = match side {
            Side::Long => (price - entry_price) * quantity,
            Side::Short => (entry_price - price) * quantity,
        };
        let interest = parse_f64(&pair.base_asset.interest, "interest")? * price
            + parse_f64(&pair.quote_asset.interest, "interest")?;
        let margin = quantity * entry_price / leverage.max(1.0) + interest;

        Ok(Some(Position {
            symbol: pair.symbol.clone(),
            side,
            quantity,
            entry_price,
            mark_price: price,
            leverage,
            margin,
            unrealized_pnl,
            realized_pnl: 0.0,
            liquidation_price: None,
        }))
    }
}

#[async_trait]
impl CandleSource for BinanceMarginGateway {
    async fn get_candles(
        &self,
        symbol: &str,
        granularity: Granularity,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        self.market.get_candles(symbol, granularity, limit).await
    }
}

#[async_trait]
impl ExchangeGateway for BinanceMarginGateway {
    fn name(&self) -> &str {
        "binance_margin"
    }

    async fn list_open_positions(&self) -> Result<Vec<Position>> {
        let account = self.isolated_account(None).await?;
        let mut positions = Vec::new();
        for pair in &account.assets {
            if let Some(position) = self.normalize(pair).await? {
                positions.push(position);
            }
        }
        Ok(positions)
    }

    /// `request.size` is the quote amount committed as collateral
    async fn open_market_position(&self, request: &OpenRequest) -> Result<PositionDetails> {
        let symbol = request.symbol.to_uppercase();
        let leverage = f64::from(request.leverage.max(1));
        let price = self.market.ticker_price(&symbol).await?;
        let lot = self.lot_size(&symbol).await?;
        let base_asset = symbol.trim_end_matches(QUOTE_ASSET).to_string();

        let mut quantity = request.size * leverage / price;
        let (borrow_asset, mut borrow_amount) = match request.side {
            Side::Long => (QUOTE_ASSET.to_string(), request.size * (leverage - 1.0)),
            Side::Short => (base_asset, quantity),
        };

        if borrow_amount > 0.0 {
            let max = self.max_borrowable(&symbol, &borrow_asset).await?;
            if max <= 0.0 {
                return Err(BotError::UpstreamUnavailable(format!(
                    "nothing borrowable for {} on {}",
                    borrow_asset, symbol
                )));
            }
            if borrow_amount > max {
                tracing::warn!(
                    symbol = %symbol,
                    "Borrow {} {} exceeds max {}, capping",
                    borrow_amount,
                    borrow_asset,
                    max
                );
                borrow_amount = max;
                quantity = match request.side {
                    Side::Long => (request.size + max) / price,
                    Side::Short => max,
                };
            }
        }

        let quantity_str = lot.adjust(quantity).ok_or_else(|| {
            BotError::Config(format!(
                "order of {:.8} {} is below the minimum lot {}",
                quantity, symbol, lot.min_qty
            ))
        })?;

        if borrow_amount > 0.0 {
            self.margin_transfer("/sapi/v1/margin/loan", &symbol, &borrow_asset, borrow_amount)
                .await?;
        }

        let order = self.market_order(&symbol, request.side, &quantity_str).await?;
        let entry_price = order.average_price().unwrap_or(price);
        self.entries.write().await.insert(
            symbol.clone(),
            EntryRecord {
                side: request.side,
                entry_price,
                leverage,
            },
        );

        tracing::info!(
            symbol = %symbol,
            "Opened {} {} @ {:.4} x{} (order {})",
            request.side,
            quantity_str,
            entry_price,
            request.leverage,
            order.order_id
        );

        Ok(PositionDetails {
            symbol,
            side: request.side,
            size: parse_f64(&quantity_str, "quantity")?,
            leverage: request.leverage,
            entry_price: Some(entry_price),
            order_id: Some(order.order_id.to_string()),
        })
    }

    async fn close_market_position(&self, position: &Position) -> Result<CloseAck> {
        let symbol = position.symbol.to_uppercase();
        let base_asset = symbol.trim_end_matches(QUOTE_ASSET).to_string();
        let lot = self.lot_size(&symbol).await?;

        let mut order_id = None;
        match lot.adjust(position.quantity) {
            Some(quantity) => {
                let order = self
                    .market_order(&symbol, position.side.opposite(), &quantity)
                    .await?;
                order_id = Some(order.order_id.to_string());
            }
            None => tracing::warn!(
                symbol = %symbol,
                "Position size {} below minimum lot, repaying only",
                position.quantity
            ),
        }

        let pair = self.pair_account(&symbol).await?;
        let owed_quote = pair.quote_asset.owed()?;
        let owed_base = pair.base_asset.owed()?;

        if owed_quote > 0.0 {
            self.margin_transfer("/sapi/v1/margin/repay", &symbol, &pair.quote_asset.asset, owed_quote)
                .await?;
        }
        if owed_base > 0.0 {
            let free_base = parse_f64(&pair.base_asset.free, "free")?;
            if let Some(shortfall) = lot.adjust(owed_base - free_base) {
                self.market_order(&symbol, Side::Long, &shortfall).await?;
            }
            self.margin_transfer("/sapi/v1/margin/repay", &symbol, &base_asset, owed_base)
                .await?;
        }

        self.entries.write().await.remove(&symbol);
        tracing::info!(symbol = %symbol, "Position closed and loans repaid");

        Ok(CloseAck {
            symbol: position.symbol.clone(),
            order_id,
        })
    }

    /// Free quote balance across isolated pairs
    async fn get_balance(&self) -> Result<f64> {
        let account = self.isolated_account(None).await?;
        account
            .assets
            .iter()
            .filter(|pair| pair.quote_asset.asset == QUOTE_ASSET)
            .map(|pair| parse_f64(&pair.quote_asset.free, "free"))
            .sum()
    }

    async fn get_high_low(&self, symbol: &str, window_minutes: u32) -> Result<HighLow> {
        self.market.high_low(symbol, window_minutes).await
    }
}
