use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use super::http::{
    check_status, http_client, parse_f64, parse_optional_f64, rate_limiter, DirectRateLimiter,
};
use super::signing::{hmac_sha256_hex, timestamp_ms};
use super::{check_high_low_window, client_order_id, normalize_symbol, CandleSource, ExchangeGateway};
use crate::config::Credentials;
use crate::error::BotError;
use crate::models::{
    Candle, CloseAck, Granularity, HighLow, OpenRequest, Position, PositionDetails, Side,
};
use crate::Result;

const BYBIT_MAINNET: &str = "https://api.bybit.com";
const BYBIT_TESTNET: &str = "https://api-testnet.bybit.com";
const RECV_WINDOW_MS: &str = "5000";
const KLINE_MAX_LIMIT: usize = 1000;

/// retCodes for bad key, bad signature, key permissions and expired key
const AUTH_RET_CODES: [i64; 4] = [10003, 10004, 10005, 33004];
/// set-leverage with the leverage already in place
const RET_LEVERAGE_NOT_MODIFIED: i64 = 110043;
/// switch-isolated when the symbol is already isolated
const RET_MARGIN_MODE_NOT_MODIFIED: i64 = 110026;
/// switch-isolated on a unified account, where margin mode is account-wide
const RET_UNIFIED_MODE_SWITCH_FORBIDDEN: i64 = 100028;

/// Standard v5 response envelope
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg", default)]
    ret_msg: String,
    #[serde(default)]
    result: Value,
}

#[derive(Debug, Deserialize)]
struct ListResult<T> {
    list: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPosition {
    symbol: String,
    side: String,
    size: String,
    avg_price: String,
    mark_price: String,
    leverage: String,
    #[serde(rename = "positionIM")]
    position_im: String,
    unrealised_pnl: String,
    #[serde(default)]
    cur_realised_pnl: String,
    #[serde(default)]
    liq_price: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawWallet {
    total_equity: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResult {
    order_id: String,
}

/// Bybit v5 USDT-perpetual gateway.
///
/// Cloneable; clones share the HTTP client and rate limiter.
#[derive(Clone)]
pub struct BybitGateway {
    client: Client,
    base_url: String,
    credentials: Credentials,
    rate_limiter: Arc<DirectRateLimiter>,
}

impl BybitGateway {
    pub fn new(credentials: Credentials, testnet: bool, rate_limit_per_sec: u32) -> Result<Self> {
        let base_url = if testnet { BYBIT_TESTNET } else { BYBIT_MAINNET };
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
        })
    }

    fn sign(&self, timestamp: &str, payload: &str) -> Result<String> {
        let prehash = format!(
            "{}{}{}{}",
            timestamp, self.credentials.api_key, RECV_WINDOW_MS, payload
        );
        hmac_sha256_hex(&self.credentials.api_secret, &prehash)
    }

    /// Send one request and unwrap the v5 envelope.
    ///
    /// `tolerated` lists non-zero retCodes that count as success.
    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
        signed: bool,
        tolerated: &[i64],
    ) -> Result<T> {
        self.rate_limiter.until_ready().await;

        let query_string = query
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        let url = if query_string.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query_string)
        };
        let body_string = body.map(|b| b.to_string());

        let mut builder = self.client.request(method, &url);
        if signed {
            let timestamp = timestamp_ms().to_string();
            let payload = body_string.as_deref().unwrap_or(&query_string);
            let signature = self.sign(&timestamp, payload)?;
            builder = builder
                .header("X-BAPI-API-KEY", &self.credentials.api_key)
                .header("X-BAPI-SIGN", signature)
                .header("X-BAPI-TIMESTAMP", timestamp)
                .header("X-BAPI-RECV-WINDOW", RECV_WINDOW_MS);
        }
        if let Some(body) = body_string {
            builder = builder.header("Content-Type", "application/json").body(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let text = response.text().await?;
        check_status(status, &text)?;

        let envelope: Envelope = serde_json::from_str(&text)?;
        if envelope.ret_code != 0 && !tolerated.contains(&envelope.ret_code) {
            let message = format!("{} {}: {}", path, envelope.ret_code, envelope.ret_msg);
            if AUTH_RET_CODES.contains(&envelope.ret_code) {
                tracing::error!("Bybit rejected credentials: {}", message);
                return Err(BotError::Auth(message));
            }
            return Err(BotError::UpstreamUnavailable(message));
        }
        if envelope.result.is_null() {
            return Ok(serde_json::from_value(json!({}))?);
        }
        Ok(serde_json::from_value(envelope.result)?)
    }

    async fn klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
        window: Option<(i64, i64)>,
    ) -> Result<Vec<Candle>> {
        let mut query = vec![
            ("category", "linear".to_string()),
            ("symbol", normalize_symbol(symbol)),
            ("interval", interval.to_string()),
            ("limit", limit.min(KLINE_MAX_LIMIT).to_string()),
        ];
        if let Some((start, end)) = window {
            query.push(("start", start.to_string()));
            query.push(("end", end.to_string()));
        }

        let result: ListResult<Vec<String>> = self
            .request(Method::GET, "/v5/market/kline", &query, None, false, &[])
            .await?;

        // Bybit returns newest first
        let mut candles = result
            .list
            .iter()
            .map(|row| parse_kline(row))
            .collect::<Result<Vec<_>>>()?;
        candles.reverse();
        Ok(candles)
    }
}

fn parse_kline(row: &[String]) -> Result<Candle> {
    if row.len() < 6 {
        return Err(BotError::MalformedResponse(format!(
            "kline row has {} fields",
            row.len()
        )));
    }
    let start_ms: i64 = row[0]
        .parse()
        .map_err(|_| BotError::MalformedResponse(format!("bad kline start {:?}", row[0])))?;
    let open_time = Utc
        .timestamp_millis_opt(start_ms)
        .single()
        .ok_or_else(|| BotError::MalformedResponse(format!("bad kline start {}", start_ms)))?;
    Ok(Candle {
        open_time,
        open: parse_f64(&row[1], "open")?,
        high: parse_f64(&row[2], "high")?,
        low: parse_f64(&row[3], "low")?,
        close: parse_f64(&row[4], "close")?,
        volume: parse_f64(&row[5], "volume")?,
    })
}

fn normalize_position(raw: &RawPosition) -> Result<Option<Position>> {
    let quantity = parse_f64(&raw.size, "size")?;
    if quantity == 0.0 {
        return Ok(None);
    }
    let side = match raw.side.as_str() {
        "Buy" => Side::Long,
        "Sell" => Side::Short,
        other => {
            return Err(BotError::MalformedResponse(format!(
                "unknown position side {:?} for {}",
                other, raw.symbol
            )))
        }
    };
    Ok(Some(Position {
        symbol: raw.symbol.clone(),
        side,
        quantity: quantity.abs(),
        entry_price: parse_f64(&raw.avg_price, "avgPrice")?,
        mark_price: parse_f64(&raw.mark_price, "markPrice")?,
        leverage: parse_f64(&raw.leverage, "leverage")?,
        margin: parse_f64(&raw.position_im, "positionIM")?,
        unrealized_pnl: parse_f64(&raw.unrealised_pnl, "unrealisedPnl")?,
        realized_pnl: parse_optional_f64(&raw.cur_realised_pnl).unwrap_or(0.0),
        liquidation_price: parse_optional_f64(&raw.liq_price),
    }))
}

fn order_side(side: Side) -> &'static str {
    match side {
        Side::Long => "Buy",
        Side::Short => "Sell",
    }
}

#[async_trait]
impl CandleSource for BybitGateway {
    async fn get_candles(
        &self,
        symbol: &str,
        granularity: Granularity,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        self.klines(symbol, &granularity.minutes().to_string(), limit, None)
            .await
    }
}

#[async_trait]
impl ExchangeGateway for BybitGateway {
    fn name(&self) -> &str {
        "bybit"
    }

    async fn list_open_positions(&self) -> Result<Vec<Position>> {
        let query = [
            ("category", "linear".to_string()),
            ("settleCoin", "USDT".to_string()),
        ];
        let result: ListResult<RawPosition> = self
            .request(Method::GET, "/v5/position/list", &query, None, true, &[])
            .await?;

        let mut positions = Vec::with_capacity(result.list.len());
        for raw in &result.list {
            if let Some(position) = normalize_position(raw)? {
                positions.push(position);
            }
        }
        Ok(positions)
    }

    async fn open_market_position(&self, request: &OpenRequest) -> Result<PositionDetails> {
        let symbol = normalize_symbol(&request.symbol);
        let leverage = request.leverage.to_string();

        let _: Value = self
            .request(
                Method::POST,
                "/v5/position/switch-isolated",
                &[],
                Some(json!({
                    "category": "linear",
                    "symbol": symbol,
                    "tradeMode": 1,
                    "buyLeverage": leverage,
                    "sellLeverage": leverage,
                })),
                true,
                &[RET_MARGIN_MODE_NOT_MODIFIED, RET_UNIFIED_MODE_SWITCH_FORBIDDEN],
            )
            .await?;

        let _: Value = self
            .request(
                Method::POST,
                "/v5/position/set-leverage",
                &[],
                Some(json!({
                    "category": "linear",
                    "symbol": symbol,
                    "buyLeverage": leverage,
                    "sellLeverage": leverage,
                })),
                true,
                &[RET_LEVERAGE_NOT_MODIFIED],
            )
            .await?;

        let order: OrderResult = self
            .request(
                Method::POST,
                "/v5/order/create",
                &[],
                Some(json!({
                    "category": "linear",
                    "symbol": symbol,
                    "side": order_side(request.side),
                    "orderType": "Market",
                    "qty": request.size.to_string(),
                    "timeInForce": "GTC",
                    "reduceOnly": false,
                    "positionIdx": 0,
                    "orderLinkId": client_order_id(),
                })),
                true,
                &[],
            )
            .await?;

        tracing::info!(
            symbol = %symbol,
            "Opened {} {} x{} (order {})",
            request.side,
            request.size,
            request.leverage,
            order.order_id
        );

        Ok(PositionDetails {
            symbol,
            side: request.side,
            size: request.size,
            leverage: request.leverage,
            entry_price: None,
            order_id: Some(order.order_id),
        })
    }

    async fn close_market_position(&self, position: &Position) -> Result<CloseAck> {
        let symbol = normalize_symbol(&position.symbol);

        // Leftover conditional orders would reopen the position
        let _: Value = self
            .request(
                Method::POST,
                "/v5/order/cancel-all",
                &[],
                Some(json!({ "category": "linear", "symbol": symbol })),
                true,
                &[],
            )
            .await?;

        let order: OrderResult = self
            .request(
                Method::POST,
                "/v5/order/create",
                &[],
                Some(json!({
                    "category": "linear",
                    "symbol": symbol,
                    "side": order_side(position.side.opposite()),
                    "orderType": "Market",
                    "qty": position.quantity.to_string(),
                    "timeInForce": "GTC",
                    "reduceOnly": true,
                    "positionIdx": 0,
                    "orderLinkId": client_order_id(),
                })),
                true,
                &[],
            )
            .await?;

        tracing::info!(symbol = %symbol, "Close order sent (order {})", order.order_id);
        Ok(CloseAck {
            symbol: position.symbol.clone(),
            order_id: Some(order.order_id),
        })
    }

    async fn get_balance(&self) -> Result<f64> {
        let query = [("accountType", "UNIFIED".to_string())];
        let result: ListResult<RawWallet> = self
            .request(Method::GET, "/v5/account/wallet-balance", &query, None, true, &[])
            .await?;
        let wallet = result
            .list
            .first()
            .ok_or_else(|| BotError::MalformedResponse("empty wallet list".into()))?;
        Ok(parse_optional_f64(&wallet.total_equity).unwrap_or(0.0))
    }

    async fn get_high_low(&self, symbol: &str, window_minutes: u32) -> Result<HighLow> {
        check_high_low_window(window_minutes)?;
        let end = timestamp_ms();
        let start = end - i64::from(window_minutes) * 60_000;
        let candles = self
            .klines(symbol, "1", window_minutes as usize, Some((start, end)))
            .await?;
        crate::indicators::calculate_high_low(&candles)
            .ok_or_else(|| BotError::MalformedResponse(format!("no klines for {}", symbol)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn credentials() -> Credentials {
        Credentials {
            api_key: "test-key".to_string(),
            api_secret: "test-secret".to_string(),
        }
    }

    const POSITIONS_BODY: &str = r#"{
        "retCode": 0, "retMsg": "OK",
        "result": {"list": [
            {"symbol": "BTCUSDT", "leverage": "20", "avgPrice": "103682.9", "liqPrice": "4771.28",
             "unrealisedPnl": "-0.3332", "markPrice": "103349.7", "positionIM": "5.23831932",
             "side": "Buy", "size": "0.001", "curRealisedPnl": "-0.0570256"},
            {"symbol": "ETHUSDT", "leverage": "10", "avgPrice": "0", "liqPrice": "",
             "unrealisedPnl": "0", "markPrice": "3300", "positionIM": "0",
             "side": "", "size": "0", "curRealisedPnl": ""}
        ]}
    }"#;

    #[tokio::test]
    async fn test_list_open_positions_normalizes() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v5/position/list")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("category".into(), "linear".into()),
                Matcher::UrlEncoded("settleCoin".into(), "USDT".into()),
            ]))
            .match_header("X-BAPI-API-KEY", "test-key")
            .with_status(200)
            .with_body(POSITIONS_BODY)
            .create_async()
            .await;

        let gateway = BybitGateway::with_base_url(credentials(), &server.url(), 50).unwrap();
        let positions = gateway.list_open_positions().await.unwrap();

        mock.assert_async().await;
        assert_eq!(positions.len(), 1);
        let btc = &positions[0];
        assert_eq!(btc.side, Side::Long);
        assert_eq!(btc.leverage, 20.0);
        assert_eq!(btc.margin, 5.23831932);
        assert_eq!(btc.liquidation_price, Some(4771.28));
    }

    #[tokio::test]
    async fn test_auth_ret_code_maps_to_auth_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v5/account/wallet-balance")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"retCode": 10003, "retMsg": "API key is invalid.", "result": {}}"#)
            .create_async()
            .await;

        let gateway = BybitGateway::with_base_url(credentials(), &server.url(), 50).unwrap();
        let err = gateway.get_balance().await.unwrap_err();
        assert!(err.is_auth());
    }

    #[tokio::test]
    async fn test_balance_reads_total_equity() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v5/account/wallet-balance")
            .match_query(Matcher::UrlEncoded("accountType".into(), "UNIFIED".into()))
            .with_status(200)
            .with_body(
                r#"{"retCode": 0, "retMsg": "OK",
                    "result": {"list": [{"totalEquity": "1659.03831971", "accountType": "UNIFIED"}]}}"#,
            )
            .create_async()
            .await;

        let gateway = BybitGateway::with_base_url(credentials(), &server.url(), 50).unwrap();
        assert_eq!(gateway.get_balance().await.unwrap(), 1659.03831971);
    }

    #[tokio::test]
    async fn test_candles_are_reversed_to_oldest_first() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v5/market/kline")
            .match_query(Matcher::UrlEncoded("symbol".into(), "BTCUSDT".into()))
            .with_status(200)
            .with_body(
                r#"{"retCode": 0, "retMsg": "OK", "result": {"list": [
                    ["1700000120000", "102", "104", "101", "103", "7", "700"],
                    ["1700000060000", "101", "103", "100", "102", "6", "600"],
                    ["1700000000000", "100", "102", "99", "101", "5", "500"]
                ]}}"#,
            )
            .create_async()
            .await;

        let gateway = BybitGateway::with_base_url(credentials(), &server.url(), 50).unwrap();
        let candles = gateway
            .get_candles("XBTUSDTM", Granularity::OneMinute, 3)
            .await
            .unwrap();
        assert_eq!(candles.len(), 3);
        assert_eq!(candles[0].close, 101.0);
        assert_eq!(candles[2].close, 103.0);
        assert!(candles[0].open_time < candles[2].open_time);

        let range = gateway.get_high_low("BTCUSDT", 3).await.unwrap();
        assert_eq!(range, HighLow { high: 104.0, low: 99.0 });
    }

    #[tokio::test]
    async fn test_open_tolerates_leverage_not_modified() {
        let mut server = mockito::Server::new_async().await;
        let isolated = server
            .mock("POST", "/v5/position/switch-isolated")
            .match_body(Matcher::PartialJson(json!({
                "symbol": "BTCUSDT", "tradeMode": 1, "buyLeverage": "20"
            })))
            .with_status(200)
            .with_body(r#"{"retCode": 110026, "retMsg": "Cross/isolated margin mode is not modified", "result": {}}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/v5/position/set-leverage")
            .with_status(200)
            .with_body(r#"{"retCode": 110043, "retMsg": "leverage not modified", "result": {}}"#)
            .create_async()
            .await;
        let order = server
            .mock("POST", "/v5/order/create")
            .match_body(Matcher::PartialJson(json!({
                "symbol": "BTCUSDT", "side": "Sell", "orderType": "Market", "reduceOnly": false
            })))
            .with_status(200)
            .with_body(r#"{"retCode": 0, "retMsg": "OK", "result": {"orderId": "abc-1", "orderLinkId": ""}}"#)
            .create_async()
            .await;

        let gateway = BybitGateway::with_base_url(credentials(), &server.url(), 50).unwrap();
        let details = gateway
            .open_market_position(&OpenRequest {
                symbol: "BTCUSDT".to_string(),
                side: Side::Short,
                size: 0.001,
                leverage: 20,
            })
            .await
            .unwrap();

        isolated.assert_async().await;
        order.assert_async().await;
        assert_eq!(details.order_id.as_deref(), Some("abc-1"));
        assert_eq!(details.side, Side::Short);
    }

    #[tokio::test]
    async fn test_open_stops_when_isolated_switch_fails() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v5/position/switch-isolated")
            .with_status(200)
            .with_body(r#"{"retCode": 10001, "retMsg": "params error", "result": {}}"#)
            .create_async()
            .await;
        let order = server
            .mock("POST", "/v5/order/create")
            .expect(0)
            .create_async()
            .await;

        let gateway = BybitGateway::with_base_url(credentials(), &server.url(), 50).unwrap();
        let result = gateway
            .open_market_position(&OpenRequest {
                symbol: "BTCUSDT".to_string(),
                side: Side::Long,
                size: 0.001,
                leverage: 10,
            })
            .await;

        assert!(result.is_err());
        order.assert_async().await;
    }

    #[tokio::test]
    async fn test_high_low_rejects_window_beyond_one_request() {
        let mut server = mockito::Server::new_async().await;
        let klines = server
            .mock("GET", "/v5/market/kline")
            .match_query(Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let gateway = BybitGateway::with_base_url(credentials(), &server.url(), 50).unwrap();
        let result = gateway.get_high_low("BTCUSDT", KLINE_MAX_LIMIT as u32 + 1).await;

        assert!(matches!(result, Err(BotError::Config(_))));
        klines.assert_async().await;
    }

    #[tokio::test]
    async fn test_close_cancels_then_sends_reduce_only() {
        let mut server = mockito::Server::new_async().await;
        let cancel = server
            .mock("POST", "/v5/order/cancel-all")
            .with_status(200)
            .with_body(r#"{"retCode": 0, "retMsg": "OK", "result": {"list": []}}"#)
            .create_async()
            .await;
        let order = server
            .mock("POST", "/v5/order/create")
            .match_body(Matcher::PartialJson(json!({
                "side": "Sell", "reduceOnly": true, "qty": "0.001"
            })))
            .with_status(200)
            .with_body(r#"{"retCode": 0, "retMsg": "OK", "result": {"orderId": "close-1"}}"#)
            .create_async()
            .await;

        let gateway = BybitGateway::with_base_url(credentials(), &server.url(), 50).unwrap();
        let position = Position {
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            quantity: 0.001,
            entry_price: 100_000.0,
            mark_price: 101_000.0,
            leverage: 20.0,
            margin: 5.0,
            unrealized_pnl: 1.0,
            realized_pnl: 0.0,
            liquidation_price: None,
        };
        let ack = gateway.close_market_position(&position).await.unwrap();

        cancel.assert_async().await;
        order.assert_async().await;
        assert_eq!(ack.order_id.as_deref(), Some("close-1"));
    }

    #[tokio::test]
    async fn test_http_error_is_upstream_unavailable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v5/position/list")
            .match_query(Matcher::Any)
            .with_status(502)
            .with_body("bad gateway")
            .create_async()
            .await;

        let gateway = BybitGateway::with_base_url(credentials(), &server.url(), 50).unwrap();
        let err = gateway.list_open_positions().await.unwrap_err();
        assert!(err.is_transient());
    }
}
