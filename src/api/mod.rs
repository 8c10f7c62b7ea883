//! Exchange gateways and candle sources.
//!
//! The engine only talks to exchanges through [`ExchangeGateway`]; each
//! exchange maps its own margin/loan mechanics into these calls.

pub mod binance;
pub mod bybit;
pub mod http;
pub mod signing;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::MAX_HIGH_LOW_WINDOW_MINUTES;
use crate::error::BotError;
use crate::models::{
    Candle, CloseAck, Granularity, HighLow, OpenRequest, Position, PositionDetails,
};
use crate::Result;

pub use binance::{BinanceMarginGateway, BinanceSpotCandles};
pub use bybit::BybitGateway;

/// Supplier of recent OHLCV candles, oldest first
#[async_trait]
pub trait CandleSource: Send + Sync {
    async fn get_candles(
        &self,
        symbol: &str,
        granularity: Granularity,
        limit: usize,
    ) -> Result<Vec<Candle>>;
}

/// Uniform trading operations over one exchange account
#[async_trait]
pub trait ExchangeGateway: CandleSource {
    fn name(&self) -> &str;

    /// Canonical open positions
    async fn list_open_positions(&self) -> Result<Vec<Position>>;

    async fn open_market_position(&self, request: &OpenRequest) -> Result<PositionDetails>;

    /// Flatten the position, unwinding any borrowed collateral
    async fn close_market_position(&self, position: &Position) -> Result<CloseAck>;

    /// Account equity in quote currency
    async fn get_balance(&self) -> Result<f64>;

    async fn get_high_low(&self, symbol: &str, window_minutes: u32) -> Result<HighLow>;
}

#[async_trait]
impl<T: CandleSource + ?Sized> CandleSource for Arc<T> {
    async fn get_candles(
        &self,
        symbol: &str,
        granularity: Granularity,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        (**self).get_candles(symbol, granularity, limit).await
    }
}

/// Client-side order id, so an ambiguous order outcome can be looked up later
pub fn client_order_id() -> String {
    format!("lb{}", uuid::Uuid::new_v4().simple())
}

/// Reject high/low windows a single kline request cannot cover
pub(crate) fn check_high_low_window(window_minutes: u32) -> Result<()> {
    if window_minutes == 0 || window_minutes > MAX_HIGH_LOW_WINDOW_MINUTES {
        return Err(BotError::Config(format!(
            "high/low window of {} minutes is outside 1..={}",
            window_minutes, MAX_HIGH_LOW_WINDOW_MINUTES
        )));
    }
    Ok(())
}

/// Normalize exchange-specific symbol aliases (e.g. "XBTUSDTM" -> "BTCUSDT")
pub fn normalize_symbol(raw: &str) -> String {
    let replaced = raw.trim().to_uppercase().replace("XBT", "BTC");
    match replaced.strip_suffix('M') {
        Some(stripped) => stripped.to_string(),
        None => replaced,
    }
}
