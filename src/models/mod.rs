use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// OHLCV candlestick, ordered oldest to newest within a window
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Candle granularity supported by the decision engine
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Granularity {
    #[serde(rename = "1m")]
    OneMinute,
    #[default]
    #[serde(rename = "5m")]
    FiveMinutes,
}

impl Granularity {
    pub fn minutes(&self) -> u32 {
        match self {
            Granularity::OneMinute => 1,
            Granularity::FiveMinutes => 5,
        }
    }

    /// How many candles to request per decision (1m looks further back in candles)
    pub fn default_limit(&self) -> usize {
        match self {
            Granularity::OneMinute => 100,
            Granularity::FiveMinutes => 30,
        }
    }
}

/// Trading signal produced by the decision engine
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Buy,
    Sell,
    #[default]
    Wait,
}

impl Signal {
    /// Side a signal would open, `None` for `Wait`
    pub fn side(&self) -> Option<Side> {
        match self {
            Signal::Buy => Some(Side::Long),
            Signal::Sell => Some(Side::Short),
            Signal::Wait => None,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Buy => write!(f, "buy"),
            Signal::Sell => write!(f, "sell"),
            Signal::Wait => write!(f, "wait"),
        }
    }
}

/// Volume acts as a confirmation gate, never as a direction vote
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum VolumeSignal {
    Go,
    #[default]
    Wait,
}

impl fmt::Display for VolumeSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VolumeSignal::Go => write!(f, "go"),
            VolumeSignal::Wait => write!(f, "wait"),
        }
    }
}

/// Restriction on which side automatic entries may take
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TradeDirection {
    #[default]
    Both,
    BuyOnly,
    SellOnly,
}

impl TradeDirection {
    pub fn allows(&self, signal: Signal) -> bool {
        match (self, signal) {
            (_, Signal::Wait) => false,
            (TradeDirection::Both, _) => true,
            (TradeDirection::BuyOnly, Signal::Buy) => true,
            (TradeDirection::SellOnly, Signal::Sell) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Long => write!(f, "LONG"),
            Side::Short => write!(f, "SHORT"),
        }
    }
}

/// Canonical open position, normalized by the exchange gateway.
///
/// Identity is the symbol: only one position per symbol may be open.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    /// Absolute size in base units or contracts
    pub quantity: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub leverage: f64,
    /// Margin allocated to the position (quote currency)
    pub margin: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub liquidation_price: Option<f64>,
}

impl Position {
    /// Quantity with sign: positive for long, negative for short
    pub fn signed_quantity(&self) -> f64 {
        match self.side {
            Side::Long => self.quantity,
            Side::Short => -self.quantity,
        }
    }

    /// Round-trip fee estimate as a percentage of margin
    pub fn fee_percent(&self, fee_rate_per_side: f64) -> f64 {
        fee_rate_per_side * 2.0 * self.leverage
    }

    /// Unrealized PnL as a percentage of margin, after the round-trip fee estimate.
    ///
    /// `None` when the margin is zero (PnL% is undefined).
    pub fn pnl_percent(&self, fee_rate_per_side: f64) -> Option<f64> {
        if self.margin == 0.0 {
            return None;
        }
        let gross = (self.unrealized_pnl / self.margin) * 100.0;
        Some(gross - self.fee_percent(fee_rate_per_side))
    }

    /// Estimated fees in quote currency for opening and closing
    pub fn fees_paid(&self, fee_rate_per_side: f64) -> f64 {
        (fee_rate_per_side / 100.0) * 2.0 * self.leverage * self.margin
    }

    pub fn adjusted_unrealized_pnl(&self, fee_rate_per_side: f64) -> f64 {
        self.unrealized_pnl - self.fees_paid(fee_rate_per_side)
    }

    /// Position value in quote currency at entry
    pub fn notional(&self) -> f64 {
        self.margin * self.leverage
    }
}

/// Parameters for a market open
#[derive(Debug, Clone, PartialEq)]
pub struct OpenRequest {
    pub symbol: String,
    pub side: Side,
    /// Contracts for futures gateways, quote amount for margin gateways
    pub size: f64,
    pub leverage: u32,
}

/// What the gateway knows right after a successful open
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PositionDetails {
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub leverage: u32,
    pub entry_price: Option<f64>,
    pub order_id: Option<String>,
}

impl PositionDetails {
    /// Placeholder snapshot used to seed a tracker until the next positions poll.
    ///
    /// Margin is zero, so risk evaluation skips it until reconciled.
    pub fn provisional_position(&self) -> Position {
        let entry = self.entry_price.unwrap_or(0.0);
        Position {
            symbol: self.symbol.clone(),
            side: self.side,
            quantity: self.size,
            entry_price: entry,
            mark_price: entry,
            leverage: self.leverage as f64,
            margin: 0.0,
            unrealized_pnl: 0.0,
            realized_pnl: 0.0,
            liquidation_price: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CloseAck {
    pub symbol: String,
    pub order_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HighLow {
    pub high: f64,
    pub low: f64,
}

/// Derived indicator snapshot, recomputed each poll and never persisted
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IndicatorReading {
    pub sma_short: Option<f64>,
    pub sma_long: Option<f64>,
    pub rsi: Option<f64>,
    pub current_volume: Option<f64>,
    pub avg_volume: Option<f64>,
    pub sma_signal: Signal,
    pub rsi_signal: Signal,
    pub volume_signal: VolumeSignal,
    pub high_low_signal: Option<Signal>,
    pub decision: Signal,
    pub labels: IndicatorLabels,
}

/// Human-readable indicator strings for the presentation layer
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IndicatorLabels {
    pub sma: String,
    pub rsi: String,
    pub volume: String,
    pub high_low: String,
}

impl IndicatorLabels {
    pub fn uniform(text: &str) -> Self {
        Self {
            sma: text.to_string(),
            rsi: text.to_string(),
            volume: text.to_string(),
            high_low: text.to_string(),
        }
    }
}

pub const LABEL_NOT_AVAILABLE: &str = "N/A";
pub const LABEL_ERROR: &str = "Error";

impl IndicatorReading {
    /// Sentinel reading for a window that is too short
    pub fn not_available() -> Self {
        Self {
            labels: IndicatorLabels::uniform(LABEL_NOT_AVAILABLE),
            ..Default::default()
        }
    }

    /// Sentinel reading for a failed candle fetch
    pub fn errored() -> Self {
        Self {
            labels: IndicatorLabels::uniform(LABEL_ERROR),
            ..Default::default()
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.sma_short.is_none() && self.rsi.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_position(margin: f64, unrealized_pnl: f64, leverage: f64) -> Position {
        Position {
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            quantity: 0.01,
            entry_price: 100_000.0,
            mark_price: 101_000.0,
            leverage,
            margin,
            unrealized_pnl,
            realized_pnl: 0.0,
            liquidation_price: None,
        }
    }

    #[test]
    fn test_pnl_percent_subtracts_round_trip_fees() {
        let position = long_position(100.0, 10.0, 10.0);
        let pnl = position.pnl_percent(0.06).unwrap();
        // 10% gross - 0.06 * 2 * 10 = 8.8%
        assert!((pnl - 8.8).abs() < 1e-9);
    }

    #[test]
    fn test_pnl_percent_undefined_without_margin() {
        let position = long_position(0.0, 10.0, 10.0);
        assert_eq!(position.pnl_percent(0.06), None);
    }

    #[test]
    fn test_fees_paid() {
        let position = long_position(100.0, 10.0, 20.0);
        // 0.0006 * 2 * 20 * 100 = 2.4
        assert!((position.fees_paid(0.06) - 2.4).abs() < 1e-9);
        assert!((position.adjusted_unrealized_pnl(0.06) - 7.6).abs() < 1e-9);
    }

    #[test]
    fn test_trade_direction_filter() {
        assert!(TradeDirection::Both.allows(Signal::Buy));
        assert!(TradeDirection::Both.allows(Signal::Sell));
        assert!(!TradeDirection::Both.allows(Signal::Wait));
        assert!(TradeDirection::BuyOnly.allows(Signal::Buy));
        assert!(!TradeDirection::BuyOnly.allows(Signal::Sell));
        assert!(!TradeDirection::SellOnly.allows(Signal::Buy));
    }

    #[test]
    fn test_signed_quantity() {
        let mut position = long_position(100.0, 0.0, 10.0);
        assert_eq!(position.signed_quantity(), 0.01);
        position.side = Side::Short;
        assert_eq!(position.signed_quantity(), -0.01);
    }

    #[test]
    fn test_provisional_position_has_no_margin() {
        let details = PositionDetails {
            symbol: "BTCUSDT".to_string(),
            side: Side::Short,
            size: 0.002,
            leverage: 20,
            entry_price: Some(95_000.0),
            order_id: None,
        };
        let position = details.provisional_position();
        assert_eq!(position.margin, 0.0);
        assert_eq!(position.leverage, 20.0);
        assert_eq!(position.pnl_percent(0.06), None);
    }

    #[test]
    fn test_sentinel_readings() {
        let na = IndicatorReading::not_available();
        assert_eq!(na.decision, Signal::Wait);
        assert_eq!(na.labels.rsi, "N/A");
        assert!(na.is_sentinel());

        let err = IndicatorReading::errored();
        assert_eq!(err.labels.sma, "Error");
        assert_eq!(err.labels.high_low, "Error");
    }
}
