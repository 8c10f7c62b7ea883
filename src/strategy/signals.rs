use serde::{Deserialize, Serialize};

use super::Strategy;
use crate::error::BotError;
use crate::indicators::{
    calculate_average_volume, calculate_high_low, calculate_rsi, calculate_sma, high_low_signal,
    volume_signal,
};
use crate::models::{
    Candle, Granularity, IndicatorLabels, IndicatorReading, Signal, VolumeSignal,
    LABEL_NOT_AVAILABLE,
};
use crate::Result;

/// Configuration for the entry decision engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IndicatorConfig {
    pub rsi_period: usize,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    pub sma_short: usize,
    pub sma_long: usize,
    /// Window for the volume confirmation average
    pub volume_period: usize,
    pub use_sma: bool,
    pub use_rsi: bool,
    pub use_volume: bool,
    pub use_high_low: bool,
    pub granularity: Granularity,
    pub min_candles: usize,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            sma_short: 7,
            sma_long: 25,
            volume_period: 7,
            use_sma: true,
            use_rsi: true,
            use_volume: false,
            use_high_low: true,
            granularity: Granularity::FiveMinutes,
            min_candles: 25,
        }
    }
}

impl IndicatorConfig {
    /// Candles needed before any indicator is meaningful
    pub fn required_candles(&self) -> usize {
        self.min_candles
            .max(self.sma_long)
            .max(self.rsi_period + 1)
            .max(self.volume_period)
    }

    /// Candles to request from the source each poll
    pub fn fetch_limit(&self) -> usize {
        self.granularity.default_limit().max(self.required_candles())
    }

    pub fn validate(&self) -> Result<()> {
        if self.rsi_period < 1 {
            return Err(BotError::Config("indicators.rsi_period must be at least 1".into()));
        }
        if self.sma_short == 0 || self.sma_long == 0 || self.volume_period == 0 {
            return Err(BotError::Config("indicator periods must be at least 1".into()));
        }
        if self.sma_short >= self.sma_long {
            return Err(BotError::Config(
                "indicators.sma_short must be shorter than indicators.sma_long".into(),
            ));
        }
        if self.rsi_oversold >= self.rsi_overbought {
            return Err(BotError::Config(
                "indicators.rsi_oversold must be below indicators.rsi_overbought".into(),
            ));
        }
        Ok(())
    }
}

fn sma_signal(short: f64, long: f64) -> Signal {
    if short > long {
        Signal::Buy
    } else if short < long {
        Signal::Sell
    } else {
        Signal::Wait
    }
}

fn rsi_signal(rsi: f64, config: &IndicatorConfig) -> Signal {
    if rsi < config.rsi_oversold {
        Signal::Buy
    } else if rsi > config.rsi_overbought {
        Signal::Sell
    } else {
        Signal::Wait
    }
}

/// Combine the enabled direction votes into one decision.
///
/// Volume is a gate only: it can veto a unanimous vote, never cast one.
/// With no direction indicator enabled the decision is always `Wait`.
pub fn combine_signals(votes: &[Signal], volume_confirmed: bool) -> Signal {
    if votes.is_empty() || !volume_confirmed {
        return Signal::Wait;
    }
    if votes.iter().all(|s| *s == Signal::Buy) {
        Signal::Buy
    } else if votes.iter().all(|s| *s == Signal::Sell) {
        Signal::Sell
    } else {
        Signal::Wait
    }
}

/// Turn an oldest-to-newest candle window into an indicator reading.
///
/// Pure; returns `InsufficientData` when the window is too short.
pub fn decide_trade_direction(
    candles: &[Candle],
    config: &IndicatorConfig,
) -> Result<IndicatorReading> {
    let need = config.required_candles();
    if candles.len() < need {
        return Err(BotError::InsufficientData {
            have: candles.len(),
            need,
        });
    }

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();
    let insufficient = || BotError::InsufficientData {
        have: candles.len(),
        need,
    };

    let current_price = *closes.last().ok_or_else(insufficient)?;
    let sma_short = calculate_sma(&closes, config.sma_short).ok_or_else(insufficient)?;
    let sma_long = calculate_sma(&closes, config.sma_long).ok_or_else(insufficient)?;
    let rsi = calculate_rsi(&closes, config.rsi_period).ok_or_else(insufficient)?;
    let current_volume = *volumes.last().ok_or_else(insufficient)?;
    let avg_volume =
        calculate_average_volume(&volumes, config.volume_period).ok_or_else(insufficient)?;

    let sma_vote = sma_signal(sma_short, sma_long);
    let rsi_vote = rsi_signal(rsi, config);
    let volume_vote = volume_signal(current_volume, avg_volume);
    let high_low_vote = if config.use_high_low {
        calculate_high_low(candles).map(|range| high_low_signal(current_price, range))
    } else {
        None
    };

    let mut votes = Vec::with_capacity(3);
    if config.use_sma {
        votes.push(sma_vote);
    }
    if config.use_rsi {
        votes.push(rsi_vote);
    }
    if config.use_high_low {
        votes.push(high_low_vote.unwrap_or(Signal::Wait));
    }
    let volume_confirmed = !config.use_volume || volume_vote == VolumeSignal::Go;
    let decision = combine_signals(&votes, volume_confirmed);

    tracing::debug!(
        "Indicators: SMA {:.2}/{:.2} ({}), RSI {:.1} ({}), Vol {:.0}/{:.0} ({}), HL {:?} -> {}",
        sma_short,
        sma_long,
        sma_vote,
        rsi,
        rsi_vote,
        current_volume,
        avg_volume,
        volume_vote,
        high_low_vote,
        decision
    );

    let labels = IndicatorLabels {
        sma: format!("{} | {} ({})", sma_short as i64, sma_long as i64, sma_vote),
        rsi: format!("{} ({})", rsi as i64, rsi_vote),
        volume: format!(
            "{} now | {} avg ({})",
            current_volume as i64, avg_volume as i64, volume_vote
        ),
        high_low: high_low_vote
            .map(|s| format!("({})", s))
            .unwrap_or_else(|| LABEL_NOT_AVAILABLE.to_string()),
    };

    Ok(IndicatorReading {
        sma_short: Some(sma_short),
        sma_long: Some(sma_long),
        rsi: Some(rsi),
        current_volume: Some(current_volume),
        avg_volume: Some(avg_volume),
        sma_signal: sma_vote,
        rsi_signal: rsi_vote,
        volume_signal: volume_vote,
        high_low_signal: high_low_vote,
        decision,
        labels,
    })
}

/// Resolve a candle fetch outcome into a reading, never failing.
///
/// Short windows give the "N/A" sentinel; fetch failures give "Error".
/// Both decide `Wait`.
pub fn reading_or_sentinel(
    candles: Result<Vec<Candle>>,
    strategy: &dyn Strategy,
) -> IndicatorReading {
    let candles = match candles {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!("Candle fetch failed, indicators unavailable: {}", e);
            return IndicatorReading::errored();
        }
    };

    match strategy.evaluate(&candles) {
        Ok(reading) => reading,
        Err(BotError::InsufficientData { have, need }) => {
            tracing::info!("Insufficient data for analysis ({} of {} candles)", have, need);
            IndicatorReading::not_available()
        }
        Err(e) => {
            tracing::warn!("Indicator computation failed: {}", e);
            IndicatorReading::errored()
        }
    }
}
