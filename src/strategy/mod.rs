// Entry decision strategies
pub mod signals;

use crate::models::{Candle, IndicatorReading};
use crate::Result;

pub use signals::{decide_trade_direction, reading_or_sentinel, IndicatorConfig};

/// Base trait for entry decision strategies
pub trait Strategy: Send + Sync {
    /// Evaluate a candle window (oldest to newest) into an indicator reading
    fn evaluate(&self, candles: &[Candle]) -> Result<IndicatorReading>;

    /// Get strategy name
    fn name(&self) -> &str;

    /// Minimum candles required for this strategy
    fn min_candles_required(&self) -> usize;
}

/// SMA/RSI/volume/high-low consensus strategy
#[derive(Debug, Clone, Default)]
pub struct IndicatorStrategy {
    config: IndicatorConfig,
}

impl IndicatorStrategy {
    pub fn new(config: IndicatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &IndicatorConfig {
        &self.config
    }
}

impl Strategy for IndicatorStrategy {
    fn evaluate(&self, candles: &[Candle]) -> Result<IndicatorReading> {
        decide_trade_direction(candles, &self.config)
    }

    fn name(&self) -> &str {
        "indicator_consensus"
    }

    fn min_candles_required(&self) -> usize {
        self.config.required_candles()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Signal;
    use crate::strategy::signals::tests::{candles_from, SCENARIO_A_CLOSES};

    #[test]
    fn test_strategy_delegates_to_decision_engine() {
        let strategy = IndicatorStrategy::new(IndicatorConfig {
            use_high_low: false,
            ..Default::default()
        });
        let candles = candles_from(&SCENARIO_A_CLOSES, &[1000.0; 25]);
        let reading = strategy.evaluate(&candles).unwrap();
        assert_eq!(reading.decision, Signal::Buy);
        assert_eq!(strategy.min_candles_required(), 25);
        assert_eq!(strategy.name(), "indicator_consensus");
    }
}
