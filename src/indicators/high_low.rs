use crate::models::{Candle, HighLow, Signal};

/// Highest high and lowest low across the window
pub fn calculate_high_low(candles: &[Candle]) -> Option<HighLow> {
    if candles.is_empty() {
        return None;
    }
    let high = candles.iter().map(|c| c.high).fold(f64::MIN, f64::max);
    let low = candles.iter().map(|c| c.low).fold(f64::MAX, f64::min);
    Some(HighLow { high, low })
}

/// Buy when price sits closer to the window low than to its high, else sell
pub fn high_low_signal(price: f64, range: HighLow) -> Signal {
    let dist_to_high = (range.high - price).abs();
    let dist_to_low = (price - range.low).abs();
    if dist_to_low < dist_to_high {
        Signal::Buy
    } else {
        Signal::Sell
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn candle(high: f64, low: f64) -> Candle {
        Candle {
            open_time: Utc::now(),
            open: low,
            high,
            low,
            close: high,
            volume: 1.0,
        }
    }

    #[test]
    fn test_high_low_range() {
        let candles = vec![candle(105.0, 99.0), candle(110.0, 101.0), candle(104.0, 95.0)];
        let range = calculate_high_low(&candles).unwrap();
        assert_eq!(range.high, 110.0);
        assert_eq!(range.low, 95.0);
    }

    #[test]
    fn test_empty_window() {
        assert!(calculate_high_low(&[]).is_none());
    }

    #[test]
    fn test_high_low_signal() {
        let range = HighLow { high: 110.0, low: 90.0 };
        assert_eq!(high_low_signal(92.0, range), Signal::Buy);
        assert_eq!(high_low_signal(108.0, range), Signal::Sell);
        // Equidistant resolves to sell
        assert_eq!(high_low_signal(100.0, range), Signal::Sell);
    }
}
