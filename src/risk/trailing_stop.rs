use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::BotError;
use crate::models::Side;
use crate::Result;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TrailingMode {
    /// PnL%-bucketed trailing distances
    #[default]
    Tiered,
    /// Lock a fixed fraction of PnL% once past an activation level
    Auto,
}

/// Small-profit band where the default stop is held at high leverage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BreakevenBand {
    pub min_pnl: f64,
    pub max_pnl: f64,
    pub min_leverage: f64,
}

/// Band `[min_pnl, max_pnl)` that locks a fixed gain
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LockBand {
    pub min_pnl: f64,
    pub max_pnl: f64,
    pub lock: f64,
}

/// Trailing distance for PnL% in `[min_pnl, max_pnl]` (unbounded when `max_pnl` is None).
///
/// With `min_lock` set, the tier only applies when `pnl - trail` exceeds it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrailTier {
    pub min_pnl: f64,
    pub max_pnl: Option<f64>,
    pub trail: f64,
    #[serde(default)]
    pub min_lock: Option<f64>,
}

impl TrailTier {
    fn contains(&self, pnl: f64) -> bool {
        pnl >= self.min_pnl && self.max_pnl.map_or(true, |max| pnl <= max)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrailingStopConfig {
    pub mode: TrailingMode,
    pub breakeven: Option<BreakevenBand>,
    pub low_profit: Option<LockBand>,
    /// Checked in order, first match wins
    pub tiers: Vec<TrailTier>,
    pub auto_activation_pnl: f64,
    pub auto_ratio: f64,
}

impl Default for TrailingStopConfig {
    fn default() -> Self {
        Self {
            mode: TrailingMode::Tiered,
            breakeven: Some(BreakevenBand {
                min_pnl: 0.5,
                max_pnl: 3.0,
                min_leverage: 20.0,
            }),
            low_profit: Some(LockBand {
                min_pnl: 4.0,
                max_pnl: 5.0,
                lock: 2.0,
            }),
            tiers: vec![
                TrailTier {
                    min_pnl: 5.0,
                    max_pnl: Some(15.9),
                    trail: 1.5,
                    min_lock: Some(2.0),
                },
                TrailTier {
                    min_pnl: 16.0,
                    max_pnl: Some(30.0),
                    trail: 5.0,
                    min_lock: None,
                },
                TrailTier {
                    min_pnl: 31.0,
                    max_pnl: Some(50.0),
                    trail: 8.0,
                    min_lock: None,
                },
                TrailTier {
                    min_pnl: 50.0,
                    max_pnl: None,
                    trail: 10.0,
                    min_lock: None,
                },
            ],
            auto_activation_pnl: 1.0,
            auto_ratio: 0.5,
        }
    }
}

impl TrailingStopConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(band) = &self.breakeven {
            if band.min_pnl > band.max_pnl {
                return Err(BotError::Config("trailing.breakeven band is inverted".into()));
            }
        }
        if let Some(band) = &self.low_profit {
            if band.min_pnl >= band.max_pnl {
                return Err(BotError::Config("trailing.low_profit band is inverted".into()));
            }
        }
        for (i, tier) in self.tiers.iter().enumerate() {
            if tier.trail < 0.0 {
                return Err(BotError::Config(format!("trailing.tiers[{}] has a negative trail", i)));
            }
            if let Some(max) = tier.max_pnl {
                if max < tier.min_pnl {
                    return Err(BotError::Config(format!("trailing.tiers[{}] is inverted", i)));
                }
            }
        }
        for (i, pair) in self.tiers.windows(2).enumerate() {
            match pair[0].max_pnl {
                Some(max) if max <= pair[1].min_pnl => {}
                _ => {
                    return Err(BotError::Config(format!(
                        "trailing.tiers[{}] and [{}] overlap",
                        i,
                        i + 1
                    )))
                }
            }
        }
        if !(0.0..=1.0).contains(&self.auto_ratio) {
            return Err(BotError::Config("trailing.auto_ratio must be within 0..=1".into()));
        }
        Ok(())
    }
}

/// Compute the stop-loss PnL% the current PnL% calls for.
///
/// Anything outside the configured bands falls back to `default_stop_loss`.
pub fn calculate_stop_loss(
    pnl_percent: f64,
    leverage: f64,
    default_stop_loss: f64,
    config: &TrailingStopConfig,
) -> f64 {
    if config.mode == TrailingMode::Auto {
        if pnl_percent >= config.auto_activation_pnl {
            return pnl_percent * config.auto_ratio;
        }
        return default_stop_loss;
    }

    if let Some(band) = &config.breakeven {
        if pnl_percent >= band.min_pnl && pnl_percent <= band.max_pnl && leverage >= band.min_leverage
        {
            return default_stop_loss;
        }
    }

    if let Some(band) = &config.low_profit {
        if pnl_percent >= band.min_pnl && pnl_percent < band.max_pnl {
            return band.lock;
        }
    }

    match config.tiers.iter().find(|t| t.contains(pnl_percent)) {
        Some(tier) => {
            let trailed = pnl_percent - tier.trail;
            match tier.min_lock {
                Some(min_lock) if trailed > min_lock && pnl_percent > 0.0 => {
                    trailed.max(default_stop_loss)
                }
                Some(_) => default_stop_loss,
                None => trailed,
            }
        }
        None => default_stop_loss,
    }
}

/// Apply the ratchet rule, returning the new trigger if it moves.
///
/// A trigger only rises, except while PnL% is negative, where it may only fall.
pub fn ratchet_trigger(current_trigger: f64, calculated: f64, pnl_percent: f64) -> Option<f64> {
    if calculated > current_trigger || (pnl_percent < 0.0 && calculated < current_trigger) {
        Some(calculated)
    } else {
        None
    }
}

/// High-water mark while winning, low-water mark while losing
pub fn update_max_pnl(max_pnl_percent: f64, pnl_percent: f64) -> f64 {
    if pnl_percent > max_pnl_percent || (pnl_percent < 0.0 && pnl_percent < max_pnl_percent) {
        pnl_percent
    } else {
        max_pnl_percent
    }
}

/// Which role an absolute stop price played when it was hit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopPriceHit {
    TakeProfit,
    StopLoss,
}

/// Check an absolute price target against the current price.
///
/// On the profitable side of entry the target is a take-profit, otherwise a stop-loss.
pub fn check_stop_price(side: Side, entry_price: f64, target: f64, price: f64) -> Option<StopPriceHit> {
    match side {
        Side::Long if target >= entry_price => {
            (price >= target).then_some(StopPriceHit::TakeProfit)
        }
        Side::Long => (price <= target).then_some(StopPriceHit::StopLoss),
        Side::Short if target <= entry_price => {
            (price <= target).then_some(StopPriceHit::TakeProfit)
        }
        Side::Short => (price >= target).then_some(StopPriceHit::StopLoss),
    }
}

/// Why a position is being closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    TrailingStop,
    StopPrice(StopPriceHit),
    Manual,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::TrailingStop => write!(f, "trailing stop"),
            CloseReason::StopPrice(StopPriceHit::TakeProfit) => write!(f, "take-profit price"),
            CloseReason::StopPrice(StopPriceHit::StopLoss) => write!(f, "stop-loss price"),
            CloseReason::Manual => write!(f, "manual"),
        }
    }
}

/// Close outcome classification by the sign of PnL%
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitKind {
    Profit,
    Loss,
}

impl ExitKind {
    pub fn from_pnl(pnl_percent: f64) -> Self {
        if pnl_percent >= 0.0 {
            ExitKind::Profit
        } else {
            ExitKind::Loss
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULT_SL: f64 = -3.5;

    fn tiered(pnl: f64, leverage: f64) -> f64 {
        calculate_stop_loss(pnl, leverage, DEFAULT_SL, &TrailingStopConfig::default())
    }

    #[test]
    fn test_breakeven_band_holds_default_at_high_leverage() {
        assert_eq!(tiered(2.0, 20.0), DEFAULT_SL);
        assert_eq!(tiered(2.0, 10.0), DEFAULT_SL);
    }

    #[test]
    fn test_low_profit_band_locks_fixed_gain() {
        assert_eq!(tiered(4.0, 10.0), 2.0);
        assert_eq!(tiered(4.9, 10.0), 2.0);
    }

    #[test]
    fn test_mid_tier_trails_when_it_locks_enough() {
        // 8.8 - 1.5 = 7.3
        assert!((tiered(8.8, 10.0) - 7.3).abs() < 1e-9);
        // 5.0 - 1.5 = 3.5 > 2
        assert!((tiered(5.0, 10.0) - 3.5).abs() < 1e-9);
        assert!((tiered(15.9, 10.0) - 14.4).abs() < 1e-9);
    }

    #[test]
    fn test_mid_tier_requires_min_lock() {
        let config = TrailingStopConfig {
            tiers: vec![TrailTier {
                min_pnl: 5.0,
                max_pnl: Some(15.9),
                trail: 4.0,
                min_lock: Some(2.0),
            }],
            ..Default::default()
        };
        // 5.5 - 4 = 1.5, not above the minimum lock
        assert_eq!(calculate_stop_loss(5.5, 10.0, DEFAULT_SL, &config), DEFAULT_SL);
        assert!((calculate_stop_loss(7.0, 10.0, DEFAULT_SL, &config) - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_higher_tiers() {
        assert_eq!(tiered(20.0, 10.0), 15.0);
        assert_eq!(tiered(40.0, 10.0), 32.0);
        assert_eq!(tiered(50.0, 10.0), 42.0);
        assert_eq!(tiered(80.0, 10.0), 70.0);
    }

    #[test]
    fn test_gaps_fall_back_to_default() {
        for pnl in [-10.0, -0.1, 0.0, 0.3, 3.5, 15.95, 30.5] {
            assert_eq!(tiered(pnl, 10.0), DEFAULT_SL, "pnl {}", pnl);
        }
    }

    #[test]
    fn test_auto_mode() {
        let config = TrailingStopConfig {
            mode: TrailingMode::Auto,
            ..Default::default()
        };
        assert_eq!(calculate_stop_loss(10.0, 10.0, DEFAULT_SL, &config), 5.0);
        assert_eq!(calculate_stop_loss(1.0, 10.0, DEFAULT_SL, &config), 0.5);
        assert_eq!(calculate_stop_loss(0.9, 10.0, DEFAULT_SL, &config), DEFAULT_SL);
    }

    #[test]
    fn test_ratchet_rule() {
        // Raises
        assert_eq!(ratchet_trigger(-3.5, 7.3, 8.8), Some(7.3));
        // Never retreats while winning
        assert_eq!(ratchet_trigger(7.3, -3.5, 2.0), None);
        assert_eq!(ratchet_trigger(7.3, 5.0, 6.5), None);
        // Losing side may only tighten downward
        assert_eq!(ratchet_trigger(-2.0, -3.5, -1.0), Some(-3.5));
        assert_eq!(ratchet_trigger(-3.5, -3.5, -1.0), None);
    }

    #[test]
    fn test_ratchet_property_over_sequence() {
        let config = TrailingStopConfig::default();
        let pnls = [
            0.0, 2.0, 4.5, 8.8, 12.0, 6.0, 20.0, 45.0, 33.0, 60.0, 51.0, 10.0, -1.0, -5.0, 3.0,
            -2.0, 17.0,
        ];
        let mut trigger = DEFAULT_SL;
        for pnl in pnls {
            let calc = calculate_stop_loss(pnl, 10.0, DEFAULT_SL, &config);
            if let Some(next) = ratchet_trigger(trigger, calc, pnl) {
                if pnl >= 0.0 {
                    assert!(next >= trigger);
                } else {
                    assert!(next <= trigger);
                }
                trigger = next;
            }
        }
    }

    #[test]
    fn test_max_pnl_water_marks() {
        assert_eq!(update_max_pnl(0.0, 5.0), 5.0);
        assert_eq!(update_max_pnl(5.0, 3.0), 5.0);
        assert_eq!(update_max_pnl(0.0, -2.0), -2.0);
        assert_eq!(update_max_pnl(-2.0, -1.0), -2.0);
        assert_eq!(update_max_pnl(5.0, -1.0), -1.0);
    }

    #[test]
    fn test_stop_price_long() {
        // Above entry: take-profit
        assert_eq!(
            check_stop_price(Side::Long, 100.0, 110.0, 111.0),
            Some(StopPriceHit::TakeProfit)
        );
        assert_eq!(check_stop_price(Side::Long, 100.0, 110.0, 105.0), None);
        // Below entry: stop-loss
        assert_eq!(
            check_stop_price(Side::Long, 100.0, 95.0, 94.0),
            Some(StopPriceHit::StopLoss)
        );
        assert_eq!(check_stop_price(Side::Long, 100.0, 95.0, 99.0), None);
    }

    #[test]
    fn test_stop_price_short() {
        assert_eq!(
            check_stop_price(Side::Short, 100.0, 90.0, 89.0),
            Some(StopPriceHit::TakeProfit)
        );
        assert_eq!(check_stop_price(Side::Short, 100.0, 90.0, 95.0), None);
        assert_eq!(
            check_stop_price(Side::Short, 100.0, 105.0, 106.0),
            Some(StopPriceHit::StopLoss)
        );
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(TrailingStopConfig::default().validate().is_ok());
    }

    #[test]
    fn test_overlapping_tiers_rejected() {
        let mut config = TrailingStopConfig::default();
        config.tiers[0].max_pnl = Some(20.0);
        assert!(config.validate().is_err());

        let mut unbounded_middle = TrailingStopConfig::default();
        unbounded_middle.tiers[1].max_pnl = None;
        assert!(unbounded_middle.validate().is_err());
    }

    #[test]
    fn test_exit_kind_from_sign() {
        assert_eq!(ExitKind::from_pnl(0.0), ExitKind::Profit);
        assert_eq!(ExitKind::from_pnl(-0.01), ExitKind::Loss);
    }
}
