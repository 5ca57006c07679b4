use crate::config::{RiskRewardConfig, StopConfig};
use crate::error::EngineError;
use crate::types::{Confidence, Side, Technicals};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskLevels {
    pub stop_loss: f64,
    pub take_profit: f64,
    /// Stop distance as a fraction of entry.
    pub stop_ratio: f64,
    pub risk_reward: f64,
}

/// Stop distance as a fraction of price: ATR-based, never tighter than the
/// leverage floor, scaled by confidence and band width.
pub fn stop_ratio(price: f64, leverage: f64, confidence: Confidence, tech: &Technicals, cfg: &StopConfig) -> f64 {
    let atr_ratio = match tech.atr {
        Some(atr) if atr > 0.0 && price > 0.0 => {
            (atr * cfg.atr_multiplier / price).clamp(cfg.atr_floor, cfg.atr_ceiling)
        }
        _ => cfg.default_ratio,
    };
    let leverage_floor = if leverage > 0.0 { cfg.leverage_floor_pct / leverage } else { cfg.leverage_floor_pct };

    let vol_mult = match tech.bb_width_ratio(price) {
        Some(w) if w > cfg.wide_band_width => cfg.wide_band_multiplier,
        Some(w) if w < cfg.narrow_band_width => cfg.narrow_band_multiplier,
        _ => 1.0,
    };

    atr_ratio.max(leverage_floor) * cfg.confidence_multiplier(confidence) * vol_mult
}

pub fn risk_reward(tech: &Technicals, cfg: &RiskRewardConfig, dynamic: bool) -> f64 {
    if dynamic {
        cfg.for_trend(tech.trend)
    } else {
        cfg.default
    }
}

#[allow(clippy::too_many_arguments)]
pub fn calculate_risk_levels(
    side: Side,
    price: f64,
    leverage: f64,
    confidence: Confidence,
    tech: &Technicals,
    stops: &StopConfig,
    rr_cfg: &RiskRewardConfig,
    dynamic_rr: bool,
) -> RiskLevels {
    let ratio = stop_ratio(price, leverage, confidence, tech, stops);
    let rr = risk_reward(tech, rr_cfg, dynamic_rr);
    let (stop_loss, take_profit) = match side {
        Side::Long => (price * (1.0 - ratio), price * (1.0 + ratio * rr)),
        Side::Short => (price * (1.0 + ratio), price * (1.0 - ratio * rr)),
    };
    RiskLevels { stop_loss, take_profit, stop_ratio: ratio, risk_reward: rr }
}

/// Reject levels that are non-positive or on the wrong side of entry.
pub fn validate_levels(
    symbol: &str,
    side: Side,
    entry: f64,
    levels: &RiskLevels,
    rr_cfg: &RiskRewardConfig,
) -> Result<(), EngineError> {
    let RiskLevels { stop_loss, take_profit, .. } = *levels;
    if !(entry > 0.0 && stop_loss > 0.0 && take_profit > 0.0) {
        return Err(EngineError::Validation(format!(
            "non-positive price (entry {:.2}, SL {:.2}, TP {:.2})",
            entry, stop_loss, take_profit
        )));
    }
    match side {
        Side::Long => {
            if stop_loss >= entry {
                return Err(EngineError::Validation(format!(
                    "SL {:.2} must be below entry {:.2} for long", stop_loss, entry
                )));
            }
            if take_profit <= entry {
                return Err(EngineError::Validation(format!(
                    "TP {:.2} must be above entry {:.2} for long", take_profit, entry
                )));
            }
        }
        Side::Short => {
            if stop_loss <= entry {
                return Err(EngineError::Validation(format!(
                    "SL {:.2} must be above entry {:.2} for short", stop_loss, entry
                )));
            }
            if take_profit >= entry {
                return Err(EngineError::Validation(format!(
                    "TP {:.2} must be below entry {:.2} for short", take_profit, entry
                )));
            }
        }
    }

    let rr = (take_profit - entry).abs() / (entry - stop_loss).abs();
    if rr < rr_cfg.warn_below {
        log::warn!("[{}] Risk:reward {:.2} below {:.1}, accepting anyway", symbol, rr, rr_cfg.warn_below);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Trend;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn atr_stop_is_clamped_to_ceiling() {
        let cfg = StopConfig::default();
        // 2000 × 2.5 / 50000 = 0.10 → 0.03
        let t = Technicals { atr: Some(2_000.0), ..Technicals::default() };
        assert!(approx(stop_ratio(50_000.0, 5.0, Confidence::Medium, &t, &cfg), 0.03));
    }

    #[test]
    fn leverage_floor_wins_over_tight_atr() {
        let cfg = StopConfig::default();
        // ATR ratio clamps up to 0.005, 0.02 / 2 = 0.01
        let t = Technicals { atr: Some(10.0), ..Technicals::default() };
        assert!(approx(stop_ratio(50_000.0, 2.0, Confidence::Medium, &t, &cfg), 0.01));
    }

    #[test]
    fn missing_atr_uses_default_ratio_with_multipliers() {
        let cfg = StopConfig::default();
        let t = Technicals {
            bb_upper: Some(103.0),
            bb_lower: Some(97.0),
            ..Technicals::default()
        };
        // 0.015 (> 0.02/8) × 0.8 high confidence × 1.3 wide bands
        assert!(approx(stop_ratio(100.0, 8.0, Confidence::High, &t, &cfg), 0.015 * 0.8 * 1.3));
    }

    #[test]
    fn dynamic_rr_follows_trend() {
        let cfg = RiskRewardConfig::default();
        let mut t = Technicals { trend: Some(Trend::StrongDown), ..Technicals::default() };
        assert_eq!(risk_reward(&t, &cfg, true), 5.0);
        t.trend = Some(Trend::Consolidating);
        assert_eq!(risk_reward(&t, &cfg, true), 1.5);
        t.trend = None;
        assert_eq!(risk_reward(&t, &cfg, true), 3.0);
        t.trend = Some(Trend::StrongUp);
        assert_eq!(risk_reward(&t, &cfg, false), 3.0);
    }

    #[test]
    fn long_and_short_levels_are_mirrored() {
        let stops = StopConfig::default();
        let rr = RiskRewardConfig::default();
        let t = Technicals { atr: Some(400.0), trend: Some(Trend::StrongUp), ..Technicals::default() };
        // 400 × 2.5 / 50000 = 0.02
        let long = calculate_risk_levels(Side::Long, 50_000.0, 5.0, Confidence::Medium, &t, &stops, &rr, true);
        assert!(approx(long.stop_loss, 49_000.0));
        assert!(approx(long.take_profit, 55_000.0));
        validate_levels("TEST", Side::Long, 50_000.0, &long, &rr).unwrap();

        let short = calculate_risk_levels(Side::Short, 50_000.0, 5.0, Confidence::Medium, &t, &stops, &rr, true);
        assert!(approx(short.stop_loss, 51_000.0));
        assert!(approx(short.take_profit, 45_000.0));
        validate_levels("TEST", Side::Short, 50_000.0, &short, &rr).unwrap();
    }

    #[test]
    fn validation_rejects_wrong_side_and_non_positive() {
        let rr = RiskRewardConfig::default();
        let wrong = RiskLevels { stop_loss: 51_000.0, take_profit: 55_000.0, stop_ratio: 0.02, risk_reward: 5.0 };
        assert!(matches!(
            validate_levels("TEST", Side::Long, 50_000.0, &wrong, &rr),
            Err(EngineError::Validation(_))
        ));
        let negative = RiskLevels { stop_loss: -1.0, take_profit: 55_000.0, stop_ratio: 1.0, risk_reward: 5.0 };
        assert!(validate_levels("TEST", Side::Long, 50_000.0, &negative, &rr).is_err());
    }

    #[test]
    fn low_rr_is_accepted() {
        let rr = RiskRewardConfig::default();
        let levels = RiskLevels { stop_loss: 49_000.0, take_profit: 50_500.0, stop_ratio: 0.02, risk_reward: 0.5 };
        assert!(validate_levels("TEST", Side::Long, 50_000.0, &levels, &rr).is_ok());
    }
}
