use crate::config::LeverageConfig;
use crate::types::{Confidence, Technicals};

/// Leverage for a new entry. Falls back to `default_leverage` when dynamic
/// leverage is disabled or the inputs are incomplete.
pub fn select_leverage(
    symbol: &str,
    confidence: Confidence,
    tech: &Technicals,
    price: f64,
    cfg: &LeverageConfig,
    dynamic: bool,
) -> f64 {
    if !dynamic {
        return cfg.default_leverage;
    }
    match dynamic_leverage(confidence, tech, price, cfg) {
        Ok(lev) => lev,
        Err(reason) => {
            log::warn!(
                "[{}] Dynamic leverage unavailable ({}), using default {:.1}x",
                symbol, reason, cfg.default_leverage
            );
            cfg.default_leverage
        }
    }
}

pub fn dynamic_leverage(
    confidence: Confidence,
    tech: &Technicals,
    price: f64,
    cfg: &LeverageConfig,
) -> Result<f64, String> {
    if !(price.is_finite() && price > 0.0) {
        return Err(format!("invalid price {}", price));
    }
    let width = tech.bb_width_ratio(price).ok_or("bollinger bands missing")?;
    let rsi = tech.rsi.ok_or("RSI missing")?;

    let base = cfg.range(confidence).midpoint();

    let vol_mult = if width < cfg.low_volatility_bb_width {
        cfg.low_volatility_multiplier
    } else if width > cfg.high_volatility_bb_width {
        cfg.high_volatility_multiplier
    } else {
        1.0
    };

    let rsi_mult = if rsi < cfg.oversold_rsi {
        cfg.oversold_multiplier
    } else if rsi > cfg.overbought_rsi {
        cfg.overbought_multiplier
    } else {
        1.0
    };

    let raw = base * vol_mult * rsi_mult;
    if !raw.is_finite() {
        return Err(format!("non-finite leverage {}", raw));
    }
    // Round before clamping so bounds that are not on the 0.1 grid still hold.
    let rounded = (raw * 10.0).round() / 10.0;
    Ok(rounded.clamp(cfg.min_leverage, cfg.max_leverage))
}
