use crate::config::{PositionConfig, PyramidConfig};
use crate::position_manager::PositionRiskState;
use crate::types::{Confidence, InstrumentSpec, PriceSnapshot, Signal};

/// Why an add-on was not taken. Logged at debug by the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum PyramidSkip {
    Disabled,
    MaxReached(u32),
    WrongDirection,
    LowConfidence,
    WeakTrend,
    NotEnoughProfit(f64),
}

/// Contracts to add to a winning position.
#[allow(clippy::too_many_arguments)]
pub fn evaluate(
    state: &PositionRiskState,
    signal: &Signal,
    snapshot: &PriceSnapshot,
    leverage: f64,
    pyramid: &PyramidConfig,
    position: &PositionConfig,
    spec: &InstrumentSpec,
    enabled: bool,
) -> Result<f64, PyramidSkip> {
    if !enabled {
        return Err(PyramidSkip::Disabled);
    }
    if state.pyramid_count >= pyramid.max_times {
        return Err(PyramidSkip::MaxReached(state.pyramid_count));
    }
    if signal.direction.side() != Some(state.side) {
        return Err(PyramidSkip::WrongDirection);
    }
    if signal.confidence == Confidence::Low {
        return Err(PyramidSkip::LowConfidence);
    }
    if !snapshot.technicals.trend_favors(state.side) {
        return Err(PyramidSkip::WeakTrend);
    }
    let pnl = state.pnl_pct(snapshot.price);
    if pnl < pyramid.threshold {
        return Err(PyramidSkip::NotEnoughProfit(pnl));
    }

    let budget = position.base_allocation * pyramid.amount_ratio;
    let raw = budget * leverage / (snapshot.price * spec.contract_multiplier);
    Ok(spec.round_down(raw).max(spec.min_lot))
}
