use crate::config::PyramidConfig;
use crate::error::EngineError;
use crate::types::{Position, Side};

/// Per-position risk record owned by the controller.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionRiskState {
    pub side: Side,
    pub entry_price: f64,
    /// Resting protective stop. `None` only for a recovered position.
    pub current_stop_loss: Option<f64>,
    pub initial_stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub pyramid_count: u32,
    pub tp1_done: bool,
    pub tp2_done: bool,
    /// The runner share now rides the trailing stop alone.
    pub tp3_done: bool,
    /// SL/TP rest as separate conditional orders sized at placement.
    pub conditional_protection: bool,
    /// Rebuilt from the exchange after a restart; stop history is unknown.
    pub recovered: bool,
}

impl PositionRiskState {
    pub fn opened(side: Side, entry_price: f64, stop_loss: f64, take_profit: f64) -> Self {
        PositionRiskState {
            side,
            entry_price,
            current_stop_loss: Some(stop_loss),
            initial_stop_loss: Some(stop_loss),
            take_profit: Some(take_profit),
            pyramid_count: 0,
            tp1_done: false,
            tp2_done: false,
            tp3_done: false,
            conditional_protection: false,
            recovered: false,
        }
    }

    /// Safe defaults for a live position the controller did not open.
    pub fn recovered(position: &Position) -> Self {
        PositionRiskState {
            side: position.side,
            entry_price: position.entry_price,
            current_stop_loss: None,
            initial_stop_loss: None,
            take_profit: None,
            pyramid_count: 0,
            tp1_done: false,
            tp2_done: false,
            tp3_done: false,
            conditional_protection: false,
            recovered: true,
        }
    }

    /// |entry − initial stop|, or `None` when no initial stop is known.
    pub fn initial_risk(&self) -> Option<f64> {
        self.initial_stop_loss.map(|sl| (self.entry_price - sl).abs())
    }

    pub fn pnl_pct(&self, price: f64) -> f64 {
        self.side.pnl_pct(self.entry_price, price)
    }

    /// Accepts `new_stop` only if it tightens the current stop for this side.
    pub fn improves_stop(&self, new_stop: f64) -> bool {
        match self.current_stop_loss {
            None => true,
            Some(cur) => match self.side {
                Side::Long => new_stop > cur,
                Side::Short => new_stop < cur,
            },
        }
    }

    /// Whether the resting stop sits at or beyond the entry price.
    pub fn stop_covers_entry(&self) -> bool {
        match (self.current_stop_loss, self.side) {
            (Some(sl), Side::Long) => sl >= self.entry_price,
            (Some(sl), Side::Short) => sl <= self.entry_price,
            (None, _) => false,
        }
    }

    pub fn check_invariants(&self, pyramid: &PyramidConfig) -> Result<(), EngineError> {
        if !(self.entry_price.is_finite() && self.entry_price > 0.0) {
            return Err(EngineError::Internal(format!("entry price {} is not positive", self.entry_price)));
        }
        if self.pyramid_count > pyramid.max_times {
            return Err(EngineError::Internal(format!(
                "pyramid count {} exceeds max {}",
                self.pyramid_count, pyramid.max_times
            )));
        }
        if self.tp2_done && !self.tp1_done {
            return Err(EngineError::Internal("tp2 recorded before tp1".to_string()));
        }
        if self.tp3_done && !self.tp2_done {
            return Err(EngineError::Internal("runner handed off before tp2".to_string()));
        }
        if let (Some(initial), Some(current)) = (self.initial_stop_loss, self.current_stop_loss) {
            let loosened = match self.side {
                Side::Long => current < initial,
                Side::Short => current > initial,
            };
            if loosened {
                return Err(EngineError::Internal(format!(
                    "{} stop moved against the position ({:.2} → {:.2})",
                    self.side.as_str(),
                    initial,
                    current
                )));
            }
        }
        Ok(())
    }
}
