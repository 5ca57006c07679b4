//! Staged profit-taking at multiples of the initial risk. Stage 1 closes
//! `tp1_ratio` of the position; stage 2 closes `tp2_ratio` of the original
//! size, expressed against what is left after stage 1. The `tp3_ratio` share
//! is never closed here.

use crate::config::PartialTpConfig;
use crate::position_manager::PositionRiskState;
use crate::types::InstrumentSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpStage {
    First,
    Second,
}

impl TpStage {
    pub fn label(self) -> &'static str {
        match self {
            TpStage::First => "TP1",
            TpStage::Second => "TP2",
        }
    }

    pub fn mark_done(self, state: &mut PositionRiskState) {
        match self {
            TpStage::First => state.tp1_done = true,
            TpStage::Second => state.tp2_done = true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TpAction {
    /// Close `qty` contracts reduce-only, then mark the stage.
    Close { stage: TpStage, qty: f64 },
    /// The stage triggered but its share rounds below one lot.
    Skip { stage: TpStage, raw_qty: f64 },
}

/// The next stage due at `price`, given the live position `size`.
pub fn next_stage(
    state: &PositionRiskState,
    price: f64,
    size: f64,
    cfg: &PartialTpConfig,
    spec: &InstrumentSpec,
) -> Option<TpAction> {
    let risk = state.initial_risk()?;
    if risk <= 0.0 || size <= 0.0 {
        return None;
    }
    let moved = state.side.favorable_move(state.entry_price, price);

    let (stage, raw_qty) = if !state.tp1_done {
        if moved < cfg.tp1_rr_multiplier * risk {
            return None;
        }
        (TpStage::First, size * cfg.tp1_ratio)
    } else if !state.tp2_done {
        if moved < cfg.tp2_rr_multiplier * risk {
            return None;
        }
        (TpStage::Second, size * cfg.tp2_ratio / (1.0 - cfg.tp1_ratio))
    } else {
        return None;
    };

    let qty = spec.round_down(raw_qty.min(size));
    if qty < spec.min_lot {
        return Some(TpAction::Skip { stage, raw_qty });
    }
    Some(TpAction::Close { stage, qty })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;

    const SPEC: InstrumentSpec = InstrumentSpec { lot_step: 0.001, min_lot: 0.001, contract_multiplier: 1.0 };

    fn long() -> PositionRiskState {
        // initial risk 500
        PositionRiskState::opened(Side::Long, 50_000.0, 49_500.0, 52_500.0)
    }

    #[test]
    fn tp1_fires_exactly_at_one_and_a_half_risk() {
        let cfg = PartialTpConfig::default();
        let st = long();
        assert_eq!(next_stage(&st, 50_749.0, 1.0, &cfg, &SPEC), None);
        let action = next_stage(&st, 50_750.0, 1.0, &cfg, &SPEC).unwrap();
        assert!(matches!(action, TpAction::Close { stage: TpStage::First, qty } if (qty - 0.3).abs() < 1e-9));
    }

    #[test]
    fn tp2_waits_for_tp1() {
        let cfg = PartialTpConfig::default();
        let mut st = long();
        // far past the tp2 threshold, but tp1 has not fired yet
        let first = next_stage(&st, 52_000.0, 1.0, &cfg, &SPEC).unwrap();
        assert!(matches!(first, TpAction::Close { stage: TpStage::First, .. }));

        TpStage::First.mark_done(&mut st);
        let second = next_stage(&st, 52_000.0, 0.7, &cfg, &SPEC).unwrap();
        // 0.7 × 0.3 / 0.7 = 0.3 of the original size
        assert!(matches!(second, TpAction::Close { stage: TpStage::Second, qty } if (qty - 0.3).abs() < 1e-9));

        TpStage::Second.mark_done(&mut st);
        assert_eq!(next_stage(&st, 60_000.0, 0.4, &cfg, &SPEC), None);
        st.check_invariants(&crate::config::PyramidConfig::default()).unwrap();
    }

    #[test]
    fn tp2_needs_its_own_threshold() {
        let cfg = PartialTpConfig::default();
        let mut st = long();
        st.tp1_done = true;
        assert_eq!(next_stage(&st, 51_249.0, 0.7, &cfg, &SPEC), None);
        assert!(next_stage(&st, 51_250.0, 0.7, &cfg, &SPEC).is_some());
    }

    #[test]
    fn short_side_uses_favorable_move() {
        let cfg = PartialTpConfig::default();
        let st = PositionRiskState::opened(Side::Short, 50_000.0, 50_500.0, 47_500.0);
        assert_eq!(next_stage(&st, 49_251.0, 1.0, &cfg, &SPEC), None);
        assert!(next_stage(&st, 49_250.0, 1.0, &cfg, &SPEC).is_some());
    }

    #[test]
    fn below_min_lot_is_skipped() {
        let cfg = PartialTpConfig::default();
        let action = next_stage(&long(), 51_000.0, 0.002, &cfg, &SPEC).unwrap();
        assert!(matches!(action, TpAction::Skip { stage: TpStage::First, .. }));
    }

    #[test]
    fn recovered_position_has_no_stages() {
        let mut st = long();
        st.initial_stop_loss = None;
        assert_eq!(next_stage(&st, 60_000.0, 1.0, &PartialTpConfig::default(), &SPEC), None);
    }
}
