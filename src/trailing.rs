use crate::config::TrailingConfig;
use crate::position_manager::PositionRiskState;
use crate::types::Side;

/// Stop level implied by the highest profit threshold reached, if any.
pub fn target_stop(side: Side, entry: f64, pnl_pct: f64, cfg: &TrailingConfig) -> Option<f64> {
    let lock = if pnl_pct >= cfg.lock2_threshold {
        cfg.lock2_level
    } else if pnl_pct >= cfg.lock1_threshold {
        cfg.lock1_level
    } else if pnl_pct >= cfg.breakeven_threshold {
        0.0
    } else {
        return None;
    };
    Some(entry * (1.0 + side.sign() * lock))
}

/// New stop for the position, only when it strictly tightens the current one.
/// The caller commits it to `state` after the exchange accepts it.
pub fn evaluate(state: &PositionRiskState, price: f64, cfg: &TrailingConfig) -> Option<f64> {
    if state.entry_price <= 0.0 || price <= 0.0 {
        return None;
    }
    let candidate = target_stop(state.side, state.entry_price, state.pnl_pct(price), cfg)?;
    if state.improves_stop(candidate) {
        Some(candidate)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn breakeven_at_five_percent_then_holds() {
        let cfg = TrailingConfig::default();
        let mut st = PositionRiskState::opened(Side::Long, 50_000.0, 49_000.0, 55_000.0);

        let stop = evaluate(&st, 52_500.0, &cfg).unwrap();
        assert_eq!(stop, 50_000.0);
        st.current_stop_loss = Some(stop);

        // +9% is still below the first lock threshold
        assert_eq!(evaluate(&st, 54_500.0, &cfg), None);
        assert_eq!(st.current_stop_loss, Some(50_000.0));
    }

    #[test]
    fn lock_levels_for_long_and_short() {
        let cfg = TrailingConfig::default();
        let long = PositionRiskState::opened(Side::Long, 100.0, 98.0, 110.0);
        assert!((evaluate(&long, 110.0, &cfg).unwrap() - 103.0).abs() < 1e-9);
        assert!((evaluate(&long, 121.0, &cfg).unwrap() - 110.0).abs() < 1e-9);

        let short = PositionRiskState::opened(Side::Short, 100.0, 102.0, 90.0);
        assert!((evaluate(&short, 95.0, &cfg).unwrap() - 100.0).abs() < 1e-9);
        assert!((evaluate(&short, 89.0, &cfg).unwrap() - 97.0).abs() < 1e-9);
        assert!((evaluate(&short, 80.0, &cfg).unwrap() - 90.0).abs() < 1e-9);
    }

    #[test]
    fn stop_never_loosens_as_price_retraces() {
        let cfg = TrailingConfig::default();
        let mut st = PositionRiskState::opened(Side::Long, 100.0, 98.0, 110.0);
        let mut last = st.current_stop_loss.unwrap();
        for price in [101.0, 106.0, 112.0, 104.0, 125.0, 107.0, 99.0, 130.0] {
            if let Some(stop) = evaluate(&st, price, &cfg) {
                assert!(stop > last);
                st.current_stop_loss = Some(stop);
                last = stop;
            }
        }
        assert!((last - 110.0).abs() < 1e-9);
    }

    #[test]
    fn losing_position_is_left_alone() {
        let cfg = TrailingConfig::default();
        let st = PositionRiskState::opened(Side::Short, 100.0, 102.0, 90.0);
        assert_eq!(evaluate(&st, 101.0, &cfg), None);
    }

    // ── Properties ──────────────────────────────────────────────────────────

    fn arb_path() -> impl Strategy<Value = Vec<f64>> {
        // price moves of -15%..+15% per step from an entry of 100
        prop::collection::vec(-0.15..0.15_f64, 1..40)
    }

    fn run_path(side: Side, moves: &[f64]) -> Result<(), TestCaseError> {
        let cfg = TrailingConfig::default();
        let (sl, tp) = match side {
            Side::Long => (98.0, 110.0),
            Side::Short => (102.0, 90.0),
        };
        let mut st = PositionRiskState::opened(side, 100.0, sl, tp);
        let mut price = 100.0;
        for m in moves {
            price = (price * (1.0 + m)).max(1.0);
            let before = st.current_stop_loss.unwrap();
            if let Some(stop) = evaluate(&st, price, &cfg) {
                match side {
                    Side::Long => prop_assert!(stop > before, "long stop {} loosened from {}", stop, before),
                    Side::Short => prop_assert!(stop < before, "short stop {} loosened from {}", stop, before),
                }
                st.current_stop_loss = Some(stop);
            }
        }
        Ok(())
    }

    proptest! {
        #[test]
        fn long_stop_only_ratchets_up(moves in arb_path()) {
            run_path(Side::Long, &moves)?;
        }

        #[test]
        fn short_stop_only_ratchets_down(moves in arb_path()) {
            run_path(Side::Short, &moves)?;
        }
    }
}
