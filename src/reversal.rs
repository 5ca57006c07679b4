use crate::config::ReversalConfig;
use crate::history::SignalHistory;
use crate::types::{Confidence, Side, Signal, Technicals};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReversalDecision {
    /// Keep the held position.
    Hold(&'static str),
    /// Close fully and reopen on the signal's side.
    Flip,
}

/// Arbitrates an opposite-direction signal against the held `side`.
/// `history` must already include `signal`; `persistence` is the current
/// regime's required run of identical signals.
pub fn decide(
    held: Side,
    signal: &Signal,
    tech: &Technicals,
    history: &SignalHistory,
    persistence: usize,
    cfg: &ReversalConfig,
) -> ReversalDecision {
    let new_side = match signal.direction.side() {
        Some(side) if side != held => side,
        _ => return ReversalDecision::Hold("signal is not opposite to the position"),
    };

    match signal.confidence {
        Confidence::Low => ReversalDecision::Hold("low confidence"),
        Confidence::Medium => {
            if tech.trend_favors(new_side) {
                ReversalDecision::Flip
            } else {
                ReversalDecision::Hold("medium confidence without a strong trend")
            }
        }
        Confidence::High => {
            if history.persisted(signal.direction, persistence) {
                return ReversalDecision::Flip;
            }
            if history.direction_changes(cfg.oscillation_window) >= cfg.max_direction_changes {
                ReversalDecision::Hold("signals oscillating")
            } else {
                ReversalDecision::Flip
            }
        }
    }
}
