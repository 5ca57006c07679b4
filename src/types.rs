use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: i64, // open time, unix ms
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    StrongUp,
    StrongDown,
    Consolidating,
}

impl Trend {
    pub fn is_strong(self) -> bool {
        matches!(self, Trend::StrongUp | Trend::StrongDown)
    }

    /// True when the trend is strongly directional toward `side`.
    pub fn favors(self, side: Side) -> bool {
        matches!(
            (self, side),
            (Trend::StrongUp, Side::Long) | (Trend::StrongDown, Side::Short)
        )
    }
}

/// Indicator bundle computed by the market-data collaborator.
/// Any field may be missing when the history is too short.
#[derive(Clone, Debug, Default)]
pub struct Technicals {
    pub rsi: Option<f64>,
    pub atr: Option<f64>,
    pub bb_upper: Option<f64>,
    pub bb_middle: Option<f64>,
    pub bb_lower: Option<f64>,
    pub sma_20: Option<f64>,
    pub sma_50: Option<f64>,
    pub macd: Option<f64>,
    pub macd_signal: Option<f64>,
    pub trend: Option<Trend>,
}

impl Technicals {
    /// Bollinger band width as a fraction of `price`.
    pub fn bb_width_ratio(&self, price: f64) -> Option<f64> {
        match (self.bb_upper, self.bb_lower) {
            (Some(upper), Some(lower)) if price > 0.0 && upper > 0.0 && lower > 0.0 => {
                Some((upper - lower) / price)
            }
            _ => None,
        }
    }

    /// ATR as a fraction of `price`.
    pub fn atr_ratio(&self, price: f64) -> Option<f64> {
        match self.atr {
            Some(atr) if atr > 0.0 && price > 0.0 => Some(atr / price),
            _ => None,
        }
    }

    pub fn trend_is_strong(&self) -> bool {
        self.trend.map_or(false, Trend::is_strong)
    }

    pub fn trend_favors(&self, side: Side) -> bool {
        self.trend.map_or(false, |t| t.favors(side))
    }
}

#[derive(Clone, Debug)]
pub struct PriceSnapshot {
    pub price: f64,
    pub high: f64,
    pub low: f64,
    pub volume: f64,
    pub price_change_pct: f64,
    pub timestamp: DateTime<Utc>,
    pub technicals: Technicals,
    /// Last few bars, oldest first. Only used to brief the signal provider.
    pub recent: Vec<Candle>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Buy,
    Sell,
    Hold,
}

impl Direction {
    pub fn side(self) -> Option<Side> {
        match self {
            Direction::Buy => Some(Side::Long),
            Direction::Sell => Some(Side::Short),
            Direction::Hold => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Buy => "BUY",
            Direction::Sell => "SELL",
            Direction::Hold => "HOLD",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

#[derive(Clone, Debug)]
pub struct Signal {
    pub direction: Direction,
    pub confidence: Confidence,
    pub stop_loss: Option<f64>,   // advisory only
    pub take_profit: Option<f64>, // advisory only
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    pub is_fallback: bool,
}

impl Signal {
    /// Conservative HOLD/LOW signal substituted when the provider fails.
    pub fn fallback(price: f64, timestamp: DateTime<Utc>) -> Self {
        let price = if price.is_finite() && price > 0.0 { price } else { 0.0 };
        Signal {
            direction: Direction::Hold,
            confidence: Confidence::Low,
            stop_loss: Some(price * 0.98),
            take_profit: Some(price * 1.02),
            reason: "signal provider unavailable, holding".to_string(),
            timestamp,
            is_fallback: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    /// +1 for long, -1 for short.
    pub fn sign(self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }

    /// Price move in the position's favour, in quote units.
    pub fn favorable_move(self, entry: f64, price: f64) -> f64 {
        (price - entry) * self.sign()
    }

    /// Unrealized P&L as a fraction of entry. Zero for a non-positive entry.
    pub fn pnl_pct(self, entry: f64, price: f64) -> f64 {
        if entry <= 0.0 {
            return 0.0;
        }
        self.favorable_move(entry, price) / entry
    }
}

/// Live position as reported by the exchange.
#[derive(Clone, Debug, PartialEq)]
pub struct Position {
    pub side: Side,
    pub size: f64,
    pub entry_price: f64,
    pub leverage: f64,
    pub unrealized_pnl: f64,
}

/// Lot rules for the traded contract, filled from instruments-info at startup.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct InstrumentSpec {
    pub lot_step: f64,
    pub min_lot: f64,
    /// Base-asset units per contract.
    pub contract_multiplier: f64,
}

impl InstrumentSpec {
    /// Round down to a whole number of lot steps.
    pub fn round_down(&self, qty: f64) -> f64 {
        if !(qty.is_finite() && qty > 0.0) || self.lot_step <= 0.0 {
            return 0.0;
        }
        let steps = (qty / self.lot_step + 1e-9).floor();
        steps * self.lot_step
    }

    pub fn notional(&self, qty: f64, price: f64) -> f64 {
        qty * price * self.contract_multiplier
    }
}
