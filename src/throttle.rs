//! Gate on opening new positions: signal persistence, cooldown, daily quota
//! and minimum price movement, each parameterised by a volatility regime.

use chrono::{DateTime, NaiveDate, Utc};

use crate::config::{RegimeParams, ThrottleConfig};
use crate::history::SignalHistory;
use crate::types::{Direction, PriceSnapshot, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Regime {
    Low,
    Mid,
    High,
}

impl Regime {
    pub fn as_str(self) -> &'static str {
        match self {
            Regime::Low => "low",
            Regime::Mid => "mid",
            Regime::High => "high",
        }
    }
}

/// Why an open was suppressed this tick.
#[derive(Debug, Clone, PartialEq)]
pub enum ThrottleBlock {
    NotPersistent { required: usize },
    Cooldown { bars_since: i64, required: i64 },
    DailyQuota { trades_today: u32, max: u32 },
    InsufficientMove { moved: f64, required: f64 },
}

impl std::fmt::Display for ThrottleBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThrottleBlock::NotPersistent { required } => {
                write!(f, "signal not persistent ({} identical required)", required)
            }
            ThrottleBlock::Cooldown { bars_since, required } => {
                write!(f, "cooldown ({} / {} bars)", bars_since, required)
            }
            ThrottleBlock::DailyQuota { trades_today, max } => {
                write!(f, "daily quota reached ({}/{})", trades_today, max)
            }
            ThrottleBlock::InsufficientMove { moved, required } => {
                write!(f, "price moved {:.2} < {:.2} required", moved, required)
            }
        }
    }
}

/// Last-open bookkeeping. Only `record_open` mutates it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThrottleState {
    pub last_trade_timestamp: Option<DateTime<Utc>>,
    pub last_bar_index: Option<i64>,
    pub last_side: Option<Side>,
    pub last_trade_price: Option<f64>,
    pub trades_today: u32,
    pub date: Option<NaiveDate>,
}

impl ThrottleState {
    /// Trades counted for `today`; a stale date counts as zero.
    pub fn trades_on(&self, today: NaiveDate) -> u32 {
        if self.date == Some(today) {
            self.trades_today
        } else {
            0
        }
    }

    pub fn record_open(&mut self, side: Side, price: f64, now: DateTime<Utc>, bar_minutes: u32) {
        let today = now.date_naive();
        if self.date != Some(today) {
            self.date = Some(today);
            self.trades_today = 0;
        }
        self.trades_today += 1;
        self.last_trade_timestamp = Some(now);
        self.last_bar_index = Some(bar_index(now, bar_minutes));
        self.last_side = Some(side);
        self.last_trade_price = Some(price);
    }
}

/// Fixed-duration bucket number of `ts` (e.g. 15-minute bars since the epoch).
pub fn bar_index(ts: DateTime<Utc>, bar_minutes: u32) -> i64 {
    let bar_secs = i64::from(bar_minutes.max(1)) * 60;
    ts.timestamp().div_euclid(bar_secs)
}

pub struct SignalThrottle<'a> {
    cfg: &'a ThrottleConfig,
    bar_minutes: u32,
}

impl<'a> SignalThrottle<'a> {
    pub fn new(cfg: &'a ThrottleConfig, bar_minutes: u32) -> Self {
        SignalThrottle { cfg, bar_minutes }
    }

    /// ATR/price is preferred; BB width/price is the fallback. With neither
    /// available the regime is `Mid`.
    pub fn regime(&self, snapshot: &PriceSnapshot) -> Regime {
        let tech = &snapshot.technicals;
        if let Some(atr_ratio) = tech.atr_ratio(snapshot.price) {
            return bucket(atr_ratio, self.cfg.low_atr_ratio, self.cfg.high_atr_ratio);
        }
        match tech.bb_width_ratio(snapshot.price) {
            Some(width) => bucket(width, self.cfg.low_bb_width, self.cfg.high_bb_width),
            None => Regime::Mid,
        }
    }

    pub fn params(&self, regime: Regime) -> RegimeParams {
        match regime {
            Regime::Low => self.cfg.low,
            Regime::Mid => self.cfg.mid,
            Regime::High => self.cfg.high,
        }
    }

    /// Ok when every opening condition holds for `desired`. `history` must
    /// already contain the current signal.
    pub fn check(
        &self,
        desired: Direction,
        snapshot: &PriceSnapshot,
        history: &SignalHistory,
        state: &ThrottleState,
    ) -> Result<Regime, ThrottleBlock> {
        let regime = self.regime(snapshot);
        let p = self.params(regime);

        if !history.persisted(desired, p.persist) {
            return Err(ThrottleBlock::NotPersistent { required: p.persist });
        }

        if let Some(last_bar) = state.last_bar_index {
            let bars_since = bar_index(snapshot.timestamp, self.bar_minutes) - last_bar;
            if bars_since < p.cooldown_bars {
                return Err(ThrottleBlock::Cooldown { bars_since, required: p.cooldown_bars });
            }
        }

        let trades_today = state.trades_on(snapshot.timestamp.date_naive());
        if trades_today >= p.max_trades_day {
            return Err(ThrottleBlock::DailyQuota { trades_today, max: p.max_trades_day });
        }

        if let (Some(last_price), Some(atr)) = (state.last_trade_price, snapshot.technicals.atr) {
            if last_price > 0.0 && atr > 0.0 {
                let moved = (snapshot.price - last_price).abs();
                let required = p.min_move_atr * atr;
                if moved < required {
                    return Err(ThrottleBlock::InsufficientMove { moved, required });
                }
            }
        }

        Ok(regime)
    }
}

fn bucket(value: f64, low: f64, high: f64) -> Regime {
    if value < low {
        Regime::Low
    } else if value > high {
        Regime::High
    } else {
        Regime::Mid
    }
}
