use crate::types::{Candle, Technicals, Trend};

pub const SMA_FAST: usize = 20;
pub const SMA_SLOW: usize = 50;
pub const EMA_FAST: usize = 12;
pub const EMA_SLOW: usize = 26;
pub const MACD_SIGNAL: usize = 9;
pub const RSI_PERIOD: usize = 14;
pub const BB_PERIOD: usize = 20;
pub const BB_STD_MULT: f64 = 2.0;
pub const ATR_PERIOD: usize = 20;

/// Mean of the last `period` values.
pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let window = &values[values.len() - period..];
    Some(window.iter().sum::<f64>() / period as f64)
}

/// Exponential moving average series, alpha = 2 / (span + 1), seeded with the first value.
pub fn ema_series(values: &[f64], span: usize) -> Vec<f64> {
    let alpha = 2.0 / (span as f64 + 1.0);
    let mut out = Vec::with_capacity(values.len());
    for (i, v) in values.iter().enumerate() {
        if i == 0 {
            out.push(*v);
        } else {
            let prev = out[i - 1];
            out.push(alpha * v + (1.0 - alpha) * prev);
        }
    }
    out
}

/// (MACD line, signal line) at the last bar.
pub fn macd(closes: &[f64]) -> Option<(f64, f64)> {
    if closes.len() < EMA_SLOW {
        return None;
    }
    let fast = ema_series(closes, EMA_FAST);
    let slow = ema_series(closes, EMA_SLOW);
    let line: Vec<f64> = fast.iter().zip(&slow).map(|(f, s)| f - s).collect();
    let signal = ema_series(&line, MACD_SIGNAL);
    Some((*line.last()?, *signal.last()?))
}

/// RSI from simple rolling means of gains and losses over `period` deltas.
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }
    let tail = &closes[closes.len() - period - 1..];
    let (mut gain, mut loss) = (0.0, 0.0);
    for w in tail.windows(2) {
        let delta = w[1] - w[0];
        if delta > 0.0 {
            gain += delta;
        } else {
            loss -= delta;
        }
    }
    let (gain, loss) = (gain / period as f64, loss / period as f64);
    if loss == 0.0 {
        return Some(if gain == 0.0 { 50.0 } else { 100.0 });
    }
    let rs = gain / loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

/// Bollinger bands with the sample standard deviation.
pub fn bollinger(closes: &[f64], period: usize, mult: f64) -> Option<Bands> {
    if period < 2 {
        return None;
    }
    let middle = sma(closes, period)?;
    let window = &closes[closes.len() - period..];
    let var = window.iter().map(|c| (c - middle).powi(2)).sum::<f64>() / (period - 1) as f64;
    let std = var.sqrt();
    Some(Bands { upper: middle + mult * std, middle, lower: middle - mult * std })
}

/// Average true range as a simple mean of the last `period` true ranges.
pub fn atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }
    let start = candles.len() - period - 1;
    let tr_sum: f64 = candles[start..]
        .windows(2)
        .map(|w| {
            let (prev, curr) = (&w[0], &w[1]);
            (curr.high - curr.low)
                .max((curr.high - prev.close).abs())
                .max((curr.low - prev.close).abs())
        })
        .sum();
    Some(tr_sum / period as f64)
}

/// Price above both moving averages is a strong uptrend, below both a strong
/// downtrend, anything else consolidation.
pub fn classify_trend(price: f64, sma_20: f64, sma_50: f64) -> Trend {
    if price > sma_20 && price > sma_50 {
        Trend::StrongUp
    } else if price < sma_20 && price < sma_50 {
        Trend::StrongDown
    } else {
        Trend::Consolidating
    }
}

/// Full indicator bundle at the last candle. Fields stay `None` when the
/// history is too short for them.
pub fn compute_technicals(candles: &[Candle]) -> Technicals {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let price = closes.last().copied();

    let sma_20 = sma(&closes, SMA_FAST);
    let sma_50 = sma(&closes, SMA_SLOW);
    let bands = bollinger(&closes, BB_PERIOD, BB_STD_MULT);
    let (macd_line, macd_signal) = match macd(&closes) {
        Some((l, s)) => (Some(l), Some(s)),
        None => (None, None),
    };
    let trend = match (price, sma_20, sma_50) {
        (Some(p), Some(f), Some(s)) => Some(classify_trend(p, f, s)),
        _ => None,
    };

    Technicals {
        rsi: rsi(&closes, RSI_PERIOD),
        atr: atr(candles, ATR_PERIOD),
        bb_upper: bands.map(|b| b.upper),
        bb_middle: bands.map(|b| b.middle),
        bb_lower: bands.map(|b| b.lower),
        sma_20,
        sma_50,
        macd: macd_line,
        macd_signal,
        trend,
    }
}
