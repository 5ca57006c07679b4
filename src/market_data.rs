use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use crate::bybit_api::BybitClient;
use crate::error::EngineError;
use crate::indicators::{compute_technicals, ATR_PERIOD};
use crate::types::{Candle, PriceSnapshot};

/// Candles handed to the signal provider as recent context.
const RECENT_BARS: usize = 5;
/// Fewer candles than this cannot produce bands or ATR.
pub const MIN_CANDLES: usize = ATR_PERIOD + 1;

#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    async fn snapshot(&self) -> Result<PriceSnapshot, EngineError>;
}

pub struct BybitMarketData {
    client: BybitClient,
    bar_minutes: u32,
    history_bars: usize,
}

impl BybitMarketData {
    pub fn new(client: BybitClient, bar_minutes: u32, history_bars: usize) -> Self {
        BybitMarketData { client, bar_minutes, history_bars }
    }
}

#[async_trait]
impl MarketDataProvider for BybitMarketData {
    async fn snapshot(&self) -> Result<PriceSnapshot, EngineError> {
        let candles = self
            .client
            .fetch_klines(self.bar_minutes, self.history_bars)
            .await
            .map_err(|e| EngineError::DataUnavailable(format!("klines: {}", e)))?;
        build_snapshot(&candles, Utc::now(), self.bar_minutes)
    }
}

/// Snapshot at the last candle. Rejects short or stale histories.
pub fn build_snapshot(candles: &[Candle], now: DateTime<Utc>, bar_minutes: u32) -> Result<PriceSnapshot, EngineError> {
    if candles.len() < MIN_CANDLES {
        return Err(EngineError::DataUnavailable(format!(
            "{} candles, need at least {}",
            candles.len(),
            MIN_CANDLES
        )));
    }
    let last = &candles[candles.len() - 1];
    let prev = &candles[candles.len() - 2];

    let bar_ms = i64::from(bar_minutes) * 60_000;
    let age_ms = now.timestamp_millis() - last.timestamp;
    if age_ms > 2 * bar_ms {
        return Err(EngineError::DataUnavailable(format!(
            "last bar is {}s old (limit {}s)",
            age_ms / 1000,
            2 * bar_ms / 1000
        )));
    }
    if !(last.close.is_finite() && last.close > 0.0) {
        return Err(EngineError::DataUnavailable(format!("invalid close {}", last.close)));
    }

    let price_change_pct = if prev.close > 0.0 { (last.close - prev.close) / prev.close * 100.0 } else { 0.0 };
    let timestamp = Utc.timestamp_millis_opt(last.timestamp).single().unwrap_or(now);

    Ok(PriceSnapshot {
        price: last.close,
        high: last.high,
        low: last.low,
        volume: last.volume,
        price_change_pct,
        timestamp,
        technicals: compute_technicals(candles),
        recent: candles[candles.len().saturating_sub(RECENT_BARS)..].to_vec(),
    })
}
