#[cfg(feature = "jemalloc")]
use tikv_jemallocator::Jemalloc;
#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[cfg(feature = "jemalloc")]
fn jemalloc_purge() {
    use tikv_jemalloc_ctl::epoch;
    // Advancing the epoch makes jemalloc re-evaluate decay and release dirty pages.
    if let Ok(e) = epoch::mib() {
        let _ = e.advance();
    }
    log::debug!("jemalloc: epoch advanced, dirty pages scheduled for release");
}

mod bybit_api;
mod config;
mod controller;
mod error;
mod exchange;
mod history;
mod indicators;
mod leverage;
mod market_data;
mod partial_tp;
mod position_manager;
mod pyramid;
mod reversal;
mod risk_levels;
mod signal_provider;
mod sizing;
mod throttle;
mod trailing;
mod types;

use chrono::{DateTime, Utc};
use std::time::Duration;

use bybit_api::BybitClient;
use config::EngineConfig;
use controller::{Controller, TickOutcome};
use exchange::{DryRunGateway, ExchangeGateway};
use market_data::{BybitMarketData, MarketDataProvider};
use signal_provider::{DeepSeekClient, SignalProvider};

/// Seconds after a bar boundary before the next tick, so the new bar exists.
const BAR_SETTLE_SECS: i64 = 5;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let cfg = EngineConfig::load()?;
    let bybit = BybitClient::new(&cfg)?;
    let market = BybitMarketData::new(bybit.clone(), cfg.engine.bar_minutes, cfg.engine.history_bars);
    let signals = DeepSeekClient::new(&cfg.signal, &cfg.engine.symbol)?;

    log::info!(
        "perp_guard started: {} {}m bars, hedge_mode={}, dry_run={}",
        cfg.engine.symbol,
        cfg.engine.bar_minutes,
        cfg.engine.hedge_mode,
        cfg.engine.dry_run
    );

    if cfg.engine.dry_run {
        let symbol = cfg.engine.symbol.clone();
        run_loop(Controller::new(cfg, DryRunGateway::new(bybit, &symbol)), &market, &signals).await;
    } else {
        run_loop(Controller::new(cfg, bybit), &market, &signals).await;
    }

    log::info!("perp_guard stopped");
    Ok(())
}

async fn run_loop<G: ExchangeGateway>(
    mut ctl: Controller<G>,
    market: &dyn MarketDataProvider,
    signals: &dyn SignalProvider,
) {
    ctl.startup().await;
    let symbol = ctl.config().engine.symbol.clone();
    let bar_minutes = ctl.config().engine.bar_minutes;
    let cooldown = Duration::from_secs(ctl.config().engine.error_cooldown_secs);

    loop {
        // ── Tick ─────────────────────────────────────────────────────────────
        let mut pause = until_next_bar(Utc::now(), bar_minutes);
        match ctl.tick(market, signals).await {
            Ok(TickOutcome::Idle) => log::info!("[{}] Flat, no signal to act on", symbol),
            Ok(outcome) => log::info!("[{}] Tick: {:?}", symbol, outcome),
            Err(e) if e.needs_cooldown() => {
                log::error!("[{}] {}. Pausing {}s", symbol, e, cooldown.as_secs());
                pause = pause.max(cooldown);
            }
            Err(e) => log::warn!("[{}] Tick aborted: {}", symbol, e),
        }

        #[cfg(feature = "jemalloc")]
        jemalloc_purge();

        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = tokio::signal::ctrl_c() => {
                log::info!("[{}] Shutdown requested", symbol);
                return;
            }
        }
    }
}

/// Time left until `BAR_SETTLE_SECS` past the next bar boundary.
fn until_next_bar(now: DateTime<Utc>, bar_minutes: u32) -> Duration {
    let bar_secs = i64::from(bar_minutes.max(1)) * 60;
    let next = (now.timestamp().div_euclid(bar_secs) + 1) * bar_secs + BAR_SETTLE_SECS;
    Duration::from_secs((next - now.timestamp()).max(1) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn waits_for_the_next_bar_boundary() {
        let now = Utc.with_ymd_and_hms(2025, 3, 10, 12, 7, 30).unwrap();
        assert_eq!(until_next_bar(now, 15), Duration::from_secs(7 * 60 + 30 + 5));
        let on_boundary = Utc.with_ymd_and_hms(2025, 3, 10, 12, 15, 0).unwrap();
        assert_eq!(until_next_bar(on_boundary, 15), Duration::from_secs(15 * 60 + 5));
    }
}
