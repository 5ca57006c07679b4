use serde::Deserialize;
use std::path::Path;

use crate::error::ConfigError;
use crate::types::{Confidence, InstrumentSpec, Trend};

// ─── Endpoints ────────────────────────────────────────────────────────────────
pub const BYBIT_REST_URL: &str = "https://api-demo.bybit.com";
pub const BYBIT_MARKET_URL: &str = "https://api.bybit.com";
pub const DEEPSEEK_URL: &str = "https://api.deepseek.com";
// BYBIT_API_KEY, BYBIT_SECRET, DEEPSEEK_API_KEY
// are read from environment variables at runtime (see .env.example)

pub const CONFIG_PATH_ENV: &str = "PERP_GUARD_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/engine.toml";

/// Complete engine configuration. Every section falls back to the defaults
/// below when absent from the TOML file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub engine: RunConfig,
    pub exchange: ExchangeConfig,
    pub position: PositionConfig,
    pub pyramid: PyramidConfig,
    pub leverage: LeverageConfig,
    pub stops: StopConfig,
    pub risk_reward: RiskRewardConfig,
    pub trailing: TrailingConfig,
    pub partial_tp: PartialTpConfig,
    pub throttle: ThrottleConfig,
    pub reversal: ReversalConfig,
    pub signal: SignalConfig,
}

impl EngineConfig {
    /// Load from `$PERP_GUARD_CONFIG` (or `config/engine.toml`).
    /// A missing file yields the defaults; a malformed one is an error.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        if !Path::new(&path).exists() {
            log::warn!("Config file {} not found, using built-in defaults", path);
            let cfg = EngineConfig::default();
            cfg.validate()?;
            return Ok(cfg);
        }
        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let cfg = Self::from_toml(&raw)?;
        log::info!("Loaded config from {}", path);
        Ok(cfg)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let cfg: EngineConfig = toml::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let lev = &self.leverage;
        check(lev.min_leverage > 0.0, "leverage.min_leverage must be > 0")?;
        check(lev.min_leverage <= lev.max_leverage, "leverage.min_leverage exceeds max_leverage")?;
        check(
            (lev.min_leverage..=lev.max_leverage).contains(&lev.default_leverage),
            "leverage.default_leverage outside [min_leverage, max_leverage]",
        )?;
        for (name, r) in [("high", &lev.high), ("medium", &lev.medium), ("low", &lev.low)] {
            if r.min <= 0.0 || r.min > r.max {
                return Err(ConfigError::Invalid(format!("leverage.{} range is invalid", name)));
            }
        }
        check(
            (self.leverage.min_leverage..=self.leverage.max_leverage).contains(&self.engine.initial_leverage),
            "engine.initial_leverage outside [min_leverage, max_leverage]",
        )?;

        let pos = &self.position;
        check(pos.base_allocation > 0.0, "position.base_allocation must be > 0")?;
        check(ratio(pos.max_position_ratio), "position.max_position_ratio must be in (0, 1]")?;
        check(pos.fixed_contracts > 0.0, "position.fixed_contracts must be > 0")?;

        let ex = &self.exchange;
        check(ex.contract_multiplier > 0.0, "exchange.contract_multiplier must be > 0")?;
        check(ex.lot_step > 0.0 && ex.min_lot > 0.0, "exchange lot sizes must be > 0")?;
        check(ratio(ex.margin_use_ratio), "exchange.margin_use_ratio must be in (0, 1]")?;
        check(ex.max_attempts >= 1, "exchange.max_attempts must be >= 1")?;

        let st = &self.stops;
        check(
            st.atr_floor > 0.0 && st.atr_floor <= st.atr_ceiling,
            "stops.atr_floor must be > 0 and <= atr_ceiling",
        )?;
        check(st.leverage_floor_pct > 0.0, "stops.leverage_floor_pct must be > 0")?;

        let tr = &self.trailing;
        check(tr.breakeven_threshold > 0.0, "trailing.breakeven_threshold must be > 0")?;
        check(
            tr.breakeven_threshold <= tr.lock1_threshold && tr.lock1_threshold <= tr.lock2_threshold,
            "trailing thresholds must be ascending",
        )?;
        check(tr.lock1_level <= tr.lock2_level, "trailing lock levels must be ascending")?;
        // A lock at or past its threshold would put the stop beyond the price that armed it.
        check(tr.lock1_level < tr.lock1_threshold, "trailing.lock1_level must be < lock1_threshold")?;
        check(tr.lock2_level < tr.lock2_threshold, "trailing.lock2_level must be < lock2_threshold")?;

        let tp = &self.partial_tp;
        check(ratio(tp.tp1_ratio) && ratio(tp.tp2_ratio), "partial_tp ratios must be in (0, 1]")?;
        check(tp.tp1_ratio + tp.tp2_ratio < 1.0, "partial_tp.tp1_ratio + tp2_ratio must be < 1")?;
        check(
            (tp.tp1_ratio + tp.tp2_ratio + tp.tp3_ratio - 1.0).abs() < 1e-9,
            "partial_tp ratios must sum to 1",
        )?;
        check(tp.tp1_rr_multiplier < tp.tp2_rr_multiplier, "partial_tp rr multipliers must ascend")?;

        let th = &self.throttle;
        check(th.low_atr_ratio <= th.high_atr_ratio, "throttle ATR thresholds inverted")?;
        check(th.low_bb_width <= th.high_bb_width, "throttle BB thresholds inverted")?;
        for (name, r) in [("low", &th.low), ("mid", &th.mid), ("high", &th.high)] {
            if r.persist == 0 {
                return Err(ConfigError::Invalid(format!("throttle.{}.persist must be >= 1", name)));
            }
        }

        check(self.pyramid.amount_ratio > 0.0, "pyramid.amount_ratio must be > 0")?;
        check(self.engine.bar_minutes > 0, "engine.bar_minutes must be > 0")?;
        check(self.signal.history_len >= 3, "signal.history_len must be >= 3")?;
        check(self.signal.max_attempts >= 1, "signal.max_attempts must be >= 1")?;
        check(self.reversal.oscillation_window >= 2, "reversal.oscillation_window must be >= 2")?;
        Ok(())
    }
}

fn check(cond: bool, msg: &str) -> Result<(), ConfigError> {
    if cond {
        Ok(())
    } else {
        Err(ConfigError::Invalid(msg.to_string()))
    }
}

fn ratio(v: f64) -> bool {
    v > 0.0 && v <= 1.0
}

// ─── Run loop / instrument ────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub symbol: String,
    pub bar_minutes: u32,
    /// Bars fetched per tick (96 × 15m = 24h).
    pub history_bars: usize,
    /// Log order intents instead of sending them.
    pub dry_run: bool,
    /// Two-way position mode (separate long/short legs).
    pub hedge_mode: bool,
    /// Leverage set once at startup, before the first trade.
    pub initial_leverage: f64,
    /// Pause after an internal-invariant failure before the next tick.
    pub error_cooldown_secs: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            symbol: "BTCUSDT".to_string(),
            bar_minutes: 15,
            history_bars: 96,
            dry_run: false,
            hedge_mode: true,
            initial_leverage: 5.0,
            error_cooldown_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub rest_url: String,
    pub market_url: String,
    /// Base-asset units per contract (Bybit linear: 1 contract = 1 coin).
    pub contract_multiplier: f64,
    pub lot_step: f64,
    pub min_lot: f64,
    /// Leverage changes at or below this size are not sent to the exchange.
    pub leverage_tolerance: f64,
    /// Largest fraction of free balance a new entry may commit as margin.
    pub margin_use_ratio: f64,
    pub max_attempts: u32,
    pub timeout_secs: u64,
}

impl ExchangeConfig {
    /// Configured lot rules; replaced by instruments-info when the exchange answers.
    pub fn instrument_spec(&self) -> InstrumentSpec {
        InstrumentSpec {
            lot_step: self.lot_step,
            min_lot: self.min_lot,
            contract_multiplier: self.contract_multiplier,
        }
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        ExchangeConfig {
            rest_url: BYBIT_REST_URL.to_string(),
            market_url: BYBIT_MARKET_URL.to_string(),
            contract_multiplier: 1.0,
            lot_step: 0.001,
            min_lot: 0.001,
            leverage_tolerance: 0.5,
            margin_use_ratio: 0.8,
            max_attempts: 2,
            timeout_secs: 10,
        }
    }
}

// ─── Sizing ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PositionConfig {
    pub enable_intelligent_position: bool,
    /// USDT committed per entry before multipliers.
    pub base_allocation: f64,
    pub high_confidence_multiplier: f64,
    pub medium_confidence_multiplier: f64,
    pub low_confidence_multiplier: f64,
    pub max_position_ratio: f64,
    pub trend_strength_multiplier: f64,
    pub rsi_extreme_high: f64,
    pub rsi_extreme_low: f64,
    pub rsi_extreme_multiplier: f64,
    /// Contracts used when intelligent sizing is disabled.
    pub fixed_contracts: f64,
}

impl PositionConfig {
    pub fn confidence_multiplier(&self, confidence: Confidence) -> f64 {
        match confidence {
            Confidence::High => self.high_confidence_multiplier,
            Confidence::Medium => self.medium_confidence_multiplier,
            Confidence::Low => self.low_confidence_multiplier,
        }
    }
}

impl Default for PositionConfig {
    fn default() -> Self {
        PositionConfig {
            enable_intelligent_position: true,
            base_allocation: 70.0,
            high_confidence_multiplier: 1.3,
            medium_confidence_multiplier: 1.0,
            low_confidence_multiplier: 0.6,
            max_position_ratio: 0.9,
            trend_strength_multiplier: 1.5,
            rsi_extreme_high: 75.0,
            rsi_extreme_low: 25.0,
            rsi_extreme_multiplier: 0.7,
            fixed_contracts: 0.01,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PyramidConfig {
    pub enable_pyramid: bool,
    pub threshold: f64,
    pub amount_ratio: f64,
    pub max_times: u32,
}

impl Default for PyramidConfig {
    fn default() -> Self {
        PyramidConfig { enable_pyramid: true, threshold: 0.05, amount_ratio: 0.3, max_times: 2 }
    }
}

// ─── Leverage ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct LeverageRange {
    pub min: f64,
    pub max: f64,
}

impl LeverageRange {
    pub fn midpoint(&self) -> f64 {
        (self.min + self.max) / 2.0
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LeverageConfig {
    pub enable_dynamic_leverage: bool,
    pub high: LeverageRange,
    pub medium: LeverageRange,
    pub low: LeverageRange,
    pub low_volatility_bb_width: f64,
    pub high_volatility_bb_width: f64,
    pub low_volatility_multiplier: f64,
    pub high_volatility_multiplier: f64,
    pub oversold_rsi: f64,
    pub overbought_rsi: f64,
    pub oversold_multiplier: f64,
    pub overbought_multiplier: f64,
    pub min_leverage: f64,
    pub max_leverage: f64,
    /// Returned whenever the dynamic computation cannot be completed.
    pub default_leverage: f64,
}

impl LeverageConfig {
    pub fn range(&self, confidence: Confidence) -> LeverageRange {
        match confidence {
            Confidence::High => self.high,
            Confidence::Medium => self.medium,
            Confidence::Low => self.low,
        }
    }
}

impl Default for LeverageConfig {
    fn default() -> Self {
        LeverageConfig {
            enable_dynamic_leverage: true,
            high: LeverageRange { min: 6.0, max: 8.0 },
            medium: LeverageRange { min: 4.0, max: 6.0 },
            low: LeverageRange { min: 2.0, max: 3.0 },
            low_volatility_bb_width: 0.02,
            high_volatility_bb_width: 0.05,
            low_volatility_multiplier: 1.15,
            high_volatility_multiplier: 0.85,
            oversold_rsi: 30.0,
            overbought_rsi: 70.0,
            oversold_multiplier: 1.1,
            overbought_multiplier: 0.9,
            min_leverage: 2.0,
            max_leverage: 8.0,
            default_leverage: 5.0,
        }
    }
}

// ─── Stop-loss / take-profit ──────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StopConfig {
    pub atr_multiplier: f64,
    pub atr_floor: f64,
    pub atr_ceiling: f64,
    /// Stop ratio used when ATR is unavailable.
    pub default_ratio: f64,
    /// Stop ratio is never tighter than this divided by leverage.
    pub leverage_floor_pct: f64,
    pub high_confidence_multiplier: f64,
    pub medium_confidence_multiplier: f64,
    pub low_confidence_multiplier: f64,
    pub wide_band_width: f64,
    pub wide_band_multiplier: f64,
    pub narrow_band_width: f64,
    pub narrow_band_multiplier: f64,
}

impl StopConfig {
    pub fn confidence_multiplier(&self, confidence: Confidence) -> f64 {
        match confidence {
            Confidence::High => self.high_confidence_multiplier,
            Confidence::Medium => self.medium_confidence_multiplier,
            Confidence::Low => self.low_confidence_multiplier,
        }
    }
}

impl Default for StopConfig {
    fn default() -> Self {
        StopConfig {
            atr_multiplier: 2.5,
            atr_floor: 0.005,
            atr_ceiling: 0.03,
            default_ratio: 0.015,
            leverage_floor_pct: 0.02,
            high_confidence_multiplier: 0.8,
            medium_confidence_multiplier: 1.0,
            low_confidence_multiplier: 1.2,
            wide_band_width: 0.05,
            wide_band_multiplier: 1.3,
            narrow_band_width: 0.02,
            narrow_band_multiplier: 0.8,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskRewardConfig {
    pub enable_dynamic_rr: bool,
    pub trend_bullish: f64,
    pub trend_bearish: f64,
    pub trend_consolidation: f64,
    pub default: f64,
    /// Below this the levels are still accepted but a warning is logged.
    pub warn_below: f64,
}

impl RiskRewardConfig {
    pub fn for_trend(&self, trend: Option<Trend>) -> f64 {
        match trend {
            Some(Trend::StrongUp) => self.trend_bullish,
            Some(Trend::StrongDown) => self.trend_bearish,
            Some(Trend::Consolidating) => self.trend_consolidation,
            None => self.default,
        }
    }
}

impl Default for RiskRewardConfig {
    fn default() -> Self {
        RiskRewardConfig {
            enable_dynamic_rr: true,
            trend_bullish: 5.0,
            trend_bearish: 5.0,
            trend_consolidation: 1.5,
            default: 3.0,
            warn_below: 1.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrailingConfig {
    pub enable_trailing_stop: bool,
    pub breakeven_threshold: f64,
    pub lock1_threshold: f64,
    pub lock1_level: f64,
    pub lock2_threshold: f64,
    pub lock2_level: f64,
}

impl Default for TrailingConfig {
    fn default() -> Self {
        TrailingConfig {
            enable_trailing_stop: true,
            breakeven_threshold: 0.05,
            lock1_threshold: 0.10,
            lock1_level: 0.03,
            lock2_threshold: 0.20,
            lock2_level: 0.10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PartialTpConfig {
    pub enable_partial_tp: bool,
    pub tp1_ratio: f64,
    pub tp1_rr_multiplier: f64,
    pub tp2_ratio: f64,
    pub tp2_rr_multiplier: f64,
    /// Share left running for trailing-stop / reversal exits.
    pub tp3_ratio: f64,
}

impl Default for PartialTpConfig {
    fn default() -> Self {
        PartialTpConfig {
            enable_partial_tp: true,
            tp1_ratio: 0.3,
            tp1_rr_multiplier: 1.5,
            tp2_ratio: 0.3,
            tp2_rr_multiplier: 2.5,
            tp3_ratio: 0.4,
        }
    }
}

// ─── Throttle ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct RegimeParams {
    /// Consecutive identical signals required.
    pub persist: usize,
    pub cooldown_bars: i64,
    /// Minimum distance from the last trade price, in ATRs.
    pub min_move_atr: f64,
    pub max_trades_day: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub low_bb_width: f64,
    pub high_bb_width: f64,
    pub low_atr_ratio: f64,
    pub high_atr_ratio: f64,
    pub low: RegimeParams,
    pub mid: RegimeParams,
    pub high: RegimeParams,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        ThrottleConfig {
            low_bb_width: 0.02,
            high_bb_width: 0.05,
            low_atr_ratio: 0.015,
            high_atr_ratio: 0.03,
            low: RegimeParams { persist: 3, cooldown_bars: 6, min_move_atr: 1.0, max_trades_day: 2 },
            mid: RegimeParams { persist: 2, cooldown_bars: 4, min_move_atr: 0.8, max_trades_day: 5 },
            high: RegimeParams { persist: 1, cooldown_bars: 3, min_move_atr: 1.2, max_trades_day: 6 },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReversalConfig {
    /// Non-hold signals inspected for oscillation.
    pub oscillation_window: usize,
    /// Direction changes within the window that count as oscillation.
    pub max_direction_changes: usize,
}

impl Default for ReversalConfig {
    fn default() -> Self {
        ReversalConfig { oscillation_window: 4, max_direction_changes: 2 }
    }
}

// ─── Signal provider ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParsePolicy {
    /// Accept only well-formed JSON.
    Strict,
    /// Attempt quote/key/trailing-comma repair before rejecting.
    Repair,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    pub base_url: String,
    pub model: String,
    pub temperature: f64,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub parse_policy: ParsePolicy,
    pub history_len: usize,
}

impl Default for SignalConfig {
    fn default() -> Self {
        SignalConfig {
            base_url: DEEPSEEK_URL.to_string(),
            model: "deepseek-chat".to_string(),
            temperature: 0.3,
            timeout_secs: 30,
            max_attempts: 2,
            parse_policy: ParsePolicy::Strict,
            history_len: 30,
        }
    }
}

// ─── Capabilities ─────────────────────────────────────────────────────────────

/// Feature switches resolved once per tick and handed to every engine call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub dynamic_leverage: bool,
    pub intelligent_sizing: bool,
    pub dynamic_rr: bool,
    pub trailing_stop: bool,
    pub pyramid: bool,
    pub partial_tp: bool,
}

impl Capabilities {
    pub fn resolve(cfg: &EngineConfig) -> Self {
        Capabilities {
            dynamic_leverage: cfg.leverage.enable_dynamic_leverage,
            intelligent_sizing: cfg.position.enable_intelligent_position,
            dynamic_rr: cfg.risk_reward.enable_dynamic_rr,
            trailing_stop: cfg.trailing.enable_trailing_stop,
            pyramid: cfg.pyramid.enable_pyramid,
            partial_tp: cfg.partial_tp.enable_partial_tp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn shipped_config_parses() {
        let cfg = EngineConfig::from_toml(include_str!("../config/engine.toml")).unwrap();
        assert!(cfg.engine.dry_run);
        assert_eq!(cfg.leverage.high.max, 8.0);
        assert_eq!(cfg.throttle.high.persist, 1);
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let cfg = EngineConfig::from_toml(
            r#"
            [engine]
            symbol = "ETHUSDT"
            dry_run = true

            [leverage]
            max_leverage = 6.0

            [throttle.low]
            persist = 4
            cooldown_bars = 8
            min_move_atr = 1.5
            max_trades_day = 1
            "#,
        )
        .unwrap();
        assert_eq!(cfg.engine.symbol, "ETHUSDT");
        assert!(cfg.engine.dry_run);
        assert_eq!(cfg.engine.bar_minutes, 15);
        assert_eq!(cfg.leverage.max_leverage, 6.0);
        assert_eq!(cfg.leverage.min_leverage, 2.0);
        assert_eq!(cfg.throttle.low.persist, 4);
        assert_eq!(cfg.throttle.mid.persist, 2);
        assert_eq!(cfg.signal.parse_policy, ParsePolicy::Strict);
    }

    #[test]
    fn rejects_default_leverage_outside_bounds() {
        let err = EngineConfig::from_toml(
            r#"
            [leverage]
            default_leverage = 12.0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_partial_tp_ratios_over_one() {
        let mut cfg = EngineConfig::default();
        cfg.partial_tp.tp1_ratio = 0.6;
        cfg.partial_tp.tp2_ratio = 0.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_runner_share_that_does_not_add_up() {
        let mut cfg = EngineConfig::default();
        cfg.partial_tp.tp3_ratio = 0.3;
        assert!(cfg.validate().is_err());

        cfg.partial_tp.tp2_ratio = 0.4;
        cfg.validate().unwrap();
    }

    #[test]
    fn rejects_trailing_lock_at_or_above_its_threshold() {
        let err = EngineConfig::from_toml(
            r#"
            [trailing]
            lock1_threshold = 0.10
            lock1_level = 0.10
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref m) if m.contains("lock1_level")));

        let mut cfg = EngineConfig::default();
        cfg.trailing.lock2_level = 0.25;
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.trailing.breakeven_threshold = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parse_policy_from_toml() {
        let cfg = EngineConfig::from_toml("[signal]\nparse_policy = \"repair\"\n").unwrap();
        assert_eq!(cfg.signal.parse_policy, ParsePolicy::Repair);
    }

    #[test]
    fn capabilities_follow_enable_flags() {
        let mut cfg = EngineConfig::default();
        cfg.pyramid.enable_pyramid = false;
        cfg.trailing.enable_trailing_stop = false;
        let caps = Capabilities::resolve(&cfg);
        assert!(!caps.pyramid);
        assert!(!caps.trailing_stop);
        assert!(caps.partial_tp);
    }
}
