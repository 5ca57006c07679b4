//! Per-tick decision loop for one instrument. The controller is the single
//! owner of position, throttle and signal-history state.

use chrono::Utc;

use crate::config::{Capabilities, EngineConfig};
use crate::error::{EngineError, ExchangeError};
use crate::exchange::{ConditionalOrder, ExchangeGateway, OrderParams, OrderSide, TriggerKind};
use crate::history::SignalHistory;
use crate::leverage::select_leverage;
use crate::market_data::MarketDataProvider;
use crate::partial_tp::{self, TpAction};
use crate::position_manager::PositionRiskState;
use crate::pyramid;
use crate::reversal::{self, ReversalDecision};
use crate::risk_levels::{calculate_risk_levels, validate_levels, RiskLevels};
use crate::signal_provider::SignalProvider;
use crate::sizing::{calculate_position_size, check_margin};
use crate::throttle::{SignalThrottle, ThrottleState};
use crate::trailing;
use crate::types::{Confidence, InstrumentSpec, Position, PriceSnapshot, Side, Signal};

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Flat and nothing to do.
    Idle,
    /// An open was blocked (throttle, confidence policy).
    Suppressed(String),
    Opened { side: Side, qty: f64, leverage: f64 },
    /// Positioned; trailing, partial TP and pyramiding ran.
    Managed,
    /// Opposite signal rejected by the reversal guard.
    HeldAgainstSignal(&'static str),
    Flipped { from: Side, reopened: bool },
}

pub struct Controller<G> {
    cfg: EngineConfig,
    gateway: G,
    spec: InstrumentSpec,
    state: Option<PositionRiskState>,
    throttle: ThrottleState,
    history: SignalHistory,
    /// Leverage currently applied on the exchange.
    leverage: f64,
}

impl<G: ExchangeGateway> Controller<G> {
    pub fn new(cfg: EngineConfig, gateway: G) -> Self {
        let spec = cfg.exchange.instrument_spec();
        let history = SignalHistory::new(cfg.signal.history_len);
        let leverage = cfg.engine.initial_leverage;
        Controller {
            cfg,
            gateway,
            spec,
            state: None,
            throttle: ThrottleState::default(),
            history,
            leverage,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    #[cfg(test)]
    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    #[cfg(test)]
    pub fn state(&self) -> Option<&PositionRiskState> {
        self.state.as_ref()
    }

    fn symbol(&self) -> &str {
        &self.cfg.engine.symbol
    }

    /// One-time exchange setup. Every step is best-effort.
    pub async fn startup(&mut self) {
        let symbol = self.cfg.engine.symbol.clone();

        match self.gateway.instrument_spec().await {
            Ok(spec) => {
                log::info!("[{}] Lot step {} / min qty {}", symbol, spec.lot_step, spec.min_lot);
                self.spec = spec;
            }
            Err(e) => log::warn!("[{}] instruments-info failed, using configured lot sizes: {}", symbol, e),
        }

        if self.cfg.engine.hedge_mode {
            if let Err(e) = self.gateway.ensure_hedge_mode().await {
                log::warn!("[{}] Could not enable hedge mode: {}", symbol, e);
            }
        }

        let initial = self.cfg.engine.initial_leverage;
        match self.gateway.set_leverage(initial).await {
            Ok(()) => self.leverage = initial,
            Err(e) => log::warn!("[{}] Initial leverage {:.1}x not applied: {}", symbol, initial, e),
        }

        match self.gateway.get_balance().await {
            Ok(b) => log::info!("[{}] Available balance {:.2} USDT", symbol, b),
            Err(e) => log::warn!("[{}] Balance unavailable at startup: {}", symbol, e),
        }
    }

    /// Fetches the snapshot, position and signal, then runs `process`.
    pub async fn tick(
        &mut self,
        market: &dyn MarketDataProvider,
        signals: &dyn SignalProvider,
    ) -> Result<TickOutcome, EngineError> {
        let snapshot = market.snapshot().await?;
        let live = self
            .gateway
            .get_position()
            .await
            .map_err(|e| EngineError::exchange("get_position", e))?;

        let signal = match signals.signal(&snapshot, live.as_ref()).await {
            Ok(s) => s,
            Err(e) => {
                log::warn!("[{}] {}, using fallback HOLD signal", self.symbol(), e);
                Signal::fallback(snapshot.price, Utc::now())
            }
        };
        self.process(&snapshot, signal, live).await
    }

    pub async fn process(
        &mut self,
        snapshot: &PriceSnapshot,
        signal: Signal,
        live: Option<Position>,
    ) -> Result<TickOutcome, EngineError> {
        let caps = Capabilities::resolve(&self.cfg);
        self.history.push(signal.direction);
        self.reconcile(live.as_ref()).await;

        let outcome = match live {
            None => self.try_open(snapshot, &signal, caps).await?,
            Some(pos) => self.manage(snapshot, &signal, &pos, caps).await?,
        };

        if let Some(st) = &self.state {
            st.check_invariants(&self.cfg.pyramid)?;
        }
        Ok(outcome)
    }

    /// Aligns local state with the exchange position.
    async fn reconcile(&mut self, live: Option<&Position>) {
        let symbol = self.cfg.engine.symbol.clone();
        match (live, self.state.as_ref()) {
            (None, Some(st)) => {
                log::info!(
                    "[{}] {} position closed on exchange (stop/target), resetting state",
                    symbol,
                    st.side.as_str()
                );
                self.state = None;
                self.cancel_protective_orders().await;
            }
            (Some(pos), None) => {
                log::warn!(
                    "[{}] Untracked {} position {} @ {:.2}: recovering with no stop history",
                    symbol,
                    pos.side.as_str(),
                    pos.size,
                    pos.entry_price
                );
                self.state = Some(PositionRiskState::recovered(pos));
            }
            (Some(pos), Some(st)) if st.side != pos.side => {
                log::warn!("[{}] Exchange side {} differs from state, recovering", symbol, pos.side.as_str());
                self.state = Some(PositionRiskState::recovered(pos));
            }
            _ => {}
        }
        if let Some(pos) = live {
            if pos.leverage > 0.0 {
                self.leverage = pos.leverage;
            }
        }
    }

    // ── Flat: opening pipeline ───────────────────────────────────────────────

    async fn try_open(
        &mut self,
        snapshot: &PriceSnapshot,
        signal: &Signal,
        caps: Capabilities,
    ) -> Result<TickOutcome, EngineError> {
        let symbol = self.cfg.engine.symbol.clone();
        let side = match signal.direction.side() {
            Some(s) => s,
            None => return Ok(TickOutcome::Idle),
        };
        let tech = &snapshot.technicals;

        let throttle = SignalThrottle::new(&self.cfg.throttle, self.cfg.engine.bar_minutes);
        match throttle.check(signal.direction, snapshot, &self.history, &self.throttle) {
            Ok(regime) => log::debug!("[{}] Throttle passed ({} volatility)", symbol, regime.as_str()),
            Err(block) => {
                log::info!("[{}] {} open suppressed: {}", symbol, side.as_str(), block);
                return Ok(TickOutcome::Suppressed(block.to_string()));
            }
        }

        if signal.confidence == Confidence::Low && !tech.trend_favors(side) {
            log::info!("[{}] LOW confidence {} without a strong trend, not opening", symbol, side.as_str());
            return Ok(TickOutcome::Suppressed("low confidence without trend".to_string()));
        }

        let balance = self
            .gateway
            .get_balance()
            .await
            .map_err(|e| EngineError::exchange("get_balance", e))?;

        // Plan at the wanted leverage; the exchange is only touched once the plan holds.
        let wanted = select_leverage(
            &symbol,
            signal.confidence,
            tech,
            snapshot.price,
            &self.cfg.leverage,
            caps.dynamic_leverage,
        );
        let change = (wanted - self.leverage).abs() > self.cfg.exchange.leverage_tolerance;
        let planned_at = if change { wanted } else { self.leverage };
        let mut plan = self.plan_entry(side, snapshot, signal, balance, planned_at, caps)?;

        if change {
            match self.gateway.set_leverage(wanted).await {
                Ok(()) => {
                    log::info!("[{}] Leverage {:.1}x → {:.1}x", symbol, self.leverage, wanted);
                    self.leverage = wanted;
                }
                Err(e) => {
                    log::warn!(
                        "[{}] set_leverage {:.1}x failed, keeping {:.1}x: {}",
                        symbol, wanted, self.leverage, e
                    );
                    plan = self.plan_entry(side, snapshot, signal, balance, self.leverage, caps)?;
                }
            }
        }
        let EntryPlan { leverage, qty, margin, levels } = plan;

        log::info!(
            "[{}] Opening {} qty={} @ {:.2} lev={:.1}x margin={:.2} SL={:.2} TP={:.2} RR={:.1}",
            symbol,
            side.as_str(),
            qty,
            snapshot.price,
            leverage,
            margin,
            levels.stop_loss,
            levels.take_profit,
            levels.risk_reward
        );

        let order_side = OrderSide::opening(side);
        let protected = OrderParams::open(side).with_protection(levels.stop_loss, levels.take_profit);
        let separate = match self.gateway.place_market_order(order_side, qty, &protected).await {
            Ok(_) => false,
            Err(e) if !e.is_retryable() => {
                log::warn!("[{}] Entry with attached SL/TP rejected ({}), placing them separately", symbol, e);
                self.gateway
                    .place_market_order(order_side, qty, &OrderParams::open(side))
                    .await
                    .map_err(|e| EngineError::exchange("place_market_order", e))?;
                self.place_protection(side, qty, levels.stop_loss, levels.take_profit).await;
                true
            }
            Err(e) => return Err(EngineError::exchange("place_market_order", e)),
        };

        self.throttle
            .record_open(side, snapshot.price, snapshot.timestamp, self.cfg.engine.bar_minutes);
        let mut st = PositionRiskState::opened(side, snapshot.price, levels.stop_loss, levels.take_profit);
        st.conditional_protection = separate;
        self.state = Some(st);
        Ok(TickOutcome::Opened { side, qty, leverage })
    }

    /// Size, margin check and protective levels for an entry at `leverage`.
    fn plan_entry(
        &self,
        side: Side,
        snapshot: &PriceSnapshot,
        signal: &Signal,
        balance: f64,
        leverage: f64,
        caps: Capabilities,
    ) -> Result<EntryPlan, EngineError> {
        let tech = &snapshot.technicals;
        let qty = calculate_position_size(
            balance,
            snapshot.price,
            leverage,
            signal.confidence,
            tech,
            &self.cfg.position,
            &self.spec,
            caps.intelligent_sizing,
        )?;
        let margin = check_margin(
            qty,
            snapshot.price,
            leverage,
            balance,
            self.cfg.exchange.margin_use_ratio,
            &self.spec,
        )?;
        let levels = calculate_risk_levels(
            side,
            snapshot.price,
            leverage,
            signal.confidence,
            tech,
            &self.cfg.stops,
            &self.cfg.risk_reward,
            caps.dynamic_rr,
        );
        validate_levels(self.symbol(), side, snapshot.price, &levels, &self.cfg.risk_reward)?;
        Ok(EntryPlan { leverage, qty, margin, levels })
    }

    async fn place_protection(&self, side: Side, qty: f64, stop_loss: f64, take_profit: f64) {
        let symbol = self.symbol();
        let sl = ConditionalOrder { kind: TriggerKind::StopLoss, pos_side: side, qty, trigger_price: stop_loss };
        if let Err(e) = self.gateway.place_conditional_order(&sl).await {
            log::error!("[{}] Stop-loss order failed, position is unprotected: {}", symbol, e);
        }
        let tp = ConditionalOrder { kind: TriggerKind::TakeProfit, pos_side: side, qty, trigger_price: take_profit };
        if let Err(e) = self.gateway.place_conditional_order(&tp).await {
            log::warn!("[{}] Take-profit order failed: {}", symbol, e);
        }
    }

    /// Places the new trigger order, then cancels the older ones of that kind.
    /// On failure the resting orders are untouched.
    async fn replace_trigger(
        &self,
        kind: TriggerKind,
        side: Side,
        qty: f64,
        trigger_price: f64,
    ) -> Result<String, ExchangeError> {
        let order = ConditionalOrder { kind, pos_side: side, qty, trigger_price };
        let id = self.gateway.place_conditional_order(&order).await?;
        self.cancel_orders_of(Some(kind), Some(&id)).await;
        Ok(id)
    }

    /// Cancels every resting stop/target order. Best-effort.
    async fn cancel_protective_orders(&self) {
        self.cancel_orders_of(None, None).await;
    }

    /// `None` cancels both kinds; `keep` spares one order id. Orders not
    /// placed by this engine, and anything not reduce-only, are left alone.
    async fn cancel_orders_of(&self, kind: Option<TriggerKind>, keep: Option<&str>) {
        let symbol = self.symbol();
        let orders = match self.gateway.list_open_orders().await {
            Ok(o) => o,
            Err(e) => {
                log::warn!("[{}] Could not list open orders: {}", symbol, e);
                return;
            }
        };
        let stale = orders.iter().filter(|o| {
            o.reduce_only
                && o.kind.is_some()
                && (kind.is_none() || o.kind == kind)
                && keep != Some(o.order_id.as_str())
        });
        for o in stale {
            match self.gateway.cancel_order(&o.order_id).await {
                Ok(()) => log::info!(
                    "[{}] Cancelled {} {} {} @ {:?} ({})",
                    symbol,
                    o.kind.map_or("?", |k| k.tag()),
                    o.side.as_str(),
                    o.qty,
                    o.trigger_price,
                    o.order_id
                ),
                Err(e) => log::warn!("[{}] Cancel {} failed: {}", symbol, o.order_id, e),
            }
        }
    }

    // ── Positioned ───────────────────────────────────────────────────────────

    async fn manage(
        &mut self,
        snapshot: &PriceSnapshot,
        signal: &Signal,
        pos: &Position,
        caps: Capabilities,
    ) -> Result<TickOutcome, EngineError> {
        let symbol = self.cfg.engine.symbol.clone();
        let mut st = match self.state.clone() {
            Some(st) => st,
            None => return Err(EngineError::Internal("positioned without risk state".to_string())),
        };
        // The exchange's average entry is authoritative (fills, pyramid adds).
        if pos.entry_price > 0.0 && pos.entry_price != st.entry_price {
            log::debug!("[{}] Entry {:.2} → {:.2} from exchange", symbol, st.entry_price, pos.entry_price);
            st.entry_price = pos.entry_price;
        }
        let price = snapshot.price;

        // Opposite signal: reversal guard first
        if let Some(new_side) = signal.direction.side().filter(|s| *s != st.side) {
            let throttle = SignalThrottle::new(&self.cfg.throttle, self.cfg.engine.bar_minutes);
            let persistence = throttle.params(throttle.regime(snapshot)).persist;
            match reversal::decide(st.side, signal, &snapshot.technicals, &self.history, persistence, &self.cfg.reversal) {
                ReversalDecision::Flip => return self.flip(snapshot, signal, pos, new_side, caps).await,
                ReversalDecision::Hold(reason) => {
                    log::info!(
                        "[{}] Holding {} against {} {:?}: {} ({} {} in history)",
                        symbol,
                        st.side.as_str(),
                        signal.direction.as_str(),
                        signal.confidence,
                        reason,
                        self.history.count(signal.direction),
                        signal.direction.as_str()
                    );
                    self.manage_open(&mut st, snapshot, signal, pos, caps, false).await;
                    self.state = Some(st);
                    return Ok(TickOutcome::HeldAgainstSignal(reason));
                }
            }
        }

        let same_side = signal.direction.side() == Some(st.side);
        self.manage_open(&mut st, snapshot, signal, pos, caps, same_side).await;
        log::info!(
            "[{}] {} {} @ {:.2} → {:.2} ({:+.2}%) SL={:?} TP={:?} pyramid={} tp={}/{}/{}",
            symbol,
            st.side.as_str(),
            pos.size,
            st.entry_price,
            price,
            st.pnl_pct(price) * 100.0,
            st.current_stop_loss,
            st.take_profit,
            st.pyramid_count,
            st.tp1_done,
            st.tp2_done,
            st.tp3_done
        );
        self.state = Some(st);
        Ok(TickOutcome::Managed)
    }

    /// Trailing stop, partial take-profit and (same-side signal only) pyramiding.
    /// State is only advanced for actions the exchange accepted.
    async fn manage_open(
        &mut self,
        st: &mut PositionRiskState,
        snapshot: &PriceSnapshot,
        signal: &Signal,
        pos: &Position,
        caps: Capabilities,
        allow_pyramid: bool,
    ) {
        let symbol = self.cfg.engine.symbol.clone();
        let price = snapshot.price;
        let mut size = pos.size;

        if caps.trailing_stop {
            if let Some(new_stop) = trailing::evaluate(st, price, &self.cfg.trailing) {
                match self.replace_trigger(TriggerKind::StopLoss, st.side, size, new_stop).await {
                    Ok(_) => {
                        log::info!("[{}] Trailing stop {:?} → {:.2}", symbol, st.current_stop_loss, new_stop);
                        st.current_stop_loss = Some(new_stop);
                    }
                    Err(e) => log::warn!(
                        "[{}] Trailing stop update to {:.2} failed, keeping {:?}: {}",
                        symbol, new_stop, st.current_stop_loss, e
                    ),
                }
            }
        }

        if caps.partial_tp {
            while let Some(action) = partial_tp::next_stage(st, price, size, &self.cfg.partial_tp, &self.spec) {
                match action {
                    TpAction::Skip { stage, raw_qty } => {
                        log::warn!(
                            "[{}] {} share {:.6} below min lot, marking stage done",
                            symbol,
                            stage.label(),
                            raw_qty
                        );
                        stage.mark_done(st);
                    }
                    TpAction::Close { stage, qty } => {
                        let res = self
                            .gateway
                            .place_market_order(OrderSide::closing(st.side), qty, &OrderParams::reduce(st.side))
                            .await;
                        match res {
                            Ok(_) => {
                                log::info!("[{}] {} closed {} @ {:.2}", symbol, stage.label(), qty, price);
                                stage.mark_done(st);
                                size -= qty;
                            }
                            Err(e) => {
                                log::warn!("[{}] {} close failed: {}", symbol, stage.label(), e);
                                break;
                            }
                        }
                    }
                }
            }
            if st.tp2_done && !st.tp3_done && st.stop_covers_entry() {
                st.tp3_done = true;
                log::info!(
                    "[{}] Runner {:.0}% ({}) left to the trailing stop at {:?}",
                    symbol,
                    self.cfg.partial_tp.tp3_ratio * 100.0,
                    size,
                    st.current_stop_loss
                );
            }
        }

        if allow_pyramid {
            let add = pyramid::evaluate(
                st,
                signal,
                snapshot,
                self.leverage,
                &self.cfg.pyramid,
                &self.cfg.position,
                &self.spec,
                caps.pyramid,
            );
            match add {
                Ok(qty) => self.add_to_position(st, size, qty, price).await,
                Err(skip) => log::debug!("[{}] No pyramid: {:?}", symbol, skip),
            }
        }
    }

    async fn add_to_position(&mut self, st: &mut PositionRiskState, size: f64, qty: f64, price: f64) {
        let symbol = self.cfg.engine.symbol.clone();
        let balance = match self.gateway.get_balance().await {
            Ok(b) => b,
            Err(e) => {
                log::warn!("[{}] Pyramid skipped, balance unavailable: {}", symbol, e);
                return;
            }
        };
        if let Err(e) = check_margin(qty, price, self.leverage, balance, self.cfg.exchange.margin_use_ratio, &self.spec) {
            log::info!("[{}] Pyramid skipped: {}", symbol, e);
            return;
        }
        if let Err(e) = self
            .gateway
            .place_market_order(OrderSide::opening(st.side), qty, &OrderParams::open(st.side))
            .await
        {
            log::warn!("[{}] Pyramid order failed: {}", symbol, e);
            return;
        }

        let total = size + qty;
        st.entry_price = (st.entry_price * size + price * qty) / total;
        st.pyramid_count += 1;
        log::info!(
            "[{}] Pyramid add #{} qty={} @ {:.2}, size {} avg entry {:.2}",
            symbol,
            st.pyramid_count,
            qty,
            price,
            total,
            st.entry_price
        );

        // Attached SL/TP cover the whole position; separate orders carry a fixed qty.
        if st.conditional_protection {
            if let Some(stop) = st.current_stop_loss {
                if let Err(e) = self.replace_trigger(TriggerKind::StopLoss, st.side, total, stop).await {
                    log::error!("[{}] Stop-loss resize to {} failed, add is partly unprotected: {}", symbol, total, e);
                }
            }
            if let Some(target) = st.take_profit {
                if let Err(e) = self.replace_trigger(TriggerKind::TakeProfit, st.side, total, target).await {
                    log::warn!("[{}] Take-profit resize to {} failed: {}", symbol, total, e);
                }
            }
        }
    }

    async fn flip(
        &mut self,
        snapshot: &PriceSnapshot,
        signal: &Signal,
        pos: &Position,
        new_side: Side,
        caps: Capabilities,
    ) -> Result<TickOutcome, EngineError> {
        let symbol = self.cfg.engine.symbol.clone();
        let from = pos.side;
        log::info!(
            "[{}] Reversal {} → {} ({:?}): closing {}",
            symbol,
            from.as_str(),
            new_side.as_str(),
            signal.confidence,
            pos.size
        );
        self.gateway
            .place_market_order(OrderSide::closing(from), pos.size, &OrderParams::reduce(from))
            .await
            .map_err(|e| EngineError::exchange("close_position", e))?;
        self.state = None;
        self.cancel_protective_orders().await;

        // The close already went through, so only a broken invariant fails the tick.
        let reopened = match self.try_open(snapshot, signal, caps).await {
            Ok(TickOutcome::Opened { .. }) => true,
            Ok(_) => false,
            Err(e) if e.needs_cooldown() => return Err(e),
            Err(e) => {
                log::warn!("[{}] Reopen after reversal failed: {}", symbol, e);
                false
            }
        };
        Ok(TickOutcome::Flipped { from, reopened })
    }
}

struct EntryPlan {
    leverage: f64,
    qty: f64,
    margin: f64,
    levels: RiskLevels,
}
