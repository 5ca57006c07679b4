use async_trait::async_trait;

use crate::error::ExchangeError;
use crate::types::{InstrumentSpec, Position, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Order side that opens or adds to `side`.
    pub fn opening(side: Side) -> Self {
        match side {
            Side::Long => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        }
    }

    /// Order side that reduces `side`.
    pub fn closing(side: Side) -> Self {
        Self::opening(side.opposite())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderSide::Buy => "Buy",
            OrderSide::Sell => "Sell",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderParams {
    pub reduce_only: bool,
    /// Position leg the order acts on (hedge mode).
    pub pos_side: Side,
    /// Protective levels attached to the entry.
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

impl OrderParams {
    pub fn open(pos_side: Side) -> Self {
        OrderParams { reduce_only: false, pos_side, stop_loss: None, take_profit: None }
    }

    pub fn reduce(pos_side: Side) -> Self {
        OrderParams { reduce_only: true, pos_side, stop_loss: None, take_profit: None }
    }

    pub fn with_protection(mut self, stop_loss: f64, take_profit: f64) -> Self {
        self.stop_loss = Some(stop_loss);
        self.take_profit = Some(take_profit);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    StopLoss,
    TakeProfit,
}

impl TriggerKind {
    pub fn tag(self) -> &'static str {
        match self {
            TriggerKind::StopLoss => "sl",
            TriggerKind::TakeProfit => "tp",
        }
    }

    pub fn from_tag(link_id: &str) -> Option<Self> {
        match link_id.split('-').next() {
            Some("sl") => Some(TriggerKind::StopLoss),
            Some("tp") => Some(TriggerKind::TakeProfit),
            _ => None,
        }
    }
}

/// Reduce-only market order that fires when price crosses `trigger_price`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionalOrder {
    pub kind: TriggerKind,
    pub pos_side: Side,
    pub qty: f64,
    pub trigger_price: f64,
}

impl ConditionalOrder {
    pub fn order_side(&self) -> OrderSide {
        OrderSide::closing(self.pos_side)
    }

    /// True when the trigger fires on a rising price.
    pub fn triggers_on_rise(&self) -> bool {
        matches!(
            (self.kind, self.pos_side),
            (TriggerKind::StopLoss, Side::Short) | (TriggerKind::TakeProfit, Side::Long)
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenOrder {
    pub order_id: String,
    pub side: OrderSide,
    pub qty: f64,
    pub trigger_price: Option<f64>,
    pub reduce_only: bool,
    /// Set for conditional orders placed by this engine.
    pub kind: Option<TriggerKind>,
}

/// Everything the controller needs from the derivatives venue.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Free margin in the settlement currency.
    async fn get_balance(&self) -> Result<f64, ExchangeError>;

    /// The live position on the traded instrument, if any.
    async fn get_position(&self) -> Result<Option<Position>, ExchangeError>;

    async fn set_leverage(&self, leverage: f64) -> Result<(), ExchangeError>;

    async fn place_market_order(
        &self,
        side: OrderSide,
        qty: f64,
        params: &OrderParams,
    ) -> Result<String, ExchangeError>;

    async fn place_conditional_order(&self, order: &ConditionalOrder) -> Result<String, ExchangeError>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), ExchangeError>;

    async fn list_open_orders(&self) -> Result<Vec<OpenOrder>, ExchangeError>;

    async fn instrument_spec(&self) -> Result<InstrumentSpec, ExchangeError>;

    async fn ensure_hedge_mode(&self) -> Result<(), ExchangeError>;
}

/// Passes reads through and logs every write instead of sending it.
pub struct DryRunGateway<G> {
    inner: G,
    symbol: String,
    seq: std::sync::atomic::AtomicU64,
}

impl<G: ExchangeGateway> DryRunGateway<G> {
    pub fn new(inner: G, symbol: &str) -> Self {
        DryRunGateway { inner, symbol: symbol.to_string(), seq: std::sync::atomic::AtomicU64::new(0) }
    }

    fn next_id(&self) -> String {
        let n = self.seq.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
        format!("dry-run-{}", n)
    }
}

#[async_trait]
impl<G: ExchangeGateway> ExchangeGateway for DryRunGateway<G> {
    async fn get_balance(&self) -> Result<f64, ExchangeError> {
        self.inner.get_balance().await
    }

    async fn get_position(&self) -> Result<Option<Position>, ExchangeError> {
        self.inner.get_position().await
    }

    async fn set_leverage(&self, leverage: f64) -> Result<(), ExchangeError> {
        log::info!("[{}] DRY RUN: set leverage {:.1}x", self.symbol, leverage);
        Ok(())
    }

    async fn place_market_order(
        &self,
        side: OrderSide,
        qty: f64,
        params: &OrderParams,
    ) -> Result<String, ExchangeError> {
        log::info!(
            "[{}] DRY RUN: market {} qty={} leg={} reduce_only={} SL={:?} TP={:?}",
            self.symbol,
            side.as_str(),
            qty,
            params.pos_side.as_str(),
            params.reduce_only,
            params.stop_loss,
            params.take_profit
        );
        Ok(self.next_id())
    }

    async fn place_conditional_order(&self, order: &ConditionalOrder) -> Result<String, ExchangeError> {
        log::info!(
            "[{}] DRY RUN: {} {} qty={} trigger={:.2}",
            self.symbol,
            order.kind.tag(),
            order.order_side().as_str(),
            order.qty,
            order.trigger_price
        );
        Ok(self.next_id())
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), ExchangeError> {
        log::info!("[{}] DRY RUN: cancel {}", self.symbol, order_id);
        Ok(())
    }

    async fn list_open_orders(&self) -> Result<Vec<OpenOrder>, ExchangeError> {
        self.inner.list_open_orders().await
    }

    async fn instrument_spec(&self) -> Result<InstrumentSpec, ExchangeError> {
        self.inner.instrument_spec().await
    }

    async fn ensure_hedge_mode(&self) -> Result<(), ExchangeError> {
        log::info!("[{}] DRY RUN: ensure hedge mode", self.symbol);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory venue for controller tests. Market orders fill instantly at
    //! the configured mark price.

    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        SetLeverage(f64),
        Market { side: OrderSide, qty: f64, params: OrderParams },
        Conditional(ConditionalOrder),
        Cancel(String),
    }

    #[derive(Debug, Default)]
    pub struct MockState {
        pub balance: f64,
        pub mark: f64,
        pub leverage: f64,
        pub position: Option<Position>,
        pub orders: Vec<OpenOrder>,
        pub calls: Vec<Call>,
        pub reject_attached: bool,
        pub fail_conditional: bool,
        pub fail_set_leverage: bool,
        pub fail_balance: bool,
        next_id: u64,
    }

    pub struct MockGateway {
        pub spec: InstrumentSpec,
        pub state: Mutex<MockState>,
    }

    impl MockGateway {
        pub fn new(balance: f64, mark: f64) -> Self {
            MockGateway {
                spec: InstrumentSpec { lot_step: 0.001, min_lot: 0.001, contract_multiplier: 1.0 },
                state: Mutex::new(MockState { balance, mark, leverage: 5.0, ..MockState::default() }),
            }
        }

        pub fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
            let mut st = self.state.lock().unwrap();
            f(&mut st)
        }

        pub fn calls(&self) -> Vec<Call> {
            self.with(|st| st.calls.clone())
        }

        pub fn clear_calls(&self) {
            self.with(|st| st.calls.clear());
        }

        pub fn market_orders(&self) -> Vec<(OrderSide, f64, OrderParams)> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Market { side, qty, params } => Some((side, qty, params)),
                    _ => None,
                })
                .collect()
        }

        pub fn conditional_orders(&self) -> Vec<ConditionalOrder> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Conditional(o) => Some(o),
                    _ => None,
                })
                .collect()
        }

        pub fn set_position(&self, side: Side, size: f64, entry: f64) {
            self.with(|st| {
                st.position = Some(Position { side, size, entry_price: entry, leverage: st.leverage, unrealized_pnl: 0.0 })
            });
        }
    }

    fn next_id(st: &mut MockState) -> String {
        st.next_id += 1;
        format!("mock-{}", st.next_id)
    }

    #[async_trait]
    impl ExchangeGateway for MockGateway {
        async fn get_balance(&self) -> Result<f64, ExchangeError> {
            self.with(|st| {
                if st.fail_balance {
                    Err(ExchangeError::Transient("balance unavailable".into()))
                } else {
                    Ok(st.balance)
                }
            })
        }

        async fn get_position(&self) -> Result<Option<Position>, ExchangeError> {
            Ok(self.with(|st| st.position.clone()))
        }

        async fn set_leverage(&self, leverage: f64) -> Result<(), ExchangeError> {
            self.with(|st| {
                st.calls.push(Call::SetLeverage(leverage));
                if st.fail_set_leverage {
                    return Err(ExchangeError::Permanent("leverage rejected".into()));
                }
                st.leverage = leverage;
                Ok(())
            })
        }

        async fn place_market_order(
            &self,
            side: OrderSide,
            qty: f64,
            params: &OrderParams,
        ) -> Result<String, ExchangeError> {
            self.with(|st| {
                st.calls.push(Call::Market { side, qty, params: params.clone() });
                if st.reject_attached && (params.stop_loss.is_some() || params.take_profit.is_some()) {
                    return Err(ExchangeError::Permanent("tpsl not supported".into()));
                }
                let mark = st.mark;
                let leverage = st.leverage;
                if params.reduce_only {
                    if let Some(pos) = st.position.as_mut() {
                        pos.size -= qty;
                        if pos.size <= 1e-12 {
                            st.position = None;
                        }
                    }
                } else {
                    let same_leg = st.position.as_ref().map_or(false, |p| p.side == params.pos_side);
                    if same_leg {
                        if let Some(pos) = st.position.as_mut() {
                            let total = pos.size + qty;
                            pos.entry_price = (pos.entry_price * pos.size + mark * qty) / total;
                            pos.size = total;
                        }
                    } else {
                        st.position = Some(Position {
                            side: params.pos_side,
                            size: qty,
                            entry_price: mark,
                            leverage,
                            unrealized_pnl: 0.0,
                        });
                    }
                }
                Ok(next_id(st))
            })
        }

        async fn place_conditional_order(&self, order: &ConditionalOrder) -> Result<String, ExchangeError> {
            self.with(|st| {
                st.calls.push(Call::Conditional(order.clone()));
                if st.fail_conditional {
                    return Err(ExchangeError::Transient("conditional order timeout".into()));
                }
                let id = next_id(st);
                st.orders.push(OpenOrder {
                    order_id: id.clone(),
                    side: order.order_side(),
                    qty: order.qty,
                    trigger_price: Some(order.trigger_price),
                    reduce_only: true,
                    kind: Some(order.kind),
                });
                Ok(id)
            })
        }

        async fn cancel_order(&self, order_id: &str) -> Result<(), ExchangeError> {
            self.with(|st| {
                st.calls.push(Call::Cancel(order_id.to_string()));
                st.orders.retain(|o| o.order_id != order_id);
                Ok(())
            })
        }

        async fn list_open_orders(&self) -> Result<Vec<OpenOrder>, ExchangeError> {
            Ok(self.with(|st| st.orders.clone()))
        }

        async fn instrument_spec(&self) -> Result<InstrumentSpec, ExchangeError> {
            Ok(self.spec)
        }

        async fn ensure_hedge_mode(&self) -> Result<(), ExchangeError> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{Call, MockGateway};
    use super::*;

    #[test]
    fn trigger_direction_by_leg() {
        let sl_long = ConditionalOrder { kind: TriggerKind::StopLoss, pos_side: Side::Long, qty: 1.0, trigger_price: 90.0 };
        assert!(!sl_long.triggers_on_rise());
        assert_eq!(sl_long.order_side(), OrderSide::Sell);
        let tp_short = ConditionalOrder { kind: TriggerKind::TakeProfit, pos_side: Side::Short, qty: 1.0, trigger_price: 90.0 };
        assert!(!tp_short.triggers_on_rise());
        assert_eq!(tp_short.order_side(), OrderSide::Buy);
        assert_eq!(TriggerKind::from_tag("sl-1700000000000"), Some(TriggerKind::StopLoss));
        assert_eq!(TriggerKind::from_tag("manual"), None);
    }

    #[tokio::test]
    async fn dry_run_never_reaches_the_venue() {
        let venue = MockGateway::new(1_000.0, 100.0);
        let dry = DryRunGateway::new(venue, "BTCUSDT");
        let id = dry
            .place_market_order(OrderSide::Buy, 0.01, &OrderParams::open(Side::Long))
            .await
            .unwrap();
        assert!(id.starts_with("dry-run-"));
        dry.set_leverage(7.0).await.unwrap();
        assert_eq!(dry.get_balance().await.unwrap(), 1_000.0);
        assert!(dry.inner.calls().is_empty());
        assert!(dry.get_position().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mock_reduce_only_flattens() {
        let venue = MockGateway::new(1_000.0, 100.0);
        venue.place_market_order(OrderSide::Buy, 0.02, &OrderParams::open(Side::Long)).await.unwrap();
        venue.place_market_order(OrderSide::Sell, 0.02, &OrderParams::reduce(Side::Long)).await.unwrap();
        assert!(venue.get_position().await.unwrap().is_none());
        assert!(matches!(venue.calls()[0], Call::Market { side: OrderSide::Buy, .. }));
    }
}
