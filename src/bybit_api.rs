use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use std::future::Future;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::error::{classify_error, ExchangeError};
use crate::exchange::{ConditionalOrder, ExchangeGateway, OpenOrder, OrderParams, OrderSide, TriggerKind};
use crate::types::{Candle, InstrumentSpec, Position, Side};

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW: &str = "5000";
/// "leverage not modified"
const LEVERAGE_UNCHANGED: i64 = 110043;
/// "position mode is not modified"
const MODE_UNCHANGED: i64 = 110025;

/// Generic retry wrapper with exponential backoff. `max_attempts` counts the
/// first call; permanent errors are returned immediately.
pub async fn with_retry<F, Fut, T>(operation: F, max_attempts: u32) -> Result<T, ExchangeError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ExchangeError>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    let mut delay: u64 = 1;
    loop {
        match operation().await {
            Ok(r) => return Ok(r),
            Err(e @ ExchangeError::Permanent(_)) => return Err(e),
            Err(e) if attempt >= max_attempts => return Err(e),
            Err(ExchangeError::RateLimit { retry_after }) => {
                log::warn!("Rate limited, sleeping {}s (attempt {}/{})", retry_after, attempt, max_attempts);
                tokio::time::sleep(Duration::from_secs(retry_after)).await;
            }
            Err(e) => {
                log::warn!("{}, retry in {}s ({}/{})", e, delay, attempt, max_attempts);
                tokio::time::sleep(Duration::from_secs(delay)).await;
                delay = (delay * 2).min(60);
            }
        }
        attempt += 1;
    }
}

// ── Client ────────────────────────────────────────────────────────────────────

/// Bybit V5 unified-account client for one linear contract.
#[derive(Clone)]
pub struct BybitClient {
    client: reqwest::Client,
    base_url: String,
    market_url: String,
    api_key: String,
    api_secret: String,
    symbol: String,
    hedge_mode: bool,
    max_attempts: u32,
    fallback_spec: InstrumentSpec,
}

impl BybitClient {
    /// Reads BYBIT_API_KEY / BYBIT_SECRET from the environment.
    pub fn new(cfg: &EngineConfig) -> Result<Self, ExchangeError> {
        let api_key = std::env::var("BYBIT_API_KEY")
            .map_err(|_| ExchangeError::Permanent("BYBIT_API_KEY env var not set".into()))?;
        let api_secret = std::env::var("BYBIT_SECRET")
            .map_err(|_| ExchangeError::Permanent("BYBIT_SECRET env var not set".into()))?;
        Self::with_credentials(cfg, api_key, api_secret)
    }

    pub fn with_credentials(cfg: &EngineConfig, api_key: String, api_secret: String) -> Result<Self, ExchangeError> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .timeout(Duration::from_secs(cfg.exchange.timeout_secs))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| ExchangeError::Permanent(format!("HTTP client build failed: {}", e)))?;

        Ok(BybitClient {
            client,
            base_url: cfg.exchange.rest_url.trim_end_matches('/').to_string(),
            market_url: cfg.exchange.market_url.trim_end_matches('/').to_string(),
            api_key,
            api_secret,
            symbol: cfg.engine.symbol.clone(),
            hedge_mode: cfg.engine.hedge_mode,
            max_attempts: cfg.exchange.max_attempts,
            fallback_spec: cfg.exchange.instrument_spec(),
        })
    }

    fn sign(&self, payload: &str) -> Result<String, ExchangeError> {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| ExchangeError::Permanent(format!("HMAC init failed: {}", e)))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// hedge mode: 1 = long leg, 2 = short leg; one-way mode: 0.
    fn position_idx(&self, side: Side) -> u8 {
        match (self.hedge_mode, side) {
            (false, _) => 0,
            (true, Side::Long) => 1,
            (true, Side::Short) => 2,
        }
    }

    // ── Internal raw methods (no retry) ──────────────────────────────────────

    async fn signed_get(&self, path: &str, query: &str) -> Result<Value, ExchangeError> {
        let ts = chrono::Utc::now().timestamp_millis().to_string();
        let payload = format!("{}{}{}{}", ts, self.api_key, RECV_WINDOW, query);
        let signature = self.sign(&payload)?;

        let url = format!("{}{}?{}", self.base_url, path, query);
        let resp = self
            .client
            .get(&url)
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", &ts)
            .header("X-BAPI-SIGN", signature)
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(format!("HTTP error: {}", e)))?;
        read_response(resp, &[]).await
    }

    async fn signed_post(&self, path: &str, body: Value, ok_codes: &[i64]) -> Result<Value, ExchangeError> {
        let body = body.to_string();
        let ts = chrono::Utc::now().timestamp_millis().to_string();
        let payload = format!("{}{}{}{}", ts, self.api_key, RECV_WINDOW, body);
        let signature = self.sign(&payload)?;

        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", &ts)
            .header("X-BAPI-SIGN", signature)
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(format!("HTTP error: {}", e)))?;
        read_response(resp, ok_codes).await
    }

    async fn public_get(&self, path: &str, query: &str) -> Result<Value, ExchangeError> {
        let url = format!("{}{}?{}", self.market_url, path, query);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(format!("HTTP error: {}", e)))?;
        read_response(resp, &[]).await
    }

    async fn create_order_raw(&self, body: Value) -> Result<String, ExchangeError> {
        let json = self.signed_post("/v5/order/create", body, &[]).await?;
        Ok(json["result"]["orderId"].as_str().unwrap_or("unknown").to_string())
    }

    // ── Public methods with retry ─────────────────────────────────────────────

    /// Fetch the last `limit` klines (public endpoint, no auth). Oldest first.
    pub async fn fetch_klines(&self, interval_minutes: u32, limit: usize) -> Result<Vec<Candle>, ExchangeError> {
        let query = format!(
            "category=linear&symbol={}&interval={}&limit={}",
            self.symbol, interval_minutes, limit
        );
        let json = with_retry(|| self.public_get("/v5/market/kline", &query), self.max_attempts).await?;
        parse_klines(&json)
    }
}

async fn read_response(resp: reqwest::Response, ok_codes: &[i64]) -> Result<Value, ExchangeError> {
    let http_status = resp.status().as_u16();
    let json: Value = resp
        .json()
        .await
        .map_err(|e| ExchangeError::Transient(format!("Parse error: {}", e)))?;

    let ret_code = json["retCode"].as_i64().unwrap_or(-1);
    if ret_code == 0 || ok_codes.contains(&ret_code) {
        Ok(json)
    } else {
        let msg = json["retMsg"].as_str().unwrap_or("unknown");
        Err(classify_error(ret_code, http_status, msg))
    }
}

#[async_trait]
impl ExchangeGateway for BybitClient {
    async fn get_balance(&self) -> Result<f64, ExchangeError> {
        let json = with_retry(
            || self.signed_get("/v5/account/wallet-balance", "accountType=UNIFIED"),
            self.max_attempts,
        )
        .await?;
        parse_balance(&json)
    }

    async fn get_position(&self) -> Result<Option<Position>, ExchangeError> {
        let query = format!("category=linear&symbol={}", self.symbol);
        let json = with_retry(|| self.signed_get("/v5/position/list", &query), self.max_attempts).await?;
        parse_position(&json)
    }

    async fn set_leverage(&self, leverage: f64) -> Result<(), ExchangeError> {
        let lev = format!("{:.1}", leverage);
        let body = serde_json::json!({
            "category":     "linear",
            "symbol":       self.symbol,
            "buyLeverage":  lev,
            "sellLeverage": lev,
        });
        with_retry(
            || self.signed_post("/v5/position/set-leverage", body.clone(), &[LEVERAGE_UNCHANGED]),
            self.max_attempts,
        )
        .await?;
        log::info!("[{}] Leverage set to {}x", self.symbol, lev);
        Ok(())
    }

    async fn place_market_order(
        &self,
        side: OrderSide,
        qty: f64,
        params: &OrderParams,
    ) -> Result<String, ExchangeError> {
        let mut body = serde_json::json!({
            "category":    "linear",
            "symbol":      self.symbol,
            "side":        side.as_str(),
            "orderType":   "Market",
            "qty":         fmt_qty(qty),
            "positionIdx": self.position_idx(params.pos_side),
            "reduceOnly":  params.reduce_only,
            "timeInForce": "IOC",
        });
        if let Some(sl) = params.stop_loss {
            body["stopLoss"] = Value::from(format!("{:.2}", sl));
        }
        if let Some(tp) = params.take_profit {
            body["takeProfit"] = Value::from(format!("{:.2}", tp));
        }
        if params.stop_loss.is_some() || params.take_profit.is_some() {
            body["tpslMode"] = Value::from("Full");
        }

        let order_id = with_retry(|| self.create_order_raw(body.clone()), self.max_attempts).await?;
        log::info!(
            "[{}] Order placed: {} qty={} reduce_only={} orderId={}",
            self.symbol, side.as_str(), fmt_qty(qty), params.reduce_only, order_id
        );
        Ok(order_id)
    }

    async fn place_conditional_order(&self, order: &ConditionalOrder) -> Result<String, ExchangeError> {
        let link_id = format!("{}-{}", order.kind.tag(), chrono::Utc::now().timestamp_millis());
        // 1: triggered by a rise to triggerPrice, 2: by a fall
        let trigger_direction = if order.triggers_on_rise() { 1 } else { 2 };
        let body = serde_json::json!({
            "category":         "linear",
            "symbol":           self.symbol,
            "side":             order.order_side().as_str(),
            "orderType":        "Market",
            "qty":              fmt_qty(order.qty),
            "triggerPrice":     format!("{:.2}", order.trigger_price),
            "triggerDirection": trigger_direction,
            "triggerBy":        "LastPrice",
            "reduceOnly":       true,
            "positionIdx":      self.position_idx(order.pos_side),
            "orderLinkId":      link_id,
        });
        let order_id = with_retry(|| self.create_order_raw(body.clone()), self.max_attempts).await?;
        log::info!(
            "[{}] Conditional {} placed: trigger={:.2} qty={} orderId={}",
            self.symbol, order.kind.tag(), order.trigger_price, fmt_qty(order.qty), order_id
        );
        Ok(order_id)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), ExchangeError> {
        let body = serde_json::json!({
            "category": "linear",
            "symbol":   self.symbol,
            "orderId":  order_id,
        });
        with_retry(|| self.signed_post("/v5/order/cancel", body.clone(), &[]), self.max_attempts).await?;
        Ok(())
    }

    async fn list_open_orders(&self) -> Result<Vec<OpenOrder>, ExchangeError> {
        let query = format!("category=linear&symbol={}&openOnly=0&limit=50", self.symbol);
        let json = with_retry(|| self.signed_get("/v5/order/realtime", &query), self.max_attempts).await?;
        Ok(parse_open_orders(&json))
    }

    async fn instrument_spec(&self) -> Result<InstrumentSpec, ExchangeError> {
        let query = format!("category=linear&symbol={}", self.symbol);
        let json = with_retry(|| self.public_get("/v5/market/instruments-info", &query), self.max_attempts).await?;
        parse_instrument(&json, self.fallback_spec)
    }

    async fn ensure_hedge_mode(&self) -> Result<(), ExchangeError> {
        let body = serde_json::json!({
            "category": "linear",
            "symbol":   self.symbol,
            "mode":     3,
        });
        with_retry(
            || self.signed_post("/v5/position/switch-mode", body.clone(), &[MODE_UNCHANGED]),
            self.max_attempts,
        )
        .await?;
        log::info!("[{}] Hedge mode active", self.symbol);
        Ok(())
    }
}

// ── Response parsing ──────────────────────────────────────────────────────────

fn num(v: &Value) -> Option<f64> {
    match v {
        Value::String(s) if !s.is_empty() => s.parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Quantity without trailing zeros ("0.013", "2").
fn fmt_qty(qty: f64) -> String {
    let s = format!("{:.6}", qty);
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

fn result_list(json: &Value) -> Result<&Vec<Value>, ExchangeError> {
    json["result"]["list"]
        .as_array()
        .ok_or_else(|| ExchangeError::Transient("missing result.list".into()))
}

fn parse_balance(json: &Value) -> Result<f64, ExchangeError> {
    let account = result_list(json)?
        .first()
        .ok_or_else(|| ExchangeError::Transient("empty wallet list".into()))?;
    if let Some(avail) = num(&account["totalAvailableBalance"]) {
        return Ok(avail);
    }
    account["coin"]
        .as_array()
        .and_then(|coins| coins.iter().find(|c| c["coin"].as_str() == Some("USDT")))
        .and_then(|c| num(&c["walletBalance"]))
        .ok_or_else(|| ExchangeError::Transient("no USDT balance in wallet".into()))
}

/// First leg with a non-zero size. In hedge mode both legs are listed.
fn parse_position(json: &Value) -> Result<Option<Position>, ExchangeError> {
    for entry in result_list(json)? {
        let size = num(&entry["size"]).unwrap_or(0.0);
        if size <= 0.0 {
            continue;
        }
        let side = match (entry["side"].as_str(), entry["positionIdx"].as_i64()) {
            (Some("Buy"), _) | (_, Some(1)) => Side::Long,
            (Some("Sell"), _) | (_, Some(2)) => Side::Short,
            _ => continue,
        };
        return Ok(Some(Position {
            side,
            size,
            entry_price: num(&entry["avgPrice"]).unwrap_or(0.0),
            leverage: num(&entry["leverage"]).unwrap_or(0.0),
            unrealized_pnl: num(&entry["unrealisedPnl"]).unwrap_or(0.0),
        }));
    }
    Ok(None)
}

fn parse_open_orders(json: &Value) -> Vec<OpenOrder> {
    let list = match json["result"]["list"].as_array() {
        Some(l) => l,
        None => return Vec::new(),
    };
    list.iter()
        .filter_map(|o| {
            let side = match o["side"].as_str()? {
                "Buy" => OrderSide::Buy,
                "Sell" => OrderSide::Sell,
                _ => return None,
            };
            Some(OpenOrder {
                order_id: o["orderId"].as_str()?.to_string(),
                side,
                qty: num(&o["qty"]).unwrap_or(0.0),
                trigger_price: num(&o["triggerPrice"]).filter(|p| *p > 0.0),
                reduce_only: o["reduceOnly"].as_bool().unwrap_or(false),
                kind: match o["stopOrderType"].as_str() {
                    Some("StopLoss") => Some(TriggerKind::StopLoss),
                    Some("TakeProfit") => Some(TriggerKind::TakeProfit),
                    _ => o["orderLinkId"].as_str().and_then(TriggerKind::from_tag),
                },
            })
        })
        .collect()
}

fn parse_instrument(json: &Value, fallback: InstrumentSpec) -> Result<InstrumentSpec, ExchangeError> {
    let info = result_list(json)?
        .first()
        .ok_or_else(|| ExchangeError::Permanent("instruments-info: unknown symbol".into()))?;
    let lot = &info["lotSizeFilter"];
    Ok(InstrumentSpec {
        lot_step: num(&lot["qtyStep"]).filter(|v| *v > 0.0).unwrap_or(fallback.lot_step),
        min_lot: num(&lot["minOrderQty"]).filter(|v| *v > 0.0).unwrap_or(fallback.min_lot),
        contract_multiplier: fallback.contract_multiplier,
    })
}

fn parse_klines(json: &Value) -> Result<Vec<Candle>, ExchangeError> {
    let mut candles: Vec<Candle> = result_list(json)?
        .iter()
        .filter_map(|row| {
            let arr = row.as_array()?;
            Some(Candle {
                timestamp: arr.first()?.as_str()?.parse().ok()?,
                open: num(arr.get(1)?)?,
                high: num(arr.get(2)?)?,
                low: num(arr.get(3)?)?,
                close: num(arr.get(4)?)?,
                volume: num(arr.get(5)?)?,
            })
        })
        .collect();
    candles.reverse(); // Bybit returns newest-first
    Ok(candles)
}
