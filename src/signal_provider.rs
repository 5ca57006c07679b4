use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use crate::config::{ParsePolicy, SignalConfig};
use crate::error::SignalError;
use crate::types::{Confidence, Direction, Position, PriceSnapshot, Signal};

#[async_trait]
pub trait SignalProvider: Send + Sync {
    async fn signal(&self, snapshot: &PriceSnapshot, position: Option<&Position>) -> Result<Signal, SignalError>;
}

/// Fields the model must return. Advisory levels are optional.
#[derive(Debug, Deserialize)]
struct SignalPayload {
    signal: Direction,
    confidence: Confidence,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    stop_loss: Option<f64>,
    #[serde(default)]
    take_profit: Option<f64>,
}

/// OpenAI-compatible chat completion client (DeepSeek by default).
pub struct DeepSeekClient {
    client: reqwest::Client,
    url: String,
    api_key: String,
    symbol: String,
    cfg: SignalConfig,
}

impl DeepSeekClient {
    /// Reads DEEPSEEK_API_KEY from the environment.
    pub fn new(cfg: &SignalConfig, symbol: &str) -> Result<Self, SignalError> {
        let api_key = std::env::var("DEEPSEEK_API_KEY")
            .map_err(|_| SignalError::Provider("DEEPSEEK_API_KEY env var not set".into()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| SignalError::Provider(format!("HTTP client build failed: {}", e)))?;
        Ok(DeepSeekClient {
            client,
            url: format!("{}/chat/completions", cfg.base_url.trim_end_matches('/')),
            api_key,
            symbol: symbol.to_string(),
            cfg: cfg.clone(),
        })
    }

    async fn complete(&self, prompt: &str) -> Result<String, SignalError> {
        let body = serde_json::json!({
            "model": self.cfg.model,
            "temperature": self.cfg.temperature,
            "stream": false,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": prompt },
            ],
        });
        let resp = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| SignalError::Provider(format!("HTTP error: {}", e)))?;

        let status = resp.status();
        let json: Value = resp
            .json()
            .await
            .map_err(|e| SignalError::Provider(format!("Parse error: {}", e)))?;
        if !status.is_success() {
            let msg = json["error"]["message"].as_str().unwrap_or("unknown");
            return Err(SignalError::Provider(format!("HTTP {}: {}", status.as_u16(), msg)));
        }
        json["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| SignalError::Malformed("response has no message content".into()))
    }
}

#[async_trait]
impl SignalProvider for DeepSeekClient {
    async fn signal(&self, snapshot: &PriceSnapshot, position: Option<&Position>) -> Result<Signal, SignalError> {
        let prompt = build_prompt(&self.symbol, snapshot, position);
        let attempts = self.cfg.max_attempts.max(1);
        let mut last_err = SignalError::Provider("no attempt made".into());

        for attempt in 1..=attempts {
            match self.complete(&prompt).await.and_then(|text| parse_signal(&text, self.cfg.parse_policy)) {
                Ok(signal) => {
                    log::info!(
                        "[{}] Signal {} ({:?}): {}",
                        self.symbol,
                        signal.direction.as_str(),
                        signal.confidence,
                        signal.reason
                    );
                    return Ok(signal);
                }
                Err(e) => {
                    log::warn!("[{}] Signal attempt {}/{} failed: {}", self.symbol, attempt, attempts, e);
                    last_err = e;
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
        Err(last_err)
    }
}

const SYSTEM_PROMPT: &str = "You are a professional crypto derivatives trader. \
Answer with a single JSON object and nothing else.";

fn fmt_opt(v: Option<f64>, decimals: usize) -> String {
    match v {
        Some(x) => format!("{:.*}", decimals, x),
        None => "n/a".to_string(),
    }
}

pub fn build_prompt(symbol: &str, snapshot: &PriceSnapshot, position: Option<&Position>) -> String {
    let t = &snapshot.technicals;
    let mut out = String::new();

    out.push_str(&format!(
        "Analyse the {} perpetual on the latest bar.\n\nPrice: {:.2} (change {:+.2}%), high {:.2}, low {:.2}, volume {:.2}\n",
        symbol, snapshot.price, snapshot.price_change_pct, snapshot.high, snapshot.low, snapshot.volume
    ));

    out.push_str("\nRecent bars (open/high/low/close):\n");
    for c in &snapshot.recent {
        out.push_str(&format!("  {:.2} / {:.2} / {:.2} / {:.2}\n", c.open, c.high, c.low, c.close));
    }

    let trend = match t.trend {
        Some(tr) => format!("{:?}", tr),
        None => "n/a".to_string(),
    };
    out.push_str(&format!(
        "\nIndicators:\n  SMA20 {}  SMA50 {}\n  RSI14 {}\n  MACD {} / signal {}\n  Bollinger {} / {} / {}\n  ATR20 {}\n  Trend {}\n",
        fmt_opt(t.sma_20, 2),
        fmt_opt(t.sma_50, 2),
        fmt_opt(t.rsi, 1),
        fmt_opt(t.macd, 4),
        fmt_opt(t.macd_signal, 4),
        fmt_opt(t.bb_upper, 2),
        fmt_opt(t.bb_middle, 2),
        fmt_opt(t.bb_lower, 2),
        fmt_opt(t.atr, 2),
        trend
    ));

    match position {
        Some(p) => out.push_str(&format!(
            "\nCurrent position: {} {} @ {:.2}, {:.1}x, unrealized PnL {:.2} USDT\n",
            p.side.as_str(),
            p.size,
            p.entry_price,
            p.leverage,
            p.unrealized_pnl
        )),
        None => out.push_str("\nCurrent position: none\n"),
    }

    out.push_str(
        "\nReply in this exact JSON format:\n\
         {\"signal\": \"BUY|SELL|HOLD\", \"reason\": \"short rationale\", \
         \"stop_loss\": number, \"take_profit\": number, \"confidence\": \"HIGH|MEDIUM|LOW\"}\n",
    );
    out
}

/// Extracts and validates the JSON object in a model reply.
pub fn parse_signal(text: &str, policy: ParsePolicy) -> Result<Signal, SignalError> {
    let start = text.find('{');
    let end = text.rfind('}');
    let raw = match (start, end) {
        (Some(s), Some(e)) if e > s => &text[s..=e],
        _ => return Err(SignalError::Malformed("no JSON object in reply".into())),
    };

    let payload: SignalPayload = match serde_json::from_str(raw) {
        Ok(p) => p,
        Err(strict_err) => match policy {
            ParsePolicy::Strict => return Err(SignalError::Malformed(strict_err.to_string())),
            ParsePolicy::Repair => {
                let repaired = repair_json(raw)?;
                let mut value: Value =
                    serde_json::from_str(&repaired).map_err(|e| SignalError::Malformed(e.to_string()))?;
                for key in ["signal", "confidence"] {
                    if let Some(s) = value[key].as_str() {
                        value[key] = Value::from(s.trim().to_uppercase());
                    }
                }
                serde_json::from_value(value).map_err(|e| SignalError::Malformed(e.to_string()))?
            }
        },
    };

    let positive = |x: &f64| x.is_finite() && *x > 0.0;
    Ok(Signal {
        direction: payload.signal,
        confidence: payload.confidence,
        stop_loss: payload.stop_loss.filter(positive),
        take_profit: payload.take_profit.filter(positive),
        reason: payload.reason,
        timestamp: Utc::now(),
        is_fallback: false,
    })
}

/// Single-quote substitution, bare-key quoting and trailing-comma removal.
fn repair_json(raw: &str) -> Result<String, SignalError> {
    let compile = |p: &str| Regex::new(p).map_err(|e| SignalError::Malformed(format!("bad repair pattern: {}", e)));
    let bare_key = compile(r"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)\s*:")?;
    let trailing = compile(r",\s*([}\]])")?;

    let s = raw.replace('\'', "\"");
    let s = bare_key.replace_all(&s, "$1\"$2\":");
    let s = trailing.replace_all(&s, "$1");
    Ok(s.into_owned())
}
