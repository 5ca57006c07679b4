use thiserror::Error;

/// Errors from a single exchange call, classified the way Bybit reports them.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    /// Rate limited (retCode=10006 or HTTP 429). retry_after in seconds.
    #[error("rate limited (retry after {retry_after}s)")]
    RateLimit { retry_after: u64 },
    /// Network, timeout, HTTP 5xx, server overload (retCode=10016).
    #[error("transient error: {0}")]
    Transient(String),
    /// Invalid params, insufficient balance, HTTP 4xx.
    #[error("permanent error: {0}")]
    Permanent(String),
}

impl ExchangeError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ExchangeError::Permanent(_))
    }
}

/// Classify a Bybit retCode + HTTP status.
pub fn classify_error(ret_code: i64, http_status: u16, msg: &str) -> ExchangeError {
    match (ret_code, http_status) {
        (10006, _) | (_, 429) => ExchangeError::RateLimit { retry_after: 10 },
        (10016, _) | (_, 500..=599) => ExchangeError::Transient(msg.to_string()),
        _ => ExchangeError::Permanent(format!("retCode={} msg={}", ret_code, msg)),
    }
}

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("signal provider request failed: {0}")]
    Provider(String),
    #[error("malformed signal: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Tick-level failure taxonomy. None of these stops the control loop.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Snapshot missing or stale: the tick is aborted with no trade.
    #[error("market data unavailable: {0}")]
    DataUnavailable(String),

    #[error(transparent)]
    Signal(#[from] SignalError),

    /// An exchange call failed after its retry budget.
    #[error("exchange call `{call}` failed: {source}")]
    ExchangeCall {
        call: &'static str,
        #[source]
        source: ExchangeError,
    },

    /// Computed stop/target failed the side/positivity checks.
    #[error("risk level validation failed: {0}")]
    Validation(String),

    #[error("insufficient margin: required {required:.2} USDT, allowed {allowed:.2} USDT")]
    InsufficientMargin { required: f64, allowed: f64 },

    /// An internal invariant was violated. Fatal for the current tick only.
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn exchange(call: &'static str, source: ExchangeError) -> Self {
        EngineError::ExchangeCall { call, source }
    }

    /// Whether the outer loop must wait out the error cooldown before the next tick.
    pub fn needs_cooldown(&self) -> bool {
        matches!(self, EngineError::Internal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_rate_limit_and_transient() {
        assert!(matches!(
            classify_error(10006, 200, "too many"),
            ExchangeError::RateLimit { .. }
        ));
        assert!(matches!(classify_error(0, 503, "busy"), ExchangeError::Transient(_)));
        let e = classify_error(110007, 200, "ab not enough");
        assert!(!e.is_retryable());
    }

    #[test]
    fn only_internal_errors_need_cooldown() {
        assert!(EngineError::Internal("x".into()).needs_cooldown());
        assert!(!EngineError::DataUnavailable("x".into()).needs_cooldown());
        assert!(!EngineError::Validation("x".into()).needs_cooldown());
    }
}
