#[cfg(test)]
mod tests;

use std::sync::Arc;

use serde::Serialize;

use crate::config::CircuitBreakerConfig;
use crate::kv::KvBackend;
use crate::observability::events;
use crate::time::now_seconds;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => BreakerState::Open,
            2 => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "CLOSED",
            BreakerState::Open => "OPEN",
            BreakerState::HalfOpen => "HALF_OPEN",
        }
    }

    /// Used as the `provider_health` gauge value: 1 closed, 0.5 half-open, 0 open.
    pub fn health_value(&self) -> f64 {
        match self {
            BreakerState::Closed => 1.0,
            BreakerState::HalfOpen => 0.5,
            BreakerState::Open => 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerRecordResult {
    pub state: BreakerState,
    pub failures: u32,
    pub success: u32,
    pub half_open_inflight: u32,
}

impl BreakerRecordResult {
    pub fn from_raw(raw: &[i64]) -> Self {
        Self {
            state: BreakerState::from_code(raw[0]),
            failures: raw[1].max(0) as u32,
            success: raw[2].max(0) as u32,
            half_open_inflight: raw[3].max(0) as u32,
        }
    }
}

pub struct AllowOutcome {
    pub admitted: bool,
    pub state: BreakerState,
}

/// Per-provider three-state machine. All state lives in the KV backend;
/// this struct only holds the shared config and a handle to it.
pub struct CircuitBreaker {
    kv: Arc<dyn KvBackend>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(kv: Arc<dyn KvBackend>, config: CircuitBreakerConfig) -> Self {
        Self { kv, config }
    }

    /// Read-only state peek used by the pipeline's step 3 (fresh-cache
    /// gate) and the admin stats endpoint. On KV failure, fails open
    /// (treats the breaker as CLOSED) rather than surfacing to the client.
    pub async fn get_state(&self, provider: &str) -> BreakerState {
        match self.kv.get(&format!("cb:state:{provider}")).await {
            Ok(Some(raw)) => raw.parse::<i64>().map(BreakerState::from_code).unwrap_or(BreakerState::Closed),
            _ => BreakerState::Closed,
        }
    }

    pub async fn allow_request(&self, provider: &str) -> AllowOutcome {
        let before = self.get_state(provider).await;
        let now = now_seconds();
        let outcome = match self
            .kv
            .eval_breaker_allow(
                provider,
                self.config.timeout_seconds,
                self.config.half_open_requests,
                now,
            )
            .await
        {
            Ok((admitted, state)) => AllowOutcome { admitted, state },
            Err(_) => AllowOutcome {
                admitted: true,
                state: BreakerState::Closed,
            },
        };
        if outcome.state != before {
            events::breaker_transition(provider, before.as_str(), outcome.state.as_str());
        }
        outcome
    }

    pub async fn record_success(&self, provider: &str) -> BreakerRecordResult {
        let before = self.get_state(provider).await;
        let result = match self
            .kv
            .eval_breaker_record_success(provider, self.config.success_threshold)
            .await
        {
            Ok(r) => r,
            Err(_) => BreakerRecordResult {
                state: BreakerState::Closed,
                failures: 0,
                success: 0,
                half_open_inflight: 0,
            },
        };
        if result.state != before {
            events::breaker_transition(provider, before.as_str(), result.state.as_str());
        }
        result
    }

    pub async fn record_failure(&self, provider: &str) -> BreakerRecordResult {
        let before = self.get_state(provider).await;
        let now = now_seconds();
        let result = match self
            .kv
            .eval_breaker_record_failure(provider, self.config.failure_threshold, now)
            .await
        {
            Ok(r) => r,
            Err(_) => BreakerRecordResult {
                state: BreakerState::Closed,
                failures: 0,
                success: 0,
                half_open_inflight: 0,
            },
        };
        if result.state != before {
            events::breaker_transition(provider, before.as_str(), result.state.as_str());
        }
        result
    }

    /// No-op unless the request was actually admitted; see the pipeline's
    /// bookkeeping of the `admitted` flag at the call site.
    pub async fn release_half_open_slot(&self, provider: &str) {
        let _ = self.kv.eval_breaker_release_half_open_slot(provider).await;
    }

    pub async fn stats(&self, provider: &str) -> BreakerStats {
        let state = self.get_state(provider).await;
        let failures = self
            .kv
            .get(&format!("cb:failures:{provider}"))
            .await
            .ok()
            .flatten()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let success = self
            .kv
            .get(&format!("cb:success:{provider}"))
            .await
            .ok()
            .flatten()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let last_failure = self
            .kv
            .get(&format!("cb:last_failure:{provider}"))
            .await
            .ok()
            .flatten()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0);
        let half_open_inflight = self
            .kv
            .get(&format!("cb:half_open_count:{provider}"))
            .await
            .ok()
            .flatten()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        BreakerStats {
            state,
            failures,
            success,
            last_failure,
            half_open_inflight,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BreakerStats {
    pub state: BreakerState,
    pub failures: u32,
    pub success: u32,
    pub last_failure: f64,
    pub half_open_inflight: u32,
}
