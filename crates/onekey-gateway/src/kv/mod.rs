mod distributed;
mod local;
pub mod scripts;

pub use distributed::RedisBackend;
pub use local::LocalBackend;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::breaker::{BreakerRecordResult, BreakerState};
use crate::observability::events;
use crate::ratelimit::RateLimitOutcome;

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("kv operation timed out")]
    Timeout,
    #[error("kv authentication failed")]
    AuthFailed,
    #[error("kv script error: {0}")]
    ScriptError(String),
    #[error("kv backend unavailable: {0}")]
    Unavailable(String),
}

pub type KvResult<T> = Result<T, KvError>;

/// Narrow capability shared by both backends. The four circuit-breaker
/// scripts and the one rate-limit script are a fixed, enumerated
/// catalogue; every other operation is a plain get/set/incr/delete used
/// by the cache and admin stats.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> KvResult<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()>;
    async fn incr_by(&self, key: &str, delta: i64, default: i64) -> KvResult<i64>;
    async fn delete(&self, key: &str) -> KvResult<()>;

    async fn eval_rate_limit_check(
        &self,
        bucket_key: &str,
        rate: f64,
        burst: f64,
        now: f64,
    ) -> KvResult<RateLimitOutcome>;

    async fn eval_breaker_allow(
        &self,
        provider: &str,
        timeout_seconds: f64,
        half_open_requests: u32,
        now: f64,
    ) -> KvResult<(bool, BreakerState)>;

    async fn eval_breaker_record_success(
        &self,
        provider: &str,
        success_threshold: u32,
    ) -> KvResult<BreakerRecordResult>;

    async fn eval_breaker_record_failure(
        &self,
        provider: &str,
        failure_threshold: u32,
        now: f64,
    ) -> KvResult<BreakerRecordResult>;

    async fn eval_breaker_release_half_open_slot(&self, provider: &str) -> KvResult<()>;
}

/// Composite backend implementing the per-call degradation policy: try
/// the distributed backend first when configured, and on any error fall
/// back to the local backend for that single operation only. A single
/// logical call is either entirely distributed or entirely local.
pub struct DegradingKv {
    distributed: Option<Arc<RedisBackend>>,
    local: Arc<LocalBackend>,
}

impl DegradingKv {
    pub fn new(distributed: Option<Arc<RedisBackend>>, local: Arc<LocalBackend>) -> Self {
        Self { distributed, local }
    }

    fn warn_degraded(op: &str, err: &KvError) {
        events::kv_degraded(op, &err.to_string());
    }
}

macro_rules! degrade {
    ($self:ident, $op:literal, $method:ident ( $($arg:expr),* ) ) => {{
        if let Some(d) = $self.distributed.as_ref() {
            match d.$method($($arg),*).await {
                Ok(v) => return Ok(v),
                Err(e) => Self::warn_degraded($op, &e),
            }
        }
        $self.local.$method($($arg),*).await
    }};
}

#[async_trait]
impl KvBackend for DegradingKv {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        degrade!(self, "get", get(key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()> {
        degrade!(self, "set", set(key, value, ttl))
    }

    async fn incr_by(&self, key: &str, delta: i64, default: i64) -> KvResult<i64> {
        degrade!(self, "incr_by", incr_by(key, delta, default))
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        degrade!(self, "delete", delete(key))
    }

    async fn eval_rate_limit_check(
        &self,
        bucket_key: &str,
        rate: f64,
        burst: f64,
        now: f64,
    ) -> KvResult<RateLimitOutcome> {
        degrade!(
            self,
            "rate_limit_check",
            eval_rate_limit_check(bucket_key, rate, burst, now)
        )
    }

    async fn eval_breaker_allow(
        &self,
        provider: &str,
        timeout_seconds: f64,
        half_open_requests: u32,
        now: f64,
    ) -> KvResult<(bool, BreakerState)> {
        degrade!(
            self,
            "breaker_allow",
            eval_breaker_allow(provider, timeout_seconds, half_open_requests, now)
        )
    }

    async fn eval_breaker_record_success(
        &self,
        provider: &str,
        success_threshold: u32,
    ) -> KvResult<BreakerRecordResult> {
        degrade!(
            self,
            "breaker_record_success",
            eval_breaker_record_success(provider, success_threshold)
        )
    }

    async fn eval_breaker_record_failure(
        &self,
        provider: &str,
        failure_threshold: u32,
        now: f64,
    ) -> KvResult<BreakerRecordResult> {
        degrade!(
            self,
            "breaker_record_failure",
            eval_breaker_record_failure(provider, failure_threshold, now)
        )
    }

    async fn eval_breaker_release_half_open_slot(&self, provider: &str) -> KvResult<()> {
        degrade!(
            self,
            "breaker_release_half_open_slot",
            eval_breaker_release_half_open_slot(provider)
        )
    }
}
