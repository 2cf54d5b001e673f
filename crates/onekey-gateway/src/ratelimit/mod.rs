#[cfg(test)]
mod tests;

use std::sync::Arc;

use crate::kv::KvBackend;
use crate::time::now_seconds;

#[derive(Debug, Clone, Copy)]
pub struct RateLimitOutcome {
    pub allowed: bool,
    pub burst: f64,
    pub used: f64,
}

/// Token-bucket admission over an arbitrary scope/identifier pair. The
/// pipeline calls this three times per request (global, provider, ip);
/// the scope string is only used for the KV key and the denial tag.
pub struct RateLimiter {
    kv: Arc<dyn KvBackend>,
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn KvBackend>) -> Self {
        Self { kv }
    }

    pub async fn check(&self, scope: &str, identifier: &str, rate: f64, burst: f64) -> RateLimitOutcome {
        let key = format!("ratelimit:{scope}:{}", urlencoding::encode(identifier));
        let now = now_seconds();
        match self.kv.eval_rate_limit_check(&key, rate, burst, now).await {
            Ok(outcome) => outcome,
            // A KV failure must never block traffic; admit and let the
            // caller's own backend degradation warning carry the signal.
            Err(_) => RateLimitOutcome {
                allowed: true,
                burst,
                used: 0.0,
            },
        }
    }
}
