use std::sync::Arc;

use crate::breaker::CircuitBreaker;
use crate::cache::ResponseCache;
use crate::config::Config;
use crate::kv::{DegradingKv, KvBackend, LocalBackend, RedisBackend};
use crate::observability::Registry;
use crate::ratelimit::RateLimiter;
use crate::upstream::UpstreamClient;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub kv: Arc<dyn KvBackend>,
    pub rate_limiter: Arc<RateLimiter>,
    pub breaker: Arc<CircuitBreaker>,
    pub cache: Arc<ResponseCache>,
    pub upstream: Arc<UpstreamClient>,
    pub metrics: Arc<Registry>,
    pub host_id: Arc<String>,
}

impl AppState {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let local = Arc::new(LocalBackend::new());
        let distributed = if config.redis.enabled {
            Some(Arc::new(RedisBackend::connect(&config.redis).await?))
        } else {
            None
        };
        let kv: Arc<dyn KvBackend> = Arc::new(DegradingKv::new(distributed, local));

        let rate_limiter = Arc::new(RateLimiter::new(kv.clone()));
        let breaker = Arc::new(CircuitBreaker::new(kv.clone(), config.circuit_breaker.clone()));
        let cache = Arc::new(ResponseCache::new(
            kv.clone(),
            config.proxy.cache_ttl,
            config.proxy.cache_max_body_size,
        ));
        let upstream = Arc::new(UpstreamClient::new(&config.providers));
        let metrics = Arc::new(Registry::new());
        let host_id = Arc::new(
            std::env::var("HOSTNAME").unwrap_or_else(|_| "onekey-gateway".to_string()),
        );

        Ok(Self {
            config,
            kv,
            rate_limiter,
            breaker,
            cache,
            upstream,
            metrics,
            host_id,
        })
    }
}
