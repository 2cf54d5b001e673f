use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::routing::{any, get};
use axum::Router;

use super::handle;
use crate::breaker::CircuitBreaker;
use crate::cache::ResponseCache;
use crate::config::{
    AuthType, BucketConfig, CircuitBreakerConfig, Config, LoggingConfig, Provider, ProxyConfig,
    RateLimitConfig, RedisConfig, RetryConfig, StressTestConfig,
};
use crate::kv::{DegradingKv, KvBackend, LocalBackend};
use crate::observability::Registry;
use crate::ratelimit::RateLimiter;
use crate::state::AppState;
use crate::upstream::UpstreamClient;

async fn spawn_stub(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn test_provider(upstream: String) -> Provider {
    Provider {
        id: "p".into(),
        prefix: "/p".into(),
        upstream,
        auth_type: AuthType::None,
        auth_header: None,
        api_key: Some("k".into()),
        connect_timeout: Duration::from_millis(200),
        send_timeout: Duration::from_millis(200),
        read_timeout: Duration::from_millis(200),
        retry_max_attempts: RetryConfig::default().times + 1,
        retry_base_delay: Duration::from_millis(10),
        ssl_verify: true,
    }
}

fn state_with(providers: Vec<Provider>, cb: CircuitBreakerConfig, rl: RateLimitConfig) -> AppState {
    let kv: Arc<dyn KvBackend> = Arc::new(DegradingKv::new(None, Arc::new(LocalBackend::new())));
    let upstream = Arc::new(UpstreamClient::new(&providers));
    let config = Arc::new(Config {
        redis: RedisConfig::default(),
        providers,
        circuit_breaker: cb,
        rate_limit: rl,
        proxy: ProxyConfig {
            max_body_size: 1024 * 1024,
            cache_ttl: 1.0,
            cache_max_body_size: 1024 * 1024,
        },
        logging: LoggingConfig::default(),
        stress_test: StressTestConfig::default(),
    });
    AppState {
        rate_limiter: Arc::new(RateLimiter::new(kv.clone())),
        breaker: Arc::new(CircuitBreaker::new(kv.clone(), config.circuit_breaker.clone())),
        cache: Arc::new(ResponseCache::new(kv.clone(), config.proxy.cache_ttl, config.proxy.cache_max_body_size)),
        upstream,
        metrics: Arc::new(Registry::new()),
        host_id: Arc::new("test-host".into()),
        kv,
        config,
    }
}

async fn call(state: &AppState, method: Method, path: &str) -> axum::response::Response {
    handle(
        state.clone(),
        method,
        Uri::try_from(path).unwrap(),
        HeaderMap::new(),
        "127.0.0.1:9999".parse::<SocketAddr>().unwrap(),
        Bytes::new(),
    )
    .await
}

#[tokio::test]
async fn unknown_prefix_returns_404_without_upstream_call() {
    let state = state_with(vec![], CircuitBreakerConfig::default(), RateLimitConfig::default());
    let resp = call(&state, Method::GET, "/unknown/x").await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    assert!(String::from_utf8_lossy(&body).contains("Provider not found"));
}

#[tokio::test]
async fn global_rate_limit_denies_second_request() {
    let base = spawn_stub(Router::new().route("/x", get(|| async { "ok" }))).await;
    let mut rl = RateLimitConfig::default();
    rl.global = Some(BucketConfig { rate: 0.0, burst: 1.0 });
    let state = state_with(vec![test_provider(base)], CircuitBreakerConfig::default(), rl);

    let first = call(&state, Method::GET, "/p/x").await;
    assert_eq!(first.status(), StatusCode::OK);

    let second = call(&state, Method::GET, "/p/x").await;
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(second.headers().get("retry-after").unwrap(), "60");
    let body = axum::body::to_bytes(second.into_body(), usize::MAX).await.unwrap();
    assert!(String::from_utf8_lossy(&body).contains("\"type\":\"global\""));
}

#[tokio::test]
async fn breaker_trips_then_recovers_through_half_open() {
    use std::sync::atomic::{AtomicU32, Ordering};
    let hits = Arc::new(AtomicU32::new(0));
    let hits_for_route = hits.clone();
    let base = spawn_stub(Router::new().route(
        "/x",
        any(move || {
            let hits = hits_for_route.clone();
            async move {
                if hits.fetch_add(1, Ordering::SeqCst) < 3 {
                    (StatusCode::INTERNAL_SERVER_ERROR, "boom")
                } else {
                    (StatusCode::OK, "fixed")
                }
            }
        }),
    ))
    .await;
    let cb = CircuitBreakerConfig {
        failure_threshold: 3,
        success_threshold: 2,
        timeout_seconds: 1.0,
        half_open_requests: 1,
    };
    let state = state_with(vec![test_provider(base)], cb, RateLimitConfig::default());

    for _ in 0..3 {
        let resp = call(&state, Method::GET, "/p/x").await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    let denied = call(&state, Method::GET, "/p/x").await;
    assert_eq!(denied.status(), StatusCode::SERVICE_UNAVAILABLE);

    tokio::time::sleep(Duration::from_millis(1100)).await;

    let probe1 = call(&state, Method::GET, "/p/x").await;
    assert_eq!(probe1.status(), StatusCode::OK);
    let mid_stats = state.breaker.stats("p").await;
    assert_eq!(mid_stats.state, crate::breaker::BreakerState::HalfOpen);
    assert_eq!(mid_stats.success, 1);

    let probe2 = call(&state, Method::GET, "/p/x").await;
    assert_eq!(probe2.status(), StatusCode::OK);

    let stats = state.breaker.stats("p").await;
    assert_eq!(stats.state, crate::breaker::BreakerState::Closed);
    assert_eq!(stats.failures, 0);
}

#[tokio::test]
async fn stale_cache_serves_degraded_response_when_breaker_open() {
    let base = spawn_stub(Router::new().route("/x", get(|| async { "fresh" }))).await;
    let cb = CircuitBreakerConfig {
        failure_threshold: 1,
        success_threshold: 1,
        timeout_seconds: 9999.0,
        half_open_requests: 1,
    };
    let state = state_with(vec![test_provider(base)], cb, RateLimitConfig::default());

    let first = call(&state, Method::GET, "/p/x").await;
    assert_eq!(first.status(), StatusCode::OK);

    // Trip the breaker directly so the next request is denied admission.
    state.breaker.record_failure("p").await;

    let second = call(&state, Method::GET, "/p/x").await;
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(second.headers().get("x-degraded").unwrap(), "cache");
    assert!(second.headers().get("x-cache-age").is_some());
}
