use std::sync::Arc;

use super::*;
use crate::config::CircuitBreakerConfig;
use crate::kv::LocalBackend;

fn breaker(cfg: CircuitBreakerConfig) -> CircuitBreaker {
    CircuitBreaker::new(Arc::new(LocalBackend::new()), cfg)
}

fn cfg() -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold: 3,
        success_threshold: 2,
        timeout_seconds: 1.0,
        half_open_requests: 1,
    }
}

#[tokio::test]
async fn starts_closed_and_admits() {
    let cb = breaker(cfg());
    assert_eq!(cb.get_state("p").await, BreakerState::Closed);
    let outcome = cb.allow_request("p").await;
    assert!(outcome.admitted);
    assert_eq!(outcome.state, BreakerState::Closed);
}

#[tokio::test]
async fn success_in_closed_only_zeroes_failures() {
    let cb = breaker(cfg());
    cb.record_failure("p").await;
    cb.record_failure("p").await;
    let r = cb.record_success("p").await;
    assert_eq!(r.state, BreakerState::Closed);
    assert_eq!(cb.get_state("p").await, BreakerState::Closed);
}

#[tokio::test]
async fn trips_open_after_threshold_failures() {
    let cb = breaker(cfg());
    cb.record_failure("p").await;
    cb.record_failure("p").await;
    let r = cb.record_failure("p").await;
    assert_eq!(r.state, BreakerState::Open);
    let outcome = cb.allow_request("p").await;
    assert!(!outcome.admitted);
    assert_eq!(outcome.state, BreakerState::Open);
}

#[tokio::test]
async fn half_open_requires_success_threshold_then_closes() {
    let cb = breaker(cfg());
    cb.record_failure("p").await;
    cb.record_failure("p").await;
    cb.record_failure("p").await;
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;

    let first = cb.allow_request("p").await;
    assert!(first.admitted);
    assert_eq!(first.state, BreakerState::HalfOpen);

    // a second concurrent probe should be denied: half_open_requests = 1
    let second = cb.allow_request("p").await;
    assert!(!second.admitted);

    let after_first_success = cb.record_success("p").await;
    assert_eq!(after_first_success.state, BreakerState::HalfOpen);
    assert_eq!(after_first_success.success, 1);

    cb.release_half_open_slot("p").await;
    let third = cb.allow_request("p").await;
    assert!(third.admitted);

    let closed = cb.record_success("p").await;
    assert_eq!(closed.state, BreakerState::Closed);
    assert_eq!(closed.failures, 0);
}

#[tokio::test]
async fn half_open_failure_reopens_and_resets_inflight() {
    let cb = breaker(cfg());
    cb.record_failure("p").await;
    cb.record_failure("p").await;
    cb.record_failure("p").await;
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;

    let probe = cb.allow_request("p").await;
    assert!(probe.admitted);

    let after_fail = cb.record_failure("p").await;
    assert_eq!(after_fail.state, BreakerState::Open);

    // release_half_open_slot must be a no-op now that state != HALF_OPEN,
    // so it never drives inflight negative.
    cb.release_half_open_slot("p").await;
    let stats = cb.stats("p").await;
    assert_eq!(stats.half_open_inflight, 0);
}

#[tokio::test]
async fn release_is_noop_when_not_half_open() {
    let cb = breaker(cfg());
    cb.release_half_open_slot("p").await;
    cb.release_half_open_slot("p").await;
    let stats = cb.stats("p").await;
    assert_eq!(stats.half_open_inflight, 0);
    assert_eq!(stats.state, BreakerState::Closed);
}
