use std::sync::Arc;

use super::*;
use crate::kv::LocalBackend;

#[tokio::test]
async fn admits_up_to_burst_then_denies() {
    let rl = RateLimiter::new(Arc::new(LocalBackend::new()));
    for _ in 0..3 {
        let o = rl.check("global", "all", 0.0, 3.0).await;
        assert!(o.allowed);
    }
    let denied = rl.check("global", "all", 0.0, 3.0).await;
    assert!(!denied.allowed);
    assert_eq!(denied.used, denied.burst);
}

#[tokio::test]
async fn refills_over_time() {
    let rl = RateLimiter::new(Arc::new(LocalBackend::new()));
    let o = rl.check("global", "all", 100.0, 1.0).await;
    assert!(o.allowed);
    let immediate = rl.check("global", "all", 100.0, 1.0).await;
    assert!(!immediate.allowed);

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let refilled = rl.check("global", "all", 100.0, 1.0).await;
    assert!(refilled.allowed);
}

#[tokio::test]
async fn escapes_identifier_in_key_without_panicking() {
    let rl = RateLimiter::new(Arc::new(LocalBackend::new()));
    let o = rl.check("ip", "::1 weird/id?a=b", 10.0, 5.0).await;
    assert!(o.allowed);
}
