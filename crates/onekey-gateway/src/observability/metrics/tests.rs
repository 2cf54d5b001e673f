use super::*;

#[test]
fn percentile_saturates_tail_bucket_at_1000() {
    let reg = Registry::new();
    for _ in 0..10 {
        reg.record_latency("p", 5000.0);
    }
    assert_eq!(reg.p50("p"), Some(1000.0));
    assert_eq!(reg.p99("p"), Some(1000.0));
}

#[test]
fn percentile_picks_bucket_upper_bound() {
    let reg = Registry::new();
    for _ in 0..9 {
        reg.record_latency("p", 5.0);
    }
    reg.record_latency("p", 5000.0);
    // p50 should land in the <10ms bucket
    assert_eq!(reg.p50("p"), Some(10.0));
}

#[test]
fn unknown_provider_has_no_percentile() {
    let reg = Registry::new();
    assert_eq!(reg.p50("nope"), None);
}
