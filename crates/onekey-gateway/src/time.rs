use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock seconds with fractional precision, the single time source
/// shared by the rate limiter and circuit breaker scripts. All callers
/// within one pipeline pass must sample this once and thread the same
/// value through, so a script never observes two different "now"s.
pub fn now_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
