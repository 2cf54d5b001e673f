use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{KvBackend, KvResult};
use crate::breaker::{BreakerRecordResult, BreakerState};
use crate::ratelimit::RateLimitOutcome;
use crate::time::now_seconds;

struct Entry {
    value: String,
    expires_at: Option<f64>,
}

/// In-process mapping from key to (value, absolute expiry). All mutation
/// goes through one mutex guarding the whole map, giving the same
/// atomicity-per-script guarantee the distributed backend gets from
/// server-side Lua execution.
pub struct LocalBackend {
    map: Mutex<HashMap<String, Entry>>,
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBackend {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    fn live(entry: &Entry, now: f64) -> bool {
        entry.expires_at.is_none_or(|exp| exp > now)
    }

    async fn read_raw(&self, key: &str) -> Option<String> {
        let now = now_seconds();
        let map = self.map.lock().await;
        map.get(key)
            .filter(|e| Self::live(e, now))
            .map(|e| e.value.clone())
    }

    async fn write_raw(&self, key: &str, value: String, ttl: Option<Duration>) {
        let mut map = self.map.lock().await;
        let expires_at = ttl.map(|d| now_seconds() + d.as_secs_f64());
        map.insert(key.to_string(), Entry { value, expires_at });
    }

    fn breaker_keys(provider: &str) -> [String; 5] {
        [
            format!("cb:state:{provider}"),
            format!("cb:failures:{provider}"),
            format!("cb:success:{provider}"),
            format!("cb:last_failure:{provider}"),
            format!("cb:half_open_count:{provider}"),
        ]
    }
}

#[async_trait]
impl KvBackend for LocalBackend {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        Ok(self.read_raw(key).await)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()> {
        self.write_raw(key, value.to_string(), ttl).await;
        Ok(())
    }

    async fn incr_by(&self, key: &str, delta: i64, default: i64) -> KvResult<i64> {
        let mut map = self.map.lock().await;
        let now = now_seconds();
        let current = map
            .get(key)
            .filter(|e| Self::live(e, now))
            .and_then(|e| e.value.parse::<i64>().ok())
            .unwrap_or(default);
        let next = current + delta;
        map.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at: None,
            },
        );
        Ok(next)
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        let mut map = self.map.lock().await;
        map.remove(key);
        Ok(())
    }

    async fn eval_rate_limit_check(
        &self,
        bucket_key: &str,
        rate: f64,
        burst: f64,
        now: f64,
    ) -> KvResult<RateLimitOutcome> {
        let mut map = self.map.lock().await;
        let (mut tokens, last) = match map.get(bucket_key).filter(|e| Self::live(e, now)) {
            Some(e) => parse_bucket(&e.value).unwrap_or((burst, now)),
            None => (burst, now),
        };
        let elapsed = (now - last).max(0.0);
        tokens = (tokens + elapsed * rate).min(burst);

        if tokens >= 1.0 {
            tokens -= 1.0;
            map.insert(
                bucket_key.to_string(),
                Entry {
                    value: format!("{tokens:.6}:{now:.6}"),
                    expires_at: Some(now + 60.0),
                },
            );
            Ok(RateLimitOutcome {
                allowed: true,
                burst,
                used: burst - tokens,
            })
        } else {
            Ok(RateLimitOutcome {
                allowed: false,
                burst,
                used: burst,
            })
        }
    }

    async fn eval_breaker_allow(
        &self,
        provider: &str,
        timeout_seconds: f64,
        half_open_requests: u32,
        now: f64,
    ) -> KvResult<(bool, BreakerState)> {
        let [state_k, _failures_k, _success_k, last_failure_k, half_open_k] =
            Self::breaker_keys(provider);
        let mut map = self.map.lock().await;
        let state = read_int(&map, &state_k).unwrap_or(0);

        match state {
            0 => Ok((true, BreakerState::Closed)),
            1 => {
                let last_failure = read_f64(&map, &last_failure_k).unwrap_or(0.0);
                if (now - last_failure) > timeout_seconds {
                    set_int(&mut map, &state_k, 2);
                    set_int(&mut map, &Self::breaker_keys(provider)[2], 0);
                    set_int(&mut map, &half_open_k, 0);
                    Ok((true, BreakerState::HalfOpen))
                } else {
                    Ok((false, BreakerState::Open))
                }
            }
            _ => {
                let inflight = read_int(&map, &half_open_k).unwrap_or(0);
                if inflight < half_open_requests as i64 {
                    set_int(&mut map, &half_open_k, inflight + 1);
                    Ok((true, BreakerState::HalfOpen))
                } else {
                    Ok((false, BreakerState::HalfOpen))
                }
            }
        }
    }

    async fn eval_breaker_record_success(
        &self,
        provider: &str,
        success_threshold: u32,
    ) -> KvResult<BreakerRecordResult> {
        let [state_k, failures_k, success_k, _last_failure_k, half_open_k] =
            Self::breaker_keys(provider);
        let mut map = self.map.lock().await;
        let state = read_int(&map, &state_k).unwrap_or(0);

        match state {
            0 => {
                set_int(&mut map, &failures_k, 0);
                Ok(BreakerRecordResult {
                    state: BreakerState::Closed,
                    failures: 0,
                    success: 0,
                    half_open_inflight: 0,
                })
            }
            2 => {
                let success = read_int(&map, &success_k).unwrap_or(0) + 1;
                set_int(&mut map, &success_k, success);
                if success >= success_threshold as i64 {
                    set_int(&mut map, &state_k, 0);
                    set_int(&mut map, &failures_k, 0);
                    set_int(&mut map, &success_k, 0);
                    set_int(&mut map, &half_open_k, 0);
                    Ok(BreakerRecordResult {
                        state: BreakerState::Closed,
                        failures: 0,
                        success: 0,
                        half_open_inflight: 0,
                    })
                } else {
                    let inflight = read_int(&map, &half_open_k).unwrap_or(0);
                    Ok(BreakerRecordResult {
                        state: BreakerState::HalfOpen,
                        failures: 0,
                        success: success as u32,
                        half_open_inflight: inflight as u32,
                    })
                }
            }
            _ => {
                let failures = read_int(&map, &failures_k).unwrap_or(0);
                Ok(BreakerRecordResult {
                    state: BreakerState::Open,
                    failures: failures as u32,
                    success: 0,
                    half_open_inflight: 0,
                })
            }
        }
    }

    async fn eval_breaker_record_failure(
        &self,
        provider: &str,
        failure_threshold: u32,
        now: f64,
    ) -> KvResult<BreakerRecordResult> {
        let [state_k, failures_k, _success_k, last_failure_k, half_open_k] =
            Self::breaker_keys(provider);
        let mut map = self.map.lock().await;
        let state = read_int(&map, &state_k).unwrap_or(0);

        match state {
            0 => {
                let failures = read_int(&map, &failures_k).unwrap_or(0) + 1;
                set_int(&mut map, &failures_k, failures);
                if failures >= failure_threshold as i64 {
                    set_int(&mut map, &state_k, 1);
                    set_f64(&mut map, &last_failure_k, now);
                    Ok(BreakerRecordResult {
                        state: BreakerState::Open,
                        failures: failures as u32,
                        success: 0,
                        half_open_inflight: 0,
                    })
                } else {
                    Ok(BreakerRecordResult {
                        state: BreakerState::Closed,
                        failures: failures as u32,
                        success: 0,
                        half_open_inflight: 0,
                    })
                }
            }
            2 => {
                set_int(&mut map, &state_k, 1);
                set_f64(&mut map, &last_failure_k, now);
                set_int(&mut map, &half_open_k, 0);
                let failures = read_int(&map, &failures_k).unwrap_or(0);
                Ok(BreakerRecordResult {
                    state: BreakerState::Open,
                    failures: failures as u32,
                    success: 0,
                    half_open_inflight: 0,
                })
            }
            _ => {
                set_f64(&mut map, &last_failure_k, now);
                let failures = read_int(&map, &failures_k).unwrap_or(0);
                Ok(BreakerRecordResult {
                    state: BreakerState::Open,
                    failures: failures as u32,
                    success: 0,
                    half_open_inflight: 0,
                })
            }
        }
    }

    async fn eval_breaker_release_half_open_slot(&self, provider: &str) -> KvResult<()> {
        let [state_k, _failures_k, _success_k, _last_failure_k, half_open_k] =
            Self::breaker_keys(provider);
        let mut map = self.map.lock().await;
        let state = read_int(&map, &state_k).unwrap_or(0);
        if state == 2 {
            let inflight = read_int(&map, &half_open_k).unwrap_or(0);
            if inflight > 0 {
                set_int(&mut map, &half_open_k, inflight - 1);
            }
        }
        Ok(())
    }
}

fn parse_bucket(raw: &str) -> Option<(f64, f64)> {
    let (tokens, last) = raw.split_once(':')?;
    Some((tokens.parse().ok()?, last.parse().ok()?))
}

fn read_int(map: &HashMap<String, Entry>, key: &str) -> Option<i64> {
    map.get(key).and_then(|e| e.value.parse().ok())
}

fn read_f64(map: &HashMap<String, Entry>, key: &str) -> Option<f64> {
    map.get(key).and_then(|e| e.value.parse().ok())
}

fn set_int(map: &mut HashMap<String, Entry>, key: &str, value: i64) {
    map.insert(
        key.to_string(),
        Entry {
            value: value.to_string(),
            expires_at: None,
        },
    );
}

fn set_f64(map: &mut HashMap<String, Entry>, key: &str, value: f64) {
    map.insert(
        key.to_string(),
        Entry {
            value: value.to_string(),
            expires_at: None,
        },
    );
}
