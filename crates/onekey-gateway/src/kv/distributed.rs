use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::scripts;
use super::{KvBackend, KvError, KvResult};
use crate::breaker::{BreakerRecordResult, BreakerState};
use crate::config::RedisConfig;
use crate::ratelimit::RateLimitOutcome;

/// Redis-backed distributed KV store. Connections are pooled (round-robin
/// over a small fixed set of multiplexed connections) so concurrent
/// requests never serialize on a single socket.
pub struct RedisBackend {
    pool: Vec<Mutex<MultiplexedConnection>>,
    next: AtomicUsize,
    call_timeout: Duration,
}

impl RedisBackend {
    pub async fn connect(config: &RedisConfig) -> anyhow::Result<Self> {
        let client = redis::Client::open(config.url())?;
        let mut pool = Vec::with_capacity(config.pool_size.max(1));
        for _ in 0..config.pool_size.max(1) {
            let conn = connect_with_backoff(&client).await?;
            pool.push(Mutex::new(conn));
        }
        Ok(Self {
            pool,
            next: AtomicUsize::new(0),
            call_timeout: Duration::from_millis(config.timeout_ms),
        })
    }

    fn pick(&self) -> &Mutex<MultiplexedConnection> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.pool.len();
        &self.pool[idx]
    }

    async fn with_conn<F, T>(&self, f: F) -> KvResult<T>
    where
        F: for<'c> FnOnce(
            &'c mut MultiplexedConnection,
        ) -> std::pin::Pin<
            Box<dyn std::future::Future<Output = redis::RedisResult<T>> + Send + 'c>,
        >,
    {
        let lock = self.pick();
        let mut conn = lock.lock().await;
        match timeout(self.call_timeout, f(&mut conn)).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(classify(e)),
            Err(_) => Err(KvError::Timeout),
        }
    }
}

async fn connect_with_backoff(client: &redis::Client) -> anyhow::Result<MultiplexedConnection> {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match client.get_multiplexed_tokio_connection().await {
            Ok(c) => return Ok(c),
            Err(_e) if attempt < 30 => {
                tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn classify(e: redis::RedisError) -> KvError {
    if e.is_timeout() {
        KvError::Timeout
    } else if e.is_connection_dropped() || e.is_io_error() {
        KvError::Unavailable(e.to_string())
    } else if matches!(
        e.kind(),
        redis::ErrorKind::AuthenticationFailed
    ) {
        KvError::AuthFailed
    } else {
        KvError::ScriptError(e.to_string())
    }
}

#[async_trait]
impl KvBackend for RedisBackend {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let key = key.to_string();
        self.with_conn(|c| Box::pin(async move { c.get(&key).await }))
            .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.with_conn(|c| {
            Box::pin(async move {
                match ttl {
                    Some(d) => c.set_ex(&key, &value, d.as_secs().max(1)).await,
                    None => c.set(&key, &value).await,
                }
            })
        })
        .await
    }

    async fn incr_by(&self, key: &str, delta: i64, default: i64) -> KvResult<i64> {
        let key = key.to_string();
        self.with_conn(|c| {
            Box::pin(async move {
                let exists: bool = c.exists(&key).await?;
                if !exists {
                    let _: () = c.set(&key, default).await?;
                }
                c.incr(&key, delta).await
            })
        })
        .await
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        let key = key.to_string();
        self.with_conn(|c| Box::pin(async move { c.del(&key).await }))
            .await
    }

    async fn eval_rate_limit_check(
        &self,
        bucket_key: &str,
        rate: f64,
        burst: f64,
        now: f64,
    ) -> KvResult<RateLimitOutcome> {
        let bucket_key = bucket_key.to_string();
        let raw: Vec<f64> = self
            .with_conn(|c| {
                Box::pin(async move {
                    Script::new(scripts::RATE_LIMIT_CHECK)
                        .key(bucket_key)
                        .arg(rate)
                        .arg(burst)
                        .arg(now)
                        .invoke_async(c)
                        .await
                })
            })
            .await?;
        Ok(RateLimitOutcome {
            allowed: raw[0] != 0.0,
            burst: raw[1],
            used: raw[2],
        })
    }

    async fn eval_breaker_allow(
        &self,
        provider: &str,
        timeout_seconds: f64,
        half_open_requests: u32,
        now: f64,
    ) -> KvResult<(bool, BreakerState)> {
        let keys = breaker_keys(provider);
        let raw: Vec<i64> = self
            .with_conn(|c| {
                Box::pin(async move {
                    Script::new(scripts::BREAKER_ALLOW)
                        .key(&keys[0])
                        .key(&keys[1])
                        .key(&keys[2])
                        .key(&keys[3])
                        .key(&keys[4])
                        .arg(timeout_seconds)
                        .arg(half_open_requests)
                        .arg(now)
                        .invoke_async(c)
                        .await
                })
            })
            .await?;
        Ok((raw[0] != 0, BreakerState::from_code(raw[1])))
    }

    async fn eval_breaker_record_success(
        &self,
        provider: &str,
        success_threshold: u32,
    ) -> KvResult<BreakerRecordResult> {
        let keys = breaker_keys(provider);
        let raw: Vec<i64> = self
            .with_conn(|c| {
                Box::pin(async move {
                    Script::new(scripts::BREAKER_RECORD_SUCCESS)
                        .key(&keys[0])
                        .key(&keys[1])
                        .key(&keys[2])
                        .key(&keys[3])
                        .key(&keys[4])
                        .arg(success_threshold)
                        .invoke_async(c)
                        .await
                })
            })
            .await?;
        Ok(BreakerRecordResult::from_raw(&raw))
    }

    async fn eval_breaker_record_failure(
        &self,
        provider: &str,
        failure_threshold: u32,
        now: f64,
    ) -> KvResult<BreakerRecordResult> {
        let keys = breaker_keys(provider);
        let raw: Vec<i64> = self
            .with_conn(|c| {
                Box::pin(async move {
                    Script::new(scripts::BREAKER_RECORD_FAILURE)
                        .key(&keys[0])
                        .key(&keys[1])
                        .key(&keys[2])
                        .key(&keys[3])
                        .key(&keys[4])
                        .arg(failure_threshold)
                        .arg(now)
                        .invoke_async(c)
                        .await
                })
            })
            .await?;
        Ok(BreakerRecordResult::from_raw(&raw))
    }

    async fn eval_breaker_release_half_open_slot(&self, provider: &str) -> KvResult<()> {
        let keys = breaker_keys(provider);
        self.with_conn(|c| {
            Box::pin(async move {
                let _: i64 = Script::new(scripts::BREAKER_RELEASE_HALF_OPEN_SLOT)
                    .key(&keys[0])
                    .key(&keys[1])
                    .key(&keys[2])
                    .key(&keys[3])
                    .key(&keys[4])
                    .invoke_async(c)
                    .await?;
                Ok(())
            })
        })
        .await
    }
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
