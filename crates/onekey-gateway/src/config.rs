use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    Basic,
    Header,
    Url,
    None,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderTimeoutConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect: u64,
    #[serde(default = "default_send_timeout_ms")]
    pub send: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read: u64,
}

fn default_connect_timeout_ms() -> u64 {
    2_000
}
fn default_send_timeout_ms() -> u64 {
    5_000
}
fn default_read_timeout_ms() -> u64 {
    10_000
}

impl Default for ProviderTimeoutConfig {
    fn default() -> Self {
        Self {
            connect: default_connect_timeout_ms(),
            send: default_send_timeout_ms(),
            read: default_read_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_times")]
    pub times: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub delay_ms: u64,
}

fn default_retry_times() -> u32 {
    2
}
fn default_retry_delay_ms() -> u64 {
    200
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            times: default_retry_times(),
            delay_ms: default_retry_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub prefix: String,
    pub upstream: String,
    pub auth_type: AuthType,
    #[serde(default)]
    pub auth_header: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub timeout: ProviderTimeoutConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_true")]
    pub ssl_verify: bool,
}

fn default_true() -> bool {
    true
}

/// Immutable provider descriptor, frozen at startup (no hot reload).
#[derive(Debug, Clone)]
pub struct Provider {
    pub id: String,
    pub prefix: String,
    pub upstream: String,
    pub auth_type: AuthType,
    pub auth_header: Option<String>,
    pub api_key: Option<String>,
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    pub read_timeout: Duration,
    pub retry_max_attempts: u32,
    pub retry_base_delay: Duration,
    pub ssl_verify: bool,
}

impl Provider {
    fn from_config(c: ProviderConfig) -> Self {
        let env_key = format!("{}_API_KEY", c.id.to_ascii_uppercase());
        let api_key = std::env::var(&env_key).ok().or(c.api_key);
        Self {
            id: c.id,
            prefix: c.prefix,
            upstream: c.upstream.trim_end_matches('/').to_string(),
            auth_type: c.auth_type,
            auth_header: c.auth_header,
            api_key,
            connect_timeout: Duration::from_millis(c.timeout.connect),
            send_timeout: Duration::from_millis(c.timeout.send),
            read_timeout: Duration::from_millis(c.timeout.read),
            retry_max_attempts: c.retry.times + 1,
            retry_base_delay: Duration::from_millis(c.retry.delay_ms),
            ssl_verify: c.ssl_verify,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RedisConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_redis_host")]
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub db: u32,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}
fn default_redis_port() -> u16 {
    6379
}
fn default_redis_timeout_ms() -> u64 {
    500
}
fn default_pool_size() -> usize {
    4
}
fn default_keepalive_secs() -> u64 {
    60
}

impl RedisConfig {
    pub fn url(&self) -> String {
        let auth = self
            .password
            .as_ref()
            .map(|p| format!(":{p}@"))
            .unwrap_or_default();
        format!("redis://{auth}{}:{}/{}", self.host, self.port, self.db)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BucketConfig {
    pub rate: f64,
    pub burst: f64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RateLimitConfig {
    pub global: Option<BucketConfig>,
    #[serde(default, rename = "per_provider")]
    pub per_provider: HashMap<String, BucketConfig>,
    #[serde(rename = "per_ip")]
    pub per_ip: Option<BucketConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: f64,
    #[serde(default = "default_half_open_requests")]
    pub half_open_requests: u32,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_success_threshold() -> u32 {
    2
}
fn default_timeout_seconds() -> f64 {
    30.0
}
fn default_half_open_requests() -> u32 {
    1
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            timeout_seconds: default_timeout_seconds(),
            half_open_requests: default_half_open_requests(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl: f64,
    #[serde(default = "default_cache_max_body_size")]
    pub cache_max_body_size: usize,
}

fn default_max_body_size() -> usize {
    10 * 1024 * 1024
}
fn default_cache_ttl() -> f64 {
    60.0
}
fn default_cache_max_body_size() -> usize {
    1024 * 1024
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_body_size: default_max_body_size(),
            cache_ttl: default_cache_ttl(),
            cache_max_body_size: default_cache_max_body_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    #[serde(default = "default_log_body_size")]
    pub max_body_size: usize,
    #[serde(default = "default_sensitive_headers")]
    pub sensitive_headers: Vec<String>,
}

fn default_log_body_size() -> usize {
    2048
}
fn default_sensitive_headers() -> Vec<String> {
    vec![
        "authorization".into(),
        "x-api-key".into(),
        "cookie".into(),
        "set-cookie".into(),
    ]
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StressTestConfig {
    #[serde(default)]
    pub enabled: bool,
}

/// When the stress-test toggle is on, rate limits are multiplied and
/// breaker thresholds relaxed by this shared factor, as a single knob.
pub const STRESS_TEST_RATE_MULTIPLIER: f64 = 10.0;
pub const STRESS_TEST_THRESHOLD_MULTIPLIER: u32 = 5;

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    redis: RedisConfig,
    #[serde(default)]
    provider: Vec<ProviderConfig>,
    #[serde(default)]
    circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    rate_limit: RateLimitConfig,
    #[serde(default)]
    proxy: ProxyConfig,
    #[serde(default)]
    logging: LoggingConfig,
    #[serde(default)]
    stress_test: StressTestConfig,
}

#[derive(Clone)]
pub struct Config {
    pub redis: RedisConfig,
    pub providers: Vec<Provider>,
    pub circuit_breaker: CircuitBreakerConfig,
    pub rate_limit: RateLimitConfig,
    pub proxy: ProxyConfig,
    pub logging: LoggingConfig,
    pub stress_test: StressTestConfig,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {path}"))?;
        Self::from_str(&text)
    }

    pub fn from_str(text: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(text).context("parsing config toml")?;
        let mut cfg = Self {
            redis: raw.redis,
            providers: raw.provider.into_iter().map(Provider::from_config).collect(),
            circuit_breaker: raw.circuit_breaker,
            rate_limit: raw.rate_limit,
            proxy: raw.proxy,
            logging: raw.logging,
            stress_test: raw.stress_test,
        };
        if cfg.stress_test.enabled {
            cfg.apply_stress_test();
        }
        Ok(cfg)
    }

    fn apply_stress_test(&mut self) {
        if let Some(g) = self.rate_limit.global.as_mut() {
            g.rate *= STRESS_TEST_RATE_MULTIPLIER;
            g.burst *= STRESS_TEST_RATE_MULTIPLIER;
        }
        if let Some(ip) = self.rate_limit.per_ip.as_mut() {
            ip.rate *= STRESS_TEST_RATE_MULTIPLIER;
            ip.burst *= STRESS_TEST_RATE_MULTIPLIER;
        }
        for b in self.rate_limit.per_provider.values_mut() {
            b.rate *= STRESS_TEST_RATE_MULTIPLIER;
            b.burst *= STRESS_TEST_RATE_MULTIPLIER;
        }
        self.circuit_breaker.failure_threshold *= STRESS_TEST_THRESHOLD_MULTIPLIER;
        self.circuit_breaker.timeout_seconds /= STRESS_TEST_THRESHOLD_MULTIPLIER as f64;
    }

    /// Longest-prefix match so overlapping prefixes resolve unambiguously.
    pub fn resolve_provider(&self, path: &str) -> Option<&Provider> {
        self.providers
            .iter()
            .filter(|p| {
                path == p.prefix
                    || path
                        .strip_prefix(&p.prefix)
                        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
            })
            .max_by_key(|p| p.prefix.len())
    }

    pub fn provider_bucket(&self, provider_id: &str) -> Option<&BucketConfig> {
        self.rate_limit.per_provider.get(provider_id)
    }
}
