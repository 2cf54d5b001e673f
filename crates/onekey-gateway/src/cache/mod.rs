
use std::sync::Arc;
use std::time::Duration;

use axum::http::Method;
use serde::{Deserialize, Serialize};

use crate::kv::KvBackend;
use crate::time::now_seconds;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub status: u16,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub cached_at: f64,
}

pub struct StaleHit {
    pub entry: CacheEntry,
    pub age_seconds: f64,
}

/// Read-through cache for safe methods, with a stale-fallback window
/// twice as wide as the fresh TTL. Entries are immutable once stored;
/// a later store for the same key simply overwrites.
pub struct ResponseCache {
    kv: Arc<dyn KvBackend>,
    ttl_seconds: f64,
    max_body_size: usize,
}

impl ResponseCache {
    pub fn new(kv: Arc<dyn KvBackend>, ttl_seconds: f64, max_body_size: usize) -> Self {
        Self {
            kv,
            ttl_seconds,
            max_body_size,
        }
    }

    pub fn key(provider: &str, method: &Method, path: &str, raw_query: Option<&str>) -> String {
        match raw_query {
            Some(q) if !q.is_empty() => format!("cache:{provider}:{method}:{path}?{q}"),
            _ => format!("cache:{provider}:{method}:{path}"),
        }
    }

    pub fn is_cacheable(method: &Method, status: u16, body_len: usize, max_body_size: usize) -> bool {
        let method_ok = method == Method::GET || method == Method::HEAD;
        let status_ok = (200..300).contains(&status) || status == 404;
        method_ok && status_ok && body_len <= max_body_size
    }

    pub async fn fresh_read(&self, key: &str) -> Option<CacheEntry> {
        let entry = self.load(key).await?;
        let age = now_seconds() - entry.cached_at;
        (age <= self.ttl_seconds).then_some(entry)
    }

    pub async fn stale_read(&self, key: &str) -> Option<StaleHit> {
        let entry = self.load(key).await?;
        let age = now_seconds() - entry.cached_at;
        (age <= 2.0 * self.ttl_seconds).then_some(StaleHit { entry, age_seconds: age })
    }

    /// Deserialization or oversize failures never surface to the client;
    /// they are treated as a cache miss.
    async fn load(&self, key: &str) -> Option<CacheEntry> {
        let raw = self.kv.get(key).await.ok().flatten()?;
        serde_json::from_str(&raw).ok()
    }

    pub async fn store(&self, key: &str, status: u16, body: &[u8], content_type: Option<&str>) {
        if body.len() > self.max_body_size {
            return;
        }
        let entry = CacheEntry {
            status,
            body: body.to_vec(),
            content_type: content_type.map(|s| s.to_string()),
            cached_at: now_seconds(),
        };
        let Ok(serialized) = serde_json::to_string(&entry) else {
            return;
        };
        let ttl = Duration::from_secs_f64(2.0 * self.ttl_seconds);
        let _ = self.kv.set(key, &serialized, Some(ttl)).await;
    }
}
