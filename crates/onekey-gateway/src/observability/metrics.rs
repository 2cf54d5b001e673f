#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::Mutex;

use crate::breaker::BreakerState;

/// Upper bounds (ms) of the fixed latency histogram buckets, last one
/// representing ">1000".
const BUCKET_BOUNDS_MS: [f64; 6] = [10.0, 50.0, 100.0, 500.0, 1000.0, f64::INFINITY];

fn bucket_index(latency_ms: f64) -> usize {
    BUCKET_BOUNDS_MS
        .iter()
        .position(|&b| latency_ms < b)
        .unwrap_or(BUCKET_BOUNDS_MS.len() - 1)
}

/// In-process counters and gauges keyed by label tuples.
#[derive(Default)]
pub struct Registry {
    requests_total: Mutex<HashMap<(String, String), u64>>,
    requests_by_status: Mutex<HashMap<(String, String, u16), u64>>,
    requests_success_total: Mutex<HashMap<String, u64>>,
    requests_failure_total: Mutex<HashMap<String, u64>>,
    requests_error_total: Mutex<HashMap<(String, String), u64>>,
    latency_buckets: Mutex<HashMap<String, [u64; 6]>>,
    latency_sum: Mutex<HashMap<String, f64>>,
    latency_count: Mutex<HashMap<String, u64>>,
    active_connections: Mutex<HashMap<String, i64>>,
    provider_health: Mutex<HashMap<String, (String, f64)>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, provider: &str, method: &str) {
        *self
            .requests_total
            .lock()
            .unwrap()
            .entry((provider.to_string(), method.to_string()))
            .or_insert(0) += 1;
    }

    pub fn record_status(&self, provider: &str, method: &str, status: u16) {
        *self
            .requests_by_status
            .lock()
            .unwrap()
            .entry((provider.to_string(), method.to_string(), status))
            .or_insert(0) += 1;
        if status < 400 {
            *self
                .requests_success_total
                .lock()
                .unwrap()
                .entry(provider.to_string())
                .or_insert(0) += 1;
        } else {
            *self
                .requests_failure_total
                .lock()
                .unwrap()
                .entry(provider.to_string())
                .or_insert(0) += 1;
        }
    }

    pub fn record_error(&self, provider: &str, error_type: &str) {
        *self
            .requests_error_total
            .lock()
            .unwrap()
            .entry((provider.to_string(), error_type.to_string()))
            .or_insert(0) += 1;
    }

    pub fn record_latency(&self, provider: &str, latency_ms: f64) {
        let idx = bucket_index(latency_ms);
        let mut buckets = self.latency_buckets.lock().unwrap();
        let entry = buckets.entry(provider.to_string()).or_insert([0; 6]);
        entry[idx] += 1;
        drop(buckets);

        *self
            .latency_sum
            .lock()
            .unwrap()
            .entry(provider.to_string())
            .or_insert(0.0) += latency_ms;
        *self
            .latency_count
            .lock()
            .unwrap()
            .entry(provider.to_string())
            .or_insert(0) += 1;
    }

    pub fn inc_active(&self, provider: &str) {
        *self
            .active_connections
            .lock()
            .unwrap()
            .entry(provider.to_string())
            .or_insert(0) += 1;
    }

    pub fn dec_active(&self, provider: &str) {
        let mut map = self.active_connections.lock().unwrap();
        if let Some(v) = map.get_mut(provider) {
            *v -= 1;
        }
    }

    pub fn set_provider_health(&self, provider: &str, state: BreakerState) {
        self.provider_health.lock().unwrap().insert(
            provider.to_string(),
            (state.as_str().to_string(), state.health_value()),
        );
    }

    /// Linear scan over the bucket CDF, returning the upper bound of the
    /// bucket containing the quantile. Saturates at 1000ms for the tail
    /// bucket; this is an approximation, never exact.
    pub fn percentile(&self, provider: &str, q: f64) -> Option<f64> {
        let buckets = self.latency_buckets.lock().unwrap();
        let counts = buckets.get(provider)?;
        let total: u64 = counts.iter().sum();
        if total == 0 {
            return None;
        }
        let target = (total as f64 * q).ceil() as u64;
        let mut cumulative = 0u64;
        for (idx, count) in counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                return Some(if idx == BUCKET_BOUNDS_MS.len() - 1 {
                    1000.0
                } else {
                    BUCKET_BOUNDS_MS[idx]
                });
            }
        }
        Some(1000.0)
    }

    pub fn p50(&self, provider: &str) -> Option<f64> {
        self.percentile(provider, 0.50)
    }
    pub fn p95(&self, provider: &str) -> Option<f64> {
        self.percentile(provider, 0.95)
    }
    pub fn p99(&self, provider: &str) -> Option<f64> {
        self.percentile(provider, 0.99)
    }

    /// Prometheus-style text rendering, used by the `/metrics` handler.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        for ((provider, method), count) in self.requests_total.lock().unwrap().iter() {
            out.push_str(&format!(
                "requests_total{{provider=\"{provider}\",method=\"{method}\"}} {count}\n"
            ));
        }
        for ((provider, method, status), count) in self.requests_by_status.lock().unwrap().iter() {
            out.push_str(&format!(
                "requests_by_status{{provider=\"{provider}\",method=\"{method}\",status=\"{status}\"}} {count}\n"
            ));
        }
        for (provider, count) in self.requests_success_total.lock().unwrap().iter() {
            out.push_str(&format!("requests_success_total{{provider=\"{provider}\"}} {count}\n"));
        }
        for (provider, count) in self.requests_failure_total.lock().unwrap().iter() {
            out.push_str(&format!("requests_failure_total{{provider=\"{provider}\"}} {count}\n"));
        }
        for ((provider, error_type), count) in self.requests_error_total.lock().unwrap().iter() {
            out.push_str(&format!(
                "requests_error_total{{provider=\"{provider}\",error_type=\"{error_type}\"}} {count}\n"
            ));
        }
        for (provider, buckets) in self.latency_buckets.lock().unwrap().iter() {
            let mut cumulative = 0u64;
            for (idx, count) in buckets.iter().enumerate() {
                cumulative += count;
                let le = if idx == BUCKET_BOUNDS_MS.len() - 1 {
                    "+Inf".to_string()
                } else {
                    BUCKET_BOUNDS_MS[idx].to_string()
                };
                out.push_str(&format!(
                    "latency_bucket{{provider=\"{provider}\",le=\"{le}\"}} {cumulative}\n"
                ));
            }
        }
        for (provider, sum) in self.latency_sum.lock().unwrap().iter() {
            out.push_str(&format!("latency_sum{{provider=\"{provider}\"}} {sum}\n"));
        }
        for (provider, count) in self.latency_count.lock().unwrap().iter() {
            out.push_str(&format!("latency_count{{provider=\"{provider}\"}} {count}\n"));
        }
        for (provider, active) in self.active_connections.lock().unwrap().iter() {
            out.push_str(&format!("active_connections{{provider=\"{provider}\"}} {active}\n"));
        }
        for (provider, (state, health)) in self.provider_health.lock().unwrap().iter() {
            out.push_str(&format!(
                "provider_health{{provider=\"{provider}\",state=\"{state}\"}} {health}\n"
            ));
        }
        out
    }
}
