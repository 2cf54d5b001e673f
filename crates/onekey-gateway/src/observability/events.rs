//! Structured lifecycle events with a stable JSON schema. Each function
//! is a thin wrapper around `tracing` so the event name and fields stay
//! consistent across call sites.
use serde_json::Value;

pub fn request_start(request_id: &str, method: &str, path: &str) {
    tracing::info!(event = "request_start", request_id, method, path);
}

pub fn upstream_request(request_id: &str, provider: &str, url: &str, headers: &Value) {
    tracing::info!(
        event = "upstream_request",
        request_id,
        provider,
        url,
        headers = %headers,
    );
}

pub fn upstream_response(request_id: &str, provider: &str, status: u16) {
    tracing::info!(event = "upstream_response", request_id, provider, status);
}

pub fn request_end(
    request_id: &str,
    provider: Option<&str>,
    status: u16,
    latency_ms: f64,
    classification: Option<&str>,
) {
    tracing::info!(
        event = "request_end",
        request_id,
        provider,
        status,
        latency_ms,
        classification,
    );
}

pub fn breaker_transition(provider: &str, from: &str, to: &str) {
    tracing::warn!(event = "circuit_breaker_transition", provider, from, to);
}

pub fn rate_limit_denied(scope: &str, identifier: &str) {
    tracing::warn!(event = "rate_limit_denied", scope, identifier);
}

pub fn kv_degraded(operation: &str, error: &str) {
    tracing::warn!(event = "kv_degraded", operation, error);
}

pub fn access_log(
    request_id: &str,
    method: &str,
    path: &str,
    status: u16,
    latency_ms: f64,
    remote_addr: &str,
) {
    tracing::info!(
        event = "access_log",
        request_id,
        method,
        path,
        status,
        latency_ms,
        remote_addr,
    );
}
