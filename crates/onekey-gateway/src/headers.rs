use axum::http::{HeaderMap, HeaderName};
use serde_json::{json, Value};

/// Headers that terminate at each proxy hop and must never be forwarded,
/// in either direction.
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
];

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.iter().any(|h| name.as_str().eq_ignore_ascii_case(h))
}

/// Render headers as a JSON object for structured logging, replacing any
/// header whose lower-cased name is in `sensitive` with a constant sentinel.
pub fn redact_headers(headers: &HeaderMap, sensitive: &[String]) -> Value {
    let mut obj = serde_json::Map::new();
    for (name, value) in headers.iter() {
        let lower = name.as_str().to_ascii_lowercase();
        let rendered = if sensitive.iter().any(|s| s.eq_ignore_ascii_case(&lower)) {
            "***REDACTED***".to_string()
        } else {
            value.to_str().unwrap_or("<binary>").to_string()
        };
        obj.insert(lower, json!(rendered));
    }
    Value::Object(obj)
}

/// Truncate a logged body to `max_len` bytes, appending a marker if cut.
pub fn truncate_body(body: &[u8], max_len: usize) -> String {
    if body.len() <= max_len {
        String::from_utf8_lossy(body).to_string()
    } else {
        let mut s = String::from_utf8_lossy(&body[..max_len]).to_string();
        s.push_str("...<truncated>");
        s
    }
}
