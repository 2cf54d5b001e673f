use serde::Serialize;

/// Stable classification labels. These are ABI: dashboards and the
/// `error_type` metric label key off the string form, not the variant name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidProvider,
    RateLimit,
    CircuitBreaker,
    MissingApiKey,
    RequestTooLarge,
    Timeout,
    ConnectionRefused,
    ConnectFailure,
    SslError,
    ConnectionBroken,
    UpstreamError,
    Upstream4xx,
    Upstream5xx,
    DegradedCache,
    CacheHit,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidProvider => "invalid_provider",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::CircuitBreaker => "circuit_breaker",
            ErrorKind::MissingApiKey => "missing_api_key",
            ErrorKind::RequestTooLarge => "request_too_large",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ConnectionRefused => "connection_refused",
            ErrorKind::ConnectFailure => "connect_failure",
            ErrorKind::SslError => "ssl_error",
            ErrorKind::ConnectionBroken => "connection_broken",
            ErrorKind::UpstreamError => "upstream_error",
            ErrorKind::Upstream4xx => "upstream_4xx",
            ErrorKind::Upstream5xx => "upstream_5xx",
            ErrorKind::DegradedCache => "degraded_cache",
            ErrorKind::CacheHit => "cache_hit",
        }
    }

    /// Transport-level classifications the retry loop is allowed to retry.
    /// `ssl_error`, `request_too_large`, and `upstream_4xx` are never retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ErrorKind::SslError | ErrorKind::RequestTooLarge | ErrorKind::Upstream4xx
        )
    }

    /// Whether this classification counts as a circuit-breaker failure.
    /// Only transport errors and 5xx count; 4xx does not.
    pub fn is_breaker_failure(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout
                | ErrorKind::ConnectionRefused
                | ErrorKind::ConnectFailure
                | ErrorKind::SslError
                | ErrorKind::ConnectionBroken
                | ErrorKind::UpstreamError
                | ErrorKind::Upstream5xx
        )
    }
}
