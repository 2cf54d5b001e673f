#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::time::Duration;

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method};
use base64::Engine;
use bytes::Bytes;

use crate::config::{AuthType, Provider};
use crate::error::ErrorKind;
use crate::headers::strip_hop_by_hop;

pub struct ForwardRequest<'a> {
    pub provider: &'a Provider,
    pub method: Method,
    pub path_after_prefix: &'a str,
    pub raw_query: Option<&'a str>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub request_id: &'a str,
}

pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub struct ForwardOutcome {
    pub response: Option<UpstreamResponse>,
    pub classification: Option<ErrorKind>,
    pub attempts: u32,
}

/// Credential injection, header filtering, timeouts, and bounded
/// exponential-backoff retry. Holds one `reqwest::Client` per provider so
/// each provider's connect timeout and TLS verification flag apply
/// independently; cloning a client is cheap and shares its pool.
#[derive(Clone)]
pub struct UpstreamClient {
    clients: HashMap<String, reqwest::Client>,
}

impl UpstreamClient {
    pub fn new(providers: &[Provider]) -> Self {
        let clients = providers
            .iter()
            .map(|p| {
                let client = reqwest::Client::builder()
                    .user_agent("onekey-gateway/0.1.0")
                    .connect_timeout(p.connect_timeout)
                    .danger_accept_invalid_certs(!p.ssl_verify)
                    .build()
                    .expect("failed to build reqwest client");
                (p.id.clone(), client)
            })
            .collect();
        Self { clients }
    }

    fn client_for(&self, provider: &Provider) -> reqwest::Client {
        self.clients
            .get(&provider.id)
            .cloned()
            .unwrap_or_else(|| reqwest::Client::new())
    }

    pub fn is_idempotent(method: &Method) -> bool {
        matches!(
            *method,
            Method::GET | Method::HEAD | Method::PUT | Method::DELETE | Method::OPTIONS | Method::TRACE
        )
    }

    fn build_url(req: &ForwardRequest<'_>) -> String {
        let mut url = match (&req.provider.auth_type, &req.provider.api_key) {
            (AuthType::Url, Some(key)) => {
                format!("{}/v2/{}{}", req.provider.upstream, key, req.path_after_prefix)
            }
            _ => format!("{}{}", req.provider.upstream, req.path_after_prefix),
        };
        if let Some(q) = req.raw_query {
            if !q.is_empty() {
                url.push('?');
                url.push_str(q);
            }
        }
        url
    }

    fn inject_credentials(provider: &Provider, headers: &mut HeaderMap) {
        let Some(key) = provider.api_key.as_ref() else {
            return;
        };
        match provider.auth_type {
            AuthType::Basic => {
                let token = base64::engine::general_purpose::STANDARD.encode(format!("{key}:"));
                if let Ok(v) = HeaderValue::from_str(&format!("Basic {token}")) {
                    headers.insert(axum::http::header::AUTHORIZATION, v);
                }
            }
            AuthType::Header => {
                if let Some(name) = provider.auth_header.as_ref() {
                    if let (Ok(name), Ok(value)) = (
                        HeaderName::from_bytes(name.as_bytes()),
                        HeaderValue::from_str(key),
                    ) {
                        headers.insert(name, value);
                    }
                }
            }
            AuthType::Url | AuthType::None => {}
        }
    }

    pub async fn forward_with_retry(&self, req: ForwardRequest<'_>) -> ForwardOutcome {
        let max_attempts = if Self::is_idempotent(&req.method) {
            req.provider.retry_max_attempts.max(1)
        } else {
            1
        };

        let url = Self::build_url(&req);
        let mut outbound_headers = req.headers.clone();
        strip_hop_by_hop(&mut outbound_headers);
        if let Ok(v) = HeaderValue::from_str(req.request_id) {
            outbound_headers.insert(HeaderName::from_static("x-onekey-request-id"), v);
        }
        Self::inject_credentials(req.provider, &mut outbound_headers);

        let client = self.client_for(req.provider);
        let attempt_timeout = req.provider.send_timeout + req.provider.read_timeout;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let builder = client
                .request(req.method.clone(), &url)
                .headers(outbound_headers.clone())
                .timeout(attempt_timeout)
                .body(req.body.clone());

            match builder.send().await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let mut headers = resp.headers().clone();
                    strip_hop_by_hop(&mut headers);
                    let body = resp.bytes().await.unwrap_or_default();
                    return ForwardOutcome {
                        response: Some(UpstreamResponse { status, headers, body }),
                        classification: status_classification(status),
                        attempts: attempt,
                    };
                }
                Err(e) => {
                    let classification = classify_reqwest_error(&e);
                    let retry_eligible = classification.is_retryable() && attempt < max_attempts;
                    if !retry_eligible {
                        return ForwardOutcome {
                            response: None,
                            classification: Some(classification),
                            attempts: attempt,
                        };
                    }
                    let delay = Duration::from_secs_f64(
                        (req.provider.retry_base_delay.as_secs_f64() * 2f64.powi(attempt as i32 - 1))
                            .min(2.0),
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

fn status_classification(status: u16) -> Option<ErrorKind> {
    if (500..600).contains(&status) {
        Some(ErrorKind::Upstream5xx)
    } else if (400..500).contains(&status) {
        Some(ErrorKind::Upstream4xx)
    } else {
        None
    }
}

fn classify_reqwest_error(e: &reqwest::Error) -> ErrorKind {
    if e.is_timeout() {
        ErrorKind::Timeout
    } else if e.is_connect() {
        let msg = e.to_string().to_lowercase();
        if msg.contains("certificate") || msg.contains("tls") || msg.contains("ssl") {
            ErrorKind::SslError
        } else if msg.contains("refused") {
            ErrorKind::ConnectionRefused
        } else {
            ErrorKind::ConnectFailure
        }
    } else if e.is_body() || e.is_decode() {
        ErrorKind::ConnectionBroken
    } else {
        ErrorKind::UpstreamError
    }
}
