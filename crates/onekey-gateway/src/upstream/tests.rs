use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::routing::{any, get};
use axum::Router;
use base64::Engine;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;

use super::*;
use crate::config::{AuthType, RetryConfig};

fn test_provider(upstream: String) -> Provider {
    Provider {
        id: "test".into(),
        prefix: "/test".into(),
        upstream,
        auth_type: AuthType::None,
        auth_header: None,
        api_key: None,
        connect_timeout: Duration::from_millis(200),
        send_timeout: Duration::from_millis(200),
        read_timeout: Duration::from_millis(300),
        retry_max_attempts: RetryConfig::default().times + 1,
        retry_base_delay: Duration::from_millis(10),
        ssl_verify: true,
    }
}

async fn spawn(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn forwards_get_and_returns_status() {
    let app = Router::new().route("/ok", get(|| async { "hello" }));
    let base = spawn(app).await;
    let provider = test_provider(base);
    let client = UpstreamClient::new(&[provider.clone()]);

    let outcome = client
        .forward_with_retry(ForwardRequest {
            provider: &provider,
            method: Method::GET,
            path_after_prefix: "/ok",
            raw_query: None,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            request_id: "req-1",
        })
        .await;

    let resp = outcome.response.expect("response");
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body.as_ref(), b"hello");
}

#[tokio::test]
async fn retries_idempotent_get_then_succeeds() {
    let hits = Arc::new(AtomicU32::new(0));
    let hits_clone = hits.clone();
    let app = Router::new().route(
        "/flaky",
        any(move |State(_): State<()>| {
            let hits = hits_clone.clone();
            async move {
                let n = hits.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    // first attempt: force a connection error by closing immediately
                    // simulated here as a 500 so the breaker-classification path
                    // (not the transport-error path) is exercised deterministically.
                    (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "boom")
                } else {
                    (axum::http::StatusCode::OK, "fixed")
                }
            }
        }),
    ).with_state(());
    let base = spawn(app).await;
    let provider = test_provider(base);
    let client = UpstreamClient::new(&[provider.clone()]);

    let outcome = client
        .forward_with_retry(ForwardRequest {
            provider: &provider,
            method: Method::GET,
            path_after_prefix: "/flaky",
            raw_query: None,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            request_id: "req-2",
        })
        .await;

    // 500s are not transport errors, so the client doesn't retry them itself;
    // that responsibility belongs to the pipeline's breaker bookkeeping.
    // This test just confirms a single pass-through attempt sees the 500.
    assert_eq!(outcome.attempts, 1);
    assert_eq!(outcome.response.unwrap().status, 500);
}

#[tokio::test]
async fn non_idempotent_post_attempts_once_on_timeout() {
    // No server listening on this port: connection refused, which is a
    // retryable transport error, but POST must still cap attempts at 1.
    let provider = test_provider("http://127.0.0.1:1".to_string());
    let client = UpstreamClient::new(&[provider.clone()]);

    let outcome = client
        .forward_with_retry(ForwardRequest {
            provider: &provider,
            method: Method::POST,
            path_after_prefix: "/x",
            raw_query: None,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"{}"),
            request_id: "req-3",
        })
        .await;

    assert_eq!(outcome.attempts, 1);
    assert!(outcome.response.is_none());
}

#[tokio::test]
async fn retries_on_transport_error_then_succeeds() {
    // No HTTP server at all: the first accepted connection is dropped
    // before any bytes are exchanged, forcing a genuine transport error
    // on attempt 1 (as opposed to a 500, which the client never retries).
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        drop(stream);

        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        let _ = stream.read(&mut buf).await;
        let body = b"fixed";
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            String::from_utf8_lossy(body)
        );
        let _ = stream.write_all(response.as_bytes()).await;
        let _ = stream.shutdown().await;
    });

    let provider = test_provider(format!("http://{addr}"));
    let client = UpstreamClient::new(&[provider.clone()]);

    let started = std::time::Instant::now();
    let outcome = client
        .forward_with_retry(ForwardRequest {
            provider: &provider,
            method: Method::GET,
            path_after_prefix: "/flaky",
            raw_query: None,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            request_id: "req-retry",
        })
        .await;
    let elapsed = started.elapsed();

    assert_eq!(outcome.attempts, 2);
    assert_eq!(outcome.response.unwrap().status, 200);
    assert!(elapsed >= provider.retry_base_delay);
}

#[tokio::test]
async fn basic_auth_injected_and_inbound_value_overwritten() {
    let captured: Arc<AsyncMutex<Option<String>>> = Arc::new(AsyncMutex::new(None));
    let captured_clone = captured.clone();
    let app = Router::new().route(
        "/secure",
        any(move |headers: HeaderMap| {
            let captured = captured_clone.clone();
            async move {
                let value = headers
                    .get(axum::http::header::AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string());
                *captured.lock().await = value;
                "ok"
            }
        }),
    );
    let base = spawn(app).await;
    let mut provider = test_provider(base);
    provider.auth_type = AuthType::Basic;
    provider.api_key = Some("secret-key".to_string());
    let client = UpstreamClient::new(&[provider.clone()]);

    let mut inbound = HeaderMap::new();
    inbound.insert(axum::http::header::AUTHORIZATION, "Bearer leaked".parse().unwrap());

    let outcome = client
        .forward_with_retry(ForwardRequest {
            provider: &provider,
            method: Method::GET,
            path_after_prefix: "/secure",
            raw_query: None,
            headers: inbound,
            body: Bytes::new(),
            request_id: "req-4",
        })
        .await;

    assert_eq!(outcome.response.unwrap().status, 200);
    let expected = format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode("secret-key:")
    );
    assert_eq!(captured.lock().await.as_deref(), Some(expected.as_str()));
}

#[test]
fn idempotent_methods_cover_safe_and_put_delete() {
    assert!(UpstreamClient::is_idempotent(&Method::GET));
    assert!(UpstreamClient::is_idempotent(&Method::HEAD));
    assert!(UpstreamClient::is_idempotent(&Method::PUT));
    assert!(UpstreamClient::is_idempotent(&Method::DELETE));
    assert!(UpstreamClient::is_idempotent(&Method::OPTIONS));
    assert!(UpstreamClient::is_idempotent(&Method::TRACE));
    assert!(!UpstreamClient::is_idempotent(&Method::POST));
    assert!(!UpstreamClient::is_idempotent(&Method::PATCH));
}

#[test]
fn hop_by_hop_headers_never_forwarded() {
    let mut headers = HeaderMap::new();
    headers.insert("connection", "keep-alive".parse().unwrap());
    headers.insert("x-custom", "keep-me".parse().unwrap());
    crate::headers::strip_hop_by_hop(&mut headers);
    assert!(headers.get("connection").is_none());
    assert!(headers.get("x-custom").is_some());
}
