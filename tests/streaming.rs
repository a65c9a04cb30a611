//! Integration tests for streamed chat completions.
//!
//! Uses mock providers that answer with canned SSE bodies and checks what the
//! gateway relays: provider stamping, the closing `[DONE]`, per-chunk
//! metering, the status of streams that produce nothing and what a stream
//! cut off by its provider leaves behind.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, StatusCode};
use serde_json::{json, Value};

use common::*;
use switchyard::storage::{self, usage};

const TWO_CHUNKS: &str = concat!(
    "data: {\"id\":\"c1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hello\"}}]}\n\n",
    ": keep-alive\n\n",
    "data: {\"id\":\"c1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\" world\"}}]}\n\n",
    "data: [DONE]\n\n",
);

fn streaming_chat(key: &str) -> http::Request<axum::body::Body> {
    post_json(
        "/v1/chat/completions",
        Some(key),
        json!({
            "model": "chat-model",
            "stream": true,
            "messages": [{"role": "user", "content": "hi"}]
        }),
    )
}

/// A provider that streams two chunks, then drops the connection.
async fn cut_off_upstream() -> (String, Arc<AtomicUsize>) {
    use axum::{body::Body, response::IntoResponse, routing::post, Router};

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let app = Router::new().route(
        "/v1/chat/completions",
        post(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let body = async_stream::stream! {
                    for word in ["Hello", " world"] {
                        let event = json!({"id": "c1", "choices": [{"index": 0, "delta": {"content": word}}]});
                        yield Ok::<_, std::io::Error>(format!("data: {event}\n\n"));
                        tokio::time::sleep(Duration::from_millis(20)).await;
                    }
                    yield Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "gone"));
                };
                ([(header::CONTENT_TYPE, "text/event-stream")], Body::from_stream(body))
                    .into_response()
            }
        }),
    );
    (spawn_upstream(app).await, calls)
}

async fn usage_of(app: &TestApp, provider: &str) -> usage::UsageTotals {
    let now_hour = storage::epoch_hour(storage::unix_now());
    usage::window_totals(&app.db, "chat-model", now_hour)
        .await
        .unwrap()
        .into_iter()
        .find(|(p, _)| p == provider)
        .map(|(_, t)| t)
        .unwrap_or_default()
}

/// Payloads of every `data:` line in a relayed body.
fn data_lines(body: &str) -> Vec<&str> {
    body.split("\n\n")
        .filter_map(|event| event.strip_prefix("data: "))
        .collect()
}

#[tokio::test]
async fn test_stream_is_relayed_with_provider_id() {
    let (url, calls) = sse_upstream(TWO_CHUNKS).await;
    let app = build_app(&config_toml(&provider_toml("alpha", &url), 3)).await;
    app.add_account("sk-user", 1000.0, 0).await;

    let response = app.send(streaming_chat("sk-user")).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");
    assert_eq!(response.headers()["x-switchyard-provider"], "alpha");

    let bytes = body_bytes(response).await;
    let body = std::str::from_utf8(&bytes).unwrap();
    let lines = data_lines(body);
    assert_eq!(lines.len(), 3, "body: {body}");
    assert_eq!(lines[2], "[DONE]");

    let first: Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(first["provider_id"], "alpha");
    assert_eq!(first["choices"][0]["delta"]["content"], "Hello");
    assert!(body.ends_with("data: [DONE]\n\n"));

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_streamed_output_is_metered() {
    let (url, _) = sse_upstream(TWO_CHUNKS).await;
    let app = build_app(&config_toml(&provider_toml("alpha", &url), 3)).await;
    app.add_account("sk-user", 1000.0, 0).await;

    let response = app.send(streaming_chat("sk-user")).await;
    body_bytes(response).await;

    // Prompt tokens plus at least one token per non-empty delta
    let balance = app.account("sk-user").await.balance;
    assert!(balance <= 997.0, "balance {balance}");
}

#[tokio::test]
async fn test_empty_stream_is_retried_then_reported() {
    let (url, calls) = sse_upstream("data: [DONE]\n\n").await;
    let app = build_app(&config_toml(&provider_toml("alpha", &url), 2)).await;
    app.add_account("sk-user", 1000.0, 0).await;

    let response = app.send(streaming_chat("sk-user")).await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");

    let json = body_json(response).await;
    assert_eq!(json["error"]["type"], "invalid_response_error");
    assert!(json["error"]["message"]
        .as_str()
        .unwrap()
        .starts_with("The streaming response was empty"));

    // Nothing was delivered, so the prompt was refunded
    assert_eq!(app.account("sk-user").await.balance, 1000.0);

    // Both empty streams count against the provider
    let alpha = usage_of(&app, "alpha").await;
    assert_eq!((alpha.requests, alpha.failures), (2, 2));
}

#[tokio::test]
async fn test_mid_stream_cutoff_ends_cleanly_without_retry() {
    let (url, calls) = cut_off_upstream().await;
    let app = build_app(&config_toml(&provider_toml("alpha", &url), 3)).await;
    app.add_account("sk-user", 1000.0, 0).await;

    let response = app.send(streaming_chat("sk-user")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = body_bytes(response).await;
    let body = std::str::from_utf8(&bytes).unwrap();
    let lines = data_lines(body);
    assert_eq!(lines.len(), 2, "body: {body}");
    let second: Value = serde_json::from_str(lines[1]).unwrap();
    assert_eq!(second["choices"][0]["delta"]["content"], " world");
    assert!(!body.contains("[DONE]"));
    assert!(!body.contains("error"));

    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Prompt plus the two delivered chunks, nothing more
    let tokens = &app.state.tokens;
    let charged = tokens.count_text("hi") + tokens.count_text("Hello") + tokens.count_text(" world");
    assert_eq!(app.account("sk-user").await.balance, 1000.0 - charged as f64);

    let alpha = usage_of(&app, "alpha").await;
    assert_eq!((alpha.requests, alpha.failures), (1, 1));
}

#[tokio::test]
async fn test_completed_stream_counts_as_success() {
    let (url, _) = sse_upstream(TWO_CHUNKS).await;
    let app = build_app(&config_toml(&provider_toml("alpha", &url), 3)).await;
    app.add_account("sk-user", 1000.0, 0).await;

    let response = app.send(streaming_chat("sk-user")).await;
    body_bytes(response).await;

    let alpha = usage_of(&app, "alpha").await;
    assert_eq!((alpha.requests, alpha.failures), (1, 0));
}

#[tokio::test]
async fn test_stream_fails_over_before_first_byte() {
    let (empty_url, empty_calls) = sse_upstream("").await;
    let (good_url, good_calls) = sse_upstream(TWO_CHUNKS).await;
    let providers = provider_toml("alpha", &empty_url) + &provider_toml("beta", &good_url);
    let app = build_app(&config_toml(&providers, 5)).await;
    app.add_account("sk-user", 1000.0, 0).await;

    let response = app.send(streaming_chat("sk-user")).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-switchyard-provider"], "beta");
    assert_eq!(empty_calls.load(Ordering::SeqCst), 2);
    assert_eq!(good_calls.load(Ordering::SeqCst), 1);

    let bytes = body_bytes(response).await;
    let body = std::str::from_utf8(&bytes).unwrap();
    let first: Value = serde_json::from_str(data_lines(body)[0]).unwrap();
    assert_eq!(first["provider_id"], "beta");
}
