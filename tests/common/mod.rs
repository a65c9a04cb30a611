//! Shared helpers for the integration tests.
//!
//! Fake providers are small axum apps bound to random local ports. The
//! gateway itself is driven with `tower::ServiceExt::oneshot`.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use http::Request;
use rand::rngs::mock::StepRng;
use serde_json::{json, Value};
use sqlx::SqlitePool;

use switchyard::config::Config;
use switchyard::proxy::{create_router, AppState};
use switchyard::router::LoadBalancer;
use switchyard::storage::{self, accounts, Account};

/// Serve `app` on a random local port and return its base URL.
pub async fn spawn_upstream(app: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock provider");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    format!("http://127.0.0.1:{}", addr.port())
}

pub fn completion_body() -> Value {
    json!({
        "id": "chatcmpl-mock",
        "object": "chat.completion",
        "choices": [{
            "message": {"role": "assistant", "content": "mock response"},
            "index": 0,
            "finish_reason": "stop"
        }],
        "usage": {
            "prompt_tokens": 10,
            "completion_tokens": 5,
            "total_tokens": 15
        }
    })
}

/// A provider whose chat endpoint answers `status`, counting calls.
///
/// 2xx statuses answer with a normal completion body.
pub async fn chat_upstream(status: StatusCode) -> (String, Arc<AtomicUsize>) {
    use axum::{routing::post, Json, Router};

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let app = Router::new().route(
        "/v1/chat/completions",
        post(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if status.is_success() {
                    (status, Json(completion_body())).into_response()
                } else {
                    (
                        status,
                        Json(json!({"error": {"message": "upstream failure"}})),
                    )
                        .into_response()
                }
            }
        }),
    );
    (spawn_upstream(app).await, calls)
}

/// A provider streaming the given SSE body on its chat endpoint.
pub async fn sse_upstream(body: &'static str) -> (String, Arc<AtomicUsize>) {
    use axum::{http::header, routing::post, Router};

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let app = Router::new().route(
        "/v1/chat/completions",
        post(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
            }
        }),
    );
    (spawn_upstream(app).await, calls)
}

/// TOML for one provider serving `chat-model`, with a single credential.
pub fn provider_toml(name: &str, url: &str) -> String {
    format!(
        r#"
[[providers]]
name = "{name}"
url = "{url}"
supports_streaming = true
free_models = ["chat-model", "embed-model"]
paid_models = ["paid-model"]

[[providers.credentials]]
api_key = "sk-{name}"
"#
    )
}

/// Full config around the given `[[providers]]` blocks.
pub fn config_toml(providers: &str, max_attempts: u32) -> String {
    format!(
        r#"
[server]
listen = "127.0.0.1:0"

[routing]
max_attempts = {max_attempts}
pin_tier = 5

[credits]
premium_tier = 2
max_balance = 5000.0
tiers = [{{ tier = 0, daily = 100.0 }}]

{providers}

[[models]]
id = "chat-model"
multiplier = 1.0

[[models]]
id = "paid-model"
access = "paid"

[[models]]
id = "embed-model"
endpoints = ["/v1/embeddings"]
price = 7.0
"#
    )
}

pub struct TestApp {
    pub router: axum::Router,
    pub state: AppState,
    pub db: SqlitePool,
}

/// Build the gateway over an in-memory database.
///
/// The balancer always takes the first candidate in name order.
pub async fn build_app(toml: &str) -> TestApp {
    let config = Config::parse_str_with(toml, |_| None).expect("valid config");
    let db = storage::init_memory_pool().await.unwrap();
    let state = AppState::build(config, db.clone(), reqwest::Client::new())
        .await
        .unwrap()
        .with_balancer(LoadBalancer::with_rng(db.clone(), StepRng::new(0, 0)));
    TestApp {
        router: create_router(state.clone()),
        state,
        db,
    }
}

impl TestApp {
    pub async fn add_account(&self, key: &str, balance: f64, tier: i64) {
        accounts::insert(&self.db, &Account::new(key, balance, tier))
            .await
            .unwrap();
    }

    pub async fn account(&self, key: &str) -> Account {
        accounts::get(&self.db, key).await.unwrap().unwrap()
    }

    pub async fn send(&self, request: Request<Body>) -> Response {
        use tower::ServiceExt;
        self.router.clone().oneshot(request).await.unwrap()
    }
}

/// POST a JSON body with a bearer key.
pub fn post_json(path: &str, key: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json");
    if let Some(key) = key {
        builder = builder.header("authorization", format!("Bearer {key}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

pub fn chat(key: &str, model: &str) -> Request<Body> {
    post_json(
        "/v1/chat/completions",
        Some(key),
        json!({"model": model, "messages": [{"role": "user", "content": "hi"}]}),
    )
}

pub async fn body_bytes(response: Response) -> bytes::Bytes {
    axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap()
}

pub async fn body_json(response: Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}
