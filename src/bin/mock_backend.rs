//! Mock inference backend for testing llmsnap.
//!
//! Speaks just enough of the OpenAI surface to exercise the proxy: a health
//! endpoint, JSON and SSE chat completions with usage/timings payloads, and
//! vLLM-style sleep/wake endpoints. Control endpoints flip failure modes at
//! runtime so tests can simulate broken backends.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[command(name = "mock-backend")]
#[command(about = "Mock inference backend for testing")]
struct Args {
    /// Port to listen on (0 = ephemeral)
    #[arg(short, long, default_value = "8001")]
    port: u16,

    /// Model name to report in responses
    #[arg(short, long, default_value = "test-model")]
    model: String,

    /// Artificial latency for completions (ms)
    #[arg(long, default_value = "0")]
    latency_ms: u64,

    /// How long the health endpoint reports unhealthy after boot (ms)
    #[arg(long, default_value = "0")]
    startup_delay_ms: u64,
}

struct MockState {
    model: String,
    started: Instant,
    startup_delay: Duration,
    latency_ms: AtomicU64,
    sleeping: AtomicBool,
    fail_sleep: AtomicBool,
    fail_wake: AtomicBool,
    requests: AtomicUsize,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let state = Arc::new(MockState {
        model: args.model,
        started: Instant::now(),
        startup_delay: Duration::from_millis(args.startup_delay_ms),
        latency_ms: AtomicU64::new(args.latency_ms),
        sleeping: AtomicBool::new(false),
        fail_sleep: AtomicBool::new(false),
        fail_wake: AtomicBool::new(false),
        requests: AtomicUsize::new(0),
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(chat_completions))
        .route("/sleep", post(sleep))
        .route("/wake_up", post(wake_up))
        .route("/stats", get(stats))
        .route("/control/fail-sleep", post(control_fail_sleep))
        .route("/control/fail-wake", post(control_fail_wake))
        .route("/control/latency", post(control_latency))
        .fallback(fallback)
        .with_state(state);

    let listener = TcpListener::bind(("127.0.0.1", args.port))
        .await
        .expect("bind");
    let port = listener.local_addr().expect("local addr").port();

    // Readiness signal for tests that spawn us directly.
    println!("READY {port}");

    axum::serve(listener, app).await.expect("serve");
}

async fn health(State(state): State<Arc<MockState>>) -> impl IntoResponse {
    if state.started.elapsed() < state.startup_delay {
        return (StatusCode::SERVICE_UNAVAILABLE, "starting up");
    }
    (StatusCode::OK, "OK")
}

#[derive(Deserialize, Default)]
struct ChatRequest {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    stream: bool,
}

async fn chat_completions(
    State(state): State<Arc<MockState>>,
    body: Json<serde_json::Value>,
) -> axum::response::Response {
    let request: ChatRequest = serde_json::from_value(body.0.clone()).unwrap_or_default();

    if state.sleeping.load(Ordering::SeqCst) {
        return (StatusCode::SERVICE_UNAVAILABLE, "model is sleeping").into_response();
    }

    let latency = state.latency_ms.load(Ordering::SeqCst);
    if latency > 0 {
        tokio::time::sleep(Duration::from_millis(latency)).await;
    }

    state.requests.fetch_add(1, Ordering::SeqCst);
    let model = request.model.unwrap_or_else(|| state.model.clone());

    if request.stream {
        let frames = format!(
            "data: {}\n\ndata: {}\n\ndata: {}\n\ndata: [DONE]\n\n",
            serde_json::json!({"model": model, "choices": [{"delta": {"content": "Hello"}}]}),
            serde_json::json!({"model": model, "choices": [{"delta": {"content": " world"}}]}),
            serde_json::json!({
                "model": model,
                "choices": [],
                "usage": {"prompt_tokens": 10, "completion_tokens": 20},
                "timings": {
                    "prompt_n": 10, "predicted_n": 20,
                    "prompt_per_second": 100.0, "predicted_per_second": 50.0,
                    "prompt_ms": 100.0, "predicted_ms": 400.0
                }
            }),
        );
        return (
            [("Content-Type", "text/event-stream")],
            frames,
        )
            .into_response();
    }

    Json(serde_json::json!({
        "id": "chatcmpl-mock",
        "object": "chat.completion",
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": format!("response from {}", state.model)},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 10, "completion_tokens": 20}
    }))
    .into_response()
}

async fn sleep(State(state): State<Arc<MockState>>) -> impl IntoResponse {
    if state.fail_sleep.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "sleep failure injected");
    }
    state.sleeping.store(true, Ordering::SeqCst);
    (StatusCode::OK, "sleeping")
}

async fn wake_up(State(state): State<Arc<MockState>>) -> impl IntoResponse {
    if state.fail_wake.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "wake failure injected");
    }
    state.sleeping.store(false, Ordering::SeqCst);
    (StatusCode::OK, "awake")
}

async fn stats(State(state): State<Arc<MockState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "model": state.model,
        "requests": state.requests.load(Ordering::SeqCst),
        "sleeping": state.sleeping.load(Ordering::SeqCst),
    }))
}

#[derive(Deserialize)]
struct Toggle {
    enabled: bool,
}

async fn control_fail_sleep(
    State(state): State<Arc<MockState>>,
    Json(toggle): Json<Toggle>,
) -> StatusCode {
    state.fail_sleep.store(toggle.enabled, Ordering::SeqCst);
    StatusCode::OK
}

async fn control_fail_wake(
    State(state): State<Arc<MockState>>,
    Json(toggle): Json<Toggle>,
) -> StatusCode {
    state.fail_wake.store(toggle.enabled, Ordering::SeqCst);
    StatusCode::OK
}

#[derive(Deserialize)]
struct Latency {
    latency_ms: u64,
}

async fn control_latency(
    State(state): State<Arc<MockState>>,
    Json(latency): Json<Latency>,
) -> StatusCode {
    state.latency_ms.store(latency.latency_ms, Ordering::SeqCst);
    StatusCode::OK
}

/// Echo unknown paths so passthrough tests can verify verbatim forwarding.
async fn fallback(State(state): State<Arc<MockState>>, req: axum::extract::Request) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "model": state.model,
        "path": req.uri().path(),
        "method": req.method().as_str(),
    }))
}
