//! HTTP surface: inference routes, management, observability and the
//! upstream passthrough.
//!
//! Inference handlers buffer the request body once to extract and filter the
//! `model` field, then hand the rebuilt request to the scheduler. Everything
//! past that point streams.

use crate::config::{Config, ModelConfig};
use crate::events::EventBus;
use crate::logs::LogMonitor;
use crate::metrics_monitor::MetricsMonitor;
use crate::process::StopMode;
use crate::scheduler::{Scheduler, SchedulerError};
use crate::state::ProcessState;
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, Request, State};
use axum::http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderValue, Response, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{any, get, post};
use axum::{Json, Router};
use futures_util::stream;
use http_body_util::BodyExt;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

/// Inference routes whose JSON body carries the `model` field.
const JSON_INFERENCE_ROUTES: [&str; 15] = [
    "/v1/chat/completions",
    "/v1/completions",
    "/v1/responses",
    "/v1/messages",
    "/v1/messages/count_tokens",
    "/v1/embeddings",
    "/v1/audio/speech",
    "/v1/audio/voices",
    "/v1/images/generations",
    "/infill",
    "/completion",
    "/rerank",
    "/reranking",
    "/v1/rerank",
    "/v1/reranking",
];

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub metrics: Arc<MetricsMonitor>,
    pub events: EventBus,
    pub logs: Arc<LogMonitor>,
    pub config: Arc<Config>,
    pub prometheus: Option<PrometheusHandle>,
}

pub fn build_router(state: AppState) -> Router {
    let mut router = Router::new();
    for path in JSON_INFERENCE_ROUTES {
        router = router.route(path, post(inference_json));
    }

    router
        .route("/v1/audio/transcriptions", post(inference_multipart))
        .route("/v1/images/edits", post(inference_multipart))
        .route("/v1/models", get(list_models))
        .route("/running", get(running))
        .route("/unload", get(unload_all))
        .route("/api/models/unload", post(unload_all))
        .route("/api/models/unload/{model}", post(unload_model))
        .route("/api/models/sleep/{model}", post(sleep_model))
        .route("/api/events", get(events_stream))
        .route("/api/metrics", get(metrics_snapshot))
        .route("/api/captures/{id}", get(capture))
        .route("/logs", get(logs_snapshot))
        .route("/logs/stream", get(logs_stream))
        .route("/metrics", get(prometheus_metrics))
        .route("/upstream/{model}/{*path}", any(upstream_passthrough))
        .route("/health", get(health))
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

/// Bearer-token auth for every route, active only when API keys are
/// configured.
async fn require_api_key(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response<Body> {
    if state.config.api_keys.is_empty() {
        return next.run(req).await;
    }

    let authorized = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|key| state.config.api_keys.iter().any(|k| k == key))
        .unwrap_or(false);

    if authorized {
        next.run(req).await
    } else {
        error_response(StatusCode::UNAUTHORIZED, "missing or invalid API key")
    }
}

// ---------------------------------------------------------------------------
// Inference
// ---------------------------------------------------------------------------

async fn inference_json(State(state): State<AppState>, req: Request) -> Response<Body> {
    let (mut parts, body) = req.into_parts();

    let bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "failed to read request body"),
    };

    let Ok(mut json) = serde_json::from_slice::<Value>(&bytes) else {
        return error_response(StatusCode::BAD_REQUEST, "request body is not valid JSON");
    };
    let Some(requested) = json.get("model").and_then(Value::as_str).map(str::to_string) else {
        return error_response(StatusCode::BAD_REQUEST, "missing model field");
    };

    let Some(canonical) = state.config.resolve_model(&requested).map(str::to_string) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            &format!("unknown model: {requested}"),
        );
    };
    debug!(requested = %requested, model = %canonical, "resolved model");

    let model_config = &state.config.models[&canonical];
    apply_filters(&mut json, model_config);

    let filtered = match serde_json::to_vec(&json) {
        Ok(b) => b,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "failed to rebuild request body"),
    };
    parts
        .headers
        .insert(CONTENT_LENGTH, HeaderValue::from(filtered.len()));
    let req = Request::from_parts(parts, Body::from(filtered));

    match state.scheduler.proxy_request(&canonical, req).await {
        Ok(response) => response,
        Err(e) => scheduler_error_response(e),
    }
}

async fn inference_multipart(State(state): State<AppState>, req: Request) -> Response<Body> {
    let (parts, body) = req.into_parts();

    let Some(boundary) = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|ct| multer::parse_boundary(ct).ok())
    else {
        return error_response(StatusCode::BAD_REQUEST, "expected multipart form data");
    };

    let bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "failed to read request body"),
    };

    let Some(requested) = multipart_model(bytes.clone(), boundary).await else {
        return error_response(StatusCode::BAD_REQUEST, "missing model form field");
    };
    let Some(canonical) = state.config.resolve_model(&requested).map(str::to_string) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            &format!("unknown model: {requested}"),
        );
    };

    // The form is forwarded verbatim; only the model field is read.
    let req = Request::from_parts(parts, Body::from(bytes));
    match state.scheduler.proxy_request(&canonical, req).await {
        Ok(response) => response,
        Err(e) => scheduler_error_response(e),
    }
}

/// Pull the `model` text field out of a buffered multipart body.
async fn multipart_model(bytes: Bytes, boundary: String) -> Option<String> {
    let stream = stream::once(async move { Ok::<_, std::io::Error>(bytes) });
    let mut multipart = multer::Multipart::new(stream, boundary);
    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() == Some("model") {
            return field.text().await.ok();
        }
    }
    None
}

/// Strip, override and rewrite top-level body keys per the model's filters.
fn apply_filters(json: &mut Value, config: &ModelConfig) {
    let Some(obj) = json.as_object_mut() else {
        return;
    };
    for key in config.filters.sanitized_strip_params() {
        obj.remove(&key);
    }
    for (key, value) in &config.filters.set_params {
        if key != "model" {
            obj.insert(key.clone(), value.clone());
        }
    }
    if !config.use_model_name.is_empty() {
        obj.insert(
            "model".to_string(),
            Value::String(config.use_model_name.clone()),
        );
    }
}

/// Forward a request verbatim to a model's backend, activating it first.
async fn upstream_passthrough(
    State(state): State<AppState>,
    Path((model, path)): Path<(String, String)>,
    req: Request,
) -> Response<Body> {
    let (mut parts, body) = req.into_parts();
    let query = parts
        .uri
        .query()
        .map(|q| format!("?{q}"))
        .unwrap_or_default();
    parts.uri = match format!("/{path}{query}").parse() {
        Ok(uri) => uri,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "invalid upstream path"),
    };

    let req = Request::from_parts(parts, body);
    match state.scheduler.proxy_request(&model, req).await {
        Ok(response) => response,
        Err(e) => scheduler_error_response(e),
    }
}

// ---------------------------------------------------------------------------
// Management
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ModelsQuery {
    #[serde(default)]
    include: Option<String>,
}

async fn list_models(
    State(state): State<AppState>,
    Query(query): Query<ModelsQuery>,
) -> Json<Value> {
    let include_aliases = query
        .include
        .as_deref()
        .is_some_and(|v| v.split(',').any(|p| p.trim() == "aliases"));

    let mut data = Vec::new();
    for (id, model) in &state.config.models {
        if model.unlisted {
            continue;
        }
        data.push(serde_json::json!({
            "id": id,
            "object": "model",
            "created": 0,
            "owned_by": "llmsnap",
            "name": model.name,
            "description": model.description,
        }));
        if include_aliases {
            for alias in &model.aliases {
                data.push(serde_json::json!({
                    "id": alias,
                    "object": "model",
                    "created": 0,
                    "owned_by": "llmsnap",
                    "name": model.name,
                    "description": model.description,
                }));
            }
        }
    }
    data.sort_by(|a, b| a["id"].as_str().cmp(&b["id"].as_str()));

    Json(serde_json::json!({ "object": "list", "data": data }))
}

#[derive(Serialize)]
struct RunningProcess {
    model: String,
    state: ProcessState,
}

async fn running(State(state): State<AppState>) -> Json<Value> {
    let running: Vec<RunningProcess> = state
        .scheduler
        .processes()
        .into_iter()
        .filter(|p| {
            !matches!(
                p.current_state(),
                ProcessState::Stopped | ProcessState::Shutdown
            )
        })
        .map(|p| RunningProcess {
            model: p.model_id().to_string(),
            state: p.current_state(),
        })
        .collect();

    Json(serde_json::json!({ "running": running }))
}

async fn unload_all(State(state): State<AppState>) -> &'static str {
    state.scheduler.stop_all(StopMode::WaitForInflight).await;
    "OK"
}

async fn unload_model(
    State(state): State<AppState>,
    Path(model): Path<String>,
) -> Response<Body> {
    let Some(process) = state.scheduler.find_process(&model) else {
        return error_response(StatusCode::NOT_FOUND, &format!("unknown model: {model}"));
    };
    match process.stop(StopMode::WaitForInflight).await {
        Ok(()) => "OK".into_response(),
        Err(e) => error_response(e.status(), &e.to_string()),
    }
}

async fn sleep_model(State(state): State<AppState>, Path(model): Path<String>) -> Response<Body> {
    let Some(process) = state.scheduler.find_process(&model) else {
        return error_response(StatusCode::NOT_FOUND, &format!("unknown model: {model}"));
    };
    if !process.sleep_configured() {
        return error_response(
            StatusCode::CONFLICT,
            &format!("sleep mode is not enabled for {model}"),
        );
    }
    match process.sleep().await {
        Ok(()) => "OK".into_response(),
        Err(e) => error_response(e.status(), &e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Observability
// ---------------------------------------------------------------------------

async fn events_stream(State(state): State<AppState>) -> impl IntoResponse {
    let rx = state.events.subscribe();
    let stream = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let data = serde_json::to_string(&event).unwrap_or_default();
                    let frame = Event::default().event(event.kind()).data(data);
                    return Some((Ok::<_, Infallible>(frame), rx));
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    });

    (
        [("X-Accel-Buffering", "no")],
        Sse::new(stream).keep_alive(KeepAlive::default()),
    )
}

async fn metrics_snapshot(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::json!(state.metrics.snapshot()))
}

async fn capture(State(state): State<AppState>, Path(id): Path<u64>) -> Response<Body> {
    match state.metrics.capture(id) {
        Some((content_type, bytes)) => {
            let content_type = if content_type.is_empty() {
                "application/octet-stream".to_string()
            } else {
                content_type
            };
            Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, content_type)
                .body(Body::from(bytes))
                .unwrap_or_else(|_| error_response(StatusCode::INTERNAL_SERVER_ERROR, "capture"))
        }
        None => error_response(StatusCode::NOT_FOUND, &format!("no capture for id {id}")),
    }
}

async fn logs_snapshot(State(state): State<AppState>) -> impl IntoResponse {
    let text: String = state
        .logs
        .snapshot()
        .into_iter()
        .map(|l| format!("[{}] {}\n", l.source, l.line))
        .collect();
    ([(CONTENT_TYPE, "text/plain; charset=utf-8")], text)
}

async fn logs_stream(State(state): State<AppState>) -> impl IntoResponse {
    let rx = state.events.subscribe();
    let stream = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if event.kind() != "logLine" {
                        continue;
                    }
                    let data = serde_json::to_string(&event).unwrap_or_default();
                    let frame = Event::default().event("logLine").data(data);
                    return Some((Ok::<_, Infallible>(frame), rx));
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    });

    (
        [("X-Accel-Buffering", "no")],
        Sse::new(stream).keep_alive(KeepAlive::default()),
    )
}

async fn prometheus_metrics(State(state): State<AppState>) -> Response<Body> {
    match &state.prometheus {
        Some(handle) => handle.render().into_response(),
        None => error_response(StatusCode::NOT_FOUND, "prometheus exporter not installed"),
    }
}

// ---------------------------------------------------------------------------
// Error envelopes
// ---------------------------------------------------------------------------

fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    let body = serde_json::json!({
        "error": {
            "message": message,
            "type": "llmsnap_error"
        }
    });

    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("static error response")
}

fn scheduler_error_response(error: SchedulerError) -> Response<Body> {
    error_response(error.status(), &error.to_string())
}
