//! Token-usage metrics collected by observing proxied responses.
//!
//! The proxy never parses a response on the hot path. Instead the response
//! body is wrapped in [`ObservedBody`], which forwards every frame unchanged
//! while copying up to a configured cap into a side buffer. Once the stream
//! ends the buffer is parsed for OpenAI-style `usage` and llama-server-style
//! `timings` objects and a [`TokenMetrics`] record is appended to a bounded
//! FIFO ring.

use crate::events::{EventBus, ProxyEvent, now_ms};
use axum::body::Body;
use axum::http::StatusCode;
use bytes::{Bytes, BytesMut};
use http_body::Frame;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::RwLock;
use std::task::{Context, Poll};
use std::time::Instant;
use tracing::{debug, warn};

/// Parsed token statistics for one completed upstream request.
///
/// Counts default to 0 when unknown; rates and cached tokens use -1 as the
/// "unknown" sentinel.
#[derive(Debug, Clone, Serialize)]
pub struct TokenMetrics {
    pub id: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub model: String,
    pub cache_tokens: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub prompt_per_second: f64,
    pub tokens_per_second: f64,
    pub duration_ms: i64,
}

/// Everything the parser needs to know about the response it observed.
pub struct ResponseContext {
    pub model: String,
    pub path: String,
    pub status: StatusCode,
    pub content_type: String,
    pub request_start: Instant,
}

struct Record {
    metrics: TokenMetrics,
    content_type: String,
    capture: Bytes,
}

struct Ring {
    records: VecDeque<Record>,
    next_id: u64,
}

/// Bounded FIFO of [`TokenMetrics`] with monotonically assigned IDs.
pub struct MetricsMonitor {
    ring: RwLock<Ring>,
    max_metrics: usize,
    capture_max_bytes: usize,
    events: EventBus,
}

impl MetricsMonitor {
    pub fn new(max_metrics: usize, capture_max_bytes: usize, events: EventBus) -> Self {
        Self {
            ring: RwLock::new(Ring {
                records: VecDeque::new(),
                next_id: 0,
            }),
            max_metrics,
            capture_max_bytes,
            events,
        }
    }

    pub fn capture_max_bytes(&self) -> usize {
        self.capture_max_bytes
    }

    /// Append a metric, assigning the next record ID. Returns the ID.
    pub fn add_metrics(&self, metrics: TokenMetrics) -> u64 {
        self.add_record(metrics, String::new(), Bytes::new())
    }

    fn add_record(&self, mut metrics: TokenMetrics, content_type: String, capture: Bytes) -> u64 {
        let id;
        {
            let mut ring = self.ring.write().unwrap();
            id = ring.next_id;
            ring.next_id += 1;
            metrics.id = id;
            ring.records.push_back(Record {
                metrics: metrics.clone(),
                content_type,
                capture,
            });
            while ring.records.len() > self.max_metrics {
                ring.records.pop_front();
            }
        }
        self.events.emit(ProxyEvent::TokenMetrics(metrics));
        id
    }

    /// A copy of the retained metrics, oldest first.
    pub fn snapshot(&self) -> Vec<TokenMetrics> {
        self.ring
            .read()
            .unwrap()
            .records
            .iter()
            .map(|r| r.metrics.clone())
            .collect()
    }

    /// Captured response body for a metric still in the ring.
    pub fn capture(&self, id: u64) -> Option<(String, Bytes)> {
        self.ring
            .read()
            .unwrap()
            .records
            .iter()
            .find(|r| r.metrics.id == id)
            .map(|r| (r.content_type.clone(), r.capture.clone()))
    }

    /// Parse a completed response and record a metric. Failures here are
    /// observational only and are logged, never surfaced to the client.
    pub fn observe(&self, ctx: ResponseContext, body: Bytes, first_byte: Option<Instant>) {
        if !ctx.status.is_success() {
            warn!(
                status = %ctx.status,
                path = %ctx.path,
                error = %String::from_utf8_lossy(&body),
                "metrics skipped, non-2xx response"
            );
            return;
        }

        if body.is_empty() {
            warn!(path = %ctx.path, "metrics skipped, empty body");
            return;
        }

        if let Some(first) = first_byte {
            debug!(
                model = %ctx.model,
                ttfb_ms = first.duration_since(ctx.request_start).as_millis() as u64,
                "response observed"
            );
        }

        let elapsed_ms = ctx.request_start.elapsed().as_millis() as i64;

        let metrics = if ctx.content_type.contains("text/event-stream") {
            match scan_stream(&body) {
                StreamScan::Found { usage, timings } => Some(parse_metrics(
                    &ctx.model,
                    elapsed_ms,
                    usage.as_ref(),
                    timings.as_ref(),
                )),
                // Valid frames but no usage anywhere: track the request with
                // unknown token counts.
                StreamScan::JsonOnly => Some(parse_metrics(&ctx.model, elapsed_ms, None, None)),
                StreamScan::Nothing => {
                    warn!(path = %ctx.path, "metrics skipped, no valid JSON data in stream");
                    None
                }
            }
        } else {
            match serde_json::from_slice::<Value>(&body) {
                Ok(parsed) => Some(parse_metrics(
                    &ctx.model,
                    elapsed_ms,
                    parsed.get("usage"),
                    parsed.get("timings"),
                )),
                Err(_) => {
                    warn!(path = %ctx.path, "metrics skipped, invalid JSON in response body");
                    None
                }
            }
        };

        if let Some(metrics) = metrics {
            self.add_record(metrics, ctx.content_type, body);
        }
    }
}

enum StreamScan {
    Found {
        usage: Option<Value>,
        timings: Option<Value>,
    },
    JsonOnly,
    Nothing,
}

/// Scan an SSE buffer backwards for the last `data:` payload carrying
/// `usage` or `timings`. Walking from the end avoids splitting megabyte
/// streams into lines up front.
fn scan_stream(body: &[u8]) -> StreamScan {
    let mut pos = body.len();
    let mut found_valid_json = false;

    while pos > 0 {
        let line_start = match body[..pos].iter().rposition(|&b| b == b'\n') {
            Some(i) => i + 1,
            None => 0,
        };
        let line = body[line_start..pos].trim_ascii();
        pos = line_start.saturating_sub(1);

        let Some(data) = line.strip_prefix(b"data:") else {
            continue;
        };
        let data = data.trim_ascii();
        if data.is_empty() || data == b"[DONE]" {
            continue;
        }

        if let Ok(parsed) = serde_json::from_slice::<Value>(data) {
            found_valid_json = true;
            let usage = parsed.get("usage").cloned();
            let timings = parsed.get("timings").cloned();
            if usage.is_some() || timings.is_some() {
                return StreamScan::Found { usage, timings };
            }
        }
    }

    if found_valid_json {
        StreamScan::JsonOnly
    } else {
        StreamScan::Nothing
    }
}

fn int_field(obj: &Value, key: &str) -> Option<i64> {
    obj.get(key).and_then(Value::as_i64)
}

fn float_field(obj: &Value, key: &str) -> Option<f64> {
    obj.get(key).and_then(Value::as_f64)
}

/// Build a metric from optional `usage` and `timings` objects.
///
/// `timings` (llama-server) is preferred over `usage` because it reflects
/// backend-measured durations rather than wall-clock time that includes
/// network latency.
fn parse_metrics(
    model: &str,
    elapsed_ms: i64,
    usage: Option<&Value>,
    timings: Option<&Value>,
) -> TokenMetrics {
    let mut cache_tokens: i64 = -1;
    let mut input_tokens: i64 = 0;
    let mut output_tokens: i64 = 0;
    let mut prompt_per_second: f64 = -1.0;
    let mut tokens_per_second: f64 = -1.0;
    let mut duration_ms = elapsed_ms;

    if let Some(usage) = usage {
        // prompt/completion naming for chat completions, input/output for
        // the messages API.
        if let Some(n) = int_field(usage, "prompt_tokens").or_else(|| int_field(usage, "input_tokens"))
        {
            input_tokens = n;
        }
        if let Some(n) =
            int_field(usage, "completion_tokens").or_else(|| int_field(usage, "output_tokens"))
        {
            output_tokens = n;
        }
        if let Some(n) = int_field(usage, "cache_read_input_tokens") {
            cache_tokens = n;
        }
    }

    if let Some(timings) = timings {
        input_tokens = int_field(timings, "prompt_n").unwrap_or(0);
        output_tokens = int_field(timings, "predicted_n").unwrap_or(0);
        prompt_per_second = float_field(timings, "prompt_per_second").unwrap_or(0.0);
        tokens_per_second = float_field(timings, "predicted_per_second").unwrap_or(0.0);
        duration_ms = (float_field(timings, "prompt_ms").unwrap_or(0.0)
            + float_field(timings, "predicted_ms").unwrap_or(0.0)) as i64;

        if let Some(n) = int_field(timings, "cache_n") {
            cache_tokens = n;
        }
    }

    // Backends like vLLM report token counts but no rates; derive one from
    // wall-clock duration. Never divides by zero.
    if tokens_per_second == -1.0 && output_tokens > 0 && duration_ms > 0 {
        tokens_per_second = output_tokens as f64 / (duration_ms as f64 / 1000.0);
    }

    TokenMetrics {
        id: 0,
        timestamp: now_ms(),
        model: model.to_string(),
        cache_tokens,
        input_tokens,
        output_tokens,
        prompt_per_second,
        tokens_per_second,
        duration_ms,
    }
}

/// Response body adapter that forwards every frame downstream while copying
/// up to `capture_max_bytes` into a side buffer. When the stream ends the
/// buffer is handed to the [`MetricsMonitor`]; overflow beyond the cap is
/// dropped for metrics purposes without affecting the forwarded bytes.
///
/// Holds the caller-supplied guards (in-flight counter, concurrency permit)
/// until the stream completes or the client disconnects.
pub struct ObservedBody<G: Send + 'static> {
    inner: Body,
    monitor: std::sync::Arc<MetricsMonitor>,
    ctx: Option<ResponseContext>,
    capture: BytesMut,
    first_byte: Option<Instant>,
    _guards: G,
}

impl<G: Send + 'static> ObservedBody<G> {
    pub fn new(
        inner: Body,
        monitor: std::sync::Arc<MetricsMonitor>,
        ctx: ResponseContext,
        guards: G,
    ) -> Self {
        Self {
            inner,
            monitor,
            ctx: Some(ctx),
            capture: BytesMut::new(),
            first_byte: None,
            _guards: guards,
        }
    }

    fn finish(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            let body = self.capture.split().freeze();
            self.monitor.observe(ctx, body, self.first_byte);
        }
    }
}

impl<G: Send + Unpin + 'static> http_body::Body for ObservedBody<G> {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    if this.first_byte.is_none() {
                        this.first_byte = Some(Instant::now());
                    }
                    let cap = this.monitor.capture_max_bytes();
                    let room = cap.saturating_sub(this.capture.len());
                    if room > 0 {
                        let take = room.min(data.len());
                        this.capture.extend_from_slice(&data[..take]);
                    }
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            other => other,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}
