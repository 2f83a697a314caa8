//! Thin fan-out of state-change, metrics and log events.
//!
//! A tokio broadcast channel with best-effort delivery: emitting never
//! blocks, subscribers that fall behind lose the oldest events.

use crate::metrics_monitor::TokenMetrics;
use crate::state::ProcessState;
use serde::Serialize;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A state change of a managed process.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStateEvent {
    pub model: String,
    pub state: ProcessState,
    pub timestamp_ms: u64,
}

/// One line of child or proxy output.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLine {
    pub timestamp_ms: u64,
    /// Model ID, or `proxy` for llmsnap's own lines.
    pub source: String,
    pub line: String,
}

/// Everything observable over `/api/events`.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ProxyEvent {
    ProcessState(ProcessStateEvent),
    TokenMetrics(TokenMetrics),
    Log(LogLine),
}

impl ProxyEvent {
    /// SSE `event:` name for this payload.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyEvent::ProcessState(_) => "processState",
            ProxyEvent::TokenMetrics(_) => "tokenMetrics",
            ProxyEvent::Log(_) => "logLine",
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ProxyEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Emit an event; a send with no subscribers is not an error.
    pub fn emit(&self, event: ProxyEvent) {
        let _ = self.tx.send(event);
    }

    pub fn emit_state(&self, model: &str, state: ProcessState) {
        self.emit(ProxyEvent::ProcessState(ProcessStateEvent {
            model: model.to_string(),
            state,
            timestamp_ms: now_ms(),
        }));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.tx.subscribe()
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
