//! # llmsnap
//!
//! OpenAI-compatible HTTP proxy that serves many logical models from a
//! smaller pool of GPU-resident backends. Requests name a `model`; llmsnap
//! resolves it to a managed child process, makes that process ready
//! (starting it, or waking it from sleep, displacing conflicting processes
//! first), streams the request through a reverse proxy, and idles the
//! process out again on a TTL.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        llmsnap                           │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │ Router (axum)                                      │  │
//! │  │ - extracts + filters the model field               │  │
//! │  │ - management & observability endpoints             │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │                          │                               │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │ Scheduler → ProcessGroup                           │  │
//! │  │ - exclusive groups idle other groups               │  │
//! │  │ - swap groups idle sibling members                 │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │                          │                               │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │ Process                                            │  │
//! │  │ - stopped → starting → ready → asleep → … lifecycle│  │
//! │  │ - health checks, TTL, sleep/wake sequences         │  │
//! │  │ - reverse proxy with tee'd metrics observation     │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │      │                   │                   │           │
//! │      ▼                   ▼                   ▼           │
//! │  [backend:5800]     [backend:5801]      [backend:5802]   │
//! └──────────────────────────────────────────────────────────┘
//! ```

mod config;
mod events;
mod group;
mod logs;
mod metrics_monitor;
mod process;
mod scheduler;
mod server;
mod state;
mod telemetry;

pub use config::{Config, GroupConfig, HttpEndpoint, ModelConfig, ModelFilters, SleepMode};
pub use events::{EventBus, LogLine, ProcessStateEvent, ProxyEvent};
pub use group::ProcessGroup;
pub use logs::LogMonitor;
pub use metrics_monitor::{MetricsMonitor, TokenMetrics};
pub use process::{InFlightGuard, Process, ProcessContext, ProcessError, StopMode};
pub use scheduler::{Scheduler, SchedulerError};
pub use server::AppState;
pub use state::{ProcessState, StateError};

use anyhow::Result;
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Build the complete llmsnap stack from a normalized configuration.
///
/// Returns the Axum router and the scheduler handle (for shutdown).
pub async fn build_app(config: Config) -> Result<(Router, Arc<Scheduler>)> {
    info!(
        models = config.models.len(),
        groups = config.groups.len(),
        "building llmsnap"
    );

    let config = Arc::new(config);
    let events = EventBus::new();
    let logs = Arc::new(LogMonitor::new(events.clone()));
    let metrics = Arc::new(MetricsMonitor::new(
        config.metrics_max_in_memory,
        config.capture_max_body_bytes,
        events.clone(),
    ));

    let ctx = ProcessContext {
        events: events.clone(),
        logs: logs.clone(),
        metrics: metrics.clone(),
        health_check_timeout: Duration::from_secs(config.health_check_timeout),
        sleep_request_timeout: Duration::from_secs(config.sleep_request_timeout),
        wake_request_timeout: Duration::from_secs(config.wake_request_timeout),
    };

    let scheduler = Arc::new(Scheduler::new(&config, ctx)?);
    let prometheus = telemetry::install();

    let state = AppState {
        scheduler: Arc::clone(&scheduler),
        metrics,
        events,
        logs,
        config,
        prometheus,
    };

    Ok((server::build_router(state), scheduler))
}
