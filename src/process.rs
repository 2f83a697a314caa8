//! One managed backend process: lifecycle, health checking, reverse proxy,
//! concurrency gating, TTL idling and sleep/wake sequencing.
//!
//! All state mutation funnels through `swap_state`, which enforces the legal
//! transition table. Each transitional state (Starting, SleepPending,
//! Waking) has a gate; concurrent callers that lose the swap race wait on
//! the gate and re-check instead of attempting their own transition. A
//! dedicated supervision task per child is the only place that settles the
//! state to Stopped after the child dies.

use crate::config::{HttpEndpoint, ModelConfig};
use crate::events::EventBus;
use crate::logs::LogMonitor;
use crate::metrics_monitor::{MetricsMonitor, ObservedBody, ResponseContext};
use crate::state::{ProcessState, StateError};
use axum::body::Body;
use axum::http::header::{CONTENT_TYPE, HOST};
use axum::http::{HeaderValue, Method, Request, Response, StatusCode};
use bytes::Bytes;
use http_body_util::{Empty, Full};
use hyper::Uri;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use metrics::{counter, gauge};
use std::process::Stdio;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

const HEALTH_CHECK_LOOP_INTERVAL: Duration = Duration::from_millis(250);
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const TTL_CHECK_INTERVAL: Duration = Duration::from_secs(1);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const SIGTERM_GRACE: Duration = Duration::from_secs(5);
const CMD_STOP_GRACE: Duration = Duration::from_secs(10);
const FORCE_KILL_WAIT: Duration = Duration::from_secs(10);
const STOP_SETTLE_TIMEOUT: Duration = Duration::from_secs(30);

/// How `stop` treats requests that are still streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Refuse new requests, wait for in-flight to reach zero, then kill.
    WaitForInflight,
    /// Kill right away.
    Immediate,
}

/// Errors from process lifecycle operations and proxying.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("model {model}: cannot serve while {state}")]
    Unavailable { model: String, state: ProcessState },

    #[error("model {model}: not ready, settled at {state}")]
    NotReady { model: String, state: ProcessState },

    #[error("model {model}: health check timed out")]
    HealthCheckTimeout { model: String },

    #[error("model {model}: timed out waiting for {state} to settle")]
    GateTimeout { model: String, state: ProcessState },

    #[error("model {model}: {reason}")]
    Spawn { model: String, reason: String },

    #[error("{0}")]
    Command(String),

    #[error("model {model}: concurrency limit reached")]
    ConcurrencyRejected { model: String },

    #[error("model {model}: upstream request failed: {reason}")]
    Upstream { model: String, reason: String },

    #[error("model {model}: endpoint {endpoint} failed: {reason}")]
    Endpoint {
        model: String,
        endpoint: String,
        reason: String,
    },

    #[error("model {model}: sleep failed, settled at {state}")]
    SleepFailed { model: String, state: ProcessState },

    #[error("model {model}: cannot wake from {state}")]
    WakeFromInvalidState { model: String, state: ProcessState },

    #[error(transparent)]
    State(#[from] StateError),
}

impl ProcessError {
    /// HTTP status this error maps to when it occurs before any bytes were
    /// sent to the client.
    pub fn status(&self) -> StatusCode {
        match self {
            ProcessError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            ProcessError::Spawn { .. } | ProcessError::Command(_) | ProcessError::State(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            _ => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Shared handles and timeouts every process is constructed with.
#[derive(Clone)]
pub struct ProcessContext {
    pub events: EventBus,
    pub logs: Arc<LogMonitor>,
    pub metrics: Arc<MetricsMonitor>,
    pub health_check_timeout: Duration,
    pub sleep_request_timeout: Duration,
    pub wake_request_timeout: Duration,
}

struct ProcessInner {
    model_id: String,
    config: ModelConfig,
    port: u16,
    upstream: String,
    ctx: ProcessContext,

    state: Mutex<ProcessState>,
    start_gate: Notify,
    sleep_gate: Notify,
    wake_gate: Notify,
    state_changed: Notify,

    pid: Mutex<Option<u32>>,
    exit_notify: Notify,

    in_flight: AtomicUsize,
    in_flight_changed: Notify,
    last_request: Mutex<Instant>,
    failed_starts: AtomicUsize,
    ttl_generation: AtomicU64,

    concurrency: Option<Arc<Semaphore>>,
    client: Client<HttpConnector, Body>,
}

/// Handle to one managed backend. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Process {
    inner: Arc<ProcessInner>,
}

impl Process {
    pub fn new(
        model_id: &str,
        config: ModelConfig,
        port: u16,
        ctx: ProcessContext,
    ) -> Result<Self, ProcessError> {
        let upstream = config
            .upstream_url(model_id, port)
            .map_err(|e| ProcessError::Command(e.to_string()))?;

        let concurrency = match config.concurrency_limit {
            0 => None,
            n => Some(Arc::new(Semaphore::new(n))),
        };

        let client = Client::builder(TokioExecutor::new()).build_http();

        Ok(Self {
            inner: Arc::new(ProcessInner {
                model_id: model_id.to_string(),
                config,
                port,
                upstream,
                ctx,
                state: Mutex::new(ProcessState::Stopped),
                start_gate: Notify::new(),
                sleep_gate: Notify::new(),
                wake_gate: Notify::new(),
                state_changed: Notify::new(),
                pid: Mutex::new(None),
                exit_notify: Notify::new(),
                in_flight: AtomicUsize::new(0),
                in_flight_changed: Notify::new(),
                last_request: Mutex::new(Instant::now()),
                failed_starts: AtomicUsize::new(0),
                ttl_generation: AtomicU64::new(0),
                concurrency,
                client,
            }),
        })
    }

    pub fn model_id(&self) -> &str {
        &self.inner.model_id
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    pub fn current_state(&self) -> ProcessState {
        *self.inner.state.lock().unwrap()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    pub fn failed_start_count(&self) -> usize {
        self.inner.failed_starts.load(Ordering::SeqCst)
    }

    pub fn pid(&self) -> Option<u32> {
        *self.inner.pid.lock().unwrap()
    }

    pub fn sleep_configured(&self) -> bool {
        self.inner.config.sleep_configured()
    }

    // ------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------

    /// The only mutation surface for process state. Checks the expected
    /// `from` and the legality of the edge under one lock; on conflict the
    /// caller learns the actual current state.
    fn swap_state(&self, from: ProcessState, to: ProcessState) -> Result<ProcessState, StateError> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if *state != from {
                return Err(StateError::Conflict {
                    expected: from,
                    actual: *state,
                });
            }
            if !from.can_transition_to(to) {
                return Err(StateError::Illegal { from, to });
            }
            *state = to;
        }

        debug!(model = %self.inner.model_id, %from, %to, "state transition");
        match from {
            ProcessState::Starting => self.inner.start_gate.notify_waiters(),
            ProcessState::SleepPending => self.inner.sleep_gate.notify_waiters(),
            ProcessState::Waking => self.inner.wake_gate.notify_waiters(),
            _ => {}
        }
        self.inner.state_changed.notify_waiters();
        self.inner.ctx.events.emit_state(&self.inner.model_id, to);
        Ok(from)
    }

    /// Wait until the state leaves `transitional`, waking on its gate.
    /// Bounded by the health-check timeout.
    async fn wait_gate(
        &self,
        transitional: ProcessState,
        gate: &Notify,
    ) -> Result<ProcessState, ProcessError> {
        let wait = async {
            loop {
                let notified = gate.notified();
                let cur = self.current_state();
                if cur != transitional {
                    return cur;
                }
                notified.await;
            }
        };
        tokio::time::timeout(self.inner.ctx.health_check_timeout, wait)
            .await
            .map_err(|_| ProcessError::GateTimeout {
                model: self.inner.model_id.clone(),
                state: transitional,
            })
    }

    async fn wait_in_flight_zero(&self) {
        loop {
            let notified = self.inner.in_flight_changed.notified();
            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    // ------------------------------------------------------------------
    // Readiness
    // ------------------------------------------------------------------

    /// Bring the process to Ready, starting or waking it as needed. Waits on
    /// the relevant gate when another caller owns the transition.
    pub async fn make_ready(&self) -> Result<(), ProcessError> {
        loop {
            match self.current_state() {
                ProcessState::Ready => return Ok(()),
                ProcessState::Stopped => self.start().await?,
                ProcessState::Asleep | ProcessState::SleepPending => self.wake().await?,
                ProcessState::Starting => {
                    let settled = self
                        .wait_gate(ProcessState::Starting, &self.inner.start_gate)
                        .await?;
                    if settled != ProcessState::Ready {
                        return Err(ProcessError::NotReady {
                            model: self.inner.model_id.clone(),
                            state: settled,
                        });
                    }
                }
                ProcessState::Waking => {
                    let settled = self
                        .wait_gate(ProcessState::Waking, &self.inner.wake_gate)
                        .await?;
                    if settled != ProcessState::Ready {
                        return Err(ProcessError::NotReady {
                            model: self.inner.model_id.clone(),
                            state: settled,
                        });
                    }
                }
                state @ (ProcessState::Stopping | ProcessState::Shutdown) => {
                    return Err(ProcessError::Unavailable {
                        model: self.inner.model_id.clone(),
                        state,
                    });
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Start
    // ------------------------------------------------------------------

    async fn start(&self) -> Result<(), ProcessError> {
        match self.swap_state(ProcessState::Stopped, ProcessState::Starting) {
            Ok(_) => {}
            Err(StateError::Conflict {
                actual: ProcessState::Starting,
                ..
            }) => {
                // Another caller owns the start; wait for it to settle.
                let settled = self
                    .wait_gate(ProcessState::Starting, &self.inner.start_gate)
                    .await?;
                return if settled == ProcessState::Ready {
                    Ok(())
                } else {
                    Err(ProcessError::NotReady {
                        model: self.inner.model_id.clone(),
                        state: settled,
                    })
                };
            }
            Err(StateError::Conflict {
                actual: ProcessState::Ready,
                ..
            }) => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        info!(model = %self.inner.model_id, port = self.inner.port, "starting process");

        if let Err(spawn_err) = self.spawn_child() {
            self.inner.failed_starts.fetch_add(1, Ordering::SeqCst);
            // Report the spawn error and any transition conflict together.
            let reason = match self.swap_state(ProcessState::Starting, ProcessState::Stopped) {
                Ok(_) => spawn_err,
                Err(swap_err) => format!("{spawn_err}; also failed to reset state: {swap_err}"),
            };
            return Err(ProcessError::Spawn {
                model: self.inner.model_id.clone(),
                reason,
            });
        }

        match self.wait_until_healthy(ProcessState::Starting).await {
            Ok(()) => {
                self.swap_state(ProcessState::Starting, ProcessState::Ready)?;
                self.inner.failed_starts.store(0, Ordering::SeqCst);
                self.touch_last_request();
                self.spawn_ttl_monitor();
                info!(model = %self.inner.model_id, "process is ready");
                Ok(())
            }
            Err(e) => {
                self.inner.failed_starts.fetch_add(1, Ordering::SeqCst);
                warn!(model = %self.inner.model_id, error = %e, "start failed, killing child");
                self.signal_group(libc::SIGKILL);
                self.wait_child_exit(FORCE_KILL_WAIT).await;
                Err(e)
            }
        }
    }

    fn spawn_child(&self) -> Result<(), String> {
        let argv = self
            .inner
            .config
            .start_argv(&self.inner.model_id, self.inner.port)
            .map_err(|e| e.to_string())?;

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .envs(self.inner.config.env_pairs())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group so stop-by-signal reliably kills descendants.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| format!("failed to spawn {}: {e}", argv[0]))?;

        *self.inner.pid.lock().unwrap() = child.id();

        if let Some(stdout) = child.stdout.take() {
            self.forward_output(stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            self.forward_output(stderr);
        }

        let process = self.clone();
        tokio::spawn(async move { process.supervise(child).await });

        Ok(())
    }

    fn forward_output<R>(&self, stream: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let process = self.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "upstream", model = %process.inner.model_id, "{line}");
                process.inner.ctx.logs.append(&process.inner.model_id, &line);
            }
        });
    }

    /// Waits for the child to exit and settles the state at Stopped. This is
    /// the only task allowed to conclude that the child is gone; everything
    /// else requests a stop through the transition primitive.
    async fn supervise(&self, mut child: Child) {
        match child.wait().await {
            Ok(status) => {
                info!(model = %self.inner.model_id, %status, "child exited")
            }
            Err(e) => warn!(model = %self.inner.model_id, error = %e, "failed to wait on child"),
        }

        *self.inner.pid.lock().unwrap() = None;
        self.inner.exit_notify.notify_waiters();

        loop {
            let cur = self.current_state();
            let next = match cur {
                ProcessState::Stopped | ProcessState::Shutdown => break,
                ProcessState::Starting
                | ProcessState::Waking
                | ProcessState::Stopping => ProcessState::Stopped,
                ProcessState::Ready
                | ProcessState::SleepPending
                | ProcessState::Asleep => ProcessState::Stopping,
            };
            // Break as soon as Stopped lands; re-reading after that could
            // observe a fresh start's Starting and clobber it.
            if self.swap_state(cur, next).is_ok() && next == ProcessState::Stopped {
                break;
            }
        }
    }

    // ------------------------------------------------------------------
    // Health checking
    // ------------------------------------------------------------------

    /// Poll the upstream health endpoint until it answers 2xx. Aborts when
    /// the state leaves `phase` (external stop) or the deadline passes.
    async fn wait_until_healthy(&self, phase: ProcessState) -> Result<(), ProcessError> {
        let url = format!("{}{}", self.inner.upstream, self.inner.config.check_endpoint);
        let deadline = Instant::now() + self.inner.ctx.health_check_timeout;

        loop {
            let cur = self.current_state();
            if cur != phase {
                return Err(ProcessError::NotReady {
                    model: self.inner.model_id.clone(),
                    state: cur,
                });
            }
            if Instant::now() >= deadline {
                return Err(ProcessError::HealthCheckTimeout {
                    model: self.inner.model_id.clone(),
                });
            }
            if self.check_health(&url).await {
                return Ok(());
            }
            tokio::time::sleep(HEALTH_CHECK_LOOP_INTERVAL).await;
        }
    }

    async fn check_health(&self, url: &str) -> bool {
        let Ok(uri) = url.parse::<Uri>() else {
            return false;
        };
        let Ok(request) = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Empty::<Bytes>::new())
        else {
            return false;
        };

        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(CONNECT_TIMEOUT));
        let client: Client<_, Empty<Bytes>> =
            Client::builder(TokioExecutor::new()).build(connector);

        match tokio::time::timeout(HEALTH_PROBE_TIMEOUT, client.request(request)).await {
            Ok(Ok(response)) => response.status().is_success(),
            _ => false,
        }
    }

    // ------------------------------------------------------------------
    // Sleep / wake
    // ------------------------------------------------------------------

    /// Put the backend to sleep via its configured endpoint sequence.
    /// No-op when sleep mode is disabled; success when already Asleep.
    /// A failed sequence falls back to Stop, never retries.
    pub async fn sleep(&self) -> Result<(), ProcessError> {
        if !self.inner.config.sleep_configured() {
            return Ok(());
        }

        loop {
            match self.current_state() {
                ProcessState::Asleep => return Ok(()),
                ProcessState::Stopped | ProcessState::Stopping | ProcessState::Shutdown => {
                    return Ok(());
                }
                ProcessState::SleepPending => {
                    let settled = self
                        .wait_gate(ProcessState::SleepPending, &self.inner.sleep_gate)
                        .await?;
                    return if settled == ProcessState::Asleep {
                        Ok(())
                    } else {
                        Err(ProcessError::SleepFailed {
                            model: self.inner.model_id.clone(),
                            state: settled,
                        })
                    };
                }
                ProcessState::Starting => {
                    self.wait_gate(ProcessState::Starting, &self.inner.start_gate)
                        .await?;
                }
                ProcessState::Waking => {
                    self.wait_gate(ProcessState::Waking, &self.inner.wake_gate)
                        .await?;
                }
                ProcessState::Ready => {
                    self.wait_in_flight_zero().await;
                    if self
                        .swap_state(ProcessState::Ready, ProcessState::SleepPending)
                        .is_err()
                    {
                        continue;
                    }

                    info!(model = %self.inner.model_id, "putting process to sleep");
                    match self
                        .run_endpoint_sequence(
                            &self.inner.config.sleep_endpoints,
                            self.inner.ctx.sleep_request_timeout,
                        )
                        .await
                    {
                        Ok(()) => {
                            self.swap_state(ProcessState::SleepPending, ProcessState::Asleep)?;
                            info!(model = %self.inner.model_id, "process is asleep");
                            return Ok(());
                        }
                        Err(e) => {
                            warn!(
                                model = %self.inner.model_id,
                                error = %e,
                                "sleep sequence failed, stopping process"
                            );
                            if self
                                .swap_state(ProcessState::SleepPending, ProcessState::Stopping)
                                .is_ok()
                            {
                                self.terminate_child().await;
                                self.wait_stop_settled().await;
                            }
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    /// Wake a sleeping backend. Success when already Ready; a wake that
    /// races an in-progress sleep waits for the sleep to settle first.
    ///
    /// Any failure in the wake sequence or the post-wake health check kills
    /// the child and settles at Stopped; recovery is the caller's decision.
    pub async fn wake(&self) -> Result<(), ProcessError> {
        loop {
            match self.current_state() {
                ProcessState::Ready => return Ok(()),
                ProcessState::Waking => {
                    let settled = self
                        .wait_gate(ProcessState::Waking, &self.inner.wake_gate)
                        .await?;
                    return if settled == ProcessState::Ready {
                        Ok(())
                    } else {
                        Err(ProcessError::NotReady {
                            model: self.inner.model_id.clone(),
                            state: settled,
                        })
                    };
                }
                ProcessState::SleepPending => {
                    self.wait_gate(ProcessState::SleepPending, &self.inner.sleep_gate)
                        .await?;
                }
                ProcessState::Asleep => {
                    if self
                        .swap_state(ProcessState::Asleep, ProcessState::Waking)
                        .is_err()
                    {
                        continue;
                    }

                    info!(model = %self.inner.model_id, "waking process");
                    let result = async {
                        self.run_endpoint_sequence(
                            &self.inner.config.wake_endpoints,
                            self.inner.ctx.wake_request_timeout,
                        )
                        .await?;
                        self.wait_until_healthy(ProcessState::Waking).await
                    }
                    .await;

                    return match result {
                        Ok(()) => {
                            self.swap_state(ProcessState::Waking, ProcessState::Ready)?;
                            self.touch_last_request();
                            self.spawn_ttl_monitor();
                            info!(model = %self.inner.model_id, "process is awake");
                            Ok(())
                        }
                        Err(e) => {
                            // Fail fast: kill the child rather than trying to
                            // recover inside the wake path.
                            warn!(
                                model = %self.inner.model_id,
                                error = %e,
                                "wake failed, killing child"
                            );
                            self.signal_group(libc::SIGKILL);
                            self.wait_child_exit(FORCE_KILL_WAIT).await;
                            if self.current_state() == ProcessState::Waking {
                                let _ =
                                    self.swap_state(ProcessState::Waking, ProcessState::Stopped);
                            }
                            Err(e)
                        }
                    };
                }
                state => {
                    return Err(ProcessError::WakeFromInvalidState {
                        model: self.inner.model_id.clone(),
                        state,
                    });
                }
            }
        }
    }

    /// Sleep when configured, stop otherwise.
    pub async fn make_idle(&self) -> Result<(), ProcessError> {
        if self.inner.config.sleep_configured() {
            self.sleep().await
        } else {
            self.stop(StopMode::WaitForInflight).await
        }
    }

    async fn run_endpoint_sequence(
        &self,
        endpoints: &[HttpEndpoint],
        default_timeout: Duration,
    ) -> Result<(), ProcessError> {
        for ep in endpoints {
            let timeout = if ep.timeout > 0 {
                Duration::from_secs(ep.timeout)
            } else {
                default_timeout
            };
            self.call_endpoint(ep, timeout)
                .await
                .map_err(|reason| ProcessError::Endpoint {
                    model: self.inner.model_id.clone(),
                    endpoint: ep.endpoint.clone(),
                    reason,
                })?;
        }
        Ok(())
    }

    async fn call_endpoint(&self, ep: &HttpEndpoint, timeout: Duration) -> Result<(), String> {
        let url = format!("{}{}", self.inner.upstream, ep.endpoint);
        let uri: Uri = url.parse().map_err(|e| format!("invalid URL {url}: {e}"))?;
        let method = Method::from_bytes(ep.method.as_bytes())
            .map_err(|e| format!("invalid method {}: {e}", ep.method))?;

        // A fresh client per call: a backend mid-sleep may have wedged any
        // pooled connections.
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(CONNECT_TIMEOUT));
        let client: Client<_, Full<Bytes>> =
            Client::builder(TokioExecutor::new()).build(connector);

        let mut builder = Request::builder().method(method).uri(uri);
        if !ep.body.is_empty() {
            builder = builder.header(CONTENT_TYPE, "application/json");
        }
        let request = builder
            .body(Full::new(Bytes::from(ep.body.clone())))
            .map_err(|e| e.to_string())?;

        let response = tokio::time::timeout(timeout, client.request(request))
            .await
            .map_err(|_| "request timed out".to_string())?
            .map_err(|e| format!("request failed: {e}"))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("status {}", response.status()))
        }
    }

    // ------------------------------------------------------------------
    // Stop
    // ------------------------------------------------------------------

    /// Stop the process. Idempotent; concurrent callers converge on the
    /// same Stopped state.
    pub async fn stop(&self, mode: StopMode) -> Result<(), ProcessError> {
        loop {
            let cur = self.current_state();
            match cur {
                ProcessState::Stopped | ProcessState::Shutdown => return Ok(()),
                ProcessState::Stopping => {
                    self.wait_stop_settled().await;
                    return Ok(());
                }
                ProcessState::Starting => {
                    // No Starting->Stopping edge; kill the child and let the
                    // supervisor settle the state.
                    self.signal_group(libc::SIGKILL);
                    if !self.wait_child_exit(FORCE_KILL_WAIT).await
                        && self.current_state() == ProcessState::Starting
                    {
                        // Spawn may not have happened yet.
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
                ProcessState::Ready
                | ProcessState::SleepPending
                | ProcessState::Asleep
                | ProcessState::Waking => {
                    if self.swap_state(cur, ProcessState::Stopping).is_err() {
                        continue;
                    }
                    info!(model = %self.inner.model_id, mode = ?mode, "stopping process");
                    if mode == StopMode::WaitForInflight {
                        self.wait_in_flight_zero().await;
                    }
                    self.terminate_child().await;
                    self.wait_stop_settled().await;
                    return Ok(());
                }
            }
        }
    }

    /// Stop and enter the terminal Shutdown state.
    pub async fn shutdown(&self) {
        let _ = self.stop(StopMode::Immediate).await;
        loop {
            let cur = self.current_state();
            match cur {
                ProcessState::Shutdown => return,
                ProcessState::Stopped | ProcessState::Stopping => {
                    if self.swap_state(cur, ProcessState::Shutdown).is_ok() {
                        return;
                    }
                }
                _ => {
                    let _ = self.stop(StopMode::Immediate).await;
                }
            }
        }
    }

    /// Run `cmdStop` when configured, otherwise (or as fallback) SIGTERM the
    /// process group, then SIGKILL after a grace period.
    async fn terminate_child(&self) {
        let pid = self.pid();
        let Some(pid) = pid else { return };

        match self
            .inner
            .config
            .stop_argv(&self.inner.model_id, self.inner.port, pid)
        {
            Ok(Some(argv)) => {
                info!(model = %self.inner.model_id, cmd = ?argv, "running stop command");
                match Command::new(&argv[0]).args(&argv[1..]).output().await {
                    Ok(out) if out.status.success() => {
                        if self.wait_child_exit(CMD_STOP_GRACE).await {
                            return;
                        }
                        warn!(
                            model = %self.inner.model_id,
                            "stop command did not stop the child, falling back to signals"
                        );
                    }
                    Ok(out) => {
                        warn!(model = %self.inner.model_id, status = %out.status, "stop command failed")
                    }
                    Err(e) => {
                        warn!(model = %self.inner.model_id, error = %e, "stop command failed to run")
                    }
                }
            }
            Ok(None) => {}
            Err(e) => warn!(model = %self.inner.model_id, error = %e, "invalid stop command"),
        }

        self.signal_group(libc::SIGTERM);
        if self.wait_child_exit(SIGTERM_GRACE).await {
            return;
        }
        self.signal_group(libc::SIGKILL);
        self.wait_child_exit(FORCE_KILL_WAIT).await;
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: libc::c_int) {
        if let Some(pid) = self.pid() {
            // The child was spawned in its own process group.
            unsafe {
                libc::kill(-(pid as libc::pid_t), signal);
            }
        }
    }

    #[cfg(not(unix))]
    fn signal_group(&self, _signal: i32) {}

    /// Wait until the supervisor observes the child's exit. Returns false on
    /// timeout or when no child was ever spawned under the current pid.
    async fn wait_child_exit(&self, timeout: Duration) -> bool {
        if self.pid().is_none() {
            return true;
        }
        let wait = async {
            loop {
                let notified = self.inner.exit_notify.notified();
                if self.pid().is_none() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    async fn wait_stop_settled(&self) {
        let wait = async {
            loop {
                let notified = self.inner.state_changed.notified();
                let cur = self.current_state();
                if matches!(cur, ProcessState::Stopped | ProcessState::Shutdown) {
                    return;
                }
                notified.await;
            }
        };
        if tokio::time::timeout(STOP_SETTLE_TIMEOUT, wait).await.is_err() {
            warn!(model = %self.inner.model_id, "timed out waiting for stop to settle");
        }
    }

    // ------------------------------------------------------------------
    // TTL
    // ------------------------------------------------------------------

    fn touch_last_request(&self) {
        *self.inner.last_request.lock().unwrap() = Instant::now();
    }

    /// Spawn the idle monitor for this Ready period. The generation counter
    /// retires any previous monitor so exactly one is live per process.
    fn spawn_ttl_monitor(&self) {
        let ttl_secs = self.inner.config.unload_after;
        if ttl_secs == 0 {
            return;
        }
        let generation = self.inner.ttl_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let process = self.clone();

        tokio::spawn(async move {
            let ttl = Duration::from_secs(ttl_secs);
            let mut tick = tokio::time::interval(TTL_CHECK_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tick.tick().await;

            loop {
                tick.tick().await;
                if process.inner.ttl_generation.load(Ordering::SeqCst) != generation {
                    return;
                }
                if process.current_state() != ProcessState::Ready {
                    return;
                }
                if process.in_flight() > 0 {
                    continue;
                }
                let idle = process.inner.last_request.lock().unwrap().elapsed();
                if idle >= ttl {
                    info!(
                        model = %process.inner.model_id,
                        idle_secs = idle.as_secs(),
                        "TTL expired, stopping process"
                    );
                    // TTL frees memory fully: stop, never sleep.
                    let _ = process.stop(StopMode::WaitForInflight).await;
                    return;
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Proxying
    // ------------------------------------------------------------------

    /// Serve one request through this process, starting or waking it first.
    /// The returned response streams; the in-flight slot and concurrency
    /// permit are released when the body completes or the client goes away.
    pub async fn proxy_request(&self, req: Request<Body>) -> Result<Response<Body>, ProcessError> {
        self.make_ready().await?;

        let permit = match &self.inner.concurrency {
            Some(sem) => {
                let acquired = tokio::time::timeout(
                    self.inner.ctx.health_check_timeout,
                    sem.clone().acquire_owned(),
                )
                .await;
                match acquired {
                    Ok(Ok(permit)) => Some(permit),
                    _ => {
                        return Err(ProcessError::ConcurrencyRejected {
                            model: self.inner.model_id.clone(),
                        });
                    }
                }
            }
            None => None,
        };

        let guard = InFlightGuard::new(self.inner.clone());

        // A stop may have slipped in while we waited on the semaphore.
        let cur = self.current_state();
        if cur != ProcessState::Ready {
            return Err(ProcessError::Unavailable {
                model: self.inner.model_id.clone(),
                state: cur,
            });
        }

        let request_start = Instant::now();
        let (mut parts, body) = req.into_parts();
        let path = parts.uri.path().to_string();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.to_string())
            .unwrap_or_else(|| "/".to_string());

        let uri: Uri = format!("{}{}", self.inner.upstream, path_and_query)
            .parse()
            .map_err(|e| ProcessError::Upstream {
                model: self.inner.model_id.clone(),
                reason: format!("invalid upstream URI: {e}"),
            })?;
        parts.uri = uri;
        parts.headers.remove(HOST);

        let upstream_req = Request::from_parts(parts, body);
        let response = self
            .inner
            .client
            .request(upstream_req)
            .await
            .map_err(|e| ProcessError::Upstream {
                model: self.inner.model_id.clone(),
                reason: e.to_string(),
            })?;

        counter!("llmsnap_requests_total", "model" => self.inner.model_id.clone()).increment(1);

        let (mut parts, upstream_body) = response.into_parts();
        let content_type = parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if content_type.contains("text/event-stream") {
            // Defeat buffering in intermediate proxies for SSE.
            parts
                .headers
                .insert("X-Accel-Buffering", HeaderValue::from_static("no"));
        }

        let ctx = ResponseContext {
            model: self.inner.model_id.clone(),
            path,
            status: parts.status,
            content_type,
            request_start,
        };
        let observed = ObservedBody::new(
            Body::new(upstream_body),
            self.inner.ctx.metrics.clone(),
            ctx,
            (guard, permit),
        );

        Ok(Response::from_parts(parts, Body::new(observed)))
    }
}

/// Tracks one request being served. Dropping records the completion time and
/// decrements the in-flight counter, whatever path the request took.
pub struct InFlightGuard {
    inner: Arc<ProcessInner>,
}

impl InFlightGuard {
    fn new(inner: Arc<ProcessInner>) -> Self {
        let count = inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        gauge!("llmsnap_in_flight", "model" => inner.model_id.clone()).set(count as f64);
        Self { inner }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        *self.inner.last_request.lock().unwrap() = Instant::now();
        let prev = self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        gauge!("llmsnap_in_flight", "model" => self.inner.model_id.clone())
            .set(prev.saturating_sub(1) as f64);
        self.inner.in_flight_changed.notify_waiters();
    }
}
