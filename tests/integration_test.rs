//! Integration tests driving real mock-backend child processes through the
//! full lifecycle: start, health check, proxy, TTL, sleep/wake, displacement
//! and stop.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use llmsnap::{
    Config, EventBus, LogMonitor, MetricsMonitor, ModelConfig, Process, ProcessContext,
    ProcessState, Scheduler, StopMode,
};
use serde_json::{Value, json};
use serial_test::serial;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

/// Port allocator so concurrently-built fixtures never collide.
static NEXT_PORT: AtomicU16 = AtomicU16::new(22000);

fn allocate_port() -> u16 {
    NEXT_PORT.fetch_add(1, Ordering::SeqCst)
}

fn allocate_port_block(size: u16) -> u16 {
    NEXT_PORT.fetch_add(size, Ordering::SeqCst)
}

fn mock_cmd() -> String {
    format!(
        "{} --model ${{MODEL_ID}} --port ${{PORT}}",
        env!("CARGO_BIN_EXE_mock-backend")
    )
}

fn test_ctx(health_timeout_secs: u64) -> ProcessContext {
    let events = EventBus::new();
    ProcessContext {
        events: events.clone(),
        logs: Arc::new(LogMonitor::new(events.clone())),
        metrics: Arc::new(MetricsMonitor::new(1000, 512 * 1024, events)),
        health_check_timeout: Duration::from_secs(health_timeout_secs),
        sleep_request_timeout: Duration::from_secs(5),
        wake_request_timeout: Duration::from_secs(5),
    }
}

fn model_config(value: Value) -> ModelConfig {
    serde_json::from_value(value).unwrap()
}

fn sleep_enabled_model() -> ModelConfig {
    model_config(json!({
        "cmd": mock_cmd(),
        "sleepMode": "enable",
        "sleepEndpoints": [{"endpoint": "/sleep", "method": "POST", "timeout": 5}],
        "wakeEndpoints": [{"endpoint": "/wake_up", "method": "POST", "timeout": 5}]
    }))
}

fn chat_request(model: &str, stream: bool) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"model": model, "stream": stream}).to_string(),
        ))
        .unwrap()
}

async fn response_json(response: axum::http::Response<Body>) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

// ============================================================================
// Process lifecycle
// ============================================================================

#[tokio::test]
#[serial]
async fn start_proxy_and_stop() {
    let ctx = test_ctx(10);
    let metrics = ctx.metrics.clone();
    let process = Process::new(
        "m1",
        model_config(json!({"cmd": mock_cmd()})),
        allocate_port(),
        ctx,
    )
    .unwrap();

    process.make_ready().await.unwrap();
    assert_eq!(process.current_state(), ProcessState::Ready);
    assert!(process.pid().is_some());
    assert_eq!(process.failed_start_count(), 0);

    // make_ready is idempotent once Ready.
    process.make_ready().await.unwrap();

    let response = process.proxy_request(chat_request("m1", false)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["usage"]["prompt_tokens"], 10);
    assert_eq!(body["usage"]["completion_tokens"], 20);

    // In-flight drained exactly once per request; metrics were recorded.
    assert_eq!(process.in_flight(), 0);
    let recorded = metrics.snapshot();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].model, "m1");
    assert_eq!(recorded[0].input_tokens, 10);
    assert_eq!(recorded[0].output_tokens, 20);

    process.stop(StopMode::WaitForInflight).await.unwrap();
    assert_eq!(process.current_state(), ProcessState::Stopped);
    assert!(process.pid().is_none());

    // Stop is idempotent.
    process.stop(StopMode::Immediate).await.unwrap();
    assert_eq!(process.current_state(), ProcessState::Stopped);
}

#[tokio::test]
#[serial]
async fn streaming_response_is_observed_without_interference() {
    let ctx = test_ctx(10);
    let metrics = ctx.metrics.clone();
    let process = Process::new(
        "m1",
        model_config(json!({"cmd": mock_cmd()})),
        allocate_port(),
        ctx,
    )
    .unwrap();

    let response = process.proxy_request(chat_request("m1", true)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("x-accel-buffering").unwrap(),
        "no"
    );

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.contains("data: [DONE]"));

    let recorded = metrics.snapshot();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].input_tokens, 10);
    assert_eq!(recorded[0].output_tokens, 20);
    assert_eq!(recorded[0].tokens_per_second, 50.0);
    assert_eq!(recorded[0].duration_ms, 500);

    process.stop(StopMode::Immediate).await.unwrap();
}

#[tokio::test]
#[serial]
async fn health_check_timeout_stops_the_child() {
    let ctx = test_ctx(2);
    let config = model_config(json!({
        "cmd": format!("{} --startup-delay-ms 30000", mock_cmd())
    }));
    let process = Process::new("slow", config, allocate_port(), ctx).unwrap();

    let err = process.make_ready().await.unwrap_err();
    assert!(err.to_string().contains("health check timed out"), "{err}");

    // Child killed, state settled, failure counted.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(process.current_state(), ProcessState::Stopped);
    assert!(process.pid().is_none());
    assert_eq!(process.failed_start_count(), 1);
}

#[tokio::test]
#[serial]
async fn spawn_failure_reports_and_resets() {
    let ctx = test_ctx(2);
    let config = model_config(json!({"cmd": "/nonexistent/binary --port ${PORT}"}));
    let process = Process::new("broken", config, allocate_port(), ctx).unwrap();

    let err = process.make_ready().await.unwrap_err();
    assert!(err.to_string().contains("failed to spawn"), "{err}");
    assert_eq!(process.current_state(), ProcessState::Stopped);
    assert_eq!(process.failed_start_count(), 1);
}

#[tokio::test]
#[serial]
async fn unexpected_child_death_settles_to_stopped() {
    let ctx = test_ctx(10);
    let process = Process::new(
        "m1",
        model_config(json!({"cmd": mock_cmd()})),
        allocate_port(),
        ctx,
    )
    .unwrap();

    process.make_ready().await.unwrap();
    let pid = process.pid().unwrap();

    // Kill the backend out from under the proxy.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(process.current_state(), ProcessState::Stopped);

    // The next request starts a fresh child.
    process.make_ready().await.unwrap();
    assert_eq!(process.current_state(), ProcessState::Ready);
    assert_ne!(process.pid().unwrap(), pid);

    process.stop(StopMode::Immediate).await.unwrap();
}

// ============================================================================
// TTL
// ============================================================================

#[tokio::test]
#[serial]
async fn ttl_stops_idle_process_and_requests_reset_it() {
    let ctx = test_ctx(10);
    let config = model_config(json!({"cmd": mock_cmd(), "ttl": 2}));
    let process = Process::new("ttl-model", config, allocate_port(), ctx).unwrap();

    process.make_ready().await.unwrap();

    // A request at ~t=1 pushes the expiry out past the original deadline.
    tokio::time::sleep(Duration::from_millis(1000)).await;
    let response = process.proxy_request(chat_request("ttl-model", false)).await.unwrap();
    let _ = response.into_body().collect().await.unwrap();

    tokio::time::sleep(Duration::from_millis(1300)).await;
    assert_eq!(
        process.current_state(),
        ProcessState::Ready,
        "request should have reset the TTL"
    );

    // With no further traffic the monitor stops the process.
    tokio::time::sleep(Duration::from_millis(3000)).await;
    assert_eq!(process.current_state(), ProcessState::Stopped);
}

#[tokio::test]
#[serial]
async fn ttl_stops_even_when_sleep_is_configured() {
    let ctx = test_ctx(10);
    let mut config = sleep_enabled_model();
    config.unload_after = 1;
    let process = Process::new("ttl-sleeper", config, allocate_port(), ctx).unwrap();

    process.make_ready().await.unwrap();
    tokio::time::sleep(Duration::from_millis(3500)).await;

    // TTL frees memory fully: the process must be stopped, not asleep.
    assert_eq!(process.current_state(), ProcessState::Stopped);
    assert!(process.pid().is_none());
}

#[tokio::test]
#[serial]
async fn ttl_zero_disables_the_monitor() {
    let ctx = test_ctx(10);
    let config = model_config(json!({"cmd": mock_cmd(), "ttl": 0}));
    let process = Process::new("no-ttl", config, allocate_port(), ctx).unwrap();

    process.make_ready().await.unwrap();
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(process.current_state(), ProcessState::Ready);

    process.stop(StopMode::Immediate).await.unwrap();
}

// ============================================================================
// Sleep / wake
// ============================================================================

#[tokio::test]
#[serial]
async fn sleep_wake_cycle_preserves_the_child() {
    let ctx = test_ctx(10);
    let process = Process::new("sleeper", sleep_enabled_model(), allocate_port(), ctx).unwrap();

    process.make_ready().await.unwrap();
    let pid = process.pid().unwrap();

    process.sleep().await.unwrap();
    assert_eq!(process.current_state(), ProcessState::Asleep);
    assert_eq!(process.pid(), Some(pid));

    // Sleep on Asleep is a successful no-op.
    process.sleep().await.unwrap();
    assert_eq!(process.current_state(), ProcessState::Asleep);

    process.wake().await.unwrap();
    assert_eq!(process.current_state(), ProcessState::Ready);
    assert_eq!(process.pid(), Some(pid), "wake must not restart the child");

    // Wake on Ready is a successful no-op.
    process.wake().await.unwrap();

    let response = process.proxy_request(chat_request("sleeper", false)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let _ = response.into_body().collect().await.unwrap();

    process.stop(StopMode::Immediate).await.unwrap();
}

#[tokio::test]
#[serial]
async fn wake_failure_fails_fast_to_stopped() {
    let ctx = test_ctx(10);
    let process = Process::new("waker", sleep_enabled_model(), allocate_port(), ctx).unwrap();

    process.make_ready().await.unwrap();
    let port = process.port();
    process.sleep().await.unwrap();

    let client = reqwest::Client::new();
    client
        .post(format!("http://127.0.0.1:{port}/control/fail-wake"))
        .json(&json!({"enabled": true}))
        .send()
        .await
        .unwrap();

    let err = process.wake().await.unwrap_err();
    assert!(err.to_string().contains("/wake_up"), "{err}");

    // Fail-fast: the child is killed and the state settles at Stopped with
    // no automatic restart.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(process.current_state(), ProcessState::Stopped);
    assert!(process.pid().is_none());

    // A later request triggers a fresh start (new child, wake flag gone).
    process.make_ready().await.unwrap();
    assert_eq!(process.current_state(), ProcessState::Ready);

    process.stop(StopMode::Immediate).await.unwrap();
}

#[tokio::test]
#[serial]
async fn sleep_failure_falls_back_to_stop() {
    let ctx = test_ctx(10);
    let process = Process::new("badsleep", sleep_enabled_model(), allocate_port(), ctx).unwrap();

    process.make_ready().await.unwrap();
    let port = process.port();

    let client = reqwest::Client::new();
    client
        .post(format!("http://127.0.0.1:{port}/control/fail-sleep"))
        .json(&json!({"enabled": true}))
        .send()
        .await
        .unwrap();

    let err = process.sleep().await.unwrap_err();
    assert!(err.to_string().contains("/sleep"), "{err}");

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(process.current_state(), ProcessState::Stopped);
}

// ============================================================================
// Concurrency limits
// ============================================================================

#[tokio::test]
#[serial]
async fn concurrency_limit_zero_is_unbounded() {
    let ctx = test_ctx(10);
    let config = model_config(json!({"cmd": mock_cmd(), "concurrencyLimit": 0}));
    let process = Process::new("open", config, allocate_port(), ctx).unwrap();
    process.make_ready().await.unwrap();

    let client = reqwest::Client::new();
    client
        .post(format!("http://127.0.0.1:{}/control/latency", process.port()))
        .json(&json!({"latency_ms": 200}))
        .send()
        .await
        .unwrap();

    let requests = (0..4).map(|_| {
        let p = process.clone();
        async move {
            let response = p.proxy_request(chat_request("open", false)).await?;
            let status = response.status();
            let _ = response.into_body().collect().await;
            Ok::<_, llmsnap::ProcessError>(status)
        }
    });
    let results = futures_util::future::join_all(requests).await;
    for result in results {
        assert_eq!(result.unwrap(), StatusCode::OK);
    }
    assert_eq!(process.in_flight(), 0);

    process.stop(StopMode::Immediate).await.unwrap();
}

#[tokio::test]
#[serial]
async fn concurrency_limit_rejects_when_saturated() {
    // Short health timeout doubles as the permit-acquisition deadline.
    let ctx = test_ctx(1);
    let config = model_config(json!({"cmd": mock_cmd(), "concurrencyLimit": 1}));
    let process = Process::new("narrow", config, allocate_port(), ctx).unwrap();
    process.make_ready().await.unwrap();

    let client = reqwest::Client::new();
    client
        .post(format!("http://127.0.0.1:{}/control/latency", process.port()))
        .json(&json!({"latency_ms": 3000}))
        .send()
        .await
        .unwrap();

    let slow = {
        let p = process.clone();
        async move {
            let response = p.proxy_request(chat_request("narrow", false)).await?;
            let _ = response.into_body().collect().await;
            Ok::<_, llmsnap::ProcessError>(())
        }
    };
    let rejected = {
        let p = process.clone();
        async move {
            // Let the first request take the only permit.
            tokio::time::sleep(Duration::from_millis(200)).await;
            p.proxy_request(chat_request("narrow", false)).await.map(|_| ())
        }
    };

    let (slow_result, rejected_result) = tokio::join!(slow, rejected);
    slow_result.unwrap();
    let err = rejected_result.unwrap_err();
    assert!(
        matches!(err, llmsnap::ProcessError::ConcurrencyRejected { .. }),
        "{err}"
    );

    process.stop(StopMode::Immediate).await.unwrap();
}

// ============================================================================
// Groups and scheduling
// ============================================================================

fn scheduler_config(value: Value) -> Config {
    serde_json::from_value::<Config>(value)
        .unwrap()
        .normalized()
        .unwrap()
}

#[tokio::test]
#[serial]
async fn swap_group_keeps_a_single_member_running() {
    let start_port = allocate_port_block(10);
    let config = scheduler_config(json!({
        "startPort": start_port,
        "models": {
            "m1": {"cmd": mock_cmd()},
            "m2": {"cmd": mock_cmd()}
        },
        "groups": {
            "G1": {"swap": true, "exclusive": true, "members": ["m1", "m2"]}
        }
    }));
    let scheduler = Scheduler::new(&config, test_ctx(10)).unwrap();

    let response = scheduler.proxy_request("m1", chat_request("m1", false)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let _ = response.into_body().collect().await.unwrap();

    let state_of = |name: &str| scheduler.find_process(name).unwrap().current_state();
    assert_eq!(state_of("m1"), ProcessState::Ready);
    assert_eq!(state_of("m2"), ProcessState::Stopped);

    // Naming the sibling displaces the running member first.
    let response = scheduler.proxy_request("m2", chat_request("m2", false)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let _ = response.into_body().collect().await.unwrap();

    assert_eq!(state_of("m2"), ProcessState::Ready);
    assert_eq!(state_of("m1"), ProcessState::Stopped);

    scheduler.stop_all(StopMode::Immediate).await;
}

#[tokio::test]
#[serial]
async fn parallel_swap_requests_leave_one_member_running() {
    let start_port = allocate_port_block(10);
    let config = scheduler_config(json!({
        "startPort": start_port,
        "models": {
            "p1": {"cmd": mock_cmd()},
            "p2": {"cmd": mock_cmd()},
            "p3": {"cmd": mock_cmd()}
        },
        "groups": {
            "G1": {"swap": true, "exclusive": true, "members": ["p1", "p2", "p3"]}
        }
    }));
    let scheduler = Arc::new(Scheduler::new(&config, test_ctx(15)).unwrap());

    let requests = ["p1", "p2", "p3"].map(|name| {
        let scheduler = Arc::clone(&scheduler);
        async move {
            let response = scheduler.proxy_request(name, chat_request(name, false)).await?;
            let status = response.status();
            let _ = response.into_body().collect().await;
            Ok::<_, llmsnap::SchedulerError>(status)
        }
    });
    let results = futures_util::future::join_all(requests).await;
    for result in results {
        assert_eq!(result.unwrap(), StatusCode::OK);
    }

    let running: Vec<_> = scheduler
        .processes()
        .into_iter()
        .filter(|p| p.current_state() != ProcessState::Stopped)
        .collect();
    assert_eq!(running.len(), 1, "swap group must keep one member running");

    scheduler.stop_all(StopMode::Immediate).await;
}

#[tokio::test]
#[serial]
async fn swap_group_sleeps_members_that_support_it() {
    let start_port = allocate_port_block(10);
    let mut sleeper = json!({
        "cmd": mock_cmd(),
        "sleepMode": "enable",
        "sleepEndpoints": [{"endpoint": "/sleep", "method": "POST", "timeout": 5}],
        "wakeEndpoints": [{"endpoint": "/wake_up", "method": "POST", "timeout": 5}]
    });
    let config = scheduler_config(json!({
        "startPort": start_port,
        "models": {
            "naps": sleeper.take(),
            "plain": {"cmd": mock_cmd()}
        },
        "groups": {
            "G1": {"swap": true, "exclusive": true, "members": ["naps", "plain"]}
        }
    }));
    let scheduler = Scheduler::new(&config, test_ctx(10)).unwrap();

    let response = scheduler.proxy_request("naps", chat_request("naps", false)).await.unwrap();
    let _ = response.into_body().collect().await.unwrap();
    let naps_pid = scheduler.find_process("naps").unwrap().pid();

    // Displacing a sleep-capable member puts it to sleep instead of killing it.
    let response = scheduler.proxy_request("plain", chat_request("plain", false)).await.unwrap();
    let _ = response.into_body().collect().await.unwrap();

    let naps = scheduler.find_process("naps").unwrap();
    assert_eq!(naps.current_state(), ProcessState::Asleep);
    assert_eq!(naps.pid(), naps_pid);
    assert_eq!(
        scheduler.find_process("plain").unwrap().current_state(),
        ProcessState::Ready
    );

    scheduler.stop_all(StopMode::Immediate).await;
}

#[tokio::test]
#[serial]
async fn exclusive_groups_displace_except_persistent() {
    let start_port = allocate_port_block(10);
    let config = scheduler_config(json!({
        "startPort": start_port,
        "models": {
            "a": {"cmd": mock_cmd()},
            "b": {"cmd": mock_cmd()},
            "pinned": {"cmd": mock_cmd()}
        },
        "groups": {
            "GA": {"swap": true, "exclusive": true, "members": ["a"]},
            "GB": {"swap": true, "exclusive": true, "members": ["b"]},
            "GP": {"swap": false, "exclusive": false, "persistent": true, "members": ["pinned"]}
        }
    }));
    let scheduler = Scheduler::new(&config, test_ctx(10)).unwrap();

    async fn send(scheduler: &Scheduler, name: &str) {
        let response = scheduler
            .proxy_request(name, chat_request(name, false))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let _ = response.into_body().collect().await.unwrap();
    }

    send(&scheduler, "a").await;
    send(&scheduler, "pinned").await;

    let state_of = |name: &str| scheduler.find_process(name).unwrap().current_state();
    assert_eq!(state_of("a"), ProcessState::Ready);
    assert_eq!(state_of("pinned"), ProcessState::Ready);

    // Activating B idles A's group but leaves the persistent group alone.
    send(&scheduler, "b").await;
    assert_eq!(state_of("b"), ProcessState::Ready);
    assert_eq!(state_of("a"), ProcessState::Stopped);
    assert_eq!(state_of("pinned"), ProcessState::Ready);

    scheduler.stop_all(StopMode::Immediate).await;
}

// ============================================================================
// Full HTTP stack
// ============================================================================

async fn serve_app(config: Config) -> (String, Arc<Scheduler>) {
    let (app, scheduler) = llmsnap::build_app(config).await.unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), scheduler)
}

#[tokio::test]
#[serial]
async fn end_to_end_request_flow() {
    let start_port = allocate_port_block(10);
    let config = scheduler_config(json!({
        "startPort": start_port,
        "models": {
            "e2e": {"cmd": mock_cmd(), "aliases": ["e2e-alias"]}
        }
    }));
    let (base, scheduler) = serve_app(config).await;
    let client = reqwest::Client::new();

    // Inference via the alias resolves to the canonical model.
    let response = client
        .post(format!("{base}/v1/chat/completions"))
        .json(&json!({"model": "e2e-alias", "messages": [{"role": "user", "content": "hi"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["usage"]["prompt_tokens"], 10);

    // The process shows up in /running.
    let running: Value = client
        .get(format!("{base}/running"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(running["running"][0]["model"], "e2e");
    assert_eq!(running["running"][0]["state"], "ready");

    // Metrics were recorded and the capture is retrievable. The record is
    // appended when the response body finishes streaming server-side, so
    // give the tee a beat to run.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let metrics: Value = client
        .get(format!("{base}/api/metrics"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let records = metrics.as_array().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["input_tokens"], 10);
    let id = records[0]["id"].as_u64().unwrap();

    let capture = client
        .get(format!("{base}/api/captures/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(capture.status(), reqwest::StatusCode::OK);
    assert!(capture.text().await.unwrap().contains("usage"));

    // Direct passthrough to the backend.
    let stats: Value = client
        .get(format!("{base}/upstream/e2e/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["sleeping"], false);

    // Unload stops everything.
    let response = client.get(format!("{base}/unload")).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(
        scheduler.find_process("e2e").unwrap().current_state(),
        ProcessState::Stopped
    );

    let running: Value = client
        .get(format!("{base}/running"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(running["running"].as_array().unwrap().len(), 0);

    scheduler.stop_all(StopMode::Immediate).await;
}

#[tokio::test]
#[serial]
async fn events_stream_reports_state_changes() {
    let start_port = allocate_port_block(10);
    let config = scheduler_config(json!({
        "startPort": start_port,
        "models": {
            "evented": {"cmd": mock_cmd()}
        }
    }));
    let (base, scheduler) = serve_app(config).await;
    let client = reqwest::Client::new();

    let mut events = client
        .get(format!("{base}/api/events"))
        .send()
        .await
        .unwrap();
    assert_eq!(
        events.headers().get("content-type").unwrap().to_str().unwrap(),
        "text/event-stream"
    );

    // Trigger a start so state events flow.
    let trigger = client
        .post(format!("{base}/v1/chat/completions"))
        .json(&json!({"model": "evented"}))
        .send();

    let read_events = async {
        let mut seen = String::new();
        while let Some(chunk) = events.chunk().await.unwrap() {
            seen.push_str(&String::from_utf8_lossy(&chunk));
            if seen.contains("processState") && seen.contains("ready") {
                return seen;
            }
        }
        seen
    };

    let (response, seen) = tokio::join!(trigger, async {
        tokio::time::timeout(Duration::from_secs(15), read_events)
            .await
            .expect("timed out waiting for state events")
    });
    assert_eq!(response.unwrap().status(), reqwest::StatusCode::OK);
    assert!(seen.contains("event: processState"), "{seen}");

    scheduler.stop_all(StopMode::Immediate).await;
}
