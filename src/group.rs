//! A policy-bearing set of processes that share scheduling rules.
//!
//! `swap` groups allow only one running member at a time: before the target
//! is made ready every sibling is idled (slept when it supports sleep,
//! stopped otherwise). `exclusive` and `persistent` are enforced across
//! groups by the scheduler; this module only exports them.

use crate::config::GroupConfig;
use crate::process::{Process, ProcessError, StopMode};
use crate::state::ProcessState;
use axum::body::Body;
use axum::http::{Request, Response};
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::warn;

pub struct ProcessGroup {
    id: String,
    swap: bool,
    exclusive: bool,
    persistent: bool,
    members: Vec<String>,
    processes: HashMap<String, Process>,
    last_used: Mutex<Option<String>>,
    /// Serializes displacement + activation within a swap group so parallel
    /// requests for different members cannot both win.
    swap_lock: tokio::sync::Mutex<()>,
}

impl ProcessGroup {
    pub fn new(id: &str, config: &GroupConfig, processes: HashMap<String, Process>) -> Self {
        Self {
            id: id.to_string(),
            swap: config.swap,
            exclusive: config.exclusive,
            persistent: config.persistent,
            members: config.members.clone(),
            processes,
            last_used: Mutex::new(None),
            swap_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn has_member(&self, model_id: &str) -> bool {
        self.processes.contains_key(model_id)
    }

    pub fn member(&self, model_id: &str) -> Option<&Process> {
        self.processes.get(model_id)
    }

    /// Member IDs in configured order.
    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn last_used(&self) -> Option<String> {
        self.last_used.lock().unwrap().clone()
    }

    /// Serve a request through the named member, displacing siblings first
    /// when this is a swap group.
    pub async fn proxy_request(
        &self,
        model_id: &str,
        req: Request<Body>,
    ) -> Result<Response<Body>, ProcessError> {
        let target = self.ensure_member_ready(model_id).await?;
        target.proxy_request(req).await
    }

    /// Idle every sibling (swap groups only) and bring the target to Ready.
    /// The most-recently-used sibling is displaced first: in a swap group it
    /// is the member still holding GPU memory.
    pub async fn ensure_member_ready(&self, model_id: &str) -> Result<Process, ProcessError> {
        let target = self
            .processes
            .get(model_id)
            .ok_or_else(|| ProcessError::Command(format!("model {model_id} not in group {}", self.id)))?
            .clone();

        if self.swap {
            let _lock = self.swap_lock.lock().await;

            let last_used = self.last_used();
            let mut siblings: Vec<&String> = self
                .members
                .iter()
                .filter(|id| id.as_str() != model_id)
                .collect();
            siblings.sort_by_key(|id| Some(id.as_str()) != last_used.as_deref());

            for id in siblings {
                let Some(process) = self.processes.get(id) else {
                    continue;
                };
                if matches!(
                    process.current_state(),
                    ProcessState::Stopped | ProcessState::Asleep | ProcessState::Shutdown
                ) {
                    continue;
                }
                if let Err(e) = process.make_idle().await {
                    // A failed sleep already fell back to Stop, so the
                    // member is displaced either way.
                    warn!(
                        group = %self.id,
                        model = %process.model_id(),
                        error = %e,
                        "failed to idle sibling"
                    );
                }
            }

            *self.last_used.lock().unwrap() = Some(model_id.to_string());
            target.make_ready().await?;
        } else {
            *self.last_used.lock().unwrap() = Some(model_id.to_string());
        }

        Ok(target)
    }

    /// Idle every member: sleep where configured, stop otherwise.
    pub async fn make_idle_processes(&self) {
        let idles = self.processes.values().map(|p| {
            let p = p.clone();
            async move {
                if let Err(e) = p.make_idle().await {
                    warn!(model = %p.model_id(), error = %e, "failed to idle process");
                }
            }
        });
        join_all(idles).await;
    }

    pub async fn stop_processes(&self, mode: StopMode) {
        let stops = self.processes.values().map(|p| {
            let p = p.clone();
            async move {
                if let Err(e) = p.stop(mode).await {
                    warn!(model = %p.model_id(), error = %e, "failed to stop process");
                }
            }
        });
        join_all(stops).await;
    }

    pub async fn shutdown(&self) {
        let shutdowns = self.processes.values().map(|p| {
            let p = p.clone();
            async move { p.shutdown().await }
        });
        join_all(shutdowns).await;
    }

    pub fn processes(&self) -> impl Iterator<Item = &Process> {
        self.members.iter().filter_map(|id| self.processes.get(id))
    }
}
