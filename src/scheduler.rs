//! Cross-group scheduling: resolves a model name to its owning group and
//! enforces exclusivity between groups.
//!
//! The activation mutex is held only across the displacement decision; the
//! idling of other groups and the target's start/wake run outside the lock
//! so requests to already-active groups are never serialized behind slow
//! transitions.

use crate::config::Config;
use crate::group::ProcessGroup;
use crate::process::{Process, ProcessContext, ProcessError, StopMode};
use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error(transparent)]
    Process(#[from] ProcessError),
}

impl SchedulerError {
    pub fn status(&self) -> StatusCode {
        match self {
            SchedulerError::UnknownModel(_) => StatusCode::BAD_REQUEST,
            SchedulerError::Process(e) => e.status(),
        }
    }
}

pub struct Scheduler {
    groups: Vec<Arc<ProcessGroup>>,
    /// Canonical model ID to its owning group.
    owners: HashMap<String, Arc<ProcessGroup>>,
    /// Alias to canonical model ID.
    aliases: HashMap<String, String>,
    activation: tokio::sync::Mutex<()>,
}

impl Scheduler {
    /// Build all processes and groups from configuration. Ports are assigned
    /// sequentially from `startPort` in sorted model order and belong to a
    /// process for its whole life.
    pub fn new(config: &Config, ctx: ProcessContext) -> Result<Self, ProcessError> {
        let mut model_ids: Vec<&String> = config.models.keys().collect();
        model_ids.sort();

        let mut processes: HashMap<String, Process> = HashMap::new();
        let mut port = config.start_port;
        for id in model_ids {
            let model = config.models[id].clone();
            let process = Process::new(id, model, port, ctx.clone())?;
            debug!(model = %id, port, "assigned port");
            processes.insert(id.clone(), process);
            port += 1;
        }

        let mut group_ids: Vec<&String> = config.groups.keys().collect();
        group_ids.sort();

        let mut groups = Vec::new();
        let mut owners = HashMap::new();
        for gid in group_ids {
            let group_config = &config.groups[gid];
            let members: HashMap<String, Process> = group_config
                .members
                .iter()
                .filter_map(|m| processes.get(m).map(|p| (m.clone(), p.clone())))
                .collect();
            let group = Arc::new(ProcessGroup::new(gid, group_config, members));
            for member in &group_config.members {
                owners.insert(member.clone(), Arc::clone(&group));
            }
            groups.push(group);
        }

        let mut aliases = HashMap::new();
        for (id, model) in &config.models {
            for alias in &model.aliases {
                aliases.insert(alias.clone(), id.clone());
            }
        }

        Ok(Self {
            groups,
            owners,
            aliases,
            activation: tokio::sync::Mutex::new(()),
        })
    }

    /// Resolve a requested name (canonical ID or alias, exact and
    /// case-sensitive) to the canonical ID and its group.
    pub fn resolve(&self, name: &str) -> Option<(String, Arc<ProcessGroup>)> {
        if let Some(group) = self.owners.get(name) {
            return Some((name.to_string(), Arc::clone(group)));
        }
        let canonical = self.aliases.get(name)?;
        self.owners
            .get(canonical)
            .map(|g| (canonical.clone(), Arc::clone(g)))
    }

    /// The process behind a name, if any.
    pub fn find_process(&self, name: &str) -> Option<Process> {
        let (canonical, group) = self.resolve(name)?;
        group.member(&canonical).cloned()
    }

    /// Serve a request: displace other groups when the target group is
    /// exclusive, then route into the group.
    pub async fn proxy_request(
        &self,
        name: &str,
        req: Request<Body>,
    ) -> Result<Response<Body>, SchedulerError> {
        let (canonical, group) = self
            .resolve(name)
            .ok_or_else(|| SchedulerError::UnknownModel(name.to_string()))?;

        // Decide displacement under the lock, idle outside it.
        let displaced: Vec<Arc<ProcessGroup>> = {
            let _lock = self.activation.lock().await;
            if group.is_exclusive() {
                self.groups
                    .iter()
                    .filter(|g| g.id() != group.id() && !g.is_persistent())
                    .cloned()
                    .collect()
            } else {
                Vec::new()
            }
        };

        if !displaced.is_empty() {
            debug!(
                group = %group.id(),
                displaced = displaced.len(),
                "exclusive group activation, idling other groups"
            );
            join_all(displaced.iter().map(|g| g.make_idle_processes())).await;
        }

        let response = group.proxy_request(&canonical, req).await?;
        Ok(response)
    }

    pub fn groups(&self) -> &[Arc<ProcessGroup>] {
        &self.groups
    }

    /// Every process, in group order then member order.
    pub fn processes(&self) -> Vec<Process> {
        self.groups
            .iter()
            .flat_map(|g| g.processes().cloned().collect::<Vec<_>>())
            .collect()
    }

    pub async fn stop_all(&self, mode: StopMode) {
        info!("stopping all processes");
        join_all(self.groups.iter().map(|g| g.stop_processes(mode))).await;
    }

    pub async fn shutdown_all(&self) {
        info!("shutting down all process groups");
        join_all(self.groups.iter().map(|g| g.shutdown())).await;
    }
}
