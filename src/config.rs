//! Configuration for llmsnap.
//!
//! Loaded from a JSON file with camelCase keys. `normalized()` applies the
//! defaults and validation rules that cannot be expressed through serde
//! alone (endpoint pairing, method normalization, group membership).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Group ID that collects models not claimed by any configured group.
pub const DEFAULT_GROUP_ID: &str = "(default)";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Address the proxy listens on.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Seconds a Starting/Waking process may take to pass its health check.
    #[serde(default = "default_health_check_timeout")]
    pub health_check_timeout: u64,

    /// Default per-request timeout for sleep endpoints (seconds).
    #[serde(default = "default_request_timeout")]
    pub sleep_request_timeout: u64,

    /// Default per-request timeout for wake endpoints (seconds).
    #[serde(default = "default_request_timeout")]
    pub wake_request_timeout: u64,

    /// Base of the `${PORT}` auto-assignment range. Ports are handed out
    /// sequentially in sorted model order and never reused.
    #[serde(default = "default_start_port")]
    pub start_port: u16,

    /// Capacity of the token-metrics ring.
    #[serde(default = "default_metrics_max")]
    pub metrics_max_in_memory: usize,

    /// Cap on the response bytes retained per metric for `/api/captures/:id`.
    #[serde(default = "default_capture_max")]
    pub capture_max_body_bytes: usize,

    /// When non-empty, every route requires `Authorization: Bearer <key>`
    /// with one of these keys.
    #[serde(default)]
    pub api_keys: Vec<String>,

    /// Models to manage, keyed by canonical model ID.
    pub models: HashMap<String, ModelConfig>,

    /// Process groups, keyed by group ID.
    #[serde(default)]
    pub groups: HashMap<String, GroupConfig>,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_health_check_timeout() -> u64 {
    120
}

fn default_request_timeout() -> u64 {
    10
}

fn default_start_port() -> u16 {
    5800
}

fn default_metrics_max() -> usize {
    1000
}

fn default_capture_max() -> usize {
    512 * 1024
}

impl Config {
    /// Load and normalize configuration from a JSON file.
    pub async fn from_file(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        let config: Config = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;

        config.normalized()
    }

    /// Apply defaults that serde cannot express and validate the whole
    /// configuration. Consumes and returns the config so callers cannot skip
    /// validation by accident.
    pub fn normalized(mut self) -> Result<Self> {
        for (id, model) in &mut self.models {
            model.normalize().with_context(|| format!("model {id}"))?;
        }

        // Aliases must not collide with each other or with canonical IDs.
        let mut seen: HashSet<String> = self.models.keys().cloned().collect();
        for (id, model) in &self.models {
            for alias in &model.aliases {
                if !seen.insert(alias.clone()) {
                    anyhow::bail!(
                        "alias {alias} of model {id} collides with another model or alias"
                    );
                }
            }
        }

        // Every group member must exist, and a model may belong to one group only.
        let mut claimed: HashMap<&str, &str> = HashMap::new();
        for (gid, group) in &self.groups {
            for member in &group.members {
                if !self.models.contains_key(member) {
                    anyhow::bail!("group {gid} references unknown model {member}");
                }
                if let Some(other) = claimed.insert(member, gid) {
                    anyhow::bail!("model {member} is a member of both {other} and {gid}");
                }
            }
        }

        // Unclaimed models fall into the default group.
        let unclaimed: Vec<String> = {
            let mut ids: Vec<_> = self
                .models
                .keys()
                .filter(|id| !claimed.contains_key(id.as_str()))
                .cloned()
                .collect();
            ids.sort();
            ids
        };
        if !unclaimed.is_empty() {
            if self.groups.contains_key(DEFAULT_GROUP_ID) {
                anyhow::bail!("group ID {DEFAULT_GROUP_ID} is reserved");
            }
            self.groups.insert(
                DEFAULT_GROUP_ID.to_string(),
                GroupConfig {
                    swap: false,
                    exclusive: false,
                    persistent: false,
                    members: unclaimed,
                },
            );
        }

        Ok(self)
    }

    /// Resolve a requested model name to its canonical ID. Matching is exact
    /// and case-sensitive: canonical IDs first, then aliases.
    pub fn resolve_model<'a>(&'a self, name: &str) -> Option<&'a str> {
        if let Some((id, _)) = self.models.get_key_value(name) {
            return Some(id);
        }
        self.models
            .iter()
            .find(|(_, m)| m.aliases.iter().any(|a| a == name))
            .map(|(id, _)| id.as_str())
    }
}

/// Sleep-mode policy for a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SleepMode {
    Enable,
    #[default]
    Disable,
}

/// Configuration for a single managed model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    /// Command line that starts the backend. Supports `${PORT}`,
    /// `${MODEL_ID}` and environment references, `#` comment lines and
    /// backslash line continuations.
    pub cmd: String,

    /// Optional command used to stop the backend, with `${PID}` substituted.
    /// When empty the process group is signalled directly.
    #[serde(default)]
    pub cmd_stop: String,

    /// Upstream base URL requests are proxied to.
    #[serde(default = "default_proxy")]
    pub proxy: String,

    #[serde(default)]
    pub aliases: Vec<String>,

    /// Extra environment entries in `KEY=value` form.
    #[serde(default)]
    pub env: Vec<String>,

    /// Health-check path on the upstream.
    #[serde(default = "default_check_endpoint")]
    pub check_endpoint: String,

    /// Idle seconds after which a Ready process is stopped. 0 disables.
    #[serde(default, rename = "ttl")]
    pub unload_after: u64,

    /// Hide from `/v1/models` listings.
    #[serde(default)]
    pub unlisted: bool,

    /// Rewrite the `model` field to this value before forwarding upstream.
    #[serde(default)]
    pub use_model_name: String,

    /// Display name for `/v1/models`.
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Maximum concurrent requests proxied to this backend. 0 = unlimited.
    #[serde(default)]
    pub concurrency_limit: usize,

    #[serde(default)]
    pub filters: ModelFilters,

    #[serde(default)]
    pub sleep_mode: SleepMode,

    /// Ordered HTTP calls that put the backend to sleep.
    #[serde(default)]
    pub sleep_endpoints: Vec<HttpEndpoint>,

    /// Ordered HTTP calls that wake the backend.
    #[serde(default)]
    pub wake_endpoints: Vec<HttpEndpoint>,
}

fn default_proxy() -> String {
    "http://localhost:${PORT}".to_string()
}

fn default_check_endpoint() -> String {
    "/health".to_string()
}

const VALID_ENDPOINT_METHODS: [&str; 4] = ["GET", "POST", "PUT", "PATCH"];

impl ModelConfig {
    fn normalize(&mut self) -> Result<()> {
        if self.cmd.trim().is_empty() {
            anyhow::bail!("cmd must not be empty");
        }

        if cfg!(windows) && self.cmd_stop.is_empty() {
            self.cmd_stop = "taskkill /f /t /pid ${PID}".to_string();
        }

        // If one endpoint list is set, both must be.
        if !self.sleep_endpoints.is_empty() && self.wake_endpoints.is_empty() {
            anyhow::bail!("wakeEndpoints required when sleepEndpoints is configured");
        }
        if !self.wake_endpoints.is_empty() && self.sleep_endpoints.is_empty() {
            anyhow::bail!("sleepEndpoints required when wakeEndpoints is configured");
        }

        for ep in self.sleep_endpoints.iter_mut().chain(&mut self.wake_endpoints) {
            ep.method = ep.method.to_uppercase();
            if !VALID_ENDPOINT_METHODS.contains(&ep.method.as_str()) {
                anyhow::bail!(
                    "invalid endpoint method {} (must be GET, POST, PUT, or PATCH)",
                    ep.method
                );
            }
        }

        for entry in &self.env {
            if !entry.contains('=') {
                anyhow::bail!("env entry {entry} is not KEY=value");
            }
        }

        Ok(())
    }

    /// Whether `sleep()` does anything for this model.
    pub fn sleep_configured(&self) -> bool {
        self.sleep_mode == SleepMode::Enable && !self.sleep_endpoints.is_empty()
    }

    /// Start command as argv with macros interpolated.
    pub fn start_argv(&self, model_id: &str, port: u16) -> Result<Vec<String>> {
        let argv = split_command(&self.cmd);
        if argv.is_empty() {
            anyhow::bail!("cmd for {model_id} is empty after sanitizing");
        }
        argv.into_iter()
            .map(|arg| interpolate(&arg, model_id, port))
            .collect()
    }

    /// Stop command as argv with `${PID}` substituted, when configured.
    pub fn stop_argv(&self, model_id: &str, port: u16, pid: u32) -> Result<Option<Vec<String>>> {
        if self.cmd_stop.trim().is_empty() {
            return Ok(None);
        }
        let argv: Result<Vec<String>> = split_command(&self.cmd_stop)
            .into_iter()
            .map(|arg| interpolate(&arg.replace("${PID}", &pid.to_string()), model_id, port))
            .collect();
        argv.map(Some)
    }

    /// Upstream base URL with macros interpolated.
    pub fn upstream_url(&self, model_id: &str, port: u16) -> Result<String> {
        interpolate(&self.proxy, model_id, port)
    }

    /// Extra environment as key/value pairs.
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .filter_map(|e| e.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

/// One HTTP call of a sleep or wake sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpEndpoint {
    /// Path on the upstream, e.g. `/sleep?level=1`.
    pub endpoint: String,

    #[serde(default = "default_endpoint_method")]
    pub method: String,

    /// Optional request body; sent as JSON when non-empty.
    #[serde(default)]
    pub body: String,

    /// Overall request timeout in seconds. 0 = use the model's default.
    #[serde(default)]
    pub timeout: u64,
}

fn default_endpoint_method() -> String {
    "POST".to_string()
}

/// Request filters applied before forwarding.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelFilters {
    /// Comma-separated top-level JSON keys to remove from the request body.
    #[serde(default)]
    pub strip_params: String,

    /// Top-level JSON keys to set or override in the request body.
    #[serde(default)]
    pub set_params: serde_json::Map<String, serde_json::Value>,
}

impl ModelFilters {
    /// Cleaned list of keys to strip: deduplicated, sorted, and never the
    /// protected `model` key.
    pub fn sanitized_strip_params(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut cleaned: Vec<String> = self
            .strip_params
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty() && *p != "model" && seen.insert(p.to_string()))
            .map(str::to_string)
            .collect();
        cleaned.sort();
        cleaned
    }
}

/// Scheduling policy for a set of models.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupConfig {
    /// Only one member may be running at a time.
    #[serde(default = "default_true")]
    pub swap: bool,

    /// Activating this group idles all other non-persistent groups.
    #[serde(default = "default_true")]
    pub exclusive: bool,

    /// Immune to being idled by other groups' exclusivity.
    #[serde(default)]
    pub persistent: bool,

    pub members: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// Split a command string into argv: drop `#` comment lines, join backslash
/// continuations, then split on whitespace.
pub fn split_command(cmd: &str) -> Vec<String> {
    cmd.replace("\\\n", " ")
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .flat_map(str::split_whitespace)
        .map(str::to_string)
        .collect()
}

/// Replace `${PORT}`, `${MODEL_ID}` and `${NAME}` environment references.
/// Unknown references are an error rather than being passed through to the
/// child verbatim.
fn interpolate(input: &str, model_id: &str, port: u16) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            anyhow::bail!("unterminated macro in {input}");
        };
        let name = &after[..end];
        match name {
            "PORT" => out.push_str(&port.to_string()),
            "MODEL_ID" => out.push_str(model_id),
            _ => match std::env::var(name) {
                Ok(v) => out.push_str(&v),
                Err(_) => anyhow::bail!("unknown macro ${{{name}}} in {input}"),
            },
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
