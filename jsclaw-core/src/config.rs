//! Host configuration for the jsclaw daemon.
//!
//! Layered resolution: built-in defaults, then an optional `jsclaw.toml`
//! file, then `JSCLAW_*` environment variables, then explicit programmatic
//! overrides. Later layers win.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Container runtime CLIs with a `docker run`-compatible surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRuntime {
    Docker,
    Podman,
    /// Apple's `container` CLI.
    Container,
}

impl ContainerRuntime {
    pub fn as_str(self) -> &'static str {
        match self {
            ContainerRuntime::Docker => "docker",
            ContainerRuntime::Podman => "podman",
            ContainerRuntime::Container => "container",
        }
    }
}

impl FromStr for ContainerRuntime {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(ContainerRuntime::Docker),
            "podman" => Ok(ContainerRuntime::Podman),
            "container" => Ok(ContainerRuntime::Container),
            other => anyhow::bail!("unsupported container runtime: {other}"),
        }
    }
}

impl fmt::Display for ContainerRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Policy for when the queue releases a group's slot after an item resolves.
///
/// `Terminal` releases on any terminal outcome (success at any attempt, or
/// rejection after the final retry). `Exhaustive` reproduces the original
/// behavior: message checks release on any resolution, tasks only once the
/// retry budget is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotRelease {
    Terminal,
    Exhaustive,
}

impl Default for SlotRelease {
    fn default() -> Self {
        SlotRelease::Terminal
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JsclawConfig {
    /// Image name passed as the final `run` argument.
    pub container_image: String,
    pub container_runtime: ContainerRuntime,
    /// Idle timeout between output frames (milliseconds).
    pub container_timeout_ms: u64,
    /// Stdout ceiling per container run (bytes); exceeding it kills the run.
    pub max_output_size: usize,
    /// Global cap on concurrently running containers.
    pub max_concurrent_containers: usize,
    /// IPC watcher tick interval (milliseconds).
    pub ipc_poll_interval_ms: u64,
    pub data_dir: PathBuf,
    pub groups_dir: PathBuf,
    /// External mount allowlist; additional mounts are blocked when unset.
    pub mount_allowlist: Option<PathBuf>,
    pub log_level: String,
    /// High-watermark on per-group queue depth; enqueues beyond it fail fast.
    pub max_queue_depth: usize,
    pub slot_release: SlotRelease,
}

impl Default for JsclawConfig {
    fn default() -> Self {
        Self {
            container_image: "jsclaw-agent:latest".to_string(),
            container_runtime: ContainerRuntime::Docker,
            container_timeout_ms: 300_000,
            max_output_size: 1_048_576,
            max_concurrent_containers: 3,
            ipc_poll_interval_ms: 1000,
            data_dir: PathBuf::from("data"),
            groups_dir: PathBuf::from("groups"),
            mount_allowlist: None,
            log_level: "info".to_string(),
            max_queue_depth: 100,
            slot_release: SlotRelease::default(),
        }
    }
}

/// Explicit programmatic overrides. Any `Some` field wins over both the
/// config file and the environment.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub container_image: Option<String>,
    pub container_runtime: Option<ContainerRuntime>,
    pub container_timeout_ms: Option<u64>,
    pub max_output_size: Option<usize>,
    pub max_concurrent_containers: Option<usize>,
    pub ipc_poll_interval_ms: Option<u64>,
    pub data_dir: Option<PathBuf>,
    pub groups_dir: Option<PathBuf>,
    pub mount_allowlist: Option<PathBuf>,
    pub log_level: Option<String>,
    pub max_queue_depth: Option<usize>,
    pub slot_release: Option<SlotRelease>,
}

pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<JsclawConfig> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(JsclawConfig::default().with_env_overrides());
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;

    let parsed: JsclawConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;

    Ok(parsed.with_env_overrides())
}

impl JsclawConfig {
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(image) = env_string("JSCLAW_CONTAINER_IMAGE") {
            self.container_image = image;
        }
        if let Some(runtime) = env_string("JSCLAW_CONTAINER_RUNTIME") {
            match runtime.parse() {
                Ok(r) => self.container_runtime = r,
                Err(err) => warn!(value = %runtime, %err, "ignoring JSCLAW_CONTAINER_RUNTIME"),
            }
        }
        if let Some(ms) = env_parse::<u64>("JSCLAW_CONTAINER_TIMEOUT") {
            self.container_timeout_ms = ms;
        }
        if let Some(bytes) = env_parse::<usize>("JSCLAW_MAX_OUTPUT_SIZE") {
            self.max_output_size = bytes;
        }
        if let Some(n) = env_parse::<usize>("JSCLAW_MAX_CONCURRENT") {
            self.max_concurrent_containers = n;
        }
        if let Some(ms) = env_parse::<u64>("JSCLAW_IPC_POLL_INTERVAL") {
            self.ipc_poll_interval_ms = ms;
        }
        if let Some(dir) = env_string("JSCLAW_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = env_string("JSCLAW_GROUPS_DIR") {
            self.groups_dir = PathBuf::from(dir);
        }
        if let Some(path) = env_string("JSCLAW_MOUNT_ALLOWLIST") {
            self.mount_allowlist = Some(PathBuf::from(path));
        }
        if let Some(level) = env_string("JSCLAW_LOG_LEVEL") {
            self.log_level = level;
        }
        self
    }

    pub fn apply(mut self, overrides: ConfigOverrides) -> Self {
        if let Some(v) = overrides.container_image {
            self.container_image = v;
        }
        if let Some(v) = overrides.container_runtime {
            self.container_runtime = v;
        }
        if let Some(v) = overrides.container_timeout_ms {
            self.container_timeout_ms = v;
        }
        if let Some(v) = overrides.max_output_size {
            self.max_output_size = v;
        }
        if let Some(v) = overrides.max_concurrent_containers {
            self.max_concurrent_containers = v;
        }
        if let Some(v) = overrides.ipc_poll_interval_ms {
            self.ipc_poll_interval_ms = v;
        }
        if let Some(v) = overrides.data_dir {
            self.data_dir = v;
        }
        if let Some(v) = overrides.groups_dir {
            self.groups_dir = v;
        }
        if let Some(v) = overrides.mount_allowlist {
            self.mount_allowlist = Some(v);
        }
        if let Some(v) = overrides.log_level {
            self.log_level = v;
        }
        if let Some(v) = overrides.max_queue_depth {
            self.max_queue_depth = v;
        }
        if let Some(v) = overrides.slot_release {
            self.slot_release = v;
        }
        self
    }

    /// Per-group IPC namespace root.
    pub fn ipc_dir(&self, group_folder: &str) -> PathBuf {
        self.data_dir.join("ipc").join(group_folder)
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = env_string(name)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(var = name, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}
