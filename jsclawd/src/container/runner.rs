//! Container runner: spawns one agent container and manages its lifetime.
//!
//! Spawns the configured runtime CLI with piped stdio, writes one
//! `ContainerInput` JSON document to stdin, streams stdout for
//! sentinel-framed `ContainerOutput` frames, and enforces the idle timeout
//! and output-size ceiling. Follow-up prompts reach the running container
//! through its `input/` mailbox, not stdin.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use futures::future::BoxFuture;
use jsclaw_core::config::JsclawConfig;
use jsclaw_core::container::{
    ContainerInput, ContainerOutput, OUTPUT_START_MARKER, extract_output_frames,
};
use jsclaw_core::group::RegisteredGroup;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::mounts::{build_container_args, build_volume_mounts, container_name};

/// Runner configuration, derived from the host config plus a per-run
/// environment passthrough map.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Runtime CLI binary (`docker`, `podman`, or `container`).
    pub runtime_bin: String,
    pub image: String,
    pub groups_dir: PathBuf,
    pub data_dir: PathBuf,
    pub container_timeout_ms: u64,
    pub max_output_size: usize,
    /// Extra `-e KEY=VAL` pairs forwarded into the container.
    pub env: BTreeMap<String, String>,
    pub allowlist_path: Option<PathBuf>,
}

impl RunnerConfig {
    pub fn from_config(cfg: &JsclawConfig) -> Self {
        Self {
            runtime_bin: cfg.container_runtime.as_str().to_string(),
            image: cfg.container_image.clone(),
            groups_dir: cfg.groups_dir.clone(),
            data_dir: cfg.data_dir.clone(),
            container_timeout_ms: cfg.container_timeout_ms,
            max_output_size: cfg.max_output_size,
            env: BTreeMap::new(),
            allowlist_path: cfg.mount_allowlist.clone(),
        }
    }
}

/// Handle to a spawned container process. Cheap to clone; the queue holds
/// one per group so it can force-kill stragglers at shutdown.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    alive: Arc<AtomicBool>,
}

impl ProcessHandle {
    pub(crate) fn new(pid: Option<u32>) -> Self {
        Self {
            pid,
            alive: Arc::new(AtomicBool::new(pid.is_some())),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_exited(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    /// SIGKILL-equivalent hard stop. Errors are swallowed.
    pub fn kill(&self) {
        if !self.is_alive() {
            return;
        }
        if let Some(pid) = self.pid {
            unsafe {
                libc::kill(pid as i32, libc::SIGKILL);
            }
        }
        self.mark_exited();
    }
}

/// Inversion-of-control pair between the runner and its caller: the runner
/// hands the live process back once after spawn, then reports each parsed
/// output frame. `on_output` failures are logged, never propagated.
pub trait RunnerEvents: Send + Sync {
    fn on_process<'a>(
        &'a self,
        process: ProcessHandle,
        container_name: &'a str,
    ) -> BoxFuture<'a, ()> {
        let _ = (process, container_name);
        Box::pin(async {})
    }

    fn on_output<'a>(&'a self, output: ContainerOutput) -> BoxFuture<'a, anyhow::Result<()>> {
        let _ = output;
        Box::pin(async { Ok(()) })
    }
}

/// No-op events for callers that only want the final output.
pub struct NullEvents;

impl RunnerEvents for NullEvents {}

/// Run one agent container to completion.
///
/// The only rejection is a failed spawn; every other failure mode resolves
/// to a structured `ContainerOutput` with error status.
pub async fn run_agent(
    group: &RegisteredGroup,
    input: &ContainerInput,
    events: &dyn RunnerEvents,
    config: &RunnerConfig,
) -> anyhow::Result<ContainerOutput> {
    let start = Instant::now();
    let name = container_name(&group.folder);

    // Creates the group workspace and mailbox tree as a side effect.
    let mounts = build_volume_mounts(group, config);
    let args = build_container_args(&mounts, &name, &config.image, &config.env);

    let timeout_ms = group
        .container
        .as_ref()
        .and_then(|c| c.timeout_ms)
        .unwrap_or(config.container_timeout_ms);

    info!(
        group = %group.name,
        container = %name,
        mount_count = mounts.len(),
        runtime = %config.runtime_bin,
        "spawning container agent"
    );

    let mut child = Command::new(&config.runtime_bin)
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("unable to spawn container runtime {}", config.runtime_bin))?;

    let handle = ProcessHandle::new(child.id());
    events.on_process(handle.clone(), &name).await;

    if let Some(mut stdin) = child.stdin.take() {
        match serde_json::to_string(input) {
            Ok(payload) => {
                if let Err(err) = stdin.write_all(payload.as_bytes()).await {
                    warn!(container = %name, %err, "failed to write container input");
                }
                stdin.shutdown().await.ok();
            }
            Err(err) => warn!(container = %name, %err, "failed to serialize container input"),
        }
    }

    // Idle watchdog: fires `timeout_ms` after the last output frame (or
    // after spawn if none arrived), then stops the container by name.
    let (activity_tx, mut activity_rx) = watch::channel(Instant::now());
    let timed_out = Arc::new(AtomicBool::new(false));
    let timeout_duration = Duration::from_millis(timeout_ms);
    let watchdog = {
        let name = name.clone();
        let timed_out = timed_out.clone();
        let runtime_bin = config.runtime_bin.clone();
        tokio::spawn(async move {
            loop {
                let last_activity = *activity_rx.borrow();
                let elapsed = last_activity.elapsed();
                if elapsed >= timeout_duration {
                    timed_out.store(true, Ordering::SeqCst);
                    warn!(container = %name, timeout_ms, "container idle timeout, stopping");
                    stop_then_kill(&runtime_bin, &name).await;
                    break;
                }
                let remaining = timeout_duration - elapsed;
                tokio::select! {
                    _ = tokio::time::sleep(remaining) => {}
                    changed = activity_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        })
    };

    let stdout = child.stdout.take().context("container stdout unavailable")?;
    let stderr = child.stderr.take().context("container stderr unavailable")?;
    let mut stdout_reader = BufReader::new(stdout);
    let mut stderr_reader = BufReader::new(stderr);

    let stderr_cap = (config.max_output_size / 2).max(512);
    let mut pending = String::new();
    let mut line = String::new();
    let mut err_line = String::new();
    let mut stderr_tail = String::new();
    let mut total_stdout = 0usize;
    let mut size_overrun = false;
    let mut last_output: Option<ContainerOutput> = None;
    let mut new_session_id: Option<String> = None;
    let mut stdout_open = true;
    let mut stderr_open = true;

    while stdout_open {
        tokio::select! {
            read = stdout_reader.read_line(&mut line) => {
                match read {
                    Ok(0) => stdout_open = false,
                    Ok(n) => {
                        total_stdout += n;
                        if !size_overrun && total_stdout > config.max_output_size {
                            size_overrun = true;
                            error!(
                                container = %name,
                                max_output_size = config.max_output_size,
                                "container output ceiling exceeded, killing"
                            );
                            stop_then_kill(&config.runtime_bin, &name).await;
                        }

                        pending.push_str(&line);
                        line.clear();

                        let (frames, consumed) = extract_output_frames(&pending);
                        if consumed > 0 {
                            pending.drain(..consumed);
                        }
                        for frame in frames {
                            let output = parse_frame(&frame);
                            if let Some(sid) = &output.new_session_id {
                                new_session_id = Some(sid.clone());
                            }
                            activity_tx.send(Instant::now()).ok();
                            if let Err(err) = events.on_output(output.clone()).await {
                                warn!(container = %name, %err, "output callback failed");
                            }
                            last_output = Some(output);
                        }
                        // Drop marker-free noise; a pending start marker is
                        // retained until its end marker arrives.
                        if !pending.contains(OUTPUT_START_MARKER) {
                            pending.clear();
                        }
                    }
                    Err(err) => {
                        warn!(container = %name, %err, "error reading container stdout");
                        stdout_open = false;
                    }
                }
            }
            read = stderr_reader.read_line(&mut err_line), if stderr_open => {
                match read {
                    Ok(0) => stderr_open = false,
                    Ok(_) => {
                        stderr_tail.push_str(&err_line);
                        err_line.clear();
                        truncate_front(&mut stderr_tail, stderr_cap);
                    }
                    Err(_) => stderr_open = false,
                }
            }
        }
    }

    let status = child.wait().await.context("failed to await container exit")?;
    handle.mark_exited();
    watchdog.abort();
    drop(activity_tx);

    let exit_code = status.code();
    let was_timed_out = timed_out.load(Ordering::SeqCst);
    debug!(
        container = %name,
        exit_code = ?exit_code,
        duration_ms = start.elapsed().as_millis() as u64,
        timed_out = was_timed_out,
        "container exited"
    );

    if was_timed_out {
        let mut output =
            ContainerOutput::error(format!("Container timed out after {timeout_ms}ms"));
        output.result = last_output.as_ref().and_then(|o| o.result.clone());
        output.new_session_id = new_session_id;
        return Ok(output);
    }

    if size_overrun {
        let mut output = ContainerOutput::error(format!(
            "Container output exceeded {} bytes",
            config.max_output_size
        ));
        output.result = last_output.as_ref().and_then(|o| o.result.clone());
        output.new_session_id = new_session_id;
        return Ok(output);
    }

    if let Some(output) = last_output {
        return Ok(output);
    }

    if exit_code == Some(0) {
        return Ok(ContainerOutput::success(None));
    }

    Ok(ContainerOutput::error(format!(
        "Container exited with code {}. stderr: {}",
        exit_code.unwrap_or(-1),
        tail_bytes(&stderr_tail, 500)
    )))
}

/// Parse one inter-marker payload, synthesizing an error output when the
/// payload is not valid JSON.
fn parse_frame(raw: &str) -> ContainerOutput {
    match serde_json::from_str::<ContainerOutput>(raw) {
        Ok(output) => output,
        Err(_) => ContainerOutput::error(format!(
            "Failed to parse output: {}",
            raw.chars().take(200).collect::<String>()
        )),
    }
}

/// Graceful `stop`, falling back to `kill`, both by container name.
pub async fn stop_then_kill(runtime_bin: &str, container_name: &str) {
    let stopped = Command::new(runtime_bin)
        .args(["stop", container_name])
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false);

    if !stopped {
        if let Err(err) = Command::new(runtime_bin)
            .args(["kill", container_name])
            .output()
            .await
        {
            warn!(container = container_name, %err, "container kill failed");
        }
    }
}

/// Write the scheduled-task snapshot into the group workspace. Plain write:
/// only called before a container is spawned, so nothing is reading it.
pub fn write_tasks_snapshot(
    group_folder: &str,
    tasks: &serde_json::Value,
    config: &RunnerConfig,
) -> anyhow::Result<()> {
    let dir = config.groups_dir.join(group_folder);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create group workspace {}", dir.display()))?;
    let path = dir.join("current_tasks.json");
    std::fs::write(&path, serde_json::to_string_pretty(tasks)?)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Check that the runtime CLI is installed and its daemon is reachable.
pub async fn ensure_runtime_available(runtime_bin: &str) -> anyhow::Result<()> {
    let output = Command::new(runtime_bin)
        .args(["info"])
        .output()
        .await
        .with_context(|| format!("container runtime {runtime_bin} not found"))?;

    if !output.status.success() {
        anyhow::bail!("container runtime {runtime_bin} is not running");
    }

    debug!(runtime = runtime_bin, "container runtime available");
    Ok(())
}

/// Stop orphaned jsclaw containers left over from a previous host run.
pub async fn cleanup_orphans(runtime_bin: &str) {
    let output = match Command::new(runtime_bin)
        .args(["ps", "--filter", "name=jsclaw-", "--format", "{{.Names}}"])
        .output()
        .await
    {
        Ok(o) => o,
        Err(err) => {
            warn!(%err, "failed to list orphaned containers");
            return;
        }
    };

    let names: Vec<&str> = std::str::from_utf8(&output.stdout)
        .unwrap_or("")
        .trim()
        .split('\n')
        .filter(|s| !s.is_empty())
        .collect();

    for name in &names {
        let _ = Command::new(runtime_bin).args(["stop", name]).output().await;
    }

    if !names.is_empty() {
        info!(count = names.len(), "stopped orphaned containers");
    }
}

/// Drop leading bytes so at most `cap` remain, respecting char boundaries.
fn truncate_front(s: &mut String, cap: usize) {
    if s.len() <= cap {
        return;
    }
    let mut cut = s.len() - cap;
    while cut < s.len() && !s.is_char_boundary(cut) {
        cut += 1;
    }
    s.drain(..cut);
}

/// Last `n` bytes of a string, respecting char boundaries.
fn tail_bytes(s: &str, n: usize) -> &str {
    if s.len() <= n {
        return s;
    }
    let mut cut = s.len() - n;
    while cut < s.len() && !s.is_char_boundary(cut) {
        cut += 1;
    }
    &s[cut..]
}
