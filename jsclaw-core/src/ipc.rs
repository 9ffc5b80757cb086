//! Filesystem IPC primitives and mailbox payload types.
//!
//! Mailboxes are directories of JSON files. Writers publish with a
//! temp-then-rename so readers never observe a partial document; readers
//! drain in ascending filename order, which tracks creation time because
//! names start with an epoch-millisecond stamp.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Empty file dropped into a container's `input/` mailbox to request a
/// cooperative exit.
pub const CLOSE_SENTINEL: &str = "_close";

/// Outbound chat message emitted by a container agent.
///
/// The target field historically appeared in both spellings on the wire;
/// both are accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcMessage {
    #[serde(default)]
    pub text: String,
    #[serde(
        default,
        rename = "targetJid",
        alias = "target_jid",
        skip_serializing_if = "Option::is_none"
    )]
    pub target_jid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(
        default,
        rename = "sourceGroup",
        alias = "source_group",
        skip_serializing_if = "Option::is_none"
    )]
    pub source_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// Task-control directive emitted by a container agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcTaskEnvelope {
    #[serde(rename = "type")]
    pub kind: IpcTaskKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(
        default,
        rename = "sourceGroup",
        alias = "source_group",
        skip_serializing_if = "Option::is_none"
    )]
    pub source_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// Closed set of task directives. Anything else on the wire is rejected and
/// quarantined by the watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpcTaskKind {
    ScheduleTask,
    PauseTask,
    ResumeTask,
    CancelTask,
}

impl IpcTaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IpcTaskKind::ScheduleTask => "schedule_task",
            IpcTaskKind::PauseTask => "pause_task",
            IpcTaskKind::ResumeTask => "resume_task",
            IpcTaskKind::CancelTask => "cancel_task",
        }
    }
}

/// Host-to-container message dropped into the `input/` mailbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcInput {
    pub text: String,
    pub timestamp: String,
}

/// Atomically publish `obj` as a new JSON file in `dir`.
///
/// The generated name is `{prefix}{epoch_ms}-{8 hex}.json` with the suffix
/// drawn from the OS random source, so lexicographic order tracks creation
/// time with sub-millisecond tie-breaking. The rename is the publication
/// point.
pub fn write_ipc_file<T: Serialize>(
    dir: &Path,
    obj: &T,
    prefix: Option<&str>,
) -> anyhow::Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create IPC directory {}", dir.display()))?;

    let name = ipc_file_name(prefix);
    let final_path = dir.join(&name);
    let temp_path = dir.join(format!(".{name}.tmp"));

    let content = serde_json::to_string(obj).context("failed to serialize IPC payload")?;
    fs::write(&temp_path, content)
        .with_context(|| format!("failed to write {}", temp_path.display()))?;
    fs::rename(&temp_path, &final_path)
        .with_context(|| format!("failed to publish {}", final_path.display()))?;

    Ok(final_path)
}

/// Read and parse a single IPC file. Any failure yields `None`; callers
/// must tolerate absent entries.
pub fn read_ipc_file<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let content = fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

/// Drain a mailbox directory in ascending filename order.
///
/// Skips names not ending in `.json`, dotfiles (in-flight temp files), and
/// names rejected by `filter`. Each entry is read then deleted; an
/// unreadable entry is left in place for a later retry, while an entry that
/// reads but fails to delete is still returned. A missing directory drains
/// to nothing.
pub fn drain_ipc_dir<T: DeserializeOwned>(
    dir: &Path,
    filter: Option<&dyn Fn(&str) -> bool>,
) -> Vec<(T, String)> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    let mut names: Vec<String> = entries
        .flatten()
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|n| n.ends_with(".json") && !n.starts_with('.'))
        .filter(|n| filter.map_or(true, |f| f(n)))
        .collect();
    names.sort();

    let mut drained = Vec::new();
    for name in names {
        let path = dir.join(&name);
        match read_ipc_file::<T>(&path) {
            Some(obj) => {
                if let Err(err) = fs::remove_file(&path) {
                    debug!(path = %path.display(), %err, "failed to remove drained IPC file");
                }
                drained.push((obj, name));
            }
            None => {
                warn!(path = %path.display(), "unreadable IPC entry, leaving for retry");
            }
        }
    }
    drained
}

/// Drop the close sentinel into a mailbox directory.
pub fn write_close_sentinel(dir: &Path) {
    let _ = fs::create_dir_all(dir);
    let _ = fs::write(dir.join(CLOSE_SENTINEL), "");
}

fn ipc_file_name(prefix: Option<&str>) -> String {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let mut suffix = [0u8; 4];
    OsRng.fill_bytes(&mut suffix);
    format!(
        "{}{ms}-{:08x}.json",
        prefix.unwrap_or(""),
        u32::from_be_bytes(suffix)
    )
}
