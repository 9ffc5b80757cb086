//! Host-side IPC watcher.
//!
//! Polls each registered group's mailbox tree under `<data_dir>/ipc/`,
//! relaying outbound messages and task directives to the injected
//! collaborators. Entries that fail dispatch are quarantined into an
//! `errors/` sibling of their mailbox.
//!
//! Authorization model: the main group may target any chat; a non-main
//! group may only target its own registered chat JID.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use jsclaw_core::group::RegisteredGroup;
use jsclaw_core::ipc::{IpcMessage, IpcTaskKind, drain_ipc_dir};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Collaborator surface the watcher dispatches into. Out-of-process
/// concerns (chat delivery, task persistence) live behind this trait.
pub trait IpcDelegate: Send + Sync {
    /// Deliver an outbound chat message.
    fn send_message(&self, chat_jid: &str, text: &str, sender: Option<&str>)
    -> anyhow::Result<()>;

    /// Handle a task-control directive emitted by a container.
    fn on_task(
        &self,
        kind: IpcTaskKind,
        data: Value,
        source_group: &str,
        is_main: bool,
    ) -> anyhow::Result<()>;

    /// Current group registrations, fetched once per tick.
    fn registered_groups(&self) -> HashMap<String, RegisteredGroup>;
}

/// Delegate that logs dispatches without forwarding anywhere. Used when the
/// daemon runs standalone.
pub struct LogOnlyDelegate;

impl IpcDelegate for LogOnlyDelegate {
    fn send_message(
        &self,
        chat_jid: &str,
        text: &str,
        _sender: Option<&str>,
    ) -> anyhow::Result<()> {
        info!(chat_jid, text_len = text.len(), "IPC message received (logged only)");
        Ok(())
    }

    fn on_task(
        &self,
        kind: IpcTaskKind,
        _data: Value,
        source_group: &str,
        is_main: bool,
    ) -> anyhow::Result<()> {
        info!(
            kind = kind.as_str(),
            source_group, is_main, "IPC task received (logged only)"
        );
        Ok(())
    }

    fn registered_groups(&self) -> HashMap<String, RegisteredGroup> {
        HashMap::new()
    }
}

#[derive(Debug, Clone)]
pub struct IpcWatcherConfig {
    pub data_dir: PathBuf,
    pub poll_interval: Duration,
}

impl Default for IpcWatcherConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            poll_interval: Duration::from_millis(1000),
        }
    }
}

/// Process-wide set of data directories with a live watcher. Two watchers
/// over one directory would race each other's drains.
fn watched_dirs() -> &'static Mutex<HashSet<PathBuf>> {
    static DIRS: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    DIRS.get_or_init(|| Mutex::new(HashSet::new()))
}

pub struct IpcWatcher {
    config: IpcWatcherConfig,
    delegate: Arc<dyn IpcDelegate>,
}

impl IpcWatcher {
    pub fn new(config: IpcWatcherConfig, delegate: Arc<dyn IpcDelegate>) -> Self {
        Self { config, delegate }
    }

    /// Start the periodic tick: one immediate tick, then one per interval.
    /// Fails if a watcher is already running over the same data directory.
    pub fn start(self) -> anyhow::Result<IpcWatcherHandle> {
        let dir = self.config.data_dir.clone();
        {
            let mut dirs = watched_dirs().lock().unwrap();
            if !dirs.insert(dir.clone()) {
                anyhow::bail!(
                    "an IPC watcher is already running over {}",
                    dir.display()
                );
            }
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let interval = self.config.poll_interval;
        let task = tokio::spawn(async move {
            fs::create_dir_all(self.config.data_dir.join("ipc")).ok();
            info!(dir = %self.config.data_dir.display(), "IPC watcher started");
            self.poll_once();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => self.poll_once(),
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("IPC watcher stopped");
        });

        Ok(IpcWatcherHandle {
            dir,
            shutdown: shutdown_tx,
            task: Some(task),
        })
    }

    /// One tick over every mailbox tree belonging to a registered group.
    fn poll_once(&self) {
        let groups = self.delegate.registered_groups();
        let ipc_base = self.config.data_dir.join("ipc");

        let entries = match fs::read_dir(&ipc_base) {
            Ok(entries) => entries,
            Err(err) => {
                debug!(dir = %ipc_base.display(), %err, "IPC base directory not readable");
                return;
            }
        };

        for entry in entries.flatten() {
            if !entry.file_type().is_ok_and(|t| t.is_dir()) {
                continue;
            }
            let folder = entry.file_name().to_string_lossy().into_owned();
            let group = match groups.values().find(|g| g.folder == folder) {
                Some(group) => group,
                None => {
                    debug!(folder = %folder, "ignoring mailbox with no registered group");
                    continue;
                }
            };
            let is_main = group.is_main_group();
            let group_dir = ipc_base.join(&folder);

            self.drain_messages(&group_dir, group, is_main);
            self.drain_tasks(&group_dir, group, is_main);
        }
    }

    fn drain_messages(&self, group_dir: &Path, group: &RegisteredGroup, is_main: bool) {
        let messages_dir = group_dir.join("messages");
        for (msg, filename) in drain_ipc_dir::<IpcMessage>(&messages_dir, None) {
            if msg.text.trim().is_empty() {
                warn!(
                    group = %group.folder,
                    file = %filename,
                    "IPC message missing text, skipping"
                );
                continue;
            }

            let target = msg
                .target_jid
                .clone()
                .unwrap_or_else(|| group.jid.clone());

            // Cross-group isolation: only the main group may address a chat
            // other than its own.
            if !is_main && msg.target_jid.is_some() && target != group.jid {
                warn!(
                    group = %group.folder,
                    target = %target,
                    "unauthorized cross-group message blocked"
                );
                continue;
            }

            if let Err(err) = self
                .delegate
                .send_message(&target, &msg.text, msg.sender.as_deref())
            {
                error!(
                    group = %group.folder,
                    target = %target,
                    %err,
                    "message dispatch failed, quarantining entry"
                );
                quarantine(&messages_dir, &filename, &msg);
            } else {
                debug!(group = %group.folder, target = %target, "IPC message dispatched");
            }
        }
    }

    fn drain_tasks(&self, group_dir: &Path, group: &RegisteredGroup, is_main: bool) {
        let tasks_dir = group_dir.join("tasks");
        for (entry, filename) in drain_ipc_dir::<Value>(&tasks_dir, None) {
            let kind_value = match entry.get("type") {
                Some(v) => v.clone(),
                None => {
                    warn!(
                        group = %group.folder,
                        file = %filename,
                        "IPC task missing type, skipping"
                    );
                    continue;
                }
            };
            let kind: IpcTaskKind = match serde_json::from_value(kind_value) {
                Ok(kind) => kind,
                Err(_) => {
                    error!(
                        group = %group.folder,
                        file = %filename,
                        "unknown IPC task type, quarantining entry"
                    );
                    quarantine(&tasks_dir, &filename, &entry);
                    continue;
                }
            };

            let data = entry.get("data").cloned().unwrap_or_else(|| entry.clone());
            if let Err(err) = self.delegate.on_task(kind, data, &group.folder, is_main) {
                error!(
                    group = %group.folder,
                    kind = kind.as_str(),
                    %err,
                    "task dispatch failed, quarantining entry"
                );
                quarantine(&tasks_dir, &filename, &entry);
            }
        }
    }
}

/// Owned handle to a running watcher.
pub struct IpcWatcherHandle {
    dir: PathBuf,
    shutdown: watch::Sender<bool>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl IpcWatcherHandle {
    /// Cancel the ticker. Does not wait for an in-flight tick.
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for IpcWatcherHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
        watched_dirs().lock().unwrap().remove(&self.dir);
    }
}

/// Copy a failed entry into the mailbox's `errors/` sibling. Best effort.
fn quarantine<T: serde::Serialize>(mailbox: &Path, filename: &str, entry: &T) {
    let errors_dir = mailbox.join("errors");
    if let Err(err) = fs::create_dir_all(&errors_dir) {
        warn!(dir = %errors_dir.display(), %err, "failed to create quarantine directory");
        return;
    }
    match serde_json::to_string(entry) {
        Ok(content) => {
            if let Err(err) = fs::write(errors_dir.join(filename), content) {
                warn!(file = filename, %err, "failed to quarantine entry");
            }
        }
        Err(err) => warn!(file = filename, %err, "failed to serialize quarantined entry"),
    }
}
