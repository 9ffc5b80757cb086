//! Per-group serialization queue with a global concurrency cap.
//!
//! Each group runs at most one work item at a time; a global cap bounds
//! concurrent containers across groups. Tasks are prepended so they drain
//! before message checks; failures retry with bounded exponential backoff
//! while the group slot stays held.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use futures::future::BoxFuture;
use jsclaw_core::config::{JsclawConfig, SlotRelease};
use jsclaw_core::ipc::{IpcInput, write_close_sentinel, write_ipc_file};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, error, info, warn};

use crate::container::runner::ProcessHandle;

const MAX_RETRIES: u32 = 5;
const BASE_RETRY_MS: u64 = 5000;
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 10_000;

/// Callback invoked for message-check items. `Ok(bool)` resolves the item;
/// `Err` triggers the retry schedule.
pub type ProcessMessagesFn = Arc<
    dyn Fn(String) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send>> + Send + Sync,
>;

/// Callback carried by a queued task. Retried on `Err`, so it must be
/// re-runnable.
pub type TaskFn =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send>> + Send + Sync>;

/// Awaitable completion of one enqueued item. Fires exactly once.
pub struct CompletionHandle(oneshot::Receiver<Result<bool, String>>);

impl CompletionHandle {
    pub async fn wait(self) -> anyhow::Result<bool> {
        match self.0.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(reason)) => Err(anyhow!(reason)),
            Err(_) => Err(anyhow!("queue dropped the work item")),
        }
    }

    fn resolved(value: Result<bool, String>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(value);
        Self(rx)
    }
}

enum ItemKind {
    MessageCheck,
    Task { id: String, run: TaskFn },
}

struct WorkItem {
    kind: ItemKind,
    completion: oneshot::Sender<Result<bool, String>>,
}

/// Per-group state. `folder` is immutable once set.
#[derive(Default)]
struct GroupState {
    folder: Option<String>,
    active_process: Option<ProcessHandle>,
    container_name: Option<String>,
    processing: bool,
    queue: VecDeque<WorkItem>,
}

struct Inner {
    groups: HashMap<String, GroupState>,
    active_count: usize,
    max_concurrent: usize,
    max_queue_depth: usize,
    slot_release: SlotRelease,
    process_messages_fn: Option<ProcessMessagesFn>,
    shutting_down: bool,
    data_dir: PathBuf,
}

impl Inner {
    fn get_or_insert(&mut self, jid: &str) -> &mut GroupState {
        self.groups.entry(jid.to_string()).or_default()
    }

    fn input_dir(&self, folder: &str) -> PathBuf {
        self.data_dir.join("ipc").join(folder).join("input")
    }

    /// Pick at most one runnable item: the first group that has queued work
    /// and no item in flight, subject to the global cap.
    fn next_runnable(&mut self) -> Option<(String, WorkItem)> {
        if self.shutting_down || self.active_count >= self.max_concurrent {
            return None;
        }
        let jid = self
            .groups
            .iter()
            .find(|(_, state)| !state.processing && !state.queue.is_empty())
            .map(|(jid, _)| jid.clone())?;
        let state = self.groups.get_mut(&jid)?;
        let item = state.queue.pop_front()?;
        state.processing = true;
        self.active_count += 1;
        Some((jid, item))
    }

    fn release_slot(&mut self, jid: &str) {
        if let Some(state) = self.groups.get_mut(jid) {
            state.processing = false;
            state.active_process = None;
            state.container_name = None;
        }
        self.active_count = self.active_count.saturating_sub(1);
    }
}

/// Group queue managing per-group serialization and global concurrency.
pub struct GroupQueue {
    inner: Arc<Mutex<Inner>>,
}

impl GroupQueue {
    pub fn new(config: &JsclawConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                groups: HashMap::new(),
                active_count: 0,
                max_concurrent: config.max_concurrent_containers,
                max_queue_depth: config.max_queue_depth,
                slot_release: config.slot_release,
                process_messages_fn: None,
                shutting_down: false,
                data_dir: config.data_dir.clone(),
            })),
        }
    }

    /// Set the callback invoked for message-check items.
    pub async fn set_process_messages_fn(&self, f: ProcessMessagesFn) {
        self.inner.lock().await.process_messages_fn = Some(f);
    }

    /// Append a message check to the group's queue.
    pub async fn enqueue_message_check(&self, group_jid: &str) -> CompletionHandle {
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock().await;
            if inner.shutting_down {
                return CompletionHandle::resolved(Err("queue is shutting down".to_string()));
            }
            let max_depth = inner.max_queue_depth;
            let state = inner.get_or_insert(group_jid);
            if state.queue.len() >= max_depth {
                warn!(group_jid, max_depth, "group queue full, rejecting message check");
                return CompletionHandle::resolved(Err(format!(
                    "group queue depth limit ({max_depth}) reached"
                )));
            }
            state.queue.push_back(WorkItem {
                kind: ItemKind::MessageCheck,
                completion: tx,
            });
            debug!(group_jid, "message check enqueued");
        }
        self.drain().await;
        CompletionHandle(rx)
    }

    /// Prepend a task to the group's queue. Tasks drain before message
    /// checks; among themselves they are LIFO. A task id already pending
    /// for the group is a no-op resolving `false`.
    pub async fn enqueue_task(&self, group_jid: &str, task_id: &str, run: TaskFn) -> CompletionHandle {
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock().await;
            if inner.shutting_down {
                return CompletionHandle::resolved(Err("queue is shutting down".to_string()));
            }
            let max_depth = inner.max_queue_depth;
            let state = inner.get_or_insert(group_jid);
            let duplicate = state.queue.iter().any(|item| {
                matches!(&item.kind, ItemKind::Task { id, .. } if id == task_id)
            });
            if duplicate {
                debug!(group_jid, task_id, "task already queued, skipping");
                return CompletionHandle::resolved(Ok(false));
            }
            if state.queue.len() >= max_depth {
                warn!(group_jid, task_id, max_depth, "group queue full, rejecting task");
                return CompletionHandle::resolved(Err(format!(
                    "group queue depth limit ({max_depth}) reached"
                )));
            }
            state.queue.push_front(WorkItem {
                kind: ItemKind::Task {
                    id: task_id.to_string(),
                    run,
                },
                completion: tx,
            });
            debug!(group_jid, task_id, "task enqueued with priority");
        }
        self.drain().await;
        CompletionHandle(rx)
    }

    async fn drain(&self) {
        let next = {
            let mut inner = self.inner.lock().await;
            inner.next_runnable()
        };
        if let Some((jid, item)) = next {
            tokio::spawn(process_item(self.inner.clone(), jid, item));
        }
    }

    /// Attach a live container process to a group. Required before
    /// `send_message` or `close_container` can reach it.
    pub async fn register_process(
        &self,
        group_jid: &str,
        process: ProcessHandle,
        container_name: &str,
        group_folder: &str,
    ) {
        let mut inner = self.inner.lock().await;
        let state = inner.get_or_insert(group_jid);
        state.active_process = Some(process);
        state.container_name = Some(container_name.to_string());
        match &state.folder {
            None => state.folder = Some(group_folder.to_string()),
            Some(existing) if existing != group_folder => {
                warn!(
                    group_jid,
                    existing = existing.as_str(),
                    requested = group_folder,
                    "ignoring folder change for registered group"
                );
            }
            _ => {}
        }
    }

    /// Pipe a follow-up prompt to the group's running container through its
    /// `input/` mailbox. Returns false when no live container is attached.
    pub async fn send_message(&self, group_jid: &str, text: &str) -> bool {
        let input_dir = {
            let inner = self.inner.lock().await;
            let state = match inner.groups.get(group_jid) {
                Some(state) => state,
                None => return false,
            };
            if !state.active_process.as_ref().is_some_and(ProcessHandle::is_alive) {
                return false;
            }
            let folder = match &state.folder {
                Some(folder) => folder,
                None => return false,
            };
            inner.input_dir(folder)
        };

        let input = IpcInput {
            text: text.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        match write_ipc_file(&input_dir, &input, None) {
            Ok(_) => true,
            Err(err) => {
                error!(group_jid, %err, "failed to write input message");
                false
            }
        }
    }

    /// Ask the group's container to exit cooperatively.
    pub async fn close_container(&self, group_jid: &str) {
        let inner = self.inner.lock().await;
        if let Some(state) = inner.groups.get(group_jid) {
            if let Some(folder) = &state.folder {
                write_close_sentinel(&inner.input_dir(folder));
            }
        }
    }

    /// Name of the group's most recently registered container, if any.
    pub async fn active_container_name(&self, group_jid: &str) -> Option<String> {
        let inner = self.inner.lock().await;
        inner
            .groups
            .get(group_jid)
            .and_then(|state| state.container_name.clone())
    }

    pub async fn has_active_container(&self, group_jid: &str) -> bool {
        let inner = self.inner.lock().await;
        inner
            .groups
            .get(group_jid)
            .and_then(|state| state.active_process.as_ref())
            .is_some_and(ProcessHandle::is_alive)
    }

    pub async fn active_count(&self) -> usize {
        self.inner.lock().await.active_count
    }

    /// Graceful shutdown: close sentinels to every live container, wait the
    /// grace period, force-kill stragglers. Queued-but-unstarted items are
    /// rejected so no completion is left unfulfilled.
    pub async fn shutdown(&self, grace_ms: u64) {
        let (data_dir, live) = {
            let mut inner = self.inner.lock().await;
            inner.shutting_down = true;

            let mut rejected = Vec::new();
            for state in inner.groups.values_mut() {
                while let Some(item) = state.queue.pop_front() {
                    rejected.push(item);
                }
            }
            for item in rejected {
                let _ = item
                    .completion
                    .send(Err("queue is shutting down".to_string()));
            }

            let live: Vec<(String, Option<String>, ProcessHandle)> = inner
                .groups
                .iter()
                .filter_map(|(jid, state)| {
                    let process = state.active_process.clone()?;
                    process
                        .is_alive()
                        .then(|| (jid.clone(), state.folder.clone(), process))
                })
                .collect();
            (inner.data_dir.clone(), live)
        };

        for (_, folder, _) in &live {
            if let Some(folder) = folder {
                write_close_sentinel(&data_dir.join("ipc").join(folder).join("input"));
            }
        }

        info!(live = live.len(), grace_ms, "queue shutting down");
        tokio::time::sleep(Duration::from_millis(grace_ms)).await;

        for (jid, _, process) in &live {
            if process.is_alive() {
                warn!(
                    group_jid = jid.as_str(),
                    "force-killing container still alive after grace period"
                );
                process.kill();
            }
        }
    }
}

/// Run one item to a terminal outcome, retrying with exponential backoff.
/// The group slot stays held across backoff; release afterwards follows the
/// configured policy.
fn process_item(
    queue: Arc<Mutex<Inner>>,
    group_jid: String,
    item: WorkItem,
) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let slot_release = { queue.lock().await.slot_release };
        let WorkItem { kind, completion } = item;

        let mut attempt: u32 = 0;
        let outcome: Result<bool, String> = loop {
            let run_result: anyhow::Result<bool> = match &kind {
                ItemKind::Task { id, run } => {
                    debug!(
                        group_jid = group_jid.as_str(),
                        task_id = id.as_str(),
                        attempt,
                        "running task"
                    );
                    run().await
                }
                ItemKind::MessageCheck => {
                    let process_fn = { queue.lock().await.process_messages_fn.clone() };
                    match process_fn {
                        Some(f) => f(group_jid.clone()).await,
                        None => Err(anyhow!("no processing function configured")),
                    }
                }
            };

            match run_result {
                Ok(success) => break Ok(success),
                Err(err) if attempt < MAX_RETRIES => {
                    let delay_ms = BASE_RETRY_MS * 2u64.pow(attempt);
                    warn!(
                        group_jid = group_jid.as_str(),
                        attempt,
                        delay_ms,
                        err = %err,
                        "processing failed, retrying with backoff"
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    if queue.lock().await.shutting_down {
                        break Err("queue is shutting down".to_string());
                    }
                    attempt += 1;
                }
                Err(err) => {
                    error!(
                        group_jid = group_jid.as_str(),
                        attempt,
                        err = %err,
                        "processing failed, retries exhausted"
                    );
                    break Err(err.to_string());
                }
            }
        };

        let _ = completion.send(outcome);

        let release = match slot_release {
            SlotRelease::Terminal => true,
            SlotRelease::Exhaustive => {
                attempt >= MAX_RETRIES || matches!(kind, ItemKind::MessageCheck)
            }
        };

        let next = {
            let mut inner = queue.lock().await;
            if release {
                inner.release_slot(&group_jid);
                inner.next_runnable()
            } else {
                debug!(
                    group_jid = group_jid.as_str(),
                    "slot retained under exhaustive release policy"
                );
                None
            }
        };
        if let Some((jid, item)) = next {
            tokio::spawn(process_item(queue.clone(), jid, item));
        }
    })
}
