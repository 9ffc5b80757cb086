//! Orchestration facade wiring the container runner into the group queue.
//!
//! The runner produces the live process handle; the queue needs it to pipe
//! follow-up input and to kill stragglers at shutdown. The `RunnerEvents`
//! callback breaks that cycle: the runner calls back once after spawn, the
//! queue records the handle, and neither holds the other's state.

use std::sync::Arc;

use futures::future::BoxFuture;
use jsclaw_core::container::{ContainerInput, ContainerOutput};
use jsclaw_core::group::RegisteredGroup;

use crate::container::runner::{self, ProcessHandle, RunnerConfig, RunnerEvents};
use crate::queue::GroupQueue;

/// Streaming hook invoked once per parsed output frame, in stdout order.
pub type OutputHook =
    Arc<dyn Fn(ContainerOutput) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

pub struct Orchestrator {
    queue: Arc<GroupQueue>,
    runner_config: RunnerConfig,
}

struct QueueEvents {
    queue: Arc<GroupQueue>,
    jid: String,
    folder: String,
    hook: Option<OutputHook>,
}

impl RunnerEvents for QueueEvents {
    fn on_process<'a>(
        &'a self,
        process: ProcessHandle,
        container_name: &'a str,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.queue
                .register_process(&self.jid, process, container_name, &self.folder)
                .await;
        })
    }

    fn on_output<'a>(&'a self, output: ContainerOutput) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            match &self.hook {
                Some(hook) => hook(output).await,
                None => Ok(()),
            }
        })
    }
}

impl Orchestrator {
    pub fn new(queue: Arc<GroupQueue>, runner_config: RunnerConfig) -> Self {
        Self {
            queue,
            runner_config,
        }
    }

    /// Run one container for the group. The spawned process is registered
    /// with the queue before any output is processed, so the queue's
    /// `send_message` can reach the container for the whole run.
    pub async fn run_container_agent(
        &self,
        group: &RegisteredGroup,
        input: &ContainerInput,
        on_output: Option<OutputHook>,
    ) -> anyhow::Result<ContainerOutput> {
        let events = QueueEvents {
            queue: self.queue.clone(),
            jid: group.jid.clone(),
            folder: group.folder.clone(),
            hook: on_output,
        };
        runner::run_agent(group, input, &events, &self.runner_config).await
    }

    /// Refresh the group's scheduled-task snapshot. Call before spawning;
    /// nothing reads the file while no container is running.
    pub fn write_tasks_snapshot(
        &self,
        group_folder: &str,
        tasks: &serde_json::Value,
    ) -> anyhow::Result<()> {
        runner::write_tasks_snapshot(group_folder, tasks, &self.runner_config)
    }

    pub fn queue(&self) -> &Arc<GroupQueue> {
        &self.queue
    }
}
