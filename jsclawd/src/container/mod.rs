pub mod mounts;
pub mod runner;
pub mod security;

pub use mounts::{build_container_args, build_volume_mounts, container_name};
pub use runner::{
    NullEvents, ProcessHandle, RunnerConfig, RunnerEvents, cleanup_orphans,
    ensure_runtime_available, run_agent, stop_then_kill, write_tasks_snapshot,
};
pub use security::{MountValidation, validate_mounts};
