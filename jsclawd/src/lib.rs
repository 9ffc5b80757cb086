pub mod container;
pub mod ipc;
pub mod orchestrator;
pub mod queue;
