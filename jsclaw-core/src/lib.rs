pub mod config;
pub mod container;
pub mod group;
pub mod ipc;

pub use config::{ConfigOverrides, ContainerRuntime, JsclawConfig, SlotRelease, load_config};
pub use container::{
    ContainerInput, ContainerOutput, ContainerStatus, OUTPUT_END_MARKER, OUTPUT_START_MARKER,
    VolumeMount, extract_output_frames,
};
pub use group::{AdditionalMount, GroupContainerConfig, MAIN_GROUP_FOLDER, RegisteredGroup};
pub use ipc::{
    CLOSE_SENTINEL, IpcInput, IpcMessage, IpcTaskEnvelope, IpcTaskKind, drain_ipc_dir,
    read_ipc_file, write_close_sentinel, write_ipc_file,
};
