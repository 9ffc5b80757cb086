//! Container wire protocol.
//!
//! The host writes one `ContainerInput` JSON document to the container's
//! stdin. The container emits zero or more `ContainerOutput` JSON blobs on
//! stdout, each framed by the literal sentinel markers below.

use serde::{Deserialize, Serialize};

/// Sentinel markers for robust output parsing. Must match the constants in
/// the container agent entrypoint.
pub const OUTPUT_START_MARKER: &str = "---JSCLAW_OUTPUT_START---";
pub const OUTPUT_END_MARKER: &str = "---JSCLAW_OUTPUT_END---";

/// Input payload written to container stdin as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInput {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub group_folder: String,
    pub chat_jid: String,
    pub is_main: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_scheduled_task: Option<bool>,
}

/// Output payload extracted from container stdout between the markers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerOutput {
    pub status: ContainerStatus,
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ContainerOutput {
    pub fn success(result: Option<String>) -> Self {
        Self {
            status: ContainerStatus::Success,
            result,
            new_session_id: None,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ContainerStatus::Error,
            result: None,
            new_session_id: None,
            error: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Success,
    Error,
}

/// A resolved volume mount passed to the runtime CLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub host_path: String,
    pub container_path: String,
    pub read_only: bool,
}

/// Parses sentinel-framed output frames from a stdout buffer.
///
/// Returns the extracted inter-marker payloads and the number of bytes
/// consumed. Bytes belonging to an incomplete pair (start marker seen, end
/// marker not yet) are left for the caller to retain and retry once more
/// data arrives.
pub fn extract_output_frames(buf: &str) -> (Vec<String>, usize) {
    let mut frames = Vec::new();
    let mut consumed = 0;

    let mut search_from = 0;
    loop {
        let start = match buf[search_from..].find(OUTPUT_START_MARKER) {
            Some(pos) => search_from + pos,
            None => break,
        };

        let after_start = start + OUTPUT_START_MARKER.len();
        let end = match buf[after_start..].find(OUTPUT_END_MARKER) {
            Some(pos) => after_start + pos,
            None => break, // incomplete pair, wait for more data
        };

        frames.push(buf[after_start..end].trim().to_string());

        consumed = end + OUTPUT_END_MARKER.len();
        search_from = consumed;
    }

    (frames, consumed)
}
