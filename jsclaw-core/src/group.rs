//! Registered group metadata shared between the queue, runner, and watcher.

use serde::{Deserialize, Serialize};

/// Folder name of the main group. Used as a fallback heuristic when a
/// registration carries no explicit `is_main` flag.
pub const MAIN_GROUP_FOLDER: &str = "main";

/// A group registered with the host. `jid` is the opaque chat identifier;
/// `folder` is its filesystem-safe workspace name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredGroup {
    pub jid: String,
    pub name: String,
    pub folder: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_trigger: Option<bool>,
    /// Explicit main-group flag. When absent, `folder == "main"` decides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_main: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<GroupContainerConfig>,
}

impl RegisteredGroup {
    pub fn new(jid: impl Into<String>, name: impl Into<String>, folder: impl Into<String>) -> Self {
        Self {
            jid: jid.into(),
            name: name.into(),
            folder: folder.into(),
            trigger_pattern: None,
            requires_trigger: None,
            is_main: None,
            container: None,
        }
    }

    /// Whether this is the main group. The explicit flag wins; the
    /// `folder == "main"` comparison is the fallback heuristic.
    pub fn is_main_group(&self) -> bool {
        self.is_main.unwrap_or(self.folder == MAIN_GROUP_FOLDER)
    }
}

/// Per-group container tuning from the group registration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupContainerConfig {
    #[serde(default)]
    pub additional_mounts: Vec<AdditionalMount>,
    /// Overrides the global idle timeout for this group's containers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// A user-declared bind mount request, validated against the allowlist
/// before it reaches the runtime CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalMount {
    pub host_path: String,
    pub container_path: String,
    #[serde(default)]
    pub read_only: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folder_heuristic_detects_main() {
        let g = RegisteredGroup::new("j1", "Main", "main");
        assert!(g.is_main_group());

        let g = RegisteredGroup::new("j2", "Eng", "team-eng");
        assert!(!g.is_main_group());
    }

    #[test]
    fn explicit_flag_wins_over_folder() {
        let mut g = RegisteredGroup::new("j1", "Ops", "ops");
        g.is_main = Some(true);
        assert!(g.is_main_group());

        let mut g = RegisteredGroup::new("j2", "Odd", "main");
        g.is_main = Some(false);
        assert!(!g.is_main_group());
    }

    #[test]
    fn additional_mount_defaults_to_read_write() {
        let mount: AdditionalMount = serde_json::from_str(
            r#"{"hostPath": "/srv/data", "containerPath": "/mnt/data"}"#,
        )
        .unwrap();
        assert!(!mount.read_only);
    }

    #[test]
    fn registered_group_round_trips() {
        let g = RegisteredGroup::new("j1", "Engineering", "team-eng");
        let json = serde_json::to_string(&g).unwrap();
        assert!(json.contains("\"folder\":\"team-eng\""));
        let back: RegisteredGroup = serde_json::from_str(&json).unwrap();
        assert_eq!(back.jid, "j1");
        assert!(back.container.is_none());
    }
}
