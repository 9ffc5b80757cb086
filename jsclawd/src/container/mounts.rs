//! Volume mount and argv construction for container runs.

use std::collections::BTreeMap;
use std::fs;

use jsclaw_core::container::VolumeMount;
use jsclaw_core::group::RegisteredGroup;
use tracing::warn;

use super::runner::RunnerConfig;
use super::security::validate_mounts;

/// Generate a unique container name for one spawn of a group's agent.
pub fn container_name(group_folder: &str) -> String {
    let safe: String = group_folder
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    format!("jsclaw-{safe}-{now}")
}

/// Build the ordered mount list for a container invocation.
///
/// The group workspace and the three IPC mailboxes come first; additional
/// mounts declared in the group registration follow, but only when the
/// whole set passes allowlist validation.
pub fn build_volume_mounts(group: &RegisteredGroup, config: &RunnerConfig) -> Vec<VolumeMount> {
    let mut mounts = Vec::new();

    let group_dir = config.groups_dir.join(&group.folder);
    fs::create_dir_all(&group_dir).ok();
    mounts.push(VolumeMount {
        host_path: group_dir.to_string_lossy().to_string(),
        container_path: "/workspace/group".to_string(),
        read_only: false,
    });

    let ipc_dir = config.data_dir.join("ipc").join(&group.folder);
    for sub in ["messages", "tasks", "input"] {
        let host = ipc_dir.join(sub);
        fs::create_dir_all(&host).ok();
        mounts.push(VolumeMount {
            host_path: host.to_string_lossy().to_string(),
            container_path: format!("/workspace/ipc/{sub}"),
            read_only: false,
        });
    }

    let additional = group
        .container
        .as_ref()
        .map(|c| c.additional_mounts.as_slice())
        .unwrap_or_default();
    if !additional.is_empty() {
        let is_main = group.is_main_group();
        let validation = validate_mounts(
            additional,
            &group.name,
            is_main,
            config.allowlist_path.as_deref(),
        );
        if validation.valid {
            for m in additional {
                mounts.push(VolumeMount {
                    host_path: m.host_path.clone(),
                    container_path: m.container_path.clone(),
                    read_only: m.read_only,
                });
            }
        } else {
            warn!(
                group = %group.name,
                errors = ?validation.errors,
                "skipping all additional mounts"
            );
        }
    }

    mounts
}

/// Build the runtime CLI argument vector:
/// `run -i --rm --name {name} [-e K=V]... [mounts]... {image}`.
///
/// Read-only mounts use the explicit `--mount` bind form; read-write mounts
/// use `-v`. `ANTHROPIC_API_KEY` is forwarded from the host environment
/// when set.
pub fn build_container_args(
    mounts: &[VolumeMount],
    container_name: &str,
    image: &str,
    env: &BTreeMap<String, String>,
) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-i".to_string(),
        "--rm".to_string(),
        "--name".to_string(),
        container_name.to_string(),
    ];

    for (key, value) in env {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }
    if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
        if !key.is_empty() && !env.contains_key("ANTHROPIC_API_KEY") {
            args.push("-e".to_string());
            args.push(format!("ANTHROPIC_API_KEY={key}"));
        }
    }

    for mount in mounts {
        if mount.read_only {
            args.push("--mount".to_string());
            args.push(format!(
                "type=bind,source={},target={},readonly",
                mount.host_path, mount.container_path
            ));
        } else {
            args.push("-v".to_string());
            args.push(format!("{}:{}", mount.host_path, mount.container_path));
        }
    }

    args.push(image.to_string());
    args
}

#[cfg(test)]
mod tests {
    use jsclaw_core::group::{AdditionalMount, GroupContainerConfig};
    use tempfile::TempDir;

    use super::*;

    fn test_config(tmp: &TempDir) -> RunnerConfig {
        RunnerConfig {
            runtime_bin: "docker".to_string(),
            image: "jsclaw-agent:latest".to_string(),
            groups_dir: tmp.path().join("groups"),
            data_dir: tmp.path().join("data"),
            container_timeout_ms: 300_000,
            max_output_size: 1_048_576,
            env: BTreeMap::new(),
            allowlist_path: None,
        }
    }

    #[test]
    fn container_name_has_prefix_and_sanitizes() {
        let name = container_name("team.eng/special");
        assert!(name.starts_with("jsclaw-team-eng-special-"));
        assert!(!name.contains('.'));
        assert!(!name.contains('/'));
    }

    #[test]
    fn base_mounts_cover_workspace_and_mailboxes() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let group = RegisteredGroup::new("j1", "Group One", "g1");

        let mounts = build_volume_mounts(&group, &config);

        let paths: Vec<&str> = mounts.iter().map(|m| m.container_path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "/workspace/group",
                "/workspace/ipc/messages",
                "/workspace/ipc/tasks",
                "/workspace/ipc/input",
            ]
        );
        assert!(mounts.iter().all(|m| !m.read_only));

        assert!(tmp.path().join("groups/g1").is_dir());
        for sub in ["messages", "tasks", "input"] {
            assert!(tmp.path().join("data/ipc/g1").join(sub).is_dir());
        }
    }

    #[test]
    fn additional_mounts_skipped_without_allowlist() {
        let tmp = TempDir::new().unwrap();
        let extra = tmp.path().join("extra");
        fs::create_dir_all(&extra).unwrap();

        let config = test_config(&tmp);
        let mut group = RegisteredGroup::new("j1", "Group One", "g1");
        group.container = Some(GroupContainerConfig {
            additional_mounts: vec![AdditionalMount {
                host_path: extra.to_string_lossy().to_string(),
                container_path: "/mnt/extra".to_string(),
                read_only: true,
            }],
            timeout_ms: None,
        });

        let mounts = build_volume_mounts(&group, &config);
        assert!(mounts.iter().all(|m| m.container_path != "/mnt/extra"));
    }

    #[test]
    fn additional_mounts_included_when_allowlisted() {
        let tmp = TempDir::new().unwrap();
        let extra = tmp.path().join("extra");
        fs::create_dir_all(&extra).unwrap();
        let allowlist = tmp.path().join("allowlist.json");
        fs::write(
            &allowlist,
            serde_json::to_string(&serde_json::json!({
                "allowed_roots": [tmp.path().to_string_lossy()],
            }))
            .unwrap(),
        )
        .unwrap();

        let mut config = test_config(&tmp);
        config.allowlist_path = Some(allowlist);
        let mut group = RegisteredGroup::new("j1", "Group One", "g1");
        group.container = Some(GroupContainerConfig {
            additional_mounts: vec![AdditionalMount {
                host_path: extra.to_string_lossy().to_string(),
                container_path: "/mnt/extra".to_string(),
                read_only: true,
            }],
            timeout_ms: None,
        });

        let mounts = build_volume_mounts(&group, &config);
        let extra_mount = mounts
            .iter()
            .find(|m| m.container_path == "/mnt/extra")
            .expect("additional mount present");
        assert!(extra_mount.read_only);
    }

    #[test]
    fn args_order_and_mount_forms() {
        let mounts = vec![
            VolumeMount {
                host_path: "/srv/groups/g1".to_string(),
                container_path: "/workspace/group".to_string(),
                read_only: false,
            },
            VolumeMount {
                host_path: "/srv/ref".to_string(),
                container_path: "/mnt/ref".to_string(),
                read_only: true,
            },
        ];
        let mut env = BTreeMap::new();
        env.insert("TZ".to_string(), "UTC".to_string());

        let args = build_container_args(&mounts, "jsclaw-g1-1", "jsclaw-agent:latest", &env);

        assert_eq!(args[0], "run");
        assert_eq!(args[1], "-i");
        assert_eq!(args[2], "--rm");
        assert_eq!(args[3], "--name");
        assert_eq!(args[4], "jsclaw-g1-1");
        assert!(args.contains(&"TZ=UTC".to_string()));
        assert!(args.contains(&"/srv/groups/g1:/workspace/group".to_string()));
        assert!(
            args.contains(&"type=bind,source=/srv/ref,target=/mnt/ref,readonly".to_string())
        );
        assert_eq!(args.last().map(String::as_str), Some("jsclaw-agent:latest"));
    }
}
