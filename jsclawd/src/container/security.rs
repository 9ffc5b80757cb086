//! Mount security: validates user-declared bind mounts against an external
//! allowlist file.
//!
//! The allowlist lives outside any container-writable path so agents cannot
//! loosen their own policy. With no allowlist configured, every additional
//! mount is blocked.

use std::path::{Path, PathBuf};

use jsclaw_core::group::AdditionalMount;
use serde::Deserialize;
use tracing::warn;

/// Substrings that are always blocked in resolved host paths, regardless of
/// allowlist contents. Covers common credential and agent locations.
const DEFAULT_BLOCKED_PATTERNS: &[&str] = &[
    ".ssh",
    ".gnupg",
    ".gpg",
    ".aws",
    ".azure",
    ".gcloud",
    ".kube",
    ".docker",
    ".env",
    "private_key",
    "id_rsa",
    "id_ed25519",
    "credentials",
    "secrets",
    ".npmrc",
    ".pypirc",
];

/// On-disk allowlist format: `{"allowed_roots": [...], "blocked_patterns": [...]}`.
#[derive(Debug, Clone, Deserialize)]
struct MountAllowlist {
    allowed_roots: Vec<String>,
    #[serde(default)]
    blocked_patterns: Vec<String>,
}

/// Outcome of validating a set of mounts. Never an error: rejection reasons
/// come back as values.
#[derive(Debug)]
pub struct MountValidation {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl MountValidation {
    fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }

    fn rejected(errors: Vec<String>) -> Self {
        Self {
            valid: false,
            errors,
        }
    }
}

/// Validate a group's additional mounts against the allowlist at
/// `allowlist_path`.
///
/// `is_main` is accepted but does not currently change the policy; it is
/// reserved for differential rules.
pub fn validate_mounts(
    mounts: &[AdditionalMount],
    group_name: &str,
    is_main: bool,
    allowlist_path: Option<&Path>,
) -> MountValidation {
    let _ = is_main;

    if mounts.is_empty() {
        return MountValidation::ok();
    }

    let path = match allowlist_path {
        Some(p) => p,
        None => {
            return MountValidation::rejected(vec![format!(
                "Group \"{group_name}\" requests {} additional mount(s) but no mount allowlist is configured; all additional mounts are blocked",
                mounts.len()
            )]);
        }
    };

    let allowlist = match load_allowlist(path) {
        Ok(a) => a,
        Err(reason) => return MountValidation::rejected(vec![reason]),
    };

    let resolved_roots: Vec<PathBuf> = allowlist
        .allowed_roots
        .iter()
        .map(|root| {
            let p = PathBuf::from(root);
            std::fs::canonicalize(&p).unwrap_or(p)
        })
        .collect();

    let mut errors = Vec::new();
    for mount in mounts {
        if let Err(reason) = check_mount(mount, &allowlist, &resolved_roots) {
            warn!(
                group = group_name,
                host_path = %mount.host_path,
                reason = %reason,
                "additional mount rejected"
            );
            errors.push(reason);
        }
    }

    if errors.is_empty() {
        MountValidation::ok()
    } else {
        MountValidation::rejected(errors)
    }
}

fn load_allowlist(path: &Path) -> Result<MountAllowlist, String> {
    let content = std::fs::read_to_string(path).map_err(|err| {
        format!(
            "Failed to read mount allowlist {}: {err}; all additional mounts are blocked",
            path.display()
        )
    })?;

    serde_json::from_str(&content).map_err(|err| {
        format!(
            "Invalid mount allowlist {}: {err}; all additional mounts are blocked",
            path.display()
        )
    })
}

fn check_mount(
    mount: &AdditionalMount,
    allowlist: &MountAllowlist,
    resolved_roots: &[PathBuf],
) -> Result<(), String> {
    if !mount.container_path.starts_with('/') || mount.container_path.contains("..") {
        return Err(format!(
            "Invalid container path \"{}\": must be absolute and must not contain \"..\"",
            mount.container_path
        ));
    }

    let real = std::fs::canonicalize(&mount.host_path).map_err(|_| {
        format!("Host path does not exist: \"{}\"", mount.host_path)
    })?;

    let lowered = real.to_string_lossy().to_lowercase();
    for pattern in DEFAULT_BLOCKED_PATTERNS
        .iter()
        .copied()
        .chain(allowlist.blocked_patterns.iter().map(String::as_str))
    {
        if lowered.contains(&pattern.to_lowercase()) {
            return Err(format!(
                "Path \"{}\" matches blocked pattern \"{pattern}\"",
                real.display()
            ));
        }
    }

    let allowed = resolved_roots
        .iter()
        .any(|root| real == *root || real.starts_with(root));
    if !allowed {
        let roots: Vec<String> = resolved_roots
            .iter()
            .map(|r| r.display().to_string())
            .collect();
        return Err(format!(
            "Path \"{}\" is not under any allowed root. Allowed roots: {}",
            real.display(),
            roots.join(", ")
        ));
    }

    Ok(())
}
