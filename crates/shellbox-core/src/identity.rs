//! Identity policy: should the container run as the invoking user?
//!
//! Rootful Docker without userns-remap writes root-owned files into bind
//! mounts; Debian/Ubuntu hosts default to mapping the caller's UID/GID.

use regex::Regex;
use std::path::Path;
use tracing::{info, warn};

use crate::platform::Platform;

/// Well-known distribution descriptor on Linux hosts
pub const OS_RELEASE_PATH: &str = "/etc/os-release";

/// User/group mapping applied to the sandboxed process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityMapping {
    pub enabled: bool,
    pub uid: u32,
    pub gid: u32,
}

impl IdentityMapping {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            uid: 0,
            gid: 0,
        }
    }

    pub fn current_user() -> Self {
        let (uid, gid) = current_ids();
        Self {
            enabled: true,
            uid,
            gid,
        }
    }

    /// `uid:gid` for `--user`, when enabled
    pub fn user_arg(&self) -> Option<String> {
        self.enabled.then(|| format!("{}:{}", self.uid, self.gid))
    }
}

/// A best-effort value plus an optional non-fatal diagnostic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe<T> {
    pub value: T,
    pub note: Option<String>,
}

impl<T> Probe<T> {
    pub fn clean(value: T) -> Self {
        Self { value, note: None }
    }

    pub fn noted(value: T, note: impl Into<String>) -> Self {
        Self {
            value,
            note: Some(note.into()),
        }
    }
}

/// Parse the explicit override; `None` when absent or not recognisable.
pub fn parse_override(raw: Option<&str>) -> Option<bool> {
    match raw.map(|v| v.trim().to_lowercase()).as_deref() {
        Some("1") | Some("true") => Some(true),
        Some("0") | Some("false") => Some(false),
        _ => None,
    }
}

/// True when an os-release body identifies a Debian/Ubuntu-family system.
pub fn is_debian_family(os_release: &str) -> bool {
    let patterns = [
        r#"(?m)^ID="?(debian|ubuntu)"?\s*$"#,
        r"(?m)^ID_LIKE=.*\b(debian|ubuntu)\b",
    ];
    patterns.iter().any(|pattern| {
        Regex::new(pattern)
            .map(|re| re.is_match(os_release))
            .unwrap_or(false)
    })
}

/// Probe the distribution descriptor. An unreadable or empty file is the same
/// non-fatal "not Debian" outcome, with a note for the caller to log.
pub fn detect_debian_family(os_release_path: &Path) -> Probe<bool> {
    match std::fs::read_to_string(os_release_path) {
        Ok(content) if !content.trim().is_empty() => Probe::clean(is_debian_family(&content)),
        Ok(_) | Err(_) => Probe::noted(
            false,
            format!(
                "Could not read {} to auto-detect Debian/Ubuntu; defaulting to no UID/GID mapping",
                os_release_path.display()
            ),
        ),
    }
}

/// Decide the identity mapping. First match wins:
/// explicit truthy override, explicit falsy override, Debian/Ubuntu host,
/// otherwise disabled.
pub fn decide(
    override_raw: Option<&str>,
    platform: Platform,
    os_release_path: &Path,
) -> Probe<IdentityMapping> {
    match parse_override(override_raw) {
        Some(true) => return Probe::clean(IdentityMapping::current_user()),
        Some(false) => return Probe::clean(IdentityMapping::disabled()),
        None => {}
    }

    if platform.is_unix() {
        let probe = detect_debian_family(os_release_path);
        if probe.value {
            return Probe::noted(
                IdentityMapping::current_user(),
                "Defaulting to current user UID/GID for Debian/Ubuntu-based Linux",
            );
        }
        if let Some(note) = probe.note {
            return Probe::noted(IdentityMapping::disabled(), note);
        }
    }

    Probe::clean(IdentityMapping::disabled())
}

/// Log a probe diagnostic without treating it as an error.
pub fn log_note<T>(probe: &Probe<T>) {
    if let Some(note) = &probe.note {
        if note.starts_with("Could not") {
            warn!("Sandbox: {}", note);
        } else {
            info!("Sandbox: {}", note);
        }
    }
}

#[cfg(unix)]
fn current_ids() -> (u32, u32) {
    (
        nix::unistd::getuid().as_raw(),
        nix::unistd::getgid().as_raw(),
    )
}

#[cfg(not(unix))]
fn current_ids() -> (u32, u32) {
    (1000, 1000)
}
