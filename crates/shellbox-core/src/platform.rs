//! Host platform identity and host → sandbox path translation

use serde::{Deserialize, Serialize};
use std::path::Path;

/// OS family of the host running the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    MacOs,
    Windows,
    Other,
}

impl Platform {
    /// Platform this binary was compiled for
    pub fn current() -> Self {
        if cfg!(target_os = "linux") {
            Platform::Linux
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else if cfg!(target_os = "windows") {
            Platform::Windows
        } else {
            Platform::Other
        }
    }

    pub fn is_unix(self) -> bool {
        matches!(self, Platform::Linux | Platform::MacOs)
    }

    /// Only macOS ships the Seatbelt `sandbox-exec` facility.
    pub fn supports_os_profile(self) -> bool {
        self == Platform::MacOs
    }

    /// Hosts whose paths use drive-letter notation.
    pub fn uses_drive_letters(self) -> bool {
        self == Platform::Windows
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Platform::Linux => write!(f, "linux"),
            Platform::MacOs => write!(f, "macos"),
            Platform::Windows => write!(f, "windows"),
            Platform::Other => write!(f, "other"),
        }
    }
}

/// Map a host path to the path seen inside the isolation boundary.
///
/// Identity on POSIX hosts. On drive-letter hosts `D:\x\y` (or `d:/x/y`)
/// becomes `/d/x/y`; anything else passes through unchanged.
pub fn container_path(host_path: &str, platform: Platform) -> String {
    if !platform.uses_drive_letters() {
        return host_path.to_string();
    }

    let bytes = host_path.as_bytes();
    let is_drive = bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'\\' || bytes[2] == b'/');
    if !is_drive {
        return host_path.to_string();
    }

    let drive = (bytes[0] as char).to_ascii_lowercase();
    let rest = host_path[3..].replace('\\', "/");
    format!("/{}/{}", drive, rest)
}

/// Same as [`container_path`] for a `Path`.
pub fn container_path_of(host_path: &Path, platform: Platform) -> String {
    container_path(&host_path.to_string_lossy(), platform)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_posix_paths_are_identity() {
        assert_eq!(container_path("/home/me/proj", Platform::Linux), "/home/me/proj");
        assert_eq!(container_path("C:\\Users\\me", Platform::MacOs), "C:\\Users\\me");
    }

    #[test]
    fn test_drive_letter_backslashes() {
        assert_eq!(
            container_path("D:\\work\\proj", Platform::Windows),
            "/d/work/proj"
        );
    }

    #[test]
    fn test_drive_letter_forward_slashes_and_case() {
        assert_eq!(container_path("c:/Users/Me", Platform::Windows), "/c/Users/Me");
        assert_eq!(container_path("Z:\\", Platform::Windows), "/z/");
    }

    #[test]
    fn test_non_drive_paths_pass_through() {
        assert_eq!(
            container_path("\\\\server\\share", Platform::Windows),
            "\\\\server\\share"
        );
        assert_eq!(container_path("relative\\dir", Platform::Windows), "relative\\dir");
        assert_eq!(container_path("C:", Platform::Windows), "C:");
        assert_eq!(container_path("1:\\x", Platform::Windows), "1:\\x");
    }

    #[test]
    fn test_translation_never_leaves_backslashes_for_drive_paths() {
        for p in ["A:\\a\\b\\c", "q:/x\\y/z", "M:\\"] {
            let out = container_path(p, Platform::Windows);
            assert!(out.starts_with('/'));
            assert!(!out.contains('\\'));
            let drive = p.chars().next().unwrap().to_ascii_lowercase();
            assert_eq!(out.chars().nth(1), Some(drive));
        }
    }

    #[test]
    fn test_platform_capabilities() {
        assert!(Platform::MacOs.supports_os_profile());
        assert!(!Platform::Linux.supports_os_profile());
        assert!(Platform::Linux.is_unix());
        assert!(!Platform::Windows.is_unix());
        assert_eq!(Platform::MacOs.to_string(), "macos");
    }
}
