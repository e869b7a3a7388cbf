//! Profile resolver: picks the isolation mechanism for a request
//!
//! Resolution is deterministic: the requested mode is either honoured or
//! rejected, never silently swapped for another mechanism.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::debug;

use crate::error::{Result, SandboxError};
use crate::platform::Platform;

/// Isolation mechanism requested for one execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxMode {
    #[default]
    Disabled,
    OsProfile,
    Container,
}

impl SandboxMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SandboxMode::Disabled => "disabled",
            SandboxMode::OsProfile => "os-profile",
            SandboxMode::Container => "container",
        }
    }
}

impl std::fmt::Display for SandboxMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SandboxMode {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "disabled" | "none" | "off" => Ok(SandboxMode::Disabled),
            "os-profile" | "seatbelt" | "sandbox-exec" => Ok(SandboxMode::OsProfile),
            "container" | "docker" | "podman" => Ok(SandboxMode::Container),
            other => Err(SandboxError::InvalidConfig(format!(
                "unknown sandbox mode '{}'",
                other
            ))),
        }
    }
}

/// Container engine binary used for the container mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerEngine {
    #[default]
    Docker,
    Podman,
}

impl ContainerEngine {
    pub fn binary(self) -> &'static str {
        match self {
            ContainerEngine::Docker => "docker",
            ContainerEngine::Podman => "podman",
        }
    }
}

impl FromStr for ContainerEngine {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "docker" => Ok(ContainerEngine::Docker),
            "podman" => Ok(ContainerEngine::Podman),
            other => Err(SandboxError::InvalidConfig(format!(
                "unknown container engine '{}'",
                other
            ))),
        }
    }
}

/// Built-in Seatbelt profiles: file-system posture × network posture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeatbeltProfile {
    PermissiveOpen,
    PermissiveClosed,
    PermissiveProxied,
    RestrictiveOpen,
    RestrictiveClosed,
    RestrictiveProxied,
}

/// Port the egress proxy listens on, both for Seatbelt and containers.
pub const PROXY_PORT: u16 = 8877;

const ALL_PROFILES: [SeatbeltProfile; 6] = [
    SeatbeltProfile::PermissiveOpen,
    SeatbeltProfile::PermissiveClosed,
    SeatbeltProfile::PermissiveProxied,
    SeatbeltProfile::RestrictiveOpen,
    SeatbeltProfile::RestrictiveClosed,
    SeatbeltProfile::RestrictiveProxied,
];

impl SeatbeltProfile {
    pub fn names() -> Vec<&'static str> {
        ALL_PROFILES.iter().map(|p| p.name()).collect()
    }

    pub fn name(self) -> &'static str {
        match self {
            SeatbeltProfile::PermissiveOpen => "permissive-open",
            SeatbeltProfile::PermissiveClosed => "permissive-closed",
            SeatbeltProfile::PermissiveProxied => "permissive-proxied",
            SeatbeltProfile::RestrictiveOpen => "restrictive-open",
            SeatbeltProfile::RestrictiveClosed => "restrictive-closed",
            SeatbeltProfile::RestrictiveProxied => "restrictive-proxied",
        }
    }

    pub fn is_restrictive(self) -> bool {
        matches!(
            self,
            SeatbeltProfile::RestrictiveOpen
                | SeatbeltProfile::RestrictiveClosed
                | SeatbeltProfile::RestrictiveProxied
        )
    }

    pub fn network(self) -> NetworkPosture {
        match self {
            SeatbeltProfile::PermissiveOpen | SeatbeltProfile::RestrictiveOpen => {
                NetworkPosture::Open
            }
            SeatbeltProfile::PermissiveClosed | SeatbeltProfile::RestrictiveClosed => {
                NetworkPosture::Closed
            }
            SeatbeltProfile::PermissiveProxied | SeatbeltProfile::RestrictiveProxied => {
                NetworkPosture::Proxied
            }
        }
    }

    /// Render the profile as SBPL for `sandbox-exec -p`.
    ///
    /// Writable locations come from the `TARGET_DIR`, `TMP_DIR`, `CACHE_DIR`
    /// and `HOME_DIR` parameters supplied with `-D` at launch.
    pub fn render(self) -> String {
        let mut sbpl = String::from("(version 1)\n");

        if self.is_restrictive() {
            sbpl.push_str(
                "(deny default)\n\
                 (allow process-exec)\n\
                 (allow process-fork)\n\
                 (allow signal (target same-sandbox))\n\
                 (allow sysctl-read)\n\
                 (allow file-read*)\n\
                 (allow mach-lookup)\n\
                 (allow ipc-posix-shm)\n\
                 (allow file-ioctl (literal \"/dev/tty\"))\n",
            );
        } else {
            sbpl.push_str("(allow default)\n(deny file-write*)\n");
        }

        sbpl.push_str(
            "(allow file-write*\n\
             \x20   (subpath (param \"TARGET_DIR\"))\n\
             \x20   (subpath (param \"TMP_DIR\"))\n\
             \x20   (subpath (param \"CACHE_DIR\"))\n\
             \x20   (subpath (string-append (param \"HOME_DIR\") \"/.cache\"))\n\
             \x20   (literal \"/dev/stdout\")\n\
             \x20   (literal \"/dev/stderr\")\n\
             \x20   (literal \"/dev/null\")\n\
             \x20   (literal \"/dev/tty\"))\n",
        );

        match self.network() {
            NetworkPosture::Open => {
                if self.is_restrictive() {
                    sbpl.push_str("(allow network-outbound)\n(allow network-inbound)\n(allow network-bind)\n");
                }
            }
            NetworkPosture::Closed => {
                sbpl.push_str("(deny network*)\n");
            }
            NetworkPosture::Proxied => {
                sbpl.push_str(&format!(
                    "(deny network*)\n(allow network-outbound (remote tcp \"localhost:{}\"))\n",
                    PROXY_PORT
                ));
            }
        }

        sbpl
    }
}

impl FromStr for SeatbeltProfile {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self> {
        ALL_PROFILES
            .iter()
            .copied()
            .find(|p| p.name() == s.trim())
            .ok_or_else(|| SandboxError::InvalidProfile {
                name: s.to_string(),
            })
    }
}

/// Network stance encoded in a Seatbelt profile name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkPosture {
    Open,
    Closed,
    Proxied,
}

/// Container image reference `{repository, tag, digest}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub repository: String,
    pub tag: Option<String>,
    /// `sha256:...` when the image is pinned with `@digest`
    pub digest: Option<String>,
}

impl ImageRef {
    /// Split `repo[:tag][@digest]`. A `:` inside a registry host
    /// (`host:5000/img`) stays part of the repository.
    pub fn parse(image: &str) -> Result<Self> {
        let image = image.trim();
        if image.is_empty() {
            return Err(SandboxError::InvalidConfig(
                "sandbox image must not be empty".to_string(),
            ));
        }

        let (image, digest) = match image.split_once('@') {
            Some((name, digest)) => (name, (!digest.is_empty()).then(|| digest.to_string())),
            None => (image, None),
        };
        if image.is_empty() {
            return Err(SandboxError::InvalidConfig(format!(
                "sandbox image has a digest but no repository: @{}",
                digest.unwrap_or_default()
            )));
        }

        let last_slash = image.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (repository, tag) = match image[last_slash..].rfind(':') {
            Some(idx) => {
                let split = last_slash + idx;
                let tag = &image[split + 1..];
                (&image[..split], (!tag.is_empty()).then(|| tag.to_string()))
            }
            None => (image, None),
        };
        Ok(Self {
            repository: repository.to_string(),
            tag,
            digest,
        })
    }

    /// Human-readable name usable as a container name: last path segment
    /// of the repository, plus `-tag` when tagged (or a short digest when
    /// only pinned). Anything outside `[A-Za-z0-9_.-]` becomes `-`.
    pub fn display_name(&self) -> String {
        let name = self
            .repository
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("unknown-image");
        let suffix = match (&self.tag, &self.digest) {
            (Some(tag), _) => Some(tag.as_str()),
            (None, Some(digest)) => {
                let hex = digest.rsplit(':').next().unwrap_or(digest);
                Some(&hex[..hex.len().min(12)])
            }
            (None, None) => None,
        };
        let raw = match suffix {
            Some(suffix) => format!("{}-{}", name, suffix),
            None => name.to_string(),
        };
        raw.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                    c
                } else {
                    '-'
                }
            })
            .collect()
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

/// Resolved mechanism for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Isolation {
    Unconstrained,
    OsProfile(SeatbeltProfile),
    Container {
        engine: ContainerEngine,
        image: ImageRef,
    },
}

impl Isolation {
    pub fn mode(&self) -> SandboxMode {
        match self {
            Isolation::Unconstrained => SandboxMode::Disabled,
            Isolation::OsProfile(_) => SandboxMode::OsProfile,
            Isolation::Container { .. } => SandboxMode::Container,
        }
    }

    /// Value of the `SANDBOX` marker exported into the sandbox
    pub fn marker(&self) -> &'static str {
        match self {
            Isolation::Unconstrained => "none",
            Isolation::OsProfile(_) => "sandbox-exec",
            Isolation::Container { engine, .. } => engine.binary(),
        }
    }
}

/// Resolve the requested mode against the host.
///
/// `profile_or_image` is the Seatbelt profile name for `OsProfile`, the image
/// reference for `Container`, and ignored for `Disabled`.
pub fn resolve(
    mode: SandboxMode,
    profile_or_image: &str,
    engine: ContainerEngine,
    platform: Platform,
) -> Result<Isolation> {
    let isolation = match mode {
        SandboxMode::Disabled => Isolation::Unconstrained,
        SandboxMode::OsProfile => {
            let profile: SeatbeltProfile = profile_or_image.parse()?;
            if !platform.supports_os_profile() {
                return Err(SandboxError::UnsupportedPlatform {
                    mode: mode.to_string(),
                    platform: platform.to_string(),
                });
            }
            Isolation::OsProfile(profile)
        }
        SandboxMode::Container => Isolation::Container {
            engine,
            image: ImageRef::parse(profile_or_image)?,
        },
    };
    debug!("Sandbox: resolved {} -> {:?}", mode, isolation);
    Ok(isolation)
}
