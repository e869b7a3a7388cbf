//! Configuration: TOML file plus environment overlay, read once at startup
//!
//! Precedence, highest first: per-request config, CLI flags, environment
//! variables, config file, built-in defaults. The result is immutable and
//! shared by reference with every request.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::engine::DEFAULT_MAX_OUTPUT_BYTES;
use crate::error::SandboxError;
use crate::identity::OS_RELEASE_PATH;
use crate::platform::Platform;
use crate::profile::{ContainerEngine, SandboxMode};

pub const ENV_SANDBOX: &str = "SHELLBOX_SANDBOX";
pub const ENV_SANDBOX_IMAGE: &str = "SHELLBOX_SANDBOX_IMAGE";
pub const ENV_SEATBELT_PROFILE: &str = "SEATBELT_PROFILE";
pub const ENV_SET_UID_GID: &str = "SANDBOX_SET_UID_GID";
pub const ENV_PORTS: &str = "SANDBOX_PORTS";
pub const ENV_PROXY_COMMAND: &str = "SHELLBOX_SANDBOX_PROXY_COMMAND";
pub const ENV_MOUNTS: &str = "SANDBOX_MOUNTS";
pub const ENV_SANDBOX_ENV: &str = "SANDBOX_ENV";
pub const ENV_FLAGS: &str = "SANDBOX_FLAGS";

/// Default sandbox image, built locally from the project Dockerfile
pub const DEFAULT_IMAGE: &str = "shellbox-sandbox";

/// Sandbox policy settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    pub mode: SandboxMode,
    pub engine: ContainerEngine,
    pub profile: String,
    pub image: String,
    /// Raw identity override ("1"/"true"/"0"/"false"); unset means auto-detect
    pub set_uid_gid: Option<String>,
    /// Comma-separated host ports to publish
    pub ports: String,
    /// Command run inside the proxy container; enables the egress proxy
    pub proxy_command: Option<String>,
    /// Comma-separated `from[:to[:opts]]` mounts
    pub mounts: String,
    /// Comma-separated `KEY=VALUE` pairs exported into the sandbox
    pub env: String,
    /// Extra whitespace-separated flags passed to the container engine
    pub flags: String,
    pub timeout_secs: u64,
    pub grace_period_ms: u64,
    /// Bytes kept per output stream; the rest is discarded with a marker
    pub max_output_bytes: usize,
    pub os_release_path: PathBuf,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            mode: SandboxMode::Disabled,
            engine: ContainerEngine::Docker,
            profile: "permissive-open".to_string(),
            image: DEFAULT_IMAGE.to_string(),
            set_uid_gid: None,
            ports: String::new(),
            proxy_command: None,
            mounts: String::new(),
            env: String::new(),
            flags: String::new(),
            timeout_secs: 120,
            grace_period_ms: 2000,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            os_release_path: PathBuf::from(OS_RELEASE_PATH),
        }
    }
}

impl SandboxSettings {
    /// Overlay values from an environment lookup.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> std::result::Result<(), SandboxError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_SANDBOX) {
            let (mode, engine) = parse_sandbox_env(&raw, Platform::current())?;
            self.mode = mode;
            if let Some(engine) = engine {
                self.engine = engine;
            }
        }
        if let Some(image) = lookup(ENV_SANDBOX_IMAGE).filter(|v| !v.trim().is_empty()) {
            self.image = image;
        }
        if let Some(profile) = lookup(ENV_SEATBELT_PROFILE).filter(|v| !v.trim().is_empty()) {
            self.profile = profile;
        }
        if let Some(raw) = lookup(ENV_SET_UID_GID) {
            self.set_uid_gid = Some(raw);
        }
        if let Some(ports) = lookup(ENV_PORTS) {
            self.ports = ports;
        }
        if let Some(cmd) = lookup(ENV_PROXY_COMMAND).filter(|v| !v.trim().is_empty()) {
            self.proxy_command = Some(cmd);
        }
        if let Some(mounts) = lookup(ENV_MOUNTS) {
            self.mounts = mounts;
        }
        if let Some(env) = lookup(ENV_SANDBOX_ENV) {
            self.env = env;
        }
        if let Some(flags) = lookup(ENV_FLAGS) {
            self.flags = flags;
        }
        Ok(())
    }

    pub fn proxy_enabled(&self) -> bool {
        self.proxy_command.is_some()
    }

    /// Image or profile name relevant to the configured mode
    pub fn profile_or_image(&self, mode: SandboxMode) -> &str {
        match mode {
            SandboxMode::OsProfile => &self.profile,
            SandboxMode::Container => &self.image,
            SandboxMode::Disabled => "",
        }
    }
}

/// Parse `SHELLBOX_SANDBOX`. `true`/`1` pick the platform's natural mechanism:
/// Seatbelt on macOS, a container elsewhere.
pub fn parse_sandbox_env(
    raw: &str,
    platform: Platform,
) -> std::result::Result<(SandboxMode, Option<ContainerEngine>), SandboxError> {
    let value = raw.trim().to_lowercase();
    match value.as_str() {
        "" | "0" | "false" => Ok((SandboxMode::Disabled, None)),
        "1" | "true" => {
            if platform.supports_os_profile() {
                Ok((SandboxMode::OsProfile, None))
            } else {
                Ok((SandboxMode::Container, None))
            }
        }
        "docker" => Ok((SandboxMode::Container, Some(ContainerEngine::Docker))),
        "podman" => Ok((SandboxMode::Container, Some(ContainerEngine::Podman))),
        other => Ok((other.parse()?, None)),
    }
}

/// HTTP gateway settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    pub addr: String,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:3000".to_string(),
        }
    }
}

/// History store settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistorySettings {
    pub enabled: bool,
    pub path: Option<PathBuf>,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
        }
    }
}

impl HistorySettings {
    pub fn resolved_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| data_dir().join("history.db"))
    }
}

/// Top-level `config.toml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellboxConfig {
    pub sandbox: SandboxSettings,
    pub gateway: GatewaySettings,
    pub history: HistorySettings,
}

impl ShellboxConfig {
    /// Parse a TOML document
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse shellbox config")
    }

    /// Load from `path`, or the default location; a missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::parse(&content)
    }

    /// Load the file and overlay the process environment.
    pub fn load_with_env(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.sandbox.apply_env_with(|key| std::env::var(key).ok())?;
        if let Ok(port) = std::env::var("PORT") {
            let host = config
                .gateway
                .addr
                .rsplit_once(':')
                .map(|(h, _)| h.to_string())
                .unwrap_or_else(|| "127.0.0.1".to_string());
            config.gateway.addr = format!("{}:{}", host, port.trim());
        }
        Ok(config)
    }
}

/// `~/.shellbox`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".shellbox")
}

pub fn default_config_path() -> PathBuf {
    data_dir().join("config.toml")
}
