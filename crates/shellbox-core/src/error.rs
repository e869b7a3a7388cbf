//! Error taxonomy for sandboxed execution

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while resolving, planning or launching a sandboxed run.
///
/// Configuration-shape errors are returned before anything is launched.
/// Launch-time errors (`EngineLaunch`, `PortBind`) travel inside the
/// execution outcome instead, so callers always receive one result shape.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Unknown sandbox profile '{name}'. Expected one of: {}", crate::profile::SeatbeltProfile::names().join(", "))]
    InvalidProfile { name: String },

    #[error("Sandbox mode '{mode}' is not supported on {platform}")]
    UnsupportedPlatform { mode: String, platform: String },

    #[error("Invalid working directory {}: {reason}", .path.display())]
    InvalidWorkDir { path: PathBuf, reason: String },

    #[error("Invalid sandbox mount '{spec}': {reason}")]
    InvalidMount { spec: String, reason: String },

    #[error("Invalid sandbox configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to launch {engine}: {message}")]
    EngineLaunch { engine: String, message: String },

    #[error("Failed to bind port: {message}")]
    PortBind { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// True for errors detected before any process is launched.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SandboxError::InvalidProfile { .. }
                | SandboxError::UnsupportedPlatform { .. }
                | SandboxError::InvalidWorkDir { .. }
                | SandboxError::InvalidMount { .. }
                | SandboxError::InvalidConfig(_)
        )
    }

    /// Stable machine-readable code, used by the HTTP gateway.
    pub fn code(&self) -> &'static str {
        match self {
            SandboxError::InvalidProfile { .. } => "invalid_profile",
            SandboxError::UnsupportedPlatform { .. } => "unsupported_platform",
            SandboxError::InvalidWorkDir { .. } => "invalid_work_dir",
            SandboxError::InvalidMount { .. } => "invalid_mount",
            SandboxError::InvalidConfig(_) => "invalid_config",
            SandboxError::EngineLaunch { .. } => "engine_launch",
            SandboxError::PortBind { .. } => "port_bind",
            SandboxError::Io(_) => "io",
        }
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
