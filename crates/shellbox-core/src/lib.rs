//! shellbox-core: sandboxed shell command execution
//!
//! Resolves an isolation mechanism for each request (none, a macOS Seatbelt
//! profile, or a Docker/Podman container), plans identity, network and
//! environment, runs the command with a timeout and guaranteed teardown, and
//! maps the outcome to a uniform result.

pub mod config;
pub mod doctor;
pub mod engine;
pub mod environment;
pub mod error;
pub mod identity;
pub mod network;
pub mod platform;
pub mod profile;
pub mod result;
pub mod service;
pub mod tools;

pub use config::{SandboxSettings, ShellboxConfig};
pub use engine::{ExecutionOutcome, Executor, RunState};
pub use error::SandboxError;
pub use platform::Platform;
pub use profile::{ContainerEngine, SandboxMode};
pub use result::ExecutionResult;
pub use service::{ExecutionRequest, ExecutionService, RequestConfig};
pub use tools::{ShellTool, ToolExecutor, ToolRegistry};
