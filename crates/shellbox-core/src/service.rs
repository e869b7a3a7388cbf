//! Execution service: the single entry point for running a command
//!
//! Wires resolver, identity policy, network planner, environment builder,
//! engine and result mapper together for one request.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{SandboxSettings, parse_sandbox_env};
use crate::engine::{ExecutionOutcome, Executor};
use crate::environment::{self, ExecutionPlan, PlanRequest};
use crate::error::Result;
use crate::identity::{self, IdentityMapping};
use crate::network;
use crate::platform::Platform;
use crate::profile::{self, SandboxMode};
use crate::result::{self, ExecutionResult};

/// Inbound execution request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub command: String,
    #[serde(default)]
    pub description: String,
    /// Working directory; empty means the process's current directory
    #[serde(default)]
    pub directory: String,
    #[serde(default)]
    pub config: RequestConfig,
}

impl ExecutionRequest {
    pub fn new(command: impl Into<String>, directory: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            directory: directory.into(),
            ..Self::default()
        }
    }
}

/// Per-request overrides; unset fields fall back to the service settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RequestConfig {
    /// Same vocabulary as `SHELLBOX_SANDBOX`
    pub sandbox: Option<String>,
    pub profile: Option<String>,
    pub image: Option<String>,
    pub timeout_secs: Option<u64>,
}

/// Runs requests against an immutable set of sandbox settings
#[derive(Debug, Clone)]
pub struct ExecutionService {
    settings: Arc<SandboxSettings>,
    platform: Platform,
    executor: Executor,
}

impl ExecutionService {
    pub fn new(settings: Arc<SandboxSettings>, platform: Platform) -> Self {
        let executor = Executor::new(Duration::from_millis(settings.grace_period_ms))
            .with_output_limit(settings.max_output_bytes);
        Self {
            settings,
            platform,
            executor,
        }
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    /// Resolve and validate a request without launching anything.
    pub fn plan(&self, request: &ExecutionRequest) -> Result<(ExecutionPlan, Duration)> {
        let overrides = &request.config;
        let settings = &self.settings;

        let (mode, engine) = match overrides.sandbox.as_deref() {
            Some(raw) => {
                let (mode, engine) = parse_sandbox_env(raw, self.platform)?;
                (mode, engine.unwrap_or(settings.engine))
            }
            None => (settings.mode, settings.engine),
        };

        let profile_or_image = match mode {
            SandboxMode::OsProfile => overrides.profile.as_deref().unwrap_or(&settings.profile),
            SandboxMode::Container => overrides.image.as_deref().unwrap_or(&settings.image),
            SandboxMode::Disabled => "",
        };
        let isolation = profile::resolve(mode, profile_or_image, engine, self.platform)?;

        let identity = if mode == SandboxMode::Container {
            let probe = identity::decide(
                settings.set_uid_gid.as_deref(),
                self.platform,
                &settings.os_release_path,
            );
            identity::log_note(&probe);
            probe.value
        } else {
            IdentityMapping::disabled()
        };

        let display_name = match &isolation {
            profile::Isolation::Container { image, .. } => image.display_name(),
            _ => String::new(),
        };
        let network = network::plan(mode, &settings.ports, settings.proxy_enabled(), &display_name);

        let work_dir = if request.directory.trim().is_empty() {
            PathBuf::from(".")
        } else {
            PathBuf::from(request.directory.trim())
        };

        let plan = environment::build(PlanRequest {
            isolation,
            identity,
            network,
            work_dir: &work_dir,
            command: &request.command,
            description: &request.description,
            settings,
            platform: self.platform,
        })?;

        let timeout = Duration::from_secs(overrides.timeout_secs.unwrap_or(settings.timeout_secs));
        Ok((plan, timeout))
    }

    /// Run a request to completion and return the raw outcome.
    ///
    /// Configuration errors are returned before anything is launched; launch
    /// and runtime failures are carried inside the outcome.
    pub async fn run(
        &self,
        request: &ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome> {
        let (plan, timeout) = self.plan(request)?;
        info!(
            "Sandbox: executing '{}' ({}, timeout {:?})",
            if plan.description().is_empty() { plan.command() } else { plan.description() },
            plan.isolation().mode(),
            timeout
        );
        let outcome = self.executor.run(plan, timeout, cancel).await;
        debug!("Sandbox: outcome {:?}", outcome.state);
        Ok(outcome)
    }

    /// Run a request and map the outcome to the caller-facing result.
    pub async fn execute(
        &self,
        request: &ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult> {
        let outcome = self.run(request, cancel).await?;
        Ok(result::map(&outcome))
    }
}
