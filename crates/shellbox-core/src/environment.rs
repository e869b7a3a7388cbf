//! Environment builder: assembles the immutable execution plan

use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::SandboxSettings;
use crate::error::{Result, SandboxError};
use crate::identity::IdentityMapping;
use crate::network::NetworkPlan;
use crate::platform::{Platform, container_path, container_path_of};
use crate::profile::Isolation;

/// Bind mount from the host into a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host_path: PathBuf,
    pub container_path: String,
    pub options: String,
}

impl Mount {
    /// `--volume` value
    pub fn volume_arg(&self) -> String {
        format!(
            "{}:{}:{}",
            self.host_path.display(),
            self.container_path,
            self.options
        )
    }
}

/// Everything needed to run one command in isolation. Built once per request
/// and consumed by value by the execution engine.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub(crate) isolation: Isolation,
    pub(crate) identity: IdentityMapping,
    pub(crate) network: NetworkPlan,
    pub(crate) host_work_dir: PathBuf,
    pub(crate) work_dir: String,
    pub(crate) mounts: Vec<Mount>,
    pub(crate) env: Vec<(String, String)>,
    pub(crate) engine_flags: Vec<String>,
    pub(crate) proxy_command: Option<String>,
    pub(crate) command: String,
    pub(crate) description: String,
}

impl ExecutionPlan {
    pub fn isolation(&self) -> &Isolation {
        &self.isolation
    }

    pub fn identity(&self) -> &IdentityMapping {
        &self.identity
    }

    pub fn network(&self) -> &NetworkPlan {
        &self.network
    }

    /// Working directory on the host
    pub fn host_work_dir(&self) -> &Path {
        &self.host_work_dir
    }

    /// Working directory as seen inside the sandbox
    pub fn work_dir(&self) -> &str {
        &self.work_dir
    }

    pub fn mounts(&self) -> &[Mount] {
        &self.mounts
    }

    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

/// Inputs gathered by the resolver, identity policy and network planner
pub struct PlanRequest<'a> {
    pub isolation: Isolation,
    pub identity: IdentityMapping,
    pub network: NetworkPlan,
    pub work_dir: &'a Path,
    pub command: &'a str,
    pub description: &'a str,
    pub settings: &'a SandboxSettings,
    pub platform: Platform,
}

/// Validate and aggregate a plan.
pub fn build(req: PlanRequest<'_>) -> Result<ExecutionPlan> {
    if req.command.trim().is_empty() {
        return Err(SandboxError::InvalidConfig(
            "command must not be empty".to_string(),
        ));
    }

    let host_work_dir = validate_work_dir(req.work_dir)?;
    let is_container = matches!(req.isolation, Isolation::Container { .. });

    // Only containers see translated paths; other mechanisms run on the host.
    let work_dir = if is_container {
        container_path_of(&host_work_dir, req.platform)
    } else {
        host_work_dir.to_string_lossy().into_owned()
    };

    let mounts = if is_container {
        parse_mounts(&req.settings.mounts, req.platform)?
    } else {
        Vec::new()
    };

    let mut env = vec![("SANDBOX".to_string(), req.isolation.marker().to_string())];
    env.extend(parse_env_pairs(&req.settings.env)?);
    if let Some(url) = req.network.proxy_url() {
        for key in ["HTTPS_PROXY", "https_proxy", "HTTP_PROXY", "http_proxy"] {
            env.push((key.to_string(), url.clone()));
        }
    }

    let engine_flags = if is_container {
        req.settings
            .flags
            .split_whitespace()
            .map(str::to_string)
            .collect()
    } else {
        Vec::new()
    };

    let plan = ExecutionPlan {
        isolation: req.isolation,
        identity: if is_container {
            req.identity
        } else {
            IdentityMapping::disabled()
        },
        network: req.network,
        host_work_dir,
        work_dir,
        mounts,
        env,
        engine_flags,
        proxy_command: if is_container {
            req.settings.proxy_command.clone()
        } else {
            None
        },
        command: req.command.to_string(),
        description: req.description.to_string(),
    };
    debug!(
        "Sandbox: plan ready ({} in {}, {} mounts)",
        plan.isolation.mode(),
        plan.work_dir,
        plan.mounts.len()
    );
    Ok(plan)
}

fn validate_work_dir(dir: &Path) -> Result<PathBuf> {
    let absolute = std::path::absolute(dir).map_err(|e| SandboxError::InvalidWorkDir {
        path: dir.to_path_buf(),
        reason: e.to_string(),
    })?;
    match std::fs::metadata(&absolute) {
        Ok(meta) if meta.is_dir() => Ok(absolute),
        Ok(_) => Err(SandboxError::InvalidWorkDir {
            path: absolute,
            reason: "not a directory".to_string(),
        }),
        Err(e) => Err(SandboxError::InvalidWorkDir {
            path: absolute,
            reason: e.to_string(),
        }),
    }
}

/// Parse `from[:to[:opts]]` entries. On drive-letter hosts the `C:` prefix of
/// `from` is not a separator.
pub fn parse_mounts(raw: &str, platform: Platform) -> Result<Vec<Mount>> {
    let mut mounts = Vec::new();
    for spec in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (drive, rest) = if platform.uses_drive_letters()
            && spec.len() >= 2
            && spec.as_bytes()[0].is_ascii_alphabetic()
            && spec.as_bytes()[1] == b':'
        {
            spec.split_at(2)
        } else {
            ("", spec)
        };

        let mut parts = rest.splitn(3, ':');
        let from = format!("{}{}", drive, parts.next().unwrap_or_default());
        let to = parts.next().filter(|s| !s.is_empty());
        let opts = parts.next().filter(|s| !s.is_empty()).unwrap_or("ro");

        let host_path = PathBuf::from(&from);
        if !host_path.is_absolute() {
            return Err(SandboxError::InvalidMount {
                spec: spec.to_string(),
                reason: "host path must be absolute".to_string(),
            });
        }
        if !host_path.exists() {
            return Err(SandboxError::InvalidMount {
                spec: spec.to_string(),
                reason: "host path does not exist".to_string(),
            });
        }

        mounts.push(Mount {
            container_path: to
                .map(str::to_string)
                .unwrap_or_else(|| container_path(&from, platform)),
            host_path,
            options: opts.to_string(),
        });
    }
    Ok(mounts)
}

/// Parse comma-separated `KEY=VALUE` pairs
pub fn parse_env_pairs(raw: &str) -> Result<Vec<(String, String)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok((key.trim().to_string(), value.trim().to_string()))
            }
            _ => Err(SandboxError::InvalidConfig(format!(
                "SANDBOX_ENV entry '{}' must be KEY=VALUE",
                pair
            ))),
        })
        .collect()
}
