//! macOS Seatbelt backend (`sandbox-exec -p <profile>`)

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::ExitStatus;
use tokio::process::Command;

use super::Backend;
use crate::environment::ExecutionPlan;
use crate::error::SandboxError;
use crate::profile::{NetworkPosture, PROXY_PORT, SeatbeltProfile};

const SANDBOX_EXEC: &str = "sandbox-exec";

pub struct SeatbeltBackend {
    profile: SeatbeltProfile,
}

impl SeatbeltBackend {
    pub fn new(profile: SeatbeltProfile) -> Self {
        Self { profile }
    }

    /// `-D` parameters referenced by the rendered profile
    fn params(&self, plan: &ExecutionPlan) -> Vec<(&'static str, String)> {
        let canonical = |p: PathBuf| {
            std::fs::canonicalize(&p)
                .unwrap_or(p)
                .to_string_lossy()
                .into_owned()
        };
        let home = dirs::home_dir().unwrap_or_else(std::env::temp_dir);
        let cache = dirs::cache_dir().unwrap_or_else(|| home.join(".cache"));
        vec![
            ("TARGET_DIR", canonical(plan.host_work_dir().to_path_buf())),
            ("TMP_DIR", canonical(std::env::temp_dir())),
            ("HOME_DIR", canonical(home)),
            ("CACHE_DIR", canonical(cache)),
        ]
    }

    fn args(&self, plan: &ExecutionPlan) -> Vec<String> {
        let mut args = vec!["-p".to_string(), self.profile.render()];
        for (key, value) in self.params(plan) {
            args.push("-D".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.extend([
            "sh".to_string(),
            "-c".to_string(),
            plan.command().to_string(),
        ]);
        args
    }
}

#[async_trait]
impl Backend for SeatbeltBackend {
    fn name(&self) -> &'static str {
        SANDBOX_EXEC
    }

    fn command(&self, plan: &ExecutionPlan) -> Command {
        let mut cmd = Command::new(SANDBOX_EXEC);
        cmd.args(self.args(plan))
            .current_dir(plan.host_work_dir())
            .envs(plan.env().iter().map(|(k, v)| (k, v)));
        if self.profile.network() == NetworkPosture::Proxied {
            let url = format!("http://localhost:{}", PROXY_PORT);
            for key in ["HTTPS_PROXY", "https_proxy", "HTTP_PROXY", "http_proxy"] {
                cmd.env(key, &url);
            }
        }
        cmd
    }

    fn launch_failure(
        &self,
        status: &ExitStatus,
        stdout: &str,
        stderr: &str,
    ) -> Option<SandboxError> {
        classify_launch_failure(status.success(), stdout, stderr)
    }
}

/// `sandbox-exec` reports its own failures (bad profile, denied exec) with a
/// `sandbox-exec:` prefix before the command ever runs, so the diagnostic is
/// the first thing on stderr and nothing reached stdout.
fn classify_launch_failure(success: bool, stdout: &str, stderr: &str) -> Option<SandboxError> {
    if success || !stdout.is_empty() {
        return None;
    }
    stderr
        .lines()
        .find(|line| !line.trim().is_empty())
        .filter(|line| line.starts_with("sandbox-exec:"))
        .map(|line| SandboxError::EngineLaunch {
            engine: SANDBOX_EXEC.to_string(),
            message: line.trim().to_string(),
        })
}
