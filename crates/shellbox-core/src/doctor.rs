//! Doctor: checks that the configured sandbox can actually run here

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use tracing::{info, warn};

use crate::config::ShellboxConfig;
use crate::identity;
use crate::platform::Platform;
use crate::profile::{ContainerEngine, SandboxMode, SeatbeltProfile};

/// Result of a single health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
    pub fix_hint: Option<String>,
}

impl CheckResult {
    fn new(name: &str, status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            message: message.into(),
            fix_hint: None,
        }
    }

    fn hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
    Skip,
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckStatus::Pass => write!(f, "PASS"),
            CheckStatus::Warn => write!(f, "WARN"),
            CheckStatus::Fail => write!(f, "FAIL"),
            CheckStatus::Skip => write!(f, "SKIP"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorReport {
    pub checks: Vec<CheckResult>,
}

impl DoctorReport {
    fn count(&self, status: CheckStatus) -> usize {
        self.checks.iter().filter(|c| c.status == status).count()
    }

    pub fn is_healthy(&self) -> bool {
        self.count(CheckStatus::Fail) == 0
    }

    pub fn summary(&self) -> String {
        format!(
            "{} passed, {} warnings, {} failed, {} skipped",
            self.count(CheckStatus::Pass),
            self.count(CheckStatus::Warn),
            self.count(CheckStatus::Fail),
            self.count(CheckStatus::Skip)
        )
    }
}

/// Run every check against the effective configuration.
pub async fn run_doctor(config: &ShellboxConfig, config_path: Option<&Path>, platform: Platform) -> DoctorReport {
    info!("Running doctor checks...");
    let sandbox = &config.sandbox;

    let checks = vec![
        check_config_file(config_path),
        check_engine(sandbox.engine, sandbox.mode == SandboxMode::Container).await,
        check_image(sandbox.engine, &sandbox.image, sandbox.mode == SandboxMode::Container).await,
        check_sandbox_exec(platform, sandbox.mode == SandboxMode::OsProfile),
        check_profile(&sandbox.profile),
        check_identity(sandbox.set_uid_gid.as_deref(), platform, &sandbox.os_release_path),
        check_work_dir(std::env::current_dir()),
        check_writable_dir(
            "history_dir",
            config
                .history
                .resolved_path()
                .parent()
                .unwrap_or_else(|| Path::new(".")),
        ),
        check_writable_dir("temp_dir", &std::env::temp_dir()),
    ];

    let report = DoctorReport { checks };
    if report.is_healthy() {
        info!("Doctor: all checks passed ({})", report.summary());
    } else {
        warn!("Doctor: issues found ({})", report.summary());
    }
    report
}

fn check_config_file(path: Option<&Path>) -> CheckResult {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(crate::config::default_config_path);
    if path.exists() {
        CheckResult::new("config_file", CheckStatus::Pass, format!("Config file found: {}", path.display()))
    } else {
        CheckResult::new(
            "config_file",
            CheckStatus::Skip,
            format!("No config at {}, using defaults", path.display()),
        )
    }
}

/// A missing engine only fails when the container mode is configured.
async fn check_engine(engine: ContainerEngine, required: bool) -> CheckResult {
    let name = engine.binary();
    let missing = if required { CheckStatus::Fail } else { CheckStatus::Warn };
    let status = tokio::process::Command::new(name)
        .arg("info")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;

    match status {
        Ok(s) if s.success() => CheckResult::new(name, CheckStatus::Pass, format!("{} is available", name)),
        Ok(_) => CheckResult::new(name, missing, format!("{} is installed but not running", name))
            .hint(format!("Start the {} daemon or service", name)),
        Err(_) => CheckResult::new(name, missing, format!("{} is not installed (container mode unavailable)", name))
            .hint(format!("Install {} or set [sandbox] engine", name)),
    }
}

async fn check_image(engine: ContainerEngine, image: &str, required: bool) -> CheckResult {
    if !required {
        return CheckResult::new("sandbox_image", CheckStatus::Skip, "Container mode not configured");
    }
    let status = tokio::process::Command::new(engine.binary())
        .args(["image", "inspect", image])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match status {
        Ok(s) if s.success() => {
            CheckResult::new("sandbox_image", CheckStatus::Pass, format!("Image {} is present", image))
        }
        _ => CheckResult::new("sandbox_image", CheckStatus::Warn, format!("Image {} is not available locally", image))
            .hint(format!("{} pull {}", engine.binary(), image)),
    }
}

fn check_sandbox_exec(platform: Platform, required: bool) -> CheckResult {
    if !platform.supports_os_profile() {
        let status = if required { CheckStatus::Fail } else { CheckStatus::Skip };
        return CheckResult::new(
            "sandbox_exec",
            status,
            format!("Seatbelt profiles are not supported on {}", platform),
        );
    }
    if Path::new("/usr/bin/sandbox-exec").exists() {
        CheckResult::new("sandbox_exec", CheckStatus::Pass, "sandbox-exec is available")
    } else {
        let status = if required { CheckStatus::Fail } else { CheckStatus::Warn };
        CheckResult::new("sandbox_exec", status, "sandbox-exec not found in /usr/bin")
    }
}

fn check_profile(name: &str) -> CheckResult {
    match name.parse::<SeatbeltProfile>() {
        Ok(profile) => CheckResult::new(
            "seatbelt_profile",
            CheckStatus::Pass,
            format!("Profile '{}' is a built-in profile", profile.name()),
        ),
        Err(e) => CheckResult::new("seatbelt_profile", CheckStatus::Fail, e.to_string()),
    }
}

fn check_identity(override_raw: Option<&str>, platform: Platform, os_release: &Path) -> CheckResult {
    let probe = identity::decide(override_raw, platform, os_release);
    let mapping = match probe.value.user_arg() {
        Some(user) => format!("containers run as {}", user),
        None => "containers run as the image default user".to_string(),
    };
    match probe.note {
        Some(note) if note.starts_with("Could not") => {
            CheckResult::new("identity", CheckStatus::Warn, format!("{} ({})", mapping, note))
                .hint("Set SANDBOX_SET_UID_GID=true or false to skip detection")
        }
        Some(note) => CheckResult::new("identity", CheckStatus::Pass, format!("{} ({})", mapping, note)),
        None => CheckResult::new("identity", CheckStatus::Pass, mapping),
    }
}

/// Requests without a directory run in the current directory.
fn check_work_dir(current: std::io::Result<std::path::PathBuf>) -> CheckResult {
    match current {
        Ok(dir) if dir.is_dir() => CheckResult::new(
            "work_dir",
            CheckStatus::Pass,
            format!("Default working directory: {}", dir.display()),
        ),
        Ok(dir) => CheckResult::new(
            "work_dir",
            CheckStatus::Warn,
            format!("Current directory {} is gone", dir.display()),
        )
        .hint("Pass a directory with each request"),
        Err(e) => CheckResult::new("work_dir", CheckStatus::Warn, format!("Cannot read current directory: {}", e))
            .hint("Pass a directory with each request"),
    }
}

fn check_writable_dir(name: &str, dir: &Path) -> CheckResult {
    if let Err(e) = std::fs::create_dir_all(dir) {
        return CheckResult::new(name, CheckStatus::Fail, format!("Cannot create {}: {}", dir.display(), e));
    }
    match tempfile::NamedTempFile::new_in(dir) {
        Ok(_) => CheckResult::new(name, CheckStatus::Pass, format!("{} is writable", dir.display())),
        Err(e) => CheckResult::new(name, CheckStatus::Fail, format!("{} is not writable: {}", dir.display(), e))
            .hint(format!("Check permissions on {}", dir.display())),
    }
}
