//! Unconstrained backend: a plain host process

use async_trait::async_trait;
use tokio::process::Command;

use super::Backend;
use crate::environment::ExecutionPlan;

pub struct HostBackend;

#[async_trait]
impl Backend for HostBackend {
    fn name(&self) -> &'static str {
        "host"
    }

    fn command(&self, plan: &ExecutionPlan) -> Command {
        let mut cmd = shell(plan.command());
        cmd.current_dir(plan.host_work_dir())
            .envs(plan.env().iter().map(|(k, v)| (k, v)));
        cmd
    }
}

#[cfg(unix)]
pub(crate) fn shell(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
pub(crate) fn shell(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::SandboxSettings;
    use crate::engine::{Executor, RunState, TRUNCATION_MARKER};
    use crate::environment::{PlanRequest, build};
    use crate::identity::IdentityMapping;
    use crate::network::NetworkPlan;
    use crate::platform::Platform;
    use crate::profile::Isolation;
    use std::path::Path;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn plan(dir: &Path, command: &str) -> ExecutionPlan {
        let settings = SandboxSettings {
            env: "GREETING=hello".to_string(),
            ..SandboxSettings::default()
        };
        build(PlanRequest {
            isolation: Isolation::Unconstrained,
            identity: IdentityMapping::disabled(),
            network: NetworkPlan::empty(),
            work_dir: dir,
            command,
            description: "",
            settings: &settings,
            platform: Platform::current(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_runs_in_work_dir_with_env() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();

        let outcome = Executor::default()
            .run(
                plan(dir.path(), "ls; echo $GREETING $SANDBOX"),
                Duration::from_secs(10),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(outcome.state, RunState::Completed);
        assert!(outcome.stdout.contains("marker.txt"));
        assert!(outcome.stdout.contains("hello none"));
        assert!(outcome.is_clean());
    }

    #[tokio::test]
    async fn test_nonzero_exit_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = Executor::default()
            .run(
                plan(dir.path(), "echo oops >&2; exit 3"),
                Duration::from_secs(10),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(outcome.state, RunState::Completed);
        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.stderr, "oops\n");
        assert!(!outcome.is_clean());
    }

    #[tokio::test]
    async fn test_timeout_keeps_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = Executor::new(Duration::from_millis(200))
            .run(
                plan(dir.path(), "echo started; sleep 5"),
                Duration::from_millis(500),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(outcome.state, RunState::TimedOut);
        assert!(outcome.timed_out);
        assert!(outcome.exit_code.is_none());
        assert_eq!(outcome.stdout, "started\n");
        assert!(outcome.duration_ms < 5000);
    }

    #[tokio::test]
    async fn test_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let outcome = Executor::new(Duration::from_millis(200))
            .run(plan(dir.path(), "sleep 5"), Duration::from_secs(30), cancel)
            .await;

        assert!(outcome.cancelled);
        assert!(!outcome.timed_out);
        assert!(outcome.exit_code.is_none());
    }

    #[tokio::test]
    async fn test_output_beyond_limit_is_drained_and_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = Executor::default()
            .with_output_limit(1024)
            .run(
                plan(dir.path(), "head -c 200000 /dev/zero; echo done >&2"),
                Duration::from_secs(10),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(outcome.state, RunState::Completed);
        assert_eq!(outcome.exit_code, Some(0));
        assert!(outcome.stdout_truncated);
        assert!(!outcome.stderr_truncated);
        assert_eq!(outcome.stdout.len(), 1024 + TRUNCATION_MARKER.len());
        assert!(outcome.stdout.ends_with(TRUNCATION_MARKER));
        assert_eq!(outcome.stderr, "done\n");
    }

    #[tokio::test]
    async fn test_signal_reported() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = Executor::default()
            .run(
                plan(dir.path(), "kill -9 $$"),
                Duration::from_secs(10),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(outcome.state, RunState::Completed);
        assert!(outcome.exit_code.is_none());
        assert_eq!(outcome.signal.as_deref(), Some("SIGKILL"));
    }
}
