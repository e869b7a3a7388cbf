//! Container backend: run commands inside a Docker or Podman container
//!
//! The sandboxed process runs through the engine's client (`docker run ...`).
//! Shared resources (internal network, proxy network, proxy container) are
//! ensured idempotently before launch and outlive individual runs; the
//! per-run container is force-removed on every exit path.

use async_trait::async_trait;
use std::process::{ExitStatus, Output, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::{Backend, process};
use crate::environment::ExecutionPlan;
use crate::error::SandboxError;
use crate::network::{SANDBOX_NETWORK_NAME, SANDBOX_PROXY_NAME};
use crate::profile::{ContainerEngine, ImageRef};

/// Exit status the docker/podman client uses for its own failures
const ENGINE_FAILURE_EXIT: i32 = 125;

pub struct ContainerBackend {
    engine: ContainerEngine,
    image: ImageRef,
    /// Client executable; the engine's binary unless overridden
    program: String,
}

impl ContainerBackend {
    pub fn new(engine: ContainerEngine, image: ImageRef) -> Self {
        Self {
            engine,
            image,
            program: engine.binary().to_string(),
        }
    }

    /// Use another client executable (a full path or a wrapper script).
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Full argument list for `<engine> run`
    pub fn run_args(&self, plan: &ExecutionPlan) -> Vec<String> {
        let network = plan.network();
        let mut args: Vec<String> = vec![
            "run".into(),
            "--rm".into(),
            "--init".into(),
            "-i".into(),
            "--name".into(),
            network.container_name.clone(),
            "--workdir".into(),
            plan.work_dir().to_string(),
            "--volume".into(),
            format!("{}:{}", plan.host_work_dir().display(), plan.work_dir()),
        ];

        for mount in plan.mounts() {
            args.push("--volume".into());
            args.push(mount.volume_arg());
        }

        if let Some(user) = plan.identity().user_arg() {
            args.push("--user".into());
            args.push(user);
            // Mapped users have no home inside the image
            args.push("--env".into());
            args.push(format!("HOME={}", plan.work_dir()));
        }

        if network.create_isolated_network {
            args.push("--network".into());
            args.push(network.network_name.clone());
        }

        for port in &network.port_mappings {
            args.push("--publish".into());
            args.push(port.publish_arg());
        }

        for (key, value) in plan.env() {
            args.push("--env".into());
            args.push(format!("{}={}", key, value));
        }

        args.extend(plan.engine_flags.iter().cloned());

        args.push(self.image.to_string());
        args.extend(["sh".into(), "-c".into(), plan.command().to_string()]);
        args
    }

    fn launch_error(&self, message: String) -> SandboxError {
        SandboxError::EngineLaunch {
            engine: self.engine.binary().to_string(),
            message,
        }
    }

    async fn ensure_proxy(&self, plan: &ExecutionPlan) -> Result<(), SandboxError> {
        let network = plan.network();
        let Some(proxy_command) = plan.proxy_command.as_deref() else {
            return Err(SandboxError::InvalidConfig(
                "proxy enabled without a proxy command".to_string(),
            ));
        };
        let proxy = network.proxy_name.as_str();

        create_network(&self.program, self.engine, &network.network_name, true).await?;
        create_network(&self.program, self.engine, proxy, false).await?;

        let state = engine_output(
            &self.program,
            self.engine,
            &["inspect", "-f", "{{.State.Running}}", proxy],
        )
        .await?;
        let exists = state.status.success();
        let running = exists && stdout_of(&state).trim() == "true";

        // A stopped proxy is restarted in place; removing it could race a
        // concurrent request that has just started it.
        let mut needs_create = !exists;
        if exists && !running {
            let started = engine_output(&self.program, self.engine, &["start", proxy]).await?;
            if started.status.success() {
                info!("Sandbox: restarted stopped proxy container {}", proxy);
            } else {
                warn!(
                    "Sandbox: proxy container {} would not start, recreating: {}",
                    proxy,
                    last_line(&stderr_of(&started))
                );
                let removed =
                    engine_output(&self.program, self.engine, &["rm", "-f", proxy]).await?;
                if !removed.status.success() && !is_missing(&stderr_of(&removed)) {
                    return Err(self.launch_error(format!(
                        "proxy container: {}",
                        last_line(&stderr_of(&removed))
                    )));
                }
                needs_create = true;
            }
        }

        if needs_create {
            let image = self.image.to_string();
            let created = engine_output(
                &self.program,
                self.engine,
                &[
                    "run",
                    "-d",
                    "--init",
                    "--name",
                    proxy,
                    "--network",
                    proxy,
                    image.as_str(),
                    "sh",
                    "-c",
                    proxy_command,
                ],
            )
            .await?;
            if created.status.success() {
                info!("Sandbox: started proxy container {}", proxy);
            } else if !is_already_exists(&stderr_of(&created)) {
                return Err(self.launch_error(format!(
                    "proxy container: {}",
                    last_line(&stderr_of(&created))
                )));
            } else {
                debug!("Sandbox: proxy container created concurrently, reusing it");
            }
        }

        let connected = engine_output(
            &self.program,
            self.engine,
            &["network", "connect", network.network_name.as_str(), proxy],
        )
        .await?;
        if !connected.status.success() && !is_already_exists(&stderr_of(&connected)) {
            return Err(self.launch_error(format!(
                "proxy network: {}",
                last_line(&stderr_of(&connected))
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for ContainerBackend {
    fn name(&self) -> &'static str {
        self.engine.binary()
    }

    async fn prepare(&self, plan: &ExecutionPlan) -> Result<(), SandboxError> {
        if plan.network().proxy_enabled {
            self.ensure_proxy(plan).await?;
        }
        Ok(())
    }

    fn command(&self, plan: &ExecutionPlan) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.run_args(plan));
        cmd
    }

    fn launch_failure(
        &self,
        status: &ExitStatus,
        _stdout: &str,
        stderr: &str,
    ) -> Option<SandboxError> {
        classify_launch_failure(self.engine, status.code(), stderr)
    }

    async fn terminate(&self, plan: &ExecutionPlan, child: &mut Child, grace: Duration) {
        let name = plan.network().container_name.as_str();
        let secs = grace.as_secs().max(1).to_string();
        debug!("Sandbox: stopping container {}", name);

        // The engine gets its own grace period plus headroom to answer.
        let args = ["stop", "-t", secs.as_str(), name];
        let stop = engine_output(&self.program, self.engine, &args);
        if tokio::time::timeout(grace + Duration::from_secs(5), stop)
            .await
            .is_err()
        {
            warn!("Sandbox: {} stop {} did not return", self.engine.binary(), name);
        }
        process::terminate_gracefully(child, grace).await;
    }

    async fn reclaim(&self, plan: &ExecutionPlan, pid: Option<u32>) {
        let name = plan.network().container_name.as_str();
        match engine_output(&self.program, self.engine, &["rm", "-f", name]).await {
            Ok(output) if !output.status.success() && !is_missing(&stderr_of(&output)) => {
                warn!(
                    "Sandbox: failed to remove container {}: {}",
                    name,
                    last_line(&stderr_of(&output))
                );
            }
            Ok(_) => debug!("Sandbox: removed container {}", name),
            Err(e) => warn!("Sandbox: failed to remove container {}: {}", name, e),
        }
        if let Some(pid) = pid {
            process::kill_group(pid);
        }
    }

    fn reclaim_detached(&self, plan: &ExecutionPlan, pid: Option<u32>) {
        if let Some(pid) = pid {
            process::kill_group(pid);
        }
        let program = self.program.clone();
        let name = plan.network().container_name.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let removed = Command::new(&program)
                        .args(["rm", "-f", name.as_str()])
                        .stdin(Stdio::null())
                        .stdout(Stdio::null())
                        .stderr(Stdio::null())
                        .status()
                        .await;
                    if let Err(e) = removed {
                        warn!("Sandbox: failed to remove container {}: {}", name, e);
                    }
                });
            }
            Err(_) => {
                // No runtime left to hand the removal to
                let removed = std::process::Command::new(&program)
                    .args(["rm", "-f", name.as_str()])
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status();
                if let Err(e) = removed {
                    warn!("Sandbox: failed to remove container {}: {}", name, e);
                }
            }
        }
    }
}

/// Create a network unless it already exists.
pub async fn ensure_network(
    engine: ContainerEngine,
    name: &str,
    internal: bool,
) -> Result<(), SandboxError> {
    create_network(engine.binary(), engine, name, internal).await
}

async fn create_network(
    program: &str,
    engine: ContainerEngine,
    name: &str,
    internal: bool,
) -> Result<(), SandboxError> {
    let mut args = vec!["network", "create"];
    if internal {
        args.push("--internal");
    }
    args.push(name);

    let output = engine_output(program, engine, &args).await?;
    if output.status.success() {
        info!("Sandbox: created network {}", name);
        return Ok(());
    }
    let stderr = stderr_of(&output);
    if is_already_exists(&stderr) {
        debug!("Sandbox: network {} already exists", name);
        return Ok(());
    }
    Err(SandboxError::EngineLaunch {
        engine: engine.binary().to_string(),
        message: format!("network {}: {}", name, last_line(&stderr)),
    })
}

/// Remove the proxy container and both shared networks.
///
/// Missing resources are not an error; this is safe to run at any time.
pub async fn reclaim_shared_resources(engine: ContainerEngine) -> Result<(), SandboxError> {
    let steps: [&[&str]; 3] = [
        &["rm", "-f", SANDBOX_PROXY_NAME],
        &["network", "rm", SANDBOX_NETWORK_NAME],
        &["network", "rm", SANDBOX_PROXY_NAME],
    ];
    for args in steps {
        let output = engine_output(engine.binary(), engine, args).await?;
        let stderr = stderr_of(&output);
        if output.status.success() {
            info!("Sandbox: {} {}", engine.binary(), args.join(" "));
        } else if !is_missing(&stderr) {
            return Err(SandboxError::EngineLaunch {
                engine: engine.binary().to_string(),
                message: last_line(&stderr),
            });
        }
    }
    Ok(())
}

async fn engine_output(
    program: &str,
    engine: ContainerEngine,
    args: &[&str],
) -> Result<Output, SandboxError> {
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| SandboxError::EngineLaunch {
            engine: engine.binary().to_string(),
            message: e.to_string(),
        })
}

fn stdout_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn last_line(text: &str) -> String {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("no diagnostic")
        .to_string()
}

/// Engine diagnostics meaning "someone else created it first"
pub(crate) fn is_already_exists(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    ["already exists", "already in use", "already connected", "already used"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// Engine diagnostics meaning "nothing to remove"
pub(crate) fn is_missing(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    ["no such", "not found", "no container with name"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// A stderr line written by the engine client rather than the container
fn is_engine_diagnostic(engine: ContainerEngine, line: &str) -> bool {
    let line = line.trim_start();
    line.starts_with(&format!("{}:", engine.binary()))
        || line.contains("Error response from daemon")
        || line.starts_with("Unable to find image")
        || (engine == ContainerEngine::Podman && line.starts_with("Error: "))
}

/// Map the client's own failure to a launch error.
///
/// The client passes the container's exit status through, so 125 alone is
/// not enough: the engine must also have left its diagnostic on stderr.
pub(crate) fn classify_launch_failure(
    engine: ContainerEngine,
    code: Option<i32>,
    stderr: &str,
) -> Option<SandboxError> {
    if code != Some(ENGINE_FAILURE_EXIT) {
        return None;
    }
    let message = stderr
        .lines()
        .rev()
        .find(|line| is_engine_diagnostic(engine, line))?
        .trim()
        .to_string();

    let lower = message.to_lowercase();
    if lower.contains("port is already allocated")
        || lower.contains("address already in use")
        || lower.contains("bind for")
    {
        Some(SandboxError::PortBind { message })
    } else {
        Some(SandboxError::EngineLaunch {
            engine: engine.binary().to_string(),
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxSettings;
    use crate::environment::{PlanRequest, build};
    use crate::identity::IdentityMapping;
    use crate::network;
    use crate::platform::Platform;
    use crate::engine::{Executor, RunState};
    use crate::profile::{Isolation, SandboxMode};
    use tokio_util::sync::CancellationToken;

    fn backend() -> ContainerBackend {
        ContainerBackend::new(
            ContainerEngine::Docker,
            ImageRef::parse("shellbox-sandbox:1.0").unwrap(),
        )
    }

    fn plan(dir: &std::path::Path, settings: &SandboxSettings, identity: IdentityMapping) -> ExecutionPlan {
        build(PlanRequest {
            isolation: Isolation::Container {
                engine: ContainerEngine::Docker,
                image: ImageRef::parse("shellbox-sandbox:1.0").unwrap(),
            },
            identity,
            network: network::plan(
                SandboxMode::Container,
                &settings.ports,
                settings.proxy_enabled(),
                "shellbox-sandbox-1.0",
            ),
            work_dir: dir,
            command: "cargo test",
            description: "",
            settings,
            platform: Platform::Linux,
        })
        .unwrap()
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Vec<&'a str> {
        args.windows(2)
            .filter(|w| w[0] == flag)
            .map(|w| w[1].as_str())
            .collect()
    }

    #[test]
    fn test_run_args_basic() {
        let dir = tempfile::tempdir().unwrap();
        let settings = SandboxSettings::default();
        let plan = plan(dir.path(), &settings, IdentityMapping::disabled());
        let args = backend().run_args(&plan);

        assert_eq!(&args[..4], ["run", "--rm", "--init", "-i"]);
        assert!(value_after(&args, "--name")[0].starts_with("shellbox-sandbox-1.0-"));
        assert_eq!(value_after(&args, "--workdir"), [plan.work_dir()]);
        assert!(value_after(&args, "--user").is_empty());
        assert!(value_after(&args, "--network").is_empty());
        assert!(value_after(&args, "--env").contains(&"SANDBOX=docker"));
        assert_eq!(
            &args[args.len() - 4..],
            ["shellbox-sandbox:1.0", "sh", "-c", "cargo test"]
        );
    }

    #[test]
    fn test_run_args_with_identity_ports_proxy_and_flags() {
        let dir = tempfile::tempdir().unwrap();
        let settings = SandboxSettings {
            ports: "8080, 9000".to_string(),
            proxy_command: Some("tinyproxy".to_string()),
            flags: "--cpus 2".to_string(),
            ..SandboxSettings::default()
        };
        let identity = IdentityMapping {
            enabled: true,
            uid: 1000,
            gid: 1001,
        };
        let plan = plan(dir.path(), &settings, identity);
        let args = backend().run_args(&plan);

        assert_eq!(value_after(&args, "--user"), ["1000:1001"]);
        assert_eq!(value_after(&args, "--network"), [SANDBOX_NETWORK_NAME]);
        assert_eq!(value_after(&args, "--publish"), ["8080:8080", "9000:9000"]);
        assert!(
            value_after(&args, "--env")
                .contains(&"HTTP_PROXY=http://shellbox-sandbox-proxy:8877")
        );
        let cpus = args.iter().position(|a| a == "--cpus").unwrap();
        let image = args.iter().position(|a| a == "shellbox-sandbox:1.0").unwrap();
        assert!(cpus < image);
    }

    #[test]
    fn test_diagnostic_matchers() {
        assert!(is_already_exists("Error response from daemon: network with name shellbox-sandbox already exists"));
        assert!(is_already_exists("Conflict. The container name \"/shellbox-sandbox-proxy\" is already in use"));
        assert!(!is_already_exists("permission denied"));

        assert!(is_missing("Error: No such container: shellbox-sandbox-proxy"));
        assert!(is_missing("Error response from daemon: network shellbox-sandbox not found"));
        assert!(!is_missing("permission denied while trying to connect to the Docker daemon socket"));
    }

    #[test]
    fn test_classify_launch_failure() {
        let engine = ContainerEngine::Docker;
        assert!(classify_launch_failure(engine, Some(0), "").is_none());
        assert!(classify_launch_failure(engine, Some(1), "boom").is_none());
        assert!(classify_launch_failure(engine, None, "").is_none());

        let port = classify_launch_failure(
            engine,
            Some(125),
            "docker: Error response from daemon: driver failed programming external connectivity: Bind for 0.0.0.0:8080 failed: port is already allocated.\n",
        );
        assert!(matches!(port, Some(SandboxError::PortBind { .. })));

        let image = classify_launch_failure(
            engine,
            Some(125),
            "Unable to find image 'nope:latest' locally\ndocker: Error response from daemon: pull access denied for nope.\n",
        );
        match image {
            Some(SandboxError::EngineLaunch { engine, message }) => {
                assert_eq!(engine, "docker");
                assert!(message.contains("pull access denied"));
            }
            other => panic!("unexpected: {other:?}"),
        }

        // The container's own exit 125 is passed through by the client
        assert!(classify_launch_failure(engine, Some(125), "real-err\n").is_none());
        assert!(classify_launch_failure(engine, Some(125), "").is_none());
        assert!(classify_launch_failure(engine, Some(125), "Error: from the app\n").is_none());
        assert!(
            classify_launch_failure(engine, Some(125), "bind for 0.0.0.0:80 failed\n").is_none()
        );

        let podman = classify_launch_failure(
            ContainerEngine::Podman,
            Some(125),
            "Error: short-name \"nope\" did not resolve to an alias\n",
        );
        assert!(matches!(podman, Some(SandboxError::EngineLaunch { .. })));
    }

    #[cfg(unix)]
    /// Write an executable stand-in for the engine client. Every call is
    /// appended to `engine.log`; `run` executes the trailing `sh -c` command
    /// like a container would. `cases` are extra `case "$1"` arms tried first.
    fn fake_engine(dir: &std::path::Path, cases: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let script = format!(
            "#!/bin/sh\n\
             echo \"$*\" >> '{log}'\n\
             case \"$1\" in\n\
             {cases}\n\
             run) if [ \"$2\" = \"-d\" ]; then exit 0; fi; for last; do :; done; exec sh -c \"$last\" ;;\n\
             *) exit 0 ;;\n\
             esac\n",
            log = dir.join("engine.log").display(),
        );
        let path = dir.join("fake-docker");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    fn engine_log(dir: &std::path::Path) -> Vec<String> {
        std::fs::read_to_string(dir.join("engine.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[cfg(unix)]
    fn fake_backend(bin: &std::path::Path, cases: &str) -> ContainerBackend {
        backend().with_program(fake_engine(bin, cases))
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_container_exit_125_is_a_normal_failure() {
        let dir = tempfile::tempdir().unwrap();
        let bin = tempfile::tempdir().unwrap();
        let backend = fake_backend(bin.path(), "");
        let mut plan = plan(dir.path(), &SandboxSettings::default(), IdentityMapping::disabled());
        plan.command = "echo real-output; echo real-err >&2; exit 125".to_string();

        let outcome = Executor::new(Duration::from_millis(200))
            .run_with(&backend, plan, Duration::from_secs(10), CancellationToken::new())
            .await;

        assert_eq!(outcome.state, RunState::Completed);
        assert_eq!(outcome.exit_code, Some(125));
        assert_eq!(outcome.stdout, "real-output\n");
        assert_eq!(outcome.stderr, "real-err\n");
        assert!(outcome.failure.is_none());
        let result = crate::result::map(&outcome);
        assert!(result.display_text.ends_with("Command exited with code 125\n"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_engine_diagnostic_is_launch_failure_with_streams_kept() {
        let dir = tempfile::tempdir().unwrap();
        let bin = tempfile::tempdir().unwrap();
        let backend = fake_backend(bin.path(), "");
        let mut plan = plan(dir.path(), &SandboxSettings::default(), IdentityMapping::disabled());
        plan.command = "echo 'docker: Error response from daemon: pull access denied for nope.' >&2; \
                        echo \"See 'docker run --help'.\" >&2; exit 125"
            .to_string();

        let outcome = Executor::new(Duration::from_millis(200))
            .run_with(&backend, plan, Duration::from_secs(10), CancellationToken::new())
            .await;

        assert_eq!(outcome.state, RunState::LaunchFailed);
        assert!(outcome.exit_code.is_none());
        assert!(outcome.stderr.contains("pull access denied"));
        match &outcome.failure {
            Some(SandboxError::EngineLaunch { message, .. }) => {
                assert!(message.contains("pull access denied"));
            }
            other => panic!("unexpected failure: {other:?}"),
        }
        let result = crate::result::map(&outcome);
        assert!(result.display_text.contains("=== STDERR ===\ndocker: Error response"));
        assert!(result.display_text.contains("Command could not run: "));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_stops_and_removes_container() {
        let dir = tempfile::tempdir().unwrap();
        let bin = tempfile::tempdir().unwrap();
        let backend = fake_backend(bin.path(), "");
        let mut plan = plan(dir.path(), &SandboxSettings::default(), IdentityMapping::disabled());
        plan.command = "sleep 30".to_string();
        let name = plan.network().container_name.clone();

        let outcome = Executor::new(Duration::from_millis(200))
            .run_with(&backend, plan, Duration::from_millis(300), CancellationToken::new())
            .await;

        assert!(outcome.timed_out);
        assert!(outcome.duration_ms < 10_000);
        let log = engine_log(bin.path());
        assert!(log[0].starts_with("run --rm"));
        assert!(log.contains(&format!("stop -t 1 {}", name)), "log: {log:?}");
        assert!(log.contains(&format!("rm -f {}", name)), "log: {log:?}");
        let stop = log.iter().position(|l| l.starts_with("stop ")).unwrap();
        let rm = log.iter().position(|l| l.starts_with("rm ")).unwrap();
        assert!(stop < rm);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_slow_removal_does_not_stall_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let bin = tempfile::tempdir().unwrap();
        let backend = fake_backend(bin.path(), "rm) sleep 1 ;;");
        let mut plan = plan(dir.path(), &SandboxSettings::default(), IdentityMapping::disabled());
        plan.command = "echo hi".to_string();

        let done = CancellationToken::new();
        let ticker = {
            let done = done.clone();
            tokio::spawn(async move {
                let mut worst = Duration::ZERO;
                let mut last = std::time::Instant::now();
                while !done.is_cancelled() {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    worst = worst.max(last.elapsed());
                    last = std::time::Instant::now();
                }
                worst
            })
        };

        let outcome = Executor::new(Duration::from_millis(200))
            .run_with(&backend, plan, Duration::from_secs(10), CancellationToken::new())
            .await;
        done.cancel();
        let worst = ticker.await.unwrap();

        assert_eq!(outcome.stdout, "hi\n");
        assert!(outcome.duration_ms < 1000);
        assert!(engine_log(bin.path()).iter().any(|l| l.starts_with("rm -f ")));
        assert!(worst < Duration::from_millis(500), "runtime stalled for {worst:?}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_abandoned_run_still_removes_container() {
        let dir = tempfile::tempdir().unwrap();
        let bin = tempfile::tempdir().unwrap();
        let backend = fake_backend(bin.path(), "");
        let mut plan = plan(dir.path(), &SandboxSettings::default(), IdentityMapping::disabled());
        plan.command = "sleep 30".to_string();
        let name = plan.network().container_name.clone();

        let executor = Executor::new(Duration::from_millis(200));
        let run = executor.run_with(&backend, plan, Duration::from_secs(30), CancellationToken::new());
        assert!(tokio::time::timeout(Duration::from_millis(300), run).await.is_err());

        let expected = format!("rm -f {}", name);
        let mut removed = false;
        for _ in 0..100 {
            removed = engine_log(bin.path()).contains(&expected);
            if removed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(removed);
    }

    #[cfg(unix)]
    fn proxy_settings() -> SandboxSettings {
        SandboxSettings {
            proxy_command: Some("tinyproxy".to_string()),
            ..SandboxSettings::default()
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stopped_proxy_is_restarted_not_removed() {
        let dir = tempfile::tempdir().unwrap();
        let bin = tempfile::tempdir().unwrap();
        let backend = fake_backend(bin.path(), "inspect) echo false ;;");
        let plan = plan(dir.path(), &proxy_settings(), IdentityMapping::disabled());

        backend.prepare(&plan).await.unwrap();

        let log = engine_log(bin.path());
        assert!(log.contains(&format!("start {}", SANDBOX_PROXY_NAME)), "log: {log:?}");
        assert!(!log.iter().any(|l| l.starts_with("rm ")), "log: {log:?}");
        assert!(!log.iter().any(|l| l.starts_with("run ")), "log: {log:?}");
        assert!(log.contains(&format!(
            "network connect {} {}",
            SANDBOX_NETWORK_NAME, SANDBOX_PROXY_NAME
        )));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unstartable_proxy_is_recreated() {
        let dir = tempfile::tempdir().unwrap();
        let bin = tempfile::tempdir().unwrap();
        let backend = fake_backend(
            bin.path(),
            "inspect) echo false ;;\nstart) echo 'Error: cannot start' >&2; exit 1 ;;",
        );
        let plan = plan(dir.path(), &proxy_settings(), IdentityMapping::disabled());

        backend.prepare(&plan).await.unwrap();

        let log = engine_log(bin.path());
        let start = log.iter().position(|l| l.starts_with("start ")).unwrap();
        let rm = log.iter().position(|l| l.starts_with("rm -f ")).unwrap();
        let run = log.iter().position(|l| l.starts_with("run -d ")).unwrap();
        assert!(start < rm && rm < run, "log: {log:?}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_running_proxy_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let bin = tempfile::tempdir().unwrap();
        let backend = fake_backend(bin.path(), "inspect) echo true ;;");
        let plan = plan(dir.path(), &proxy_settings(), IdentityMapping::disabled());

        backend.prepare(&plan).await.unwrap();

        let log = engine_log(bin.path());
        assert!(!log.iter().any(|l| l.starts_with("start ") || l.starts_with("run ")));
    }

    #[tokio::test]
    #[ignore = "requires a running Docker daemon"]
    async fn test_concurrent_network_creation_converges() {
        let name = format!("shellbox-test-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let name = name.clone();
                tokio::spawn(async move { ensure_network(ContainerEngine::Docker, &name, true).await })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }

        let filter = format!("name=^{}$", name);
        let listed = Command::new("docker")
            .args(["network", "ls", "--filter", filter.as_str(), "-q"])
            .output()
            .await
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&listed.stdout).lines().count(), 1);

        let _ = Command::new("docker").args(["network", "rm", name.as_str()]).output().await;
    }
}
