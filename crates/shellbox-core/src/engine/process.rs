//! Process-group helpers for reliable teardown.
//!
//! Sandboxed commands are spawned as their own process group leader so that
//! `sh -c` and everything it forks can be signalled together.

use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;
use tracing::debug;

/// SIGTERM the group, wait up to `grace`, then SIGKILL and reap.
#[cfg(unix)]
pub(crate) async fn terminate_gracefully(child: &mut Child, grace: Duration) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    let pgid = Pid::from_raw(pid as i32);

    if killpg(pgid, Signal::SIGTERM).is_err() {
        let _ = child.wait().await;
        return;
    }

    if tokio::time::timeout(grace, child.wait()).await.is_ok() {
        debug!("Sandbox: process group {} exited after SIGTERM", pid);
        let _ = killpg(pgid, Signal::SIGKILL);
        return;
    }

    debug!("Sandbox: process group {} ignored SIGTERM, killing", pid);
    let _ = killpg(pgid, Signal::SIGKILL);
    let _ = child.kill().await;
}

#[cfg(not(unix))]
pub(crate) async fn terminate_gracefully(child: &mut Child, _grace: Duration) {
    let _ = child.kill().await;
}

/// Best-effort SIGKILL of a whole process group.
#[cfg(unix)]
pub(crate) fn kill_group(pid: u32) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
}

#[cfg(not(unix))]
pub(crate) fn kill_group(_pid: u32) {}

/// True while any live (non-zombie) member of the process group led by
/// `pid` remains.
#[cfg(target_os = "linux")]
pub fn process_group_alive(pid: u32) -> bool {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return false;
    };
    entries.flatten().any(|entry| {
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            return false;
        };
        // "pid (comm) state ppid pgrp ..."; comm may contain spaces
        let Some(after_comm) = stat.rfind(')').map(|i| &stat[i + 1..]) else {
            return false;
        };
        let mut fields = after_comm.split_whitespace();
        let state = fields.next();
        let pgrp = fields.nth(1).and_then(|f| f.parse::<u32>().ok());
        pgrp == Some(pid) && state != Some("Z")
    })
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn process_group_alive(pid: u32) -> bool {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    killpg(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
pub fn process_group_alive(_pid: u32) -> bool {
    false
}

/// Name of the signal that terminated the process, if any.
#[cfg(unix)]
pub(crate) fn signal_name(status: &ExitStatus) -> Option<String> {
    use nix::sys::signal::Signal;
    use std::os::unix::process::ExitStatusExt;

    status.signal().map(|sig| {
        Signal::try_from(sig)
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|_| sig.to_string())
    })
}

#[cfg(not(unix))]
pub(crate) fn signal_name(_status: &ExitStatus) -> Option<String> {
    None
}
