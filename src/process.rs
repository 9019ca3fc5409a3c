//! Supervision of PID-file based daemons (dnsmasq, dhcpcd, goproxy).

use std::ffi::OsStr;
use std::future::Future;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};

use crate::netlink::netns::is_main;
use crate::{Error, Result};

/// Interval between two liveness checks.
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Build a command that runs `program` inside `netns` (`ip netns exec`).
pub fn namespaced_command<I, S>(netns: &str, program: &str, args: I) -> Command
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = if is_main(netns) {
        Command::new(program)
    } else {
        let mut cmd = Command::new("ip");
        cmd.args(["netns", "exec", netns, program]);
        cmd
    };
    cmd.args(args);
    cmd
}

/// Human-readable command line, for logs and errors.
pub fn command_line(cmd: &Command) -> String {
    let std = cmd.as_std();
    std::iter::once(std.get_program())
        .chain(std.get_args())
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Run to completion; a non-zero exit becomes an error carrying the output.
pub async fn run_command(mut cmd: Command) -> Result<String> {
    let command = command_line(&cmd);
    debug!(%command, "running command");
    let output = cmd.stdin(Stdio::null()).output().await?;
    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    if !output.status.success() {
        let err = Error::Command {
            command,
            output: combined.trim().to_string(),
        };
        error!("{err}");
        return Err(err);
    }
    Ok(combined)
}

/// PID stored in a PID file, if the file exists and parses.
pub async fn read_pid(pid_file: &Path) -> Option<Pid> {
    let content = tokio::fs::read_to_string(pid_file).await.ok()?;
    match content.trim().parse::<i32>() {
        Ok(pid) if pid > 0 => Some(Pid::from_raw(pid)),
        _ => {
            warn!(pid_file = %pid_file.display(), "unparsable PID file content {:?}", content.trim());
            None
        }
    }
}

fn is_zombie(pid: Pid) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // The state follows the parenthesised command name, which may contain spaces.
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .is_some_and(|state| state == "Z")
}

/// Signal-0 liveness check; zombies count as gone.
pub fn is_pid_running(pid: Pid) -> bool {
    kill(pid, None::<Signal>).is_ok() && !is_zombie(pid)
}

pub async fn is_running(pid_file: &Path) -> bool {
    match read_pid(pid_file).await {
        Some(pid) => is_pid_running(pid),
        None => false,
    }
}

/// Re-evaluate `check` until it holds or `timeout` elapses.
pub async fn poll_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        sleep(POLL_INTERVAL.min(deadline - now)).await;
    }
}

/// Start a daemon and wait for its PID file to name a live process.
///
/// With `background` the child is spawned and watched directly: an early
/// failing exit is reported without waiting for the timeout. Otherwise the
/// command is run to completion first (self-daemonizing tools).
pub async fn start_process(
    mut cmd: Command,
    pid_file: &Path,
    timeout: Duration,
    background: bool,
) -> Result<()> {
    let command = command_line(&cmd);
    cmd.stdin(Stdio::null());
    let deadline = Instant::now() + timeout;

    if background {
        let mut child = cmd
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::Process(format!("failed to start `{command}`: {e}")))?;
        loop {
            if is_running(pid_file).await {
                break;
            }
            if let Some(status) = child.try_wait()?
                && !status.success()
            {
                let err = Error::Process(format!("`{command}` exited early with {status}"));
                error!("{err}");
                return Err(err);
            }
            let now = Instant::now();
            if now >= deadline {
                kill_child(&mut child, &command);
                return Err(start_timeout(&command, pid_file, timeout));
            }
            sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    } else {
        run_command(cmd).await?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        if !poll_until(remaining, || is_running(pid_file)).await {
            return Err(start_timeout(&command, pid_file, timeout));
        }
    }

    info!(%command, pid_file = %pid_file.display(), "process started");
    Ok(())
}

/// Kill a child that missed its start deadline; false if the kill failed.
fn kill_child(child: &mut tokio::process::Child, command: &str) -> bool {
    match child.start_kill() {
        Ok(()) => true,
        Err(e) => {
            warn!(%command, "failed to kill process: {e}");
            false
        }
    }
}

fn start_timeout(command: &str, pid_file: &Path, timeout: Duration) -> Error {
    let err = Error::Timeout {
        what: format!("start of `{command}` (pid-file {})", pid_file.display()),
        timeout,
    };
    error!("{err}");
    err
}

/// SIGTERM, wait up to `stop_timeout`; then SIGKILL, wait up to `kill_timeout`.
pub async fn stop_process(
    pid_file: &Path,
    stop_timeout: Duration,
    kill_timeout: Duration,
) -> Result<()> {
    let pid = match read_pid(pid_file).await {
        Some(pid) if is_pid_running(pid) => pid,
        _ => {
            let err = Error::Process(format!("pid-file={} is not running", pid_file.display()));
            error!("{err}");
            return Err(err);
        }
    };

    kill(pid, Signal::SIGTERM)?;
    if poll_until(stop_timeout, || async move { !is_pid_running(pid) }).await {
        info!(%pid, "process stopped");
        return Ok(());
    }

    warn!(%pid, "process ignored SIGTERM, sending SIGKILL");
    if let Err(e) = kill(pid, Signal::SIGKILL)
        && e != nix::errno::Errno::ESRCH
    {
        return Err(e.into());
    }
    if poll_until(kill_timeout, || async move { !is_pid_running(pid) }).await {
        info!(%pid, "process killed");
        return Ok(());
    }

    let err = Error::Timeout {
        what: format!("stop of process pid-file={}", pid_file.display()),
        timeout: stop_timeout + kill_timeout,
    };
    error!("{err}");
    Err(err)
}

/// Remove files left behind by a stopped daemon; failures are only logged.
pub async fn remove_files(paths: &[&Path]) {
    for path in paths {
        if let Err(e) = tokio::fs::remove_file(path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %path.display(), "failed to remove file: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        namespaced_command("main", "sh", ["-c", script])
    }

    #[test]
    fn command_in_namespace() {
        let cmd = namespaced_command("network-lan", "dnsmasq", ["-C", "/etc/x.conf"]);
        assert_eq!(command_line(&cmd), "ip netns exec network-lan dnsmasq -C /etc/x.conf");
        let cmd = namespaced_command("main", "sysctl", ["-w", "net.ipv4.ip_forward=1"]);
        assert_eq!(command_line(&cmd), "sysctl -w net.ipv4.ip_forward=1");
    }

    #[tokio::test]
    async fn pid_file_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.pid");
        assert_eq!(read_pid(&path).await, None);
        std::fs::write(&path, " 1234\n").unwrap();
        assert_eq!(read_pid(&path).await, Some(Pid::from_raw(1234)));
        std::fs::write(&path, "garbage").unwrap();
        assert_eq!(read_pid(&path).await, None);
    }

    #[tokio::test]
    async fn own_pid_is_running() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("self.pid");
        std::fs::write(&path, std::process::id().to_string()).unwrap();
        assert!(is_running(&path).await);
        std::fs::write(&path, i32::MAX.to_string()).unwrap();
        assert!(!is_running(&path).await);
    }

    #[tokio::test]
    async fn start_and_stop_background_process() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("daemon.pid");
        let script = format!("echo $$ > {}; exec sleep 30", pid_file.display());
        start_process(sh(&script), &pid_file, Duration::from_secs(5), true)
            .await
            .unwrap();
        assert!(is_running(&pid_file).await);

        stop_process(&pid_file, Duration::from_secs(5), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(!is_running(&pid_file).await);
    }

    #[tokio::test]
    async fn kill_of_reaped_child_is_reported() {
        let mut child = sh("sleep 30").spawn().unwrap();
        assert!(kill_child(&mut child, "sleep 30"));
        child.wait().await.unwrap();
        assert!(!kill_child(&mut child, "sleep 30"));
    }

    #[tokio::test]
    async fn missing_pid_file_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("never.pid");
        let err = start_process(sh("sleep 5"), &pid_file, Duration::from_millis(600), true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }), "{err}");
        assert!(err.to_string().contains("never.pid"), "{err}");
    }

    #[tokio::test]
    async fn early_exit_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("fail.pid");
        let started = Instant::now();
        let err = start_process(sh("exit 3"), &pid_file, Duration::from_secs(10), true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Process(_)), "{err}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn failing_foreground_command_carries_output() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("fg.pid");
        let err = start_process(sh("echo boom >&2; exit 1"), &pid_file, Duration::from_secs(1), false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"), "{err}");
    }

    #[tokio::test]
    async fn stopping_a_dead_process_fails() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("dead.pid");
        let err = stop_process(&pid_file, Duration::from_millis(100), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Process(_)));
    }

    #[tokio::test]
    async fn remove_files_ignores_missing() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("a.conf");
        std::fs::write(&present, "x").unwrap();
        let missing = dir.path().join("b.conf");
        remove_files(&[&present, &missing]).await;
        assert!(!present.exists());
    }
}
