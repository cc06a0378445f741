//! Child processes that take their descendants down with them.
//!
//! Commands built here lead their own process group. When a [`GroupChild`]
//! is dropped or finishes waiting, the whole group gets SIGKILL, so a
//! timed-out or cancelled command leaves no background work behind.

use std::ffi::OsStr;
use std::io;
use std::process::Output;

use tokio::process::{Child, ChildStdin, Command};

/// A command that will run as the leader of a new process group.
pub fn command(program: impl AsRef<OsStr>) -> Command {
    let mut cmd = std::process::Command::new(program);
    #[cfg(unix)]
    std::os::unix::process::CommandExt::process_group(&mut cmd, 0);
    let mut cmd = Command::from(cmd);
    cmd.kill_on_drop(true);
    cmd
}

/// Spawns `cmd`, which should come from [`command`].
pub fn spawn(cmd: &mut Command) -> io::Result<GroupChild> {
    let child = cmd.spawn()?;
    let group = ProcessGroup {
        pgid: child.id().and_then(|id| i32::try_from(id).ok()),
    };
    Ok(GroupChild { child, group })
}

/// A spawned group leader.
#[derive(Debug)]
pub struct GroupChild {
    child: Child,
    group: ProcessGroup,
}

impl GroupChild {
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    /// Waits for the leader and collects its output, then kills whatever is
    /// left of the group.
    pub async fn wait_with_output(self) -> io::Result<Output> {
        let GroupChild { child, group } = self;
        let output = child.wait_with_output().await;
        drop(group);
        output
    }
}

#[derive(Debug)]
struct ProcessGroup {
    pgid: Option<i32>,
}

#[cfg(unix)]
impl Drop for ProcessGroup {
    fn drop(&mut self) {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let Some(pgid) = self.pgid else {
            return;
        };
        match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => tracing::debug!(pgid, error = %e, "failed to kill process group"),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Stdio;
    use std::time::Duration;
    use tempfile::TempDir;

    fn detached(dir: &TempDir, script: &str) -> Command {
        let mut cmd = command("sh");
        cmd.args(["-c", script])
            .current_dir(dir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd
    }

    #[tokio::test]
    async fn timeout_kills_background_grandchildren() {
        let dir = TempDir::new().unwrap();
        let child = spawn(&mut detached(&dir, "(sleep 1; touch marker) & wait")).unwrap();

        let waited = tokio::time::timeout(Duration::from_millis(200), child.wait_with_output()).await;
        assert!(waited.is_err());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!dir.path().join("marker").exists());
    }

    #[tokio::test]
    async fn finished_leader_takes_its_group_along() {
        let dir = TempDir::new().unwrap();
        let child = spawn(&mut detached(&dir, "(sleep 1; touch marker) &")).unwrap();

        let output = child.wait_with_output().await.unwrap();
        assert!(output.status.success());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!dir.path().join("marker").exists());
    }

    #[tokio::test]
    async fn output_is_collected() {
        let dir = TempDir::new().unwrap();
        let mut cmd = command("sh");
        cmd.args(["-c", "echo out; echo err >&2"])
            .current_dir(dir.path())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let output = spawn(&mut cmd).unwrap().wait_with_output().await.unwrap();
        assert_eq!(output.stdout, b"out\n");
        assert_eq!(output.stderr, b"err\n");
    }
}
