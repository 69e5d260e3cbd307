//! Starts and tears down isolation boundaries.
//!
//! A boundary is the first process of an executor or task plus everything
//! it forks. [`PosixLauncher`] backs each boundary with its own session and
//! process group and records the leader's pid below a root directory, so
//! boundaries can be found again after a restart. [`MinimalLauncher`] is for
//! platforms without sessions: it only knows the first process.
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};

use berth_model::{CommandInfo, ContainerId, Env};

use crate::error::ExecError;
use crate::hooks::{PreExecHook, RlimitConfig};

mod minimal;
pub use minimal::MinimalLauncher;

mod posix;
pub use posix::{PID_FILE, PosixLauncher};

mod table;

/// Where a boundary's stdout or stderr goes.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Redirect {
    #[default]
    Null,
    Inherit,
    /// Appended to, created when missing.
    File(PathBuf),
}

impl Redirect {
    fn stdio(&self) -> Result<Stdio, ExecError> {
        Ok(match self {
            Redirect::Null => Stdio::null(),
            Redirect::Inherit => Stdio::inherit(),
            Redirect::File(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Stdio::from(file)
            }
        })
    }
}

/// Everything needed to start a boundary's first process.
#[derive(Debug, Clone, Default)]
pub struct LaunchRequest {
    /// Program handed to `execve`.
    pub program: String,
    /// Full argv, `argv[0]` included.
    pub argv: Vec<String>,
    /// Added on top of the launcher's own environment.
    pub env: Env,
    pub cwd: Option<PathBuf>,
    pub stdout: Redirect,
    pub stderr: Redirect,
    /// Namespaces to unshare. No built-in launcher supports any.
    pub namespaces: Vec<String>,
    pub rlimits: RlimitConfig,
    /// Caller's own `pre_exec` steps, run in order after the built-in ones.
    pub hooks: Vec<PreExecHook>,
}

impl LaunchRequest {
    pub fn from_command(command: &CommandInfo) -> Self {
        let (program, argv) = command.argv();
        Self {
            program,
            argv,
            env: command.env.clone(),
            cwd: command.cwd.as_ref().map(PathBuf::from),
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<(), ExecError> {
        if self.program.trim().is_empty() {
            return Err(ExecError::InvalidRequest("program is empty".into()));
        }
        if !self.namespaces.is_empty() {
            return Err(ExecError::Unsupported("namespace isolation"));
        }
        Ok(())
    }

    fn command(&self) -> Result<Command, ExecError> {
        let mut cmd = Command::new(&self.program);
        #[cfg(unix)]
        if let Some(arg0) = self.argv.first() {
            cmd.arg0(arg0);
        }
        cmd.args(self.argv.iter().skip(1));
        for var in self.env.iter() {
            cmd.env(var.name(), var.value());
        }
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(self.stdout.stdio()?);
        cmd.stderr(self.stderr.stdio()?);
        Ok(cmd)
    }

    /// Spawns the first process; `session` puts it in a session of its own.
    fn spawn(&self, session: bool) -> Result<(Child, u32), ExecError> {
        self.validate()?;
        let mut cmd = self.command()?;
        if session {
            crate::hooks::attach_session(&mut cmd);
        }
        crate::hooks::attach_rlimits(&mut cmd, &self.rlimits);
        crate::hooks::attach_hooks(&mut cmd, &self.hooks);

        let child = cmd.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| ExecError::InvalidRequest("child exited before its pid was read".into()))?;
        Ok((child, pid))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchedStatus {
    pub container_id: ContainerId,
    /// Leader pid; also the process group and session id under POSIX.
    pub pid: u32,
}

#[async_trait]
pub trait Launcher: Send + Sync + 'static {
    /// Finds boundaries that survived a restart and returns the live ones
    /// missing from `known`.
    async fn recover(&self, known: &[ContainerId]) -> Result<Vec<ContainerId>, ExecError>;

    /// Starts `request` in a new boundary and returns the leader's pid.
    async fn launch(&self, container_id: &ContainerId, request: LaunchRequest) -> Result<u32, ExecError>;

    /// Asks the boundary to stop with `SIGTERM`.
    async fn terminate(&self, container_id: &ContainerId) -> Result<(), ExecError>;

    /// Kills and reaps everything in the boundary. Unknown ids succeed.
    async fn destroy(&self, container_id: &ContainerId) -> Result<(), ExecError>;

    /// Raw wait status of the leader; `None` if it was reaped elsewhere or
    /// the boundary is unknown.
    async fn wait(&self, container_id: &ContainerId) -> Result<Option<i32>, ExecError>;

    async fn status(&self, container_id: &ContainerId) -> Result<LaunchedStatus, ExecError>;
}

pub type LauncherRef = Arc<dyn Launcher>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LauncherKind {
    #[default]
    Posix,
    Minimal,
}

impl LauncherKind {
    /// Builds the launcher; `root` only matters for [`LauncherKind::Posix`].
    pub fn build(self, root: impl Into<PathBuf>) -> LauncherRef {
        match self {
            LauncherKind::Posix => Arc::new(PosixLauncher::new(root)),
            LauncherKind::Minimal => Arc::new(MinimalLauncher::new()),
        }
    }
}

/// Decodes a raw wait status into a sentence for status messages.
#[cfg(unix)]
pub fn describe_status(status: i32) -> String {
    if libc::WIFEXITED(status) {
        format!("exited with status {}", libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        format!("terminated by signal {}", libc::WTERMSIG(status))
    } else {
        format!("ended with wait status {status}")
    }
}

#[cfg(not(unix))]
pub fn describe_status(status: i32) -> String {
    format!("exited with status {status}")
}

/// Whether a raw wait status reports a clean `exit(0)`.
#[cfg(unix)]
pub fn succeeded(status: i32) -> bool {
    libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0
}

#[cfg(not(unix))]
pub fn succeeded(status: i32) -> bool {
    status == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_command_becomes_sh_c() {
        let request = LaunchRequest::from_command(&CommandInfo::shell("echo hi"));
        assert_eq!(request.program, "/bin/sh");
        assert_eq!(request.argv, vec!["sh", "-c", "echo hi"]);
    }

    #[test]
    fn namespaces_are_rejected() {
        let request = LaunchRequest {
            program: "/bin/true".into(),
            namespaces: vec!["pid".into()],
            ..LaunchRequest::default()
        };
        assert!(matches!(request.validate(), Err(ExecError::Unsupported(_))));
    }

    #[cfg(unix)]
    #[test]
    fn wait_status_is_described() {
        assert!(succeeded(0));
        assert_eq!(describe_status(3 << 8), "exited with status 3");
        assert!(!succeeded(3 << 8));
        assert_eq!(describe_status(libc::SIGKILL), "terminated by signal 9");
    }
}
