use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use berth_core::paths::{CONTAINER_SEGMENT, container_path};
use berth_model::ContainerId;

use super::table::{Boundaries, Exit, is_alive};
use super::{LaunchRequest, LaunchedStatus, Launcher};
use crate::error::ExecError;

/// File holding a boundary's leader pid inside its directory.
pub const PID_FILE: &str = "pid";

/// Session-per-boundary launcher.
///
/// Every boundary's leader calls `setsid()` before exec, so the leader pid is
/// also the process group id and signals reach every descendant that did
/// not leave the group. The pid is checkpointed at
/// `<root>/containers/<id>/pid` (nested ids add a level each).
pub struct PosixLauncher {
    root: PathBuf,
    boundaries: Boundaries,
}

impl PosixLauncher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            boundaries: Boundaries::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn destroy_one(&self, container_id: &ContainerId) -> Result<(), ExecError> {
        if let Some(pid) = self.boundaries.pid(container_id) {
            signal_group(pid, libc::SIGKILL).map_err(|source| ExecError::Signal {
                container: container_id.clone(),
                source,
            })?;
            let exit = self.boundaries.wait(container_id).await;
            debug!(container = %container_id, pid, ?exit, "boundary destroyed");
            self.boundaries.remove(container_id);
        }
        match tokio::fs::remove_dir_all(container_path(&self.root, container_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Launcher for PosixLauncher {
    async fn recover(&self, known: &[ContainerId]) -> Result<Vec<ContainerId>, ExecError> {
        let root = self.root.clone();
        let found = tokio::task::spawn_blocking(move || {
            let mut found = Vec::new();
            scan(&root, None, &mut found).map(|()| found)
        })
        .await
        .map_err(|e| ExecError::Io(io::Error::other(e)))??;

        let mut orphans = Vec::new();
        for (container_id, dir) in found {
            let pid = read_pid(&dir).await;
            match pid.filter(|pid| is_alive(*pid)) {
                Some(pid) => {
                    if !self.boundaries.contains(&container_id) {
                        self.boundaries.adopt(container_id.clone(), pid);
                    }
                    if !known.contains(&container_id) {
                        orphans.push(container_id);
                    }
                }
                None if known.contains(&container_id) => {}
                None => {
                    debug!(container = %container_id, "removing leftovers of a dead boundary");
                    if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                        warn!(container = %container_id, error = %e, "failed to remove boundary directory");
                    }
                }
            }
        }
        info!(orphans = orphans.len(), "recovered boundaries");
        Ok(orphans)
    }

    async fn launch(&self, container_id: &ContainerId, request: LaunchRequest) -> Result<u32, ExecError> {
        if self.boundaries.contains(container_id) {
            return Err(ExecError::AlreadyExists(container_id.clone()));
        }
        let dir = container_path(&self.root, container_id);
        tokio::fs::create_dir_all(&dir).await?;

        let (child, pid) = request.spawn(true)?;
        self.boundaries.track_child(container_id.clone(), pid, child);
        tokio::fs::write(dir.join(PID_FILE), pid.to_string()).await?;

        info!(container = %container_id, pid, program = %request.program, "launched boundary");
        Ok(pid)
    }

    async fn terminate(&self, container_id: &ContainerId) -> Result<(), ExecError> {
        let pid = self
            .boundaries
            .pid(container_id)
            .ok_or_else(|| ExecError::UnknownContainer(container_id.clone()))?;
        signal_group(pid, libc::SIGTERM).map_err(|source| ExecError::Signal {
            container: container_id.clone(),
            source,
        })
    }

    async fn destroy(&self, container_id: &ContainerId) -> Result<(), ExecError> {
        for nested in self.boundaries.descendants(container_id) {
            self.destroy_one(&nested).await?;
        }
        self.destroy_one(container_id).await
    }

    async fn wait(&self, container_id: &ContainerId) -> Result<Option<i32>, ExecError> {
        Ok(match self.boundaries.wait(container_id).await {
            Some(Exit::Status(status)) => Some(status),
            Some(Exit::Unobserved) | None => None,
        })
    }

    async fn status(&self, container_id: &ContainerId) -> Result<LaunchedStatus, ExecError> {
        let pid = self
            .boundaries
            .pid(container_id)
            .ok_or_else(|| ExecError::UnknownContainer(container_id.clone()))?;
        Ok(LaunchedStatus {
            container_id: container_id.clone(),
            pid,
        })
    }
}

/// Collects every boundary directory below `dir`, innermost first.
fn scan(dir: &Path, parent: Option<&ContainerId>, out: &mut Vec<(ContainerId, PathBuf)>) -> io::Result<()> {
    let entries = match std::fs::read_dir(dir.join(CONTAINER_SEGMENT)) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let id = match parent {
            Some(p) => p.child(name),
            None => ContainerId::new(name),
        };
        scan(&entry.path(), Some(&id), out)?;
        out.push((id, entry.path()));
    }
    Ok(())
}

async fn read_pid(dir: &Path) -> Option<u32> {
    let raw = tokio::fs::read_to_string(dir.join(PID_FILE)).await.ok()?;
    raw.trim().parse().ok()
}

/// Signals the process group led by `pid`. A group that is already gone
/// counts as signalled.
fn signal_group(pid: u32, signal: libc::c_int) -> io::Result<()> {
    let pgid = libc::pid_t::try_from(pid).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    if unsafe { libc::killpg(pgid, signal) } == 0 {
        return Ok(());
    }
    let e = io::Error::last_os_error();
    if e.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(e)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::launcher::succeeded;

    fn sh(script: &str) -> LaunchRequest {
        LaunchRequest::from_command(&berth_model::CommandInfo::shell(script))
    }

    /// Dead or a zombie waiting for an init that may not reap it.
    fn gone(pid: u32) -> bool {
        if !is_alive(pid) {
            return true;
        }
        std::fs::read_to_string(format!("/proc/{pid}/stat"))
            .map(|stat| stat.rsplit(')').next().is_some_and(|rest| rest.trim_start().starts_with('Z')))
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn wait_reports_exit_status_and_pid_is_checkpointed() {
        let root = tempfile::tempdir().unwrap();
        let launcher = PosixLauncher::new(root.path());
        let id = ContainerId::new("c1");

        let pid = launcher.launch(&id, sh("exit 3")).await.unwrap();
        let status = launcher.wait(&id).await.unwrap().unwrap();
        assert!(!succeeded(status));
        assert_eq!(libc::WEXITSTATUS(status), 3);

        let recorded = std::fs::read_to_string(container_path(root.path(), &id).join(PID_FILE)).unwrap();
        assert_eq!(recorded, pid.to_string());
    }

    #[tokio::test]
    async fn destroy_kills_the_whole_group() {
        let root = tempfile::tempdir().unwrap();
        let launcher = PosixLauncher::new(root.path());
        let id = ContainerId::new("c1");
        let marker = root.path().join("grandchild");

        let script = format!("sleep 300 & echo $! > {}; wait", marker.display());
        launcher.launch(&id, sh(&script)).await.unwrap();
        let grandchild: u32 = loop {
            if let Ok(raw) = std::fs::read_to_string(&marker) {
                if let Ok(pid) = raw.trim().parse() {
                    break pid;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        };

        launcher.destroy(&id).await.unwrap();
        for _ in 0..100 {
            if gone(grandchild) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(gone(grandchild));
        assert!(!container_path(root.path(), &id).exists());

        // Idempotent, and a reaped boundary has no status left.
        launcher.destroy(&id).await.unwrap();
        assert_eq!(launcher.wait(&id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn destroy_reaches_nested_boundaries() {
        let root = tempfile::tempdir().unwrap();
        let launcher = PosixLauncher::new(root.path());
        let parent = ContainerId::new("exec");
        let child = parent.child("task");

        launcher.launch(&parent, sh("sleep 300")).await.unwrap();
        let child_pid = launcher.launch(&child, sh("sleep 300")).await.unwrap();

        launcher.destroy(&parent).await.unwrap();
        assert!(launcher.status(&child).await.is_err());
        assert!(gone(child_pid));
    }

    #[tokio::test]
    async fn recover_adopts_survivors_and_reports_orphans() {
        let root = tempfile::tempdir().unwrap();
        let known = ContainerId::new("known");
        let orphan = ContainerId::new("orphan");
        let dead = ContainerId::new("dead");

        let first = PosixLauncher::new(root.path());
        let known_pid = first.launch(&known, sh("sleep 300")).await.unwrap();
        first.launch(&orphan, sh("sleep 300")).await.unwrap();
        first.launch(&dead, sh("exit 0")).await.unwrap();
        first.wait(&dead).await.unwrap();

        let second = PosixLauncher::new(root.path());
        let orphans = second.recover(std::slice::from_ref(&known)).await.unwrap();
        assert_eq!(orphans, vec![orphan.clone()]);
        assert_eq!(second.status(&known).await.unwrap().pid, known_pid);
        assert!(!container_path(root.path(), &dead).exists());

        first.destroy(&known).await.unwrap();
        first.destroy(&orphan).await.unwrap();
        // The adopted leader was reaped by its real parent.
        assert_eq!(second.wait(&known).await.unwrap(), None);
    }

    #[tokio::test]
    async fn terminate_sends_sigterm() {
        let root = tempfile::tempdir().unwrap();
        let launcher = PosixLauncher::new(root.path());
        let id = ContainerId::new("c1");

        launcher.launch(&id, sh("sleep 300")).await.unwrap();
        launcher.terminate(&id).await.unwrap();

        let status = launcher.wait(&id).await.unwrap().unwrap();
        assert!(libc::WIFSIGNALED(status));
        assert_eq!(libc::WTERMSIG(status), libc::SIGTERM);
    }

    #[tokio::test]
    async fn caller_hooks_run_before_exec() {
        let root = tempfile::tempdir().unwrap();
        let launcher = PosixLauncher::new(root.path());
        let id = ContainerId::new("c1");
        let out = root.path().join("umask");

        let mut request = sh("umask");
        request.stdout = crate::launcher::Redirect::File(out.clone());
        request.hooks.push(unsafe {
            crate::hooks::PreExecHook::new("umask", || {
                libc::umask(0o027);
                Ok(())
            })
        });
        launcher.launch(&id, request).await.unwrap();
        assert!(succeeded(launcher.wait(&id).await.unwrap().unwrap()));

        assert_eq!(std::fs::read_to_string(&out).unwrap().trim(), "0027");
    }
}
