use std::io;

use async_trait::async_trait;
use tracing::{debug, info};

use berth_model::ContainerId;

use super::table::{Boundaries, Exit};
use super::{LaunchRequest, LaunchedStatus, Launcher};
use crate::error::ExecError;

/// Launcher for platforms without sessions and process groups.
///
/// Only the first process is tracked and signalled; anything it forks is
/// outside the launcher's reach. Nothing is checkpointed, so nothing can be
/// recovered.
#[derive(Default)]
pub struct MinimalLauncher {
    boundaries: Boundaries,
}

impl MinimalLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    fn signal(&self, container_id: &ContainerId, signal: libc::c_int) -> Result<bool, ExecError> {
        let Some(pid) = self.boundaries.pid(container_id) else {
            return Ok(false);
        };
        let pid = libc::pid_t::try_from(pid)
            .map_err(|_| ExecError::InvalidRequest(format!("pid {pid} out of range")))?;
        if unsafe { libc::kill(pid, signal) } != 0 {
            let e = io::Error::last_os_error();
            if e.raw_os_error() != Some(libc::ESRCH) {
                return Err(ExecError::Signal {
                    container: container_id.clone(),
                    source: e,
                });
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl Launcher for MinimalLauncher {
    async fn recover(&self, _known: &[ContainerId]) -> Result<Vec<ContainerId>, ExecError> {
        Ok(Vec::new())
    }

    async fn launch(&self, container_id: &ContainerId, request: LaunchRequest) -> Result<u32, ExecError> {
        if self.boundaries.contains(container_id) {
            return Err(ExecError::AlreadyExists(container_id.clone()));
        }
        let (child, pid) = request.spawn(false)?;
        self.boundaries.track_child(container_id.clone(), pid, child);
        info!(container = %container_id, pid, program = %request.program, "launched process");
        Ok(pid)
    }

    async fn terminate(&self, container_id: &ContainerId) -> Result<(), ExecError> {
        if self.signal(container_id, libc::SIGTERM)? {
            Ok(())
        } else {
            Err(ExecError::UnknownContainer(container_id.clone()))
        }
    }

    async fn destroy(&self, container_id: &ContainerId) -> Result<(), ExecError> {
        for id in self
            .boundaries
            .descendants(container_id)
            .into_iter()
            .chain(std::iter::once(container_id.clone()))
        {
            if self.signal(&id, libc::SIGKILL)? {
                let exit = self.boundaries.wait(&id).await;
                debug!(container = %id, ?exit, "process destroyed");
                self.boundaries.remove(&id);
            }
        }
        Ok(())
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

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use berth_model::CommandInfo;

    #[tokio::test]
    async fn first_process_is_tracked_without_a_session() {
        let launcher = MinimalLauncher::new();
        let id = ContainerId::new("c1");
        let request = LaunchRequest::from_command(&CommandInfo::shell("sleep 300"));

        let pid = launcher.launch(&id, request).await.unwrap();
        assert_ne!(unsafe { libc::getsid(pid as libc::pid_t) }, pid as libc::pid_t);
        assert_eq!(launcher.status(&id).await.unwrap().pid, pid);
        assert!(launcher.recover(&[]).await.unwrap().is_empty());

        launcher.destroy(&id).await.unwrap();
        launcher.destroy(&id).await.unwrap();
        assert!(launcher.status(&id).await.is_err());
    }
}
