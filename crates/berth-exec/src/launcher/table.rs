use std::collections::HashMap;
use std::process::ExitStatus;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::watch;
use tracing::{debug, warn};

use berth_model::ContainerId;

/// How often an adopted process is checked for liveness.
const ADOPTED_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Exit {
    /// Raw wait status of a process we reaped ourselves.
    Status(i32),
    /// An adopted process vanished; someone else reaped it.
    Unobserved,
}

struct Boundary {
    pid: u32,
    exit: watch::Receiver<Option<Exit>>,
}

/// Boundaries a launcher started or adopted, keyed by identity.
#[derive(Default)]
pub(super) struct Boundaries {
    inner: Mutex<HashMap<ContainerId, Boundary>>,
}

impl Boundaries {
    fn lock(&self) -> MutexGuard<'_, HashMap<ContainerId, Boundary>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(super) fn contains(&self, id: &ContainerId) -> bool {
        self.lock().contains_key(id)
    }

    pub(super) fn pid(&self, id: &ContainerId) -> Option<u32> {
        self.lock().get(id).map(|b| b.pid)
    }

    /// Tracks a spawned child and reaps it in the background.
    pub(super) fn track_child(&self, id: ContainerId, pid: u32, mut child: Child) {
        let (tx, exit) = watch::channel(None);
        let container = id.clone();
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => Exit::Status(raw_status(status)),
                Err(e) => {
                    warn!(container = %container, error = %e, "failed to reap boundary leader");
                    Exit::Unobserved
                }
            };
            debug!(container = %container, pid, ?exit, "boundary leader exited");
            tx.send_replace(Some(exit));
        });
        self.lock().insert(id, Boundary { pid, exit });
    }

    /// Tracks a process that outlived a previous launcher instance.
    pub(super) fn adopt(&self, id: ContainerId, pid: u32) {
        let (tx, exit) = watch::channel(None);
        tokio::spawn(async move {
            while is_alive(pid) {
                tokio::time::sleep(ADOPTED_POLL).await;
            }
            tx.send_replace(Some(Exit::Unobserved));
        });
        self.lock().insert(id, Boundary { pid, exit });
    }

    /// Resolves with the leader's exit; `None` for an unknown boundary.
    pub(super) async fn wait(&self, id: &ContainerId) -> Option<Exit> {
        let mut rx = self.lock().get(id)?.exit.clone();
        let exit = match rx.wait_for(Option::is_some).await {
            Ok(exit) => *exit,
            Err(_) => None,
        };
        Some(exit.unwrap_or(Exit::Unobserved))
    }

    pub(super) fn remove(&self, id: &ContainerId) {
        self.lock().remove(id);
    }

    /// Tracked boundaries nested inside `id`, innermost first.
    pub(super) fn descendants(&self, id: &ContainerId) -> Vec<ContainerId> {
        let mut found: Vec<ContainerId> = self
            .lock()
            .keys()
            .filter(|c| is_descendant(c, id))
            .cloned()
            .collect();
        found.sort_by_key(|c| std::cmp::Reverse(c.lineage().len()));
        found
    }
}

fn is_descendant(candidate: &ContainerId, ancestor: &ContainerId) -> bool {
    let mut current = candidate.parent();
    while let Some(parent) = current {
        if parent == ancestor {
            return true;
        }
        current = parent.parent();
    }
    false
}

#[cfg(unix)]
fn raw_status(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.into_raw()
}

#[cfg(not(unix))]
fn raw_status(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Whether `pid` still names a process, ours or not.
#[cfg(unix)]
pub(super) fn is_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub(super) fn is_alive(_pid: u32) -> bool {
    false
}
