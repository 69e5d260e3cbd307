//! Hooks supplied by whoever asks for a launch.
use std::fmt;
use std::io;
use std::sync::Arc;

use tokio::process::Command;

type HookFn = dyn Fn() -> io::Result<()> + Send + Sync + 'static;

/// A caller's `pre_exec` step. Runs after the session and rlimit hooks.
#[derive(Clone)]
pub struct PreExecHook {
    name: &'static str,
    run: Arc<HookFn>,
}

impl PreExecHook {
    /// # Safety
    ///
    /// `run` executes in the forked child before `execve`, under the same
    /// rules as [`std::os::unix::process::CommandExt::pre_exec`]: no
    /// allocation, no locks, async-signal-safe calls only.
    pub unsafe fn new(name: &'static str, run: impl Fn() -> io::Result<()> + Send + Sync + 'static) -> Self {
        Self {
            name,
            run: Arc::new(run),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for PreExecHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreExecHook").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Installs `hooks` in order. A failing hook aborts the spawn with its error.
#[cfg(unix)]
pub fn attach_hooks(cmd: &mut Command, hooks: &[PreExecHook]) {
    for hook in hooks {
        let PreExecHook { name, run } = hook.clone();
        // Safety: `PreExecHook::new` carries the pre_exec contract.
        unsafe {
            cmd.pre_exec(move || {
                run().inspect_err(|e| super::log::raw_log_errno(name.as_bytes(), e.raw_os_error().unwrap_or(0)))
            });
        }
    }
}

#[cfg(not(unix))]
pub fn attach_hooks(_cmd: &mut Command, _hooks: &[PreExecHook]) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failing_hook_aborts_the_spawn() {
        let mut cmd = Command::new("true");
        let hook = unsafe { PreExecHook::new("refuse", || Err(io::Error::from_raw_os_error(libc::EPERM))) };
        attach_hooks(&mut cmd, &[hook]);

        let err = cmd.spawn().unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EPERM));
    }

    #[test]
    fn debug_names_the_hook() {
        let hook = unsafe { PreExecHook::new("umask", || Ok(())) };
        assert_eq!(format!("{hook:?}"), "PreExecHook { name: \"umask\", .. }");
    }
}
