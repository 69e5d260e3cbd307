//! POSIX rlimits applied to a boundary's first process.
//!
//! Limits are installed by a `pre_exec` hook, so the process never runs
//! without them. The soft limit becomes the requested value; the hard limit
//! is kept when it is already higher. On non-Unix platforms the request is
//! logged and ignored.
use serde::{Deserialize, Serialize};
use tokio::process::Command;

/// Declarative rlimits. `None` leaves the inherited limit alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RlimitConfig {
    /// `RLIMIT_NOFILE`.
    pub max_open_files: Option<u64>,
    /// `RLIMIT_FSIZE`; the kernel sends `SIGXFSZ` past it.
    pub max_file_size_bytes: Option<u64>,
    /// `RLIMIT_NPROC`.
    pub max_processes: Option<u64>,
    /// `RLIMIT_CORE = 0`.
    pub disable_core_dumps: bool,
}

impl RlimitConfig {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.max_open_files.is_none()
            && self.max_file_size_bytes.is_none()
            && self.max_processes.is_none()
            && !self.disable_core_dumps
    }
}

pub fn attach_rlimits(cmd: &mut Command, config: &RlimitConfig) {
    if config.is_empty() {
        return;
    }

    #[cfg(unix)]
    unix_impl::attach(cmd, config);

    #[cfg(not(unix))]
    {
        let _ = cmd;
        tracing::warn!(?config, "rlimits requested on a non-Unix OS; ignoring");
    }
}

#[cfg(unix)]
mod unix_impl {
    use std::io;

    use tokio::process::Command;

    use super::RlimitConfig;
    use crate::hooks::log::raw_log_errno;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    type Resource = libc::__rlimit_resource_t;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    type Resource = libc::c_int;

    pub(super) fn attach(cmd: &mut Command, config: &RlimitConfig) {
        let mut limits: Vec<(Resource, u64, &'static [u8])> = Vec::with_capacity(4);
        if let Some(n) = config.max_open_files {
            limits.push((libc::RLIMIT_NOFILE as Resource, n, b"RLIMIT_NOFILE"));
        }
        if let Some(n) = config.max_file_size_bytes {
            limits.push((libc::RLIMIT_FSIZE as Resource, n, b"RLIMIT_FSIZE"));
        }
        if let Some(n) = config.max_processes {
            limits.push((libc::RLIMIT_NPROC as Resource, n, b"RLIMIT_NPROC"));
        }
        if config.disable_core_dumps {
            limits.push((libc::RLIMIT_CORE as Resource, 0, b"RLIMIT_CORE"));
        }

        unsafe {
            cmd.pre_exec(move || {
                for (resource, value, name) in &limits {
                    if let Err(e) = apply(*resource, *value) {
                        raw_log_errno(name, e.raw_os_error().unwrap_or(0));
                        return Err(e);
                    }
                }
                Ok(())
            });
        }
    }

    fn apply(resource: Resource, value: u64) -> io::Result<()> {
        let soft = libc::rlim_t::try_from(value)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "rlimit exceeds platform maximum"))?;

        let mut current = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if unsafe { libc::getrlimit(resource, &mut current) } != 0 {
            return Err(io::Error::last_os_error());
        }

        let hard = if current.rlim_max == libc::RLIM_INFINITY || current.rlim_max > soft {
            current.rlim_max
        } else {
            soft
        };
        let wanted = libc::rlimit {
            rlim_cur: soft,
            rlim_max: hard,
        };
        if unsafe { libc::setrlimit(resource, &wanted) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}
