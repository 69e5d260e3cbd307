//! Puts a boundary's first process into its own session.
//!
//! A process group cannot span sessions, so a fresh session makes the first
//! process the leader of both; its pid then names the whole boundary.
use tokio::process::Command;

#[cfg(unix)]
pub fn attach_session(cmd: &mut Command) {
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                let e = std::io::Error::last_os_error();
                super::log::raw_log_errno(b"setsid", e.raw_os_error().unwrap_or(0));
                return Err(e);
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
pub fn attach_session(_cmd: &mut Command) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn child_leads_its_own_session() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("sleep 5");
        attach_session(&mut cmd);

        let mut child = cmd.spawn().unwrap();
        let pid = child.id().unwrap() as libc::pid_t;
        assert_eq!(unsafe { libc::getsid(pid) }, pid);
        assert_eq!(unsafe { libc::getpgid(pid) }, pid);

        child.kill().await.unwrap();
    }
}
