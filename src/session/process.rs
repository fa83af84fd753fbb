//! Process primitives used by the session launcher
//!
//! Every step of the privilege transition goes through [`ProcessOps`] so
//! the ordering can be observed (and individual steps failed) without
//! root or a real fork.

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, ForkResult, Gid, Pid, Uid};
use std::ffi::{CStr, CString};

/// Process-level operations of the privilege transition
pub trait ProcessOps: Send + Sync {
    /// Create a child process running `child`; returns the child pid to
    /// the parent. The child exits with the status `child` returns.
    fn spawn(&self, child: &mut dyn FnMut() -> i32) -> nix::Result<Pid>;

    /// Initialize the supplementary group list for `user`
    fn init_groups(&self, user: &CStr, group: Gid) -> nix::Result<()>;

    fn set_gid(&self, gid: Gid) -> nix::Result<()>;

    fn set_uid(&self, uid: Uid) -> nix::Result<()>;

    fn change_dir(&self, dir: &CStr) -> nix::Result<()>;

    /// Replace the process image; only returns on failure
    fn exec(&self, program: &CStr, argv: &[CString], envp: &[CString]) -> Errno;

    /// Poll a child without blocking; `Some(status)` once it has exited
    fn try_reap(&self, pid: Pid) -> nix::Result<Option<i32>>;
}

/// Real process operations
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessOps;

impl ProcessOps for SystemProcessOps {
    #[allow(unsafe_code)]
    fn spawn(&self, child: &mut dyn FnMut() -> i32) -> nix::Result<Pid> {
        // SAFETY: the child runs only the launcher's prepared steps and an
        // unlocked audit write, then leaves through _exit without unwinding.
        match unsafe { unistd::fork() }? {
            ForkResult::Parent { child } => Ok(child),
            ForkResult::Child => {
                let status = child();
                // SAFETY: _exit skips atexit handlers and stdio flushing
                // inherited from the parent.
                unsafe { libc::_exit(status) }
            }
        }
    }

    fn init_groups(&self, user: &CStr, group: Gid) -> nix::Result<()> {
        unistd::initgroups(user, group)
    }

    fn set_gid(&self, gid: Gid) -> nix::Result<()> {
        unistd::setgid(gid)
    }

    fn set_uid(&self, uid: Uid) -> nix::Result<()> {
        unistd::setuid(uid)
    }

    fn change_dir(&self, dir: &CStr) -> nix::Result<()> {
        unistd::chdir(dir)
    }

    fn exec(&self, program: &CStr, argv: &[CString], envp: &[CString]) -> Errno {
        match unistd::execve(program, argv, envp) {
            Err(errno) => errno,
            Ok(never) => match never {},
        }
    }

    fn try_reap(&self, pid: Pid) -> nix::Result<Option<i32>> {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG))? {
            WaitStatus::Exited(_, code) => Ok(Some(code)),
            WaitStatus::Signaled(_, signal, _) => Ok(Some(128 + signal as i32)),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_reap_unknown_child() {
        // Not our child: ECHILD
        assert_eq!(
            SystemProcessOps.try_reap(Pid::from_raw(i32::MAX)),
            Err(Errno::ECHILD)
        );
    }
}
