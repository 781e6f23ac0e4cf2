//! Descriptor duplication across processes.
//!
//! `pidfd_open` is available through rustix; `pidfd_getfd` (kernel 5.6) is
//! not, so it is issued as a raw syscall here. The caller needs
//! `PTRACE_MODE_ATTACH_REALCREDS` over the target, which the owner of a
//! rootless container has.

use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use rustix::io::Errno;

use crate::last_errno;

/// Duplicate `targetfd` from the process referred to by `pidfd`.
///
/// The returned fd refers to the same open file description as the target's
/// fd and has `O_CLOEXEC` set.
///
/// # Errors
///
/// - `EBADF` if `targetfd` is not open in the target
/// - `ESRCH` if the process behind `pidfd` has exited
/// - `EPERM` if the caller may not ptrace the target
pub fn pidfd_getfd(pidfd: BorrowedFd<'_>, targetfd: RawFd) -> Result<OwnedFd, Errno> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_pidfd_getfd,
            pidfd.as_raw_fd(),
            targetfd,
            0 as libc::c_uint,
        )
    };
    if ret < 0 {
        Err(last_errno())
    } else {
        // SAFETY: On success, ret is a fresh fd owned by this process.
        Ok(unsafe { OwnedFd::from_raw_fd(ret as RawFd) })
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsFd;

    use rustix::process::{PidfdFlags, getpid, pidfd_open};

    use super::*;

    #[test]
    #[ignore = "requires pidfd_getfd (Linux 5.6+) and an unconfined test runner"]
    fn duplicate_own_fd() {
        let (read, _write) = rustix::pipe::pipe().unwrap();
        let pidfd = pidfd_open(getpid(), PidfdFlags::empty()).unwrap();

        let dup = pidfd_getfd(pidfd.as_fd(), read.as_raw_fd()).unwrap();
        assert_ne!(dup.as_raw_fd(), read.as_raw_fd());
    }

    #[test]
    #[ignore = "requires pidfd_getfd (Linux 5.6+) and an unconfined test runner"]
    fn missing_fd_is_ebadf() {
        let pidfd = pidfd_open(getpid(), PidfdFlags::empty()).unwrap();
        assert_eq!(pidfd_getfd(pidfd.as_fd(), 100_000).unwrap_err(), Errno::BADF);
    }
}
