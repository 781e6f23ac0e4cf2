//! Pid to process handle resolution.
//!
//! Seccomp reports the id of the calling thread. `pidfd_open` only accepts
//! thread-group leaders and fails with `EINVAL` for other threads, in which
//! case the leader is looked up in `/proc/<pid>/status` and opened instead.

use std::fs;
use std::io;
use std::os::fd::OwnedFd;

use rustix::io::Errno;
use rustix::process::{Pid, PidfdFlags, pidfd_open};

use crate::error::{BypassError, Result};

/// An open handle on a thread group.
#[derive(Debug)]
pub struct ProcessHandle {
    pub pidfd: OwnedFd,
    pub tgid: u32,
}

/// Open the thread group `pid` belongs to.
pub fn resolve(pid: u32) -> Result<ProcessHandle> {
    match open_pidfd(pid) {
        Ok(pidfd) => Ok(ProcessHandle { pidfd, tgid: pid }),
        Err(BypassError::Kernel {
            errno: Errno::INVAL,
            ..
        }) => {
            let tgid = read_tgid(pid)?;
            if tgid == pid {
                return Err(BypassError::Kernel {
                    op: "pidfd_open",
                    errno: Errno::INVAL,
                });
            }
            tracing::trace!(pid, tgid, "resolved thread to its group leader");
            let pidfd = open_pidfd(tgid)?;
            Ok(ProcessHandle { pidfd, tgid })
        }
        Err(e) => Err(e),
    }
}

fn open_pidfd(pid: u32) -> Result<OwnedFd> {
    let raw = i32::try_from(pid).map_err(|_| BypassError::ProcessGone { pid })?;
    let pid_t = Pid::from_raw(raw).ok_or(BypassError::ProcessGone { pid })?;
    pidfd_open(pid_t, PidfdFlags::empty()).map_err(|errno| match errno {
        Errno::SRCH => BypassError::ProcessGone { pid },
        errno => BypassError::Kernel {
            op: "pidfd_open",
            errno,
        },
    })
}

fn read_tgid(pid: u32) -> Result<u32> {
    let status = fs::read_to_string(format!("/proc/{pid}/status")).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            BypassError::ProcessGone { pid }
        } else {
            BypassError::Io(e)
        }
    })?;
    parse_tgid(&status).ok_or_else(|| {
        BypassError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("no Tgid in /proc/{pid}/status"),
        ))
    })
}

/// Extract `Tgid:` from the contents of `/proc/<pid>/status`.
pub fn parse_tgid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Tgid:"))
        .and_then(|v| v.trim().parse().ok())
}
