//! Monitored process memory access.
//!
//! `/proc/<tgid>/mem` is opened read-write once per thread group and used for
//! positioned reads and writes. Opening it needs ptrace-attach rights over the
//! target. When the target lives in a user namespace where those checks fail
//! (for example after it dropped its dumpable flag), a short-lived helper is
//! forked that joins the target's user namespace, opens the file there and
//! sends the fd back over a socketpair.
//!
//! Both ends of the handoff are bounded by [`HELPER_TIMEOUT`]: the helper sets
//! a send timeout, the parent polls and kills the helper when it expires.

use std::ffi::{CStr, CString};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::fs::FileExt;
use std::time::Duration;

use crate::error::{BypassError, Result};
use crate::notify::scm_rights;

/// Upper bound on the helper handoff, enforced on both ends.
pub const HELPER_TIMEOUT: Duration = Duration::from_millis(500);

/// Open memory handle of one thread group.
#[derive(Debug)]
pub struct ProcessMemory {
    tgid: u32,
    file: File,
}

impl ProcessMemory {
    /// Open the memory of `tgid`, falling back to the namespace helper.
    pub fn open(tgid: u32) -> Result<Self> {
        match open_direct(tgid) {
            Ok(file) => Ok(Self { tgid, file }),
            Err(BypassError::Permission { source, .. }) => {
                tracing::debug!(tgid, error = %source, "direct memory access denied, using helper");
                let file = open_via_helper(tgid).map_err(|reason| BypassError::Helper {
                    pid: tgid,
                    reason,
                })?;
                Ok(Self { tgid, file })
            }
            Err(e) => Err(e),
        }
    }

    pub fn tgid(&self) -> u32 {
        self.tgid
    }

    /// Read exactly `len` bytes at `addr`.
    pub fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.file
            .read_exact_at(&mut buf, addr)
            .map_err(|e| self.map_access_error(e))?;
        Ok(buf)
    }

    /// Write all of `data` at `addr`.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        self.file
            .write_all_at(data, addr)
            .map_err(|e| self.map_access_error(e))
    }

    fn map_access_error(&self, e: io::Error) -> BypassError {
        // Reads of an exited process's mm come back empty.
        if e.kind() == io::ErrorKind::UnexpectedEof {
            BypassError::ProcessGone { pid: self.tgid }
        } else {
            BypassError::Io(e)
        }
    }
}

fn open_direct(tgid: u32) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(format!("/proc/{tgid}/mem"))
        .map_err(|e| match e.kind() {
            io::ErrorKind::PermissionDenied => BypassError::Permission {
                pid: tgid,
                source: e,
            },
            io::ErrorKind::NotFound => BypassError::ProcessGone { pid: tgid },
            _ => BypassError::Io(e),
        })
}

fn open_via_helper(tgid: u32) -> std::result::Result<File, String> {
    // Everything the child touches is prepared here: after fork only
    // async-signal-safe calls are allowed.
    let userns = CString::new(format!("/proc/{tgid}/ns/user")).map_err(|e| e.to_string())?;
    let mem = CString::new(format!("/proc/{tgid}/mem")).map_err(|e| e.to_string())?;
    let (parent_sock, child_sock) = scm_rights::create_socketpair().map_err(|e| e.to_string())?;

    let child_pid = unsafe { libc::fork() };
    if child_pid < 0 {
        return Err(format!("fork: {}", io::Error::last_os_error()));
    }

    if child_pid == 0 {
        drop(parent_sock);
        let code = helper_child(&userns, &mem, child_sock.as_fd());
        unsafe { libc::_exit(code) }
    }

    drop(child_sock);
    let received = poll_or_kill(parent_sock.as_raw_fd(), child_pid).and_then(|()| {
        scm_rights::recv_fd(parent_sock.as_fd()).map_err(|e| format!("receive mem fd: {e}"))
    });

    let status = reap(child_pid);
    match received {
        Ok(fd) => Ok(File::from(fd)),
        Err(reason) => Err(match status {
            Some(code) if code != 0 => format!("{reason} (helper exited with {code})"),
            _ => reason,
        }),
    }
}

/// Runs in the forked helper. Returns the exit code.
fn helper_child(userns: &CStr, mem: &CStr, sock: BorrowedFd<'_>) -> i32 {
    let timeout = libc::timeval {
        tv_sec: 0,
        tv_usec: HELPER_TIMEOUT.as_micros() as libc::suseconds_t,
    };
    unsafe {
        libc::setsockopt(
            sock.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_SNDTIMEO,
            (&timeout as *const libc::timeval).cast(),
            size_of::<libc::timeval>() as libc::socklen_t,
        );

        let ns = libc::open(userns.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC);
        if ns < 0 {
            return 10;
        }
        if libc::setns(ns, libc::CLONE_NEWUSER) < 0 {
            return 11;
        }
        let fd = libc::open(mem.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC);
        if fd < 0 {
            return 12;
        }
        if scm_rights::send_fd(sock, fd).is_err() {
            return 13;
        }
    }
    0
}

/// Poll the handoff socket; kill the helper on timeout or error.
fn poll_or_kill(fd: i32, child_pid: libc::pid_t) -> std::result::Result<(), String> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout_ms = HELPER_TIMEOUT.as_millis() as i32;
    if unsafe { libc::poll(&mut pfd, 1, timeout_ms) } <= 0 {
        unsafe { libc::kill(child_pid, libc::SIGKILL) };
        return Err(format!("timeout waiting for helper after {timeout_ms}ms"));
    }
    Ok(())
}

fn reap(child_pid: libc::pid_t) -> Option<i32> {
    let mut status = 0;
    loop {
        let ret = unsafe { libc::waitpid(child_pid, &mut status, 0) };
        if ret == child_pid {
            break;
        }
        if ret < 0 && io::Error::last_os_error().kind() != io::ErrorKind::Interrupted {
            return None;
        }
    }
    libc::WIFEXITED(status).then(|| libc::WEXITSTATUS(status))
}
