//! Seccomp user notification (`SECCOMP_RET_USER_NOTIF`) support.
//!
//! The container runtime installs a filter with
//! `SECCOMP_FILTER_FLAG_NEW_LISTENER` and hands the resulting listener fd to
//! the bypass daemon. The daemon then owns the supervisor side:
//!
//! 1. `SECCOMP_IOCTL_NOTIF_RECV` blocks until a filtered syscall arrives
//! 2. `SECCOMP_IOCTL_NOTIF_ID_VALID` tells whether the caller is still waiting
//! 3. `SECCOMP_IOCTL_NOTIF_ADDFD` installs one of our fds into the caller,
//!    optionally replacing an fd number that already exists (`SETFD`)
//! 4. `SECCOMP_IOCTL_NOTIF_SEND` answers, either with a return value or with
//!    `SECCOMP_USER_NOTIF_FLAG_CONTINUE` so the original syscall runs
//!
//! ## ioctl numbers
//!
//! The request numbers are not hard-coded: they are derived with the generic
//! `_IOC` encoding from the `'!'` magic and the size of the argument struct,
//! the same way `<linux/seccomp.h>` does. A struct layout mismatch therefore
//! shows up as a different request number, which the kernel rejects.

use std::os::fd::{AsRawFd, BorrowedFd};

use libc::c_ulong;
use rustix::io::Errno;

use crate::last_errno;

/// Let the syscall proceed as-is.
pub const SECCOMP_USER_NOTIF_FLAG_CONTINUE: u32 = 1;

/// Install the fd at exactly `newfd`, atomically closing whatever was there.
pub const SECCOMP_ADDFD_FLAG_SETFD: u32 = 1 << 0;
/// Inject the fd and respond to the notification in one step.
pub const SECCOMP_ADDFD_FLAG_SEND: u32 = 1 << 1;

/// `AUDIT_ARCH_*` value the kernel reports for native syscalls on this target.
#[cfg(target_arch = "x86_64")]
pub const AUDIT_ARCH_NATIVE: u32 = 0xc000_003e;
#[cfg(target_arch = "aarch64")]
pub const AUDIT_ARCH_NATIVE: u32 = 0xc000_00b7;
#[cfg(target_arch = "riscv64")]
pub const AUDIT_ARCH_NATIVE: u32 = 0xc000_00f3;

const SECCOMP_IOC_MAGIC: u8 = b'!';

const IOC_WRITE: c_ulong = 1;
const IOC_READ: c_ulong = 2;

const IOC_NRSHIFT: c_ulong = 0;
const IOC_TYPESHIFT: c_ulong = 8;
const IOC_SIZESHIFT: c_ulong = 16;
const IOC_DIRSHIFT: c_ulong = 30;

const fn ioc(dir: c_ulong, nr: c_ulong, size: usize) -> c_ulong {
    (dir << IOC_DIRSHIFT)
        | ((SECCOMP_IOC_MAGIC as c_ulong) << IOC_TYPESHIFT)
        | (nr << IOC_NRSHIFT)
        | ((size as c_ulong) << IOC_SIZESHIFT)
}

/// `SECCOMP_IOWR(0, struct seccomp_notif)`
pub const SECCOMP_IOCTL_NOTIF_RECV: c_ulong =
    ioc(IOC_READ | IOC_WRITE, 0, size_of::<SeccompNotif>());
/// `SECCOMP_IOWR(1, struct seccomp_notif_resp)`
pub const SECCOMP_IOCTL_NOTIF_SEND: c_ulong =
    ioc(IOC_READ | IOC_WRITE, 1, size_of::<SeccompNotifResp>());
/// `SECCOMP_IOW(2, __u64)`
pub const SECCOMP_IOCTL_NOTIF_ID_VALID: c_ulong = ioc(IOC_WRITE, 2, size_of::<u64>());
/// `SECCOMP_IOW(3, struct seccomp_notif_addfd)`
pub const SECCOMP_IOCTL_NOTIF_ADDFD: c_ulong = ioc(IOC_WRITE, 3, size_of::<SeccompNotifAddfd>());

/// Seccomp notification data (mirrors kernel `struct seccomp_data`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeccompData {
    /// Syscall number.
    pub nr: i32,
    /// Architecture (`AUDIT_ARCH_*`).
    pub arch: u32,
    /// Instruction pointer at time of syscall.
    pub instruction_pointer: u64,
    /// Syscall arguments.
    pub args: [u64; 6],
}

/// Notification received from the listener (mirrors kernel `struct seccomp_notif`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeccompNotif {
    /// Unique notification ID.
    pub id: u64,
    /// Thread id of the caller, in the supervisor's pid namespace.
    pub pid: u32,
    /// Flags (currently unused, must be 0).
    pub flags: u32,
    /// The syscall data.
    pub data: SeccompData,
}

/// Response to a notification (mirrors kernel `struct seccomp_notif_resp`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeccompNotifResp {
    /// Must match the notification ID.
    pub id: u64,
    /// Return value for the syscall.
    pub val: i64,
    /// Negated errno, or 0.
    pub error: i32,
    /// Flags (e.g., `SECCOMP_USER_NOTIF_FLAG_CONTINUE`).
    pub flags: u32,
}

impl SeccompNotifResp {
    /// Let the intercepted syscall run unmodified.
    pub fn continue_syscall(id: u64) -> Self {
        Self {
            id,
            val: 0,
            error: 0,
            flags: SECCOMP_USER_NOTIF_FLAG_CONTINUE,
        }
    }

    /// Complete the syscall on the caller's behalf with `val` as its result.
    pub fn value(id: u64, val: i64) -> Self {
        Self {
            id,
            val,
            error: 0,
            flags: 0,
        }
    }
}

/// fd injection request (mirrors kernel `struct seccomp_notif_addfd`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeccompNotifAddfd {
    /// Must match the notification ID.
    pub id: u64,
    /// `SECCOMP_ADDFD_FLAG_*`.
    pub flags: u32,
    /// The fd in the supervisor to inject.
    pub srcfd: u32,
    /// Target fd number, only honoured with `SECCOMP_ADDFD_FLAG_SETFD`.
    pub newfd: u32,
    /// Flags for the new fd (only `O_CLOEXEC` is accepted).
    pub newfd_flags: u32,
}

/// Receive a notification from the listener fd.
///
/// Blocks until a notification is available (or use poll first).
///
/// # Errors
///
/// Returns `Errno` on failure (`ENOENT` if the caller died before it could be
/// received).
pub fn notif_recv(listener: BorrowedFd<'_>, notif: &mut SeccompNotif) -> Result<(), Errno> {
    // The kernel refuses a receive buffer that is not zeroed.
    *notif = SeccompNotif::default();
    let ret = unsafe {
        libc::ioctl(
            listener.as_raw_fd(),
            SECCOMP_IOCTL_NOTIF_RECV,
            notif as *mut SeccompNotif,
        )
    };
    if ret < 0 { Err(last_errno()) } else { Ok(()) }
}

/// Send a response to a notification.
///
/// # Errors
///
/// Returns `Errno` on failure (`ENOENT` if the caller is no longer waiting).
pub fn notif_send(listener: BorrowedFd<'_>, resp: &SeccompNotifResp) -> Result<(), Errno> {
    let ret = unsafe {
        libc::ioctl(
            listener.as_raw_fd(),
            SECCOMP_IOCTL_NOTIF_SEND,
            resp as *const SeccompNotifResp,
        )
    };
    if ret < 0 { Err(last_errno()) } else { Ok(()) }
}

/// Check whether a notification ID is still valid.
///
/// # Errors
///
/// Returns `Errno::NOENT` if the caller is no longer blocked in the syscall.
pub fn notif_id_valid(listener: BorrowedFd<'_>, id: u64) -> Result<(), Errno> {
    let ret = unsafe {
        libc::ioctl(
            listener.as_raw_fd(),
            SECCOMP_IOCTL_NOTIF_ID_VALID,
            &id as *const u64,
        )
    };
    if ret < 0 { Err(last_errno()) } else { Ok(()) }
}

/// Inject a file descriptor into the notifying process.
///
/// Returns the fd number assigned in the target process.
///
/// # Errors
///
/// Returns `Errno` on failure.
pub fn notif_addfd(listener: BorrowedFd<'_>, addfd: &SeccompNotifAddfd) -> Result<i32, Errno> {
    let ret = unsafe {
        libc::ioctl(
            listener.as_raw_fd(),
            SECCOMP_IOCTL_NOTIF_ADDFD,
            addfd as *const SeccompNotifAddfd,
        )
    };
    if ret < 0 { Err(last_errno()) } else { Ok(ret) }
}
