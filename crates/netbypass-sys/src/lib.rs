//! Low-level Linux syscall wrappers for socket bypass.
//!
//! This crate provides thin wrappers around the kernel interfaces the bypass
//! engine needs that are not (fully) covered by rustix. For standard
//! syscalls, use rustix.
//!
//! ## Modules
//!
//! - **`seccomp_notify`** - Seccomp user notification structs and ioctls
//! - **pidfd** - Duplicating descriptors out of another process (`pidfd_getfd`)
//! - **socket** - Raw socket option, fcntl and bind calls on borrowed fds
//! - **check** - Runtime system capability detection
//!
//! ## Seccomp user notification
//!
//! A filter installed with `SECCOMP_FILTER_FLAG_NEW_LISTENER` yields a listener
//! fd. The supervisor receives notifications on it, optionally injects a
//! descriptor into the notifying process with `SECCOMP_IOCTL_NOTIF_ADDFD`, and
//! answers with `SECCOMP_IOCTL_NOTIF_SEND`.
//!
//! # Safety
//!
//! This crate contains raw syscall wrappers. Casts between integer types
//! are unavoidable when interfacing with the kernel ABI.

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod check;
pub mod pidfd;
pub mod seccomp_notify;
pub mod socket;

pub use check::{CheckError, SystemInfo, check};

#[inline]
pub fn last_errno() -> rustix::io::Errno {
    // SAFETY: __errno_location always returns valid thread-local pointer.
    rustix::io::Errno::from_raw_os_error(unsafe { *libc::__errno_location() })
}
