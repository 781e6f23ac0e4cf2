//! Raw socket calls on borrowed fds.
//!
//! The bypass engine replays option values it copied byte-for-byte out of
//! another process, so these wrappers take untyped `(level, name, bytes)`
//! triples instead of rustix's typed socket options.

use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

use rustix::io::Errno;

use crate::last_errno;

/// Create a socket with `SOCK_CLOEXEC` set.
///
/// # Errors
///
/// Returns `Errno` from `socket(2)`.
pub fn socket(domain: i32, ty: i32, protocol: i32) -> Result<OwnedFd, Errno> {
    let ret = unsafe { libc::socket(domain, ty | libc::SOCK_CLOEXEC, protocol) };
    if ret < 0 {
        Err(last_errno())
    } else {
        // SAFETY: On success, ret is a fresh fd owned by this process.
        Ok(unsafe { OwnedFd::from_raw_fd(ret) })
    }
}

/// Read an integer socket option.
///
/// # Errors
///
/// `ENOTSOCK` if `fd` is not a socket.
pub fn getsockopt_int(fd: BorrowedFd<'_>, level: i32, name: i32) -> Result<i32, Errno> {
    let mut value: libc::c_int = 0;
    let mut len = size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            level,
            name,
            (&mut value as *mut libc::c_int).cast(),
            &mut len,
        )
    };
    if ret < 0 { Err(last_errno()) } else { Ok(value) }
}

/// Set a socket option from its raw byte representation.
///
/// # Errors
///
/// Returns `Errno` from `setsockopt(2)`.
pub fn setsockopt_raw(fd: BorrowedFd<'_>, level: i32, name: i32, value: &[u8]) -> Result<(), Errno> {
    let ptr = if value.is_empty() {
        std::ptr::null()
    } else {
        value.as_ptr().cast()
    };
    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            level,
            name,
            ptr,
            value.len() as libc::socklen_t,
        )
    };
    if ret < 0 { Err(last_errno()) } else { Ok(()) }
}

/// Whether the socket already has a peer.
///
/// # Errors
///
/// Any `getpeername(2)` failure other than `ENOTCONN`.
pub fn has_peer(fd: BorrowedFd<'_>) -> Result<bool, Errno> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret = unsafe {
        libc::getpeername(
            fd.as_raw_fd(),
            (&mut storage as *mut libc::sockaddr_storage).cast(),
            &mut len,
        )
    };
    if ret == 0 {
        return Ok(true);
    }
    match last_errno() {
        Errno::NOTCONN => Ok(false),
        e => Err(e),
    }
}

/// Bind to a raw `sockaddr` buffer.
///
/// # Errors
///
/// Returns `Errno` from `bind(2)`.
pub fn bind_raw(fd: BorrowedFd<'_>, addr: &[u8]) -> Result<(), Errno> {
    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            addr.as_ptr().cast(),
            addr.len() as libc::socklen_t,
        )
    };
    if ret < 0 { Err(last_errno()) } else { Ok(()) }
}

/// `fcntl(fd, F_GETFL)`.
///
/// # Errors
///
/// Returns `Errno` from `fcntl(2)`.
pub fn get_status_flags(fd: BorrowedFd<'_>) -> Result<i32, Errno> {
    let ret = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
    if ret < 0 { Err(last_errno()) } else { Ok(ret) }
}

/// `fcntl(fd, F_SETFL, flags)`.
///
/// # Errors
///
/// Returns `Errno` from `fcntl(2)`.
pub fn set_status_flags(fd: BorrowedFd<'_>, flags: i32) -> Result<(), Errno> {
    let ret = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags) };
    if ret < 0 { Err(last_errno()) } else { Ok(()) }
}
