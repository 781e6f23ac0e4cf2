//! Unix socket fd passing via `SCM_RIGHTS`.
//!
//! Used in two places: the container runtime hands us its state document and
//! the seccomp listener fd in one message, and the memory helper child sends
//! back the `/proc/<pid>/mem` fd it opened inside the target's user namespace.
//!
//! `send_fd` runs in a freshly forked child, so it must not allocate: the
//! control buffer lives on the stack.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

/// Most descriptors accepted in one message.
pub const MAX_FDS: usize = 16;

// Enough 8-byte words for CMSG_SPACE(MAX_FDS * sizeof(int)).
const CMSG_WORDS: usize = 16;

/// Create an `AF_UNIX SOCK_STREAM` socketpair.
///
/// Returns `(parent_sock, child_sock)`. After fork, parent closes `child_sock`
/// and child closes `parent_sock`.
pub fn create_socketpair() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0i32; 2];
    let ret = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Send one file descriptor over a unix socket.
pub fn send_fd(socket: BorrowedFd<'_>, fd: RawFd) -> io::Result<()> {
    send_with_fds(socket, &[0u8], &[fd])
}

/// Send `payload` with up to [`MAX_FDS`] descriptors attached.
pub fn send_with_fds(socket: BorrowedFd<'_>, payload: &[u8], fds: &[RawFd]) -> io::Result<()> {
    if fds.is_empty() || fds.len() > MAX_FDS {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "fd count out of range",
        ));
    }
    let fds_len = size_of_val(fds);

    let iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };

    let mut cmsg_buf = [0u64; CMSG_WORDS];
    let cmsg_space = unsafe { libc::CMSG_SPACE(fds_len as u32) } as usize;

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &iov as *const _ as *mut _;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast();
    msg.msg_controllen = cmsg_space;

    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    if cmsg.is_null() {
        return Err(io::Error::other("CMSG_FIRSTHDR null"));
    }
    unsafe {
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(fds_len as u32) as usize;
        std::ptr::copy_nonoverlapping(fds.as_ptr().cast::<u8>(), libc::CMSG_DATA(cmsg), fds_len);
    }

    let ret = unsafe { libc::sendmsg(socket.as_raw_fd(), &msg, libc::MSG_NOSIGNAL) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Receive one message into `buf` together with any passed descriptors.
///
/// Returns the number of payload bytes and the received fds, which are marked
/// close-on-exec. A truncated control message is an error; any descriptors
/// that did arrive are closed.
pub fn recv_with_fds(socket: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };

    let mut cmsg_buf = [0u64; CMSG_WORDS];
    let cmsg_space = unsafe { libc::CMSG_SPACE((MAX_FDS * size_of::<RawFd>()) as u32) } as usize;

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast();
    msg.msg_controllen = cmsg_space;

    let n = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msg, libc::MSG_CMSG_CLOEXEC) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut fds = Vec::new();
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    while !cmsg.is_null() {
        unsafe {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let payload = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                let data = libc::CMSG_DATA(cmsg);
                for i in 0..payload / size_of::<RawFd>() {
                    let mut fd: RawFd = -1;
                    std::ptr::copy_nonoverlapping(
                        data.add(i * size_of::<RawFd>()),
                        (&mut fd as *mut RawFd).cast::<u8>(),
                        size_of::<RawFd>(),
                    );
                    fds.push(OwnedFd::from_raw_fd(fd));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "control message truncated",
        ));
    }

    Ok((n as usize, fds))
}

/// Receive exactly one file descriptor.
pub fn recv_fd(socket: BorrowedFd<'_>) -> io::Result<OwnedFd> {
    let mut data = [0u8; 1];
    let (_, mut fds) = recv_with_fds(socket, &mut data)?;
    match fds.len() {
        1 => Ok(fds.remove(0)),
        0 => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "no control message received",
        )),
        n => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("expected one fd, got {n}"),
        )),
    }
}
