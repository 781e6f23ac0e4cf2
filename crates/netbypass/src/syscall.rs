//! Decoded notifications and responses.
//!
//! The raw syscall number is decoded once into [`Syscall`]. Anything the
//! filter forwards that we do not act on, including syscalls from a foreign
//! architecture (e.g. 32-bit compat calls), lands in [`Syscall::Unsupported`].

use std::fmt;

use netbypass_sys::seccomp_notify::{AUDIT_ARCH_NATIVE, SeccompNotif, SeccompNotifResp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Syscall {
    Bind,
    Connect,
    SendTo,
    SendMsg,
    SetSockOpt,
    Fcntl,
    GetPeerName,
    Close,
    /// `exit` (`group == false`) or `exit_group`.
    Exit { group: bool },
    Unsupported(i32),
}

impl Syscall {
    pub fn decode(arch: u32, nr: i32) -> Self {
        if arch != AUDIT_ARCH_NATIVE {
            return Self::Unsupported(nr);
        }
        match i64::from(nr) {
            libc::SYS_bind => Self::Bind,
            libc::SYS_connect => Self::Connect,
            libc::SYS_sendto => Self::SendTo,
            libc::SYS_sendmsg => Self::SendMsg,
            libc::SYS_setsockopt => Self::SetSockOpt,
            libc::SYS_fcntl => Self::Fcntl,
            libc::SYS_getpeername => Self::GetPeerName,
            libc::SYS_close => Self::Close,
            libc::SYS_exit => Self::Exit { group: false },
            libc::SYS_exit_group => Self::Exit { group: true },
            _ => Self::Unsupported(nr),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Bind => "bind",
            Self::Connect => "connect",
            Self::SendTo => "sendto",
            Self::SendMsg => "sendmsg",
            Self::SetSockOpt => "setsockopt",
            Self::Fcntl => "fcntl",
            Self::GetPeerName => "getpeername",
            Self::Close => "close",
            Self::Exit { group: false } => "exit",
            Self::Exit { group: true } => "exit_group",
            Self::Unsupported(_) => "unsupported",
        }
    }
}

impl fmt::Display for Syscall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsupported(nr) => write!(f, "unsupported({nr})"),
            other => f.write_str(other.name()),
        }
    }
}

/// One intercepted syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    pub id: u64,
    /// Calling thread id.
    pub pid: u32,
    pub syscall: Syscall,
    pub args: [u64; 6],
}

impl Notification {
    /// First argument as an fd, for the syscalls that take one.
    pub fn fd(&self) -> Option<i32> {
        // int arguments only occupy the low half of the register
        Some(self.args[0] as i32).filter(|fd| *fd >= 0)
    }
}

impl From<&SeccompNotif> for Notification {
    fn from(raw: &SeccompNotif) -> Self {
        Self {
            id: raw.id,
            pid: raw.pid,
            syscall: Syscall::decode(raw.data.arch, raw.data.nr),
            args: raw.data.args,
        }
    }
}

/// Answer to one notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    pub id: u64,
    /// Run the original syscall after responding.
    pub continue_syscall: bool,
    /// Return value when the syscall was emulated.
    pub val: i64,
    /// fd number a host socket was installed at, if any.
    pub injected_fd: Option<i32>,
}

impl Response {
    pub fn continue_syscall(id: u64) -> Self {
        Self {
            id,
            continue_syscall: true,
            val: 0,
            injected_fd: None,
        }
    }

    pub fn emulated(id: u64, val: i64) -> Self {
        Self {
            id,
            continue_syscall: false,
            val,
            injected_fd: None,
        }
    }

    pub fn with_injected(mut self, fd: i32) -> Self {
        self.injected_fd = Some(fd);
        self
    }

    pub fn to_raw(&self) -> SeccompNotifResp {
        if self.continue_syscall {
            SeccompNotifResp::continue_syscall(self.id)
        } else {
            SeccompNotifResp::value(self.id, self.val)
        }
    }
}
