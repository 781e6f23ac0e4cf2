use std::fs;
use std::net::SocketAddr;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};

use netbypass_sys::pidfd::pidfd_getfd;
use netbypass_sys::seccomp_notify::{SECCOMP_ADDFD_FLAG_SETFD, SeccompNotifAddfd, notif_addfd};
use netbypass_sys::socket as sys;
use rustix::io::Errno;

use super::{FdKind, Host, SocketArgs};
use crate::error::{BypassError, Result};
use crate::process::{self, ProcessHandle, ProcessMemory};
use crate::sockaddr;
use crate::socket::ReplayOption;

/// Host backed by the real kernel and one seccomp listener.
#[derive(Debug)]
pub struct LinuxHost {
    listener: OwnedFd,
}

impl LinuxHost {
    pub fn new(listener: OwnedFd) -> Self {
        Self { listener }
    }
}

/// A monitored thread group. Its memory is opened on first use.
#[derive(Debug)]
pub struct LinuxProcess {
    handle: ProcessHandle,
    memory: Option<ProcessMemory>,
}

impl LinuxProcess {
    fn memory(&mut self) -> Result<&ProcessMemory> {
        if self.memory.is_none() {
            self.memory = Some(ProcessMemory::open(self.handle.tgid)?);
        }
        self.memory
            .as_ref()
            .ok_or(BypassError::ProcessGone { pid: self.handle.tgid })
    }
}

impl Host for LinuxHost {
    type Process = LinuxProcess;
    type Socket = OwnedFd;

    fn open_process(&mut self, pid: u32) -> Result<(LinuxProcess, u32)> {
        let handle = process::resolve(pid)?;
        let tgid = handle.tgid;
        Ok((
            LinuxProcess {
                handle,
                memory: None,
            },
            tgid,
        ))
    }

    fn inspect_fd(&mut self, process: &LinuxProcess, fd: i32) -> Result<FdKind> {
        let tgid = process.handle.tgid;
        let dup = match pidfd_getfd(process.handle.pidfd.as_fd(), fd) {
            Ok(dup) => dup,
            Err(Errno::SRCH) => return Err(BypassError::ProcessGone { pid: tgid }),
            // Closed already: the syscall will fail on its own.
            Err(Errno::BADF) => return Ok(FdKind::NotSocket),
            Err(errno) => return Err(BypassError::kernel("pidfd_getfd")(errno)),
        };
        let dup = dup.as_fd();

        let domain = match sys::getsockopt_int(dup, libc::SOL_SOCKET, libc::SO_DOMAIN) {
            Ok(domain) => domain,
            Err(Errno::NOTSOCK) => return Ok(FdKind::NotSocket),
            Err(errno) => return Err(BypassError::kernel("getsockopt(SO_DOMAIN)")(errno)),
        };
        let ty = sys::getsockopt_int(dup, libc::SOL_SOCKET, libc::SO_TYPE)
            .map_err(BypassError::kernel("getsockopt(SO_TYPE)"))?;
        let protocol = sys::getsockopt_int(dup, libc::SOL_SOCKET, libc::SO_PROTOCOL)
            .map_err(BypassError::kernel("getsockopt(SO_PROTOCOL)"))?;
        let connected = sys::has_peer(dup).map_err(BypassError::kernel("getpeername"))?;
        let status = sys::get_status_flags(dup).map_err(BypassError::kernel("fcntl(F_GETFL)"))?;

        // FD_CLOEXEC belongs to the descriptor, not the file, so the dup
        // cannot tell; fdinfo reports it as O_CLOEXEC.
        let cloexec = fs::read_to_string(format!("/proc/{tgid}/fdinfo/{fd}"))
            .ok()
            .and_then(|info| parse_fdinfo_flags(&info))
            .is_some_and(|flags| flags & libc::O_CLOEXEC as u32 != 0);

        Ok(FdKind::Socket {
            args: SocketArgs {
                domain,
                ty,
                protocol,
            },
            connected,
            nonblocking: status & libc::O_NONBLOCK != 0,
            cloexec,
        })
    }

    fn read_memory(&mut self, process: &mut LinuxProcess, addr: u64, len: usize) -> Result<Vec<u8>> {
        process.memory()?.read(addr, len)
    }

    fn write_memory(&mut self, process: &mut LinuxProcess, addr: u64, data: &[u8]) -> Result<()> {
        process.memory()?.write(addr, data)
    }

    fn create_socket(&mut self, args: SocketArgs) -> Result<OwnedFd> {
        sys::socket(args.domain, args.ty, args.protocol).map_err(BypassError::kernel("socket"))
    }

    fn apply_option(&mut self, socket: &OwnedFd, option: &ReplayOption) -> Result<()> {
        match option {
            ReplayOption::SockOpt { level, name, value } => {
                sys::setsockopt_raw(socket.as_fd(), *level, *name, value)
                    .map_err(BypassError::kernel("setsockopt"))
            }
            ReplayOption::StatusFlags(flags) => sys::set_status_flags(socket.as_fd(), *flags)
                .map_err(BypassError::kernel("fcntl(F_SETFL)")),
        }
    }

    fn bind(&mut self, socket: &OwnedFd, addr: &SocketAddr) -> Result<()> {
        sys::bind_raw(socket.as_fd(), &sockaddr::encode(addr)).map_err(BypassError::kernel("bind"))
    }

    fn inject(&mut self, notif_id: u64, socket: &OwnedFd, target_fd: i32, cloexec: bool) -> Result<i32> {
        let addfd = SeccompNotifAddfd {
            id: notif_id,
            flags: SECCOMP_ADDFD_FLAG_SETFD,
            srcfd: socket.as_raw_fd() as u32,
            newfd: target_fd as u32,
            newfd_flags: if cloexec { libc::O_CLOEXEC as u32 } else { 0 },
        };
        notif_addfd(self.listener.as_fd(), &addfd).map_err(BypassError::kernel("SECCOMP_IOCTL_NOTIF_ADDFD"))
    }
}

/// Octal `flags:` field of `/proc/<pid>/fdinfo/<fd>`.
fn parse_fdinfo_flags(info: &str) -> Option<u32> {
    info.lines()
        .find_map(|line| line.strip_prefix("flags:"))
        .and_then(|v| u32::from_str_radix(v.trim(), 8).ok())
}
