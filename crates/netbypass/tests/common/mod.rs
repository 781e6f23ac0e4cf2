//! In-memory host and notification source for driving the engine in tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use netbypass::notify::Notifications;
use netbypass::{
    BypassConfig, BypassError, FdKind, Host, NonBypassable, Notification, Registry, ReplayOption,
    Response, Result, SocketArgs, Syscall, sockaddr,
};

/// Base address of every fake process's memory.
pub const BASE: u64 = 0x7f00_0000_1000;

/// One call the engine made on the host, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostOp {
    Create { socket: usize, args: SocketArgs },
    Apply { socket: usize, option: ReplayOption },
    Bind { socket: usize, addr: SocketAddr },
    Write { tgid: u32, addr: u64, data: Vec<u8> },
    Inject { notif_id: u64, socket: usize, target_fd: i32, cloexec: bool },
}

#[derive(Debug, Default)]
pub struct FakeHost {
    /// pid -> tgid for non-leader threads.
    pub threads: HashMap<u32, u32>,
    pub memory: HashMap<u32, Vec<u8>>,
    pub fds: HashMap<(u32, i32), FdKind>,
    pub ops: Vec<HostOp>,
    pub sockets: usize,
    pub opens: usize,
    pub inspections: usize,
    pub gone: HashSet<u32>,
    /// Memory of these thread groups fails like a broken helper.
    pub helper_broken: HashSet<u32>,
    pub fail_bind: bool,
    pub fail_inject: bool,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_thread(&mut self, pid: u32, tgid: u32) {
        self.threads.insert(pid, tgid);
    }

    /// Register a fresh, unconnected TCP socket.
    pub fn add_tcp(&mut self, tgid: u32, fd: i32, domain: i32) {
        self.set_fd(tgid, fd, tcp(domain, false));
    }

    pub fn set_fd(&mut self, tgid: u32, fd: i32, kind: FdKind) {
        self.fds.insert((tgid, fd), kind);
    }

    /// Place `data` in the memory of `tgid` and return its address.
    pub fn put(&mut self, tgid: u32, data: &[u8]) -> u64 {
        let mem = self.memory.entry(tgid).or_default();
        let addr = BASE + mem.len() as u64;
        mem.extend_from_slice(data);
        // keep allocations apart so overruns show up
        mem.extend_from_slice(&[0xee; 8]);
        addr
    }

    pub fn put_addr(&mut self, tgid: u32, addr: &str) -> u64 {
        let addr: SocketAddr = addr.parse().unwrap();
        self.put(tgid, &sockaddr::encode(&addr))
    }

    pub fn peek(&self, tgid: u32, addr: u64, len: usize) -> Vec<u8> {
        let start = (addr - BASE) as usize;
        self.memory[&tgid][start..start + len].to_vec()
    }

    pub fn peek_addr(&self, tgid: u32, addr: u64, len: usize) -> SocketAddr {
        sockaddr::decode(&self.peek(tgid, addr, len)).unwrap()
    }

    pub fn injections(&self) -> Vec<&HostOp> {
        self.ops
            .iter()
            .filter(|op| matches!(op, HostOp::Inject { .. }))
            .collect()
    }

    pub fn writes(&self) -> Vec<&HostOp> {
        self.ops
            .iter()
            .filter(|op| matches!(op, HostOp::Write { .. }))
            .collect()
    }

    pub fn created(&self) -> usize {
        self.sockets
    }

    fn range(&self, tgid: u32, addr: u64, len: usize) -> Result<std::ops::Range<usize>> {
        let size = self.memory.get(&tgid).map_or(0, Vec::len);
        let start = addr.checked_sub(BASE).map(|s| s as usize);
        match start {
            Some(start) if start + len <= size => Ok(start..start + len),
            _ => Err(BypassError::Io(io::Error::from_raw_os_error(libc::EIO))),
        }
    }
}

impl Host for FakeHost {
    type Process = u32;
    type Socket = usize;

    fn open_process(&mut self, pid: u32) -> Result<(u32, u32)> {
        let tgid = self.threads.get(&pid).copied().unwrap_or(pid);
        if self.gone.contains(&tgid) {
            return Err(BypassError::ProcessGone { pid });
        }
        self.opens += 1;
        Ok((tgid, tgid))
    }

    fn inspect_fd(&mut self, process: &u32, fd: i32) -> Result<FdKind> {
        if self.gone.contains(process) {
            return Err(BypassError::ProcessGone { pid: *process });
        }
        self.inspections += 1;
        Ok(self.fds.get(&(*process, fd)).copied().unwrap_or(FdKind::NotSocket))
    }

    fn read_memory(&mut self, process: &mut u32, addr: u64, len: usize) -> Result<Vec<u8>> {
        let tgid = *process;
        if self.helper_broken.contains(&tgid) {
            return Err(BypassError::Helper {
                pid: tgid,
                reason: "helper timed out".into(),
            });
        }
        let range = self.range(tgid, addr, len)?;
        Ok(self.memory[&tgid][range].to_vec())
    }

    fn write_memory(&mut self, process: &mut u32, addr: u64, data: &[u8]) -> Result<()> {
        let tgid = *process;
        let range = self.range(tgid, addr, data.len())?;
        if let Some(mem) = self.memory.get_mut(&tgid) {
            mem[range].copy_from_slice(data);
        }
        self.ops.push(HostOp::Write {
            tgid,
            addr,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn create_socket(&mut self, args: SocketArgs) -> Result<usize> {
        let socket = self.sockets;
        self.sockets += 1;
        self.ops.push(HostOp::Create { socket, args });
        Ok(socket)
    }

    fn apply_option(&mut self, socket: &usize, option: &ReplayOption) -> Result<()> {
        self.ops.push(HostOp::Apply {
            socket: *socket,
            option: option.clone(),
        });
        Ok(())
    }

    fn bind(&mut self, socket: &usize, addr: &SocketAddr) -> Result<()> {
        if self.fail_bind {
            return Err(BypassError::Kernel {
                op: "bind",
                errno: rustix::io::Errno::ADDRINUSE,
            });
        }
        self.ops.push(HostOp::Bind {
            socket: *socket,
            addr: *addr,
        });
        Ok(())
    }

    fn inject(&mut self, notif_id: u64, socket: &usize, target_fd: i32, cloexec: bool) -> Result<i32> {
        if self.fail_inject {
            return Err(BypassError::Kernel {
                op: "SECCOMP_IOCTL_NOTIF_ADDFD",
                errno: rustix::io::Errno::NOENT,
            });
        }
        self.ops.push(HostOp::Inject {
            notif_id,
            socket: *socket,
            target_fd,
            cloexec,
        });
        Ok(target_fd)
    }
}

pub fn tcp(domain: i32, connected: bool) -> FdKind {
    FdKind::Socket {
        args: SocketArgs {
            domain,
            ty: libc::SOCK_STREAM,
            protocol: libc::IPPROTO_TCP,
        },
        connected,
        nonblocking: false,
        cloexec: false,
    }
}

pub fn registry(config: &BypassConfig) -> Registry<FakeHost> {
    Registry::new(config, Arc::new(NonBypassable::new(config.ignore.clone())))
}

pub fn config(published: &[&str]) -> BypassConfig {
    published
        .iter()
        .fold(BypassConfig::new(), |config, mapping| {
            config.publish(mapping.parse().unwrap()).unwrap()
        })
}

pub fn notif(id: u64, pid: u32, syscall: Syscall, args: [u64; 6]) -> Notification {
    Notification {
        id,
        pid,
        syscall,
        args,
    }
}

pub fn connect(id: u64, pid: u32, fd: i32, addr: u64, len: usize) -> Notification {
    notif(id, pid, Syscall::Connect, [fd as u64, addr, len as u64, 0, 0, 0])
}

pub fn bind(id: u64, pid: u32, fd: i32, addr: u64, len: usize) -> Notification {
    notif(id, pid, Syscall::Bind, [fd as u64, addr, len as u64, 0, 0, 0])
}

pub fn setsockopt(id: u64, pid: u32, fd: i32, level: i32, name: i32, value: u64, len: usize) -> Notification {
    notif(
        id,
        pid,
        Syscall::SetSockOpt,
        [fd as u64, level as u64, name as u64, value, len as u64, 0],
    )
}

pub fn fcntl(id: u64, pid: u32, fd: i32, cmd: i32, arg: i32) -> Notification {
    notif(id, pid, Syscall::Fcntl, [fd as u64, cmd as u64, arg as u64, 0, 0, 0])
}

pub fn close(id: u64, pid: u32, fd: i32) -> Notification {
    notif(id, pid, Syscall::Close, [fd as u64, 0, 0, 0, 0, 0])
}

pub fn getpeername(id: u64, pid: u32, fd: i32, addr: u64, len_ptr: u64) -> Notification {
    notif(id, pid, Syscall::GetPeerName, [fd as u64, addr, len_ptr, 0, 0, 0])
}

/// Scripted notification source.
#[derive(Debug, Default)]
pub struct FakeNotifications {
    pub queue: VecDeque<Notification>,
    /// Ids whose caller left before the answer.
    pub stale: HashSet<u64>,
    pub responses: Vec<Response>,
}

impl FakeNotifications {
    pub fn new(notifs: impl IntoIterator<Item = Notification>) -> Self {
        Self {
            queue: notifs.into_iter().collect(),
            ..Self::default()
        }
    }
}

impl Notifications for FakeNotifications {
    fn receive(&mut self) -> Result<Option<Notification>> {
        self.queue.pop_front().map(Some).ok_or_else(|| {
            BypassError::Io(io::Error::new(io::ErrorKind::ConnectionAborted, "listener closed"))
        })
    }

    fn is_valid(&mut self, id: u64) -> bool {
        !self.stale.contains(&id)
    }

    fn respond(&mut self, response: &Response) -> Result<()> {
        self.responses.push(*response);
        Ok(())
    }
}
