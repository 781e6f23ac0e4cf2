//! Kernel operations the state machine needs, behind a trait.
//!
//! [`LinuxHost`] talks to the real kernel: pidfds, `/proc/<tgid>/mem`, host
//! sockets and `SECCOMP_IOCTL_NOTIF_ADDFD`. Tests drive the registry with an
//! in-memory implementation instead.

mod linux;

use std::net::SocketAddr;

pub use linux::{LinuxHost, LinuxProcess};

use crate::error::Result;
use crate::socket::ReplayOption;

/// `socket(2)` arguments of a monitored socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketArgs {
    pub domain: i32,
    pub ty: i32,
    pub protocol: i32,
}

/// What an fd in the monitored process refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdKind {
    NotSocket,
    Socket {
        args: SocketArgs,
        /// The socket already has a peer (accepted, inherited or connected).
        connected: bool,
        /// `O_NONBLOCK` is set on the open file description.
        nonblocking: bool,
        /// The fd has close-on-exec set.
        cloexec: bool,
    },
}

pub trait Host {
    /// Open handle on a monitored thread group.
    type Process;
    /// Socket created on the host side.
    type Socket;

    /// Resolve a thread id to a process handle and its thread-group id.
    fn open_process(&mut self, pid: u32) -> Result<(Self::Process, u32)>;

    fn inspect_fd(&mut self, process: &Self::Process, fd: i32) -> Result<FdKind>;

    fn read_memory(&mut self, process: &mut Self::Process, addr: u64, len: usize) -> Result<Vec<u8>>;

    fn write_memory(&mut self, process: &mut Self::Process, addr: u64, data: &[u8]) -> Result<()>;

    fn create_socket(&mut self, args: SocketArgs) -> Result<Self::Socket>;

    fn apply_option(&mut self, socket: &Self::Socket, option: &ReplayOption) -> Result<()>;

    fn bind(&mut self, socket: &Self::Socket, addr: &SocketAddr) -> Result<()>;

    /// Install `socket` at `target_fd` in the caller of notification
    /// `notif_id`, replacing whatever is open there. Returns the fd number.
    fn inject(&mut self, notif_id: u64, socket: &Self::Socket, target_fd: i32, cloexec: bool)
    -> Result<i32>;
}
