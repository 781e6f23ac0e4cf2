//! Per-socket bypass state machine.
//!
//! ```text
//!                 register
//!   (new fd) ──────────────┬──────────────► NotBypassable ◄───────┐
//!                          │                   │ connect:         │ bind without mapping,
//!                          ▼                   │ re-register      │ connect inside sandbox,
//!                     NotBypassed ◄────────────┘                  │ host socket failure
//!                          │ ─────────────────────────────────────┘
//!             bind/connect │ host socket injected
//!                          ▼
//!                      Bypassed          Error (rewrite/inject failed after
//!                                              target memory was modified)
//! ```
//!
//! ## Ordering
//!
//! For `connect` the destination inside the caller's memory is rewritten
//! before the host socket is injected. Once the fd is replaced the caller's
//! `connect` runs against the host socket with whatever address it finds in
//! its buffer, so the reverse order would connect the host socket to the
//! sandbox-side address.

use std::fmt;
use std::net::SocketAddr;

use crate::config::ForwardingPorts;
use crate::error::{BypassError, Result};
use crate::host::{FdKind, Host, SocketArgs};
use crate::nonbypassable::NonBypassable;
use crate::sockaddr::{self, PORT_OFFSET, SockaddrError};
use crate::syscall::{Notification, Response};

/// Largest option value copied out of the caller for replay.
pub const MAX_OPTION_LEN: usize = 4096;

// sizeof(struct sockaddr_storage)
const MAX_SOCKADDR_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketState {
    /// Never acted on.
    NotBypassable,
    /// Eligible, nothing done yet.
    NotBypassed,
    /// Replaced by a host socket.
    Bypassed,
    /// Failed after modifying the caller; never acted on again.
    Error,
}

impl SocketState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotBypassable => "not-bypassable",
            Self::NotBypassed => "not-bypassed",
            Self::Bypassed => "bypassed",
            Self::Error => "error",
        }
    }

    /// Whether `setsockopt`/`fcntl` values are recorded for replay.
    pub fn records_options(&self) -> bool {
        matches!(self, Self::NotBypassed | Self::Error)
    }
}

impl fmt::Display for SocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value to re-apply to the host socket before it replaces the original.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOption {
    SockOpt { level: i32, name: i32, value: Vec<u8> },
    /// `fcntl(F_SETFL, flags)`
    StatusFlags(i32),
}

/// Bookkeeping for one fd of one thread group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketRecord {
    state: SocketState,
    args: Option<SocketArgs>,
    /// Last address seen in `bind` or `connect`.
    addr: Option<SocketAddr>,
    /// Container-visible peer when the destination was rewritten.
    original_peer: Option<SocketAddr>,
    options: Vec<ReplayOption>,
    cloexec: bool,
}

/// Everything a transition may touch besides the record itself.
pub struct Context<'a, H: Host> {
    pub host: &'a mut H,
    pub process: &'a mut H::Process,
    pub notif: &'a Notification,
    pub forwarding: &'a ForwardingPorts,
    pub nonbypassable: &'a NonBypassable,
}

impl SocketRecord {
    /// Classify a freshly seen fd.
    ///
    /// Only never-connected `AF_INET`/`AF_INET6` stream sockets are eligible.
    pub fn register(kind: &FdKind) -> Self {
        let mut record = Self {
            state: SocketState::NotBypassable,
            args: None,
            addr: None,
            original_peer: None,
            options: Vec::new(),
            cloexec: false,
        };
        if let FdKind::Socket {
            args,
            connected,
            nonblocking,
            cloexec,
        } = *kind
        {
            record.args = Some(args);
            record.cloexec = cloexec;
            let inet = args.domain == libc::AF_INET || args.domain == libc::AF_INET6;
            if inet && args.ty == libc::SOCK_STREAM && !connected {
                record.state = SocketState::NotBypassed;
                if nonblocking {
                    record.options.push(ReplayOption::StatusFlags(libc::O_NONBLOCK));
                }
            }
        }
        record
    }

    /// Registration for a process whose memory cannot be accessed.
    pub fn unbypassable(kind: &FdKind) -> Self {
        let mut record = Self::register(kind);
        record.state = SocketState::NotBypassable;
        record
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn args(&self) -> Option<SocketArgs> {
        self.args
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    pub fn original_peer(&self) -> Option<SocketAddr> {
        self.original_peer
    }

    pub fn options(&self) -> &[ReplayOption] {
        &self.options
    }

    pub fn cloexec(&self) -> bool {
        self.cloexec
    }

    pub(crate) fn set_state(&mut self, next: SocketState) {
        if self.state != next {
            tracing::debug!(from = %self.state, to = %next, "socket state");
            self.state = next;
        }
    }

    /// Record `setsockopt(fd, level, name, optval, optlen)` for replay.
    pub fn record_setsockopt<H: Host>(&mut self, cx: &mut Context<'_, H>) -> Result<()> {
        let [_, level, name, optval, optlen, _] = cx.notif.args;
        let (level, name) = (level as i32, name as i32);
        let len = optlen as u32 as usize;
        if len > MAX_OPTION_LEN {
            tracing::debug!(level, name, len, "option value too large to replay");
            return Ok(());
        }
        let value = if optval == 0 || len == 0 {
            Vec::new()
        } else {
            cx.host.read_memory(cx.process, optval, len)?
        };
        tracing::trace!(level, name, len, "recorded socket option");
        self.options.push(ReplayOption::SockOpt { level, name, value });
        Ok(())
    }

    /// Record `fcntl(fd, cmd, arg)` for replay.
    pub fn record_fcntl(&mut self, notif: &Notification) {
        let cmd = notif.args[1] as i32;
        let arg = notif.args[2];
        match cmd {
            libc::F_SETFL => self.options.push(ReplayOption::StatusFlags(arg as i32)),
            libc::F_SETFD => self.cloexec = arg as i32 & libc::FD_CLOEXEC != 0,
            libc::F_GETFL | libc::F_GETFD => {}
            _ => tracing::trace!(cmd, "fcntl command not replayed"),
        }
    }

    /// `bind`: replace the socket with a host socket bound to the published port.
    pub fn bind<H: Host>(&mut self, cx: &mut Context<'_, H>) -> Result<Response> {
        let id = cx.notif.id;
        let (addr, _) = match read_sockaddr(cx) {
            Ok(read) => read,
            Err(e) => {
                self.set_state(SocketState::NotBypassable);
                return Err(e);
            }
        };
        self.addr = Some(addr);

        let Some(host_port) = cx.forwarding.host_port(addr.port()) else {
            tracing::debug!(%addr, "bind to unpublished port");
            self.set_state(SocketState::NotBypassable);
            return Ok(Response::continue_syscall(id));
        };

        let mut host_addr = addr;
        host_addr.set_port(host_port);

        let injected = self.prepare(cx).and_then(|socket| {
            cx.host.bind(&socket, &host_addr)?;
            self.inject(cx, &socket)
        });
        match injected {
            Ok(fd) => {
                self.set_state(SocketState::Bypassed);
                tracing::info!(%addr, %host_addr, fd, "bypassed bind");
                Ok(Response::emulated(id, 0).with_injected(fd))
            }
            Err(e) => {
                self.set_state(SocketState::NotBypassable);
                Err(e)
            }
        }
    }

    /// `connect`: replace the socket with a host socket unless the destination
    /// must stay inside the sandbox.
    pub fn connect<H: Host>(&mut self, cx: &mut Context<'_, H>) -> Result<Response> {
        let id = cx.notif.id;
        let addr_ptr = cx.notif.args[1];
        let (dst, raw) = match read_sockaddr(cx) {
            Ok(read) => read,
            Err(BypassError::Sockaddr(e)) => {
                // AF_UNSPEC disconnects and friends: nothing to bypass yet.
                tracing::trace!(error = %e, "connect with undecodable address");
                return Ok(Response::continue_syscall(id));
            }
            Err(e) => {
                self.set_state(SocketState::NotBypassable);
                return Err(e);
            }
        };
        self.addr = Some(dst);

        let rewrite = cx.forwarding.host_port(dst.port()).and_then(|host_port| {
            if sockaddr::is_loopback(dst.ip()) {
                Some(Rewrite {
                    port: host_port,
                    to_loopback: false,
                })
            } else if cx.nonbypassable.is_interface_address(dst.ip()) {
                Some(Rewrite {
                    port: host_port,
                    to_loopback: true,
                })
            } else {
                None
            }
        });

        if rewrite.is_none() && cx.nonbypassable.contains(dst.ip()) {
            tracing::debug!(%dst, "destination is inside the sandbox");
            self.set_state(SocketState::NotBypassable);
            return Ok(Response::continue_syscall(id));
        }

        let socket = match self.prepare(cx) {
            Ok(socket) => socket,
            Err(e) => {
                self.set_state(SocketState::NotBypassable);
                return Err(e);
            }
        };

        if let Some(rewrite) = rewrite {
            if let Err(e) = rewrite.apply(cx, addr_ptr, &dst) {
                restore(cx, addr_ptr, &raw);
                self.set_state(SocketState::Error);
                return Err(e);
            }
        }

        match self.inject(cx, &socket) {
            Ok(fd) => {
                self.set_state(SocketState::Bypassed);
                if let Some(rewrite) = rewrite {
                    self.original_peer = Some(dst);
                    tracing::info!(%dst, host_port = rewrite.port, fd, "bypassed connect to published port");
                } else {
                    tracing::info!(%dst, fd, "bypassed connect");
                }
                Ok(Response::continue_syscall(id).with_injected(fd))
            }
            Err(e) => {
                if rewrite.is_some() {
                    restore(cx, addr_ptr, &raw);
                    self.set_state(SocketState::Error);
                } else {
                    self.set_state(SocketState::NotBypassable);
                }
                Err(e)
            }
        }
    }

    /// `getpeername` on a socket whose destination was rewritten: report the
    /// address the caller originally connected to.
    pub fn getpeername<H: Host>(&self, cx: &mut Context<'_, H>) -> Result<Response> {
        let id = cx.notif.id;
        let Some(peer) = self.original_peer.filter(|_| self.state == SocketState::Bypassed) else {
            return Ok(Response::continue_syscall(id));
        };
        let [fd, addr_ptr, len_ptr, ..] = cx.notif.args;
        if addr_ptr == 0 || len_ptr == 0 {
            return Ok(Response::continue_syscall(id));
        }

        // Not connected (yet, or anymore): let the kernel say so.
        match cx.host.inspect_fd(cx.process, fd as i32)? {
            FdKind::Socket { connected: true, .. } => {}
            _ => return Ok(Response::continue_syscall(id)),
        }

        let len_bytes = cx.host.read_memory(cx.process, len_ptr, 4)?;
        let len = u32::from_ne_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
        let encoded = sockaddr::encode(&peer);
        let n = len.min(encoded.len());
        if n > 0 {
            cx.host.write_memory(cx.process, addr_ptr, &encoded[..n])?;
        }
        cx.host
            .write_memory(cx.process, len_ptr, &(encoded.len() as u32).to_ne_bytes())?;
        tracing::debug!(%peer, "reported original peer");
        Ok(Response::emulated(id, 0))
    }

    /// Host socket with the same arguments and all recorded options applied.
    fn prepare<H: Host>(&self, cx: &mut Context<'_, H>) -> Result<H::Socket> {
        let args = self.args.ok_or_else(|| {
            BypassError::Protocol("bypass attempted on a socket without arguments".into())
        })?;
        let socket = cx.host.create_socket(args)?;
        for option in &self.options {
            cx.host.apply_option(&socket, option)?;
        }
        Ok(socket)
    }

    fn inject<H: Host>(&self, cx: &mut Context<'_, H>, socket: &H::Socket) -> Result<i32> {
        let fd = cx.notif.args[0] as i32;
        cx.host.inject(cx.notif.id, socket, fd, self.cloexec)
    }
}

#[derive(Debug, Clone, Copy)]
struct Rewrite {
    port: u16,
    /// Also point the address at loopback (destination was one of the
    /// sandbox's own addresses).
    to_loopback: bool,
}

impl Rewrite {
    fn apply<H: Host>(&self, cx: &mut Context<'_, H>, addr_ptr: u64, dst: &SocketAddr) -> Result<()> {
        cx.host
            .write_memory(cx.process, addr_ptr + PORT_OFFSET, &self.port.to_be_bytes())?;
        if self.to_loopback {
            let ip = sockaddr::loopback_octets(dst);
            cx.host
                .write_memory(cx.process, addr_ptr + sockaddr::ip_offset(dst), &ip)?;
        }
        Ok(())
    }
}

/// Read and decode the `(addr, addrlen)` pair in args 1 and 2.
fn read_sockaddr<H: Host>(cx: &mut Context<'_, H>) -> Result<(SocketAddr, Vec<u8>)> {
    let ptr = cx.notif.args[1];
    let len = (cx.notif.args[2] as u32 as usize).min(MAX_SOCKADDR_LEN);
    if ptr == 0 || len < 2 {
        return Err(SockaddrError::TooShort { family: 0, len }.into());
    }
    let raw = cx.host.read_memory(cx.process, ptr, len)?;
    let addr = sockaddr::decode(&raw)?;
    let raw = raw[..sockaddr::encoded_len(&addr)].to_vec();
    Ok((addr, raw))
}

fn restore<H: Host>(cx: &mut Context<'_, H>, addr_ptr: u64, raw: &[u8]) {
    if let Err(e) = cx.host.write_memory(cx.process, addr_ptr, raw) {
        tracing::warn!(error = %e, "failed to restore original destination");
    }
}
