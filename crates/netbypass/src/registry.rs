//! Per-channel process and socket bookkeeping.
//!
//! One [`Registry`] is owned by each dispatch loop; nothing in it is shared
//! across channels. Sockets are keyed by `(tgid, fd)` so every thread of a
//! process sees the same record. The `pid -> tgid` map doubles as the resolver
//! cache.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use crate::config::{BypassConfig, ForwardingPorts};
use crate::error::{BypassError, Result};
use crate::host::Host;
use crate::nonbypassable::NonBypassable;
use crate::socket::{Context, SocketRecord, SocketState};
use crate::syscall::{Notification, Response, Syscall};

struct ProcessRecord<P> {
    process: P,
    sockets: HashMap<i32, SocketRecord>,
    /// Memory could not be opened even through the helper.
    memory_unavailable: bool,
}

pub struct Registry<H: Host> {
    forwarding: ForwardingPorts,
    nonbypassable: Arc<NonBypassable>,
    threads: HashMap<u32, u32>,
    processes: HashMap<u32, ProcessRecord<H::Process>>,
}

impl<H: Host> Registry<H> {
    pub fn new(config: &BypassConfig, nonbypassable: Arc<NonBypassable>) -> Self {
        Self {
            forwarding: config.forwarding.clone(),
            nonbypassable,
            threads: HashMap::new(),
            processes: HashMap::new(),
        }
    }

    /// Handle one notification. Never fails: errors are logged and answered
    /// with the continue response.
    pub fn handle(&mut self, host: &mut H, notif: &Notification) -> Response {
        let id = notif.id;
        match notif.syscall {
            Syscall::Unsupported(nr) => {
                tracing::trace!(pid = notif.pid, nr, "unsupported syscall");
                return Response::continue_syscall(id);
            }
            Syscall::Exit { group } => {
                self.exit(host, notif.pid, group);
                return Response::continue_syscall(id);
            }
            Syscall::Close => {
                self.close(host, notif);
                return Response::continue_syscall(id);
            }
            Syscall::SendTo | Syscall::SendMsg => {
                tracing::trace!(pid = notif.pid, fd = ?notif.fd(), syscall = %notif.syscall, "datagram path not bypassed");
                return Response::continue_syscall(id);
            }
            _ => {}
        }

        let result = match self.dispatch(host, notif) {
            Err(BypassError::ProcessGone { pid }) => {
                tracing::debug!(pid, "stale process handle, retrying");
                if let Some(tgid) = self.threads.get(&notif.pid).copied() {
                    self.evict(tgid);
                }
                self.dispatch(host, notif)
            }
            other => other,
        };

        result.unwrap_or_else(|e| {
            match e {
                BypassError::ProcessGone { pid } => tracing::debug!(pid, "process exited during {}", notif.syscall),
                e => tracing::warn!(pid = notif.pid, fd = ?notif.fd(), syscall = %notif.syscall, error = %e, "request failed"),
            }
            Response::continue_syscall(id)
        })
    }

    fn dispatch(&mut self, host: &mut H, notif: &Notification) -> Result<Response> {
        let cont = Response::continue_syscall(notif.id);
        let Some(fd) = notif.fd() else {
            return Ok(cont);
        };
        let tgid = self.resolve(host, notif.pid)?;
        let Some(ProcessRecord {
            process,
            sockets,
            memory_unavailable,
        }) = self.processes.get_mut(&tgid)
        else {
            return Err(BypassError::ProcessGone { pid: tgid });
        };

        if notif.syscall == Syscall::GetPeerName {
            let Some(socket) = sockets.get(&fd) else {
                return Ok(cont);
            };
            let mut cx = Context {
                host,
                process,
                notif,
                forwarding: &self.forwarding,
                nonbypassable: &self.nonbypassable,
            };
            return socket.getpeername(&mut cx);
        }

        let socket = match sockets.entry(fd) {
            Entry::Occupied(entry) => {
                let socket = entry.into_mut();
                // The fd may have been closed and reused without us seeing it.
                if notif.syscall == Syscall::Connect && socket.state() == SocketState::NotBypassable {
                    *socket = register(host, process, fd, *memory_unavailable)?;
                }
                socket
            }
            Entry::Vacant(entry) => entry.insert(register(host, process, fd, *memory_unavailable)?),
        };
        if *memory_unavailable && socket.state() == SocketState::NotBypassed {
            socket.set_state(SocketState::NotBypassable);
        }

        let state = socket.state();
        let mut cx = Context {
            host,
            process,
            notif,
            forwarding: &self.forwarding,
            nonbypassable: &self.nonbypassable,
        };
        let result = match notif.syscall {
            Syscall::SetSockOpt if state.records_options() => socket.record_setsockopt(&mut cx).map(|()| cont),
            Syscall::Fcntl if state.records_options() => {
                socket.record_fcntl(notif);
                Ok(cont)
            }
            Syscall::Bind if state == SocketState::NotBypassed => socket.bind(&mut cx),
            Syscall::Connect if state == SocketState::NotBypassed => socket.connect(&mut cx),
            _ => Ok(cont),
        };

        if matches!(&result, Err(e) if e.is_memory_fatal()) {
            tracing::warn!(tgid, "memory inaccessible, no further bypass for this process");
            *memory_unavailable = true;
        }
        result
    }

    fn resolve(&mut self, host: &mut H, pid: u32) -> Result<u32> {
        if let Some(&tgid) = self.threads.get(&pid) {
            if self.processes.contains_key(&tgid) {
                return Ok(tgid);
            }
        }
        let (process, tgid) = host.open_process(pid)?;
        self.threads.insert(pid, tgid);
        self.processes.entry(tgid).or_insert_with(|| {
            tracing::debug!(pid, tgid, "tracking process");
            ProcessRecord {
                process,
                sockets: HashMap::new(),
                memory_unavailable: false,
            }
        });
        Ok(tgid)
    }

    /// Thread group of `pid` for requests that only drop state. A thread
    /// seen for the first time is resolved, but no process is tracked for it.
    fn lookup(&mut self, host: &mut H, pid: u32) -> Option<u32> {
        if let Some(&tgid) = self.threads.get(&pid) {
            return Some(tgid);
        }
        if self.processes.is_empty() {
            return None;
        }
        match host.open_process(pid) {
            Ok((_, tgid)) => {
                if self.processes.contains_key(&tgid) {
                    self.threads.insert(pid, tgid);
                }
                Some(tgid)
            }
            Err(e) => {
                tracing::debug!(pid, error = %e, "cannot resolve thread");
                None
            }
        }
    }

    fn close(&mut self, host: &mut H, notif: &Notification) {
        let Some(fd) = notif.fd() else {
            return;
        };
        let Some(tgid) = self.lookup(host, notif.pid) else {
            return;
        };
        if let Some(record) = self.processes.get_mut(&tgid) {
            if let Some(socket) = record.sockets.remove(&fd) {
                tracing::trace!(tgid, fd, state = %socket.state(), "socket closed");
            }
        }
    }

    fn exit(&mut self, host: &mut H, pid: u32, group: bool) {
        let tgid = self.lookup(host, pid).unwrap_or(pid);
        if group || pid == tgid {
            self.evict(tgid);
        } else {
            self.threads.remove(&pid);
        }
    }

    fn evict(&mut self, tgid: u32) {
        if self.processes.remove(&tgid).is_some() {
            tracing::debug!(tgid, "dropped process");
        }
        self.threads.retain(|_, t| *t != tgid);
    }

    /// Record of `fd` in the process `pid` belongs to.
    pub fn socket(&self, pid: u32, fd: i32) -> Option<&SocketRecord> {
        let tgid = self.threads.get(&pid)?;
        self.processes.get(tgid)?.sockets.get(&fd)
    }

    pub fn tgid_of(&self, pid: u32) -> Option<u32> {
        self.threads.get(&pid).copied()
    }

    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    pub fn nonbypassable(&self) -> &Arc<NonBypassable> {
        &self.nonbypassable
    }
}

fn register<H: Host>(host: &mut H, process: &H::Process, fd: i32, memory_unavailable: bool) -> Result<SocketRecord> {
    let kind = host.inspect_fd(process, fd)?;
    let record = if memory_unavailable {
        SocketRecord::unbypassable(&kind)
    } else {
        SocketRecord::register(&kind)
    };
    tracing::debug!(fd, state = %record.state(), "registered fd");
    Ok(record)
}
