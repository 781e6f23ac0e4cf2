//! Per-channel receive, route and respond loop.
//!
//! Each iteration:
//!
//! 1. receive one notification (blocking),
//! 2. check the id is still valid; a caller that already left gets no answer,
//! 3. hand it to the [`Registry`],
//! 4. send the response.
//!
//! Only a failing receive ends the loop. Everything per request is answered
//! with a response, even when handling failed.

use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};

use netbypass_sys::seccomp_notify::{SeccompNotif, notif_id_valid, notif_recv, notif_send};
use rustix::io::Errno;

use crate::error::{BypassError, Result};
use crate::host::Host;
use crate::registry::Registry;
use crate::syscall::{Notification, Response};

/// Source of notifications and sink of responses.
pub trait Notifications {
    /// Block for the next notification. `Ok(None)` means a transient miss
    /// (interrupted, or the caller died before it could be received).
    fn receive(&mut self) -> Result<Option<Notification>>;

    /// Whether the caller of `id` is still waiting for an answer.
    fn is_valid(&mut self, id: u64) -> bool;

    fn respond(&mut self, response: &Response) -> Result<()>;
}

/// Notifications from a seccomp listener fd.
#[derive(Debug)]
pub struct SeccompListener {
    fd: OwnedFd,
}

impl SeccompListener {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Second handle on the same listener, for fd injection.
    pub fn try_clone_fd(&self) -> io::Result<OwnedFd> {
        self.fd.try_clone()
    }

    fn wait_readable(&self) -> Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut pfd, 1, -1) };
        if ret < 0 {
            return match netbypass_sys::last_errno() {
                Errno::INTR => Ok(false),
                errno => Err(BypassError::kernel("poll")(errno)),
            };
        }
        // All filter users exited: nothing will ever arrive again.
        if pfd.revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0 && pfd.revents & libc::POLLIN == 0 {
            return Err(BypassError::Io(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "seccomp listener hung up",
            )));
        }
        Ok(true)
    }
}

impl Notifications for SeccompListener {
    fn receive(&mut self) -> Result<Option<Notification>> {
        if !self.wait_readable()? {
            return Ok(None);
        }
        let mut raw = SeccompNotif::default();
        match notif_recv(self.fd.as_fd(), &mut raw) {
            Ok(()) => Ok(Some(Notification::from(&raw))),
            Err(Errno::NOENT | Errno::INTR) => Ok(None),
            Err(errno) => Err(BypassError::kernel("SECCOMP_IOCTL_NOTIF_RECV")(errno)),
        }
    }

    fn is_valid(&mut self, id: u64) -> bool {
        notif_id_valid(self.fd.as_fd(), id).is_ok()
    }

    fn respond(&mut self, response: &Response) -> Result<()> {
        notif_send(self.fd.as_fd(), &response.to_raw()).map_err(BypassError::kernel("SECCOMP_IOCTL_NOTIF_SEND"))
    }
}

/// Outcome of one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Responded(Response),
    /// The caller left before we could answer.
    Stale,
    /// Nothing was received.
    Idle,
}

pub struct Dispatcher<N: Notifications, H: Host> {
    source: N,
    host: H,
    registry: Registry<H>,
}

impl<N: Notifications, H: Host> Dispatcher<N, H> {
    pub fn new(source: N, host: H, registry: Registry<H>) -> Self {
        Self {
            source,
            host,
            registry,
        }
    }

    pub fn registry(&self) -> &Registry<H> {
        &self.registry
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn source(&self) -> &N {
        &self.source
    }

    /// Handle at most one notification. Errors only when receiving failed.
    pub fn step(&mut self) -> Result<Step> {
        let Some(notif) = self.source.receive()? else {
            return Ok(Step::Idle);
        };
        tracing::trace!(id = notif.id, pid = notif.pid, syscall = %notif.syscall, "notification");

        if !self.source.is_valid(notif.id) {
            tracing::debug!(id = notif.id, pid = notif.pid, "notification no longer valid");
            return Ok(Step::Stale);
        }

        let response = self.registry.handle(&mut self.host, &notif);
        if let Err(e) = self.source.respond(&response) {
            tracing::debug!(id = notif.id, pid = notif.pid, error = %e, "response not delivered");
        }
        Ok(Step::Responded(response))
    }

    /// Run until the notification source fails.
    pub fn run(mut self) -> BypassError {
        loop {
            if let Err(e) = self.step() {
                return e;
            }
        }
    }
}
