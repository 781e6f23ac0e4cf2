//! Error taxonomy for the bypass engine.
//!
//! | Variant | Meaning | Effect |
//! |---------|---------|--------|
//! | `Protocol` | Malformed handshake, wrong fd naming | Connection aborted |
//! | `Permission` | Direct memory access denied | Helper fallback is tried |
//! | `Helper` | Helper fallback failed too | No further bypass for that process |
//! | `ProcessGone` | Target exited under us | Record evicted, request continued |
//! | `Kernel` | ioctl/syscall failure | Logged, safe default response |
//!
//! A policy decision (`NotBypassable`) is not an error and never shows up here.

use std::io;

use rustix::io::Errno;
use thiserror::Error;

use crate::sockaddr::SockaddrError;

/// Error raised while handling a channel or a single notification.
#[derive(Debug, Error)]
pub enum BypassError {
    #[error("protocol: {0}")]
    Protocol(String),

    #[error("memory of pid {pid}: {source}")]
    Permission { pid: u32, source: io::Error },

    #[error("memory helper for pid {pid}: {reason}")]
    Helper { pid: u32, reason: String },

    #[error("process {pid} is gone")]
    ProcessGone { pid: u32 },

    #[error("{op}: {errno}")]
    Kernel { op: &'static str, errno: Errno },

    #[error("sockaddr: {0}")]
    Sockaddr(#[from] SockaddrError),

    #[error("io: {0}")]
    Io(#[from] io::Error),
}

impl BypassError {
    pub(crate) fn kernel(op: &'static str) -> impl FnOnce(Errno) -> Self {
        move |errno| Self::Kernel { op, errno }
    }

    /// Whether memory of the affected process can no longer be accessed at all.
    pub fn is_memory_fatal(&self) -> bool {
        matches!(self, Self::Helper { .. })
    }
}

pub type Result<T, E = BypassError> = std::result::Result<T, E>;
