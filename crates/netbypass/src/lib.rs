//! netbypass: socket bypass for rootless containers
//!
//! Socket syscalls of a container are intercepted with seccomp user
//! notification. Eligible TCP sockets are swapped for sockets created in the
//! host network namespace, so their traffic skips the slow user-mode network
//! stack of the rootless sandbox. Traffic that must stay inside (loopback,
//! peer containers, the sandbox's own addresses) is left alone.
//!
//! - **Sockaddr codec** - raw `sockaddr_in`/`sockaddr_in6` buffers
//! - **Process memory** - `/proc/<tgid>/mem` with a user-namespace helper fallback
//! - **Resolver** - thread id to pidfd and thread-group id
//! - **Non-bypassable set** - static subnets plus subnets learned by `nsagent`
//! - **Socket state machine** - per-fd bypass decisions
//! - **Dispatcher** - one receive/route/respond loop per container
//!
//! ## Quick Start
//!
//! ```ignore
//! use netbypass::{BypassConfig, Server};
//!
//! let config = BypassConfig::new().publish("8080:80".parse()?)?;
//! Server::bind("/run/user/1000/netbypass.sock", config)?.serve()?;
//! ```
//!
//! ## Requirements
//!
//! - Linux kernel 5.9+ (`SECCOMP_IOCTL_NOTIF_ADDFD`, `pidfd_getfd`)
//! - `nsenter` on `PATH` when subnets are learned automatically

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]

pub mod config;
pub mod error;
pub mod host;
pub mod nonbypassable;
pub mod notify;
pub mod nsagent;
pub mod process;
pub mod registry;
pub mod server;
pub mod sockaddr;
pub mod socket;
pub mod syscall;

pub use config::{BypassConfig, ConfigError, ForwardingPorts, IgnoreSubnet, PortMapping};
pub use error::{BypassError, Result};
pub use host::{FdKind, Host, LinuxHost, SocketArgs};
pub use nonbypassable::{NonBypassable, NsWatcher, Refreshers};
pub use registry::Registry;
pub use server::Server;
pub use socket::{ReplayOption, SocketRecord, SocketState};
pub use syscall::{Notification, Response, Syscall};
