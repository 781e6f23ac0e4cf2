//! Seccomp user notification plumbing.
//!
//! ## Modules
//!
//! - **handshake** - container connection message and seccomp fd selection
//! - **dispatcher** - receive / validate / route / respond loop
//! - **`scm_rights`** - Unix socket fd passing

pub mod dispatcher;
pub mod handshake;
pub mod scm_rights;

pub use dispatcher::{Dispatcher, Notifications, SeccompListener, Step};
pub use handshake::{ContainerProcessState, Handshake};
