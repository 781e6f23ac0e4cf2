//! Monitored process access.
//!
//! - **resolve** - Seccomp pid (possibly a thread id) to pidfd and thread-group id
//! - **memory** - Positioned read/write of `/proc/<tgid>/mem`, with a
//!   user-namespace helper when direct access is denied

pub mod memory;
pub mod resolve;

pub use memory::{HELPER_TIMEOUT, ProcessMemory};
pub use resolve::{ProcessHandle, parse_tgid, resolve};
