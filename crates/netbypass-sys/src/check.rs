//! System capability checking.
//!
//! Verifies at runtime that the kernel supports everything the bypass engine
//! relies on. The check is performed once and cached in a static `OnceLock`.
//!
//! ## Required Features
//!
//! | Feature | Minimum | Check Method |
//! |---------|---------|--------------|
//! | Kernel | 5.9 | `uname` syscall (`SECCOMP_IOCTL_NOTIF_ADDFD`, `pidfd_getfd`) |
//! | Seccomp | enabled | `prctl(PR_GET_SECCOMP)` |

use std::sync::OnceLock;

use rustix::system::uname;
use thiserror::Error;

/// Information about the system's capabilities.
#[derive(Debug, Clone)]
pub struct SystemInfo {
    pub kernel_version: (u32, u32, u32),
    pub seccomp_enabled: bool,
}

/// Errors that can occur during system capability checking.
#[derive(Debug, Clone, Error)]
pub enum CheckError {
    #[error("kernel version {}.{}.{} is too old, need at least {}.{}.{}", .found.0, .found.1, .found.2, .required.0, .required.1, .required.2)]
    KernelTooOld {
        required: (u32, u32, u32),
        found: (u32, u32, u32),
    },

    #[error("seccomp is not available")]
    SeccompNotAvailable,

    #[error("failed to read kernel version")]
    KernelVersionReadFailed,
}

// SECCOMP_IOCTL_NOTIF_ADDFD landed in 5.9
const MIN_KERNEL_VERSION: (u32, u32, u32) = (5, 9, 0);

static SYSTEM_INFO: OnceLock<Result<SystemInfo, CheckError>> = OnceLock::new();

/// Check system capabilities and cache the result.
pub fn check() -> Result<&'static SystemInfo, &'static CheckError> {
    SYSTEM_INFO.get_or_init(check_impl).as_ref()
}

fn check_impl() -> Result<SystemInfo, CheckError> {
    let kernel_version = get_kernel_version()?;
    if kernel_version < MIN_KERNEL_VERSION {
        return Err(CheckError::KernelTooOld {
            required: MIN_KERNEL_VERSION,
            found: kernel_version,
        });
    }

    let seccomp_enabled = seccomp_available();
    if !seccomp_enabled {
        return Err(CheckError::SeccompNotAvailable);
    }

    Ok(SystemInfo {
        kernel_version,
        seccomp_enabled,
    })
}

fn seccomp_available() -> bool {
    unsafe { libc::prctl(libc::PR_GET_SECCOMP, 0, 0, 0, 0) >= 0 }
}

fn get_kernel_version() -> Result<(u32, u32, u32), CheckError> {
    let uts = uname();
    let release = uts
        .release()
        .to_str()
        .map_err(|_| CheckError::KernelVersionReadFailed)?;
    parse_kernel_version(release)
}

fn parse_kernel_version(release: &str) -> Result<(u32, u32, u32), CheckError> {
    let mut parts = release.splitn(3, '.');
    let number = |part: Option<&str>| {
        part.map(|p| p.split(|c: char| !c.is_ascii_digit()).next().unwrap_or(""))
            .and_then(|p| p.parse::<u32>().ok())
    };

    let major = number(parts.next()).ok_or(CheckError::KernelVersionReadFailed)?;
    let minor = number(parts.next()).ok_or(CheckError::KernelVersionReadFailed)?;
    // Patch might be missing or carry a suffix like "0-generic"
    let patch = number(parts.next()).unwrap_or(0);

    Ok((major, minor, patch))
}
