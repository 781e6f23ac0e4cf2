//! Container connection handshake.
//!
//! The runtime connects to our listener and sends a single message: the OCI
//! `ContainerProcessState` as JSON, with the descriptors named in its `fds`
//! list attached as one `SCM_RIGHTS` control message.

use std::collections::HashMap;
use std::os::fd::{AsFd, OwnedFd};

use serde::{Deserialize, Serialize};

use super::scm_rights;
use crate::error::{BypassError, Result};

/// Name of the seccomp notification fd in the `fds` list.
pub const SECCOMP_FD_NAME: &str = "seccompFd";

/// Upper bound on the state document; a message filling it is rejected.
pub const MAX_STATE_LEN: usize = 4096;

/// OCI runtime state of the container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct State {
    #[serde(default)]
    pub oci_version: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub bundle: String,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

/// What the runtime sends over the seccomp agent socket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerProcessState {
    #[serde(default)]
    pub oci_version: String,
    #[serde(default)]
    pub fds: Vec<String>,
    /// Container init pid, as seen from our pid namespace.
    pub pid: u32,
    #[serde(default)]
    pub metadata: String,
    #[serde(default)]
    pub state: State,
}

/// A handshaken container connection.
#[derive(Debug)]
pub struct Handshake {
    pub state: ContainerProcessState,
    pub listener: OwnedFd,
}

impl Handshake {
    /// Container id, falling back to the pid for runtimes that omit it.
    pub fn container_id(&self) -> String {
        if self.state.state.id.is_empty() {
            self.state.pid.to_string()
        } else {
            self.state.state.id.clone()
        }
    }
}

/// Read the handshake message from a freshly accepted connection.
pub fn receive(conn: impl AsFd) -> Result<Handshake> {
    let mut buf = vec![0u8; MAX_STATE_LEN];
    let (n, fds) = scm_rights::recv_with_fds(conn.as_fd(), &mut buf)?;
    if n >= MAX_STATE_LEN {
        return Err(BypassError::Protocol(format!("state message too large ({n} bytes)")));
    }
    let state: ContainerProcessState = serde_json::from_slice(&buf[..n])
        .map_err(|e| BypassError::Protocol(format!("cannot parse container state: {e}")))?;
    let listener = select_fd(&state.fds, fds)?;
    Ok(Handshake { state, listener })
}

/// Pick the descriptor named [`SECCOMP_FD_NAME`]; all others are closed.
pub fn select_fd(names: &[String], fds: Vec<OwnedFd>) -> Result<OwnedFd> {
    let mut positions = names
        .iter()
        .enumerate()
        .filter(|(_, name)| name.as_str() == SECCOMP_FD_NAME)
        .map(|(i, _)| i);
    let idx = match (positions.next(), positions.next()) {
        (Some(idx), None) => idx,
        (None, _) => return Err(BypassError::Protocol(format!("no fd named {SECCOMP_FD_NAME}"))),
        (Some(_), Some(_)) => {
            return Err(BypassError::Protocol(format!("{SECCOMP_FD_NAME} named more than once")));
        }
    };
    if names.len() != fds.len() {
        return Err(BypassError::Protocol(format!(
            "{} fd names for {} descriptors",
            names.len(),
            fds.len()
        )));
    }
    fds.into_iter()
        .nth(idx)
        .ok_or_else(|| BypassError::Protocol(format!("{SECCOMP_FD_NAME} index {idx} out of range")))
}
