//! Listener for container runtimes.
//!
//! Every accepted connection carries one handshake. A good handshake gets a
//! dedicated dispatch thread with its own [`Registry`] and its own copy of the
//! configuration; a bad one only loses that connection.

use std::fs;
use std::io;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::BypassConfig;
use crate::error::Result;
use crate::host::LinuxHost;
use crate::nonbypassable::{NonBypassable, Refreshers};
use crate::notify::{Dispatcher, Handshake, SeccompListener, handshake};
use crate::registry::Registry;

/// How long an accepted runtime may take to send its handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Server {
    listener: UnixListener,
    path: PathBuf,
    config: BypassConfig,
    refreshers: Arc<Refreshers>,
    handshake_timeout: Duration,
}

impl Server {
    /// Listen on `path`, replacing a socket left behind by a previous run.
    pub fn bind(path: impl AsRef<Path>, config: BypassConfig) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        match fs::remove_file(&path) {
            Ok(()) => tracing::debug!(path = %path.display(), "removed stale socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let listener = UnixListener::bind(&path)?;
        tracing::info!(path = %path.display(), ports = config.forwarding.len(), "listening for seccomp fds");
        Ok(Self {
            listener,
            path,
            config,
            refreshers: Arc::new(Refreshers::new()),
            handshake_timeout: HANDSHAKE_TIMEOUT,
        })
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Agents of every channel that learns its subnets dynamically.
    pub fn refreshers(&self) -> Arc<Refreshers> {
        Arc::clone(&self.refreshers)
    }

    /// Accept connections forever.
    pub fn serve(&self) -> io::Result<()> {
        loop {
            match self.accept_one() {
                Ok(_channel) => {}
                Err(e) => tracing::error!(error = %e, "rejected container connection"),
            }
        }
    }

    /// Accept one connection and start its dispatch thread.
    pub fn accept_one(&self) -> Result<JoinHandle<()>> {
        let (conn, _) = self.listener.accept()?;
        // A runtime that connects and stays silent must not stall the others.
        conn.set_read_timeout(Some(self.handshake_timeout))?;
        let handshake = handshake::receive(&conn)?;
        drop(conn);
        tracing::info!(
            container = %handshake.container_id(),
            pid = handshake.state.pid,
            "received seccomp fd"
        );
        Ok(spawn_channel(handshake, self.config.clone(), &self.refreshers)?)
    }
}

/// Run the dispatch loop for one container on its own thread.
pub fn spawn_channel(
    handshake: Handshake,
    config: BypassConfig,
    refreshers: &Refreshers,
) -> io::Result<JoinHandle<()>> {
    let id = handshake.container_id();
    let pid = handshake.state.pid;

    let nonbypassable = Arc::new(NonBypassable::new(config.ignore.clone()));
    let watcher = if config.auto_ignore {
        match nonbypassable.watch_ns(pid) {
            Ok(watcher) => {
                let watcher = Arc::new(watcher);
                refreshers.register(&watcher);
                Some(watcher)
            }
            Err(e) => {
                tracing::warn!(container = %id, pid, error = %e, "cannot learn sandbox subnets");
                None
            }
        }
    } else {
        None
    };

    let listener = SeccompListener::new(handshake.listener);
    let host = LinuxHost::new(listener.try_clone_fd()?);
    let registry = Registry::new(&config, nonbypassable);
    let dispatcher = Dispatcher::new(listener, host, registry);

    thread::Builder::new()
        .name(format!("channel-{id}"))
        .spawn(move || {
            let span = tracing::info_span!("channel", container = %id, pid);
            let _enter = span.enter();
            tracing::debug!("dispatching");
            let reason = dispatcher.run();
            tracing::info!(reason = %reason, "channel closed");
            drop(watcher);
        })
}
