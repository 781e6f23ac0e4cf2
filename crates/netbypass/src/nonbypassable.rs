//! Destinations that must stay on the sandbox's own network path.
//!
//! The set is the union of a static subnet list from the configuration and a
//! dynamic list learned from the sandbox's interfaces. The dynamic half is
//! replaced wholesale whenever the namespace agent reports, under a
//! `parking_lot::RwLock` so dispatch loops only ever take short read locks.
//!
//! ## Refresh
//!
//! [`NonBypassable::watch_ns`] starts
//! `nsenter -t PID -F -n [-U --preserve-credentials] -- <self> nsagent`
//! and feeds its stdout into [`NonBypassable::apply_reports`]. The user
//! namespace is only entered when it differs from ours. [`NsWatcher::trigger`]
//! forwards `SIGHUP` to the agent, which answers with a fresh report.

use std::io::{self, BufRead, BufReader};
use std::net::IpAddr;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::SystemTime;

use ipnetwork::IpNetwork;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use parking_lot::{Mutex, RwLock};

use crate::nsagent;

/// An interface of the sandbox as last reported by the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub hw_addr: Option<String>,
    /// Interface addresses with their prefix length.
    pub addresses: Vec<IpNetwork>,
    pub is_loopback: bool,
}

#[derive(Debug, Default)]
struct Dynamic {
    subnets: Vec<IpNetwork>,
    interfaces: Vec<Interface>,
    last_update: Option<SystemTime>,
}

/// Static and learned non-bypassable destinations.
#[derive(Debug, Default)]
pub struct NonBypassable {
    static_list: Vec<IpNetwork>,
    dynamic: RwLock<Dynamic>,
}

impl NonBypassable {
    pub fn new(static_list: Vec<IpNetwork>) -> Self {
        Self {
            static_list,
            dynamic: RwLock::new(Dynamic::default()),
        }
    }

    /// Whether `ip` lies in a static or learned subnet.
    pub fn contains(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        if self.static_list.iter().any(|net| net.contains(ip)) {
            return true;
        }
        self.dynamic.read().subnets.iter().any(|net| net.contains(ip))
    }

    /// Whether `ip` is exactly one of the sandbox's own addresses.
    pub fn is_interface_address(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        self.dynamic
            .read()
            .interfaces
            .iter()
            .flat_map(|intf| intf.addresses.iter())
            .any(|addr| addr.ip() == ip)
    }

    pub fn interfaces(&self) -> Vec<Interface> {
        self.dynamic.read().interfaces.clone()
    }

    pub fn static_list(&self) -> &[IpNetwork] {
        &self.static_list
    }

    pub fn dynamic_list(&self) -> Vec<IpNetwork> {
        self.dynamic.read().subnets.clone()
    }

    /// Time of the last applied report, `None` before the first one.
    pub fn last_update(&self) -> Option<SystemTime> {
        self.dynamic.read().last_update
    }

    /// Replace the learned subnets and interfaces with one agent report.
    pub fn apply(&self, msg: &nsagent::Message) {
        let mut subnets = Vec::new();
        let mut interfaces = Vec::with_capacity(msg.interfaces.len());

        for intf in &msg.interfaces {
            let mut entry = Interface {
                name: intf.name.clone(),
                hw_addr: None,
                addresses: Vec::with_capacity(intf.cidrs.len()),
                is_loopback: false,
            };
            for cidr in &intf.cidrs {
                let addr: IpNetwork = match cidr.parse() {
                    Ok(addr) => addr,
                    Err(e) => {
                        tracing::warn!(interface = %intf.name, cidr = %cidr, error = %e, "ignoring bad CIDR from nsagent");
                        continue;
                    }
                };
                match IpNetwork::new(addr.network(), addr.prefix()) {
                    Ok(subnet) if !subnets.contains(&subnet) => subnets.push(subnet),
                    _ => {}
                }
                entry.is_loopback |= addr.ip().is_loopback();
                entry.addresses.push(addr);
            }
            if !entry.is_loopback && !intf.hw_addr.is_empty() {
                entry.hw_addr = Some(intf.hw_addr.clone());
            }
            interfaces.push(entry);
        }

        let mut dynamic = self.dynamic.write();
        tracing::info!(
            old = ?dynamic.subnets,
            new = ?subnets,
            static_list = ?self.static_list,
            "dynamic non-bypassable list updated"
        );
        dynamic.subnets = subnets;
        dynamic.interfaces = interfaces;
        dynamic.last_update = Some(SystemTime::now());
    }

    /// Apply every JSON line of `reader` until EOF. Malformed lines are skipped.
    pub fn apply_reports(&self, reader: impl BufRead) {
        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!(error = %e, "error reading nsagent output");
                    return;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<nsagent::Message>(&line) {
                Ok(msg) => self.apply(&msg),
                Err(e) => tracing::warn!(line = %line, error = %e, "failed to parse nsagent message"),
            }
        }
    }

    /// Start an agent inside the network namespace of `pid` and keep this set
    /// updated from its reports.
    pub fn watch_ns(self: &Arc<Self>, pid: u32) -> io::Result<NsWatcher> {
        let self_exe = std::env::current_exe()?;
        let same_userns = same_user_ns(pid)?;
        let mut cmd = agent_command(Path::new("nsenter"), pid, same_userns, &self_exe);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        unsafe {
            cmd.pre_exec(|| {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = cmd.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("nsagent stdout not captured"))?;
        tracing::info!(agent_pid = child.id(), target_pid = pid, "started nsagent");

        let set = Arc::clone(self);
        let reader = std::thread::Builder::new()
            .name(format!("nsagent-{pid}"))
            .spawn(move || set.apply_reports(BufReader::new(stdout)))?;

        Ok(NsWatcher {
            target_pid: pid,
            child: Mutex::new(child),
            reader: Mutex::new(Some(reader)),
        })
    }
}

fn agent_command(nsenter: &Path, pid: u32, same_userns: bool, self_exe: &Path) -> Command {
    let mut cmd = Command::new(nsenter);
    cmd.args(["-t", &pid.to_string(), "-F", "-n"]);
    if !same_userns {
        cmd.args(["-U", "--preserve-credentials"]);
    }
    cmd.arg("--").arg(self_exe).arg("nsagent");
    cmd
}

fn same_user_ns(pid: u32) -> io::Result<bool> {
    let theirs = std::fs::read_link(format!("/proc/{pid}/ns/user"))?;
    let ours = std::fs::read_link("/proc/self/ns/user")?;
    Ok(theirs == ours)
}

/// A running namespace agent. Dropping it stops the agent.
#[derive(Debug)]
pub struct NsWatcher {
    target_pid: u32,
    child: Mutex<Child>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl NsWatcher {
    pub fn target_pid(&self) -> u32 {
        self.target_pid
    }

    /// Ask the agent for a fresh report.
    pub fn trigger(&self) -> io::Result<()> {
        let pid = self.child.lock().id();
        let pid = Pid::from_raw(i32::try_from(pid).map_err(io::Error::other)?);
        kill(pid, Signal::SIGHUP).map_err(io::Error::from)
    }
}

impl Drop for NsWatcher {
    fn drop(&mut self) {
        let child = self.child.get_mut();
        if let Ok(pid) = i32::try_from(child.id()) {
            let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
        }
        let _ = child.wait();
        if let Some(reader) = self.reader.get_mut().take() {
            let _ = reader.join();
        }
    }
}

/// Live agents across all channels, for forwarding `SIGHUP`.
#[derive(Debug, Default)]
pub struct Refreshers {
    watchers: Mutex<Vec<Weak<NsWatcher>>>,
}

impl Refreshers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, watcher: &Arc<NsWatcher>) {
        let mut watchers = self.watchers.lock();
        watchers.retain(|w| w.strong_count() > 0);
        watchers.push(Arc::downgrade(watcher));
    }

    /// Trigger every live agent. Returns how many were signalled.
    pub fn trigger_all(&self) -> usize {
        let mut watchers = self.watchers.lock();
        watchers.retain(|w| w.strong_count() > 0);
        let mut count = 0;
        for watcher in watchers.iter().filter_map(Weak::upgrade) {
            match watcher.trigger() {
                Ok(()) => count += 1,
                Err(e) => {
                    tracing::warn!(target_pid = watcher.target_pid(), error = %e, "failed to signal nsagent")
                }
            }
        }
        count
    }
}
