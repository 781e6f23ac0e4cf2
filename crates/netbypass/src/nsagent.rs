//! Namespace agent: reports the interfaces of the network namespace it runs in.
//!
//! The daemon starts `nsenter -t <pid> -n -- netbypass nsagent`, so the agent
//! sees the sandbox's interfaces, not the host's. It prints one JSON line per
//! report on stdout:
//!
//! ```json
//! {"interfaces":[{"name":"eth0","hwAddr":"02:42:ac:11:00:02","cidrs":["10.0.2.100/24"]},
//!                {"name":"lo","hwAddr":"","cidrs":["127.0.0.1/8","::1/128"]}]}
//! ```
//!
//! Interfaces are sorted by name and each CIDR list is sorted as strings.
//! A new report is printed on `SIGHUP`; `SIGTERM` and `SIGINT` end the agent.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::net::IpAddr;

use nix::ifaddrs::getifaddrs;
use nix::sys::signal::{SigSet, Signal};
use nix::sys::socket::SockaddrStorage;
use serde::{Deserialize, Serialize};

/// One agent report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub interfaces: Vec<Interface>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    #[serde(rename = "hwAddr", default)]
    pub hw_addr: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub cidrs: Vec<String>,
}

// Agents written in other languages emit `null` for an empty list.
fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Enumerate the interfaces of the current network namespace.
pub fn inspect() -> io::Result<Message> {
    let mut by_name: BTreeMap<String, Interface> = BTreeMap::new();

    for ifaddr in getifaddrs().map_err(io::Error::from)? {
        let entry = by_name
            .entry(ifaddr.interface_name.clone())
            .or_insert_with(|| Interface {
                name: ifaddr.interface_name.clone(),
                ..Interface::default()
            });

        let Some(address) = ifaddr.address.as_ref() else {
            continue;
        };
        if let Some(mac) = address.as_link_addr().and_then(|link| link.addr()) {
            if mac != [0; 6] {
                entry.hw_addr = format_mac(&mac);
            }
            continue;
        }
        if let Some(ip) = storage_ip(address) {
            let prefix = ifaddr
                .netmask
                .as_ref()
                .and_then(storage_ip)
                .map_or(full_prefix(ip), prefix_len);
            entry.cidrs.push(format!("{ip}/{prefix}"));
        }
    }

    let interfaces = by_name
        .into_values()
        .map(|mut intf| {
            intf.cidrs.sort();
            intf
        })
        .collect();
    Ok(Message { interfaces })
}

/// Print a report now and on every `SIGHUP` until told to stop.
///
/// The caller must have blocked `SIGHUP`, `SIGTERM` and `SIGINT` in every
/// thread before calling this, see [`agent_signals`].
pub fn run(mut out: impl Write) -> io::Result<()> {
    let signals = agent_signals();
    loop {
        let msg = inspect()?;
        let line = serde_json::to_string(&msg).map_err(io::Error::other)?;
        writeln!(out, "{line}")?;
        out.flush()?;

        loop {
            match signals.wait().map_err(io::Error::from)? {
                Signal::SIGHUP => break,
                Signal::SIGTERM | Signal::SIGINT => return Ok(()),
                _ => {}
            }
        }
    }
}

/// Signals the agent waits for synchronously.
pub fn agent_signals() -> SigSet {
    let mut set = SigSet::empty();
    set.add(Signal::SIGHUP);
    set.add(Signal::SIGTERM);
    set.add(Signal::SIGINT);
    set
}

fn storage_ip(storage: &SockaddrStorage) -> Option<IpAddr> {
    if let Some(sin) = storage.as_sockaddr_in() {
        return Some(IpAddr::V4(std::net::SocketAddrV4::from(*sin).ip().to_owned()));
    }
    storage
        .as_sockaddr_in6()
        .map(|sin6| IpAddr::V6(std::net::SocketAddrV6::from(*sin6).ip().to_owned()))
}

fn prefix_len(mask: IpAddr) -> u8 {
    match mask {
        IpAddr::V4(m) => u32::from(m).count_ones() as u8,
        IpAddr::V6(m) => u128::from(m).count_ones() as u8,
    }
}

fn full_prefix(ip: IpAddr) -> u8 {
    if ip.is_ipv4() { 32 } else { 128 }
}

fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}
