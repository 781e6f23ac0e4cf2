//! Raw `sockaddr_in` / `sockaddr_in6` codec.
//!
//! Addresses are exchanged with the monitored process as raw bytes in its
//! memory. The layouts are fixed by the kernel ABI:
//!
//! ```text
//! sockaddr_in  (16 bytes): family:u16(native) port:u16(be) addr:[u8;4] zero:[u8;8]
//! sockaddr_in6 (28 bytes): family:u16(native) port:u16(be) flowinfo:u32(native)
//!                          addr:[u8;16] scope_id:u32(native)
//! ```
//!
//! `flowinfo` and `scope_id` are kept exactly as stored, the same way the
//! standard library converts `libc::sockaddr_in6`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use thiserror::Error;

pub const SOCKADDR_IN_LEN: usize = 16;
pub const SOCKADDR_IN6_LEN: usize = 28;

/// Offset of the big-endian port in both layouts.
pub const PORT_OFFSET: u64 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SockaddrError {
    #[error("buffer of {len} bytes is too short for family {family}")]
    TooShort { family: u16, len: usize },

    #[error("unsupported address family {0}")]
    UnsupportedFamily(u16),
}

/// Decode a raw socket address.
///
/// Trailing bytes beyond the family's struct size are ignored, so a buffer
/// sized for `sockaddr_storage` decodes fine.
pub fn decode(buf: &[u8]) -> Result<SocketAddr, SockaddrError> {
    if buf.len() < 2 {
        return Err(SockaddrError::TooShort {
            family: 0,
            len: buf.len(),
        });
    }
    let family = u16::from_ne_bytes([buf[0], buf[1]]);

    match i32::from(family) {
        libc::AF_INET => {
            let b = buf
                .get(..SOCKADDR_IN_LEN)
                .ok_or(SockaddrError::TooShort { family, len: buf.len() })?;
            let port = u16::from_be_bytes([b[2], b[3]]);
            let ip = Ipv4Addr::new(b[4], b[5], b[6], b[7]);
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 => {
            let b = buf
                .get(..SOCKADDR_IN6_LEN)
                .ok_or(SockaddrError::TooShort { family, len: buf.len() })?;
            let port = u16::from_be_bytes([b[2], b[3]]);
            let flowinfo = u32::from_ne_bytes([b[4], b[5], b[6], b[7]]);
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&b[8..24]);
            let scope_id = u32::from_ne_bytes([b[24], b[25], b[26], b[27]]);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(octets),
                port,
                flowinfo,
                scope_id,
            )))
        }
        _ => Err(SockaddrError::UnsupportedFamily(family)),
    }
}

/// Encode a socket address into its kernel layout.
pub fn encode(addr: &SocketAddr) -> Vec<u8> {
    match addr {
        SocketAddr::V4(v4) => {
            let mut buf = vec![0u8; SOCKADDR_IN_LEN];
            buf[0..2].copy_from_slice(&(libc::AF_INET as u16).to_ne_bytes());
            buf[2..4].copy_from_slice(&v4.port().to_be_bytes());
            buf[4..8].copy_from_slice(&v4.ip().octets());
            buf
        }
        SocketAddr::V6(v6) => {
            let mut buf = vec![0u8; SOCKADDR_IN6_LEN];
            buf[0..2].copy_from_slice(&(libc::AF_INET6 as u16).to_ne_bytes());
            buf[2..4].copy_from_slice(&v6.port().to_be_bytes());
            buf[4..8].copy_from_slice(&v6.flowinfo().to_ne_bytes());
            buf[8..24].copy_from_slice(&v6.ip().octets());
            buf[24..28].copy_from_slice(&v6.scope_id().to_ne_bytes());
            buf
        }
    }
}

/// Size of the kernel struct for this address's family.
pub fn encoded_len(addr: &SocketAddr) -> usize {
    match addr {
        SocketAddr::V4(_) => SOCKADDR_IN_LEN,
        SocketAddr::V6(_) => SOCKADDR_IN6_LEN,
    }
}

/// Offset of the IP address bytes inside the struct.
pub fn ip_offset(addr: &SocketAddr) -> u64 {
    match addr {
        SocketAddr::V4(_) => 4,
        SocketAddr::V6(_) => 8,
    }
}

/// Raw bytes of the loopback address of the same family.
///
/// An IPv4-mapped IPv6 destination gets `::ffff:127.0.0.1` so that a dual-stack
/// socket keeps talking IPv4.
pub fn loopback_octets(addr: &SocketAddr) -> Vec<u8> {
    match addr {
        SocketAddr::V4(_) => Ipv4Addr::LOCALHOST.octets().to_vec(),
        SocketAddr::V6(v6) if v6.ip().to_ipv4_mapped().is_some() => {
            Ipv4Addr::LOCALHOST.to_ipv6_mapped().octets().to_vec()
        }
        SocketAddr::V6(_) => Ipv6Addr::LOCALHOST.octets().to_vec(),
    }
}

/// Loopback check that also accepts IPv4-mapped IPv6 loopback.
pub fn is_loopback(ip: IpAddr) -> bool {
    ip.to_canonical().is_loopback()
}
