//! Bypass decisions driven through the registry with an in-memory host.

mod common;

use common::*;
use netbypass::nsagent::{Interface, Message};
use netbypass::{FdKind, ReplayOption, SocketState, Syscall};
use proptest::prelude::*;

const TGID: u32 = 100;

#[test]
fn connect_to_published_loopback_port_rewrites_port() {
    let config = config(&["8080:80"]);
    let mut reg = registry(&config);
    let mut host = FakeHost::new();
    host.add_tcp(TGID, 7, libc::AF_INET);
    let dst = host.put_addr(TGID, "127.0.0.1:80");

    let resp = reg.handle(&mut host, &connect(1, TGID, 7, dst, 16));

    assert!(resp.continue_syscall);
    assert_eq!(resp.injected_fd, Some(7));
    assert_eq!(host.peek_addr(TGID, dst, 16), "127.0.0.1:8080".parse().unwrap());
    let socket = reg.socket(TGID, 7).unwrap();
    assert_eq!(socket.state(), SocketState::Bypassed);
    assert_eq!(socket.addr(), Some("127.0.0.1:80".parse().unwrap()));
    assert_eq!(socket.original_peer(), Some("127.0.0.1:80".parse().unwrap()));

    // The rewrite lands before the fd is swapped.
    let write = host.ops.iter().position(|op| matches!(op, HostOp::Write { .. }));
    let inject = host.ops.iter().position(|op| matches!(op, HostOp::Inject { .. }));
    assert!(write.unwrap() < inject.unwrap());
}

#[test]
fn bind_replays_options_before_binding_published_port() {
    let config = config(&["5201:5201"]);
    let mut reg = registry(&config);
    let mut host = FakeHost::new();
    host.add_tcp(TGID, 3, libc::AF_INET);
    let one = host.put(TGID, &1i32.to_ne_bytes());
    let addr = host.put_addr(TGID, "0.0.0.0:5201");

    let resp = reg.handle(
        &mut host,
        &setsockopt(1, TGID, 3, libc::SOL_SOCKET, libc::SO_REUSEADDR, one, 4),
    );
    assert!(resp.continue_syscall);
    assert_eq!(host.created(), 0);

    let resp = reg.handle(&mut host, &bind(2, TGID, 3, addr, 16));
    assert!(!resp.continue_syscall);
    assert_eq!(resp.val, 0);
    assert_eq!(resp.injected_fd, Some(3));
    assert_eq!(reg.socket(TGID, 3).unwrap().state(), SocketState::Bypassed);

    assert_eq!(
        host.ops,
        vec![
            HostOp::Create {
                socket: 0,
                args: netbypass::SocketArgs {
                    domain: libc::AF_INET,
                    ty: libc::SOCK_STREAM,
                    protocol: libc::IPPROTO_TCP,
                },
            },
            HostOp::Apply {
                socket: 0,
                option: ReplayOption::SockOpt {
                    level: libc::SOL_SOCKET,
                    name: libc::SO_REUSEADDR,
                    value: 1i32.to_ne_bytes().to_vec(),
                },
            },
            HostOp::Bind {
                socket: 0,
                addr: "0.0.0.0:5201".parse().unwrap(),
            },
            HostOp::Inject {
                notif_id: 2,
                socket: 0,
                target_fd: 3,
                cloexec: false,
            },
        ]
    );
}

#[test]
fn bind_uses_mapped_host_port() {
    let config = config(&["8080:80"]);
    let mut reg = registry(&config);
    let mut host = FakeHost::new();
    host.add_tcp(TGID, 3, libc::AF_INET6);
    let addr = host.put_addr(TGID, "[::]:80");

    reg.handle(&mut host, &bind(1, TGID, 3, addr, 28));

    assert_eq!(reg.socket(TGID, 3).unwrap().addr(), Some("[::]:80".parse().unwrap()));
    assert!(host.ops.contains(&HostOp::Bind {
        socket: 0,
        addr: "[::]:8080".parse().unwrap(),
    }));
    // The caller's buffer is left alone on bind.
    assert!(host.writes().is_empty());
}

#[test]
fn threads_share_socket_records() {
    let config = config(&[]);
    let mut reg = registry(&config);
    let mut host = FakeHost::new();
    host.add_thread(101, TGID);
    host.add_thread(102, TGID);
    host.add_tcp(TGID, 7, libc::AF_INET);
    let dst = host.put_addr(TGID, "93.184.216.34:443");

    reg.handle(&mut host, &connect(1, 101, 7, dst, 16));
    assert_eq!(reg.socket(101, 7).unwrap().state(), SocketState::Bypassed);

    let one = host.put(TGID, &1i32.to_ne_bytes());
    reg.handle(
        &mut host,
        &setsockopt(2, 102, 7, libc::SOL_SOCKET, libc::SO_KEEPALIVE, one, 4),
    );

    assert_eq!(reg.tgid_of(102), Some(TGID));
    assert_eq!(reg.process_count(), 1);
    assert_eq!(host.inspections, 1);
    let socket = reg.socket(102, 7).unwrap();
    assert_eq!(socket.state(), SocketState::Bypassed);
    assert!(socket.options().is_empty());

    reg.handle(&mut host, &close(3, 102, 7));
    assert!(reg.socket(101, 7).is_none());

    reg.handle(&mut host, &notif(4, 102, Syscall::Exit { group: false }, [0; 6]));
    assert_eq!(reg.tgid_of(102), None);
    assert_eq!(reg.tgid_of(101), Some(TGID));
    assert_eq!(reg.process_count(), 1);
}

#[test]
fn close_from_unseen_thread_releases_fd() {
    let config = config(&[]);
    let mut reg = registry(&config);
    let mut host = FakeHost::new();
    host.add_thread(101, TGID);
    host.add_thread(102, TGID);
    host.add_tcp(TGID, 7, libc::AF_INET);
    let dst = host.put_addr(TGID, "1.1.1.1:443");

    reg.handle(&mut host, &connect(1, 101, 7, dst, 16));
    assert_eq!(reg.socket(101, 7).unwrap().state(), SocketState::Bypassed);

    let resp = reg.handle(&mut host, &close(2, 102, 7));
    assert!(resp.continue_syscall);
    assert!(reg.socket(101, 7).is_none());
    assert_eq!(reg.tgid_of(102), Some(TGID));

    // fd 7 reused for a fresh socket
    let resp = reg.handle(&mut host, &connect(3, 102, 7, dst, 16));
    assert_eq!(resp.injected_fd, Some(7));
    assert_eq!(host.injections().len(), 2);
    assert_eq!(reg.socket(102, 7).unwrap().state(), SocketState::Bypassed);
}

#[test]
fn exit_from_unseen_thread() {
    let config = config(&[]);
    let mut reg = registry(&config);
    let mut host = FakeHost::new();
    host.add_thread(101, TGID);
    host.add_thread(102, TGID);
    host.add_thread(103, TGID);
    host.add_tcp(TGID, 7, libc::AF_INET);
    let one = host.put(TGID, &1i32.to_ne_bytes());

    reg.handle(
        &mut host,
        &setsockopt(1, TGID, 7, libc::SOL_SOCKET, libc::SO_KEEPALIVE, one, 4),
    );
    assert_eq!(reg.process_count(), 1);

    reg.handle(&mut host, &notif(2, 102, Syscall::Exit { group: false }, [0; 6]));
    assert_eq!(reg.process_count(), 1);
    assert_eq!(reg.tgid_of(102), None);

    reg.handle(&mut host, &notif(3, 103, Syscall::Exit { group: true }, [0; 6]));
    assert_eq!(reg.process_count(), 0);
    assert_eq!(reg.tgid_of(TGID), None);
}

#[test]
fn close_and_exit_without_tracked_processes_open_nothing() {
    let config = config(&[]);
    let mut reg = registry(&config);
    let mut host = FakeHost::new();
    host.add_thread(101, TGID);

    reg.handle(&mut host, &close(1, 101, 7));
    reg.handle(&mut host, &notif(2, 101, Syscall::Exit { group: true }, [0; 6]));
    assert_eq!(host.opens, 0);
    assert_eq!(reg.process_count(), 0);
}

#[test]
fn refreshed_subnets_stop_later_bypasses() {
    let config = config(&[]);
    let mut reg = registry(&config);
    let mut host = FakeHost::new();
    host.add_tcp(TGID, 7, libc::AF_INET);
    host.add_tcp(TGID, 8, libc::AF_INET);
    let dst = host.put_addr(TGID, "10.0.0.5:80");

    reg.handle(&mut host, &connect(1, TGID, 7, dst, 16));
    assert_eq!(reg.socket(TGID, 7).unwrap().state(), SocketState::Bypassed);

    reg.nonbypassable().apply(&Message {
        interfaces: vec![Interface {
            name: "eth0".into(),
            hw_addr: "02:42:0a:00:00:02".into(),
            cidrs: vec!["10.0.0.2/24".into()],
        }],
    });
    assert!(reg.nonbypassable().last_update().is_some());

    let resp = reg.handle(&mut host, &connect(2, TGID, 8, dst, 16));
    assert!(resp.continue_syscall);
    assert_eq!(resp.injected_fd, None);
    assert_eq!(reg.socket(TGID, 8).unwrap().state(), SocketState::NotBypassable);
    assert_eq!(host.injections().len(), 1);
}

#[test]
fn bind_without_mapping_is_left_alone() {
    let config = config(&["8080:80"]);
    let mut reg = registry(&config);
    let mut host = FakeHost::new();
    host.add_tcp(TGID, 3, libc::AF_INET);
    let addr = host.put_addr(TGID, "0.0.0.0:9000");

    let resp = reg.handle(&mut host, &bind(1, TGID, 3, addr, 16));

    assert!(resp.continue_syscall);
    assert_eq!(resp.injected_fd, None);
    assert_eq!(host.created(), 0);
    assert!(host.injections().is_empty());
    assert_eq!(reg.socket(TGID, 3).unwrap().state(), SocketState::NotBypassable);
}

#[test]
fn connect_inside_sandbox_has_no_side_effects() {
    let config = config(&["8080:80"]).ignore("192.168.0.0/16".parse().unwrap());
    let mut reg = registry(&config);
    let mut host = FakeHost::new();
    host.add_tcp(TGID, 7, libc::AF_INET);
    let dst = host.put_addr(TGID, "192.168.1.10:80");
    let before = host.peek(TGID, dst, 16);

    let resp = reg.handle(&mut host, &connect(1, TGID, 7, dst, 16));

    assert!(resp.continue_syscall);
    assert_eq!(resp.injected_fd, None);
    assert!(host.ops.is_empty());
    assert_eq!(host.peek(TGID, dst, 16), before);
    assert_eq!(reg.socket(TGID, 7).unwrap().state(), SocketState::NotBypassable);
}

#[test]
fn connect_to_own_address_goes_to_host_loopback() {
    let config = config(&["8080:80"]);
    let mut reg = registry(&config);
    let mut host = FakeHost::new();
    host.add_tcp(TGID, 7, libc::AF_INET);
    reg.nonbypassable().apply(&Message {
        interfaces: vec![Interface {
            name: "tap0".into(),
            hw_addr: String::new(),
            cidrs: vec!["10.0.2.100/24".into()],
        }],
    });
    let dst = host.put_addr(TGID, "10.0.2.100:80");

    let resp = reg.handle(&mut host, &connect(1, TGID, 7, dst, 16));

    assert!(resp.continue_syscall);
    assert_eq!(resp.injected_fd, Some(7));
    assert_eq!(host.peek_addr(TGID, dst, 16), "127.0.0.1:8080".parse().unwrap());
    assert_eq!(reg.socket(TGID, 7).unwrap().state(), SocketState::Bypassed);
}

#[test]
fn close_is_idempotent() {
    let config = config(&[]);
    let mut reg = registry(&config);
    let mut host = FakeHost::new();
    host.add_tcp(TGID, 7, libc::AF_INET);
    let one = host.put(TGID, &1i32.to_ne_bytes());
    reg.handle(
        &mut host,
        &setsockopt(1, TGID, 7, libc::IPPROTO_TCP, libc::TCP_NODELAY, one, 4),
    );
    assert!(reg.socket(TGID, 7).is_some());

    for id in 2..4 {
        let resp = reg.handle(&mut host, &close(id, TGID, 7));
        assert!(resp.continue_syscall);
        assert!(reg.socket(TGID, 7).is_none());
    }
    // Never seen before.
    let resp = reg.handle(&mut host, &close(4, 999, 12));
    assert!(resp.continue_syscall);
}

#[test]
fn connect_reregisters_reused_fd() {
    let config = config(&[]);
    let mut reg = registry(&config);
    let mut host = FakeHost::new();
    // fd 5 starts out as a pipe
    host.set_fd(TGID, 5, FdKind::NotSocket);
    reg.handle(&mut host, &fcntl(1, TGID, 5, libc::F_SETFL, libc::O_NONBLOCK));
    assert_eq!(reg.socket(TGID, 5).unwrap().state(), SocketState::NotBypassable);

    // ...and was closed and reused for a socket without us seeing the close.
    host.add_tcp(TGID, 5, libc::AF_INET);
    let dst = host.put_addr(TGID, "1.1.1.1:443");
    let resp = reg.handle(&mut host, &connect(2, TGID, 5, dst, 16));

    assert_eq!(resp.injected_fd, Some(5));
    assert_eq!(reg.socket(TGID, 5).unwrap().state(), SocketState::Bypassed);
}

#[test]
fn ineligible_sockets() {
    let config = config(&[]);
    let mut reg = registry(&config);
    let mut host = FakeHost::new();
    host.set_fd(TGID, 3, tcp(libc::AF_INET, true));
    host.set_fd(
        TGID,
        4,
        FdKind::Socket {
            args: netbypass::SocketArgs {
                domain: libc::AF_INET,
                ty: libc::SOCK_DGRAM,
                protocol: libc::IPPROTO_UDP,
            },
            connected: false,
            nonblocking: false,
            cloexec: false,
        },
    );
    let dst = host.put_addr(TGID, "8.8.8.8:53");

    // An accepted socket is re-registered on connect but stays ineligible.
    reg.handle(&mut host, &connect(1, TGID, 3, dst, 16));
    reg.handle(&mut host, &connect(2, TGID, 4, dst, 16));

    assert_eq!(reg.socket(TGID, 3).unwrap().state(), SocketState::NotBypassable);
    assert_eq!(reg.socket(TGID, 4).unwrap().state(), SocketState::NotBypassable);
    assert!(host.ops.is_empty());
}

#[test]
fn nonblocking_and_cloexec_follow_the_original() {
    let config = config(&[]);
    let mut reg = registry(&config);
    let mut host = FakeHost::new();
    host.set_fd(
        TGID,
        7,
        FdKind::Socket {
            args: netbypass::SocketArgs {
                domain: libc::AF_INET,
                ty: libc::SOCK_STREAM,
                protocol: 0,
            },
            connected: false,
            nonblocking: true,
            cloexec: false,
        },
    );
    reg.handle(&mut host, &fcntl(1, TGID, 7, libc::F_SETFD, libc::FD_CLOEXEC));
    let dst = host.put_addr(TGID, "1.1.1.1:443");
    reg.handle(&mut host, &connect(2, TGID, 7, dst, 16));

    assert!(host.ops.contains(&HostOp::Apply {
        socket: 0,
        option: ReplayOption::StatusFlags(libc::O_NONBLOCK),
    }));
    assert!(host.ops.contains(&HostOp::Inject {
        notif_id: 2,
        socket: 0,
        target_fd: 7,
        cloexec: true,
    }));
}

#[test]
fn failed_injection_after_rewrite_restores_and_errors() {
    let config = config(&["8080:80"]);
    let mut reg = registry(&config);
    let mut host = FakeHost::new();
    host.fail_inject = true;
    host.add_tcp(TGID, 7, libc::AF_INET);
    let dst = host.put_addr(TGID, "127.0.0.1:80");
    let one = host.put(TGID, &1i32.to_ne_bytes());

    let resp = reg.handle(&mut host, &connect(1, TGID, 7, dst, 16));

    assert!(resp.continue_syscall);
    assert_eq!(resp.injected_fd, None);
    assert_eq!(host.peek_addr(TGID, dst, 16), "127.0.0.1:80".parse().unwrap());
    assert_eq!(reg.socket(TGID, 7).unwrap().state(), SocketState::Error);

    // Error sockets keep recording options but are never acted on again.
    host.fail_inject = false;
    reg.handle(
        &mut host,
        &setsockopt(2, TGID, 7, libc::SOL_SOCKET, libc::SO_REUSEADDR, one, 4),
    );
    reg.handle(&mut host, &connect(3, TGID, 7, dst, 16));
    let socket = reg.socket(TGID, 7).unwrap();
    assert_eq!(socket.state(), SocketState::Error);
    assert_eq!(socket.options().len(), 1);
    assert!(host.injections().is_empty());
}

#[test]
fn failed_injection_without_rewrite_is_not_bypassable() {
    let config = config(&[]);
    let mut reg = registry(&config);
    let mut host = FakeHost::new();
    host.fail_inject = true;
    host.add_tcp(TGID, 7, libc::AF_INET);
    let dst = host.put_addr(TGID, "1.1.1.1:443");

    reg.handle(&mut host, &connect(1, TGID, 7, dst, 16));

    assert_eq!(reg.socket(TGID, 7).unwrap().state(), SocketState::NotBypassable);
    assert!(host.writes().is_empty());
}

#[test]
fn failed_host_bind_is_not_bypassable() {
    let config = config(&["5201:5201"]);
    let mut reg = registry(&config);
    let mut host = FakeHost::new();
    host.fail_bind = true;
    host.add_tcp(TGID, 3, libc::AF_INET);
    let addr = host.put_addr(TGID, "0.0.0.0:5201");

    let resp = reg.handle(&mut host, &bind(1, TGID, 3, addr, 16));

    assert!(resp.continue_syscall);
    assert!(host.injections().is_empty());
    assert_eq!(reg.socket(TGID, 3).unwrap().state(), SocketState::NotBypassable);
}

#[test]
fn getpeername_reports_original_peer() {
    let config = config(&["8080:80"]);
    let mut reg = registry(&config);
    let mut host = FakeHost::new();
    host.add_tcp(TGID, 7, libc::AF_INET);
    let dst = host.put_addr(TGID, "127.0.0.1:80");
    reg.handle(&mut host, &connect(1, TGID, 7, dst, 16));

    // Not connected yet (non-blocking connect in progress).
    let out = host.put(TGID, &[0u8; 16]);
    let len = host.put(TGID, &16u32.to_ne_bytes());
    let resp = reg.handle(&mut host, &getpeername(2, TGID, 7, out, len));
    assert!(resp.continue_syscall);

    host.set_fd(TGID, 7, tcp(libc::AF_INET, true));
    let resp = reg.handle(&mut host, &getpeername(3, TGID, 7, out, len));
    assert!(!resp.continue_syscall);
    assert_eq!(resp.val, 0);
    assert_eq!(host.peek_addr(TGID, out, 16), "127.0.0.1:80".parse().unwrap());
    assert_eq!(host.peek(TGID, len, 4), 16u32.to_ne_bytes());
}

#[test]
fn getpeername_truncates_to_caller_buffer() {
    let config = config(&["8080:80"]);
    let mut reg = registry(&config);
    let mut host = FakeHost::new();
    host.add_tcp(TGID, 7, libc::AF_INET6);
    let dst = host.put_addr(TGID, "[::1]:80");
    reg.handle(&mut host, &connect(1, TGID, 7, dst, 28));
    host.set_fd(TGID, 7, tcp(libc::AF_INET6, true));

    let out = host.put(TGID, &[0u8; 4]);
    let len = host.put(TGID, &4u32.to_ne_bytes());
    reg.handle(&mut host, &getpeername(2, TGID, 7, out, len));

    assert_eq!(host.peek(TGID, out + 2, 2), 80u16.to_be_bytes());
    // guard bytes after the buffer are untouched
    assert_eq!(host.peek(TGID, out + 4, 1), vec![0xee]);
    assert_eq!(host.peek(TGID, len, 4), 28u32.to_ne_bytes());
}

#[test]
fn getpeername_without_rewrite_passes_through() {
    let config = config(&[]);
    let mut reg = registry(&config);
    let mut host = FakeHost::new();
    host.add_tcp(TGID, 7, libc::AF_INET);
    let dst = host.put_addr(TGID, "1.1.1.1:443");
    reg.handle(&mut host, &connect(1, TGID, 7, dst, 16));
    host.set_fd(TGID, 7, tcp(libc::AF_INET, true));

    let out = host.put(TGID, &[0u8; 16]);
    let len = host.put(TGID, &16u32.to_ne_bytes());
    let resp = reg.handle(&mut host, &getpeername(2, TGID, 7, out, len));
    assert!(resp.continue_syscall);
}

#[test]
fn exit_rules() {
    let config = config(&[]);
    let mut reg = registry(&config);
    let mut host = FakeHost::new();
    host.add_thread(101, TGID);
    host.add_tcp(TGID, 7, libc::AF_INET);
    let one = host.put(TGID, &1i32.to_ne_bytes());
    let opt = |id, pid| setsockopt(id, pid, 7, libc::SOL_SOCKET, libc::SO_KEEPALIVE, one, 4);

    reg.handle(&mut host, &opt(1, 101));
    reg.handle(&mut host, &opt(2, TGID));
    assert_eq!(reg.process_count(), 1);

    // A non-leader thread exiting only forgets that thread.
    reg.handle(&mut host, &notif(3, 101, Syscall::Exit { group: false }, [0; 6]));
    assert_eq!(reg.tgid_of(101), None);
    assert!(reg.socket(TGID, 7).is_some());

    reg.handle(&mut host, &notif(4, TGID, Syscall::Exit { group: true }, [0; 6]));
    assert_eq!(reg.process_count(), 0);
    assert!(reg.socket(TGID, 7).is_none());
}

#[test]
fn broken_memory_helper_disables_bypass_for_process() {
    let config = config(&[]);
    let mut reg = registry(&config);
    let mut host = FakeHost::new();
    host.add_tcp(TGID, 7, libc::AF_INET);
    host.add_tcp(TGID, 8, libc::AF_INET);
    let dst = host.put_addr(TGID, "1.1.1.1:443");
    host.helper_broken.insert(TGID);

    let resp = reg.handle(&mut host, &connect(1, TGID, 7, dst, 16));
    assert!(resp.continue_syscall);
    assert_eq!(reg.socket(TGID, 7).unwrap().state(), SocketState::NotBypassable);

    host.helper_broken.clear();
    reg.handle(&mut host, &connect(2, TGID, 8, dst, 16));
    assert_eq!(reg.socket(TGID, 8).unwrap().state(), SocketState::NotBypassable);
    assert!(host.ops.is_empty());
}

#[test]
fn vanished_process_is_answered() {
    let config = config(&[]);
    let mut reg = registry(&config);
    let mut host = FakeHost::new();
    host.add_tcp(TGID, 7, libc::AF_INET);
    let dst = host.put_addr(TGID, "1.1.1.1:443");
    host.gone.insert(TGID);

    let resp = reg.handle(&mut host, &connect(1, TGID, 7, dst, 16));
    assert!(resp.continue_syscall);
    assert_eq!(reg.process_count(), 0);
}

#[test]
fn unsupported_and_datagram_syscalls_continue() {
    let config = config(&[]);
    let mut reg = registry(&config);
    let mut host = FakeHost::new();
    host.add_tcp(TGID, 7, libc::AF_INET);

    for syscall in [Syscall::SendTo, Syscall::SendMsg, Syscall::Unsupported(0)] {
        let resp = reg.handle(&mut host, &notif(1, TGID, syscall, [7, 0, 0, 0, 0, 0]));
        assert!(resp.continue_syscall);
    }
    assert_eq!(reg.process_count(), 0);
}

#[test]
fn oversized_option_is_not_replayed() {
    let config = config(&[]);
    let mut reg = registry(&config);
    let mut host = FakeHost::new();
    host.add_tcp(TGID, 7, libc::AF_INET);

    reg.handle(
        &mut host,
        &setsockopt(1, TGID, 7, libc::SOL_SOCKET, libc::SO_ATTACH_FILTER, 0x1234, 1 << 20),
    );
    reg.handle(&mut host, &setsockopt(2, TGID, 7, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 0, 0));

    assert_eq!(
        reg.socket(TGID, 7).unwrap().options(),
        &[ReplayOption::SockOpt {
            level: libc::SOL_SOCKET,
            name: libc::SO_KEEPALIVE,
            value: Vec::new(),
        }]
    );
}

#[derive(Debug, Clone, Copy)]
enum Op {
    SetSockOpt,
    Fcntl,
    Bind(bool),
    Connect(u8),
    Close,
    FailInject(bool),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::SetSockOpt),
        Just(Op::Fcntl),
        any::<bool>().prop_map(Op::Bind),
        (0u8..3).prop_map(Op::Connect),
        Just(Op::Close),
        any::<bool>().prop_map(Op::FailInject),
    ]
}

fn legal(from: Option<SocketState>, to: Option<SocketState>, op: Op) -> bool {
    use SocketState::*;
    match (from, to) {
        (a, b) if a == b => true,
        (_, None) => matches!(op, Op::Close),
        (None, Some(_)) => true,
        (Some(NotBypassed), Some(NotBypassable | Bypassed | Error)) => true,
        // re-registration on connect
        (Some(NotBypassable), Some(_)) => matches!(op, Op::Connect(_)),
        _ => false,
    }
}

proptest! {
    #[test]
    fn state_graph(ops in proptest::collection::vec(op(), 1..40)) {
        let config = config(&["8080:80", "5201:5201"]);
        let mut reg = registry(&config);
        let mut host = FakeHost::new();
        host.add_tcp(TGID, 7, libc::AF_INET);
        let one = host.put(TGID, &1i32.to_ne_bytes());
        let published = host.put_addr(TGID, "0.0.0.0:5201");
        let unpublished = host.put_addr(TGID, "0.0.0.0:9000");
        let loopback = host.put_addr(TGID, "127.0.0.1:80");
        let inside = host.put_addr(TGID, "127.0.0.1:22");
        let outside = host.put_addr(TGID, "1.1.1.1:443");

        for (i, op) in ops.into_iter().enumerate() {
            let id = i as u64;
            let before = reg.socket(TGID, 7).map(|s| s.state());
            let injections = host.injections().len();
            let loopback_before = host.peek(TGID, loopback, 16);
            let notif = match op {
                Op::SetSockOpt => setsockopt(id, TGID, 7, libc::SOL_SOCKET, libc::SO_REUSEADDR, one, 4),
                Op::Fcntl => fcntl(id, TGID, 7, libc::F_SETFL, libc::O_NONBLOCK),
                Op::Bind(true) => bind(id, TGID, 7, published, 16),
                Op::Bind(false) => bind(id, TGID, 7, unpublished, 16),
                Op::Connect(0) => connect(id, TGID, 7, loopback, 16),
                Op::Connect(1) => connect(id, TGID, 7, inside, 16),
                Op::Connect(_) => connect(id, TGID, 7, outside, 16),
                Op::Close => close(id, TGID, 7),
                Op::FailInject(fail) => {
                    host.fail_inject = fail;
                    continue;
                }
            };
            let resp = reg.handle(&mut host, &notif);
            let after = reg.socket(TGID, 7).map(|s| s.state());

            prop_assert!(legal(before, after, op), "{:?} -> {:?} on {:?}", before, after, op);
            // Only a transition into Bypassed injects, and it always does.
            let injected = host.injections().len() > injections;
            prop_assert_eq!(injected, resp.injected_fd.is_some());
            prop_assert_eq!(
                injected,
                after == Some(SocketState::Bypassed) && before != after
            );
            // A real bind never also runs in the sandbox once bypassed.
            if matches!(op, Op::Bind(_)) && injected {
                prop_assert!(!resp.continue_syscall);
            }
            // Rewrites are undone unless the bypass went through.
            if !injected {
                prop_assert_eq!(host.peek(TGID, loopback, 16), loopback_before);
            }
        }
    }
}
