//! Sessions over [`UdpNonBlockingSocket`] on the loopback interface.

// Allow hardcoded IP addresses - 127.0.0.1 is appropriate for tests
#![allow(
    clippy::ip_constant,
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use crate::common::stubs::GameStub;
use crate::common::{advance_lockstep, assert_confirmed_state, init_tracing, synchronize_sessions};
use rampart_rollback::{
    Fletcher32, Frame, P2PSession, PlayerHandle, PlayerType, SessionConfig, UdpNonBlockingSocket,
};
use serial_test::serial;

fn bind_loopback() -> (UdpNonBlockingSocket, SocketAddr) {
    let socket =
        UdpNonBlockingSocket::bind_to(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)).unwrap();
    let addr = socket.local_addr().unwrap();
    (socket, addr)
}

#[test]
#[serial]
fn test_udp_sessions_reach_agreement() {
    init_tracing();
    let (socket_a, addr_a) = bind_loopback();
    let (socket_b, addr_b) = bind_loopback();
    let config = SessionConfig::new(2, 1);

    let a = P2PSession::new(
        config,
        vec![PlayerType::Local, PlayerType::Remote(addr_b)],
        socket_a,
        Box::new(Fletcher32),
    )
    .unwrap();
    let b = P2PSession::new(
        config,
        vec![PlayerType::Remote(addr_a), PlayerType::Local],
        socket_b,
        Box::new(Fletcher32),
    )
    .unwrap();
    let mut sessions = vec![a, b];
    let mut games = vec![GameStub::new(), GameStub::new()];
    synchronize_sessions(&mut sessions, &mut games);

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut checked = 0;
    while sessions.iter().any(|s| s.current_frame() < Frame::new(30)) {
        assert!(Instant::now() < deadline, "sessions stopped making progress");
        let advanced = advance_lockstep(&mut sessions, &mut games);
        for (session, advanced) in sessions.iter().zip(advanced.iter()) {
            if *advanced && assert_confirmed_state(session, 0) {
                checked += 1;
            }
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(checked > 0);

    assert!(sessions[0].network_stats(PlayerHandle::new(1)).is_ok());
    assert!(sessions[1].network_stats(PlayerHandle::new(0)).is_ok());
}

#[test]
#[serial]
fn test_foreign_datagrams_do_not_disturb_a_session() {
    init_tracing();
    let (socket_a, _) = bind_loopback();
    let (_, addr_b) = bind_loopback();
    let local_addr = socket_a.local_addr().unwrap();
    let mut session = P2PSession::new(
        SessionConfig::new(2, 1),
        vec![PlayerType::Local, PlayerType::Remote(addr_b)],
        socket_a,
        Box::new(Fletcher32),
    )
    .unwrap();
    let mut game = GameStub::new();

    let stranger = std::net::UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
        .unwrap();
    stranger.send_to(b"definitely not a message", local_addr).unwrap();
    stranger.send_to(&[], local_addr).unwrap();

    for _ in 0..5 {
        session.poll_remote_clients(&mut game).unwrap();
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(game.events.is_empty());
}
