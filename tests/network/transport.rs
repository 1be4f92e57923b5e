//! Sessions over [`TokioTransport`], driven from a tokio test runtime.

#![allow(
    clippy::ip_constant,
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::net::SocketAddr;
use std::time::Duration;

use crate::common::stubs::GameStub;
use crate::common::{advance_lockstep, assert_confirmed_state, init_tracing, MAX_SYNC_ITERATIONS};
use rampart_rollback::{
    Fletcher32, Frame, P2PSession, PlayerType, SessionConfig, SessionState, TokioTransport,
    TransportConfig,
};
use serial_test::serial;

async fn transport(config: TransportConfig) -> TokioTransport {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    TokioTransport::bind(addr, config).await.unwrap()
}

async fn two_sessions(
    config_a: TransportConfig,
    config_b: TransportConfig,
) -> Vec<P2PSession<SocketAddr>> {
    let transport_a = transport(config_a).await;
    let transport_b = transport(config_b).await;
    let addr_a = transport_a.local_addr();
    let addr_b = transport_b.local_addr();

    let config = SessionConfig::new(2, 1);
    let a = P2PSession::new(
        config,
        vec![PlayerType::Local, PlayerType::Remote(addr_b)],
        transport_a,
        Box::new(Fletcher32),
    )
    .unwrap();
    let b = P2PSession::new(
        config,
        vec![PlayerType::Remote(addr_a), PlayerType::Local],
        transport_b,
        Box::new(Fletcher32),
    )
    .unwrap();
    vec![a, b]
}

/// Like `synchronize_sessions`, but yields to the transport tasks between rounds.
async fn synchronize(sessions: &mut [P2PSession<SocketAddr>], games: &mut [GameStub<SocketAddr>]) {
    for _ in 0..MAX_SYNC_ITERATIONS {
        for (session, game) in sessions.iter_mut().zip(games.iter_mut()) {
            session.poll_remote_clients(game).unwrap();
        }
        if sessions
            .iter()
            .all(|s| s.current_state() == SessionState::Running)
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("sessions did not synchronize");
}

async fn play_to(
    sessions: &mut [P2PSession<SocketAddr>],
    games: &mut [GameStub<SocketAddr>],
    target: i32,
) -> usize {
    let mut checked = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while sessions.iter().any(|s| s.current_frame() < Frame::new(target)) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "sessions stopped making progress"
        );
        let advanced = advance_lockstep(sessions, games);
        for (session, advanced) in sessions.iter().zip(advanced.iter()) {
            if *advanced && assert_confirmed_state(session, 0) {
                checked += 1;
            }
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    checked
}

#[tokio::test]
#[serial]
async fn test_tokio_sessions_reach_agreement() {
    init_tracing();
    let mut sessions = two_sessions(TransportConfig::default(), TransportConfig::default()).await;
    let mut games = vec![GameStub::new(), GameStub::new()];

    synchronize(&mut sessions, &mut games).await;
    let checked = play_to(&mut sessions, &mut games, 30).await;
    assert!(checked > 0);
}

#[tokio::test]
#[serial]
async fn test_tokio_sessions_tolerate_send_jitter() {
    init_tracing();
    // jitter reorders datagrams; the protocol has to sort it out
    let jittery = TransportConfig::with_jitter(Duration::from_millis(3), 11);
    let mut sessions = two_sessions(jittery, TransportConfig::default()).await;
    let mut games = vec![GameStub::new(), GameStub::new()];

    synchronize(&mut sessions, &mut games).await;
    let checked = play_to(&mut sessions, &mut games, 40).await;
    assert!(checked > 0);
}
