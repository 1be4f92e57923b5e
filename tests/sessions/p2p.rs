//! P2P session integration tests.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::time::{Duration, Instant};

use crate::common::stubs::GameStub;
use crate::common::{
    advance_lockstep, assert_confirmed_state, synchronize_sessions, MemoryNetwork,
};
use rampart_rollback::{
    Fletcher32, Frame, InputStatus, P2PSession, PlayerHandle, PlayerType, RampartError,
    RampartEvent, SessionConfig, SessionState,
};

const ADDR_A: u16 = 1;
const ADDR_B: u16 = 2;

fn session(
    network: &MemoryNetwork,
    addr: u16,
    config: SessionConfig,
    players: Vec<PlayerType<u16>>,
) -> P2PSession<u16> {
    P2PSession::new(config, players, network.socket(addr), Box::new(Fletcher32)).unwrap()
}

/// Peer A owns handle 0, peer B owns handle 1.
fn two_peers(
    network: &MemoryNetwork,
    config: SessionConfig,
) -> (Vec<P2PSession<u16>>, Vec<GameStub<u16>>) {
    let a = session(
        network,
        ADDR_A,
        config,
        vec![PlayerType::Local, PlayerType::Remote(ADDR_B)],
    );
    let b = session(
        network,
        ADDR_B,
        config,
        vec![PlayerType::Remote(ADDR_A), PlayerType::Local],
    );
    (vec![a, b], vec![GameStub::new(), GameStub::new()])
}

#[test]
fn test_sessions_synchronize_and_report_events() {
    let network = MemoryNetwork::new();
    let (mut sessions, mut games) = two_peers(&network, SessionConfig::new(2, 1));
    assert_eq!(sessions[0].current_state(), SessionState::Synchronizing);

    synchronize_sessions(&mut sessions, &mut games);

    let events: Vec<_> = sessions[0].events().collect();
    assert_eq!(events.first(), Some(&RampartEvent::Connected { addr: ADDR_B }));
    assert!(events.contains(&RampartEvent::Synchronized { addr: ADDR_B }));
    assert!(events
        .iter()
        .any(|e| matches!(e, RampartEvent::Synchronizing { addr: ADDR_B, total: 5, .. })));
    // callbacks saw the same events
    assert_eq!(games[0].events, events);
    assert!(sessions[0].network_stats(PlayerHandle::new(1)).is_ok());
}

#[test]
fn test_lockstep_peers_agree_and_roll_back() {
    let network = MemoryNetwork::new();
    let (mut sessions, mut games) = two_peers(&network, SessionConfig::new(2, 1));
    synchronize_sessions(&mut sessions, &mut games);

    for _ in 0..60 {
        let advanced = advance_lockstep(&mut sessions, &mut games);
        assert_eq!(advanced, vec![true, true]);
        for session in &sessions {
            assert_confirmed_state(session, 0);
        }
    }

    assert_eq!(sessions[0].current_frame(), Frame::new(60));
    assert_eq!(sessions[1].current_frame(), Frame::new(60));
    // A always advances before B's input for that frame exists; B never has to guess
    assert!(games[0].loads > 0);
    assert_eq!(games[1].loads, 0);
    assert!(games[0]
        .advanced
        .iter()
        .any(|inputs| inputs[1].1 == InputStatus::Predicted));
}

#[test]
fn test_input_delay_is_applied_on_both_sides() {
    let network = MemoryNetwork::new();
    let mut config = SessionConfig::new(2, 1);
    config.input_delay = 2;
    let (mut sessions, mut games) = two_peers(&network, config);
    synchronize_sessions(&mut sessions, &mut games);

    let mut checked = 0;
    for _ in 0..40 {
        advance_lockstep(&mut sessions, &mut games);
        for session in &sessions {
            if assert_confirmed_state(session, 2) {
                checked += 1;
            }
        }
    }
    assert!(checked > 60);
    // the first two frames run on padding
    assert_eq!(games[1].advanced[0][0].0.bytes(), &[0u8]);
    assert_eq!(games[1].advanced[1][1].0.bytes(), &[0u8]);
}

#[test]
fn test_raising_input_delay_mid_game_keeps_peer_in_step() {
    let network = MemoryNetwork::new();
    let (mut sessions, mut games) = two_peers(&network, SessionConfig::new(2, 1));
    synchronize_sessions(&mut sessions, &mut games);

    for _ in 0..10 {
        advance_lockstep(&mut sessions, &mut games);
    }
    sessions[0].set_frame_delay(PlayerHandle::new(0), 2).unwrap();

    let mut compared = 0;
    for _ in 0..300 {
        let advanced = advance_lockstep(&mut sessions, &mut games);
        if advanced.iter().all(|a| *a) {
            let confirmed = sessions[0]
                .confirmed_frame()
                .min(sessions[1].confirmed_frame());
            if let (Some(a), Some(b)) = (
                sessions[0].saved_checksum(confirmed),
                sessions[1].saved_checksum(confirmed),
            ) {
                assert_eq!(a, b, "peers disagree at confirmed frame {confirmed}");
                compared += 1;
            }
        }
        if sessions.iter().all(|s| s.current_frame() >= Frame::new(60)) {
            break;
        }
    }

    assert!(sessions[0].current_frame() >= Frame::new(60));
    assert!(sessions[1].current_frame() >= Frame::new(60));
    // B keeps receiving A's inputs past the frames that were padded
    assert!(sessions[1].confirmed_frame() > Frame::new(50));
    assert!(compared > 0);
}

#[test]
fn test_peer_with_two_local_players() {
    let network = MemoryNetwork::new();
    let config = SessionConfig::new(3, 1);
    let a = session(
        &network,
        ADDR_A,
        config,
        vec![
            PlayerType::Local,
            PlayerType::Local,
            PlayerType::Remote(ADDR_B),
        ],
    );
    let b = session(
        &network,
        ADDR_B,
        config,
        vec![
            PlayerType::Remote(ADDR_A),
            PlayerType::Remote(ADDR_A),
            PlayerType::Local,
        ],
    );
    let mut sessions = vec![a, b];
    let mut games = vec![GameStub::new(), GameStub::new()];
    synchronize_sessions(&mut sessions, &mut games);
    assert_eq!(
        sessions[0].local_player_handles(),
        vec![PlayerHandle::new(0), PlayerHandle::new(1)]
    );

    for _ in 0..40 {
        advance_lockstep(&mut sessions, &mut games);
        for session in &sessions {
            assert_confirmed_state(session, 0);
        }
    }
    assert_eq!(sessions[1].current_frame(), Frame::new(40));
}

#[test]
fn test_lossy_network_converges() {
    let network = MemoryNetwork::lossy(20, 7);
    let mut config = SessionConfig::new(2, 1);
    config.sync.first_retry_interval = Duration::from_millis(10);
    config.sync.retry_interval = Duration::from_millis(10);
    config.protocol.running_retry_interval = Duration::from_millis(5);
    let (mut sessions, mut games) = two_peers(&network, config);
    synchronize_sessions(&mut sessions, &mut games);

    let deadline = Instant::now() + Duration::from_secs(20);
    let mut checked = 0;
    while sessions.iter().any(|s| s.current_frame() < Frame::new(80)) {
        assert!(Instant::now() < deadline, "peers stopped making progress");
        let advanced = advance_lockstep(&mut sessions, &mut games);
        for (session, advanced) in sessions.iter().zip(advanced.iter()) {
            if *advanced && assert_confirmed_state(session, 0) {
                checked += 1;
            }
        }
        if advanced.iter().any(|a| !a) {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
    assert!(network.lost() > 0);
    assert!(checked > 0);
}

#[test]
fn test_silent_peer_is_interrupted_then_disconnected() {
    let network = MemoryNetwork::new();
    let mut config = SessionConfig::new(2, 1);
    config.disconnect_notify_start = Duration::from_millis(30);
    config.disconnect_timeout = Duration::from_millis(120);
    let (mut sessions, mut games) = two_peers(&network, config);
    synchronize_sessions(&mut sessions, &mut games);
    for _ in 0..10 {
        advance_lockstep(&mut sessions, &mut games);
    }

    network.cut(ADDR_B);
    let deadline = Instant::now() + Duration::from_secs(5);
    while !games[0]
        .events
        .contains(&RampartEvent::Disconnected { addr: ADDR_B })
    {
        assert!(Instant::now() < deadline, "peer was never disconnected");
        sessions[0].poll_remote_clients(&mut games[0]).unwrap();
        std::thread::sleep(Duration::from_millis(5));
    }
    let interrupted = games[0]
        .events
        .iter()
        .position(|e| matches!(e, RampartEvent::NetworkInterrupted { addr: ADDR_B, .. }))
        .unwrap();
    let disconnected = games[0]
        .events
        .iter()
        .position(|e| *e == RampartEvent::Disconnected { addr: ADDR_B })
        .unwrap();
    assert!(interrupted < disconnected);

    // A carries on alone; B's slot reports disconnected
    let session = &mut sessions[0];
    for _ in 0..(session.max_prediction() * 2) {
        session.add_local_input(PlayerHandle::new(0), &[1]).unwrap();
        session.advance_frame(&mut games[0]).unwrap();
    }
    let last = games[0].advanced.last().unwrap();
    assert_eq!(last[1].1, InputStatus::Disconnected);
    assert_eq!(last[1].0.bytes(), &[0u8]);
}

#[test]
fn test_explicit_disconnect_reaches_peer() {
    let network = MemoryNetwork::new();
    let (mut sessions, mut games) = two_peers(&network, SessionConfig::new(2, 1));
    synchronize_sessions(&mut sessions, &mut games);
    for _ in 0..5 {
        advance_lockstep(&mut sessions, &mut games);
    }

    sessions[1]
        .disconnect_player(PlayerHandle::new(0), &mut games[1])
        .unwrap();
    assert_eq!(
        sessions[1].disconnect_player(PlayerHandle::new(0), &mut games[1]),
        Err(RampartError::InvalidRequest {
            info: "Player already disconnected.".to_owned()
        })
    );
    sessions[1].poll_remote_clients(&mut games[1]).unwrap();
    sessions[0].poll_remote_clients(&mut games[0]).unwrap();

    assert!(games[0]
        .events
        .contains(&RampartEvent::Disconnected { addr: ADDR_B }));
    // with the peer gone, A's own inputs are all that is left to confirm
    sessions[0]
        .add_local_input(PlayerHandle::new(0), &[3])
        .unwrap();
    sessions[0].advance_frame(&mut games[0]).unwrap();
    assert_eq!(sessions[0].confirmed_frame(), Frame::new(5));
}

#[test]
fn test_remote_handles_are_rejected_for_local_calls() {
    let network = MemoryNetwork::new();
    let (mut sessions, mut games) = two_peers(&network, SessionConfig::new(2, 1));
    synchronize_sessions(&mut sessions, &mut games);

    assert!(matches!(
        sessions[0].add_local_input(PlayerHandle::new(1), &[1]),
        Err(RampartError::InvalidRequest { .. })
    ));
    assert!(matches!(
        sessions[0].add_local_input(PlayerHandle::new(2), &[1]),
        Err(RampartError::InvalidPlayerHandle { .. })
    ));
    assert!(matches!(
        sessions[0].network_stats(PlayerHandle::new(0)),
        Err(RampartError::InvalidRequest { .. })
    ));
    assert!(matches!(
        sessions[0].set_frame_delay(PlayerHandle::new(1), 1),
        Err(RampartError::InvalidRequest { .. })
    ));
}

#[test]
fn test_sync_failure_is_reported() {
    let network = MemoryNetwork::new();
    let mut config = SessionConfig::new(2, 1);
    config.sync.first_retry_interval = Duration::from_millis(5);
    config.sync.retry_interval = Duration::from_millis(5);
    config.sync.max_sync_retries = Some(3);
    // nobody listens at ADDR_B
    let mut a = session(
        &network,
        ADDR_A,
        config,
        vec![PlayerType::Local, PlayerType::Remote(ADDR_B)],
    );
    let mut game = GameStub::new();

    let deadline = Instant::now() + Duration::from_secs(5);
    while !game.events.contains(&RampartEvent::SyncFailed { addr: ADDR_B }) {
        assert!(Instant::now() < deadline, "handshake never gave up");
        a.poll_remote_clients(&mut game).unwrap();
        std::thread::sleep(Duration::from_millis(2));
    }
    // the failed peer no longer blocks the session
    assert_eq!(a.current_state(), SessionState::Running);
    a.add_local_input(PlayerHandle::new(0), &[1]).unwrap();
    a.advance_frame(&mut game).unwrap();
    assert_eq!(game.advanced[0][1].1, InputStatus::Disconnected);
}
