//! Shared test utilities for integration tests.
//!
//! The [`MemoryNetwork`] delivers messages between sockets in the same process without touching
//! the OS, so sessions can be driven step by step. Every message still goes through the wire
//! codec, and the network can drop a share of them or cut an address off completely.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rampart_rollback::network::codec;
use rampart_rollback::rng::{Pcg32, Rng, SeedableRng};
use rampart_rollback::{
    Address, Fletcher32, Frame, GameInput, InputStatus, InputVec, Message, NonBlockingSocket,
    P2PSession, PlayerHandle, RampartError, SessionState, StateChecksum,
};

use super::stubs::{GameStub, StateStub};

/// Upper bound on poll rounds before a handshake is considered stuck.
pub const MAX_SYNC_ITERATIONS: usize = 500;
/// Pause between poll rounds, so retry timers can fire.
pub const POLL_INTERVAL: Duration = Duration::from_millis(2);

struct NetworkState {
    inboxes: HashMap<u16, VecDeque<(u16, Message)>>,
    cut: HashSet<u16>,
    loss_percent: u32,
    rng: Pcg32,
    delivered: u64,
    lost: u64,
}

/// An in-process datagram network addressed by `u16`.
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkState>>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(dead_code)]
impl MemoryNetwork {
    #[must_use]
    pub fn new() -> Self {
        Self::lossy(0, 0)
    }

    /// A network that drops `loss_percent` of all messages, deterministically for `seed`.
    #[must_use]
    pub fn lossy(loss_percent: u32, seed: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(NetworkState {
                inboxes: HashMap::new(),
                cut: HashSet::new(),
                loss_percent,
                rng: Pcg32::seed_from_u64(seed),
                delivered: 0,
                lost: 0,
            })),
        }
    }

    #[must_use]
    pub fn socket(&self, addr: u16) -> MemorySocket {
        self.inner.lock().inboxes.entry(addr).or_default();
        MemorySocket {
            addr,
            network: self.clone(),
        }
    }

    /// Drops all traffic from and to `addr` from now on.
    pub fn cut(&self, addr: u16) {
        let mut state = self.inner.lock();
        state.cut.insert(addr);
        if let Some(inbox) = state.inboxes.get_mut(&addr) {
            inbox.clear();
        }
    }

    pub fn restore(&self, addr: u16) {
        self.inner.lock().cut.remove(&addr);
    }

    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.inner.lock().delivered
    }

    #[must_use]
    pub fn lost(&self) -> u64 {
        self.inner.lock().lost
    }
}

pub struct MemorySocket {
    addr: u16,
    network: MemoryNetwork,
}

impl NonBlockingSocket<u16> for MemorySocket {
    fn send_to(&mut self, msg: &Message, addr: &u16) {
        let bytes = codec::encode(msg).unwrap();
        let mut state = self.network.inner.lock();
        if state.cut.contains(&self.addr) || state.cut.contains(addr) {
            state.lost += 1;
            return;
        }
        if state.loss_percent > 0 && state.rng.gen_range(0..100) < state.loss_percent {
            state.lost += 1;
            return;
        }
        let decoded = codec::decode(&bytes).unwrap();
        let from = self.addr;
        if let Some(inbox) = state.inboxes.get_mut(addr) {
            inbox.push_back((from, decoded));
            state.delivered += 1;
        }
    }

    fn receive_all_messages(&mut self) -> Vec<(u16, Message)> {
        let mut state = self.network.inner.lock();
        state
            .inboxes
            .get_mut(&self.addr)
            .map(|inbox| inbox.drain(..).collect())
            .unwrap_or_default()
    }
}

/// Routes library logs to the test harness. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Polls every session until all of them are running.
#[track_caller]
pub fn synchronize_sessions<A: Address>(
    sessions: &mut [P2PSession<A>],
    games: &mut [GameStub<A>],
) {
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
        std::thread::sleep(POLL_INTERVAL);
    }
    panic!("sessions did not synchronize within {MAX_SYNC_ITERATIONS} iterations");
}

/// The input every test feeds for `handle` at `frame`. Varies per frame, so predictions miss.
#[must_use]
pub fn input_for(handle: PlayerHandle, frame: i32) -> u8 {
    ((frame * 7 + handle.as_usize() as i32 * 13) % 5) as u8
}

/// Advances every session by one frame, in order, feeding [`input_for`] for their local players.
///
/// A session that hits the prediction threshold only polls this round. Returns which sessions
/// advanced.
pub fn advance_lockstep<A: Address>(
    sessions: &mut [P2PSession<A>],
    games: &mut [GameStub<A>],
) -> Vec<bool> {
    let mut advanced = Vec::with_capacity(sessions.len());
    for (session, game) in sessions.iter_mut().zip(games.iter_mut()) {
        advanced.push(advance_one(session, game));
    }
    advanced
}

fn advance_one<A: Address>(session: &mut P2PSession<A>, game: &mut GameStub<A>) -> bool {
    let frame = session.current_frame().as_i32();
    for handle in session.local_player_handles() {
        match session.add_local_input(handle, &[input_for(handle, frame)]) {
            Ok(()) => {},
            Err(RampartError::PredictionThreshold) => {
                session.poll_remote_clients(game).unwrap();
                return false;
            },
            Err(e) => panic!("unexpected error adding input: {e}"),
        }
    }
    match session.advance_frame(game) {
        Ok(()) => true,
        Err(RampartError::PredictionThreshold) => false,
        Err(e) => panic!("unexpected error advancing: {e}"),
    }
}

/// The state every peer must reach at `frame` when all players feed [`input_for`] with `delay`
/// frames of input delay, computed without any networking.
#[must_use]
pub fn reference_state(frame: i32, num_players: usize, delay: i32) -> StateStub {
    let mut gs = StateStub::default();
    for f in 0..frame {
        let mut inputs = InputVec::new();
        for h in 0..num_players {
            let value = if f < delay {
                0
            } else {
                input_for(PlayerHandle::new(h), f - delay)
            };
            inputs.push((
                GameInput::new(Frame::new(f), &[value]).unwrap(),
                InputStatus::Confirmed,
            ));
        }
        gs.advance_frame(&inputs);
    }
    gs
}

/// Fletcher-32 of the serialized [`reference_state`], as the session would store it.
#[must_use]
pub fn reference_checksum(frame: i32, num_players: usize, delay: i32) -> u32 {
    let bytes = bincode::serde::encode_to_vec(
        reference_state(frame, num_players, delay),
        bincode::config::standard(),
    )
    .unwrap();
    Fletcher32.checksum(&bytes)
}

/// Checks the state a session saved at its confirmed frame against the reference. Only valid
/// right after the session advanced, when every known misprediction has been corrected.
///
/// Returns false if nothing is confirmed yet.
#[track_caller]
pub fn assert_confirmed_state<A: Address>(session: &P2PSession<A>, delay: i32) -> bool {
    let confirmed = std::cmp::min(session.confirmed_frame(), session.current_frame());
    if !confirmed.is_valid() {
        return false;
    }
    assert_eq!(
        session.saved_checksum(confirmed),
        Some(reference_checksum(
            confirmed.as_i32(),
            session.num_players(),
            delay
        )),
        "state at confirmed frame {} diverged",
        confirmed
    );
    true
}
