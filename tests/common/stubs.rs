//! Game stub implementations for testing.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::use_self
)]

use rampart_rollback::{Frame, InputStatus, InputVec, RampartEvent, SessionCallbacks};
use serde::{Deserialize, Serialize};

/// The whole simulated game. Order-sensitive, so any input mix-up changes `state`.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateStub {
    pub frame: i32,
    pub state: i64,
}

impl StateStub {
    pub fn advance_frame(&mut self, inputs: &InputVec) {
        for (i, (input, status)) in inputs.iter().enumerate() {
            let value = match status {
                InputStatus::Disconnected => 0,
                _ => i64::from(input.bytes()[0]),
            };
            self.state = self
                .state
                .wrapping_mul(31)
                .wrapping_add(value * (i as i64 + 1));
        }
        self.frame += 1;
    }
}

/// Saves and loads [`StateStub`] through bincode, the way a real game would serialize its world.
pub struct GameStub<A> {
    pub gs: StateStub,
    pub events: Vec<RampartEvent<A>>,
    /// Every input vector passed to `advance_frame`, rollbacks included.
    pub advanced: Vec<InputVec>,
    pub loads: usize,
}

impl<A> Default for GameStub<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> GameStub<A> {
    #[must_use]
    pub fn new() -> GameStub<A> {
        GameStub {
            gs: StateStub::default(),
            events: Vec::new(),
            advanced: Vec::new(),
            loads: 0,
        }
    }

    /// Returns the current frame number.
    #[allow(dead_code)]
    #[must_use]
    pub fn current_frame(&self) -> i32 {
        self.gs.frame
    }
}

impl<A> SessionCallbacks<A> for GameStub<A> {
    fn save_game_state(&mut self, frame: Frame) -> Vec<u8> {
        assert_eq!(self.gs.frame, frame.as_i32());
        bincode::serde::encode_to_vec(self.gs, bincode::config::standard()).unwrap()
    }

    fn load_game_state(&mut self, frame: Frame, state: &[u8]) {
        let (gs, _): (StateStub, usize) =
            bincode::serde::decode_from_slice(state, bincode::config::standard()).unwrap();
        assert_eq!(gs.frame, frame.as_i32());
        self.gs = gs;
        self.loads += 1;
    }

    fn advance_frame(&mut self, inputs: &InputVec) {
        self.gs.advance_frame(inputs);
        self.advanced.push(inputs.clone());
    }

    fn on_event(&mut self, event: RampartEvent<A>) {
        self.events.push(event);
    }
}
