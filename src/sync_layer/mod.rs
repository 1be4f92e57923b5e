//! # Sync Layer
//!
//! The sync layer owns one [`InputQueue`] per player and the ring of saved states, and drives
//! the application through [`SessionCallbacks`] whenever a rollback is needed.
//!
//! ## How Rollback Works
//!
//! ### Step 1: State Saving
//!
//! Every time the frame counter advances, the application is asked to serialize its state.
//! The bytes are hashed with the configured [`StateChecksum`] and stored in [`SavedStates`],
//! a ring of `max_prediction + 2` slots. The initial state is saved when the first local input
//! is added at frame 0.
//!
//! ### Step 2: Prediction
//!
//! When the simulation asks for a frame whose remote input has not arrived, the player's queue
//! repeats the last input it received (or an all-zero input if it has none yet) and marks it
//! [`InputStatus::Predicted`].
//!
//! ### Step 3: Correction
//!
//! Confirmed inputs arriving later are compared against what was predicted. The earliest
//! mismatch across all queues is the frame to seek back to:
//!
//! 1. **Load**: the state saved at that frame is handed back to the application
//! 2. **Reset**: every queue leaves prediction mode
//! 3. **Replay**: the frames up to the original frame are simulated again, saving each one
//!
//! Replay never changes the frame counter seen before and after the rollback.
//!
//! ## Data Flow
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Game Loop (per frame)                    │
//! ├──────────────────────────────────────────────────────────────┤
//! │  1. Add local inputs     ──►  InputQueue (local player)       │
//! │  2. Receive network      ──►  InputQueue (remote players)     │
//! │  3. check_simulation     ──►  If misprediction detected:      │
//! │                               └─► load_game_state callback    │
//! │                               └─► replay with advance_frame   │
//! │  4. synchronized_inputs  ──►  All players' inputs for frame   │
//! │  5. advance_frame        ──►  Application steps simulation    │
//! │  6. increment_frame      ──►  save_game_state callback        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Bounds
//!
//! - A local input is refused with [`RampartError::PredictionThreshold`] once the simulation
//!   runs `max_prediction` frames past the last confirmed frame.
//! - Frames more than `max_prediction` behind the current frame cannot be loaded.

mod saved_states;

pub use saved_states::{SavedFrame, SavedStates};

use crate::checksum::{Fletcher32, StateChecksum};
use crate::frame_info::GameInput;
use crate::input_queue::{InputQueue, INPUT_QUEUE_LENGTH};
use crate::network::messages::ConnectionStatus;
use crate::report_violation;
use crate::telemetry::{InvariantChecker, InvariantViolation, ViolationKind, ViolationSeverity};
use crate::{Frame, InputStatus, InputVec, PlayerHandle, RampartError, SessionCallbacks};

/// Per-session rollback engine: input queues, saved states and the frame counter.
pub struct SyncLayer {
    num_players: usize,
    input_size: usize,
    max_prediction: usize,
    saved_states: SavedStates,
    checksum: Box<dyn StateChecksum>,
    last_confirmed_frame: Frame,
    last_saved_frame: Frame,
    current_frame: Frame,
    rolling_back: bool,
    input_queues: Vec<InputQueue>,
}

impl std::fmt::Debug for SyncLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncLayer")
            .field("num_players", &self.num_players)
            .field("input_size", &self.input_size)
            .field("max_prediction", &self.max_prediction)
            .field("current_frame", &self.current_frame)
            .field("last_confirmed_frame", &self.last_confirmed_frame)
            .field("last_saved_frame", &self.last_saved_frame)
            .field("rolling_back", &self.rolling_back)
            .finish_non_exhaustive()
    }
}

impl SyncLayer {
    /// Creates a sync layer with default queue length and the Fletcher-32 checksum.
    pub fn new(
        num_players: usize,
        input_size: usize,
        max_prediction: usize,
    ) -> Result<Self, RampartError> {
        Self::with_options(
            num_players,
            input_size,
            max_prediction,
            INPUT_QUEUE_LENGTH,
            Box::new(Fletcher32),
        )
    }

    pub fn with_options(
        num_players: usize,
        input_size: usize,
        max_prediction: usize,
        queue_length: usize,
        checksum: Box<dyn StateChecksum>,
    ) -> Result<Self, RampartError> {
        if num_players == 0 {
            return Err(RampartError::InvalidRequest {
                info: "A sync layer needs at least one player.".to_owned(),
            });
        }
        if max_prediction == 0 || max_prediction >= queue_length {
            return Err(RampartError::InvalidRequest {
                info: format!(
                    "max_prediction must be between 1 and {} (queue_length - 1), got {}.",
                    queue_length.saturating_sub(1),
                    max_prediction
                ),
            });
        }

        let input_queues = (0..num_players)
            .map(|id| InputQueue::with_queue_length(id, input_size, queue_length))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| RampartError::InvalidRequest {
                info: format!("Invalid input queue length {}.", queue_length),
            })?;

        Ok(Self {
            num_players,
            input_size,
            max_prediction,
            saved_states: SavedStates::new(max_prediction),
            checksum,
            last_confirmed_frame: Frame::NULL,
            last_saved_frame: Frame::NULL,
            current_frame: Frame::new(0),
            rolling_back: false,
            input_queues,
        })
    }

    #[must_use]
    pub fn current_frame(&self) -> Frame {
        self.current_frame
    }

    #[must_use]
    pub fn last_confirmed_frame(&self) -> Frame {
        self.last_confirmed_frame
    }

    #[must_use]
    pub fn last_saved_frame(&self) -> Frame {
        self.last_saved_frame
    }

    #[must_use]
    pub fn max_prediction(&self) -> usize {
        self.max_prediction
    }

    #[must_use]
    pub fn num_players(&self) -> usize {
        self.num_players
    }

    /// Bytes of input each player submits per frame.
    #[must_use]
    pub fn input_size(&self) -> usize {
        self.input_size
    }

    /// True while [`SyncLayer::adjust_simulation`] is replaying frames.
    #[must_use]
    pub fn in_rollback(&self) -> bool {
        self.rolling_back
    }

    /// Returns `Err(PredictionThreshold)` if another local input would outrun the rollback window.
    pub fn check_prediction_threshold(&self) -> Result<(), RampartError> {
        let max_prediction = self.max_prediction as i32;
        let frames_behind = self.current_frame - self.last_confirmed_frame;
        if self.current_frame.as_i32() >= max_prediction && frames_behind >= max_prediction {
            tracing::debug!(
                current_frame = %self.current_frame,
                last_confirmed_frame = %self.last_confirmed_frame,
                "prediction threshold reached"
            );
            return Err(RampartError::PredictionThreshold);
        }
        Ok(())
    }

    /// Queues a local input for the current frame.
    ///
    /// Returns the frame the input was stored at after frame delay, which is [`Frame::NULL`]
    /// when a shrinking delay made the queue drop it.
    pub fn add_local_input<A, C>(
        &mut self,
        player_handle: PlayerHandle,
        mut input: GameInput,
        callbacks: &mut C,
    ) -> Result<Frame, RampartError>
    where
        C: SessionCallbacks<A> + ?Sized,
    {
        self.check_prediction_threshold()?;

        if self.current_frame == Frame::new(0) {
            self.save_current_frame(callbacks)?;
        }

        input.frame = self.current_frame;
        let queue = self.queue_mut(player_handle)?;
        Ok(queue.add_input(&input))
    }

    /// Stores a confirmed input received from a peer. The input carries its own frame.
    pub fn add_remote_input(
        &mut self,
        player_handle: PlayerHandle,
        input: &GameInput,
    ) -> Result<Frame, RampartError> {
        let queue = self.queue_mut(player_handle)?;
        Ok(queue.add_input(input))
    }

    /// Collects every player's input for the current frame.
    ///
    /// Players that disconnected before the current frame get an all-zero input marked
    /// [`InputStatus::Disconnected`].
    pub fn synchronized_inputs(
        &mut self,
        connect_status: &[ConnectionStatus],
    ) -> Result<InputVec, RampartError> {
        let current_frame = self.current_frame;
        let input_size = self.input_size;
        let mut inputs = InputVec::new();
        for (i, queue) in self.input_queues.iter_mut().enumerate() {
            let status = connect_status.get(i).copied().unwrap_or_default();
            if status.disconnected && current_frame > status.last_frame {
                inputs.push((
                    GameInput::blank(current_frame, input_size),
                    InputStatus::Disconnected,
                ));
            } else {
                let input = queue
                    .input(current_frame)
                    .ok_or_else(|| RampartError::InternalError {
                        context: format!(
                            "input queue {} could not provide frame {}",
                            i, current_frame
                        ),
                    })?;
                inputs.push(input);
            }
        }
        Ok(inputs)
    }

    /// Rolls back to the earliest mispredicted frame, if any queue reports one.
    pub fn check_simulation<A, C>(
        &mut self,
        callbacks: &mut C,
        connect_status: &[ConnectionStatus],
    ) -> Result<(), RampartError>
    where
        C: SessionCallbacks<A> + ?Sized,
    {
        let seek_to = self.first_incorrect_frame();
        if seek_to.is_null() {
            return Ok(());
        }
        self.adjust_simulation(seek_to, callbacks, connect_status)
    }

    /// Earliest mispredicted frame across all queues, or [`Frame::NULL`].
    #[must_use]
    pub fn first_incorrect_frame(&self) -> Frame {
        self.input_queues
            .iter()
            .map(InputQueue::first_incorrect_frame)
            .filter(|frame| !frame.is_null())
            .min()
            .unwrap_or(Frame::NULL)
    }

    /// Loads `seek_to` and re-simulates forward to the current frame.
    pub fn adjust_simulation<A, C>(
        &mut self,
        seek_to: Frame,
        callbacks: &mut C,
        connect_status: &[ConnectionStatus],
    ) -> Result<(), RampartError>
    where
        C: SessionCallbacks<A> + ?Sized,
    {
        let frame_count = self.current_frame;
        let count = frame_count - seek_to;
        tracing::debug!(
            from = %frame_count,
            to = %seek_to,
            frames = count,
            "rolling back"
        );

        self.rolling_back = true;
        let result = self.replay(seek_to, count, callbacks, connect_status);
        self.rolling_back = false;
        result?;

        if self.current_frame != frame_count {
            report_violation!(
                ViolationSeverity::Critical,
                ViolationKind::FrameSync,
                "Rollback ended at frame {} instead of {}",
                self.current_frame,
                frame_count
            );
            return Err(RampartError::InternalError {
                context: format!(
                    "rollback ended at frame {} instead of {}",
                    self.current_frame, frame_count
                ),
            });
        }
        Ok(())
    }

    fn replay<A, C>(
        &mut self,
        seek_to: Frame,
        count: i32,
        callbacks: &mut C,
        connect_status: &[ConnectionStatus],
    ) -> Result<(), RampartError>
    where
        C: SessionCallbacks<A> + ?Sized,
    {
        self.load_frame(seek_to, callbacks)?;
        for queue in &mut self.input_queues {
            queue.reset_prediction(seek_to);
        }

        for _ in 0..count {
            let inputs = self.synchronized_inputs(connect_status)?;
            callbacks.advance_frame(&inputs);
            self.increment_frame(callbacks)?;
        }
        Ok(())
    }

    /// Asks the application to serialize the current frame and stores the result.
    pub fn save_current_frame<A, C>(&mut self, callbacks: &mut C) -> Result<(), RampartError>
    where
        C: SessionCallbacks<A> + ?Sized,
    {
        let frame = self.current_frame;
        let data = callbacks.save_game_state(frame);
        let checksum = self.checksum.checksum(&data);
        tracing::trace!(frame = %frame, bytes = data.len(), checksum, "saving state");
        self.saved_states.save(frame, data, checksum)?;
        self.last_saved_frame = frame;
        Ok(())
    }

    /// Restores the state saved at `frame` and rewinds the frame counter to it.
    ///
    /// Loading the current frame is a no-op.
    pub fn load_frame<A, C>(&mut self, frame: Frame, callbacks: &mut C) -> Result<(), RampartError>
    where
        C: SessionCallbacks<A> + ?Sized,
    {
        if frame.is_null() {
            return Err(RampartError::InvalidFrame {
                frame,
                reason: "cannot load the null frame".to_owned(),
            });
        }

        if frame == self.current_frame {
            tracing::trace!(frame = %frame, "skipping load of current frame");
            return Ok(());
        }

        if frame > self.current_frame {
            return Err(RampartError::InvalidFrame {
                frame,
                reason: format!(
                    "cannot load a frame ahead of current frame {}",
                    self.current_frame
                ),
            });
        }

        if frame < self.current_frame - self.max_prediction as i32 {
            return Err(RampartError::InvalidFrame {
                frame,
                reason: format!(
                    "outside the prediction window (current frame {}, max prediction {})",
                    self.current_frame, self.max_prediction
                ),
            });
        }

        let saved = match self.saved_states.get(frame) {
            Some(saved) => saved,
            None => {
                return Err(RampartError::InvalidFrame {
                    frame,
                    reason: format!(
                        "saved state slot holds frame {}",
                        self.saved_states.occupant(frame)
                    ),
                });
            },
        };
        tracing::trace!(frame = %frame, checksum = saved.checksum, "loading state");
        callbacks.load_game_state(frame, &saved.data);

        self.current_frame = frame;
        self.last_saved_frame = frame;
        Ok(())
    }

    /// Advances the frame counter and saves the new frame.
    pub fn increment_frame<A, C>(&mut self, callbacks: &mut C) -> Result<(), RampartError>
    where
        C: SessionCallbacks<A> + ?Sized,
    {
        self.current_frame += 1;
        self.save_current_frame(callbacks)
    }

    /// Marks every frame up to `frame` as confirmed by all players and frees queue space.
    ///
    /// The frame is clamped so that nothing still needed by the current frame or a pending
    /// rollback is discarded.
    pub fn set_last_confirmed_frame(&mut self, frame: Frame) {
        let mut frame = std::cmp::min(frame, self.current_frame);

        let first_incorrect = self.first_incorrect_frame();
        if !first_incorrect.is_null() && first_incorrect < frame {
            tracing::trace!(
                confirmed = %frame,
                first_incorrect = %first_incorrect,
                "holding confirmed frame until rollback"
            );
            frame = first_incorrect;
        }

        self.last_confirmed_frame = frame;
        if frame.as_i32() > 0 {
            let discard = frame - 1;
            for queue in &mut self.input_queues {
                queue.discard_confirmed_frames(discard);
            }
        }
        crate::debug_check_invariants!(self, "set_last_confirmed_frame");
    }

    pub fn set_frame_delay(
        &mut self,
        player_handle: PlayerHandle,
        delay: usize,
    ) -> Result<(), RampartError> {
        self.queue_mut(player_handle)?.set_frame_delay(delay)
    }

    /// Checksum stored with the state saved at `frame`, if it is still in the ring.
    #[must_use]
    pub fn saved_checksum(&self, frame: Frame) -> Option<u32> {
        self.saved_states.get(frame).map(|saved| saved.checksum)
    }

    /// Last frame stored in a player's queue.
    #[must_use]
    pub fn last_added_frame(&self, player_handle: PlayerHandle) -> Frame {
        self.input_queues
            .get(player_handle.as_usize())
            .map_or(Frame::NULL, InputQueue::last_confirmed_frame)
    }

    fn queue_mut(&mut self, player_handle: PlayerHandle) -> Result<&mut InputQueue, RampartError> {
        let num_players = self.num_players;
        self.input_queues
            .get_mut(player_handle.as_usize())
            .ok_or_else(|| RampartError::InvalidPlayerHandle {
                handle: player_handle,
                max_handle: PlayerHandle::new(num_players.saturating_sub(1)),
            })
    }
}

impl InvariantChecker for SyncLayer {
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        if self.current_frame.as_i32() < 0 {
            return Err(
                InvariantViolation::new("SyncLayer", "current_frame must be non-negative")
                    .with_details(format!("current_frame={}", self.current_frame)),
            );
        }

        if !self.last_confirmed_frame.is_null() && self.last_confirmed_frame > self.current_frame {
            return Err(InvariantViolation::new(
                "SyncLayer",
                "last_confirmed_frame exceeds current_frame",
            )
            .with_details(format!(
                "last_confirmed_frame={}, current_frame={}",
                self.last_confirmed_frame, self.current_frame
            )));
        }

        if self.input_queues.len() != self.num_players {
            return Err(InvariantViolation::new(
                "SyncLayer",
                "input_queues count does not match num_players",
            )
            .with_details(format!(
                "input_queues.len()={}, num_players={}",
                self.input_queues.len(),
                self.num_players
            )));
        }

        for (i, queue) in self.input_queues.iter().enumerate() {
            if let Err(violation) = queue.check_invariants() {
                return Err(InvariantViolation::new(
                    "SyncLayer",
                    format!("input_queue[{}] invariant violated", i),
                )
                .with_details(violation.to_string()));
            }
        }

        Ok(())
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod sync_layer_tests {
    use super::*;

    /// Sums every input byte it is fed; the sum is the whole game state.
    #[derive(Default)]
    struct SumGame {
        total: i64,
        loads: Vec<Frame>,
        saves: Vec<Frame>,
        disconnected_seen: usize,
    }

    impl SessionCallbacks<()> for SumGame {
        fn save_game_state(&mut self, frame: Frame) -> Vec<u8> {
            self.saves.push(frame);
            self.total.to_le_bytes().to_vec()
        }

        fn load_game_state(&mut self, frame: Frame, state: &[u8]) {
            self.loads.push(frame);
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(state);
            self.total = i64::from_le_bytes(bytes);
        }

        fn advance_frame(&mut self, inputs: &InputVec) {
            for (input, status) in inputs {
                if *status == InputStatus::Disconnected {
                    self.disconnected_seen += 1;
                }
                self.total += input.bytes().iter().map(|&b| i64::from(b)).sum::<i64>();
            }
        }
    }

    fn input(frame: i32, value: u8) -> GameInput {
        GameInput::new(Frame::new(frame), &[value]).unwrap()
    }

    /// Runs `frames` frames with player 0 local (input 1) and player 1 predicted.
    fn run_local_frames(sync_layer: &mut SyncLayer, game: &mut SumGame, frames: i32) {
        let connect_status = [ConnectionStatus::default(); 2];
        for _ in 0..frames {
            sync_layer
                .add_local_input(PlayerHandle::new(0), input(0, 1), game)
                .unwrap();
            let inputs = sync_layer.synchronized_inputs(&connect_status).unwrap();
            game.advance_frame(&inputs);
            sync_layer.increment_frame(game).unwrap();
        }
    }

    #[test]
    fn test_new_rejects_bad_parameters() {
        assert!(SyncLayer::new(0, 1, 8).is_err());
        assert!(SyncLayer::new(2, 1, 0).is_err());
        assert!(
            SyncLayer::with_options(2, 1, 16, 16, Box::new(Fletcher32)).is_err(),
            "max_prediction must leave room in the queue"
        );
    }

    #[test]
    fn test_new_initializes_correctly() {
        let sync_layer = SyncLayer::new(4, 2, 7).unwrap();
        assert_eq!(sync_layer.current_frame(), Frame::new(0));
        assert_eq!(sync_layer.last_confirmed_frame(), Frame::NULL);
        assert_eq!(sync_layer.last_saved_frame(), Frame::NULL);
        assert_eq!(sync_layer.num_players(), 4);
        assert_eq!(sync_layer.input_size(), 2);
        assert!(!sync_layer.in_rollback());
    }

    #[test]
    fn test_different_delays() {
        let mut sync_layer = SyncLayer::new(2, 1, 8).unwrap();
        let p1_delay = 2;
        let p2_delay = 0;
        sync_layer
            .set_frame_delay(PlayerHandle::new(0), p1_delay)
            .unwrap();
        sync_layer
            .set_frame_delay(PlayerHandle::new(1), p2_delay)
            .unwrap();

        let mut connect_status = [ConnectionStatus::default(); 2];
        let mut game = SumGame::default();

        for i in 0..20i32 {
            let game_input = input(i, i as u8);
            // adding input as remote to avoid prediction threshold detection
            sync_layer
                .add_remote_input(PlayerHandle::new(0), &game_input)
                .unwrap();
            sync_layer
                .add_remote_input(PlayerHandle::new(1), &game_input)
                .unwrap();
            connect_status[0].last_frame = Frame::new(i);
            connect_status[1].last_frame = Frame::new(i);

            if i >= 3 {
                let sync_inputs = sync_layer.synchronized_inputs(&connect_status).unwrap();
                assert_eq!(sync_inputs[0].0.bytes()[0], i as u8 - p1_delay as u8);
                assert_eq!(sync_inputs[1].0.bytes()[0], i as u8 - p2_delay as u8);
                assert_eq!(sync_inputs[0].1, InputStatus::Confirmed);
            }

            sync_layer.increment_frame(&mut game).unwrap();
        }
    }

    #[test]
    fn test_set_frame_delay_invalid_handle() {
        let mut sync_layer = SyncLayer::new(2, 1, 8).unwrap();
        match sync_layer.set_frame_delay(PlayerHandle::new(2), 0) {
            Err(RampartError::InvalidPlayerHandle { handle, max_handle }) => {
                assert_eq!(handle, PlayerHandle::new(2));
                assert_eq!(max_handle, PlayerHandle::new(1));
            },
            other => panic!("Expected InvalidPlayerHandle error, got {:?}", other),
        }
    }

    #[test]
    fn test_first_local_input_saves_frame_zero() {
        let mut sync_layer = SyncLayer::new(2, 1, 8).unwrap();
        let mut game = SumGame::default();

        let stored = sync_layer
            .add_local_input(PlayerHandle::new(0), input(0, 1), &mut game)
            .unwrap();

        assert_eq!(stored, Frame::new(0));
        assert_eq!(game.saves, vec![Frame::new(0)]);
        assert_eq!(sync_layer.last_saved_frame(), Frame::new(0));
        assert!(sync_layer.saved_checksum(Frame::new(0)).is_some());
    }

    #[test]
    fn test_local_input_is_stamped_with_current_frame() {
        let mut sync_layer = SyncLayer::new(2, 1, 8).unwrap();
        let mut game = SumGame::default();
        run_local_frames(&mut sync_layer, &mut game, 3);

        let stored = sync_layer
            .add_local_input(PlayerHandle::new(0), input(99, 1), &mut game)
            .unwrap();
        assert_eq!(stored, Frame::new(3));
    }

    #[test]
    fn test_prediction_threshold() {
        let mut sync_layer = SyncLayer::new(2, 1, 2).unwrap();
        let mut game = SumGame::default();
        run_local_frames(&mut sync_layer, &mut game, 2);

        let result = sync_layer.add_local_input(PlayerHandle::new(0), input(0, 1), &mut game);
        assert_eq!(result, Err(RampartError::PredictionThreshold));

        // Confirming frame 1 opens the window again.
        sync_layer
            .add_remote_input(PlayerHandle::new(1), &input(0, 0))
            .unwrap();
        sync_layer
            .add_remote_input(PlayerHandle::new(1), &input(1, 0))
            .unwrap();
        sync_layer.set_last_confirmed_frame(Frame::new(1));
        assert!(sync_layer
            .add_local_input(PlayerHandle::new(0), input(0, 1), &mut game)
            .is_ok());
    }

    #[test]
    fn test_rollback_replays_with_confirmed_inputs() {
        let mut sync_layer = SyncLayer::new(2, 1, 8).unwrap();
        let mut game = SumGame::default();
        run_local_frames(&mut sync_layer, &mut game, 5);
        // Player 1 was predicted as zero for frames 0..5.
        assert_eq!(game.total, 5);

        for (frame, value) in [(0, 0), (1, 0), (2, 5)] {
            sync_layer
                .add_remote_input(PlayerHandle::new(1), &input(frame, value))
                .unwrap();
        }
        assert_eq!(sync_layer.first_incorrect_frame(), Frame::new(2));

        let connect_status = [ConnectionStatus::default(); 2];
        sync_layer
            .check_simulation(&mut game, &connect_status)
            .unwrap();

        assert_eq!(game.loads, vec![Frame::new(2)]);
        assert_eq!(sync_layer.current_frame(), Frame::new(5));
        assert!(!sync_layer.in_rollback());
        assert!(sync_layer.first_incorrect_frame().is_null());
        // Frames 2..5 replayed: player 1 confirmed 5 at frame 2, then predicted 5 twice.
        assert_eq!(game.total, 5 + 15);
    }

    #[test]
    fn test_correct_prediction_does_not_roll_back() {
        let mut sync_layer = SyncLayer::new(2, 1, 8).unwrap();
        let mut game = SumGame::default();
        run_local_frames(&mut sync_layer, &mut game, 4);

        for frame in 0..4 {
            sync_layer
                .add_remote_input(PlayerHandle::new(1), &input(frame, 0))
                .unwrap();
        }

        let connect_status = [ConnectionStatus::default(); 2];
        sync_layer
            .check_simulation(&mut game, &connect_status)
            .unwrap();
        assert!(game.loads.is_empty());
        assert_eq!(game.total, 4);
    }

    #[test]
    fn test_rollback_saves_replayed_frames() {
        let mut sync_layer = SyncLayer::new(2, 1, 8).unwrap();
        let mut game = SumGame::default();
        run_local_frames(&mut sync_layer, &mut game, 3);
        let before = sync_layer.saved_checksum(Frame::new(3)).unwrap();

        sync_layer
            .add_remote_input(PlayerHandle::new(1), &input(0, 7))
            .unwrap();
        let connect_status = [ConnectionStatus::default(); 2];
        sync_layer
            .check_simulation(&mut game, &connect_status)
            .unwrap();

        let after = sync_layer.saved_checksum(Frame::new(3)).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_disconnected_player_gets_blank_input() {
        let mut sync_layer = SyncLayer::new(2, 1, 8).unwrap();
        let mut game = SumGame::default();
        sync_layer
            .add_local_input(PlayerHandle::new(0), input(0, 1), &mut game)
            .unwrap();

        let connect_status = [
            ConnectionStatus::default(),
            ConnectionStatus {
                disconnected: true,
                last_frame: Frame::NULL,
            },
        ];
        let inputs = sync_layer.synchronized_inputs(&connect_status).unwrap();
        assert_eq!(inputs[0].1, InputStatus::Confirmed);
        assert_eq!(inputs[1].1, InputStatus::Disconnected);
        assert_eq!(inputs[1].0.bytes(), &[0]);
    }

    #[test]
    fn test_disconnected_player_plays_until_last_frame() {
        let mut sync_layer = SyncLayer::new(2, 1, 8).unwrap();
        sync_layer
            .add_remote_input(PlayerHandle::new(0), &input(0, 1))
            .unwrap();
        sync_layer
            .add_remote_input(PlayerHandle::new(1), &input(0, 3))
            .unwrap();

        let connect_status = [
            ConnectionStatus::default(),
            ConnectionStatus {
                disconnected: true,
                last_frame: Frame::new(0),
            },
        ];
        let inputs = sync_layer.synchronized_inputs(&connect_status).unwrap();
        assert_eq!(inputs[1].1, InputStatus::Confirmed);
        assert_eq!(inputs[1].0.bytes(), &[3]);
    }

    #[test]
    fn test_load_frame_errors() {
        let mut sync_layer = SyncLayer::new(2, 1, 2).unwrap();
        let mut game = SumGame::default();

        assert!(matches!(
            sync_layer.load_frame(Frame::NULL, &mut game),
            Err(RampartError::InvalidFrame { .. })
        ));
        assert!(matches!(
            sync_layer.load_frame(Frame::new(1), &mut game),
            Err(RampartError::InvalidFrame { .. })
        ));

        for _ in 0..4 {
            sync_layer.increment_frame(&mut game).unwrap();
        }
        // Frame 1 is three frames back with max_prediction 2.
        assert!(matches!(
            sync_layer.load_frame(Frame::new(1), &mut game),
            Err(RampartError::InvalidFrame { .. })
        ));
        assert!(game.loads.is_empty());
    }

    #[test]
    fn test_load_frame_detects_missing_state() {
        let mut sync_layer = SyncLayer::new(2, 1, 8).unwrap();
        let mut game = SumGame::default();
        // Frame 0 was never saved: no local input was added before advancing.
        sync_layer.current_frame = Frame::new(3);
        let err = sync_layer.load_frame(Frame::new(0), &mut game).unwrap_err();
        match err {
            RampartError::InvalidFrame { frame, reason } => {
                assert_eq!(frame, Frame::new(0));
                assert!(reason.contains("NULL_FRAME"));
            },
            other => panic!("Expected InvalidFrame, got {:?}", other),
        }
    }

    #[test]
    fn test_load_current_frame_is_noop() {
        let mut sync_layer = SyncLayer::new(2, 1, 8).unwrap();
        let mut game = SumGame::default();
        sync_layer.load_frame(Frame::new(0), &mut game).unwrap();
        assert!(game.loads.is_empty());
    }

    #[test]
    fn test_load_frame_success() {
        let mut sync_layer = SyncLayer::new(2, 1, 8).unwrap();
        let mut game = SumGame::default();
        run_local_frames(&mut sync_layer, &mut game, 3);

        sync_layer.load_frame(Frame::new(1), &mut game).unwrap();
        assert_eq!(sync_layer.current_frame(), Frame::new(1));
        assert_eq!(sync_layer.last_saved_frame(), Frame::new(1));
        assert_eq!(game.total, 1);
    }

    #[test]
    fn test_confirmed_frame_is_clamped() {
        let mut sync_layer = SyncLayer::new(2, 1, 8).unwrap();
        let mut game = SumGame::default();
        run_local_frames(&mut sync_layer, &mut game, 3);

        sync_layer.set_last_confirmed_frame(Frame::new(10));
        assert_eq!(sync_layer.last_confirmed_frame(), Frame::new(3));

        sync_layer
            .add_remote_input(PlayerHandle::new(1), &input(0, 0))
            .unwrap();
        sync_layer
            .add_remote_input(PlayerHandle::new(1), &input(1, 9))
            .unwrap();
        sync_layer.set_last_confirmed_frame(Frame::new(3));
        assert_eq!(sync_layer.last_confirmed_frame(), Frame::new(1));
    }

    #[test]
    fn test_invariants_hold_after_rollback() {
        let mut sync_layer = SyncLayer::new(2, 1, 8).unwrap();
        let mut game = SumGame::default();
        run_local_frames(&mut sync_layer, &mut game, 6);
        sync_layer
            .add_remote_input(PlayerHandle::new(1), &input(0, 2))
            .unwrap();
        let connect_status = [ConnectionStatus::default(); 2];
        sync_layer
            .check_simulation(&mut game, &connect_status)
            .unwrap();
        assert!(sync_layer.check_invariants().is_ok());
    }
}
