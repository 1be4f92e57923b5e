//! Property-based tests for InputQueue, the input codec and SyncLayer internals.
//!
//! These tests use proptest to verify invariants hold under random inputs,
//! leveraging the exposed __internal module for direct component testing.
//!
//! # Properties Tested
//!
//! ## InputQueue
//! - Queue invariants hold across adds and discards
//! - Confirmed inputs come back exactly as they were added
//! - A frame delay of `d` shifts every input by `d` frames and pads the gap
//! - Lowering the delay drops exactly the overlapping inputs
//! - Predictions repeat the last confirmed input; the first wrong one is remembered
//!
//! ## Input codec
//! - Decoding an encoded window reproduces it, for any input size
//! - The encoder never exceeds its bit budget and only writes whole frames
//! - Bit cursor reads back what was written
//!
//! ## SyncLayer
//! - With remote inputs arriving late by a random lag, rollback ends in the same state as a
//!   straight simulation of the confirmed inputs

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use proptest::prelude::*;
use rampart_rollback::__internal::{
    decode, encode, BitReader, BitWriter, ConnectionStatus, InputQueue, SyncLayer,
    MAX_INPUT_BYTES,
};
use rampart_rollback::telemetry::InvariantChecker;
use rampart_rollback::{
    Frame, GameInput, InputStatus, InputVec, PlayerHandle, SessionCallbacks,
};

use crate::common::stubs::{GameStub, StateStub};

// ============================================================================
// Property Test Strategies
// ============================================================================

/// Strategy for queue lengths
fn queue_length_strategy() -> impl Strategy<Value = usize> {
    prop_oneof![Just(32), Just(64), Just(128)]
}

/// Strategy for max prediction window
fn max_prediction_strategy() -> impl Strategy<Value = usize> {
    4usize..17
}

/// A window of inputs of one random size.
fn input_window_strategy() -> impl Strategy<Value = Vec<Vec<u8>>> {
    (1usize..=MAX_INPUT_BYTES).prop_flat_map(|size| {
        prop::collection::vec(prop::collection::vec(any::<u8>(), size), 1..40)
    })
}

#[derive(Debug, Clone, Copy)]
enum CursorItem {
    Bit(bool),
    Nibblet(u8),
}

fn cursor_item_strategy() -> impl Strategy<Value = CursorItem> {
    prop_oneof![
        any::<bool>().prop_map(CursorItem::Bit),
        any::<u8>().prop_map(CursorItem::Nibblet),
    ]
}

fn input(frame: i32, value: u8) -> GameInput {
    GameInput::new(Frame::new(frame), &[value]).unwrap()
}

// ============================================================================
// InputQueue Properties
// ============================================================================

proptest! {
    /// Queue invariants hold while confirmed frames are discarded behind the head
    #[test]
    fn prop_input_queue_invariants_hold(
        queue_length in queue_length_strategy(),
        values in prop::collection::vec(any::<u8>(), 1..300),
        keep in 1i32..8,
    ) {
        let mut queue = InputQueue::with_queue_length(0, 1, queue_length).unwrap();
        for (i, value) in values.iter().enumerate() {
            let frame = i as i32;
            if frame > keep {
                // the simulation has consumed everything up to here
                queue.input(Frame::new(frame - 1)).unwrap();
                queue.discard_confirmed_frames(Frame::new(frame - keep));
            }
            let stored = queue.add_input(&input(frame, *value));
            prop_assert_eq!(stored, Frame::new(frame));
            let result = queue.check_invariants();
            prop_assert!(result.is_ok(), "invariants failed at frame {}: {:?}", frame, result.err());
            prop_assert!(queue.len() <= queue.queue_length());
        }
    }

    /// Confirmed inputs are returned unchanged
    #[test]
    fn prop_confirmed_inputs_are_returned_unchanged(
        values in prop::collection::vec(any::<u8>(), 1..100),
    ) {
        let mut queue = InputQueue::new(0, 1).unwrap();
        for (i, value) in values.iter().enumerate() {
            queue.add_input(&input(i as i32, *value));
        }
        for (i, value) in values.iter().enumerate() {
            let frame = Frame::new(i as i32);
            let (stored, status) = queue.input(frame).unwrap();
            prop_assert_eq!(status, InputStatus::Confirmed);
            prop_assert_eq!(stored.bytes(), &[*value]);
            prop_assert_eq!(stored.frame, frame);
        }
        prop_assert_eq!(queue.last_confirmed_frame(), Frame::new(values.len() as i32 - 1));
    }

    /// A delay of d stores input f at f + d and fills frames 0..d with blank inputs
    #[test]
    fn prop_frame_delay_shifts_and_pads(
        delay in 0usize..10,
        values in prop::collection::vec(1u8..=255, 1..60),
    ) {
        let mut queue = InputQueue::new(0, 1).unwrap();
        queue.set_frame_delay(delay).unwrap();
        for (i, value) in values.iter().enumerate() {
            let stored = queue.add_input(&input(i as i32, *value));
            prop_assert_eq!(stored, Frame::new((i + delay) as i32));
        }
        for frame in 0..(values.len() + delay) {
            let confirmed = queue.confirmed_input(Frame::new(frame as i32)).unwrap();
            let expected = if frame < delay { 0 } else { values[frame - delay] };
            prop_assert_eq!(confirmed.bytes(), &[expected]);
        }
    }

    /// Lowering the delay from high to low drops exactly high - low inputs, then resumes
    #[test]
    fn prop_lowering_delay_drops_overlap(
        high in 1usize..8,
        lower_by in 1usize..8,
        before in 1usize..20,
    ) {
        let low = high.saturating_sub(lower_by);
        let mut queue = InputQueue::new(0, 1).unwrap();
        queue.set_frame_delay(high).unwrap();
        for f in 0..before {
            queue.add_input(&input(f as i32, 1));
        }
        queue.set_frame_delay(low).unwrap();

        let mut dropped = 0;
        let mut frame = before as i32;
        loop {
            let stored = queue.add_input(&input(frame, 2));
            frame += 1;
            if stored.is_null() {
                dropped += 1;
                continue;
            }
            prop_assert_eq!(stored, Frame::new((before + high) as i32));
            break;
        }
        prop_assert_eq!(dropped, high - low);
    }

    /// Predictions repeat the last confirmed input and a late contradiction is remembered
    #[test]
    fn prop_misprediction_is_detected_at_first_wrong_frame(
        confirmed_value in any::<u8>(),
        predicted_frames in 1i32..6,
        wrong_at in 0i32..6,
        actual in any::<u8>(),
    ) {
        prop_assume!(wrong_at < predicted_frames);
        prop_assume!(actual != confirmed_value);

        let mut queue = InputQueue::new(0, 1).unwrap();
        queue.add_input(&input(0, confirmed_value));
        queue.input(Frame::new(0)).unwrap();
        for f in 1..=predicted_frames {
            let (predicted, status) = queue.input(Frame::new(f)).unwrap();
            prop_assert_eq!(status, InputStatus::Predicted);
            prop_assert_eq!(predicted.bytes(), &[confirmed_value]);
        }

        // the real inputs match the prediction until `wrong_at`
        for f in 1..=predicted_frames {
            let value = if f <= wrong_at { confirmed_value } else { actual };
            queue.add_input(&input(f, value));
        }
        prop_assert_eq!(queue.first_incorrect_frame(), Frame::new(wrong_at + 1));
    }
}

// ============================================================================
// Input Codec Properties
// ============================================================================

proptest! {
    /// Whatever window of inputs is encoded decodes back to the same bytes
    #[test]
    fn prop_encoded_window_decodes(window in input_window_strategy()) {
        let size = window[0].len();
        let baseline = GameInput::blank(Frame::new(9), size);
        let pending: Vec<GameInput> = window
            .iter()
            .enumerate()
            .map(|(i, bytes)| GameInput::new(Frame::new(10 + i as i32), bytes).unwrap())
            .collect();

        let encoded = encode(&baseline, pending.iter(), usize::MAX);
        prop_assert!(!encoded.overflowed);
        prop_assert_eq!(encoded.frames, pending.len());

        let decoded = decode(&baseline, &encoded.bits, encoded.num_bits).unwrap();
        prop_assert_eq!(decoded.len(), pending.len());
        for (decoded, original) in decoded.iter().zip(pending.iter()) {
            prop_assert_eq!(decoded.bytes(), original.bytes());
            prop_assert_eq!(decoded.frame, original.frame);
        }
    }

    /// A tight budget truncates at a frame boundary and never overshoots
    #[test]
    fn prop_encoder_respects_bit_budget(
        window in input_window_strategy(),
        max_bits in 1usize..400,
    ) {
        let size = window[0].len();
        let baseline = GameInput::blank(Frame::new(-1), size);
        let pending: Vec<GameInput> = window
            .iter()
            .enumerate()
            .map(|(i, bytes)| GameInput::new(Frame::new(i as i32), bytes).unwrap())
            .collect();

        let encoded = encode(&baseline, pending.iter(), max_bits);
        prop_assert!(encoded.num_bits <= max_bits);
        prop_assert_eq!(encoded.overflowed, encoded.frames < pending.len());

        let decoded = decode(&baseline, &encoded.bits, encoded.num_bits).unwrap();
        prop_assert_eq!(decoded.len(), encoded.frames);
        for (decoded, original) in decoded.iter().zip(pending.iter()) {
            prop_assert_eq!(decoded.bytes(), original.bytes());
        }
    }

    /// Bits and nibblets come back in the order they were written
    #[test]
    fn prop_bit_cursor_reads_back_writes(
        items in prop::collection::vec(cursor_item_strategy(), 0..200),
    ) {
        let mut writer = BitWriter::new();
        for item in &items {
            match item {
                CursorItem::Bit(bit) => writer.write_bit(*bit),
                CursorItem::Nibblet(nibblet) => writer.write_nibblet(*nibblet),
            }
        }
        let num_bits = writer.num_bits();
        let bytes = writer.into_bytes();

        let mut reader = BitReader::new(&bytes, num_bits);
        for item in &items {
            match item {
                CursorItem::Bit(bit) => prop_assert_eq!(reader.read_bit(), Some(*bit)),
                CursorItem::Nibblet(nibblet) => {
                    prop_assert_eq!(reader.read_nibblet(), Some(*nibblet));
                },
            }
        }
        prop_assert!(reader.is_exhausted());
        prop_assert_eq!(reader.read_bit(), None);
    }
}

// ============================================================================
// SyncLayer Properties
// ============================================================================

fn straight_line(local: &[u8], remote: &[u8]) -> StateStub {
    let mut gs = StateStub::default();
    for (f, (l, r)) in local.iter().zip(remote.iter()).enumerate() {
        let mut inputs = InputVec::new();
        inputs.push((input(f as i32, *l), InputStatus::Confirmed));
        inputs.push((input(f as i32, *r), InputStatus::Confirmed));
        gs.advance_frame(&inputs);
    }
    gs
}

proptest! {
    /// Remote inputs arrive late by a random lag; after the last one arrives, rollback has
    /// produced exactly the state of simulating every confirmed input in order
    #[test]
    fn prop_rollback_matches_straight_simulation(
        max_prediction in max_prediction_strategy(),
        steps in prop::collection::vec((any::<u8>(), 0u8..4, 0usize..16), 1..120),
    ) {
        let local: Vec<u8> = steps.iter().map(|s| s.0).collect();
        let remote: Vec<u8> = steps.iter().map(|s| s.1).collect();
        let num_frames = steps.len() as i32;

        let mut sync = SyncLayer::new(2, 1, max_prediction).unwrap();
        let mut game: GameStub<()> = GameStub::new();
        let mut status = vec![ConnectionStatus::default(); 2];
        let mut next_remote = 0i32;

        for (f, (_, _, lag)) in steps.iter().enumerate() {
            let frame = f as i32;
            // keep the lag inside the prediction window
            let lag = (*lag % (max_prediction - 1)) as i32;
            while next_remote <= frame - lag {
                let remote_input = input(next_remote, remote[next_remote as usize]);
                sync.add_remote_input(PlayerHandle::new(1), &remote_input).unwrap();
                status[1].last_frame = Frame::new(next_remote);
                next_remote += 1;
            }
            sync.check_simulation(&mut game, &status).unwrap();
            let confirmed = std::cmp::min(status[0].last_frame, status[1].last_frame);
            if confirmed.is_valid() {
                sync.set_last_confirmed_frame(confirmed);
            }

            let stored = sync
                .add_local_input(PlayerHandle::new(0), input(frame, local[f]), &mut game)
                .unwrap();
            status[0].last_frame = stored;
            let inputs = sync.synchronized_inputs(&status).unwrap();
            SessionCallbacks::<()>::advance_frame(&mut game, &inputs);
            sync.increment_frame(&mut game).unwrap();
            prop_assert!(sync.check_invariants().is_ok());
        }

        while next_remote < num_frames {
            let remote_input = input(next_remote, remote[next_remote as usize]);
            sync.add_remote_input(PlayerHandle::new(1), &remote_input).unwrap();
            next_remote += 1;
        }
        sync.check_simulation(&mut game, &status).unwrap();

        prop_assert_eq!(sync.current_frame(), Frame::new(num_frames));
        prop_assert_eq!(game.gs, straight_line(&local, &remote));
    }
}
