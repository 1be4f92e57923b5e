//! Per-player input ring buffer with prediction and misprediction tracking.

use crate::frame_info::GameInput;
use crate::report_violation;
use crate::telemetry::{InvariantChecker, InvariantViolation, ViolationKind, ViolationSeverity};
use crate::{Frame, InputStatus, RampartError};

/// Default number of frames an input queue can hold.
pub const INPUT_QUEUE_LENGTH: usize = 128;

/// Ring buffer of one player's inputs.
///
/// Confirmed inputs are stored strictly sequentially. When the simulation asks for a frame that
/// has not arrived yet, the queue enters prediction mode and hands out a guess (the last stored
/// input, or an empty input when there is nothing to repeat). Every confirmed input that arrives
/// while predicting is compared against the guess; the first mismatch is remembered in
/// `first_incorrect_frame` until [`InputQueue::reset_prediction`] is called at the start of a
/// rollback.
#[derive(Debug, Clone)]
pub struct InputQueue {
    /// Index of the player this queue belongs to (used for logging only).
    id: usize,
    head: usize,
    tail: usize,
    length: usize,
    first_frame: bool,

    last_user_added_frame: Frame,
    last_added_frame: Frame,
    first_incorrect_frame: Frame,
    last_frame_requested: Frame,

    frame_delay: usize,
    input_size: usize,

    inputs: Vec<GameInput>,
    prediction: GameInput,
}

impl InputQueue {
    /// Creates a queue with the default capacity.
    #[must_use]
    pub fn new(id: usize, input_size: usize) -> Option<Self> {
        Self::with_queue_length(id, input_size, INPUT_QUEUE_LENGTH)
    }

    /// Creates a queue holding `queue_length` frames. Returns `None` if the length is below 2.
    #[must_use]
    pub fn with_queue_length(id: usize, input_size: usize, queue_length: usize) -> Option<Self> {
        if queue_length < 2 {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::Configuration,
                "Queue length must be at least 2, got {}",
                queue_length
            );
            return None;
        }
        Some(Self {
            id,
            head: 0,
            tail: 0,
            length: 0,
            first_frame: true,
            last_user_added_frame: Frame::NULL,
            last_added_frame: Frame::NULL,
            first_incorrect_frame: Frame::NULL,
            last_frame_requested: Frame::NULL,
            frame_delay: 0,
            input_size,
            inputs: vec![GameInput::blank(Frame::NULL, input_size); queue_length],
            prediction: GameInput::blank(Frame::NULL, input_size),
        })
    }

    /// Capacity of the ring.
    #[must_use]
    pub fn queue_length(&self) -> usize {
        self.inputs.len()
    }

    /// Number of confirmed inputs currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.length
    }

    /// True if no confirmed input is currently held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// The most recent frame stored in the queue (after frame delay).
    #[must_use]
    pub fn last_confirmed_frame(&self) -> Frame {
        self.last_added_frame
    }

    /// The first frame whose confirmed input differed from its prediction, or NULL.
    #[must_use]
    pub fn first_incorrect_frame(&self) -> Frame {
        self.first_incorrect_frame
    }

    /// True while the queue is handing out predictions.
    #[must_use]
    pub fn is_predicting(&self) -> bool {
        !self.prediction.frame.is_null()
    }

    #[must_use]
    pub fn frame_delay(&self) -> usize {
        self.frame_delay
    }

    /// Sets the number of frames local inputs are delayed by.
    ///
    /// The delay must leave room for at least one live frame in the ring.
    pub fn set_frame_delay(&mut self, delay: usize) -> Result<(), RampartError> {
        let max_delay = self.queue_length() - 1;
        if delay > max_delay {
            return Err(RampartError::InvalidRequest {
                info: format!(
                    "Frame delay {} exceeds maximum allowed value of {} (queue_length - 1).",
                    delay, max_delay
                ),
            });
        }
        self.frame_delay = delay;
        Ok(())
    }

    /// Leaves prediction mode and forgets the recorded misprediction.
    ///
    /// Called when a rollback to `frame` begins; `frame` must not be later than the recorded
    /// first incorrect frame.
    pub fn reset_prediction(&mut self, frame: Frame) {
        if !self.first_incorrect_frame.is_null() && frame > self.first_incorrect_frame {
            report_violation!(
                ViolationSeverity::Critical,
                ViolationKind::InputQueue,
                "Player {}: resetting prediction at frame {} past first incorrect frame {}",
                self.id,
                frame,
                self.first_incorrect_frame
            );
            debug_assert!(frame <= self.first_incorrect_frame);
        }
        self.prediction.frame = Frame::NULL;
        self.first_incorrect_frame = Frame::NULL;
        self.last_frame_requested = Frame::NULL;
    }

    /// Looks up the confirmed input stored for `frame`.
    ///
    /// Returns `None` if the frame has not arrived yet, was discarded, or its slot has been
    /// overwritten.
    #[must_use]
    pub fn confirmed_input(&self, frame: Frame) -> Option<GameInput> {
        if !frame.is_valid() || self.length == 0 {
            return None;
        }
        if frame < self.oldest_frame() || frame > self.last_added_frame {
            return None;
        }
        let slot = self.inputs.get((frame % self.queue_length() as i32) as usize)?;
        (slot.frame == frame).then_some(*slot)
    }

    /// Discards confirmed inputs up to and including `frame`.
    ///
    /// The bound is clamped to the last frame handed to the simulation, so frames that a future
    /// [`InputQueue::input`] call may still need are never dropped.
    pub fn discard_confirmed_frames(&mut self, mut frame: Frame) {
        if !frame.is_valid() {
            return;
        }
        if !self.last_frame_requested.is_null() {
            frame = std::cmp::min(frame, self.last_frame_requested);
        }
        if self.length == 0 {
            return;
        }

        if frame >= self.last_added_frame {
            self.tail = self.head;
            self.length = 0;
        } else {
            let oldest = self.oldest_frame();
            if frame < oldest {
                return;
            }
            let offset = (frame - oldest + 1) as usize;
            self.tail = (self.tail + offset) % self.queue_length();
            self.length -= offset;
        }

        crate::debug_check_invariants!(self, "discard_confirmed_frames");
    }

    /// Returns the input for `requested_frame` and whether it is confirmed or predicted.
    ///
    /// Returns `None` when called while a misprediction is pending or for a frame that was
    /// already discarded; both are caller bugs.
    pub fn input(&mut self, requested_frame: Frame) -> Option<(GameInput, InputStatus)> {
        // Nobody may read further down a path already known to be wrong.
        if !self.first_incorrect_frame.is_null() {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::InputQueue,
                "Player {}: input requested for frame {} while frame {} is mispredicted",
                self.id,
                requested_frame,
                self.first_incorrect_frame
            );
            return None;
        }

        if requested_frame < self.oldest_frame() {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::InputQueue,
                "Player {}: requested frame {} is before oldest frame {} in queue",
                self.id,
                requested_frame,
                self.oldest_frame()
            );
            return None;
        }

        self.last_frame_requested = requested_frame;

        if self.prediction.frame.is_null() {
            let offset = (requested_frame - self.oldest_frame()) as usize;
            if offset < self.length {
                let index = (self.tail + offset) % self.queue_length();
                let stored = self.inputs[index];
                if stored.frame != requested_frame {
                    report_violation!(
                        ViolationSeverity::Critical,
                        ViolationKind::InputQueue,
                        "Player {}: ring slot {} holds frame {}, expected {}",
                        self.id,
                        index,
                        stored.frame,
                        requested_frame
                    );
                    return None;
                }
                return Some((stored, InputStatus::Confirmed));
            }

            // Not arrived yet: start predicting from the most recent input, or from nothing.
            if requested_frame == Frame::new(0) || self.last_added_frame.is_null() {
                self.prediction = GameInput::blank(Frame::NULL, self.input_size);
            } else {
                self.prediction = self.inputs[self.previous_position()];
            }
            self.prediction.frame = self.last_added_frame + 1;
            tracing::trace!(
                player = self.id,
                frame = %requested_frame,
                "input queue entering prediction"
            );
        }

        let mut predicted = self.prediction;
        predicted.frame = requested_frame;
        Some((predicted, InputStatus::Predicted))
    }

    /// Adds the next input supplied by the caller and returns the (delayed) frame it was stored
    /// at, or [`Frame::NULL`] if it was dropped.
    ///
    /// Inputs must be supplied strictly sequentially. A drop happens when the frame delay was
    /// decreased; an increased delay makes the queue insert padding copies of the last input.
    pub fn add_input(&mut self, input: &GameInput) -> Frame {
        if !self.last_user_added_frame.is_null() && input.frame != self.last_user_added_frame + 1
        {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::InputQueue,
                "Player {}: input for frame {} is not sequential (last added {})",
                self.id,
                input.frame,
                self.last_user_added_frame
            );
            return Frame::NULL;
        }
        if input.size() != self.input_size {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::InputQueue,
                "Player {}: input of {} bytes does not match queue input size {}",
                self.id,
                input.size(),
                self.input_size
            );
            return Frame::NULL;
        }
        self.last_user_added_frame = input.frame;

        let new_frame = self.advance_queue_head(input.frame);
        if !new_frame.is_null() && !self.add_delayed_input(input, new_frame) {
            return Frame::NULL;
        }
        new_frame
    }

    fn add_delayed_input(&mut self, input: &GameInput, frame: Frame) -> bool {
        if !self.last_added_frame.is_null() && frame != self.last_added_frame + 1 {
            report_violation!(
                ViolationSeverity::Critical,
                ViolationKind::InputQueue,
                "Player {}: delayed frame {} does not follow {}",
                self.id,
                frame,
                self.last_added_frame
            );
            return false;
        }
        if self.length == self.queue_length() {
            report_violation!(
                ViolationSeverity::Critical,
                ViolationKind::InputQueue,
                "Player {}: queue full ({} frames), refusing frame {}",
                self.id,
                self.length,
                frame
            );
            return false;
        }

        let head = self.head;
        self.inputs[head] = *input;
        self.inputs[head].frame = frame;
        self.head = (head + 1) % self.queue_length();
        self.length += 1;
        self.first_frame = false;
        self.last_added_frame = frame;

        if !self.prediction.frame.is_null() {
            if frame != self.prediction.frame {
                report_violation!(
                    ViolationSeverity::Critical,
                    ViolationKind::InputQueue,
                    "Player {}: confirmed frame {} does not match prediction frame {}",
                    self.id,
                    frame,
                    self.prediction.frame
                );
            }

            if self.first_incorrect_frame.is_null() && !self.prediction.equal(input, true) {
                tracing::debug!(player = self.id, frame = %frame, "misprediction detected");
                self.first_incorrect_frame = frame;
            }

            if self.prediction.frame == self.last_frame_requested
                && self.first_incorrect_frame.is_null()
            {
                self.prediction.frame = Frame::NULL;
            } else {
                self.prediction.frame += 1;
            }
        }

        crate::debug_check_invariants!(self, "add_delayed_input");
        true
    }

    fn advance_queue_head(&mut self, frame: Frame) -> Frame {
        let mut expected_frame = if self.first_frame {
            Frame::new(0)
        } else {
            self.last_added_frame + 1
        };
        let delayed_frame = frame + self.frame_delay as i32;

        if expected_frame > delayed_frame {
            tracing::trace!(
                player = self.id,
                frame = %delayed_frame,
                expected = %expected_frame,
                "dropping input after frame delay decrease"
            );
            return Frame::NULL;
        }

        while expected_frame < delayed_frame {
            let padding = self.inputs[self.previous_position()];
            if !self.add_delayed_input(&padding, expected_frame) {
                return Frame::NULL;
            }
            expected_frame += 1;
        }

        delayed_frame
    }

    fn previous_position(&self) -> usize {
        match self.head {
            0 => self.queue_length() - 1,
            _ => self.head - 1,
        }
    }

    /// Frame of the oldest live input, or the next expected frame when the ring is empty.
    fn oldest_frame(&self) -> Frame {
        if self.length == 0 {
            self.last_added_frame + 1
        } else {
            self.inputs[self.tail].frame
        }
    }
}

impl InvariantChecker for InputQueue {
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let capacity = self.queue_length();
        if self.length > capacity {
            return Err(
                InvariantViolation::new("InputQueue", "length exceeds queue_length")
                    .with_details(format!("length={}, max={}", self.length, capacity)),
            );
        }
        if self.head >= capacity || self.tail >= capacity {
            return Err(
                InvariantViolation::new("InputQueue", "head or tail index out of bounds")
                    .with_details(format!("head={}, tail={}", self.head, self.tail)),
            );
        }
        if (self.tail + self.length) % capacity != self.head {
            return Err(InvariantViolation::new(
                "InputQueue",
                "length does not match head/tail positions",
            )
            .with_details(format!(
                "length={}, head={}, tail={}",
                self.length, self.head, self.tail
            )));
        }
        if self.frame_delay >= capacity {
            return Err(
                InvariantViolation::new("InputQueue", "frame_delay exceeds capacity")
                    .with_details(format!("frame_delay={}", self.frame_delay)),
            );
        }
        if self.length > 0 {
            let newest = self.inputs[self.previous_position()].frame;
            if newest != self.last_added_frame
                || newest - self.inputs[self.tail].frame + 1 != self.length as i32
            {
                return Err(InvariantViolation::new(
                    "InputQueue",
                    "confirmed frames are not sequential",
                )
                .with_details(format!(
                    "tail_frame={}, newest={}, length={}",
                    self.inputs[self.tail].frame, newest, self.length
                )));
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
mod input_queue_tests {
    use super::*;
    use crate::telemetry::{observe_thread, CollectingObserver};
    use std::sync::Arc;

    fn test_queue() -> InputQueue {
        InputQueue::new(0, 1).expect("Failed to create test queue")
    }

    fn input(frame: i32, value: u8) -> GameInput {
        GameInput::new(Frame::new(frame), &[value]).unwrap()
    }

    #[test]
    fn test_queue_length_below_two_is_rejected() {
        assert!(InputQueue::with_queue_length(0, 1, 1).is_none());
        assert!(InputQueue::with_queue_length(0, 1, 2).is_some());
    }

    #[test]
    fn test_add_input_wrong_frame() {
        let observer = Arc::new(CollectingObserver::new());
        let _guard = observe_thread(observer.clone());
        let mut queue = test_queue();
        assert_eq!(queue.add_input(&input(0, 0)), Frame::new(0));
        assert!(observer.is_empty());
        assert_eq!(queue.add_input(&input(3, 0)), Frame::NULL);
        assert!(observer.has_violation(ViolationKind::InputQueue));
    }

    #[test]
    fn test_add_input_twice() {
        let mut queue = test_queue();
        assert_eq!(queue.add_input(&input(0, 0)), Frame::new(0));
        assert_eq!(queue.add_input(&input(0, 0)), Frame::NULL);
    }

    #[test]
    fn test_add_input_wrong_size() {
        let mut queue = test_queue();
        let wide = GameInput::new(Frame::new(0), &[1, 2]).unwrap();
        assert_eq!(queue.add_input(&wide), Frame::NULL);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_add_input_sequentially() {
        let mut queue = test_queue();
        for i in 0..10i32 {
            queue.add_input(&input(i, 0));
            assert_eq!(queue.last_added_frame, Frame::new(i));
            assert_eq!(queue.len(), (i + 1) as usize);
        }
    }

    #[test]
    fn test_input_sequentially() {
        let mut queue = test_queue();
        for i in 0..10i32 {
            queue.add_input(&input(i, i as u8));
            let (stored, status) = queue.input(Frame::new(i)).unwrap();
            assert_eq!(stored.bytes(), &[i as u8]);
            assert_eq!(stored.frame, Frame::new(i));
            assert_eq!(status, InputStatus::Confirmed);
        }
    }

    #[test]
    fn test_delayed_inputs() {
        let mut queue = test_queue();
        let delay: i32 = 2;
        queue.set_frame_delay(delay as usize).unwrap();
        for i in 0..10i32 {
            assert_eq!(queue.add_input(&input(i, i as u8)), Frame::new(i + delay));
            assert_eq!(queue.len(), (i + delay + 1) as usize);
            let (stored, _) = queue.input(Frame::new(i)).unwrap();
            let expected = if i < delay { 0 } else { (i - delay) as u8 };
            assert_eq!(stored.bytes(), &[expected]);
        }
    }

    #[test]
    fn test_increasing_delay_pads_with_previous_input() {
        let mut queue = test_queue();
        queue.add_input(&input(0, 5));
        queue.add_input(&input(1, 6));
        queue.set_frame_delay(3).unwrap();
        assert_eq!(queue.add_input(&input(2, 7)), Frame::new(5));

        for frame in 2..5 {
            let padded = queue.confirmed_input(Frame::new(frame)).unwrap();
            assert_eq!(padded.bytes(), &[6], "frame {frame} should repeat frame 1");
        }
        assert_eq!(queue.confirmed_input(Frame::new(5)).unwrap().bytes(), &[7]);
    }

    #[test]
    fn test_decreasing_delay_drops_inputs() {
        let mut queue = test_queue();
        queue.set_frame_delay(2).unwrap();
        assert_eq!(queue.add_input(&input(0, 1)), Frame::new(2));
        queue.set_frame_delay(1).unwrap();
        // frame 1 + delay 1 = 2 is already stored
        assert_eq!(queue.add_input(&input(1, 2)), Frame::NULL);
        assert_eq!(queue.add_input(&input(2, 3)), Frame::new(3));
    }

    #[test]
    fn test_set_frame_delay_bounds() {
        let mut queue = InputQueue::with_queue_length(0, 1, 8).unwrap();
        assert!(queue.set_frame_delay(7).is_ok());
        assert!(matches!(
            queue.set_frame_delay(8),
            Err(RampartError::InvalidRequest { .. })
        ));
        assert_eq!(queue.frame_delay(), 7);
    }

    #[test]
    fn test_prediction_from_empty_queue_is_blank() {
        let mut queue = test_queue();
        let (predicted, status) = queue.input(Frame::new(0)).unwrap();
        assert_eq!(status, InputStatus::Predicted);
        assert_eq!(predicted.bytes(), &[0]);
        assert!(queue.is_predicting());
    }

    #[test]
    fn test_prediction_repeats_last_stored_input() {
        let mut queue = test_queue();
        queue.add_input(&input(0, 9));
        let (predicted, status) = queue.input(Frame::new(3)).unwrap();
        assert_eq!(status, InputStatus::Predicted);
        assert_eq!(predicted.bytes(), &[9]);
        assert_eq!(predicted.frame, Frame::new(3));
    }

    #[test]
    fn test_correct_prediction_leaves_prediction_mode() {
        let mut queue = test_queue();
        queue.add_input(&input(0, 1));
        queue.input(Frame::new(1)).unwrap();
        queue.input(Frame::new(2)).unwrap();
        assert!(queue.is_predicting());

        queue.add_input(&input(1, 1));
        assert!(queue.is_predicting());
        queue.add_input(&input(2, 1));
        assert!(!queue.is_predicting());
        assert!(queue.first_incorrect_frame().is_null());
    }

    #[test]
    fn test_first_incorrect_frame_detection() {
        let mut queue = test_queue();
        queue.add_input(&input(0, 1));
        for frame in 1..5 {
            queue.input(Frame::new(frame)).unwrap();
        }

        queue.add_input(&input(1, 1));
        queue.add_input(&input(2, 4));
        queue.add_input(&input(3, 8));

        // Only the first divergence is recorded.
        assert_eq!(queue.first_incorrect_frame(), Frame::new(2));
        assert!(queue.input(Frame::new(5)).is_none());
    }

    #[test]
    fn test_reset_prediction_clears_error() {
        let mut queue = test_queue();
        queue.add_input(&input(0, 1));
        queue.input(Frame::new(1)).unwrap();
        queue.add_input(&input(1, 2));
        assert_eq!(queue.first_incorrect_frame(), Frame::new(1));

        queue.reset_prediction(Frame::new(1));
        assert!(queue.first_incorrect_frame().is_null());
        assert!(!queue.is_predicting());
        let (confirmed, status) = queue.input(Frame::new(1)).unwrap();
        assert_eq!(status, InputStatus::Confirmed);
        assert_eq!(confirmed.bytes(), &[2]);
    }

    #[test]
    fn test_capacity_eight_scenario() {
        let mut queue = InputQueue::with_queue_length(0, 1, 8).unwrap();
        for frame in 0..8 {
            let frame_input = input(frame, 1 << frame);
            assert_eq!(queue.add_input(&frame_input), Frame::new(frame));
        }

        assert_eq!(
            queue.confirmed_input(Frame::new(3)).unwrap().bytes(),
            &[1 << 3]
        );
        queue.discard_confirmed_frames(Frame::new(5));
        assert!(queue.confirmed_input(Frame::new(3)).is_none());
        assert!(queue.confirmed_input(Frame::new(5)).is_none());
        assert_eq!(
            queue.confirmed_input(Frame::new(6)).unwrap().bytes(),
            &[1 << 6]
        );
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_full_queue_refuses_input() {
        let mut queue = InputQueue::with_queue_length(0, 1, 4).unwrap();
        for frame in 0..4 {
            assert_eq!(queue.add_input(&input(frame, 0)), Frame::new(frame));
        }
        assert_eq!(queue.add_input(&input(4, 0)), Frame::NULL);
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.last_confirmed_frame(), Frame::new(3));
    }

    #[test]
    fn test_discard_is_clamped_to_last_requested_frame() {
        let mut queue = test_queue();
        for frame in 0..10 {
            queue.add_input(&input(frame, frame as u8));
        }
        queue.input(Frame::new(4)).unwrap();
        queue.discard_confirmed_frames(Frame::new(8));
        assert!(queue.confirmed_input(Frame::new(4)).is_none());
        assert!(queue.confirmed_input(Frame::new(5)).is_some());
        assert_eq!(queue.len(), 5);
    }

    #[test]
    fn test_discard_everything_keeps_prediction_seed() {
        let mut queue = test_queue();
        for frame in 0..3 {
            queue.add_input(&input(frame, 3));
        }
        queue.discard_confirmed_frames(Frame::new(10));
        assert!(queue.is_empty());
        let (predicted, status) = queue.input(Frame::new(3)).unwrap();
        assert_eq!(status, InputStatus::Predicted);
        assert_eq!(predicted.bytes(), &[3]);
        assert_eq!(queue.add_input(&input(3, 3)), Frame::new(3));
        assert!(!queue.is_predicting());
    }

    #[test]
    fn test_requesting_discarded_frame_is_refused() {
        let mut queue = test_queue();
        for frame in 0..6 {
            queue.add_input(&input(frame, 0));
        }
        queue.discard_confirmed_frames(Frame::new(2));
        assert!(queue.input(Frame::new(1)).is_none());
        assert!(queue.input(Frame::new(3)).is_some());
    }

    #[test]
    fn test_ring_wraps_around() {
        let mut queue = InputQueue::with_queue_length(0, 1, 4).unwrap();
        for frame in 0..20 {
            assert_eq!(queue.add_input(&input(frame, frame as u8)), Frame::new(frame));
            let (stored, status) = queue.input(Frame::new(frame)).unwrap();
            assert_eq!(status, InputStatus::Confirmed);
            assert_eq!(stored.bytes(), &[frame as u8]);
            queue.discard_confirmed_frames(Frame::new(frame - 1));
            assert!(queue.check_invariants().is_ok());
        }
    }
}
