//! Ring of serialized game states used during rollback.
//!
//! This module provides [`SavedStates`], a fixed-size circular buffer of [`SavedFrame`]s indexed
//! by `frame % capacity`.

use crate::{Frame, RampartError};

/// One serialized snapshot together with its checksum.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SavedFrame {
    /// The frame the snapshot was taken at, or [`Frame::NULL`] for an unused slot.
    pub frame: Frame,
    /// Opaque bytes returned by the application.
    pub data: Vec<u8>,
    /// Checksum of `data`.
    pub checksum: u32,
}

impl SavedFrame {
    fn empty() -> Self {
        Self {
            frame: Frame::NULL,
            data: Vec::new(),
            checksum: 0,
        }
    }
}

/// Container for saved game states used during rollback.
///
/// # Note
///
/// This type is re-exported in [`__internal`](crate::__internal) for testing.
/// It is not part of the stable public API.
#[derive(Debug, Clone)]
pub struct SavedStates {
    states: Vec<SavedFrame>,
}

impl SavedStates {
    /// Creates a ring able to hold every frame a rollback can reach.
    #[must_use]
    pub fn new(max_prediction: usize) -> Self {
        // The current frame, `max_prediction` predicted frames behind it, and the frame before
        // the oldest prediction that a rollback loads from.
        let num_slots = max_prediction + 2;
        Self {
            states: vec![SavedFrame::empty(); num_slots],
        }
    }

    /// Number of slots in the ring.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.states.len()
    }

    /// Stores a snapshot, overwriting whatever occupied the slot for `frame`.
    pub fn save(&mut self, frame: Frame, data: Vec<u8>, checksum: u32) -> Result<(), RampartError> {
        let pos = self.position(frame)?;
        let slot = self
            .states
            .get_mut(pos)
            .ok_or_else(|| RampartError::InternalError {
                context: format!("saved state index {} out of bounds", pos),
            })?;
        *slot = SavedFrame {
            frame,
            data,
            checksum,
        };
        Ok(())
    }

    /// Returns the snapshot for `frame`, or `None` if its slot holds a different frame.
    #[must_use]
    pub fn get(&self, frame: Frame) -> Option<&SavedFrame> {
        let pos = self.position(frame).ok()?;
        self.states.get(pos).filter(|saved| saved.frame == frame)
    }

    /// Frame currently stored in the slot `frame` maps to. Used for error reporting.
    pub(crate) fn occupant(&self, frame: Frame) -> Frame {
        self.position(frame)
            .ok()
            .and_then(|pos| self.states.get(pos))
            .map_or(Frame::NULL, |saved| saved.frame)
    }

    fn position(&self, frame: Frame) -> Result<usize, RampartError> {
        if !frame.is_valid() {
            return Err(RampartError::InvalidFrame {
                frame,
                reason: "frame must be non-negative".to_string(),
            });
        }
        Ok((frame % self.states.len() as i32) as usize)
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn new_holds_max_prediction_plus_two() {
        assert_eq!(SavedStates::new(8).capacity(), 10);
        assert_eq!(SavedStates::new(0).capacity(), 2);
    }

    #[test]
    fn empty_ring_has_nothing_saved() {
        let states = SavedStates::new(4);
        for i in 0..6 {
            assert!(states.get(Frame::new(i)).is_none());
        }
    }

    #[test]
    fn save_then_get() {
        let mut states = SavedStates::new(4);
        states.save(Frame::new(3), vec![1, 2, 3], 42).unwrap();

        let saved = states.get(Frame::new(3)).unwrap();
        assert_eq!(saved.frame, Frame::new(3));
        assert_eq!(saved.data, vec![1, 2, 3]);
        assert_eq!(saved.checksum, 42);
    }

    #[test]
    fn newer_frame_evicts_same_slot() {
        let mut states = SavedStates::new(2);
        states.save(Frame::new(1), vec![1], 1).unwrap();
        // 4 slots, so frame 5 lands on frame 1's slot
        states.save(Frame::new(5), vec![5], 5).unwrap();

        assert!(states.get(Frame::new(1)).is_none());
        assert_eq!(states.get(Frame::new(5)).unwrap().data, vec![5]);
        assert_eq!(states.occupant(Frame::new(1)), Frame::new(5));
    }

    #[test]
    fn null_frame_is_rejected() {
        let mut states = SavedStates::new(2);
        assert!(matches!(
            states.save(Frame::NULL, vec![], 0),
            Err(RampartError::InvalidFrame { .. })
        ));
        assert!(states.get(Frame::NULL).is_none());
        assert_eq!(states.occupant(Frame::NULL), Frame::NULL);
    }
}
