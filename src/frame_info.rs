use std::fmt;

use crate::Frame;

/// Maximum number of input bytes a single player may submit per frame.
pub const MAX_INPUT_BYTES: usize = 8;

/// Maximum number of players whose inputs can share one [`GameInput`].
pub const MAX_PLAYERS: usize = 4;

/// Capacity of the [`GameInput`] bit buffer, in bytes.
///
/// Bit indices inside the buffer must fit the 8-bit index used by the wire delta encoding.
pub const GAME_INPUT_CAPACITY: usize = MAX_INPUT_BYTES * MAX_PLAYERS;

const _: () = assert!(GAME_INPUT_CAPACITY * 8 <= 1 << 8);

/// A frame-stamped, fixed-capacity input buffer.
///
/// One `GameInput` carries either a single player's input (inside an input queue) or the
/// concatenated inputs of every player behind one peer (on the wire). Only the first `size`
/// bytes are meaningful; the rest of the buffer stays zeroed.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct GameInput {
    /// The frame this input belongs to, or [`Frame::NULL`].
    pub frame: Frame,
    size: usize,
    bits: [u8; GAME_INPUT_CAPACITY],
}

impl GameInput {
    /// Creates an input stamped with `frame` holding a copy of `bytes`.
    ///
    /// Returns `None` if `bytes` exceeds [`GAME_INPUT_CAPACITY`].
    #[must_use]
    pub fn new(frame: Frame, bytes: &[u8]) -> Option<Self> {
        if bytes.len() > GAME_INPUT_CAPACITY {
            return None;
        }
        let mut input = Self::blank(frame, bytes.len());
        input.bits[..bytes.len()].copy_from_slice(bytes);
        Some(input)
    }

    /// Creates an all-zero input of `size` bytes. `size` is clamped to the buffer capacity.
    #[must_use]
    pub fn blank(frame: Frame, size: usize) -> Self {
        Self {
            frame,
            size: size.min(GAME_INPUT_CAPACITY),
            bits: [0; GAME_INPUT_CAPACITY],
        }
    }

    /// Number of meaningful bytes.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// The meaningful bytes of this input.
    #[inline]
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bits[..self.size]
    }

    /// Changes the meaningful length, zeroing any bytes that fall outside the new size.
    pub fn resize(&mut self, size: usize) {
        let size = size.min(GAME_INPUT_CAPACITY);
        for byte in &mut self.bits[size..] {
            *byte = 0;
        }
        self.size = size;
    }

    /// Zeroes every byte while keeping frame and size.
    pub fn erase(&mut self) {
        self.bits = [0; GAME_INPUT_CAPACITY];
    }

    /// Returns bit `index` (LSB-first within each byte). Out-of-range bits read as unset.
    #[inline]
    #[must_use]
    pub fn value(&self, index: usize) -> bool {
        self.bits
            .get(index / 8)
            .is_some_and(|byte| byte & (1 << (index % 8)) != 0)
    }

    /// Sets bit `index`. Out-of-range indices are ignored.
    #[inline]
    pub fn set(&mut self, index: usize) {
        if let Some(byte) = self.bits.get_mut(index / 8) {
            *byte |= 1 << (index % 8);
        }
    }

    /// Clears bit `index`. Out-of-range indices are ignored.
    #[inline]
    pub fn clear(&mut self, index: usize) {
        if let Some(byte) = self.bits.get_mut(index / 8) {
            *byte &= !(1 << (index % 8));
        }
    }

    /// Compares two inputs. With `bits_only` the frames are ignored.
    #[must_use]
    pub fn equal(&self, other: &Self, bits_only: bool) -> bool {
        (bits_only || self.frame == other.frame)
            && self.size == other.size
            && self.bits == other.bits
    }

    /// Copies `chunk_size` bytes starting at `index * chunk_size` into a new input.
    ///
    /// Used to split a peer's concatenated input into per-player inputs.
    #[must_use]
    pub fn chunk(&self, index: usize, chunk_size: usize) -> Option<Self> {
        let start = index.checked_mul(chunk_size)?;
        let end = start.checked_add(chunk_size)?;
        let bytes = self.bytes().get(start..end)?;
        Self::new(self.frame, bytes)
    }

    /// Appends `bytes` after the current contents. Returns `false` if they would not fit.
    pub fn append(&mut self, bytes: &[u8]) -> bool {
        let end = self.size + bytes.len();
        if end > GAME_INPUT_CAPACITY {
            return false;
        }
        self.bits[self.size..end].copy_from_slice(bytes);
        self.size = end;
        true
    }
}

impl Default for GameInput {
    fn default() -> Self {
        Self::blank(Frame::NULL, 0)
    }
}

impl fmt::Debug for GameInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        struct Hex<'a>(&'a [u8]);
        impl fmt::Debug for Hex<'_> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for byte in self.0 {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
        }

        f.debug_struct("GameInput")
            .field("frame", &self.frame)
            .field("size", &self.size)
            .field("bits", &Hex(self.bytes()))
            .finish()
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
mod game_input_tests {
    use super::*;

    #[test]
    fn new_copies_bytes_and_zeroes_the_rest() {
        let input = GameInput::new(Frame::new(3), &[0xAB, 0x01]).unwrap();
        assert_eq!(input.frame, Frame::new(3));
        assert_eq!(input.size(), 2);
        assert_eq!(input.bytes(), &[0xAB, 0x01]);
    }

    #[test]
    fn new_rejects_oversized_input() {
        let bytes = [0u8; GAME_INPUT_CAPACITY + 1];
        assert!(GameInput::new(Frame::new(0), &bytes).is_none());
    }

    #[test]
    fn bit_accessors_are_lsb_first() {
        let mut input = GameInput::blank(Frame::new(0), 2);
        input.set(0);
        input.set(9);
        assert_eq!(input.bytes(), &[0b0000_0001, 0b0000_0010]);
        assert!(input.value(9));
        input.clear(9);
        assert!(!input.value(9));
        assert!(!input.value(GAME_INPUT_CAPACITY * 8 + 5));
    }

    #[test]
    fn bits_only_equality_ignores_frame() {
        let a = GameInput::new(Frame::new(1), &[7]).unwrap();
        let b = GameInput::new(Frame::new(2), &[7]).unwrap();
        assert!(a.equal(&b, true));
        assert!(!a.equal(&b, false));

        let c = GameInput::new(Frame::new(1), &[8]).unwrap();
        assert!(!a.equal(&c, true));
    }

    #[test]
    fn chunk_and_append_split_and_join_players() {
        let mut joined = GameInput::blank(Frame::new(4), 0);
        assert!(joined.append(&[1, 2]));
        assert!(joined.append(&[3, 4]));
        assert_eq!(joined.bytes(), &[1, 2, 3, 4]);

        let second = joined.chunk(1, 2).unwrap();
        assert_eq!(second.bytes(), &[3, 4]);
        assert_eq!(second.frame, Frame::new(4));
        assert!(joined.chunk(2, 2).is_none());
    }

    #[test]
    fn resize_zeroes_truncated_bytes() {
        let mut input = GameInput::new(Frame::new(0), &[0xFF, 0xFF]).unwrap();
        input.resize(1);
        input.resize(2);
        assert_eq!(input.bytes(), &[0xFF, 0x00]);
    }

    #[test]
    fn debug_prints_hex() {
        let input = GameInput::new(Frame::new(1), &[0xDE, 0xAD]).unwrap();
        let text = format!("{:?}", input);
        assert!(text.contains("dead"));
    }
}
