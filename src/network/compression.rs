//! # Compression Module
//!
//! Bit-level delta encoding of consecutive input frames.
//!
//! Each frame is encoded against the frame before it (the first against a baseline that both
//! sides agree on, normally the last acknowledged input). For every bit that differs the stream
//! carries a `1` marker, the new bit value and the 8-bit index of the bit. A `0` marker ends the
//! frame. Unchanged inputs therefore cost a single bit per frame.
//!
//! ```text
//! frame:  [1][v][i i i i i i i i] [1][v][i ...] ... [0]
//!          |  |  `- bit index (LSB first)
//!          |  `- new value
//!          `- "another delta follows"
//! ```
//!
//! # Note
//!
//! These functions are re-exported in [`__internal`](crate::__internal) for testing.
//! They are not part of the stable public API.

use std::error::Error;
use std::fmt;

use crate::frame_info::GameInput;
use crate::network::bit_vector::{BitReader, BitWriter, NIBBLET_SIZE};
use crate::RampartError;

/// Upper bound on the encoded size of one input message, in bits.
pub const MAX_COMPRESSED_BITS: usize = 4096;

/// Bits used by one changed-bit record: marker, value and index.
const DELTA_BITS: usize = 2 + NIBBLET_SIZE;

/// Error type for decoding a bit-packed input stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CompressionError {
    /// The stream ended in the middle of a frame.
    Truncated {
        /// Bit position where reading failed.
        position: usize,
        /// Declared length of the stream.
        num_bits: usize,
    },
    /// A delta addressed a bit outside the input.
    BitIndexOutOfRange {
        /// The decoded bit index.
        index: usize,
        /// Number of addressable bits in the target input.
        size_bits: usize,
    },
}

impl fmt::Display for CompressionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { position, num_bits } => {
                write!(
                    f,
                    "input stream truncated at bit {} of {}",
                    position, num_bits
                )
            },
            Self::BitIndexOutOfRange { index, size_bits } => {
                write!(
                    f,
                    "bit index {} out of range for {}-bit input",
                    index, size_bits
                )
            },
        }
    }
}

impl Error for CompressionError {}

impl From<CompressionError> for RampartError {
    fn from(err: CompressionError) -> Self {
        Self::SerializationError {
            context: err.to_string(),
        }
    }
}

/// Result of [`encode`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodedInputs {
    /// Packed bits, LSB first.
    pub bits: Vec<u8>,
    /// Number of meaningful bits in `bits`.
    pub num_bits: usize,
    /// Number of frames that were written.
    pub frames: usize,
    /// True if some frames did not fit into the bit budget.
    pub overflowed: bool,
}

/// Encodes `pending` as a chain of deltas starting from `baseline`.
///
/// Frames are written whole: the first frame that would push the stream past `max_bits` and
/// everything after it is left out, and `overflowed` is set.
#[must_use]
pub fn encode<'a>(
    baseline: &GameInput,
    pending: impl IntoIterator<Item = &'a GameInput>,
    max_bits: usize,
) -> EncodedInputs {
    let mut writer = BitWriter::with_capacity(max_bits.min(MAX_COMPRESSED_BITS));
    let mut last = baseline;
    let mut frames = 0;
    let mut overflowed = false;

    for current in pending {
        let size_bits = current.size() * 8;
        let changed = (0..size_bits)
            .filter(|&i| current.value(i) != last.value(i))
            .count();
        let needed = changed * DELTA_BITS + 1;
        if writer.num_bits() + needed > max_bits {
            overflowed = true;
            break;
        }

        for i in 0..size_bits {
            let value = current.value(i);
            if value != last.value(i) {
                writer.set_bit();
                writer.write_bit(value);
                writer.write_nibblet(i as u8);
            }
        }
        writer.clear_bit();

        last = current;
        frames += 1;
    }

    let num_bits = writer.num_bits();
    EncodedInputs {
        bits: writer.into_bytes(),
        num_bits,
        frames,
        overflowed,
    }
}

/// Reads one frame of deltas from `reader`.
///
/// With `apply` the deltas are written into `target`; without it they are only consumed, which
/// is how a receiver skips frames it already has.
pub fn decode_frame(
    reader: &mut BitReader<'_>,
    target: &mut GameInput,
    apply: bool,
) -> Result<(), CompressionError> {
    let size_bits = target.size() * 8;
    loop {
        let more = read(reader, BitReader::read_bit)?;
        if !more {
            return Ok(());
        }
        let value = read(reader, BitReader::read_bit)?;
        let index = usize::from(read(reader, BitReader::read_nibblet)?);

        if !apply {
            continue;
        }
        if index >= size_bits {
            return Err(CompressionError::BitIndexOutOfRange { index, size_bits });
        }
        if value {
            target.set(index);
        } else {
            target.clear(index);
        }
    }
}

/// Decodes every frame in the stream, cumulatively from `baseline`.
///
/// Decoded inputs are stamped with consecutive frames following `baseline.frame`.
pub fn decode(
    baseline: &GameInput,
    bits: &[u8],
    num_bits: usize,
) -> Result<Vec<GameInput>, CompressionError> {
    let mut reader = BitReader::new(bits, num_bits);
    let mut current = *baseline;
    let mut decoded = Vec::new();
    while !reader.is_exhausted() {
        decode_frame(&mut reader, &mut current, true)?;
        current.frame += 1;
        decoded.push(current);
    }
    Ok(decoded)
}

fn read<'a, T>(
    reader: &mut BitReader<'a>,
    op: impl FnOnce(&mut BitReader<'a>) -> Option<T>,
) -> Result<T, CompressionError> {
    let position = reader.position();
    op(reader).ok_or(CompressionError::Truncated {
        position,
        num_bits: reader.num_bits(),
    })
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
mod compression_tests {
    use super::*;
    use crate::Frame;

    fn input(frame: i32, bytes: &[u8]) -> GameInput {
        GameInput::new(Frame::new(frame), bytes).unwrap()
    }

    #[test]
    fn test_unchanged_frames_cost_one_bit() {
        let baseline = input(-1, &[0, 0]);
        let pending = [input(0, &[0, 0]), input(1, &[0, 0]), input(2, &[0, 0])];
        let encoded = encode(&baseline, &pending, MAX_COMPRESSED_BITS);
        assert_eq!(encoded.num_bits, 3);
        assert_eq!(encoded.frames, 3);
        assert!(!encoded.overflowed);
        assert_eq!(encoded.bits, vec![0]);
    }

    #[test]
    fn test_single_bit_change_layout() {
        let baseline = input(-1, &[0]);
        let pending = [input(0, &[0b0000_0100])];
        let encoded = encode(&baseline, &pending, MAX_COMPRESSED_BITS);
        // marker 1, value 1, index 2 (8 bits), terminator 0
        assert_eq!(encoded.num_bits, 11);
        assert_eq!(encoded.bits, vec![0b0000_1011, 0b0000_0000]);
    }

    #[test]
    fn test_round_trip_multiple_frames() {
        let baseline = input(4, &[0x0F, 0x00]);
        let pending = [
            input(5, &[0x0F, 0x00]),
            input(6, &[0xF0, 0x01]),
            input(7, &[0xF0, 0x81]),
            input(8, &[0x00, 0x00]),
        ];
        let encoded = encode(&baseline, &pending, MAX_COMPRESSED_BITS);
        let decoded = decode(&baseline, &encoded.bits, encoded.num_bits).unwrap();
        assert_eq!(decoded, pending.to_vec());
    }

    #[test]
    fn test_deltas_chain_from_previous_frame() {
        let baseline = input(-1, &[0]);
        let pending = [input(0, &[1]), input(1, &[1])];
        let encoded = encode(&baseline, &pending, MAX_COMPRESSED_BITS);
        // First frame: one delta plus terminator; second frame: terminator only.
        assert_eq!(encoded.num_bits, DELTA_BITS + 1 + 1);
    }

    #[test]
    fn test_overflow_keeps_whole_frames() {
        let baseline = input(-1, &[0x00]);
        let pending = [input(0, &[0xFF]), input(1, &[0x00])];
        // First frame needs 8 * 10 + 1 = 81 bits.
        let encoded = encode(&baseline, &pending, 100);
        assert_eq!(encoded.frames, 1);
        assert!(encoded.overflowed);
        assert_eq!(encoded.num_bits, 81);

        let decoded = decode(&baseline, &encoded.bits, encoded.num_bits).unwrap();
        assert_eq!(decoded, vec![pending[0]]);
    }

    #[test]
    fn test_nothing_fits() {
        let baseline = input(-1, &[0x00]);
        let pending = [input(0, &[0xFF])];
        let encoded = encode(&baseline, &pending, 10);
        assert_eq!(encoded.frames, 0);
        assert_eq!(encoded.num_bits, 0);
        assert!(encoded.overflowed);
    }

    #[test]
    fn test_truncated_stream_is_an_error() {
        let baseline = input(-1, &[0]);
        let pending = [input(0, &[0b1000_0000])];
        let encoded = encode(&baseline, &pending, MAX_COMPRESSED_BITS);
        let result = decode(&baseline, &encoded.bits, encoded.num_bits - 4);
        assert!(matches!(result, Err(CompressionError::Truncated { .. })));
    }

    #[test]
    fn test_out_of_range_index_is_an_error() {
        let mut writer = BitWriter::new();
        writer.set_bit();
        writer.set_bit();
        writer.write_nibblet(9);
        writer.clear_bit();
        let num_bits = writer.num_bits();
        let bytes = writer.into_bytes();

        let baseline = input(-1, &[0]);
        let result = decode(&baseline, &bytes, num_bits);
        assert_eq!(
            result,
            Err(CompressionError::BitIndexOutOfRange {
                index: 9,
                size_bits: 8
            })
        );
    }

    #[test]
    fn test_skipped_frame_leaves_target_untouched() {
        let baseline = input(-1, &[0]);
        let pending = [input(0, &[3])];
        let encoded = encode(&baseline, &pending, MAX_COMPRESSED_BITS);

        let mut reader = BitReader::new(&encoded.bits, encoded.num_bits);
        let mut target = baseline;
        decode_frame(&mut reader, &mut target, false).unwrap();
        assert_eq!(target.bytes(), &[0]);
        assert!(reader.is_exhausted());
    }

    #[test]
    fn test_error_converts_to_serialization_error() {
        let err: RampartError = CompressionError::Truncated {
            position: 3,
            num_bits: 4,
        }
        .into();
        assert!(matches!(err, RampartError::SerializationError { .. }));
    }
}
