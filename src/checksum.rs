//! Checksums over serialized game state.
//!
//! The synchronizer never interprets saved state; it only hashes the bytes returned by
//! [`SessionCallbacks::save_game_state`](crate::SessionCallbacks::save_game_state) and keeps the
//! result next to the snapshot. Any algorithm can be plugged in through [`StateChecksum`], as
//! long as every peer uses the same one.
//!
//! ```
//! use rampart_rollback::checksum::{fletcher32, Fletcher32, StateChecksum};
//!
//! let bytes = b"game state bytes";
//! assert_eq!(Fletcher32.checksum(bytes), fletcher32(bytes));
//! ```

/// Pluggable checksum over a serialized snapshot.
///
/// Implementations must be deterministic across platforms.
pub trait StateChecksum: Send + Sync {
    /// Returns the checksum of `bytes`.
    fn checksum(&self, bytes: &[u8]) -> u32;
}

impl<F> StateChecksum for F
where
    F: Fn(&[u8]) -> u32 + Send + Sync,
{
    fn checksum(&self, bytes: &[u8]) -> u32 {
        self(bytes)
    }
}

/// Fletcher-32 over little-endian 16-bit words. The default provider.
#[derive(Debug, Default, Clone, Copy)]
pub struct Fletcher32;

impl StateChecksum for Fletcher32 {
    fn checksum(&self, bytes: &[u8]) -> u32 {
        fletcher32(bytes)
    }
}

/// 32-bit FNV-1a. Better dispersion for short inputs, slightly slower.
#[derive(Debug, Default, Clone, Copy)]
pub struct Fnv1a32;

impl StateChecksum for Fnv1a32 {
    fn checksum(&self, bytes: &[u8]) -> u32 {
        fnv1a_32(bytes)
    }
}

/// Fletcher-32; a trailing odd byte is padded with zero.
#[inline]
#[must_use]
pub fn fletcher32(data: &[u8]) -> u32 {
    let mut sum1: u32 = 0;
    let mut sum2: u32 = 0;

    for chunk in data.chunks(2) {
        let low = chunk.first().copied().unwrap_or(0);
        let high = chunk.get(1).copied().unwrap_or(0);
        let word = u32::from(u16::from_le_bytes([low, high]));
        sum1 = (sum1 + word) % 0xFFFF;
        sum2 = (sum2 + sum1) % 0xFFFF;
    }

    (sum2 << 16) | sum1
}

const FNV_OFFSET_BASIS: u32 = 0x811C_9DC5;
const FNV_PRIME: u32 = 0x0100_0193;

#[inline]
#[must_use]
pub fn fnv1a_32(data: &[u8]) -> u32 {
    data.iter().fold(FNV_OFFSET_BASIS, |hash, &byte| {
        (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME)
    })
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
    fn fletcher32_empty_is_zero() {
        assert_eq!(fletcher32(&[]), 0);
    }

    #[test]
    fn fletcher32_known_vector() {
        // "abcde" is the classic Fletcher-32 test vector.
        assert_eq!(fletcher32(b"abcde"), 0xF04F_C729);
        assert_eq!(fletcher32(b"abcdef"), 0x5650_2D2A);
    }

    #[test]
    fn fnv1a_known_vectors() {
        assert_eq!(fnv1a_32(b""), 0x811C_9DC5);
        assert_eq!(fnv1a_32(b"a"), 0xE40C_292C);
        assert_eq!(fnv1a_32(b"foobar"), 0xBF9C_F968);
    }

    #[test]
    fn providers_match_free_functions() {
        let data = [1u8, 2, 3, 4, 5, 6, 7];
        assert_eq!(Fletcher32.checksum(&data), fletcher32(&data));
        assert_eq!(Fnv1a32.checksum(&data), fnv1a_32(&data));
    }

    #[test]
    fn closures_are_providers() {
        let provider = |bytes: &[u8]| bytes.len() as u32;
        let boxed: Box<dyn StateChecksum> = Box::new(provider);
        assert_eq!(boxed.checksum(&[0; 12]), 12);
    }

    #[test]
    fn checksum_changes_with_content() {
        assert_ne!(fletcher32(&[1, 0, 0, 0]), fletcher32(&[0, 0, 0, 1]));
        assert_ne!(fnv1a_32(&[1, 2]), fnv1a_32(&[2, 1]));
    }
}
