//! Small, dependency-free PCG32 generator.
//!
//! Used for handshake nonces, session magic numbers and transport jitter. None of these feed
//! the simulation, so the entropy seeding path does not need to be reproducible; the seeded
//! path is, which keeps tests deterministic.

use std::hash::{BuildHasher, Hasher};

use crate::{
    report_violation,
    telemetry::{ViolationKind, ViolationSeverity},
};

/// PCG-XSH-RR 64/32.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pcg32 {
    state: u64,
    inc: u64,
}

const PCG_DEFAULT_STREAM: u64 = 1442695040888963407;
const PCG_MULTIPLIER: u64 = 6364136223846793005;

impl Pcg32 {
    /// Creates a generator from an initial state and a stream selector.
    #[must_use]
    pub const fn new(state: u64, stream: u64) -> Self {
        let inc = (stream << 1) | 1;
        let mut pcg = Self { state: 0, inc };
        pcg.state = pcg.state.wrapping_mul(PCG_MULTIPLIER).wrapping_add(pcg.inc);
        pcg.state = pcg.state.wrapping_add(state);
        pcg.state = pcg.state.wrapping_mul(PCG_MULTIPLIER).wrapping_add(pcg.inc);
        pcg
    }

    #[inline]
    #[must_use]
    pub fn next_u32(&mut self) -> u32 {
        let old_state = self.state;
        self.state = old_state
            .wrapping_mul(PCG_MULTIPLIER)
            .wrapping_add(self.inc);
        let xorshifted = (((old_state >> 18) ^ old_state) >> 27) as u32;
        let rot = (old_state >> 59) as u32;
        xorshifted.rotate_right(rot)
    }

    #[inline]
    #[must_use]
    pub fn next_u64(&mut self) -> u64 {
        let high = u64::from(self.next_u32());
        let low = u64::from(self.next_u32());
        (high << 32) | low
    }
}

pub trait SeedableRng: Sized {
    /// Deterministic construction from a 64-bit seed.
    #[must_use]
    fn seed_from_u64(seed: u64) -> Self;

    /// Non-deterministic construction for production use.
    #[must_use]
    fn from_entropy() -> Self;
}

impl SeedableRng for Pcg32 {
    fn seed_from_u64(seed: u64) -> Self {
        Self::new(seed, PCG_DEFAULT_STREAM)
    }

    fn from_entropy() -> Self {
        Self::seed_from_u64(entropy_seed())
    }
}

pub trait Rng {
    fn next_u32(&mut self) -> u32;

    fn next_u64(&mut self) -> u64;

    /// Uniform value in `range` without modulo bias. An empty range yields `range.start`.
    fn gen_range(&mut self, range: std::ops::Range<u32>) -> u32 {
        let span = range.end.wrapping_sub(range.start);
        if range.end <= range.start {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::Configuration,
                "gen_range called with empty range [{}..{})",
                range.start,
                range.end
            );
            return range.start;
        }
        let threshold = span.wrapping_neg() % span;
        loop {
            let random_value = self.next_u32();
            if random_value >= threshold {
                return range.start.wrapping_add(random_value % span);
            }
        }
    }

    /// Non-zero 16-bit value, as needed for session magic numbers.
    fn gen_nonzero_u16(&mut self) -> u16 {
        loop {
            let value = self.next_u32() as u16;
            if value != 0 {
                return value;
            }
        }
    }
}

impl Rng for Pcg32 {
    #[inline]
    fn next_u32(&mut self) -> u32 {
        Self::next_u32(self)
    }

    #[inline]
    fn next_u64(&mut self) -> u64 {
        Self::next_u64(self)
    }
}

fn entropy_seed() -> u64 {
    // RandomState carries per-process random keys; mixing in the clock separates instances
    // created within one process.
    let mut hasher = std::collections::hash_map::RandomState::new().build_hasher();
    let nanos = web_time::SystemTime::now()
        .duration_since(web_time::UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos());
    hasher.write_u128(nanos);
    std::hash::Hash::hash(&std::thread::current().id(), &mut hasher);
    hasher.finish().wrapping_add(0x9e3779b97f4a7c15)
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
    fn same_seed_same_sequence() {
        let mut a = Pcg32::seed_from_u64(42);
        let mut b = Pcg32::seed_from_u64(42);
        for _ in 0..100 {
            assert_eq!(a.next_u32(), b.next_u32());
        }
    }

    #[test]
    fn different_seeds_diverge() {
        let mut a = Pcg32::seed_from_u64(1);
        let mut b = Pcg32::seed_from_u64(2);
        let same = (0..16).filter(|_| a.next_u32() == b.next_u32()).count();
        assert!(same < 16);
    }

    #[test]
    fn reference_vector() {
        // First outputs of the PCG reference demo (seed 42, stream 54).
        let mut rng = Pcg32::new(42, 54);
        assert_eq!(rng.next_u32(), 0xa15c02b7);
        assert_eq!(rng.next_u32(), 0x7b47f409);
        assert_eq!(rng.next_u32(), 0xba1d3330);
    }

    #[test]
    fn gen_range_stays_in_bounds() {
        let mut rng = Pcg32::seed_from_u64(7);
        for _ in 0..1000 {
            let value = rng.gen_range(10..20);
            assert!((10..20).contains(&value));
        }
    }

    #[test]
    fn gen_range_empty_returns_start() {
        let mut rng = Pcg32::seed_from_u64(7);
        assert_eq!(rng.gen_range(5..5), 5);
    }

    #[test]
    fn nonzero_u16_is_nonzero() {
        let mut rng = Pcg32::seed_from_u64(0);
        for _ in 0..1000 {
            assert_ne!(rng.gen_nonzero_u16(), 0);
        }
    }

    #[test]
    fn entropy_instances_differ() {
        let mut a = Pcg32::from_entropy();
        let mut b = Pcg32::from_entropy();
        let first: Vec<u32> = (0..4).map(|_| a.next_u32()).collect();
        let second: Vec<u32> = (0..4).map(|_| b.next_u32()).collect();
        assert_ne!(first, second);
    }
}
