//! Session integration tests.
//!
//! Peers run in the same process over the in-memory network from `common`, so every test is
//! deterministic apart from the protocol timers.

// Shared test infrastructure
#[path = "common/mod.rs"]
mod common;

// Session test modules
mod sessions {
    pub mod p2p;
}
