//! Common test infrastructure shared across integration tests.
//!
//! This module provides:
//! - `stubs`: a deterministic game that implements `SessionCallbacks`
//! - `test_utils`: an in-memory network plus helpers to synchronize and drive sessions
//!
//! # Usage
//!
//! From any integration test file:
//! ```ignore
//! mod common;
//! use common::stubs::GameStub;
//! use common::test_utils::{synchronize_sessions, MemoryNetwork};
//! ```

pub mod stubs;
pub mod test_utils;

// These are public utilities for integration tests - allow unused until tests adopt them.
#[allow(unused_imports)]
pub use test_utils::{
    advance_lockstep, assert_confirmed_state, init_tracing, input_for, reference_checksum, synchronize_sessions,
    MemoryNetwork, MemorySocket, MAX_SYNC_ITERATIONS, POLL_INTERVAL,
};
