//! Property-based verification of the rollback core.

#[path = "common/mod.rs"]
mod common;

mod verification {
    pub mod property;
}
