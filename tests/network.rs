//! Network integration tests over real loopback sockets.

#[path = "common/mod.rs"]
mod common;

mod network {
    #[cfg(feature = "tokio")]
    pub mod transport;
    pub mod udp;
}
