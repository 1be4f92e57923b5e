use crate::frame_info::GameInput;

/// Events a [`UdpProtocol`](super::UdpProtocol) reports to its owner.
///
/// # Note
///
/// This type is re-exported in [`__internal`](crate::__internal) for testing.
/// It is not part of the stable public API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The peer answered a sync request for the first time.
    Connected,
    /// A handshake roundtrip completed; `count` of `total` are done.
    Synchronizing {
        /// Total number of roundtrips required.
        total: u32,
        /// Roundtrips completed so far.
        count: u32,
    },
    /// The handshake is complete and the protocol is running.
    Synchronized,
    /// A new input frame from the peer. The input holds the concatenated inputs of every player
    /// the peer owns.
    Input(GameInput),
    /// The peer is considered disconnected.
    Disconnected,
    /// Nothing was received for a while; the peer will be disconnected in `disconnect_timeout`
    /// milliseconds unless it is heard from again.
    NetworkInterrupted {
        /// Remaining time until the disconnect, in milliseconds.
        disconnect_timeout: u128,
    },
    /// Messages arrive again after a [`Event::NetworkInterrupted`].
    NetworkResumed,
    /// The handshake ran out of retries.
    SyncFailed,
}
