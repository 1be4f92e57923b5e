//! # Rampart Rollback
//!
//! Rampart Rollback is a rollback netcode core in 100% safe Rust, in the tradition of the GGPO
//! network SDK. Every peer simulates ahead with predicted remote inputs, and rolls back and
//! re-simulates when the real inputs arrive over an unreliable UDP-like transport.
//!
//! The crate is split into independent layers:
//!
//! - [`InputQueue`](__internal::InputQueue): per-player ring of inputs with prediction and
//!   misprediction detection.
//! - [`SyncLayer`](__internal::SyncLayer): saves, loads and replays game state through
//!   [`SessionCallbacks`].
//! - [`UdpProtocol`](__internal::UdpProtocol): sans-IO peer protocol (handshake, input exchange,
//!   acks, quality reports, disconnect detection).
//! - [`TimeSync`](__internal::TimeSync): recommends how many frames to wait when a peer is ahead.
//! - [`NonBlockingSocket`]: the transport seam, with a std UDP implementation and a tokio
//!   transport behind the `tokio` feature.
//!
//! [`P2PSession`] wires all of them together for a fixed table of local and remote players.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
use std::fmt::Debug;

pub use checksum::{Fletcher32, Fnv1a32, StateChecksum};
pub use error::RampartError;
pub use frame_info::GameInput;
pub use network::messages::Message;
pub use network::network_stats::NetworkStats;
#[cfg(feature = "tokio")]
pub use network::tokio_transport::{ShutdownSignal, TokioTransport};
pub use network::udp_socket::UdpNonBlockingSocket;
pub use sessions::config::{
    InputQueueConfig, ProtocolConfig, SessionConfig, SyncConfig, TransportConfig,
};
pub use sessions::p2p_session::P2PSession;
pub use time_sync::TimeSyncConfig;

// Internal modules - made pub for re-export in __internal, but doc(hidden) for API cleanliness
pub mod checksum;
#[doc(hidden)]
pub mod error;
#[doc(hidden)]
pub mod frame_info;
#[doc(hidden)]
pub mod input_queue;
pub mod prelude;
/// Internal random number generator module based on PCG32.
///
/// Produces handshake nonces, session magic numbers and transport jitter without an external
/// RNG crate.
pub mod rng;
#[doc(hidden)]
pub mod sync_layer;
pub mod telemetry;
#[doc(hidden)]
pub mod time_sync;
#[doc(hidden)]
pub mod sessions {
    pub mod config;
    #[doc(hidden)]
    pub mod p2p_session;
}
#[doc(hidden)]
pub mod network {
    #[doc(hidden)]
    pub mod bit_vector;
    /// Binary codec for network message serialization.
    ///
    /// Fixed-width, big-endian framing of every protocol message using bincode.
    pub mod codec;
    #[doc(hidden)]
    pub mod compression;
    #[doc(hidden)]
    pub mod messages;
    #[doc(hidden)]
    pub mod network_stats;
    #[doc(hidden)]
    pub mod protocol;
    #[cfg(feature = "tokio")]
    pub mod tokio_transport;
    #[doc(hidden)]
    pub mod udp_socket;
}

/// Internal module exposing implementation details for testing, fuzzing and benchmarks.
///
/// # ⚠️ WARNING: No Stability Guarantees
///
/// **This module is NOT part of the public API.** Everything here is:
/// - Subject to change without notice
/// - Not covered by semver compatibility guarantees
/// - Intended ONLY for property-based tests, benchmarks and integration tests
///
/// **DO NOT** depend on anything in this module for production code.
///
/// # Rationale
///
/// Rollback networking has invariants that are easier to pin down on the components directly
/// than through a session:
/// - **InputQueue**: ring buffer with prediction, frame delay and rollback semantics
/// - **SyncLayer**: frame counter, saved states and rollback coordination
/// - **TimeSync**: frame advantage averaging
/// - **Compression**: delta encoding of input windows
/// - **Protocol**: state machine for one peer connection
#[doc(hidden)]
pub mod __internal {
    pub use crate::frame_info::{GAME_INPUT_CAPACITY, MAX_INPUT_BYTES, MAX_PLAYERS};
    pub use crate::input_queue::{InputQueue, INPUT_QUEUE_LENGTH};
    pub use crate::network::bit_vector::{BitReader, BitWriter};
    pub use crate::network::compression::{
        decode, decode_frame, encode, CompressionError, EncodedInputs, MAX_COMPRESSED_BITS,
    };
    pub use crate::network::messages::{ConnectionStatus, MessageBody, MessageHeader};
    pub use crate::network::protocol::{Event, ProtocolState, ProtocolTimeouts, UdpProtocol};
    pub use crate::sync_layer::{SavedFrame, SavedStates, SyncLayer};
    pub use crate::time_sync::TimeSync;
}

// #############
// # CONSTANTS #
// #############

/// Internally, -1 represents no frame / invalid frame.
pub const NULL_FRAME: i32 = -1;

/// A frame number in the simulation.
///
/// Frames count up from 0. [`Frame::NULL`] (-1) marks "no frame": an empty queue, a player that
/// never sent input, or a rollback that is not pending.
///
/// Ring buffers derive slot indices with an explicit `frame % capacity`, so a frame is never
/// used as an index by accident.
///
/// # Examples
///
/// ```
/// use rampart_rollback::Frame;
///
/// let frame = Frame::new(10);
/// assert_eq!((frame + 5).as_i32(), 15);
/// assert_eq!(Frame::new(12) - frame, 2);
/// assert_eq!(frame.next(), Frame::new(11));
/// assert!(Frame::NULL.is_null());
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Frame(i32);

impl Frame {
    /// The null frame.
    pub const NULL: Frame = Frame(NULL_FRAME);

    /// Wraps a raw frame number. Negative values other than -1 are representable but never
    /// valid; see [`Frame::is_valid`].
    #[inline]
    #[must_use]
    pub const fn new(frame: i32) -> Self {
        Frame(frame)
    }

    /// Returns the underlying `i32` value.
    #[inline]
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    /// Returns `true` if this frame is [`Frame::NULL`].
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == NULL_FRAME
    }

    /// Returns `true` if this frame is non-negative.
    ///
    /// ```
    /// use rampart_rollback::Frame;
    ///
    /// assert!(Frame::new(0).is_valid());
    /// assert!(!Frame::NULL.is_valid());
    /// assert!(!Frame::new(-5).is_valid());
    /// ```
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }

    /// The frame after this one.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Frame(self.0 + 1)
    }

    /// The frame before this one. `Frame::new(0).previous()` is [`Frame::NULL`].
    #[inline]
    #[must_use]
    pub const fn previous(self) -> Self {
        Frame(self.0 - 1)
    }
}

impl Default for Frame {
    fn default() -> Self {
        Frame::NULL
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "NULL_FRAME")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

// Arithmetic operations

impl std::ops::Add<i32> for Frame {
    type Output = Frame;

    #[inline]
    fn add(self, rhs: i32) -> Self::Output {
        Frame(self.0 + rhs)
    }
}

impl std::ops::AddAssign<i32> for Frame {
    #[inline]
    fn add_assign(&mut self, rhs: i32) {
        self.0 += rhs;
    }
}

impl std::ops::Sub<i32> for Frame {
    type Output = Frame;

    #[inline]
    fn sub(self, rhs: i32) -> Self::Output {
        Frame(self.0 - rhs)
    }
}

impl std::ops::Sub<Frame> for Frame {
    type Output = i32;

    #[inline]
    fn sub(self, rhs: Frame) -> Self::Output {
        self.0 - rhs.0
    }
}

impl std::ops::SubAssign<i32> for Frame {
    #[inline]
    fn sub_assign(&mut self, rhs: i32) {
        self.0 -= rhs;
    }
}

impl std::ops::Rem<i32> for Frame {
    type Output = i32;

    #[inline]
    fn rem(self, rhs: i32) -> Self::Output {
        self.0 % rhs
    }
}

impl From<i32> for Frame {
    #[inline]
    fn from(value: i32) -> Self {
        Frame(value)
    }
}

impl From<Frame> for i32 {
    #[inline]
    fn from(frame: Frame) -> Self {
        frame.0
    }
}

/// A unique identifier for a player in a session.
///
/// Handles run from `0` to `num_players - 1`. A remote peer may own several handles; its inputs
/// arrive concatenated in handle order.
///
/// ```
/// use rampart_rollback::PlayerHandle;
///
/// let player = PlayerHandle::new(1);
/// assert_eq!(player.as_usize(), 1);
/// assert!(player.is_valid_player_for(2));
/// assert!(!player.is_valid_player_for(1));
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct PlayerHandle(usize);

impl PlayerHandle {
    /// Creates a new `PlayerHandle`. It is not validated against any session.
    #[inline]
    #[must_use]
    pub const fn new(handle: usize) -> Self {
        PlayerHandle(handle)
    }

    /// Returns the underlying `usize` value.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns `true` if this handle names a player in a session of `num_players`.
    #[inline]
    #[must_use]
    pub const fn is_valid_player_for(self, num_players: usize) -> bool {
        self.0 < num_players
    }
}

impl std::fmt::Display for PlayerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<usize> for PlayerHandle {
    #[inline]
    fn from(value: usize) -> Self {
        PlayerHandle(value)
    }
}

// #############
// #   ENUMS   #
// #############

/// Where a player's input comes from.
///
/// [`PlayerType::Remote`] carries the address of the peer that owns the player. Several handles
/// may share one address when a peer runs more than one local player.
#[derive(Debug, Default, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum PlayerType<A> {
    /// This player plays on the local device.
    #[default]
    Local,
    /// This player plays on a remote device identified by the address.
    Remote(A),
}

/// A session is always in one of these states. You can query the current state of a session via
/// [`P2PSession::current_state`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// At least one remote peer is still completing the handshake.
    Synchronizing,
    /// Every remote peer is running (or gone); local input is accepted.
    Running,
}

/// [`InputStatus`] is handed out together with every input passed to
/// [`SessionCallbacks::advance_frame`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum InputStatus {
    /// The input of this player for this frame is an actual received input.
    Confirmed,
    /// The input of this player for this frame is predicted.
    Predicted,
    /// The player has disconnected at or prior to this frame, so this input is blank.
    Disconnected,
}

/// Every player's input for one frame, in handle order.
///
/// Sessions have at most four players, so the vector never leaves the stack.
pub type InputVec = smallvec::SmallVec<[(GameInput, InputStatus); 4]>;

/// Notifications that you can receive from a session. Handling them is up to the user.
///
/// Events reach the application through [`SessionCallbacks::on_event`] as they happen and are
/// also buffered for [`P2PSession::events`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RampartEvent<A> {
    /// The peer at `addr` answered a handshake request for the first time.
    Connected {
        /// The address of the endpoint.
        addr: A,
    },
    /// The session made progress in synchronizing. After `total` roundtrips, the peer is
    /// synchronized.
    Synchronizing {
        /// The address of the endpoint.
        addr: A,
        /// Total number of required successful synchronization steps.
        total: u32,
        /// Current number of successful synchronization steps.
        count: u32,
    },
    /// The session is now synchronized with the remote client.
    Synchronized {
        /// The address of the endpoint.
        addr: A,
    },
    /// The remote client has disconnected.
    Disconnected {
        /// The address of the endpoint.
        addr: A,
    },
    /// Nothing has been received from the remote client for a while; it will be disconnected in
    /// `disconnect_timeout` ms unless it is heard from again.
    NetworkInterrupted {
        /// The address of the endpoint.
        addr: A,
        /// The client will be disconnected in this amount of ms.
        disconnect_timeout: u128,
    },
    /// Sent only after a [`RampartEvent::NetworkInterrupted`] event, if communication with that
    /// player has resumed.
    NetworkResumed {
        /// The address of the endpoint.
        addr: A,
    },
    /// The handshake with the peer ran out of retries. The peer is treated as disconnected.
    SyncFailed {
        /// The address of the endpoint.
        addr: A,
    },
    /// The local client runs ahead of its peers. Consider waiting `skip_frames` frames.
    WaitRecommendation {
        /// Amount of frames recommended to be skipped in order to let other clients catch up.
        skip_frames: u32,
    },
}

// #############
// #  TRAITS   #
// #############

/// The application side of a session.
///
/// The session calls these methods synchronously, in order, from within
/// [`P2PSession::advance_frame`] and friends. A rollback shows up as one
/// [`load_game_state`](Self::load_game_state) followed by several
/// [`advance_frame`](Self::advance_frame)/[`save_game_state`](Self::save_game_state) pairs.
///
/// ```
/// use rampart_rollback::{Frame, InputVec, SessionCallbacks};
///
/// struct Counter(u64);
///
/// impl SessionCallbacks<std::net::SocketAddr> for Counter {
///     fn save_game_state(&mut self, _frame: Frame) -> Vec<u8> {
///         self.0.to_le_bytes().to_vec()
///     }
///
///     fn load_game_state(&mut self, _frame: Frame, state: &[u8]) {
///         let mut bytes = [0u8; 8];
///         bytes.copy_from_slice(state);
///         self.0 = u64::from_le_bytes(bytes);
///     }
///
///     fn advance_frame(&mut self, inputs: &InputVec) {
///         for (input, _status) in inputs {
///             self.0 += u64::from(input.bytes()[0]);
///         }
///     }
/// }
/// ```
pub trait SessionCallbacks<A> {
    /// Serializes the current game state. The bytes are checksummed and kept until the frame
    /// leaves the rollback window.
    fn save_game_state(&mut self, frame: Frame) -> Vec<u8>;

    /// Restores the game state saved at `frame`.
    fn load_game_state(&mut self, frame: Frame, state: &[u8]);

    /// Advances the game by one frame with every player's input.
    fn advance_frame(&mut self, inputs: &InputVec);

    /// Receives session events. The default ignores them.
    fn on_event(&mut self, event: RampartEvent<A>) {
        let _ = event;
    }
}

/// This [`NonBlockingSocket`] trait is used when you want to use Rampart Rollback with your own
/// socket. However you wish to send and receive messages, it should be implemented through these
/// two methods. Messages should be sent in an UDP-like fashion, unordered and unreliable.
/// The peer protocol on top takes care of everything that must arrive.
pub trait NonBlockingSocket<A> {
    /// Takes a [`Message`] and sends it to the given address.
    fn send_to(&mut self, msg: &Message, addr: &A);

    /// This method should return all messages received since the last time this method was
    /// called. The pairs `(A, Message)` indicate from which address each packet was received.
    fn receive_all_messages(&mut self) -> Vec<(A, Message)>;
}

impl<A, S: NonBlockingSocket<A> + ?Sized> NonBlockingSocket<A> for Box<S> {
    fn send_to(&mut self, msg: &Message, addr: &A) {
        (**self).send_to(msg, addr);
    }

    fn receive_all_messages(&mut self) -> Vec<(A, Message)> {
        (**self).receive_all_messages()
    }
}

/// Address types sessions can route by.
pub trait Address: Clone + PartialEq + Eq + Debug {}

impl<T: Clone + PartialEq + Eq + Debug> Address for T {}

// ###################
// # UNIT TESTS      #
// ###################

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn test_addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    // ==========================================
    // Frame Tests
    // ==========================================

    #[test]
    fn frame_null_is_minus_one() {
        assert_eq!(Frame::NULL.as_i32(), -1);
        assert_eq!(Frame::default(), Frame::NULL);
        assert!(Frame::NULL.is_null());
        assert!(!Frame::NULL.is_valid());
    }

    #[test]
    fn frame_display_names_null() {
        assert_eq!(Frame::NULL.to_string(), "NULL_FRAME");
        assert_eq!(Frame::new(42).to_string(), "42");
    }

    #[test]
    fn frame_arithmetic() {
        let mut frame = Frame::new(10);
        assert_eq!(frame + 3, Frame::new(13));
        assert_eq!(frame - 3, Frame::new(7));
        assert_eq!(Frame::new(15) - frame, 5);
        assert_eq!(Frame::new(130) % 128, 2);
        frame += 2;
        assert_eq!(frame, Frame::new(12));
        frame -= 12;
        assert_eq!(frame, Frame::new(0));
        assert_eq!(frame.previous(), Frame::NULL);
        assert_eq!(Frame::NULL.next(), Frame::new(0));
    }

    #[test]
    fn frame_ordering_puts_null_first() {
        let mut frames = vec![Frame::new(3), Frame::NULL, Frame::new(0)];
        frames.sort();
        assert_eq!(frames, vec![Frame::NULL, Frame::new(0), Frame::new(3)]);
    }

    #[test]
    fn frame_conversions() {
        let frame: Frame = 7.into();
        let raw: i32 = frame.into();
        assert_eq!(raw, 7);
    }

    // ==========================================
    // PlayerHandle Tests
    // ==========================================

    #[test]
    fn player_handle_accessors() {
        let handle = PlayerHandle::new(3);
        assert_eq!(handle.as_usize(), 3);
        assert_eq!(handle.to_string(), "3");
        assert_eq!(PlayerHandle::from(3), handle);
        assert!(handle.is_valid_player_for(4));
        assert!(!handle.is_valid_player_for(3));
    }

    // ==========================================
    // Enum Tests
    // ==========================================

    #[test]
    fn player_type_defaults_to_local() {
        assert_eq!(PlayerType::<SocketAddr>::default(), PlayerType::Local);
        assert_ne!(
            PlayerType::Remote(test_addr(1)),
            PlayerType::Remote(test_addr(2))
        );
    }

    #[test]
    fn input_status_debug_format() {
        assert_eq!(format!("{:?}", InputStatus::Confirmed), "Confirmed");
        assert_eq!(format!("{:?}", InputStatus::Predicted), "Predicted");
        assert_eq!(format!("{:?}", InputStatus::Disconnected), "Disconnected");
    }

    #[test]
    fn session_state_equality() {
        assert_eq!(SessionState::Running, SessionState::Running);
        assert_ne!(SessionState::Synchronizing, SessionState::Running);
    }

    #[test]
    fn rampart_event_carries_address() {
        let addr = test_addr(7000);
        let event = RampartEvent::NetworkInterrupted {
            addr,
            disconnect_timeout: 4250,
        };
        match event {
            RampartEvent::NetworkInterrupted {
                addr: received,
                disconnect_timeout,
            } => {
                assert_eq!(received, addr);
                assert_eq!(disconnect_timeout, 4250);
            },
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn input_vec_stays_inline_for_four_players() {
        let mut inputs = InputVec::new();
        for _ in 0..4 {
            inputs.push((GameInput::blank(Frame::new(0), 1), InputStatus::Confirmed));
        }
        assert!(!inputs.spilled());
    }

    // ==========================================
    // SessionCallbacks Tests
    // ==========================================

    #[derive(Default)]
    struct Recorder {
        events: usize,
    }

    impl SessionCallbacks<SocketAddr> for Recorder {
        fn save_game_state(&mut self, _frame: Frame) -> Vec<u8> {
            Vec::new()
        }

        fn load_game_state(&mut self, _frame: Frame, _state: &[u8]) {}

        fn advance_frame(&mut self, _inputs: &InputVec) {}

        fn on_event(&mut self, _event: RampartEvent<SocketAddr>) {
            self.events += 1;
        }
    }

    struct Silent;

    impl SessionCallbacks<SocketAddr> for Silent {
        fn save_game_state(&mut self, _frame: Frame) -> Vec<u8> {
            vec![1, 2, 3]
        }

        fn load_game_state(&mut self, _frame: Frame, _state: &[u8]) {}

        fn advance_frame(&mut self, _inputs: &InputVec) {}
    }

    #[test]
    fn on_event_defaults_to_noop() {
        let mut silent = Silent;
        silent.on_event(RampartEvent::WaitRecommendation { skip_frames: 2 });
        assert_eq!(silent.save_game_state(Frame::new(0)), vec![1, 2, 3]);

        let mut recorder = Recorder::default();
        recorder.on_event(RampartEvent::Synchronized {
            addr: test_addr(1),
        });
        assert_eq!(recorder.events, 1);
    }
}
