//! Convenient re-exports for common usage.
//!
//! This module provides a "prelude" that re-exports the most commonly used types
//! from Rampart Rollback, allowing you to import them all at once.
//!
//! # Usage
//!
//! ```rust
//! use rampart_rollback::prelude::*;
//! ```
//!
//! # What's Included
//!
//! - **Session**: [`P2PSession`], [`SessionCallbacks`], [`SessionState`]
//! - **Transport**: [`NonBlockingSocket`], [`UdpNonBlockingSocket`], [`Message`]
//! - **Fundamental types**: [`Frame`], [`GameInput`], [`PlayerHandle`], [`PlayerType`],
//!   [`InputStatus`], [`InputVec`]
//! - **Events and errors**: [`RampartEvent`], [`RampartError`]
//! - **Configuration**: [`SessionConfig`], [`SyncConfig`], [`ProtocolConfig`],
//!   [`InputQueueConfig`], [`TimeSyncConfig`]
//! - **Network monitoring**: [`NetworkStats`]
//!
//! # Example
//!
//! ```rust
//! use rampart_rollback::prelude::*;
//!
//! let config = SessionConfig::new(2, 1);
//! assert!(config.validate().is_ok());
//! assert_eq!(Frame::NULL.to_string(), "NULL_FRAME");
//! ```

pub use crate::sessions::p2p_session::P2PSession;
pub use crate::{InputStatus, InputVec, RampartEvent, SessionCallbacks, SessionState};

pub use crate::network::udp_socket::UdpNonBlockingSocket;
pub use crate::{Message, NonBlockingSocket};

pub use crate::{Frame, GameInput, PlayerHandle, PlayerType, NULL_FRAME};

pub use crate::RampartError;

pub use crate::sessions::config::{InputQueueConfig, ProtocolConfig, SessionConfig, SyncConfig};
pub use crate::TimeSyncConfig;

pub use crate::NetworkStats;

#[cfg(feature = "tokio")]
pub use crate::network::tokio_transport::TokioTransport;
#[cfg(feature = "tokio")]
pub use crate::TransportConfig;
