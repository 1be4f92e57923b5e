use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::{Frame, PlayerHandle};

/// This enum contains all error messages this library can return. Most API functions will generally return a [`Result<(), RampartError>`].
///
/// Transient network conditions (lost, duplicated or reordered packets) never surface here;
/// they are absorbed by the protocol. Peer-level conditions such as disconnects are reported
/// as events instead.
///
/// [`Result<(), RampartError>`]: std::result::Result
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RampartError {
    /// When the prediction threshold has been reached, we cannot accept more inputs from the local player.
    PredictionThreshold,
    /// You made an invalid request, usually by using wrong parameters for function calls.
    InvalidRequest {
        /// Further specifies why the request was invalid.
        info: String,
    },
    /// The session is not synchronized yet. Keep polling until every remote peer is running.
    NotSynchronized,
    /// The call was made while a rollback replay is in progress. Inputs cannot be added to queues
    /// that are being re-simulated.
    InRollback,
    /// An invalid frame number was provided.
    InvalidFrame {
        /// The frame that was invalid.
        frame: Frame,
        /// A description of why the frame was invalid.
        reason: String,
    },
    /// An invalid player handle was provided. Player handles must be less than the number of players.
    InvalidPlayerHandle {
        /// The player handle that was invalid.
        handle: PlayerHandle,
        /// The maximum valid player handle (num_players - 1).
        max_handle: PlayerHandle,
    },
    /// Serialization or deserialization of a wire message failed.
    SerializationError {
        /// A description of what failed to serialize/deserialize.
        context: String,
    },
    /// An internal error occurred that should not happen under normal operation.
    InternalError {
        /// A description of the internal error.
        context: String,
    },
    /// A network socket operation failed.
    SocketError {
        /// A description of the socket error.
        context: String,
    },
}

impl Display for RampartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PredictionThreshold => {
                write!(
                    f,
                    "Prediction threshold is reached, cannot proceed without catching up."
                )
            },
            Self::InvalidRequest { info } => {
                write!(f, "Invalid Request: {}", info)
            },
            Self::NotSynchronized => {
                write!(
                    f,
                    "The session is not yet synchronized with all remote sessions."
                )
            },
            Self::InRollback => {
                write!(f, "The session is currently replaying frames after a rollback.")
            },
            Self::InvalidFrame { frame, reason } => {
                write!(f, "Invalid frame {}: {}", frame, reason)
            },
            Self::InvalidPlayerHandle { handle, max_handle } => {
                write!(
                    f,
                    "Invalid player handle {}: must be less than or equal to {}",
                    handle, max_handle
                )
            },
            Self::SerializationError { context } => {
                write!(f, "Serialization error: {}", context)
            },
            Self::InternalError { context } => {
                write!(f, "Internal error (please report as bug): {}", context)
            },
            Self::SocketError { context } => {
                write!(f, "Socket error: {}", context)
            },
        }
    }
}

impl Error for RampartError {}

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
    fn display_includes_request_info() {
        let err = RampartError::InvalidRequest {
            info: "frame delay too large".to_owned(),
        };
        assert_eq!(err.to_string(), "Invalid Request: frame delay too large");
    }

    #[test]
    fn display_invalid_frame_mentions_null() {
        let err = RampartError::InvalidFrame {
            frame: Frame::NULL,
            reason: "cannot load".to_owned(),
        };
        assert_eq!(err.to_string(), "Invalid frame NULL_FRAME: cannot load");
    }

    #[test]
    fn display_invalid_player_handle() {
        let err = RampartError::InvalidPlayerHandle {
            handle: PlayerHandle::new(5),
            max_handle: PlayerHandle::new(1),
        };
        assert!(err.to_string().contains("Invalid player handle 5"));
    }

    #[test]
    fn errors_are_std_errors() {
        fn assert_error<E: Error>(_: &E) {}
        assert_error(&RampartError::PredictionThreshold);
        assert_error(&RampartError::InRollback);
    }
}
