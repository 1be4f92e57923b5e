//! Protocol state machine for one remote peer.
//!
//! # State Machine Diagram
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                  Peer Protocol State Machine                     │
//! │                                                                  │
//! │   new() / synchronize()                                          │
//! │          │                                                       │
//! │          ▼                                                       │
//! │   ┌─────────────┐   retries exhausted    ┌──────────────┐        │
//! │   │   Syncing   │ ──────────────────────►│ Disconnected │        │
//! │   └──────┬──────┘       (SyncFailed)     └──────────────┘        │
//! │          │                                      ▲                │
//! │          │ roundtrips = 0                       │                │
//! │          ▼                                      │                │
//! │   ┌─────────────┐   disconnect_timeout   ───────┘                │
//! │   │   Running   │ ──────────────────────                         │
//! │   └──────┬──────┘   or disconnect()                              │
//! │          │  ▲                                                    │
//! │  silence │  │ any message                                        │
//! │          ▼  │                                                    │
//! │   NetworkInterrupted / NetworkResumed (events, not states)       │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## State Transitions
//!
//! | From     | To           | Trigger                                  |
//! |----------|--------------|------------------------------------------|
//! | Syncing  | Running      | Final `SyncReply` of the handshake       |
//! | Syncing  | Disconnected | `max_sync_retries` exceeded              |
//! | Running  | Disconnected | `disconnect()` or `disconnect_timeout`   |
//! | any      | Syncing      | `synchronize()`                          |

/// Connection state of a [`UdpProtocol`](super::UdpProtocol).
///
/// # Note
///
/// This type is re-exported in [`__internal`](crate::__internal) for testing.
/// It is not part of the stable public API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolState {
    /// Exchanging `SyncRequest`/`SyncReply` roundtrips with the peer. Non-handshake messages
    /// are dropped.
    Syncing,

    /// Normal operation: inputs, acks, quality reports and keepalives flow both ways.
    Running,

    /// The peer is gone, or we left. Outbound inputs carry `disconnect_requested`.
    Disconnected,
}

impl ProtocolState {
    /// Returns a string representation suitable for logging.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Syncing => "Syncing",
            Self::Running => "Running",
            Self::Disconnected => "Disconnected",
        }
    }
}

impl std::fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_state_labels() {
        assert_eq!(ProtocolState::Syncing.as_str(), "Syncing");
        assert_eq!(ProtocolState::Running.to_string(), "Running");
        assert_eq!(
            format!("{:?}", ProtocolState::Disconnected),
            ProtocolState::Disconnected.as_str()
        );
    }

    #[test]
    fn protocol_state_variants_distinct() {
        let variants = [
            ProtocolState::Syncing,
            ProtocolState::Running,
            ProtocolState::Disconnected,
        ];
        for (i, a) in variants.iter().enumerate() {
            for (j, b) in variants.iter().enumerate() {
                assert_eq!(i == j, a == b);
            }
        }
    }
}
