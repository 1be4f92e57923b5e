use serde::{Deserialize, Serialize};

use crate::Frame;

/// Connection status for a player as seen by one peer.
///
/// # Note
///
/// This type is re-exported in [`__internal`](crate::__internal) for testing.
/// It is not part of the stable public API.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    /// Whether this player has disconnected.
    pub disconnected: bool,
    /// The last frame of this player's input that is known.
    pub last_frame: Frame,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            disconnected: false,
            last_frame: Frame::NULL,
        }
    }
}

impl ConnectionStatus {
    /// Folds a peer's view into this one: a disconnect seen by anyone sticks, and the furthest
    /// known frame wins.
    pub fn merge(&mut self, remote: &Self) {
        self.disconnected |= remote.disconnected;
        self.last_frame = std::cmp::max(self.last_frame, remote.last_frame);
    }
}

/// Wire type codes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    SyncRequest = 1,
    SyncReply = 2,
    Input = 3,
    QualityReport = 4,
    QualityReply = 5,
    KeepAlive = 6,
    InputAck = 7,
}

impl MessageType {
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::SyncRequest),
            2 => Some(Self::SyncReply),
            3 => Some(Self::Input),
            4 => Some(Self::QualityReport),
            5 => Some(Self::QualityReply),
            6 => Some(Self::KeepAlive),
            7 => Some(Self::InputAck),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SyncRequest {
    /// Nonce the reply must echo.
    pub random_request: u32,
    /// Sender's clock in milliseconds, echoed back as `pong`.
    pub ping: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SyncReply {
    pub random_reply: u32,
    pub pong: u64,
}

/// A run of consecutive inputs, delta-encoded against the last input the receiver acknowledged.
#[derive(Clone, PartialEq, Eq)]
pub struct Input {
    /// The sender's view of every player's connection.
    pub peer_connect_status: Vec<ConnectionStatus>,
    /// Frame of the first encoded input.
    pub start_frame: Frame,
    /// Set once the sender has disconnected on purpose.
    pub disconnect_requested: bool,
    /// Last frame of the receiver's input that the sender has.
    pub ack_frame: Frame,
    /// Number of meaningful bits in `bits`.
    pub num_bits: u16,
    /// Size in bytes of one decoded input.
    pub input_size: u8,
    pub bits: Vec<u8>,
}

impl Default for Input {
    fn default() -> Self {
        Self {
            peer_connect_status: Vec::new(),
            start_frame: Frame::NULL,
            disconnect_requested: false,
            ack_frame: Frame::NULL,
            num_bits: 0,
            input_size: 0,
            bits: Vec::new(),
        }
    }
}

impl std::fmt::Debug for Input {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Destructure to ensure all fields are included when new fields are added.
        let Self {
            peer_connect_status,
            start_frame,
            disconnect_requested,
            ack_frame,
            num_bits,
            input_size,
            bits,
        } = self;

        f.debug_struct("Input")
            .field("peer_connect_status", peer_connect_status)
            .field("start_frame", start_frame)
            .field("disconnect_requested", disconnect_requested)
            .field("ack_frame", ack_frame)
            .field("num_bits", num_bits)
            .field("input_size", input_size)
            .field("bits", &BytesDebug(bits))
            .finish()
    }
}

struct BytesDebug<'a>(&'a [u8]);

impl std::fmt::Debug for BytesDebug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("0x")?;
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputAck {
    pub ack_frame: Frame,
}

impl Default for InputAck {
    fn default() -> Self {
        Self {
            ack_frame: Frame::NULL,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct QualityReport {
    /// Frame advantage of the sender.
    ///
    /// An i16 rather than an i8: a peer that stops reading for a while (a paused tab, a
    /// debugger) easily exceeds +/-127 frames, and +/-32k frames is far past any disconnect
    /// timeout.
    pub frame_advantage: i16,
    pub ping: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct QualityReply {
    pub pong: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MessageHeader {
    /// Session magic of the sender.
    pub magic: u16,
    /// Per-sender sequence number, incremented for every message sent.
    pub sequence: u16,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageBody {
    SyncRequest(SyncRequest),
    SyncReply(SyncReply),
    Input(Input),
    InputAck(InputAck),
    QualityReport(QualityReport),
    QualityReply(QualityReply),
    KeepAlive,
}

impl MessageBody {
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::SyncRequest(_) => MessageType::SyncRequest,
            Self::SyncReply(_) => MessageType::SyncReply,
            Self::Input(_) => MessageType::Input,
            Self::InputAck(_) => MessageType::InputAck,
            Self::QualityReport(_) => MessageType::QualityReport,
            Self::QualityReply(_) => MessageType::QualityReply,
            Self::KeepAlive => MessageType::KeepAlive,
        }
    }

    /// Handshake messages bypass the magic and sequence checks.
    #[must_use]
    pub fn is_sync(&self) -> bool {
        matches!(self, Self::SyncRequest(_) | Self::SyncReply(_))
    }
}

/// A message that a [`NonBlockingSocket`] sends and receives. Socket implementations turn
/// datagrams into `Message`s with [`codec::decode`](crate::network::codec::decode) and back with
/// [`codec::encode`](crate::network::codec::encode).
///
/// [`NonBlockingSocket`]: crate::NonBlockingSocket
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub header: MessageHeader,
    pub body: MessageBody,
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
    fn test_connection_status_default() {
        let status = ConnectionStatus::default();
        assert!(!status.disconnected);
        assert_eq!(status.last_frame, Frame::NULL);
    }

    #[test]
    fn test_connection_status_merge() {
        let mut local = ConnectionStatus {
            disconnected: false,
            last_frame: Frame::new(10),
        };
        local.merge(&ConnectionStatus {
            disconnected: false,
            last_frame: Frame::new(4),
        });
        assert_eq!(local.last_frame, Frame::new(10));
        assert!(!local.disconnected);

        local.merge(&ConnectionStatus {
            disconnected: true,
            last_frame: Frame::new(12),
        });
        assert_eq!(local.last_frame, Frame::new(12));
        assert!(local.disconnected);

        // A later view without the flag does not reconnect.
        local.merge(&ConnectionStatus::default());
        assert!(local.disconnected);
    }

    #[test]
    fn test_message_type_codes() {
        for code in 1..=7 {
            let kind = MessageType::from_code(code).unwrap();
            assert_eq!(kind.code(), code);
        }
        assert!(MessageType::from_code(0).is_none());
        assert!(MessageType::from_code(8).is_none());
    }

    #[test]
    fn test_body_types() {
        assert_eq!(MessageBody::KeepAlive.message_type(), MessageType::KeepAlive);
        assert_eq!(
            MessageBody::Input(Input::default()).message_type(),
            MessageType::Input
        );
        assert!(MessageBody::SyncReply(SyncReply::default()).is_sync());
        assert!(!MessageBody::InputAck(InputAck::default()).is_sync());
    }

    #[test]
    fn test_input_debug_prints_hex() {
        let input = Input {
            bits: vec![0xab, 0xcd],
            ..Input::default()
        };
        let debug = format!("{:?}", input);
        assert!(debug.contains("0xabcd"));
    }
}
