//! Binary codec for network messages.
//!
//! Every datagram is a 6-byte header followed by a type-specific body. All integers are
//! big-endian and fixed-width, which bincode produces with the configuration below.
//!
//! ```text
//! ┌──────┬──────────┬─────────┬──────────┬──────────────┐
//! │ type │ reserved │  magic  │ sequence │ body ...     │
//! │  u8  │  u8 (0)  │   u16   │   u16    │              │
//! └──────┴──────────┴─────────┴──────────┴──────────────┘
//! ```
//!
//! Fixed-layout bodies go through serde. The input body carries a variable-length status table
//! and a raw bit payload, so it is written field by field.
//!
//! # Examples
//!
//! ```
//! use rampart_rollback::network::codec::{decode, encode};
//! use rampart_rollback::network::messages::{Message, MessageBody, MessageHeader};
//!
//! let message = Message {
//!     header: MessageHeader { magic: 0x1234, sequence: 7 },
//!     body: MessageBody::KeepAlive,
//! };
//! let bytes = encode(&message).expect("encoding should succeed");
//! assert_eq!(bytes, [6, 0, 0x12, 0x34, 0, 7]);
//! assert_eq!(decode(&bytes).expect("decoding should succeed"), message);
//! ```

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;

use crate::frame_info::{GAME_INPUT_CAPACITY, MAX_PLAYERS};
use crate::network::compression::MAX_COMPRESSED_BITS;
use crate::network::messages::{
    ConnectionStatus, Input, Message, MessageBody, MessageHeader, MessageType,
};
use crate::{Frame, RampartError};

/// Size of the message header in bytes.
pub const HEADER_SIZE: usize = 6;

/// Largest datagram the codec will produce: header, a full status table, the fixed input
/// fields and a maximal bit payload.
pub const MAX_MESSAGE_SIZE: usize =
    HEADER_SIZE + 1 + MAX_PLAYERS * 5 + 4 + 1 + 4 + 2 + 1 + MAX_COMPRESSED_BITS / 8;

// Big-endian, fixed-width integers. The wire layout must not depend on the values.
fn config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

/// What the codec was doing when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CodecOperation {
    /// Encoding a network message.
    EncodeMessage,
    /// Decoding a network message.
    DecodeMessage,
    /// Encoding into a caller-provided buffer.
    EncodeIntoBuffer,
}

impl fmt::Display for CodecOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeMessage => write!(f, "encoding network message"),
            Self::DecodeMessage => write!(f, "decoding network message"),
            Self::EncodeIntoBuffer => write!(f, "encoding into buffer"),
        }
    }
}

/// Errors that can occur during encoding or decoding.
///
/// Bincode errors are opaque, so their messages are kept as strings. Layout problems the codec
/// detects itself get structured variants.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    /// The encoding operation failed.
    EncodeError {
        /// The underlying error message.
        message: String,
        /// The operation that was being performed.
        operation: CodecOperation,
    },
    /// The decoding operation failed, usually because the datagram was truncated.
    DecodeError {
        /// The underlying error message.
        message: String,
        /// The operation that was being performed.
        operation: CodecOperation,
    },
    /// The provided buffer was too small for encoding.
    BufferTooSmall {
        /// The required buffer size.
        required: usize,
        /// The actual buffer size provided.
        provided: usize,
    },
    /// The header carried a type code this codec does not know.
    UnknownMessageType {
        /// The offending code.
        code: u8,
    },
    /// Bytes were left over after the body.
    TrailingBytes {
        /// Number of unread bytes.
        count: usize,
    },
    /// An input body listed more players than a session can have.
    TooManyPeers {
        /// The declared count.
        count: usize,
    },
    /// An input body's declared sizes do not match its payload.
    InvalidInputPayload {
        /// Declared number of bits.
        num_bits: usize,
        /// Declared input size in bytes.
        input_size: usize,
        /// Payload bytes present.
        payload_len: usize,
    },
}

impl CodecError {
    /// Creates a new encode error with the given message and operation.
    pub fn encode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::EncodeError {
            message: message.into(),
            operation,
        }
    }

    /// Creates a new decode error with the given message and operation.
    pub fn decode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::DecodeError {
            message: message.into(),
            operation,
        }
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeError { message, operation } => {
                write!(f, "encoding failed while {operation}: {message}")
            },
            Self::DecodeError { message, operation } => {
                write!(f, "decoding failed while {operation}: {message}")
            },
            Self::BufferTooSmall { required, provided } => {
                write!(
                    f,
                    "buffer too small: needed {required} bytes, but only {provided} provided"
                )
            },
            Self::UnknownMessageType { code } => write!(f, "unknown message type {code}"),
            Self::TrailingBytes { count } => write!(f, "{count} trailing bytes after message"),
            Self::TooManyPeers { count } => {
                write!(
                    f,
                    "input message lists {count} players, at most {MAX_PLAYERS} supported"
                )
            },
            Self::InvalidInputPayload {
                num_bits,
                input_size,
                payload_len,
            } => write!(
                f,
                "input payload of {payload_len} bytes does not match {num_bits} bits of {input_size}-byte inputs"
            ),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<CodecError> for RampartError {
    fn from(err: CodecError) -> Self {
        Self::SerializationError {
            context: err.to_string(),
        }
    }
}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

#[derive(Serialize, Deserialize)]
struct WireHeader {
    kind: u8,
    reserved: u8,
    magic: u16,
    sequence: u16,
}

/// Fixed fields of an input body that follow the status table.
#[derive(Serialize, Deserialize)]
struct InputFields {
    start_frame: Frame,
    disconnect_requested: bool,
    ack_frame: Frame,
    num_bits: u16,
    input_size: u8,
}

/// Encodes a message into a new `Vec<u8>`.
pub fn encode(message: &Message) -> CodecResult<Vec<u8>> {
    let mut buffer = Vec::with_capacity(HEADER_SIZE + 16);
    let header = WireHeader {
        kind: message.body.message_type().code(),
        reserved: 0,
        magic: message.header.magic,
        sequence: message.header.sequence,
    };
    append(&header, &mut buffer)?;

    match &message.body {
        MessageBody::SyncRequest(body) => append(body, &mut buffer)?,
        MessageBody::SyncReply(body) => append(body, &mut buffer)?,
        MessageBody::Input(body) => append_input(body, &mut buffer)?,
        MessageBody::InputAck(body) => append(body, &mut buffer)?,
        MessageBody::QualityReport(body) => append(body, &mut buffer)?,
        MessageBody::QualityReply(body) => append(body, &mut buffer)?,
        MessageBody::KeepAlive => {},
    }
    Ok(buffer)
}

/// Encodes a message into an existing byte slice and returns the number of bytes written.
pub fn encode_into(message: &Message, buffer: &mut [u8]) -> CodecResult<usize> {
    let bytes = encode(message)?;
    let provided = buffer.len();
    let target = buffer
        .get_mut(..bytes.len())
        .ok_or(CodecError::BufferTooSmall {
            required: bytes.len(),
            provided,
        })?;
    target.copy_from_slice(&bytes);
    Ok(bytes.len())
}

/// Number of bytes [`encode`] produces for `message`, computed without encoding it.
#[must_use]
pub fn encoded_len(message: &Message) -> usize {
    let body = match &message.body {
        MessageBody::SyncRequest(_) | MessageBody::SyncReply(_) => 4 + 8,
        MessageBody::Input(input) => {
            1 + input.peer_connect_status.len() * 5 + 4 + 1 + 4 + 2 + 1 + input.bits.len()
        },
        MessageBody::InputAck(_) => 4,
        MessageBody::QualityReport(_) => 2 + 8,
        MessageBody::QualityReply(_) => 8,
        MessageBody::KeepAlive => 0,
    };
    HEADER_SIZE + body
}

/// Decodes one datagram. The whole slice must be consumed.
pub fn decode(bytes: &[u8]) -> CodecResult<Message> {
    let mut offset = 0;
    let header: WireHeader = take(bytes, &mut offset)?;
    let kind = MessageType::from_code(header.kind)
        .ok_or(CodecError::UnknownMessageType { code: header.kind })?;

    let body = match kind {
        MessageType::SyncRequest => MessageBody::SyncRequest(take(bytes, &mut offset)?),
        MessageType::SyncReply => MessageBody::SyncReply(take(bytes, &mut offset)?),
        MessageType::Input => MessageBody::Input(take_input(bytes, &mut offset)?),
        MessageType::QualityReport => MessageBody::QualityReport(take(bytes, &mut offset)?),
        MessageType::QualityReply => MessageBody::QualityReply(take(bytes, &mut offset)?),
        MessageType::KeepAlive => MessageBody::KeepAlive,
        MessageType::InputAck => MessageBody::InputAck(take(bytes, &mut offset)?),
    };

    if offset != bytes.len() {
        return Err(CodecError::TrailingBytes {
            count: bytes.len() - offset,
        });
    }

    Ok(Message {
        header: MessageHeader {
            magic: header.magic,
            sequence: header.sequence,
        },
        body,
    })
}

fn append<T: Serialize>(value: &T, buffer: &mut Vec<u8>) -> CodecResult<()> {
    bincode::serde::encode_into_std_write(value, buffer, config())
        .map(|_| ())
        .map_err(|e| CodecError::encode(e.to_string(), CodecOperation::EncodeMessage))
}

fn take<T: DeserializeOwned>(bytes: &[u8], offset: &mut usize) -> CodecResult<T> {
    let rest = bytes.get(*offset..).unwrap_or_default();
    let (value, read) = bincode::serde::decode_from_slice(rest, config())
        .map_err(|e| CodecError::decode(e.to_string(), CodecOperation::DecodeMessage))?;
    *offset += read;
    Ok(value)
}

fn payload_len(num_bits: usize) -> usize {
    num_bits.div_ceil(8)
}

fn append_input(input: &Input, buffer: &mut Vec<u8>) -> CodecResult<()> {
    let peer_count = input.peer_connect_status.len();
    if peer_count > MAX_PLAYERS {
        return Err(CodecError::encode(
            format!("{} peer statuses exceed {}", peer_count, MAX_PLAYERS),
            CodecOperation::EncodeMessage,
        ));
    }
    let num_bits = usize::from(input.num_bits);
    if payload_len(num_bits) != input.bits.len() || num_bits > MAX_COMPRESSED_BITS {
        return Err(CodecError::encode(
            format!(
                "{} payload bytes do not hold {} bits",
                input.bits.len(),
                num_bits
            ),
            CodecOperation::EncodeMessage,
        ));
    }

    append(&(peer_count as u8), buffer)?;
    for status in &input.peer_connect_status {
        append(status, buffer)?;
    }
    append(
        &InputFields {
            start_frame: input.start_frame,
            disconnect_requested: input.disconnect_requested,
            ack_frame: input.ack_frame,
            num_bits: input.num_bits,
            input_size: input.input_size,
        },
        buffer,
    )?;
    buffer.extend_from_slice(&input.bits);
    Ok(())
}

fn take_input(bytes: &[u8], offset: &mut usize) -> CodecResult<Input> {
    let peer_count = usize::from(take::<u8>(bytes, offset)?);
    if peer_count > MAX_PLAYERS {
        return Err(CodecError::TooManyPeers { count: peer_count });
    }
    let peer_connect_status = (0..peer_count)
        .map(|_| take::<ConnectionStatus>(bytes, offset))
        .collect::<CodecResult<Vec<_>>>()?;
    let fields: InputFields = take(bytes, offset)?;

    let num_bits = usize::from(fields.num_bits);
    let input_size = usize::from(fields.input_size);
    let rest = bytes.get(*offset..).unwrap_or_default();
    let expected = payload_len(num_bits);
    if rest.len() < expected || num_bits > MAX_COMPRESSED_BITS || input_size > GAME_INPUT_CAPACITY
    {
        return Err(CodecError::InvalidInputPayload {
            num_bits,
            input_size,
            payload_len: rest.len(),
        });
    }
    let bits = rest[..expected].to_vec();
    *offset += expected;

    Ok(Input {
        peer_connect_status,
        start_frame: fields.start_frame,
        disconnect_requested: fields.disconnect_requested,
        ack_frame: fields.ack_frame,
        num_bits: fields.num_bits,
        input_size: fields.input_size,
        bits,
    })
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
    use crate::network::messages::{
        InputAck, QualityReply, QualityReport, SyncReply, SyncRequest,
    };

    fn message(body: MessageBody) -> Message {
        Message {
            header: MessageHeader {
                magic: 0xABCD,
                sequence: 0x0102,
            },
            body,
        }
    }

    fn sample_input() -> Input {
        Input {
            peer_connect_status: vec![
                ConnectionStatus {
                    disconnected: false,
                    last_frame: Frame::new(9),
                },
                ConnectionStatus {
                    disconnected: true,
                    last_frame: Frame::NULL,
                },
            ],
            start_frame: Frame::new(10),
            disconnect_requested: false,
            ack_frame: Frame::new(7),
            num_bits: 11,
            input_size: 2,
            bits: vec![0x0B, 0x00],
        }
    }

    #[test]
    fn test_header_layout() {
        let bytes = encode(&message(MessageBody::KeepAlive)).unwrap();
        assert_eq!(bytes, vec![6, 0, 0xAB, 0xCD, 0x01, 0x02]);
    }

    #[test]
    fn test_sync_request_layout() {
        let bytes = encode(&message(MessageBody::SyncRequest(SyncRequest {
            random_request: 0x0A0B_0C0D,
            ping: 1,
        })))
        .unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE + 12);
        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[6..10], &[0x0A, 0x0B, 0x0C, 0x0D]);
        assert_eq!(&bytes[10..18], &[0, 0, 0, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn test_quality_report_layout() {
        let bytes = encode(&message(MessageBody::QualityReport(QualityReport {
            frame_advantage: -2,
            ping: 0x0100,
        })))
        .unwrap();
        assert_eq!(bytes[0], 4);
        assert_eq!(&bytes[6..8], &[0xFF, 0xFE]);
        assert_eq!(bytes.len(), HEADER_SIZE + 2 + 8);
    }

    #[test]
    fn test_input_layout() {
        let bytes = encode(&message(MessageBody::Input(sample_input()))).unwrap();
        let body = &bytes[HEADER_SIZE..];
        assert_eq!(body[0], 2, "peer count");
        assert_eq!(&body[1..6], &[0, 0, 0, 0, 9]);
        assert_eq!(&body[6..11], &[1, 0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(&body[11..15], &[0, 0, 0, 10], "start frame");
        assert_eq!(body[15], 0, "disconnect requested");
        assert_eq!(&body[16..20], &[0, 0, 0, 7], "ack frame");
        assert_eq!(&body[20..22], &[0, 11], "num bits");
        assert_eq!(body[22], 2, "input size");
        assert_eq!(&body[23..], &[0x0B, 0x00]);
    }

    #[test]
    fn test_every_body_round_trips() {
        let bodies = vec![
            MessageBody::SyncRequest(SyncRequest {
                random_request: 5,
                ping: 99,
            }),
            MessageBody::SyncReply(SyncReply {
                random_reply: 5,
                pong: 99,
            }),
            MessageBody::Input(sample_input()),
            MessageBody::InputAck(InputAck {
                ack_frame: Frame::new(3),
            }),
            MessageBody::QualityReport(QualityReport {
                frame_advantage: 3,
                ping: 1234,
            }),
            MessageBody::QualityReply(QualityReply { pong: 1234 }),
            MessageBody::KeepAlive,
        ];
        for body in bodies {
            let original = message(body);
            let bytes = encode(&original).unwrap();
            assert_eq!(bytes.len(), encoded_len(&original));
            assert_eq!(decode(&bytes).unwrap(), original);
        }
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let mut bytes = encode(&message(MessageBody::KeepAlive)).unwrap();
        bytes[0] = 42;
        assert_eq!(
            decode(&bytes),
            Err(CodecError::UnknownMessageType { code: 42 })
        );
    }

    #[test]
    fn test_truncated_body_is_rejected() {
        let bytes = encode(&message(MessageBody::QualityReply(QualityReply { pong: 1 }))).unwrap();
        let result = decode(&bytes[..bytes.len() - 1]);
        assert!(matches!(result, Err(CodecError::DecodeError { .. })));
        assert!(decode(&bytes[..3]).is_err());
    }

    #[test]
    fn test_trailing_bytes_are_rejected() {
        let mut bytes = encode(&message(MessageBody::KeepAlive)).unwrap();
        bytes.push(0);
        assert_eq!(decode(&bytes), Err(CodecError::TrailingBytes { count: 1 }));
    }

    #[test]
    fn test_short_input_payload_is_rejected() {
        let mut bytes = encode(&message(MessageBody::Input(sample_input()))).unwrap();
        bytes.pop();
        assert!(matches!(
            decode(&bytes),
            Err(CodecError::InvalidInputPayload { .. })
        ));
    }

    #[test]
    fn test_too_many_peers_is_rejected() {
        let mut bytes = encode(&message(MessageBody::Input(sample_input()))).unwrap();
        bytes[HEADER_SIZE] = (MAX_PLAYERS + 1) as u8;
        assert_eq!(
            decode(&bytes),
            Err(CodecError::TooManyPeers {
                count: MAX_PLAYERS + 1
            })
        );
    }

    #[test]
    fn test_inconsistent_input_is_not_encoded() {
        let input = Input {
            num_bits: 20,
            ..sample_input()
        };
        assert!(matches!(
            encode(&message(MessageBody::Input(input))),
            Err(CodecError::EncodeError { .. })
        ));
    }

    #[test]
    fn test_encode_into_buffer() {
        let original = message(MessageBody::InputAck(InputAck {
            ack_frame: Frame::new(1),
        }));
        let mut buffer = [0u8; 64];
        let len = encode_into(&original, &mut buffer).unwrap();
        assert_eq!(len, HEADER_SIZE + 4);
        assert_eq!(decode(&buffer[..len]).unwrap(), original);

        let mut small = [0u8; 4];
        assert_eq!(
            encode_into(&original, &mut small),
            Err(CodecError::BufferTooSmall {
                required: HEADER_SIZE + 4,
                provided: 4
            })
        );
    }

    #[test]
    fn test_codec_error_display() {
        let err = CodecError::decode("unexpected end", CodecOperation::DecodeMessage);
        assert!(err.to_string().contains("decoding failed"));
        assert!(err.to_string().contains("network message"));

        let err = CodecError::BufferTooSmall {
            required: 100,
            provided: 10,
        };
        let msg = err.to_string();
        assert!(msg.contains("buffer too small"));
        assert!(msg.contains("100"));
    }

    #[test]
    fn test_max_message_size_fits_largest_input() {
        let input = Input {
            peer_connect_status: vec![ConnectionStatus::default(); MAX_PLAYERS],
            num_bits: MAX_COMPRESSED_BITS as u16,
            input_size: GAME_INPUT_CAPACITY as u8,
            bits: vec![0xFF; MAX_COMPRESSED_BITS / 8],
            ..Input::default()
        };
        let bytes = encode(&message(MessageBody::Input(input))).unwrap();
        assert_eq!(bytes.len(), MAX_MESSAGE_SIZE);
    }
}
