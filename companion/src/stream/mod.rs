//! Framing, chunking, compression and encryption of application messages on
//! top of a [`TransportLink`](crate::transport::TransportLink).

mod message_stream;
mod packetizer;

pub use message_stream::{MessageStream, StreamEvent};
pub(crate) use message_stream::RawStreamEvent;
pub use packetizer::{pack, PacketAssembler, MAX_REASSEMBLED_MESSAGE_SIZE};

use uuid::Uuid;

use companion_common::messages::{CodecError, OperationType};

use crate::transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("packet {received} of message {message_id} arrived out of order (expected {expected})")]
    PacketOutOfOrder {
        message_id: u32,
        expected: u32,
        received: u32,
    },
    #[error("packet of message {received} arrived while message {in_progress} is still being reassembled")]
    InterleavedMessage { in_progress: u32, received: u32 },
    #[error("total packet count of message {message_id} changed mid-message")]
    TotalPacketsMismatch { message_id: u32 },
    #[error("packet numbering of message {message_id} is malformed")]
    MalformedPacket { message_id: u32 },
    #[error("message exceeds the maximum reassembled size")]
    MessageTooLarge,
    #[error("write size of {mtu} bytes cannot fit a packet")]
    MtuTooSmall { mtu: usize },
    #[error("could not encode or decode a frame: {0}")]
    Codec(#[from] CodecError),
    #[error("message requires encryption but no session key is installed")]
    MissingEncryptionKey,
    #[error("encryption handshake messages are never encrypted")]
    EncryptedHandshake,
    #[error("could not encrypt message payload")]
    Encryption,
    #[error("could not decrypt message payload")]
    Decryption,
    #[error("could not compress or decompress message payload: {0}")]
    Compression(#[source] std::io::Error),
    #[error("decompressed payload does not match its declared size")]
    DecompressedSizeMismatch,
    #[error("transport failed: {0}")]
    Transport(#[from] TransportError),
}

/// An application message in flight on the stream.
///
/// On receive, payloads are always delivered decrypted and decompressed:
/// `is_payload_encrypted` is `false` and `original_size` is `0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    pub operation: OperationType,
    pub payload: Vec<u8>,
    pub is_payload_encrypted: bool,
    pub original_size: u32,
    pub recipient: Option<Uuid>,
}

impl StreamMessage {
    /// A plaintext encryption-handshake message.
    pub fn handshake(payload: Vec<u8>) -> Self {
        StreamMessage {
            operation: OperationType::EncryptionHandshake,
            payload,
            is_payload_encrypted: false,
            original_size: 0,
            recipient: None,
        }
    }

    /// An encrypted message for the given operation and recipient.
    pub fn encrypted(operation: OperationType, payload: Vec<u8>, recipient: Option<Uuid>) -> Self {
        StreamMessage {
            operation,
            payload,
            is_payload_encrypted: true,
            original_size: 0,
            recipient,
        }
    }
}
