//! Wire schema for the companion protocol.
//!
//! Every message is CBOR. Structs that travel inside size-sensitive frames
//! are serialized as fixed-arity arrays rather than field-name maps, so the
//! per-packet overhead stays a few bytes.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_bytes::ByteBuf;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("could not encode message: {0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),
    #[error("could not decode message: {0}")]
    Decode(#[from] ciborium::de::Error<std::io::Error>),
}

pub fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(value, &mut bytes)?;

    Ok(bytes)
}

pub fn from_slice<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    Ok(ciborium::de::from_reader(bytes)?)
}

/// Implements `Serialize`/`Deserialize` as a fixed-arity CBOR array in field
/// declaration order.
macro_rules! cbor_array {
    ($name:ident { $($field:ident),+ $(,)? }) => {
        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                ($(&self.$field,)+).serialize(serializer)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let ($($field,)+) = Deserialize::deserialize(deserializer)?;

                Ok($name { $($field),+ })
            }
        }
    };
}

/// First exchange after transport connect: each side advertises the message
/// and security version ranges it supports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionExchange {
    pub min_message_version: u32,
    pub max_message_version: u32,
    pub min_security_version: u32,
    pub max_security_version: u32,
}

cbor_array!(VersionExchange {
    min_message_version,
    max_message_version,
    min_security_version,
    max_security_version,
});

/// Out-of-band channel types a peer can serve during association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OobChannelType {
    BtRfcomm,
    PreAssociation,
    /// Reserved sentinel; never served by a channel.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CapabilitiesExchange {
    pub supported_oob_channels: Vec<OobChannelType>,
}

cbor_array!(CapabilitiesExchange { supported_oob_channels });

/// One transport frame of a (possibly chunked) stream message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// 1-indexed position of this packet within the message.
    pub packet_number: u32,
    pub total_packets: u32,
    pub message_id: u32,
    pub payload: ByteBuf,
}

cbor_array!(Packet {
    packet_number,
    total_packets,
    message_id,
    payload,
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationType {
    EncryptionHandshake,
    ClientMessage,
    Query,
    QueryResponse,
}

/// Envelope around every reassembled stream message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub operation: OperationType,
    pub payload: ByteBuf,
    pub is_payload_encrypted: bool,
    /// Non-zero when `payload` is DEFLATE compressed; holds the inflated size.
    pub original_size: u32,
    /// Logical consumer of the message. Absent on legacy peers.
    pub recipient: Option<Uuid>,
}

cbor_array!(Message {
    operation,
    payload,
    is_payload_encrypted,
    original_size,
    recipient,
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub id: u32,
    /// Recipient the response should be addressed to.
    pub sender: Uuid,
    pub request: ByteBuf,
    pub parameters: ByteBuf,
}

cbor_array!(Query {
    id,
    sender,
    request,
    parameters,
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResponse {
    pub query_id: u32,
    pub success: bool,
    pub response: ByteBuf,
}

cbor_array!(QueryResponse {
    query_id,
    success,
    response,
});

/// Verification signalling for security version 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationCodeState {
    VisualVerification,
    VisualConfirmation,
    OobVerification,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationCode {
    pub state: VerificationCodeState,
    pub payload: Option<ByteBuf>,
}

cbor_array!(VerificationCode { state, payload });

/// Key material delivered through an out-of-band channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OobToken {
    pub encryption_key: ByteBuf,
    pub ihu_iv: ByteBuf,
    pub mobile_iv: ByteBuf,
}

cbor_array!(OobToken {
    encryption_key,
    ihu_iv,
    mobile_iv,
});

/// Pre-association seed, e.g. scanned from a QR code or received over NFC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutOfBandAssociationData {
    pub token: Option<OobToken>,
    pub device_identifier: Option<ByteBuf>,
}

cbor_array!(OutOfBandAssociationData {
    token,
    device_identifier,
});
