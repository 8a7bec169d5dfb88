use std::io::{Read, Write};

use aes_gcm::Aes256Gcm;
use flate2::bufread::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde_bytes::ByteBuf;
use tokio::sync::mpsc;
use tokio::task;
use tracing::{debug, warn};

use companion_common::keys::EncryptionKey;
use companion_common::messages::{self, Message, OperationType};

use crate::encryption::SessionKey;
use crate::negotiation::version::MessageVersion;
use crate::transport::{TransportEvent, TransportLink};

use super::packetizer::{pack, PacketAssembler};
use super::{StreamError, StreamMessage};

#[derive(Debug, PartialEq, Eq)]
pub enum StreamEvent {
    MessageReceived(StreamMessage),
    Disconnected,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RawStreamEvent {
    Frame(Vec<u8>),
    Disconnected,
}

/// Frames, chunks, optionally compresses and encrypts application messages
/// over one transport.
///
/// The stream owns its transport. Sends resolve once every packet of the
/// message has been written, which keeps packets of different messages from
/// interleaving on the wire.
pub struct MessageStream<T> {
    transport: T,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    assembler: PacketAssembler,
    compression_enabled: bool,
    compression_threshold: usize,
    cipher: Option<Aes256Gcm>,
    next_message_id: u32,
}

impl<T: TransportLink> MessageStream<T> {
    pub fn new(
        transport: T,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        message_version: MessageVersion,
        compression_threshold: usize,
    ) -> Self {
        MessageStream {
            transport,
            transport_events,
            assembler: PacketAssembler::new(),
            compression_enabled: message_version.supports_compression(),
            compression_threshold,
            cipher: None,
            next_message_id: 0,
        }
    }

    /// Installs the session key. Subsequent encrypted sends and receives use
    /// it; handshake traffic stays plaintext.
    pub fn set_encryption_key(&mut self, key: &SessionKey) {
        self.cipher = Some(key.cipher());
    }

    pub fn has_encryption_key(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn device_name(&self) -> Option<String> {
        self.transport.device_name()
    }

    pub async fn disconnect(&mut self) {
        self.transport.disconnect().await;
    }

    /// Sends one message, returning the stream message id it was assigned.
    pub async fn send(&mut self, message: StreamMessage) -> Result<u32, StreamError> {
        let mut payload = message.payload;
        let mut original_size = 0u32;

        // Only client messages are candidates for compression, and only when
        // it actually wins: a net loss is sent uncompressed.
        if self.compression_enabled
            && message.operation == OperationType::ClientMessage
            && payload.len() > self.compression_threshold
        {
            let (original, compressed) = deflate(payload).await?;
            if compressed.len() < original.len() {
                debug!(
                    from = original.len(),
                    to = compressed.len(),
                    "compressed outbound message"
                );
                original_size = original.len() as u32;
                payload = compressed;
            } else {
                payload = original;
            }
        }

        if message.is_payload_encrypted {
            if message.operation == OperationType::EncryptionHandshake {
                return Err(StreamError::EncryptedHandshake);
            }
            let cipher = self.cipher.as_ref().ok_or(StreamError::MissingEncryptionKey)?;
            payload = cipher.encrypt(&payload).await.map_err(|_| StreamError::Encryption)?;
        }

        let envelope = Message {
            operation: message.operation,
            payload: ByteBuf::from(payload),
            is_payload_encrypted: message.is_payload_encrypted,
            original_size,
            recipient: message.recipient,
        };

        let message_id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);

        let packets = pack(
            message_id,
            &messages::to_vec(&envelope)?,
            self.transport.max_write_size(),
        )?;

        // One packet in flight at a time; the next write starts only after
        // the previous one was reported sent.
        for packet in packets {
            self.transport.send(&messages::to_vec(&packet)?).await?;
        }

        Ok(message_id)
    }

    /// Waits for the next inbound event. Errors are fatal for the stream; the
    /// caller is expected to disconnect.
    pub async fn next_event(&mut self) -> Result<StreamEvent, StreamError> {
        loop {
            match self.next_raw_event().await {
                RawStreamEvent::Frame(frame) => {
                    if let Some(message) = self.process_frame(frame).await? {
                        return Ok(StreamEvent::MessageReceived(message));
                    }
                }
                RawStreamEvent::Disconnected => return Ok(StreamEvent::Disconnected),
            }
        }
    }

    /// Waits for the next transport event without decoding anything. Safe to
    /// race in a `select!`: losing the race never loses a frame.
    pub(crate) async fn next_raw_event(&mut self) -> RawStreamEvent {
        loop {
            let event = match self.transport_events.recv().await {
                Some(event) => event,
                // The transport dropped its event channel; the link is gone.
                None => return RawStreamEvent::Disconnected,
            };

            match event {
                TransportEvent::MessageReceived(frame) => return RawStreamEvent::Frame(frame),
                TransportEvent::Disconnected => return RawStreamEvent::Disconnected,
                // Connect-phase events do not occur once the stream runs.
                TransportEvent::Connected | TransportEvent::ConnectionFailed => continue,
            }
        }
    }

    /// Feeds one inbound frame through reassembly, decryption and
    /// decompression. `None` while a chunked message is still incomplete or
    /// an unparseable envelope was dropped.
    pub(crate) async fn process_frame(&mut self, frame: Vec<u8>) -> Result<Option<StreamMessage>, StreamError> {
        let packet = messages::from_slice(&frame)?;
        let Some(reassembled) = self.assembler.feed(packet)? else {
            return Ok(None);
        };

        let envelope: Message = match messages::from_slice(&reassembled) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!("dropping unparseable message envelope: {error}");
                return Ok(None);
            }
        };

        self.decode_envelope(envelope).await.map(Some)
    }

    async fn decode_envelope(&self, envelope: Message) -> Result<StreamMessage, StreamError> {
        let mut payload = envelope.payload.into_vec();

        if envelope.is_payload_encrypted {
            let cipher = self.cipher.as_ref().ok_or(StreamError::MissingEncryptionKey)?;
            payload = cipher.decrypt(&payload).await.map_err(|_| StreamError::Decryption)?;
        }

        if envelope.original_size > 0 {
            payload = inflate(payload, envelope.original_size as usize).await?;
        }

        Ok(StreamMessage {
            operation: envelope.operation,
            payload,
            is_payload_encrypted: false,
            original_size: 0,
            recipient: envelope.recipient,
        })
    }
}

async fn deflate(payload: Vec<u8>) -> Result<(Vec<u8>, Vec<u8>), StreamError> {
    task::spawn_blocking(move || {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(&payload).map_err(StreamError::Compression)?;
        let compressed = encoder.finish().map_err(StreamError::Compression)?;

        Ok((payload, compressed))
    })
    .await
    .map_err(|error| StreamError::Compression(std::io::Error::other(error)))?
}

/// Inflates to exactly `expected_size` bytes; a short, long or dirty deflate
/// stream is rejected.
async fn inflate(payload: Vec<u8>, expected_size: usize) -> Result<Vec<u8>, StreamError> {
    if expected_size > super::MAX_REASSEMBLED_MESSAGE_SIZE {
        return Err(StreamError::MessageTooLarge);
    }

    task::spawn_blocking(move || {
        let mut limited = DeflateDecoder::new(payload.as_slice()).take(expected_size as u64 + 1);
        let mut inflated = Vec::with_capacity(expected_size);
        limited.read_to_end(&mut inflated).map_err(StreamError::Compression)?;

        // The deflate stream must end exactly at the declared size, with no
        // trailing input left over.
        let remaining = limited.into_inner().into_inner();
        if inflated.len() != expected_size || !remaining.is_empty() {
            return Err(StreamError::DecompressedSizeMismatch);
        }

        Ok(inflated)
    })
    .await
    .map_err(|error| StreamError::Compression(std::io::Error::other(error)))?
}
