//! Per-attempt state machines driving a peer from transport connect to a
//! live [`Car`](super::Car), for both first-time association and
//! reconnection.

mod association;
mod reconnection;

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time;
use tracing::debug;
use uuid::Uuid;

use companion_common::messages::{CodecError, OperationType};

use crate::config::ConnectionConfig;
use crate::encryption::EncryptionError;
use crate::negotiation::capabilities::CapabilityError;
use crate::negotiation::version::VersionError;
use crate::oob::OobError;
use crate::storage::StorageError;
use crate::stream::{MessageStream, RawStreamEvent, StreamError, StreamMessage};
use crate::transport::{TransportError, TransportEvent, TransportLink};

use super::car::Car;

/// Progress of one connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingCarState {
    Uninitiated,
    EncryptionHandshake,
    PendingVisual,
    PendingOob,
    PendingEncryptedDeviceId,
    SendingDeviceIdAndSecret,
    Done,
}

/// Events an attempt surfaces to the connection manager while running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptEvent {
    /// A short authentication string the user should be able to compare.
    AuthStringAvailable(String),
    /// The peer's device identity arrived, encrypted under the new session.
    DeviceIdReceived(Uuid),
}

#[derive(Debug, thiserror::Error)]
pub enum AssociationError {
    #[error("could not connect to vehicle: {0}")]
    Transport(#[from] TransportError),
    #[error("vehicle disconnected during association")]
    Disconnected,
    #[error("incompatible protocol versions: {0}")]
    Version(#[from] VersionError),
    #[error("capability exchange failed: {0}")]
    Capabilities(#[from] CapabilityError),
    #[error("message stream failed: {0}")]
    Stream(#[from] StreamError),
    #[error("encryption handshake failed: {0}")]
    Encryption(#[from] EncryptionError),
    #[error("could not interpret verification message: {0}")]
    Codec(#[from] CodecError),
    #[error("received a non-handshake message during the encryption handshake")]
    UnexpectedOperation,
    #[error("out-of-band verification failed: {0}")]
    Oob(#[from] OobError),
    #[error("out-of-band channels stopped unexpectedly: {0}")]
    OobChannelsFailed(#[source] tokio::task::JoinError),
    #[error("out-of-band verification tokens do not match")]
    OobVerificationMismatch,
    #[error("verification was rejected")]
    VerificationRejected,
    #[error("vehicle sent an invalid device identity")]
    InvalidDeviceId,
    #[error("could not persist the new association: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, thiserror::Error)]
pub enum ReconnectionError {
    #[error("could not connect to vehicle: {0}")]
    Transport(#[from] TransportError),
    #[error("vehicle disconnected during reconnection")]
    Disconnected,
    #[error("incompatible protocol versions: {0}")]
    Version(#[from] VersionError),
    #[error("message stream failed: {0}")]
    Stream(#[from] StreamError),
    #[error("could not resume stored session: {0}")]
    Encryption(#[from] EncryptionError),
    #[error("received a non-handshake message during the encryption handshake")]
    UnexpectedOperation,
    #[error("vehicle failed the identification challenge")]
    ChallengeFailed,
    #[error("no stored record for device {0}")]
    UnknownDevice(Uuid),
    #[error("could not persist the refreshed session: {0}")]
    Storage(#[from] StorageError),
}

/// Stream-level failures shared by both attempt flavours.
#[derive(Debug)]
pub(crate) enum HandshakeIoError {
    Stream(StreamError),
    Disconnected,
    UnexpectedOperation,
}

impl From<HandshakeIoError> for AssociationError {
    fn from(error: HandshakeIoError) -> Self {
        match error {
            HandshakeIoError::Stream(error) => AssociationError::Stream(error),
            HandshakeIoError::Disconnected => AssociationError::Disconnected,
            HandshakeIoError::UnexpectedOperation => AssociationError::UnexpectedOperation,
        }
    }
}

impl From<HandshakeIoError> for ReconnectionError {
    fn from(error: HandshakeIoError) -> Self {
        match error {
            HandshakeIoError::Stream(error) => ReconnectionError::Stream(error),
            HandshakeIoError::Disconnected => ReconnectionError::Disconnected,
            HandshakeIoError::UnexpectedOperation => ReconnectionError::UnexpectedOperation,
        }
    }
}

/// A completed attempt, ready to become a [`Car`].
pub struct CarHandoff<T> {
    pub device_id: Uuid,
    pub name: Option<String>,
    pub(crate) stream: MessageStream<T>,
}

impl<T> std::fmt::Debug for CarHandoff<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CarHandoff")
            .field("device_id", &self.device_id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<T: TransportLink + Send + 'static> CarHandoff<T> {
    pub fn into_car(self, disconnects: mpsc::UnboundedSender<Uuid>) -> Car {
        Car::spawn(self.device_id, self.name, self.stream, disconnects)
    }
}

/// One in-flight connection attempt. Owns the transport (and later the
/// stream built on it); dropped on failure, which closes the link.
pub struct PendingCar<T> {
    pub(crate) transport: T,
    pub(crate) transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    pub(crate) config: Arc<ConnectionConfig>,
    pub(crate) events: mpsc::UnboundedSender<AttemptEvent>,
    pub(crate) state: PendingCarState,
}

impl<T: TransportLink + Send + 'static> PendingCar<T> {
    pub fn new(
        mut transport: T,
        config: Arc<ConnectionConfig>,
        events: mpsc::UnboundedSender<AttemptEvent>,
    ) -> Result<Self, TransportError> {
        let transport_events = transport.take_events().ok_or(TransportError::NotConnected)?;

        Ok(PendingCar {
            transport,
            transport_events,
            config,
            events,
            state: PendingCarState::Uninitiated,
        })
    }

    /// Connects the transport and waits for the link to report ready.
    pub(crate) async fn connect(&mut self) -> Result<(), TransportError> {
        let connecting = async {
            self.transport.connect().await?;

            loop {
                match self.transport_events.recv().await {
                    Some(TransportEvent::Connected) => return Ok(()),
                    Some(TransportEvent::MessageReceived(_)) => continue,
                    Some(TransportEvent::ConnectionFailed)
                    | Some(TransportEvent::Disconnected)
                    | None => return Err(TransportError::ConnectFailed),
                }
            }
        };

        time::timeout(self.config.connect_timeout, connecting)
            .await
            .map_err(|_| TransportError::ConnectTimeout)?
    }
}

/// Moves an attempt to its next state.
pub(crate) fn advance(state: &mut PendingCarState, next: PendingCarState) {
    debug!(from = ?state, to = ?next, "attempt state change");
    *state = next;
}

/// Waits for the next encryption-handshake payload on the stream.
/// Handshake framing violations and foreign operations are fatal.
pub(crate) async fn next_handshake_payload<T: TransportLink>(
    stream: &mut MessageStream<T>,
) -> Result<Vec<u8>, HandshakeIoError> {
    loop {
        match stream.next_event().await.map_err(HandshakeIoError::Stream)? {
            crate::stream::StreamEvent::MessageReceived(message) => {
                if message.operation == OperationType::EncryptionHandshake {
                    return Ok(message.payload);
                }

                return Err(HandshakeIoError::UnexpectedOperation);
            }
            crate::stream::StreamEvent::Disconnected => return Err(HandshakeIoError::Disconnected),
        }
    }
}

/// Sends one plaintext handshake message.
pub(crate) async fn send_handshake<T: TransportLink>(
    stream: &mut MessageStream<T>,
    payload: Vec<u8>,
) -> Result<(), HandshakeIoError> {
    stream
        .send(StreamMessage::handshake(payload))
        .await
        .map(|_| ())
        .map_err(HandshakeIoError::Stream)
}

/// Races `future` against the stream. While waiting, stray handshake
/// messages are dropped; any other traffic or a disconnect fails the wait.
pub(crate) async fn race_stream<T, F, O>(
    stream: &mut MessageStream<T>,
    mut future: F,
) -> Result<O, HandshakeIoError>
where
    T: TransportLink,
    F: Future<Output = O> + Unpin,
{
    loop {
        tokio::select! {
            output = &mut future => return Ok(output),
            raw = stream.next_raw_event() => match raw {
                RawStreamEvent::Frame(frame) => {
                    match stream.process_frame(frame).await.map_err(HandshakeIoError::Stream)? {
                        Some(message) if message.operation == OperationType::EncryptionHandshake => {
                            debug!("dropping handshake message received while waiting");
                        }
                        Some(_) => return Err(HandshakeIoError::UnexpectedOperation),
                        None => (),
                    }
                }
                RawStreamEvent::Disconnected => return Err(HandshakeIoError::Disconnected),
            },
        }
    }
}
