use serde_bytes::ByteBuf;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use companion_common::messages::{
    self, OobChannelType, OperationType, VerificationCode, VerificationCodeState,
};

use crate::encryption::{EncryptionError, EstablishedSession, Handshake, PendingVerification};
use crate::identification::IdentificationKey;
use crate::negotiation::version::SecurityVersion;
use crate::negotiation::{capabilities, version};
use crate::oob::{BoxedOobAcceptor, OobChannelSet, OobData};
use crate::storage::{CarStore, PeerRecord};
use crate::stream::{MessageStream, StreamEvent, StreamMessage};
use crate::transport::TransportLink;

use super::super::scanner::DiscoveredDevice;
use super::{
    advance, next_handshake_payload, race_stream, send_handshake, AssociationError, AttemptEvent,
    CarHandoff, PendingCar, PendingCarState,
};

impl<T: TransportLink + Send + 'static> PendingCar<T> {
    /// Drives a first-time association through to a connected car.
    ///
    /// The verification mode follows the negotiated security version:
    /// version 2 accepts the visual code silently, version 3 prefers
    /// out-of-band material and falls back to a caller-confirmed code,
    /// version 4 signals the chosen mode to the vehicle explicitly.
    #[instrument(skip_all, fields(peer = %device.mac_address))]
    pub async fn associate<S>(
        mut self,
        device: &DiscoveredDevice,
        oob_acceptor: Option<BoxedOobAcceptor>,
        pre_association: Option<OobData>,
        visual_confirmation: oneshot::Receiver<()>,
        store: &RwLock<S>,
    ) -> Result<CarHandoff<T>, AssociationError>
    where
        S: CarStore + Send + Sync,
    {
        info!("Connecting to vehicle for association");
        self.connect().await?;

        info!("Negotiating protocol versions");
        let versions = version::exchange(&mut self.transport, &mut self.transport_events).await?;

        // Out-of-band channels only exist from security version 3 on.
        let peer_channels = if versions.security_version.supports_oob() {
            info!("Exchanging out-of-band capabilities");
            capabilities::exchange(
                &mut self.transport,
                &mut self.transport_events,
                &self.config.supported_oob_channels,
            )
            .await?
        } else {
            Vec::new()
        };

        let mut channel_types = capabilities::intersect(&self.config.supported_oob_channels, &peer_channels);
        // Seeded data is usable without any peer cooperation.
        if pre_association.is_some() && !channel_types.contains(&OobChannelType::PreAssociation) {
            channel_types.push(OobChannelType::PreAssociation);
        }

        // Version 4 bounds the out-of-band wait; version 3 waits as long as
        // the link lives.
        let oob_timeout =
            (versions.security_version == SecurityVersion::V4).then_some(self.config.oob_channel_timeout);
        let oob_channels = OobChannelSet::new(&channel_types, oob_acceptor, pre_association, oob_timeout);
        let oob_cancel = oob_channels.cancellation_token();
        let mut oob_task = tokio::spawn(oob_channels.read());

        let PendingCar {
            transport,
            transport_events,
            config,
            events,
            mut state,
        } = self;
        let mut stream = MessageStream::new(
            transport,
            transport_events,
            versions.message_version,
            config.compression_threshold,
        );

        info!("Starting encryption handshake");
        advance(&mut state, PendingCarState::EncryptionHandshake);
        let (handshake, init) = Handshake::start()?;
        send_handshake(&mut stream, init).await?;
        let response = next_handshake_payload(&mut stream).await?;
        let (pending, finish) = handshake.handle_vehicle_response(&response)?;
        send_handshake(&mut stream, finish).await?;

        let verified = match versions.security_version {
            SecurityVersion::V2 => {
                advance(&mut state, PendingCarState::PendingVisual);

                // Accepted without user involvement: the encrypted device id
                // the vehicle sends next doubles as proof of the peer.
                debug!("accepting visual verification silently");
                pending
                    .notify_confirmed()
                    .map(|established| (established, None))
                    .map_err(AssociationError::from)
            }
            SecurityVersion::V3 => {
                verify_v3(
                    &mut stream,
                    pending,
                    &mut oob_task,
                    visual_confirmation,
                    &events,
                    &mut state,
                )
                .await
            }
            SecurityVersion::V4 => verify_v4(&mut stream, pending, &mut oob_task, &events, &mut state)
                .await
                .map(|established| (established, None)),
        };
        // Losing channels must release their sockets whether or not the
        // verification succeeded.
        oob_cancel.cancel();
        let (established, confirmation_gate) = verified?;

        stream.set_encryption_key(&established.session_key);

        info!("Waiting for the vehicle's device identity");
        advance(&mut state, PendingCarState::PendingEncryptedDeviceId);
        let peer_device_id = receive_peer_device_id(&mut stream).await?;
        let _ = events.send(AttemptEvent::DeviceIdReceived(peer_device_id));

        // A visually verified session hands nothing over until the user
        // confirmed the code.
        if let Some(confirmation) = confirmation_gate {
            info!("Awaiting user confirmation of the verification code");
            race_stream(&mut stream, confirmation)
                .await?
                .map_err(|_| AssociationError::VerificationRejected)?;
        }

        info!("Sending device identity and identification key");
        advance(&mut state, PendingCarState::SendingDeviceIdAndSecret);
        let identification_key = IdentificationKey::generate();
        let mut payload = config.device_id.as_bytes().to_vec();
        payload.extend_from_slice(identification_key.as_bytes());
        // The send resolves once the transport reports the write complete,
        // which is the cue that the session is fully connected.
        stream
            .send(StreamMessage::encrypted(OperationType::ClientMessage, payload, None))
            .await?;

        info!("Persisting the new association");
        let name = device.name.clone().or_else(|| stream.device_name());
        let record = PeerRecord {
            device_id: peer_device_id,
            name: name.clone(),
            mac_address: device.mac_address.clone(),
            encryption_session: established.resume_blob,
            identification_key,
            user_renamed: false,
        };
        store.write().await.insert_or_replace(record).await?;

        advance(&mut state, PendingCarState::Done);
        info!(device_id = %peer_device_id, "association complete");

        Ok(CarHandoff {
            device_id: peer_device_id,
            name,
            stream,
        })
    }
}

/// Security version 3: out-of-band material wins when any channel delivers
/// it; otherwise the code is surfaced and the session stays gated on the
/// caller's confirmation, which the returned receiver carries.
async fn verify_v3<T: TransportLink>(
    stream: &mut MessageStream<T>,
    pending: PendingVerification,
    oob_task: &mut JoinHandle<Option<OobData>>,
    visual_confirmation: oneshot::Receiver<()>,
    events: &mpsc::UnboundedSender<AttemptEvent>,
    state: &mut PendingCarState,
) -> Result<(EstablishedSession, Option<oneshot::Receiver<()>>), AssociationError> {
    // A join error is an internal fault, not "no channel delivered data";
    // it must never downgrade the verification mode.
    let oob_result = race_stream(stream, oob_task)
        .await?
        .map_err(AssociationError::OobChannelsFailed)?;

    match oob_result {
        Some(oob_data) => {
            advance(state, PendingCarState::PendingOob);
            info!("Verifying handshake through out-of-band tokens");

            let token = *pending.verification_token();
            send_handshake(stream, oob_data.encrypt_token(&token)?).await?;

            let reply = next_handshake_payload(stream).await?;
            let peer_token = oob_data.decrypt_peer_token(&reply)?;
            if peer_token != token {
                return Err(AssociationError::OobVerificationMismatch);
            }

            Ok((pending.notify_confirmed()?, None))
        }
        None => {
            advance(state, PendingCarState::PendingVisual);
            info!("No out-of-band data, requesting visual confirmation");

            // The vehicle side may confirm (and start talking) before our
            // user does, so the session key is installed right away; the
            // identity handover later waits on the receiver.
            let _ = events.send(AttemptEvent::AuthStringAvailable(pending.visual_code()));

            Ok((pending.notify_confirmed()?, Some(visual_confirmation)))
        }
    }
}

/// Security version 4: the chosen verification mode is signalled to the
/// vehicle explicitly, and the vehicle confirms it.
async fn verify_v4<T: TransportLink>(
    stream: &mut MessageStream<T>,
    pending: PendingVerification,
    oob_task: &mut JoinHandle<Option<OobData>>,
    events: &mpsc::UnboundedSender<AttemptEvent>,
    state: &mut PendingCarState,
) -> Result<EstablishedSession, AssociationError> {
    // The channel set itself bounds this wait. As in the version 3 flow, a
    // join error must not downgrade the verification mode.
    let oob_result = race_stream(stream, oob_task)
        .await?
        .map_err(AssociationError::OobChannelsFailed)?;

    match oob_result {
        Some(oob_data) => {
            advance(state, PendingCarState::PendingOob);
            info!("Verifying handshake through out-of-band tokens");

            let token = *pending.verification_token();
            let code = VerificationCode {
                state: VerificationCodeState::OobVerification,
                payload: Some(ByteBuf::from(oob_data.encrypt_token(&token)?)),
            };
            send_handshake(stream, messages::to_vec(&code)?).await?;

            let reply: VerificationCode = messages::from_slice(&next_handshake_payload(stream).await?)?;
            match (reply.state, reply.payload) {
                (VerificationCodeState::OobVerification, Some(payload)) => {
                    let peer_token = oob_data.decrypt_peer_token(&payload)?;
                    if peer_token != token {
                        return Err(AssociationError::OobVerificationMismatch);
                    }

                    Ok(pending.notify_confirmed()?)
                }
                (VerificationCodeState::OobVerification, None) => {
                    Err(AssociationError::Encryption(EncryptionError::NoVerificationCode))
                }
                _ => Err(AssociationError::Encryption(EncryptionError::ProtocolError)),
            }
        }
        None => {
            advance(state, PendingCarState::PendingVisual);
            info!("No out-of-band data, announcing visual verification");

            let code = VerificationCode {
                state: VerificationCodeState::VisualVerification,
                payload: None,
            };
            send_handshake(stream, messages::to_vec(&code)?).await?;
            let _ = events.send(AttemptEvent::AuthStringAvailable(pending.visual_code()));

            let reply: VerificationCode = messages::from_slice(&next_handshake_payload(stream).await?)?;
            if reply.state != VerificationCodeState::VisualConfirmation {
                return Err(AssociationError::Encryption(EncryptionError::ProtocolError));
            }

            Ok(pending.notify_confirmed()?)
        }
    }
}

/// The first encrypted message after establishment carries the vehicle's
/// 128-bit device id.
async fn receive_peer_device_id<T: TransportLink>(
    stream: &mut MessageStream<T>,
) -> Result<Uuid, AssociationError> {
    loop {
        match stream.next_event().await? {
            StreamEvent::MessageReceived(message) => match message.operation {
                OperationType::ClientMessage => {
                    let bytes: [u8; 16] = message
                        .payload
                        .as_slice()
                        .try_into()
                        .map_err(|_| AssociationError::InvalidDeviceId)?;

                    return Ok(Uuid::from_bytes(bytes));
                }
                // Late handshake traffic is out of state; drop it.
                OperationType::EncryptionHandshake => {
                    debug!("dropping handshake message while awaiting device identity");
                }
                _ => return Err(AssociationError::UnexpectedOperation),
            },
            StreamEvent::Disconnected => return Err(AssociationError::Disconnected),
        }
    }
}
