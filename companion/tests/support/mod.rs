//! A scripted head unit driving the vehicle side of the companion protocol
//! over the in-memory transport. The key schedule is implemented here
//! independently of the library, so both protocol ends are checked against
//! each other.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Key, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::PublicKey;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use uuid::Uuid;

use companion::connection::{DeviceScanner, DiscoveredDevice, ScanError, ScanFilter};
use companion::encryption::{
    ClientFinish, ClientInit, ResumeRequest, ResumeResponse, SessionKey, VehicleResponse,
};
use companion::negotiation::version::MessageVersion;
use companion::stream::{MessageStream, StreamEvent, StreamMessage};
use companion::transport::memory::MemoryTransportLink;
use companion::transport::{TransportConnector, TransportError, TransportEvent, TransportLink};
use companion_common::messages::{
    self, CapabilitiesExchange, OobChannelType, OperationType, VerificationCode,
    VerificationCodeState, VersionExchange,
};

// Key-schedule labels; the vehicle side derives everything from scratch so
// the mobile implementation is checked against an independent one.
const ASSOCIATION_INFO: &[u8] = b"companion-association-keys";
const RESUME_INFO: &[u8] = b"companion-resume-keys";
const MOBILE_RESUME_CONTEXT: &[u8] = b"companion-resume-mobile";
const VEHICLE_RESUME_CONTEXT: &[u8] = b"companion-resume-vehicle";

/// Mirror of the resume material the library persists.
#[derive(Serialize, Deserialize)]
pub struct ResumeBlob {
    pub secret: ByteBuf,
}

pub fn resume_blob(secret: [u8; 32]) -> Vec<u8> {
    messages::to_vec(&ResumeBlob {
        secret: ByteBuf::from(secret.to_vec()),
    })
    .unwrap()
}

pub fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).unwrap();
    for part in parts {
        mac.update(part);
    }

    mac.finalize().into_bytes().into()
}

pub struct VehicleKeys {
    pub session_key: [u8; 32],
    pub verification_token: [u8; 32],
    pub resume_secret: [u8; 32],
}

fn derive_association_keys(shared: &[u8], client_nonce: &[u8], vehicle_nonce: &[u8]) -> VehicleKeys {
    let mut salt = client_nonce.to_vec();
    salt.extend_from_slice(vehicle_nonce);

    let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut okm = [0u8; 96];
    hkdf.expand(ASSOCIATION_INFO, &mut okm).unwrap();

    VehicleKeys {
        session_key: okm[..32].try_into().unwrap(),
        verification_token: okm[32..64].try_into().unwrap(),
        resume_secret: okm[64..].try_into().unwrap(),
    }
}

fn derive_resume_keys(secret: &[u8; 32], client_nonce: &[u8], vehicle_nonce: &[u8]) -> ([u8; 32], [u8; 32]) {
    let mut salt = client_nonce.to_vec();
    salt.extend_from_slice(vehicle_nonce);

    let hkdf = Hkdf::<Sha256>::new(Some(&salt), secret);
    let mut okm = [0u8; 64];
    hkdf.expand(RESUME_INFO, &mut okm).unwrap();

    (okm[..32].try_into().unwrap(), okm[32..].try_into().unwrap())
}

/// Out-of-band material as the vehicle holds it: the IV roles are swapped
/// relative to the phone.
#[derive(Clone)]
pub struct VehicleOobData {
    pub key: [u8; 16],
    pub vehicle_iv: [u8; 12],
    pub phone_iv: [u8; 12],
}

impl VehicleOobData {
    fn cipher(&self) -> Aes128Gcm {
        Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(&self.key))
    }

    pub fn encrypt(&self, token: &[u8]) -> Vec<u8> {
        self.cipher().encrypt(Nonce::from_slice(&self.vehicle_iv), token).unwrap()
    }

    pub fn decrypt_phone(&self, ciphertext: &[u8]) -> Vec<u8> {
        self.cipher().decrypt(Nonce::from_slice(&self.phone_iv), ciphertext).unwrap()
    }
}

/// How the scripted vehicle verifies the handshake.
pub enum VehicleVerification {
    /// Security version 2: nothing on the wire.
    Silent,
    /// Security version 3 visual fallback: the phone confirms locally.
    VisualV3,
    /// Security version 4 visual: answer the announcement with a
    /// confirmation.
    VisualV4,
    /// Out-of-band tokens, raw for version 3.
    OobV3(VehicleOobData),
    /// Out-of-band tokens inside the explicit signalling message.
    OobV4(VehicleOobData),
}

pub struct VehicleOptions {
    pub version_reply: VersionExchange,
    /// `Some` when a capability exchange is expected (security >= 3).
    pub capability_reply: Option<Vec<OobChannelType>>,
    pub message_version: MessageVersion,
    pub verification: VehicleVerification,
    pub device_id: Uuid,
}

pub struct AssociationOutcome {
    pub keys: VehicleKeys,
    pub phone_device_id: Uuid,
    pub phone_identification_key: [u8; 32],
    /// Stream left in the established state, for application traffic.
    pub stream: MessageStream<MemoryTransportLink>,
}

pub fn vehicle_versions(min_msg: u32, max_msg: u32, min_sec: u32, max_sec: u32) -> VersionExchange {
    VersionExchange {
        min_message_version: min_msg,
        max_message_version: max_msg,
        min_security_version: min_sec,
        max_security_version: max_sec,
    }
}

async fn wait_connected(events: &mut mpsc::UnboundedReceiver<TransportEvent>) {
    loop {
        match events.recv().await.expect("transport events closed") {
            TransportEvent::Connected => return,
            TransportEvent::MessageReceived(_) => panic!("frame before connect completed"),
            other => panic!("unexpected transport event {other:?}"),
        }
    }
}

async fn next_frame(events: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<u8> {
    loop {
        match events.recv().await.expect("transport events closed") {
            TransportEvent::MessageReceived(frame) => return frame,
            TransportEvent::Connected => continue,
            other => panic!("unexpected transport event {other:?}"),
        }
    }
}

async fn recv_handshake(stream: &mut MessageStream<MemoryTransportLink>) -> Vec<u8> {
    match stream.next_event().await.expect("stream failed") {
        StreamEvent::MessageReceived(message) => {
            assert_eq!(message.operation, OperationType::EncryptionHandshake);
            message.payload
        }
        StreamEvent::Disconnected => panic!("peer disconnected mid-handshake"),
    }
}

async fn recv_client_message(stream: &mut MessageStream<MemoryTransportLink>) -> StreamMessage {
    match stream.next_event().await.expect("stream failed") {
        StreamEvent::MessageReceived(message) => {
            assert_eq!(message.operation, OperationType::ClientMessage);
            message
        }
        StreamEvent::Disconnected => panic!("peer disconnected"),
    }
}

async fn send_handshake(stream: &mut MessageStream<MemoryTransportLink>, payload: Vec<u8>) {
    stream
        .send(StreamMessage {
            operation: OperationType::EncryptionHandshake,
            payload,
            is_payload_encrypted: false,
            original_size: 0,
            recipient: None,
        })
        .await
        .expect("handshake send failed");
}

/// Runs the vehicle side of a complete association.
pub async fn run_vehicle_association(mut link: MemoryTransportLink, options: VehicleOptions) -> AssociationOutcome {
    let mut events = link.take_events().unwrap();
    link.connect().await.unwrap();
    wait_connected(&mut events).await;

    // Version exchange: the phone talks first.
    let _phone_versions: VersionExchange = messages::from_slice(&next_frame(&mut events).await).unwrap();
    link.send(&messages::to_vec(&options.version_reply).unwrap()).await.unwrap();

    if let Some(channels) = &options.capability_reply {
        let _phone_channels: CapabilitiesExchange =
            messages::from_slice(&next_frame(&mut events).await).unwrap();
        let reply = CapabilitiesExchange {
            supported_oob_channels: channels.clone(),
        };
        link.send(&messages::to_vec(&reply).unwrap()).await.unwrap();
    }

    let mut stream = MessageStream::new(link, events, options.message_version, 1024);

    // Three-message handshake, vehicle side.
    let init: ClientInit = messages::from_slice(&recv_handshake(&mut stream).await).unwrap();

    let vehicle_secret = EphemeralSecret::random(&mut OsRng);
    let mut vehicle_nonce = [0u8; 32];
    OsRng.fill_bytes(&mut vehicle_nonce);
    let response = VehicleResponse {
        public_key: ByteBuf::from(
            vehicle_secret.public_key().to_encoded_point(false).as_bytes().to_vec(),
        ),
        nonce: ByteBuf::from(vehicle_nonce.to_vec()),
    };
    send_handshake(&mut stream, messages::to_vec(&response).unwrap()).await;

    let finish: ClientFinish = messages::from_slice(&recv_handshake(&mut stream).await).unwrap();

    // The commitment must open to the finish message.
    let mut commitment_input = finish.public_key.to_vec();
    commitment_input.extend_from_slice(&finish.nonce);
    let opened: [u8; 32] = Sha256::digest(&commitment_input).into();
    assert_eq!(init.commitment.as_slice(), opened.as_slice(), "commitment mismatch");

    let phone_public = PublicKey::from_sec1_bytes(&finish.public_key).unwrap();
    let shared = vehicle_secret.diffie_hellman(&phone_public);
    let keys = derive_association_keys(
        shared.raw_secret_bytes().as_slice(),
        &finish.nonce,
        &vehicle_nonce,
    );

    match &options.verification {
        VehicleVerification::Silent | VehicleVerification::VisualV3 => (),
        VehicleVerification::VisualV4 => {
            let code: VerificationCode = messages::from_slice(&recv_handshake(&mut stream).await).unwrap();
            assert_eq!(code.state, VerificationCodeState::VisualVerification);
            assert!(code.payload.is_none());

            let confirmation = VerificationCode {
                state: VerificationCodeState::VisualConfirmation,
                payload: None,
            };
            send_handshake(&mut stream, messages::to_vec(&confirmation).unwrap()).await;
        }
        VehicleVerification::OobV3(oob) => {
            let phone_token = oob.decrypt_phone(&recv_handshake(&mut stream).await);
            assert_eq!(phone_token, keys.verification_token);

            send_handshake(&mut stream, oob.encrypt(&keys.verification_token)).await;
        }
        VehicleVerification::OobV4(oob) => {
            let code: VerificationCode = messages::from_slice(&recv_handshake(&mut stream).await).unwrap();
            assert_eq!(code.state, VerificationCodeState::OobVerification);
            let phone_token = oob.decrypt_phone(&code.payload.expect("token payload missing"));
            assert_eq!(phone_token, keys.verification_token);

            let reply = VerificationCode {
                state: VerificationCodeState::OobVerification,
                payload: Some(ByteBuf::from(oob.encrypt(&keys.verification_token))),
            };
            send_handshake(&mut stream, messages::to_vec(&reply).unwrap()).await;
        }
    }

    // Session unlocked: identity exchange, vehicle first.
    stream.set_encryption_key(&SessionKey::from_bytes(keys.session_key));
    stream
        .send(StreamMessage::encrypted(
            OperationType::ClientMessage,
            options.device_id.as_bytes().to_vec(),
            None,
        ))
        .await
        .unwrap();

    let identity = recv_client_message(&mut stream).await;
    assert_eq!(identity.payload.len(), 16 + 32, "identity payload length");
    let phone_device_id = Uuid::from_slice(&identity.payload[..16]).unwrap();
    let phone_identification_key: [u8; 32] = identity.payload[16..].try_into().unwrap();

    AssociationOutcome {
        keys,
        phone_device_id,
        phone_identification_key,
        stream,
    }
}

pub struct ReconnectionOptions {
    pub version_reply: VersionExchange,
    pub message_version: MessageVersion,
    pub resume_secret: [u8; 32],
    pub identification_key: [u8; 32],
    /// Off when the script plays a vehicle holding the wrong secret.
    pub verify_phone_proof: bool,
}

pub struct ReconnectionOutcome {
    pub session_key: [u8; 32],
    pub next_resume_secret: [u8; 32],
    pub stream: MessageStream<MemoryTransportLink>,
}

/// Runs the vehicle side of a reconnection, including the identification
/// challenge.
pub async fn run_vehicle_reconnection(
    mut link: MemoryTransportLink,
    options: ReconnectionOptions,
) -> ReconnectionOutcome {
    let mut events = link.take_events().unwrap();
    link.connect().await.unwrap();
    wait_connected(&mut events).await;

    let _phone_versions: VersionExchange = messages::from_slice(&next_frame(&mut events).await).unwrap();
    link.send(&messages::to_vec(&options.version_reply).unwrap()).await.unwrap();

    let mut stream = MessageStream::new(link, events, options.message_version, 1024);

    // Resume exchange: verify the phone's proof, answer with our own.
    let request: ResumeRequest = messages::from_slice(&recv_handshake(&mut stream).await).unwrap();
    if options.verify_phone_proof {
        assert_eq!(
            request.proof.as_slice(),
            hmac_sha256(&options.resume_secret, &[MOBILE_RESUME_CONTEXT, &request.nonce]).as_slice(),
            "phone resume proof mismatch"
        );
    }

    let mut vehicle_nonce = [0u8; 32];
    OsRng.fill_bytes(&mut vehicle_nonce);
    let proof = hmac_sha256(
        &options.resume_secret,
        &[VEHICLE_RESUME_CONTEXT, &request.nonce, &vehicle_nonce],
    );
    let response = ResumeResponse {
        nonce: ByteBuf::from(vehicle_nonce.to_vec()),
        proof: ByteBuf::from(proof.to_vec()),
    };
    send_handshake(&mut stream, messages::to_vec(&response).unwrap()).await;

    let (session_key, next_resume_secret) =
        derive_resume_keys(&options.resume_secret, &request.nonce, &vehicle_nonce);

    // Identification challenge: salt response followed by a fresh challenge.
    let challenge_message = recv_handshake(&mut stream).await;
    assert_eq!(challenge_message.len(), 32 + 16, "challenge message length");
    let challenge: [u8; 16] = challenge_message[32..].try_into().unwrap();
    send_handshake(
        &mut stream,
        hmac_sha256(&options.identification_key, &[&challenge]).to_vec(),
    )
    .await;

    stream.set_encryption_key(&SessionKey::from_bytes(session_key));

    ReconnectionOutcome {
        session_key,
        next_resume_secret,
        stream,
    }
}

/// Scanner fed from a test channel.
pub struct ChannelScanner {
    events: Option<mpsc::UnboundedReceiver<DiscoveredDevice>>,
}

impl ChannelScanner {
    pub fn new() -> (Self, mpsc::UnboundedSender<DiscoveredDevice>) {
        let (tx, rx) = mpsc::unbounded_channel();

        (ChannelScanner { events: Some(rx) }, tx)
    }
}

impl DeviceScanner for ChannelScanner {
    fn start_scan(&mut self, _filter: &ScanFilter) -> Result<(), ScanError> {
        Ok(())
    }

    fn stop_scan(&mut self) {}

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<DiscoveredDevice>> {
        self.events.take()
    }
}

/// Connector handing out pre-arranged in-memory links by MAC address.
/// Clones share the same link table, so links can be added while the
/// connection manager owns the connector.
#[derive(Default, Clone)]
pub struct TestConnector {
    links: Arc<Mutex<HashMap<String, VecDeque<MemoryTransportLink>>>>,
}

impl TestConnector {
    pub fn add_link(&self, mac_address: &str, link: MemoryTransportLink) {
        self.links
            .lock()
            .unwrap()
            .entry(mac_address.to_string())
            .or_default()
            .push_back(link);
    }
}

impl TransportConnector for TestConnector {
    type Link = MemoryTransportLink;

    async fn open_link(&self, device: &DiscoveredDevice) -> Result<Self::Link, TransportError> {
        self.links
            .lock()
            .unwrap()
            .get_mut(&device.mac_address)
            .and_then(VecDeque::pop_front)
            .ok_or(TransportError::ConnectFailed)
    }

    async fn is_classic_connected(&self, _mac_address: &str) -> bool {
        false
    }

    async fn bonded_devices(&self) -> Vec<DiscoveredDevice> {
        Vec::new()
    }
}
