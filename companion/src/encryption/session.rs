use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::PublicKey;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use sha2::Sha256;
use tracing::debug;
use zeroize::Zeroizing;

use companion_common::messages;
use companion_common::utils;

use super::{EncryptionError, SessionKey};

pub const VERIFICATION_TOKEN_LENGTH: usize = 32;

const PROTOCOL_VERSION: u32 = 1;
const NONCE_LENGTH: usize = 32;
const RESUME_SECRET_LENGTH: usize = 32;

// Domain separation labels for key derivation and resume proofs.
const ASSOCIATION_INFO: &[u8] = b"companion-association-keys";
const RESUME_INFO: &[u8] = b"companion-resume-keys";
const MOBILE_RESUME_CONTEXT: &[u8] = b"companion-resume-mobile";
const VEHICLE_RESUME_CONTEXT: &[u8] = b"companion-resume-vehicle";

// Handshake wire schema. The structs are public so that peers and test
// fixtures can speak the vehicle side of the exchange.

/// First handshake message: the mobile side commits to its public key and
/// nonce before the vehicle reveals anything.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClientInit {
    pub version: u32,
    pub commitment: ByteBuf,
}

/// Second handshake message: the vehicle's ephemeral public key and nonce.
#[derive(Debug, Serialize, Deserialize)]
pub struct VehicleResponse {
    pub public_key: ByteBuf,
    pub nonce: ByteBuf,
}

/// Third handshake message: the mobile side opens its commitment.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClientFinish {
    pub public_key: ByteBuf,
    pub nonce: ByteBuf,
}

/// Reconnection request: a fresh nonce plus proof of the stored resume
/// secret.
#[derive(Debug, Serialize, Deserialize)]
pub struct ResumeRequest {
    pub nonce: ByteBuf,
    pub proof: ByteBuf,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResumeResponse {
    pub nonce: ByteBuf,
    pub proof: ByteBuf,
}

#[derive(Serialize, Deserialize)]
struct ResumeBlob {
    secret: ByteBuf,
}

/// Outcome of a completed exchange: the session key for the message stream
/// and the opaque material that allows the next reconnection.
pub struct EstablishedSession {
    pub session_key: SessionKey,
    pub resume_blob: Vec<u8>,
}

struct DerivedKeys {
    session_key: SessionKey,
    verification_token: [u8; VERIFICATION_TOKEN_LENGTH],
    resume_secret: Zeroizing<[u8; RESUME_SECRET_LENGTH]>,
}

/// Mobile side of the fresh association handshake.
pub struct Handshake {
    secret: EphemeralSecret,
    nonce: [u8; NONCE_LENGTH],
}

impl Handshake {
    /// Starts the exchange, returning the encoded [`ClientInit`] to send.
    pub fn start() -> Result<(Self, Vec<u8>), EncryptionError> {
        let secret = EphemeralSecret::random(&mut OsRng);
        let nonce = utils::random_array::<NONCE_LENGTH>();

        let public_key = secret.public_key().to_encoded_point(false);
        let mut commitment_input = public_key.as_bytes().to_vec();
        commitment_input.extend_from_slice(&nonce);

        let init = ClientInit {
            version: PROTOCOL_VERSION,
            commitment: ByteBuf::from(utils::sha256(&commitment_input).to_vec()),
        };

        Ok((Handshake { secret, nonce }, messages::to_vec(&init)?))
    }

    /// Processes the vehicle's response and opens the commitment. Returns the
    /// verification state and the encoded [`ClientFinish`] to send.
    pub fn handle_vehicle_response(
        self,
        payload: &[u8],
    ) -> Result<(PendingVerification, Vec<u8>), EncryptionError> {
        let response: VehicleResponse = messages::from_slice(payload)?;

        let vehicle_public = PublicKey::from_sec1_bytes(&response.public_key)
            .map_err(|_| EncryptionError::InvalidPublicKey)?;
        let vehicle_nonce: [u8; NONCE_LENGTH] = response
            .nonce
            .as_slice()
            .try_into()
            .map_err(|_| EncryptionError::ProtocolError)?;

        let shared_secret = self.secret.diffie_hellman(&vehicle_public);
        let keys = derive_association_keys(
            shared_secret.raw_secret_bytes().as_slice(),
            &self.nonce,
            &vehicle_nonce,
        )?;
        debug!("handshake keys derived, awaiting verification");

        let finish = ClientFinish {
            public_key: ByteBuf::from(self.secret.public_key().to_encoded_point(false).as_bytes().to_vec()),
            nonce: ByteBuf::from(self.nonce.to_vec()),
        };

        Ok((PendingVerification { keys }, messages::to_vec(&finish)?))
    }
}

/// A completed exchange waiting for its result to be verified, either
/// visually or through out-of-band key material.
pub struct PendingVerification {
    keys: DerivedKeys,
}

impl PendingVerification {
    /// Full token for out-of-band comparison.
    pub fn verification_token(&self) -> &[u8; VERIFICATION_TOKEN_LENGTH] {
        &self.keys.verification_token
    }

    /// Short authentication string for on-screen comparison.
    pub fn visual_code(&self) -> String {
        let token = &self.keys.verification_token;
        let value = u32::from_be_bytes([token[0], token[1], token[2], token[3]]);

        format!("{:06}", value % 1_000_000)
    }

    /// Confirms the verification and unlocks the session.
    pub fn notify_confirmed(self) -> Result<EstablishedSession, EncryptionError> {
        let resume_blob = encode_resume_blob(&self.keys.resume_secret)?;

        Ok(EstablishedSession {
            session_key: self.keys.session_key,
            resume_blob,
        })
    }
}

/// Mobile side of the reconnection exchange: both sides prove possession of
/// the previous resume secret and derive a fresh session key.
pub struct ResumeHandshake {
    secret: Zeroizing<[u8; RESUME_SECRET_LENGTH]>,
    nonce: [u8; NONCE_LENGTH],
}

impl ResumeHandshake {
    /// Starts the exchange from a stored resume blob, returning the encoded
    /// [`ResumeRequest`] to send.
    pub fn start(resume_blob: &[u8]) -> Result<(Self, Vec<u8>), EncryptionError> {
        let blob: ResumeBlob =
            messages::from_slice(resume_blob).map_err(|_| EncryptionError::InvalidResumeBlob)?;
        let secret: [u8; RESUME_SECRET_LENGTH] = blob
            .secret
            .as_slice()
            .try_into()
            .map_err(|_| EncryptionError::InvalidResumeBlob)?;
        let secret = Zeroizing::new(secret);

        let nonce = utils::random_array::<NONCE_LENGTH>();
        let request = ResumeRequest {
            nonce: ByteBuf::from(nonce.to_vec()),
            proof: ByteBuf::from(hmac_sha256(&*secret, &[MOBILE_RESUME_CONTEXT, &nonce]).to_vec()),
        };

        Ok((ResumeHandshake { secret, nonce }, messages::to_vec(&request)?))
    }

    /// Verifies the vehicle's proof and derives the fresh session key.
    pub fn handle_vehicle_response(self, payload: &[u8]) -> Result<EstablishedSession, EncryptionError> {
        let response: ResumeResponse = messages::from_slice(payload)?;
        let vehicle_nonce: [u8; NONCE_LENGTH] = response
            .nonce
            .as_slice()
            .try_into()
            .map_err(|_| EncryptionError::ProtocolError)?;

        // The vehicle's proof covers both nonces, so it is fresh.
        let mut mac = hmac_sha256_mac(&*self.secret);
        mac.update(VEHICLE_RESUME_CONTEXT);
        mac.update(&self.nonce);
        mac.update(&vehicle_nonce);
        mac.verify_slice(&response.proof)
            .map_err(|_| EncryptionError::SessionKeyMismatch)?;

        let (session_key, next_secret) = derive_resume_keys(&*self.secret, &self.nonce, &vehicle_nonce)?;
        debug!("session resumed from stored material");

        Ok(EstablishedSession {
            session_key,
            resume_blob: encode_resume_blob(&next_secret)?,
        })
    }
}

fn encode_resume_blob(secret: &[u8; RESUME_SECRET_LENGTH]) -> Result<Vec<u8>, EncryptionError> {
    Ok(messages::to_vec(&ResumeBlob {
        secret: ByteBuf::from(secret.to_vec()),
    })?)
}

fn derive_association_keys(
    shared_secret: &[u8],
    client_nonce: &[u8; NONCE_LENGTH],
    vehicle_nonce: &[u8; NONCE_LENGTH],
) -> Result<DerivedKeys, EncryptionError> {
    let mut salt = [0u8; 2 * NONCE_LENGTH];
    salt[..NONCE_LENGTH].copy_from_slice(client_nonce);
    salt[NONCE_LENGTH..].copy_from_slice(vehicle_nonce);

    let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared_secret);
    let mut okm = Zeroizing::new([0u8; 96]);
    hkdf.expand(ASSOCIATION_INFO, &mut okm[..])
        .map_err(|_| EncryptionError::KeyDerivation)?;

    let mut session_key = [0u8; 32];
    let mut verification_token = [0u8; VERIFICATION_TOKEN_LENGTH];
    let mut resume_secret = Zeroizing::new([0u8; RESUME_SECRET_LENGTH]);
    session_key.copy_from_slice(&okm[..32]);
    verification_token.copy_from_slice(&okm[32..64]);
    resume_secret.copy_from_slice(&okm[64..]);

    Ok(DerivedKeys {
        session_key: SessionKey::from_bytes(session_key),
        verification_token,
        resume_secret,
    })
}

fn derive_resume_keys(
    secret: &[u8; RESUME_SECRET_LENGTH],
    client_nonce: &[u8; NONCE_LENGTH],
    vehicle_nonce: &[u8; NONCE_LENGTH],
) -> Result<(SessionKey, Zeroizing<[u8; RESUME_SECRET_LENGTH]>), EncryptionError> {
    let mut salt = [0u8; 2 * NONCE_LENGTH];
    salt[..NONCE_LENGTH].copy_from_slice(client_nonce);
    salt[NONCE_LENGTH..].copy_from_slice(vehicle_nonce);

    let hkdf = Hkdf::<Sha256>::new(Some(&salt), secret);
    let mut okm = Zeroizing::new([0u8; 64]);
    hkdf.expand(RESUME_INFO, &mut okm[..])
        .map_err(|_| EncryptionError::KeyDerivation)?;

    let mut session_key = [0u8; 32];
    let mut next_secret = Zeroizing::new([0u8; RESUME_SECRET_LENGTH]);
    session_key.copy_from_slice(&okm[..32]);
    next_secret.copy_from_slice(&okm[32..]);

    Ok((SessionKey::from_bytes(session_key), next_secret))
}

fn hmac_sha256_mac(key: &[u8]) -> Hmac<Sha256> {
    Hmac::<Sha256>::new_from_slice(key).expect("HMAC can take a key of any size")
}

fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut mac = hmac_sha256_mac(key);
    for part in parts {
        mac.update(part);
    }

    mac.finalize().into_bytes().into()
}
