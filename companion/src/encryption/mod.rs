//! The authenticated key exchange that secures a session with a vehicle.
//!
//! A fresh association runs a three-message ECDH handshake whose result is
//! confirmed either visually (short code on both screens) or through
//! out-of-band key material. Reconnections skip the exchange and prove
//! possession of the previous session's resume secret instead.

mod session;

pub use session::{
    ClientFinish, ClientInit, EstablishedSession, Handshake, PendingVerification, ResumeHandshake,
    ResumeRequest, ResumeResponse, VehicleResponse, VERIFICATION_TOKEN_LENGTH,
};

use std::fmt;

use aes_gcm::aead::KeyInit;
use aes_gcm::{Aes256Gcm, Key};
use zeroize::{Zeroize, ZeroizeOnDrop};

use companion_common::messages::CodecError;

#[derive(Debug, thiserror::Error)]
pub enum EncryptionError {
    #[error("no verification code is pending confirmation")]
    NoVerificationCode,
    #[error("peer could not prove possession of the previous session key")]
    SessionKeyMismatch,
    #[error("unexpected handshake message in the current state")]
    ProtocolError,
    #[error("peer sent an invalid public key")]
    InvalidPublicKey,
    #[error("stored session is invalid")]
    InvalidResumeBlob,
    #[error("session key derivation failed")]
    KeyDerivation,
    #[error("could not encode or decode handshake message: {0}")]
    Codec(#[from] CodecError),
}

/// Symmetric key protecting one session's application traffic.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; 32]);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        SessionKey(bytes)
    }

    pub(crate) fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Key material stays out of logs.
        f.debug_struct("SessionKey").finish_non_exhaustive()
    }
}
