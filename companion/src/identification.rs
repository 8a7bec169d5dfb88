//! Reconnection identification without stable identifiers.
//!
//! An associated vehicle never advertises its identity directly. Instead it
//! advertises a fresh salt together with a truncated HMAC of that salt under
//! the per-peer identification key; only a phone holding the key can tell
//! which of its associated cars is in range.

use std::fmt;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

use companion_common::utils;

/// Advertised service data length: truncated HMAC plus salt.
pub const ADVERTISED_DATA_LENGTH: usize = TRUNCATED_HMAC_LENGTH + SALT_LENGTH;
pub const TRUNCATED_HMAC_LENGTH: usize = 3;
pub const SALT_LENGTH: usize = 8;
pub const CHALLENGE_LENGTH: usize = 16;
pub const IDENTIFICATION_KEY_LENGTH: usize = 32;

// The advertised salt is zero-padded to this length before hashing.
const PADDED_SALT_LENGTH: usize = 16;

/// Per-peer symmetric secret backing the advertisement HMAC. Generated by
/// the phone during association and shared with the vehicle.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct IdentificationKey([u8; IDENTIFICATION_KEY_LENGTH]);

impl IdentificationKey {
    /// Generates a fresh cryptographically strong key.
    pub fn generate() -> Self {
        IdentificationKey(utils::random_array())
    }

    pub fn from_bytes(bytes: [u8; IDENTIFICATION_KEY_LENGTH]) -> Self {
        IdentificationKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; IDENTIFICATION_KEY_LENGTH] {
        &self.0
    }

    /// Response to an advertised salt: HMAC-SHA256 over the salt zero-padded
    /// to 16 bytes.
    pub fn salt_response(&self, salt: &[u8; SALT_LENGTH]) -> [u8; 32] {
        let mut padded = [0u8; PADDED_SALT_LENGTH];
        padded[..SALT_LENGTH].copy_from_slice(salt);

        self.hmac(&padded)
    }

    /// Response to a connection-time challenge.
    pub fn challenge_response(&self, challenge: &Challenge) -> [u8; 32] {
        self.hmac(&challenge.0)
    }

    /// Constant-time check of a peer's challenge response.
    pub fn verify_challenge_response(&self, challenge: &Challenge, response: &[u8]) -> bool {
        let mut mac =
            Hmac::<Sha256>::new_from_slice(&self.0).expect("HMAC can take a key of any size");
        mac.update(&challenge.0);

        mac.verify_slice(response).is_ok()
    }

    fn hmac(&self, message: &[u8]) -> [u8; 32] {
        let mut mac =
            Hmac::<Sha256>::new_from_slice(&self.0).expect("HMAC can take a key of any size");
        mac.update(message);

        mac.finalize().into_bytes().into()
    }
}

impl fmt::Debug for IdentificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Key material stays out of logs.
        f.debug_struct("IdentificationKey").finish_non_exhaustive()
    }
}

/// Parsed reconnection advertisement: `truncated_hmac(3) || salt(8)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvertisedData {
    truncated_hmac: [u8; TRUNCATED_HMAC_LENGTH],
    salt: [u8; SALT_LENGTH],
}

impl AdvertisedData {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != ADVERTISED_DATA_LENGTH {
            return None;
        }

        let mut truncated_hmac = [0u8; TRUNCATED_HMAC_LENGTH];
        let mut salt = [0u8; SALT_LENGTH];
        truncated_hmac.copy_from_slice(&bytes[..TRUNCATED_HMAC_LENGTH]);
        salt.copy_from_slice(&bytes[TRUNCATED_HMAC_LENGTH..]);

        Some(AdvertisedData { truncated_hmac, salt })
    }

    /// Builds the advertisement a vehicle holding `key` would produce.
    pub fn advertise(key: &IdentificationKey, salt: [u8; SALT_LENGTH]) -> Self {
        let response = key.salt_response(&salt);
        let mut truncated_hmac = [0u8; TRUNCATED_HMAC_LENGTH];
        truncated_hmac.copy_from_slice(&response[..TRUNCATED_HMAC_LENGTH]);

        AdvertisedData { truncated_hmac, salt }
    }

    pub fn salt(&self) -> &[u8; SALT_LENGTH] {
        &self.salt
    }

    pub fn to_bytes(self) -> [u8; ADVERTISED_DATA_LENGTH] {
        let mut bytes = [0u8; ADVERTISED_DATA_LENGTH];
        bytes[..TRUNCATED_HMAC_LENGTH].copy_from_slice(&self.truncated_hmac);
        bytes[TRUNCATED_HMAC_LENGTH..].copy_from_slice(&self.salt);

        bytes
    }

    /// Whether this advertisement was produced under `key`.
    pub fn matches(&self, key: &IdentificationKey) -> bool {
        key.salt_response(&self.salt)[..TRUNCATED_HMAC_LENGTH] == self.truncated_hmac
    }
}

/// Returns the first candidate whose identification key matches the
/// advertisement, in iteration order.
pub fn find_match<'a, I>(advertised: &AdvertisedData, candidates: I) -> Option<Uuid>
where
    I: IntoIterator<Item = &'a (Uuid, IdentificationKey)>,
{
    candidates
        .into_iter()
        .find(|(_, key)| advertised.matches(key))
        .map(|(device_id, _)| *device_id)
}

/// A fresh 16-byte random challenge the phone poses to a reconnecting
/// vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Challenge([u8; CHALLENGE_LENGTH]);

impl Challenge {
    pub fn generate() -> Self {
        Challenge(utils::random_array())
    }

    pub fn from_bytes(bytes: [u8; CHALLENGE_LENGTH]) -> Self {
        Challenge(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; CHALLENGE_LENGTH] {
        &self.0
    }
}
