use std::error::Error;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Nonce};

use crate::utils;

const NONCE_LENGTH: usize = 12;

/// Contract for symmetric encryption with self-contained ciphertexts: the
/// nonce travels as a prefix of the returned bytes, so a ciphertext can be
/// decrypted with nothing but the key.
pub trait EncryptionKey {
    type Error: Error + Send + Sync + 'static;

    async fn encrypt(&self, msg: &[u8]) -> Result<Vec<u8>, Self::Error>;
    async fn decrypt(&self, msg: &[u8]) -> Result<Vec<u8>, Self::Error>;
}

/// Contract for encryption keys that live in secure hardware, e.g. Android's
/// TEE/StrongBox or Apple's SE. Only the platform crates implement this.
pub trait SecureEncryptionKey: EncryptionKey {}

// `Aes256Gcm` is an `EncryptionKey` but not a `SecureEncryptionKey`: session
// keys derived from the encryption handshake are held in memory only.
impl EncryptionKey for Aes256Gcm {
    type Error = aes_gcm::Error;

    async fn encrypt(&self, msg: &[u8]) -> Result<Vec<u8>, Self::Error> {
        // Generate a random nonce, unique per message.
        let nonce_bytes = utils::random_array::<NONCE_LENGTH>();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let encrypted_msg = <Aes256Gcm as Aead>::encrypt(self, nonce, msg)?;

        // concatenate nonce with encrypted payload
        let result = nonce_bytes.into_iter().chain(encrypted_msg).collect();

        Ok(result)
    }

    async fn decrypt(&self, msg: &[u8]) -> Result<Vec<u8>, Self::Error> {
        if msg.len() < NONCE_LENGTH {
            return Err(aes_gcm::Error);
        }

        // Re-create the nonce from the first 12 bytes.
        let nonce = Nonce::from_slice(&msg[..NONCE_LENGTH]);

        <Aes256Gcm as Aead>::decrypt(self, nonce, &msg[NONCE_LENGTH..])
    }
}
