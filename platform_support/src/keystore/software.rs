use std::collections::HashMap;
use std::sync::Mutex;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use rand::RngCore;

use super::{KeystoreError, PlatformEncryptionKey};

const NONCE_LENGTH: usize = 12;

// static for storing identifier -> encryption key mapping, will only ever grow
static ENCRYPTION_KEYS: Lazy<Mutex<HashMap<String, SoftwareEncryptionKey>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Software stand-in for a hardware backed encryption key. Keys live in a
/// process-global map, which mimics the one-instance-per-identifier guarantee
/// of the real backing stores.
#[derive(Clone)]
pub struct SoftwareEncryptionKey {
    cipher: Aes256Gcm,
}

impl PlatformEncryptionKey for SoftwareEncryptionKey {
    fn encryption_key(identifier: &str) -> Result<Self, KeystoreError> {
        let mut encryption_keys = ENCRYPTION_KEYS
            .lock()
            .map_err(|_| KeystoreError::KeyStore("poisoned key map".to_string()))?;

        // insert a new random key, if one is not present for this identifier
        let key = encryption_keys.entry(identifier.to_string()).or_insert_with(|| {
            let key = Aes256Gcm::generate_key(&mut OsRng);

            SoftwareEncryptionKey {
                cipher: Aes256Gcm::new(&key),
            }
        });

        Ok(key.clone())
    }

    fn encrypt(&self, msg: &[u8]) -> Result<Vec<u8>, KeystoreError> {
        // Generate a random nonce, unique per message.
        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let encrypted_msg = self
            .cipher
            .encrypt(nonce, msg)
            .map_err(|_| KeystoreError::Encryption)?;

        // concatenate nonce with encrypted payload
        let result = nonce_bytes.into_iter().chain(encrypted_msg).collect();

        Ok(result)
    }

    fn decrypt(&self, msg: &[u8]) -> Result<Vec<u8>, KeystoreError> {
        if msg.len() < NONCE_LENGTH {
            return Err(KeystoreError::Decryption);
        }

        // Re-create the nonce from the first 12 bytes.
        let nonce = Nonce::from_slice(&msg[..NONCE_LENGTH]);

        self.cipher
            .decrypt(nonce, &msg[NONCE_LENGTH..])
            .map_err(|_| KeystoreError::Decryption)
    }
}
