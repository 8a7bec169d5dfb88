#[cfg(any(test, feature = "software"))]
pub mod software;

#[derive(Debug, thiserror::Error)]
pub enum KeystoreError {
    #[error("key store operation failed: {0}")]
    KeyStore(String),
    #[error("could not encrypt value")]
    Encryption,
    #[error("could not decrypt value")]
    Decryption,
}

/// Contract for symmetric encryption keys that are held by a platform backing
/// store from which they cannot be extracted. Keys are constructed by
/// identifier; if no key exists under that identifier yet, a random one is
/// created and stored on first use.
///
/// Implementations must produce self-contained ciphertexts: everything needed
/// to decrypt (apart from the key itself) is carried in the returned bytes.
pub trait PlatformEncryptionKey {
    fn encryption_key(identifier: &str) -> Result<Self, KeystoreError>
    where
        Self: Sized;

    fn encrypt(&self, msg: &[u8]) -> Result<Vec<u8>, KeystoreError>;
    fn decrypt(&self, msg: &[u8]) -> Result<Vec<u8>, KeystoreError>;
}
