//! Persistence of associated-car records.
//!
//! [`CarStore`] is the seam the connection stack talks to; the default
//! [`DatabaseStorage`] keeps records in SQLite with the secret columns
//! encrypted through a platform keystore key before they reach the database.

pub mod data;

mod database_storage;
mod entity;
#[cfg(any(test, feature = "mock"))]
mod mock;

pub use data::{AssociatedCar, PeerRecord, MAC_ADDRESS_PLACEHOLDER};
pub use database_storage::{DatabaseStorage, SqliteUrl};
#[cfg(any(test, feature = "mock"))]
pub use mock::MockCarStore;

use uuid::Uuid;

use platform_support::keystore::KeystoreError;
use platform_support::utils::UtilitiesError;

use crate::identification::IdentificationKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageState {
    /// No database exists yet.
    Uninitialized,
    /// A database exists on disk but is not opened.
    Unopened,
    Opened,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database is not opened")]
    NotOpened,
    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),
    #[error("could not encrypt or decrypt stored value: {0}")]
    Keystore(#[from] KeystoreError),
    #[error("could not determine storage path: {0}")]
    StoragePath(#[from] UtilitiesError),
    #[error("stored value could not be interpreted: {0}")]
    Corrupted(String),
}

/// Store of associated-car records, keyed by device id.
///
/// Mutations go through a single writer; reads may be concurrent. Secret
/// columns (resume material, identification key) are encrypted at rest.
#[trait_variant::make(CarStore: Send)]
pub trait LocalCarStore {
    async fn state(&self) -> Result<StorageState, StorageError>;

    /// Opens the database, creating it (and migrating an older layout) as
    /// needed.
    async fn open(&mut self) -> Result<(), StorageError>;

    /// Closes the database and removes it from disk.
    async fn clear(&mut self) -> Result<(), StorageError>;

    async fn insert_or_replace(&self, record: PeerRecord) -> Result<(), StorageError>;

    async fn load_all(&self) -> Result<Vec<PeerRecord>, StorageError>;

    async fn load_by_device_id(&self, device_id: Uuid) -> Result<Option<PeerRecord>, StorageError>;

    async fn has_mac_address(&self, mac_address: &str) -> Result<bool, StorageError>;

    async fn load_resume_blob(&self, device_id: Uuid) -> Result<Option<Vec<u8>>, StorageError>;

    /// Replaces the resume material after a successful reconnection.
    async fn update_resume_blob(&self, device_id: Uuid, blob: &[u8]) -> Result<(), StorageError>;

    async fn update_name(&self, device_id: Uuid, name: &str, user_renamed: bool) -> Result<(), StorageError>;

    /// Identification keys of every record, for advertisement matching.
    async fn load_all_identification_keys(&self) -> Result<Vec<(Uuid, IdentificationKey)>, StorageError>;

    /// Removes one record; `false` when there was nothing to remove.
    async fn delete(&self, device_id: Uuid) -> Result<bool, StorageError>;

    /// Removes every record, returning how many were removed.
    async fn delete_all(&self) -> Result<u64, StorageError>;
}
