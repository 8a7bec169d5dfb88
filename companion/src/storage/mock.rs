use std::collections::HashMap;
use std::sync::Mutex;

use uuid::Uuid;

use crate::identification::IdentificationKey;

use super::{CarStore, PeerRecord, StorageError, StorageState};

/// In-memory [`CarStore`] for tests.
#[derive(Default)]
pub struct MockCarStore {
    state: Mutex<Option<StorageState>>,
    records: Mutex<HashMap<Uuid, PeerRecord>>,
}

impl MockCarStore {
    /// A store in the given state, pre-seeded with `records`.
    pub fn new(state: StorageState, records: Vec<PeerRecord>) -> Self {
        MockCarStore {
            state: Mutex::new(Some(state)),
            records: Mutex::new(records.into_iter().map(|r| (r.device_id, r)).collect()),
        }
    }

    /// An opened store pre-seeded with `records`.
    pub fn with_records(records: Vec<PeerRecord>) -> Self {
        Self::new(StorageState::Opened, records)
    }

    fn ensure_opened(&self) -> Result<(), StorageError> {
        match *self.state.lock().unwrap() {
            Some(StorageState::Opened) => Ok(()),
            _ => Err(StorageError::NotOpened),
        }
    }
}

impl CarStore for MockCarStore {
    async fn state(&self) -> Result<StorageState, StorageError> {
        Ok(self.state.lock().unwrap().unwrap_or(StorageState::Uninitialized))
    }

    async fn open(&mut self) -> Result<(), StorageError> {
        *self.state.lock().unwrap() = Some(StorageState::Opened);

        Ok(())
    }

    async fn clear(&mut self) -> Result<(), StorageError> {
        self.ensure_opened()?;
        *self.state.lock().unwrap() = Some(StorageState::Uninitialized);
        self.records.lock().unwrap().clear();

        Ok(())
    }

    async fn insert_or_replace(&self, record: PeerRecord) -> Result<(), StorageError> {
        self.ensure_opened()?;
        self.records.lock().unwrap().insert(record.device_id, record);

        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<PeerRecord>, StorageError> {
        self.ensure_opened()?;
        let mut records: Vec<_> = self.records.lock().unwrap().values().cloned().collect();
        records.sort_by_key(|record| record.device_id);

        Ok(records)
    }

    async fn load_by_device_id(&self, device_id: Uuid) -> Result<Option<PeerRecord>, StorageError> {
        self.ensure_opened()?;

        Ok(self.records.lock().unwrap().get(&device_id).cloned())
    }

    async fn has_mac_address(&self, mac_address: &str) -> Result<bool, StorageError> {
        self.ensure_opened()?;

        Ok(self
            .records
            .lock()
            .unwrap()
            .values()
            .any(|record| record.mac_address == mac_address))
    }

    async fn load_resume_blob(&self, device_id: Uuid) -> Result<Option<Vec<u8>>, StorageError> {
        self.ensure_opened()?;

        Ok(self
            .records
            .lock()
            .unwrap()
            .get(&device_id)
            .map(|record| record.encryption_session.clone()))
    }

    async fn update_resume_blob(&self, device_id: Uuid, blob: &[u8]) -> Result<(), StorageError> {
        self.ensure_opened()?;
        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(&device_id)
            .ok_or_else(|| StorageError::Corrupted("no record to update".to_string()))?;
        record.encryption_session = blob.to_vec();

        Ok(())
    }

    async fn update_name(&self, device_id: Uuid, name: &str, user_renamed: bool) -> Result<(), StorageError> {
        self.ensure_opened()?;
        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(&device_id)
            .ok_or_else(|| StorageError::Corrupted("no record to update".to_string()))?;
        record.name = Some(name.to_string());
        record.user_renamed = user_renamed;

        Ok(())
    }

    async fn load_all_identification_keys(&self) -> Result<Vec<(Uuid, IdentificationKey)>, StorageError> {
        self.ensure_opened()?;
        let mut keys: Vec<_> = self
            .records
            .lock()
            .unwrap()
            .values()
            .map(|record| (record.device_id, record.identification_key.clone()))
            .collect();
        keys.sort_by_key(|(device_id, _)| *device_id);

        Ok(keys)
    }

    async fn delete(&self, device_id: Uuid) -> Result<bool, StorageError> {
        self.ensure_opened()?;

        Ok(self.records.lock().unwrap().remove(&device_id).is_some())
    }

    async fn delete_all(&self) -> Result<u64, StorageError> {
        self.ensure_opened()?;
        let mut records = self.records.lock().unwrap();
        let count = records.len() as u64;
        records.clear();

        Ok(count)
    }
}
