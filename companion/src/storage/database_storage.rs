use std::path::PathBuf;

use sea_orm::sea_query::OnConflict;
use sea_orm::ActiveValue::Set;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectOptions, ConnectionTrait, Database, DatabaseConnection,
    EntityTrait, PaginatorTrait, QueryFilter, Schema, Statement,
};
use tokio::fs;
use tracing::info;
use uuid::Uuid;

use platform_support::keystore::PlatformEncryptionKey;
use platform_support::utils::PlatformUtilities;

use crate::identification::{IdentificationKey, IDENTIFICATION_KEY_LENGTH};

use super::{entity, PeerRecord, StorageError, StorageState, MAC_ADDRESS_PLACEHOLDER};

const DATABASE_NAME: &str = "companion_cars";
const DATABASE_FILE_EXT: &str = "db";

// Keystore identifier of the key encrypting the secret columns.
const STORE_KEY_IDENTIFIER: &str = "companion_car_store";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqliteUrl {
    File(PathBuf),
    InMemory,
}

impl SqliteUrl {
    fn connection_string(&self) -> String {
        match self {
            SqliteUrl::File(path) => format!("sqlite://{}?mode=rwc", path.to_string_lossy()),
            SqliteUrl::InMemory => "sqlite::memory:".to_string(),
        }
    }
}

/// SQLite-backed [`CarStore`](super::CarStore). The resume material and
/// identification key columns are encrypted with a platform keystore key
/// before they reach the database file.
pub struct DatabaseStorage<K> {
    key: K,
    url: SqliteUrl,
    connection: Option<DatabaseConnection>,
}

impl<K: PlatformEncryptionKey> DatabaseStorage<K> {
    pub fn new(url: SqliteUrl) -> Result<Self, StorageError> {
        let key = K::encryption_key(STORE_KEY_IDENTIFIER)?;

        Ok(DatabaseStorage {
            key,
            url,
            connection: None,
        })
    }

    /// Storage at the platform's private database path.
    pub async fn init<U: PlatformUtilities>() -> Result<Self, StorageError> {
        let path = U::storage_path()
            .await?
            .join(format!("{DATABASE_NAME}.{DATABASE_FILE_EXT}"));

        Self::new(SqliteUrl::File(path))
    }

    fn connection(&self) -> Result<&DatabaseConnection, StorageError> {
        self.connection.as_ref().ok_or(StorageError::NotOpened)
    }

    fn record_from_model(&self, model: entity::Model) -> Result<PeerRecord, StorageError> {
        let encryption_session = self.key.decrypt(&model.encrypted_session)?;
        let key_bytes: [u8; IDENTIFICATION_KEY_LENGTH] = self
            .key
            .decrypt(&model.encrypted_identification_key)?
            .as_slice()
            .try_into()
            .map_err(|_| StorageError::Corrupted("identification key has the wrong length".to_string()))?;

        Ok(PeerRecord {
            device_id: model.device_id,
            name: model.name,
            mac_address: model.mac_address,
            encryption_session,
            identification_key: IdentificationKey::from_bytes(key_bytes),
            user_renamed: model.user_renamed,
        })
    }

    fn model_from_record(&self, record: &PeerRecord) -> Result<entity::ActiveModel, StorageError> {
        Ok(entity::ActiveModel {
            device_id: Set(record.device_id),
            name: Set(record.name.clone()),
            mac_address: Set(record.mac_address.clone()),
            encrypted_session: Set(self.key.encrypt(&record.encryption_session)?),
            encrypted_identification_key: Set(self.key.encrypt(record.identification_key.as_bytes())?),
            user_renamed: Set(record.user_renamed),
        })
    }
}

/// Adds the MAC address column to databases created before it existed. The
/// placeholder value keeps legacy rows addressable by device id.
async fn migrate_mac_address_column(connection: &DatabaseConnection) -> Result<(), StorageError> {
    let backend = connection.get_database_backend();

    let columns = connection
        .query_all(Statement::from_string(
            backend,
            "PRAGMA table_info('associated_car')".to_string(),
        ))
        .await?;
    let has_mac_column = columns
        .iter()
        .any(|row| matches!(row.try_get::<String>("", "name"), Ok(name) if name == "mac_address"));

    if !has_mac_column {
        info!("adding MAC address column to the associated car table");
        connection
            .execute(Statement::from_string(
                backend,
                format!(
                    "ALTER TABLE \"associated_car\" ADD COLUMN \"mac_address\" varchar NOT NULL \
                     DEFAULT '{MAC_ADDRESS_PLACEHOLDER}'"
                ),
            ))
            .await?;
    }

    Ok(())
}

impl<K> super::CarStore for DatabaseStorage<K>
where
    K: PlatformEncryptionKey + Send + Sync,
{
    async fn state(&self) -> Result<StorageState, StorageError> {
        if self.connection.is_some() {
            return Ok(StorageState::Opened);
        }

        match &self.url {
            SqliteUrl::File(path) => {
                // An unreadable path is treated the same as a missing file.
                if fs::try_exists(path).await.unwrap_or(false) {
                    Ok(StorageState::Unopened)
                } else {
                    Ok(StorageState::Uninitialized)
                }
            }
            SqliteUrl::InMemory => Ok(StorageState::Uninitialized),
        }
    }

    async fn open(&mut self) -> Result<(), StorageError> {
        // One pooled connection: SQLite has a single writer anyway, and an
        // in-memory database only exists on the connection that created it.
        let mut options = ConnectOptions::new(self.url.connection_string());
        options.max_connections(1);
        let connection = Database::connect(options).await?;

        let backend = connection.get_database_backend();
        let mut table = Schema::new(backend).create_table_from_entity(entity::Entity);
        table.if_not_exists();
        connection.execute(backend.build(&table)).await?;

        migrate_mac_address_column(&connection).await?;

        self.connection.replace(connection);

        Ok(())
    }

    async fn clear(&mut self) -> Result<(), StorageError> {
        let connection = self.connection.take().ok_or(StorageError::NotOpened)?;
        connection.close().await?;

        if let SqliteUrl::File(path) = &self.url {
            let _ = fs::remove_file(path).await;
        }

        Ok(())
    }

    async fn insert_or_replace(&self, record: PeerRecord) -> Result<(), StorageError> {
        let model = self.model_from_record(&record)?;

        entity::Entity::insert(model)
            .on_conflict(
                OnConflict::column(entity::Column::DeviceId)
                    .update_columns([
                        entity::Column::Name,
                        entity::Column::MacAddress,
                        entity::Column::EncryptedSession,
                        entity::Column::EncryptedIdentificationKey,
                        entity::Column::UserRenamed,
                    ])
                    .to_owned(),
            )
            .exec(self.connection()?)
            .await?;

        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<PeerRecord>, StorageError> {
        entity::Entity::find()
            .all(self.connection()?)
            .await?
            .into_iter()
            .map(|model| self.record_from_model(model))
            .collect()
    }

    async fn load_by_device_id(&self, device_id: Uuid) -> Result<Option<PeerRecord>, StorageError> {
        entity::Entity::find_by_id(device_id)
            .one(self.connection()?)
            .await?
            .map(|model| self.record_from_model(model))
            .transpose()
    }

    async fn has_mac_address(&self, mac_address: &str) -> Result<bool, StorageError> {
        let count = entity::Entity::find()
            .filter(entity::Column::MacAddress.eq(mac_address))
            .count(self.connection()?)
            .await?;

        Ok(count > 0)
    }

    async fn load_resume_blob(&self, device_id: Uuid) -> Result<Option<Vec<u8>>, StorageError> {
        entity::Entity::find_by_id(device_id)
            .one(self.connection()?)
            .await?
            .map(|model| Ok(self.key.decrypt(&model.encrypted_session)?))
            .transpose()
    }

    async fn update_resume_blob(&self, device_id: Uuid, blob: &[u8]) -> Result<(), StorageError> {
        let model = entity::ActiveModel {
            device_id: Set(device_id),
            encrypted_session: Set(self.key.encrypt(blob)?),
            ..Default::default()
        };
        model.update(self.connection()?).await?;

        Ok(())
    }

    async fn update_name(&self, device_id: Uuid, name: &str, user_renamed: bool) -> Result<(), StorageError> {
        let model = entity::ActiveModel {
            device_id: Set(device_id),
            name: Set(Some(name.to_string())),
            user_renamed: Set(user_renamed),
            ..Default::default()
        };
        model.update(self.connection()?).await?;

        Ok(())
    }

    async fn load_all_identification_keys(&self) -> Result<Vec<(Uuid, IdentificationKey)>, StorageError> {
        entity::Entity::find()
            .all(self.connection()?)
            .await?
            .into_iter()
            .map(|model| {
                let key_bytes: [u8; IDENTIFICATION_KEY_LENGTH] = self
                    .key
                    .decrypt(&model.encrypted_identification_key)?
                    .as_slice()
                    .try_into()
                    .map_err(|_| {
                        StorageError::Corrupted("identification key has the wrong length".to_string())
                    })?;

                Ok((model.device_id, IdentificationKey::from_bytes(key_bytes)))
            })
            .collect()
    }

    async fn delete(&self, device_id: Uuid) -> Result<bool, StorageError> {
        let result = entity::Entity::delete_by_id(device_id)
            .exec(self.connection()?)
            .await?;

        Ok(result.rows_affected > 0)
    }

    async fn delete_all(&self) -> Result<u64, StorageError> {
        let result = entity::Entity::delete_many().exec(self.connection()?).await?;

        Ok(result.rows_affected)
    }
}
