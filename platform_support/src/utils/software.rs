use std::path::PathBuf;

use tokio::fs;

use super::{PlatformUtilities, UtilitiesError};

const STORAGE_SUBDIRECTORY: &str = "companion_storage";

/// Software stand-in for the platform storage directory, backed by the
/// system temporary directory.
pub struct SoftwareUtilities;

impl PlatformUtilities for SoftwareUtilities {
    async fn storage_path() -> Result<PathBuf, UtilitiesError> {
        let path = std::env::temp_dir().join(STORAGE_SUBDIRECTORY);
        fs::create_dir_all(&path).await.map_err(UtilitiesError::StoragePath)?;

        Ok(path)
    }
}
