use std::path::PathBuf;

#[cfg(any(test, feature = "software"))]
pub mod software;

#[derive(Debug, thiserror::Error)]
pub enum UtilitiesError {
    #[error("could not determine storage path: {0}")]
    StoragePath(#[source] std::io::Error),
}

/// Platform directories the agent may write to.
pub trait PlatformUtilities {
    /// Returns a directory private to the application, suitable for the
    /// associated-car database. The directory exists when this returns.
    async fn storage_path() -> Result<PathBuf, UtilitiesError>;
}
