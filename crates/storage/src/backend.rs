//! Storage backend trait definition

use async_trait::async_trait;
use bytes::Bytes;
use runtime_core::Result;
use std::path::Path;

/// Async interface to the place exported checkpoints land
///
/// Paths are relative to the backend root and use `/` separators.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Write `data` to `path`, creating parent directories
    ///
    /// Writes are atomic: readers see either the old object or the complete
    /// new one. Returns the number of bytes written.
    async fn write(&self, path: &str, data: Bytes) -> Result<u64>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Create the directory `path` and its parents; existing ones are fine
    async fn create_dir_all(&self, path: &str) -> Result<()>;

    /// Copy a file or directory tree from the local filesystem to `path`
    ///
    /// Returns the number of bytes copied. Importing a path onto itself is a
    /// no-op that copies nothing.
    async fn import(&self, source: &Path, path: &str) -> Result<u64>;
}
