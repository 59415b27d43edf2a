//! Local filesystem storage backend
//!
//! Objects are plain files under a root directory. Writes go to a hidden
//! temporary sibling first and are renamed into place, so a crashed export
//! never leaves a truncated weights file behind.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use runtime_core::{Error, Result};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::StorageBackend;

fn storage_err(action: &str, target: impl std::fmt::Debug, e: std::io::Error) -> Error {
    Error::Storage {
        message: format!("Failed to {} {:?}: {}", action, target, e),
    }
}

/// Local filesystem storage backend
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute location of a relative object path
    pub fn resolve(&self, path: &str) -> PathBuf {
        if path.is_empty() {
            self.root.clone()
        } else {
            self.root.join(path)
        }
    }

    fn temp_path(full_path: &Path) -> PathBuf {
        let temp_name = format!(
            ".{}.{}.tmp",
            full_path.file_name().unwrap_or_default().to_string_lossy(),
            Uuid::new_v4()
        );
        full_path.with_file_name(temp_name)
    }

    async fn ensure_parent(full_path: &Path) -> Result<()> {
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| storage_err("create directory", parent, e))?;
        }
        Ok(())
    }

    /// Canonical form of a path that may not exist yet
    ///
    /// The deepest existing ancestor is canonicalized and the missing tail
    /// is joined back on.
    async fn canonical_target(path: &Path) -> PathBuf {
        let mut existing = path;
        let mut tail = Vec::new();
        loop {
            if let Ok(canonical) = fs::canonicalize(existing).await {
                return tail.iter().rev().fold(canonical, |acc, part| acc.join(part));
            }
            match (existing.parent(), existing.file_name()) {
                (Some(parent), Some(name)) => {
                    tail.push(name.to_os_string());
                    existing = parent;
                }
                _ => return path.to_path_buf(),
            }
        }
    }

    /// Recursively copy `source` into `dest`, file by file
    ///
    /// Both paths must be canonical. When `dest` lies inside `source` it is
    /// left out of the walk.
    async fn copy_tree(source: &Path, dest: &Path) -> Result<u64> {
        let mut copied = 0u64;
        let mut stack = vec![(source.to_path_buf(), dest.to_path_buf())];

        while let Some((from, to)) = stack.pop() {
            let metadata = fs::metadata(&from)
                .await
                .map_err(|e| storage_err("stat", &from, e))?;

            if metadata.is_dir() {
                fs::create_dir_all(&to)
                    .await
                    .map_err(|e| storage_err("create directory", &to, e))?;
                let mut entries = fs::read_dir(&from)
                    .await
                    .map_err(|e| storage_err("read directory", &from, e))?;
                while let Some(entry) = entries
                    .next_entry()
                    .await
                    .map_err(|e| storage_err("read directory", &from, e))?
                {
                    let entry_path = entry.path();
                    if entry_path == dest {
                        debug!(?entry_path, "Skipping import destination inside source");
                        continue;
                    }
                    stack.push((entry_path, to.join(entry.file_name())));
                }
            } else {
                Self::ensure_parent(&to).await?;
                copied += fs::copy(&from, &to)
                    .await
                    .map_err(|e| storage_err("copy", &from, e))?;
            }
        }

        Ok(copied)
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    #[instrument(skip(self, data), fields(backend = "local", size = data.len()))]
    async fn write(&self, path: &str, data: Bytes) -> Result<u64> {
        let full_path = self.resolve(path);
        let temp_path = Self::temp_path(&full_path);
        Self::ensure_parent(&full_path).await?;

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| storage_err("create", &temp_path, e))?;
        file.write_all(&data)
            .await
            .map_err(|e| storage_err("write", &temp_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| storage_err("sync", &temp_path, e))?;
        drop(file);

        if let Err(e) = fs::rename(&temp_path, &full_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(storage_err("rename into", &full_path, e));
        }

        debug!(?full_path, size = data.len(), "File written");
        Ok(data.len() as u64)
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(fs::metadata(self.resolve(path)).await.is_ok())
    }

    async fn create_dir_all(&self, path: &str) -> Result<()> {
        let full_path = self.resolve(path);
        fs::create_dir_all(&full_path)
            .await
            .map_err(|e| storage_err("create directory", &full_path, e))
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn import(&self, source: &Path, path: &str) -> Result<u64> {
        let source = fs::canonicalize(source)
            .await
            .map_err(|e| storage_err("resolve", source, e))?;
        let dest = Self::canonical_target(&self.resolve(path)).await;
        if dest == source {
            debug!(?source, "Import source is already in place");
            return Ok(0);
        }

        let copied = Self::copy_tree(&source, &dest).await?;
        debug!(?source, ?dest, bytes = copied, "Imported into storage");
        Ok(copied)
    }
}
