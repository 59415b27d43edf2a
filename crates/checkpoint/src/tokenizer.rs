//! Tokenizer persistence hook

use async_trait::async_trait;
use runtime_core::{ExportConfig, Result};
use std::path::{Path, PathBuf};
use storage::StorageBackend;
use tracing::debug;

use crate::assets::object_path;

/// A tokenizer that knows how to save its own assets
#[async_trait]
pub trait PretrainedTokenizer: Send + Sync {
    /// Write the tokenizer's files into `dir`; returns the paths written
    async fn save_pretrained(&self, storage: &dyn StorageBackend, dir: &str)
        -> Result<Vec<String>>;
}

/// Tokenizer whose assets are files in the source model directory
#[derive(Debug, Clone)]
pub struct TokenizerAssets {
    source_dir: PathBuf,
    files: Vec<String>,
}

impl TokenizerAssets {
    pub fn new<P: AsRef<Path>>(source_dir: P) -> Self {
        Self::from_config(source_dir, &ExportConfig::default())
    }

    pub fn from_config<P: AsRef<Path>>(source_dir: P, config: &ExportConfig) -> Self {
        Self {
            source_dir: source_dir.as_ref().to_path_buf(),
            files: config.tokenizer_files.clone(),
        }
    }

    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }
}

#[async_trait]
impl PretrainedTokenizer for TokenizerAssets {
    async fn save_pretrained(
        &self,
        storage: &dyn StorageBackend,
        dir: &str,
    ) -> Result<Vec<String>> {
        let mut written = Vec::new();
        for file in &self.files {
            let source = self.source_dir.join(file);
            if !tokio::fs::try_exists(&source).await? {
                continue;
            }
            let dest = object_path(dir, file);
            storage.import(&source, &dest).await?;
            written.push(dest);
        }

        debug!(source_dir = ?self.source_dir, files = written.len(), "Saved tokenizer assets");
        Ok(written)
    }
}
