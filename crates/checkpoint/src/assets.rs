//! Extra source-model files carried into an export
//!
//! Patterns are shell-style globs (`*`, `?`) matched against entry names in
//! the source model directory. Copying is best-effort: a missing source
//! directory, a pattern with no matches, or a failed copy is traced and
//! skipped.

use regex::Regex;
use runtime_core::{Error, Result};
use std::path::Path;
use storage::StorageBackend;
use tracing::debug;

/// Join a directory and a name into a storage object path
pub(crate) fn object_path(dir: &str, name: &str) -> String {
    let dir = dir.trim_matches('/');
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Compiled shell-style name pattern
#[derive(Debug, Clone)]
pub struct AssetPattern {
    raw: String,
    regex: Regex,
}

impl AssetPattern {
    pub fn new(pattern: &str) -> Result<Self> {
        let mut expr = String::with_capacity(pattern.len() + 8);
        expr.push('^');
        for c in pattern.chars() {
            match c {
                '*' => expr.push_str(".*"),
                '?' => expr.push('.'),
                other => expr.push_str(&regex::escape(&other.to_string())),
            }
        }
        expr.push('$');

        let regex = Regex::new(&expr).map_err(|e| Error::InvalidConfig {
            message: format!("invalid asset pattern {:?}: {}", pattern, e),
        })?;
        Ok(Self {
            raw: pattern.to_string(),
            regex,
        })
    }

    /// Hidden entries only match patterns that start with a dot
    pub fn matches(&self, name: &str) -> bool {
        if name.starts_with('.') && !self.raw.starts_with('.') {
            return false;
        }
        self.regex.is_match(name)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// Copy every entry of `source_dir` matching one of `patterns` into `dest_dir`
///
/// Directories are copied recursively. Returns the destination paths that
/// were copied; failures never propagate.
pub async fn copy_matching_assets(
    storage: &dyn StorageBackend,
    source_dir: &Path,
    dest_dir: &str,
    patterns: &[String],
) -> Vec<String> {
    let compiled: Vec<AssetPattern> = patterns
        .iter()
        .filter_map(|p| match AssetPattern::new(p) {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                debug!(pattern = %p, error = %e, "Skipping asset pattern");
                None
            }
        })
        .collect();

    let mut names = match tokio::fs::read_dir(source_dir).await {
        Ok(mut entries) => {
            let mut names = Vec::new();
            while let Ok(Some(entry)) = entries.next_entry().await {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
            names
        }
        Err(e) => {
            debug!(?source_dir, error = %e, "Source model directory not readable");
            return Vec::new();
        }
    };
    names.sort();

    let mut copied = Vec::new();
    for pattern in &compiled {
        let matched: Vec<&String> = names.iter().filter(|n| pattern.matches(n)).collect();
        if matched.is_empty() {
            debug!(pattern = pattern.as_str(), ?source_dir, "No source entries match");
            continue;
        }

        for name in matched {
            let dest = object_path(dest_dir, name);
            match storage.import(&source_dir.join(name), &dest).await {
                Ok(bytes) => {
                    debug!(pattern = pattern.as_str(), %dest, bytes, "Copied source asset");
                    if !copied.contains(&dest) {
                        copied.push(dest);
                    }
                }
                Err(e) => {
                    debug!(pattern = pattern.as_str(), %dest, error = %e, "Asset copy failed")
                }
            }
        }
    }

    copied
}
