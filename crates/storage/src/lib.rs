//! Storage - where exported checkpoints are written
//!
//! Provides the async [`StorageBackend`] interface and the local filesystem
//! implementation used for checkpoint directories.
//!
//! # Example
//!
//! ```no_run
//! use storage::{StorageBackend, LocalStorage};
//! use bytes::Bytes;
//!
//! # async fn example() -> runtime_core::Result<()> {
//! let storage = LocalStorage::new("/tmp/checkpoints");
//! storage.write("epoch-1/config.json", Bytes::from("{}\n")).await?;
//! assert!(storage.exists("epoch-1/config.json").await?);
//! # Ok(())
//! # }
//! ```

mod backend;
mod local;

pub use backend::StorageBackend;
pub use local::LocalStorage;
