//! Blob store contract and object storage backends
//!
//! A safe keeps every byte it owns in a passive blob repository. This crate
//! defines the [`Store`] contract the safe relies on and one adapter over the
//! `object_store` crate covering in-memory, local filesystem and S3-compatible
//! storage.
//!
//! # Example
//!
//! ```rust,no_run
//! use blob_store::{connect, Filter};
//!
//! # async fn example() -> Result<(), blob_store::StoreError> {
//! let store = connect("file:///tmp/safe").await?;
//! store.write("zone/a.txt", "hello".into(), None).await?;
//! let entries = store.read_dir("zone", &Filter::default()).await?;
//! # Ok(())
//! # }
//! ```

mod error;
mod storage;
mod store;

pub use error::{Result, StoreError};
pub use storage::{connect, ObjectStorage, ObjectStoreConfig};
pub use store::{Entry, Filter, Progress, Store};
