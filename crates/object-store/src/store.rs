//! The contract every blob store backend satisfies.

use std::fmt::Debug;
use std::ops::Range;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::Result;

/// Channel receiving the running count of bytes transferred by a read or write.
pub type Progress = flume::Sender<u64>;

/// A directory entry returned by [`Store::read_dir`] and [`Store::stat`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Last path segment
    pub name: String,
    /// Size in bytes, zero for folders
    pub size: u64,
    /// Last modification time as reported by the backend
    pub mod_time: DateTime<Utc>,
    pub is_dir: bool,
}

/// Narrows the result of [`Store::read_dir`].
#[derive(Debug, Clone, Default)]
pub struct Filter {
    /// Keep names starting with this prefix
    pub prefix: Option<String>,
    /// Keep names ending with this suffix
    pub suffix: Option<String>,
    /// Keep names sorting strictly after this one
    pub after_name: Option<String>,
    pub only_files: bool,
    pub only_folders: bool,
    /// Stop after this many entries, zero means no limit
    pub max_results: usize,
}

impl Filter {
    pub fn suffix(suffix: impl Into<String>) -> Self {
        Self {
            suffix: Some(suffix.into()),
            only_files: true,
            ..Default::default()
        }
    }

    pub fn folders() -> Self {
        Self {
            only_folders: true,
            ..Default::default()
        }
    }

    /// Check a single entry against the filter (ignores `max_results`).
    pub fn matches(&self, entry: &Entry) -> bool {
        if self.only_files && entry.is_dir {
            return false;
        }
        if self.only_folders && !entry.is_dir {
            return false;
        }
        if let Some(prefix) = &self.prefix {
            if !entry.name.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(suffix) = &self.suffix {
            if !entry.name.ends_with(suffix.as_str()) {
                return false;
            }
        }
        if let Some(after) = &self.after_name {
            if entry.name.as_str() <= after.as_str() {
                return false;
            }
        }
        true
    }

    /// Apply the filter to a listing, sorting by name and truncating to `max_results`.
    pub fn apply(&self, entries: Vec<Entry>) -> Vec<Entry> {
        let mut entries: Vec<Entry> = entries.into_iter().filter(|e| self.matches(e)).collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        if self.max_results > 0 {
            entries.truncate(self.max_results);
        }
        entries
    }
}

/// A passive, hierarchical byte repository.
///
/// Paths are `/`-separated and relative to the root of the store. Writes
/// overwrite. Reads of missing objects fail with [`StoreError::NotFound`](crate::StoreError::NotFound);
/// listing a missing directory yields an empty listing.
#[async_trait]
pub trait Store: Send + Sync + Debug {
    /// The URL this store was connected from.
    fn url(&self) -> &str;

    /// List the direct children of `dir`.
    async fn read_dir(&self, dir: &str, filter: &Filter) -> Result<Vec<Entry>>;

    /// Read an object, or the half-open byte `range` of it.
    async fn read(
        &self,
        path: &str,
        range: Option<Range<u64>>,
        progress: Option<&Progress>,
    ) -> Result<Bytes>;

    /// Write an object, replacing any previous content.
    async fn write(&self, path: &str, data: Bytes, progress: Option<&Progress>) -> Result<()>;

    async fn stat(&self, path: &str) -> Result<Entry>;

    /// Delete an object. Deleting a missing object is not an error.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Release any connection held by the backend.
    async fn close(&self) -> Result<()>;
}
