//! Object storage backend (S3/MinIO/local filesystem/memory) behind the [`Store`] contract.

use std::collections::HashMap;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectMeta, ObjectStore};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Result, StoreError};
use crate::store::{Entry, Filter, Progress, Store};

/// In-memory stores are shared per name for the lifetime of the process,
/// so that two handles on `mem://x` see the same objects.
static MEMORY_STORES: LazyLock<Mutex<HashMap<String, Arc<InMemory>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Configuration for the object storage backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObjectStoreConfig {
    /// In-memory storage, shared by name within the process
    Memory { name: String },

    /// Local filesystem storage
    Local {
        /// Path to the storage directory
        path: PathBuf,
    },

    /// S3-compatible storage (AWS S3, MinIO, etc.)
    S3 {
        /// S3 endpoint URL (e.g., "http://localhost:9000" for MinIO)
        endpoint: String,
        /// Access key ID
        access_key: String,
        /// Secret access key
        secret_key: String,
        /// Bucket name
        bucket: String,
        /// Optional region (defaults to "us-east-1")
        region: Option<String>,
    },
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        ObjectStoreConfig::Memory {
            name: "default".to_string(),
        }
    }
}

impl ObjectStoreConfig {
    /// Derive a configuration from a store URL.
    ///
    /// Supported schemes:
    /// - `mem://<name>`
    /// - `file:///<absolute path>`
    /// - `s3://<access key>:<secret key>@<host[:port]>/<bucket>?region=<region>&http=true`
    pub fn from_url(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).map_err(|e| StoreError::InvalidUrl(format!("{raw}: {e}")))?;
        match url.scheme() {
            "mem" => {
                let name = format!(
                    "{}{}",
                    url.host_str().unwrap_or_default(),
                    url.path().trim_end_matches('/')
                );
                Ok(ObjectStoreConfig::Memory { name })
            }
            "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|_| StoreError::InvalidUrl(format!("{raw}: not a file path")))?;
                Ok(ObjectStoreConfig::Local { path })
            }
            "s3" => {
                let host = url
                    .host_str()
                    .ok_or_else(|| StoreError::InvalidUrl(format!("{raw}: missing host")))?;
                let bucket = url
                    .path_segments()
                    .and_then(|mut segments| segments.next())
                    .filter(|b| !b.is_empty())
                    .ok_or_else(|| StoreError::InvalidUrl(format!("{raw}: missing bucket")))?
                    .to_string();

                let mut region = None;
                let mut http = false;
                for (key, value) in url.query_pairs() {
                    match key.as_ref() {
                        "region" => region = Some(value.to_string()),
                        "http" => http = value == "true" || value == "1",
                        _ => {}
                    }
                }

                let scheme = if http { "http" } else { "https" };
                let endpoint = match url.port() {
                    Some(port) => format!("{scheme}://{host}:{port}"),
                    None => format!("{scheme}://{host}"),
                };

                Ok(ObjectStoreConfig::S3 {
                    endpoint,
                    access_key: url.username().to_string(),
                    secret_key: url.password().unwrap_or_default().to_string(),
                    bucket,
                    region,
                })
            }
            other => Err(StoreError::InvalidUrl(format!(
                "{raw}: unsupported scheme '{other}'"
            ))),
        }
    }
}

/// Connect to the store behind `url`.
pub async fn connect(url: &str) -> Result<Arc<dyn Store>> {
    let config = ObjectStoreConfig::from_url(url)?;
    let storage = ObjectStorage::new(url, config).await?;
    Ok(Arc::new(storage))
}

/// [`Store`] implementation over any `object_store` backend.
#[derive(Debug, Clone)]
pub struct ObjectStorage {
    url: String,
    inner: Arc<dyn ObjectStore>,
}

impl ObjectStorage {
    /// Create a new storage backend from configuration.
    pub async fn new(url: &str, config: ObjectStoreConfig) -> Result<Self> {
        let inner: Arc<dyn ObjectStore> = match &config {
            ObjectStoreConfig::Memory { name } => {
                let store: Arc<dyn ObjectStore> = MEMORY_STORES
                    .lock()
                    .entry(name.clone())
                    .or_insert_with(|| Arc::new(InMemory::new()))
                    .clone();
                store
            }

            ObjectStoreConfig::Local { path } => {
                // Ensure directory exists
                tokio::fs::create_dir_all(path).await?;
                Arc::new(
                    LocalFileSystem::new_with_prefix(path)
                        .map_err(|e| StoreError::InvalidConfig(e.to_string()))?,
                )
            }

            ObjectStoreConfig::S3 {
                endpoint,
                access_key,
                secret_key,
                bucket,
                region,
            } => {
                let builder = AmazonS3Builder::new()
                    .with_endpoint(endpoint)
                    .with_access_key_id(access_key)
                    .with_secret_access_key(secret_key)
                    .with_bucket_name(bucket)
                    .with_region(region.as_deref().unwrap_or("us-east-1"))
                    .with_allow_http(endpoint.starts_with("http://"));

                let store: Arc<dyn ObjectStore> = Arc::new(
                    builder
                        .build()
                        .map_err(|e| StoreError::InvalidConfig(e.to_string()))?,
                );

                // Fail fast if the bucket is missing or unreachable
                {
                    let mut stream = store.list(None);
                    match stream.try_next().await {
                        Ok(_) => {}
                        Err(object_store::Error::NotFound { .. }) => {
                            return Err(StoreError::BucketNotFound(bucket.clone()));
                        }
                        Err(e) => {
                            let msg = e.to_string();
                            if msg.contains("NoSuchBucket") {
                                return Err(StoreError::BucketNotFound(bucket.clone()));
                            }
                            return Err(e.into());
                        }
                    }
                }

                store
            }
        };

        tracing::debug!(url = %url, "connected to object store");
        Ok(Self {
            url: url.to_string(),
            inner,
        })
    }

    fn location(path: &str) -> ObjectPath {
        ObjectPath::from(path.trim_matches('/'))
    }

    fn not_found(path: &str, e: object_store::Error) -> StoreError {
        match e {
            object_store::Error::NotFound { .. } => StoreError::NotFound(path.to_string()),
            e => e.into(),
        }
    }

    fn entry(meta: &ObjectMeta) -> Entry {
        Entry {
            name: meta.location.filename().unwrap_or_default().to_string(),
            size: meta.size as u64,
            mod_time: meta.last_modified,
            is_dir: false,
        }
    }
}

#[async_trait]
impl Store for ObjectStorage {
    fn url(&self) -> &str {
        &self.url
    }

    async fn read_dir(&self, dir: &str, filter: &Filter) -> Result<Vec<Entry>> {
        let dir = dir.trim_matches('/');
        let prefix = (!dir.is_empty()).then(|| ObjectPath::from(dir));

        let listing = match self.inner.list_with_delimiter(prefix.as_ref()).await {
            Ok(listing) => listing,
            Err(object_store::Error::NotFound { .. }) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::with_capacity(listing.common_prefixes.len() + listing.objects.len());
        for folder in &listing.common_prefixes {
            entries.push(Entry {
                name: folder.filename().unwrap_or_default().to_string(),
                size: 0,
                mod_time: Default::default(),
                is_dir: true,
            });
        }
        entries.extend(listing.objects.iter().map(Self::entry));

        Ok(filter.apply(entries))
    }

    async fn read(
        &self,
        path: &str,
        range: Option<Range<u64>>,
        progress: Option<&Progress>,
    ) -> Result<Bytes> {
        let location = Self::location(path);

        if let Some(range) = range {
            if range.start > range.end {
                return Err(StoreError::InvalidRange {
                    path: path.to_string(),
                    start: range.start,
                    end: range.end,
                });
            }
            if range.start == range.end {
                return Ok(Bytes::new());
            }
            let data = self
                .inner
                .get_range(&location, range.start as usize..range.end as usize)
                .await
                .map_err(|e| Self::not_found(path, e))?;
            if let Some(progress) = progress {
                let _ = progress.send(data.len() as u64);
            }
            return Ok(data);
        }

        let result = self
            .inner
            .get(&location)
            .await
            .map_err(|e| Self::not_found(path, e))?;

        let mut stream = result.into_stream();
        let mut buf = BytesMut::new();
        while let Some(chunk) = stream.try_next().await? {
            buf.extend_from_slice(&chunk);
            if let Some(progress) = progress {
                let _ = progress.send(buf.len() as u64);
            }
        }
        Ok(buf.freeze())
    }

    async fn write(&self, path: &str, data: Bytes, progress: Option<&Progress>) -> Result<()> {
        let size = data.len() as u64;
        self.inner.put(&Self::location(path), data.into()).await?;
        if let Some(progress) = progress {
            let _ = progress.send(size);
        }
        tracing::trace!(path = %path, size, "object written");
        Ok(())
    }

    async fn stat(&self, path: &str) -> Result<Entry> {
        let meta = self
            .inner
            .head(&Self::location(path))
            .await
            .map_err(|e| Self::not_found(path, e))?;
        Ok(Self::entry(&meta))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        // Ignore NotFound errors - the object may already be deleted
        match self.inner.delete(&Self::location(path)).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn close(&self) -> Result<()> {
        tracing::debug!(url = %self.url, "closing object store");
        Ok(())
    }
}
