//! Shared test utilities for safe integration tests
#![allow(dead_code)]

use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use blob_store::{Entry, Filter, Progress, Store};
use bytes::Bytes;
use common::crypto::SecretKey;
use common::index::Index;
use common::safe::key_id::next_id;
use common::safe::{PutOptions, Safe, SafeBuilder, SafeConfig};
use tempfile::TempDir;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Calls observed by a [`CountingStore`].
#[derive(Debug, Default)]
pub struct Counters {
    /// Reads of encrypted bodies
    pub body_reads: AtomicUsize,
    /// Listings of ACL objects
    pub acl_listings: AtomicUsize,
}

/// Store wrapper counting body reads and ACL listings.
#[derive(Debug)]
pub struct CountingStore {
    inner: Arc<dyn Store>,
    counters: Arc<Counters>,
}

impl CountingStore {
    pub fn new(inner: Arc<dyn Store>) -> (Arc<Self>, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let store = Arc::new(Self {
            inner,
            counters: counters.clone(),
        });
        (store, counters)
    }
}

#[async_trait]
impl Store for CountingStore {
    fn url(&self) -> &str {
        self.inner.url()
    }

    async fn read_dir(&self, dir: &str, filter: &Filter) -> blob_store::Result<Vec<Entry>> {
        if filter.suffix.as_deref() == Some(".acl") {
            self.counters.acl_listings.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.read_dir(dir, filter).await
    }

    async fn read(
        &self,
        path: &str,
        range: Option<Range<u64>>,
        progress: Option<&Progress>,
    ) -> blob_store::Result<Bytes> {
        if path.ends_with(".b") {
            self.counters.body_reads.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.read(path, range, progress).await
    }

    async fn write(
        &self,
        path: &str,
        data: Bytes,
        progress: Option<&Progress>,
    ) -> blob_store::Result<()> {
        self.inner.write(path, data, progress).await
    }

    async fn stat(&self, path: &str) -> blob_store::Result<Entry> {
        self.inner.stat(path).await
    }

    async fn delete(&self, path: &str) -> blob_store::Result<()> {
        self.inner.delete(path).await
    }

    async fn close(&self) -> blob_store::Result<()> {
        self.inner.close().await
    }
}

/// A store shared by every identity of a test, plus a scratch directory.
pub struct TestEnv {
    pub url: String,
    pub temp: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        init_tracing();
        Self {
            url: format!("mem://safe-test-{}", next_id(0)),
            temp: TempDir::new().unwrap(),
        }
    }

    /// Config of one device: its own cache folder and an in-memory index.
    pub fn config(&self, identity: &SecretKey) -> SafeConfig {
        SafeConfig {
            cache_dir: self.temp.path().join(identity.id()),
            nick: identity.id()[..8].to_string(),
            ..Default::default()
        }
    }

    pub async fn create(&self, identity: &SecretKey, name: &str) -> Safe {
        self.create_with(identity, name, self.config(identity)).await
    }

    pub async fn create_with(&self, identity: &SecretKey, name: &str, config: SafeConfig) -> Safe {
        SafeBuilder::new()
            .identity(identity.clone())
            .urls(vec![self.url.clone()])
            .config(config)
            .create(name)
            .await
            .unwrap()
    }

    pub async fn open(&self, identity: &SecretKey, safe: &Safe) -> Safe {
        SafeBuilder::new()
            .identity(identity.clone())
            .urls(vec![self.url.clone()])
            .config(self.config(identity))
            .open(safe.name(), safe.manifest().creator_id)
            .await
            .unwrap()
    }

    /// Open `safe` through a [`CountingStore`].
    pub async fn open_counting(&self, identity: &SecretKey, safe: &Safe) -> (Safe, Arc<Counters>) {
        let inner = blob_store::connect(&self.url).await.unwrap();
        let (store, counters) = CountingStore::new(inner);
        let safe = SafeBuilder::new()
            .identity(identity.clone())
            .store(store)
            .index(Index::in_memory().await.unwrap())
            .config(self.config(identity))
            .open(safe.name(), safe.manifest().creator_id)
            .await
            .unwrap();
        (safe, counters)
    }
}

pub async fn put_bytes(safe: &Safe, zone: &str, name: &str, data: &[u8]) -> common::safe::Header {
    safe.put(zone, name, data, PutOptions::default())
        .await
        .unwrap()
}

pub async fn get_bytes(safe: &Safe, zone: &str, name: &str) -> Vec<u8> {
    let mut out = Vec::new();
    safe.get(zone, name, &mut out, Default::default())
        .await
        .unwrap();
    out
}

/// Deterministic pseudo random content.
pub fn content(size: usize, seed: u8) -> Vec<u8> {
    (0..size)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}
