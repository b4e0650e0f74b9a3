//! The safe: an encrypted container of zones replicated on a blob store.
//!
//! A [`Safe`] handle is cheap to clone. It owns a background worker serving
//! [`Command`]s, a local [`Index`] and a body cache. Every zone is guarded by
//! its own async mutex so concurrent calls on the same zone are serialized.

pub mod acl;
mod cache;
mod config;
mod error;
pub mod events;
mod get;
pub mod header;
mod housekeeping;
pub mod identity;
mod jobs;
pub mod key_id;
mod manifest;
pub mod permission;
mod put;
mod sync;
mod token;
mod worker;
mod zone;

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use blob_store::Store;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};

use crate::crypto::{PublicKey, SecretKey};
use crate::index::Index;

pub use cache::CacheManager;
pub use config::{ConfigError, SafeConfig};
pub use error::SafeError;
pub use get::{GetOptions, GetTask};
pub use header::{Attributes, Header, HeaderError};
pub use identity::IdentityRecord;
pub use jobs::{Command, CommandDispatcher, CommandReceiver};
pub use manifest::Manifest;
pub use permission::{Permission, PermissionChange, Users};
pub use put::PutOptions;
pub use token::{AccessToken, TokenError};
pub use zone::Zone;

const TOUCH_FILE: &str = ".touch";

/// Writes queued by an asynchronous put, applied in order by `FlushUploads`.
#[derive(Debug, Clone)]
pub(crate) struct PendingUpload {
    pub zone: String,
    pub writes: Vec<(String, Bytes)>,
}

pub(crate) struct SafeInner {
    name: String,
    identity: SecretKey,
    manifest: Manifest,
    urls: Vec<String>,
    store: RwLock<Arc<dyn Store>>,
    index: Index,
    cache: CacheManager,
    config: SafeConfig,
    zones: RwLock<BTreeMap<String, Arc<tokio::sync::Mutex<Zone>>>>,
    uploads: Mutex<VecDeque<PendingUpload>>,
    commands: CommandDispatcher,
    worker: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<JoinSet<()>>,
}

/// Handle on an open safe
#[derive(Clone)]
pub struct Safe(Arc<SafeInner>);

impl std::fmt::Debug for Safe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Safe")
            .field("name", &self.0.name)
            .field("identity", &self.0.identity.public())
            .finish()
    }
}

/// Builder for creating or opening a safe.
///
/// Either `urls` or an already connected `store` must be given. The index is
/// opened from the config when not provided.
#[derive(Default)]
pub struct SafeBuilder {
    identity: Option<SecretKey>,
    urls: Vec<String>,
    store: Option<Arc<dyn Store>>,
    index: Option<Index>,
    config: SafeConfig,
}

impl SafeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn identity(mut self, identity: SecretKey) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn urls(mut self, urls: Vec<String>) -> Self {
        self.urls = urls;
        self
    }

    /// Use an already connected store instead of connecting to `urls`.
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Share an index between safes, required for quota groups spanning several safes.
    pub fn index(mut self, index: Index) -> Self {
        self.index = Some(index);
        self
    }

    pub fn config(mut self, config: SafeConfig) -> Self {
        self.config = config;
        self
    }

    /// Create a new safe in the store and open it.
    pub async fn create(self, name: &str) -> Result<Safe, SafeError> {
        validate_name(name)?;
        let identity = self.require_identity()?;
        let store = self.connect().await?;

        if Manifest::exists(store.as_ref()).await? {
            return Err(SafeError::SafeExist(name.to_string()));
        }

        let manifest = Manifest {
            name: name.to_string(),
            creator_id: identity.public(),
            description: self.config.description.clone(),
            quota: self.config.quota,
            quota_group: self
                .config
                .quota_group
                .clone()
                .unwrap_or_else(|| name.to_string()),
            created: Utc::now(),
        };
        manifest.write(store.as_ref(), &identity).await?;
        tracing::info!("created safe {} on {}", name, store.url());

        self.start(identity, manifest, store).await
    }

    /// Open an existing safe created by `creator_id`.
    pub async fn open(self, name: &str, creator_id: PublicKey) -> Result<Safe, SafeError> {
        validate_name(name)?;
        let identity = self.require_identity()?;
        let store = self.connect().await?;

        let manifest = Manifest::read(store.as_ref(), &creator_id).await?;
        if manifest.name != name {
            return Err(SafeError::InvalidName(format!(
                "{name}: store holds safe {}",
                manifest.name
            )));
        }

        self.start(identity, manifest, store).await
    }

    /// Open the safe described by an access token.
    pub async fn open_token(self, token: &AccessToken) -> Result<Safe, SafeError> {
        let builder = if self.store.is_some() {
            self
        } else {
            self.urls(token.urls.clone())
        };
        builder.open(&token.name, token.creator_id).await
    }

    fn require_identity(&self) -> Result<SecretKey, SafeError> {
        self.identity
            .clone()
            .ok_or_else(|| anyhow::anyhow!("an identity is required").into())
    }

    async fn connect(&self) -> Result<Arc<dyn Store>, SafeError> {
        match &self.store {
            Some(store) => Ok(store.clone()),
            None => connect_any(&self.urls).await,
        }
    }

    async fn start(
        self,
        identity: SecretKey,
        manifest: Manifest,
        store: Arc<dyn Store>,
    ) -> Result<Safe, SafeError> {
        let index = match self.index {
            Some(index) => index,
            None => match &self.config.db_path {
                Some(path) => Index::new(path).await?,
                None => Index::in_memory().await?,
            },
        };

        tokio::fs::create_dir_all(&self.config.cache_dir).await?;
        let cached = index.cached_size(&manifest.name).await?;
        let cache = CacheManager::new(
            self.config.cache_dir.clone(),
            self.config.cache_ceiling,
            cached,
        );

        identity::publish_identity(store.as_ref(), &identity, &self.config.nick).await?;

        let mut zones = BTreeMap::new();
        for (name, state) in index.load_zones(&manifest.name).await? {
            match serde_json::from_str::<Zone>(&state) {
                Ok(zone) => {
                    zones.insert(name, Arc::new(tokio::sync::Mutex::new(zone)));
                }
                Err(e) => tracing::warn!("ignoring unreadable state of zone {}: {}", name, e),
            }
        }

        let (commands, receiver) = CommandDispatcher::new();
        let tick = self.config.tick_interval_secs;
        let inner = Arc::new(SafeInner {
            name: manifest.name.clone(),
            identity,
            manifest,
            urls: self.urls,
            store: RwLock::new(store),
            index,
            cache,
            config: self.config,
            zones: RwLock::new(zones),
            uploads: Mutex::new(VecDeque::new()),
            commands,
            worker: Mutex::new(None),
            tasks: Mutex::new(JoinSet::new()),
        });

        let worker = tokio::spawn(worker::run_worker(Arc::downgrade(&inner), receiver, tick));
        *inner.worker.lock() = Some(worker);

        let safe = Safe(inner);
        safe.refresh().await;
        tracing::info!(
            "opened safe {} as {} with {} zones",
            safe.name(),
            safe.identity().public(),
            safe.list_zones().len()
        );
        Ok(safe)
    }
}

/// Connect to the first reachable URL.
async fn connect_any(urls: &[String]) -> Result<Arc<dyn Store>, SafeError> {
    for url in urls {
        match blob_store::connect(url).await {
            Ok(store) => return Ok(store),
            Err(e) => tracing::warn!("cannot connect to {}: {}", url, e),
        }
    }
    Err(SafeError::NoStoreAvailable)
}

/// Names of safes and zones are single path segments.
pub(crate) fn validate_name(name: &str) -> Result<(), SafeError> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && !name.contains('/')
        && !name.contains('\\');
    if !valid {
        return Err(SafeError::InvalidName(name.to_string()));
    }
    Ok(())
}

impl Safe {
    /// Create a safe on the first reachable URL.
    pub async fn create(
        identity: SecretKey,
        name: &str,
        urls: Vec<String>,
        config: SafeConfig,
    ) -> Result<Self, SafeError> {
        SafeBuilder::new()
            .identity(identity)
            .urls(urls)
            .config(config)
            .create(name)
            .await
    }

    /// Open the safe described by `token`.
    pub async fn open(
        identity: SecretKey,
        token: &AccessToken,
        config: SafeConfig,
    ) -> Result<Self, SafeError> {
        SafeBuilder::new()
            .identity(identity)
            .config(config)
            .open_token(token)
            .await
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn identity(&self) -> &SecretKey {
        &self.0.identity
    }

    pub fn manifest(&self) -> &Manifest {
        &self.0.manifest
    }

    pub fn index(&self) -> &Index {
        &self.0.index
    }

    pub fn cache(&self) -> &CacheManager {
        &self.0.cache
    }

    pub fn config(&self) -> &SafeConfig {
        &self.0.config
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.0.store.read().clone()
    }

    /// Token giving access to this safe, sealed for `recipient` when given.
    pub fn token(&self, recipient: Option<&PublicKey>) -> Result<String, SafeError> {
        let urls = if self.0.urls.is_empty() {
            vec![self.store().url().to_string()]
        } else {
            self.0.urls.clone()
        };
        let token = AccessToken::new(self.name(), self.manifest().creator_id, urls);
        Ok(token.encode(recipient)?)
    }

    /// Identity records of everyone who opened the safe.
    pub async fn identities(&self) -> Result<Vec<IdentityRecord>, SafeError> {
        identity::list_identities(self.store().as_ref()).await
    }

    /// Queue a command for the background worker.
    pub fn schedule(&self, command: Command) -> Result<(), SafeError> {
        Ok(self.0.commands.dispatch(command)?)
    }

    /// Run a command on the background worker and wait for it.
    pub async fn run(&self, command: Command) -> Result<(), SafeError> {
        Ok(self.0.commands.dispatch_and_wait(command).await?)
    }

    /// Write every queued asynchronous upload.
    pub async fn flush(&self) -> Result<(), SafeError> {
        self.run(Command::FlushUploads).await
    }

    /// Stop the worker after flushing uploads, wait for background tasks and close the store.
    pub async fn close(&self) -> Result<(), SafeError> {
        if let Err(e) = self.0.commands.dispatch_and_wait(Command::Shutdown).await {
            tracing::debug!("worker of {} already stopped: {}", self.name(), e);
        }
        let worker = self.0.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::warn!("worker of {} ended abnormally: {}", self.name(), e);
            }
        }

        let mut tasks = std::mem::take(&mut *self.0.tasks.lock());
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::warn!("background task of {} failed: {}", self.name(), e);
            }
        }

        self.store().close().await?;
        tracing::info!("closed safe {}", self.name());
        Ok(())
    }

    /// Replace the store with the first reachable URL.
    pub(crate) async fn reconnect(&self) -> Result<(), SafeError> {
        if self.0.urls.is_empty() {
            tracing::debug!("safe {} has no URLs to reconnect to", self.name());
            return Ok(());
        }
        let store = connect_any(&self.0.urls).await?;
        tracing::info!("safe {} reconnected to {}", self.name(), store.url());
        let previous = std::mem::replace(&mut *self.0.store.write(), store);
        if let Err(e) = previous.close().await {
            tracing::debug!("cannot close previous store: {}", e);
        }
        Ok(())
    }

    pub(crate) fn spawn_task<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.0.tasks.lock().spawn(task);
    }

    fn quota_group(&self) -> &str {
        &self.0.manifest.quota_group
    }

    /// Mark `zone` as changed for other readers.
    pub(crate) async fn touch(&self, zone: &str) -> Result<(), SafeError> {
        let value = key_id::next_id(0).to_string();
        self.store()
            .write(&format!("{zone}/{TOUCH_FILE}"), value.into(), None)
            .await?;
        Ok(())
    }
}
