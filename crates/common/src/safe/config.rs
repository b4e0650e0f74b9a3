use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const DEFAULT_CACHE_CEILING: u64 = 128 * 1024 * 1024;
pub const DEFAULT_CACHE_EXPIRE_SECS: u64 = 30 * 24 * 60 * 60;
pub const DEFAULT_MAX_ACL_FILES: usize = 4;
pub const DEFAULT_TICK_INTERVAL_SECS: u64 = 10 * 60;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config error: {0}")]
    Default(#[from] anyhow::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Local settings of a safe handle.
///
/// Loadable from TOML, every field is optional:
///
/// ```toml
/// db_path = "/var/lib/safebox/index.db"
/// cache_dir = "/var/cache/safebox"
/// cache_ceiling = 134217728
/// quota = 1073741824
/// quota_group = "family"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafeConfig {
    /// SQLite index file, in memory when unset
    pub db_path: Option<PathBuf>,
    pub cache_dir: PathBuf,
    /// Bytes of cache files kept before eviction
    pub cache_ceiling: u64,
    pub cache_expire_secs: u64,
    /// ACL objects per zone before compaction is scheduled
    pub max_acl_files: usize,
    pub tick_interval_secs: u64,
    /// Quota written to the manifest on create, zero for none
    pub quota: u64,
    /// Quota group written to the manifest on create, the safe name when unset
    pub quota_group: Option<String>,
    /// Description written to the manifest on create
    pub description: String,
    /// Nick published in this identity's record
    pub nick: String,
}

impl Default for SafeConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            cache_dir: std::env::temp_dir().join("safebox-cache"),
            cache_ceiling: DEFAULT_CACHE_CEILING,
            cache_expire_secs: DEFAULT_CACHE_EXPIRE_SECS,
            max_acl_files: DEFAULT_MAX_ACL_FILES,
            tick_interval_secs: DEFAULT_TICK_INTERVAL_SECS,
            quota: 0,
            quota_group: None,
            description: String::new(),
            nick: String::new(),
        }
    }
}

impl SafeConfig {
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }
}
