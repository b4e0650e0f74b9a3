use blob_store::StoreError;

use crate::crypto::{KeyError, SecretError, SecretShareError};
use crate::index::IndexError;

use super::config::ConfigError;
use super::header::HeaderError;
use super::token::TokenError;

#[derive(Debug, thiserror::Error)]
pub enum SafeError {
    #[error("default error: {0}")]
    Default(#[from] anyhow::Error),
    #[error("zone {0} does not exist")]
    ZoneNotExist(String),
    #[error("zone {0} already exists")]
    ZoneExist(String),
    #[error("no access to zone {0}")]
    ZoneNoAuth(String),
    #[error("not admin for zone {0}")]
    ZoneNoAdmin(String),
    #[error("invalid ACL {0}")]
    InvalidACL(String),
    #[error("signature mismatch on {0}")]
    SignatureMismatch(String),
    #[error("no encryption key for epoch {0}")]
    NoEncryptionKey(u64),
    #[error("invalid tag '{0}', tags must be alphanumeric")]
    InvalidTag(String),
    #[error("file {0} does not exist")]
    FileNotExist(String),
    #[error("no store available")]
    NoStoreAvailable,
    #[error("safe {0} already exists")]
    SafeExist(String),
    #[error("change would leave zone {0} without an admin")]
    NoAdminLeft(String),
    #[error("invalid name '{0}'")]
    InvalidName(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    #[error("key error: {0}")]
    Key(#[from] KeyError),
    #[error("secret error: {0}")]
    Secret(#[from] SecretError),
    #[error("share error: {0}")]
    Share(#[from] SecretShareError),
    #[error("header error: {0}")]
    Header(HeaderError),
    #[error("token error: {0}")]
    Token(#[from] TokenError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<HeaderError> for SafeError {
    fn from(e: HeaderError) -> Self {
        match e {
            HeaderError::NoEncryptionKey(key_id) => SafeError::NoEncryptionKey(key_id),
            e => SafeError::Header(e),
        }
    }
}
