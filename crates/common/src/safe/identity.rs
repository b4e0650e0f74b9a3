//! Identity records published under `users/<userId>/.user`.

use blob_store::{Filter, Store};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::{PublicKey, SecretKey};

use super::acl::{read_signed, write_signed};
use super::error::SafeError;

pub const USERS_DIR: &str = "users";
const IDENTITY_FILE: &str = ".user";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityRecord {
    pub id: PublicKey,
    #[serde(default)]
    pub nick: String,
    pub mod_time: DateTime<Utc>,
}

pub fn user_dir(id: &PublicKey) -> String {
    format!("{USERS_DIR}/{id}")
}

fn record_path(id: &PublicKey) -> String {
    format!("{}/{IDENTITY_FILE}", user_dir(id))
}

/// Publish the record of `identity` unless an identical nick is already there.
pub async fn publish_identity(
    store: &dyn Store,
    identity: &SecretKey,
    nick: &str,
) -> Result<IdentityRecord, SafeError> {
    let id = identity.public();
    if let Ok(existing) = read_identity(store, &id).await {
        if existing.nick == nick {
            return Ok(existing);
        }
    }

    let record = IdentityRecord {
        id,
        nick: nick.to_string(),
        mod_time: Utc::now(),
    };
    write_signed(store, identity, &record_path(&id), serde_json::to_vec(&record)?).await?;
    tracing::debug!("published identity {}", id);
    Ok(record)
}

/// Read the record of `id`, which must be signed by `id` itself.
pub async fn read_identity(store: &dyn Store, id: &PublicKey) -> Result<IdentityRecord, SafeError> {
    let path = record_path(id);
    let (data, signed_by) = read_signed(store, &path).await?;
    let record: IdentityRecord = serde_json::from_slice(&data)?;
    if signed_by != *id || record.id != *id {
        return Err(SafeError::SignatureMismatch(path));
    }
    Ok(record)
}

/// Every valid identity record in the store.
pub async fn list_identities(store: &dyn Store) -> Result<Vec<IdentityRecord>, SafeError> {
    let mut records = Vec::new();
    for entry in store.read_dir(USERS_DIR, &Filter::folders()).await? {
        let Ok(id) = PublicKey::from_hex(&entry.name) else {
            tracing::warn!("skipping unexpected folder {}/{}", USERS_DIR, entry.name);
            continue;
        };
        match read_identity(store, &id).await {
            Ok(record) => records.push(record),
            Err(e) => tracing::warn!("skipping identity {}: {}", id, e),
        }
    }
    Ok(records)
}
