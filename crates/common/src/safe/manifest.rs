use blob_store::Store;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::{PublicKey, SecretKey};

use super::acl::{read_signed, write_signed};
use super::error::SafeError;

pub const MANIFEST_PATH: &str = "manifest.json";

/// Safe-wide settings, signed by the creator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub name: String,
    pub creator_id: PublicKey,
    #[serde(default)]
    pub description: String,
    /// Zero means no quota
    #[serde(default)]
    pub quota: u64,
    pub quota_group: String,
    pub created: DateTime<Utc>,
}

impl Manifest {
    pub async fn write(&self, store: &dyn Store, identity: &SecretKey) -> Result<(), SafeError> {
        write_signed(store, identity, MANIFEST_PATH, serde_json::to_vec(self)?).await
    }

    /// Read the manifest and check it was signed by `creator_id`.
    pub async fn read(store: &dyn Store, creator_id: &PublicKey) -> Result<Self, SafeError> {
        let (data, signed_by) = read_signed(store, MANIFEST_PATH).await?;
        let manifest: Manifest = serde_json::from_slice(&data)?;
        if signed_by != *creator_id || manifest.creator_id != *creator_id {
            return Err(SafeError::SignatureMismatch(format!(
                "{MANIFEST_PATH}: not signed by creator {creator_id}"
            )));
        }
        Ok(manifest)
    }

    pub async fn exists(store: &dyn Store) -> Result<bool, SafeError> {
        match store.stat(MANIFEST_PATH).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_manifest_signed_by_creator() {
        let store = blob_store::connect("mem://manifest-test").await.unwrap();
        let creator = SecretKey::generate();
        let other = SecretKey::generate();
        assert!(!Manifest::exists(store.as_ref()).await.unwrap());

        let manifest = Manifest {
            name: "family".to_string(),
            creator_id: creator.public(),
            description: "photos".to_string(),
            quota: 1024,
            quota_group: "family".to_string(),
            created: Utc::now(),
        };
        manifest.write(store.as_ref(), &creator).await.unwrap();
        assert!(Manifest::exists(store.as_ref()).await.unwrap());

        let back = Manifest::read(store.as_ref(), &creator.public()).await.unwrap();
        assert_eq!(back, manifest);
        assert!(matches!(
            Manifest::read(store.as_ref(), &other.public()).await,
            Err(SafeError::SignatureMismatch(_))
        ));

        // rewritten by someone else
        manifest.write(store.as_ref(), &other).await.unwrap();
        assert!(matches!(
            Manifest::read(store.as_ref(), &creator.public()).await,
            Err(SafeError::SignatureMismatch(_))
        ));
    }
}
