//! Zone keystore objects
//!
//! An ACL publishes one key epoch of a zone: the symmetric key wrapped for every
//! user of the zone, together with the permission chain that grants them access.
//! Each ACL is stored at `<zone>/<aclId>.acl` next to a detached signature at
//! `<zone>/<aclId>.acl.sig`. Readers only trust an ACL whose signer is an admin
//! according to the chain embedded in the ACL itself.

use std::collections::BTreeMap;

use blob_store::Store;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::crypto::{self, signature_hex, PublicKey, Secret, SecretKey, SecretShare, Signature};

use super::error::SafeError;
use super::key_id::next_id;
use super::permission::{get_users, PermissionChange};

pub const ACL_SUFFIX: &str = ".acl";
pub const SIGNATURE_SUFFIX: &str = ".sig";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Acl {
    pub creator_id: PublicKey,
    pub key_id: u64,
    pub key_values: BTreeMap<PublicKey, SecretShare>,
    pub permission_chain: Vec<PermissionChange>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AclSignature {
    pub signed_by: PublicKey,
    #[serde(with = "signature_hex")]
    pub signature: Signature,
}

impl Acl {
    /// Wrap `key_value` for every user holding the user bit in `chain`.
    pub fn new(
        creator_id: PublicKey,
        chain: Vec<PermissionChange>,
        key_id: u64,
        key_value: &Secret,
    ) -> Result<Self, SafeError> {
        let (users, permission_chain) = get_users(&creator_id, &chain);
        let mut key_values = BTreeMap::new();
        for (user, permission) in users {
            if permission.is_user() {
                key_values.insert(user, SecretShare::new(key_value, &user)?);
            }
        }
        Ok(Self {
            creator_id,
            key_id,
            key_values,
            permission_chain,
        })
    }

    /// Unwrap this identity's copy of the key, if it has one.
    pub fn extract_key_value(&self, identity: &SecretKey) -> Option<Secret> {
        let share = self.key_values.get(&identity.public())?;
        match share.recover(identity) {
            Ok(secret) => Some(secret),
            Err(e) => {
                tracing::debug!("cannot unwrap key {}: {}", self.key_id, e);
                None
            }
        }
    }
}

fn acl_path(zone: &str, name: &str) -> String {
    format!("{zone}/{name}")
}

/// Write `data` at `path` and its detached signature at `<path>.sig`.
pub(crate) async fn write_signed(
    store: &dyn Store,
    identity: &SecretKey,
    path: &str,
    data: Vec<u8>,
) -> Result<(), SafeError> {
    let signature = AclSignature {
        signed_by: identity.public(),
        signature: crypto::sign_digest(identity, &data),
    };
    store.write(path, data.into(), None).await?;
    store
        .write(
            &format!("{path}{SIGNATURE_SUFFIX}"),
            serde_json::to_vec(&signature)?.into(),
            None,
        )
        .await?;
    Ok(())
}

/// Read `path` and check its detached signature, returning the data and the signer.
///
/// A missing, malformed or non matching signature is a [`SafeError::SignatureMismatch`].
pub(crate) async fn read_signed(
    store: &dyn Store,
    path: &str,
) -> Result<(Bytes, PublicKey), SafeError> {
    let mismatch = |reason: String| SafeError::SignatureMismatch(format!("{path}: {reason}"));

    let signature = store
        .read(&format!("{path}{SIGNATURE_SUFFIX}"), None, None)
        .await
        .map_err(|e| mismatch(e.to_string()))?;
    let signature: AclSignature =
        serde_json::from_slice(&signature).map_err(|e| mismatch(e.to_string()))?;

    let data = store.read(path, None, None).await?;
    if !crypto::verify_digest(&signature.signed_by, &data, &signature.signature) {
        return Err(mismatch("signature does not verify".to_string()));
    }
    Ok((data, signature.signed_by))
}

/// Sign and write `acl` to the store, returning its file name.
pub async fn write_acl(
    store: &dyn Store,
    identity: &SecretKey,
    zone: &str,
    acl: &Acl,
) -> Result<String, SafeError> {
    let name = format!("{}{}", next_id(acl.key_id), ACL_SUFFIX);
    write_signed(store, identity, &acl_path(zone, &name), serde_json::to_vec(acl)?).await?;
    tracing::debug!("wrote ACL {} for key {} in zone {}", name, acl.key_id, zone);
    Ok(name)
}

/// Read and validate the ACL `name` in `zone`.
///
/// Fails with [`SafeError::InvalidACL`] when the signature is missing or
/// does not verify, or when the signer is not an admin of the embedded chain.
pub async fn read_acl(store: &dyn Store, zone: &str, name: &str) -> Result<Acl, SafeError> {
    let path = acl_path(zone, name);
    let invalid = |reason: String| SafeError::InvalidACL(format!("{path}: {reason}"));

    let (data, signed_by) = read_signed(store, &path).await.map_err(|e| match e {
        SafeError::SignatureMismatch(reason) => SafeError::InvalidACL(reason),
        e => e,
    })?;

    let acl: Acl = serde_json::from_slice(&data).map_err(|e| invalid(e.to_string()))?;
    let (users, _) = get_users(&acl.creator_id, &acl.permission_chain);
    if !users.get(&signed_by).is_some_and(|p| p.is_admin()) {
        return Err(invalid("signer is not an admin".to_string()));
    }

    Ok(acl)
}

/// Delete an ACL and its signature, ignoring failures.
pub async fn delete_acl(store: &dyn Store, zone: &str, name: &str) {
    let path = acl_path(zone, name);
    for p in [format!("{path}{SIGNATURE_SUFFIX}"), path] {
        if let Err(e) = store.delete(&p).await {
            tracing::warn!("cannot delete superseded ACL {}: {}", p, e);
        }
    }
}
