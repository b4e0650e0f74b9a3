//! Zones: access-scoped partitions of a safe.
//!
//! The state of a zone is rebuilt from the ACL objects found in its folder.
//! Every ACL carries the whole permission chain and one key epoch wrapped for
//! each user, so reading any subset of them converges to the same users.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use blob_store::{Filter, Store};
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;

use crate::crypto::{self, PublicKey, Secret, SecretKey, Signature};

use super::acl::{delete_acl, read_acl, write_acl, Acl, ACL_SUFFIX};
use super::error::SafeError;
use super::events::{receive_events, send_event, Event};
use super::identity::USERS_DIR;
use super::jobs::Command;
use super::key_id::next_id;
use super::sync::read_touch;
use super::permission::{
    create_permission_change, get_users, merge_chains, Permission, PermissionChange, Users,
};
use super::{validate_name, Safe};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Zone {
    pub name: String,
    pub creator_id: PublicKey,
    /// Hex signature of the name by the creator
    #[serde(default)]
    pub name_signature: String,
    pub users: Users,
    pub permission_chain: Vec<PermissionChange>,
    /// ACL objects already merged
    pub acl_files: BTreeSet<String>,
    /// Active epoch used for new header batches
    pub key_id: u64,
    pub key_value: Secret,
    /// Every epoch this identity could unwrap
    pub keys: BTreeMap<u64, Secret>,
    /// Touch stamp of the zone when its ACLs were last merged
    #[serde(default)]
    pub touch: Option<String>,
}

impl Zone {
    pub fn new(name: &str, creator_id: PublicKey, name_signature: String) -> Self {
        let mut users = Users::new();
        users.insert(creator_id, Permission::ADMIN);
        Self {
            name: name.to_string(),
            creator_id,
            name_signature,
            users,
            permission_chain: Vec::new(),
            acl_files: BTreeSet::new(),
            key_id: 0,
            key_value: Secret::default(),
            keys: BTreeMap::new(),
            touch: None,
        }
    }

    pub fn permission(&self, id: &PublicKey) -> Permission {
        self.users.get(id).copied().unwrap_or(Permission::NONE)
    }

    /// Merge ACL objects not seen yet. Returns whether the state changed.
    ///
    /// Fails with [`SafeError::ZoneNoAuth`] when `identity` is not a user or
    /// holds no key of the zone.
    pub async fn sync(&mut self, store: &dyn Store, identity: &SecretKey) -> Result<bool, SafeError> {
        let listed: BTreeSet<String> = store
            .read_dir(&self.name, &Filter::suffix(ACL_SUFFIX))
            .await?
            .into_iter()
            .map(|e| e.name)
            .collect();

        let known = self.acl_files.len();
        self.acl_files.retain(|name| listed.contains(name));
        let mut changed = known != self.acl_files.len();

        let mut chain = self.permission_chain.clone();
        for name in listed.difference(&self.acl_files.clone()) {
            let acl = match read_acl(store, &self.name, name).await {
                Ok(acl) => acl,
                Err(e) => {
                    tracing::warn!("skipping ACL {} of zone {}: {}", name, self.name, e);
                    continue;
                }
            };
            if acl.creator_id != self.creator_id {
                tracing::warn!(
                    "skipping ACL {} of zone {}: created by {} instead of {}",
                    name,
                    self.name,
                    acl.creator_id,
                    self.creator_id
                );
                continue;
            }

            chain = merge_chains(&chain, &acl.permission_chain);
            if let Some(key) = acl.extract_key_value(identity) {
                self.keys.insert(acl.key_id, key);
            }
            self.acl_files.insert(name.clone());
            changed = true;
        }

        if changed {
            let (users, clean) = get_users(&self.creator_id, &chain);
            self.users = users;
            self.permission_chain = clean;
            if let Some((key_id, key_value)) = self.keys.last_key_value() {
                self.key_id = *key_id;
                self.key_value = key_value.clone();
            }
            tracing::debug!(
                "zone {} now has {} users and {} keys",
                self.name,
                self.users.len(),
                self.keys.len()
            );
        }

        if !self.permission(&identity.public()).is_user() || self.keys.is_empty() {
            return Err(SafeError::ZoneNoAuth(self.name.clone()));
        }
        Ok(changed)
    }

    pub fn needs_compaction(&self, max_acl_files: usize) -> bool {
        self.acl_files.len() > max_acl_files
    }

    /// Write an ACL for `chain`.
    ///
    /// With `rotate` a fresh epoch is generated and every earlier ACL object
    /// is deleted once the new one is written. Otherwise the active key is
    /// wrapped again for the users of `chain`.
    pub async fn write_epoch(
        &mut self,
        store: &dyn Store,
        identity: &SecretKey,
        chain: Vec<PermissionChange>,
        rotate: bool,
    ) -> Result<(), SafeError> {
        let (key_id, key_value) = if rotate || self.keys.is_empty() {
            (next_id(self.key_id), Secret::generate())
        } else {
            (self.key_id, self.key_value.clone())
        };

        let acl = Acl::new(self.creator_id, chain, key_id, &key_value)?;
        let name = write_acl(store, identity, &self.name, &acl).await?;

        if rotate {
            for old in std::mem::take(&mut self.acl_files) {
                delete_acl(store, &self.name, &old).await;
            }
        }
        self.acl_files.insert(name);

        let (users, clean) = get_users(&self.creator_id, &acl.permission_chain);
        self.users = users;
        self.permission_chain = clean;
        self.keys.insert(key_id, key_value.clone());
        self.key_id = key_id;
        self.key_value = key_value;
        Ok(())
    }
}

fn validate_zone_name(name: &str) -> Result<(), SafeError> {
    validate_name(name)?;
    if name == USERS_DIR || name.ends_with(".json") || name.ends_with(".sig") {
        return Err(SafeError::InvalidName(name.to_string()));
    }
    Ok(())
}

impl Safe {
    pub fn list_zones(&self) -> Vec<String> {
        self.0.zones.read().keys().cloned().collect()
    }

    fn zone_handle(&self, name: &str) -> Result<Arc<tokio::sync::Mutex<Zone>>, SafeError> {
        self.0
            .zones
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| SafeError::ZoneNotExist(name.to_string()))
    }

    /// Lock `name` after merging new ACL objects into it.
    pub(crate) async fn lock_zone(&self, name: &str) -> Result<OwnedMutexGuard<Zone>, SafeError> {
        self.lock_zone_with(name, true).await
    }

    async fn lock_zone_with(
        &self,
        name: &str,
        schedule_compaction: bool,
    ) -> Result<OwnedMutexGuard<Zone>, SafeError> {
        let mut zone = self.zone_handle(name)?.lock_owned().await;
        let store = self.store();

        // ACL writers always touch the zone afterwards
        let touch = read_touch(store.as_ref(), name).await?;
        if touch.is_some() && touch == zone.touch {
            return Ok(zone);
        }

        match zone.sync(store.as_ref(), self.identity()).await {
            Ok(changed) => {
                let seen = zone.touch != touch;
                zone.touch = touch;
                if changed || seen {
                    self.save_zone(&zone).await?;
                }
            }
            Err(SafeError::ZoneNoAuth(_)) => {
                tracing::info!("access to zone {} was revoked", name);
                drop(zone);
                self.forget_zone(name).await?;
                return Err(SafeError::ZoneNoAuth(name.to_string()));
            }
            Err(e) => return Err(e),
        }

        if schedule_compaction
            && zone.needs_compaction(self.config().max_acl_files)
            && zone.permission(&self.identity().public()).is_admin()
        {
            let command = Command::Compact {
                zone: name.to_string(),
            };
            if let Err(e) = self.schedule(command) {
                tracing::debug!("cannot schedule compaction of zone {}: {}", name, e);
            }
        }
        Ok(zone)
    }

    pub(crate) async fn save_zone(&self, zone: &Zone) -> Result<(), SafeError> {
        let state = serde_json::to_string(zone)?;
        self.index().save_zone(self.name(), &zone.name, &state).await?;
        Ok(())
    }

    async fn forget_zone(&self, name: &str) -> Result<(), SafeError> {
        self.0.zones.write().remove(name);
        self.index().delete_zone(self.name(), name).await?;
        Ok(())
    }

    fn insert_zone(&self, zone: Zone) {
        self.0
            .zones
            .write()
            .insert(zone.name.clone(), Arc::new(tokio::sync::Mutex::new(zone)));
    }

    /// Create a zone owned by this identity and grant `users` on it.
    pub async fn create_zone(&self, name: &str, users: Users) -> Result<(), SafeError> {
        validate_zone_name(name)?;
        if self.0.zones.read().contains_key(name) {
            return Err(SafeError::ZoneExist(name.to_string()));
        }
        let store = self.store();
        let acls = store.read_dir(name, &Filter::suffix(ACL_SUFFIX)).await?;
        if !acls.is_empty() {
            return Err(SafeError::ZoneExist(name.to_string()));
        }

        let identity = self.identity();
        let me = identity.public();
        let mut delta = users;
        delta.insert(me, Permission::USER | Permission::ADMIN);

        let name_signature =
            hex::encode(crypto::sign_digest(identity, name.as_bytes()).to_bytes());
        let mut zone = Zone::new(name, me, name_signature);
        let change = create_permission_change(None, identity, delta.clone());
        zone.write_epoch(store.as_ref(), identity, vec![change], true)
            .await?;

        self.save_zone(&zone).await?;
        self.touch(name).await?;
        self.notify_users(&zone, &Users::new(), &delta).await;
        tracing::info!("created zone {} in safe {}", name, self.name());
        self.insert_zone(zone);
        Ok(())
    }

    /// Join an existing zone created by `creator_id`.
    pub async fn add_zone(&self, name: &str, creator_id: PublicKey) -> Result<(), SafeError> {
        validate_zone_name(name)?;
        self.join_zone(name, creator_id, String::new()).await
    }

    async fn join_zone(
        &self,
        name: &str,
        creator_id: PublicKey,
        name_signature: String,
    ) -> Result<(), SafeError> {
        if self.0.zones.read().contains_key(name) {
            return Ok(());
        }

        let store = self.store();
        if store
            .read_dir(name, &Filter::suffix(ACL_SUFFIX))
            .await?
            .is_empty()
        {
            return Err(SafeError::ZoneNotExist(name.to_string()));
        }

        let mut zone = Zone::new(name, creator_id, name_signature);
        zone.sync(store.as_ref(), self.identity()).await?;
        self.save_zone(&zone).await?;
        tracing::info!("joined zone {} in safe {}", name, self.name());
        self.insert_zone(zone);
        Ok(())
    }

    /// Join the zones found in the store that this identity can read but does not track yet.
    pub(crate) async fn discover_zones(&self) -> Result<(), SafeError> {
        let store = self.store();
        for folder in store.read_dir("", &Filter::folders()).await? {
            let name = folder.name;
            let known = self.0.zones.read().contains_key(&name);
            if known || validate_zone_name(&name).is_err() {
                continue;
            }
            let Some(creator_id) = zone_creator(store.as_ref(), &name).await? else {
                continue;
            };
            match self.join_zone(&name, creator_id, String::new()).await {
                Ok(()) => {}
                Err(SafeError::ZoneNoAuth(_)) => {
                    tracing::trace!("zone {} is not shared with this identity", name)
                }
                Err(e) => tracing::warn!("cannot join discovered zone {}: {}", name, e),
            }
        }
        Ok(())
    }

    /// Current users of a zone.
    pub async fn get_users(&self, zone: &str) -> Result<Users, SafeError> {
        let zone = self.lock_zone(zone).await?;
        Ok(zone.users.clone())
    }

    /// Apply `users` to a zone. A `NONE` permission revokes.
    ///
    /// Revoking anybody rotates the zone key, so the revoked identity cannot
    /// read anything written afterwards.
    pub async fn set_users(&self, zone_name: &str, users: Users) -> Result<(), SafeError> {
        let mut zone = self.lock_zone(zone_name).await?;
        let identity = self.identity();
        let me = identity.public();
        if !zone.permission(&me).is_admin() {
            return Err(SafeError::ZoneNoAdmin(zone_name.to_string()));
        }

        let before = zone.users.clone();
        let change = create_permission_change(zone.permission_chain.last(), identity, users.clone());
        let mut chain = zone.permission_chain.clone();
        chain.push(change);

        let (after, _) = get_users(&zone.creator_id, &chain);
        if !after.values().any(|p| p.is_admin()) {
            return Err(SafeError::NoAdminLeft(zone_name.to_string()));
        }
        let revoked = before
            .iter()
            .filter(|(_, p)| p.is_user())
            .any(|(user, _)| !after.get(user).is_some_and(|p| p.is_user()));

        let store = self.store();
        zone.write_epoch(store.as_ref(), identity, chain, revoked)
            .await?;
        self.save_zone(&zone).await?;
        self.touch(zone_name).await?;
        self.notify_users(&zone, &before, &users).await;

        tracing::info!(
            "updated users of zone {}{}",
            zone_name,
            if revoked { " with key rotation" } else { "" }
        );
        Ok(())
    }

    /// Consolidate the ACL objects of a zone under a fresh epoch.
    ///
    /// Only admins can write ACLs, other identities skip.
    pub(crate) async fn compact_zone(&self, name: &str) -> Result<(), SafeError> {
        let mut zone = self.lock_zone_with(name, false).await?;
        if zone.acl_files.len() <= 1 {
            return Ok(());
        }
        let identity = self.identity();
        if !zone.permission(&identity.public()).is_admin() {
            tracing::debug!("not compacting zone {}: not an admin", name);
            return Ok(());
        }

        let count = zone.acl_files.len();
        let chain = zone.permission_chain.clone();
        let store = self.store();
        zone.write_epoch(store.as_ref(), identity, chain, true)
            .await?;
        self.save_zone(&zone).await?;
        self.touch(name).await?;
        tracing::info!("compacted {} ACL objects of zone {}", count, name);
        Ok(())
    }

    /// Compact a zone on the background worker and wait for it.
    pub async fn compact(&self, zone: &str) -> Result<(), SafeError> {
        self.zone_handle(zone)?;
        self.run(Command::Compact {
            zone: zone.to_string(),
        })
        .await
    }

    /// Tell identities that gained access to `zone`.
    async fn notify_users(&self, zone: &Zone, before: &Users, delta: &Users) {
        let me = self.identity().public();
        let store = self.store();
        for (user, permission) in delta {
            let already = before.get(user).is_some_and(|p| p.is_user());
            if !permission.is_user() || already || *user == me {
                continue;
            }
            let event = Event::ZoneSubscription {
                creator_id: zone.creator_id,
                zone_name: zone.name.clone(),
                name_signature: zone.name_signature.clone(),
            };
            if let Err(e) = send_event(store.as_ref(), self.identity(), user, event).await {
                tracing::warn!("cannot notify {} about zone {}: {}", user, zone.name, e);
            }
        }
    }

    /// Act on the events waiting for this identity.
    pub(crate) async fn process_events(&self) -> Result<(), SafeError> {
        let events = receive_events(self.store().as_ref(), self.identity()).await?;
        for (sender, event) in events {
            match event {
                Event::ZoneSubscription {
                    creator_id,
                    zone_name,
                    name_signature,
                } => {
                    if !valid_name_signature(&creator_id, &zone_name, &name_signature) {
                        tracing::warn!(
                            "ignoring subscription to zone {} from {}: bad name signature",
                            zone_name,
                            sender
                        );
                        continue;
                    }
                    if let Err(e) = self.join_zone(&zone_name, creator_id, name_signature).await {
                        tracing::warn!("cannot join zone {}: {}", zone_name, e);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Creator named by the first valid ACL of `zone`.
async fn zone_creator(store: &dyn Store, zone: &str) -> Result<Option<PublicKey>, SafeError> {
    for entry in store.read_dir(zone, &Filter::suffix(ACL_SUFFIX)).await? {
        match read_acl(store, zone, &entry.name).await {
            Ok(acl) => return Ok(Some(acl.creator_id)),
            Err(e) => tracing::debug!("skipping ACL {} of zone {}: {}", entry.name, zone, e),
        }
    }
    Ok(None)
}

fn valid_name_signature(creator_id: &PublicKey, name: &str, signature: &str) -> bool {
    let Ok(bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&bytes) else {
        return false;
    };
    crypto::verify_digest(creator_id, name.as_bytes(), &signature)
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_sync_merges_acls() {
        let store = blob_store::connect("mem://zone-sync").await.unwrap();
        let alice = SecretKey::generate();
        let bob = SecretKey::generate();

        let mut users = Users::new();
        users.insert(alice.public(), Permission::USER | Permission::ADMIN);
        users.insert(bob.public(), Permission::USER);
        let change = create_permission_change(None, &alice, users);

        let mut zone = Zone::new("main", alice.public(), String::new());
        zone.write_epoch(store.as_ref(), &alice, vec![change], true)
            .await
            .unwrap();

        let mut seen_by_bob = Zone::new("main", alice.public(), String::new());
        assert!(seen_by_bob.sync(store.as_ref(), &bob).await.unwrap());
        assert_eq!(seen_by_bob.users, zone.users);
        assert_eq!(seen_by_bob.key_id, zone.key_id);
        assert_eq!(seen_by_bob.key_value, zone.key_value);
        assert!(!seen_by_bob.sync(store.as_ref(), &bob).await.unwrap());

        let mut stranger = Zone::new("main", alice.public(), String::new());
        assert!(matches!(
            stranger.sync(store.as_ref(), &SecretKey::generate()).await,
            Err(SafeError::ZoneNoAuth(_))
        ));
    }

    #[tokio::test]
    async fn test_rotation_deletes_old_acls() {
        let store = blob_store::connect("mem://zone-rotate").await.unwrap();
        let alice = SecretKey::generate();
        let mut users = Users::new();
        users.insert(alice.public(), Permission::USER | Permission::ADMIN);
        let change = create_permission_change(None, &alice, users);

        let mut zone = Zone::new("main", alice.public(), String::new());
        zone.write_epoch(store.as_ref(), &alice, vec![change.clone()], true)
            .await
            .unwrap();
        let first = zone.key_id;
        zone.write_epoch(store.as_ref(), &alice, vec![change.clone()], false)
            .await
            .unwrap();
        assert_eq!(zone.key_id, first);
        assert_eq!(zone.acl_files.len(), 2);

        zone.write_epoch(store.as_ref(), &alice, vec![change], true)
            .await
            .unwrap();
        assert!(zone.key_id > first);
        assert_eq!(zone.acl_files.len(), 1);
        assert_eq!(zone.keys.len(), 2);

        let listed = store
            .read_dir("main", &Filter::suffix(ACL_SUFFIX))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[test]
    fn test_name_signature() {
        let alice = SecretKey::generate();
        let signature = hex::encode(crypto::sign_digest(&alice, b"main").to_bytes());
        assert!(valid_name_signature(&alice.public(), "main", &signature));
        assert!(!valid_name_signature(&alice.public(), "other", &signature));
        assert!(!valid_name_signature(&alice.public(), "main", "zz"));
    }

    #[test]
    fn test_zone_names() {
        assert!(validate_zone_name("photos").is_ok());
        assert!(validate_zone_name("users").is_err());
        assert!(validate_zone_name("a/b").is_err());
        assert!(validate_zone_name(".hidden").is_err());
        assert!(validate_zone_name("").is_err());
    }
}
