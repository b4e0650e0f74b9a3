//! Signed permission chains
//!
//! Membership of a zone is a log of [`PermissionChange`]s. Each change carries
//! a delta of user permissions, is signed by its author and links to the hash
//! of the change before it. Replaying the log with [`get_users`] yields the
//! effective permission of every user.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::BitOr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::{self, signature_hex, PublicKey, SecretKey, Signature};

/// Permission bitmask held by a user on a zone
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permission(u8);

impl Permission {
    pub const NONE: Permission = Permission(0);
    pub const USER: Permission = Permission(1);
    pub const ADMIN: Permission = Permission(2);

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn contains(&self, other: Permission) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn is_user(&self) -> bool {
        self.contains(Self::USER)
    }

    pub fn is_admin(&self) -> bool {
        self.contains(Self::ADMIN)
    }
}

impl BitOr for Permission {
    type Output = Permission;
    fn bitor(self, rhs: Self) -> Self::Output {
        Permission(self.0 | rhs.0)
    }
}

/// Effective permission per user
pub type Users = BTreeMap<PublicKey, Permission>;

/// One signed step of a permission chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionChange {
    /// Hex SHA-384 of the previous change, empty for the first
    pub origin: String,
    pub users: Users,
    pub mod_time: DateTime<Utc>,
    pub by: PublicKey,
    #[serde(with = "signature_hex")]
    pub signature: Signature,
}

impl PermissionChange {
    /// The bytes covered by the signature.
    fn digest(users: &Users, by: &PublicKey, mod_time: &DateTime<Utc>) -> Vec<u8> {
        let mut data = Vec::new();
        for (user, permission) in users {
            data.extend_from_slice(user.to_hex().as_bytes());
            data.push(permission.bits());
        }
        data.extend_from_slice(by.to_hex().as_bytes());
        data.extend_from_slice(
            mod_time
                .to_rfc3339_opts(SecondsFormat::Nanos, true)
                .as_bytes(),
        );
        crypto::sha384(&data)
    }

    /// Hash linking the next change in the chain to this one.
    pub fn hash(&self) -> String {
        let mut data = Self::digest(&self.users, &self.by, &self.mod_time);
        data.extend_from_slice(&self.signature.to_bytes());
        hex::encode(crypto::sha384(&data))
    }

    pub fn verify(&self) -> bool {
        let digest = Self::digest(&self.users, &self.by, &self.mod_time);
        self.by.verify(&digest, &self.signature).is_ok()
    }
}

/// Build and sign a change applying `users` on top of `origin`.
pub fn create_permission_change(
    origin: Option<&PermissionChange>,
    signer: &SecretKey,
    users: Users,
) -> PermissionChange {
    let by = signer.public();
    let mod_time = Utc::now();
    let digest = PermissionChange::digest(&users, &by, &mod_time);
    PermissionChange {
        origin: origin.map(|c| c.hash()).unwrap_or_default(),
        users,
        mod_time,
        by,
        signature: signer.sign(&digest),
    }
}

fn sort_chain(chain: &mut [PermissionChange]) {
    chain.sort_by(|a, b| {
        a.mod_time
            .cmp(&b.mod_time)
            .then_with(|| a.signature.to_bytes().cmp(&b.signature.to_bytes()))
    });
}

/// Replay `chain` starting from `root` as the only admin.
///
/// A change is applied only when its signature verifies and its author is an
/// admin in the state accumulated so far. Invalid changes are dropped from the
/// returned chain.
pub fn get_users(root: &PublicKey, chain: &[PermissionChange]) -> (Users, Vec<PermissionChange>) {
    let mut sorted = chain.to_vec();
    sort_chain(&mut sorted);

    let mut users = Users::new();
    users.insert(*root, Permission::ADMIN);
    let mut clean = Vec::with_capacity(sorted.len());

    for change in sorted {
        let author_is_admin = users.get(&change.by).is_some_and(|p| p.is_admin());
        if !author_is_admin || !change.verify() {
            tracing::debug!(
                "dropping permission change by {} at {}",
                change.by,
                change.mod_time
            );
            continue;
        }
        for (user, permission) in &change.users {
            if *permission == Permission::NONE {
                users.remove(user);
            } else {
                users.insert(*user, *permission);
            }
        }
        clean.push(change);
    }

    (users, clean)
}

/// Union of two chains, deduplicated by signature and sorted for replay.
pub fn merge_chains(a: &[PermissionChange], b: &[PermissionChange]) -> Vec<PermissionChange> {
    let mut seen = BTreeSet::new();
    let mut merged: Vec<PermissionChange> = a
        .iter()
        .chain(b.iter())
        .filter(|c| seen.insert(c.signature.to_bytes()))
        .cloned()
        .collect();
    sort_chain(&mut merged);
    merged
}
