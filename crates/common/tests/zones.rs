//! Zone membership: invitations, revocation, compaction and tokens
mod common;

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;

use ::common::crypto::SecretKey;
use ::common::safe::acl::{read_acl, ACL_SUFFIX};
use ::common::safe::header::unmarshal_headers;
use ::common::safe::{AccessToken, Permission, Safe, SafeBuilder, SafeError, Users, Zone};
use blob_store::Filter;

use crate::common::{get_bytes, put_bytes, TestEnv};

fn users(entries: &[(&SecretKey, Permission)]) -> Users {
    entries
        .iter()
        .map(|(key, permission)| (key.public(), *permission))
        .collect()
}

async fn acl_names(safe: &Safe, zone: &str) -> Vec<String> {
    safe.store()
        .read_dir(zone, &Filter::suffix(ACL_SUFFIX))
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect()
}

#[tokio::test]
async fn test_create_zone_errors() {
    let env = TestEnv::new();
    let alice = SecretKey::generate();
    let safe = env.create(&alice, "zones").await;

    safe.create_zone("main", Users::new()).await.unwrap();
    assert!(matches!(
        safe.create_zone("main", Users::new()).await,
        Err(SafeError::ZoneExist(_))
    ));
    assert!(matches!(
        safe.create_zone("users", Users::new()).await,
        Err(SafeError::InvalidName(_))
    ));
    assert!(matches!(
        safe.add_zone("missing", alice.public()).await,
        Err(SafeError::ZoneNotExist(_))
    ));
    assert!(matches!(
        safe.set_users("missing", Users::new()).await,
        Err(SafeError::ZoneNotExist(_))
    ));

    let users = safe.get_users("main").await.unwrap();
    assert_eq!(users.get(&alice.public()), Some(&(Permission::USER | Permission::ADMIN)));
    assert_eq!(safe.list_zones(), vec!["main".to_string()]);

    safe.close().await.unwrap();
}

#[tokio::test]
async fn test_safe_lifecycle() {
    let env = TestEnv::new();
    let alice = SecretKey::generate();
    let bob = SecretKey::generate();
    let safe = env.create(&alice, "lifecycle").await;

    let again = SafeBuilder::new()
        .identity(alice.clone())
        .urls(vec![env.url.clone()])
        .config(env.config(&alice))
        .create("lifecycle")
        .await;
    assert!(matches!(again, Err(SafeError::SafeExist(_))));

    let unreachable = SafeBuilder::new()
        .identity(alice.clone())
        .urls(vec!["ftp://nowhere".to_string()])
        .open("lifecycle", alice.public())
        .await;
    assert!(matches!(unreachable, Err(SafeError::NoStoreAvailable)));

    let wrong_creator = SafeBuilder::new()
        .identity(bob.clone())
        .urls(vec![env.url.clone()])
        .config(env.config(&bob))
        .open("lifecycle", bob.public())
        .await;
    assert!(matches!(wrong_creator, Err(SafeError::SignatureMismatch(_))));

    let bobs = env.open(&bob, &safe).await;
    let mut nicks: Vec<_> = bobs
        .identities()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    nicks.sort();
    let mut expected = vec![alice.public(), bob.public()];
    expected.sort();
    assert_eq!(nicks, expected);

    bobs.close().await.unwrap();
    safe.close().await.unwrap();
}

#[tokio::test]
async fn test_open_with_token() {
    let env = TestEnv::new();
    let alice = SecretKey::generate();
    let bob = SecretKey::generate();
    let safe = env.create(&alice, "tokens").await;
    safe.create_zone("main", users(&[(&bob, Permission::USER)]))
        .await
        .unwrap();
    put_bytes(&safe, "main", "hello.txt", b"hello bob").await;

    let raw = safe.token(Some(&bob.public())).unwrap();
    let token = AccessToken::decode(&raw, Some(&bob)).unwrap();
    assert_eq!(token.name, "tokens");
    assert_eq!(token.creator_id, alice.public());

    let bobs = Safe::open(bob.clone(), &token, env.config(&bob))
        .await
        .unwrap();
    assert_eq!(get_bytes(&bobs, "main", "hello.txt").await, b"hello bob");

    bobs.close().await.unwrap();
    safe.close().await.unwrap();
}

#[tokio::test]
async fn test_add_zone_and_admin_rules() {
    let env = TestEnv::new();
    let alice = SecretKey::generate();
    let bob = SecretKey::generate();
    let carol = SecretKey::generate();
    let safe = env.create(&alice, "admins").await;
    safe.create_zone("main", Users::new()).await.unwrap();

    let bobs = env.open(&bob, &safe).await;
    assert!(bobs.list_zones().is_empty());
    assert!(matches!(
        bobs.add_zone("main", alice.public()).await,
        Err(SafeError::ZoneNoAuth(_))
    ));

    safe.set_users("main", users(&[(&bob, Permission::USER)]))
        .await
        .unwrap();
    bobs.add_zone("main", alice.public()).await.unwrap();
    assert_eq!(bobs.list_zones(), vec!["main".to_string()]);

    assert!(matches!(
        bobs.set_users("main", users(&[(&carol, Permission::USER)]))
            .await,
        Err(SafeError::ZoneNoAdmin(_))
    ));
    assert!(matches!(
        safe.set_users("main", users(&[(&alice, Permission::NONE)]))
            .await,
        Err(SafeError::NoAdminLeft(_))
    ));

    // promoted admins can grant access in turn
    safe.set_users(
        "main",
        users(&[(&bob, Permission::USER | Permission::ADMIN)]),
    )
    .await
    .unwrap();
    bobs.set_users("main", users(&[(&carol, Permission::USER)]))
        .await
        .unwrap();
    let seen = safe.get_users("main").await.unwrap();
    assert_eq!(seen.get(&carol.public()), Some(&Permission::USER));

    bobs.close().await.unwrap();
    safe.close().await.unwrap();
}

#[tokio::test]
async fn test_revocation_rotates_key() {
    let env = TestEnv::new();
    let alice = SecretKey::generate();
    let bob = SecretKey::generate();
    let safe = env.create(&alice, "revoke").await;
    safe.create_zone("main", users(&[(&bob, Permission::USER)]))
        .await
        .unwrap();
    let before = put_bytes(&safe, "main", "before.txt", b"visible to bob").await;

    let store = safe.store();
    let mut bobs_view = Zone::new("main", alice.public(), String::new());
    bobs_view.sync(store.as_ref(), &bob).await.unwrap();
    let old_epoch = bobs_view.key_id;

    let bobs = env.open(&bob, &safe).await;
    assert_eq!(get_bytes(&bobs, "main", "before.txt").await, b"visible to bob");

    safe.set_users("main", users(&[(&bob, Permission::NONE)]))
        .await
        .unwrap();
    let after = put_bytes(&safe, "main", "after.txt", b"secret").await;

    // a single ACL under a new epoch, none of it for bob
    let names = acl_names(&safe, "main").await;
    assert_eq!(names.len(), 1);
    let acl = read_acl(store.as_ref(), "main", &names[0]).await.unwrap();
    assert!(acl.key_id > old_epoch);
    assert!(acl.extract_key_value(&bob).is_none());
    assert!(acl.extract_key_value(&alice).is_some());

    assert!(matches!(
        bobs_view.sync(store.as_ref(), &bob).await,
        Err(SafeError::ZoneNoAuth(_))
    ));
    // keys bob held still open what was written under them
    let batch = |h: &::common::safe::Header| format!("main/{}/{}.h", h.bucket, h.file_id);
    let old_batch = store.read(&batch(&before), None, None).await.unwrap();
    let decoded = unmarshal_headers(&old_batch, &bobs_view.keys).unwrap();
    assert_eq!(decoded[0].name, "before.txt");
    let new_batch = store.read(&batch(&after), None, None).await.unwrap();
    assert!(matches!(
        unmarshal_headers(&new_batch, &bobs_view.keys),
        Err(::common::safe::HeaderError::NoEncryptionKey(_))
    ));

    let mut out = Vec::new();
    assert!(matches!(
        bobs.get("main", "after.txt", &mut out, Default::default())
            .await,
        Err(SafeError::ZoneNoAuth(_))
    ));
    assert!(bobs.list_zones().is_empty());

    bobs.close().await.unwrap();
    safe.close().await.unwrap();
}

#[tokio::test]
async fn test_compaction_preserves_users() {
    let env = TestEnv::new();
    let alice = SecretKey::generate();
    let bob = SecretKey::generate();
    let safe = env.create(&alice, "compact").await;
    safe.create_zone("main", users(&[(&bob, Permission::USER)]))
        .await
        .unwrap();

    let others: Vec<SecretKey> = (0..5).map(|_| SecretKey::generate()).collect();
    for other in &others {
        safe.set_users("main", users(&[(other, Permission::USER)]))
            .await
            .unwrap();
    }
    let before = safe.get_users("main").await.unwrap();
    assert_eq!(before.len(), 7);

    safe.compact("main").await.unwrap();
    assert_eq!(acl_names(&safe, "main").await.len(), 1);
    assert_eq!(safe.get_users("main").await.unwrap(), before);

    // a fresh reader sees the same users and can read new files
    let mut fresh = Zone::new("main", alice.public(), String::new());
    fresh.sync(safe.store().as_ref(), &bob).await.unwrap();
    assert_eq!(fresh.users, before);

    put_bytes(&safe, "main", "after.txt", b"compacted").await;
    let bobs = env.open(&bob, &safe).await;
    assert_eq!(get_bytes(&bobs, "main", "after.txt").await, b"compacted");

    bobs.close().await.unwrap();
    safe.close().await.unwrap();
}

#[tokio::test]
async fn test_permission_chain_survives_reopen() {
    let env = TestEnv::new();
    let alice = SecretKey::generate();
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = env.config(&alice);
    config.db_path = Some(dir.path().join("index.db"));

    let safe = env.create_with(&alice, "persist", config.clone()).await;
    safe.create_zone("main", Users::new()).await.unwrap();
    put_bytes(&safe, "main", "a.txt", b"kept").await;
    safe.close().await.unwrap();
    drop(safe);

    let reopened = SafeBuilder::new()
        .identity(alice.clone())
        .urls(vec![env.url.clone()])
        .config(config)
        .open("persist", alice.public())
        .await
        .unwrap();
    assert_eq!(reopened.list_zones(), vec!["main".to_string()]);
    let mut expected = BTreeMap::new();
    expected.insert(alice.public(), Permission::USER | Permission::ADMIN);
    assert_eq!(reopened.get_users("main").await.unwrap(), expected);
    assert_eq!(get_bytes(&reopened, "main", "a.txt").await, b"kept");

    reopened.close().await.unwrap();
}

#[tokio::test]
async fn test_zone_acls_listed_only_after_touch() {
    let env = TestEnv::new();
    let alice = SecretKey::generate();
    let bob = SecretKey::generate();
    let safe = env.create(&alice, "touchy").await;
    safe.create_zone("main", Users::new()).await.unwrap();
    put_bytes(&safe, "main", "a.txt", b"a").await;

    let (reader, counters) = env.open_counting(&alice, &safe).await;
    assert_eq!(reader.list_zones(), vec!["main".to_string()]);
    assert_eq!(get_bytes(&reader, "main", "a.txt").await, b"a");
    let listed = counters.acl_listings.load(Ordering::SeqCst);

    for _ in 0..3 {
        get_bytes(&reader, "main", "a.txt").await;
        reader.sync("main").await.unwrap();
    }
    assert_eq!(counters.acl_listings.load(Ordering::SeqCst), listed);

    safe.set_users("main", users(&[(&bob, Permission::USER)]))
        .await
        .unwrap();
    let seen = reader.get_users("main").await.unwrap();
    assert_eq!(seen.get(&bob.public()), Some(&Permission::USER));
    assert!(counters.acl_listings.load(Ordering::SeqCst) > listed);

    reader.close().await.unwrap();
    safe.close().await.unwrap();
}
