//! Quota enforcement and cache eviction
mod common;

use ::common::crypto::SecretKey;
use ::common::index::ListOptions;
use ::common::safe::{Command, SafeConfig, Users};

use crate::common::{content, get_bytes, put_bytes, TestEnv};

#[tokio::test]
async fn test_quota_keeps_newest_files() {
    let env = TestEnv::new();
    let alice = SecretKey::generate();
    let config = SafeConfig {
        quota: 1000,
        quota_group: Some("family".to_string()),
        ..env.config(&alice)
    };
    let safe = env.create_with(&alice, "quota", config).await;
    safe.create_zone("main", Users::new()).await.unwrap();

    let mut headers = Vec::new();
    for i in 1..=10 {
        headers.push(put_bytes(&safe, "main", &format!("f{i}.bin"), &content(300, i as u8)).await);
    }
    safe.run(Command::EnforceQuota).await.unwrap();

    let size = safe.index().quota_group_size("family").await.unwrap();
    assert!(size <= 900, "group holds {size} bytes");

    let live = safe
        .list(
            "main",
            ListOptions {
                no_sync: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let live: Vec<_> = live.iter().map(|h| h.name.as_str()).collect();
    assert_eq!(live, vec!["f10.bin", "f8.bin", "f9.bin"]);

    // evicted bodies are gone from the store, kept ones are not
    let store = safe.store();
    for header in &headers[..7] {
        assert!(store
            .stat(&header.body_path("main"))
            .await
            .unwrap_err()
            .is_not_found());
    }
    for header in &headers[7..] {
        store.stat(&header.body_path("main")).await.unwrap();
    }

    safe.close().await.unwrap();
}

#[tokio::test]
async fn test_quota_is_noop_below_limit() {
    let env = TestEnv::new();
    let alice = SecretKey::generate();
    let config = SafeConfig {
        quota: 10_000,
        ..env.config(&alice)
    };
    let safe = env.create_with(&alice, "roomy", config).await;
    safe.create_zone("main", Users::new()).await.unwrap();
    for i in 1..=3 {
        put_bytes(&safe, "main", &format!("f{i}.bin"), &content(3000, i)).await;
    }

    assert_eq!(safe.enforce_quota().await.unwrap(), 0);
    assert_eq!(safe.manifest().quota_group, "roomy");
    assert_eq!(
        safe.list("main", ListOptions::default()).await.unwrap().len(),
        3
    );

    safe.close().await.unwrap();
}

#[tokio::test]
async fn test_cache_eviction_below_ceiling() {
    let env = TestEnv::new();
    let alice = SecretKey::generate();
    let config = SafeConfig {
        cache_ceiling: 1000,
        ..env.config(&alice)
    };
    let safe = env.create_with(&alice, "eviction", config).await;
    safe.create_zone("main", Users::new()).await.unwrap();

    for i in 1..=5 {
        put_bytes(&safe, "main", &format!("f{i}.bin"), &content(300, i)).await;
    }
    for i in 1..=5 {
        get_bytes(&safe, "main", &format!("f{i}.bin")).await;
    }
    // close waits for the eviction tasks
    safe.close().await.unwrap();

    assert!(safe.cache().used() <= 900, "cache holds {}", safe.cache().used());
    let indexed = safe.index().cached_size(safe.name()).await.unwrap();
    assert_eq!(indexed, safe.cache().used());

    let files = std::fs::read_dir(safe.cache().dir())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".cache"))
        .count();
    assert_eq!(files as u64, safe.cache().used() / 300);

    // the last file read is still cached
    let newest = safe
        .index()
        .header_by_name(safe.name(), "main", "f5.bin")
        .await
        .unwrap()
        .unwrap();
    assert!(newest.is_cached());
}
