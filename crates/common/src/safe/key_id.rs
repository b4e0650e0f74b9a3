//! 64-bit identifiers for key epochs, files, ACLs and events.
//!
//! Layout: `ms (41 bits) | hash16(prev, node) (16 bits) | seq (6 bits)`.
//!
//! `node` is drawn at random once per process and `seq` starts at a random
//! value, so two devices allocating in the same millisecond do not collide.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::LazyLock;

use chrono::Utc;

const MS_MASK: u64 = (1 << 41) - 1;
const SEQ_MASK: u64 = (1 << 6) - 1;

static NODE: LazyLock<u64> = LazyLock::new(random_u64);
static SEQ: LazyLock<AtomicU64> = LazyLock::new(|| AtomicU64::new(random_u64()));
static LAST: AtomicU64 = AtomicU64::new(0);

fn random_u64() -> u64 {
    let mut bytes = [0u8; 8];
    getrandom::getrandom(&mut bytes).expect("failed to generate random bytes");
    u64::from_be_bytes(bytes)
}

fn hash16(prev: u64, node: u64) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&prev.to_be_bytes());
    hasher.update(&node.to_be_bytes());
    let hash = hasher.finalize();
    let bytes = hash.as_bytes();
    u16::from_be_bytes([bytes[0], bytes[1]]) as u64
}

fn compose(ms: u64, prev: u64, node: u64, seq: u64) -> u64 {
    ((ms & MS_MASK) << 22) | (hash16(prev, node) << 6) | (seq & SEQ_MASK)
}

/// A fresh id strictly greater than `prev` and than any id issued before in this process.
pub fn next_id(prev: u64) -> u64 {
    let ms = Utc::now().timestamp_millis() as u64;
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    let candidate = compose(ms, prev, *NODE, seq);

    let mut id = candidate.max(prev.saturating_add(1));
    let _ = LAST.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
        id = id.max(last.saturating_add(1));
        Some(id)
    });
    id
}
