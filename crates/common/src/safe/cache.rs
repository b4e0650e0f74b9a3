use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

/// Accounting of the local body cache.
///
/// Every cache file is reserved when written and released when removed, so
/// the counter can be shared by foreground reads and background eviction.
#[derive(Debug)]
pub struct CacheManager {
    dir: PathBuf,
    ceiling: u64,
    used: AtomicI64,
    evicting: AtomicBool,
}

impl CacheManager {
    pub fn new(dir: PathBuf, ceiling: u64, used: u64) -> Self {
        Self {
            dir,
            ceiling,
            used: AtomicI64::new(used as i64),
            evicting: AtomicBool::new(false),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, file_id: u64) -> PathBuf {
        self.dir.join(format!("{file_id}.cache"))
    }

    /// Account for `bytes` more, returning the new total.
    pub fn reserve(&self, bytes: u64) -> u64 {
        let total = self.used.fetch_add(bytes as i64, Ordering::SeqCst) + bytes as i64;
        total.max(0) as u64
    }

    /// Account for `bytes` less, returning the new total.
    pub fn release(&self, bytes: u64) -> u64 {
        let total = self.used.fetch_sub(bytes as i64, Ordering::SeqCst) - bytes as i64;
        total.max(0) as u64
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::SeqCst).max(0) as u64
    }

    pub fn over_ceiling(&self) -> bool {
        self.used() > self.ceiling
    }

    /// Usage eviction brings the cache down to.
    pub fn target(&self) -> u64 {
        self.ceiling / 10 * 9
    }

    /// Claim the single eviction slot.
    pub fn begin_eviction(&self) -> bool {
        self.evicting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn end_eviction(&self) {
        self.evicting.store(false, Ordering::SeqCst);
    }
}
