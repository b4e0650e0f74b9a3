//! Cache eviction and quota enforcement.

use super::error::SafeError;
use super::Safe;

impl Safe {
    /// Run cache eviction in the background unless it is already running.
    pub(crate) fn spawn_eviction(&self) {
        if !self.cache().begin_eviction() {
            return;
        }
        let safe = self.clone();
        self.spawn_task(async move {
            if let Err(e) = safe.evict_cache().await {
                tracing::error!("cache eviction of {} failed: {}", safe.name(), e);
            }
            safe.cache().end_eviction();
        });
    }

    /// Remove cache files, earliest expiry first, until usage is below 90% of the ceiling.
    ///
    /// Returns the number of bytes freed.
    pub async fn evict_cache(&self) -> Result<u64, SafeError> {
        let cache = self.cache();
        let mut freed = 0;

        while cache.used() > cache.target() {
            let Some(entry) = self.index().oldest_cached(self.name()).await? else {
                break;
            };
            match tokio::fs::remove_file(&entry.path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("cannot remove cache file {}: {}", entry.path.display(), e),
            }
            self.index()
                .update_header(self.name(), &entry.zone, entry.file_id, |h| {
                    h.cached = None;
                    h.cached_expires = None;
                })
                .await?;
            cache.release(entry.size);
            freed += entry.size;
            tracing::debug!("evicted {} from cache", entry.path.display());
        }

        if freed > 0 {
            tracing::info!(
                "evicted {} bytes from cache of {}, {} left",
                freed,
                self.name(),
                cache.used()
            );
        }
        Ok(freed)
    }

    /// Delete the oldest files of the quota group while it is over quota.
    ///
    /// Nothing happens below the quota. Above it, files are deleted oldest
    /// first until the group holds at most 90% of the quota. Bodies are
    /// removed from the store only for this safe; files of other safes in the
    /// group are tombstoned in the index. Returns the number of bytes freed.
    pub async fn enforce_quota(&self) -> Result<u64, SafeError> {
        let quota = self.manifest().quota;
        if quota == 0 {
            return Ok(0);
        }
        let group = self.quota_group();
        let index = self.index();
        if index.quota_group_size(group).await? <= quota {
            return Ok(0);
        }

        let target = quota / 10 * 9;
        let store = self.store();
        let mut freed = 0;
        while index.quota_group_size(group).await? > target {
            let Some(oldest) = index.oldest_in_group(group).await? else {
                break;
            };
            let header = &oldest.header;

            if oldest.safe == self.name() {
                if let Err(e) = store.delete(&header.body_path(&oldest.zone)).await {
                    tracing::warn!("cannot delete body of {}: {}", header.name, e);
                }
                self.drop_cache_entry(&oldest.zone, header).await;
            }
            index
                .update_header(&oldest.safe, &oldest.zone, header.file_id, |h| {
                    h.deleted = true;
                })
                .await?;

            freed += header.size;
            tracing::info!(
                "quota group {}: deleted {} ({} bytes) of {}/{}",
                group,
                header.name,
                header.size,
                oldest.safe,
                oldest.zone
            );
        }
        Ok(freed)
    }
}
