//! Incremental indexing of header batches.
//!
//! Writers drop encrypted batches in `<zone>/<YYYYMMDD>/<fileId>.h` and
//! rewrite `<zone>/.touch`. A reader keeps a watermark per zone: the touch
//! value it last indexed completely and the first bucket it still has to
//! scan. A batch sealed under an epoch this identity does not hold keeps the
//! watermark at its bucket, so it is retried once the key shows up.

use blob_store::{Filter, Store};
use chrono::SecondsFormat;

use crate::index::Watermark;

use super::error::SafeError;
use super::header::{unmarshal_headers, HeaderError};
use super::zone::Zone;
use super::{Safe, TOUCH_FILE};

pub(crate) const BATCH_SUFFIX: &str = ".h";

/// Modification stamp of the zone's touch object, `None` before the first write.
pub(crate) async fn read_touch(store: &dyn Store, zone: &str) -> Result<Option<String>, SafeError> {
    match store.stat(&format!("{zone}/{TOUCH_FILE}")).await {
        Ok(entry) => Ok(Some(entry.mod_time.to_rfc3339_opts(SecondsFormat::Nanos, true))),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn is_bucket(name: &str) -> bool {
    name.len() == 8 && name.bytes().all(|b| b.is_ascii_digit())
}

impl Safe {
    /// Bring the index up to date with a zone. Returns the number of headers indexed.
    pub async fn sync(&self, zone: &str) -> Result<usize, SafeError> {
        let zone = self.lock_zone(zone).await?;
        self.synchronize_files(&zone).await
    }

    /// Sync every zone, logging failures.
    pub async fn sync_all(&self) {
        for zone in self.list_zones() {
            match self.sync(&zone).await {
                Ok(0) => {}
                Ok(count) => tracing::debug!("indexed {} headers of zone {}", count, zone),
                Err(e) => tracing::warn!("cannot sync zone {}: {}", zone, e),
            }
        }
    }

    pub(crate) async fn synchronize_files(&self, zone: &Zone) -> Result<usize, SafeError> {
        let store = self.store();
        let Some(touch) = read_touch(store.as_ref(), &zone.name).await? else {
            return Ok(0);
        };

        let index = self.index();
        let watermark = index
            .watermark(self.name(), &zone.name)
            .await?
            .unwrap_or_default();
        if watermark.touch == touch {
            return Ok(0);
        }

        let mut buckets: Vec<String> = store
            .read_dir(&zone.name, &Filter::folders())
            .await?
            .into_iter()
            .map(|e| e.name)
            .filter(|name| is_bucket(name) && *name >= watermark.bucket)
            .collect();
        buckets.sort();

        let mut indexed = 0;
        let mut incomplete: Option<String> = None;
        let mut last = watermark.bucket.clone();

        for bucket in buckets {
            let dir = format!("{}/{}", zone.name, bucket);
            for entry in store.read_dir(&dir, &Filter::suffix(BATCH_SUFFIX)).await? {
                let path = format!("{dir}/{}", entry.name);
                if index.is_batch_processed(self.name(), &zone.name, &path).await? {
                    continue;
                }

                let data = match store.read(&path, None, None).await {
                    Ok(data) => data,
                    Err(e) => {
                        tracing::warn!("cannot read batch {}: {}", path, e);
                        incomplete.get_or_insert_with(|| bucket.clone());
                        continue;
                    }
                };

                let headers = match unmarshal_headers(&data, &zone.keys) {
                    Ok(headers) => headers,
                    Err(HeaderError::NoEncryptionKey(key_id)) => {
                        tracing::debug!("batch {} needs key {} not held yet", path, key_id);
                        incomplete.get_or_insert_with(|| bucket.clone());
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!("skipping corrupted batch {}: {}", path, e);
                        continue;
                    }
                };

                for header in &headers {
                    index
                        .upsert_header(self.name(), &zone.name, header, self.quota_group())
                        .await?;
                }
                index
                    .mark_batch_processed(self.name(), &zone.name, &path)
                    .await?;
                indexed += headers.len();
            }
            last = bucket;
        }

        let watermark = match incomplete {
            Some(bucket) => Watermark {
                touch: watermark.touch,
                bucket,
            },
            None => Watermark { touch, bucket: last },
        };
        index
            .set_watermark(self.name(), &zone.name, &watermark)
            .await?;
        Ok(indexed)
    }
}
