use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;

use blob_store::Progress;
use bytes::Bytes;
use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha384};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::crypto::{generate_iv, BodySealer, Secret, CHUNK_SIZE};
use crate::index::ListOptions;

use super::error::SafeError;
use super::header::{marshal_headers, Attributes, Header};
use super::jobs::Command;
use super::key_id::next_id;
use super::sync::BATCH_SUFFIX;
use super::zone::Zone;
use super::{PendingUpload, Safe};

/// Options of [`Safe::put`]
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// Tombstone every earlier version with the same name
    pub replace: bool,
    /// Tombstone this specific file
    pub replace_id: Option<u64>,
    /// Gzip the body before encryption
    pub zip: bool,
    pub tags: Vec<String>,
    /// Guessed from the name when unset
    pub content_type: Option<String>,
    pub meta: BTreeMap<String, String>,
    /// Return once indexed locally, the worker writes to the store later
    pub async_upload: bool,
    pub progress: Option<Progress>,
}

pub(crate) fn validate_file_name(name: &str) -> Result<(), SafeError> {
    let valid = !name.is_empty()
        && !name.starts_with('/')
        && !name.ends_with('/')
        && name.split('/').all(|s| !s.is_empty() && s != "." && s != "..");
    if !valid {
        return Err(SafeError::InvalidName(name.to_string()));
    }
    Ok(())
}

pub(crate) fn validate_tag(tag: &str) -> Result<(), SafeError> {
    let valid = !tag.is_empty() && tag.chars().all(|c| c.is_ascii_alphanumeric());
    if !valid {
        return Err(SafeError::InvalidTag(tag.to_string()));
    }
    Ok(())
}

/// Plaintext end of the body pipeline, gzipping when asked.
enum Packer {
    Plain(BodySealer),
    Zip(GzEncoder<BodySealer>),
}

impl Packer {
    fn new(sealer: BodySealer, zip: bool) -> Self {
        if zip {
            Packer::Zip(GzEncoder::new(sealer, Compression::default()))
        } else {
            Packer::Plain(sealer)
        }
    }

    fn feed(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            Packer::Plain(sealer) => sealer.write_all(data),
            Packer::Zip(encoder) => encoder.write_all(data),
        }
    }

    fn finish(self) -> std::io::Result<BodySealer> {
        match self {
            Packer::Plain(sealer) => Ok(sealer),
            Packer::Zip(encoder) => encoder.finish(),
        }
    }
}

/// Batches live in the bucket of the day they were written, under a fresh id.
fn batch_path(zone: &str, bucket: &str, batch_id: u64) -> String {
    format!("{zone}/{bucket}/{batch_id}{BATCH_SUFFIX}")
}

impl Safe {
    /// Encrypt and store a file read from `reader`.
    ///
    /// The returned header is already in the local index. With
    /// `async_upload` the store writes are left to the background worker.
    pub async fn put<R>(
        &self,
        zone_name: &str,
        name: &str,
        mut reader: R,
        options: PutOptions,
    ) -> Result<Header, SafeError>
    where
        R: AsyncRead + Unpin,
    {
        validate_file_name(name)?;
        for tag in &options.tags {
            validate_tag(tag)?;
        }

        let zone = self.lock_zone(zone_name).await?;

        let iv = generate_iv();
        let body_key = Secret::generate();
        let mut packer = Packer::new(BodySealer::new(&body_key, iv), options.zip);
        let mut hasher = Sha384::new();
        let mut size = 0u64;
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            packer.feed(&buf[..n])?;
            size += n as u64;
        }
        let (body_size, sealed) = packer.finish()?.finish()?;
        let now = Utc::now();

        let content_type = options.content_type.clone().unwrap_or_else(|| {
            mime_guess::from_path(name)
                .first_or_octet_stream()
                .essence_str()
                .to_string()
        });
        let header = Header {
            name: name.to_string(),
            creator: self.identity().public(),
            size,
            body_size,
            mod_time: now,
            file_id: next_id(0),
            bucket: now.format("%Y%m%d").to_string(),
            iv,
            zip: options.zip,
            attributes: Attributes {
                hash: hex::encode(hasher.finalize()),
                content_type,
                tags: options.tags.clone(),
                meta: options.meta.clone(),
            },
            body_key,
            deleted: false,
            cached: None,
            cached_expires: None,
            downloads: BTreeMap::new(),
        };

        let batch = marshal_headers(std::slice::from_ref(&header), zone.key_id, &zone.key_value)?;
        let batch_path = batch_path(zone_name, &header.bucket, header.file_id);
        let upload = PendingUpload {
            zone: zone_name.to_string(),
            writes: vec![
                (header.body_path(zone_name), Bytes::from(sealed)),
                (batch_path.clone(), Bytes::from(batch)),
            ],
        };
        self.upload(upload, &options).await?;
        self.index_own(&zone, &header, &batch_path).await?;

        let mut superseded = Vec::new();
        if options.replace {
            let query = ListOptions {
                name: Some(name.to_string()),
                ..Default::default()
            };
            superseded = self
                .index()
                .list_headers(self.name(), zone_name, &query)
                .await?;
        }
        if let Some(file_id) = options.replace_id {
            if let Some(old) = self
                .index()
                .header_by_id(self.name(), zone_name, file_id)
                .await?
            {
                superseded.push(old);
            }
        }
        let mut seen = BTreeSet::new();
        for old in superseded {
            if old.file_id == header.file_id || old.deleted || !seen.insert(old.file_id) {
                continue;
            }
            self.write_tombstone(&zone, old, options.async_upload).await?;
        }
        drop(zone);

        tracing::debug!(
            "stored {} ({} bytes) in zone {} as {}",
            name,
            size,
            zone_name,
            header.file_id
        );
        self.check_quota().await;
        Ok(header)
    }

    /// Mark a file as deleted for every reader of the zone.
    pub async fn delete(&self, zone_name: &str, file_id: u64) -> Result<(), SafeError> {
        let zone = self.lock_zone(zone_name).await?;
        let header = self
            .index()
            .header_by_id(self.name(), zone_name, file_id)
            .await?
            .filter(|h| !h.deleted)
            .ok_or_else(|| SafeError::FileNotExist(file_id.to_string()))?;
        self.write_tombstone(&zone, header, false).await
    }

    async fn write_tombstone(
        &self,
        zone: &Zone,
        mut header: Header,
        queue: bool,
    ) -> Result<(), SafeError> {
        self.drop_cache_entry(&zone.name, &header).await;
        header.deleted = true;
        header.cached = None;
        header.cached_expires = None;

        let batch = marshal_headers(std::slice::from_ref(&header), zone.key_id, &zone.key_value)?;
        let bucket = Utc::now().format("%Y%m%d").to_string();
        let batch_path = batch_path(&zone.name, &bucket, next_id(header.file_id));
        let upload = PendingUpload {
            zone: zone.name.clone(),
            writes: vec![(batch_path.clone(), Bytes::from(batch))],
        };
        let options = PutOptions {
            async_upload: queue,
            ..Default::default()
        };
        self.upload(upload, &options).await?;
        self.index_own(zone, &header, &batch_path).await?;
        tracing::debug!("deleted {} ({}) in zone {}", header.name, header.file_id, zone.name);
        Ok(())
    }

    /// Index a header written by this identity, so its batch is not read back.
    async fn index_own(&self, zone: &Zone, header: &Header, batch_path: &str) -> Result<(), SafeError> {
        let index = self.index();
        index
            .upsert_header(self.name(), &zone.name, header, self.quota_group())
            .await?;
        index
            .mark_batch_processed(self.name(), &zone.name, batch_path)
            .await?;
        Ok(())
    }

    async fn upload(&self, upload: PendingUpload, options: &PutOptions) -> Result<(), SafeError> {
        if options.async_upload {
            self.0.uploads.lock().push_back(upload);
            return self.schedule(Command::FlushUploads);
        }

        let store = self.store();
        for (path, data) in upload.writes {
            store.write(&path, data, options.progress.as_ref()).await?;
        }
        self.touch(&upload.zone).await
    }

    /// Write queued uploads in order. Failed uploads stay queued.
    pub(crate) async fn flush_uploads(&self) -> Result<(), SafeError> {
        let mut pending = std::mem::take(&mut *self.0.uploads.lock());
        if pending.is_empty() {
            return Ok(());
        }

        let store = self.store();
        let mut touched = BTreeSet::new();
        let mut count = 0;
        while let Some(upload) = pending.pop_front() {
            let mut failed = None;
            for (path, data) in &upload.writes {
                if let Err(e) = store.write(path, data.clone(), None).await {
                    tracing::error!("upload of {} failed: {}", path, e);
                    failed = Some(e);
                    break;
                }
            }
            if let Some(e) = failed {
                pending.push_front(upload);
                let mut queue = self.0.uploads.lock();
                while let Some(upload) = pending.pop_back() {
                    queue.push_front(upload);
                }
                return Err(e.into());
            }
            touched.insert(upload.zone);
            count += 1;
        }

        for zone in touched {
            self.touch(&zone).await?;
        }
        tracing::debug!("flushed {} uploads", count);
        Ok(())
    }

    /// Schedule quota enforcement when the quota group is over quota.
    async fn check_quota(&self) {
        let quota = self.manifest().quota;
        if quota == 0 {
            return;
        }
        match self.index().quota_group_size(self.quota_group()).await {
            Ok(size) if size > quota => {
                tracing::info!(
                    "quota group {} holds {} bytes over a quota of {}",
                    self.quota_group(),
                    size,
                    quota
                );
                if let Err(e) = self.schedule(Command::EnforceQuota) {
                    tracing::warn!("cannot schedule quota enforcement: {}", e);
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("cannot compute size of quota group: {}", e),
        }
    }
}
