use std::io::{SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use blob_store::Progress;
use bytes::Bytes;
use chrono::{Duration, Utc};
use flate2::write::GzDecoder;
use sha2::{Digest, Sha384};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;

use crate::crypto::{chunk_count, sealed_size, CHUNK_SIZE, TAG_SIZE};
use crate::index::ListOptions;

use super::error::SafeError;
use super::header::Header;
use super::Safe;

/// Options of [`Safe::get`]
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Read this version instead of the latest one
    pub file_id: Option<u64>,
    /// Plaintext byte range
    pub range: Option<Range<u64>>,
    /// Trust the index without syncing the zone first
    pub no_sync: bool,
    /// Do not keep a cache copy of the body
    pub no_cache: bool,
    pub progress: Option<Progress>,
}

/// Handle on a read running in the background.
#[derive(Debug)]
pub struct GetTask {
    cancel: Arc<AtomicBool>,
    result: oneshot::Receiver<Result<(Header, Bytes), SafeError>>,
}

impl GetTask {
    /// Ask the read to stop at the next chunk boundary.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub async fn wait(self) -> Result<(Header, Bytes), SafeError> {
        self.result.await.map_err(|_| SafeError::Cancelled)?
    }
}

fn check_cancel(cancel: Option<&AtomicBool>) -> Result<(), SafeError> {
    if cancel.is_some_and(|c| c.load(Ordering::SeqCst)) {
        return Err(SafeError::Cancelled);
    }
    Ok(())
}

/// Clamp `range` to `size`.
fn clamp(range: &Range<u64>, size: u64) -> Range<u64> {
    let end = range.end.min(size);
    range.start.min(end)..end
}

/// Plaintext sink hashing everything written and holding it until drained.
#[derive(Default)]
struct Plain {
    hasher: Sha384,
    pending: Vec<u8>,
}

impl Write for Plain {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.hasher.update(buf);
        self.pending.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Decrypted payload in, plaintext out, gunzipping compressed bodies.
enum Unpacker {
    Plain(Plain),
    Zip(GzDecoder<Plain>),
}

impl Unpacker {
    fn new(zip: bool) -> Self {
        if zip {
            Unpacker::Zip(GzDecoder::new(Plain::default()))
        } else {
            Unpacker::Plain(Plain::default())
        }
    }

    fn feed(&mut self, payload: &[u8]) -> std::io::Result<()> {
        match self {
            Unpacker::Plain(plain) => plain.write_all(payload),
            Unpacker::Zip(decoder) => decoder.write_all(payload),
        }
    }

    /// Plaintext produced since the last call.
    fn drain(&mut self) -> Vec<u8> {
        let plain = match self {
            Unpacker::Plain(plain) => plain,
            Unpacker::Zip(decoder) => decoder.get_mut(),
        };
        std::mem::take(&mut plain.pending)
    }

    fn finish(self) -> std::io::Result<Plain> {
        match self {
            Unpacker::Plain(plain) => Ok(plain),
            Unpacker::Zip(decoder) => decoder.finish(),
        }
    }
}

/// Copies plaintext to the caller, limited to `range`, and to the cache file.
struct Tee<'a, W> {
    out: &'a mut W,
    range: Option<Range<u64>>,
    offset: u64,
    cache: Option<tokio::fs::File>,
}

impl<W: AsyncWrite + Unpin> Tee<'_, W> {
    async fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if let Some(file) = &mut self.cache {
            file.write_all(data).await?;
        }
        let start = self.offset;
        let end = start + data.len() as u64;
        self.offset = end;

        let part = match &self.range {
            Some(range) => {
                let from = range.start.clamp(start, end);
                let to = range.end.clamp(from, end);
                &data[(from - start) as usize..(to - start) as usize]
            }
            None => data,
        };
        if !part.is_empty() {
            self.out.write_all(part).await?;
        }
        Ok(())
    }
}

/// Decrypt `sealed` chunk by chunk through `tee`, checking the content hash.
async fn unseal_into<W>(
    header: &Header,
    sealed: &[u8],
    tee: &mut Tee<'_, W>,
    cancel: Option<&AtomicBool>,
) -> Result<(), SafeError>
where
    W: AsyncWrite + Unpin,
{
    let chunks = chunk_count(header.body_size);
    let mut unpacker = Unpacker::new(header.zip);
    for (index, chunk) in sealed.chunks(CHUNK_SIZE + TAG_SIZE).enumerate() {
        check_cancel(cancel)?;
        let index = index as u64;
        let payload =
            header
                .body_key
                .decrypt_chunk(&header.iv, index, index + 1 == chunks, chunk)?;
        unpacker.feed(&payload)?;
        tee.write(&unpacker.drain()).await?;
    }

    let mut plain = unpacker.finish()?;
    tee.write(&std::mem::take(&mut plain.pending)).await?;
    if hex::encode(plain.hasher.finalize()) != header.attributes.hash {
        return Err(SafeError::SignatureMismatch(format!(
            "{}: content hash does not match",
            header.name
        )));
    }
    Ok(())
}

/// Copy the requested part of a cache file to `writer`.
async fn copy_cached<W>(
    mut file: tokio::fs::File,
    header: &Header,
    writer: &mut W,
    options: &GetOptions,
) -> Result<(), SafeError>
where
    W: AsyncWrite + Unpin,
{
    let range = match &options.range {
        Some(range) => clamp(range, header.size),
        None => 0..header.size,
    };
    file.seek(SeekFrom::Start(range.start)).await?;
    let copied = tokio::io::copy(&mut file.take(range.end - range.start), writer).await?;
    if let Some(progress) = &options.progress {
        let _ = progress.send(copied);
    }
    writer.flush().await?;
    Ok(())
}

impl Safe {
    /// Read a file into `writer`, returning its header., returning its header.
    pub async fn get<W>(
        &self,
        zone: &str,
        name: &str,
        writer: &mut W,
        options: GetOptions,
    ) -> Result<Header, SafeError>
    where
        W: AsyncWrite + Unpin,
    {
        self.fetch(zone, name, writer, &options, None).await
    }

    /// Read a file into `path` and remember the download.
    pub async fn get_to_file(
        &self,
        zone: &str,
        name: &str,
        path: &Path,
        options: GetOptions,
    ) -> Result<Header, SafeError> {
        let mut file = tokio::fs::File::create(path).await?;
        let header = self.get(zone, name, &mut file, options).await?;

        let destination = path.to_string_lossy().to_string();
        let updated = self
            .index()
            .update_header(self.name(), zone, header.file_id, |h| {
                h.downloads.insert(destination, Utc::now());
            })
            .await?;
        Ok(updated.unwrap_or(header))
    }

    /// Start a read in the background.
    pub fn get_async(&self, zone: &str, name: &str, options: GetOptions) -> GetTask {
        let cancel = Arc::new(AtomicBool::new(false));
        let (tx, result) = oneshot::channel();

        let safe = self.clone();
        let flag = cancel.clone();
        let zone = zone.to_string();
        let name = name.to_string();
        self.spawn_task(async move {
            let mut body = Vec::new();
            let fetched = safe
                .fetch(&zone, &name, &mut body, &options, Some(&flag))
                .await
                .map(|header| (header, Bytes::from(body)));
            if tx.send(fetched).is_err() {
                tracing::debug!("result of background read of {} dropped", name);
            }
        });

        GetTask { cancel, result }
    }

    /// Headers of a zone matching `options`.
    pub async fn list(&self, zone: &str, options: ListOptions) -> Result<Vec<Header>, SafeError> {
        if options.no_sync {
            self.zone_exists(zone)?;
        } else {
            self.sync(zone).await?;
        }
        Ok(self.index().list_headers(self.name(), zone, &options).await?)
    }

    /// Folders directly below `dir`.
    pub async fn list_dirs(&self, zone: &str, dir: &str) -> Result<Vec<String>, SafeError> {
        self.sync(zone).await?;
        Ok(self.index().list_dirs(self.name(), zone, dir).await?)
    }

    fn zone_exists(&self, zone: &str) -> Result<(), SafeError> {
        if !self.0.zones.read().contains_key(zone) {
            return Err(SafeError::ZoneNotExist(zone.to_string()));
        }
        Ok(())
    }

    async fn fetch<W>(
        &self,
        zone: &str,
        name: &str,
        writer: &mut W,
        options: &GetOptions,
        cancel: Option<&AtomicBool>,
    ) -> Result<Header, SafeError>
    where
        W: AsyncWrite + Unpin,
    {
        if options.no_sync {
            self.zone_exists(zone)?;
        } else {
            self.sync(zone).await?;
        }
        check_cancel(cancel)?;

        let index = self.index();
        let mut header = match options.file_id {
            Some(file_id) => index
                .header_by_id(self.name(), zone, file_id)
                .await?
                .filter(|h| !h.deleted),
            None => index.header_by_name(self.name(), zone, name).await?,
        }
        .ok_or_else(|| SafeError::FileNotExist(name.to_string()))?;

        let mut cached = None;
        if header.is_cached() {
            if let Some(path) = &header.cached {
                match tokio::fs::File::open(path).await {
                    Ok(file) => cached = Some(file),
                    Err(e) => tracing::warn!(
                        "cache file {} of {} unusable, fetching again: {}",
                        path.display(),
                        header.name,
                        e
                    ),
                }
            }
        }
        if let Some(file) = cached {
            tracing::debug!("serving {} from cache", header.name);
            copy_cached(file, &header, writer, options).await?;
            return Ok(header);
        }
        if header.cached.is_some() {
            self.drop_cache_entry(zone, &header).await;
            header.cached = None;
            header.cached_expires = None;
        }

        if let (Some(range), false) = (&options.range, header.zip) {
            self.read_range(zone, &header, range, writer, options, cancel)
                .await?;
            return Ok(header);
        }
        self.stream_body(zone, header, writer, options, cancel).await
    }

    /// Decrypt a whole body chunk by chunk into `writer` and, unless
    /// `no_cache`, into a cache file recorded once the content hash checks out.
    async fn stream_body<W>(
        &self,
        zone: &str,
        header: Header,
        writer: &mut W,
        options: &GetOptions,
        cancel: Option<&AtomicBool>,
    ) -> Result<Header, SafeError>
    where
        W: AsyncWrite + Unpin,
    {
        let sealed = self
            .store()
            .read(&header.body_path(zone), None, options.progress.as_ref())
            .await?;
        if sealed.len() as u64 != sealed_size(header.body_size) {
            return Err(SafeError::SignatureMismatch(format!(
                "{}: body has {} bytes, expected {}",
                header.name,
                sealed.len(),
                sealed_size(header.body_size)
            )));
        }

        let cache_path = (!options.no_cache).then(|| self.cache().path_for(header.file_id));
        let cache_file = match &cache_path {
            Some(path) => {
                tokio::fs::create_dir_all(self.cache().dir()).await?;
                Some(tokio::fs::File::create(path).await?)
            }
            None => None,
        };
        let mut tee = Tee {
            out: writer,
            range: options.range.clone(),
            offset: 0,
            cache: cache_file,
        };

        let streamed = unseal_into(&header, &sealed, &mut tee, cancel).await;
        let cache_file = tee.cache.take();
        if let Err(e) = streamed {
            drop(cache_file);
            if let Some(path) = &cache_path {
                if let Err(e) = tokio::fs::remove_file(path).await {
                    tracing::warn!("cannot remove partial cache file {}: {}", path.display(), e);
                }
            }
            return Err(e);
        }
        tee.out.flush().await?;

        match (cache_file, cache_path) {
            (Some(mut file), Some(path)) => {
                file.flush().await?;
                drop(file);
                self.cache_body(zone, header, path).await
            }
            _ => Ok(header),
        }
    }

    /// Decrypt only the chunks covering `range` of an uncompressed body.
    async fn read_range<W>(
        &self,
        zone: &str,
        header: &Header,
        range: &Range<u64>,
        writer: &mut W,
        options: &GetOptions,
        cancel: Option<&AtomicBool>,
    ) -> Result<(), SafeError>
    where
        W: AsyncWrite + Unpin,
    {
        let range = clamp(range, header.size);
        if range.is_empty() {
            return Ok(());
        }

        let chunk = CHUNK_SIZE as u64;
        let sealed_chunk = (CHUNK_SIZE + TAG_SIZE) as u64;
        let first = range.start / chunk;
        let last = (range.end - 1) / chunk;
        let chunks = chunk_count(header.body_size);

        let from = first * sealed_chunk;
        let to = ((last + 1) * sealed_chunk).min(sealed_size(header.body_size));
        let sealed = self
            .store()
            .read(&header.body_path(zone), Some(from..to), options.progress.as_ref())
            .await?;

        let mut tee = Tee {
            out: writer,
            range: Some(range.clone()),
            offset: first * chunk,
            cache: None,
        };
        for (i, sealed) in sealed.chunks(sealed_chunk as usize).enumerate() {
            check_cancel(cancel)?;
            let index = first + i as u64;
            let plain = header.body_key.decrypt_chunk(
                &header.iv,
                index,
                index + 1 == chunks,
                sealed,
            )?;
            tee.write(&plain).await?;
        }
        if tee.offset < range.end {
            return Err(SafeError::SignatureMismatch(format!(
                "{}: body shorter than its header",
                header.name
            )));
        }
        tee.out.flush().await?;
        Ok(())
    }

    /// Record the cache copy of a body on its header.
    async fn cache_body(&self, zone: &str, header: Header, path: PathBuf) -> Result<Header, SafeError> {
        let cache = self.cache();
        let used = cache.reserve(header.size);

        let expires = Utc::now() + Duration::seconds(self.config().cache_expire_secs as i64);
        let updated = self
            .index()
            .update_header(self.name(), zone, header.file_id, |h| {
                h.cached = Some(path);
                h.cached_expires = Some(expires);
            })
            .await?;

        if cache.over_ceiling() {
            tracing::debug!("cache holds {} bytes, evicting", used);
            self.spawn_eviction();
        }
        Ok(updated.unwrap_or(header))
    }

    /// Remove the cache file of `header` and clear it from the index.
    pub(crate) async fn drop_cache_entry(&self, zone: &str, header: &Header) {
        let Some(path) = &header.cached else {
            return;
        };
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("cannot remove cache file {}: {}", path.display(), e),
        }
        let cleared = self
            .index()
            .update_header(self.name(), zone, header.file_id, |h| {
                h.cached = None;
                h.cached_expires = None;
            })
            .await;
        match cleared {
            Ok(_) => {
                self.cache().release(header.size);
            }
            Err(e) => tracing::warn!("cannot clear cache entry of {}: {}", header.name, e),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_clamp() {
        assert_eq!(clamp(&(2..10), 5), 2..5);
        assert_eq!(clamp(&(7..10), 5), 5..5);
        assert_eq!(clamp(&(0..3), 5), 0..3);
    }

    #[tokio::test]
    async fn test_tee_keeps_range_only() {
        let mut out = Vec::new();
        let mut tee = Tee {
            out: &mut out,
            range: Some(3..8),
            offset: 0,
            cache: None,
        };
        for piece in [&b"hel"[..], b"lo w", b"", b"orld"] {
            tee.write(piece).await.unwrap();
        }
        assert_eq!(tee.offset, 11);
        assert_eq!(out, b"lo wo");
    }

    #[test]
    fn test_unpacker_gunzips_as_fed() {
        use flate2::write::GzEncoder;
        use flate2::Compression;

        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 7) as u8).collect();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&data).unwrap();
        let zipped = encoder.finish().unwrap();

        let mut unpacker = Unpacker::new(true);
        let mut plain = Vec::new();
        for piece in zipped.chunks(100) {
            unpacker.feed(piece).unwrap();
            plain.extend(unpacker.drain());
        }
        let mut rest = unpacker.finish().unwrap();
        plain.append(&mut rest.pending);
        assert_eq!(plain, data);
        assert_eq!(rest.hasher.finalize().as_slice(), Sha384::digest(&data).as_slice());
    }

    #[test]
    fn test_cancel_flag() {
        let flag = AtomicBool::new(false);
        assert!(check_cancel(Some(&flag)).is_ok());
        assert!(check_cancel(None).is_ok());
        flag.store(true, Ordering::SeqCst);
        assert!(matches!(check_cancel(Some(&flag)), Err(SafeError::Cancelled)));
    }
}
