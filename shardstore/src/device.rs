use std::path::Path;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::{Stream, TryStreamExt};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::client::{ObjectHead, ObjectStoreClient, PutOptions};
use crate::config::DeviceConfig;
use crate::error::{Result, StorageError};
use crate::integrity::{
    content_md5, content_md5_base64, normalize_etag, verify_upload, Verification,
};
use crate::metrics::SharedMetrics;
use crate::multipart::{ChunkOutcome, MultipartUploadManager, SessionState, UploadSession};
use crate::shard::{shard, SEPARATOR};

/// Space figure that may not exist for a given kind of device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    Bytes(u64),
    Unsupported,
}

impl Capacity {
    /// Numeric form shared by every device kind: unsupported figures are `-1`.
    pub fn as_sentinel(&self) -> i64 {
        match self {
            Capacity::Bytes(bytes) => i64::try_from(*bytes).unwrap_or(i64::MAX),
            Capacity::Unsupported => -1,
        }
    }
}

/// StorageDevice reads, writes and inspects files stored in an object store.
///
/// Keys are obtained from [`StorageDevice::get_path`] and always live under the
/// configured root. The device holds no per-upload state, so a single instance
/// can serve any number of concurrent callers. Concurrent writes or deletes of
/// the same key are resolved by the backend (last writer wins); the device does
/// not lock.
#[derive(Debug, Clone)]
pub struct StorageDevice {
    config: DeviceConfig,
    client: Arc<dyn ObjectStoreClient>,
    multipart: MultipartUploadManager,
    metrics: SharedMetrics,
}

impl StorageDevice {
    pub fn new(config: DeviceConfig, client: Arc<dyn ObjectStoreClient>) -> Result<Self> {
        Self::with_metrics(config, client, SharedMetrics::default())
    }

    pub fn with_metrics(
        config: DeviceConfig,
        client: Arc<dyn ObjectStoreClient>,
        metrics: SharedMetrics,
    ) -> Result<Self> {
        config.validate()?;
        let multipart =
            MultipartUploadManager::new(config.min_part_size, config.acl, metrics.clone());
        Ok(Self {
            config,
            client,
            multipart,
            metrics,
        })
    }

    pub fn name(&self) -> &str {
        "Object Storage"
    }

    pub fn description(&self) -> &str {
        "Object storage device with sharded key layout"
    }

    pub fn root(&self) -> &str {
        &self.config.root
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Sharded key of the logical file `name`.
    pub fn get_path(&self, name: &str) -> Result<String> {
        shard(&self.config.root, name)
    }

    /// Stores `data` under `key` with a single put and verifies the stored hash.
    pub async fn write(&self, key: &str, data: Bytes, content_type: &str) -> Result<bool> {
        self.check_key(key)?;
        self.put_verified(key, data, content_type).await?;
        Ok(true)
    }

    /// Uploads chunk `chunk_number` of `total_chunks` for `key`.
    ///
    /// A single-chunk upload is a plain verified put. Otherwise the chunk
    /// becomes one part of a multipart upload tracked in `session`, and the
    /// outcome carries the part entity tag.
    pub async fn upload(
        &self,
        key: &str,
        data: Bytes,
        chunk_number: u32,
        total_chunks: u32,
        session: &mut UploadSession,
    ) -> Result<ChunkOutcome> {
        self.check_key(key)?;

        if total_chunks != 1 {
            return self
                .multipart
                .upload_chunk(
                    self.client.as_ref(),
                    key,
                    data,
                    chunk_number,
                    total_chunks,
                    session,
                )
                .await;
        }

        if chunk_number != 1 {
            return Err(StorageError::InvalidChunk(format!(
                "chunk {} outside 1..=1",
                chunk_number
            )));
        }
        if session.state() != SessionState::Uninitialized {
            return Err(StorageError::SessionMismatch(
                "single chunk upload needs a fresh session".to_string(),
            ));
        }
        let size = data.len() as u64;
        let content_type = session.content_type().to_string();
        let etag = self.put_verified(key, data, &content_type).await?;
        session.mark_stored(key, etag.clone(), size);
        Ok(ChunkOutcome::Stored { etag })
    }

    /// Stores `data`, switching to a multipart upload of `part_size` chunks
    /// above the configured threshold.
    pub async fn write_sized(&self, key: &str, data: Bytes, content_type: &str) -> Result<bool> {
        self.check_key(key)?;
        if data.len() <= self.config.multipart_threshold {
            return self.write(key, data, content_type).await;
        }

        let part_size = self.config.part_size;
        let total_chunks = self.chunk_count(data.len() as u64)?;
        let mut session = UploadSession::new(content_type);
        for (index, start) in (0..data.len()).step_by(part_size).enumerate() {
            let end = (start + part_size).min(data.len());
            self.multipart
                .upload_chunk(
                    self.client.as_ref(),
                    key,
                    data.slice(start..end),
                    index as u32 + 1,
                    total_chunks,
                    &mut session,
                )
                .await?;
        }
        Ok(session.state() == SessionState::Completed)
    }

    /// Uploads the local file at `source` to `key`, reading it in `part_size` chunks.
    pub async fn upload_file(
        &self,
        source: impl AsRef<Path>,
        key: &str,
        content_type: &str,
    ) -> Result<bool> {
        self.check_key(key)?;
        let source = source.as_ref();
        let file = tokio::fs::File::open(source).await?;
        let len = file.metadata().await?.len();

        if len <= self.config.multipart_threshold as u64 {
            let data = tokio::fs::read(source).await?;
            return self.write(key, Bytes::from(data), content_type).await;
        }

        let total_chunks = self.chunk_count(len)?;
        debug!(source = %source.display(), key, len, total_chunks, "uploading file in parts");

        let mut session = UploadSession::new(content_type);
        let mut chunks = Box::pin(read_chunks(file, self.config.part_size));
        let mut chunk_number = 0;
        while let Some(chunk) = chunks.try_next().await? {
            chunk_number += 1;
            self.upload(key, chunk, chunk_number, total_chunks, &mut session)
                .await?;
        }

        if session.state() != SessionState::Completed {
            return Err(StorageError::SizeMismatch {
                expected: len,
                actual: session.uploaded_bytes(),
            });
        }
        Ok(true)
    }

    /// Discards the backend upload behind `session`.
    pub async fn abandon_upload(&self, session: &mut UploadSession) -> Result<()> {
        self.multipart
            .abandon(self.client.as_ref(), session)
            .await
    }

    pub async fn read(&self, key: &str) -> Result<Bytes> {
        self.check_key(key)?;
        let data = self.client.get(key).await?;
        self.metrics.bytes_received(data.len());
        Ok(data)
    }

    /// Whether `key` exists. Lookup failures are reported as absent.
    pub async fn exists(&self, key: &str) -> bool {
        if self.check_key(key).is_err() {
            return false;
        }
        match self.client.head(key).await {
            Ok(_) => true,
            Err(StorageError::NotFound(_)) => false,
            Err(e) => {
                warn!(key, "existence check failed: {}", e);
                false
            }
        }
    }

    /// Moves `source` to `destination`: copy, then remove the source.
    pub async fn move_object(&self, source: &str, destination: &str) -> Result<bool> {
        self.check_key(source)?;
        self.check_key(destination)?;

        self.client.head(source).await?;
        if source == destination {
            return Ok(true);
        }

        self.client.copy(source, destination).await?;
        match self.client.remove(source).await {
            Ok(()) => {}
            Err(StorageError::NotFound(_)) => {
                debug!(source, "source vanished before removal during move");
            }
            Err(e) => return Err(e),
        }
        debug!(source, destination, "moved object");
        Ok(true)
    }

    /// Moves `source` of this device to `destination` on another device.
    pub async fn transfer(
        &self,
        source: &str,
        destination: &str,
        target: &StorageDevice,
    ) -> Result<bool> {
        self.check_key(source)?;
        target.check_key(destination)?;

        let head = self.client.head(source).await?;
        let data = self.read(source).await?;
        target.write_sized(destination, data, &head.mime_type).await?;
        self.delete(source).await
    }

    /// Deletes `key`. Deleting a missing object succeeds.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.check_key(key)?;
        match self.client.remove(key).await {
            Ok(()) => {
                self.metrics.objects_deleted(1);
                Ok(true)
            }
            Err(StorageError::NotFound(_)) => Ok(true),
            Err(e) => Err(e),
        }
    }

    /// Deletes every object whose key starts with `prefix`, one listing page at a time.
    ///
    /// Objects written under the prefix while the sweep runs may or may not be
    /// removed; the sweep is not atomic.
    pub async fn delete_path(&self, prefix: &str) -> Result<bool> {
        self.check_key(prefix)?;

        let mut page_token: Option<String> = None;
        let mut deleted = 0u64;
        loop {
            let page = self
                .client
                .list_by_prefix(prefix, page_token.as_deref(), self.config.list_page_size)
                .await?;

            for key in &page.keys {
                match self.client.remove(key).await {
                    Ok(()) => deleted += 1,
                    Err(StorageError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        self.metrics.objects_deleted(deleted);
        info!(prefix, deleted, "deleted path");
        Ok(true)
    }

    pub async fn stat(&self, key: &str) -> Result<ObjectHead> {
        self.check_key(key)?;
        self.client.head(key).await
    }

    pub async fn get_file_size(&self, key: &str) -> Result<u64> {
        Ok(self.stat(key).await?.size)
    }

    pub async fn get_file_mime_type(&self, key: &str) -> Result<String> {
        Ok(self.stat(key).await?.mime_type)
    }

    /// Entity tag of `key`. For objects written by a multipart upload this is
    /// not an MD5 of the content.
    pub async fn get_file_hash(&self, key: &str) -> Result<String> {
        let head = self.stat(key).await?;
        Ok(normalize_etag(&head.hash).to_string())
    }

    pub fn directory_size(&self, _path: &str) -> Capacity {
        Capacity::Unsupported
    }

    pub fn partition_free_space(&self) -> Capacity {
        Capacity::Unsupported
    }

    pub fn partition_total_space(&self) -> Capacity {
        Capacity::Unsupported
    }

    /// Always `-1`: object stores have no directory sizes.
    pub fn get_directory_size(&self, path: &str) -> i64 {
        self.directory_size(path).as_sentinel()
    }

    /// Always `-1`: object stores have no partitions.
    pub fn get_partition_free_space(&self) -> i64 {
        self.partition_free_space().as_sentinel()
    }

    /// Always `-1`: object stores have no partitions.
    pub fn get_partition_total_space(&self) -> i64 {
        self.partition_total_space().as_sentinel()
    }

    async fn put_verified(&self, key: &str, data: Bytes, content_type: &str) -> Result<String> {
        let expected = content_md5(&data);
        let options = PutOptions {
            content_type: content_type.to_string(),
            content_md5: Some(content_md5_base64(&data)),
            acl: self.config.acl,
        };
        let size = data.len();

        let etag = self.client.put(key, data, options).await?;
        let verified = match verify_upload(&expected, Some(etag.as_str())) {
            Ok(Verification::Unreported) => {
                let actual = content_md5(&self.client.get(key).await?);
                if actual == expected {
                    Ok(())
                } else {
                    Err(StorageError::IntegrityMismatch { expected, actual })
                }
            }
            Ok(Verification::Verified | Verification::NotApplicable) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = verified {
            if let StorageError::IntegrityMismatch { expected, actual } = &e {
                self.metrics.integrity_failed();
                warn!(key, %expected, %actual, "stored object does not match upload");
            }
            return Err(e);
        }

        self.metrics.object_written();
        self.metrics.bytes_sent(size);
        debug!(key, size, content_type, "wrote object");
        Ok(etag)
    }

    fn chunk_count(&self, len: u64) -> Result<u32> {
        let part_size = self.config.part_size as u64;
        let chunks = len.div_ceil(part_size).max(1);
        u32::try_from(chunks)
            .map_err(|_| StorageError::InvalidChunk(format!("{} bytes need too many parts", len)))
    }

    /// Keys must be non-empty and lie under the root.
    fn check_key(&self, key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(StorageError::InvalidPath("key is empty".to_string()));
        }
        let root = self.config.root.trim_end_matches(SEPARATOR);
        if root.is_empty() {
            return Ok(());
        }
        match key.strip_prefix(root) {
            Some(rest) if rest.is_empty() || rest.starts_with(SEPARATOR) => Ok(()),
            _ => Err(StorageError::InvalidPath(format!(
                "{} is outside of root {}",
                key, root
            ))),
        }
    }
}

/// Reads `file` as a stream of chunks of `chunk_size` bytes; only the last may be shorter.
fn read_chunks(
    file: tokio::fs::File,
    chunk_size: usize,
) -> impl Stream<Item = Result<Bytes>> {
    futures::stream::try_unfold(file, move |mut file| async move {
        read_chunk(&mut file, chunk_size)
            .await
            .map(|chunk| chunk.map(|chunk| (chunk, file)))
    })
}

async fn read_chunk(file: &mut tokio::fs::File, chunk_size: usize) -> Result<Option<Bytes>> {
    let mut buf = BytesMut::with_capacity(chunk_size);
    while buf.len() < chunk_size {
        let remaining = (chunk_size - buf.len()) as u64;
        let n = (&mut *file).take(remaining).read_buf(&mut buf).await?;
        if n == 0 {
            break;
        }
    }
    if buf.is_empty() {
        Ok(None)
    } else {
        Ok(Some(buf.freeze()))
    }
}
