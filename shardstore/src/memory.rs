use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::client::{Acl, CompletedPart, ListPage, ObjectHead, ObjectStoreClient, PutOptions};
use crate::config::DEFAULT_MIN_PART_SIZE;
use crate::error::{Result, StorageError};
use crate::integrity::{content_md5, content_md5_base64, md5_digest, multipart_etag, normalize_etag};

/// Highest part number S3-compatible backends accept.
pub const MAX_PART_NUMBER: u32 = 10_000;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    content_type: String,
    etag: String,
    #[allow(dead_code)]
    acl: Acl,
    last_modified: DateTime<Utc>,
}

#[derive(Debug)]
struct StoredPart {
    data: Bytes,
    digest: [u8; 16],
    etag: String,
}

#[derive(Debug)]
struct PendingUpload {
    key: String,
    content_type: String,
    acl: Acl,
    parts: BTreeMap<u32, StoredPart>,
}

/// In-process object store that follows the semantics of an S3-compatible backend:
/// quoted MD5 entity tags, paginated prefix listings, multipart uploads with a
/// minimum part size enforced at completion and composite multipart tags.
#[derive(Debug)]
pub struct InMemoryObjectStore {
    objects: RwLock<BTreeMap<String, StoredObject>>,
    uploads: RwLock<HashMap<String, PendingUpload>>,
    min_part_size: usize,
    quota: Option<u64>,
    available: AtomicBool,
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            uploads: RwLock::new(HashMap::new()),
            min_part_size: DEFAULT_MIN_PART_SIZE,
            quota: None,
            available: AtomicBool::new(true),
        }
    }

    /// Overrides the minimum size of non-final parts.
    pub fn with_min_part_size(mut self, min_part_size: usize) -> Self {
        self.min_part_size = min_part_size;
        self
    }

    /// Limits the total number of stored bytes.
    pub fn with_quota(mut self, quota: u64) -> Self {
        self.quota = Some(quota);
        self
    }

    /// Simulates an outage: while unavailable every call fails with `BackendUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn object_count(&self) -> usize {
        self.objects().len()
    }

    pub fn pending_uploads(&self) -> usize {
        self.uploads().len()
    }

    /// Total bytes held by stored objects.
    pub fn used_bytes(&self) -> u64 {
        self.objects().values().map(|o| o.data.len() as u64).sum()
    }

    fn objects(&self) -> RwLockReadGuard<'_, BTreeMap<String, StoredObject>> {
        self.objects.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn objects_mut(&self) -> RwLockWriteGuard<'_, BTreeMap<String, StoredObject>> {
        self.objects.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn uploads(&self) -> RwLockReadGuard<'_, HashMap<String, PendingUpload>> {
        self.uploads.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn uploads_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, PendingUpload>> {
        self.uploads.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::BackendUnavailable("in-memory store is offline".to_string()))
        }
    }

    /// Quota check for storing `incoming` bytes under `key`, replacing what is there.
    fn check_quota(
        &self,
        objects: &BTreeMap<String, StoredObject>,
        key: &str,
        incoming: usize,
    ) -> Result<()> {
        let Some(quota) = self.quota else {
            return Ok(());
        };
        let used: u64 = objects.values().map(|o| o.data.len() as u64).sum();
        let replaced = objects.get(key).map(|o| o.data.len() as u64).unwrap_or(0);
        let after = used - replaced + incoming as u64;
        if after > quota {
            return Err(StorageError::QuotaExceeded(format!(
                "storing {} bytes at {} would use {} of {} bytes",
                incoming, key, after, quota
            )));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ObjectStoreClient for InMemoryObjectStore {
    async fn put(&self, key: &str, data: Bytes, options: PutOptions) -> Result<String> {
        self.ensure_available()?;

        if let Some(expected) = &options.content_md5 {
            let actual = content_md5_base64(&data);
            if *expected != actual {
                return Err(StorageError::IntegrityMismatch {
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        let etag = content_md5(&data);
        let mut objects = self.objects_mut();
        self.check_quota(&objects, key, data.len())?;
        objects.insert(
            key.to_string(),
            StoredObject {
                data,
                content_type: options.content_type,
                etag: etag.clone(),
                acl: options.acl,
                last_modified: Utc::now(),
            },
        );
        Ok(format!("\"{}\"", etag))
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        self.ensure_available()?;
        self.objects()
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn head(&self, key: &str) -> Result<ObjectHead> {
        self.ensure_available()?;
        self.objects()
            .get(key)
            .map(|o| ObjectHead {
                size: o.data.len() as u64,
                mime_type: o.content_type.clone(),
                hash: o.etag.clone(),
                last_modified: Some(o.last_modified),
            })
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<()> {
        self.ensure_available()?;
        let mut objects = self.objects_mut();
        let mut object = objects
            .get(src)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(src.to_string()))?;
        self.check_quota(&objects, dst, object.data.len())?;
        object.last_modified = Utc::now();
        objects.insert(dst.to_string(), object);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.ensure_available()?;
        match self.objects_mut().remove(key) {
            Some(_) => Ok(()),
            None => Err(StorageError::NotFound(key.to_string())),
        }
    }

    async fn list_by_prefix(
        &self,
        prefix: &str,
        page_token: Option<&str>,
        max_keys: usize,
    ) -> Result<ListPage> {
        self.ensure_available()?;
        let max_keys = max_keys.max(1);
        let lower = match page_token {
            Some(token) => Bound::Excluded(token.to_string()),
            None => Bound::Included(prefix.to_string()),
        };

        let objects = self.objects();
        let mut keys: Vec<String> = objects
            .range((lower, Bound::Unbounded))
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(prefix))
            .take(max_keys + 1)
            .cloned()
            .collect();

        let next_page_token = if keys.len() > max_keys {
            keys.truncate(max_keys);
            keys.last().cloned()
        } else {
            None
        };

        Ok(ListPage {
            keys,
            next_page_token,
        })
    }

    async fn multipart_init(&self, key: &str, content_type: &str, acl: Acl) -> Result<String> {
        self.ensure_available()?;
        let upload_id = Uuid::new_v4().to_string();
        self.uploads_mut().insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                content_type: content_type.to_string(),
                acl,
                parts: BTreeMap::new(),
            },
        );
        debug!(upload_id = %upload_id, key, "opened in-memory multipart upload");
        Ok(upload_id)
    }

    async fn multipart_upload_part(
        &self,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String> {
        self.ensure_available()?;
        if part_number == 0 || part_number > MAX_PART_NUMBER {
            return Err(StorageError::InvalidChunk(format!(
                "part number {} outside 1..={}",
                part_number, MAX_PART_NUMBER
            )));
        }

        let mut uploads = self.uploads_mut();
        let upload = uploads
            .get_mut(upload_id)
            .ok_or_else(|| StorageError::NotFound(format!("upload {}", upload_id)))?;

        let digest = md5_digest(&data);
        let etag = faster_hex::hex_string(&digest);
        upload.parts.insert(
            part_number,
            StoredPart {
                data,
                digest,
                etag: etag.clone(),
            },
        );
        Ok(format!("\"{}\"", etag))
    }

    async fn multipart_complete(&self, upload_id: &str, parts: &[CompletedPart]) -> Result<()> {
        self.ensure_available()?;
        if parts.is_empty() {
            return Err(StorageError::InvalidChunk(
                "multipart completion needs at least one part".to_string(),
            ));
        }

        let mut uploads = self.uploads_mut();
        let upload = uploads
            .get(upload_id)
            .ok_or_else(|| StorageError::NotFound(format!("upload {}", upload_id)))?;

        let mut previous = 0;
        let mut digests = Vec::with_capacity(parts.len());
        let mut body = BytesMut::new();
        for (index, part) in parts.iter().enumerate() {
            if part.part_number <= previous {
                return Err(StorageError::InvalidChunk(format!(
                    "part {} listed out of order",
                    part.part_number
                )));
            }
            previous = part.part_number;

            let stored = upload.parts.get(&part.part_number).ok_or_else(|| {
                StorageError::InvalidChunk(format!("part {} was never uploaded", part.part_number))
            })?;
            if normalize_etag(&part.etag) != stored.etag {
                return Err(StorageError::InvalidChunk(format!(
                    "part {} entity tag does not match the uploaded part",
                    part.part_number
                )));
            }
            let is_last = index + 1 == parts.len();
            if !is_last && stored.data.len() < self.min_part_size {
                return Err(StorageError::PartSizeViolation {
                    part_number: part.part_number,
                    size: stored.data.len(),
                    minimum: self.min_part_size,
                });
            }

            digests.push(stored.digest);
            body.extend_from_slice(&stored.data);
        }

        let data = body.freeze();
        let mut objects = self.objects_mut();
        self.check_quota(&objects, &upload.key, data.len())?;

        let Some(upload) = uploads.remove(upload_id) else {
            return Err(StorageError::NotFound(format!("upload {}", upload_id)));
        };
        objects.insert(
            upload.key,
            StoredObject {
                data,
                content_type: upload.content_type,
                etag: multipart_etag(&digests),
                acl: upload.acl,
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn multipart_abort(&self, upload_id: &str) -> Result<()> {
        self.ensure_available()?;
        match self.uploads_mut().remove(upload_id) {
            Some(_) => Ok(()),
            None => Err(StorageError::NotFound(format!("upload {}", upload_id))),
        }
    }
}
