//! Chunked uploads driven by the caller.
//!
//! The device keeps no session table. Everything needed to continue an upload
//! lives in the [`UploadSession`] value the caller passes into every chunk
//! call, so independent uploads never share state and the session can be
//! persisted (it is serde-serializable) between requests.
//!
//! Lifecycle of a session:
//!
//! * `Uninitialized` until the first chunk opens a backend upload;
//! * `InProgress` while parts are being uploaded;
//! * `Completed` once every part `1..=total_chunks` has been uploaded and the
//!   backend assembled the object.
//!
//! A failed chunk leaves the session `InProgress`. Nothing is retried or
//! aborted automatically: the caller re-sends the same chunk number, which
//! replaces the earlier part, or calls [`MultipartUploadManager::abandon`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::client::{Acl, CompletedPart, ObjectStoreClient, DEFAULT_CONTENT_TYPE};
use crate::error::{Result, StorageError};
use crate::metrics::SharedMetrics;

/// A part the backend acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedPart {
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    InProgress,
    Completed,
}

/// Caller-held state of one chunked upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSession {
    key: Option<String>,
    upload_id: Option<String>,
    parts: Vec<UploadedPart>,
    total_chunks: u32,
    content_type: String,
    completed: bool,
}

impl Default for UploadSession {
    fn default() -> Self {
        Self::new(DEFAULT_CONTENT_TYPE)
    }
}

impl UploadSession {
    /// Creates an unopened session for content of the given type.
    pub fn new(content_type: impl Into<String>) -> Self {
        Self {
            key: None,
            upload_id: None,
            parts: Vec::new(),
            total_chunks: 0,
            content_type: content_type.into(),
            completed: false,
        }
    }

    pub fn state(&self) -> SessionState {
        if self.completed {
            SessionState::Completed
        } else if self.upload_id.is_some() {
            SessionState::InProgress
        } else {
            SessionState::Uninitialized
        }
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// Backend upload id, set once the first chunk opened the upload.
    pub fn upload_id(&self) -> Option<&str> {
        self.upload_id.as_deref()
    }

    /// Acknowledged parts in ascending part number order.
    pub fn parts(&self) -> &[UploadedPart] {
        &self.parts
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Sum of the sizes of all acknowledged parts.
    pub fn uploaded_bytes(&self) -> u64 {
        self.parts.iter().map(|p| p.size).sum()
    }

    /// Part numbers in `1..=total_chunks` not acknowledged yet.
    pub fn missing_parts(&self) -> Vec<u32> {
        (1..=self.total_chunks)
            .filter(|n| self.parts.binary_search_by_key(n, |p| p.part_number).is_err())
            .collect()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| {
            StorageError::SessionMismatch(format!("Failed to serialize session: {}", e))
        })
    }

    pub fn from_json(data: &str) -> Result<Self> {
        serde_json::from_str(data)
            .map_err(|e| StorageError::SessionMismatch(format!("Failed to parse session: {}", e)))
    }

    /// Marks the session as finished by a single-shot put of the whole payload.
    pub(crate) fn mark_stored(&mut self, key: &str, etag: String, size: u64) {
        self.key = Some(key.to_string());
        self.upload_id = None;
        self.total_chunks = 1;
        self.parts = vec![UploadedPart {
            part_number: 1,
            etag,
            size,
        }];
        self.completed = true;
    }

    fn record_part(&mut self, part: UploadedPart) {
        match self.parts.binary_search_by_key(&part.part_number, |p| p.part_number) {
            Ok(index) => self.parts[index] = part,
            Err(index) => self.parts.insert(index, part),
        }
    }

    fn is_fully_uploaded(&self) -> bool {
        self.total_chunks > 0 && self.parts.len() == self.total_chunks as usize
    }

    fn reset(&mut self) {
        self.key = None;
        self.upload_id = None;
        self.parts.clear();
        self.total_chunks = 0;
        self.completed = false;
    }
}

/// Result of a chunk call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// The payload fit in one chunk and was stored with a single put.
    Stored { etag: String },
    /// The part was uploaded, the session stays open.
    PartUploaded { part_number: u32, etag: String },
    /// The part was uploaded and the backend assembled the object.
    Completed {
        part_number: u32,
        etag: String,
        size: u64,
    },
}

impl ChunkOutcome {
    /// Entity tag of the object (single put) or of the part just uploaded.
    pub fn etag(&self) -> &str {
        match self {
            ChunkOutcome::Stored { etag }
            | ChunkOutcome::PartUploaded { etag, .. }
            | ChunkOutcome::Completed { etag, .. } => etag,
        }
    }

    /// Whether the object is now fully stored.
    pub fn is_complete(&self) -> bool {
        !matches!(self, ChunkOutcome::PartUploaded { .. })
    }
}

/// Drives the part uploads of caller-held [`UploadSession`]s against a client.
#[derive(Debug, Clone)]
pub struct MultipartUploadManager {
    min_part_size: usize,
    acl: Acl,
    metrics: SharedMetrics,
}

impl MultipartUploadManager {
    pub fn new(min_part_size: usize, acl: Acl, metrics: SharedMetrics) -> Self {
        Self {
            min_part_size,
            acl,
            metrics,
        }
    }

    /// Uploads `data` as part `chunk_number` of `total_chunks` for `key`.
    ///
    /// The first call opens the backend upload, the call that leaves no part
    /// missing completes it. The chunk is uploaded exactly as given; every
    /// chunk but the last must be at least the minimum part size.
    pub async fn upload_chunk(
        &self,
        client: &dyn ObjectStoreClient,
        key: &str,
        data: Bytes,
        chunk_number: u32,
        total_chunks: u32,
        session: &mut UploadSession,
    ) -> Result<ChunkOutcome> {
        self.validate_chunk(key, data.len(), chunk_number, total_chunks, session)?;

        let upload_id = match session.upload_id.clone() {
            Some(id) => id,
            None => {
                let id = client
                    .multipart_init(key, &session.content_type, self.acl)
                    .await?;
                debug!(key, upload_id = %id, total_chunks, "opened multipart upload");
                session.key = Some(key.to_string());
                session.upload_id = Some(id.clone());
                session.total_chunks = total_chunks;
                session.parts.clear();
                id
            }
        };

        let size = data.len();
        let etag = match client
            .multipart_upload_part(&upload_id, chunk_number, data)
            .await
        {
            Ok(etag) => etag,
            Err(e) => {
                warn!(key, upload_id = %upload_id, chunk_number, "part upload failed: {}", e);
                return Err(e);
            }
        };
        self.metrics.part_uploaded();
        self.metrics.bytes_sent(size);

        session.record_part(UploadedPart {
            part_number: chunk_number,
            etag: etag.clone(),
            size: size as u64,
        });
        debug!(
            key,
            upload_id = %upload_id,
            chunk_number,
            total_chunks,
            size,
            "uploaded part"
        );

        if !session.is_fully_uploaded() {
            return Ok(ChunkOutcome::PartUploaded {
                part_number: chunk_number,
                etag,
            });
        }

        let size = self.complete(client, key, &upload_id, session).await?;
        Ok(ChunkOutcome::Completed {
            part_number: chunk_number,
            etag,
            size,
        })
    }

    /// Discards the backend upload of `session` and resets it.
    pub async fn abandon(
        &self,
        client: &dyn ObjectStoreClient,
        session: &mut UploadSession,
    ) -> Result<()> {
        if session.completed {
            return Err(StorageError::SessionMismatch(
                "upload already completed".to_string(),
            ));
        }
        if let Some(upload_id) = &session.upload_id {
            match client.multipart_abort(upload_id).await {
                Ok(()) => {}
                Err(StorageError::NotFound(_)) => {
                    debug!(upload_id = %upload_id, "upload already gone from the backend");
                }
                Err(e) => return Err(e),
            }
            self.metrics.upload_aborted();
            info!(upload_id = %upload_id, key = ?session.key, "abandoned multipart upload");
        }
        session.reset();
        Ok(())
    }

    fn validate_chunk(
        &self,
        key: &str,
        size: usize,
        chunk_number: u32,
        total_chunks: u32,
        session: &UploadSession,
    ) -> Result<()> {
        if total_chunks == 0 {
            return Err(StorageError::InvalidChunk(
                "total chunk count must be at least 1".to_string(),
            ));
        }
        if chunk_number == 0 || chunk_number > total_chunks {
            return Err(StorageError::InvalidChunk(format!(
                "chunk {} outside 1..={}",
                chunk_number, total_chunks
            )));
        }

        match session.state() {
            SessionState::Completed => {
                return Err(StorageError::SessionMismatch(
                    "upload already completed".to_string(),
                ));
            }
            SessionState::InProgress => {
                if session.key.as_deref() != Some(key) {
                    return Err(StorageError::SessionMismatch(format!(
                        "session belongs to {:?}, not {}",
                        session.key, key
                    )));
                }
                if session.total_chunks != total_chunks {
                    return Err(StorageError::SessionMismatch(format!(
                        "session expects {} chunks, call declares {}",
                        session.total_chunks, total_chunks
                    )));
                }
            }
            SessionState::Uninitialized => {
                if !session.parts.is_empty() {
                    return Err(StorageError::SessionMismatch(
                        "session has parts but no upload id".to_string(),
                    ));
                }
            }
        }

        if chunk_number < total_chunks && size < self.min_part_size {
            return Err(StorageError::PartSizeViolation {
                part_number: chunk_number,
                size,
                minimum: self.min_part_size,
            });
        }
        Ok(())
    }

    async fn complete(
        &self,
        client: &dyn ObjectStoreClient,
        key: &str,
        upload_id: &str,
        session: &mut UploadSession,
    ) -> Result<u64> {
        let parts: Vec<CompletedPart> = session
            .parts
            .iter()
            .map(|p| CompletedPart {
                part_number: p.part_number,
                etag: p.etag.clone(),
            })
            .collect();

        client.multipart_complete(upload_id, &parts).await?;

        let expected = session.uploaded_bytes();
        let actual = client.head(key).await?.size;
        if actual != expected {
            self.metrics.integrity_failed();
            warn!(key, upload_id, expected, actual, "assembled object has unexpected size");
            return Err(StorageError::SizeMismatch { expected, actual });
        }

        session.completed = true;
        self.metrics.upload_completed();
        info!(key, upload_id, parts = parts.len(), size = actual, "completed multipart upload");
        Ok(actual)
    }
}
