use std::fmt::Debug;
use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Content type used when the caller does not supply one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Canned access-control policy applied to newly written objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Acl {
    #[default]
    Private,
    PublicRead,
    PublicReadWrite,
    AuthenticatedRead,
}

impl Acl {
    pub fn as_str(&self) -> &'static str {
        match self {
            Acl::Private => "private",
            Acl::PublicRead => "public-read",
            Acl::PublicReadWrite => "public-read-write",
            Acl::AuthenticatedRead => "authenticated-read",
        }
    }
}

impl FromStr for Acl {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "private" => Ok(Acl::Private),
            "public-read" => Ok(Acl::PublicRead),
            "public-read-write" => Ok(Acl::PublicReadWrite),
            "authenticated-read" => Ok(Acl::AuthenticatedRead),
            _ => Err(format!("Unknown acl option: {}", s)),
        }
    }
}

/// Options for a single-shot put.
#[derive(Debug, Clone)]
pub struct PutOptions {
    pub content_type: String,
    /// Base64 MD5 of the body; backends that support it reject a body that does not match.
    pub content_md5: Option<String>,
    pub acl: Acl,
}

impl Default for PutOptions {
    fn default() -> Self {
        Self {
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            content_md5: None,
            acl: Acl::default(),
        }
    }
}

/// Metadata returned by [`ObjectStoreClient::head`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHead {
    pub size: u64,
    pub mime_type: String,
    /// Entity tag as reported by the backend, quotes stripped.
    pub hash: String,
    pub last_modified: Option<DateTime<Utc>>,
}

/// One page of a prefix listing.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub keys: Vec<String>,
    /// Token for the next page, `None` on the last page.
    pub next_page_token: Option<String>,
}

/// A part reference handed to [`ObjectStoreClient::multipart_complete`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// ObjectStoreClient is the boundary between the device and the actual backend.
///
/// Implementations own transport concerns (signing, retries, TLS) and map
/// their failures onto [`StorageError`](crate::StorageError) kinds:
/// absent objects must be reported as `NotFound`, transport and service
/// failures as `BackendUnavailable`.
#[async_trait::async_trait]
pub trait ObjectStoreClient: Send + Sync + Debug + 'static {
    /// Stores `data` under `key`, replacing any previous object, and returns its entity tag.
    async fn put(&self, key: &str, data: Bytes, options: PutOptions) -> Result<String>;

    /// Returns the full content of `key`.
    async fn get(&self, key: &str) -> Result<Bytes>;

    async fn head(&self, key: &str) -> Result<ObjectHead>;

    /// Server-side copy of `src` to `dst`.
    async fn copy(&self, src: &str, dst: &str) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;

    /// Lists keys starting with `prefix` in lexicographic order, at most `max_keys` per page.
    async fn list_by_prefix(
        &self,
        prefix: &str,
        page_token: Option<&str>,
        max_keys: usize,
    ) -> Result<ListPage>;

    /// Opens a multipart upload for `key` and returns the backend upload id.
    async fn multipart_init(&self, key: &str, content_type: &str, acl: Acl) -> Result<String>;

    /// Uploads one part. Re-uploading the same part number replaces the earlier part.
    async fn multipart_upload_part(
        &self,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String>;

    /// Assembles the object from `parts`, which must be in ascending part number order.
    async fn multipart_complete(&self, upload_id: &str, parts: &[CompletedPart]) -> Result<()>;

    /// Discards an open multipart upload.
    ///
    /// Backends that garbage collect stale uploads on their own may keep the
    /// default no-op.
    async fn multipart_abort(&self, _upload_id: &str) -> Result<()> {
        Ok(())
    }
}
