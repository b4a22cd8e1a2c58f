//! Object store over a local directory.
//!
//! Layout under the base directory:
//!
//! * `objects/`: one file per key, key segments mapped to directories;
//! * `meta/`: `<key>.json` with the content type and entity tag of each object;
//! * `uploads/<upload id>/`: manifest and parts of open multipart uploads;
//! * `tmp/`: staging area, files are renamed into place once complete.
//!
//! Key segments are escaped so every key maps to a distinct path: `%` becomes
//! `%25`, dots of `.`/`..` segments become `%2E`, and an empty segment is `%`.
//! A key can not be stored when another key uses it as a directory.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::client::{
    Acl, CompletedPart, ListPage, ObjectHead, ObjectStoreClient, PutOptions, DEFAULT_CONTENT_TYPE,
};
use crate::config::DEFAULT_MIN_PART_SIZE;
use crate::error::{Result, StorageError};
use crate::integrity::{content_md5, content_md5_base64, md5_digest, multipart_etag, normalize_etag};
use crate::memory::MAX_PART_NUMBER;

const OBJECTS_DIR: &str = "objects";
const META_DIR: &str = "meta";
const UPLOADS_DIR: &str = "uploads";
const TMP_DIR: &str = "tmp";
const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ObjectMeta {
    content_type: String,
    etag: String,
    acl: Acl,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UploadManifest {
    key: String,
    content_type: String,
    acl: Acl,
}

/// [`ObjectStoreClient`] storing objects as files below a base directory.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    base: PathBuf,
    min_part_size: usize,
}

impl LocalObjectStore {
    /// Opens (and creates when needed) a store rooted at `base`.
    pub async fn open(base: impl Into<PathBuf>) -> Result<Self> {
        let base = base.into();
        for dir in [OBJECTS_DIR, META_DIR, UPLOADS_DIR, TMP_DIR] {
            fs::create_dir_all(base.join(dir)).await?;
        }
        debug!(base = %base.display(), "opened local object store");
        Ok(Self {
            base,
            min_part_size: DEFAULT_MIN_PART_SIZE,
        })
    }

    /// Overrides the minimum size of non-final parts.
    pub fn with_min_part_size(mut self, min_part_size: usize) -> Self {
        self.min_part_size = min_part_size;
        self
    }

    fn object_path(&self, key: &str) -> PathBuf {
        encoded_path(&self.base.join(OBJECTS_DIR), key)
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        let mut path = encoded_path(&self.base.join(META_DIR), key);
        let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".json");
        path.set_file_name(name);
        path
    }

    fn upload_dir(&self, upload_id: &str) -> Result<PathBuf> {
        if Uuid::parse_str(upload_id).is_err() {
            return Err(StorageError::NotFound(format!("upload {}", upload_id)));
        }
        Ok(self.base.join(UPLOADS_DIR).join(upload_id))
    }

    fn part_path(dir: &Path, part_number: u32) -> PathBuf {
        dir.join(format!("{:05}.part", part_number))
    }

    fn tmp_path(&self) -> PathBuf {
        self.base.join(TMP_DIR).join(Uuid::new_v4().to_string())
    }

    async fn read_meta(&self, key: &str) -> Result<Option<ObjectMeta>> {
        match fs::read(self.meta_path(key)).await {
            Ok(raw) => serde_json::from_slice(&raw).map(Some).map_err(|e| {
                StorageError::BackendUnavailable(format!("corrupt metadata for {}: {}", key, e))
            }),
            Err(e) if is_missing(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_meta(&self, key: &str, meta: &ObjectMeta) -> Result<()> {
        let raw = serde_json::to_vec(meta).map_err(|e| {
            StorageError::BackendUnavailable(format!("Failed to serialize metadata: {}", e))
        })?;
        let path = self.meta_path(key);
        write_atomic(&self.tmp_path(), &path, &raw).await
    }

    /// Removes now-empty directories between `path` and `stop`.
    async fn prune_empty_dirs(&self, path: &Path, stop: &Path) {
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir == stop || !dir.starts_with(stop) {
                break;
            }
            if fs::remove_dir(dir).await.is_err() {
                break;
            }
            current = dir.parent();
        }
    }

    /// All keys under `prefix`, sorted.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let objects_root = self.base.join(OBJECTS_DIR);

        // Only the directories of complete prefix segments need walking.
        let (start_dir, start_key) = match prefix.rsplit_once('/') {
            Some((dir, _)) => (encoded_path(&objects_root, dir), format!("{}/", dir)),
            None => (objects_root.clone(), String::new()),
        };

        let mut keys = Vec::new();
        let mut stack = vec![(start_dir, start_key)];
        while let Some((dir, key_prefix)) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if is_missing(&e) => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let Some(name) = entry.file_name().to_str().map(decode_segment) else {
                    warn!(path = %entry.path().display(), "skipping non utf-8 entry");
                    continue;
                };
                let key = format!("{}{}", key_prefix, name);
                if entry.file_type().await?.is_dir() {
                    stack.push((entry.path(), format!("{}/", key)));
                } else if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[async_trait::async_trait]
impl ObjectStoreClient for LocalObjectStore {
    async fn put(&self, key: &str, data: Bytes, options: PutOptions) -> Result<String> {
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
        write_atomic(&self.tmp_path(), &self.object_path(key), &data).await?;
        self.write_meta(
            key,
            &ObjectMeta {
                content_type: options.content_type,
                etag: etag.clone(),
                acl: options.acl,
            },
        )
        .await?;
        Ok(etag)
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        fs::read(self.object_path(key))
            .await
            .map(Bytes::from)
            .map_err(|e| map_io(e, key))
    }

    async fn head(&self, key: &str) -> Result<ObjectHead> {
        let metadata = fs::metadata(self.object_path(key))
            .await
            .map_err(|e| map_io(e, key))?;
        if metadata.is_dir() {
            return Err(StorageError::NotFound(key.to_string()));
        }

        let meta = match self.read_meta(key).await? {
            Some(meta) => meta,
            None => {
                let data = self.get(key).await?;
                ObjectMeta {
                    content_type: DEFAULT_CONTENT_TYPE.to_string(),
                    etag: content_md5(&data),
                    acl: Acl::default(),
                }
            }
        };

        Ok(ObjectHead {
            size: metadata.len(),
            mime_type: meta.content_type,
            hash: meta.etag,
            last_modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        })
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<()> {
        let src_path = self.object_path(src);
        let dst_path = self.object_path(dst);
        let tmp = self.tmp_path();
        fs::copy(&src_path, &tmp).await.map_err(|e| map_io(e, src))?;
        if let Some(parent) = dst_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&tmp, &dst_path).await?;

        match self.read_meta(src).await? {
            Some(meta) => self.write_meta(dst, &meta).await?,
            None => match fs::remove_file(self.meta_path(dst)).await {
                Ok(()) => {}
                Err(e) if is_missing(&e) => {}
                Err(e) => return Err(e.into()),
            },
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let path = self.object_path(key);
        if fs::metadata(&path).await.map_err(|e| map_io(e, key))?.is_dir() {
            return Err(StorageError::NotFound(key.to_string()));
        }
        fs::remove_file(&path).await.map_err(|e| map_io(e, key))?;
        self.prune_empty_dirs(&path, &self.base.join(OBJECTS_DIR)).await;

        let meta_path = self.meta_path(key);
        match fs::remove_file(&meta_path).await {
            Ok(()) => self.prune_empty_dirs(&meta_path, &self.base.join(META_DIR)).await,
            Err(e) if is_missing(&e) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn list_by_prefix(
        &self,
        prefix: &str,
        page_token: Option<&str>,
        max_keys: usize,
    ) -> Result<ListPage> {
        let max_keys = max_keys.max(1);
        let mut keys: Vec<String> = self
            .keys_with_prefix(prefix)
            .await?
            .into_iter()
            .filter(|key| page_token.map_or(true, |token| key.as_str() > token))
            .take(max_keys + 1)
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
        let upload_id = Uuid::new_v4().to_string();
        let dir = self.upload_dir(&upload_id)?;
        fs::create_dir_all(&dir).await?;

        let manifest = UploadManifest {
            key: key.to_string(),
            content_type: content_type.to_string(),
            acl,
        };
        let raw = serde_json::to_vec(&manifest).map_err(|e| {
            StorageError::BackendUnavailable(format!("Failed to serialize manifest: {}", e))
        })?;
        fs::write(dir.join(MANIFEST_FILE), raw).await?;
        debug!(upload_id = %upload_id, key, "opened local multipart upload");
        Ok(upload_id)
    }

    async fn multipart_upload_part(
        &self,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String> {
        if part_number == 0 || part_number > MAX_PART_NUMBER {
            return Err(StorageError::InvalidChunk(format!(
                "part number {} outside 1..={}",
                part_number, MAX_PART_NUMBER
            )));
        }
        let dir = self.upload_dir(upload_id)?;
        if !fs::try_exists(dir.join(MANIFEST_FILE)).await? {
            return Err(StorageError::NotFound(format!("upload {}", upload_id)));
        }

        write_atomic(&self.tmp_path(), &Self::part_path(&dir, part_number), &data).await?;
        Ok(content_md5(&data))
    }

    async fn multipart_complete(&self, upload_id: &str, parts: &[CompletedPart]) -> Result<()> {
        if parts.is_empty() {
            return Err(StorageError::InvalidChunk(
                "multipart completion needs at least one part".to_string(),
            ));
        }
        let dir = self.upload_dir(upload_id)?;
        let raw = fs::read(dir.join(MANIFEST_FILE))
            .await
            .map_err(|e| map_io(e, &format!("upload {}", upload_id)))?;
        let manifest: UploadManifest = serde_json::from_slice(&raw).map_err(|e| {
            StorageError::BackendUnavailable(format!("corrupt upload manifest: {}", e))
        })?;

        let mut previous = 0;
        let mut digests = Vec::with_capacity(parts.len());
        let mut body = Vec::new();
        for (index, part) in parts.iter().enumerate() {
            if part.part_number <= previous {
                return Err(StorageError::InvalidChunk(format!(
                    "part {} listed out of order",
                    part.part_number
                )));
            }
            previous = part.part_number;

            let data = match fs::read(Self::part_path(&dir, part.part_number)).await {
                Ok(data) => data,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Err(StorageError::InvalidChunk(format!(
                        "part {} was never uploaded",
                        part.part_number
                    )));
                }
                Err(e) => return Err(e.into()),
            };
            let digest = md5_digest(&data);
            if normalize_etag(&part.etag) != faster_hex::hex_string(&digest) {
                return Err(StorageError::InvalidChunk(format!(
                    "part {} entity tag does not match the uploaded part",
                    part.part_number
                )));
            }
            if index + 1 < parts.len() && data.len() < self.min_part_size {
                return Err(StorageError::PartSizeViolation {
                    part_number: part.part_number,
                    size: data.len(),
                    minimum: self.min_part_size,
                });
            }
            digests.push(digest);
            body.extend_from_slice(&data);
        }

        write_atomic(&self.tmp_path(), &self.object_path(&manifest.key), &body).await?;
        self.write_meta(
            &manifest.key,
            &ObjectMeta {
                content_type: manifest.content_type,
                etag: multipart_etag(&digests),
                acl: manifest.acl,
            },
        )
        .await?;
        fs::remove_dir_all(&dir).await?;
        Ok(())
    }

    async fn multipart_abort(&self, upload_id: &str) -> Result<()> {
        let dir = self.upload_dir(upload_id)?;
        fs::remove_dir_all(&dir)
            .await
            .map_err(|e| map_io(e, &format!("upload {}", upload_id)))
    }
}

/// A path that does not exist, or that runs through an object file.
fn is_missing(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory)
}

fn map_io(e: std::io::Error, key: &str) -> StorageError {
    if is_missing(&e) {
        StorageError::NotFound(key.to_string())
    } else {
        StorageError::Io(e)
    }
}

/// Writes `data` to `tmp` and renames it over `dest`, creating parent directories.
async fn write_atomic(tmp: &Path, dest: &Path, data: &[u8]) -> Result<()> {
    fs::write(tmp, data).await?;
    if let Some(parent) = dest.parent() {
        if let Err(e) = fs::create_dir_all(parent).await {
            let _ = fs::remove_file(tmp).await;
            return Err(e.into());
        }
    }
    if let Err(e) = fs::rename(tmp, dest).await {
        let _ = fs::remove_file(tmp).await;
        return Err(e.into());
    }
    Ok(())
}

fn encoded_path(base: &Path, key: &str) -> PathBuf {
    let mut path = base.to_path_buf();
    for segment in key.split('/') {
        path.push(encode_segment(segment));
    }
    path
}

fn encode_segment(segment: &str) -> String {
    match segment {
        "" => "%".to_string(),
        "." => "%2E".to_string(),
        ".." => "%2E%2E".to_string(),
        _ => segment.replace('%', "%25"),
    }
}

fn decode_segment(segment: &str) -> String {
    if segment == "%" {
        return String::new();
    }
    let mut decoded = String::with_capacity(segment.len());
    let mut rest = segment;
    while let Some(pos) = rest.find('%') {
        decoded.push_str(&rest[..pos]);
        match rest.get(pos + 1..pos + 3) {
            Some("25") => decoded.push('%'),
            Some("2E") => decoded.push('.'),
            Some(other) => {
                decoded.push('%');
                decoded.push_str(other);
            }
            None => {
                decoded.push_str(&rest[pos..]);
                return decoded;
            }
        }
        rest = &rest[pos + 3..];
    }
    decoded.push_str(rest);
    decoded
}
