//! Content hashing and upload verification.
//!
//! Whole-object uploads are checked by comparing the MD5 of the bytes we sent
//! with the entity tag the backend reports. Objects assembled from a multipart
//! upload carry a tag derived from the part digests (`<md5 of digests>-<parts>`),
//! which can not be compared against a plain content hash; such tags are
//! reported as [`Verification::NotApplicable`].

use base64::{engine::general_purpose::STANDARD, Engine as _};
use md5::{Digest, Md5};

use crate::error::{Result, StorageError};

const MD5_HEX_LEN: usize = 32;

/// Outcome of comparing a locally computed hash with a backend tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// The backend tag matches the content hash.
    Verified,
    /// The tag belongs to a multipart object and carries no content hash.
    NotApplicable,
    /// The backend did not report a comparable hash.
    Unreported,
}

/// Raw MD5 digest of `data`.
pub fn md5_digest(data: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Lowercase hex MD5 of `data`.
pub fn content_md5(data: &[u8]) -> String {
    faster_hex::hex_string(&md5_digest(data))
}

/// Base64 MD5 of `data`, the form expected in a `Content-MD5` header.
pub fn content_md5_base64(data: &[u8]) -> String {
    STANDARD.encode(md5_digest(data))
}

/// Composite tag of an assembled multipart object: the MD5 over the
/// concatenated raw part digests, suffixed with the part count.
pub fn multipart_etag(part_digests: &[[u8; 16]]) -> String {
    let mut hasher = Md5::new();
    for digest in part_digests {
        hasher.update(digest);
    }
    let digest: [u8; 16] = hasher.finalize().into();
    format!("{}-{}", faster_hex::hex_string(&digest), part_digests.len())
}

/// Strips the surrounding quotes S3-like backends put around entity tags.
pub fn normalize_etag(etag: &str) -> &str {
    etag.trim().trim_matches('"')
}

/// Whether `etag` has the `<hex>-<parts>` shape of a multipart object.
pub fn is_multipart_etag(etag: &str) -> bool {
    match normalize_etag(etag).rsplit_once('-') {
        Some((hash, parts)) => {
            is_md5_hex(hash) && !parts.is_empty() && parts.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}

fn is_md5_hex(value: &str) -> bool {
    value.len() == MD5_HEX_LEN && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Compares the hex MD5 computed before upload with the tag the backend reported.
///
/// A tag that looks like an MD5 but differs is an [`StorageError::IntegrityMismatch`].
/// Opaque tags that are neither an MD5 nor a multipart tag are `Unreported`.
pub fn verify_upload(expected: &str, reported: Option<&str>) -> Result<Verification> {
    let reported = match reported.map(normalize_etag) {
        Some(tag) if !tag.is_empty() => tag,
        _ => return Ok(Verification::Unreported),
    };

    if is_multipart_etag(reported) {
        return Ok(Verification::NotApplicable);
    }
    if !is_md5_hex(reported) {
        return Ok(Verification::Unreported);
    }
    if reported.eq_ignore_ascii_case(expected) {
        Ok(Verification::Verified)
    } else {
        Err(StorageError::IntegrityMismatch {
            expected: expected.to_string(),
            actual: reported.to_string(),
        })
    }
}
