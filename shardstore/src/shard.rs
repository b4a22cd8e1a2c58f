//! Deterministic placement of logical names into a fixed-depth key tree.
//!
//! A name is spread over [`SHARD_DEPTH`] single-character directory levels
//! taken from its own leading characters, so that no directory (or object
//! prefix) accumulates every file. Names shorter than the depth are padded
//! with [`SHARD_FILLER`].

use crate::error::{Result, StorageError};

/// Number of single-character segments between the root and the name.
pub const SHARD_DEPTH: usize = 4;

/// Segment used once the name runs out of characters.
pub const SHARD_FILLER: char = 'x';

/// Key separator.
pub const SEPARATOR: char = '/';

/// Maps `name` to its sharded key under `root`.
///
/// Segment `i` is the `i`-th character of `name`, or [`SHARD_FILLER`] when the
/// name is shorter. The name is appended verbatim as the last component.
///
/// ```
/// use shardstore::shard;
///
/// assert_eq!(shard("/root", "image.png").unwrap(), "/root/i/m/a/g/image.png");
/// assert_eq!(shard("/root", "x.png").unwrap(), "/root/x/./p/n/x.png");
/// assert_eq!(shard("/root", "y").unwrap(), "/root/y/x/x/x/y");
/// ```
pub fn shard(root: &str, name: &str) -> Result<String> {
    if name.is_empty() {
        return Err(StorageError::InvalidPath("logical name is empty".to_string()));
    }

    let root = root.trim_end_matches(SEPARATOR);
    // root + (sep + segment) * depth + sep + name
    let mut key = String::with_capacity(root.len() + SHARD_DEPTH * 5 + name.len() + 1);
    key.push_str(root);

    let mut chars = name.chars();
    for _ in 0..SHARD_DEPTH {
        key.push(SEPARATOR);
        key.push(chars.next().unwrap_or(SHARD_FILLER));
    }

    key.push(SEPARATOR);
    key.push_str(name);
    Ok(key)
}
