//! # Shardstore
//!
//! A storage device abstraction that reads, writes, moves, deletes and inspects
//! files in an object store, whatever the store behind it is.
//!
//! ## Features
//!
//! - **Sharded keys**: logical names are spread over a four level key tree
//!   (`root/i/m/a/g/image.png`) so no prefix holds every object
//! - **Multipart uploads**: large files are assembled from independently
//!   uploaded parts; the upload state is a value held by the caller
//! - **Integrity checks**: single-shot uploads are verified against the MD5
//!   the backend reports
//! - **Pluggable backends**: anything implementing [`ObjectStoreClient`];
//!   an in-memory and a local-directory backend are included
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use shardstore::{DeviceConfig, InMemoryObjectStore, StorageDevice};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let device = StorageDevice::new(
//!     DeviceConfig::new("/root"),
//!     Arc::new(InMemoryObjectStore::new()),
//! )?;
//!
//! let key = device.get_path("text.txt")?; // "/root/t/e/x/t/text.txt"
//! device.write(&key, Bytes::from_static(b"Hello World"), "text/plain").await?;
//! assert_eq!(device.read(&key).await?, Bytes::from_static(b"Hello World"));
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod device;
pub mod error;
pub mod integrity;
pub mod local;
pub mod memory;
pub mod metrics;
pub mod multipart;
pub mod shard;

pub use client::{
    Acl, CompletedPart, ListPage, ObjectHead, ObjectStoreClient, PutOptions, DEFAULT_CONTENT_TYPE,
};
pub use config::{Credentials, DeviceConfig};
pub use device::{Capacity, StorageDevice};
pub use error::{Result, StorageError};
pub use integrity::Verification;
pub use local::LocalObjectStore;
pub use memory::InMemoryObjectStore;
pub use metrics::{MetricsCollector, NoOpMetrics, SharedMetrics};
pub use multipart::{
    ChunkOutcome, MultipartUploadManager, SessionState, UploadSession, UploadedPart,
};
pub use shard::shard;
