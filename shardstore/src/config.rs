use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::client::Acl;
use crate::error::{Result, StorageError};

const MIB: usize = 1024 * 1024;

/// Payloads above this size are uploaded in parts by
/// [`StorageDevice::write_sized`](crate::StorageDevice::write_sized).
pub const DEFAULT_MULTIPART_THRESHOLD: usize = 8 * MIB;
/// Size of the parts the device cuts when it chunks a payload itself.
pub const DEFAULT_PART_SIZE: usize = 5 * MIB;
/// Smallest non-final part S3-compatible backends accept.
pub const DEFAULT_MIN_PART_SIZE: usize = 5 * MIB;
/// Keys requested per listing page.
pub const DEFAULT_LIST_PAGE_SIZE: usize = 1000;

/// Backend credentials, passed through to the client untouched.
#[derive(Clone, Deserialize)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Device configuration, usually loaded from a TOML file:
///
/// ```toml
/// root = "/root"
/// bucket = "media"
/// region = "nyc3"
/// endpoint = "https://nyc3.digitaloceanspaces.com"
/// acl = "public-read"
/// part_size = 8388608
///
/// [credentials]
/// access_key = "AKIA..."
/// secret_key = "..."
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Prefix every derived key starts with.
    pub root: String,
    pub bucket: Option<String>,
    pub credentials: Option<Credentials>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub acl: Acl,
    pub multipart_threshold: usize,
    pub part_size: usize,
    pub min_part_size: usize,
    pub list_page_size: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            root: String::new(),
            bucket: None,
            credentials: None,
            region: None,
            endpoint: None,
            acl: Acl::default(),
            multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
            part_size: DEFAULT_PART_SIZE,
            min_part_size: DEFAULT_MIN_PART_SIZE,
            list_page_size: DEFAULT_LIST_PAGE_SIZE,
        }
    }
}

impl DeviceConfig {
    /// Creates a configuration with default sizes for the given root.
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    /// Load a device configuration from a TOML file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            StorageError::Config(format!("Failed to read device config file: {}", e))
        })?;

        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: DeviceConfig = toml::from_str(content)
            .map_err(|e| StorageError::Config(format!("Failed to parse device config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that the size settings are usable together.
    pub fn validate(&self) -> Result<()> {
        if self.part_size == 0 {
            return Err(StorageError::Config("part_size must be positive".to_string()));
        }
        if self.part_size < self.min_part_size {
            return Err(StorageError::Config(format!(
                "part_size ({}) is below min_part_size ({})",
                self.part_size, self.min_part_size
            )));
        }
        if self.multipart_threshold < self.part_size {
            return Err(StorageError::Config(format!(
                "multipart_threshold ({}) is below part_size ({})",
                self.multipart_threshold, self.part_size
            )));
        }
        if self.list_page_size == 0 {
            return Err(StorageError::Config("list_page_size must be positive".to_string()));
        }
        Ok(())
    }
}
