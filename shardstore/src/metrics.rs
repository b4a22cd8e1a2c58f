use std::fmt;
use std::sync::Arc;

/// Events a storage device reports about its traffic.
///
/// Every event defaults to doing nothing, so collectors only implement the
/// ones they export.
pub trait MetricsCollector: Send + Sync {
    /// An object was stored with a single verified put.
    fn object_written(&self) {}
    /// One part of a multipart upload was accepted by the backend.
    fn part_uploaded(&self) {}
    /// A multipart upload was assembled and its size checked.
    fn upload_completed(&self) {}
    fn upload_aborted(&self) {}
    /// A stored object did not match the bytes or size that were sent.
    fn integrity_failed(&self) {}
    fn objects_deleted(&self, _amount: u64) {}
    fn bytes_sent(&self, _amount: usize) {}
    fn bytes_received(&self, _amount: usize) {}
}

/// Collector that drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpMetrics;

impl MetricsCollector for NoOpMetrics {}

/// Cloneable handle to the collector in use, [`NoOpMetrics`] unless one is given.
#[derive(Clone)]
pub struct SharedMetrics(Arc<dyn MetricsCollector>);

impl SharedMetrics {
    pub fn new(collector: Arc<dyn MetricsCollector>) -> Self {
        Self(collector)
    }
}

impl std::ops::Deref for SharedMetrics {
    type Target = dyn MetricsCollector;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Default for SharedMetrics {
    fn default() -> Self {
        Self::new(Arc::new(NoOpMetrics))
    }
}

impl fmt::Debug for SharedMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedMetrics")
    }
}
