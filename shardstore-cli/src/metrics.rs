use std::sync::Arc;

use prometheus::{
    register_int_counter, register_int_counter_vec, Encoder, IntCounter, IntCounterVec,
};
use shardstore::{MetricsCollector, SharedMetrics};

/// Prometheus counters for device activity, registered in the default registry.
#[derive(Clone)]
pub struct PrometheusMetrics {
    objects_written: IntCounter,
    parts_uploaded: IntCounter,
    uploads_completed: IntCounter,
    uploads_aborted: IntCounter,
    integrity_failures: IntCounter,
    objects_deleted: IntCounter,
    bytes: IntCounterVec,
}

impl PrometheusMetrics {
    pub fn new() -> prometheus::Result<Self> {
        Ok(Self {
            objects_written: register_int_counter!(
                "shardstore_objects_written_total",
                "Objects stored with a single put"
            )?,
            parts_uploaded: register_int_counter!(
                "shardstore_parts_uploaded_total",
                "Multipart upload parts acknowledged by the backend"
            )?,
            uploads_completed: register_int_counter!(
                "shardstore_uploads_completed_total",
                "Multipart uploads assembled by the backend"
            )?,
            uploads_aborted: register_int_counter!(
                "shardstore_uploads_aborted_total",
                "Multipart uploads abandoned before completion"
            )?,
            integrity_failures: register_int_counter!(
                "shardstore_integrity_failures_total",
                "Stored objects whose hash or size did not match the upload"
            )?,
            objects_deleted: register_int_counter!(
                "shardstore_objects_deleted_total",
                "Objects removed"
            )?,
            bytes: register_int_counter_vec!(
                "shardstore_bytes_total",
                "Payload bytes moved to and from the backend",
                &["direction"]
            )?,
        })
    }

    /// Adapter handed to the storage device.
    pub fn to_device_metrics(&self) -> SharedMetrics {
        SharedMetrics::new(Arc::new(self.clone()))
    }

    /// Text exposition of everything in the default registry.
    pub fn gather_text() -> anyhow::Result<String> {
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&prometheus::gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

impl MetricsCollector for PrometheusMetrics {
    fn object_written(&self) {
        self.objects_written.inc();
    }

    fn part_uploaded(&self) {
        self.parts_uploaded.inc();
    }

    fn upload_completed(&self) {
        self.uploads_completed.inc();
    }

    fn upload_aborted(&self) {
        self.uploads_aborted.inc();
    }

    fn integrity_failed(&self) {
        self.integrity_failures.inc();
    }

    fn objects_deleted(&self, amount: u64) {
        self.objects_deleted.inc_by(amount);
    }

    fn bytes_sent(&self, amount: usize) {
        self.bytes.with_label_values(&["sent"]).inc_by(amount as u64);
    }

    fn bytes_received(&self, amount: usize) {
        self.bytes.with_label_values(&["received"]).inc_by(amount as u64);
    }
}
