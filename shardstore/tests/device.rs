use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use shardstore::integrity::{content_md5, is_multipart_etag};
use shardstore::{
    Acl, ChunkOutcome, CompletedPart, DeviceConfig, InMemoryObjectStore, ListPage,
    LocalObjectStore, MetricsCollector, ObjectHead, ObjectStoreClient, PutOptions, Result,
    SessionState, SharedMetrics, StorageDevice, StorageError, UploadSession,
};

const ROOT: &str = "/root";
const PART: usize = 1024;

fn small_parts_config() -> DeviceConfig {
    DeviceConfig {
        multipart_threshold: 2 * PART,
        part_size: PART,
        min_part_size: PART,
        list_page_size: 3,
        ..DeviceConfig::new(ROOT)
    }
}

fn setup() -> (Arc<InMemoryObjectStore>, StorageDevice) {
    let store = Arc::new(InMemoryObjectStore::new().with_min_part_size(PART));
    let device = StorageDevice::new(small_parts_config(), store.clone()).unwrap();
    (store, device)
}

fn payload(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
}

#[test]
fn test_name_and_root() {
    let (_store, device) = setup();
    assert_eq!(device.name(), "Object Storage");
    assert_eq!(device.root(), ROOT);
}

#[test]
fn test_path() {
    let (_store, device) = setup();
    assert_eq!(device.get_path("image.png").unwrap(), "/root/i/m/a/g/image.png");
    assert_eq!(device.get_path("x.png").unwrap(), "/root/x/./p/n/x.png");
    assert_eq!(device.get_path("y").unwrap(), "/root/y/x/x/x/y");
    assert!(matches!(device.get_path(""), Err(StorageError::InvalidPath(_))));
}

#[tokio::test]
async fn test_write_and_read() {
    let (_store, device) = setup();
    let key = device.get_path("text-for-read.txt").unwrap();

    assert!(device
        .write(&key, Bytes::from_static(b"Hello World"), "text/plain")
        .await
        .unwrap());
    assert_eq!(device.read(&key).await.unwrap(), Bytes::from_static(b"Hello World"));

    assert!(device.delete(&key).await.unwrap());
}

#[tokio::test]
async fn test_read_missing() {
    let (_store, device) = setup();
    let key = device.get_path("missing.txt").unwrap();
    assert!(device.read(&key).await.unwrap_err().is_not_found());
    assert!(!device.exists(&key).await);
}

#[tokio::test]
async fn test_move() {
    let (_store, device) = setup();
    let source = device.get_path("text-for-move.txt").unwrap();
    let destination = device.get_path("text-for-move-new.txt").unwrap();

    device
        .write(&source, Bytes::from_static(b"Hello World"), "text/plain")
        .await
        .unwrap();
    assert!(device.move_object(&source, &destination).await.unwrap());

    assert_eq!(
        device.read(&destination).await.unwrap(),
        Bytes::from_static(b"Hello World")
    );
    assert!(!device.exists(&source).await);
    assert_eq!(device.get_file_mime_type(&destination).await.unwrap(), "text/plain");
}

#[tokio::test]
async fn test_move_missing_source() {
    let (_store, device) = setup();
    let source = device.get_path("nothing-here.txt").unwrap();
    let destination = device.get_path("still-nothing.txt").unwrap();
    assert!(device
        .move_object(&source, &destination)
        .await
        .unwrap_err()
        .is_not_found());
    assert!(!device.exists(&destination).await);
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let (_store, device) = setup();
    let key = device.get_path("text-for-delete.txt").unwrap();
    device
        .write(&key, Bytes::from_static(b"Hello World"), "text/plain")
        .await
        .unwrap();

    assert!(device.delete(&key).await.unwrap());
    assert!(!device.exists(&key).await);
    assert!(device.delete(&key).await.unwrap());
}

#[tokio::test]
async fn test_delete_path_across_pages() {
    let (store, device) = setup();
    let bucket = format!("{}/bucket", ROOT);

    let mut keys = Vec::new();
    for i in 0..10 {
        let key = device
            .get_path(&format!("text-for-delete-path{}.txt", i))
            .unwrap()
            .replacen(ROOT, &bucket, 1);
        device
            .write(&key, Bytes::from_static(b"Hello World"), "text/plain")
            .await
            .unwrap();
        keys.push(key);
    }
    let outside = device.get_path("keep-me.txt").unwrap();
    device
        .write(&outside, Bytes::from_static(b"keep"), "text/plain")
        .await
        .unwrap();

    // page size is 3, so the sweep needs several listing pages
    assert!(device.delete_path(&bucket).await.unwrap());

    for key in &keys {
        assert!(!device.exists(key).await);
    }
    assert!(device.exists(&outside).await);
    assert_eq!(store.object_count(), 1);

    // empty prefix is still a success
    assert!(device.delete_path(&bucket).await.unwrap());
}

#[tokio::test]
async fn test_file_metadata() {
    let (_store, device) = setup();
    let key = device.get_path("kitten-1.jpg").unwrap();
    let data = payload(599);
    device.write(&key, data.clone(), "image/jpeg").await.unwrap();

    assert_eq!(device.get_file_size(&key).await.unwrap(), 599);
    assert_eq!(device.get_file_mime_type(&key).await.unwrap(), "image/jpeg");
    assert_eq!(device.get_file_hash(&key).await.unwrap(), content_md5(&data));

    let missing = device.get_path("kitten-3.jpg").unwrap();
    assert!(device.get_file_size(&missing).await.unwrap_err().is_not_found());
    assert!(device.get_file_mime_type(&missing).await.unwrap_err().is_not_found());
    assert!(device.get_file_hash(&missing).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_unsupported_space_figures() {
    let (store, device) = setup();
    assert_eq!(device.get_directory_size("resources/disk-a/"), -1);
    assert_eq!(device.get_partition_free_space(), -1);
    assert_eq!(device.get_partition_total_space(), -1);

    device
        .write(&device.get_path("a.txt").unwrap(), payload(10), "text/plain")
        .await
        .unwrap();
    store.set_available(false);
    assert_eq!(device.get_directory_size(ROOT), -1);
    assert_eq!(device.get_partition_free_space(), -1);
    assert_eq!(device.get_partition_total_space(), -1);
}

#[tokio::test]
async fn test_part_upload() {
    let (store, device) = setup();
    let data = payload(5 * PART + 300);
    let dest = device.get_path("uploaded.mp4").unwrap();
    let chunks = data.len().div_ceil(PART) as u32;

    let mut session = UploadSession::new("video/mp4");
    let mut etags = Vec::new();
    for (index, start) in (0..data.len()).step_by(PART).enumerate() {
        let end = (start + PART).min(data.len());
        let outcome = device
            .upload(&dest, data.slice(start..end), index as u32 + 1, chunks, &mut session)
            .await
            .unwrap();
        etags.push(outcome.etag().to_string());
        assert_eq!(outcome.is_complete(), index as u32 + 1 == chunks);
    }

    assert_eq!(session.state(), SessionState::Completed);
    assert_eq!(etags.len(), 6);
    assert_eq!(
        session.parts().iter().map(|p| p.etag.clone()).collect::<Vec<_>>(),
        etags
    );
    assert_eq!(device.get_file_size(&dest).await.unwrap(), data.len() as u64);
    assert_eq!(device.read(&dest).await.unwrap(), data);
    assert_eq!(store.pending_uploads(), 0);

    // the tag of an assembled object is not a content hash
    let hash = device.get_file_hash(&dest).await.unwrap();
    assert!(is_multipart_etag(&hash));
    assert_ne!(hash, content_md5(&data));
}

#[tokio::test]
async fn test_part_upload_rejects_small_parts() {
    let (store, device) = setup();
    let dest = device.get_path("uploaded.mp4").unwrap();
    let mut session = UploadSession::new("video/mp4");

    let err = device
        .upload(&dest, payload(PART - 1), 1, 3, &mut session)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::PartSizeViolation { .. }));
    assert_eq!(store.pending_uploads(), 0);
}

#[tokio::test]
async fn test_write_sized_switches_to_multipart() {
    let (store, device) = setup();
    let small = device.get_path("small.bin").unwrap();
    let large = device.get_path("large.bin").unwrap();

    device.write_sized(&small, payload(2 * PART), "application/octet-stream").await.unwrap();
    assert!(!is_multipart_etag(&device.get_file_hash(&small).await.unwrap()));

    let data = payload(3 * PART + 1);
    assert!(device.write_sized(&large, data.clone(), "application/octet-stream").await.unwrap());
    assert!(is_multipart_etag(&device.get_file_hash(&large).await.unwrap()));
    assert_eq!(device.read(&large).await.unwrap(), data);
    assert_eq!(store.pending_uploads(), 0);
}

#[tokio::test]
async fn test_upload_file() {
    let (_store, device) = setup();
    let dir = tempfile::tempdir().unwrap();

    let data = payload(4 * PART + 17);
    let source = dir.path().join("large_file.mp4");
    tokio::fs::write(&source, &data).await.unwrap();
    let dest = device.get_path("large_file.mp4").unwrap();
    assert!(device.upload_file(&source, &dest, "video/mp4").await.unwrap());
    assert_eq!(device.read(&dest).await.unwrap(), data);
    assert_eq!(device.get_file_mime_type(&dest).await.unwrap(), "video/mp4");

    let small_source = dir.path().join("note.txt");
    tokio::fs::write(&small_source, b"Hello World").await.unwrap();
    let small_dest = device.get_path("note.txt").unwrap();
    assert!(device.upload_file(&small_source, &small_dest, "text/plain").await.unwrap());
    assert_eq!(device.read(&small_dest).await.unwrap(), Bytes::from_static(b"Hello World"));

    let err = device
        .upload_file(dir.path().join("absent"), &small_dest, "text/plain")
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Io(_)));
}

#[tokio::test]
async fn test_abandon_upload() {
    let (store, device) = setup();
    let dest = device.get_path("abandoned.bin").unwrap();
    let mut session = UploadSession::default();

    device.upload(&dest, payload(PART), 1, 2, &mut session).await.unwrap();
    assert_eq!(store.pending_uploads(), 1);
    device.abandon_upload(&mut session).await.unwrap();
    assert_eq!(store.pending_uploads(), 0);
    assert!(!device.exists(&dest).await);
}

#[tokio::test]
async fn test_abandon_upload_the_backend_already_dropped() {
    let (store, device) = setup();
    let dest = device.get_path("expired.bin").unwrap();
    let mut session = UploadSession::default();

    device.upload(&dest, payload(PART), 1, 2, &mut session).await.unwrap();
    let upload_id = session.upload_id().unwrap().to_string();
    store.multipart_abort(&upload_id).await.unwrap();

    device.abandon_upload(&mut session).await.unwrap();
    assert_eq!(session.state(), SessionState::Uninitialized);

    // the reset session can start over
    let first = device.upload(&dest, payload(PART), 1, 2, &mut session).await.unwrap();
    assert!(!first.is_complete());
    let last = device.upload(&dest, payload(10), 2, 2, &mut session).await.unwrap();
    assert!(last.is_complete());
    assert_eq!(device.get_file_size(&dest).await.unwrap(), (PART + 10) as u64);
}

#[tokio::test]
async fn test_transfer_between_devices() {
    let (source_store, source) = setup();
    let (target_store, target) = setup();

    let from = source.get_path("kitten-2.png").unwrap();
    let to = target.get_path("kitten-2.png").unwrap();
    let data = payload(3 * PART);
    source.write_sized(&from, data.clone(), "image/png").await.unwrap();

    assert!(source.transfer(&from, &to, &target).await.unwrap());
    assert!(!source.exists(&from).await);
    assert_eq!(target.read(&to).await.unwrap(), data);
    assert_eq!(target.get_file_mime_type(&to).await.unwrap(), "image/png");
    assert_eq!(source_store.object_count(), 0);
    assert_eq!(target_store.object_count(), 1);
}

#[tokio::test]
async fn test_backend_errors_pass_through() {
    let (store, device) = setup();
    let key = device.get_path("offline.txt").unwrap();
    store.set_available(false);

    let err = device.write(&key, payload(4), "text/plain").await.unwrap_err();
    assert!(matches!(err, StorageError::BackendUnavailable(_)));
    let err = device.delete(&key).await.unwrap_err();
    assert!(matches!(err, StorageError::BackendUnavailable(_)));
    assert!(!device.exists(&key).await);
}

#[tokio::test]
async fn test_quota_exceeded() {
    let store = Arc::new(InMemoryObjectStore::new().with_quota(16));
    let device = StorageDevice::new(DeviceConfig::new(ROOT), store).unwrap();
    let key = device.get_path("big.txt").unwrap();

    let err = device.write(&key, payload(17), "text/plain").await.unwrap_err();
    assert!(matches!(err, StorageError::QuotaExceeded(_)));
}

#[tokio::test]
async fn test_concurrent_writes_to_distinct_keys() {
    let (store, device) = setup();
    let device = Arc::new(device);

    let mut handles = Vec::new();
    for i in 0..16 {
        let device = Arc::clone(&device);
        handles.push(tokio::spawn(async move {
            let key = device.get_path(&format!("file-{}.txt", i)).unwrap();
            device.write(&key, payload(i + 1), "text/plain").await.unwrap();
            key
        }));
    }
    for (i, handle) in handles.into_iter().enumerate() {
        let key = handle.await.unwrap();
        assert_eq!(device.read(&key).await.unwrap(), payload(i + 1));
    }
    assert_eq!(store.object_count(), 16);
}

#[derive(Default)]
struct CountingMetrics {
    written: AtomicU64,
    parts: AtomicU64,
    completed: AtomicU64,
    deleted: AtomicU64,
    aborted: AtomicU64,
    failures: AtomicU64,
}

impl MetricsCollector for CountingMetrics {
    fn object_written(&self) {
        self.written.fetch_add(1, Ordering::SeqCst);
    }
    fn part_uploaded(&self) {
        self.parts.fetch_add(1, Ordering::SeqCst);
    }
    fn upload_completed(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }
    fn upload_aborted(&self) {
        self.aborted.fetch_add(1, Ordering::SeqCst);
    }
    fn integrity_failed(&self) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }
    fn objects_deleted(&self, amount: u64) {
        self.deleted.fetch_add(amount, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_metrics_are_reported() {
    let counters = Arc::new(CountingMetrics::default());
    let store = Arc::new(InMemoryObjectStore::new().with_min_part_size(PART));
    let device = StorageDevice::with_metrics(
        small_parts_config(),
        store,
        SharedMetrics::new(counters.clone()),
    )
    .unwrap();

    let small = device.get_path("small.txt").unwrap();
    let large = device.get_path("large.txt").unwrap();
    device.write(&small, payload(10), "text/plain").await.unwrap();
    device.write_sized(&large, payload(3 * PART), "text/plain").await.unwrap();
    device.delete_path(ROOT).await.unwrap();

    let abandoned = device.get_path("abandoned.bin").unwrap();
    let mut session = UploadSession::default();
    device.upload(&abandoned, payload(PART), 1, 2, &mut session).await.unwrap();
    device.abandon_upload(&mut session).await.unwrap();

    assert_eq!(counters.written.load(Ordering::SeqCst), 1);
    assert_eq!(counters.parts.load(Ordering::SeqCst), 4);
    assert_eq!(counters.completed.load(Ordering::SeqCst), 1);
    assert_eq!(counters.deleted.load(Ordering::SeqCst), 2);
    assert_eq!(counters.aborted.load(Ordering::SeqCst), 1);
    assert_eq!(counters.failures.load(Ordering::SeqCst), 0);
}

#[derive(Debug)]
enum Fault {
    /// Stores different bytes and reports an opaque tag.
    CorruptOpaquePut,
    /// Stores the bytes but reports the MD5 of an empty body.
    MisreportedHash,
    /// Completes uploads without their last part.
    DropLastPart,
}

/// In-memory store that misbehaves according to `fault`.
#[derive(Debug)]
struct FaultyStore {
    inner: InMemoryObjectStore,
    fault: Fault,
}

#[async_trait::async_trait]
impl ObjectStoreClient for FaultyStore {
    async fn put(&self, key: &str, data: Bytes, options: PutOptions) -> Result<String> {
        match self.fault {
            Fault::CorruptOpaquePut => {
                let mut corrupted = data.to_vec();
                corrupted.push(b'!');
                let options = PutOptions {
                    content_md5: None,
                    ..options
                };
                self.inner.put(key, Bytes::from(corrupted), options).await?;
                Ok("opaque-version-1".to_string())
            }
            Fault::MisreportedHash => {
                self.inner.put(key, data, options).await?;
                Ok(format!("\"{}\"", content_md5(b"")))
            }
            Fault::DropLastPart => self.inner.put(key, data, options).await,
        }
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        self.inner.get(key).await
    }

    async fn head(&self, key: &str) -> Result<ObjectHead> {
        self.inner.head(key).await
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<()> {
        self.inner.copy(src, dst).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.inner.remove(key).await
    }

    async fn list_by_prefix(
        &self,
        prefix: &str,
        page_token: Option<&str>,
        max_keys: usize,
    ) -> Result<ListPage> {
        self.inner.list_by_prefix(prefix, page_token, max_keys).await
    }

    async fn multipart_init(&self, key: &str, content_type: &str, acl: Acl) -> Result<String> {
        self.inner.multipart_init(key, content_type, acl).await
    }

    async fn multipart_upload_part(
        &self,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String> {
        self.inner.multipart_upload_part(upload_id, part_number, data).await
    }

    async fn multipart_complete(&self, upload_id: &str, parts: &[CompletedPart]) -> Result<()> {
        match self.fault {
            Fault::DropLastPart => {
                let kept = &parts[..parts.len() - 1];
                self.inner.multipart_complete(upload_id, kept).await
            }
            Fault::CorruptOpaquePut | Fault::MisreportedHash => {
                self.inner.multipart_complete(upload_id, parts).await
            }
        }
    }
}

#[tokio::test]
async fn test_unreported_hash_is_checked_against_stored_content() {
    let store = Arc::new(FaultyStore {
        inner: InMemoryObjectStore::new(),
        fault: Fault::CorruptOpaquePut,
    });
    let counters = Arc::new(CountingMetrics::default());
    let device = StorageDevice::with_metrics(
        DeviceConfig::new(ROOT),
        store,
        SharedMetrics::new(counters.clone()),
    )
    .unwrap();
    let key = device.get_path("text.txt").unwrap();

    let err = device
        .write(&key, Bytes::from_static(b"Hello World"), "text/plain")
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::IntegrityMismatch { .. }));
    assert_eq!(counters.failures.load(Ordering::SeqCst), 1);
    assert_eq!(counters.written.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_reported_hash_mismatch_is_counted() {
    let store = Arc::new(FaultyStore {
        inner: InMemoryObjectStore::new(),
        fault: Fault::MisreportedHash,
    });
    let counters = Arc::new(CountingMetrics::default());
    let device = StorageDevice::with_metrics(
        DeviceConfig::new(ROOT),
        store,
        SharedMetrics::new(counters.clone()),
    )
    .unwrap();
    let key = device.get_path("text.txt").unwrap();

    let err = device
        .write(&key, Bytes::from_static(b"Hello World"), "text/plain")
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::IntegrityMismatch { .. }));
    assert_eq!(counters.failures.load(Ordering::SeqCst), 1);
    assert_eq!(counters.written.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_size_mismatch_after_completion() {
    let store = Arc::new(FaultyStore {
        inner: InMemoryObjectStore::new().with_min_part_size(PART),
        fault: Fault::DropLastPart,
    });
    let device = StorageDevice::new(small_parts_config(), store).unwrap();
    let dest = device.get_path("truncated.bin").unwrap();

    let mut session = UploadSession::default();
    let first = device.upload(&dest, payload(PART), 1, 2, &mut session).await.unwrap();
    assert!(matches!(first, ChunkOutcome::PartUploaded { part_number: 1, .. }));

    let err = device
        .upload(&dest, payload(10), 2, 2, &mut session)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StorageError::SizeMismatch { expected, actual }
            if expected == (PART + 10) as u64 && actual == PART as u64
    ));
    assert_ne!(session.state(), SessionState::Completed);
}

#[tokio::test]
async fn test_device_over_local_directory() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalObjectStore::open(dir.path())
        .await
        .unwrap()
        .with_min_part_size(PART);
    let device = StorageDevice::new(small_parts_config(), Arc::new(store)).unwrap();

    let key = device.get_path("x.png").unwrap();
    device.write(&key, Bytes::from_static(b"Hello World"), "image/png").await.unwrap();
    assert_eq!(device.read(&key).await.unwrap(), Bytes::from_static(b"Hello World"));
    assert_eq!(device.get_file_mime_type(&key).await.unwrap(), "image/png");

    let large = device.get_path("uploaded.mp4").unwrap();
    let data = payload(3 * PART + 5);
    device.write_sized(&large, data.clone(), "video/mp4").await.unwrap();
    assert_eq!(device.get_file_size(&large).await.unwrap(), data.len() as u64);

    let moved = device.get_path("moved.png").unwrap();
    device.move_object(&key, &moved).await.unwrap();
    assert!(!device.exists(&key).await);

    assert!(device.delete_path(ROOT).await.unwrap());
    assert!(!device.exists(&moved).await);
    assert!(!device.exists(&large).await);
}
