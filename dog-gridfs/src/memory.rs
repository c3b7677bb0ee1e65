use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;

use crate::store::{GridFsConnector, GridFsHandle, StoreHandle, UploadOptions, UploadSink, WriteConfirmation};
use crate::{ConnectionParams, FileId, GridFsError, GridFsResult};

/// Record kept in a bucket's `files` collection
#[derive(Debug, Clone, PartialEq)]
pub struct StoredFile {
    pub id: FileId,
    pub filename: String,
    pub length: u64,
    pub chunk_size: u32,
    pub md5: String,
    pub upload_date: DateTime<Utc>,
    pub metadata: serde_json::Value,
    pub content_type: Option<String>,
}

#[derive(Default)]
struct Bucket {
    files: Vec<StoredFile>,
    /// file key -> ordered chunks
    chunks: HashMap<String, Vec<Bytes>>,
}

#[derive(Default)]
struct MemoryState {
    buckets: RwLock<HashMap<String, Bucket>>,
    connect_failures: AtomicU32,
    connect_delay: RwLock<Option<Duration>>,
    connects: AtomicU32,
    opened_streams: AtomicU32,
    aborted_writes: AtomicU32,
    fail_writes: AtomicBool,
    closed: AtomicBool,
}

/// In-memory chunked store for testing and development.
///
/// Acts both as a connector and as the handle it hands out, so tests can
/// inspect what was written through the same value they configured.
#[derive(Clone, Default)]
pub struct MemoryGridFs {
    state: Arc<MemoryState>,
}

impl MemoryGridFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Type-erased handle to this store
    pub fn handle(&self) -> StoreHandle {
        Arc::new(self.clone())
    }

    /// Make the next `count` connect attempts fail
    pub fn fail_connects(&self, count: u32) {
        self.state.connect_failures.store(count, Ordering::SeqCst);
    }

    /// Delay every connect attempt
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.state.connect_delay.write() = Some(delay);
    }

    /// Make every sink write fail
    pub fn fail_writes(&self, fail: bool) {
        self.state.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> u32 {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn opened_streams(&self) -> u32 {
        self.state.opened_streams.load(Ordering::SeqCst)
    }

    pub fn aborted_writes(&self) -> u32 {
        self.state.aborted_writes.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn has_bucket(&self, bucket: &str) -> bool {
        self.state.buckets.read().contains_key(bucket)
    }

    /// Completed files in `bucket`, in completion order
    pub fn files(&self, bucket: &str) -> Vec<StoredFile> {
        self.state
            .buckets
            .read()
            .get(bucket)
            .map(|b| b.files.clone())
            .unwrap_or_default()
    }

    /// Reassemble a stored file's bytes
    pub fn read(&self, bucket: &str, id: &FileId) -> Option<Bytes> {
        let buckets = self.state.buckets.read();
        let chunks = buckets.get(bucket)?.chunks.get(&id.key())?;
        let mut out = BytesMut::new();
        for chunk in chunks {
            out.extend_from_slice(chunk);
        }
        Some(out.freeze())
    }

    pub fn chunk_count(&self, bucket: &str, id: &FileId) -> usize {
        self.state
            .buckets
            .read()
            .get(bucket)
            .and_then(|b| b.chunks.get(&id.key()))
            .map_or(0, |c| c.len())
    }

    fn ensure_open(&self) -> GridFsResult<()> {
        if self.is_closed() {
            return Err(GridFsError::connection("store connection is closed"));
        }
        Ok(())
    }

    fn commit(&self, bucket: &str, file: StoredFile, chunks: Vec<Bytes>) -> GridFsResult<()> {
        let mut buckets = self.state.buckets.write();
        let bucket = buckets.entry(bucket.to_string()).or_default();

        let key = file.id.key();
        if bucket.chunks.contains_key(&key) {
            return Err(GridFsError::stream(format!("duplicate file id {}", file.id)));
        }

        bucket.chunks.insert(key, chunks);
        bucket.files.push(file);
        Ok(())
    }
}

#[async_trait]
impl GridFsConnector for MemoryGridFs {
    async fn connect(&self, params: &ConnectionParams) -> GridFsResult<StoreHandle> {
        let delay = *self.state.connect_delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.state.connects.fetch_add(1, Ordering::SeqCst);

        let failed = self
            .state
            .connect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(GridFsError::connection(format!("connection refused: {}", params.url)));
        }

        self.state.closed.store(false, Ordering::SeqCst);
        Ok(self.handle())
    }
}

#[async_trait]
impl GridFsHandle for MemoryGridFs {
    async fn open_upload_stream(
        &self,
        bucket: &str,
        filename: &str,
        options: UploadOptions,
    ) -> GridFsResult<Box<dyn UploadSink>> {
        self.ensure_open()?;
        if options.chunk_size == 0 {
            return Err(GridFsError::stream("chunk size must be positive"));
        }

        self.state.opened_streams.fetch_add(1, Ordering::SeqCst);
        debug!(bucket, filename, "Opened memory upload stream");

        Ok(Box::new(MemoryUploadSink {
            store: self.clone(),
            bucket: bucket.to_string(),
            filename: filename.to_string(),
            options,
            pending: BytesMut::new(),
            chunks: Vec::new(),
            digest: md5::Context::new(),
            length: 0,
        }))
    }

    async fn delete(&self, bucket: &str, id: &FileId) -> GridFsResult<()> {
        let mut buckets = self.state.buckets.write();
        let bucket = buckets
            .get_mut(bucket)
            .ok_or_else(|| GridFsError::stream(format!("bucket {} not found", bucket)))?;

        let key = id.key();
        if bucket.chunks.remove(&key).is_none() {
            return Err(GridFsError::stream(format!("file {} not found", id)));
        }
        bucket.files.retain(|f| f.id.key() != key);
        Ok(())
    }

    async fn close(&self) -> GridFsResult<()> {
        self.state.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryUploadSink {
    store: MemoryGridFs,
    bucket: String,
    filename: String,
    options: UploadOptions,
    pending: BytesMut,
    chunks: Vec<Bytes>,
    digest: md5::Context,
    length: u64,
}

#[async_trait]
impl UploadSink for MemoryUploadSink {
    async fn write(&mut self, chunk: Bytes) -> GridFsResult<()> {
        self.store.ensure_open()?;
        if self.store.state.fail_writes.load(Ordering::SeqCst) {
            return Err(GridFsError::stream("simulated write failure"));
        }

        self.digest.consume(&chunk);
        self.length += chunk.len() as u64;
        self.pending.extend_from_slice(&chunk);

        let chunk_size = self.options.chunk_size as usize;
        while self.pending.len() >= chunk_size {
            self.chunks.push(self.pending.split_to(chunk_size).freeze());
        }
        Ok(())
    }

    async fn finish(self: Box<Self>) -> GridFsResult<WriteConfirmation> {
        self.store.ensure_open()?;
        let mut sink = *self;
        if !sink.pending.is_empty() {
            sink.chunks.push(sink.pending.split().freeze());
        }

        let confirmation = WriteConfirmation {
            id: sink.options.id.clone().unwrap_or_else(FileId::object_id),
            length: sink.length,
            chunk_size: sink.options.chunk_size,
            md5: format!("{:x}", sink.digest.compute()),
            upload_date: Utc::now(),
        };

        let file = StoredFile {
            id: confirmation.id.clone(),
            filename: sink.filename,
            length: confirmation.length,
            chunk_size: confirmation.chunk_size,
            md5: confirmation.md5.clone(),
            upload_date: confirmation.upload_date,
            metadata: sink.options.metadata,
            content_type: sink.options.content_type,
        };

        sink.store.commit(&sink.bucket, file, sink.chunks)?;
        Ok(confirmation)
    }

    async fn abort(self: Box<Self>) -> GridFsResult<()> {
        self.store.state.aborted_writes.fetch_add(1, Ordering::SeqCst);
        debug!(bucket = %self.bucket, filename = %self.filename, "Aborted memory upload stream");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(chunk_size: u32) -> UploadOptions {
        UploadOptions {
            id: None,
            chunk_size,
            metadata: serde_json::Value::Null,
            content_type: None,
        }
    }

    #[test]
    fn test_handle_debug_output() {
        assert_eq!(format!("{:?}", MemoryGridFs::new().handle()), "GridFsHandle");
    }

    #[tokio::test]
    async fn test_write_splits_into_chunks() {
        let store = MemoryGridFs::new();
        let mut sink = store.open_upload_stream("fs", "a.bin", options(4)).await.unwrap();

        sink.write(Bytes::from_static(b"hello ")).await.unwrap();
        sink.write(Bytes::from_static(b"world")).await.unwrap();
        let confirmation = sink.finish().await.unwrap();

        assert_eq!(confirmation.length, 11);
        assert_eq!(confirmation.md5, format!("{:x}", md5::compute(b"hello world")));
        assert_eq!(store.chunk_count("fs", &confirmation.id), 3);
        assert_eq!(store.read("fs", &confirmation.id).unwrap(), Bytes::from_static(b"hello world"));
    }

    #[tokio::test]
    async fn test_abort_leaves_nothing_behind() {
        let store = MemoryGridFs::new();
        let mut sink = store.open_upload_stream("plants", "a.bin", options(4)).await.unwrap();
        sink.write(Bytes::from_static(b"partial")).await.unwrap();
        sink.abort().await.unwrap();

        assert!(store.files("plants").is_empty());
        assert!(!store.has_bucket("plants"));
        assert_eq!(store.aborted_writes(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_ids_are_rejected() {
        let store = MemoryGridFs::new();
        let mut opts = options(8);
        opts.id = Some(FileId::from(1i64));

        let sink = store.open_upload_stream("fs", "a", opts.clone()).await.unwrap();
        sink.finish().await.unwrap();
        let sink = store.open_upload_stream("fs", "b", opts).await.unwrap();

        assert!(sink.finish().await.is_err());
        assert_eq!(store.files("fs").len(), 1);
    }

    #[tokio::test]
    async fn test_open_sink_fails_after_close() {
        let store = MemoryGridFs::new();
        let mut sink = store.open_upload_stream("fs", "a", options(4)).await.unwrap();
        store.close().await.unwrap();

        assert!(matches!(
            sink.write(Bytes::from_static(b"late")).await,
            Err(GridFsError::Connection { .. })
        ));
        assert!(sink.finish().await.is_err());
        assert!(store.files("fs").is_empty());
    }

    #[tokio::test]
    async fn test_connect_failures_then_success() {
        let store = MemoryGridFs::new();
        store.fail_connects(1);
        let params = ConnectionParams::new("memory://test");

        assert!(store.connect(&params).await.is_err());
        assert!(store.connect(&params).await.is_ok());
        assert_eq!(store.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_delete_removes_file() {
        let store = MemoryGridFs::new();
        let sink = store.open_upload_stream("fs", "a", options(8)).await.unwrap();
        let confirmation = sink.finish().await.unwrap();

        store.delete("fs", &confirmation.id).await.unwrap();
        assert!(store.files("fs").is_empty());
        assert!(store.delete("fs", &confirmation.id).await.is_err());
    }
}
