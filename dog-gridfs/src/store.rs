use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::{ConnectionParams, FileId, GridFsResult};

/// Shared handle to an open store connection
pub type StoreHandle = Arc<dyn GridFsHandle>;

/// Opens store connections from raw parameters
#[async_trait]
pub trait GridFsConnector: Send + Sync {
    /// Open a connection. Any error is terminal for this attempt.
    async fn connect(&self, params: &ConnectionParams) -> GridFsResult<StoreHandle>;
}

/// Write-path operations on an open connection to a chunked store
#[async_trait]
pub trait GridFsHandle: Send + Sync {
    /// Open a write stream for one file in `bucket`
    async fn open_upload_stream(
        &self,
        bucket: &str,
        filename: &str,
        options: UploadOptions,
    ) -> GridFsResult<Box<dyn UploadSink>>;

    /// Delete a completed file and its chunks
    async fn delete(&self, bucket: &str, id: &FileId) -> GridFsResult<()>;

    /// Release the connection
    async fn close(&self) -> GridFsResult<()>;
}

impl std::fmt::Debug for dyn GridFsHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("GridFsHandle")
    }
}

/// Destination of one upload.
///
/// Exactly one of `finish` or `abort` ends the write. An aborted write must
/// leave nothing retrievable as a completed file.
#[async_trait]
pub trait UploadSink: Send {
    async fn write(&mut self, chunk: Bytes) -> GridFsResult<()>;

    async fn finish(self: Box<Self>) -> GridFsResult<WriteConfirmation>;

    async fn abort(self: Box<Self>) -> GridFsResult<()>;
}

/// Options passed when opening a write stream
#[derive(Debug, Clone, PartialEq)]
pub struct UploadOptions {
    pub id: Option<FileId>,
    pub chunk_size: u32,
    pub metadata: serde_json::Value,
    pub content_type: Option<String>,
}

/// What the store reports after a completed write
#[derive(Debug, Clone, PartialEq)]
pub struct WriteConfirmation {
    pub id: FileId,
    pub length: u64,
    pub chunk_size: u32,
    pub md5: String,
    pub upload_date: DateTime<Utc>,
}
