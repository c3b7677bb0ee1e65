use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

use crate::store::{StoreHandle, UploadOptions, UploadSink};
use crate::{ByteStream, FileDescriptor, FileInfo, FileSpec, GridFsError, GridFsResult, UploadId};

/// Cancels one upload. Cloneable; aborting twice is a no-op.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortHandle {
    pub(crate) fn pair() -> (AbortHandle, AbortSignal) {
        let (tx, rx) = watch::channel(false);
        (Self { tx: Arc::new(tx) }, AbortSignal { rx })
    }

    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Receiving side of an [`AbortHandle`], owned by the upload
pub(crate) struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    pub(crate) fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes once aborted; never completes if every handle was dropped first
    pub(crate) async fn aborted(&mut self) {
        let handles_gone = self.rx.wait_for(|aborted| *aborted).await.is_err();
        if handles_gone {
            std::future::pending::<()>().await;
        }
    }
}

/// Copies one source stream into one destination write stream
pub(crate) struct StreamPipeline {
    handle: StoreHandle,
}

impl StreamPipeline {
    pub(crate) fn new(handle: StoreHandle) -> Self {
        Self { handle }
    }

    /// Open exactly one destination for `spec` and stream `body` into it.
    ///
    /// A source error or an abort discards the destination; only a clean end
    /// of stream produces a descriptor. Every store failure surfaces as a
    /// `Stream` error.
    #[instrument(skip_all, fields(upload_id = %upload_id, bucket = %spec.bucket_name, filename = %spec.filename))]
    pub(crate) async fn run(
        &self,
        upload_id: &UploadId,
        spec: FileSpec,
        file: &FileInfo,
        mut body: ByteStream,
        abort: &mut AbortSignal,
    ) -> GridFsResult<FileDescriptor> {
        if abort.is_aborted() {
            return Err(GridFsError::aborted());
        }

        let options = UploadOptions {
            id: spec.id.clone(),
            chunk_size: spec.chunk_size,
            metadata: spec.metadata.clone(),
            content_type: spec.content_type.clone(),
        };
        let mut sink = self
            .handle
            .open_upload_stream(&spec.bucket_name, &spec.filename, options)
            .await
            .map_err(as_stream_error)?;

        let mut copied: u64 = 0;
        loop {
            let next = tokio::select! {
                biased;
                _ = abort.aborted() => {
                    discard(sink).await;
                    return Err(GridFsError::aborted());
                }
                next = body.next() => next,
            };

            match next {
                Some(Ok(chunk)) => {
                    copied += chunk.len() as u64;
                    if let Err(e) = sink.write(chunk).await {
                        discard(sink).await;
                        return Err(as_stream_error(e));
                    }
                }
                Some(Err(e)) => {
                    discard(sink).await;
                    return Err(GridFsError::stream(e.to_string()));
                }
                None => break,
            }
        }

        // abort raced with end of stream
        if abort.is_aborted() {
            discard(sink).await;
            return Err(GridFsError::aborted());
        }

        let confirmation = sink.finish().await.map_err(as_stream_error)?;
        debug!(bytes = copied, id = %confirmation.id, "Upload stream finished");
        Ok(FileDescriptor::from_write(spec, file, confirmation))
    }
}

/// Store failures during a write belong to that upload, not to the connection
fn as_stream_error(error: GridFsError) -> GridFsError {
    match error {
        GridFsError::Stream { .. } => error,
        other => GridFsError::stream(other.to_string()),
    }
}

async fn discard(sink: Box<dyn UploadSink>) {
    if let Err(e) = sink.abort().await {
        warn!("Failed to abort destination write: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryGridFs;
    use crate::naming::FileSpecInput;
    use crate::store::{GridFsHandle, WriteConfirmation};
    use crate::FileId;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::time::Duration;

    /// Store whose writes fail the way a dropped socket does
    struct ResetStore;

    struct ResetSink;

    #[async_trait]
    impl GridFsHandle for ResetStore {
        async fn open_upload_stream(
            &self,
            _bucket: &str,
            _filename: &str,
            _options: UploadOptions,
        ) -> GridFsResult<Box<dyn UploadSink>> {
            Ok(Box::new(ResetSink))
        }

        async fn delete(&self, _bucket: &str, _id: &FileId) -> GridFsResult<()> {
            Ok(())
        }

        async fn close(&self) -> GridFsResult<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl UploadSink for ResetSink {
        async fn write(&mut self, _chunk: Bytes) -> GridFsResult<()> {
            Err(GridFsError::connection("socket reset"))
        }

        async fn finish(self: Box<Self>) -> GridFsResult<WriteConfirmation> {
            Err(GridFsError::ConnectionClosed)
        }

        async fn abort(self: Box<Self>) -> GridFsResult<()> {
            Ok(())
        }
    }

    fn source(parts: Vec<Result<&'static str, std::io::ErrorKind>>) -> ByteStream {
        Box::pin(futures::stream::iter(parts.into_iter().map(|p| {
            p.map(|s| Bytes::from_static(s.as_bytes()))
                .map_err(|kind| std::io::Error::new(kind, "source failed"))
        })))
    }

    fn spec(bucket: &str) -> FileSpec {
        FileSpecInput::new()
            .with_bucket(bucket)
            .with_chunk_size(4)
            .into_spec(&FileInfo::default())
    }

    #[tokio::test]
    async fn test_clean_copy_produces_descriptor() {
        let store = MemoryGridFs::new();
        let pipeline = StreamPipeline::new(store.handle());
        let (_handle, mut signal) = AbortHandle::pair();

        let descriptor = pipeline
            .run(
                &UploadId::new(),
                spec("fs"),
                &FileInfo::new("doc"),
                source(vec![Ok("abc"), Ok("defgh")]),
                &mut signal,
            )
            .await
            .unwrap();

        assert_eq!(descriptor.size, 8);
        assert_eq!(descriptor.md5, format!("{:x}", md5::compute(b"abcdefgh")));
        assert_eq!(descriptor.chunk_size, 4);
        assert_eq!(store.chunk_count("fs", &descriptor.id), 2);
        assert_eq!(store.opened_streams(), 1);
    }

    #[tokio::test]
    async fn test_source_error_aborts_destination() {
        let store = MemoryGridFs::new();
        let pipeline = StreamPipeline::new(store.handle());
        let (_handle, mut signal) = AbortHandle::pair();

        let err = pipeline
            .run(
                &UploadId::new(),
                spec("fs"),
                &FileInfo::default(),
                source(vec![Ok("abc"), Err(std::io::ErrorKind::ConnectionReset)]),
                &mut signal,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, GridFsError::Stream { .. }));
        assert!(store.files("fs").is_empty());
        assert_eq!(store.aborted_writes(), 1);
    }

    #[tokio::test]
    async fn test_destination_write_failure() {
        let store = MemoryGridFs::new();
        store.fail_writes(true);
        let pipeline = StreamPipeline::new(store.handle());
        let (_handle, mut signal) = AbortHandle::pair();

        let err = pipeline
            .run(&UploadId::new(), spec("fs"), &FileInfo::default(), source(vec![Ok("abc")]), &mut signal)
            .await
            .unwrap_err();

        assert_eq!(err, GridFsError::stream("simulated write failure"));
        assert_eq!(store.aborted_writes(), 1);
    }

    #[tokio::test]
    async fn test_connection_failure_during_write_is_stream_error() {
        let pipeline = StreamPipeline::new(Arc::new(ResetStore));
        let (_handle, mut signal) = AbortHandle::pair();

        let err = pipeline
            .run(&UploadId::new(), spec("fs"), &FileInfo::default(), source(vec![Ok("abc")]), &mut signal)
            .await
            .unwrap_err();

        assert_eq!(err, GridFsError::stream("Connection error: socket reset"));
        assert!(!err.is_connection_level());
    }

    #[tokio::test]
    async fn test_finish_failure_is_stream_error() {
        let pipeline = StreamPipeline::new(Arc::new(ResetStore));
        let (_handle, mut signal) = AbortHandle::pair();

        let err = pipeline
            .run(&UploadId::new(), spec("fs"), &FileInfo::default(), source(vec![]), &mut signal)
            .await
            .unwrap_err();

        assert_eq!(err, GridFsError::stream("Connection closed"));
    }

    #[tokio::test]
    async fn test_open_on_closed_store_is_stream_error() {
        let store = MemoryGridFs::new();
        store.handle().close().await.unwrap();
        let pipeline = StreamPipeline::new(store.handle());
        let (_handle, mut signal) = AbortHandle::pair();

        let err = pipeline
            .run(&UploadId::new(), spec("fs"), &FileInfo::default(), source(vec![Ok("abc")]), &mut signal)
            .await
            .unwrap_err();

        assert!(matches!(err, GridFsError::Stream { .. }));
        assert_eq!(store.opened_streams(), 0);
    }

    #[tokio::test]
    async fn test_abort_mid_stream() {
        let store = MemoryGridFs::new();
        let pipeline = StreamPipeline::new(store.handle());
        let (handle, mut signal) = AbortHandle::pair();

        let body: ByteStream = Box::pin(async_stream::stream! {
            yield Ok::<_, std::io::Error>(Bytes::from_static(b"first"));
            tokio::time::sleep(Duration::from_secs(3600)).await;
            yield Ok::<_, std::io::Error>(Bytes::from_static(b"never"));
        });

        let aborter = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.abort();
        });

        let err = pipeline
            .run(&UploadId::new(), spec("fs"), &FileInfo::default(), body, &mut signal)
            .await
            .unwrap_err();
        aborter.await.unwrap();

        assert_eq!(err, GridFsError::aborted());
        assert!(store.files("fs").is_empty());
        assert_eq!(store.aborted_writes(), 1);
    }

    #[tokio::test]
    async fn test_pre_aborted_upload_opens_nothing() {
        let store = MemoryGridFs::new();
        let pipeline = StreamPipeline::new(store.handle());
        let (handle, mut signal) = AbortHandle::pair();
        handle.abort();

        let result = pipeline
            .run(&UploadId::new(), spec("fs"), &FileInfo::default(), source(vec![Ok("abc")]), &mut signal)
            .await;

        assert!(result.is_err());
        assert_eq!(store.opened_streams(), 0);
    }
}
