use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use crate::pipeline::{AbortHandle, AbortSignal};
use crate::{FileDescriptor, GridFsError, GridFsResult, UploadId, UploadRequest};

/// Callback flavor of an upload's completion
pub type CompletionCallback = Box<dyn FnOnce(GridFsResult<FileDescriptor>) + Send>;

/// Where an upload's single result goes. Consumed on use.
///
/// Dropped without a result (e.g. its task panicked), it delivers a `Stream`
/// error, so the receiver always hears back exactly once.
pub(crate) struct Completion {
    target: Option<CompletionTarget>,
}

enum CompletionTarget {
    Channel(oneshot::Sender<GridFsResult<FileDescriptor>>),
    Callback(CompletionCallback),
}

impl CompletionTarget {
    fn deliver(self, result: GridFsResult<FileDescriptor>) {
        match self {
            // receiver gone means the caller stopped waiting
            Self::Channel(tx) => {
                let _ = tx.send(result);
            }
            Self::Callback(cb) => cb(result),
        }
    }
}

impl Completion {
    pub(crate) fn channel(tx: oneshot::Sender<GridFsResult<FileDescriptor>>) -> Self {
        Self {
            target: Some(CompletionTarget::Channel(tx)),
        }
    }

    pub(crate) fn callback(cb: CompletionCallback) -> Self {
        Self {
            target: Some(CompletionTarget::Callback(cb)),
        }
    }

    pub(crate) fn complete(mut self, result: GridFsResult<FileDescriptor>) {
        if let Some(target) = self.target.take() {
            target.deliver(result);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(target) = self.target.take() {
            target.deliver(Err(GridFsError::stream(UNFINISHED)));
        }
    }
}

const UNFINISHED: &str = "upload task ended without a result";

/// Future resolving to the outcome of one submitted upload
pub struct UploadTicket {
    id: UploadId,
    rx: oneshot::Receiver<GridFsResult<FileDescriptor>>,
    abort: AbortHandle,
}

impl UploadTicket {
    pub(crate) fn new(
        id: UploadId,
        rx: oneshot::Receiver<GridFsResult<FileDescriptor>>,
        abort: AbortHandle,
    ) -> Self {
        Self { id, rx, abort }
    }

    pub fn id(&self) -> &UploadId {
        &self.id
    }

    /// Handle that cancels this upload, queued or in flight
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }
}

impl Future for UploadTicket {
    type Output = GridFsResult<FileDescriptor>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|result| {
            result.unwrap_or_else(|_| Err(GridFsError::stream(UNFINISHED)))
        })
    }
}

/// An upload waiting for the store handle
pub(crate) struct PendingUpload {
    pub(crate) request: UploadRequest,
    pub(crate) completion: Completion,
    pub(crate) abort: AbortSignal,
    pub(crate) enqueued_at: DateTime<Utc>,
    pub(crate) seq: u64,
}

impl PendingUpload {
    pub(crate) fn new(request: UploadRequest, completion: Completion, abort: AbortSignal) -> Self {
        Self {
            request,
            completion,
            abort,
            enqueued_at: Utc::now(),
            seq: 0,
        }
    }

    pub(crate) fn id(&self) -> &UploadId {
        &self.request.id
    }

    /// Resolve without dispatching
    pub(crate) fn fail(self, error: GridFsError) {
        self.completion.complete(Err(error));
    }
}

/// FIFO buffer of uploads received before the handle was ready.
///
/// Lives inside the lifecycle's lock, so enqueue and drain never interleave.
#[derive(Default)]
pub(crate) struct UploadQueue {
    items: VecDeque<PendingUpload>,
    next_seq: u64,
}

impl UploadQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn enqueue(&mut self, mut upload: PendingUpload) -> u64 {
        upload.seq = self.next_seq;
        self.next_seq += 1;
        let seq = upload.seq;
        self.items.push_back(upload);
        seq
    }

    /// Remove every queued upload, oldest first
    pub(crate) fn drain(&mut self) -> Vec<PendingUpload> {
        self.items.drain(..).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FileInfo, UploadCtx};

    fn pending(name: &str) -> (PendingUpload, UploadTicket) {
        let request = UploadRequest::new(
            UploadCtx::new(),
            FileInfo::new("photos").with_original_name(name),
            Box::pin(futures::stream::empty::<Result<bytes::Bytes, std::io::Error>>()),
        );
        let (tx, rx) = oneshot::channel();
        let (handle, signal) = AbortHandle::pair();
        let ticket = UploadTicket::new(request.id.clone(), rx, handle);
        (PendingUpload::new(request, Completion::channel(tx), signal), ticket)
    }

    #[test]
    fn test_drain_is_fifo_and_empties() {
        let mut queue = UploadQueue::new();
        for name in ["a", "b", "c"] {
            queue.enqueue(pending(name).0);
        }
        assert_eq!(queue.len(), 3);

        let drained = queue.drain();
        let names: Vec<_> = drained
            .iter()
            .map(|p| p.request.file.original_name.clone().unwrap())
            .collect();
        let seqs: Vec<_> = drained.iter().map(|p| p.seq).collect();

        assert_eq!(names, ["a", "b", "c"]);
        assert_eq!(seqs, [0, 1, 2]);
        assert_eq!(queue.len(), 0);
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn test_sequence_continues_across_drains() {
        let mut queue = UploadQueue::new();
        queue.enqueue(pending("a").0);
        queue.drain();
        assert_eq!(queue.enqueue(pending("b").0), 1);
    }

    #[tokio::test]
    async fn test_failed_pending_resolves_ticket() {
        let (upload, ticket) = pending("a");
        upload.fail(GridFsError::Shutdown);
        assert_eq!(ticket.await.unwrap_err(), GridFsError::Shutdown);
    }

    #[test]
    fn test_ticket_pending_until_completed() {
        let (upload, ticket) = pending("a");
        let mut ticket = tokio_test::task::spawn(ticket);
        tokio_test::assert_pending!(ticket.poll());

        upload.fail(GridFsError::Shutdown);
        assert!(ticket.is_woken());
        tokio_test::assert_ready_err!(ticket.poll());
    }

    #[test]
    fn test_dropped_callback_completion_reports_failure() {
        let (tx, rx) = std::sync::mpsc::channel();
        let completion = Completion::callback(Box::new(move |result: GridFsResult<FileDescriptor>| {
            tx.send(result).unwrap();
        }));
        drop(completion);

        assert_eq!(rx.recv().unwrap().unwrap_err(), GridFsError::stream(UNFINISHED));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dropped_completion_still_resolves_ticket() {
        let (upload, ticket) = pending("a");
        drop(upload);
        assert!(matches!(ticket.await, Err(GridFsError::Stream { .. })));
    }

    #[test]
    fn test_callback_completion_runs_once() {
        let (tx, rx) = std::sync::mpsc::channel();
        let completion = Completion::callback(Box::new(move |result: GridFsResult<FileDescriptor>| {
            tx.send(result.is_err()).unwrap();
        }));
        completion.complete(Err(GridFsError::Shutdown));

        assert!(rx.recv().unwrap());
        assert!(rx.try_recv().is_err());
    }
}
