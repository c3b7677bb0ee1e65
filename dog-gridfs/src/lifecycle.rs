use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::queue::{PendingUpload, UploadQueue};
use crate::store::StoreHandle;
use crate::{GridFsError, QueuePolicy, UploadId};

/// Connection state of one storage adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    /// No resolution attempted yet
    Pending,
    /// Resolution in flight, including retries
    Connecting,
    Connected,
    Closing,
    Closed,
    /// Resolution failed for good
    Errored,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Errored => "errored",
        }
    }

    /// Still waiting for a handle
    pub fn is_waiting(&self) -> bool {
        matches!(self, Self::Pending | Self::Connecting)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload attached to a transition
#[derive(Clone)]
pub enum TransitionDetail {
    None,
    Handle(StoreHandle),
    Error(GridFsError),
}

/// One lifecycle transition, as seen by state listeners
#[derive(Clone)]
pub struct StateChange {
    pub previous: LifecycleState,
    pub current: LifecycleState,
    pub detail: TransitionDetail,
}

impl StateChange {
    pub fn error(&self) -> Option<&GridFsError> {
        match &self.detail {
            TransitionDetail::Error(e) => Some(e),
            _ => None,
        }
    }

    pub fn handle(&self) -> Option<&StoreHandle> {
        match &self.detail {
            TransitionDetail::Handle(h) => Some(h),
            _ => None,
        }
    }
}

impl std::fmt::Debug for StateChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let detail = match &self.detail {
            TransitionDetail::None => "none".to_string(),
            TransitionDetail::Handle(_) => "handle".to_string(),
            TransitionDetail::Error(e) => e.to_string(),
        };
        f.debug_struct("StateChange")
            .field("previous", &self.previous)
            .field("current", &self.current)
            .field("detail", &detail)
            .finish()
    }
}

/// Outcome of offering an upload to the lifecycle
pub(crate) enum Admission {
    Dispatch(StoreHandle, PendingUpload),
    Queued {
        upload_id: UploadId,
        seq: u64,
        /// First upload to find the lifecycle pending; it kicks off resolution
        start_resolution: bool,
    },
    Rejected(PendingUpload, GridFsError),
}

/// Everything shutdown has to release
pub(crate) struct Closing {
    pub(crate) change: StateChange,
    pub(crate) handle: Option<StoreHandle>,
    pub(crate) queued: Vec<PendingUpload>,
}

struct Slot {
    state: LifecycleState,
    handle: Option<StoreHandle>,
    error: Option<GridFsError>,
    queue: UploadQueue,
}

/// State machine guarding the store handle and the upload queue.
///
/// Every transition happens under one mutex, which is never held across an
/// await. Transitions that are not legal from the current state return
/// `None` and change nothing.
///
/// Uploads handed out for dispatch are counted until their task finishes, so
/// shutdown can wait for them before releasing the handle.
pub(crate) struct ConnectionLifecycle {
    slot: Mutex<Slot>,
    state_tx: watch::Sender<LifecycleState>,
    in_flight: watch::Sender<usize>,
    policy: QueuePolicy,
}

impl ConnectionLifecycle {
    pub(crate) fn new(policy: QueuePolicy) -> Self {
        let (state_tx, _) = watch::channel(LifecycleState::Pending);
        let (in_flight, _) = watch::channel(0);
        Self {
            slot: Mutex::new(Slot {
                state: LifecycleState::Pending,
                handle: None,
                error: None,
                queue: UploadQueue::new(),
            }),
            state_tx,
            in_flight,
            policy,
        }
    }

    pub(crate) fn state(&self) -> LifecycleState {
        self.slot.lock().state
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.state() == LifecycleState::Connected
    }

    pub(crate) fn handle(&self) -> Option<StoreHandle> {
        let slot = self.slot.lock();
        match slot.state {
            LifecycleState::Connected => slot.handle.clone(),
            _ => None,
        }
    }

    pub(crate) fn last_error(&self) -> Option<GridFsError> {
        self.slot.lock().error.clone()
    }

    pub(crate) fn queued(&self) -> usize {
        self.slot.lock().queue.len()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<LifecycleState> {
        self.state_tx.subscribe()
    }

    /// Uploads dispatched whose task has not finished yet
    pub(crate) fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    /// Balance one dispatched upload
    pub(crate) fn upload_finished(&self) {
        self.in_flight.send_modify(|n| *n = n.saturating_sub(1));
    }

    /// Wait until every dispatched upload has finished
    pub(crate) async fn wait_idle(&self) {
        let mut rx = self.in_flight.subscribe();
        // the sender lives as long as self
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    fn start_uploads(&self, count: usize) {
        if count > 0 {
            self.in_flight.send_modify(|n| *n += count);
        }
    }

    /// Decide what happens to a newly submitted upload
    pub(crate) fn admit(&self, upload: PendingUpload) -> Admission {
        let mut slot = self.slot.lock();
        match slot.state {
            LifecycleState::Connected => match slot.handle.clone() {
                Some(handle) => {
                    self.start_uploads(1);
                    Admission::Dispatch(handle, upload)
                }
                None => Admission::Rejected(upload, GridFsError::connection("connected without a handle")),
            },
            LifecycleState::Pending | LifecycleState::Connecting => match self.policy {
                QueuePolicy::FailFast => Admission::Rejected(
                    upload,
                    GridFsError::connection("store connection is not ready"),
                ),
                QueuePolicy::Buffer => {
                    let start_resolution = slot.state == LifecycleState::Pending;
                    let upload_id = upload.id().clone();
                    let seq = slot.queue.enqueue(upload);
                    Admission::Queued {
                        upload_id,
                        seq,
                        start_resolution,
                    }
                }
            },
            LifecycleState::Errored => {
                let error = slot
                    .error
                    .clone()
                    .unwrap_or_else(|| GridFsError::connection("store connection failed"));
                Admission::Rejected(upload, error)
            }
            LifecycleState::Closing | LifecycleState::Closed => {
                Admission::Rejected(upload, GridFsError::ConnectionClosed)
            }
        }
    }

    /// `Pending → Connecting`. Only the caller that gets `Some` may resolve.
    pub(crate) fn begin_connecting(&self) -> Option<StateChange> {
        let mut slot = self.slot.lock();
        if slot.state != LifecycleState::Pending {
            return None;
        }
        Some(self.transition(&mut slot, LifecycleState::Connecting, TransitionDetail::None))
    }

    /// `Connecting → Connected`, taking the queue for draining.
    ///
    /// Hands the handle back if the adapter was shut down meanwhile.
    pub(crate) fn connected(
        &self,
        handle: StoreHandle,
    ) -> Result<(StateChange, Vec<PendingUpload>), StoreHandle> {
        let mut slot = self.slot.lock();
        if slot.state != LifecycleState::Connecting {
            return Err(handle);
        }

        slot.handle = Some(handle.clone());
        slot.error = None;
        let drained = slot.queue.drain();
        self.start_uploads(drained.len());
        let change = self.transition(&mut slot, LifecycleState::Connected, TransitionDetail::Handle(handle));
        Ok((change, drained))
    }

    /// `Connecting → Errored`, taking the queue for failing
    pub(crate) fn errored(&self, error: GridFsError) -> Option<(StateChange, Vec<PendingUpload>)> {
        let mut slot = self.slot.lock();
        if slot.state != LifecycleState::Connecting {
            return None;
        }

        slot.error = Some(error.clone());
        let drained = slot.queue.drain();
        let change = self.transition(&mut slot, LifecycleState::Errored, TransitionDetail::Error(error));
        Some((change, drained))
    }

    /// Any non-closing state `→ Closing`, releasing handle and queue
    pub(crate) fn begin_closing(&self) -> Option<Closing> {
        let mut slot = self.slot.lock();
        if matches!(slot.state, LifecycleState::Closing | LifecycleState::Closed) {
            return None;
        }

        let handle = slot.handle.take();
        let queued = slot.queue.drain();
        let change = self.transition(&mut slot, LifecycleState::Closing, TransitionDetail::None);
        Some(Closing { change, handle, queued })
    }

    /// `Closing → Closed`
    pub(crate) fn closed(&self) -> Option<StateChange> {
        let mut slot = self.slot.lock();
        if slot.state != LifecycleState::Closing {
            return None;
        }
        Some(self.transition(&mut slot, LifecycleState::Closed, TransitionDetail::None))
    }

    fn transition(&self, slot: &mut Slot, next: LifecycleState, detail: TransitionDetail) -> StateChange {
        let previous = slot.state;
        slot.state = next;
        self.state_tx.send_replace(next);
        StateChange {
            previous,
            current: next,
            detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryGridFs;
    use crate::pipeline::AbortHandle;
    use crate::queue::{Completion, UploadTicket};
    use crate::{FileInfo, UploadCtx, UploadRequest};
    use tokio::sync::oneshot;

    fn upload() -> (PendingUpload, UploadTicket) {
        let request = UploadRequest::new(
            UploadCtx::new(),
            FileInfo::new("photos"),
            Box::pin(futures::stream::empty::<Result<bytes::Bytes, std::io::Error>>()),
        );
        let (tx, rx) = oneshot::channel();
        let (handle, signal) = AbortHandle::pair();
        let ticket = UploadTicket::new(request.id.clone(), rx, handle);
        (PendingUpload::new(request, Completion::channel(tx), signal), ticket)
    }

    #[test]
    fn test_only_first_caller_begins_connecting() {
        let lifecycle = ConnectionLifecycle::new(QueuePolicy::Buffer);
        let change = lifecycle.begin_connecting().unwrap();

        assert_eq!(change.previous, LifecycleState::Pending);
        assert_eq!(change.current, LifecycleState::Connecting);
        assert!(lifecycle.begin_connecting().is_none());
    }

    #[test]
    fn test_pending_uploads_queue_then_drain_on_connect() {
        let lifecycle = ConnectionLifecycle::new(QueuePolicy::Buffer);

        let first = lifecycle.admit(upload().0);
        assert!(matches!(first, Admission::Queued { seq: 0, start_resolution: true, .. }));

        lifecycle.begin_connecting();
        let second = lifecycle.admit(upload().0);
        assert!(matches!(second, Admission::Queued { seq: 1, start_resolution: false, .. }));
        assert_eq!(lifecycle.queued(), 2);

        let (change, drained) = lifecycle.connected(MemoryGridFs::new().handle()).ok().unwrap();
        assert_eq!(change.current, LifecycleState::Connected);
        assert!(change.handle().is_some());
        assert_eq!(drained.iter().map(|p| p.seq).collect::<Vec<_>>(), [0, 1]);
        assert_eq!(lifecycle.queued(), 0);

        assert!(matches!(lifecycle.admit(upload().0), Admission::Dispatch(..)));
    }

    #[test]
    fn test_fail_fast_rejects_while_waiting() {
        let lifecycle = ConnectionLifecycle::new(QueuePolicy::FailFast);
        match lifecycle.admit(upload().0) {
            Admission::Rejected(_, err) => assert!(matches!(err, GridFsError::Connection { .. })),
            _ => panic!("expected rejection"),
        }
        assert_eq!(lifecycle.queued(), 0);
    }

    #[test]
    fn test_errored_replays_error_to_later_uploads() {
        let lifecycle = ConnectionLifecycle::new(QueuePolicy::Buffer);
        lifecycle.admit(upload().0);
        lifecycle.begin_connecting();

        let (change, drained) = lifecycle.errored(GridFsError::connection("refused")).unwrap();
        assert_eq!(change.current, LifecycleState::Errored);
        assert_eq!(change.error(), Some(&GridFsError::connection("refused")));
        assert_eq!(drained.len(), 1);

        match lifecycle.admit(upload().0) {
            Admission::Rejected(_, err) => assert_eq!(err, GridFsError::connection("refused")),
            _ => panic!("expected rejection"),
        }
        assert!(lifecycle.begin_connecting().is_none());
    }

    #[test]
    fn test_closing_releases_queue_and_blocks_connect() {
        let lifecycle = ConnectionLifecycle::new(QueuePolicy::Buffer);
        lifecycle.admit(upload().0);
        lifecycle.begin_connecting();

        let closing = lifecycle.begin_closing().unwrap();
        assert_eq!(closing.change.previous, LifecycleState::Connecting);
        assert_eq!(closing.queued.len(), 1);
        assert!(closing.handle.is_none());
        assert!(lifecycle.begin_closing().is_none());

        assert!(lifecycle.connected(MemoryGridFs::new().handle()).is_err());
        assert_eq!(lifecycle.closed().unwrap().current, LifecycleState::Closed);
        assert!(matches!(
            lifecycle.admit(upload().0),
            Admission::Rejected(_, GridFsError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_dispatched_uploads_counted_until_finished() {
        let lifecycle = ConnectionLifecycle::new(QueuePolicy::Buffer);
        lifecycle.admit(upload().0);
        lifecycle.begin_connecting();
        lifecycle.connected(MemoryGridFs::new().handle()).ok().unwrap();
        assert!(matches!(lifecycle.admit(upload().0), Admission::Dispatch(..)));
        assert_eq!(lifecycle.in_flight(), 2);

        let mut idle = tokio_test::task::spawn(lifecycle.wait_idle());
        tokio_test::assert_pending!(idle.poll());

        lifecycle.upload_finished();
        tokio_test::assert_pending!(idle.poll());
        lifecycle.upload_finished();
        tokio_test::assert_ready!(idle.poll());
        assert_eq!(lifecycle.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_watch_follows_transitions() {
        let lifecycle = ConnectionLifecycle::new(QueuePolicy::Buffer);
        let mut rx = lifecycle.watch();
        lifecycle.begin_connecting();
        lifecycle.connected(MemoryGridFs::new().handle()).ok().unwrap();

        let state = *rx.wait_for(|s| !s.is_waiting()).await.unwrap();
        assert_eq!(state, LifecycleState::Connected);
        assert!(lifecycle.is_ready());
        assert!(lifecycle.handle().is_some());
    }
}
