use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use parking_lot::ReentrantMutex;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, instrument, warn};

use crate::events::{EventHub, ListenerId, StorageEvent};
use crate::lifecycle::{Admission, Closing, ConnectionLifecycle, LifecycleState, StateChange};
use crate::pipeline::{AbortHandle, StreamPipeline};
use crate::queue::{Completion, PendingUpload, UploadTicket};
use crate::resolver::{HandleResolver, HandleSource};
use crate::store::{GridFsConnector, StoreHandle};
use crate::{ConnectionParams, FileDescriptor, GridFsConfig, GridFsError, GridFsResult, UploadRequest};

const EVENT_CAPACITY: usize = 1024;
const NO_RUNTIME: &str = "no Tokio runtime to run the upload";

/// Upload adapter in front of a chunked store.
///
/// Accepts uploads at any time. Until the store handle is resolved, uploads
/// wait in a FIFO queue (or fail fast, per [`crate::QueuePolicy`]) and are
/// replayed once the connection is up. Cloning shares the same adapter.
///
/// Resolution and uploads run as Tokio tasks. Outside a runtime, a source
/// that is not [`HandleSource::Ready`] errors instead of connecting, and
/// uploads fail with a `Connection` error.
#[derive(Clone)]
pub struct GridFsStorage {
    inner: Arc<Inner>,
}

struct Inner {
    lifecycle: ConnectionLifecycle,
    resolver: HandleResolver,
    events: EventHub,
    config: GridFsConfig,
    /// Held from a transition until its listeners ran, so they see transitions in order
    transitions: ReentrantMutex<()>,
}

/// Counts one dispatched upload as finished when dropped, panics included
struct InFlight(Arc<Inner>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.lifecycle.upload_finished();
    }
}

impl GridFsStorage {
    /// Create an adapter. With `connect_eagerly`, resolution starts now.
    pub fn new(source: HandleSource, config: GridFsConfig) -> Self {
        debug!(source = ?source, "Creating storage adapter");
        let storage = Self {
            inner: Arc::new(Inner {
                lifecycle: ConnectionLifecycle::new(config.queue_policy),
                resolver: HandleResolver::new(source),
                events: EventHub::new(EVENT_CAPACITY),
                config,
                transitions: ReentrantMutex::new(()),
            }),
        };

        if storage.inner.config.connect_eagerly {
            storage.inner.start_resolution();
        }
        storage
    }

    /// Adapter over an already open handle
    pub fn from_handle(handle: StoreHandle, config: GridFsConfig) -> Self {
        Self::new(HandleSource::ready(handle), config)
    }

    /// Adapter that opens its own connection
    pub fn connect<C: GridFsConnector + 'static>(
        connector: C,
        params: ConnectionParams,
        config: GridFsConfig,
    ) -> Self {
        Self::new(HandleSource::params(connector, params), config)
    }

    /// Submit an upload. The ticket resolves exactly once.
    ///
    /// Needs a Tokio runtime once the upload is dispatched; without one it
    /// fails with a `Connection` error.
    #[instrument(skip_all, fields(upload_id = %request.id))]
    pub fn submit(&self, request: UploadRequest) -> UploadTicket {
        let (tx, rx) = oneshot::channel();
        let (abort, signal) = AbortHandle::pair();
        let ticket = UploadTicket::new(request.id.clone(), rx, abort);
        self.inner.admit(PendingUpload::new(request, Completion::channel(tx), signal));
        ticket
    }

    /// Submit an upload whose result is delivered to `callback`, exactly once
    #[instrument(skip_all, fields(upload_id = %request.id))]
    pub fn submit_with_callback<F>(&self, request: UploadRequest, callback: F) -> AbortHandle
    where
        F: FnOnce(GridFsResult<FileDescriptor>) + Send + 'static,
    {
        let (abort, signal) = AbortHandle::pair();
        self.inner.admit(PendingUpload::new(
            request,
            Completion::callback(Box::new(callback)),
            signal,
        ));
        abort
    }

    /// Submit and wait for the result
    pub async fn upload(&self, request: UploadRequest) -> GridFsResult<FileDescriptor> {
        self.submit(request).await
    }

    /// Wait until connected. Fails once the lifecycle errored or closed.
    pub async fn ready(&self) -> GridFsResult<StoreHandle> {
        self.inner.start_resolution();

        let mut rx = self.inner.lifecycle.watch();
        let state = *rx
            .wait_for(|state| !state.is_waiting())
            .await
            .map_err(|_| GridFsError::ConnectionClosed)?;

        match state {
            LifecycleState::Connected => self.inner.lifecycle.handle().ok_or(GridFsError::ConnectionClosed),
            LifecycleState::Errored => Err(self
                .inner
                .lifecycle
                .last_error()
                .unwrap_or_else(|| GridFsError::connection("store connection failed"))),
            _ => Err(GridFsError::ConnectionClosed),
        }
    }

    /// Delete a stored file, e.g. to roll back a failed multi-file request
    #[instrument(skip_all, fields(bucket = %descriptor.bucket_name, id = %descriptor.id))]
    pub async fn remove(&self, descriptor: &FileDescriptor) -> GridFsResult<()> {
        let handle = match self.state() {
            LifecycleState::Closing | LifecycleState::Closed => return Err(GridFsError::ConnectionClosed),
            _ => self
                .inner
                .lifecycle
                .handle()
                .ok_or_else(|| GridFsError::connection("store connection is not ready"))?,
        };

        handle.delete(&descriptor.bucket_name, &descriptor.id).await?;
        info!("Removed file {}", descriptor.id);
        Ok(())
    }

    /// Close the adapter: queued uploads fail with `Shutdown`, uploads
    /// already streaming are awaited, then a handle this adapter opened is
    /// closed.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> GridFsResult<()> {
        let Some(closing) = self.inner.begin_closing() else {
            return Ok(());
        };

        let discarded = closing.queued.len();
        for upload in closing.queued {
            self.inner.fail(upload, GridFsError::Shutdown);
        }

        let in_flight = self.inner.lifecycle.in_flight();
        if in_flight > 0 {
            debug!(in_flight, "Waiting for streaming uploads before closing");
        }
        self.inner.lifecycle.wait_idle().await;

        let mut result = Ok(());
        if let Some(handle) = closing.handle {
            if self.inner.resolver.owns_handle() {
                result = handle.close().await;
                if let Err(e) = &result {
                    warn!("Failed to close store handle: {}", e);
                }
            }
        }

        self.inner.finish_closing();

        info!(discarded, "Storage adapter shut down");
        result
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.lifecycle.state()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.lifecycle.is_ready()
    }

    /// Current handle, while connected
    pub fn handle(&self) -> Option<StoreHandle> {
        self.inner.lifecycle.handle()
    }

    /// Uploads waiting for the connection
    pub fn queued(&self) -> usize {
        self.inner.lifecycle.queued()
    }

    /// Observe every lifecycle transition
    pub fn on_state_change<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        self.inner.events.on_state_change(Arc::new(listener))
    }

    /// Observe storage events
    pub fn on<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&StorageEvent) + Send + Sync + 'static,
    {
        self.inner.events.on_event(Arc::new(listener))
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.events.off(id)
    }

    /// Stream of storage events for async consumers
    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.inner.events.subscribe()
    }

    pub fn config(&self) -> &GridFsConfig {
        &self.inner.config
    }
}

impl Inner {
    fn admit(self: &Arc<Self>, upload: PendingUpload) {
        match self.lifecycle.admit(upload) {
            Admission::Dispatch(handle, upload) => self.dispatch(handle, upload, false),
            Admission::Queued {
                upload_id,
                seq,
                start_resolution,
            } => {
                debug!(%upload_id, seq, "Queued upload until the store connects");
                if start_resolution {
                    self.start_resolution();
                }
            }
            Admission::Rejected(upload, error) => self.fail(upload, error),
        }
    }

    /// Begin resolving the handle, unless an attempt already started
    fn start_resolution(self: &Arc<Self>) {
        let _order = self.transitions.lock();
        let Some(change) = self.lifecycle.begin_connecting() else {
            return;
        };
        self.events.emit_state(&change);

        if let Some(handle) = self.resolver.take_ready() {
            self.finish_connecting(handle);
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let inner = self.clone();
                runtime.spawn(async move { inner.resolve_with_retries().await });
            }
            Err(_) => self.fail_connecting(GridFsError::connection("no Tokio runtime to open the store connection")),
        }
    }

    async fn resolve_with_retries(self: Arc<Self>) {
        let policy = &self.config.reconnect;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let error = match self.resolver.resolve().await {
                Ok(handle) => {
                    if let Some(orphan) = self.finish_connecting(handle) {
                        if let Err(e) = orphan.close().await {
                            warn!("Failed to close handle resolved after shutdown: {}", e);
                        }
                    }
                    return;
                }
                Err(error) => error,
            };

            if self.lifecycle.state() != LifecycleState::Connecting {
                debug!("Connection attempt failed after shutdown: {}", error);
                return;
            }

            let will_retry = self.resolver.is_retryable() && policy.allows_retry_after(attempt);

            self.events.emit(StorageEvent::ConnectionError {
                error: error.clone(),
                attempt,
                will_retry,
                at: Utc::now(),
            });

            if !will_retry {
                self.fail_connecting(error);
                return;
            }

            let delay = policy.backoff_for(attempt);
            warn!(attempt, ?delay, "Store connection failed, retrying: {}", error);
            tokio::time::sleep(delay).await;

            if self.lifecycle.state() != LifecycleState::Connecting {
                debug!("Adapter closed while waiting to reconnect");
                return;
            }
        }
    }

    /// Flip to connected and drain the queue in arrival order.
    ///
    /// Returns the handle if the adapter shut down meanwhile and owns it.
    fn finish_connecting(self: &Arc<Self>, handle: StoreHandle) -> Option<StoreHandle> {
        let order = self.transitions.lock();
        match self.lifecycle.connected(handle.clone()) {
            Ok((change, drained)) => {
                info!(queued = drained.len(), "Store connection established");
                self.events.emit_state(&change);
                self.events.emit(StorageEvent::ConnectionEstablished { at: Utc::now() });
                drop(order);

                for upload in drained {
                    let waited = Utc::now() - upload.enqueued_at;
                    debug!(upload_id = %upload.id(), seq = upload.seq, waited_ms = waited.num_milliseconds(), "Replaying queued upload");
                    self.dispatch(handle.clone(), upload, true);
                }
                None
            }
            Err(handle) => {
                debug!("Handle resolved after shutdown, discarding it");
                self.resolver.owns_handle().then_some(handle)
            }
        }
    }

    fn fail_connecting(&self, error: GridFsError) {
        let order = self.transitions.lock();
        let Some((change, drained)) = self.lifecycle.errored(error.clone()) else {
            return;
        };

        error!(queued = drained.len(), "Store connection failed permanently: {}", error);
        self.events.emit_state(&change);
        drop(order);

        for upload in drained {
            self.fail(upload, error.clone());
        }
    }

    /// Any open state `→ Closing`, listeners included
    fn begin_closing(&self) -> Option<Closing> {
        let _order = self.transitions.lock();
        let closing = self.lifecycle.begin_closing()?;
        self.events.emit_state(&closing.change);
        Some(closing)
    }

    fn finish_closing(&self) {
        let _order = self.transitions.lock();
        if let Some(change) = self.lifecycle.closed() {
            self.events.emit_state(&change);
            self.events.emit(StorageEvent::ConnectionClosed { at: Utc::now() });
        }
    }

    /// Spawn the upload task. The lifecycle already counted it in flight.
    fn dispatch(self: &Arc<Self>, handle: StoreHandle, upload: PendingUpload, from_queue: bool) {
        let in_flight = InFlight(self.clone());
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.fail(upload, GridFsError::connection(NO_RUNTIME));
            return;
        };

        self.events.emit(StorageEvent::UploadDispatched {
            upload_id: upload.id().clone(),
            from_queue,
            at: Utc::now(),
        });

        let inner = self.clone();
        runtime.spawn(async move {
            let _in_flight = in_flight;
            inner.process(handle, upload).await
        });
    }

    /// Name and stream one upload, then complete it
    async fn process(self: Arc<Self>, handle: StoreHandle, upload: PendingUpload) {
        let PendingUpload {
            request,
            completion,
            mut abort,
            ..
        } = upload;
        let UploadRequest { id, ctx, file, body } = request;

        let naming = AssertUnwindSafe(self.config.naming.resolve(&ctx, &file))
            .catch_unwind()
            .await;

        let result = match naming {
            Ok(Ok(spec)) => {
                StreamPipeline::new(handle)
                    .run(&id, spec, &file, body, &mut abort)
                    .await
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                error!(upload_id = %id, "Naming function panicked");
                Err(GridFsError::naming("naming function panicked"))
            }
        };

        match &result {
            Ok(descriptor) => {
                info!(upload_id = %id, file_id = %descriptor.id, size = descriptor.size, "Stored file {}", descriptor.filename);
                self.events.emit(StorageEvent::FileStored {
                    upload_id: id,
                    descriptor: descriptor.clone(),
                    at: Utc::now(),
                });
            }
            Err(error) => {
                warn!(upload_id = %id, "Upload failed: {}", error);
                self.events.emit(StorageEvent::UploadFailed {
                    upload_id: id,
                    error: error.clone(),
                    at: Utc::now(),
                });
            }
        }

        completion.complete(result);
    }

    fn fail(&self, upload: PendingUpload, error: GridFsError) {
        debug!(upload_id = %upload.id(), "Rejecting upload: {}", error);
        self.events.emit(StorageEvent::UploadFailed {
            upload_id: upload.id().clone(),
            error: error.clone(),
            at: Utc::now(),
        });
        upload.fail(error);
    }
}
