use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::debug;

use crate::store::{GridFsConnector, StoreHandle};
use crate::{ConnectionParams, GridFsError, GridFsResult};

/// The ways a storage adapter can obtain its store handle
pub enum HandleSource {
    /// An already open handle, owned by the caller
    Ready(StoreHandle),
    /// A handle that some other task is still opening
    Pending(BoxFuture<'static, GridFsResult<StoreHandle>>),
    /// Parameters to open a connection with; the adapter owns the result
    Params {
        connector: Arc<dyn GridFsConnector>,
        params: ConnectionParams,
    },
}

impl HandleSource {
    pub fn ready(handle: StoreHandle) -> Self {
        Self::Ready(handle)
    }

    pub fn pending<F>(future: F) -> Self
    where
        F: Future<Output = GridFsResult<StoreHandle>> + Send + 'static,
    {
        Self::Pending(Box::pin(future))
    }

    pub fn params<C: GridFsConnector + 'static>(connector: C, params: ConnectionParams) -> Self {
        Self::Params {
            connector: Arc::new(connector),
            params,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Ready(_) => "ready",
            Self::Pending(_) => "pending",
            Self::Params { .. } => "params",
        }
    }
}

impl std::fmt::Debug for HandleSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Params { params, .. } => f.debug_struct("HandleSource::Params").field("params", params).finish(),
            other => write!(f, "HandleSource::{}", other.kind()),
        }
    }
}

/// Turns a [`HandleSource`] into a handle, one attempt at a time.
///
/// The source sits behind an async mutex held for the whole attempt, so two
/// attempts can never overlap. A pending future is consumed by its first
/// attempt; only parameter sources can be retried.
pub(crate) struct HandleResolver {
    source: Mutex<Option<HandleSource>>,
    owns_handle: bool,
    retryable: bool,
}

impl HandleResolver {
    pub(crate) fn new(source: HandleSource) -> Self {
        let owns_handle = matches!(source, HandleSource::Params { .. });
        Self {
            source: Mutex::new(Some(source)),
            owns_handle,
            retryable: owns_handle,
        }
    }

    /// Whether the adapter opened the handle and must close it
    pub(crate) fn owns_handle(&self) -> bool {
        self.owns_handle
    }

    /// Whether a failed attempt may be followed by another
    pub(crate) fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Take a ready handle without awaiting, if that is what the source is
    pub(crate) fn take_ready(&self) -> Option<StoreHandle> {
        let mut slot = self.source.try_lock().ok()?;
        match slot.take() {
            Some(HandleSource::Ready(handle)) => Some(handle),
            other => {
                *slot = other;
                None
            }
        }
    }

    /// Run one resolution attempt
    pub(crate) async fn resolve(&self) -> GridFsResult<StoreHandle> {
        let mut slot = self.source.lock().await;
        let source = slot
            .take()
            .ok_or_else(|| GridFsError::connection("handle source already consumed"))?;
        debug!(source = source.kind(), "Resolving store handle");

        match source {
            HandleSource::Ready(handle) => Ok(handle),
            HandleSource::Pending(future) => future.await.map_err(as_connection_error),
            HandleSource::Params { connector, params } => {
                let result = connector.connect(&params).await;
                *slot = Some(HandleSource::Params { connector, params });
                result.map_err(as_connection_error)
            }
        }
    }
}

fn as_connection_error(error: GridFsError) -> GridFsError {
    match error {
        GridFsError::Connection { .. } => error,
        other => GridFsError::connection(other.to_string()),
    }
}
