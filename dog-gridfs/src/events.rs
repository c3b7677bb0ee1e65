use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::lifecycle::StateChange;
use crate::{FileDescriptor, GridFsError, UploadId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

static LISTENER_ID: AtomicU64 = AtomicU64::new(1);

fn next_listener_id() -> ListenerId {
    ListenerId(LISTENER_ID.fetch_add(1, Ordering::Relaxed))
}

/// Observable storage events
#[derive(Debug, Clone)]
pub enum StorageEvent {
    /// The handle resolved and queued uploads are being replayed
    ConnectionEstablished { at: DateTime<Utc> },

    /// A connection attempt failed
    ConnectionError {
        error: GridFsError,
        attempt: u32,
        will_retry: bool,
        at: DateTime<Utc>,
    },

    /// Shutdown finished
    ConnectionClosed { at: DateTime<Utc> },

    /// An upload left the lifecycle for naming and streaming
    UploadDispatched {
        upload_id: UploadId,
        from_queue: bool,
        at: DateTime<Utc>,
    },

    /// An upload completed
    FileStored {
        upload_id: UploadId,
        descriptor: FileDescriptor,
        at: DateTime<Utc>,
    },

    /// An upload failed
    UploadFailed {
        upload_id: UploadId,
        error: GridFsError,
        at: DateTime<Utc>,
    },
}

impl StorageEvent {
    /// Get event type name as string
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::ConnectionEstablished { .. } => "connection-established",
            Self::ConnectionError { .. } => "connection-error",
            Self::ConnectionClosed { .. } => "connection-closed",
            Self::UploadDispatched { .. } => "upload-dispatched",
            Self::FileStored { .. } => "file-stored",
            Self::UploadFailed { .. } => "upload-failed",
        }
    }

    pub fn upload_id(&self) -> Option<&UploadId> {
        match self {
            Self::UploadDispatched { upload_id, .. }
            | Self::FileStored { upload_id, .. }
            | Self::UploadFailed { upload_id, .. } => Some(upload_id),
            _ => None,
        }
    }

    pub fn timestamp(&self) -> &DateTime<Utc> {
        match self {
            Self::ConnectionEstablished { at }
            | Self::ConnectionError { at, .. }
            | Self::ConnectionClosed { at }
            | Self::UploadDispatched { at, .. }
            | Self::FileStored { at, .. }
            | Self::UploadFailed { at, .. } => at,
        }
    }
}

/// Observer of lifecycle transitions
pub type StateListener = Arc<dyn Fn(&StateChange) + Send + Sync>;

/// Observer of storage events
pub type EventListener = Arc<dyn Fn(&StorageEvent) + Send + Sync>;

/// Listener registry plus a broadcast channel for async consumers.
///
/// Emission snapshots the listeners and calls them with no lock held, so a
/// listener may register or remove listeners itself.
pub(crate) struct EventHub {
    state_listeners: RwLock<Vec<(ListenerId, StateListener)>>,
    event_listeners: RwLock<Vec<(ListenerId, EventListener)>>,
    broadcaster: broadcast::Sender<StorageEvent>,
}

impl EventHub {
    pub(crate) fn new(capacity: usize) -> Self {
        let (broadcaster, _) = broadcast::channel(capacity);
        Self {
            state_listeners: RwLock::new(Vec::new()),
            event_listeners: RwLock::new(Vec::new()),
            broadcaster,
        }
    }

    pub(crate) fn on_state_change(&self, listener: StateListener) -> ListenerId {
        let id = next_listener_id();
        self.state_listeners.write().push((id, listener));
        id
    }

    pub(crate) fn on_event(&self, listener: EventListener) -> ListenerId {
        let id = next_listener_id();
        self.event_listeners.write().push((id, listener));
        id
    }

    pub(crate) fn off(&self, id: ListenerId) -> bool {
        let mut removed = false;
        self.state_listeners.write().retain(|(entry, _)| {
            let keep = *entry != id;
            removed |= !keep;
            keep
        });
        self.event_listeners.write().retain(|(entry, _)| {
            let keep = *entry != id;
            removed |= !keep;
            keep
        });
        removed
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.broadcaster.subscribe()
    }

    /// Notify state listeners, in registration order
    pub(crate) fn emit_state(&self, change: &StateChange) {
        let listeners: Vec<StateListener> = self
            .state_listeners
            .read()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();

        for listener in listeners {
            listener(change);
        }
    }

    pub(crate) fn emit(&self, event: StorageEvent) {
        let listeners: Vec<EventListener> = self
            .event_listeners
            .read()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();

        for listener in listeners {
            listener(&event);
        }

        // no subscribers is fine
        let _ = self.broadcaster.send(event);
    }
}
