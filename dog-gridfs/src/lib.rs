//! # dog-gridfs: Upload storage over a chunked file store
//!
//! `dog-gridfs` streams uploaded files into a GridFS-style store (files plus
//! fixed-size chunks per bucket) for DogRS applications. It accepts uploads
//! before the store connection exists and replays them once it does.
//!
//! ## Key Features
//!
//! - **Connection lifecycle**: Accepts a ready handle, a handle still being opened, or connection parameters
//! - **Upload queue**: Uploads submitted before the connection resolves wait in arrival order
//! - **Per-file naming**: Static or computed filenames, buckets, chunk sizes and metadata
//! - **Exactly-once results**: Every upload completes once, with a descriptor or an error
//! - **Cancellation**: Aborting an upload discards its partial write
//! - **Observable**: State listeners, storage events and a broadcast stream
//!
//! ## Quick Start
//!
//! ```rust
//! use dog_gridfs::prelude::*;
//! use dog_gridfs::MemoryGridFs;
//!
//! # #[tokio::main]
//! # async fn main() -> GridFsResult<()> {
//! // 1. Point the adapter at a store; it connects in the background
//! let store = MemoryGridFs::new();
//! let storage = GridFsStorage::connect(
//!     store.clone(),
//!     ConnectionParams::new("memory://local"),
//!     GridFsConfig::default(),
//! );
//!
//! // 2. Upload right away; the request waits for the connection if needed
//! let body = futures::stream::once(async { Ok::<_, std::io::Error>(bytes::Bytes::from_static(b"Hello, world!")) });
//! let request = UploadRequest::new(
//!     UploadCtx::new().with_actor("user-123"),
//!     FileInfo::new("avatar").with_content_type("text/plain"),
//!     Box::pin(body),
//! );
//! let descriptor = storage.upload(request).await?;
//!
//! assert_eq!(descriptor.bucket_name, "fs");
//! assert_eq!(descriptor.size, 13);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────┐
//! │   Your Service     │  ← Parses requests, owns the byte streams
//! ├────────────────────┤
//! │   GridFsStorage    │  ← Lifecycle, queue, naming, events
//! ├────────────────────┤
//! │   StreamPipeline   │  ← One source into one write stream
//! ├────────────────────┤
//! │   GridFsHandle     │  ← Store primitives
//! └────────────────────┘
//! ```
//!
//! Naming can be computed per upload:
//!
//! ```rust
//! use dog_gridfs::prelude::*;
//! use serde_json::json;
//!
//! let config = GridFsConfig::default().with_naming(Naming::from_sync_fn(|_ctx, file| {
//!     json!({
//!         "bucketName": "photos",
//!         "filename": file.original_name.clone(),
//!         "metadata": { "field": file.field_name.clone() },
//!     })
//! }));
//! # let _ = config;
//! ```

pub mod adapter;
mod config;
mod descriptor;
mod error;
pub mod events;
pub mod lifecycle;
mod memory;
pub mod naming;
mod pipeline;
mod queue;
mod resolver;
pub mod store;
mod types;

// Re-export main types for clean API
pub use adapter::GridFsStorage;
pub use config::{ConnectionParams, GridFsConfig, QueuePolicy, ReconnectPolicy};
pub use descriptor::{FileDescriptor, FileSpec, DEFAULT_BUCKET, DEFAULT_CHUNK_SIZE};
pub use error::{GridFsError, GridFsResult, UploadErrorKind};
pub use events::{EventListener, ListenerId, StateListener, StorageEvent};
pub use lifecycle::{LifecycleState, StateChange, TransitionDetail};
pub use memory::{MemoryGridFs, StoredFile};
pub use naming::{FileSpecInput, Naming, NamingOutcome};
pub use pipeline::AbortHandle;
pub use queue::{CompletionCallback, UploadTicket};
pub use resolver::HandleSource;
pub use store::{GridFsConnector, GridFsHandle, StoreHandle, UploadOptions, UploadSink, WriteConfirmation};
pub use types::{ByteStream, FileId, FileInfo, UploadCtx, UploadId, UploadRequest};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        ConnectionParams, FileDescriptor, FileInfo, GridFsConfig, GridFsError, GridFsResult, GridFsStorage,
        HandleSource, Naming, UploadCtx, UploadRequest, ByteStream,
    };
}
