use thiserror::Error;

/// Result type for storage operations
pub type GridFsResult<T> = Result<T, GridFsError>;

/// Errors that can terminate an upload or a connection attempt.
///
/// Connection errors are replayed to every upload waiting on the same
/// resolution, so the type is `Clone` and carries its cause as text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GridFsError {
    #[error("Connection error: {reason}")]
    Connection { reason: String },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Naming error: {reason}")]
    Naming { reason: String },

    #[error("Stream error: {reason}")]
    Stream { reason: String },

    #[error("Upload discarded by shutdown")]
    Shutdown,
}

/// Tag of a [`GridFsError`], for hosts mapping failures to responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UploadErrorKind {
    Connection,
    ConnectionClosed,
    Naming,
    Stream,
    Shutdown,
}

impl GridFsError {
    /// Create a connection error
    pub fn connection<S: Into<String>>(reason: S) -> Self {
        Self::Connection {
            reason: reason.into(),
        }
    }

    /// Create a naming error
    pub fn naming<S: Into<String>>(reason: S) -> Self {
        Self::Naming {
            reason: reason.into(),
        }
    }

    /// Create a stream error
    pub fn stream<S: Into<String>>(reason: S) -> Self {
        Self::Stream {
            reason: reason.into(),
        }
    }

    /// Stream error for an upload cancelled by its producer
    pub fn aborted() -> Self {
        Self::stream("upload aborted")
    }

    pub fn kind(&self) -> UploadErrorKind {
        match self {
            Self::Connection { .. } => UploadErrorKind::Connection,
            Self::ConnectionClosed => UploadErrorKind::ConnectionClosed,
            Self::Naming { .. } => UploadErrorKind::Naming,
            Self::Stream { .. } => UploadErrorKind::Stream,
            Self::Shutdown => UploadErrorKind::Shutdown,
        }
    }

    /// True for failures caused by the connection rather than the upload itself
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self.kind(),
            UploadErrorKind::Connection | UploadErrorKind::ConnectionClosed | UploadErrorKind::Shutdown
        )
    }
}

impl From<std::io::Error> for GridFsError {
    fn from(err: std::io::Error) -> Self {
        Self::stream(err.to_string())
    }
}

impl From<serde_json::Error> for GridFsError {
    fn from(err: serde_json::Error) -> Self {
        Self::naming(err.to_string())
    }
}
