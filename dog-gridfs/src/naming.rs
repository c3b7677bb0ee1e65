//! Per-upload naming: turns a static spec or a naming function's result into a
//! fully populated [`FileSpec`].
//!
//! A naming function returns loosely shaped JSON. The result is first
//! normalized into a [`NamingOutcome`], then merged with defaults:
//!
//! | returned value         | effect                                      |
//! |------------------------|---------------------------------------------|
//! | `null`                 | everything defaulted                        |
//! | `"report"` / `10`      | filename only (`"report"` / `"10"`)         |
//! | `{ ... }`              | recognized fields used, the rest defaulted  |
//! | `true`, `[..]`, error  | [`GridFsError::Naming`]                     |

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{FileId, FileInfo, FileSpec, GridFsError, GridFsResult, UploadCtx, DEFAULT_BUCKET, DEFAULT_CHUNK_SIZE};

/// Error type naming functions may fail with
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Future returned by a naming function
pub type NamingFuture = BoxFuture<'static, Result<Value, BoxError>>;

/// Per-upload naming function
pub type NamingFn = Arc<dyn Fn(&UploadCtx, &FileInfo) -> NamingFuture + Send + Sync>;

/// How uploads are named
#[derive(Clone, Default)]
pub enum Naming {
    /// Random filename, default bucket and chunk size
    #[default]
    Default,
    /// The same partial spec for every upload
    Static(FileSpecInput),
    /// Computed per upload, possibly asynchronously
    PerFile(NamingFn),
}

impl std::fmt::Debug for Naming {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default => write!(f, "Naming::Default"),
            Self::Static(input) => f.debug_tuple("Naming::Static").field(input).finish(),
            Self::PerFile(_) => write!(f, "Naming::PerFile(..)"),
        }
    }
}

impl Naming {
    /// Async naming function
    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(&UploadCtx, &FileInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
    {
        Self::PerFile(Arc::new(move |ctx: &UploadCtx, file: &FileInfo| -> NamingFuture {
            Box::pin(f(ctx, file))
        }))
    }

    /// Synchronous, infallible naming function
    pub fn from_sync_fn<F>(f: F) -> Self
    where
        F: Fn(&UploadCtx, &FileInfo) -> Value + Send + Sync + 'static,
    {
        Self::PerFile(Arc::new(move |ctx: &UploadCtx, file: &FileInfo| -> NamingFuture {
            let value = f(ctx, file);
            Box::pin(async move { Ok(value) })
        }))
    }

    /// Resolve the spec for one upload
    pub async fn resolve(&self, ctx: &UploadCtx, file: &FileInfo) -> GridFsResult<FileSpec> {
        let input = match self {
            Self::Default => FileSpecInput::default(),
            Self::Static(input) => input.clone(),
            Self::PerFile(f) => {
                let value = f(ctx, file)
                    .await
                    .map_err(|e| GridFsError::naming(e.to_string()))?;
                NamingOutcome::from_value(value)?.into_input()
            }
        };

        Ok(input.into_spec(file))
    }
}

/// Shape of a naming function's result after normalization
#[derive(Debug, Clone, PartialEq)]
pub enum NamingOutcome {
    Empty,
    Scalar(String),
    Partial(FileSpecInput),
}

impl NamingOutcome {
    pub fn from_value(value: Value) -> GridFsResult<Self> {
        match value {
            Value::Null => Ok(Self::Empty),
            Value::String(s) => Ok(Self::Scalar(s)),
            Value::Number(n) => Ok(Self::Scalar(n.to_string())),
            Value::Object(map) => FileSpecInput::from_object(&map).map(Self::Partial),
            Value::Bool(_) => Err(GridFsError::naming("naming result cannot be a boolean")),
            Value::Array(_) => Err(GridFsError::naming("naming result cannot be an array")),
        }
    }

    fn into_input(self) -> FileSpecInput {
        match self {
            Self::Empty => FileSpecInput::default(),
            Self::Scalar(filename) => FileSpecInput {
                filename: Some(filename),
                ..FileSpecInput::default()
            },
            Self::Partial(input) => input,
        }
    }
}

/// Partially specified naming result; `None` fields take defaults
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileSpecInput {
    pub id: Option<FileId>,
    pub filename: Option<String>,
    pub metadata: Option<Value>,
    pub chunk_size: Option<u32>,
    pub bucket_name: Option<String>,
    pub content_type: Option<String>,
}

impl FileSpecInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filename<S: Into<String>>(mut self, filename: S) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_id<I: Into<FileId>>(mut self, id: I) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: u32) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn with_bucket<S: Into<String>>(mut self, bucket: S) -> Self {
        self.bucket_name = Some(bucket.into());
        self
    }

    pub fn with_content_type<S: Into<String>>(mut self, content_type: S) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Read recognized fields (camelCase or snake_case). Unknown keys are ignored.
    pub fn from_object(map: &Map<String, Value>) -> GridFsResult<Self> {
        let filename = match field(map, "filename", "file_name") {
            None => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(other) => return Err(invalid("filename", other)),
        };

        let chunk_size = match field(map, "chunkSize", "chunk_size") {
            None => None,
            Some(v) => match v.as_u64().filter(|n| *n > 0).and_then(|n| u32::try_from(n).ok()) {
                Some(n) => Some(n),
                None => return Err(invalid("chunkSize", v)),
            },
        };

        let bucket_name = match field(map, "bucketName", "bucket_name") {
            None => None,
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(other) => return Err(invalid("bucketName", other)),
        };

        let content_type = match field(map, "contentType", "content_type") {
            None => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => return Err(invalid("contentType", other)),
        };

        Ok(Self {
            id: field(map, "id", "_id").cloned().map(FileId::from_value),
            filename,
            metadata: map.get("metadata").cloned(),
            chunk_size,
            bucket_name,
            content_type,
        })
    }

    /// Apply defaults. The content type falls back to the source's.
    pub fn into_spec(self, file: &FileInfo) -> FileSpec {
        FileSpec {
            id: self.id,
            filename: self.filename.unwrap_or_else(random_filename),
            metadata: self.metadata.unwrap_or(Value::Null),
            chunk_size: self.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE),
            bucket_name: self.bucket_name.unwrap_or_else(|| DEFAULT_BUCKET.to_string()),
            content_type: self.content_type.or_else(|| file.content_type.clone()),
        }
    }
}

/// 32 lowercase hex chars from a fresh random token
pub fn random_filename() -> String {
    Uuid::new_v4().simple().to_string()
}

// null is treated as absent
fn field<'a>(map: &'a Map<String, Value>, camel: &str, snake: &str) -> Option<&'a Value> {
    map.get(camel)
        .or_else(|| map.get(snake))
        .filter(|v| !v.is_null())
}

fn invalid(name: &str, value: &Value) -> GridFsError {
    GridFsError::naming(format!("invalid {} in naming result: {}", name, value))
}
