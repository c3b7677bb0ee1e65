use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::WriteConfirmation;
use crate::{FileId, FileInfo};

/// Chunk size used when naming does not supply one (255 KiB)
pub const DEFAULT_CHUNK_SIZE: u32 = 261_120;

/// Bucket used when naming does not supply one
pub const DEFAULT_BUCKET: &str = "fs";

/// Fully resolved input for a single upload's write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSpec {
    /// External id; `None` lets the store generate one
    pub id: Option<FileId>,
    pub filename: String,
    pub metadata: serde_json::Value,
    pub chunk_size: u32,
    pub bucket_name: String,
    pub content_type: Option<String>,
}

impl FileSpec {
    /// Spec with every default applied and the given filename
    pub fn with_defaults<S: Into<String>>(filename: S, content_type: Option<String>) -> Self {
        Self {
            id: None,
            filename: filename.into(),
            metadata: serde_json::Value::Null,
            chunk_size: DEFAULT_CHUNK_SIZE,
            bucket_name: DEFAULT_BUCKET.to_string(),
            content_type,
        }
    }
}

/// Confirmed record of a completed upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    pub id: FileId,
    pub filename: String,
    pub metadata: serde_json::Value,
    pub bucket_name: String,
    pub chunk_size: u32,
    pub content_type: Option<String>,
    /// Stored length in bytes
    pub size: u64,
    /// Hex MD5 of the stored bytes
    pub md5: String,
    pub upload_date: DateTime<Utc>,

    pub field_name: String,
    pub original_name: Option<String>,
    pub encoding: Option<String>,
}

impl FileDescriptor {
    /// Merge the store's post-write confirmation with the spec that produced it
    pub fn from_write(spec: FileSpec, file: &FileInfo, confirmation: WriteConfirmation) -> Self {
        Self {
            id: confirmation.id,
            filename: spec.filename,
            metadata: spec.metadata,
            bucket_name: spec.bucket_name,
            chunk_size: confirmation.chunk_size,
            content_type: spec.content_type,
            size: confirmation.length,
            md5: confirmation.md5,
            upload_date: confirmation.upload_date,
            field_name: file.field_name.clone(),
            original_name: file.original_name.clone(),
            encoding: file.encoding.clone(),
        }
    }
}
