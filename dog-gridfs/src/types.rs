use bytes::Bytes;
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use uuid::Uuid;

/// Stream of bytes for upload content
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Identifier of a stored file.
///
/// Store-generated ids are 24-char hex ObjectIds, but a naming function may
/// supply any JSON scalar (`1`, `"invoice-7"`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(pub serde_json::Value);

impl FileId {
    /// Generate an ObjectId-shaped id: 4 bytes of seconds then 8 random bytes
    pub fn object_id() -> Self {
        Self::object_id_at(chrono::Utc::now().timestamp())
    }

    fn object_id_at(unix_secs: i64) -> Self {
        // ObjectId seconds are unsigned 32-bit and wrap modulo 2^32 (year 2106)
        let secs = (unix_secs & 0xffff_ffff) as u32;
        let random = Uuid::new_v4().simple().to_string();
        Self(serde_json::Value::String(format!("{:08x}{}", secs, &random[..16])))
    }

    pub fn from_value(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    /// Stable text form, usable as a map key
    pub fn key(&self) -> String {
        self.0.to_string()
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            serde_json::Value::String(s) => write!(f, "{}", s),
            other => write!(f, "{}", other),
        }
    }
}

impl From<&str> for FileId {
    fn from(value: &str) -> Self {
        Self(serde_json::Value::String(value.to_string()))
    }
}

impl From<String> for FileId {
    fn from(value: String) -> Self {
        Self(serde_json::Value::String(value))
    }
}

impl From<i64> for FileId {
    fn from(value: i64) -> Self {
        Self(serde_json::Value::from(value))
    }
}

/// Unique identifier of one submitted upload, used in events and logs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadId(pub String);

impl UploadId {
    pub fn new() -> Self {
        Self(format!("upl_{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UploadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Request context handed to naming functions
#[derive(Debug, Clone)]
pub struct UploadCtx {
    pub request_id: String,
    pub actor_id: Option<String>,
    /// Host-specific request data (form fields, headers, ...)
    pub attributes: serde_json::Value,
}

impl UploadCtx {
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            actor_id: None,
            attributes: serde_json::Value::Null,
        }
    }

    pub fn with_request_id<S: Into<String>>(mut self, request_id: S) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn with_actor<S: Into<String>>(mut self, actor_id: S) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn with_attribute<K: Into<String>, V: Serialize>(mut self, key: K, value: V) -> Self {
        if self.attributes.is_null() {
            self.attributes = serde_json::Value::Object(serde_json::Map::new());
        }
        if let Some(obj) = self.attributes.as_object_mut() {
            obj.insert(key.into(), serde_json::to_value(value).unwrap_or(serde_json::Value::Null));
        }
        self
    }
}

impl Default for UploadCtx {
    fn default() -> Self {
        Self::new()
    }
}

/// What the host knows about an incoming file before reading it
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileInfo {
    pub field_name: String,
    pub original_name: Option<String>,
    pub encoding: Option<String>,
    pub content_type: Option<String>,
    pub size: Option<u64>,
}

impl FileInfo {
    pub fn new<S: Into<String>>(field_name: S) -> Self {
        Self {
            field_name: field_name.into(),
            ..Self::default()
        }
    }

    pub fn with_original_name<S: Into<String>>(mut self, name: S) -> Self {
        self.original_name = Some(name.into());
        self
    }

    pub fn with_encoding<S: Into<String>>(mut self, encoding: S) -> Self {
        self.encoding = Some(encoding.into());
        self
    }

    pub fn with_content_type<S: Into<String>>(mut self, content_type: S) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }
}

/// One upload: context, file info and the byte source
pub struct UploadRequest {
    pub id: UploadId,
    pub ctx: UploadCtx,
    pub file: FileInfo,
    pub body: ByteStream,
}

impl UploadRequest {
    pub fn new(ctx: UploadCtx, file: FileInfo, body: ByteStream) -> Self {
        Self {
            id: UploadId::new(),
            ctx,
            file,
            body,
        }
    }
}

impl std::fmt::Debug for UploadRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadRequest")
            .field("id", &self.id)
            .field("ctx", &self.ctx)
            .field("file", &self.file)
            .finish_non_exhaustive()
    }
}
