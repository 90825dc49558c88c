//! Represents multipart upload sessions and their committed parts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A multipart upload initiated against one object path.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MultipartUpload {
    /// Server-assigned upload id.
    pub upload_id: String,

    /// Target container name.
    pub container: String,

    /// Target object name.
    pub object_name: String,

    /// When the upload was initiated.
    pub initiated_at: DateTime<Utc>,
}

impl MultipartUpload {
    pub fn new(upload_id: impl Into<String>, container: &str, object_name: &str) -> Self {
        Self {
            upload_id: upload_id.into(),
            container: container.to_string(),
            object_name: object_name.to_string(),
            initiated_at: Utc::now(),
        }
    }
}

/// A part accepted by the server, as listed in the commit manifest.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CompletedPart {
    /// Part number (1-based, strictly increasing in source order).
    pub part_number: u32,

    /// Server-returned ETag (or block id for block-based protocols).
    pub etag: String,

    /// Size in bytes.
    pub size: u64,
}
