//! Common types exchanged with a storage endpoint

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Object metadata sent when a multipart upload is initiated
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    /// Content type
    pub content_type: Option<String>,
    /// Content encoding
    pub content_encoding: Option<String>,
    /// Cache control
    pub cache_control: Option<String>,
    /// Content disposition
    pub content_disposition: Option<String>,
    /// User-defined metadata
    pub user_metadata: HashMap<String, String>,
}

impl ObjectMetadata {
    /// Create new empty metadata
    pub fn new() -> Self {
        Self::default()
    }

    /// Set content type
    pub fn with_content_type(mut self, ct: impl Into<String>) -> Self {
        self.content_type = Some(ct.into());
        self
    }

    /// Add user metadata
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_metadata.insert(key.into(), value.into());
        self
    }
}

/// A part accepted by the service, referenced again when combining
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    /// Part number (1-10000)
    pub part_number: u32,
    /// ETag returned for the part
    pub etag: String,
    /// Part length in bytes
    pub length: u64,
}

/// Result of combining the parts of a multipart upload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompleteMultipartUploadResult {
    /// Object URL
    pub location: String,
    /// ETag of the combined object
    pub etag: String,
    /// Version ID (if versioning enabled)
    pub version_id: Option<String>,
}

/// Object attributes needed to plan a download
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Content length
    pub size: u64,
    /// ETag
    pub etag: String,
    /// Version ID
    pub version_id: Option<String>,
    /// Last modified
    pub last_modified: Option<DateTime<Utc>>,
}

/// A contiguous byte range, `length` bytes starting at `offset`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

impl ByteRange {
    /// Create a range
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Inclusive last byte, `None` for an empty range
    pub fn last_byte(&self) -> Option<u64> {
        self.length.checked_sub(1).map(|l| self.offset + l)
    }

    /// Value for an HTTP `Range` header
    pub fn to_header(&self) -> Option<String> {
        self.last_byte()
            .map(|last| format!("bytes={}-{}", self.offset, last))
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.offset, self.offset + self.length)
    }
}
