//! Lifecycle notifications for resumable transfers

use std::fmt;
use std::sync::Arc;

/// Upload lifecycle transitions
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResumableUploadEventType {
    InitiateMultipartUploadSucceed,
    InitiateMultipartUploadFailed,
    UploadPartSucceed,
    UploadPartFailed,
    CompleteMultipartUploadSucceed,
    CompleteMultipartUploadFailed,
    AbortMultipartUploadSucceed,
    AbortMultipartUploadFailed,
}

/// One upload lifecycle transition
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResumableUploadEvent {
    pub event_type: ResumableUploadEventType,
    /// Part concerned, 0 for whole-upload events
    pub part_number: u32,
    pub upload_id: Option<String>,
    pub etag: Option<String>,
}

impl ResumableUploadEvent {
    pub(crate) fn upload(event_type: ResumableUploadEventType, upload_id: Option<&str>) -> Self {
        Self {
            event_type,
            part_number: 0,
            upload_id: upload_id.map(str::to_string),
            etag: None,
        }
    }

    pub(crate) fn part(
        event_type: ResumableUploadEventType,
        upload_id: &str,
        part_number: u32,
        etag: Option<&str>,
    ) -> Self {
        Self {
            event_type,
            part_number,
            upload_id: Some(upload_id.to_string()),
            etag: etag.map(str::to_string),
        }
    }
}

impl fmt::Display for ResumableUploadEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.event_type)?;
        if self.part_number > 0 {
            write!(f, " part={}", self.part_number)?;
        }
        if let Some(id) = &self.upload_id {
            write!(f, " upload_id={}", id)?;
        }
        Ok(())
    }
}

/// Download lifecycle transitions
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResumableDownloadEventType {
    DownloadPartSucceed,
    DownloadPartFailed,
    RenameTempFileSucceed,
    RenameTempFileFailed,
}

/// One download lifecycle transition
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResumableDownloadEvent {
    pub event_type: ResumableDownloadEventType,
    /// Part concerned, 0 for whole-download events
    pub part_number: u32,
    pub etag: Option<String>,
}

/// Handler for upload events
pub type UploadEventHandler = Arc<dyn Fn(ResumableUploadEvent) + Send + Sync>;

/// Handler for download events
pub type DownloadEventHandler = Arc<dyn Fn(ResumableDownloadEvent) + Send + Sync>;

pub(crate) fn notify<E>(handler: &Option<Arc<dyn Fn(E) + Send + Sync>>, event: E) {
    if let Some(handler) = handler {
        handler(event);
    }
}
