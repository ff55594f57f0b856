//! Storage endpoint capability consumed by the transfer engine

use crate::error::EndpointError;
use crate::types::{ByteRange, CompleteMultipartUploadResult, CompletedPart, ObjectInfo, ObjectMetadata};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream};
use futures::TryStreamExt;
use std::fmt;

/// Result type for endpoint calls
pub type EndpointResult<T> = std::result::Result<T, EndpointError>;

/// Stream of body chunks for a ranged read
pub type ByteStream = BoxStream<'static, EndpointResult<Bytes>>;

/// Body of one part upload, handed over as a stream of chunks
pub struct PartBody {
    length: u64,
    stream: ByteStream,
}

impl PartBody {
    /// A body of exactly `length` bytes produced by `stream`
    pub fn new(length: u64, stream: ByteStream) -> Self {
        Self { length, stream }
    }

    /// Declared body length
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn into_stream(self) -> ByteStream {
        self.stream
    }

    /// Read the whole body into memory
    pub async fn collect(self) -> EndpointResult<Bytes> {
        let mut buf = BytesMut::with_capacity(self.length as usize);
        let mut stream = self.stream;
        while let Some(chunk) = stream.try_next().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }
}

impl From<Bytes> for PartBody {
    fn from(data: Bytes) -> Self {
        let length = data.len() as u64;
        Self::new(length, Box::pin(stream::once(async move { EndpointResult::Ok(data) })))
    }
}

impl fmt::Debug for PartBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartBody").field("length", &self.length).finish()
    }
}

/// The multipart and ranged-read operations a transfer needs
#[async_trait]
pub trait StorageEndpoint: Send + Sync {
    /// Start a multipart upload session and return its upload ID
    async fn initiate_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        metadata: &ObjectMetadata,
    ) -> EndpointResult<String>;

    /// Upload one part and return its ETag. The body is consumed as it is
    /// sent, so callers can observe bytes leaving chunk by chunk.
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: PartBody,
    ) -> EndpointResult<String>;

    /// Combine uploaded parts; `parts` must be sorted by part number
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> EndpointResult<CompleteMultipartUploadResult>;

    /// Discard a multipart upload session and its parts
    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> EndpointResult<()>;

    /// Read `range` of an object
    async fn get_object_range(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
        range: ByteRange,
    ) -> EndpointResult<ByteStream>;

    /// Object size and identity
    async fn head_object(&self, bucket: &str, key: &str, version_id: Option<&str>) -> EndpointResult<ObjectInfo>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_part_body_collects_chunks_in_order() {
        let chunks: Vec<EndpointResult<Bytes>> = vec![Ok(Bytes::from_static(b"ab")), Ok(Bytes::from_static(b"cde"))];
        let body = PartBody::new(5, Box::pin(stream::iter(chunks)));
        assert_eq!(body.len(), 5);
        assert_eq!(body.collect().await.unwrap(), Bytes::from_static(b"abcde"));
    }

    #[tokio::test]
    async fn test_part_body_surfaces_stream_errors() {
        let chunks: Vec<EndpointResult<Bytes>> = vec![
            Ok(Bytes::from_static(b"ab")),
            Err(EndpointError::Transport("reset".to_string())),
        ];
        let body = PartBody::new(4, Box::pin(stream::iter(chunks)));
        assert!(matches!(body.collect().await, Err(EndpointError::Transport(_))));
    }

    #[test]
    fn test_part_body_from_bytes() {
        let body = PartBody::from(Bytes::new());
        assert!(body.is_empty());
    }
}
