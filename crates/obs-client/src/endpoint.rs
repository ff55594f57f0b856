//! `StorageEndpoint` implementation for the HTTP client

use crate::ObsClient;
use async_trait::async_trait;
use obs_transfer::{
    ByteRange, ByteStream, CompleteMultipartUploadResult, CompletedPart, EndpointResult, ObjectInfo,
    ObjectMetadata, PartBody, StorageEndpoint,
};

#[async_trait]
impl StorageEndpoint for ObsClient {
    async fn initiate_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        metadata: &ObjectMetadata,
    ) -> EndpointResult<String> {
        Ok(ObsClient::initiate_multipart_upload(self, bucket, key, metadata).await?)
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: PartBody,
    ) -> EndpointResult<String> {
        Ok(ObsClient::upload_part(self, bucket, key, upload_id, part_number, body).await?)
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> EndpointResult<CompleteMultipartUploadResult> {
        Ok(ObsClient::complete_multipart_upload(self, bucket, key, upload_id, parts).await?)
    }

    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> EndpointResult<()> {
        Ok(ObsClient::abort_multipart_upload(self, bucket, key, upload_id).await?)
    }

    async fn get_object_range(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
        range: ByteRange,
    ) -> EndpointResult<ByteStream> {
        Ok(ObsClient::get_object_range(self, bucket, key, version_id, range).await?)
    }

    async fn head_object(&self, bucket: &str, key: &str, version_id: Option<&str>) -> EndpointResult<ObjectInfo> {
        Ok(ObsClient::head_object(self, bucket, key, version_id).await?)
    }
}
