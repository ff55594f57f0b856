//! Multipart upload operations

use crate::client::{metadata_headers, ObjectRequest};
use crate::{ClientError, ObsClient, Result};
use obs_transfer::{CompleteMultipartUploadResult, CompletedPart, ObjectMetadata, PartBody};
use reqwest::{header, Method};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InitiateMultipartUploadResult {
    upload_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename = "CompleteMultipartUpload")]
struct CompleteMultipartUpload<'a> {
    #[serde(rename = "Part")]
    parts: Vec<PartEntry<'a>>,
}

#[derive(Debug, Serialize)]
struct PartEntry<'a> {
    #[serde(rename = "PartNumber")]
    part_number: u32,
    #[serde(rename = "ETag")]
    etag: &'a str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CompleteMultipartUploadOutput {
    #[serde(rename = "Location")]
    location: Option<String>,
    #[serde(rename = "ETag")]
    etag: Option<String>,
}

impl ObsClient {
    /// Start a multipart upload and return its upload ID
    #[instrument(skip(self, metadata))]
    pub async fn initiate_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        metadata: &ObjectMetadata,
    ) -> Result<String> {
        let mut request = ObjectRequest::new(Method::POST, bucket, key).query("uploads", "");
        for (name, value) in metadata_headers(metadata)? {
            request = request.header(name, &value)?;
        }

        let text = self.send(request).await?.text().await?;
        let result: InitiateMultipartUploadResult =
            quick_xml::de::from_str(&text).map_err(|e| ClientError::Xml(e.to_string()))?;
        debug!(upload_id = %result.upload_id, "multipart upload initiated");
        Ok(result.upload_id)
    }

    /// Upload one part and return its ETag. The body is streamed, so a
    /// dropped connection fails the call instead of re-sending it.
    #[instrument(skip(self, body), fields(size = body.len()))]
    pub async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: PartBody,
    ) -> Result<String> {
        let request = ObjectRequest::new(Method::PUT, bucket, key)
            .query("partNumber", part_number.to_string())
            .query("uploadId", upload_id)
            .stream_body(body);
        let response = self.send(request).await?;

        response
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim_matches('"').to_string())
            .ok_or_else(|| ClientError::InvalidResponse("missing ETag".to_string()))
    }

    /// Combine uploaded parts into the final object
    #[instrument(skip(self, parts), fields(parts = parts.len()))]
    pub async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<CompleteMultipartUploadResult> {
        let body = complete_body(parts)?;
        let request = ObjectRequest::new(Method::POST, bucket, key)
            .query("uploadId", upload_id)
            .header(header::CONTENT_TYPE, "application/xml")?
            .body(body);
        let response = self.send(request).await?;
        let version_id = response
            .headers()
            .get("x-amz-version-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let text = response.text().await?;

        // The service can report a failed combine inside a 200 response
        if text.contains("<Error>") {
            return Err(ClientError::from_service_xml(&text, 500));
        }

        let output: CompleteMultipartUploadOutput =
            quick_xml::de::from_str(&text).map_err(|e| ClientError::Xml(e.to_string()))?;
        let etag = output
            .etag
            .map(|s| s.trim_matches('"').to_string())
            .ok_or_else(|| ClientError::InvalidResponse("missing ETag".to_string()))?;

        Ok(CompleteMultipartUploadResult {
            location: output.location.unwrap_or_default(),
            etag,
            version_id,
        })
    }

    /// Abort a multipart upload and discard its parts
    #[instrument(skip(self))]
    pub async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()> {
        let request = ObjectRequest::new(Method::DELETE, bucket, key).query("uploadId", upload_id);
        self.send(request).await?;
        Ok(())
    }
}

fn complete_body(parts: &[CompletedPart]) -> Result<String> {
    let document = CompleteMultipartUpload {
        parts: parts
            .iter()
            .map(|p| PartEntry {
                part_number: p.part_number,
                etag: &p.etag,
            })
            .collect(),
    };
    quick_xml::se::to_string(&document).map_err(|e| ClientError::Xml(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_body_lists_parts_in_order() {
        let parts = vec![
            CompletedPart {
                part_number: 1,
                etag: "aaa".to_string(),
                length: 10,
            },
            CompletedPart {
                part_number: 2,
                etag: "bbb".to_string(),
                length: 5,
            },
        ];
        let xml = complete_body(&parts).unwrap();
        assert_eq!(
            xml,
            "<CompleteMultipartUpload>\
             <Part><PartNumber>1</PartNumber><ETag>aaa</ETag></Part>\
             <Part><PartNumber>2</PartNumber><ETag>bbb</ETag></Part>\
             </CompleteMultipartUpload>"
        );
    }

    #[test]
    fn test_parse_initiate_result() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<InitiateMultipartUploadResult xmlns="http://obs.myhwclouds.com/doc/2015-06-30/">
    <Bucket>photos</Bucket>
    <Key>big.bin</Key>
    <UploadId>000001648453845DBB78F2340DD460D8</UploadId>
</InitiateMultipartUploadResult>"#;
        let result: InitiateMultipartUploadResult = quick_xml::de::from_str(xml).unwrap();
        assert_eq!(result.upload_id, "000001648453845DBB78F2340DD460D8");
    }
}
