//! Main client implementation

use crate::{ClientError, Config, Result};
use bytes::Bytes;
use futures::TryStreamExt;
use obs_transfer::{ByteRange, ByteStream, EndpointError, ObjectInfo, ObjectMetadata, PartBody};
use reqwest::{header, Client, Method, Response, StatusCode, Url};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// OBS storage client
#[derive(Clone, Debug)]
pub struct ObsClient {
    config: Config,
    base: Url,
    http: Client,
}

/// One request against an object or bucket
pub(crate) struct ObjectRequest<'a> {
    pub method: Method,
    pub bucket: &'a str,
    pub key: &'a str,
    pub query: Vec<(&'static str, String)>,
    pub headers: header::HeaderMap,
    pub body: Option<Bytes>,
    /// One-shot streamed body; requests carrying one are never re-sent
    pub stream: Option<reqwest::Body>,
}

impl<'a> ObjectRequest<'a> {
    pub fn new(method: Method, bucket: &'a str, key: &'a str) -> Self {
        Self {
            method,
            bucket,
            key,
            query: Vec::new(),
            headers: header::HeaderMap::new(),
            body: None,
            stream: None,
        }
    }

    pub fn query(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.query.push((name, value.into()));
        self
    }

    pub fn header(mut self, name: header::HeaderName, value: &str) -> Result<Self> {
        let value = header::HeaderValue::from_str(value)
            .map_err(|e| ClientError::Config(format!("invalid value for header {}: {}", name, e)))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Stream `body` with its declared length
    pub fn stream_body(mut self, body: PartBody) -> Self {
        self.headers.insert(header::CONTENT_LENGTH, header::HeaderValue::from(body.len()));
        self.stream = Some(reqwest::Body::wrap_stream(body.into_stream()));
        self
    }
}

impl ObsClient {
    /// Create a new client with the given configuration
    pub fn new(config: Config) -> Result<Self> {
        let base = Url::parse(&config.endpoint)
            .map_err(|e| ClientError::Config(format!("invalid endpoint {}: {}", config.endpoint, e)))?;
        if base.host_str().is_none() {
            return Err(ClientError::Config(format!("endpoint {} has no host", config.endpoint)));
        }

        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::USER_AGENT,
            config
                .user_agent
                .parse()
                .map_err(|_| ClientError::Config(format!("invalid user agent: {}", config.user_agent)))?,
        );

        let http = Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()
            .map_err(ClientError::Http)?;

        Ok(Self { config, base, http })
    }

    /// Create with endpoint URL
    pub fn with_endpoint(endpoint: &str) -> Result<Self> {
        Self::new(Config::new(endpoint))
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    // ==================== Object Operations ====================

    /// Head an object (get metadata without content)
    #[instrument(skip(self))]
    pub async fn head_object(&self, bucket: &str, key: &str, version_id: Option<&str>) -> Result<ObjectInfo> {
        let mut request = ObjectRequest::new(Method::HEAD, bucket, key);
        if let Some(version_id) = version_id {
            request = request.query("versionId", version_id);
        }
        let response = self.send(request).await?;
        let headers = response.headers();

        let size = header_str(headers, header::CONTENT_LENGTH.as_str())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ClientError::InvalidResponse("missing Content-Length".to_string()))?;
        let etag = header_str(headers, header::ETAG.as_str())
            .map(|s| s.trim_matches('"').to_string())
            .ok_or_else(|| ClientError::InvalidResponse("missing ETag".to_string()))?;
        let version_id = header_str(headers, "x-amz-version-id").map(str::to_string);
        let last_modified = header_str(headers, header::LAST_MODIFIED.as_str())
            .and_then(|s| chrono::DateTime::parse_from_rfc2822(s).ok())
            .map(|d| d.with_timezone(&chrono::Utc));

        Ok(ObjectInfo {
            size,
            etag,
            version_id,
            last_modified,
        })
    }

    /// Stream one byte range of an object
    #[instrument(skip(self))]
    pub async fn get_object_range(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
        range: ByteRange,
    ) -> Result<ByteStream> {
        let Some(range_header) = range.to_header() else {
            return Ok(Box::pin(futures::stream::empty()));
        };

        let mut request = ObjectRequest::new(Method::GET, bucket, key).header(header::RANGE, &range_header)?;
        if let Some(version_id) = version_id {
            request = request.query("versionId", version_id);
        }
        let response = self.send(request).await?;
        if response.status() != StatusCode::PARTIAL_CONTENT {
            debug!(status = %response.status(), range = %range, "range request answered without 206");
        }

        let stream = response
            .bytes_stream()
            .map_err(|e| EndpointError::Transport(e.to_string()));
        Ok(Box::pin(stream))
    }

    // ==================== Helper Methods ====================

    /// URL of `key` in `bucket`
    pub fn object_url(&self, bucket: &str, key: &str) -> Result<Url> {
        let key_path = encode_key(key);
        let mut url = self.base.clone();
        if self.config.path_style {
            let prefix = self.base.path().trim_end_matches('/');
            url.set_path(&format!("{}/{}/{}", prefix, bucket, key_path));
        } else {
            let host = self
                .base
                .host_str()
                .ok_or_else(|| ClientError::Config("endpoint has no host".to_string()))?;
            url.set_host(Some(&format!("{}.{}", bucket, host)))
                .map_err(|e| ClientError::Config(format!("invalid bucket host {}: {}", bucket, e)))?;
            url.set_path(&format!("/{}", key_path));
        }
        Ok(url)
    }

    /// Send `request`, re-sending it when the connection fails, and turn
    /// non-2xx answers into errors
    pub(crate) async fn send(&self, mut request: ObjectRequest<'_>) -> Result<Response> {
        let url = self.object_url(request.bucket, request.key)?;
        let mut attempt = 0u32;
        let streamed = request.stream.is_some();

        let response = loop {
            let mut req = self
                .http
                .request(request.method.clone(), url.clone())
                .headers(request.headers.clone());
            if !request.query.is_empty() {
                req = req.query(&request.query);
            }
            if let Some(token) = &self.config.access_token {
                req = req.bearer_auth(token);
            }
            if let Some(body) = &request.body {
                req = req.body(body.clone());
            }
            if let Some(stream) = request.stream.take() {
                req = req.body(stream);
            }

            debug!(method = %request.method, url = %url, attempt, "sending request");
            match req.send().await {
                Ok(response) => break response,
                Err(e) if (e.is_connect() || e.is_timeout()) && !streamed && attempt < self.config.max_retries => {
                    attempt += 1;
                    let delay = Duration::from_millis(100 * 2u64.pow(attempt - 1));
                    warn!(url = %url, error = %e, attempt, "request failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        };

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND && request.method == Method::HEAD {
            return Err(ClientError::NotFound {
                bucket: request.bucket.to_string(),
                key: request.key.to_string(),
            });
        }

        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                warn!(status = status.as_u16(), error = %e, "failed to read error response body");
                return Err(ClientError::Http(e));
            }
        };
        let err = ClientError::from_service_xml(&text, status.as_u16());
        match err {
            ClientError::Service { ref code, .. } if code == "NoSuchKey" || code == "NoSuchBucket" => {
                Err(ClientError::NotFound {
                    bucket: request.bucket.to_string(),
                    key: request.key.to_string(),
                })
            }
            err => Err(err),
        }
    }
}

/// Headers carrying object metadata on initiate
pub(crate) fn metadata_headers(metadata: &ObjectMetadata) -> Result<Vec<(header::HeaderName, String)>> {
    let mut headers = Vec::new();
    let standard = [
        (header::CONTENT_TYPE, &metadata.content_type),
        (header::CONTENT_ENCODING, &metadata.content_encoding),
        (header::CACHE_CONTROL, &metadata.cache_control),
        (header::CONTENT_DISPOSITION, &metadata.content_disposition),
    ];
    for (name, value) in standard {
        if let Some(value) = value {
            headers.push((name, value.clone()));
        }
    }
    for (key, value) in &metadata.user_metadata {
        let name = header::HeaderName::from_bytes(format!("x-amz-meta-{}", key.to_ascii_lowercase()).as_bytes())
            .map_err(|e| ClientError::Config(format!("invalid metadata key {}: {}", key, e)))?;
        headers.push((name, value.clone()));
    }
    Ok(headers)
}

fn header_str<'a>(headers: &'a header::HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Percent-encode each segment of `key`, keeping the `/` separators
fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_style_url() {
        let client = ObsClient::new(Config::new("http://localhost:9000")).unwrap();
        let url = client.object_url("photos", "2024/summer beach.jpg").unwrap();
        assert_eq!(url.as_str(), "http://localhost:9000/photos/2024/summer%20beach.jpg");
    }

    #[test]
    fn test_virtual_host_url() {
        let client = ObsClient::new(Config::new("https://obs.example.com").with_virtual_host_style()).unwrap();
        let url = client.object_url("photos", "a+b.txt").unwrap();
        assert_eq!(url.as_str(), "https://photos.obs.example.com/a%2Bb.txt");
    }

    #[test]
    fn test_invalid_endpoint_rejected() {
        assert!(matches!(
            ObsClient::new(Config::new("not a url")),
            Err(ClientError::Config(_))
        ));
    }

    #[test]
    fn test_metadata_headers() {
        let metadata = ObjectMetadata::new()
            .with_content_type("text/plain")
            .with_metadata("Owner", "ops");
        let headers = metadata_headers(&metadata).unwrap();
        assert!(headers.contains(&(header::CONTENT_TYPE, "text/plain".to_string())));
        assert!(headers
            .iter()
            .any(|(name, value)| name.as_str() == "x-amz-meta-owner" && value == "ops"));
    }
}
