//! In-memory storage endpoint for tests and demos

use crate::endpoint::{ByteStream, EndpointResult, PartBody, StorageEndpoint};
use crate::error::EndpointError;
use crate::types::{ByteRange, CompleteMultipartUploadResult, CompletedPart, ObjectInfo, ObjectMetadata};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use dashmap::DashMap;
use futures::stream;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Size of the chunks a ranged read is split into
const READ_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Clone, Debug)]
struct StoredObject {
    data: Bytes,
    etag: String,
    version_id: String,
    metadata: ObjectMetadata,
}

#[derive(Debug)]
struct PendingUpload {
    bucket: String,
    key: String,
    metadata: ObjectMetadata,
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Debug, Default)]
struct Faults {
    /// Part number -> remaining failures, `None` fails forever
    part_failures: HashMap<u32, Option<u32>>,
    /// Range offset -> remaining failures, `None` fails forever
    range_failures: HashMap<u64, Option<u32>>,
    /// Range offsets whose reads come back one byte short
    short_reads: HashMap<u64, Option<u32>>,
    fail_complete: bool,
    /// Extra delay for part uploads that are not failed
    part_delays: HashMap<u32, Duration>,
    /// Extra delay for ranged reads that are not failed
    range_delays: HashMap<u64, Duration>,
}

/// Calls observed by the endpoint
#[derive(Debug, Default, Clone)]
pub struct CallLog {
    pub initiated: usize,
    /// Part numbers in the order upload attempts arrived
    pub upload_parts: Vec<u32>,
    /// Part lists received by complete calls
    pub completes: Vec<Vec<u32>>,
    pub aborts: Vec<String>,
    /// Range offsets in the order read attempts arrived
    pub range_reads: Vec<u64>,
    pub heads: usize,
}

/// An in-memory object store with fault injection and in-flight accounting
#[derive(Clone, Default)]
pub struct MemoryEndpoint {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    objects: DashMap<(String, String), StoredObject>,
    uploads: DashMap<String, PendingUpload>,
    faults: Mutex<Faults>,
    calls: Mutex<CallLog>,
    latency: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    next_id: AtomicU64,
}

impl MemoryEndpoint {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every part upload and ranged read by `latency`
    pub fn set_latency(&self, latency: Duration) {
        *self.inner.latency.lock() = latency;
    }

    /// Store an object directly
    pub fn put_object(&self, bucket: &str, key: &str, data: impl Into<Bytes>) -> String {
        let data = data.into();
        let etag = content_etag(&data);
        let version_id = self.next_id("v");
        self.inner.objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                data,
                etag: etag.clone(),
                version_id,
                metadata: ObjectMetadata::default(),
            },
        );
        etag
    }

    /// Object body, if present
    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.inner
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.data.clone())
    }

    /// Metadata the object was created with
    pub fn object_metadata(&self, bucket: &str, key: &str) -> Option<ObjectMetadata> {
        self.inner
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.metadata.clone())
    }

    /// Multipart sessions neither completed nor aborted
    pub fn pending_uploads(&self) -> Vec<String> {
        self.inner.uploads.iter().map(|e| e.key().clone()).collect()
    }

    /// Fail uploads of `part_number`; `times: None` fails every attempt
    pub fn fail_part(&self, part_number: u32, times: Option<u32>) {
        self.inner.faults.lock().part_failures.insert(part_number, times);
    }

    /// Fail ranged reads starting at `offset`
    pub fn fail_range(&self, offset: u64, times: Option<u32>) {
        self.inner.faults.lock().range_failures.insert(offset, times);
    }

    /// Hold successful uploads of `part_number` for `delay`; failed attempts
    /// still return at once
    pub fn delay_part(&self, part_number: u32, delay: Duration) {
        self.inner.faults.lock().part_delays.insert(part_number, delay);
    }

    /// Hold successful reads starting at `offset` for `delay`
    pub fn delay_range(&self, offset: u64, delay: Duration) {
        self.inner.faults.lock().range_delays.insert(offset, delay);
    }

    /// Return one byte less than asked for reads starting at `offset`
    pub fn short_read(&self, offset: u64, times: Option<u32>) {
        self.inner.faults.lock().short_reads.insert(offset, times);
    }

    /// Make complete calls fail
    pub fn fail_complete(&self, fail: bool) {
        self.inner.faults.lock().fail_complete = fail;
    }

    /// Remove all injected faults
    pub fn clear_faults(&self) {
        *self.inner.faults.lock() = Faults::default();
    }

    /// Calls seen so far
    pub fn calls(&self) -> CallLog {
        self.inner.calls.lock().clone()
    }

    /// Reset the call log and in-flight peak
    pub fn reset_calls(&self) {
        *self.inner.calls.lock() = CallLog::default();
        self.inner.max_in_flight.store(0, Ordering::SeqCst);
    }

    /// Highest number of concurrent part uploads or ranged reads observed
    pub fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{}-{:08}", prefix, self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn enter(&self) -> InFlight<'_> {
        let now = self.inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let latency = *self.inner.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        InFlight(&self.inner.in_flight)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn take_fault<K: std::hash::Hash + Eq>(faults: &mut HashMap<K, Option<u32>>, key: &K) -> bool {
    match faults.get_mut(key) {
        None => false,
        Some(None) => true,
        Some(Some(0)) => false,
        Some(Some(n)) => {
            *n -= 1;
            true
        }
    }
}

fn content_etag(data: &[u8]) -> String {
    blake3::hash(data).to_hex()[..32].to_string()
}

fn injected(status: u16, code: &str) -> EndpointError {
    EndpointError::Service {
        status,
        code: code.to_string(),
        message: "injected fault".to_string(),
        request_id: None,
    }
}

#[async_trait]
impl StorageEndpoint for MemoryEndpoint {
    async fn initiate_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        metadata: &ObjectMetadata,
    ) -> EndpointResult<String> {
        let upload_id = self.next_id("upload");
        self.inner.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                metadata: metadata.clone(),
                parts: BTreeMap::new(),
            },
        );
        self.inner.calls.lock().initiated += 1;
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: PartBody,
    ) -> EndpointResult<String> {
        let _guard = self.enter().await;
        self.inner.calls.lock().upload_parts.push(part_number);

        let delay = {
            let mut faults = self.inner.faults.lock();
            if take_fault(&mut faults.part_failures, &part_number) {
                return Err(injected(503, "ServiceUnavailable"));
            }
            faults.part_delays.get(&part_number).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let data = body.collect().await?;

        let mut upload = self.inner.uploads.get_mut(upload_id).ok_or_else(|| EndpointError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })?;
        let etag = content_etag(&data);
        upload.parts.insert(part_number, (etag.clone(), data));
        Ok(etag)
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> EndpointResult<CompleteMultipartUploadResult> {
        self.inner
            .calls
            .lock()
            .completes
            .push(parts.iter().map(|p| p.part_number).collect());

        if self.inner.faults.lock().fail_complete {
            return Err(injected(500, "InternalError"));
        }
        if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(injected(400, "InvalidPartOrder"));
        }

        let (_, upload) = self.inner.uploads.remove(upload_id).ok_or_else(|| EndpointError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })?;

        let mut body = BytesMut::new();
        for part in parts {
            match upload.parts.get(&part.part_number) {
                Some((etag, data)) if *etag == part.etag => body.extend_from_slice(data),
                _ => {
                    self.inner.uploads.insert(upload_id.to_string(), upload);
                    return Err(injected(400, "InvalidPart"));
                }
            }
        }

        let etag = format!("{}-{}", content_etag(&body), parts.len());
        let version_id = self.next_id("v");
        self.inner.objects.insert(
            (upload.bucket.clone(), upload.key.clone()),
            StoredObject {
                data: body.freeze(),
                etag: etag.clone(),
                version_id: version_id.clone(),
                metadata: upload.metadata,
            },
        );

        Ok(CompleteMultipartUploadResult {
            location: format!("memory://{}/{}", bucket, key),
            etag,
            version_id: Some(version_id),
        })
    }

    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> EndpointResult<()> {
        self.inner.calls.lock().aborts.push(upload_id.to_string());
        self.inner
            .uploads
            .remove(upload_id)
            .map(|_| ())
            .ok_or_else(|| EndpointError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    async fn get_object_range(
        &self,
        bucket: &str,
        key: &str,
        _version_id: Option<&str>,
        range: ByteRange,
    ) -> EndpointResult<ByteStream> {
        let _guard = self.enter().await;
        self.inner.calls.lock().range_reads.push(range.offset);

        let (fail, short, delay) = {
            let mut faults = self.inner.faults.lock();
            let fail = take_fault(&mut faults.range_failures, &range.offset);
            let short = !fail && take_fault(&mut faults.short_reads, &range.offset);
            (fail, short, faults.range_delays.get(&range.offset).copied())
        };
        if fail {
            return Err(injected(503, "ServiceUnavailable"));
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let object = self
            .inner
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.data.clone())
            .ok_or_else(|| EndpointError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })?;

        let start = (range.offset as usize).min(object.len());
        let mut end = ((range.offset + range.length) as usize).min(object.len());
        if short && end > start {
            end -= 1;
        }
        let slice = object.slice(start..end);
        let chunks: Vec<EndpointResult<Bytes>> = (0..slice.len())
            .step_by(READ_CHUNK_SIZE)
            .map(|i| Ok(slice.slice(i..(i + READ_CHUNK_SIZE).min(slice.len()))))
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }

    async fn head_object(&self, bucket: &str, key: &str, _version_id: Option<&str>) -> EndpointResult<ObjectInfo> {
        self.inner.calls.lock().heads += 1;
        self.inner
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| ObjectInfo {
                size: o.data.len() as u64,
                etag: o.etag.clone(),
                version_id: Some(o.version_id.clone()),
                last_modified: Some(Utc::now()),
            })
            .ok_or_else(|| EndpointError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }
}
