//! Resumable transfers through the HTTP client against a local fake OBS
//! server
//!
//! Run with: cargo test --test http_transfer

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use obs_client::{Config, ObsClient};
use obs_transfer::{
    download_file, upload_file, DownloadFileRequest, FailurePolicy, ResumableOptions, RetryPolicy, TransferError,
    UploadFileRequest, MIN_PART_SIZE,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(Default)]
struct FakeObs {
    objects: Mutex<HashMap<String, (Bytes, String)>>,
    uploads: Mutex<HashMap<String, BTreeMap<u32, (Bytes, String)>>>,
    failing_part: Mutex<Option<u32>>,
    part_puts: Mutex<Vec<u32>>,
    next_id: AtomicU64,
}

fn etag_of(data: &[u8]) -> String {
    blake3::hash(data).to_hex()[..32].to_string()
}

fn service_error(status: StatusCode, code: &str) -> Response {
    (
        status,
        format!("<Error><Code>{}</Code><Message>{}</Message></Error>", code, code),
    )
        .into_response()
}

/// Pull `(part number, etag)` pairs out of a CompleteMultipartUpload body
fn listed_parts(body: &str) -> Vec<(u32, String)> {
    body.split("<Part>")
        .skip(1)
        .filter_map(|part| {
            let number = part.split("<PartNumber>").nth(1)?.split("</PartNumber>").next()?;
            let etag = part.split("<ETag>").nth(1)?.split("</ETag>").next()?;
            Some((number.parse().ok()?, etag.trim_matches('"').to_string()))
        })
        .collect()
}

async fn handle(
    State(obs): State<Arc<FakeObs>>,
    method: Method,
    Path((bucket, key)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let name = format!("{}/{}", bucket, key);

    if method == Method::POST && query.contains_key("uploads") {
        let upload_id = format!("upload-{}", obs.next_id.fetch_add(1, Ordering::SeqCst));
        obs.uploads.lock().insert(upload_id.clone(), BTreeMap::new());
        return format!(
            "<InitiateMultipartUploadResult><Bucket>{}</Bucket><Key>{}</Key><UploadId>{}</UploadId></InitiateMultipartUploadResult>",
            bucket, key, upload_id
        )
        .into_response();
    }

    if let Some(upload_id) = query.get("uploadId") {
        let mut uploads = obs.uploads.lock();
        let Some(parts) = uploads.get_mut(upload_id) else {
            return service_error(StatusCode::NOT_FOUND, "NoSuchUpload");
        };

        if method == Method::PUT {
            let part_number: u32 = query.get("partNumber").and_then(|n| n.parse().ok()).unwrap_or(0);
            obs.part_puts.lock().push(part_number);
            if *obs.failing_part.lock() == Some(part_number) {
                return service_error(StatusCode::INTERNAL_SERVER_ERROR, "InternalError");
            }
            let etag = etag_of(&body);
            parts.insert(part_number, (body, etag.clone()));
            return (StatusCode::OK, [(header::ETAG, format!("\"{}\"", etag))]).into_response();
        }

        if method == Method::POST {
            let listed = listed_parts(&String::from_utf8_lossy(&body));
            let mut data = Vec::new();
            for (number, etag) in &listed {
                match parts.get(number) {
                    Some((bytes, stored)) if stored == etag => data.extend_from_slice(bytes),
                    _ => return service_error(StatusCode::BAD_REQUEST, "InvalidPart"),
                }
            }
            uploads.remove(upload_id);
            let etag = format!("{}-{}", etag_of(&data), listed.len());
            obs.objects.lock().insert(name.clone(), (Bytes::from(data), etag.clone()));
            return format!(
                "<CompleteMultipartUploadResult><Location>/{}</Location><ETag>\"{}\"</ETag></CompleteMultipartUploadResult>",
                name, etag
            )
            .into_response();
        }

        if method == Method::DELETE {
            uploads.remove(upload_id);
            return StatusCode::NO_CONTENT.into_response();
        }
    }

    let Some((data, etag)) = obs.objects.lock().get(&name).cloned() else {
        return if method == Method::HEAD {
            StatusCode::NOT_FOUND.into_response()
        } else {
            service_error(StatusCode::NOT_FOUND, "NoSuchKey")
        };
    };

    if method == Method::HEAD {
        return (
            StatusCode::OK,
            [
                (header::CONTENT_LENGTH, data.len().to_string()),
                (header::ETAG, format!("\"{}\"", etag)),
            ],
        )
            .into_response();
    }

    if method == Method::GET {
        let range = headers
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("bytes="))
            .and_then(|v| v.split_once('-'))
            .and_then(|(a, b)| Some((a.parse::<usize>().ok()?, b.parse::<usize>().ok()?)));
        return match range {
            Some((start, end)) if start <= end && end < data.len() => (
                StatusCode::PARTIAL_CONTENT,
                [(header::ETAG, format!("\"{}\"", etag))],
                data.slice(start..=end),
            )
                .into_response(),
            Some(_) => service_error(StatusCode::RANGE_NOT_SATISFIABLE, "InvalidRange"),
            None => (StatusCode::OK, data).into_response(),
        };
    }

    service_error(StatusCode::METHOD_NOT_ALLOWED, "MethodNotAllowed")
}

async fn spawn_server() -> (String, Arc<FakeObs>) {
    let obs = Arc::new(FakeObs::default());
    let app = Router::new()
        .route("/{bucket}/{*key}", any(handle))
        .with_state(Arc::clone(&obs));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}", addr), obs)
}

#[tokio::test]
async fn test_upload_resume_and_download_over_http() {
    let (base_url, obs) = spawn_server().await;
    let client = Arc::new(ObsClient::new(Config::new(&base_url).with_token("t")).unwrap());

    let dir = tempfile::tempdir().unwrap();
    let data: Vec<u8> = (0..MIN_PART_SIZE * 3 + 500).map(|i| (i % 199) as u8).collect();
    let source = dir.path().join("archive.tar");
    std::fs::write(&source, &data).unwrap();

    *obs.failing_part.lock() = Some(2);
    let request = UploadFileRequest::new("vault", "2024/archive.tar", &source).with_options(
        ResumableOptions::default()
            .with_part_size(MIN_PART_SIZE)
            .with_task_num(2)
            .with_checkpoint(None)
            .with_retry(RetryPolicy::none())
            .with_failure_policy(FailurePolicy::ContinueOnError),
    );

    let err = upload_file(Arc::clone(&client), request.clone()).await.unwrap_err();
    assert_eq!(err.failed_parts(), vec![2]);
    assert!(err.is_resumable());
    assert_eq!(obs.uploads.lock().len(), 1);

    *obs.failing_part.lock() = None;
    obs.part_puts.lock().clear();
    let result = upload_file(Arc::clone(&client), request).await.unwrap();
    assert_eq!(*obs.part_puts.lock(), vec![2]);
    assert!(result.etag.ends_with("-4"));
    assert!(obs.uploads.lock().is_empty());

    let target = dir.path().join("restore").join("archive.tar");
    let downloaded = download_file(
        Arc::clone(&client),
        DownloadFileRequest::new("vault", "2024/archive.tar", &target).with_options(
            ResumableOptions::default()
                .with_part_size(MIN_PART_SIZE)
                .with_task_num(3),
        ),
    )
    .await
    .unwrap();
    assert_eq!(downloaded.etag, result.etag);
    assert_eq!(std::fs::read(&target).unwrap(), data);
}

#[tokio::test]
async fn test_failed_upload_without_checkpoint_aborts_session_over_http() {
    let (base_url, obs) = spawn_server().await;
    let client = Arc::new(ObsClient::new(Config::new(&base_url)).unwrap());

    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("small.bin");
    std::fs::write(&source, vec![5u8; MIN_PART_SIZE as usize * 2]).unwrap();

    *obs.failing_part.lock() = Some(1);
    let request = UploadFileRequest::new("vault", "small.bin", &source).with_options(
        ResumableOptions::default()
            .with_part_size(MIN_PART_SIZE)
            .with_retry(RetryPolicy::attempts(2)),
    );

    let err = upload_file(client, request).await.unwrap_err();
    assert!(matches!(
        err,
        TransferError::PartTransfer {
            checkpoint_retained: false,
            ..
        }
    ));
    assert_eq!(*obs.part_puts.lock(), vec![1, 1]);
    assert!(obs.uploads.lock().is_empty());
    assert!(obs.objects.lock().is_empty());
}

#[tokio::test]
async fn test_download_of_missing_object_over_http() {
    let (base_url, _obs) = spawn_server().await;
    let client = Arc::new(ObsClient::new(Config::new(&base_url)).unwrap());
    let dir = tempfile::tempdir().unwrap();

    let err = download_file(client, DownloadFileRequest::new("vault", "nope", dir.path().join("nope")))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TransferError::Endpoint(obs_transfer::EndpointError::NotFound { .. })
    ));
}
