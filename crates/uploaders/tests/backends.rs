//! Behavioral tests for the HTTP-based uploader backends against a local
//! in-process endpoint.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use uplift_uploaders::{AzureUploader, HttpUploader, SourceFile, UploadError, Uploader};

/// One captured upload request.
#[derive(Debug, Clone)]
struct CapturedRequest {
    head: String,
    body: Vec<u8>,
}

impl CapturedRequest {
    fn header(&self, name: &str) -> Option<String> {
        let prefix = format!("{}:", name.to_lowercase());
        self.head.lines().find_map(|line| {
            let lower = line.to_lowercase();
            lower
                .strip_prefix(&prefix)
                .map(|_| line[prefix.len()..].trim().to_string())
        })
    }
}

/// Minimal HTTP endpoint: reads one request per connection (content-length
/// or chunked framing), waits `delay`, then answers with `status_line`.
async fn spawn_endpoint(
    delay: Duration,
    status_line: &'static str,
) -> (String, Arc<Mutex<Vec<CapturedRequest>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = format!("http://{}", listener.local_addr().unwrap());
    let captured = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&captured);
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let sink = Arc::clone(&sink);
            tokio::spawn(async move {
                let Some(request) = read_request(&mut socket).await else {
                    return;
                };
                tokio::time::sleep(delay).await;
                sink.lock().unwrap().push(request);
                let response = format!(
                    "HTTP/1.1 {status_line}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (address, captured)
}

async fn read_request(socket: &mut tokio::net::TcpStream) -> Option<CapturedRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut body = buf[header_end..].to_vec();
    let lower = head.to_lowercase();

    if let Some(length) = lower
        .lines()
        .find_map(|l| l.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse::<usize>().ok())
    {
        while body.len() < length {
            let n = socket.read(&mut chunk).await.ok()?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..n]);
        }
        body.truncate(length);
    } else if lower.contains("transfer-encoding: chunked") {
        while find(&body, b"0\r\n\r\n").is_none() {
            let n = socket.read(&mut chunk).await.ok()?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..n]);
        }
        body = dechunk(&body);
    }

    Some(CapturedRequest { head, body })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn dechunk(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut rest = raw;
    while let Some(line_end) = find(rest, b"\r\n") {
        let size = usize::from_str_radix(
            String::from_utf8_lossy(&rest[..line_end]).trim(),
            16,
        )
        .unwrap_or(0);
        if size == 0 {
            break;
        }
        let start = line_end + 2;
        out.extend_from_slice(&rest[start..start + size]);
        rest = &rest[start + size + 2..];
    }
    out
}

fn options(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

async fn source_with_content(name: &str, content: &[u8]) -> (tempfile::TempDir, SourceFile) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(name);
    tokio::fs::write(&path, content).await.unwrap();
    let source = SourceFile::open(&path).await.unwrap();
    (dir, source)
}

fn no_progress() -> uplift_uploaders::ProgressCallback {
    Arc::new(|_| {})
}

#[tokio::test]
async fn http_put_streams_body_and_headers() {
    let (url, captured) = spawn_endpoint(Duration::ZERO, "200 OK").await;
    let uploader = HttpUploader::new(
        &options(&[
            ("https.url", &url),
            ("https.header.X-Upload-Id", "u-1"),
        ]),
        None,
    )
    .unwrap();

    let content = b"twenty bytes of data";
    let (_dir, source) = source_with_content("payload.bin", content).await;

    uploader
        .upload(source, false, no_progress(), CancellationToken::new())
        .await
        .unwrap();

    let requests = captured.lock().unwrap();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert!(request.head.starts_with("PUT /"));
    assert_eq!(
        request.header("content-type").as_deref(),
        Some("application/x-binary")
    );
    assert_eq!(request.header("x-upload-id").as_deref(), Some("u-1"));
    assert_eq!(request.body, content);
}

#[tokio::test]
async fn http_post_when_requested() {
    let (url, captured) = spawn_endpoint(Duration::ZERO, "201 Created").await;
    let uploader = HttpUploader::new(
        &options(&[("https.url", &url), ("https.method", "POST")]),
        None,
    )
    .unwrap();

    let (_dir, source) = source_with_content("payload.bin", b"x").await;
    uploader
        .upload(source, false, no_progress(), CancellationToken::new())
        .await
        .unwrap();

    assert!(captured.lock().unwrap()[0].head.starts_with("POST /"));
}

#[tokio::test]
async fn http_progress_is_cumulative_and_reaches_size() {
    let (url, _captured) = spawn_endpoint(Duration::ZERO, "200 OK").await;
    let uploader = HttpUploader::new(&options(&[("https.url", &url)]), None).unwrap();

    let content = vec![7u8; 20_000];
    let (_dir, source) = source_with_content("payload.bin", &content).await;

    let seen = Arc::new(Mutex::new(Vec::<i64>::new()));
    let sink = Arc::clone(&seen);
    let progress: uplift_uploaders::ProgressCallback =
        Arc::new(move |total| sink.lock().unwrap().push(total));

    uploader
        .upload(source, false, progress, CancellationToken::new())
        .await
        .unwrap();

    let seen = seen.lock().unwrap();
    assert!(!seen.is_empty());
    assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(*seen.last().unwrap(), content.len() as i64);
}

#[tokio::test]
async fn http_checksum_header_is_base64_md5() {
    let (url, captured) = spawn_endpoint(Duration::ZERO, "200 OK").await;
    let uploader = HttpUploader::new(&options(&[("https.url", &url)]), None).unwrap();

    let (_dir, source) = source_with_content("payload.bin", b"hello world").await;
    uploader
        .upload(source, true, no_progress(), CancellationToken::new())
        .await
        .unwrap();

    let requests = captured.lock().unwrap();
    assert_eq!(
        requests[0].header("content-md5").as_deref(),
        Some("XrY7u+Ae7tCTyyK7j1rNww==")
    );
    // The body is re-read in full after the checksum pass.
    assert_eq!(requests[0].body, b"hello world");
}

#[tokio::test]
async fn http_non_2xx_fails() {
    let (url, _captured) = spawn_endpoint(Duration::ZERO, "404 Not Found").await;
    let uploader = HttpUploader::new(&options(&[("https.url", &url)]), None).unwrap();

    let (_dir, source) = source_with_content("payload.bin", b"x").await;
    let err = uploader
        .upload(source, false, no_progress(), CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        UploadError::Status { code, .. } => assert_eq!(code, 404),
        other => panic!("expected status error, got {other}"),
    }
}

#[tokio::test]
async fn http_cancel_aborts_transfer() {
    let (url, _captured) = spawn_endpoint(Duration::from_secs(5), "200 OK").await;
    let uploader = HttpUploader::new(&options(&[("https.url", &url)]), None).unwrap();

    let (_dir, source) = source_with_content("payload.bin", b"x").await;
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
    });

    let started = std::time::Instant::now();
    let err = uploader
        .upload(source, false, no_progress(), cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::Canceled));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn azure_blob_target_and_checksum() {
    let (url, captured) = spawn_endpoint(Duration::ZERO, "201 Created").await;
    let uploader = AzureUploader::new(&options(&[
        ("azure.storage.endpoint", &format!("{url}/")),
        ("azure.shared.access.signature", "sig=test"),
        ("azure.blob.container", "device-logs"),
    ]))
    .unwrap();

    // 11 bytes, checksum enabled.
    let (_dir, source) = source_with_content("metrics.txt", b"hello world").await;
    uploader
        .upload(source, true, no_progress(), CancellationToken::new())
        .await
        .unwrap();

    let requests = captured.lock().unwrap();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert!(
        request.head.starts_with("PUT /device-logs/metrics.txt?sig=test"),
        "unexpected request line: {}",
        request.head.lines().next().unwrap_or_default()
    );
    assert_eq!(request.header("x-ms-blob-type").as_deref(), Some("BlockBlob"));
    assert_eq!(
        request.header("x-ms-blob-content-md5").as_deref(),
        Some("XrY7u+Ae7tCTyyK7j1rNww==")
    );
    assert_eq!(request.body, b"hello world");
}

#[tokio::test]
async fn azure_non_2xx_fails() {
    let (url, _captured) = spawn_endpoint(Duration::ZERO, "403 Forbidden").await;
    let uploader = AzureUploader::new(&options(&[
        ("azure.storage.endpoint", &format!("{url}/")),
        ("azure.shared.access.signature", "sig=test"),
        ("azure.blob.container", "c"),
    ]))
    .unwrap();

    let (_dir, source) = source_with_content("metrics.txt", b"x").await;
    let err = uploader
        .upload(source, false, no_progress(), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::Status { code: 403, .. }));
}
