//! Resumable downloads against a mock server that honors (or ignores) `Range`.

use depot::digest::sha256_bytes;
use depot::transfer::{partial_path, Transfer};
use depot::DepotError;
use reqwest::blocking::Client;
use reqwest::header::HeaderMap;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Serves `body`, answering `Range: bytes=N-` with a 206 (or 416 past the end)
/// unless told to ignore ranges
struct RangeResponder {
    body: Vec<u8>,
    honor_range: bool,
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let offset = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("bytes="))
            .and_then(|v| v.trim_end_matches('-').parse::<usize>().ok());

        match offset {
            Some(offset) if self.honor_range && offset < self.body.len() => ResponseTemplate::new(206)
                .insert_header(
                    "content-range",
                    format!("bytes {offset}-{}/{}", self.body.len() - 1, self.body.len()).as_str(),
                )
                .set_body_bytes(self.body[offset..].to_vec()),
            Some(_) if self.honor_range => ResponseTemplate::new(416)
                .insert_header("content-range", format!("bytes */{}", self.body.len()).as_str()),
            _ => ResponseTemplate::new(200).set_body_bytes(self.body.clone()),
        }
    }
}

fn body() -> Vec<u8> {
    (0..200_000u32).map(|i| (i % 251) as u8).collect()
}

fn transfer() -> Transfer {
    Transfer::new(Client::new(), Duration::from_millis(100))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resume_matches_full_download() {
    let server = MockServer::start().await;
    let content = body();
    Mock::given(method("GET"))
        .and(path("/blob"))
        .respond_with(RangeResponder {
            body: content.clone(),
            honor_range: true,
        })
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let resumed = dir.path().join("resumed.bin");
    let full = dir.path().join("full.bin");
    fs::write(partial_path(&resumed), &content[..70_000]).unwrap();

    let url = format!("{}/blob", server.uri());
    let digest = sha256_bytes(&content);
    let (resumed_bytes, full_bytes) = tokio::task::spawn_blocking({
        let (resumed, full) = (resumed.clone(), full.clone());
        move || {
            let t = transfer();
            let a = t
                .fetch_verified(&url, &HeaderMap::new(), &resumed, false, Some(&digest))
                .unwrap();
            let b = t.fetch(&url, &HeaderMap::new(), &full, false).unwrap();
            (a, b)
        }
    })
    .await
    .unwrap();

    assert_eq!(resumed_bytes, content.len() as u64);
    assert_eq!(full_bytes, content.len() as u64);
    assert_eq!(fs::read(&resumed).unwrap(), fs::read(&full).unwrap());
    assert!(!partial_path(&resumed).exists());

    let requests = server.received_requests().await.unwrap();
    assert_eq!(range_headers(&requests), [Some("bytes=70000-".to_string()), None]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ignored_range_restarts_from_zero() {
    let server = MockServer::start().await;
    let content = body();
    Mock::given(method("GET"))
        .and(path("/blob"))
        .respond_with(RangeResponder {
            body: content.clone(),
            honor_range: false,
        })
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("model.gguf");
    fs::write(partial_path(&dest), b"stale bytes from another file").unwrap();

    let url = format!("{}/blob", server.uri());
    let digest = sha256_bytes(&content);
    let target = dest.clone();
    tokio::task::spawn_blocking(move || {
        transfer()
            .fetch_verified(&url, &HeaderMap::new(), &target, false, Some(&digest))
            .unwrap()
    })
    .await
    .unwrap();

    assert_eq!(fs::read(&dest).unwrap(), content);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mismatch_discards_partial() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/blob"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"corrupted".to_vec()))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("model.gguf");
    let url = format!("{}/blob", server.uri());
    let target = dest.clone();
    let err = tokio::task::spawn_blocking(move || {
        transfer()
            .fetch_verified(&url, &HeaderMap::new(), &target, false, Some(&sha256_bytes(b"expected")))
            .unwrap_err()
    })
    .await
    .unwrap();

    assert!(matches!(err, DepotError::DigestMismatch { .. }));
    assert!(!dest.exists());
    assert!(!partial_path(&dest).exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_http_error_is_reported_with_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/blob"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("model.gguf");
    let url = format!("{}/blob", server.uri());
    let err = tokio::task::spawn_blocking(move || {
        transfer().fetch(&url, &HeaderMap::new(), &dest, false).unwrap_err()
    })
    .await
    .unwrap();

    assert_eq!(err.http_status(), Some(503));
    assert!(!err.is_not_found());
}

fn range_headers(requests: &[Request]) -> Vec<Option<String>> {
    requests
        .iter()
        .map(|r| r.headers.get("range").and_then(|v| v.to_str().ok()).map(str::to_string))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_complete_partial_is_promoted_after_416() {
    let server = MockServer::start().await;
    let content = body();
    Mock::given(method("GET"))
        .and(path("/blob"))
        .respond_with(RangeResponder {
            body: content.clone(),
            honor_range: true,
        })
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("model.gguf");
    fs::write(partial_path(&dest), &content).unwrap();

    let url = format!("{}/blob", server.uri());
    let digest = sha256_bytes(&content);
    let target = dest.clone();
    let written = tokio::task::spawn_blocking(move || {
        transfer()
            .fetch_verified(&url, &HeaderMap::new(), &target, false, Some(&digest))
            .unwrap()
    })
    .await
    .unwrap();

    assert_eq!(written, content.len() as u64);
    assert_eq!(fs::read(&dest).unwrap(), content);
    assert!(!partial_path(&dest).exists());
    let requests = server.received_requests().await.unwrap();
    assert_eq!(range_headers(&requests), [Some("bytes=200000-".to_string())]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unverifiable_partial_restarts_after_416() {
    let server = MockServer::start().await;
    let content = body();
    Mock::given(method("GET"))
        .and(path("/blob"))
        .respond_with(RangeResponder {
            body: content.clone(),
            honor_range: true,
        })
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let with_digest = dir.path().join("a.gguf");
    let without_digest = dir.path().join("b.gguf");
    // Longer than the file: no range can be satisfied
    let junk = vec![7u8; content.len() + 10];
    fs::write(partial_path(&with_digest), &junk).unwrap();
    fs::write(partial_path(&without_digest), &junk).unwrap();

    let url = format!("{}/blob", server.uri());
    let digest = sha256_bytes(&content);
    let (a, b) = (with_digest.clone(), without_digest.clone());
    tokio::task::spawn_blocking(move || {
        let t = transfer();
        t.fetch_verified(&url, &HeaderMap::new(), &a, false, Some(&digest)).unwrap();
        t.fetch(&url, &HeaderMap::new(), &b, false).unwrap();
    })
    .await
    .unwrap();

    assert_eq!(fs::read(&with_digest).unwrap(), content);
    assert_eq!(fs::read(&without_digest).unwrap(), content);
    let requests = server.received_requests().await.unwrap();
    let restart = Some(format!("bytes={}-", junk.len()));
    assert_eq!(range_headers(&requests), [restart.clone(), None, restart, None]);
}
