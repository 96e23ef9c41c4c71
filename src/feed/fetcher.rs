use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use reqwest::header;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::storage::Feed;

const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB

const ACCEPT_FEEDS: &str =
    "application/rss+xml, application/atom+xml, application/xml, text/xml, */*;q=0.8";

/// Errors inside a single fetch attempt. These never escape the fetcher:
/// they are folded into [`FetchOutcome::Failed`] so the reconciler sees a
/// uniform transport-exception shape.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// Request exceeded the configured timeout
    #[error("Request timed out")]
    Timeout,
    /// Response body exceeded the 10MB size limit
    #[error("Response too large")]
    ResponseTooLarge,
}

/// Result of one conditional feed fetch.
#[derive(Debug)]
pub enum FetchOutcome {
    /// 304 — the cached etag/last-modified still holds.
    NotModified,
    /// Non-2xx, non-304 status.
    HttpError(u16),
    /// Transport exception: timeout, connection failure, oversized body.
    Failed(String),
    /// 200 with a body and fresh validator headers.
    Fetched {
        body: Vec<u8>,
        etag: Option<String>,
        last_modified: Option<String>,
    },
}

impl FetchOutcome {
    /// Whether this outcome counts against the feed's failure streak.
    pub fn is_error(&self) -> bool {
        matches!(self, FetchOutcome::HttpError(_) | FetchOutcome::Failed(_))
    }
}

/// Per-host concurrency gate.
///
/// The sweep's global in-flight bound comes from `buffer_unordered`; this
/// gate adds the second bound: at most `per_host` simultaneous requests
/// to any single remote host, so a sweep over many feeds on one server
/// does not hammer it. Hosts map to semaphores lazily.
#[derive(Debug)]
pub struct HostGate {
    per_host: usize,
    hosts: DashMap<String, Arc<Semaphore>>,
}

impl HostGate {
    pub fn new(per_host: usize) -> Self {
        Self {
            per_host: per_host.max(1),
            hosts: DashMap::new(),
        }
    }

    /// Wait for a slot on the URL's host. The permit is held for the
    /// duration of the request (including the body read) and released on
    /// drop.
    pub async fn acquire(&self, url: &str) -> OwnedSemaphorePermit {
        let host = host_of(url);
        // Clone the Arc to release the DashMap shard lock before awaiting
        let semaphore = self
            .hosts
            .entry(host)
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host)))
            .clone();
        semaphore
            .acquire_owned()
            .await
            .expect("host gate semaphore is never closed")
    }
}

/// Extracts the host from a URL, lowercased.
///
/// Malformed URLs map to "unknown" so they still share one gate slot
/// rather than bypassing the limit.
fn host_of(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Fetch one feed conditionally.
///
/// Sends `If-None-Match`/`If-Modified-Since` when the feed row carries
/// cached validators. The whole request — connect through body read — is
/// bounded by `timeout`; exceeding it is a transport exception like any
/// other. This function never fails: every error shape becomes a
/// [`FetchOutcome`] variant for the reconciler to act on.
pub async fn fetch_feed(
    client: &reqwest::Client,
    gate: &HostGate,
    feed: &Feed,
    timeout: Duration,
) -> FetchOutcome {
    let _permit = gate.acquire(&feed.url).await;

    match tokio::time::timeout(timeout, do_fetch(client, feed)).await {
        Err(_) => FetchOutcome::Failed(FetchError::Timeout.to_string()),
        Ok(Err(e)) => FetchOutcome::Failed(e.to_string()),
        Ok(Ok(outcome)) => outcome,
    }
}

async fn do_fetch(client: &reqwest::Client, feed: &Feed) -> Result<FetchOutcome, FetchError> {
    let mut request = client.get(&feed.url).header(header::ACCEPT, ACCEPT_FEEDS);
    if let Some(etag) = &feed.etag {
        request = request.header(header::IF_NONE_MATCH, etag);
    }
    if let Some(last_modified) = &feed.last_modified {
        request = request.header(header::IF_MODIFIED_SINCE, last_modified);
    }

    let response = request.send().await?;

    if response.status() == reqwest::StatusCode::NOT_MODIFIED {
        return Ok(FetchOutcome::NotModified);
    }
    if !response.status().is_success() {
        return Ok(FetchOutcome::HttpError(response.status().as_u16()));
    }

    let etag = header_value(&response, header::ETAG);
    let last_modified = header_value(&response, header::LAST_MODIFIED);
    let body = read_limited_bytes(response, MAX_FEED_SIZE).await?;

    Ok(FetchOutcome::Fetched {
        body,
        etag,
        last_modified,
    })
}

fn header_value(response: &reqwest::Response, name: header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    // Fast path: reject on Content-Length before streaming
    if let Some(len) = response.content_length() {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const VALID_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <title>Test</title>
    <item><guid>1</guid><title>Hello</title></item>
</channel></rss>"#;

    async fn feed_for(url: &str) -> Feed {
        let db = Database::open(":memory:").await.unwrap();
        let id = db.insert_feed(url, None).await.unwrap();
        db.get_feed(id).await.unwrap()
    }

    fn timeout() -> Duration {
        Duration::from_secs(5)
    }

    #[tokio::test]
    async fn test_fetch_ok_captures_validators() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(VALID_RSS)
                    .insert_header("ETag", "\"v1\"")
                    .insert_header("Last-Modified", "Mon, 06 Jan 2025 10:00:00 GMT"),
            )
            .mount(&server)
            .await;

        let feed = feed_for(&format!("{}/feed", server.uri())).await;
        let client = reqwest::Client::new();
        let gate = HostGate::new(4);

        match fetch_feed(&client, &gate, &feed, timeout()).await {
            FetchOutcome::Fetched {
                body,
                etag,
                last_modified,
            } => {
                assert!(!body.is_empty());
                assert_eq!(etag.as_deref(), Some("\"v1\""));
                assert_eq!(
                    last_modified.as_deref(),
                    Some("Mon, 06 Jan 2025 10:00:00 GMT")
                );
            }
            other => panic!("Expected Fetched, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_sends_conditional_headers_and_maps_304() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("If-None-Match", "\"v1\""))
            .and(header("If-Modified-Since", "Mon, 06 Jan 2025 10:00:00 GMT"))
            .respond_with(ResponseTemplate::new(304))
            .expect(1)
            .mount(&server)
            .await;

        let mut feed = feed_for(&format!("{}/feed", server.uri())).await;
        feed.etag = Some("\"v1\"".to_string());
        feed.last_modified = Some("Mon, 06 Jan 2025 10:00:00 GMT".to_string());

        let client = reqwest::Client::new();
        let gate = HostGate::new(4);
        let outcome = fetch_feed(&client, &gate, &feed, timeout()).await;
        assert!(matches!(outcome, FetchOutcome::NotModified));
    }

    #[tokio::test]
    async fn test_fetch_maps_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let feed = feed_for(&format!("{}/feed", server.uri())).await;
        let client = reqwest::Client::new();
        let gate = HostGate::new(4);

        match fetch_feed(&client, &gate, &feed, timeout()).await {
            FetchOutcome::HttpError(500) => {}
            other => panic!("Expected HttpError(500), got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_timeout_is_transport_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(VALID_RSS)
                    .set_delay(Duration::from_secs(10)),
            )
            .mount(&server)
            .await;

        let feed = feed_for(&format!("{}/feed", server.uri())).await;
        let client = reqwest::Client::new();
        let gate = HostGate::new(4);

        let outcome = fetch_feed(&client, &gate, &feed, Duration::from_millis(200)).await;
        match outcome {
            FetchOutcome::Failed(msg) => assert!(msg.contains("timed out"), "got: {msg}"),
            other => panic!("Expected Failed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_connection_refused_is_transport_failure() {
        // Port 1 is essentially never listening
        let feed = feed_for("http://127.0.0.1:1/feed").await;
        let client = reqwest::Client::new();
        let gate = HostGate::new(4);

        let outcome = fetch_feed(&client, &gate, &feed, timeout()).await;
        assert!(matches!(outcome, FetchOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_oversized_body_is_transport_failure() {
        let server = MockServer::start().await;
        let big = "x".repeat(MAX_FEED_SIZE + 1);
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(big))
            .mount(&server)
            .await;

        let feed = feed_for(&format!("{}/feed", server.uri())).await;
        let client = reqwest::Client::new();
        let gate = HostGate::new(4);

        let outcome = fetch_feed(&client, &gate, &feed, Duration::from_secs(30)).await;
        match outcome {
            FetchOutcome::Failed(msg) => assert!(msg.contains("too large"), "got: {msg}"),
            other => panic!("Expected Failed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_host_gate_bounds_per_host_concurrency() {
        let gate = Arc::new(HostGate::new(2));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..10 {
            let gate = gate.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _permit = gate
                    .acquire(&format!("https://shared.example.com/feed/{i}"))
                    .await;
                let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(current, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(
            peak.load(Ordering::SeqCst) <= 2,
            "at no instant may more than 2 requests to one host be in flight, saw {}",
            peak.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn test_host_gate_hosts_are_independent() {
        let gate = Arc::new(HostGate::new(1));

        // Holding the only permit for one host must not block another host
        let _held = gate.acquire("https://a.example.com/feed").await;
        let other = tokio::time::timeout(
            Duration::from_millis(100),
            gate.acquire("https://b.example.com/feed"),
        )
        .await;
        assert!(other.is_ok(), "different hosts have independent gates");
    }

    #[test]
    fn test_host_of_normalizes() {
        assert_eq!(host_of("https://Example.COM/feed"), "example.com");
        assert_eq!(host_of("https://example.com:8080/feed"), "example.com");
        assert_eq!(host_of("not a url"), "unknown");
    }
}
