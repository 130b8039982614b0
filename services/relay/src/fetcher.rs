//! Snapshot download from camera endpoints.
//!
//! The fetcher performs a single GET per call and converts every outcome into
//! either image bytes or a classified [`FetchError`]. It never touches device
//! state; the scheduler applies the result.

use crate::config::HttpConfig;
use crate::device::{AuthScheme, Device, FailureKind};
use crate::digest::DigestChallenge;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Client, Response, StatusCode, Url};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

/// Classified snapshot download failure.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Request failed: {0}")]
    Network(String),

    #[error("Camera returned server error {status}")]
    Server { status: u16 },

    #[error("Camera rejected request with status {status}")]
    Client { status: u16 },

    #[error("Unexpected content type: {}", .0.as_deref().unwrap_or("<missing>"))]
    ContentType(Option<String>),

    #[error("Image exceeds {limit} bytes")]
    TooLarge { limit: usize },
}

impl FetchError {
    pub fn kind(&self) -> FailureKind {
        match self {
            FetchError::Network(_) => FailureKind::Network,
            FetchError::Server { .. } => FailureKind::Server,
            FetchError::Client { .. } => FailureKind::Client,
            FetchError::ContentType(_) | FetchError::TooLarge { .. } => FailureKind::ContentType,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        // reqwest errors may echo the request URL
        FetchError::Network(e.without_url().to_string())
    }
}

/// Source of camera snapshots.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, device: &Device) -> Result<Bytes, FetchError>;
}

/// Snapshot fetcher backed by one shared reqwest client.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
    max_image_bytes: usize,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, max_image_bytes: usize) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            max_image_bytes,
        })
    }

    pub fn from_config(config: &HttpConfig) -> Result<Self, reqwest::Error> {
        Self::new(config.timeout(), config.max_image_bytes)
    }

    /// Retry once with an `Authorization` header if the camera sent a digest
    /// challenge. Any other response is returned untouched.
    async fn answer_digest_challenge(
        &self,
        device: &Device,
        response: Response,
        username: &str,
        password: &str,
    ) -> Result<Response, FetchError> {
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let Some(challenge) = find_digest_challenge(response.headers()) else {
            return Ok(response);
        };

        let uri = request_uri(device.endpoint());
        let authorization = challenge.authorization("GET", &uri, username, password);

        debug!(device_id = %device.id(), realm = %challenge.realm, "Answering digest challenge");

        let response = self
            .client
            .get(device.endpoint().clone())
            .header(AUTHORIZATION, authorization)
            .send()
            .await?;

        Ok(response)
    }
}

#[async_trait]
impl ImageFetcher for HttpFetcher {
    #[instrument(skip(self, device), fields(device_id = %device.id()))]
    async fn fetch(&self, device: &Device) -> Result<Bytes, FetchError> {
        debug!(
            endpoint = %device.endpoint_redacted(),
            model = %device.model().as_str(),
            "Downloading snapshot"
        );

        let mut response = self.client.get(device.endpoint().clone()).send().await?;

        if let AuthScheme::DigestAuth(creds) = device.auth() {
            response = self
                .answer_digest_challenge(device, response, &creds.username, &creds.password)
                .await?;
        }

        classify_response(response.status(), response.headers().get(CONTENT_TYPE))?;

        read_body(response, self.max_image_bytes).await
    }
}

/// Map status and content type to an outcome. Cameras often append
/// parameters (`image/jpeg; charset=...`), so only a substring match is used.
pub fn classify_response(
    status: StatusCode,
    content_type: Option<&HeaderValue>,
) -> Result<(), FetchError> {
    // Anything from 500 up, including non-standard 6xx-9xx codes
    if status.as_u16() >= 500 {
        return Err(FetchError::Server {
            status: status.as_u16(),
        });
    }
    if status.as_u16() >= 400 {
        return Err(FetchError::Client {
            status: status.as_u16(),
        });
    }

    match content_type.map(|v| v.to_str()) {
        Some(Ok(value)) if value.to_ascii_lowercase().contains("image") => Ok(()),
        Some(Ok(value)) => Err(FetchError::ContentType(Some(value.to_string()))),
        Some(Err(_)) | None => Err(FetchError::ContentType(None)),
    }
}

fn find_digest_challenge(headers: &HeaderMap) -> Option<DigestChallenge> {
    headers
        .get_all(WWW_AUTHENTICATE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(DigestChallenge::parse)
}

fn request_uri(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

async fn read_body(mut response: Response, limit: usize) -> Result<Bytes, FetchError> {
    if let Some(length) = response.content_length() {
        if length > limit as u64 {
            return Err(FetchError::TooLarge { limit });
        }
    }

    let mut body = BytesMut::new();
    while let Some(chunk) = response.chunk().await? {
        if body.len() + chunk.len() > limit {
            return Err(FetchError::TooLarge { limit });
        }
        body.extend_from_slice(&chunk);
    }

    Ok(body.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Credentials;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve the canned responses in order, one per connection, and record
    /// the raw request heads.
    async fn serve(responses: Vec<String>) -> (SocketAddr, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();

        tokio::spawn(async move {
            for response in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut chunk).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }
                seen.lock().unwrap().push(String::from_utf8_lossy(&buf).to_string());
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.ok();
            }
        });

        (addr, requests)
    }

    fn response(status: &str, content_type: Option<&str>, body: &str) -> String {
        let mut out = format!("HTTP/1.1 {}\r\n", status);
        if let Some(ct) = content_type {
            out.push_str(&format!("Content-Type: {}\r\n", ct));
        }
        out.push_str(&format!(
            "Content-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        ));
        out
    }

    fn device_at(addr: SocketAddr) -> Device {
        Device::new("cam-1", &addr.to_string(), "generic", Bytes::new(), 3, None).unwrap()
    }

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(Duration::from_secs(5), 1024).unwrap()
    }

    #[test]
    fn test_classify_statuses() {
        let jpeg = HeaderValue::from_static("image/jpeg");

        assert!(classify_response(StatusCode::OK, Some(&jpeg)).is_ok());
        assert!(classify_response(StatusCode::FOUND, Some(&jpeg)).is_ok());
        assert_eq!(
            classify_response(StatusCode::NOT_FOUND, Some(&jpeg))
                .unwrap_err()
                .kind(),
            FailureKind::Client
        );
        assert_eq!(
            classify_response(StatusCode::BAD_GATEWAY, Some(&jpeg))
                .unwrap_err()
                .kind(),
            FailureKind::Server
        );
        assert_eq!(
            classify_response(StatusCode::from_u16(600).unwrap(), Some(&jpeg))
                .unwrap_err()
                .kind(),
            FailureKind::Server
        );
        assert_eq!(
            classify_response(StatusCode::from_u16(999).unwrap(), Some(&jpeg))
                .unwrap_err()
                .kind(),
            FailureKind::Server
        );
    }

    #[test]
    fn test_classify_content_type() {
        let upper = HeaderValue::from_static("IMAGE/JPEG; charset=binary");
        let html = HeaderValue::from_static("text/html");
        let garbage = HeaderValue::from_bytes(b"image/\xff").unwrap();

        assert!(classify_response(StatusCode::OK, Some(&upper)).is_ok());
        assert!(matches!(
            classify_response(StatusCode::OK, Some(&html)),
            Err(FetchError::ContentType(Some(_)))
        ));
        assert!(matches!(
            classify_response(StatusCode::OK, None),
            Err(FetchError::ContentType(None))
        ));
        assert!(matches!(
            classify_response(StatusCode::OK, Some(&garbage)),
            Err(FetchError::ContentType(None))
        ));
    }

    #[tokio::test]
    async fn test_fetch_returns_body() {
        let (addr, requests) = serve(vec![response("200 OK", Some("image/jpeg"), "JPEGDATA")]).await;

        let image = fetcher().fetch(&device_at(addr)).await.unwrap();

        assert_eq!(image.as_ref(), b"JPEGDATA");
        assert!(requests.lock().unwrap()[0].starts_with("GET /jpeg?id=2 HTTP/1.1"));
    }

    #[tokio::test]
    async fn test_fetch_classifies_http_errors() {
        let (addr, _) = serve(vec![
            response("404 Not Found", Some("text/plain"), "nope"),
            response("503 Service Unavailable", None, ""),
            response("200 OK", Some("text/html"), "<html>"),
        ])
        .await;
        let device = device_at(addr);
        let fetcher = fetcher();

        assert_eq!(fetcher.fetch(&device).await.unwrap_err().kind(), FailureKind::Client);
        assert_eq!(fetcher.fetch(&device).await.unwrap_err().kind(), FailureKind::Server);
        assert_eq!(
            fetcher.fetch(&device).await.unwrap_err().kind(),
            FailureKind::ContentType
        );
    }

    #[tokio::test]
    async fn test_fetch_connection_refused_is_network() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = fetcher().fetch(&device_at(addr)).await.unwrap_err();

        assert_eq!(err.kind(), FailureKind::Network);
    }

    #[tokio::test]
    async fn test_fetch_timeout_is_network() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let fetcher = HttpFetcher::new(Duration::from_millis(200), 1024).unwrap();
        let err = fetcher.fetch(&device_at(addr)).await.unwrap_err();

        assert_eq!(err.kind(), FailureKind::Network);
    }

    #[tokio::test]
    async fn test_fetch_rejects_oversized_body() {
        let body = "x".repeat(2048);
        let (addr, _) = serve(vec![response("200 OK", Some("image/jpeg"), &body)]).await;

        let err = fetcher().fetch(&device_at(addr)).await.unwrap_err();

        assert!(matches!(err, FetchError::TooLarge { limit: 1024 }));
    }

    #[tokio::test]
    async fn test_fetch_answers_digest_challenge() {
        let challenge = "HTTP/1.1 401 Unauthorized\r\n\
            WWW-Authenticate: Digest realm=\"cam\", qop=\"auth\", nonce=\"n0nce\"\r\n\
            Content-Length: 0\r\nConnection: close\r\n\r\n"
            .to_string();
        let (addr, requests) = serve(vec![
            challenge,
            response("200 OK", Some("image/jpeg"), "JPEGDATA"),
        ])
        .await;

        let creds = Credentials {
            username: "viewer".to_string(),
            password: "secret".to_string(),
        };
        let device =
            Device::new("cam-2", &addr.to_string(), "hikvision", Bytes::new(), 3, Some(&creds))
                .unwrap();

        let image = fetcher().fetch(&device).await.unwrap();

        assert_eq!(image.as_ref(), b"JPEGDATA");
        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(!requests[0].to_lowercase().contains("authorization:"));
        assert!(requests[1].contains("Digest username=\"viewer\""));
        assert!(requests[1].contains("uri=\"/ISAPI/Streaming/channels/101/picture\""));
    }

    #[tokio::test]
    async fn test_fetch_sends_embedded_basic_credentials() {
        let (addr, requests) = serve(vec![response("200 OK", Some("image/jpeg"), "JPEGDATA")]).await;

        let creds = Credentials {
            username: "viewer".to_string(),
            password: "secret".to_string(),
        };
        let device =
            Device::new("cam-4", &addr.to_string(), "advidia", Bytes::new(), 3, Some(&creds))
                .unwrap();

        let image = fetcher().fetch(&device).await.unwrap();

        assert_eq!(image.as_ref(), b"JPEGDATA");
        let requests = requests.lock().unwrap();
        let head = requests[0].to_lowercase();
        assert!(head.starts_with("get /isapi/streaming/channels/101/picture http/1.1"));
        assert!(head.contains("authorization: basic "));
        assert!(requests[0].contains("dmlld2VyOnNlY3JldA=="));
        assert!(!head.contains("viewer:secret@"));
    }

    #[tokio::test]
    async fn test_rejected_digest_is_client_failure() {
        let challenge = "HTTP/1.1 401 Unauthorized\r\n\
            WWW-Authenticate: Digest realm=\"cam\", nonce=\"n0nce\"\r\n\
            Content-Length: 0\r\nConnection: close\r\n\r\n"
            .to_string();
        let (addr, _) = serve(vec![challenge.clone(), challenge]).await;

        let creds = Credentials {
            username: "viewer".to_string(),
            password: "wrong".to_string(),
        };
        let device =
            Device::new("cam-3", &addr.to_string(), "hikvision", Bytes::new(), 3, Some(&creds))
                .unwrap();

        let err = fetcher().fetch(&device).await.unwrap_err();

        assert_eq!(err.kind(), FailureKind::Client);
    }
}
