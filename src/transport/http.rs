use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_RANGE, RANGE};
use reqwest::{Client, Response, StatusCode};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::range::{ByteRange, RangeDownloader, RangeSource};
use super::retry::RetryPolicy;
use super::{classify_reqwest, stream_to_file, DownloadProgress, Transport};
use crate::config::Config;
use crate::error::{Result, UpdateError};

/// Longest error body kept in an [`UpdateError::HttpStatus`].
const ERROR_BODY_LIMIT: usize = 500;

/// Build the shared reqwest client from the http settings of `config`.
pub(crate) fn build_client(config: &Config) -> Result<Client> {
    let mut headers = HeaderMap::new();
    for (name, value) in &config.http_headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| UpdateError::config("http-headers", format!("{name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| UpdateError::config("http-headers", format!("{name}: {e}")))?;
        headers.insert(name, value);
    }
    Client::builder()
        .connect_timeout(config.connect_timeout())
        .read_timeout(config.response_timeout())
        .user_agent(config.client_user_agent.clone())
        .default_headers(headers)
        .danger_accept_invalid_certs(config.ignore_https_certificate)
        .build()
        .map_err(|e| UpdateError::config("server", format!("failed to build http client: {e}")))
}

/// Everything up to and including the last `/` of the uri's path.
pub(crate) fn base_url(uri: &str) -> String {
    let path_start = uri.find("://").map(|i| i + 3).unwrap_or(0);
    match uri[path_start..].rfind('/') {
        Some(i) => uri[..path_start + i + 1].to_string(),
        None => format!("{uri}/"),
    }
}

pub(crate) fn escape_path(path: &str) -> String {
    path.replace('+', "%2B")
}

/// Turn a non-success response into an [`UpdateError::HttpStatus`].
pub(crate) async fn status_error(url: &str, response: Response, expected: &'static str) -> UpdateError {
    let code = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    UpdateError::HttpStatus {
        code,
        expected,
        url: url.to_string(),
        body: body.chars().take(ERROR_BODY_LIMIT).collect(),
    }
}

/// Parse the total of a `Content-Range: bytes a-b/total` header.
pub(crate) fn content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.trim().strip_prefix("bytes")?.trim().split_once('/')?;
    total.trim().parse().ok()
}

/// One remote file reachable over http(s).
pub(crate) struct HttpFile {
    pub client: Client,
    pub url: String,
    pub credentials: Option<(String, String)>,
    pub fallback_size: u64,
    pub cancel: CancellationToken,
}

impl HttpFile {
    fn get(&self) -> reqwest::RequestBuilder {
        let request = self.client.get(&self.url);
        match &self.credentials {
            Some((user, password)) => request.basic_auth(user, Some(password)),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Response> {
        debug!("GET {}", self.url);
        tokio::select! {
            _ = self.cancel.cancelled() => Err(UpdateError::Interrupted),
            sent = request.send() => sent.map_err(|e| classify_reqwest(&self.url, e)),
        }
    }

    pub async fn text(&self) -> Result<String> {
        let response = self.send(self.get()).await?;
        if !response.status().is_success() {
            return Err(status_error(&self.url, response, "2xx").await);
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(UpdateError::Interrupted),
            text = response.text() => text.map_err(|e| classify_reqwest(&self.url, e)),
        }
    }
}

#[async_trait]
impl RangeSource for HttpFile {
    fn describe(&self) -> String {
        self.url.clone()
    }

    async fn probe_length(&self) -> Result<Option<u64>> {
        let response = self.send(self.get().header(RANGE, "bytes=0-0")).await?;
        // Anything but 206 (a 416 on an empty file, a 200, an error page)
        // leaves the status for the sequential request to report.
        if response.status() != StatusCode::PARTIAL_CONTENT {
            debug!("range probe of {} answered {}", self.url, response.status());
            return Ok(None);
        }
        Ok(response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(content_range_total))
    }

    async fn fetch_range(&self, range: &ByteRange) -> Result<Bytes> {
        let response = self
            .send(self.get().header(RANGE, range.header_value()))
            .await?;
        if response.status() != StatusCode::PARTIAL_CONTENT {
            return Err(status_error(&self.url, response, "206").await);
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(UpdateError::Interrupted),
            body = response.bytes() => body.map_err(|e| classify_reqwest(&self.url, e)),
        }
    }

    async fn fetch_sequential(
        &self,
        dest: &Path,
        expected_len: Option<u64>,
        on_progress: &DownloadProgress,
    ) -> Result<u64> {
        let response = self.send(self.get()).await?;
        if !response.status().is_success() {
            return Err(status_error(&self.url, response, "2xx").await);
        }
        let total = response
            .content_length()
            .or(expected_len)
            .unwrap_or(self.fallback_size);
        stream_to_file(&self.url, response, dest, total, on_progress, &self.cancel).await
    }
}

/// Plain http(s) server; downloads use concurrent ranges when offered.
pub struct HttpTransport {
    client: Client,
    base: String,
    ranges: RangeDownloader,
    fallback_size: u64,
    cancel: CancellationToken,
}

impl HttpTransport {
    pub fn new(uri: &str, config: &Config, cancel: CancellationToken) -> Result<Self> {
        Ok(HttpTransport {
            client: build_client(config)?,
            base: base_url(uri),
            ranges: RangeDownloader {
                threads: config.concurrent_threads,
                block_size: config.concurrent_block_size,
                policy: RetryPolicy::from_config(config),
                cancel: cancel.clone(),
            },
            fallback_size: config.http_fallback_file_size,
            cancel,
        })
    }

    fn file(&self, path: &str) -> HttpFile {
        HttpFile {
            client: self.client.clone(),
            url: self.build_uri(path),
            credentials: None,
            fallback_size: self.fallback_size,
            cancel: self.cancel.clone(),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch_text(&self, path: &str) -> Result<String> {
        self.file(path).text().await
    }

    async fn download(
        &self,
        path: &str,
        dest: &Path,
        expected_len: Option<u64>,
        on_progress: &DownloadProgress,
    ) -> Result<()> {
        let file = Arc::new(self.file(path));
        self.ranges
            .download(file, dest, expected_len, on_progress)
            .await
            .map(|_| ())
    }

    fn build_uri(&self, path: &str) -> String {
        format!("{}{}", self.base, escape_path(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_truncates_after_last_slash() {
        assert_eq!(base_url("http://example.com/patches/index.html"), "http://example.com/patches/");
        assert_eq!(base_url("https://example.com/patches/"), "https://example.com/patches/");
        assert_eq!(base_url("http://example.com"), "http://example.com/");
    }

    #[test]
    fn plus_is_escaped() {
        let config = Config {
            server: vec!["http://h/p/".into()],
            ..Config::default()
        };
        let t = HttpTransport::new("http://h/p/", &config, CancellationToken::new()).unwrap();
        assert_eq!(t.build_uri("1.0+fix.mc-patch.json"), "http://h/p/1.0%2Bfix.mc-patch.json");
    }

    #[test]
    fn content_range_total_is_parsed() {
        assert_eq!(content_range_total("bytes 0-0/12345"), Some(12345));
        assert_eq!(content_range_total("bytes 0-0/*"), None);
        assert_eq!(content_range_total("items 0-0/5"), None);
    }

    /// Serve an empty file: 416 to any range request, 200 otherwise.
    async fn empty_file_server() -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => request.extend_from_slice(&buf[..n]),
                        }
                    }
                    let ranged = String::from_utf8_lossy(&request)
                        .to_ascii_lowercase()
                        .contains("\r\nrange:");
                    let response: &[u8] = if ranged {
                        b"HTTP/1.1 416 Range Not Satisfiable\r\nContent-Range: bytes */0\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                    } else {
                        b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                    };
                    let _ = socket.write_all(response).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn empty_file_downloads_after_unsatisfiable_range() {
        let base = empty_file_server().await;
        let config = Config {
            server: vec![base.clone()],
            ..Config::default()
        };
        let transport = HttpTransport::new(&base, &config, CancellationToken::new()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("1.0.mc-patch.bin");
        let no_progress: &DownloadProgress = &|_, _, _| {};

        transport
            .download("1.0.mc-patch.bin", &dest, Some(0), no_progress)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"");
    }

    #[test]
    fn bad_header_name_is_a_config_error() {
        let mut config = Config::default();
        config.http_headers.insert("bad header".into(), "v".into());
        assert!(matches!(
            build_client(&config),
            Err(UpdateError::ConfigField { .. })
        ));
    }
}
