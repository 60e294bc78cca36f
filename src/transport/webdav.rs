use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use std::path::Path;
use std::sync::OnceLock;
use tokio_util::sync::CancellationToken;

use super::http::{build_client, escape_path, HttpFile};
use super::range::RangeSource;
use super::{DownloadProgress, Transport};
use crate::config::Config;
use crate::error::{Result, UpdateError};

const URI_LAYOUT: &str = "webdav(s)://user:password:host:port/base-path";

fn uri_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(webdavs?)://(.+?):(.+?):(.+?):(\d+)((?:/[^/]+)*)/?$").unwrap())
}

/// Parsed `webdav(s)://` server uri.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebdavTarget {
    pub secure: bool,
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub base_path: String,
}

impl WebdavTarget {
    pub fn parse(uri: &str) -> Result<Self> {
        let invalid = || UpdateError::InvalidServerUri {
            uri: uri.to_string(),
            expected: URI_LAYOUT,
        };
        let caps = uri_pattern().captures(uri).ok_or_else(invalid)?;
        Ok(WebdavTarget {
            secure: &caps[1] == "webdavs",
            user: caps[2].to_string(),
            password: caps[3].to_string(),
            host: caps[4].to_string(),
            port: caps[5].parse().map_err(|_| invalid())?,
            base_path: caps[6].to_string(),
        })
    }

    /// `http(s)://host:port/base-path/`
    pub fn base_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}:{}{}/", self.host, self.port, self.base_path)
    }
}

/// WebDAV server read with authenticated GET requests, one stream per file.
pub struct WebdavTransport {
    target: WebdavTarget,
    base: String,
    client: Client,
    fallback_size: u64,
    cancel: CancellationToken,
}

impl WebdavTransport {
    pub fn new(uri: &str, config: &Config, cancel: CancellationToken) -> Result<Self> {
        let target = WebdavTarget::parse(uri)?;
        Ok(WebdavTransport {
            base: target.base_url(),
            target,
            client: build_client(config)?,
            fallback_size: config.http_fallback_file_size,
            cancel,
        })
    }

    fn file(&self, path: &str) -> HttpFile {
        HttpFile {
            client: self.client.clone(),
            url: self.build_uri(path),
            credentials: Some((self.target.user.clone(), self.target.password.clone())),
            fallback_size: self.fallback_size,
            cancel: self.cancel.clone(),
        }
    }
}

#[async_trait]
impl Transport for WebdavTransport {
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
        self.file(path)
            .fetch_sequential(dest, expected_len, on_progress)
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
    fn parses_secure_uri_with_path() {
        let t = WebdavTarget::parse("webdavs://alice:s3cret:dav.example.com:443/remote/patches").unwrap();
        assert!(t.secure);
        assert_eq!(t.user, "alice");
        assert_eq!(t.password, "s3cret");
        assert_eq!(t.host, "dav.example.com");
        assert_eq!(t.port, 443);
        assert_eq!(t.base_url(), "https://dav.example.com:443/remote/patches/");
    }

    #[test]
    fn parses_plain_uri_without_path() {
        let t = WebdavTarget::parse("webdav://bob:pw:10.0.0.2:8080").unwrap();
        assert!(!t.secure);
        assert_eq!(t.base_url(), "http://10.0.0.2:8080/");
    }

    #[test]
    fn rejects_malformed_uri() {
        assert!(matches!(
            WebdavTarget::parse("webdav://nohost"),
            Err(UpdateError::InvalidServerUri { .. })
        ));
    }
}
