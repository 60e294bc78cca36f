use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::error::{Result, UpdateError};
use crate::transport::{
    DownloadProgress, HttpTransport, RetryPolicy, Retrying, SftpTransport, Transport,
    WebdavTransport,
};

/// Ordered set of sources with sticky fallback.
///
/// Each call starts from the source that last succeeded and walks the rest in
/// order, wrapping around.
pub struct Servers {
    sources: Vec<Box<dyn Transport>>,
    sticky: AtomicUsize,
}

/// Build one retrying transport from a server uri.
pub fn transport_for(uri: &str, config: &Config, cancel: CancellationToken) -> Result<Box<dyn Transport>> {
    let policy = RetryPolicy::from_config(config);
    let transport: Box<dyn Transport> = if uri.starts_with("http") {
        Box::new(Retrying::new(
            HttpTransport::new(uri, config, cancel.clone())?,
            policy,
            cancel,
        ))
    } else if uri.starts_with("sftp") {
        Box::new(Retrying::new(
            SftpTransport::new(uri, config, cancel.clone())?,
            policy,
            cancel,
        ))
    } else if uri.starts_with("webdav") {
        Box::new(Retrying::new(
            WebdavTransport::new(uri, config, cancel.clone())?,
            policy,
            cancel,
        ))
    } else {
        return Err(UpdateError::UnknownServerStringFormat(uri.to_string()));
    };
    Ok(transport)
}

impl Servers {
    pub fn from_config(config: &Config, cancel: &CancellationToken) -> Result<Self> {
        let sources = config
            .server
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|uri| transport_for(uri, config, cancel.clone()))
            .collect::<Result<Vec<_>>>()?;
        Self::from_transports(sources)
    }

    pub fn from_transports(sources: Vec<Box<dyn Transport>>) -> Result<Self> {
        if sources.is_empty() {
            return Err(UpdateError::config("server", "no server configured"));
        }
        Ok(Servers {
            sources,
            sticky: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Index of the source the next call starts from.
    pub fn current(&self) -> usize {
        self.sticky.load(Ordering::Relaxed)
    }

    pub async fn fetch_text(&self, path: &str) -> Result<String> {
        let start = self.current();
        let mut last_error = None;
        for step in 0..self.sources.len() {
            let idx = (start + step) % self.sources.len();
            let source = &self.sources[idx];
            match source.fetch_text(path).await {
                Ok(text) => {
                    self.sticky.store(idx, Ordering::Relaxed);
                    return Ok(text);
                }
                Err(UpdateError::Interrupted) => return Err(UpdateError::Interrupted),
                Err(e) => {
                    self.report_failure(&source.build_uri(path), &e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| UpdateError::config("server", "no server configured")))
    }

    pub async fn download(
        &self,
        path: &str,
        dest: &Path,
        expected_len: Option<u64>,
        on_progress: &DownloadProgress,
    ) -> Result<()> {
        let start = self.current();
        let mut last_error = None;
        for step in 0..self.sources.len() {
            let idx = (start + step) % self.sources.len();
            let source = &self.sources[idx];
            match source.download(path, dest, expected_len, on_progress).await {
                Ok(()) => {
                    self.sticky.store(idx, Ordering::Relaxed);
                    return Ok(());
                }
                Err(UpdateError::Interrupted) => return Err(UpdateError::Interrupted),
                Err(e) => {
                    self.report_failure(&source.build_uri(path), &e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| UpdateError::config("server", "no server configured")))
    }

    fn report_failure(&self, uri: &str, err: &UpdateError) {
        if self.sources.len() > 1 {
            error!("{} failed: {}; trying the next server", uri, err);
        }
    }

    pub async fn close(&self) {
        for source in &self.sources {
            source.close().await;
        }
        info!("closed {} server connection(s)", self.sources.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    struct Fixed {
        name: &'static str,
        fail: bool,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Transport for Fixed {
        async fn fetch_text(&self, _path: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(UpdateError::ConnectionRejected {
                    url: self.name.into(),
                    reason: "down".into(),
                })
            } else {
                Ok(self.name.to_string())
            }
        }

        async fn download(
            &self,
            _path: &str,
            _dest: &Path,
            _expected_len: Option<u64>,
            _on_progress: &DownloadProgress,
        ) -> Result<()> {
            Err(UpdateError::Interrupted)
        }

        fn build_uri(&self, path: &str) -> String {
            format!("{}/{}", self.name, path)
        }
    }

    fn source(name: &'static str, fail: bool, calls: &Arc<AtomicU32>) -> Box<dyn Transport> {
        Box::new(Fixed {
            name,
            fail,
            calls: Arc::clone(calls),
        })
    }

    #[tokio::test]
    async fn falls_back_and_sticks_to_the_working_source() {
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));
        let servers = Servers::from_transports(vec![
            source("a", true, &first),
            source("b", false, &second),
        ])
        .unwrap();

        assert_eq!(servers.fetch_text("versions.txt").await.unwrap(), "b");
        assert_eq!(servers.current(), 1);
        assert_eq!(servers.fetch_text("versions.txt").await.unwrap(), "b");
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn last_error_is_raised_when_all_fail() {
        let calls = Arc::new(AtomicU32::new(0));
        let servers =
            Servers::from_transports(vec![source("a", true, &calls), source("b", true, &calls)])
                .unwrap();
        let err = servers.fetch_text("v").await.unwrap_err();
        assert!(matches!(err, UpdateError::ConnectionRejected { ref url, .. } if url == "b"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn interruption_is_not_failed_over() {
        let calls = Arc::new(AtomicU32::new(0));
        let servers =
            Servers::from_transports(vec![source("a", false, &calls), source("b", false, &calls)])
                .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let err = servers
            .download("x", &dir.path().join("x"), None, &crate::transport::no_progress)
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::Interrupted));
        assert_eq!(servers.current(), 0);
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        let config = Config {
            server: vec!["ftp://example.com/".into()],
            ..Config::default()
        };
        let err = Servers::from_config(&config, &CancellationToken::new()).err().unwrap();
        assert!(matches!(err, UpdateError::UnknownServerStringFormat(_)));
    }

    #[test]
    fn empty_server_list_is_a_config_error() {
        let err = Servers::from_config(&Config::default(), &CancellationToken::new())
            .err()
            .unwrap();
        assert!(matches!(err, UpdateError::ConfigField { ref field, .. } if field == "server"));
    }

    #[test]
    fn schemes_dispatch_to_transports() {
        let config = Config {
            server: vec![
                "https://example.com/patches/".into(),
                "webdav://u:p:dav.example.com:80/p".into(),
                "sftp://u:p:SHA256:abc@h:22/p".into(),
            ],
            ..Config::default()
        };
        let servers = Servers::from_config(&config, &CancellationToken::new()).unwrap();
        assert_eq!(servers.len(), 3);
        assert_eq!(servers.sources[1].build_uri("v.txt"), "http://dav.example.com:80/p/v.txt");
    }
}
