use async_trait::async_trait;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{DownloadProgress, Transport};
use crate::config::Config;
use crate::error::{Result, UpdateError};

/// How often and how patiently transient failures are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        RetryPolicy {
            attempts: attempts.max(1),
            delay,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        RetryPolicy::new(config.retry_times, config.retry_delay())
    }
}

/// Run `op` until it succeeds, fails permanently, or the attempts run out.
///
/// Only [`UpdateError::is_transient`] failures are retried. Cancellation is
/// observed both while `op` runs and while sleeping between attempts.
pub async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UpdateError::Interrupted),
            result = op() => result,
        };
        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < attempts => {
                warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    what, attempt, attempts, e, policy.delay
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(UpdateError::Interrupted),
                    _ = tokio::time::sleep(policy.delay) => {}
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Transport decorator that retries transient failures of every call.
pub struct Retrying<T> {
    inner: T,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl<T: Transport> Retrying<T> {
    pub fn new(inner: T, policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Retrying {
            inner,
            policy,
            cancel,
        }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

#[async_trait]
impl<T: Transport> Transport for Retrying<T> {
    async fn fetch_text(&self, path: &str) -> Result<String> {
        let inner = &self.inner;
        let what = inner.build_uri(path);
        with_retry(self.policy, &self.cancel, &what, move || inner.fetch_text(path)).await
    }

    async fn download(
        &self,
        path: &str,
        dest: &Path,
        expected_len: Option<u64>,
        on_progress: &DownloadProgress,
    ) -> Result<()> {
        let inner = &self.inner;
        let what = inner.build_uri(path);
        with_retry(self.policy, &self.cancel, &what, move || {
            inner.download(path, dest, expected_len, on_progress)
        })
        .await
    }

    fn build_uri(&self, path: &str) -> String {
        self.inner.build_uri(path)
    }

    async fn close(&self) {
        self.inner.close().await
    }
}
