//! Remote sources a version can be fetched from.

pub mod http;
pub mod range;
pub mod retry;
pub mod sftp;
pub mod webdav;

use async_trait::async_trait;
use futures_util::StreamExt;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::error::{IoContext, Result, UpdateError};
use crate::progress::IntervalTimer;

pub use http::HttpTransport;
pub use range::{ByteRange, RangeDownloader, RangeSource};
pub use retry::{with_retry, RetryPolicy, Retrying};
pub use sftp::SftpTransport;
pub use webdav::WebdavTransport;

/// Download progress callback: `(chunk_len, bytes_so_far, total_len)`.
pub type DownloadProgress = dyn Fn(u64, u64, u64) + Send + Sync;

/// A place versions can be fetched from.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch a small text document, e.g. the version list.
    async fn fetch_text(&self, path: &str) -> Result<String>;

    /// Download `path` into `dest`, replacing it.
    ///
    /// `expected_len` is used as the total for progress when the server does
    /// not report one.
    async fn download(
        &self,
        path: &str,
        dest: &Path,
        expected_len: Option<u64>,
        on_progress: &DownloadProgress,
    ) -> Result<()>;

    /// Human-readable location of `path` for logs and errors.
    fn build_uri(&self, path: &str) -> String;

    /// Release held connections.
    async fn close(&self) {}
}

/// Callback that ignores progress.
pub fn no_progress(_chunk: u64, _done: u64, _total: u64) {}

/// Limits progress callbacks to one per 150 ms, accumulating the bytes in
/// between, with a final flush.
pub struct ReportThrottle<'a> {
    callback: &'a DownloadProgress,
    timer: IntervalTimer,
    pending: u64,
    done: u64,
    total: u64,
}

impl<'a> ReportThrottle<'a> {
    pub fn new(callback: &'a DownloadProgress, total: u64) -> Self {
        ReportThrottle {
            callback,
            timer: IntervalTimer::new(Duration::from_millis(150)),
            pending: 0,
            done: 0,
            total,
        }
    }

    pub fn feed(&mut self, bytes: u64) {
        self.pending += bytes;
        self.done += bytes;
        if self.timer.tick() {
            (self.callback)(self.pending, self.done, self.total);
            self.pending = 0;
        }
    }

    pub fn done(&self) -> u64 {
        self.done
    }

    pub fn finish(mut self) {
        if self.pending > 0 {
            (self.callback)(self.pending, self.done, self.total);
            self.pending = 0;
        }
    }
}

/// Map a reqwest failure onto the transport error taxonomy.
pub(crate) fn classify_reqwest(url: &str, err: reqwest::Error) -> UpdateError {
    let url = url.to_string();
    let reason = err.to_string();
    if err.is_timeout() {
        UpdateError::ConnectionTimeout { url, reason }
    } else if err.is_connect() {
        UpdateError::ConnectionRejected { url, reason }
    } else if err.is_body() || err.is_decode() || err.is_request() {
        UpdateError::ConnectionInterrupted { url, reason }
    } else {
        UpdateError::Http { url, reason }
    }
}

/// Stream a response body into `dest`, returning the number of bytes written.
pub(crate) async fn stream_to_file(
    url: &str,
    response: reqwest::Response,
    dest: &Path,
    total: u64,
    on_progress: &DownloadProgress,
    cancel: &CancellationToken,
) -> Result<u64> {
    let file = tokio::fs::File::create(dest)
        .await
        .io_context(|| format!("failed to create {}", dest.display()))?;
    let mut file = tokio::io::BufWriter::new(file);
    let mut body = response.bytes_stream();
    let mut throttle = ReportThrottle::new(on_progress, total);

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Err(UpdateError::Interrupted),
            next = body.next() => next,
        };
        match next {
            None => break,
            Some(Ok(chunk)) => {
                file.write_all(&chunk)
                    .await
                    .io_context(|| format!("failed to write {}", dest.display()))?;
                throttle.feed(chunk.len() as u64);
            }
            Some(Err(e)) => return Err(classify_reqwest(url, e)),
        }
    }

    file.flush()
        .await
        .io_context(|| format!("failed to flush {}", dest.display()))?;
    let written = throttle.done();
    throttle.finish();
    Ok(written)
}
