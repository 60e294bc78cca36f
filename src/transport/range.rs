use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, VecDeque};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::retry::{with_retry, RetryPolicy};
use super::{DownloadProgress, ReportThrottle};
use crate::error::{IoContext, Result, UpdateError};

/// Half-open byte interval `[start, end)` of a remote file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub index: usize,
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    /// Value of the http `Range` header (inclusive end).
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end - 1)
    }
}

/// Cut `[0, len)` into blocks of `block_size`; the last one is truncated.
pub fn partition(len: u64, block_size: u64) -> Vec<ByteRange> {
    let block_size = block_size.max(1);
    (0..len.div_ceil(block_size))
        .map(|i| ByteRange {
            index: i as usize,
            start: i * block_size,
            end: ((i + 1) * block_size).min(len),
        })
        .collect()
}

/// A single remote file that may support ranged reads.
#[async_trait]
pub trait RangeSource: Send + Sync + 'static {
    fn describe(&self) -> String;

    /// Total length if the server accepts range requests, `None` otherwise.
    async fn probe_length(&self) -> Result<Option<u64>>;

    /// Fetch one range, fully buffered.
    async fn fetch_range(&self, range: &ByteRange) -> Result<Bytes>;

    /// Stream the whole file into `dest` in one request.
    async fn fetch_sequential(
        &self,
        dest: &Path,
        expected_len: Option<u64>,
        on_progress: &DownloadProgress,
    ) -> Result<u64>;
}

/// Parallel block downloader with ordered reassembly.
#[derive(Debug, Clone)]
pub struct RangeDownloader {
    pub threads: usize,
    pub block_size: u64,
    pub policy: RetryPolicy,
    pub cancel: CancellationToken,
}

type Blocks = Arc<Mutex<BTreeMap<usize, (u64, Bytes)>>>;

impl RangeDownloader {
    /// Download `source` into `dest`, concurrently when ranges are accepted.
    pub async fn download<S: RangeSource>(
        &self,
        source: Arc<S>,
        dest: &Path,
        expected_len: Option<u64>,
        on_progress: &DownloadProgress,
    ) -> Result<u64> {
        match source.probe_length().await? {
            Some(total) => self.download_ranges(source, dest, total, on_progress).await,
            None => {
                info!("{} does not accept ranges, downloading in one stream", source.describe());
                source.fetch_sequential(dest, expected_len, on_progress).await
            }
        }
    }

    async fn download_ranges<S: RangeSource>(
        &self,
        source: Arc<S>,
        dest: &Path,
        total: u64,
        on_progress: &DownloadProgress,
    ) -> Result<u64> {
        let ranges = partition(total, self.block_size);
        let workers = self.threads.min(ranges.len()).max(1);
        debug!(
            "downloading {} in {} blocks with {} workers",
            source.describe(),
            ranges.len(),
            workers
        );

        let queue = Arc::new(Mutex::new(ranges.into_iter().collect::<VecDeque<_>>()));
        let blocks: Blocks = Arc::new(Mutex::new(BTreeMap::new()));
        let (tx, mut rx) = mpsc::unbounded_channel::<u64>();
        let mut set = JoinSet::new();

        for _ in 0..workers {
            let source = Arc::clone(&source);
            let queue = Arc::clone(&queue);
            let blocks = Arc::clone(&blocks);
            let tx = tx.clone();
            let policy = self.policy;
            let cancel = self.cancel.clone();
            set.spawn(async move {
                loop {
                    let Some(range) = queue.lock().await.pop_front() else {
                        return Ok::<(), UpdateError>(());
                    };
                    let what = format!("{} ({})", source.describe(), range.header_value());
                    let data = with_retry(policy, &cancel, &what, || fetch_exact(&*source, range))
                        .await?;
                    let _ = tx.send(data.len() as u64);
                    blocks.lock().await.insert(range.index, (range.start, data));
                }
            });
        }
        drop(tx);

        let mut throttle = ReportThrottle::new(on_progress, total);
        loop {
            tokio::select! {
                Some(n) = rx.recv() => throttle.feed(n),
                joined = set.join_next() => match joined {
                    None => break,
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(e))) => {
                        set.abort_all();
                        return Err(e);
                    }
                    Some(Err(e)) => {
                        set.abort_all();
                        return Err(UpdateError::Http {
                            url: source.describe(),
                            reason: format!("download worker failed: {e}"),
                        });
                    }
                },
            }
        }
        while let Ok(n) = rx.try_recv() {
            throttle.feed(n);
        }

        let blocks = std::mem::take(&mut *blocks.lock().await);
        let path = dest.to_path_buf();
        tokio::task::spawn_blocking(move || write_blocks(&path, blocks))
            .await
            .map_err(|e| UpdateError::Io {
                context: format!("failed to write {}", dest.display()),
                source: std::io::Error::other(e),
            })??;
        throttle.finish();
        Ok(total)
    }
}

async fn fetch_exact<S: RangeSource + ?Sized>(source: &S, range: ByteRange) -> Result<Bytes> {
    let data = source.fetch_range(&range).await?;
    if data.len() as u64 != range.len() {
        return Err(UpdateError::ConnectionInterrupted {
            url: source.describe(),
            reason: format!(
                "block {} returned {} bytes, expected {}",
                range.index,
                data.len(),
                range.len()
            ),
        });
    }
    Ok(data)
}

fn write_blocks(path: &Path, blocks: BTreeMap<usize, (u64, Bytes)>) -> Result<()> {
    let mut file = std::fs::File::create(path)
        .io_context(|| format!("failed to create {}", path.display()))?;
    for (start, data) in blocks.into_values() {
        file.seek(SeekFrom::Start(start))
            .io_context(|| format!("failed to seek in {}", path.display()))?;
        file.write_all(&data)
            .io_context(|| format!("failed to write {}", path.display()))?;
    }
    file.sync_all()
        .io_context(|| format!("failed to flush {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::no_progress;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// In-memory file with optional range support and injected faults.
    struct MemorySource {
        data: Vec<u8>,
        ranges: bool,
        short_reads: AtomicU32,
        fail_block: Option<usize>,
    }

    impl MemorySource {
        fn new(data: Vec<u8>, ranges: bool) -> Self {
            MemorySource {
                data,
                ranges,
                short_reads: AtomicU32::new(0),
                fail_block: None,
            }
        }
    }

    #[async_trait]
    impl RangeSource for MemorySource {
        fn describe(&self) -> String {
            "memory://blob".into()
        }

        async fn probe_length(&self) -> Result<Option<u64>> {
            Ok(self.ranges.then_some(self.data.len() as u64))
        }

        async fn fetch_range(&self, range: &ByteRange) -> Result<Bytes> {
            if self.fail_block == Some(range.index) {
                return Err(UpdateError::HttpStatus {
                    code: 500,
                    expected: "206",
                    url: self.describe(),
                    body: String::new(),
                });
            }
            let slice = &self.data[range.start as usize..range.end as usize];
            let pending = self.short_reads.load(Ordering::SeqCst);
            if pending > 0 {
                self.short_reads.store(pending - 1, Ordering::SeqCst);
                return Ok(Bytes::copy_from_slice(&slice[..slice.len() / 2]));
            }
            Ok(Bytes::copy_from_slice(slice))
        }

        async fn fetch_sequential(
            &self,
            dest: &Path,
            _expected_len: Option<u64>,
            on_progress: &DownloadProgress,
        ) -> Result<u64> {
            std::fs::write(dest, &self.data).io_context(|| "write")?;
            on_progress(self.data.len() as u64, self.data.len() as u64, self.data.len() as u64);
            Ok(self.data.len() as u64)
        }
    }

    fn downloader(threads: usize, block_size: u64) -> RangeDownloader {
        RangeDownloader {
            threads,
            block_size,
            policy: RetryPolicy::new(3, Duration::from_millis(1)),
            cancel: CancellationToken::new(),
        }
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 13 % 256) as u8).collect()
    }

    #[test]
    fn partition_truncates_last_block() {
        let ranges = partition(10, 4);
        assert_eq!(ranges.len(), 3);
        assert_eq!((ranges[2].start, ranges[2].end), (8, 10));
        assert_eq!(ranges[0].header_value(), "bytes=0-3");
        assert!(partition(0, 4).is_empty());
    }

    #[tokio::test]
    async fn ranged_download_matches_sequential() {
        let dir = tempfile::tempdir().unwrap();
        let data = sample(100_003);
        let ranged = dir.path().join("ranged.bin");
        let sequential = dir.path().join("sequential.bin");

        let n = downloader(4, 4096)
            .download(Arc::new(MemorySource::new(data.clone(), true)), &ranged, None, &no_progress)
            .await
            .unwrap();
        assert_eq!(n, data.len() as u64);
        downloader(4, 4096)
            .download(Arc::new(MemorySource::new(data.clone(), false)), &sequential, None, &no_progress)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&ranged).unwrap(), data);
        assert_eq!(std::fs::read(&sequential).unwrap(), data);
    }

    #[tokio::test]
    async fn short_blocks_are_retried() {
        let dir = tempfile::tempdir().unwrap();
        let data = sample(10_000);
        let source = MemorySource::new(data.clone(), true);
        source.short_reads.store(2, Ordering::SeqCst);
        let dest = dir.path().join("out.bin");
        downloader(2, 1000)
            .download(Arc::new(source), &dest, None, &no_progress)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }

    #[tokio::test]
    async fn fatal_block_error_aborts_the_download() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = MemorySource::new(sample(10_000), true);
        source.fail_block = Some(3);
        let err = downloader(3, 1000)
            .download(Arc::new(source), &dir.path().join("out.bin"), None, &no_progress)
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::HttpStatus { code: 500, .. }));
    }

    #[tokio::test]
    async fn progress_reaches_the_total() {
        let dir = tempfile::tempdir().unwrap();
        let data = sample(50_000);
        let last = Arc::new(std::sync::Mutex::new((0u64, 0u64)));
        let seen = Arc::clone(&last);
        let record = move |_chunk: u64, done: u64, total: u64| *seen.lock().unwrap() = (done, total);
        downloader(4, 4096)
            .download(Arc::new(MemorySource::new(data, true)), &dir.path().join("o"), None, &record)
            .await
            .unwrap();
        assert_eq!(*last.lock().unwrap(), (50_000, 50_000));
    }
}
