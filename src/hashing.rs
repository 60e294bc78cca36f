use sha1::{Digest, Sha1};
use std::io::{self, Read, Write};
use std::path::Path;

use crate::error::{IoContext, Result};

const KB: usize = 1024;
const MB: usize = 1024 * KB;

/// Pick a read buffer for a stream of `size` bytes: small files get a small
/// buffer, large transfers get up to 64 MB to keep syscall counts low.
pub fn choose_buffer_size(size: u64) -> usize {
    const THRESHOLDS: [(u64, usize); 11] = [
        (1 << 20, 16 * KB),
        (2 << 20, 32 * KB),
        (4 << 20, 64 * KB),
        (8 << 20, 256 * KB),
        (16 << 20, 512 * KB),
        (32 << 20, MB),
        (64 << 20, 2 * MB),
        (128 << 20, 4 * MB),
        (256 << 20, 8 * MB),
        (512 << 20, 16 * MB),
        (1 << 30, 32 * MB),
    ];
    THRESHOLDS
        .iter()
        .find(|(limit, _)| size < *limit)
        .map(|(_, buffer)| *buffer)
        .unwrap_or(64 * MB)
}

/// Lowercase hex SHA1 of a byte slice.
pub fn sha1_bytes(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

/// Stream-hash a file with SHA1, sizing the buffer from the file length.
pub fn sha1_file(path: &Path) -> Result<String> {
    let file = std::fs::File::open(path)
        .io_context(|| format!("failed to open file for hashing: {}", path.display()))?;
    let len = file
        .metadata()
        .io_context(|| format!("failed to stat {}", path.display()))?
        .len();
    let mut reader = io::BufReader::with_capacity(choose_buffer_size(len), file);
    let mut hasher = Sha1::new();
    io::copy(&mut reader, &mut hasher)
        .io_context(|| format!("failed to hash file: {}", path.display()))?;
    Ok(hex::encode(hasher.finalize()))
}

/// Reader tap that hashes every byte passing through it.
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha1,
    bytes: u64,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha1::new(),
            bytes: 0,
        }
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes
    }

    /// Hex digest of everything read so far.
    pub fn hex_digest(&self) -> String {
        hex::encode(self.hasher.clone().finalize())
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }
}

/// Writer tap that hashes every byte written through it.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha1,
    bytes: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha1::new(),
            bytes: 0,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    /// Flush the inner writer and return it together with the hex digest.
    pub fn finish(mut self) -> io::Result<(W, String)> {
        self.inner.flush()?;
        Ok((self.inner, hex::encode(self.hasher.finalize())))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
