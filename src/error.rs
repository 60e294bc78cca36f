use std::fmt;
use std::io;

/// Convenient result alias for update operations.
pub type Result<T> = std::result::Result<T, UpdateError>;

/// Everything that can stop an update run.
#[derive(thiserror::Error, Debug)]
pub enum UpdateError {
    /// The remote end refused the connection.
    #[error("connection rejected: {url} ({reason})")]
    ConnectionRejected { url: String, reason: String },
    /// The connection dropped while a request was in flight.
    #[error("connection interrupted: {url} ({reason})")]
    ConnectionInterrupted { url: String, reason: String },
    /// Connecting or waiting for data took too long.
    #[error("connection timed out: {url} ({reason})")]
    ConnectionTimeout { url: String, reason: String },
    /// The server answered with a status outside the accepted range.
    #[error("unexpected http status {code} (expected {expected}) from {url}\n{body}")]
    HttpStatus {
        code: u16,
        expected: &'static str,
        url: String,
        body: String,
    },
    /// An http request could not be built or sent for a non-network reason.
    #[error("http request failed: {url} ({reason})")]
    Http { url: String, reason: String },
    /// The sftp server rejected the configured credentials.
    #[error("sftp authentication failed on {host}")]
    SftpAuthentication { host: String },
    /// The sftp server presented a host key other than the pinned one.
    #[error("host key of {host} is not trusted: expected {expected}, got {actual}")]
    HostKeyMismatch {
        host: String,
        expected: String,
        actual: String,
    },
    /// The sftp subsystem reported an error (missing file, permissions, ...).
    #[error("sftp error on {url}: {reason}")]
    Sftp { url: String, reason: String },
    /// The local version is unknown to the server, or the server list is empty.
    #[error("invalid version: {0}")]
    InvalidVersion(String),
    /// The persisted version marker could not be decoded.
    #[error("version marker {0} is corrupted and cannot be decoded")]
    InvalidVersionMarker(String),
    /// Any link of the integrity chain failed.
    #[error("patch of version {version} is corrupted: {subject}")]
    PatchCorrupted { version: String, subject: String },
    /// A configuration value is missing or malformed.
    #[error("invalid configuration field '{field}': {reason}")]
    ConfigField { field: String, reason: String },
    /// A server uri does not start with any supported scheme.
    #[error("unknown server string format: {0}")]
    UnknownServerStringFormat(String),
    /// A server uri has a known scheme but does not match its layout.
    #[error("invalid server uri '{uri}', expected {expected}")]
    InvalidServerUri { uri: String, expected: &'static str },
    /// A metadata document could not be parsed.
    #[error("failed to parse {name}: {reason}")]
    Metadata { name: String, reason: String },
    /// A local filesystem operation failed.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    /// The caller asked the update to stop.
    #[error("update interrupted by user")]
    Interrupted,
}

impl UpdateError {
    /// Whether this failure is worth another attempt against the same source.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            UpdateError::ConnectionRejected { .. }
                | UpdateError::ConnectionInterrupted { .. }
                | UpdateError::ConnectionTimeout { .. }
        )
    }

    pub fn corrupted(version: impl Into<String>, subject: impl Into<String>) -> Self {
        UpdateError::PatchCorrupted {
            version: version.into(),
            subject: subject.into(),
        }
    }

    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        UpdateError::ConfigField {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn interrupted_io(url: &str, err: &io::Error) -> Self {
        let reason = err.to_string();
        let url = url.to_string();
        match err.kind() {
            io::ErrorKind::ConnectionRefused => UpdateError::ConnectionRejected { url, reason },
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                UpdateError::ConnectionTimeout { url, reason }
            }
            _ => UpdateError::ConnectionInterrupted { url, reason },
        }
    }
}

/// Error payload carried inside an `io::Error` when a verified stream detects
/// corrupted data. Recovered by [`UpdateError::from_entry_io`].
#[derive(Debug)]
pub struct CorruptBlock(pub String);

impl fmt::Display for CorruptBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for CorruptBlock {}

impl CorruptBlock {
    pub fn into_io(self) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, self)
    }
}

impl UpdateError {
    /// Classify an io error raised while consuming patch data for `path`.
    ///
    /// Undecodable or hash-mismatched data becomes `PatchCorrupted`; anything
    /// else is reported as a plain filesystem failure.
    pub fn from_entry_io(version: &str, path: &str, err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::InvalidData {
            let detail = match err.get_ref().and_then(|e| e.downcast_ref::<CorruptBlock>()) {
                Some(block) => block.0.clone(),
                None => err.to_string(),
            };
            return UpdateError::corrupted(version, format!("{path}: {detail}"));
        }
        UpdateError::Io {
            context: format!("failed to apply {path}"),
            source: err,
        }
    }
}

/// `anyhow::Context`-style helper for io results.
pub trait IoContext<T> {
    fn io_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T> IoContext<T> for std::result::Result<T, io::Error> {
    fn io_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|source| UpdateError::Io {
            context: f().into(),
            source,
        })
    }
}

/// Failure of a whole update run, with the number of versions that were
/// fully committed before the error.
#[derive(thiserror::Error, Debug)]
#[error("{error} ({applied} version(s) applied before the failure)")]
pub struct RunError {
    pub applied: usize,
    #[source]
    pub error: UpdateError,
}
