use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use regex::Regex;
use ssh2::{ErrorCode, HashType, Session, Sftp};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{DownloadProgress, ReportThrottle, Transport};
use crate::config::Config;
use crate::error::{IoContext, Result, UpdateError};

const URI_LAYOUT: &str = "sftp://user:password:fingerprint@host:port/base-path";

/// libssh2's timeout error code.
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;

fn uri_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^sftp://(.+?):(.+?):(.+?)@(.+?):(\d+)(?:/(.*))?$").unwrap())
}

/// Pinned host key digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fingerprint {
    /// OpenSSH style `SHA256:<base64>`, stored without padding.
    Sha256(String),
    /// Colon separated hex, stored lowercase without separators.
    Md5(String),
}

impl Fingerprint {
    pub fn parse(text: &str) -> Self {
        match text.strip_prefix("SHA256:") {
            Some(b64) => Fingerprint::Sha256(b64.trim_end_matches('=').to_string()),
            None => Fingerprint::Md5(
                text.trim_start_matches("MD5:")
                    .chars()
                    .filter(|c| *c != ':')
                    .collect::<String>()
                    .to_ascii_lowercase(),
            ),
        }
    }

    pub fn hash_type(&self) -> HashType {
        match self {
            Fingerprint::Sha256(_) => HashType::Sha256,
            Fingerprint::Md5(_) => HashType::Md5,
        }
    }

    /// Render a raw digest the way this fingerprint is written.
    pub fn render(&self, digest: &[u8]) -> String {
        match self {
            Fingerprint::Sha256(_) => format!("SHA256:{}", STANDARD_NO_PAD.encode(digest)),
            Fingerprint::Md5(_) => digest
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<Vec<_>>()
                .join(":"),
        }
    }

    pub fn matches(&self, digest: &[u8]) -> bool {
        match self {
            Fingerprint::Sha256(expected) => STANDARD_NO_PAD.encode(digest) == *expected,
            Fingerprint::Md5(expected) => hex::encode(digest) == *expected,
        }
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Fingerprint::Sha256(b64) => write!(f, "SHA256:{b64}"),
            Fingerprint::Md5(hex) => write!(f, "MD5:{hex}"),
        }
    }
}

/// Parsed `sftp://` server uri.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SftpTarget {
    pub user: String,
    pub password: String,
    pub fingerprint: Fingerprint,
    pub host: String,
    pub port: u16,
    pub base_path: String,
}

impl SftpTarget {
    pub fn parse(uri: &str) -> Result<Self> {
        let invalid = || UpdateError::InvalidServerUri {
            uri: uri.to_string(),
            expected: URI_LAYOUT,
        };
        let caps = uri_pattern().captures(uri).ok_or_else(invalid)?;
        Ok(SftpTarget {
            user: caps[1].to_string(),
            password: caps[2].to_string(),
            fingerprint: Fingerprint::parse(&caps[3]),
            host: caps[4].to_string(),
            port: caps[5].parse().map_err(|_| invalid())?,
            base_path: caps
                .get(6)
                .map(|m| m.as_str().trim_end_matches('/').to_string())
                .unwrap_or_default(),
        })
    }

    pub fn remote_path(&self, path: &str) -> PathBuf {
        if self.base_path.is_empty() {
            PathBuf::from(path)
        } else {
            PathBuf::from(format!("{}/{}", self.base_path, path))
        }
    }

    fn display_uri(&self, path: &str) -> String {
        format!(
            "sftp://{}@{}:{}/{}",
            self.user,
            self.host,
            self.port,
            self.remote_path(path).display()
        )
    }
}

struct SftpConnection {
    // Keeps the ssh session alive for the sftp channel.
    _session: Session,
    sftp: Sftp,
}

#[derive(Clone, Copy)]
struct Timeouts {
    connect: Duration,
    read: Duration,
}

fn classify_ssh(url: &str, err: ssh2::Error) -> UpdateError {
    let url = url.to_string();
    let reason = err.message().to_string();
    match err.code() {
        ErrorCode::SFTP(_) => UpdateError::Sftp { url, reason },
        ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) => UpdateError::ConnectionTimeout { url, reason },
        ErrorCode::Session(_) => UpdateError::ConnectionInterrupted { url, reason },
    }
}

fn connect(target: &SftpTarget, timeouts: Timeouts) -> Result<SftpConnection> {
    let url = target.display_uri("");
    let addr = (target.host.as_str(), target.port)
        .to_socket_addrs()
        .map_err(|e| UpdateError::interrupted_io(&url, &e))?
        .next()
        .ok_or_else(|| UpdateError::ConnectionRejected {
            url: url.clone(),
            reason: format!("{} did not resolve to any address", target.host),
        })?;
    let tcp = TcpStream::connect_timeout(&addr, timeouts.connect)
        .map_err(|e| UpdateError::interrupted_io(&url, &e))?;

    let mut session = Session::new().map_err(|e| classify_ssh(&url, e))?;
    session.set_timeout(timeouts.read.as_millis().min(u32::MAX as u128) as u32);
    session.set_tcp_stream(tcp);
    session.handshake().map_err(|e| classify_ssh(&url, e))?;

    let digest = session
        .host_key_hash(target.fingerprint.hash_type())
        .ok_or_else(|| UpdateError::HostKeyMismatch {
            host: target.host.clone(),
            expected: target.fingerprint.to_string(),
            actual: "none".into(),
        })?;
    if !target.fingerprint.matches(digest) {
        return Err(UpdateError::HostKeyMismatch {
            host: target.host.clone(),
            expected: target.fingerprint.to_string(),
            actual: target.fingerprint.render(digest),
        });
    }

    if session.userauth_password(&target.user, &target.password).is_err()
        || !session.authenticated()
    {
        return Err(UpdateError::SftpAuthentication {
            host: target.host.clone(),
        });
    }
    let sftp = session.sftp().map_err(|e| classify_ssh(&url, e))?;
    info!("connected to sftp://{}:{}", target.host, target.port);
    Ok(SftpConnection {
        _session: session,
        sftp,
    })
}

/// SFTP server with a pinned host key. The session is opened on first use,
/// reused afterwards, and dropped after a transport failure.
pub struct SftpTransport {
    target: SftpTarget,
    timeouts: Timeouts,
    connection: Arc<Mutex<Option<SftpConnection>>>,
    cancel: CancellationToken,
}

impl SftpTransport {
    pub fn new(uri: &str, config: &Config, cancel: CancellationToken) -> Result<Self> {
        Ok(SftpTransport {
            target: SftpTarget::parse(uri)?,
            timeouts: Timeouts {
                connect: config.connect_timeout(),
                read: config.response_timeout(),
            },
            connection: Arc::new(Mutex::new(None)),
            cancel,
        })
    }

    /// Run `op` against the shared connection on the blocking pool.
    async fn with_connection<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Sftp) -> Result<T> + Send + 'static,
    {
        let connection = Arc::clone(&self.connection);
        let target = self.target.clone();
        let timeouts = self.timeouts;
        tokio::task::spawn_blocking(move || {
            let mut slot = connection.lock().map_err(|_| UpdateError::Sftp {
                url: target.display_uri(""),
                reason: "connection state poisoned".into(),
            })?;
            let conn = match slot.take() {
                Some(conn) => conn,
                None => connect(&target, timeouts)?,
            };
            let result = op(&conn.sftp);
            match &result {
                Err(e) if e.is_transient() => {
                    debug!("dropping sftp session after: {}", e);
                }
                _ => *slot = Some(conn),
            }
            result
        })
        .await
        .map_err(|e| UpdateError::Sftp {
            url: self.target.display_uri(""),
            reason: format!("sftp worker failed: {e}"),
        })?
    }
}

fn read_io_error(url: &str, err: std::io::Error) -> UpdateError {
    UpdateError::interrupted_io(url, &err)
}

#[async_trait]
impl Transport for SftpTransport {
    async fn fetch_text(&self, path: &str) -> Result<String> {
        let remote = self.target.remote_path(path);
        let url = self.build_uri(path);
        debug!("GET {}", url);
        self.with_connection(move |sftp| {
            let mut file = sftp.open(&remote).map_err(|e| classify_ssh(&url, e))?;
            let mut text = String::new();
            file.read_to_string(&mut text)
                .map_err(|e| read_io_error(&url, e))?;
            Ok(text)
        })
        .await
    }

    async fn download(
        &self,
        path: &str,
        dest: &Path,
        expected_len: Option<u64>,
        on_progress: &DownloadProgress,
    ) -> Result<()> {
        let remote = self.target.remote_path(path);
        let url = self.build_uri(path);
        let dest_path = dest.to_path_buf();
        let cancel = self.cancel.clone();
        let (tx, mut rx) = mpsc::unbounded_channel::<(u64, u64)>();
        debug!("GET {}", url);

        let transfer = self.with_connection(move |sftp| {
            let total = sftp
                .stat(&remote)
                .map_err(|e| classify_ssh(&url, e))?
                .size
                .or(expected_len)
                .unwrap_or(0);
            let mut file = sftp.open(&remote).map_err(|e| classify_ssh(&url, e))?;
            let mut out = std::io::BufWriter::new(
                std::fs::File::create(&dest_path)
                    .io_context(|| format!("failed to create {}", dest_path.display()))?,
            );
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                if cancel.is_cancelled() {
                    return Err(UpdateError::Interrupted);
                }
                let n = file.read(&mut buf).map_err(|e| read_io_error(&url, e))?;
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n])
                    .io_context(|| format!("failed to write {}", dest_path.display()))?;
                let _ = tx.send((n as u64, total));
            }
            out.flush()
                .io_context(|| format!("failed to flush {}", dest_path.display()))?;
            Ok(())
        });
        tokio::pin!(transfer);

        let mut throttle: Option<ReportThrottle<'_>> = None;
        let result = loop {
            tokio::select! {
                Some((n, total)) = rx.recv() => {
                    throttle
                        .get_or_insert_with(|| ReportThrottle::new(on_progress, total))
                        .feed(n);
                }
                result = &mut transfer => break result,
            }
        };
        while let Ok((n, total)) = rx.try_recv() {
            throttle
                .get_or_insert_with(|| ReportThrottle::new(on_progress, total))
                .feed(n);
        }
        if let Some(throttle) = throttle {
            throttle.finish();
        }
        result
    }

    fn build_uri(&self, path: &str) -> String {
        self.target.display_uri(path)
    }

    async fn close(&self) {
        let connection = Arc::clone(&self.connection);
        let _ = tokio::task::spawn_blocking(move || {
            if let Ok(mut slot) = connection.lock() {
                slot.take();
            }
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_uri_with_sha256_fingerprint() {
        let t = SftpTarget::parse("sftp://deploy:pa55:SHA256:q1w2e3r4=@files.example.com:2222/srv/patches/")
            .unwrap();
        assert_eq!(t.user, "deploy");
        assert_eq!(t.password, "pa55");
        assert_eq!(t.fingerprint, Fingerprint::Sha256("q1w2e3r4".into()));
        assert_eq!(t.host, "files.example.com");
        assert_eq!(t.port, 2222);
        assert_eq!(t.base_path, "srv/patches");
        assert_eq!(t.remote_path("versions.txt"), PathBuf::from("srv/patches/versions.txt"));
        assert_eq!(
            t.display_uri("versions.txt"),
            "sftp://deploy@files.example.com:2222/srv/patches/versions.txt"
        );
    }

    #[test]
    fn parses_uri_with_md5_fingerprint_and_no_path() {
        let t = SftpTarget::parse("sftp://u:p:AB:cd:EF@10.1.1.1:22").unwrap();
        assert_eq!(t.fingerprint, Fingerprint::Md5("abcdef".into()));
        assert_eq!(t.base_path, "");
        assert_eq!(t.remote_path("a.txt"), PathBuf::from("a.txt"));
    }

    #[test]
    fn rejects_malformed_uri() {
        assert!(matches!(
            SftpTarget::parse("sftp://user@host"),
            Err(UpdateError::InvalidServerUri { .. })
        ));
    }

    #[test]
    fn fingerprints_compare_against_raw_digests() {
        let digest = [0xabu8, 0xcd, 0xef, 0x01];
        let md5 = Fingerprint::parse("AB:CD:EF:01");
        assert!(md5.matches(&digest));
        assert_eq!(md5.render(&digest), "ab:cd:ef:01");

        let sha = Fingerprint::parse(&format!("SHA256:{}=", STANDARD_NO_PAD.encode(digest)));
        assert!(sha.matches(&digest));
        assert!(!sha.matches(&[0u8; 4]));
    }
}
