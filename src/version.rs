use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::io::Write;
use std::path::Path;

use crate::error::{IoContext, Result, UpdateError};

/// Parse a newline-delimited version list. Blank lines and `\r` are ignored.
pub fn parse_version_list(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| line.trim_end_matches('\r').trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Versions the local installation still has to apply, oldest first.
pub fn resolve_missing(
    current: Option<&str>,
    all: &[String],
    auto_restart: bool,
) -> Result<Vec<String>> {
    let Some(latest) = all.last() else {
        return Err(UpdateError::InvalidVersion("server version list is empty".into()));
    };
    let Some(current) = current else {
        return Ok(all.to_vec());
    };
    if current == latest {
        return Ok(Vec::new());
    }
    match all.iter().position(|v| v == current) {
        Some(idx) => Ok(all[idx + 1..].to_vec()),
        None if auto_restart => {
            tracing::warn!(
                "local version {} is unknown to the server, reapplying every version",
                current
            );
            Ok(all.to_vec())
        }
        None => Err(UpdateError::InvalidVersion(format!(
            "local version {current} is not in the server version list"
        ))),
    }
}

const ENCODED_PREFIX: char = ':';

/// The persisted local version, remembering whether it was stored encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMarker {
    pub version: String,
    pub encoded: bool,
}

impl VersionMarker {
    pub fn new(version: impl Into<String>, encoded: bool) -> Self {
        VersionMarker {
            version: version.into(),
            encoded,
        }
    }

    /// Decode a marker file's content.
    pub fn decode(text: &str) -> Result<Self> {
        let text = text.trim();
        match text.strip_prefix(ENCODED_PREFIX) {
            Some(payload) => {
                let bytes = STANDARD
                    .decode(payload)
                    .map_err(|_| UpdateError::InvalidVersionMarker(text.to_string()))?;
                let version = String::from_utf8(bytes)
                    .map_err(|_| UpdateError::InvalidVersionMarker(text.to_string()))?;
                Ok(VersionMarker::new(version, true))
            }
            None => Ok(VersionMarker::new(text, false)),
        }
    }

    pub fn encode(&self) -> String {
        if self.encoded {
            format!("{ENCODED_PREFIX}{}", STANDARD.encode(self.version.as_bytes()))
        } else {
            self.version.clone()
        }
    }

    /// Read the marker; `None` when the file does not exist or is blank.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        match std::fs::read_to_string(path) {
            Ok(text) if text.trim().is_empty() => Ok(None),
            Ok(text) => Self::decode(&text).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(UpdateError::Io {
                context: format!("failed to read version file {}", path.display()),
                source: e,
            }),
        }
    }

    /// Persist the marker through a sibling temp file and a rename.
    pub fn store(&self, path: &Path) -> Result<()> {
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        std::fs::create_dir_all(dir)
            .io_context(|| format!("failed to create {}", dir.display()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .io_context(|| format!("failed to stage version file in {}", dir.display()))?;
        tmp.write_all(self.encode().as_bytes())
            .io_context(|| "failed to write version file")?;
        tmp.as_file()
            .sync_all()
            .io_context(|| "failed to flush version file")?;
        tmp.persist(path).map_err(|e| UpdateError::Io {
            context: format!("failed to replace version file {}", path.display()),
            source: e.error,
        })?;
        Ok(())
    }
}
