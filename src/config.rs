use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{IoContext, Result, UpdateError};

/// Container layout published for each version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchFormat {
    /// `<v>.mc-patch.json` plus a contiguous `<v>.mc-patch.bin`.
    #[default]
    Blob,
    /// A single `<v>.mcpatch.zip` carrying its own metadata.
    Archive,
}

impl std::str::FromStr for PatchFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "blob" => Ok(PatchFormat::Blob),
            "archive" => Ok(PatchFormat::Archive),
            other => Err(format!("unknown patch format '{other}' (expected blob or archive)")),
        }
    }
}

/// Client configuration, normally read from a TOML file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    /// Server URIs, tried in order.
    #[serde(deserialize_with = "one_or_many")]
    pub server: Vec<String>,
    pub client_user_agent: String,
    pub http_headers: BTreeMap<String, String>,
    pub show_changelogs: bool,
    /// Marker file name, relative to the update directory.
    pub version_file: String,
    /// Sub-directory of the update directory that versions apply to.
    pub base_path: String,
    /// Milliseconds.
    pub http_connect_timeout: u64,
    /// Milliseconds.
    pub http_response_timeout: u64,
    pub retry_times: u32,
    /// Milliseconds.
    pub retry_delay: u64,
    pub auto_restart_version: bool,
    pub concurrent_threads: usize,
    pub concurrent_block_size: u64,
    pub server_versions_file_name: String,
    pub ignore_https_certificate: bool,
    pub http_fallback_file_size: u64,
    pub patch_format: PatchFormat,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: Vec::new(),
            client_user_agent: format!("mcpatch/{}", env!("CARGO_PKG_VERSION")),
            http_headers: BTreeMap::new(),
            show_changelogs: true,
            version_file: "mc-patch-version.txt".into(),
            base_path: String::new(),
            http_connect_timeout: 3000,
            http_response_timeout: 2000,
            retry_times: 5,
            retry_delay: 1000,
            auto_restart_version: true,
            concurrent_threads: 4,
            concurrent_block_size: 4 * 1024 * 1024,
            server_versions_file_name: "versions.txt".into(),
            ignore_https_certificate: false,
            http_fallback_file_size: 1024 * 1024 * 1024,
            patch_format: PatchFormat::Blob,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

fn one_or_many<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Vec<String>, D::Error> {
    Ok(match OneOrMany::deserialize(d)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text).map_err(|e| UpdateError::Metadata {
            name: "configuration".into(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .io_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        let servers: Vec<&String> = self.server.iter().filter(|s| !s.trim().is_empty()).collect();
        if servers.is_empty() {
            return Err(UpdateError::config("server", "at least one server uri is required"));
        }
        if self.retry_times == 0 {
            return Err(UpdateError::config("retry-times", "must be at least 1"));
        }
        if self.concurrent_threads == 0 {
            return Err(UpdateError::config("concurrent-threads", "must be at least 1"));
        }
        if self.concurrent_block_size == 0 {
            return Err(UpdateError::config("concurrent-block-size", "must be positive"));
        }
        if self.version_file.trim().is_empty() {
            return Err(UpdateError::config("version-file", "must not be empty"));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.http_connect_timeout)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.http_response_timeout)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay)
    }
}

/// Resolved filesystem locations for one run.
#[derive(Debug, Clone)]
pub struct Layout {
    /// Root the versions apply to (`base_path` already joined).
    pub update_dir: PathBuf,
    pub marker_file: PathBuf,
    /// The running executable, protected from modification.
    pub executable: Option<PathBuf>,
    /// The active log file, protected from modification.
    pub log_file: Option<PathBuf>,
}

impl Layout {
    /// Derive the layout from a working directory and the configuration.
    pub fn new(work_dir: &Path, config: &Config) -> Self {
        let update_dir = if config.base_path.is_empty() {
            work_dir.to_path_buf()
        } else {
            work_dir.join(&config.base_path)
        };
        Layout {
            marker_file: work_dir.join(&config.version_file),
            update_dir,
            executable: None,
            log_file: None,
        }
    }

    pub fn with_executable(mut self, exe: impl Into<PathBuf>) -> Self {
        self.executable = Some(exe.into());
        self
    }

    pub fn with_log_file(mut self, log: impl Into<PathBuf>) -> Self {
        self.log_file = Some(log.into());
        self
    }
}
