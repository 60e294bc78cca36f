use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::apply::{apply_files, ApplySummary};
use crate::config::{Config, Layout, PatchFormat};
use crate::container::{verify_blob, PatchContainer};
use crate::error::{IoContext, Result, RunError, UpdateError};
use crate::metadata::{NewFileEntry, VersionMetadata};
use crate::progress::{download_text, per_mille, ProgressSink, SpeedSampler};
use crate::servers::Servers;
use crate::util;
use crate::version::{parse_version_list, resolve_missing, VersionMarker};

/// Drives a whole update: resolve the missing versions, then fetch and apply
/// them one by one, committing the marker after each.
pub struct UpdateEngine {
    config: Config,
    layout: Layout,
    servers: Servers,
    progress: Option<Arc<dyn ProgressSink>>,
    cancel: CancellationToken,
}

/// Handle of an engine running on its own task.
pub struct UpdateTask {
    cancel: CancellationToken,
    handle: JoinHandle<std::result::Result<usize, RunError>>,
}

impl UpdateTask {
    /// Ask the engine to stop at the next cancellation point.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> std::result::Result<usize, RunError> {
        self.handle.await.map_err(|e| RunError {
            applied: 0,
            error: UpdateError::Io {
                context: "update task failed".into(),
                source: io::Error::other(e),
            },
        })?
    }
}

impl UpdateEngine {
    /// Build an engine whose sources come from `config.server`.
    pub fn new(
        config: Config,
        layout: Layout,
        progress: Option<Arc<dyn ProgressSink>>,
    ) -> Result<Self> {
        config.validate()?;
        let cancel = CancellationToken::new();
        let servers = Servers::from_config(&config, &cancel)?;
        Ok(Self::with_servers(config, layout, servers, progress, cancel))
    }

    /// Build an engine over already constructed sources.
    pub fn with_servers(
        config: Config,
        layout: Layout,
        servers: Servers,
        progress: Option<Arc<dyn ProgressSink>>,
        cancel: CancellationToken,
    ) -> Self {
        UpdateEngine {
            config,
            layout,
            servers,
            progress,
            cancel,
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run on a separate task.
    pub fn spawn(self) -> UpdateTask {
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move { self.run().await });
        UpdateTask { cancel, handle }
    }

    /// Apply every missing version. Returns how many were applied.
    ///
    /// Cancellation is not an error: it yields `Ok(0)`. Versions committed
    /// before a failure stay committed and are counted in the [`RunError`].
    pub async fn run(&self) -> std::result::Result<usize, RunError> {
        let mut committed = Vec::new();
        let result = self.run_versions(&mut committed).await;
        self.servers.close().await;
        self.show_changelogs(&committed);
        let applied = committed.len();
        match result {
            Ok(()) => Ok(applied),
            Err(UpdateError::Interrupted) => {
                info!("update interrupted after {} version(s)", applied);
                Ok(0)
            }
            Err(error) => Err(RunError { applied, error }),
        }
    }

    /// Apply the missing versions, pushing `(version, change log)` for each
    /// one committed.
    async fn run_versions(&self, committed: &mut Vec<(String, String)>) -> Result<()> {
        self.label("Checking for updates");
        let marker = VersionMarker::load(&self.layout.marker_file)?;
        let current = marker.as_ref().map(|m| m.version.as_str());
        let list = self
            .servers
            .fetch_text(&self.config.server_versions_file_name)
            .await?;
        let all = parse_version_list(&list);
        let missing = resolve_missing(current, &all, self.config.auto_restart_version)?;

        if missing.is_empty() {
            info!("already up to date ({})", current.unwrap_or("none"));
            self.label("Already up to date");
            return Ok(());
        }
        info!(
            "local version {}, {} version(s) to apply: {}",
            current.unwrap_or("none"),
            missing.len(),
            missing.join(", ")
        );

        let encoded = marker.as_ref().is_some_and(|m| m.encoded);
        std::fs::create_dir_all(&self.layout.update_dir).io_context(|| {
            format!("failed to create {}", self.layout.update_dir.display())
        })?;

        for version in &missing {
            let span = info_span!("version", %version);
            let change_log = self.apply_version(version, encoded).instrument(span).await?;
            committed.push((version.to_string(), change_log));
        }
        self.label("Update finished");
        Ok(())
    }

    /// Apply and commit one version, returning its change log.
    async fn apply_version(&self, version: &str, encoded: bool) -> Result<String> {
        self.label(&format!("Updating to {version}"));
        // Holds the downloaded container until the version is applied.
        let staged: NamedTempFile;

        let (meta, container) = match self.config.patch_format {
            PatchFormat::Blob => {
                info!("fetching blob patch");
                let meta_name = format!("{version}.mc-patch.json");
                let text = self.servers.fetch_text(&meta_name).await?;
                let mut meta = VersionMetadata::from_blob_json(&meta_name, &text)?;
                meta.validate_blob_layout(version)?;
                self.guard(&mut meta);
                self.log_metadata(&meta);
                self.apply_tree_changes(&meta)?;

                if meta.new_files.is_empty() {
                    (meta, None)
                } else if !meta.new_files.iter().any(|e| e.mode.has_data()) {
                    debug!("no stored blocks, skipping the patch download");
                    (meta, Some(PatchContainer::Blockless))
                } else {
                    staged = temp_file()?;
                    let blob = staged.path();
                    self.download(&format!("{version}.mc-patch.bin"), blob, meta.patch_length)
                        .await?;
                    verify_blob(blob, version, &meta)?;
                    let container = PatchContainer::open_blob(blob)?;
                    (meta, Some(container))
                }
            }
            PatchFormat::Archive => {
                info!("fetching archive patch");
                staged = temp_file()?;
                let archive = staged.path();
                self.download(&format!("{version}.mcpatch.zip"), archive, None)
                    .await?;
                let (container, mut meta) = PatchContainer::open_archive(archive, version)?;
                self.guard(&mut meta);
                self.log_metadata(&meta);
                self.apply_tree_changes(&meta)?;
                (meta, Some(container))
            }
        };

        if let Some(container) = container {
            if !meta.new_files.is_empty() {
                self.apply_entries(version, meta.new_files.clone(), container)
                    .await?;
            }
        }

        VersionMarker::new(version, encoded).store(&self.layout.marker_file)?;
        info!("version {} applied", version);
        Ok(meta.change_log)
    }

    async fn apply_entries(
        &self,
        version: &str,
        entries: Vec<NewFileEntry>,
        mut container: PatchContainer,
    ) -> Result<ApplySummary> {
        self.label(&format!("Applying files of {version}"));
        let root = self.layout.update_dir.clone();
        let cancel = self.cancel.clone();
        let progress = self.progress.clone();
        let version_owned = version.to_string();
        let span = tracing::Span::current();
        tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            apply_files(
                &root,
                &version_owned,
                &entries,
                &mut container,
                &cancel,
                progress.as_deref(),
            )
        })
        .await
        .map_err(|e| UpdateError::Io {
            context: format!("failed to apply version {version}"),
            source: io::Error::other(e),
        })?
    }

    async fn download(&self, name: &str, dest: &Path, expected_len: Option<u64>) -> Result<()> {
        let sink = self.progress.clone();
        let sampler = Mutex::new(SpeedSampler::default());
        let report = move |chunk: u64, done: u64, total: u64| {
            let Some(sink) = &sink else {
                return;
            };
            let speed = match sampler.lock() {
                Ok(mut sampler) => {
                    sampler.sample(chunk);
                    sampler.speed()
                }
                Err(_) => 0,
            };
            sink.set_progress_text(&download_text(done, total, speed));
            sink.set_progress(per_mille(done, total));
        };
        self.servers.download(name, dest, expected_len, &report).await
    }

    /// Keep the running executable and the active log file out of the change set.
    fn guard(&self, meta: &mut VersionMetadata) {
        if let Some(exe) = self.layout.executable.as_deref().and_then(|p| self.relative(p)) {
            let before = meta.new_files.len();
            meta.new_files.retain(|e| e.path != exe);
            if meta.old_files.remove(&exe) || meta.new_files.len() != before {
                warn!("skipping changes to the running executable {}", exe);
            }
        }
        if let Some(log) = self.layout.log_file.as_deref().and_then(|p| self.relative(p)) {
            let before = (meta.move_files.len(), meta.new_files.len());
            meta.move_files.retain(|m| m.from != log && m.to != log);
            meta.new_files.retain(|e| e.path != log);
            let removed = meta.old_files.remove(&log);
            if removed || before != (meta.move_files.len(), meta.new_files.len()) {
                warn!("skipping changes to the active log file {}", log);
            }
        }
    }

    /// `path` relative to the update directory, if it lies inside it.
    fn relative(&self, path: &Path) -> Option<String> {
        let root = &self.layout.update_dir;
        let (root, path): (PathBuf, PathBuf) =
            match (std::fs::canonicalize(root), std::fs::canonicalize(path)) {
                (Ok(root), Ok(path)) => (root, path),
                _ => (util::absolutize(root).ok()?, util::absolutize(path).ok()?),
            };
        let rel = path.strip_prefix(&root).ok()?;
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        (!parts.is_empty()).then(|| parts.join("/"))
    }

    fn log_metadata(&self, meta: &VersionMetadata) {
        for path in &meta.old_files {
            debug!("old file: {}", path);
        }
        for path in &meta.old_folders {
            debug!("old folder: {}", path);
        }
        for path in &meta.new_folders {
            debug!("new folder: {}", path);
        }
        for mv in &meta.move_files {
            debug!("move: {} -> {}", mv.from, mv.to);
        }
        for entry in &meta.new_files {
            debug!("new file: {} ({})", entry.path, entry.mode);
        }
    }

    fn apply_tree_changes(&self, meta: &VersionMetadata) -> Result<()> {
        let root = &self.layout.update_dir;

        for mv in &meta.move_files {
            let from = util::resolve_under(root, &mv.from);
            let to = util::resolve_under(root, &mv.to);
            if !from.exists() {
                debug!("move source {} is missing", mv.from);
                continue;
            }
            if let Some(parent) = to.parent() {
                std::fs::create_dir_all(parent)
                    .io_context(|| format!("failed to create {}", parent.display()))?;
            }
            std::fs::rename(&from, &to)
                .io_context(|| format!("failed to move {} to {}", mv.from, mv.to))?;
        }

        for file in &meta.old_files {
            let path = util::resolve_under(root, file);
            ignore_missing(std::fs::remove_file(&path))
                .io_context(|| format!("failed to delete {}", path.display()))?;
        }

        let mut folders: Vec<String> = meta.old_folders.iter().cloned().collect();
        util::sort_dirs_deepest_first(&mut folders);
        for folder in &folders {
            let path = util::resolve_under(root, folder);
            ignore_missing(std::fs::remove_dir_all(&path))
                .io_context(|| format!("failed to delete {}", path.display()))?;
        }

        for folder in &meta.new_folders {
            let path = util::resolve_under(root, folder);
            std::fs::create_dir_all(&path)
                .io_context(|| format!("failed to create {}", path.display()))?;
        }
        Ok(())
    }

    /// Surface the change logs of every committed version at once.
    fn show_changelogs(&self, committed: &[(String, String)]) {
        let Some(text) = combine_changelogs(committed) else {
            return;
        };
        match (&self.progress, committed.last()) {
            (Some(sink), Some((latest, _))) if self.config.show_changelogs => {
                sink.show_changelog(latest, &text)
            }
            _ => {
                for line in text.lines() {
                    info!("{}", line);
                }
            }
        }
    }

    fn label(&self, text: &str) {
        if let Some(sink) = &self.progress {
            sink.set_label(text);
        }
    }
}

/// Join non-empty change logs, oldest first, each under a
/// `========== version ==========` banner.
fn combine_changelogs(committed: &[(String, String)]) -> Option<String> {
    let sections: Vec<String> = committed
        .iter()
        .filter(|(_, text)| !text.trim().is_empty())
        .map(|(version, text)| format!("========== {version} ==========\n{}", text.trim_end()))
        .collect();
    (!sections.is_empty()).then(|| sections.join("\n\n"))
}

fn temp_file() -> Result<NamedTempFile> {
    tempfile::Builder::new()
        .prefix("mcpatch-")
        .tempfile()
        .io_context(|| "failed to create a temporary download file")
}

fn ignore_missing(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Build an engine from `config` and run it to completion.
pub async fn run(
    config: Config,
    layout: Layout,
    progress: Option<Arc<dyn ProgressSink>>,
) -> std::result::Result<usize, RunError> {
    let engine =
        UpdateEngine::new(config, layout, progress).map_err(|error| RunError { applied: 0, error })?;
    engine.run().await
}
