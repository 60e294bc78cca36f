use std::fs::File;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::binary_patch;
use crate::container::PatchContainer;
use crate::error::{IoContext, Result, UpdateError};
use crate::hashing::{sha1_file, HashingWriter};
use crate::metadata::{ModificationMode, NewFileEntry};
use crate::progress::{per_mille, IntervalTimer, ProgressSink};
use crate::util;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ApplySummary {
    pub emptied: usize,
    pub filled: usize,
    pub modified: usize,
    pub skipped: usize,
}

/// What happened to a single entry during the first pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
    /// Truncated in place; nothing to promote.
    Emptied,
    /// New content waits in a temp file next to the destination.
    Staged { mode: ModificationMode },
    /// Left untouched.
    Skipped { reason: String },
}

/// Temp files written during the first pass, removed on drop unless promoted.
#[derive(Default)]
struct Staging {
    files: Vec<(PathBuf, PathBuf)>,
}

impl Staging {
    fn promote(&mut self) -> Result<()> {
        let files = std::mem::take(&mut self.files);
        for (n, (temp, dest)) in files.iter().enumerate() {
            if let Err(e) = std::fs::rename(temp, dest) {
                self.files = files[n..].to_vec();
                return Err(UpdateError::Io {
                    context: format!("failed to move {} into place", dest.display()),
                    source: e,
                });
            }
        }
        Ok(())
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        for (temp, _) in &self.files {
            if let Err(e) = std::fs::remove_file(temp) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("failed to remove temp file {}: {}", temp.display(), e);
                }
            }
        }
    }
}

/// Apply every entry of a version under `root`.
///
/// Pass one writes Fill and Modify results into temp files; pass two renames
/// them over their destinations. Any failure in pass one leaves every
/// destination untouched apart from Empty entries already truncated.
pub fn apply_files(
    root: &Path,
    version: &str,
    entries: &[NewFileEntry],
    container: &mut PatchContainer,
    cancel: &CancellationToken,
    progress: Option<&dyn ProgressSink>,
) -> Result<ApplySummary> {
    let mut summary = ApplySummary::default();
    let mut staging = Staging::default();
    let mut timer = IntervalTimer::new(Duration::from_millis(150));
    let total = entries.len() as u64;

    for (idx, entry) in entries.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(UpdateError::Interrupted);
        }
        if let Some(sink) = progress {
            if timer.tick() {
                sink.set_progress_text(&format!("{}/{}  {}", idx + 1, total, entry.path));
                sink.set_progress(per_mille(idx as u64, total));
            }
        }

        let dest = util::resolve_under(root, &entry.path);
        match apply_entry(&dest, version, entry, container, &mut staging)? {
            EntryOutcome::Emptied => summary.emptied += 1,
            EntryOutcome::Staged {
                mode: ModificationMode::Modify,
            } => summary.modified += 1,
            EntryOutcome::Staged { .. } => summary.filled += 1,
            EntryOutcome::Skipped { reason } => {
                debug!("skipped {}: {}", entry.path, reason);
                summary.skipped += 1;
            }
        }
    }

    staging.promote()?;
    if let Some(sink) = progress {
        sink.set_progress(1000);
    }
    info!(
        "version {}: {} emptied, {} filled, {} modified, {} skipped",
        version, summary.emptied, summary.filled, summary.modified, summary.skipped
    );
    Ok(summary)
}

fn apply_entry(
    dest: &Path,
    version: &str,
    entry: &NewFileEntry,
    container: &mut PatchContainer,
    staging: &mut Staging,
) -> Result<EntryOutcome> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .io_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    match entry.mode {
        ModificationMode::Empty => {
            if dest.is_file() {
                std::fs::remove_file(dest)
                    .io_context(|| format!("failed to remove {}", dest.display()))?;
            }
            File::create(dest).io_context(|| format!("failed to create {}", dest.display()))?;
            Ok(EntryOutcome::Emptied)
        }
        ModificationMode::Fill => {
            if dest.is_file() && sha1_file(dest)?.eq_ignore_ascii_case(&entry.new_hash) {
                return Ok(EntryOutcome::Skipped {
                    reason: "already up to date".into(),
                });
            }
            let temp = stage(dest, staging);
            let mut payload = container.open_entry(version, entry)?;
            write_verified(&temp, version, entry, |out| io::copy(&mut payload, out))?;
            Ok(EntryOutcome::Staged {
                mode: ModificationMode::Fill,
            })
        }
        ModificationMode::Modify => {
            if !dest.is_file() {
                warn!("{} does not exist, skipping its diff", entry.path);
                return Ok(EntryOutcome::Skipped {
                    reason: "base file missing".into(),
                });
            }
            let local = sha1_file(dest)?;
            if !local.eq_ignore_ascii_case(&entry.old_hash) {
                warn!(
                    "{} was modified locally (hash {}, expected {}), skipping its diff",
                    entry.path, local, entry.old_hash
                );
                return Ok(EntryOutcome::Skipped {
                    reason: "base file drifted".into(),
                });
            }

            let len = std::fs::metadata(dest)
                .io_context(|| format!("failed to stat {}", dest.display()))?
                .len();
            let mapped = if len == 0 {
                None
            } else {
                Some(
                    util::mmap_file(dest)
                        .io_context(|| format!("failed to map {}", dest.display()))?,
                )
            };
            let old: &[u8] = mapped.as_deref().unwrap_or(&[]);

            let temp = stage(dest, staging);
            let mut diff = container.open_entry(version, entry)?;
            write_verified(&temp, version, entry, |out| {
                let n = binary_patch::apply_patch(old, &mut diff, out)?;
                // Reach end of stream so the payload hashes get checked.
                io::copy(&mut diff, &mut io::sink())?;
                Ok(n)
            })?;
            Ok(EntryOutcome::Staged {
                mode: ModificationMode::Modify,
            })
        }
    }
}

fn stage(dest: &Path, staging: &mut Staging) -> PathBuf {
    let temp = util::temporal_path(dest);
    staging.files.push((temp.clone(), dest.to_path_buf()));
    temp
}

/// Create `temp`, fill it through `write`, and check the result against the
/// entry's `new_hash`.
fn write_verified<F>(temp: &Path, version: &str, entry: &NewFileEntry, write: F) -> Result<()>
where
    F: FnOnce(&mut HashingWriter<BufWriter<File>>) -> io::Result<u64>,
{
    let file = File::create(temp)
        .io_context(|| format!("failed to create temp file {}", temp.display()))?;
    let mut out = HashingWriter::new(BufWriter::with_capacity(256 * 1024, file));
    write(&mut out).map_err(|e| UpdateError::from_entry_io(version, &entry.path, e))?;
    let (_, digest) = out
        .finish()
        .io_context(|| format!("failed to flush {}", temp.display()))?;
    if !digest.eq_ignore_ascii_case(&entry.new_hash) {
        return Err(UpdateError::corrupted(
            version,
            format!(
                "{}: result hash is {}, expected {}",
                entry.path, digest, entry.new_hash
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary_diff::diff_to_vec;
    use crate::hashing::sha1_bytes;
    use bzip2::write::BzEncoder;
    use bzip2::Compression;
    use std::io::Write;

    /// Builds a blob container on disk from (path, mode, old, new) tuples.
    struct BlobFixture {
        blob: Vec<u8>,
        entries: Vec<NewFileEntry>,
    }

    impl BlobFixture {
        fn new() -> Self {
            BlobFixture {
                blob: Vec::new(),
                entries: Vec::new(),
            }
        }

        fn push(&mut self, path: &str, mode: ModificationMode, old: &[u8], new: &[u8]) {
            let payload = match mode {
                ModificationMode::Empty => Vec::new(),
                ModificationMode::Fill => new.to_vec(),
                ModificationMode::Modify => diff_to_vec(old, new),
            };
            let block = if mode.has_data() {
                let mut enc = BzEncoder::new(Vec::new(), Compression::best());
                enc.write_all(&payload).unwrap();
                enc.finish().unwrap()
            } else {
                Vec::new()
            };
            self.entries.push(NewFileEntry {
                path: path.into(),
                mode,
                old_hash: if mode == ModificationMode::Modify {
                    sha1_bytes(old)
                } else {
                    String::new()
                },
                new_hash: sha1_bytes(new),
                raw_hash: sha1_bytes(&payload),
                block_hash: sha1_bytes(&block),
                block_offset: self.blob.len() as u64,
                block_length: block.len() as u64,
                raw_length: payload.len() as u64,
            });
            self.blob.extend_from_slice(&block);
        }

        fn open(&self, dir: &Path) -> PatchContainer {
            let path = dir.join("blob.bin");
            std::fs::write(&path, &self.blob).unwrap();
            PatchContainer::open_blob(&path).unwrap()
        }
    }

    fn content(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(seed).wrapping_add((i >> 3) as u8)).collect()
    }

    fn run(root: &Path, fixture: &BlobFixture, work: &Path) -> Result<ApplySummary> {
        let mut container = fixture.open(work);
        apply_files(
            root,
            "1",
            &fixture.entries,
            &mut container,
            &CancellationToken::new(),
            None,
        )
    }

    #[test]
    fn fill_modify_and_empty_are_applied() {
        let root = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let old = content(20_000, 7);
        let mut new = old.clone();
        new[10_000..10_100].fill(0xEE);
        std::fs::write(root.path().join("big.dat"), &old).unwrap();
        std::fs::write(root.path().join("log.txt"), b"to be emptied").unwrap();

        let mut fixture = BlobFixture::new();
        fixture.push("mods/new.jar", ModificationMode::Fill, b"", b"fresh jar");
        fixture.push("big.dat", ModificationMode::Modify, &old, &new);
        fixture.push("log.txt", ModificationMode::Empty, b"", b"");

        let summary = run(root.path(), &fixture, work.path()).unwrap();
        assert_eq!(
            summary,
            ApplySummary {
                emptied: 1,
                filled: 1,
                modified: 1,
                skipped: 0
            }
        );
        assert_eq!(std::fs::read(root.path().join("mods/new.jar")).unwrap(), b"fresh jar");
        assert_eq!(std::fs::read(root.path().join("big.dat")).unwrap(), new);
        assert!(std::fs::read(root.path().join("log.txt")).unwrap().is_empty());
        assert!(!root.path().join("big.dat.mcpatch-temporal.bin").exists());
    }

    #[test]
    fn fill_with_matching_content_is_skipped() {
        let root = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("a.txt"), b"same").unwrap();
        let mut fixture = BlobFixture::new();
        fixture.push("a.txt", ModificationMode::Fill, b"", b"same");
        let summary = run(root.path(), &fixture, work.path()).unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.filled, 0);
    }

    #[test]
    fn drifted_base_is_skipped() {
        let root = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("a.bin"), b"locally edited").unwrap();
        let mut fixture = BlobFixture::new();
        fixture.push("a.bin", ModificationMode::Modify, b"original", b"updated");
        fixture.push("missing.bin", ModificationMode::Modify, b"original", b"updated");
        let summary = run(root.path(), &fixture, work.path()).unwrap();
        assert_eq!(summary.skipped, 2);
        assert_eq!(std::fs::read(root.path().join("a.bin")).unwrap(), b"locally edited");
        assert!(!root.path().join("missing.bin").exists());
    }

    #[test]
    fn corrupt_block_leaves_originals_untouched() {
        let root = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("a.txt"), b"old a").unwrap();
        std::fs::write(root.path().join("b.txt"), b"old b").unwrap();
        let mut fixture = BlobFixture::new();
        fixture.push("a.txt", ModificationMode::Fill, b"", &content(5000, 3));
        fixture.push("b.txt", ModificationMode::Fill, b"", &content(5000, 5));
        let tail = fixture.entries[1].block_offset as usize + 20;
        fixture.blob[tail] ^= 0x40;

        let err = run(root.path(), &fixture, work.path()).unwrap_err();
        assert!(matches!(err, UpdateError::PatchCorrupted { .. }), "{err}");
        assert_eq!(std::fs::read(root.path().join("a.txt")).unwrap(), b"old a");
        assert_eq!(std::fs::read(root.path().join("b.txt")).unwrap(), b"old b");
        assert!(!root.path().join("a.txt.mcpatch-temporal.bin").exists());
        assert!(!root.path().join("b.txt.mcpatch-temporal.bin").exists());
    }

    #[test]
    fn corrupt_diff_block_leaves_base_untouched() {
        let root = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let old = content(20_000, 7);
        let mut new = old.clone();
        new[5_000..5_050].fill(0x11);
        std::fs::write(root.path().join("big.dat"), &old).unwrap();

        let mut fixture = BlobFixture::new();
        fixture.push("big.dat", ModificationMode::Modify, &old, &new);
        let middle = fixture.entries[0].block_length as usize / 2;
        fixture.blob[middle] ^= 0x08;

        let err = run(root.path(), &fixture, work.path()).unwrap_err();
        assert!(
            matches!(err, UpdateError::PatchCorrupted { ref subject, .. } if subject.starts_with("big.dat")),
            "{err}"
        );
        assert_eq!(std::fs::read(root.path().join("big.dat")).unwrap(), old);
        assert!(!root.path().join("big.dat.mcpatch-temporal.bin").exists());
    }

    #[test]
    fn cancellation_stops_between_entries() {
        let root = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let mut fixture = BlobFixture::new();
        fixture.push("a.txt", ModificationMode::Fill, b"", b"a");
        let mut container = fixture.open(work.path());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = apply_files(root.path(), "1", &fixture.entries, &mut container, &cancel, None)
            .unwrap_err();
        assert!(matches!(err, UpdateError::Interrupted));
        assert!(!root.path().join("a.txt").exists());
    }
}
