use anyhow::{bail, Context, Result};
use bzip2::write::BzEncoder;
use bzip2::Compression;
use rayon::prelude::*;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::binary_diff;
use crate::config::PatchFormat;
use crate::hashing::{sha1_bytes, sha1_file, HashingWriter};
use crate::metadata::{ModificationMode, NewFileEntry, VersionMetadata, ARCHIVE_META_ENTRY};
use crate::util::{self, DirEntry, EntryKind};
use crate::version::parse_version_list;

/// Name of the version list written next to the published files.
pub const VERSION_LIST: &str = "versions.txt";

/// What a publish run produced.
#[derive(Debug, Default)]
pub struct PublishSummary {
    pub folders_created: usize,
    pub folders_deleted: usize,
    pub files_deleted: usize,
    pub files_filled: usize,
    pub files_modified: usize,
    pub files_emptied: usize,
    pub files_unchanged: usize,
    /// Total bytes of compressed payload.
    pub payload_bytes: u64,
    pub outputs: Vec<PathBuf>,
}

/// Returns true for file types that are already compressed or otherwise incompressible,
/// where computing a binary diff would yield no meaningful savings.
fn is_incompressible(path: &Path) -> bool {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    matches!(
        ext.as_deref(),
        Some(
            // Images
            "jpg" | "jpeg" | "png" | "gif" | "webp" | "ico" | "avif"
            // Audio and video
            | "mp4" | "mkv" | "webm" | "mp3" | "ogg" | "opus" | "flac"
            // Archives, including zip-based containers
            | "zip" | "jar" | "gz" | "bz2" | "xz" | "zst" | "7z" | "rar"
            // Other
            | "pdf" | "woff" | "woff2"
        )
    )
}

/// A file of the new tree that has to be written.
struct Candidate {
    rel_path: String,
    new_path: PathBuf,
    new_size: u64,
    /// Present when the old tree has a file at the same path.
    old: Option<(PathBuf, u64)>,
}

/// A new-file entry with its compressed block, before offsets are assigned.
struct Prepared {
    entry: NewFileEntry,
    block: Vec<u8>,
}

fn compress(payload: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = BzEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(payload).context("Failed to compress payload")?;
    encoder.finish().context("Failed to finish bzip2 stream")
}

fn empty_entry(rel_path: &str) -> NewFileEntry {
    NewFileEntry {
        path: rel_path.to_string(),
        mode: ModificationMode::Empty,
        old_hash: String::new(),
        new_hash: sha1_bytes(b""),
        raw_hash: String::new(),
        block_hash: String::new(),
        block_offset: 0,
        block_length: 0,
        raw_length: 0,
    }
}

/// Hash, diff and compress one candidate. `None` means the file did not change.
fn prepare(candidate: &Candidate) -> Result<Option<Prepared>> {
    if candidate.new_size == 0 {
        if candidate.old.as_ref().is_some_and(|(_, size)| *size == 0) {
            return Ok(None);
        }
        return Ok(Some(Prepared {
            entry: empty_entry(&candidate.rel_path),
            block: Vec::new(),
        }));
    }

    let new_hash = sha1_file(&candidate.new_path)?;
    let old_hash = match &candidate.old {
        Some((old_path, old_size)) if *old_size > 0 => {
            let old_hash = sha1_file(old_path)?;
            if old_hash == new_hash {
                return Ok(None);
            }
            Some((old_path, old_hash))
        }
        _ => None,
    };

    let new_data = util::mmap_file(&candidate.new_path)
        .with_context(|| format!("Failed to map {}", candidate.new_path.display()))?;

    let fill_block = compress(&new_data)?;
    let modify = match old_hash {
        Some((old_path, old_hash)) if !is_incompressible(&candidate.new_path) => {
            let old_data = util::mmap_file(old_path)
                .with_context(|| format!("Failed to map {}", old_path.display()))?;
            let diff = binary_diff::diff_to_vec(&old_data, &new_data);
            let diff_block = compress(&diff)?;
            // The raw diff is never smaller than the file; compressed sizes decide.
            (diff_block.len() < fill_block.len()).then_some((old_hash, diff, diff_block))
        }
        _ => None,
    };

    let (mode, old_hash, diff, block) = match modify {
        Some((old_hash, diff, block)) => (ModificationMode::Modify, old_hash, Some(diff), block),
        None => (ModificationMode::Fill, String::new(), None, fill_block),
    };
    let payload: &[u8] = diff.as_deref().unwrap_or(&new_data[..]);
    debug!(
        "{} {}: {} -> {} bytes",
        mode, candidate.rel_path, payload.len(), block.len()
    );

    Ok(Some(Prepared {
        entry: NewFileEntry {
            path: candidate.rel_path.clone(),
            mode,
            old_hash,
            new_hash,
            raw_hash: sha1_bytes(payload),
            block_hash: sha1_bytes(&block),
            block_offset: 0,
            block_length: block.len() as u64,
            raw_length: payload.len() as u64,
        },
        block,
    }))
}

/// Compare `old_dir` with `new_dir` and publish the difference as `version`
/// into `out_dir`, appending the version to its `versions.txt`.
pub async fn publish_version(
    old_dir: &Path,
    new_dir: &Path,
    out_dir: &Path,
    version: &str,
    change_log: &str,
    format: PatchFormat,
) -> Result<PublishSummary> {
    let version = version.trim();
    if version.is_empty() || version.contains(['\n', '\r', '/', '\\']) {
        bail!("Invalid version id '{version}'");
    }

    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create output directory: {}", out_dir.display()))?;
    let list_path = out_dir.join(VERSION_LIST);
    let existing = match std::fs::read_to_string(&list_path) {
        Ok(text) => parse_version_list(&text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", list_path.display()))
        }
    };
    if existing.iter().any(|v| v == version) {
        bail!("Version {version} is already listed in {}", list_path.display());
    }

    // Stage 1: Walk both directories concurrently
    let old_dir_owned = old_dir.to_path_buf();
    let new_dir_owned = new_dir.to_path_buf();
    let (old_entries, new_entries) = tokio::try_join!(
        tokio::task::spawn_blocking(move || util::walk_directory(&old_dir_owned)),
        tokio::task::spawn_blocking(move || util::walk_directory(&new_dir_owned)),
    )?;
    let old_entries = old_entries?;
    let new_entries = new_entries?;

    // Stage 2: Classify
    let mut meta = VersionMetadata {
        change_log: change_log.to_string(),
        ..VersionMetadata::default()
    };
    let candidates = classify(&old_entries, &new_entries, &mut meta);

    // Stage 3: Hash, diff and compress in parallel
    let prepared = tokio::task::spawn_blocking(move || -> Result<Vec<Option<Prepared>>> {
        candidates.par_iter().map(prepare).collect()
    })
    .await??;

    let mut summary = PublishSummary {
        folders_created: meta.new_folders.len(),
        folders_deleted: meta.old_folders.len(),
        files_deleted: meta.old_files.len(),
        ..PublishSummary::default()
    };
    let mut blocks = Vec::new();
    for item in prepared {
        let Some(Prepared { entry, block }) = item else {
            summary.files_unchanged += 1;
            continue;
        };
        match entry.mode {
            ModificationMode::Empty => summary.files_emptied += 1,
            ModificationMode::Fill => summary.files_filled += 1,
            ModificationMode::Modify => summary.files_modified += 1,
        }
        summary.payload_bytes += block.len() as u64;
        meta.new_files.push(entry);
        blocks.push(block);
    }

    // Stage 4: Write the container
    let out_dir_owned = out_dir.to_path_buf();
    let version_owned = version.to_string();
    summary.outputs = tokio::task::spawn_blocking(move || match format {
        PatchFormat::Blob => write_blob(&out_dir_owned, &version_owned, meta, &blocks),
        PatchFormat::Archive => write_archive(&out_dir_owned, &version_owned, &meta, &blocks),
    })
    .await??;

    append_version(&list_path, &existing, version)?;
    info!(
        "published {} ({} filled, {} modified, {} emptied, {} deleted)",
        version,
        summary.files_filled,
        summary.files_modified,
        summary.files_emptied,
        summary.files_deleted
    );
    Ok(summary)
}

/// Fill the tree-level fields of `meta` and return the files that may need writing.
fn classify(
    old_entries: &[DirEntry],
    new_entries: &[DirEntry],
    meta: &mut VersionMetadata,
) -> Vec<Candidate> {
    let old_map: HashMap<&str, &DirEntry> = old_entries
        .iter()
        .map(|e| (e.relative_path.as_str(), e))
        .collect();
    let new_kinds: HashMap<&str, &EntryKind> = new_entries
        .iter()
        .map(|e| (e.relative_path.as_str(), &e.kind))
        .collect();

    for old in old_entries {
        // Kept when the same path survives with the same kind.
        if new_kinds.get(old.relative_path.as_str()) == Some(&&old.kind) {
            continue;
        }
        match old.kind {
            EntryKind::Dir => meta.old_folders.insert(old.relative_path.clone()),
            EntryKind::File => meta.old_files.insert(old.relative_path.clone()),
        };
    }

    let mut candidates = Vec::new();
    for new in new_entries {
        let old = old_map
            .get(new.relative_path.as_str())
            .filter(|o| o.kind == new.kind);
        match new.kind {
            EntryKind::Dir => {
                if old.is_none() {
                    meta.new_folders.insert(new.relative_path.clone());
                }
            }
            EntryKind::File => candidates.push(Candidate {
                rel_path: new.relative_path.clone(),
                new_path: new.full_path.clone(),
                new_size: new.size,
                old: old.map(|o| (o.full_path.clone(), o.size)),
            }),
        }
    }
    candidates
}

fn write_blob(
    out_dir: &Path,
    version: &str,
    mut meta: VersionMetadata,
    blocks: &[Vec<u8>],
) -> Result<Vec<PathBuf>> {
    let bin_path = out_dir.join(format!("{version}.mc-patch.bin"));
    let json_path = out_dir.join(format!("{version}.mc-patch.json"));

    let file = File::create(&bin_path)
        .with_context(|| format!("Failed to create output file: {}", bin_path.display()))?;
    let mut writer = HashingWriter::new(BufWriter::new(file));
    for (entry, block) in meta.new_files.iter_mut().zip(blocks) {
        entry.block_offset = writer.bytes_written();
        writer.write_all(block)?;
    }
    let length = writer.bytes_written();
    let (mut inner, hash) = writer.finish()?;
    inner.flush()?;
    meta.patch_hash = Some(hash);
    meta.patch_length = Some(length);

    let json = meta.to_blob_json()?;
    std::fs::write(&json_path, json)
        .with_context(|| format!("Failed to write {}", json_path.display()))?;
    Ok(vec![json_path, bin_path])
}

/// Entries are stored as-is; blocks are already bzip2 streams.
fn stored(len: usize) -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .large_file(len as u64 >= u32::MAX as u64)
}

fn write_archive(
    out_dir: &Path,
    version: &str,
    meta: &VersionMetadata,
    blocks: &[Vec<u8>],
) -> Result<Vec<PathBuf>> {
    let zip_path = out_dir.join(format!("{version}.mcpatch.zip"));
    let file = File::create(&zip_path)
        .with_context(|| format!("Failed to create output file: {}", zip_path.display()))?;
    let mut zip = ZipWriter::new(BufWriter::new(file));

    for (entry, block) in meta.new_files.iter().zip(blocks) {
        if !entry.mode.has_data() {
            continue;
        }
        zip.start_file(entry.path.as_str(), stored(block.len()))
            .with_context(|| format!("Failed to add {} to the archive", entry.path))?;
        zip.write_all(block)?;
    }

    let meta_json = meta.to_archive_json()?;
    zip.start_file(ARCHIVE_META_ENTRY, stored(meta_json.len()))
        .context("Failed to add metadata to the archive")?;
    zip.write_all(meta_json.as_bytes())?;
    let mut inner = zip.finish().context("Failed to finish archive")?;
    inner.flush()?;
    Ok(vec![zip_path])
}

fn append_version(list_path: &Path, existing: &[String], version: &str) -> Result<()> {
    let mut text = existing.join("\n");
    if !text.is_empty() {
        text.push('\n');
    }
    text.push_str(version);
    std::fs::write(list_path, text)
        .with_context(|| format!("Failed to write {}", list_path.display()))
}
