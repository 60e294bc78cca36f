//! Per-version metadata and its two wire layouts.
//!
//! The blob layout (`<version>.mc-patch.json`) stores new files as
//! pipe-delimited strings and carries the whole-blob hash and length. The
//! archive layout (`.mcpatch-meta.json` inside a zip) stores them as objects.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, UpdateError};
use crate::util::normalize_relative;

/// Name of the metadata entry inside an archive-form container.
pub const ARCHIVE_META_ENTRY: &str = ".mcpatch-meta.json";

/// How a single file changes in a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModificationMode {
    /// Truncate to zero bytes.
    #[serde(rename = "e")]
    Empty,
    /// Replace the whole content.
    #[serde(rename = "f")]
    Fill,
    /// Apply a binary diff against a known base.
    #[serde(rename = "m")]
    Modify,
}

impl ModificationMode {
    pub fn flag(self) -> &'static str {
        match self {
            ModificationMode::Empty => "e",
            ModificationMode::Fill => "f",
            ModificationMode::Modify => "m",
        }
    }

    /// Whether entries in this mode carry a data block.
    pub fn has_data(self) -> bool {
        !matches!(self, ModificationMode::Empty)
    }
}

impl fmt::Display for ModificationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.flag())
    }
}

impl FromStr for ModificationMode {
    type Err = String;

    fn from_str(flag: &str) -> std::result::Result<Self, Self::Err> {
        match flag {
            "e" => Ok(ModificationMode::Empty),
            "f" => Ok(ModificationMode::Fill),
            "m" => Ok(ModificationMode::Modify),
            other => Err(format!("'{other}' is not a modification mode flag")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MoveFile {
    pub from: String,
    pub to: String,
}

/// One file written by a version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFileEntry {
    pub path: String,
    pub mode: ModificationMode,
    /// Hash of the base file a Modify diff was computed against.
    pub old_hash: String,
    /// Hash of the file after the entry is applied.
    pub new_hash: String,
    /// Hash of the decompressed payload (full content or diff).
    pub raw_hash: String,
    /// Hash of the payload as stored (bzip2-compressed).
    pub block_hash: String,
    pub block_offset: u64,
    pub block_length: u64,
    /// Decompressed payload size.
    pub raw_length: u64,
}

impl NewFileEntry {
    /// End of the stored block, `None` when offset plus length overflows.
    pub fn block_end(&self) -> Option<u64> {
        self.block_offset.checked_add(self.block_length)
    }
}

/// `path|mode|old|new|raw|block|offset|length|raw_length`, numbers in hex.
impl fmt::Display for NewFileEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}|{}|{:x}|{:x}|{:x}",
            self.path,
            self.mode,
            self.old_hash,
            self.new_hash,
            self.raw_hash,
            self.block_hash,
            self.block_offset,
            self.block_length,
            self.raw_length
        )
    }
}

impl FromStr for NewFileEntry {
    type Err = String;

    fn from_str(line: &str) -> std::result::Result<Self, Self::Err> {
        let fields: Vec<&str> = line.split('|').collect();
        if fields.len() != 9 {
            return Err(format!("new file record '{line}' has {} fields, expected 9", fields.len()));
        }
        let hex_field = |idx: usize, name: &str| {
            u64::from_str_radix(fields[idx], 16)
                .map_err(|e| format!("new file record '{line}': bad {name}: {e}"))
        };
        let path = normalize_relative(fields[0])?;
        let mode: ModificationMode = fields[1].parse()?;
        let new_hash = fields[3].to_string();
        // Older publishers left the payload hash empty for full-content entries.
        let raw_hash = if fields[4].is_empty() && mode == ModificationMode::Fill {
            new_hash.clone()
        } else {
            fields[4].to_string()
        };
        Ok(NewFileEntry {
            path,
            mode,
            old_hash: fields[2].to_string(),
            new_hash,
            raw_hash,
            block_hash: fields[5].to_string(),
            block_offset: hex_field(6, "offset")?,
            block_length: hex_field(7, "length")?,
            raw_length: hex_field(8, "raw length")?,
        })
    }
}

/// Everything a version changes in the tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionMetadata {
    pub old_files: BTreeSet<String>,
    pub old_folders: BTreeSet<String>,
    pub new_folders: BTreeSet<String>,
    pub move_files: Vec<MoveFile>,
    pub new_files: Vec<NewFileEntry>,
    pub change_log: String,
    /// Whole-blob hash (blob layout only).
    pub patch_hash: Option<String>,
    /// Whole-blob length (blob layout only).
    pub patch_length: Option<u64>,
}

#[derive(Serialize, Deserialize)]
struct BlobWire {
    old_files: Vec<String>,
    old_folders: Vec<String>,
    new_folders: Vec<String>,
    #[serde(default)]
    move_files: Vec<MoveFile>,
    new_files: Vec<String>,
    #[serde(default)]
    change_logs: Vec<String>,
    patch_hash: String,
    patch_length: u64,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ArchiveWire {
    old_files: Vec<String>,
    old_folders: Vec<String>,
    new_folders: Vec<String>,
    #[serde(default)]
    move_files: Vec<MoveFile>,
    new_files: Vec<ArchiveFileWire>,
    #[serde(default)]
    change_logs: Vec<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ArchiveFileWire {
    path: String,
    mode: ModificationMode,
    #[serde(default)]
    old_hash: String,
    new_hash: String,
    #[serde(default)]
    raw_hash: String,
    #[serde(default)]
    block_hash: String,
    #[serde(default)]
    raw_length: u64,
}

fn normalize_set(name: &str, paths: Vec<String>) -> Result<BTreeSet<String>> {
    paths
        .iter()
        .map(|p| normalize_relative(p))
        .collect::<std::result::Result<_, _>>()
        .map_err(|reason| UpdateError::Metadata {
            name: name.to_string(),
            reason,
        })
}

fn normalize_moves(name: &str, moves: Vec<MoveFile>) -> Result<Vec<MoveFile>> {
    moves
        .into_iter()
        .map(|m| {
            Ok(MoveFile {
                from: normalize_relative(&m.from)?,
                to: normalize_relative(&m.to)?,
            })
        })
        .collect::<std::result::Result<_, String>>()
        .map_err(|reason| UpdateError::Metadata {
            name: name.to_string(),
            reason,
        })
}

fn join_change_logs(lines: Vec<String>) -> String {
    lines.join("\n")
}

fn split_change_log(text: &str) -> Vec<String> {
    text.split('\n').map(str::to_string).collect()
}

impl VersionMetadata {
    /// Parse the blob layout.
    pub fn from_blob_json(name: &str, text: &str) -> Result<Self> {
        let wire: BlobWire = serde_json::from_str(text).map_err(|e| UpdateError::Metadata {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        let new_files = wire
            .new_files
            .iter()
            .map(|line| line.parse::<NewFileEntry>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|reason| UpdateError::Metadata {
                name: name.to_string(),
                reason,
            })?;
        Ok(VersionMetadata {
            old_files: normalize_set(name, wire.old_files)?,
            old_folders: normalize_set(name, wire.old_folders)?,
            new_folders: normalize_set(name, wire.new_folders)?,
            move_files: normalize_moves(name, wire.move_files)?,
            new_files,
            change_log: join_change_logs(wire.change_logs),
            patch_hash: Some(wire.patch_hash),
            patch_length: Some(wire.patch_length),
        })
    }

    pub fn to_blob_json(&self) -> Result<String> {
        let wire = BlobWire {
            old_files: self.old_files.iter().cloned().collect(),
            old_folders: self.old_folders.iter().cloned().collect(),
            new_folders: self.new_folders.iter().cloned().collect(),
            move_files: self.move_files.clone(),
            new_files: self.new_files.iter().map(|e| e.to_string()).collect(),
            change_logs: split_change_log(&self.change_log),
            patch_hash: self.patch_hash.clone().unwrap_or_default(),
            patch_length: self.patch_length.unwrap_or_default(),
        };
        serde_json::to_string_pretty(&wire).map_err(|e| UpdateError::Metadata {
            name: "blob metadata".into(),
            reason: e.to_string(),
        })
    }

    /// Parse the archive layout.
    pub fn from_archive_json(name: &str, text: &str) -> Result<Self> {
        let wire: ArchiveWire = serde_json::from_str(text).map_err(|e| UpdateError::Metadata {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        let new_files = wire
            .new_files
            .into_iter()
            .map(|f| {
                Ok(NewFileEntry {
                    path: normalize_relative(&f.path)?,
                    mode: f.mode,
                    old_hash: f.old_hash,
                    raw_hash: if f.raw_hash.is_empty() && f.mode == ModificationMode::Fill {
                        f.new_hash.clone()
                    } else {
                        f.raw_hash
                    },
                    new_hash: f.new_hash,
                    block_hash: f.block_hash,
                    block_offset: 0,
                    block_length: 0,
                    raw_length: f.raw_length,
                })
            })
            .collect::<std::result::Result<Vec<_>, String>>()
            .map_err(|reason| UpdateError::Metadata {
                name: name.to_string(),
                reason,
            })?;
        Ok(VersionMetadata {
            old_files: normalize_set(name, wire.old_files)?,
            old_folders: normalize_set(name, wire.old_folders)?,
            new_folders: normalize_set(name, wire.new_folders)?,
            move_files: normalize_moves(name, wire.move_files)?,
            new_files,
            change_log: join_change_logs(wire.change_logs),
            patch_hash: None,
            patch_length: None,
        })
    }

    pub fn to_archive_json(&self) -> Result<String> {
        let wire = ArchiveWire {
            old_files: self.old_files.iter().cloned().collect(),
            old_folders: self.old_folders.iter().cloned().collect(),
            new_folders: self.new_folders.iter().cloned().collect(),
            move_files: self.move_files.clone(),
            new_files: self
                .new_files
                .iter()
                .map(|e| ArchiveFileWire {
                    path: e.path.clone(),
                    mode: e.mode,
                    old_hash: e.old_hash.clone(),
                    new_hash: e.new_hash.clone(),
                    raw_hash: e.raw_hash.clone(),
                    block_hash: e.block_hash.clone(),
                    raw_length: e.raw_length,
                })
                .collect(),
            change_logs: split_change_log(&self.change_log),
        };
        serde_json::to_string_pretty(&wire).map_err(|e| UpdateError::Metadata {
            name: "archive metadata".into(),
            reason: e.to_string(),
        })
    }

    /// Check that data-carrying entries of a blob are ascending, disjoint and
    /// inside the blob, and that Modify entries name their base hash.
    pub fn validate_blob_layout(&self, version: &str) -> Result<()> {
        let mut cursor = 0u64;
        for entry in self.new_files.iter() {
            if entry.mode == ModificationMode::Modify && entry.old_hash.is_empty() {
                return Err(UpdateError::corrupted(
                    version,
                    format!("{} is a modify entry without a base hash", entry.path),
                ));
            }
            if !entry.mode.has_data() {
                continue;
            }
            if entry.block_offset < cursor {
                return Err(UpdateError::corrupted(
                    version,
                    format!(
                        "block of {} starts at {} but the previous block ends at {}",
                        entry.path, entry.block_offset, cursor
                    ),
                ));
            }
            cursor = entry.block_end().ok_or_else(|| {
                UpdateError::corrupted(
                    version,
                    format!("block of {} overflows the patch offset range", entry.path),
                )
            })?;
        }
        if let Some(length) = self.patch_length {
            if cursor > length {
                return Err(UpdateError::corrupted(
                    version,
                    format!("blocks end at {cursor} but the patch is {length} bytes"),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, mode: ModificationMode, offset: u64, length: u64) -> NewFileEntry {
        NewFileEntry {
            path: path.into(),
            mode,
            old_hash: if mode == ModificationMode::Modify { "aa".into() } else { String::new() },
            new_hash: "bb".into(),
            raw_hash: "cc".into(),
            block_hash: "dd".into(),
            block_offset: offset,
            block_length: length,
            raw_length: 42,
        }
    }

    #[test]
    fn mode_flags_map_both_ways() {
        for (mode, flag) in [
            (ModificationMode::Empty, "e"),
            (ModificationMode::Fill, "f"),
            (ModificationMode::Modify, "m"),
        ] {
            assert_eq!(mode.flag(), flag);
            assert_eq!(flag.parse::<ModificationMode>().unwrap(), mode);
            assert_eq!(serde_json::to_string(&mode).unwrap(), format!("\"{flag}\""));
        }
        assert!("x".parse::<ModificationMode>().is_err());
    }

    #[test]
    fn new_file_record_uses_hex_numbers() {
        let e = entry("mods/a.jar", ModificationMode::Fill, 255, 16);
        let line = e.to_string();
        assert_eq!(line, "mods/a.jar|f||bb|cc|dd|ff|10|2a");
        assert_eq!(line.parse::<NewFileEntry>().unwrap(), e);
    }

    #[test]
    fn fill_record_without_payload_hash_falls_back_to_new_hash() {
        let parsed: NewFileEntry = "a.txt|f||abc||def|0|4|3".parse().unwrap();
        assert_eq!(parsed.raw_hash, "abc");
    }

    #[test]
    fn record_with_wrong_field_count_is_rejected() {
        assert!("a.txt|f|x".parse::<NewFileEntry>().is_err());
    }

    #[test]
    fn blob_json_parses_and_normalizes() {
        let text = r#"{
            "old_files": ["config\\old.cfg"],
            "old_folders": ["./legacy"],
            "new_folders": ["mods"],
            "new_files": ["mods/a.jar|f||bb|cc|dd|0|10|2a"],
            "change_logs": ["first", "second"],
            "patch_hash": "ee",
            "patch_length": 16
        }"#;
        let meta = VersionMetadata::from_blob_json("1.0.mc-patch.json", text).unwrap();
        assert!(meta.old_files.contains("config/old.cfg"));
        assert!(meta.old_folders.contains("legacy"));
        assert!(meta.move_files.is_empty());
        assert_eq!(meta.change_log, "first\nsecond");
        assert_eq!(meta.patch_length, Some(16));
        assert_eq!(meta.new_files[0].block_length, 16);
    }

    #[test]
    fn parent_components_are_rejected() {
        let text = r#"{"old_files":["../escape"],"old_folders":[],"new_folders":[],
            "new_files":[],"change_logs":[],"patch_hash":"","patch_length":0}"#;
        let err = VersionMetadata::from_blob_json("m", text).unwrap_err();
        assert!(matches!(err, UpdateError::Metadata { .. }));
    }

    #[test]
    fn archive_json_round_trips() {
        let mut meta = VersionMetadata::default();
        meta.new_folders.insert("mods".into());
        meta.move_files.push(MoveFile {
            from: "a.txt".into(),
            to: "b.txt".into(),
        });
        meta.new_files.push(NewFileEntry {
            block_offset: 0,
            block_length: 0,
            ..entry("mods/a.jar", ModificationMode::Modify, 0, 0)
        });
        meta.change_log = "notes".into();
        let text = meta.to_archive_json().unwrap();
        let parsed = VersionMetadata::from_archive_json("meta", &text).unwrap();
        assert_eq!(parsed, meta);
    }

    #[test]
    fn overlapping_blocks_are_rejected() {
        let mut meta = VersionMetadata::default();
        meta.new_files.push(entry("a", ModificationMode::Fill, 0, 10));
        meta.new_files.push(entry("b", ModificationMode::Empty, 0, 0));
        meta.new_files.push(entry("c", ModificationMode::Fill, 10, 5));
        meta.patch_length = Some(15);
        meta.validate_blob_layout("1").unwrap();

        meta.new_files.push(entry("d", ModificationMode::Modify, 12, 2));
        let err = meta.validate_blob_layout("1").unwrap_err();
        assert!(matches!(err, UpdateError::PatchCorrupted { .. }));
    }

    #[test]
    fn overflowing_block_is_rejected() {
        let mut meta = VersionMetadata::default();
        meta.new_files.push(entry("a", ModificationMode::Fill, 0, 10));
        meta.new_files.push(entry("b", ModificationMode::Fill, u64::MAX - 1, 8));
        let err = meta.validate_blob_layout("1").unwrap_err();
        assert!(matches!(err, UpdateError::PatchCorrupted { ref subject, .. } if subject.contains("overflows")));
    }
}
