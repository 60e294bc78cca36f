use bzip2::read::BzDecoder;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use zip::result::ZipError;
use zip::ZipArchive;

use crate::error::{CorruptBlock, IoContext, Result, UpdateError};
use crate::hashing::{sha1_file, HashingReader};
use crate::metadata::{NewFileEntry, VersionMetadata, ARCHIVE_META_ENTRY};

/// An opened patch of one version. Dropping it releases the file handle.
pub enum PatchContainer {
    /// Contiguous blob read with a forward-only cursor.
    Blob {
        reader: BufReader<File>,
        cursor: u64,
    },
    /// Zip archive with one stored entry per data-carrying file.
    Archive { archive: ZipArchive<File> },
    /// Version whose entries carry no stored data, so nothing was downloaded.
    Blockless,
}

/// Check a downloaded blob against the length and hash its metadata declares.
pub fn verify_blob(path: &Path, version: &str, meta: &VersionMetadata) -> Result<()> {
    let actual_len = std::fs::metadata(path)
        .io_context(|| format!("failed to stat {}", path.display()))?
        .len();
    if let Some(expected) = meta.patch_length {
        if actual_len != expected {
            return Err(UpdateError::corrupted(
                version,
                format!("patch file is {actual_len} bytes, expected {expected}"),
            ));
        }
    }
    if let Some(expected) = meta.patch_hash.as_deref() {
        let actual = sha1_file(path)?;
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(UpdateError::corrupted(
                version,
                format!("patch file hash is {actual}, expected {expected}"),
            ));
        }
    }
    Ok(())
}

impl PatchContainer {
    pub fn open_blob(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .io_context(|| format!("failed to open patch file {}", path.display()))?;
        Ok(PatchContainer::Blob {
            reader: BufReader::with_capacity(256 * 1024, file),
            cursor: 0,
        })
    }

    /// Open an archive and read the metadata it carries.
    pub fn open_archive(path: &Path, version: &str) -> Result<(Self, VersionMetadata)> {
        let file = File::open(path)
            .io_context(|| format!("failed to open patch archive {}", path.display()))?;
        let mut archive = ZipArchive::new(file).map_err(|e| {
            UpdateError::corrupted(version, format!("not a readable archive: {e}"))
        })?;
        let mut text = String::new();
        archive
            .by_name(ARCHIVE_META_ENTRY)
            .map_err(|e| {
                UpdateError::corrupted(version, format!("{ARCHIVE_META_ENTRY} unavailable: {e}"))
            })?
            .read_to_string(&mut text)
            .map_err(|e| UpdateError::corrupted(version, format!("{ARCHIVE_META_ENTRY}: {e}")))?;
        let meta = VersionMetadata::from_archive_json(ARCHIVE_META_ENTRY, &text)?;
        Ok((PatchContainer::Archive { archive }, meta))
    }

    /// Open the verified payload stream of `entry`.
    pub fn open_entry(
        &mut self,
        version: &str,
        entry: &NewFileEntry,
    ) -> Result<VerifiedEntry<Box<dyn Read + '_>>> {
        let raw: Box<dyn Read + '_> = match self {
            PatchContainer::Blob { reader, cursor } => {
                if entry.block_offset < *cursor {
                    return Err(UpdateError::corrupted(
                        version,
                        format!(
                            "block of {} at {} lies behind the read cursor at {}",
                            entry.path, entry.block_offset, cursor
                        ),
                    ));
                }
                reader
                    .seek(SeekFrom::Start(entry.block_offset))
                    .io_context(|| format!("failed to seek to the block of {}", entry.path))?;
                *cursor = entry.block_end().ok_or_else(|| {
                    UpdateError::corrupted(
                        version,
                        format!("block of {} overflows the patch offset range", entry.path),
                    )
                })?;
                Box::new(reader.take(entry.block_length))
            }
            PatchContainer::Blockless => {
                return Err(UpdateError::corrupted(
                    version,
                    format!("{} needs a stored block but the version has none", entry.path),
                ))
            }
            PatchContainer::Archive { archive } => match archive.by_name(&entry.path) {
                Ok(file) => Box::new(file),
                Err(ZipError::FileNotFound) => {
                    return Err(UpdateError::corrupted(
                        version,
                        format!("archive has no entry for {}", entry.path),
                    ))
                }
                Err(e) => {
                    return Err(UpdateError::corrupted(
                        version,
                        format!("entry {} unreadable: {e}", entry.path),
                    ))
                }
            },
        };
        Ok(VerifiedEntry::new(raw, entry))
    }
}

/// Decompressing reader that checks both the stored and the decompressed
/// hash once the payload ends.
///
/// Failures surface as `InvalidData` io errors carrying a [`CorruptBlock`].
pub struct VerifiedEntry<R: Read> {
    stream: HashingReader<BzDecoder<HashingReader<R>>>,
    block_hash: String,
    raw_hash: String,
    finished: bool,
}

impl<R: Read> VerifiedEntry<R> {
    pub fn new(raw: R, entry: &NewFileEntry) -> Self {
        VerifiedEntry {
            stream: HashingReader::new(BzDecoder::new(HashingReader::new(raw))),
            block_hash: entry.block_hash.clone(),
            raw_hash: entry.raw_hash.clone(),
            finished: false,
        }
    }

    fn finish(&mut self) -> io::Result<()> {
        self.finished = true;
        let stored = self.stream.get_mut().get_mut();
        io::copy(stored, &mut io::sink())?;
        let block = stored.hex_digest();
        if !block.eq_ignore_ascii_case(&self.block_hash) {
            return Err(CorruptBlock(format!(
                "block hash is {block}, expected {}",
                self.block_hash
            ))
            .into_io());
        }
        let raw = self.stream.hex_digest();
        if !raw.eq_ignore_ascii_case(&self.raw_hash) {
            return Err(CorruptBlock(format!(
                "payload hash is {raw}, expected {}",
                self.raw_hash
            ))
            .into_io());
        }
        Ok(())
    }
}

impl<R: Read> Read for VerifiedEntry<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.finished || buf.is_empty() {
            return Ok(0);
        }
        let n = self.stream.read(buf).map_err(|e| match e.kind() {
            io::ErrorKind::InvalidInput
            | io::ErrorKind::InvalidData
            | io::ErrorKind::UnexpectedEof => {
                CorruptBlock(format!("undecodable payload: {e}")).into_io()
            }
            _ => e,
        })?;
        if n == 0 {
            self.finish()?;
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::sha1_bytes;
    use crate::metadata::ModificationMode;
    use bzip2::write::BzEncoder;
    use bzip2::Compression;
    use std::io::Write;

    fn compress(data: &[u8]) -> Vec<u8> {
        let mut enc = BzEncoder::new(Vec::new(), Compression::best());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn entry_for(path: &str, payload: &[u8], block: &[u8], offset: u64) -> NewFileEntry {
        NewFileEntry {
            path: path.into(),
            mode: ModificationMode::Fill,
            old_hash: String::new(),
            new_hash: sha1_bytes(payload),
            raw_hash: sha1_bytes(payload),
            block_hash: sha1_bytes(block),
            block_offset: offset,
            block_length: block.len() as u64,
            raw_length: payload.len() as u64,
        }
    }

    fn read_all(entry: &mut impl Read) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        entry.read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn blob_entries_are_read_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = compress(b"first payload");
        let b = compress(b"second payload");
        let mut blob = a.clone();
        blob.extend_from_slice(&b);
        let path = dir.path().join("1.mc-patch.bin");
        std::fs::write(&path, &blob).unwrap();

        let ea = entry_for("a", b"first payload", &a, 0);
        let eb = entry_for("b", b"second payload", &b, a.len() as u64);
        let mut container = PatchContainer::open_blob(&path).unwrap();
        assert_eq!(
            read_all(&mut container.open_entry("1", &ea).unwrap()).unwrap(),
            b"first payload"
        );
        assert_eq!(
            read_all(&mut container.open_entry("1", &eb).unwrap()).unwrap(),
            b"second payload"
        );
        assert!(matches!(
            container.open_entry("1", &ea),
            Err(UpdateError::PatchCorrupted { .. })
        ));
    }

    #[test]
    fn flipped_bit_is_detected() {
        let payload = vec![7u8; 10_000];
        let mut block = compress(&payload);
        let entry = entry_for("a", &payload, &block, 0);
        let mid = block.len() / 2;
        block[mid] ^= 0x01;
        let mut verified = VerifiedEntry::new(&block[..], &entry);
        let err = read_all(&mut verified).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(matches!(
            UpdateError::from_entry_io("1", "a", err),
            UpdateError::PatchCorrupted { .. }
        ));
    }

    #[test]
    fn wrong_payload_hash_is_detected() {
        let block = compress(b"content");
        let mut entry = entry_for("a", b"content", &block, 0);
        entry.raw_hash = sha1_bytes(b"other");
        let mut verified = VerifiedEntry::new(&block[..], &entry);
        let err = read_all(&mut verified).unwrap_err();
        assert!(err.to_string().contains("payload hash"));
    }

    #[test]
    fn blob_length_and_hash_checked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.bin");
        std::fs::write(&path, b"0123456789").unwrap();
        let mut meta = VersionMetadata {
            patch_length: Some(10),
            patch_hash: Some(sha1_bytes(b"0123456789")),
            ..VersionMetadata::default()
        };
        verify_blob(&path, "1", &meta).unwrap();
        meta.patch_length = Some(11);
        assert!(matches!(
            verify_blob(&path, "1", &meta),
            Err(UpdateError::PatchCorrupted { .. })
        ));
        meta.patch_length = Some(10);
        meta.patch_hash = Some(sha1_bytes(b"x"));
        assert!(verify_blob(&path, "1", &meta).is_err());
    }

    #[test]
    fn archive_missing_entry_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1.mcpatch.zip");
        let meta = VersionMetadata::default();
        {
            let mut zip = zip::ZipWriter::new(File::create(&path).unwrap());
            let options = zip::write::SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Stored);
            zip.start_file(ARCHIVE_META_ENTRY, options).unwrap();
            zip.write_all(meta.to_archive_json().unwrap().as_bytes()).unwrap();
            zip.finish().unwrap();
        }
        let (mut container, parsed) = PatchContainer::open_archive(&path, "1").unwrap();
        assert!(parsed.new_files.is_empty());
        let entry = entry_for("missing.txt", b"", b"", 0);
        assert!(matches!(
            container.open_entry("1", &entry),
            Err(UpdateError::PatchCorrupted { .. })
        ));
    }
}
