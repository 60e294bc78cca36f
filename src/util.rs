use anyhow::{Context, Result};
use memmap2::Mmap;
use std::io;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub relative_path: String,
    pub kind: EntryKind,
    pub full_path: PathBuf,
    /// File size in bytes (0 for directories).
    pub size: u64,
}

/// Walk a directory tree and collect all entries with forward-slash relative paths.
pub fn walk_directory(root: &Path) -> Result<Vec<DirEntry>> {
    let root = root
        .canonicalize()
        .with_context(|| format!("Failed to canonicalize path: {}", root.display()))?;

    let mut entries = Vec::new();

    for entry in WalkDir::new(&root).min_depth(1).sort_by_file_name() {
        let entry =
            entry.with_context(|| format!("Failed to read directory entry in {}", root.display()))?;

        let full_path = entry.path().to_path_buf();
        let relative = full_path
            .strip_prefix(&root)
            .with_context(|| "Failed to compute relative path")?;

        let relative_str = relative
            .to_str()
            .with_context(|| format!("Non-UTF8 path: {}", relative.display()))?
            .replace('\\', "/");

        let kind = if entry.file_type().is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        };

        let meta = entry
            .metadata()
            .with_context(|| format!("Failed to read metadata: {}", full_path.display()))?;
        let size = if kind == EntryKind::File { meta.len() } else { 0 };

        entries.push(DirEntry {
            relative_path: relative_str,
            kind,
            full_path,
            size,
        });
    }

    Ok(entries)
}

/// Memory-map a file for read-only access.
///
/// Callers must not truncate or replace the file while the `Mmap` is live.
/// Zero-length files cannot be mapped on every platform, so callers check the
/// length first.
pub fn mmap_file(path: &Path) -> io::Result<Mmap> {
    let file = std::fs::File::open(path)?;
    // SAFETY: read-only mapping; the update directory is not modified concurrently.
    unsafe { Mmap::map(&file) }
}

/// Normalize a relative path from metadata: backslashes become `/`, leading
/// `./` and `/` are dropped, and parent components are refused.
pub fn normalize_relative(raw: &str) -> std::result::Result<String, String> {
    let unified = raw.replace('\\', "/");
    let mut parts = Vec::new();
    for part in unified.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err(format!("path '{raw}' escapes the update directory")),
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return Err(format!("path '{raw}' is empty"));
    }
    if parts[0].contains(':') {
        return Err(format!("path '{raw}' is absolute"));
    }
    Ok(parts.join("/"))
}

/// Resolve a normalized relative path below `root`.
pub fn resolve_under(root: &Path, relative: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    path.extend(relative.split('/'));
    path
}

/// Make a path absolute without requiring it to exist, removing `.` and `..`
/// lexically so guarded paths compare reliably.
pub fn absolutize(path: &Path) -> io::Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    Ok(out)
}

/// Path of the staging file used while rewriting `target`.
pub fn temporal_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".mcpatch-temporal.bin");
    target.with_file_name(name)
}

/// Sort directory paths so children come before parents (for deletion).
pub fn sort_dirs_deepest_first(dirs: &mut [String]) {
    dirs.sort();
    dirs.reverse();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_handles_separators_and_dots() {
        assert_eq!(normalize_relative("a\\b\\c.txt").unwrap(), "a/b/c.txt");
        assert_eq!(normalize_relative("./mods/x.jar").unwrap(), "mods/x.jar");
        assert_eq!(normalize_relative("/config//a.cfg").unwrap(), "config/a.cfg");
        assert!(normalize_relative("mods/../../etc").is_err());
        assert!(normalize_relative("C:/windows").is_err());
        assert!(normalize_relative("./").is_err());
    }

    #[test]
    fn resolve_joins_components() {
        let root = Path::new("/srv/game");
        assert_eq!(resolve_under(root, "mods/a.jar"), Path::new("/srv/game/mods/a.jar"));
    }

    #[test]
    fn temporal_path_sits_next_to_target() {
        let target = Path::new("/srv/game/mods/a.jar");
        assert_eq!(
            temporal_path(target),
            Path::new("/srv/game/mods/a.jar.mcpatch-temporal.bin")
        );
    }

    #[test]
    fn absolutize_removes_dot_components() {
        let p = absolutize(Path::new("/a/b/./c/../d")).unwrap();
        assert_eq!(p, Path::new("/a/b/d"));
    }

    #[test]
    fn deepest_directories_sort_first() {
        let mut dirs = vec!["a".to_string(), "a/b/c".to_string(), "a/b".to_string()];
        sort_dirs_deepest_first(&mut dirs);
        assert_eq!(dirs, vec!["a/b/c", "a/b", "a"]);
    }

    #[test]
    fn walk_lists_files_and_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/f.txt"), b"abc").unwrap();
        let entries = walk_directory(dir.path()).unwrap();
        let file = entries.iter().find(|e| e.relative_path == "sub/f.txt").unwrap();
        assert_eq!(file.kind, EntryKind::File);
        assert_eq!(file.size, 3);
        assert!(entries.iter().any(|e| e.relative_path == "sub" && e.kind == EntryKind::Dir));
    }
}
