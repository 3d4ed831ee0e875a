//! File-system capability provider.
//!
//! Scripts never touch the OS directly; the environment hands every
//! file-system worker an implementation of [`FileSystem`]. The default is a
//! thin wrapper over `std::fs`. Embedders swap in their own (tests use an
//! in-memory one) via `Environment::set_file_system`.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Result of a `stat` call. A missing path is all-false/zero, not an error.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub exists: bool,
    pub is_file: bool,
    pub is_directory: bool,
    /// Last modification time, seconds since the Unix epoch. Zero when
    /// unknown.
    pub last_write_time: u64,
}

/// A failed provider call. The message carries the operation, the path and
/// the OS error text; workers forward it to script callbacks verbatim.
#[derive(Debug, thiserror::Error)]
#[error("{op} \"{path}\": {source}")]
pub struct FsError {
    op: &'static str,
    path: String,
    #[source]
    source: std::io::Error,
}

impl FsError {
    fn new(op: &'static str, path: &str, source: std::io::Error) -> Self {
        Self {
            op,
            path: path.to_string(),
            source,
        }
    }
}

/// Blocking file-system operations used by the async workers.
pub trait FileSystem: Send + Sync {
    /// Reads the whole file as UTF-8 text.
    fn read(&self, path: &str) -> Result<String, FsError>;

    /// Writes `data`, replacing any existing content.
    fn write(&self, path: &str, data: &str) -> Result<(), FsError>;

    /// Removes a file (or an empty directory). Returns `false` if the path
    /// did not exist.
    fn remove(&self, path: &str) -> Result<bool, FsError>;

    /// Renames `from` to `to`, replacing `to` if present.
    fn rename(&self, from: &str, to: &str) -> Result<(), FsError>;

    /// Queries a path without failing on absence.
    fn stat(&self, path: &str) -> Result<FileStat, FsError>;

    /// Resolves a relative path against the provider's base directory.
    /// Absolute paths pass through unchanged.
    fn resolve(&self, path: &str) -> String;
}

/// `std::fs`-backed provider. Relative paths resolve against `base_dir`
/// (the current directory unless overridden).
pub struct DefaultFileSystem {
    base_dir: PathBuf,
}

impl DefaultFileSystem {
    pub fn new() -> Self {
        Self {
            base_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }
}

impl Default for DefaultFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem for DefaultFileSystem {
    fn read(&self, path: &str) -> Result<String, FsError> {
        std::fs::read_to_string(path).map_err(|e| FsError::new("read", path, e))
    }

    fn write(&self, path: &str, data: &str) -> Result<(), FsError> {
        std::fs::write(path, data).map_err(|e| FsError::new("write", path, e))
    }

    fn remove(&self, path: &str) -> Result<bool, FsError> {
        let meta = match std::fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(FsError::new("remove", path, e)),
        };
        let result = if meta.is_dir() {
            std::fs::remove_dir(path)
        } else {
            std::fs::remove_file(path)
        };
        match result {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(FsError::new("remove", path, e)),
        }
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), FsError> {
        std::fs::rename(from, to).map_err(|e| FsError::new("move", from, e))
    }

    fn stat(&self, path: &str) -> Result<FileStat, FsError> {
        let meta = match std::fs::metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(FileStat::default())
            }
            Err(e) => return Err(FsError::new("stat", path, e)),
        };
        let last_write_time = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Ok(FileStat {
            exists: true,
            is_file: meta.is_file(),
            is_directory: meta.is_dir(),
            last_write_time,
        })
    }

    fn resolve(&self, path: &str) -> String {
        let p = Path::new(path);
        if p.is_absolute() {
            path.to_string()
        } else {
            self.base_dir.join(p).to_string_lossy().into_owned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        let path = path.to_str().unwrap();
        let fs = DefaultFileSystem::new();

        fs.write(path, "foo\nbar").unwrap();
        assert_eq!(fs.read(path).unwrap(), "foo\nbar");

        fs.write(path, "replaced").unwrap();
        assert_eq!(fs.read(path).unwrap(), "replaced");
    }

    #[test]
    fn remove_reports_absence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.txt");
        let path = path.to_str().unwrap();
        let fs = DefaultFileSystem::new();

        assert!(!fs.remove(path).unwrap());
        fs.write(path, "x").unwrap();
        assert!(fs.remove(path).unwrap());
        assert!(!fs.remove(path).unwrap());
    }

    #[test]
    fn stat_missing_path_is_not_an_error() {
        let fs = DefaultFileSystem::new();
        let stat = fs.stat("/nonexistent/abx/stat/probe").unwrap();
        assert!(!stat.exists);
        assert!(!stat.is_file);
        assert!(!stat.is_directory);
        assert_eq!(stat.last_write_time, 0);
    }

    #[test]
    fn stat_reports_kind_and_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, "x").unwrap();
        let fs = DefaultFileSystem::new();

        let stat = fs.stat(file.to_str().unwrap()).unwrap();
        assert!(stat.exists && stat.is_file && !stat.is_directory);
        assert!(stat.last_write_time > 0);

        let stat = fs.stat(dir.path().to_str().unwrap()).unwrap();
        assert!(stat.exists && stat.is_directory && !stat.is_file);
    }

    #[test]
    fn resolve_joins_relative_paths_only() {
        let fs = DefaultFileSystem::with_base_dir("/base/dir");
        assert_eq!(fs.resolve("patterns.ini"), "/base/dir/patterns.ini");
        assert_eq!(fs.resolve("/etc/hosts"), "/etc/hosts");
    }

    #[test]
    fn read_error_includes_os_text() {
        let fs = DefaultFileSystem::new();
        let err = fs.read("/nonexistent/abx/read/probe").unwrap_err();
        let text = err.to_string();
        assert!(text.contains("read"));
        assert!(text.contains("/nonexistent/abx/read/probe"));
    }
}
