//! State Store
//!
//! The only persisted state of a run is the set of files on disk. All reads
//! and writes the engine itself performs go through [`StateStore`], so tests
//! can substitute [`MemoryStore`] for the real filesystem ([`FsStore`]).
//!
//! Paths are the same relative strings that appear in rule templates. A
//! store resolves them against its own root.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use log::debug;

use crate::error::StoreError;

/// Filesystem-like access used by the graph builder, the checkpoint
/// resolver and the manifest writer.
pub trait StateStore: Send + Sync {
    /// Whether a file or directory exists at `path`.
    fn exists(&self, path: &str) -> bool;

    /// Lists every file below `dir`, recursively, as paths relative to `dir`.
    ///
    /// Returns `Ok(None)` when `dir` does not exist, which callers must keep
    /// distinct from an existing but empty directory.
    fn list(&self, dir: &str) -> Result<Option<Vec<String>>, StoreError>;

    /// Reads a file as UTF-8 text.
    fn read(&self, path: &str) -> Result<String, StoreError>;

    /// Writes `contents` to `path`, creating parent directories.
    fn write(&self, path: &str, contents: &str) -> Result<(), StoreError>;

    /// Last modification time, if the path exists.
    fn modified(&self, path: &str) -> Option<SystemTime>;

    /// Removes a file or directory tree. Missing paths are not an error.
    fn remove(&self, path: &str) -> Result<(), StoreError>;
}

/// [`StateStore`] backed by the real filesystem under a root directory.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Creates a store rooted at `root`. Relative rule paths resolve against it.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a rule path against the root.
    pub fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    fn collect_files(base: &Path, dir: &Path, out: &mut Vec<String>) -> Result<(), StoreError> {
        let entries = fs::read_dir(dir).map_err(|e| StoreError::io(dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(dir, e))?;
            let path = entry.path();
            if path.is_dir() {
                Self::collect_files(base, &path, out)?;
            } else if let Ok(relative) = path.strip_prefix(base) {
                out.push(relative.to_string_lossy().replace('\\', "/"));
            }
        }
        Ok(())
    }
}

impl StateStore for FsStore {
    fn exists(&self, path: &str) -> bool {
        self.resolve(path).exists()
    }

    fn list(&self, dir: &str) -> Result<Option<Vec<String>>, StoreError> {
        let full = self.resolve(dir);
        if !full.is_dir() {
            return Ok(None);
        }
        let mut files = Vec::new();
        Self::collect_files(&full, &full, &mut files)?;
        debug!("Listed {} files under {}", files.len(), full.display());
        Ok(Some(files))
    }

    fn read(&self, path: &str) -> Result<String, StoreError> {
        let full = self.resolve(path);
        fs::read_to_string(&full).map_err(|e| StoreError::io(full, e))
    }

    fn write(&self, path: &str, contents: &str) -> Result<(), StoreError> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
                debug!("Created directory: {}", parent.display());
            }
        }
        fs::write(&full, contents).map_err(|e| StoreError::io(full, e))
    }

    fn modified(&self, path: &str) -> Option<SystemTime> {
        fs::metadata(self.resolve(path))
            .ok()
            .and_then(|m| m.modified().ok())
    }

    fn remove(&self, path: &str) -> Result<(), StoreError> {
        let full = self.resolve(path);
        let result = if full.is_dir() {
            fs::remove_dir_all(&full)
        } else if full.exists() {
            fs::remove_file(&full)
        } else {
            return Ok(());
        };
        result.map_err(|e| StoreError::io(full, e))
    }
}

#[derive(Debug, Clone)]
struct MemoryFile {
    contents: String,
    modified: SystemTime,
}

/// In-memory [`StateStore`] for tests and dry runs.
///
/// Directories exist implicitly while they contain files; [`MemoryStore::mkdir`]
/// creates an empty one explicitly.
#[derive(Debug, Default)]
pub struct MemoryStore {
    files: Mutex<BTreeMap<String, MemoryFile>>,
    dirs: Mutex<Vec<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty directory.
    pub fn mkdir(&self, dir: &str) {
        let dir = normalize(dir);
        let mut dirs = self.dirs.lock().unwrap_or_else(|e| e.into_inner());
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    }

    /// Writes a file with an explicit modification time.
    pub fn write_at(&self, path: &str, contents: &str, modified: SystemTime) {
        self.files.lock().unwrap_or_else(|e| e.into_inner()).insert(
            normalize(path),
            MemoryFile {
                contents: contents.to_string(),
                modified,
            },
        );
    }

    /// Returns every stored file path, sorted.
    pub fn paths(&self) -> Vec<String> {
        self.files
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}

fn normalize(path: &str) -> String {
    path.trim_end_matches('/').to_string()
}

fn dir_prefix(dir: &str) -> String {
    let dir = normalize(dir);
    if dir.is_empty() {
        String::new()
    } else {
        format!("{}/", dir)
    }
}

impl StateStore for MemoryStore {
    fn exists(&self, path: &str) -> bool {
        let path = normalize(path);
        let prefix = dir_prefix(&path);
        let files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        files.contains_key(&path)
            || files.keys().any(|k| k.starts_with(&prefix))
            || self
                .dirs
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .any(|d| *d == path || d.starts_with(&prefix))
    }

    fn list(&self, dir: &str) -> Result<Option<Vec<String>>, StoreError> {
        if !self.exists(dir) {
            return Ok(None);
        }
        let prefix = dir_prefix(dir);
        let files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        if files.contains_key(&normalize(dir)) {
            // A plain file is not a directory.
            return Ok(None);
        }
        let listed = files
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .map(str::to_string)
            .collect();
        Ok(Some(listed))
    }

    fn read(&self, path: &str) -> Result<String, StoreError> {
        self.files
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&normalize(path))
            .map(|f| f.contents.clone())
            .ok_or_else(|| StoreError::NotFound(path.to_string()))
    }

    fn write(&self, path: &str, contents: &str) -> Result<(), StoreError> {
        self.write_at(path, contents, SystemTime::now());
        Ok(())
    }

    fn modified(&self, path: &str) -> Option<SystemTime> {
        let path = normalize(path);
        let prefix = dir_prefix(&path);
        let files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(file) = files.get(&path) {
            return Some(file.modified);
        }
        // Directories report their newest member.
        let newest = files
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(_, f)| f.modified)
            .max();
        drop(files);
        newest.or_else(|| self.exists(&path).then(|| SystemTime::UNIX_EPOCH))
    }

    fn remove(&self, path: &str) -> Result<(), StoreError> {
        let path = normalize(path);
        let prefix = dir_prefix(&path);
        self.files
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|k, _| *k != path && !k.starts_with(&prefix));
        self.dirs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|d| *d != path && !d.starts_with(&prefix));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_memory_store_write_read() {
        let store = MemoryStore::new();
        store.write("a/b.txt", "hello").unwrap();

        assert!(store.exists("a/b.txt"));
        assert!(store.exists("a"));
        assert_eq!(store.read("a/b.txt").unwrap(), "hello");
        assert!(matches!(store.read("a/c.txt"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_memory_store_list_distinguishes_missing_and_empty() {
        let store = MemoryStore::new();
        assert!(store.list("requests").unwrap().is_none());

        store.mkdir("requests");
        assert_eq!(store.list("requests").unwrap(), Some(Vec::new()));

        store.write("requests/unit.0.request", "").unwrap();
        store.write("requests/nested/unit.1.request", "").unwrap();
        let listed = store.list("requests/").unwrap().unwrap();
        assert_eq!(listed, vec!["nested/unit.1.request", "unit.0.request"]);
    }

    #[test]
    fn test_memory_store_list_of_file_is_none() {
        let store = MemoryStore::new();
        store.write("plain.txt", "x").unwrap();
        assert!(store.list("plain.txt").unwrap().is_none());
    }

    #[test]
    fn test_memory_store_modified_directory_uses_newest_member() {
        let store = MemoryStore::new();
        let old = SystemTime::UNIX_EPOCH + Duration::from_secs(10);
        let new = SystemTime::UNIX_EPOCH + Duration::from_secs(20);
        store.write_at("dir/a", "", old);
        store.write_at("dir/b", "", new);

        assert_eq!(store.modified("dir"), Some(new));
        assert_eq!(store.modified("dir/a"), Some(old));
        assert_eq!(store.modified("missing"), None);
    }

    #[test]
    fn test_memory_store_remove_tree() {
        let store = MemoryStore::new();
        store.write("out/x", "").unwrap();
        store.write("out/y/z", "").unwrap();
        store.write("outside", "").unwrap();

        store.remove("out").unwrap();
        assert!(!store.exists("out"));
        assert!(store.exists("outside"));
        assert!(store.remove("never-there").is_ok());
    }

    #[test]
    fn test_fs_store_roundtrip() {
        let temp_dir = tempdir().unwrap();
        let store = FsStore::new(temp_dir.path());

        store.write("nested/dir/file.txt", "content").unwrap();
        assert!(store.exists("nested/dir/file.txt"));
        assert_eq!(store.read("nested/dir/file.txt").unwrap(), "content");
        assert!(store.modified("nested/dir/file.txt").is_some());

        let listed = store.list("nested").unwrap().unwrap();
        assert_eq!(listed, vec!["dir/file.txt"]);
        assert!(store.list("absent").unwrap().is_none());

        store.remove("nested").unwrap();
        assert!(!store.exists("nested"));
    }
}
