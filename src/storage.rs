//! Storage adapters and named connections.
//!
//! Every persisted byte (cached images, placeholders, the cache log) goes
//! through a [`StorageAdapter`]. Paths are always connection-relative and
//! `/`-separated; an adapter decides what they mean (a directory under a
//! filesystem root for [`LocalStorage`], a key prefix for an object store).
//!
//! ## Atomic publish
//!
//! [`LocalStorage::write`] never writes in place. Bytes go to a temporary
//! file in the destination directory which is then renamed over the target,
//! so concurrent readers observe either the previous file or the complete new
//! one. Two writers racing on the same path both succeed and the last rename
//! wins; since they produced the same key, they produced the same bytes.
//!
//! Directory creation is idempotent (`create_dir_all`), so check-then-create
//! races between concurrent runs are harmless.

use crate::config::{ConfigError, Settings};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Path escapes connection root: {0}")]
    InvalidPath(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl StorageError {
    fn io(path: &str, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(path.to_string())
        } else {
            StorageError::Io {
                path: path.to_string(),
                source,
            }
        }
    }
}

/// Byte-level storage backing one named connection.
///
/// Implementations must be `Send + Sync`: derived variants are written from
/// a rayon pool.
pub trait StorageAdapter: Send + Sync {
    fn exists(&self, path: &str) -> bool;

    fn read(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    /// Write bytes, replacing any existing file atomically.
    fn write(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError>;

    fn remove(&self, path: &str) -> Result<(), StorageError>;

    fn directory_exists(&self, path: &str) -> bool;

    /// Create a directory and its parents. Succeeds if it already exists.
    fn create_directory(&self, path: &str) -> Result<(), StorageError>;

    fn size(&self, path: &str) -> Result<u64, StorageError>;

    fn modified(&self, path: &str) -> Result<SystemTime, StorageError>;

    /// All files below `dir`, as connection-relative paths, sorted.
    fn list(&self, dir: &str) -> Result<Vec<String>, StorageError>;

    /// Public URL for a connection-relative path.
    fn public_url(&self, path: &str) -> String;
}

/// Local-disk storage rooted at a directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
    url_prefix: String,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>, url_prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            url_prefix: url_prefix.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a connection-relative path, rejecting `..` and absolute paths.
    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let rel = Path::new(path.trim_start_matches('/'));
        for component in rel.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => return Err(StorageError::InvalidPath(path.to_string())),
            }
        }
        Ok(self.root.join(rel))
    }
}

impl StorageAdapter for LocalStorage {
    fn exists(&self, path: &str) -> bool {
        self.resolve(path).is_ok_and(|p| p.is_file())
    }

    fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let full = self.resolve(path)?;
        std::fs::read(&full).map_err(|e| StorageError::io(path, e))
    }

    fn write(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        let parent = full
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        std::fs::create_dir_all(&parent).map_err(|e| StorageError::io(path, e))?;

        let mut tmp =
            tempfile::NamedTempFile::new_in(&parent).map_err(|e| StorageError::io(path, e))?;
        tmp.write_all(bytes).map_err(|e| StorageError::io(path, e))?;
        tmp.flush().map_err(|e| StorageError::io(path, e))?;
        tmp.persist(&full)
            .map_err(|e| StorageError::io(path, e.error))?;
        debug!(path, bytes = bytes.len(), "wrote file");
        Ok(())
    }

    fn remove(&self, path: &str) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        std::fs::remove_file(&full).map_err(|e| StorageError::io(path, e))
    }

    fn directory_exists(&self, path: &str) -> bool {
        self.resolve(path).is_ok_and(|p| p.is_dir())
    }

    fn create_directory(&self, path: &str) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        std::fs::create_dir_all(&full).map_err(|e| StorageError::io(path, e))
    }

    fn size(&self, path: &str) -> Result<u64, StorageError> {
        let full = self.resolve(path)?;
        std::fs::metadata(&full)
            .map(|m| m.len())
            .map_err(|e| StorageError::io(path, e))
    }

    fn modified(&self, path: &str) -> Result<SystemTime, StorageError> {
        let full = self.resolve(path)?;
        std::fs::metadata(&full)
            .and_then(|m| m.modified())
            .map_err(|e| StorageError::io(path, e))
    }

    fn list(&self, dir: &str) -> Result<Vec<String>, StorageError> {
        let full = self.resolve(dir)?;
        if !full.is_dir() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in walkdir::WalkDir::new(&full) {
            let entry = entry.map_err(|e| StorageError::Io {
                path: dir.to_string(),
                source: e.into(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                let joined = rel
                    .components()
                    .filter_map(|c| match c {
                        Component::Normal(s) => s.to_str(),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("/");
                files.push(joined);
            }
        }
        files.sort();
        Ok(files)
    }

    fn public_url(&self, path: &str) -> String {
        join_url(&self.url_prefix, path)
    }
}

/// Join a URL prefix and a relative path with exactly one `/` between them.
pub fn join_url(prefix: &str, path: &str) -> String {
    let path = path.trim_start_matches('/');
    if prefix.is_empty() {
        return format!("/{path}");
    }
    format!("{}/{}", prefix.trim_end_matches('/'), path)
}

/// Join connection-relative path segments, ignoring empty ones.
pub fn join_path(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Named storage connections.
#[derive(Clone, Default)]
pub struct Connections {
    adapters: BTreeMap<String, Arc<dyn StorageAdapter>>,
    default: String,
}

impl Connections {
    /// Build local-disk connections for every `[connections.*]` entry.
    ///
    /// Relative roots resolve against `settings.base_path`.
    pub fn from_settings(settings: &Settings) -> Self {
        let mut adapters: BTreeMap<String, Arc<dyn StorageAdapter>> = BTreeMap::new();
        for (name, conn) in &settings.connections {
            let root = if conn.root.is_absolute() {
                conn.root.clone()
            } else {
                settings.base_path.join(&conn.root)
            };
            adapters.insert(
                name.clone(),
                Arc::new(LocalStorage::new(root, conn.url_prefix.clone())),
            );
        }
        Self {
            adapters,
            default: settings.default_connection.clone(),
        }
    }

    /// Register (or replace) an adapter under a name.
    pub fn insert(&mut self, name: impl Into<String>, adapter: Arc<dyn StorageAdapter>) {
        let name = name.into();
        if self.default.is_empty() {
            self.default = name.clone();
        }
        self.adapters.insert(name, adapter);
    }

    pub fn default_name(&self) -> &str {
        &self.default
    }

    /// Resolve a connection, `None` meaning the default one.
    pub fn get(&self, name: Option<&str>) -> Result<(&str, &dyn StorageAdapter), StorageError> {
        let name = name.unwrap_or(&self.default);
        self.adapters
            .get_key_value(name)
            .map(|(k, v)| (k.as_str(), v.as_ref()))
            .ok_or_else(|| StorageError::Config(ConfigError::UnknownConnection(name.to_string())))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.adapters.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn storage() -> (TempDir, LocalStorage) {
        let tmp = TempDir::new().unwrap();
        let s = LocalStorage::new(tmp.path(), "/media/");
        (tmp, s)
    }

    #[test]
    fn write_creates_parent_directories() {
        let (_tmp, s) = storage();
        s.write("a/b/c.txt", b"hello").unwrap();
        assert!(s.exists("a/b/c.txt"));
        assert!(s.directory_exists("a/b"));
        assert_eq!(s.read("a/b/c.txt").unwrap(), b"hello");
        assert_eq!(s.size("a/b/c.txt").unwrap(), 5);
    }

    #[test]
    fn write_replaces_existing_file() {
        let (_tmp, s) = storage();
        s.write("x.bin", b"first").unwrap();
        s.write("x.bin", b"second!").unwrap();
        assert_eq!(s.read("x.bin").unwrap(), b"second!");
    }

    #[test]
    fn write_leaves_no_temp_files() {
        let (_tmp, s) = storage();
        s.write("dir/x.bin", b"1").unwrap();
        s.write("dir/x.bin", b"2").unwrap();
        assert_eq!(s.list("dir").unwrap(), vec!["dir/x.bin".to_string()]);
    }

    #[test]
    fn read_missing_is_not_found() {
        let (_tmp, s) = storage();
        assert!(matches!(s.read("nope.jpg"), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn parent_traversal_rejected() {
        let (_tmp, s) = storage();
        assert!(matches!(
            s.write("../escape.txt", b"x"),
            Err(StorageError::InvalidPath(_))
        ));
        assert!(!s.exists("../etc/passwd"));
    }

    #[test]
    fn create_directory_is_idempotent() {
        let (_tmp, s) = storage();
        s.create_directory("cache/x").unwrap();
        s.create_directory("cache/x").unwrap();
        assert!(s.directory_exists("cache/x"));
    }

    #[test]
    fn list_is_sorted_and_relative() {
        let (_tmp, s) = storage();
        s.write("c/b.jpg", b"1").unwrap();
        s.write("c/a.jpg", b"1").unwrap();
        s.write("c/sub/z.jpg", b"1").unwrap();
        assert_eq!(
            s.list("c").unwrap(),
            vec!["c/a.jpg", "c/b.jpg", "c/sub/z.jpg"]
        );
        assert!(s.list("missing").unwrap().is_empty());
    }

    #[test]
    fn public_url_joins_cleanly() {
        let (_tmp, s) = storage();
        assert_eq!(s.public_url("images/a.jpg"), "/media/images/a.jpg");
        assert_eq!(join_url("https://cdn.x", "/a.jpg"), "https://cdn.x/a.jpg");
        assert_eq!(join_url("", "a.jpg"), "/a.jpg");
    }

    #[test]
    fn join_path_skips_empty_segments() {
        assert_eq!(join_path(&["images/", "", "/cache", "a.jpg"]), "images/cache/a.jpg");
    }

    #[test]
    fn connections_from_settings_resolve_default() {
        let tmp = TempDir::new().unwrap();
        let mut settings = Settings::default();
        settings.base_path = tmp.path().to_path_buf();
        let conns = Connections::from_settings(&settings);
        let (name, adapter) = conns.get(None).unwrap();
        assert_eq!(name, "local");
        adapter.write("f.txt", b"x").unwrap();
        assert!(tmp.path().join("public/f.txt").exists());
        assert!(conns.get(Some("missing")).is_err());
    }
}
