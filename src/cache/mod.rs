//! Cached artifacts: keys, paths, and the cache log.
//!
//! Every artifact lives in a cache directory on a storage connection and is
//! named after the source and the cache key:
//!
//! | Artifact | Path |
//! |---|---|
//! | Primary image | `<cache_dir>/<base>_<key>.<ext>` |
//! | LQIP placeholder | `<cache_dir>/<base>_<key>_lqip.<ext>` |
//! | Dominant-colour placeholder | `<cache_dir>/<base>_<key>_dominant.png` |
//! | Responsive variant | `<cache_dir>/<base>_<key>_<width>w.<ext>` |
//! | JPEG fallback | `<cache_dir>/<base>_<key>_fallback.jpg` |
//!
//! `<base>` is the source file name without extension (see
//! [`base_identifier`]); it keeps cache directories browsable and is also
//! hashed into the key, so two sources with the same parameters never share
//! an artifact.
//!
//! The key alone decides identity ([`key`]); freshness and the template
//! variables replayed on a hit come from the cache log ([`log`]).

pub mod key;
pub mod log;

use crate::imaging::ImagingError;
use crate::storage::{StorageAdapter, StorageError, join_path};
use self::log::{CacheLog, CacheRow, LOG_FILENAME, unix_now};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

pub use key::{CACHE_KEY_PARAMS, generate_cache_key, is_cache_relevant};
pub use self::log::{CacheIndex, LogUpdate};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("Cache log is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Cached artifact unreadable: {0}")]
    Imaging(#[from] ImagingError),
}

/// Paths of every artifact derived from one cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    dir: String,
    stem: String,
}

impl ArtifactPaths {
    pub fn new(cache_dir: &str, base: &str, key: &str) -> Self {
        Self {
            dir: cache_dir.trim_matches('/').to_string(),
            stem: format!("{base}_{key}"),
        }
    }

    pub fn dir(&self) -> &str {
        &self.dir
    }

    pub fn primary(&self, ext: &str) -> String {
        self.file(&format!("{}.{ext}", self.stem))
    }

    pub fn lqip(&self, ext: &str) -> String {
        self.file(&format!("{}_lqip.{ext}", self.stem))
    }

    pub fn dominant(&self) -> String {
        self.file(&format!("{}_dominant.png", self.stem))
    }

    pub fn variant(&self, width: u32, ext: &str) -> String {
        self.file(&format!("{}_{width}w.{ext}", self.stem))
    }

    pub fn jpeg_fallback(&self) -> String {
        self.file(&format!("{}_fallback.jpg", self.stem))
    }

    fn file(&self, name: &str) -> String {
        join_path(&[&self.dir, name])
    }
}

/// File-name-safe identifier for a source: the last path segment without
/// query string or extension, with anything outside `[A-Za-z0-9_-]` replaced.
///
/// # Examples
/// ```
/// # use pictor::cache::base_identifier;
/// assert_eq!(base_identifier("images/My Photo.jpg"), "My-Photo");
/// assert_eq!(base_identifier("https://x.test/a/b.png?v=2"), "b");
/// assert_eq!(base_identifier(""), "image");
/// ```
pub fn base_identifier(src: &str) -> String {
    let path = src.split(['?', '#']).next().unwrap_or(src);
    let name = path.rsplit(['/', '\\']).next().unwrap_or(path);
    let stem = match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    };
    let cleaned: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '-' })
        .collect();
    let cleaned = cleaned.trim_matches('-');
    if cleaned.is_empty() {
        "image".to_string()
    } else {
        cleaned.to_string()
    }
}

// =============================================================================
// Listing
// =============================================================================

/// One file found in a cache directory.
#[derive(Debug, Clone, Serialize)]
pub struct CachedArtifact {
    pub path: String,
    pub size: u64,
    pub fresh: bool,
    pub row: Option<CacheRow>,
}

/// Everything in a cache directory, with its log rows. The log document
/// itself is not listed.
pub fn list_artifacts(
    log: &CacheLog,
    storage: &dyn StorageAdapter,
    cache_dir: &str,
) -> Result<Vec<CachedArtifact>, CacheError> {
    let doc = log.read_all(storage, cache_dir)?;
    let now = unix_now();
    let mut artifacts = Vec::new();
    for path in storage.list(cache_dir)? {
        if path.ends_with(LOG_FILENAME) {
            continue;
        }
        let size = storage.size(&path)?;
        let row = doc.entries.get(&path).cloned();
        let fresh = row.as_ref().is_some_and(|r| r.is_fresh_within(now, None));
        artifacts.push(CachedArtifact {
            path,
            size,
            fresh,
            row,
        });
    }
    Ok(artifacts)
}

/// Summary of a cache directory.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub fresh: u32,
    pub stale: u32,
    /// Files with no log row.
    pub untracked: u32,
    pub bytes: u64,
}

impl CacheStats {
    pub fn from_artifacts(artifacts: &[CachedArtifact]) -> Self {
        let mut stats = Self::default();
        for a in artifacts {
            stats.bytes += a.size;
            match (&a.row, a.fresh) {
                (None, _) => stats.untracked += 1,
                (Some(_), true) => stats.fresh += 1,
                (Some(_), false) => stats.stale += 1,
            }
        }
        stats
    }

    pub fn total(&self) -> u32 {
        self.fresh + self.stale + self.untracked
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.total() == 0 {
            return write!(f, "cache empty");
        }
        write!(f, "{} fresh, {} stale", self.fresh, self.stale)?;
        if self.untracked > 0 {
            write!(f, ", {} untracked", self.untracked)?;
        }
        write!(f, " ({} files, {} bytes)", self.total(), self.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStorage;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tempfile::TempDir;

    // =========================================================================
    // Paths
    // =========================================================================

    #[test]
    fn artifact_paths_share_stem() {
        let paths = ArtifactPaths::new("/images/cache/", "photo", "abc123");
        assert_eq!(paths.primary("jpg"), "images/cache/photo_abc123.jpg");
        assert_eq!(paths.lqip("jpg"), "images/cache/photo_abc123_lqip.jpg");
        assert_eq!(paths.dominant(), "images/cache/photo_abc123_dominant.png");
        assert_eq!(paths.variant(400, "webp"), "images/cache/photo_abc123_400w.webp");
        assert_eq!(paths.jpeg_fallback(), "images/cache/photo_abc123_fallback.jpg");
    }

    #[test]
    fn base_identifier_strips_directories_and_extension() {
        assert_eq!(base_identifier("a/b/photo.final.jpg"), "photo-final");
        assert_eq!(base_identifier("C:\\pics\\x.png"), "x");
        assert_eq!(base_identifier(".hidden"), "hidden");
        assert_eq!(base_identifier("???"), "image");
    }

    // =========================================================================
    // Listing and stats
    // =========================================================================

    #[test]
    fn list_skips_log_and_classifies_rows() {
        let tmp = TempDir::new().unwrap();
        let s = LocalStorage::new(tmp.path(), "/");
        let log = CacheLog::new(3600);
        let vars = BTreeMap::new();
        s.write("cache/a.jpg", b"aaaa").unwrap();
        s.write("cache/b.jpg", b"bb").unwrap();
        log.update_cache_log(
            &s,
            &LogUpdate {
                cache_dir: "cache",
                cache_path: "cache/a.jpg",
                connection: "local",
                source_path: "a.jpg",
                width: 1,
                height: 1,
                filesize: 4,
                mime_type: "image/jpeg",
                processing_time: Duration::ZERO,
                template_variables: &vars,
                freshness_window: None,
                force_update: false,
                using_cache_copy: false,
            },
        )
        .unwrap();

        let listed = list_artifacts(&log, &s, "cache").unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed[0].fresh && listed[0].row.is_some());
        assert!(listed[1].row.is_none());

        let stats = CacheStats::from_artifacts(&listed);
        assert_eq!(
            stats,
            CacheStats {
                fresh: 1,
                stale: 0,
                untracked: 1,
                bytes: 6
            }
        );
        assert_eq!(stats.to_string(), "1 fresh, 0 stale, 1 untracked (2 files, 6 bytes)");
    }

    #[test]
    fn empty_stats_display() {
        assert_eq!(CacheStats::default().to_string(), "cache empty");
    }
}
