//! Cache log: the durable record of what is in a cache directory.
//!
//! The log is a versioned JSON document at `<cache_dir>/.cache-log.json` on
//! the connection that holds the artifacts. It maps each connection-relative
//! cache path to a [`CacheRow`]: where the artifact came from, what it
//! measures, when it was written, how long it stays fresh, and the full set
//! of template variables computed when it was produced. A cache hit replays
//! those variables instead of re-reading the image.
//!
//! ## Lookups
//!
//! A run calls [`CacheLog::preload_index`] once per cache directory and
//! answers every later lookup from that [`CacheIndex`] snapshot. The index is
//! read-only; the persisted document stays authoritative. A missing,
//! unreadable, or version-mismatched document yields an empty index.
//!
//! When the log has no row for a path but the artifact exists, the storage
//! modification time is checked against the default TTL, and a hit
//! synthesises a row by re-reading the artifact's dimensions.
//!
//! ## Writes
//!
//! [`CacheLog::update_cache_log`] re-reads the document, inserts one row, and
//! publishes it through the adapter's atomic write, all under a process-wide
//! lock so derived variants written from worker threads never drop each
//! other's rows. A lost update between processes only costs a future cache
//! hit, since the filesystem check still finds the artifact.

use super::CacheError;
use crate::imaging::{OutputFormat, codec};
use crate::storage::{StorageAdapter, join_path};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Name of the log document within a cache directory.
pub const LOG_FILENAME: &str = ".cache-log.json";

/// Bump to discard every existing log when the row format changes.
const LOG_VERSION: u32 = 1;

/// One cached artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRow {
    pub source_path: String,
    pub width: u32,
    pub height: u32,
    pub filesize: u64,
    pub mime_type: String,
    /// Unix seconds when the artifact was written.
    pub created: u64,
    /// Seconds the artifact stays fresh. `0` never expires.
    pub freshness_window: u64,
    #[serde(default)]
    pub processing_time_ms: f64,
    #[serde(default)]
    pub template_variables: BTreeMap<String, String>,
}

impl CacheRow {
    pub fn is_fresh(&self) -> bool {
        self.is_fresh_within(unix_now(), None)
    }

    /// Fresh at `now`, using `window` instead of the stored window if given.
    pub fn is_fresh_within(&self, now: u64, window: Option<u64>) -> bool {
        let window = window.unwrap_or(self.freshness_window);
        window == 0 || now.saturating_sub(self.created) < window
    }
}

/// The persisted document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogDocument {
    pub version: u32,
    pub entries: BTreeMap<String, CacheRow>,
}

impl LogDocument {
    fn empty() -> Self {
        Self {
            version: LOG_VERSION,
            entries: BTreeMap::new(),
        }
    }
}

/// In-memory snapshot of one cache directory's log.
#[derive(Debug, Clone, Default)]
pub struct CacheIndex {
    cache_dir: String,
    entries: BTreeMap<String, CacheRow>,
}

impl CacheIndex {
    pub fn cache_dir(&self) -> &str {
        &self.cache_dir
    }

    pub fn get(&self, path: &str) -> Option<&CacheRow> {
        self.entries.get(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Everything recorded for one freshly written artifact.
#[derive(Debug, Clone)]
pub struct LogUpdate<'a> {
    pub cache_dir: &'a str,
    pub cache_path: &'a str,
    pub connection: &'a str,
    pub source_path: &'a str,
    pub width: u32,
    pub height: u32,
    pub filesize: u64,
    pub mime_type: &'a str,
    pub processing_time: Duration,
    pub template_variables: &'a BTreeMap<String, String>,
    /// Overrides the log's default TTL.
    pub freshness_window: Option<u64>,
    pub force_update: bool,
    /// The artifact was served from cache; nothing new to record.
    pub using_cache_copy: bool,
}

/// Reads and writes cache logs through a storage adapter.
#[derive(Debug)]
pub struct CacheLog {
    default_ttl: u64,
    write_lock: Mutex<()>,
}

impl CacheLog {
    pub fn new(default_ttl: u64) -> Self {
        Self {
            default_ttl,
            write_lock: Mutex::new(()),
        }
    }

    pub fn default_ttl(&self) -> u64 {
        self.default_ttl
    }

    pub fn log_path(cache_dir: &str) -> String {
        join_path(&[cache_dir, LOG_FILENAME])
    }

    /// Load a cache directory's log into memory. Never fails: an unreadable
    /// log is logged and treated as empty.
    pub fn preload_index(&self, storage: &dyn StorageAdapter, cache_dir: &str) -> CacheIndex {
        let entries = match self.read_all(storage, cache_dir) {
            Ok(doc) => doc.entries,
            Err(e) => {
                warn!(cache_dir, error = %e, "cache log unreadable, starting empty");
                BTreeMap::new()
            }
        };
        debug!(cache_dir, rows = entries.len(), "preloaded cache index");
        CacheIndex {
            cache_dir: cache_dir.to_string(),
            entries,
        }
    }

    /// Read the persisted document. A missing document or one written by
    /// another format version reads as empty.
    pub fn read_all(
        &self,
        storage: &dyn StorageAdapter,
        cache_dir: &str,
    ) -> Result<LogDocument, CacheError> {
        let path = Self::log_path(cache_dir);
        if !storage.exists(&path) {
            return Ok(LogDocument::empty());
        }
        let bytes = storage.read(&path)?;
        let doc: LogDocument = serde_json::from_slice(&bytes)?;
        if doc.version != LOG_VERSION {
            debug!(path, version = doc.version, "discarding cache log of other version");
            return Ok(LogDocument::empty());
        }
        Ok(doc)
    }

    /// Whether `path` holds a fresh artifact.
    ///
    /// `ttl_override` replaces both the row's window and the default TTL.
    pub fn is_in_cache(
        &self,
        index: &CacheIndex,
        storage: &dyn StorageAdapter,
        path: &str,
        ttl_override: Option<u64>,
    ) -> bool {
        let now = unix_now();
        match index.get(path) {
            Some(row) => row.is_fresh_within(now, ttl_override) && storage.exists(path),
            None => {
                if !storage.exists(path) {
                    return false;
                }
                let window = ttl_override.unwrap_or(self.default_ttl);
                if window == 0 {
                    return true;
                }
                match storage.modified(path) {
                    Ok(mtime) => now.saturating_sub(unix_secs(mtime)) < window,
                    Err(e) => {
                        debug!(path, error = %e, "no mtime for cached file, treating as stale");
                        false
                    }
                }
            }
        }
    }

    /// The row for a cached artifact. Without a logged row one is rebuilt
    /// from the artifact itself, with no template variables.
    pub fn load_cached_data(
        &self,
        index: &CacheIndex,
        storage: &dyn StorageAdapter,
        path: &str,
    ) -> Result<CacheRow, CacheError> {
        if let Some(row) = index.get(path) {
            return Ok(row.clone());
        }
        let bytes = storage.read(path)?;
        let ext = path.rsplit('.').next().unwrap_or_default();
        let format = OutputFormat::from_extension(ext);
        let (width, height) = match format {
            Some(OutputFormat::Svg) => codec::svg_dimensions(&bytes).unwrap_or((0, 0)),
            _ => codec::dimensions(&bytes)?,
        };
        let created = storage.modified(path).map(unix_secs).unwrap_or_else(|_| unix_now());
        debug!(path, width, height, "rebuilt cache row from artifact");
        Ok(CacheRow {
            source_path: String::new(),
            width,
            height,
            filesize: bytes.len() as u64,
            mime_type: format
                .map(|f| f.mime_type().to_string())
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            created,
            freshness_window: self.default_ttl,
            processing_time_ms: 0.0,
            template_variables: BTreeMap::new(),
        })
    }

    /// Record a written artifact. Returns `false` when there was nothing to
    /// record (the artifact came from cache and no update was forced).
    pub fn update_cache_log(
        &self,
        storage: &dyn StorageAdapter,
        update: &LogUpdate<'_>,
    ) -> Result<bool, CacheError> {
        if update.using_cache_copy && !update.force_update {
            return Ok(false);
        }
        let row = CacheRow {
            source_path: update.source_path.to_string(),
            width: update.width,
            height: update.height,
            filesize: update.filesize,
            mime_type: update.mime_type.to_string(),
            created: unix_now(),
            freshness_window: update.freshness_window.unwrap_or(self.default_ttl),
            processing_time_ms: update.processing_time.as_secs_f64() * 1000.0,
            template_variables: update.template_variables.clone(),
        };

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut doc = match self.read_all(storage, update.cache_dir) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(cache_dir = update.cache_dir, error = %e, "rewriting unreadable cache log");
                LogDocument::empty()
            }
        };
        doc.entries.insert(update.cache_path.to_string(), row);
        let json = serde_json::to_vec_pretty(&doc)?;
        storage.write(&Self::log_path(update.cache_dir), &json)?;
        debug!(
            path = update.cache_path,
            connection = update.connection,
            "cache log updated"
        );
        Ok(true)
    }

    /// Delete every artifact in a cache directory and its log. Returns the
    /// number of files removed.
    pub fn clear(&self, storage: &dyn StorageAdapter, cache_dir: &str) -> Result<usize, CacheError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let files = storage.list(cache_dir)?;
        for file in &files {
            storage.remove(file)?;
        }
        Ok(files.len())
    }
}

pub fn unix_now() -> u64 {
    unix_secs(SystemTime::now())
}

fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}
