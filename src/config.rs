//! Pipeline settings.
//!
//! Handles loading, validating, and merging `pictor.toml`. Settings are the
//! system-wide defaults behind every tag parameter: a tag that omits
//! `quality` gets `defaults.quality`, a tag that omits `connection` writes to
//! `default_connection`, and so on.
//!
//! ## Configuration Options
//!
//! ```toml
//! # All options are optional - defaults shown below
//!
//! base_path = "."                 # Root for relative local `src` paths
//! default_connection = "local"
//!
//! [connections.local]
//! root = "public"                 # Filesystem root of this connection
//! url_prefix = "/"                # Public URL prefix for cached files
//!
//! [cache]
//! dir = "images/cache"            # Cache directory, connection-relative
//! default_ttl = 2678400           # Seconds; 0 = never expires
//!
//! [defaults]
//! quality = 85
//! png_compression = 6             # 0-9
//! fit = "contain"
//! format = ""                     # Empty = keep source format
//! allow_scale_larger = false
//! class = ""
//! add_dimensions = true
//!
//! [lazy]
//! mode = "no"                     # no | html5 | lqip | dominant_color | js_lqip | js_dominant_color
//! lqip_width = 32
//! lqip_quality = 30
//! lqip_blur = 2.0
//!
//! [fallback]
//! src = ""                        # Local path or URL used when all else fails
//! colour = "#cccccc"
//! colour_fill = false             # Use a flat colour when no source is given
//!
//! [auto_adjust]
//! enabled = false
//! max_width = 4000
//! max_height = 4000
//! max_filesize = 0                # Bytes; 0 = unlimited
//!
//! [remote]
//! timeout_secs = 10
//! max_bytes = 20971520
//!
//! [processing]
//! max_processes = 4               # Max parallel variant workers (omit for auto)
//!
//! [action]
//! secret = ""
//! endpoint = "/pictor"
//!
//! [heic]
//! primary = ["heif-convert", "{input}", "{output}"]
//! secondary = ["magick", "{input}", "{output}"]
//! ```
//!
//! Unknown keys are rejected to catch typos early.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// File name looked up by [`load_settings`].
pub const SETTINGS_FILENAME: &str = "pictor.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
    #[error("Unknown connection: {0}")]
    UnknownConnection(String),
}

/// Settings loaded from `pictor.toml`.
///
/// All fields have defaults. User files need only specify the values they
/// want to override. Unknown keys are rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Root directory that relative local `src` values resolve against.
    pub base_path: PathBuf,
    /// Connection used when a tag does not name one.
    pub default_connection: String,
    /// Named storage connections.
    pub connections: BTreeMap<String, ConnectionConfig>,
    pub cache: CacheConfig,
    pub defaults: DefaultsConfig,
    pub lazy: LazyConfig,
    pub fallback: FallbackConfig,
    pub auto_adjust: AutoAdjustConfig,
    pub remote: RemoteConfig,
    pub processing: ProcessingConfig,
    pub action: ActionConfig,
    pub heic: HeicConfig,
}

impl Default for Settings {
    fn default() -> Self {
        let mut connections = BTreeMap::new();
        connections.insert("local".to_string(), ConnectionConfig::default());
        Self {
            base_path: PathBuf::from("."),
            default_connection: "local".to_string(),
            connections,
            cache: CacheConfig::default(),
            defaults: DefaultsConfig::default(),
            lazy: LazyConfig::default(),
            fallback: FallbackConfig::default(),
            auto_adjust: AutoAdjustConfig::default(),
            remote: RemoteConfig::default(),
            processing: ProcessingConfig::default(),
            action: ActionConfig::default(),
            heic: HeicConfig::default(),
        }
    }
}

impl Settings {
    /// Validate values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.defaults.quality > 100 {
            return Err(ConfigError::Validation(
                "defaults.quality must be 0-100".into(),
            ));
        }
        if self.defaults.png_compression > 9 {
            return Err(ConfigError::Validation(
                "defaults.png_compression must be 0-9".into(),
            ));
        }
        if !["contain", "cover", "distort"].contains(&self.defaults.fit.as_str()) {
            return Err(ConfigError::Validation(format!(
                "defaults.fit must be contain, cover or distort (got {:?})",
                self.defaults.fit
            )));
        }
        if self.lazy.lqip_quality > 100 {
            return Err(ConfigError::Validation(
                "lazy.lqip_quality must be 0-100".into(),
            ));
        }
        if self.lazy.lqip_width == 0 {
            return Err(ConfigError::Validation(
                "lazy.lqip_width must be non-zero".into(),
            ));
        }
        if self.remote.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "remote.timeout_secs must be non-zero".into(),
            ));
        }
        if !self.connections.contains_key(&self.default_connection) {
            return Err(ConfigError::UnknownConnection(
                self.default_connection.clone(),
            ));
        }
        if self.cache.dir.trim_matches('/').is_empty() {
            return Err(ConfigError::Validation("cache.dir must not be empty".into()));
        }
        Ok(())
    }

    /// Look up a connection by name, falling back to the default connection
    /// when `name` is `None`.
    pub fn connection(&self, name: Option<&str>) -> Result<(&str, &ConnectionConfig), ConfigError> {
        let name = name.unwrap_or(&self.default_connection);
        self.connections
            .get_key_value(name)
            .map(|(k, v)| (k.as_str(), v))
            .ok_or_else(|| ConfigError::UnknownConnection(name.to_string()))
    }

    /// Settings as a TOML table (the `get_all` view of the store).
    pub fn to_value(&self) -> toml::Value {
        toml::Value::try_from(self).unwrap_or_else(|_| toml::Value::Table(Default::default()))
    }

    /// Look up a setting by dotted key, e.g. `"cache.default_ttl"`.
    pub fn get(&self, dotted_key: &str) -> Option<toml::Value> {
        let mut current = self.to_value();
        for part in dotted_key.split('.') {
            current = current.as_table()?.get(part)?.clone();
        }
        Some(current)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote.timeout_secs)
    }
}

/// A named storage connection. Only local-disk connections ship with the
/// crate; other adapters are registered in code through
/// [`crate::storage::Connections::insert`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionConfig {
    /// Filesystem root; relative paths resolve against `base_path`.
    pub root: PathBuf,
    /// Prefix prepended to connection-relative paths to form public URLs.
    pub url_prefix: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("public"),
            url_prefix: "/".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Cache directory, relative to the connection root.
    pub dir: String,
    /// Freshness window in seconds for new cache rows. `0` never expires.
    pub default_ttl: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: "images/cache".to_string(),
            default_ttl: 31 * 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DefaultsConfig {
    /// Lossy encoding quality (0-100).
    pub quality: u32,
    /// PNG compression level (0 = fastest, 9 = smallest).
    pub png_compression: u32,
    /// Fit mode when a tag gives both width and height.
    pub fit: String,
    /// Output format; empty keeps the source format.
    pub format: String,
    pub allow_scale_larger: bool,
    /// Class added to every generated `<img>`.
    pub class: String,
    /// Emit `width`/`height` attributes.
    pub add_dimensions: bool,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            quality: 85,
            png_compression: 6,
            fit: "contain".to_string(),
            format: String::new(),
            allow_scale_larger: false,
            class: String::new(),
            add_dimensions: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LazyConfig {
    /// Default lazy-loading mode when a tag does not set `lazy`.
    pub mode: String,
    /// Width of the downsampled image an LQIP is built from.
    pub lqip_width: u32,
    pub lqip_quality: u32,
    /// Gaussian sigma applied to the LQIP before upscaling.
    pub lqip_blur: f32,
}

impl Default for LazyConfig {
    fn default() -> Self {
        Self {
            mode: "no".to_string(),
            lqip_width: 32,
            lqip_quality: 30,
            lqip_blur: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FallbackConfig {
    /// System-wide fallback source: local path or `http(s)` URL.
    pub src: String,
    /// Colour used for colour-fill images.
    pub colour: String,
    /// When true, a missing source renders a flat colour instead of failing.
    pub colour_fill: bool,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            src: String::new(),
            colour: "#cccccc".to_string(),
            colour_fill: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AutoAdjustConfig {
    pub enabled: bool,
    pub max_width: u32,
    pub max_height: u32,
    /// Maximum raw source size in bytes. `0` disables the check.
    pub max_filesize: u64,
}

impl Default for AutoAdjustConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_width: 4000,
            max_height: 4000,
            max_filesize: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RemoteConfig {
    pub timeout_secs: u64,
    /// Responses larger than this are rejected.
    pub max_bytes: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            max_bytes: 20 * 1024 * 1024,
        }
    }
}

/// Parallel processing settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessingConfig {
    /// Maximum number of parallel variant workers.
    /// When absent, defaults to the number of CPU cores.
    /// Values larger than the core count are clamped down.
    pub max_processes: Option<usize>,
}

/// Resolve the effective thread count from config.
///
/// - `None` → use all available cores
/// - `Some(n)` → use `min(n, cores)` (user can constrain down, not up)
pub fn effective_threads(config: &ProcessingConfig) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    config
        .max_processes
        .map(|n| n.clamp(1, cores))
        .unwrap_or(cores)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ActionConfig {
    /// Signing secret for action-link packets. Empty disables action links.
    pub secret: String,
    /// URL of the direct-fetch endpoint.
    pub endpoint: String,
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            endpoint: "/pictor".to_string(),
        }
    }
}

/// External HEIC → JPEG converter commands. `{input}` and `{output}` are
/// replaced with temporary file paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeicConfig {
    pub primary: Vec<String>,
    pub secondary: Vec<String>,
}

impl Default for HeicConfig {
    fn default() -> Self {
        Self {
            primary: vec!["heif-convert".into(), "{input}".into(), "{output}".into()],
            secondary: vec!["magick".into(), "{input}".into(), "{output}".into()],
        }
    }
}

// =============================================================================
// Loading, merging, and validation
// =============================================================================

/// Returns the stock default settings as a `toml::Value::Table`.
pub fn stock_defaults_value() -> toml::Value {
    Settings::default().to_value()
}

/// Recursively merge `overlay` on top of `base`.
///
/// - Tables are merged key-by-key (overlay keys override base keys).
/// - Non-table values in overlay replace base values entirely.
/// - Keys in base that are not in overlay are preserved.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Merge an optional overlay onto the stock defaults, then deserialize and
/// validate.
pub fn resolve_settings(overlay: Option<toml::Value>) -> Result<Settings, ConfigError> {
    let base = stock_defaults_value();
    let merged = match overlay {
        Some(ov) => merge_toml(base, ov),
        None => base,
    };
    let settings: Settings = merged.try_into()?;
    settings.validate()?;
    Ok(settings)
}

/// Load settings from a TOML file. A missing file yields the stock defaults.
pub fn load_settings_file(path: &Path) -> Result<Settings, ConfigError> {
    if !path.exists() {
        return resolve_settings(None);
    }
    let content = fs::read_to_string(path)?;
    let value: toml::Value = toml::from_str(&content)?;
    resolve_settings(Some(value))
}

/// Load `pictor.toml` from a directory.
pub fn load_settings(dir: &Path) -> Result<Settings, ConfigError> {
    load_settings_file(&dir.join(SETTINGS_FILENAME))
}

/// Returns a fully-commented stock `pictor.toml`.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# Pictor Configuration
# ====================
# All settings are optional. Remove or comment out any you don't need.
# Values shown below are the defaults. Unknown keys cause an error.

# Root directory that relative local `src` values resolve against.
base_path = "."

# Connection used when a tag does not set `connection`.
default_connection = "local"

# ---------------------------------------------------------------------------
# Storage connections
# ---------------------------------------------------------------------------
[connections.local]
# Filesystem root of this connection (relative to base_path).
root = "public"
# Public URL prefix for files written to this connection.
url_prefix = "/"

# ---------------------------------------------------------------------------
# Cache
# ---------------------------------------------------------------------------
[cache]
# Cache directory, relative to the connection root.
dir = "images/cache"
# Freshness window for cached images in seconds. 0 = never expires.
default_ttl = 2678400

# ---------------------------------------------------------------------------
# Defaults for tag parameters
# ---------------------------------------------------------------------------
[defaults]
quality = 85
# PNG compression level, 0 (fast) to 9 (small).
png_compression = 6
# contain | cover | distort
fit = "contain"
# Output format: jpg | png | webp | gif | bmp. Empty keeps the source format.
format = ""
allow_scale_larger = false
# Class added to every generated <img>.
class = ""
add_dimensions = true

# ---------------------------------------------------------------------------
# Lazy loading
# ---------------------------------------------------------------------------
[lazy]
# no | html5 | lqip | dominant_color | js_lqip | js_dominant_color
mode = "no"
lqip_width = 32
lqip_quality = 30
lqip_blur = 2.0

# ---------------------------------------------------------------------------
# Fallback sources
# ---------------------------------------------------------------------------
[fallback]
# Local path or http(s) URL tried after src and fallback_src fail.
src = ""
colour = "#cccccc"
# Render a flat colour image when no source is given at all.
colour_fill = false

# ---------------------------------------------------------------------------
# Oversized source protection
# ---------------------------------------------------------------------------
[auto_adjust]
enabled = false
max_width = 4000
max_height = 4000
# Bytes; 0 = unlimited.
max_filesize = 0

# ---------------------------------------------------------------------------
# Remote sources
# ---------------------------------------------------------------------------
[remote]
timeout_secs = 10
max_bytes = 20971520

# ---------------------------------------------------------------------------
# Processing
# ---------------------------------------------------------------------------
[processing]
# Maximum parallel workers for responsive variants and placeholders.
# Omit or comment out to auto-detect (= number of CPU cores).
# max_processes = 4

# ---------------------------------------------------------------------------
# Action links (signed direct-fetch URLs)
# ---------------------------------------------------------------------------
[action]
# Empty secret disables action links.
secret = ""
endpoint = "/pictor"

# ---------------------------------------------------------------------------
# HEIC conversion
# ---------------------------------------------------------------------------
[heic]
primary = ["heif-convert", "{input}", "{output}"]
secondary = ["magick", "{input}", "{output}"]
"##
}
