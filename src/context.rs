//! Per-request processing state.
//!
//! One [`ProcessingContext`] flows through every stage of a pipeline run.
//! It owns the parameter maps, the loaded source, the processed image, and
//! everything the stages hand each other.
//!
//! ## Invariants
//!
//! | Invariant | Enforced by |
//! |---|---|
//! | `original_params` never changes after construction | private field, read-only accessor |
//! | The cache key is computed once and never changes | `OnceCell` in [`ProcessingContext::cache_key`] |
//! | An animated GIF never gets a processed image | [`ProcessingContext::set_processed_image`] refuses |
//! | Nothing touches the processed image after a critical error | same |
//! | One cache lookup per path per run | memo in [`ProcessingContext::is_cached`] |
//!
//! Well-known inter-stage data lives in the typed [`Metadata`] struct; the
//! `extra` map is only for data with no fixed shape.

use crate::cache::log::{CacheLog, CacheRow};
use crate::cache::{CacheError, CacheIndex, base_identifier, generate_cache_key};
use crate::imaging::{Colour, DetectedFaces, OpTiming, OutputFormat, Palette};
use crate::markup::Rendered;
use crate::params::TagParams;
use crate::pipeline::PipelineError;
use crate::storage::StorageAdapter;
use crate::variants::Rendition;
use image::{DynamicImage, ImageFormat};
use serde::Serialize;
use std::cell::OnceCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Named booleans set by stages. Absent means false.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Flag {
    /// The primary artifact was served from cache.
    UsingCacheCopy,
    /// The hit was found before any source was loaded.
    EarlyCacheHit,
    Svg,
    AnimatedGif,
    ItsACrop,
    UseColourFill,
    /// The source came from `fallback_src` or the configured fallback.
    UsedFallback,
    /// `cache=0`: cache reads are bypassed.
    CacheDisabled,
    /// `overwrite`/`force`: regenerate and overwrite.
    ForceOverwrite,
    PaletteMode,
    /// Serving bytes for an action-link packet.
    DirectFetch,
}

/// What the load stage produced.
#[derive(Debug, Clone)]
pub enum Source {
    Raster {
        image: DynamicImage,
        format: ImageFormat,
    },
    /// Raw bytes, never decoded for processing.
    AnimatedGif(Vec<u8>),
    /// Raw bytes, never rasterised.
    Svg(Vec<u8>),
    /// A flat colour canvas, synthesised at the requested size.
    ColourFill(Colour),
}

impl Source {
    pub fn kind(&self) -> &'static str {
        match self {
            Source::Raster { .. } => "raster",
            Source::AnimatedGif(_) => "animated_gif",
            Source::Svg(_) => "svg",
            Source::ColourFill(_) => "colour_fill",
        }
    }
}

/// A derived artifact written (or found) next to the primary one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DerivedArtifact {
    pub path: String,
    pub url: String,
    pub width: u32,
    pub height: u32,
}

/// Typed inter-stage data.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Metadata {
    pub connection: Option<String>,
    pub cache_dir: Option<String>,
    pub base_identifier: Option<String>,
    /// Connection-relative path of the primary artifact.
    pub cache_path: Option<String>,
    pub cache_url: Option<String>,
    /// The source reference that was actually loaded.
    pub source_path: Option<String>,

    pub original_width: Option<u32>,
    pub original_height: Option<u32>,
    pub original_filesize: Option<u64>,
    pub original_aspect_ratio: Option<f64>,

    pub final_width: Option<u32>,
    pub final_height: Option<u32>,
    pub final_filesize: Option<u64>,
    pub output_format: Option<OutputFormat>,

    /// Face detection result, computed at most once per request.
    pub faces: Option<DetectedFaces>,
    pub palette: Option<Palette>,
    pub dominant_colour: Option<String>,

    /// Times the transformation queue ran for this request.
    pub queue_runs: u32,
    pub timings: Vec<OpTiming>,
    #[serde(serialize_with = "serialize_opt_ms")]
    pub processing_time: Option<Duration>,

    pub placeholder: Option<DerivedArtifact>,
    pub srcset: Vec<DerivedArtifact>,
    pub jpeg_fallback: Option<DerivedArtifact>,

    /// Variables replayed from, or recorded into, the cache log.
    pub template_variables: BTreeMap<String, String>,
    pub exit_reason: Option<String>,
    pub extra: BTreeMap<String, String>,
}

fn serialize_opt_ms<S: serde::Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match d {
        Some(d) => s.serialize_some(&(d.as_secs_f64() * 1000.0)),
        None => s.serialize_none(),
    }
}

/// An error recorded against the request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordedError {
    pub message: String,
    pub critical: bool,
    /// Unix seconds.
    pub timestamp: u64,
}

pub struct ProcessingContext {
    original_params: TagParams,
    /// Working copy; stages may normalise or resolve values here.
    pub params: TagParams,
    /// Companion payload of a paired tag, rendered with the template variables.
    pub tag_data: Option<String>,
    variable_prefix: String,
    cache_key: OnceCell<String>,
    source: Option<Source>,
    processed_image: Option<DynamicImage>,
    rendition: Option<Rendition>,
    pub metadata: Metadata,
    /// What the output stage produced.
    pub output: Option<Rendered>,
    flags: BTreeSet<Flag>,
    errors: Vec<RecordedError>,
    exit_early: bool,
    cache_memo: HashMap<String, bool>,
    index: Option<CacheIndex>,
}

/// Images are summarised by kind and size.
impl fmt::Debug for ProcessingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessingContext")
            .field("params", &self.params)
            .field("cache_key", &self.cache_key.get())
            .field("source", &self.source.as_ref().map(Source::kind))
            .field(
                "processed_image",
                &self.processed_image.as_ref().map(|i| (i.width(), i.height())),
            )
            .field("rendition", &self.rendition.as_ref().map(|r| r.step))
            .field("flags", &self.flags)
            .field("errors", &self.errors)
            .field("metadata", &self.metadata)
            .field("output", &self.output)
            .finish_non_exhaustive()
    }
}

impl ProcessingContext {
    pub fn new(params: TagParams) -> Self {
        Self::paired(params, None, None)
    }

    /// A context for a paired tag. The variable prefix comes from the
    /// `var_prefix` parameter, else from the caller.
    pub fn paired(params: TagParams, tag_data: Option<String>, caller_prefix: Option<&str>) -> Self {
        let prefix = params
            .get("var_prefix")
            .or(caller_prefix.filter(|p| !p.is_empty()))
            .map(normalise_prefix)
            .unwrap_or_default();
        Self {
            original_params: params.clone(),
            params,
            tag_data,
            variable_prefix: prefix,
            cache_key: OnceCell::new(),
            source: None,
            processed_image: None,
            rendition: None,
            metadata: Metadata::default(),
            output: None,
            flags: BTreeSet::new(),
            errors: Vec::new(),
            exit_early: false,
            cache_memo: HashMap::new(),
            index: None,
        }
    }

    /// The parameters as the caller supplied them.
    pub fn original_params(&self) -> &TagParams {
        &self.original_params
    }

    pub fn variable_prefix(&self) -> &str {
        &self.variable_prefix
    }

    /// Identifier of the requested source, used in artifact names.
    pub fn base_identifier(&self) -> String {
        match self.params.get("src") {
            Some(src) => base_identifier(src),
            None => "colour-fill".to_string(),
        }
    }

    /// The cache key for this request, computed from the working parameters
    /// on first use and fixed from then on.
    pub fn cache_key(&self) -> &str {
        self.cache_key
            .get_or_init(|| generate_cache_key(&self.base_identifier(), &self.params))
    }

    pub fn has_cache_key(&self) -> bool {
        self.cache_key.get().is_some()
    }

    // =========================================================================
    // Flags
    // =========================================================================

    pub fn set_flag(&mut self, flag: Flag) {
        self.flags.insert(flag);
    }

    pub fn clear_flag(&mut self, flag: Flag) {
        self.flags.remove(&flag);
    }

    pub fn has_flag(&self, flag: Flag) -> bool {
        self.flags.contains(&flag)
    }

    pub fn flags(&self) -> impl Iterator<Item = Flag> + '_ {
        self.flags.iter().copied()
    }

    // =========================================================================
    // Images
    // =========================================================================

    pub fn source(&self) -> Option<&Source> {
        self.source.as_ref()
    }

    pub fn set_source(&mut self, source: Source) {
        match &source {
            Source::AnimatedGif(_) => self.set_flag(Flag::AnimatedGif),
            Source::Svg(_) => self.set_flag(Flag::Svg),
            Source::ColourFill(_) => self.set_flag(Flag::UseColourFill),
            Source::Raster { .. } => {}
        }
        self.source = Some(source);
    }

    pub fn processed_image(&self) -> Option<&DynamicImage> {
        self.processed_image.as_ref()
    }

    /// Store the processed image. Refused for animated GIFs, which are only
    /// ever served as raw bytes, and after a critical error.
    pub fn set_processed_image(&mut self, img: DynamicImage) -> Result<(), PipelineError> {
        if self.has_flag(Flag::AnimatedGif) {
            return Err(PipelineError::Invariant(
                "animated GIFs are passed through, not processed".into(),
            ));
        }
        if self.has_critical_error() {
            return Err(PipelineError::Invariant(
                "processed image is frozen after a critical error".into(),
            ));
        }
        self.processed_image = Some(img);
        Ok(())
    }

    /// How to render the processed image at other widths.
    pub fn rendition(&self) -> Option<&Rendition> {
        self.rendition.as_ref()
    }

    pub fn set_rendition(&mut self, rendition: Rendition) {
        self.rendition = Some(rendition);
    }

    // =========================================================================
    // Errors and early exit
    // =========================================================================

    pub fn add_error(&mut self, message: impl Into<String>, critical: bool) {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.errors.push(RecordedError {
            message: message.into(),
            critical,
            timestamp,
        });
    }

    pub fn has_critical_error(&self) -> bool {
        self.errors.iter().any(|e| e.critical)
    }

    pub fn errors(&self) -> &[RecordedError] {
        &self.errors
    }

    pub fn request_exit(&mut self, reason: impl Into<String>) {
        self.exit_early = true;
        self.metadata.exit_reason = Some(reason.into());
    }

    pub fn exit_early(&self) -> bool {
        self.exit_early
    }

    // =========================================================================
    // Cache lookups
    // =========================================================================

    fn ensure_index(&mut self, log: &CacheLog, storage: &dyn StorageAdapter, cache_dir: &str) {
        let loaded = matches!(&self.index, Some(i) if i.cache_dir() == cache_dir);
        if !loaded {
            self.index = Some(log.preload_index(storage, cache_dir));
        }
    }

    /// Whether `path` holds a fresh artifact. The first answer for a path is
    /// remembered for the rest of the run.
    pub fn is_cached(
        &mut self,
        log: &CacheLog,
        storage: &dyn StorageAdapter,
        cache_dir: &str,
        path: &str,
        ttl_override: Option<u64>,
    ) -> bool {
        if let Some(&hit) = self.cache_memo.get(path) {
            return hit;
        }
        self.ensure_index(log, storage, cache_dir);
        let hit = self
            .index
            .as_ref()
            .is_some_and(|index| log.is_in_cache(index, storage, path, ttl_override));
        self.cache_memo.insert(path.to_string(), hit);
        hit
    }

    /// Record that `path` now holds a fresh artifact.
    pub fn mark_cached(&mut self, path: &str) {
        self.cache_memo.insert(path.to_string(), true);
    }

    pub fn cached_row(
        &mut self,
        log: &CacheLog,
        storage: &dyn StorageAdapter,
        cache_dir: &str,
        path: &str,
    ) -> Result<CacheRow, CacheError> {
        self.ensure_index(log, storage, cache_dir);
        match &self.index {
            Some(index) => log.load_cached_data(index, storage, path),
            None => log.load_cached_data(&CacheIndex::default(), storage, path),
        }
    }
}

/// `var_prefix` values get a `:` separator unless they already end in one
/// (or in `_`).
fn normalise_prefix(prefix: &str) -> String {
    let prefix = prefix.trim();
    if prefix.is_empty() || prefix.ends_with(':') || prefix.ends_with('_') {
        prefix.to_string()
    } else {
        format!("{prefix}:")
    }
}
