//! The six standard stages and the helpers they share.
//!
//! | Stage | Reads | Writes |
//! |---|---|---|
//! | [`Initialize`] | params, settings | working params, flags, connection, cache dir |
//! | [`EarlyCacheCheck`] | cache key, cache log | metadata from the log row, exit |
//! | [`LoadSource`] | `src`, `fallback_src`, `[fallback]` | source, `original_*` |
//! | [`ProcessImage`] | source, params | processed image, `final_*`, faces, palette |
//! | [`CacheStage`] | processed image or raw bytes | artifacts, cache log, variables |
//! | [`Output`] | metadata | [`crate::markup::Rendered`] |

mod cache;
mod early_cache;
mod initialize;
mod load_source;
mod output;
mod process_image;

pub use cache::CacheStage;
pub use early_cache::EarlyCacheCheck;
pub use initialize::Initialize;
pub use load_source::LoadSource;
pub use output::Output;
pub use process_image::ProcessImage;

use super::PipelineError;
use crate::cache::ArtifactPaths;
use crate::cache::log::CacheRow;
use crate::config::Settings;
use crate::context::{Flag, ProcessingContext};
use crate::imaging::{Colour, Compression, EncodeOptions, OutputFormat, Quality};
use crate::services::ServiceBundle;
use crate::storage::StorageAdapter;
use crate::variants::{LazyMode, PlaceholderKind, VariantJob, VariantKind};
use tracing::warn;

/// `cache=N` with `N > 0` replaces the freshness window.
fn ttl_override(ctx: &ProcessingContext) -> Option<u64> {
    ctx.params
        .get("cache")
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|&n| n > 0)
}

fn lazy_mode(ctx: &ProcessingContext) -> LazyMode {
    match ctx.params.get("lazy") {
        None => LazyMode::No,
        Some(raw) => LazyMode::parse(raw).unwrap_or_else(|| {
            warn!(lazy = raw, "unknown lazy mode, ignoring");
            LazyMode::No
        }),
    }
}

/// The request's storage connection.
fn storage_for<'a>(
    services: &'a ServiceBundle,
    ctx: &ProcessingContext,
) -> Result<(&'a str, &'a dyn StorageAdapter), PipelineError> {
    Ok(services.connections.get(ctx.metadata.connection.as_deref())?)
}

fn cache_dir(ctx: &ProcessingContext) -> Result<String, PipelineError> {
    ctx.metadata
        .cache_dir
        .clone()
        .ok_or_else(|| PipelineError::Invariant("cache directory not resolved".into()))
}

fn artifact_paths(ctx: &ProcessingContext, cache_dir: &str) -> ArtifactPaths {
    ArtifactPaths::new(cache_dir, &ctx.base_identifier(), ctx.cache_key())
}

/// Encode options for the primary artifact.
fn encode_options(ctx: &ProcessingContext, settings: &Settings, format: OutputFormat) -> EncodeOptions {
    let params = &ctx.params;
    let lossless = params
        .get("quality")
        .is_some_and(|q| q.eq_ignore_ascii_case("lossless"));
    let compression = if lossless {
        Compression::Lossless
    } else if format == OutputFormat::Png {
        let level = params
            .parse_u32("png_quality")
            .ok()
            .flatten()
            .unwrap_or(settings.defaults.png_compression)
            .min(9);
        Compression::PngLevel(level as u8)
    } else {
        let quality = params
            .parse_u32("quality")
            .ok()
            .flatten()
            .unwrap_or(settings.defaults.quality);
        Compression::Quality(Quality::new(quality))
    };
    let background = params.get("bg_color").and_then(|c| {
        let parsed = Colour::parse(c);
        if parsed.is_none() {
            warn!(bg_color = c, "unparseable background colour, ignoring");
        }
        parsed
    });
    EncodeOptions::new(format, compression).with_background(background)
}

/// Replay a cache-log row into the context.
fn apply_cached_row(
    ctx: &mut ProcessingContext,
    storage: &dyn StorageAdapter,
    path: &str,
    row: CacheRow,
) {
    let vars = &row.template_variables;
    let number = |name: &str| vars.get(name).and_then(|v| v.parse::<u32>().ok());
    let meta = &mut ctx.metadata;
    meta.cache_path = Some(path.to_string());
    meta.cache_url = Some(storage.public_url(path));
    meta.final_width = Some(row.width);
    meta.final_height = Some(row.height);
    meta.final_filesize = Some(row.filesize);
    if !row.source_path.is_empty() {
        meta.source_path = Some(row.source_path.clone());
    }
    if meta.original_width.is_none() {
        meta.original_width = number("original_width");
        meta.original_height = number("original_height");
        meta.original_filesize = vars
            .get("original_filesize")
            .and_then(|v| v.parse::<u64>().ok());
    }
    if let Some(colour) = vars.get("dominant_color") {
        meta.dominant_colour = Some(colour.clone());
    }
    meta.template_variables = row.template_variables;
    ctx.set_flag(Flag::UsingCacheCopy);
}

/// Record a derived artifact that exists on storage.
fn record_derived(ctx: &mut ProcessingContext, job: &VariantJob, storage: &dyn StorageAdapter) {
    let artifact = job.describe(storage);
    match job.kind {
        VariantKind::Placeholder(_) => ctx.metadata.placeholder = Some(artifact),
        VariantKind::JpegFallback => ctx.metadata.jpeg_fallback = Some(artifact),
        VariantKind::Responsive => ctx.metadata.srcset.push(artifact),
    }
}

/// Whether a job needs the dominant colour.
fn needs_dominant(job: &VariantJob) -> bool {
    job.kind == VariantKind::Placeholder(PlaceholderKind::DominantColour)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::TagParams;

    fn ctx(pairs: &[(&str, &str)]) -> ProcessingContext {
        ProcessingContext::new(TagParams::from_pairs(pairs.iter().copied()))
    }

    #[test]
    fn ttl_override_only_for_positive_values() {
        assert_eq!(ttl_override(&ctx(&[("cache", "60")])), Some(60));
        assert_eq!(ttl_override(&ctx(&[("cache", "0")])), None);
        assert_eq!(ttl_override(&ctx(&[("cache", "soon")])), None);
        assert_eq!(ttl_override(&ctx(&[])), None);
    }

    #[test]
    fn encode_options_by_format() {
        let settings = Settings::default();
        let c = ctx(&[("quality", "70"), ("png_quality", "2"), ("bg_color", "#fff")]);
        let jpeg = encode_options(&c, &settings, OutputFormat::Jpeg);
        assert_eq!(jpeg.compression, Compression::Quality(Quality::new(70)));
        assert_eq!(jpeg.background, Some(Colour::WHITE));
        let png = encode_options(&c, &settings, OutputFormat::Png);
        assert_eq!(png.compression, Compression::PngLevel(2));

        let lossless = encode_options(&ctx(&[("quality", "lossless")]), &settings, OutputFormat::Jpeg);
        assert_eq!(lossless.compression, Compression::Lossless);
    }

    #[test]
    fn unknown_lazy_mode_is_off() {
        assert_eq!(lazy_mode(&ctx(&[("lazy", "later")])), LazyMode::No);
        assert_eq!(lazy_mode(&ctx(&[("lazy", "lqip")])), LazyMode::Lqip);
    }
}
