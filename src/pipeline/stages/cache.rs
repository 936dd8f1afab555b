//! Write the primary artifact and its derived variants.
//!
//! The primary is looked up once more now that the output format is known
//! for certain; a fresh hit is replayed from the cache log instead of being
//! written. On a miss the bytes are written first and logged second, so a
//! logged row always has its file.
//!
//! Derived artifacts (placeholder, JPEG fallback, responsive widths) that
//! are missing or stale are rendered in parallel on the service bundle's
//! worker pool. A failed variant is logged and recorded as a non-critical
//! error; the primary still serves.

use super::super::{PipelineError, Stage, StageOutcome};
use super::{
    apply_cached_row, artifact_paths, cache_dir, encode_options, lazy_mode, needs_dominant,
    record_derived, storage_for, ttl_override,
};
use crate::cache::{ArtifactPaths, LogUpdate};
use crate::context::{Flag, ProcessingContext, Source};
use crate::imaging::codec;
use crate::imaging::{Colour, OutputFormat, extract_palette};
use crate::markup::base_variables;
use crate::services::ServiceBundle;
use crate::storage::StorageAdapter;
use crate::variants::{Primary, RenderOptions, VariantJob, VariantPlan, render_variant};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Colours sampled when a dominant colour is needed outside palette mode.
const DOMINANT_SAMPLE: usize = 5;

pub struct CacheStage {
    services: Arc<ServiceBundle>,
}

impl CacheStage {
    pub fn new(services: Arc<ServiceBundle>) -> Self {
        Self { services }
    }

    fn write_primary(
        &self,
        ctx: &mut ProcessingContext,
        connection: &str,
        storage: &dyn StorageAdapter,
        dir: &str,
        path: &str,
        format: OutputFormat,
    ) -> Result<(), PipelineError> {
        let bytes = match ctx.source() {
            Some(Source::AnimatedGif(raw)) | Some(Source::Svg(raw)) => raw.clone(),
            _ => {
                let image = ctx
                    .processed_image()
                    .ok_or_else(|| PipelineError::Invariant("no processed image to cache".into()))?;
                let options = encode_options(ctx, &self.services.settings, format);
                codec::encode(image, &options)?
            }
        };
        storage.write(path, &bytes).map_err(|source| PipelineError::CacheWrite {
            path: path.to_string(),
            source,
        })?;
        info!(path, bytes = bytes.len(), "artifact written");

        ctx.metadata.final_filesize = Some(bytes.len() as u64);
        if ctx.metadata.dominant_colour.is_none()
            && let Some(image) = ctx.processed_image()
        {
            let dominant = extract_palette(image, DOMINANT_SAMPLE).dominant;
            ctx.metadata.dominant_colour = Some(dominant.to_hex());
        }
        let mut vars = base_variables(&ctx.metadata);
        if ctx.has_flag(Flag::AnimatedGif) {
            vars.insert("animated".into(), "yes".into());
        }
        let meta = &ctx.metadata;
        let update = LogUpdate {
            cache_dir: dir,
            cache_path: path,
            connection,
            source_path: meta.source_path.as_deref().unwrap_or_default(),
            width: meta.final_width.unwrap_or(0),
            height: meta.final_height.unwrap_or(0),
            filesize: bytes.len() as u64,
            mime_type: format.mime_type(),
            processing_time: meta.processing_time.unwrap_or_default(),
            template_variables: &vars,
            freshness_window: ttl_override(ctx),
            force_update: ctx.has_flag(Flag::ForceOverwrite),
            using_cache_copy: false,
        };
        let logged = self.services.cache_log.update_cache_log(storage, &update);
        if let Err(e) = logged {
            warn!(path, error = %e, "cache log update failed");
            ctx.add_error(format!("cache log update failed for {path}: {e}"), false);
        }
        ctx.metadata.template_variables = vars;
        ctx.mark_cached(path);
        Ok(())
    }

    fn write_derived(
        &self,
        ctx: &mut ProcessingContext,
        connection: &str,
        storage: &dyn StorageAdapter,
        dir: &str,
        paths: &ArtifactPaths,
        format: OutputFormat,
        lookup: bool,
    ) {
        let (Some(width), Some(height)) = (ctx.metadata.final_width, ctx.metadata.final_height)
        else {
            return;
        };
        let meta = &ctx.metadata;
        let primary = Primary {
            format,
            size: (width, height),
            original: meta.original_width.zip(meta.original_height).unwrap_or((width, height)),
            verbatim: ctx.has_flag(Flag::AnimatedGif) || ctx.has_flag(Flag::Svg),
        };
        let plan = VariantPlan::build(&ctx.params, lazy_mode(ctx), &primary, paths);
        if plan.is_empty() {
            return;
        }

        let log = &self.services.cache_log;
        let ttl = ttl_override(ctx);
        let mut pending = Vec::new();
        for job in plan.jobs {
            if lookup && ctx.is_cached(log, storage, dir, &job.path, ttl) {
                record_derived(ctx, &job, storage);
            } else {
                pending.push(job);
            }
        }
        if pending.is_empty() {
            return;
        }
        let Some(image) = ctx.processed_image() else {
            warn!("no processed image, derived artifacts skipped");
            return;
        };

        let settings = &self.services.settings;
        let encode = encode_options(ctx, settings, format);
        let dominant = match ctx.metadata.dominant_colour.as_deref().and_then(Colour::parse) {
            Some(colour) => colour,
            None if pending.iter().any(needs_dominant) => {
                extract_palette(image, DOMINANT_SAMPLE).dominant
            }
            None => Colour::WHITE,
        };
        let options = RenderOptions {
            lazy: &settings.lazy,
            primary: &encode,
            dominant,
            rendition: ctx.rendition(),
        };
        let source_path = ctx.metadata.source_path.clone().unwrap_or_default();
        let force = ctx.has_flag(Flag::ForceOverwrite);
        let no_vars = BTreeMap::new();

        let results: Vec<(VariantJob, Result<u64, PipelineError>)> = self.services.install(|| {
            pending
                .into_par_iter()
                .map(|job| {
                    let started = Instant::now();
                    let written = render_variant(&job, image, &options)
                        .map_err(PipelineError::from)
                        .and_then(|bytes| {
                            storage.write(&job.path, &bytes).map_err(|source| {
                                PipelineError::CacheWrite {
                                    path: job.path.clone(),
                                    source,
                                }
                            })?;
                            log.update_cache_log(
                                storage,
                                &LogUpdate {
                                    cache_dir: dir,
                                    cache_path: &job.path,
                                    connection,
                                    source_path: &source_path,
                                    width: job.width,
                                    height: job.height,
                                    filesize: bytes.len() as u64,
                                    mime_type: job.format.mime_type(),
                                    processing_time: started.elapsed(),
                                    template_variables: &no_vars,
                                    freshness_window: ttl,
                                    force_update: force,
                                    using_cache_copy: false,
                                },
                            )?;
                            Ok(bytes.len() as u64)
                        });
                    (job, written)
                })
                .collect()
        });

        for (job, written) in results {
            match written {
                Ok(size) => {
                    debug!(path = %job.path, bytes = size, "derived artifact written");
                    ctx.mark_cached(&job.path);
                    record_derived(ctx, &job, storage);
                }
                Err(e) => {
                    warn!(path = %job.path, error = %e, "derived artifact failed");
                    ctx.add_error(format!("derived artifact {} failed: {e}", job.path), false);
                }
            }
        }
        ctx.metadata.srcset.sort_by_key(|v| v.width);
    }
}

impl Stage for CacheStage {
    fn name(&self) -> &'static str {
        "cache"
    }

    fn should_skip(&self, ctx: &ProcessingContext) -> bool {
        ctx.has_flag(Flag::PaletteMode)
    }

    fn process(&self, ctx: &mut ProcessingContext) -> Result<StageOutcome, PipelineError> {
        let (connection, storage) = storage_for(&self.services, ctx)?;
        let dir = cache_dir(ctx)?;
        let paths = artifact_paths(ctx, &dir);
        let format = ctx
            .metadata
            .output_format
            .ok_or_else(|| PipelineError::Invariant("output format not resolved".into()))?;
        let extension = if ctx.has_flag(Flag::AnimatedGif) {
            "gif"
        } else {
            format.extension()
        };
        let primary = paths.primary(extension);
        ctx.metadata.cache_path = Some(primary.clone());
        ctx.metadata.cache_url = Some(storage.public_url(&primary));

        let log = &self.services.cache_log;
        let lookup = !ctx.has_flag(Flag::CacheDisabled) && !ctx.has_flag(Flag::ForceOverwrite);
        let mut hit = false;
        if lookup && ctx.is_cached(log, storage, &dir, &primary, ttl_override(ctx)) {
            match ctx.cached_row(log, storage, &dir, &primary) {
                Ok(row) => {
                    apply_cached_row(ctx, storage, &primary, row);
                    debug!(path = %primary, "cache hit after processing");
                    hit = true;
                }
                Err(e) => warn!(path = %primary, error = %e, "cached artifact unreadable, regenerating"),
            }
        }
        if !hit {
            let started = Instant::now();
            self.write_primary(ctx, connection, storage, &dir, &primary, format)?;
            debug!(elapsed = ?started.elapsed(), "primary artifact cached");
        }

        self.write_derived(ctx, connection, storage, &dir, &paths, format, lookup);
        Ok(StageOutcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::log::CacheLog;
    use crate::pipeline::Pipeline;
    use crate::test_helpers::{Fixture, animated_gif_bytes, jpeg_bytes, png_bytes};

    fn render(fx: &Fixture, services: &Arc<ServiceBundle>, pairs: &[(&str, &str)]) -> ProcessingContext {
        let mut ctx = fx.context(pairs);
        Pipeline::standard(services.clone()).run(&mut ctx).unwrap();
        ctx
    }

    #[test]
    fn miss_writes_artifact_and_log_row() {
        let fx = Fixture::new();
        fx.write_source("photo.jpg", &jpeg_bytes(120, 80));
        let services = Arc::new(fx.services());
        let ctx = render(&fx, &services, &[("src", "photo.jpg"), ("width", "60")]);

        let path = ctx.metadata.cache_path.clone().unwrap();
        let storage = fx.storage();
        assert!(storage.exists(&path));
        assert!(!ctx.has_flag(Flag::UsingCacheCopy));

        let doc = CacheLog::new(60).read_all(storage.as_ref(), "images/cache").unwrap();
        let row = &doc.entries[&path];
        assert_eq!((row.width, row.height), (60, 40));
        assert_eq!(row.source_path, "photo.jpg");
        assert_eq!(row.template_variables["width"], "60");
        assert!(row.template_variables["dominant_color"].starts_with('#'));
    }

    #[test]
    fn extensionless_source_hits_after_processing() {
        let fx = Fixture::new();
        fx.write_source("photo", &png_bytes(30, 30));
        let services = Arc::new(fx.services());
        let first = render(&fx, &services, &[("src", "photo")]);
        assert!(!first.has_flag(Flag::UsingCacheCopy));

        let second = render(&fx, &services, &[("src", "photo")]);
        assert!(second.has_flag(Flag::UsingCacheCopy));
        assert!(!second.has_flag(Flag::EarlyCacheHit));
        assert_eq!(second.metadata.cache_path, first.metadata.cache_path);
    }

    #[test]
    fn force_overwrites_fresh_artifact() {
        let fx = Fixture::new();
        fx.write_source("photo.jpg", &jpeg_bytes(40, 40));
        let services = Arc::new(fx.services());
        render(&fx, &services, &[("src", "photo.jpg")]);
        let forced = render(&fx, &services, &[("src", "photo.jpg"), ("force", "yes")]);
        assert!(!forced.has_flag(Flag::UsingCacheCopy));
        assert_eq!(forced.metadata.queue_runs, 0);
        assert!(forced.metadata.final_filesize.is_some());
    }

    #[test]
    fn variants_are_written_next_to_primary() {
        let fx = Fixture::new();
        fx.write_source("photo.png", &png_bytes(200, 100));
        let services = Arc::new(fx.services());
        let ctx = render(
            &fx,
            &services,
            &[("src", "photo.png"), ("lazy", "js_lqip"), ("srcset", "50|100|400")],
        );

        let meta = &ctx.metadata;
        let widths: Vec<u32> = meta.srcset.iter().map(|v| v.width).collect();
        assert_eq!(widths, [50, 100]);
        assert!(meta.placeholder.as_ref().unwrap().path.ends_with("_lqip.png"));
        assert!(meta.jpeg_fallback.as_ref().unwrap().path.ends_with("_fallback.jpg"));

        let files = fx.public_files();
        for artifact in meta.srcset.iter().chain(&meta.placeholder).chain(&meta.jpeg_fallback) {
            assert!(files.contains(&artifact.path), "{} missing", artifact.path);
        }
        assert!(ctx.errors().is_empty());
    }

    #[test]
    fn animated_gif_bytes_are_stored_verbatim() {
        let fx = Fixture::new();
        let gif = animated_gif_bytes(8, 6);
        fx.write_source("anim.gif", &gif);
        let services = Arc::new(fx.services());
        let ctx = render(&fx, &services, &[("src", "anim.gif"), ("width", "4")]);
        let path = ctx.metadata.cache_path.clone().unwrap();
        assert!(path.ends_with(".gif"));
        assert_eq!(fx.storage().read(&path).unwrap(), gif);
    }
}
