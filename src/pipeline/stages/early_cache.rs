//! Serve a fresh artifact before any source is loaded.
//!
//! The primary artifact's extension is predicted from `save_as`/`save_type`,
//! else from the source's extension (HEIC and TIFF sources are stored as
//! JPEG). When no prediction is possible the check is skipped and the cache
//! stage decides after processing. A hit needs the primary and every derived
//! artifact the request asks for.

use super::super::{PipelineError, Stage, StageOutcome};
use super::{
    apply_cached_row, artifact_paths, cache_dir, lazy_mode, record_derived, storage_for,
    ttl_override,
};
use crate::context::{Flag, ProcessingContext};
use crate::imaging::{Colour, OutputFormat};
use crate::params::{TagParams, is_truthy};
use crate::services::ServiceBundle;
use crate::variants::{Primary, VariantPlan};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct EarlyCacheCheck {
    services: Arc<ServiceBundle>,
}

impl EarlyCacheCheck {
    pub fn new(services: Arc<ServiceBundle>) -> Self {
        Self { services }
    }
}

impl Stage for EarlyCacheCheck {
    fn name(&self) -> &'static str {
        "early_cache_check"
    }

    fn should_skip(&self, ctx: &ProcessingContext) -> bool {
        ctx.has_flag(Flag::CacheDisabled)
            || ctx.has_flag(Flag::ForceOverwrite)
            || ctx.has_flag(Flag::PaletteMode)
    }

    fn process(&self, ctx: &mut ProcessingContext) -> Result<StageOutcome, PipelineError> {
        let Some(format) = predict_format(&ctx.params) else {
            debug!("output format unknown before loading, skipping early check");
            return Ok(StageOutcome::Continue);
        };
        let (_, storage) = storage_for(&self.services, ctx)?;
        let log = &self.services.cache_log;
        let dir = cache_dir(ctx)?;
        let paths = artifact_paths(ctx, &dir);
        let primary_path = paths.primary(format.extension());
        let ttl = ttl_override(ctx);

        if !ctx.is_cached(log, storage, &dir, &primary_path, ttl) {
            return Ok(StageOutcome::Continue);
        }
        let row = match ctx.cached_row(log, storage, &dir, &primary_path) {
            Ok(row) => row,
            Err(e) => {
                warn!(path = %primary_path, error = %e, "cached artifact unreadable, regenerating");
                return Ok(StageOutcome::Continue);
            }
        };

        let vars = &row.template_variables;
        let dimension = |name: &str| vars.get(name).and_then(|v| v.parse::<u32>().ok());
        let animated = vars.get("animated").is_some_and(|v| is_truthy(v));
        let primary = Primary {
            format,
            size: (row.width, row.height),
            original: dimension("original_width")
                .zip(dimension("original_height"))
                .unwrap_or((row.width, row.height)),
            verbatim: format == OutputFormat::Svg || animated,
        };
        let plan = VariantPlan::build(&ctx.params, lazy_mode(ctx), &primary, &paths);
        for job in &plan.jobs {
            if !ctx.is_cached(log, storage, &dir, &job.path, ttl) {
                debug!(path = %job.path, "derived artifact missing, continuing");
                return Ok(StageOutcome::Continue);
            }
        }

        apply_cached_row(ctx, storage, &primary_path, row);
        ctx.metadata.output_format = Some(format);
        if animated {
            ctx.set_flag(Flag::AnimatedGif);
        }
        for job in &plan.jobs {
            record_derived(ctx, job, storage);
        }
        ctx.set_flag(Flag::EarlyCacheHit);
        info!(path = %primary_path, "early cache hit");
        Ok(StageOutcome::SkipRemaining("early cache hit".into()))
    }
}

/// The primary artifact's format, when it can be known before loading.
fn predict_format(params: &TagParams) -> Option<OutputFormat> {
    let requested = params
        .get("save_as")
        .or_else(|| params.get("save_type"))
        .and_then(OutputFormat::from_extension)
        .filter(|f| *f != OutputFormat::Svg);
    if requested.is_some() {
        return requested;
    }
    let Some(src) = params.get("src") else {
        // A colour fill with no source at all.
        let fill = params
            .get("colour_fill")
            .is_some_and(|v| is_truthy(v) || Colour::parse(v).is_some());
        return fill.then_some(OutputFormat::Png);
    };
    let path = src.split(['?', '#']).next().unwrap_or(src);
    let name = path.rsplit('/').next().unwrap_or(path);
    let (_, ext) = name.rsplit_once('.')?;
    match ext.to_ascii_lowercase().as_str() {
        "heic" | "heif" | "tif" | "tiff" => Some(OutputFormat::Jpeg),
        other => OutputFormat::from_extension(other),
    }
}
