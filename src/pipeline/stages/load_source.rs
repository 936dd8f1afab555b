//! Resolve and load the source image through the fallback chain.
//!
//! | Tier | Reference |
//! |---|---|
//! | 1 | `src` |
//! | 2 | `fallback_src` |
//! | 3 | `[fallback] src` |
//! | 4 | a flat colour, when `[fallback] colour_fill` is on |
//!
//! A request with `colour_fill` and no source references goes straight to
//! the colour. Exhausting the chain is fatal.

use super::super::{PipelineError, Stage, StageOutcome};
use crate::config::Settings;
use crate::context::{Flag, ProcessingContext, Source};
use crate::imaging::Colour;
use crate::params::{TagParams, is_truthy};
use crate::services::ServiceBundle;
use crate::source::{Candidate, Tier, auto_adjust};
use std::sync::Arc;
use tracing::{debug, info};

pub struct LoadSource {
    services: Arc<ServiceBundle>,
}

impl LoadSource {
    pub fn new(services: Arc<ServiceBundle>) -> Self {
        Self { services }
    }
}

impl Stage for LoadSource {
    fn name(&self) -> &'static str {
        "load_source"
    }

    fn process(&self, ctx: &mut ProcessingContext) -> Result<StageOutcome, PipelineError> {
        let settings = &self.services.settings;
        let candidates = candidates(&ctx.params, settings);
        if candidates.is_empty() {
            return Err(PipelineError::NoValidSource("no src given".into()));
        }
        let loaded = self
            .services
            .loader
            .load_first(&candidates)
            .ok_or_else(|| {
                PipelineError::NoValidSource(format!("{} candidate(s) failed", candidates.len()))
            })?;

        if ctx.params.get("src").is_some() && loaded.tier != Some(Tier::Src) {
            info!(reference = %loaded.reference, "using fallback source");
            ctx.set_flag(Flag::UsedFallback);
        }
        let meta = &mut ctx.metadata;
        meta.source_path = Some(loaded.reference.clone());
        if meta.original_width.is_none()
            && let Some((w, h)) = loaded.dimensions
        {
            meta.original_width = Some(w);
            meta.original_height = Some(h);
            meta.original_filesize = Some(loaded.filesize);
            if h > 0 {
                meta.original_aspect_ratio = Some(w as f64 / h as f64);
            }
        }

        let source = match loaded.source {
            Source::Raster { image, format } => {
                match auto_adjust(&image, loaded.filesize, &settings.auto_adjust)? {
                    Some(adjusted) => Source::Raster {
                        image: adjusted,
                        format,
                    },
                    None => Source::Raster { image, format },
                }
            }
            other => other,
        };
        debug!(kind = source.kind(), reference = %loaded.reference, "source loaded");
        ctx.set_source(source);
        Ok(StageOutcome::Continue)
    }
}

/// The colour a `colour_fill` parameter asks for: an explicit colour, or
/// the configured one for a plain `yes`.
pub(super) fn requested_fill(params: &TagParams, settings: &Settings) -> Option<Colour> {
    let value = params.get("colour_fill")?;
    Colour::parse(value).or_else(|| {
        is_truthy(value)
            .then(|| Colour::parse(&settings.fallback.colour))
            .flatten()
    })
}

fn candidates(params: &TagParams, settings: &Settings) -> Vec<Candidate> {
    let src = params.get("src");
    let fallback_src = params.get("fallback_src");
    if src.is_none()
        && fallback_src.is_none()
        && let Some(colour) = requested_fill(params, settings)
    {
        return vec![Candidate::ColourFill(colour)];
    }

    let mut chain = Vec::new();
    let mut push = |tier, reference: Option<&str>| {
        if let Some(reference) = reference.map(str::trim).filter(|r| !r.is_empty()) {
            chain.push(Candidate::Reference {
                tier,
                reference: reference.to_string(),
            });
        }
    };
    push(Tier::Src, src);
    push(Tier::FallbackSrc, fallback_src);
    push(Tier::Configured, Some(settings.fallback.src.as_str()));
    if settings.fallback.colour_fill
        && let Some(colour) = Colour::parse(&settings.fallback.colour)
    {
        chain.push(Candidate::ColourFill(colour));
    }
    chain
}
