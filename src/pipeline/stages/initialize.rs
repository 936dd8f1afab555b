//! First stage: validate the request and fold in configured defaults.
//!
//! Everything later stages read from the working parameters is settled
//! here, so the cache key computed at the end of this stage covers the
//! defaults in force when the artifact was made.

use super::super::{PipelineError, Stage, StageOutcome};
use crate::context::{Flag, ProcessingContext};
use crate::imaging::{CropSpec, Fit, Length};
use crate::services::ServiceBundle;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct Initialize {
    services: Arc<ServiceBundle>,
}

impl Initialize {
    pub fn new(services: Arc<ServiceBundle>) -> Self {
        Self { services }
    }
}

impl Stage for Initialize {
    fn name(&self) -> &'static str {
        "initialize"
    }

    fn process(&self, ctx: &mut ProcessingContext) -> Result<StageOutcome, PipelineError> {
        let settings = &self.services.settings;

        for name in ["width", "height"] {
            if let Some(value) = ctx.params.get(name)
                && Length::parse(value).is_none()
            {
                return Err(PipelineError::invalid(name, value, "expected pixels or a percentage"));
            }
        }

        let params = &mut ctx.params;
        match params.get("quality") {
            Some(q) if q.eq_ignore_ascii_case("lossless") => params.set("quality", "lossless"),
            Some(q) => match params.parse_u32("quality") {
                Ok(Some(n)) if n <= 100 => {}
                _ => {
                    warn!(quality = q, "invalid quality, using the default");
                    params.set("quality", settings.defaults.quality.to_string());
                }
            },
            None => params.set("quality", settings.defaults.quality.to_string()),
        }
        match params.parse_u32("png_quality") {
            Ok(Some(n)) if n <= 9 => {}
            Ok(None) => params.set("png_quality", settings.defaults.png_compression.to_string()),
            _ => {
                warn!("invalid png_quality, using the default");
                params.set("png_quality", settings.defaults.png_compression.to_string());
            }
        }

        let fit = params
            .get("fit")
            .and_then(|f| {
                let parsed = Fit::parse(f);
                if parsed.is_none() {
                    warn!(fit = f, "unknown fit mode, using the default");
                }
                parsed
            })
            .or_else(|| Fit::parse(&settings.defaults.fit))
            .unwrap_or_default();
        params.set("fit", fit_name(fit));

        let larger = params.flag_or("allow_scale_larger", settings.defaults.allow_scale_larger);
        params.set("allow_scale_larger", if larger { "yes" } else { "no" });

        if params.get("save_as").is_none() && !settings.defaults.format.is_empty() {
            params.set("save_as", settings.defaults.format.as_str());
        }
        if params.get("lazy").is_none() && !settings.lazy.mode.is_empty() {
            params.set("lazy", settings.lazy.mode.as_str());
        }

        if params.get("cache") == Some("0") {
            ctx.set_flag(Flag::CacheDisabled);
        }
        if ctx.params.flag("overwrite") || ctx.params.flag("force") {
            ctx.set_flag(Flag::ForceOverwrite);
        }
        if ctx.params.flag("palette") {
            ctx.set_flag(Flag::PaletteMode);
        }
        if ctx.params.get("crop").is_some_and(|c| CropSpec::parse(c).enabled) {
            ctx.set_flag(Flag::ItsACrop);
        }

        let (connection, _) = self.services.connections.get(ctx.params.get("connection"))?;
        ctx.metadata.connection = Some(connection.to_string());
        let cache_dir = ctx
            .params
            .get("cache_dir")
            .unwrap_or(&settings.cache.dir)
            .trim_matches('/')
            .to_string();
        ctx.metadata.cache_dir = Some(cache_dir);
        ctx.metadata.base_identifier = Some(ctx.base_identifier());

        let key = ctx.cache_key().to_string();
        debug!(
            key = key.as_str(),
            connection,
            cache_dir = ctx.metadata.cache_dir.as_deref(),
            "request initialised"
        );
        Ok(StageOutcome::Continue)
    }
}

fn fit_name(fit: Fit) -> &'static str {
    match fit {
        Fit::Contain => "contain",
        Fit::Cover => "cover",
        Fit::Distort => "distort",
    }
}
