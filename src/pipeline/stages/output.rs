//! Turn the run's metadata into what the caller asked for.
//!
//! | Request | Output |
//! |---|---|
//! | direct fetch (action-link packet) | artifact bytes |
//! | `create_tag=no` | nothing |
//! | `palette=yes` | palette variables, or `tag_data` rendered with them |
//! | paired tag (`tag_data`) | `tag_data` rendered with the variables |
//! | `action_link=yes` | signed direct-fetch URL |
//! | `url_only=yes` | artifact URL |
//! | otherwise | `<img>` tag |
//!
//! Runs after an early cache hit as well.

use super::super::{PipelineError, Stage, StageOutcome};
use super::{lazy_mode, storage_for};
use crate::action::action_url;
use crate::context::{Flag, ProcessingContext};
use crate::markup::{Rendered, output_variables, render_img};
use crate::params::is_truthy;
use crate::services::ServiceBundle;
use std::sync::Arc;
use tracing::debug;

pub struct Output {
    services: Arc<ServiceBundle>,
}

impl Output {
    pub fn new(services: Arc<ServiceBundle>) -> Self {
        Self { services }
    }

    fn render(&self, ctx: &ProcessingContext) -> Result<Rendered, PipelineError> {
        let params = &ctx.params;
        if ctx.has_flag(Flag::DirectFetch) {
            if ctx.has_flag(Flag::PaletteMode) {
                return Err(PipelineError::invalid("palette", "yes", "direct fetch serves images only"));
            }
            let path = ctx
                .metadata
                .cache_path
                .as_deref()
                .ok_or_else(|| PipelineError::Invariant("no artifact to serve".into()))?;
            let (_, storage) = storage_for(&self.services, ctx)?;
            let body = storage.read(path)?;
            let content_type = ctx
                .metadata
                .output_format
                .map(|f| f.mime_type())
                .unwrap_or("application/octet-stream")
                .to_string();
            return Ok(Rendered::Bytes { content_type, body });
        }

        if params.get("create_tag").is_some_and(|v| !is_truthy(v)) {
            return Ok(Rendered::Empty);
        }

        if ctx.has_flag(Flag::PaletteMode) || ctx.tag_data.is_some() {
            let vars = output_variables(ctx);
            return Ok(match &ctx.tag_data {
                Some(template) => {
                    Rendered::Template(self.services.templates.parse_variables(template, &vars))
                }
                None => Rendered::Variables(vars),
            });
        }

        if params.flag("action_link") {
            let action = &self.services.settings.action;
            let url = action_url(&action.endpoint, ctx.original_params(), &action.secret)?;
            return Ok(Rendered::Url(url));
        }

        let url = ctx
            .metadata
            .cache_url
            .clone()
            .ok_or_else(|| PipelineError::Invariant("no artifact URL".into()))?;
        if params.flag("url_only") {
            return Ok(Rendered::Url(url));
        }
        render_img(ctx, &self.services.settings, lazy_mode(ctx))
            .map(Rendered::Html)
            .ok_or_else(|| PipelineError::Invariant("img tag without a URL".into()))
    }
}

impl Stage for Output {
    fn name(&self) -> &'static str {
        "output"
    }

    fn runs_after_exit(&self) -> bool {
        true
    }

    fn process(&self, ctx: &mut ProcessingContext) -> Result<StageOutcome, PipelineError> {
        let rendered = self.render(ctx)?;
        debug!(
            kind = match &rendered {
                Rendered::Html(_) => "html",
                Rendered::Url(_) => "url",
                Rendered::Template(_) => "template",
                Rendered::Variables(_) => "variables",
                Rendered::Bytes { .. } => "bytes",
                Rendered::Empty => "empty",
            },
            "output rendered"
        );
        ctx.output = Some(rendered);
        Ok(StageOutcome::Continue)
    }
}
