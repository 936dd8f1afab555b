//! The stage machine.
//!
//! A [`Pipeline`] is an ordered list of [`Stage`]s run against one
//! [`ProcessingContext`]. The standard order is:
//!
//! ```text
//! Initialize → EarlyCacheCheck → LoadSource → ProcessImage → Cache → Output
//! ```
//!
//! Each stage answers with a [`StageOutcome`]:
//!
//! | Outcome | Effect |
//! |---|---|
//! | `Ok(Continue)` | next stage runs |
//! | `Ok(SkipRemaining(reason))` | only stages with [`Stage::runs_after_exit`] still run |
//! | `Err(e)` | the error is recorded as critical and returned; nothing else runs |
//!
//! A stage may also decline to run for a particular request through
//! [`Stage::should_skip`]. Between stages the runner checks a cancellation
//! flag shared through [`Pipeline::cancel_handle`].

pub mod stages;

use crate::action::PacketError;
use crate::cache::CacheError;
use crate::config::ConfigError;
use crate::context::ProcessingContext;
use crate::imaging::ImagingError;
use crate::services::ServiceBundle;
use crate::storage::StorageError;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("No valid source: {0}")]
    NoValidSource(String),
    #[error("Invalid parameter {name}={value:?}: {reason}")]
    InvalidParameter {
        name: String,
        value: String,
        reason: String,
    },
    #[error("Transformation failed: {0}")]
    Transform(#[source] ImagingError),
    #[error("Writing {path} failed: {source}")]
    CacheWrite {
        path: String,
        #[source]
        source: StorageError,
    },
    #[error(transparent)]
    Imaging(#[from] ImagingError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error("Cancelled before {0}")]
    Cancelled(String),
    #[error("Internal error: {0}")]
    Invariant(String),
}

impl PipelineError {
    pub fn invalid(name: &str, value: &str, reason: impl Into<String>) -> Self {
        PipelineError::InvalidParameter {
            name: name.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    /// HTTP status for a direct-fetch response failing with this error.
    pub fn http_status(&self) -> u16 {
        match self {
            PipelineError::NoValidSource(_) => 404,
            PipelineError::InvalidParameter { .. }
            | PipelineError::Packet(_)
            | PipelineError::Config(_) => 400,
            PipelineError::Storage(StorageError::Config(_)) => 400,
            _ => 500,
        }
    }
}

/// What a stage asks the runner to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Continue,
    SkipRemaining(String),
}

pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this request has nothing for the stage to do.
    fn should_skip(&self, _ctx: &ProcessingContext) -> bool {
        false
    }

    /// Whether the stage still runs after an earlier stage asked to skip
    /// the rest of the pipeline.
    fn runs_after_exit(&self) -> bool {
        false
    }

    fn process(&self, ctx: &mut ProcessingContext) -> Result<StageOutcome, PipelineError>;
}

pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
    cancel: Arc<AtomicBool>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    /// An empty pipeline.
    pub fn new() -> Self {
        Self {
            stages: Vec::new(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// The six standard stages, sharing one service bundle.
    pub fn standard(services: Arc<ServiceBundle>) -> Self {
        use stages::*;
        Self::new()
            .with_stage(Initialize::new(services.clone()))
            .with_stage(EarlyCacheCheck::new(services.clone()))
            .with_stage(LoadSource::new(services.clone()))
            .with_stage(ProcessImage::new(services.clone()))
            .with_stage(CacheStage::new(services.clone()))
            .with_stage(Output::new(services))
    }

    /// Setting the returned flag stops the run before its next stage.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn run(&self, ctx: &mut ProcessingContext) -> Result<(), PipelineError> {
        let started = Instant::now();
        for stage in &self.stages {
            let name = stage.name();
            if self.cancel.load(Ordering::Relaxed) {
                let err = PipelineError::Cancelled(name.to_string());
                ctx.add_error(err.to_string(), true);
                return Err(err);
            }
            if ctx.exit_early() && !stage.runs_after_exit() {
                debug!(stage = name, "skipped after early exit");
                continue;
            }
            if stage.should_skip(ctx) {
                debug!(stage = name, "skipped");
                continue;
            }

            let stage_started = Instant::now();
            match stage.process(ctx) {
                Ok(StageOutcome::Continue) => {}
                Ok(StageOutcome::SkipRemaining(reason)) => {
                    debug!(stage = name, reason, "skipping remaining stages");
                    ctx.request_exit(reason);
                }
                Err(e) => {
                    error!(stage = name, error = %e, "stage failed");
                    ctx.add_error(e.to_string(), true);
                    return Err(e);
                }
            }
            ctx.metadata.processing_time = Some(started.elapsed());
            debug!(
                stage = name,
                elapsed_ms = stage_started.elapsed().as_secs_f64() * 1000.0,
                "stage finished"
            );
        }
        Ok(())
    }
}
