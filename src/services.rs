//! Shared collaborators for pipeline stages.
//!
//! One [`ServiceBundle`] is built per process (or per test) and handed to
//! every stage constructor as an `Arc`. Nothing here is global: swapping a
//! collaborator means building a bundle with a different one.
//!
//! | Service | Default |
//! |---|---|
//! | Storage connections | local disk, one per `[connections.*]` |
//! | Cache log | TTL from `[cache] default_ttl` |
//! | Filter registry | built-in filters |
//! | Face detector | finds nothing |
//! | Text renderer | none (`text` is skipped) |
//! | Template parser | `{name}` substitution |
//! | Remote fetcher | `ureq` with `[remote]` timeout and size cap |
//! | HEIC converter | `[heic]` commands |
//! | Worker pool | `[processing] max_processes` threads |

use crate::cache::log::CacheLog;
use crate::config::{Settings, effective_threads};
use crate::imaging::{
    CommandHeicConverter, FaceDetector, FilterRegistry, HeicConverter, NoFaceDetector,
    TextRenderer,
};
use crate::markup::{BraceTemplateParser, TemplateParser};
use crate::source::{HttpFetcher, RemoteFetcher, SourceLoader};
use crate::storage::{Connections, StorageAdapter};
use std::sync::Arc;
use tracing::warn;

pub struct ServiceBundle {
    pub settings: Settings,
    pub connections: Connections,
    pub cache_log: CacheLog,
    pub filters: FilterRegistry,
    pub faces: Arc<dyn FaceDetector>,
    pub text: Option<Arc<dyn TextRenderer>>,
    pub templates: Arc<dyn TemplateParser>,
    pub loader: SourceLoader,
    remote: Arc<dyn RemoteFetcher>,
    heic: Arc<dyn HeicConverter>,
    pool: Option<rayon::ThreadPool>,
}

impl ServiceBundle {
    pub fn from_settings(settings: Settings) -> Self {
        let remote: Arc<dyn RemoteFetcher> = Arc::new(HttpFetcher::new(
            settings.remote_timeout(),
            settings.remote.max_bytes,
        ));
        let heic: Arc<dyn HeicConverter> = Arc::new(CommandHeicConverter::from_config(&settings.heic));
        let threads = effective_threads(&settings.processing);
        let pool = match rayon::ThreadPoolBuilder::new().num_threads(threads).build() {
            Ok(pool) => Some(pool),
            Err(e) => {
                warn!(error = %e, "variant pool unavailable, using the global pool");
                None
            }
        };
        Self {
            connections: Connections::from_settings(&settings),
            cache_log: CacheLog::new(settings.cache.default_ttl),
            filters: FilterRegistry::with_builtins(),
            faces: Arc::new(NoFaceDetector),
            text: None,
            templates: Arc::new(BraceTemplateParser),
            loader: SourceLoader::new(settings.base_path.clone(), remote.clone(), heic.clone()),
            remote,
            heic,
            pool,
            settings,
        }
    }

    pub fn with_face_detector(mut self, detector: Arc<dyn FaceDetector>) -> Self {
        self.faces = detector;
        self
    }

    pub fn with_text_renderer(mut self, renderer: Arc<dyn TextRenderer>) -> Self {
        self.text = Some(renderer);
        self
    }

    pub fn with_template_parser(mut self, parser: Arc<dyn TemplateParser>) -> Self {
        self.templates = parser;
        self
    }

    pub fn with_remote_fetcher(mut self, fetcher: Arc<dyn RemoteFetcher>) -> Self {
        self.remote = fetcher;
        self.rebuild_loader();
        self
    }

    pub fn with_heic_converter(mut self, converter: Arc<dyn HeicConverter>) -> Self {
        self.heic = converter;
        self.rebuild_loader();
        self
    }

    /// Register an extra storage connection (an object store, a test double).
    pub fn with_connection(mut self, name: &str, adapter: Arc<dyn StorageAdapter>) -> Self {
        self.connections.insert(name, adapter);
        self
    }

    fn rebuild_loader(&mut self) {
        self.loader = SourceLoader::new(
            self.settings.base_path.clone(),
            self.remote.clone(),
            self.heic.clone(),
        );
    }

    /// Run `f` inside the variant worker pool.
    pub fn install<R: Send>(&self, f: impl FnOnce() -> R + Send) -> R {
        match &self.pool {
            Some(pool) => pool.install(f),
            None => f(),
        }
    }
}
