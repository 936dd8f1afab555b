//! Source loading: local files, remote URLs, and flat colours.
//!
//! A source reference is one of:
//!
//! | Reference | Loaded from |
//! |---|---|
//! | `http://…`, `https://…` | [`RemoteFetcher`] (timeout and size bounded) |
//! | `#rgb`, `#rrggbb` | nothing: a colour-fill source |
//! | anything else | a file, relative paths resolved against `base_path` |
//!
//! Loaded bytes are classified before any decode: SVG and animated GIFs are
//! kept as raw bytes, HEIC is converted to JPEG first, everything else is
//! decoded into an image.
//!
//! [`SourceLoader::load_first`] walks a list of [`Candidate`]s and returns
//! the first one that loads. Each failure is logged and the next tier is
//! tried; only exhausting the list is an error.

use crate::config::AutoAdjustConfig;
use crate::context::Source;
use crate::imaging::codec::{self, SourceKind};
use crate::imaging::{Colour, HeicConverter, ImagingError, calculate_auto_adjust};
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Source not found: {0}")]
    NotFound(String),
    #[error("Fetching {url} failed: {message}")]
    Remote { url: String, message: String },
    #[error("{url} exceeds {limit} bytes")]
    TooLarge { url: String, limit: u64 },
    #[error("Empty source reference")]
    Empty,
    #[error(transparent)]
    Imaging(#[from] ImagingError),
}

/// Fetches remote sources.
pub trait RemoteFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, SourceError>;
}

/// `ureq` agent with a request timeout and a response size cap.
pub struct HttpFetcher {
    agent: ureq::Agent,
    max_bytes: u64,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, max_bytes: u64) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self { agent, max_bytes }
    }
}

impl RemoteFetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, SourceError> {
        let remote = |message: String| SourceError::Remote {
            url: url.to_string(),
            message,
        };
        let response = self.agent.get(url).call().map_err(|e| remote(e.to_string()))?;
        let mut buf = Vec::new();
        response
            .into_reader()
            .take(self.max_bytes.saturating_add(1))
            .read_to_end(&mut buf)
            .map_err(|e| remote(e.to_string()))?;
        if buf.len() as u64 > self.max_bytes {
            return Err(SourceError::TooLarge {
                url: url.to_string(),
                limit: self.max_bytes,
            });
        }
        debug!(url, bytes = buf.len(), "fetched remote source");
        Ok(buf)
    }
}

pub fn is_remote(reference: &str) -> bool {
    let lower = reference.trim().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Where a candidate came from, for logging and flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Src,
    FallbackSrc,
    Configured,
}

/// One entry of the fallback chain.
#[derive(Debug, Clone, PartialEq)]
pub enum Candidate {
    Reference { tier: Tier, reference: String },
    ColourFill(Colour),
}

/// A successfully loaded source.
#[derive(Debug, Clone)]
pub struct LoadedSource {
    pub tier: Option<Tier>,
    pub reference: String,
    pub source: Source,
    /// Raw byte length as loaded (before HEIC conversion).
    pub filesize: u64,
    /// Pixel dimensions, when known. Colour fills have none.
    pub dimensions: Option<(u32, u32)>,
}

pub struct SourceLoader {
    base_path: PathBuf,
    remote: Arc<dyn RemoteFetcher>,
    heic: Arc<dyn HeicConverter>,
}

impl SourceLoader {
    pub fn new(
        base_path: impl Into<PathBuf>,
        remote: Arc<dyn RemoteFetcher>,
        heic: Arc<dyn HeicConverter>,
    ) -> Self {
        Self {
            base_path: base_path.into(),
            remote,
            heic,
        }
    }

    /// Try each candidate in order; the first that loads wins.
    pub fn load_first(&self, candidates: &[Candidate]) -> Option<LoadedSource> {
        for candidate in candidates {
            match candidate {
                Candidate::ColourFill(colour) => {
                    debug!(colour = %colour.to_hex(), "using colour fill");
                    return Some(LoadedSource {
                        tier: None,
                        reference: colour.to_hex(),
                        source: Source::ColourFill(*colour),
                        filesize: 0,
                        dimensions: None,
                    });
                }
                Candidate::Reference { tier, reference } => match self.load(reference) {
                    Ok(mut loaded) => {
                        loaded.tier = Some(*tier);
                        return Some(loaded);
                    }
                    Err(e) => warn!(?tier, reference, error = %e, "source failed, trying next"),
                },
            }
        }
        None
    }

    /// Load and classify one reference.
    pub fn load(&self, reference: &str) -> Result<LoadedSource, SourceError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(SourceError::Empty);
        }
        if let Some(colour) = reference.starts_with('#').then(|| Colour::parse(reference)).flatten() {
            return Ok(LoadedSource {
                tier: None,
                reference: reference.to_string(),
                source: Source::ColourFill(colour),
                filesize: 0,
                dimensions: None,
            });
        }
        let bytes = if is_remote(reference) {
            self.remote.fetch(reference)?
        } else {
            self.read_local(reference)?
        };
        self.classify(reference, bytes)
    }

    fn read_local(&self, reference: &str) -> Result<Vec<u8>, SourceError> {
        let path = self.resolve_local(reference);
        std::fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => SourceError::NotFound(path.display().to_string()),
            _ => SourceError::Io {
                path: path.display().to_string(),
                source: e,
            },
        })
    }

    pub fn resolve_local(&self, reference: &str) -> PathBuf {
        let path = Path::new(reference);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_path.join(path)
        }
    }

    fn classify(&self, reference: &str, bytes: Vec<u8>) -> Result<LoadedSource, SourceError> {
        let filesize = bytes.len() as u64;
        let loaded = |source, dimensions| LoadedSource {
            tier: None,
            reference: reference.to_string(),
            source,
            filesize,
            dimensions,
        };
        match codec::sniff(reference, &bytes)? {
            SourceKind::Svg => {
                let dims = codec::svg_dimensions(&bytes);
                Ok(loaded(Source::Svg(bytes), dims))
            }
            SourceKind::AnimatedGif => {
                let dims = codec::dimensions(&bytes)?;
                Ok(loaded(Source::AnimatedGif(bytes), Some(dims)))
            }
            SourceKind::Heic => {
                info!(reference, "converting HEIC source");
                let jpeg = self.heic.convert(&bytes)?;
                let image = codec::decode(&jpeg)?;
                let dims = (image.width(), image.height());
                Ok(loaded(
                    Source::Raster {
                        image,
                        format: ImageFormat::Jpeg,
                    },
                    Some(dims),
                ))
            }
            SourceKind::Raster(format) => {
                let image = codec::decode(&bytes)?;
                let dims = (image.width(), image.height());
                Ok(loaded(Source::Raster { image, format }, Some(dims)))
            }
        }
    }
}

/// Downscale a source that exceeds the auto-adjust bounds.
///
/// Returns `Ok(None)` when the image is within bounds or auto-adjust is off.
/// An image that is still too large after scaling is an error.
pub fn auto_adjust(
    image: &DynamicImage,
    filesize: u64,
    config: &AutoAdjustConfig,
) -> Result<Option<DynamicImage>, ImagingError> {
    if !config.enabled {
        return Ok(None);
    }
    let dims = (image.width(), image.height());
    let bounds = (config.max_width, config.max_height);
    let Some((w, h)) = calculate_auto_adjust(dims, filesize, bounds, config.max_filesize) else {
        return Ok(None);
    };
    let too_wide = config.max_width > 0 && w > config.max_width;
    let too_tall = config.max_height > 0 && h > config.max_height;
    if too_wide || too_tall || w == 0 || h == 0 {
        return Err(ImagingError::Operation {
            op: "auto_adjust".into(),
            message: format!("cannot bring {}x{} within {}x{}", dims.0, dims.1, bounds.0, bounds.1),
        });
    }
    info!(from = ?dims, to = ?(w, h), "auto-adjusting oversized source");
    Ok(Some(image.resize_exact(w, h, FilterType::Lanczos3)))
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::imaging::CommandHeicConverter;
    use crate::test_helpers::{animated_gif_bytes, jpeg_bytes, png_bytes};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Serves canned bytes per URL and records requests.
    #[derive(Default)]
    pub struct StaticFetcher {
        pub responses: HashMap<String, Vec<u8>>,
        pub requests: Mutex<Vec<String>>,
    }

    impl StaticFetcher {
        pub fn with(url: &str, bytes: Vec<u8>) -> Self {
            let mut responses = HashMap::new();
            responses.insert(url.to_string(), bytes);
            Self {
                responses,
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    impl RemoteFetcher for StaticFetcher {
        fn fetch(&self, url: &str) -> Result<Vec<u8>, SourceError> {
            self.requests.lock().unwrap().push(url.to_string());
            self.responses.get(url).cloned().ok_or_else(|| SourceError::Remote {
                url: url.to_string(),
                message: "404".into(),
            })
        }
    }

    fn loader(tmp: &TempDir, fetcher: StaticFetcher) -> SourceLoader {
        SourceLoader::new(
            tmp.path(),
            Arc::new(fetcher),
            Arc::new(CommandHeicConverter::new(vec![], vec![])),
        )
    }

    #[test]
    fn loads_local_raster() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.jpg"), jpeg_bytes(40, 20)).unwrap();
        let loaded = loader(&tmp, StaticFetcher::default()).load("a.jpg").unwrap();
        assert_eq!(loaded.dimensions, Some((40, 20)));
        assert!(matches!(loaded.source, Source::Raster { format: ImageFormat::Jpeg, .. }));
    }

    #[test]
    fn animated_gif_kept_as_bytes() {
        let tmp = TempDir::new().unwrap();
        let gif = animated_gif_bytes(8, 6);
        std::fs::write(tmp.path().join("a.gif"), &gif).unwrap();
        let loaded = loader(&tmp, StaticFetcher::default()).load("a.gif").unwrap();
        match loaded.source {
            Source::AnimatedGif(bytes) => assert_eq!(bytes, gif),
            other => panic!("expected animated gif, got {}", other.kind()),
        }
        assert_eq!(loaded.dimensions, Some((8, 6)));
    }

    #[test]
    fn svg_kept_as_bytes() {
        let tmp = TempDir::new().unwrap();
        let svg = br#"<svg xmlns="http://www.w3.org/2000/svg" width="120" height="80"></svg>"#;
        std::fs::write(tmp.path().join("logo.svg"), svg).unwrap();
        let loaded = loader(&tmp, StaticFetcher::default()).load("logo.svg").unwrap();
        assert!(matches!(loaded.source, Source::Svg(_)));
        assert_eq!(loaded.dimensions, Some((120, 80)));
    }

    #[test]
    fn hex_reference_is_colour_fill() {
        let tmp = TempDir::new().unwrap();
        let loaded = loader(&tmp, StaticFetcher::default()).load("#ff0000").unwrap();
        assert!(matches!(loaded.source, Source::ColourFill(Colour([255, 0, 0, 255]))));
    }

    #[test]
    fn remote_goes_through_fetcher() {
        let tmp = TempDir::new().unwrap();
        let fetcher = StaticFetcher::with("https://cdn.test/p.png", png_bytes(5, 5));
        let loaded = loader(&tmp, fetcher).load("https://cdn.test/p.png").unwrap();
        assert_eq!(loaded.dimensions, Some((5, 5)));
    }

    #[test]
    fn chain_falls_through_to_next_tier() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("fallback.jpg"), jpeg_bytes(10, 10)).unwrap();
        let candidates = vec![
            Candidate::Reference {
                tier: Tier::Src,
                reference: "missing.jpg".into(),
            },
            Candidate::Reference {
                tier: Tier::FallbackSrc,
                reference: "https://cdn.test/missing.jpg".into(),
            },
            Candidate::Reference {
                tier: Tier::Configured,
                reference: "fallback.jpg".into(),
            },
        ];
        let loaded = loader(&tmp, StaticFetcher::default())
            .load_first(&candidates)
            .unwrap();
        assert_eq!(loaded.tier, Some(Tier::Configured));
        assert_eq!(loaded.reference, "fallback.jpg");
    }

    #[test]
    fn exhausted_chain_is_none() {
        let tmp = TempDir::new().unwrap();
        let candidates = vec![Candidate::Reference {
            tier: Tier::Src,
            reference: "missing.jpg".into(),
        }];
        assert!(loader(&tmp, StaticFetcher::default()).load_first(&candidates).is_none());
    }

    #[test]
    fn undecodable_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("bad.jpg"), b"not an image").unwrap();
        assert!(loader(&tmp, StaticFetcher::default()).load("bad.jpg").is_err());
    }

    #[test]
    fn auto_adjust_fits_dimension_bounds() {
        let img = DynamicImage::new_rgb8(800, 400);
        let config = AutoAdjustConfig {
            enabled: true,
            max_width: 200,
            max_height: 200,
            max_filesize: 0,
        };
        let out = auto_adjust(&img, 0, &config).unwrap().unwrap();
        assert_eq!((out.width(), out.height()), (200, 100));
    }

    #[test]
    fn auto_adjust_disabled_or_within_bounds() {
        let img = DynamicImage::new_rgb8(100, 100);
        let mut config = AutoAdjustConfig::default();
        assert!(auto_adjust(&img, 0, &config).unwrap().is_none());
        config.enabled = true;
        assert!(auto_adjust(&img, 0, &config).unwrap().is_none());
    }
}
