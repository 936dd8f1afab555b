//! Derived artifacts: lazy-loading placeholders, JPEG fallbacks, and
//! responsive widths.
//!
//! A [`VariantPlan`] lists everything a request needs next to its primary
//! artifact. The plan depends only on the request parameters and the
//! [`Primary`] it derives from, so the early cache check can build it from a
//! cache-log row and confirm every artifact exists before skipping the load.
//!
//! Responsive widths are rendered by a [`Rendition`]: the processing queue
//! replayed on the decoded source with the resize or crop step scaled to the
//! target width. A width above the processed one is therefore rendered from
//! source pixels rather than upscaled from the primary.
//!
//! | Artifact | When | Pixels |
//! |---|---|---|
//! | LQIP | `lazy=lqip` or `js_lqip` | downsampled, blurred, scaled back to the main size |
//! | Dominant colour | `lazy=dominant_color` or `js_dominant_color` | flat PNG at the main size |
//! | JPEG fallback | `js_*` modes with a non-JPEG primary | the processed image as JPEG |
//! | Responsive width | each `srcset` width up to the original width | the queue replayed at that width |
//!
//! Each artifact is written and logged independently; a failure is logged
//! and the artifact is left out of the output.

use crate::cache::ArtifactPaths;
use crate::config::LazyConfig;
use crate::context::DerivedArtifact;
use crate::imaging::transforms::{Crop, Resize};
use crate::imaging::{
    Colour, Compression, EncodeOptions, ImagingError, OutputFormat, Priority, Quality,
    TransformQueue, calculate_responsive_sizes, codec,
};
use crate::params::TagParams;
use crate::storage::StorageAdapter;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, RgbaImage};

/// The `lazy` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LazyMode {
    #[default]
    No,
    /// `loading="lazy"` only.
    Html5,
    Lqip,
    DominantColor,
    JsLqip,
    JsDominantColor,
}

impl LazyMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "no" | "n" | "none" | "false" | "off" | "0" => Some(Self::No),
            "yes" | "y" | "true" | "html5" | "native" => Some(Self::Html5),
            "lqip" => Some(Self::Lqip),
            "dominant_color" | "dominant_colour" | "dominant" => Some(Self::DominantColor),
            "js_lqip" => Some(Self::JsLqip),
            "js_dominant_color" | "js_dominant_colour" | "js_dominant" => {
                Some(Self::JsDominantColor)
            }
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::No => "no",
            Self::Html5 => "html5",
            Self::Lqip => "lqip",
            Self::DominantColor => "dominant_color",
            Self::JsLqip => "js_lqip",
            Self::JsDominantColor => "js_dominant_color",
        }
    }

    pub fn is_js(self) -> bool {
        matches!(self, Self::JsLqip | Self::JsDominantColor)
    }

    pub fn placeholder(self) -> Option<PlaceholderKind> {
        match self {
            Self::Lqip | Self::JsLqip => Some(PlaceholderKind::Lqip),
            Self::DominantColor | Self::JsDominantColor => Some(PlaceholderKind::DominantColour),
            Self::No | Self::Html5 => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderKind {
    Lqip,
    DominantColour,
}

/// Format of an LQIP for a primary of `primary` format. Lossless WebP would
/// make a full-size placeholder larger than the image it stands in for.
pub fn lqip_format(primary: OutputFormat) -> OutputFormat {
    match primary {
        OutputFormat::Png => OutputFormat::Png,
        _ => OutputFormat::Jpeg,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariantKind {
    Placeholder(PlaceholderKind),
    JpegFallback,
    Responsive,
}

/// One derived artifact to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantJob {
    pub kind: VariantKind,
    pub path: String,
    pub width: u32,
    pub height: u32,
    pub format: OutputFormat,
}

impl VariantJob {
    pub fn describe(&self, storage: &dyn StorageAdapter) -> DerivedArtifact {
        DerivedArtifact {
            path: self.path.clone(),
            url: storage.public_url(&self.path),
            width: self.width,
            height: self.height,
        }
    }
}

/// The primary artifact a plan derives from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Primary {
    pub format: OutputFormat,
    pub size: (u32, u32),
    /// Source dimensions. Responsive widths stop here unless the request
    /// allows scaling up.
    pub original: (u32, u32),
    /// Stored as the source bytes (SVG, animated GIF).
    pub verbatim: bool,
}

/// Everything derived from one primary artifact.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VariantPlan {
    pub jobs: Vec<VariantJob>,
}

impl VariantPlan {
    /// Plan the derived artifacts of `primary`. Verbatim primaries get none.
    pub fn build(params: &TagParams, lazy: LazyMode, primary: &Primary, paths: &ArtifactPaths) -> Self {
        let Primary {
            format,
            size: main,
            original,
            verbatim,
        } = *primary;
        if verbatim || main.0 == 0 || main.1 == 0 {
            return Self::default();
        }
        let mut jobs = Vec::new();
        match lazy.placeholder() {
            Some(PlaceholderKind::Lqip) => {
                let format = lqip_format(format);
                jobs.push(VariantJob {
                    kind: VariantKind::Placeholder(PlaceholderKind::Lqip),
                    path: paths.lqip(format.extension()),
                    width: main.0,
                    height: main.1,
                    format,
                });
            }
            Some(PlaceholderKind::DominantColour) => jobs.push(VariantJob {
                kind: VariantKind::Placeholder(PlaceholderKind::DominantColour),
                path: paths.dominant(),
                width: main.0,
                height: main.1,
                format: OutputFormat::Png,
            }),
            None => {}
        }
        if lazy.is_js() && format != OutputFormat::Jpeg {
            jobs.push(VariantJob {
                kind: VariantKind::JpegFallback,
                path: paths.jpeg_fallback(),
                width: main.0,
                height: main.1,
                format: OutputFormat::Jpeg,
            });
        }
        let widths: Vec<u32> = params
            .list("srcset")
            .iter()
            .filter_map(|w| w.trim_end_matches('w').trim_end_matches("px").parse().ok())
            .collect();
        let allow_larger = params.flag("allow_scale_larger");
        for size in calculate_responsive_sizes(main, &widths, original.0, allow_larger) {
            jobs.push(VariantJob {
                kind: VariantKind::Responsive,
                path: paths.variant(size.width, format.extension()),
                width: size.width,
                height: size.height,
                format,
            });
        }
        Self { jobs }
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.jobs.iter().map(|j| j.path.as_str())
    }
}

/// How the processing queue sized the primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeStep {
    /// Resized to these dimensions, or left at them.
    Resize((u32, u32)),
    Crop(Crop),
}

/// The processing queue and the image it ran on, kept to render the primary
/// again at other widths.
#[derive(Clone)]
pub struct Rendition {
    pub base: DynamicImage,
    pub queue: TransformQueue,
    pub step: SizeStep,
    /// Size of the processed image.
    pub size: (u32, u32),
}

impl Rendition {
    /// Run the queue with its sizing step scaled so the result is `width`
    /// wide, then settle on exactly `width`x`height`.
    pub fn render(&self, width: u32, height: u32) -> Result<DynamicImage, ImagingError> {
        let factor = width as f64 / self.size.0.max(1) as f64;
        let offset = |n: u32| (n as f64 * factor).round() as u32;
        let scale = |n: u32| offset(n).max(1);
        let queue = match self.step {
            SizeStep::Resize((w, h)) => self.queue.replacing(
                Priority::ResizeOrCrop,
                Resize {
                    width: scale(w),
                    height: scale(h),
                },
            ),
            SizeStep::Crop(crop) => {
                let frame = crop.scale_to.unwrap_or_else(|| self.base.dimensions());
                let frame = (scale(frame.0), scale(frame.1));
                let size = (scale(crop.size.0).min(frame.0), scale(crop.size.1).min(frame.1));
                let origin = (
                    offset(crop.origin.0).min(frame.0 - size.0),
                    offset(crop.origin.1).min(frame.1 - size.1),
                );
                self.queue.replacing(
                    Priority::ResizeOrCrop,
                    Crop {
                        scale_to: Some(frame),
                        origin,
                        size,
                    },
                )
            }
        };
        let (img, _) = queue.run(self.base.clone())?;
        if img.dimensions() == (width, height) {
            return Ok(img);
        }
        Ok(img.resize_exact(width, height, FilterType::Lanczos3))
    }
}

/// Settings a variant render reads.
#[derive(Clone, Copy)]
pub struct RenderOptions<'a> {
    pub lazy: &'a LazyConfig,
    /// Encode options of the primary artifact.
    pub primary: &'a EncodeOptions,
    pub dominant: Colour,
    /// Responsive widths are rendered from this when present.
    pub rendition: Option<&'a Rendition>,
}

/// Encode one derived artifact from the processed image.
pub fn render_variant(
    job: &VariantJob,
    image: &DynamicImage,
    options: &RenderOptions<'_>,
) -> Result<Vec<u8>, ImagingError> {
    match job.kind {
        VariantKind::Placeholder(PlaceholderKind::Lqip) => {
            let small_w = options.lazy.lqip_width.min(image.width()).max(1);
            let small_h = ((image.height() as f64 * small_w as f64 / image.width() as f64).round()
                as u32)
                .max(1);
            let small = image
                .resize_exact(small_w, small_h, FilterType::Triangle)
                .blur(options.lazy.lqip_blur);
            let full = small.resize_exact(job.width, job.height, FilterType::Triangle);
            let compression = match job.format {
                OutputFormat::Png => Compression::PngLevel(9),
                _ => Compression::Quality(Quality::new(options.lazy.lqip_quality)),
            };
            codec::encode(
                &full,
                &EncodeOptions::new(job.format, compression).with_background(options.primary.background),
            )
        }
        VariantKind::Placeholder(PlaceholderKind::DominantColour) => {
            let flat = RgbaImage::from_pixel(job.width, job.height, options.dominant.rgba());
            codec::encode(
                &DynamicImage::ImageRgba8(flat),
                &EncodeOptions::new(OutputFormat::Png, Compression::PngLevel(9)),
            )
        }
        VariantKind::JpegFallback => {
            let quality = match options.primary.compression {
                Compression::Quality(q) => q,
                _ => Quality::default(),
            };
            let background = options.primary.background.or(Some(Colour::WHITE));
            codec::encode(
                image,
                &EncodeOptions::new(OutputFormat::Jpeg, Compression::Quality(quality))
                    .with_background(background),
            )
        }
        VariantKind::Responsive => {
            let resized = match options.rendition {
                Some(rendition) => rendition.render(job.width, job.height)?,
                None => image.resize_exact(job.width, job.height, FilterType::Lanczos3),
            };
            codec::encode(&resized, options.primary)
        }
    }
}

/// `srcset` attribute value for the responsive jobs that were written, plus
/// the primary at its own width.
pub fn srcset_value(variants: &[DerivedArtifact], primary_url: &str, primary_width: u32) -> String {
    let mut entries: Vec<(u32, &str)> = variants.iter().map(|v| (v.width, v.url.as_str())).collect();
    if !entries.iter().any(|(w, _)| *w == primary_width) {
        entries.push((primary_width, primary_url));
    }
    entries.sort_by_key(|(w, _)| *w);
    entries
        .iter()
        .map(|(w, url)| format!("{url} {w}w"))
        .collect::<Vec<_>>()
        .join(", ")
}
