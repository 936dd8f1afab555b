//! Build the transformation queue and run it.
//!
//! Queue order is fixed by [`Priority`]:
//!
//! ```text
//! resize | crop → flip → filter chain → text → watermark
//!        → rounded corners → border → reflection → rotate
//! ```
//!
//! Some sources never reach the queue:
//!
//! | Source | Result |
//! |---|---|
//! | SVG | bytes kept, display size computed (scaling up allowed) |
//! | Animated GIF | bytes kept, display size computed |
//! | Colour fill | flat canvas of the requested size |
//! | `palette=yes` | palette and dominant colour, no image |

use super::super::{PipelineError, Stage, StageOutcome};
use crate::context::{Flag, ProcessingContext, Source};
use crate::imaging::codec::{self, output_format_for};
use crate::imaging::filters::{chain_uses_faces, parse_filter_chain};
use crate::imaging::transforms::{
    Border, Crop, Flip, Placement, Reflection, Resize, Rotate, RoundedCorners, TextOverlay,
    Watermark,
};
use crate::imaging::{
    Colour, CropSpec, DetectedFaces, DimensionRequest, Fit, Length, OutputFormat, Priority,
    TextSpec, TransformQueue, calculate_crop_dimensions, calculate_crop_origin,
    calculate_dimensions, calculate_fill_dimensions, extract_palette, parse_aspect_ratio,
};
use crate::params::TagParams;
use crate::services::ServiceBundle;
use crate::variants::{Rendition, SizeStep};
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, RgbaImage};
use std::sync::Arc;
use tracing::{debug, warn};

/// Colour-fill canvas side when the request gives neither width nor height.
const FILL_SIZE: u32 = 100;

const DEFAULT_PALETTE_SIZE: usize = 8;

pub struct ProcessImage {
    services: Arc<ServiceBundle>,
}

/// What the loaded source calls for.
enum Work {
    Passthrough {
        format: OutputFormat,
        original: Option<(u32, u32)>,
    },
    Fill(Colour),
    Raster {
        image: DynamicImage,
        format: ImageFormat,
    },
}

impl ProcessImage {
    pub fn new(services: Arc<ServiceBundle>) -> Self {
        Self { services }
    }

    fn passthrough(
        &self,
        ctx: &mut ProcessingContext,
        format: OutputFormat,
        original: Option<(u32, u32)>,
    ) {
        let mut req = dimension_request(&ctx.params);
        let display = match original {
            Some(dims) => {
                // Vectors scale freely; GIF frames are only displayed larger.
                req.allow_scale_larger |= format == OutputFormat::Svg;
                Some(calculate_dimensions(dims, &req))
            }
            None => match (px(req.width), px(req.height)) {
                (Some(w), Some(h)) => Some((w, h)),
                _ => None,
            },
        };
        if let Some((w, h)) = display {
            ctx.metadata.final_width = Some(w);
            ctx.metadata.final_height = Some(h);
        }
        ctx.metadata.output_format = Some(format);
        let shown = display;
        debug!(?format, ?shown, "passthrough source, queue not run");
    }

    fn colour_fill(&self, ctx: &mut ProcessingContext, colour: Colour) -> Result<(), PipelineError> {
        let width = px(Length::parse(ctx.params.get_or("width", "")));
        let height = px(Length::parse(ctx.params.get_or("height", "")));
        let (w, h) = match (width, height) {
            (Some(w), Some(h)) => (w, h),
            (Some(side), None) | (None, Some(side)) => (side, side),
            (None, None) => (FILL_SIZE, FILL_SIZE),
        };
        let (w, h) = (w.max(1), h.max(1));
        let canvas = DynamicImage::ImageRgba8(RgbaImage::from_pixel(w, h, colour.rgba()));
        if wants_responsive(&ctx.params) {
            ctx.set_rendition(Rendition {
                base: canvas.clone(),
                queue: TransformQueue::new(),
                step: SizeStep::Resize((w, h)),
                size: (w, h),
            });
        }
        ctx.metadata.output_format = Some(requested_format(&ctx.params).unwrap_or(OutputFormat::Png));
        ctx.metadata.final_width = Some(w);
        ctx.metadata.final_height = Some(h);
        ctx.set_processed_image(canvas)
    }

    fn palette(&self, ctx: &mut ProcessingContext, image: &DynamicImage) {
        let size = ctx
            .params
            .get("palette_size")
            .and_then(|s| s.parse().ok())
            .filter(|&n: &usize| n > 0)
            .unwrap_or(DEFAULT_PALETTE_SIZE);
        let palette = extract_palette(image, size);
        debug!(colours = palette.colours.len(), "palette extracted");
        ctx.metadata.dominant_colour = Some(palette.dominant.to_hex());
        ctx.metadata.palette = Some(palette);
        ctx.metadata.final_width = Some(image.width());
        ctx.metadata.final_height = Some(image.height());
    }

    /// Faces in `image`, detected at most once per request.
    fn faces(&self, ctx: &mut ProcessingContext, image: &DynamicImage, sensitivity: u32) -> DetectedFaces {
        if let Some(faces) = &ctx.metadata.faces {
            return faces.clone();
        }
        let faces = DetectedFaces {
            regions: self.services.faces.detect(image, sensitivity),
            image_size: (image.width(), image.height()),
        };
        debug!(found = faces.regions.len(), sensitivity, "face detection");
        ctx.metadata.faces = Some(faces.clone());
        faces
    }

    fn raster(
        &self,
        ctx: &mut ProcessingContext,
        image: DynamicImage,
        source_format: ImageFormat,
    ) -> Result<(), PipelineError> {
        let format = requested_format(&ctx.params).unwrap_or_else(|| output_format_for(source_format));
        let original = (image.width(), image.height());
        let req = dimension_request(&ctx.params);
        let mut queue = TransformQueue::new();
        let base = wants_responsive(&ctx.params).then(|| image.clone());
        let step;
        let mut working = image;
        // Frame size, origin and size of the crop window, when cropping.
        let mut window = None;

        if ctx.has_flag(Flag::ItsACrop) {
            let spec = CropSpec::parse(ctx.params.get_or("crop", ""));
            let crop = calculate_crop_dimensions(original, &req);
            let scaled = if spec.smart_scale {
                calculate_fill_dimensions(original, crop)
            } else {
                original
            };
            let crop = (crop.0.min(scaled.0), crop.1.min(scaled.1));
            let centre = if spec.uses_faces() {
                if scaled != original {
                    working = working.resize_exact(scaled.0, scaled.1, FilterType::Lanczos3);
                }
                self.faces(ctx, &working, spec.face_sensitivity).centre_in(scaled)
            } else {
                None
            };
            let origin = calculate_crop_origin(scaled, crop, &spec, centre);
            debug!(?scaled, ?crop, ?origin, "crop planned");
            window = Some((scaled, origin, crop));
            let crop = Crop {
                scale_to: (scaled != original).then_some(scaled),
                origin,
                size: crop,
            };
            step = SizeStep::Crop(crop);
            queue.push(Priority::ResizeOrCrop, crop);
        } else {
            let (w, h) = calculate_dimensions(original, &req);
            step = SizeStep::Resize((w, h));
            if (w, h) != original {
                queue.push(Priority::ResizeOrCrop, Resize { width: w, height: h });
            }
        }

        let params = ctx.params.clone();
        let mut flip = None;
        if let Some(value) = params.get("flip") {
            match Flip::parse(value) {
                Some(parsed) => {
                    flip = Some(parsed);
                    queue.push(Priority::Flip, parsed);
                }
                None => warn!(flip = value, "unknown flip, ignoring"),
            }
        }

        if let Some(chain) = params.get("filter") {
            let calls = parse_filter_chain(chain);
            // Filters see the image after resize or crop and flip.
            let faces = chain_uses_faces(&calls).then(|| {
                let found = self.faces(ctx, &working, 3);
                let found = match window {
                    Some((frame, origin, size)) => found.cropped(frame, origin, size),
                    None => found,
                };
                match flip {
                    Some(f) => found.mirrored(f.horizontal, f.vertical),
                    None => found,
                }
            });
            for call in &calls {
                match self.services.filters.build(call, faces.as_ref()) {
                    Ok(filter) => queue.push(Priority::Filter, filter),
                    Err(e) => warn!(filter = %call.name, error = %e, "skipping filter"),
                }
            }
        }

        if let Some(value) = params.get("text") {
            match (TextSpec::parse(value), &self.services.text) {
                (Some(spec), Some(renderer)) => queue.push(
                    Priority::Text,
                    TextOverlay {
                        renderer: renderer.clone(),
                        spec,
                    },
                ),
                (None, _) => warn!(text = value, "malformed text overlay, ignoring"),
                (Some(_), None) => warn!("no text renderer installed, skipping text"),
            }
        }

        if let Some(value) = params.get("watermark")
            && let Some(mark) = self.watermark(value)
        {
            queue.push(Priority::Watermark, mark);
        }

        if let Some(radius) = params.get("rounded_corners") {
            match radius.trim_end_matches("px").parse::<u32>() {
                Ok(0) => {}
                Ok(radius) => queue.push(Priority::RoundedCorners, RoundedCorners { radius }),
                Err(_) => warn!(rounded_corners = radius, "invalid corner radius, ignoring"),
            }
        }

        if let Some(value) = params.get("border") {
            let masked = queue.contains(Priority::RoundedCorners)
                || (format.supports_alpha() && working.color().has_alpha());
            match Border::parse(value, masked) {
                Some(border) if border.width > 0 => queue.push(Priority::Border, border),
                Some(_) => {}
                None => warn!(border = value, "malformed border, ignoring"),
            }
        }

        if let Some(value) = params.get("reflection") {
            queue.push(Priority::Reflection, Reflection::parse(value));
        }

        if let Some(value) = params.get("rotate") {
            match value.trim().parse::<f64>() {
                Ok(degrees) if degrees.is_finite() && degrees.rem_euclid(360.0) != 0.0 => {
                    queue.push(Priority::Rotate, Rotate { degrees })
                }
                Ok(_) => {}
                Err(_) => warn!(rotate = value, "invalid rotation, ignoring"),
            }
        }

        let processed = if queue.is_empty() {
            working
        } else {
            let (img, timings) = queue.run(working).map_err(PipelineError::Transform)?;
            ctx.metadata.queue_runs += 1;
            ctx.metadata.timings.extend(timings);
            img
        };
        if let Some(base) = base {
            ctx.set_rendition(Rendition {
                base,
                queue,
                step,
                size: (processed.width(), processed.height()),
            });
        }
        ctx.metadata.output_format = Some(format);
        ctx.metadata.final_width = Some(processed.width());
        ctx.metadata.final_height = Some(processed.height());
        ctx.set_processed_image(processed)
    }

    /// `<path>|<position>|<opacity>|<margin>`.
    fn watermark(&self, value: &str) -> Option<Watermark> {
        let mut parts = value.split('|').map(str::trim);
        let path = parts.next().filter(|p| !p.is_empty())?;
        let placement = parts.next().map(Placement::parse).unwrap_or_default();
        let opacity = parts.next().and_then(|o| o.trim_end_matches('%').parse().ok()).unwrap_or(100.0);
        let margin = parts.next().and_then(|m| m.parse().ok()).unwrap_or(0);
        match self.services.loader.load(path) {
            Ok(loaded) => match loaded.source {
                Source::Raster { image, .. } => Some(Watermark {
                    mark: Arc::new(image),
                    placement,
                    opacity,
                    margin,
                }),
                other => {
                    warn!(path, kind = other.kind(), "watermark must be a raster image, skipping");
                    None
                }
            },
            Err(e) => {
                warn!(path, error = %e, "watermark unavailable, skipping");
                None
            }
        }
    }
}

impl Stage for ProcessImage {
    fn name(&self) -> &'static str {
        "process_image"
    }

    fn process(&self, ctx: &mut ProcessingContext) -> Result<StageOutcome, PipelineError> {
        let work = match ctx.source() {
            None => return Err(PipelineError::Invariant("no source loaded".into())),
            Some(Source::Svg(bytes)) => Work::Passthrough {
                format: OutputFormat::Svg,
                original: codec::svg_dimensions(bytes),
            },
            Some(Source::AnimatedGif(bytes)) => {
                if ctx.has_flag(Flag::PaletteMode) {
                    // The first frame stands in for the animation.
                    Work::Raster {
                        image: codec::decode(bytes)?,
                        format: ImageFormat::Gif,
                    }
                } else {
                    Work::Passthrough {
                        format: OutputFormat::Gif,
                        original: codec::dimensions(bytes).ok(),
                    }
                }
            }
            Some(Source::ColourFill(colour)) => Work::Fill(*colour),
            Some(Source::Raster { image, format }) => Work::Raster {
                image: image.clone(),
                format: *format,
            },
        };

        if ctx.has_flag(Flag::PaletteMode) {
            match work {
                Work::Raster { image, .. } => self.palette(ctx, &image),
                Work::Fill(colour) => {
                    let swatch = DynamicImage::ImageRgba8(RgbaImage::from_pixel(1, 1, colour.rgba()));
                    self.palette(ctx, &swatch);
                }
                Work::Passthrough { .. } => warn!("palette needs a raster source, skipping"),
            }
            return Ok(StageOutcome::Continue);
        }

        match work {
            Work::Passthrough { format, original } => self.passthrough(ctx, format, original),
            Work::Fill(colour) => self.colour_fill(ctx, colour)?,
            Work::Raster { image, format } => self.raster(ctx, image, format)?,
        }
        Ok(StageOutcome::Continue)
    }
}

/// Whether derived widths will be rendered.
fn wants_responsive(params: &TagParams) -> bool {
    params.get("srcset").is_some_and(|v| !v.trim().is_empty())
}

/// `save_as`, else `save_type`, when it names a raster format.
fn requested_format(params: &TagParams) -> Option<OutputFormat> {
    let value = params.get("save_as").or_else(|| params.get("save_type"))?;
    match OutputFormat::from_extension(value) {
        Some(OutputFormat::Svg) | None => {
            warn!(save_as = value, "cannot save as this format, keeping the source format");
            None
        }
        format => format,
    }
}

fn px(length: Option<Length>) -> Option<u32> {
    match length {
        Some(Length::Px(n)) if n >= 1.0 => Some(n.round() as u32),
        _ => None,
    }
}

/// The dimension parameters. Malformed constraints are dropped with a
/// warning; `width` and `height` were validated by initialisation.
fn dimension_request(params: &TagParams) -> DimensionRequest {
    let length = |name: &str| {
        let value = params.get(name)?;
        let parsed = Length::parse(value);
        if parsed.is_none() {
            warn!(param = name, value, "malformed length, ignoring");
        }
        parsed
    };
    let aspect_ratio = params.get("aspect_ratio").and_then(|v| {
        let parsed = parse_aspect_ratio(v);
        if parsed.is_none() {
            warn!(aspect_ratio = v, "malformed aspect ratio, ignoring");
        }
        parsed
    });
    DimensionRequest {
        width: length("width"),
        height: length("height"),
        fit: params.get("fit").and_then(Fit::parse).unwrap_or_default(),
        aspect_ratio,
        min: length("min"),
        max: length("max"),
        min_width: length("min_width"),
        max_width: length("max_width"),
        min_height: length("min_height"),
        max_height: length("max_height"),
        allow_scale_larger: params.flag("allow_scale_larger"),
    }
}
