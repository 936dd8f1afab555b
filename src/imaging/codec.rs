//! Decoding, encoding, and source sniffing on top of the `image` crate.
//!
//! ## Crate mapping
//!
//! | Operation | Crate / function |
//! |---|---|
//! | Decode (JPEG, PNG, GIF, BMP, TIFF, WebP) | `image::load_from_memory` |
//! | Dimensions without decode | `ImageReader::into_dimensions` |
//! | Animated GIF check | `GifDecoder::into_frames` (stops after two frames) |
//! | Encode → JPEG | `JpegEncoder::new_with_quality` |
//! | Encode → PNG | `PngEncoder::new_with_quality` |
//! | Encode → WebP | `WebPEncoder::new_lossless` |
//! | Encode → GIF, BMP | `DynamicImage::write_to` |
//! | SVG | never decoded; dimensions read from the root element |
//! | HEIC | sniffed here, converted by [`HeicConverter`](super::heic::HeicConverter) |

use super::params::{Colour, Compression, EncodeOptions, OutputFormat, Quality};
use image::codecs::gif::GifDecoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::codecs::webp::WebPEncoder;
use image::{AnimationDecoder, DynamicImage, ImageFormat, ImageReader, RgbaImage};
use std::io::Cursor;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImagingError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to decode image: {0}")]
    Decode(String),
    #[error("Failed to encode {format}: {message}")]
    Encode {
        format: OutputFormat,
        message: String,
    },
    #[error("Unsupported image: {0}")]
    Unsupported(String),
    #[error("Operation {op} failed: {message}")]
    Operation { op: String, message: String },
    #[error("HEIC conversion failed: {0}")]
    Conversion(String),
}

/// What a source's bytes turned out to be, before any full decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Passed through untouched.
    Svg,
    /// Passed through untouched; re-encoding would drop the frames.
    AnimatedGif,
    /// Must be converted to JPEG before decoding.
    Heic,
    Raster(ImageFormat),
}

/// Classify a source from its reference (path or URL) and bytes.
///
/// SVG is recognised by extension first, then by an `<svg` root element.
/// HEIC by its `ftyp` brand. GIFs are only animated with at least two frames.
pub fn sniff(reference: &str, bytes: &[u8]) -> Result<SourceKind, ImagingError> {
    if looks_like_svg(reference, bytes) {
        return Ok(SourceKind::Svg);
    }
    if is_heic(bytes) {
        return Ok(SourceKind::Heic);
    }
    match image::guess_format(bytes) {
        Ok(ImageFormat::Gif) if is_animated_gif(bytes) => Ok(SourceKind::AnimatedGif),
        Ok(format) => Ok(SourceKind::Raster(format)),
        Err(_) => Err(ImagingError::Unsupported(format!(
            "unrecognised image data in {reference}"
        ))),
    }
}

fn looks_like_svg(reference: &str, bytes: &[u8]) -> bool {
    let path = reference.split(['?', '#']).next().unwrap_or(reference);
    if path.to_ascii_lowercase().ends_with(".svg") {
        return true;
    }
    let head: Vec<u8> = bytes
        .iter()
        .skip_while(|b| b.is_ascii_whitespace())
        .take(512)
        .copied()
        .collect();
    String::from_utf8_lossy(&head).to_lowercase().contains("<svg")
}

const HEIC_BRANDS: &[&[u8; 4]] = &[
    b"heic", b"heix", b"hevc", b"hevx", b"heim", b"heis", b"mif1", b"msf1",
];

/// ISO-BMFF `ftyp` box with a HEIF brand.
pub fn is_heic(bytes: &[u8]) -> bool {
    bytes.len() >= 12
        && &bytes[4..8] == b"ftyp"
        && HEIC_BRANDS.iter().any(|brand| &bytes[8..12] == brand.as_slice())
}

/// A GIF with more than one frame. Decodes at most two frames.
pub fn is_animated_gif(bytes: &[u8]) -> bool {
    let Ok(decoder) = GifDecoder::new(Cursor::new(bytes)) else {
        return false;
    };
    decoder
        .into_frames()
        .take(2)
        .filter(|frame| frame.is_ok())
        .count()
        >= 2
}

pub fn decode(bytes: &[u8]) -> Result<DynamicImage, ImagingError> {
    image::load_from_memory(bytes).map_err(|e| ImagingError::Decode(e.to_string()))
}

/// Read dimensions from the header only.
pub fn dimensions(bytes: &[u8]) -> Result<(u32, u32), ImagingError> {
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .into_dimensions()
        .map_err(|e| ImagingError::Decode(e.to_string()))
}

/// Dimensions declared on an SVG root element.
///
/// Uses `width`/`height` when both are plain numbers (an optional `px` suffix
/// is allowed), otherwise the `viewBox` extent.
pub fn svg_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    let text = String::from_utf8_lossy(bytes);
    let start = text.find("<svg")? + 4;
    let end = start + text[start..].find('>')?;
    let attrs = crate::params::parse_attribute_pairs(text[start..end].trim_end_matches('/'));
    let attr = |name: &str| {
        attrs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    };
    let number = |v: &str| v.trim().trim_end_matches("px").parse::<f64>().ok();

    if let (Some(w), Some(h)) = (attr("width").and_then(number), attr("height").and_then(number)) {
        return Some((w.round().max(1.0) as u32, h.round().max(1.0) as u32));
    }
    let view_box: Vec<f64> = attr("viewBox")?
        .split([' ', ','])
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .collect();
    match view_box.as_slice() {
        [_, _, w, h] if *w > 0.0 && *h > 0.0 => {
            Some((w.round().max(1.0) as u32, h.round().max(1.0) as u32))
        }
        _ => None,
    }
}

/// Output format for a decoded source, when the caller did not choose one.
pub fn output_format_for(format: ImageFormat) -> OutputFormat {
    match format {
        ImageFormat::Png => OutputFormat::Png,
        ImageFormat::WebP => OutputFormat::WebP,
        ImageFormat::Gif => OutputFormat::Gif,
        ImageFormat::Bmp => OutputFormat::Bmp,
        _ => OutputFormat::Jpeg,
    }
}

/// Composite transparent pixels over `background`.
pub fn flatten(img: &DynamicImage, background: Colour) -> DynamicImage {
    let mut canvas = RgbaImage::from_pixel(img.width(), img.height(), background.rgba());
    image::imageops::overlay(&mut canvas, &img.to_rgba8(), 0, 0);
    DynamicImage::ImageRgba8(canvas)
}

/// Serialise an image.
///
/// When the target format has no alpha channel and a background colour is
/// set, transparency is composited over it first. JPEG has no lossless mode:
/// a lossless request is logged and encoded at quality 100.
pub fn encode(img: &DynamicImage, options: &EncodeOptions) -> Result<Vec<u8>, ImagingError> {
    let format = options.format;
    let flattened;
    let img = match options.background {
        Some(bg) if !format.supports_alpha() && img.color().has_alpha() => {
            flattened = flatten(img, bg);
            &flattened
        }
        _ => img,
    };
    let fail = |e: image::ImageError| ImagingError::Encode {
        format,
        message: e.to_string(),
    };

    let mut buf = Vec::new();
    match format {
        OutputFormat::Jpeg => {
            let quality = match options.compression {
                Compression::Quality(q) => q,
                Compression::Lossless => {
                    tracing::info!("JPEG has no lossless mode, encoding at quality 100");
                    Quality::new(100)
                }
                Compression::PngLevel(_) => Quality::default(),
            };
            let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality.value() as u8);
            encoder.encode_image(&img.to_rgb8()).map_err(fail)?;
        }
        OutputFormat::Png => {
            let compression = match options.compression {
                Compression::PngLevel(0..=3) => CompressionType::Fast,
                Compression::PngLevel(7..) | Compression::Lossless => CompressionType::Best,
                _ => CompressionType::Default,
            };
            let encoder = PngEncoder::new_with_quality(&mut buf, compression, PngFilter::Adaptive);
            img.write_with_encoder(encoder).map_err(fail)?;
        }
        OutputFormat::WebP => {
            if let Compression::Quality(q) = options.compression {
                tracing::debug!(quality = q.value(), "WebP is encoded lossless");
            }
            let encoder = WebPEncoder::new_lossless(&mut buf);
            DynamicImage::ImageRgba8(img.to_rgba8())
                .write_with_encoder(encoder)
                .map_err(fail)?;
        }
        OutputFormat::Gif => {
            DynamicImage::ImageRgba8(img.to_rgba8())
                .write_to(&mut Cursor::new(&mut buf), ImageFormat::Gif)
                .map_err(fail)?;
        }
        OutputFormat::Bmp => {
            DynamicImage::ImageRgb8(img.to_rgb8())
                .write_to(&mut Cursor::new(&mut buf), ImageFormat::Bmp)
                .map_err(fail)?;
        }
        OutputFormat::Svg => {
            return Err(ImagingError::Unsupported(
                "raster images cannot be encoded as SVG".into(),
            ));
        }
    }
    Ok(buf)
}
