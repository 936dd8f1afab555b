//! Image operations applied by the transformation queue.
//!
//! Each operation is an opaque `DynamicImage → DynamicImage` step behind the
//! [`Transform`] trait. The queue owns ordering; operations know nothing
//! about each other.

use super::codec::ImagingError;
use super::params::{Anchor, Colour};
use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, Rgba, RgbaImage};
use std::sync::Arc;

/// One queued image operation.
pub trait Transform: Send + Sync {
    /// Short name used in logs and timings.
    fn name(&self) -> &str;

    fn apply(&self, img: DynamicImage) -> Result<DynamicImage, ImagingError>;
}

/// Exact resize with Lanczos3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resize {
    pub width: u32,
    pub height: u32,
}

impl Transform for Resize {
    fn name(&self) -> &str {
        "resize"
    }

    fn apply(&self, img: DynamicImage) -> Result<DynamicImage, ImagingError> {
        if img.dimensions() == (self.width, self.height) {
            return Ok(img);
        }
        Ok(img.resize_exact(self.width, self.height, FilterType::Lanczos3))
    }
}

/// Optional cover-resize to `scale_to`, then cut `size` at `origin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crop {
    pub scale_to: Option<(u32, u32)>,
    pub origin: (u32, u32),
    pub size: (u32, u32),
}

impl Transform for Crop {
    fn name(&self) -> &str {
        "crop"
    }

    fn apply(&self, img: DynamicImage) -> Result<DynamicImage, ImagingError> {
        let img = match self.scale_to {
            Some((w, h)) if img.dimensions() != (w, h) => {
                img.resize_exact(w, h, FilterType::Lanczos3)
            }
            _ => img,
        };
        let (w, h) = img.dimensions();
        let (x, y) = self.origin;
        let (cw, ch) = self.size;
        if x + cw > w || y + ch > h {
            return Err(ImagingError::Operation {
                op: "crop".into(),
                message: format!("{cw}x{ch}+{x}+{y} outside {w}x{h}"),
            });
        }
        Ok(img.crop_imm(x, y, cw, ch))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flip {
    pub horizontal: bool,
    pub vertical: bool,
}

impl Flip {
    /// `h`, `v`, or `both`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "h" | "horizontal" => Some(Self { horizontal: true, vertical: false }),
            "v" | "vertical" => Some(Self { horizontal: false, vertical: true }),
            "both" | "hv" | "vh" => Some(Self { horizontal: true, vertical: true }),
            _ => None,
        }
    }
}

impl Transform for Flip {
    fn name(&self) -> &str {
        "flip"
    }

    fn apply(&self, img: DynamicImage) -> Result<DynamicImage, ImagingError> {
        let img = if self.horizontal { img.fliph() } else { img };
        Ok(if self.vertical { img.flipv() } else { img })
    }
}

/// Clears pixels outside rounded corners (anti-aliased edge).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundedCorners {
    pub radius: u32,
}

impl Transform for RoundedCorners {
    fn name(&self) -> &str {
        "rounded_corners"
    }

    fn apply(&self, img: DynamicImage) -> Result<DynamicImage, ImagingError> {
        let mut rgba = img.to_rgba8();
        let (w, h) = rgba.dimensions();
        let r = self.radius.min(w / 2).min(h / 2) as f64;
        if r <= 0.0 {
            return Ok(DynamicImage::ImageRgba8(rgba));
        }
        let (wf, hf) = (w as f64, h as f64);
        for (x, y, px) in rgba.enumerate_pixels_mut() {
            let (fx, fy) = (x as f64 + 0.5, y as f64 + 0.5);
            let cx = if fx < r {
                r
            } else if fx > wf - r {
                wf - r
            } else {
                continue;
            };
            let cy = if fy < r {
                r
            } else if fy > hf - r {
                hf - r
            } else {
                continue;
            };
            let dist = ((fx - cx).powi(2) + (fy - cy).powi(2)).sqrt();
            let coverage = (r + 0.5 - dist).clamp(0.0, 1.0);
            px[3] = (px[3] as f64 * coverage).round() as u8;
        }
        Ok(DynamicImage::ImageRgba8(rgba))
    }
}

/// Border of `width` pixels on every side.
///
/// `masked` borders follow the image's alpha outline (used after rounded
/// corners); box borders fill a plain rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Border {
    pub width: u32,
    pub colour: Colour,
    pub masked: bool,
}

impl Border {
    /// `<width>|<colour>`; colour defaults to black.
    pub fn parse(value: &str, masked: bool) -> Option<Self> {
        let mut parts = value.split('|');
        let width = parts.next()?.trim().trim_end_matches("px").parse().ok()?;
        let colour = parts
            .next()
            .and_then(Colour::parse)
            .unwrap_or(Colour::BLACK);
        Some(Self {
            width,
            colour,
            masked,
        })
    }
}

impl Transform for Border {
    fn name(&self) -> &str {
        if self.masked { "border_masked" } else { "border" }
    }

    fn apply(&self, img: DynamicImage) -> Result<DynamicImage, ImagingError> {
        let src = img.to_rgba8();
        let (w, h) = src.dimensions();
        let b = self.width;
        let (nw, nh) = (w + 2 * b, h + 2 * b);

        let mut canvas = if self.masked {
            let mut alpha = vec![0u8; (nw * nh) as usize];
            for (x, y, px) in src.enumerate_pixels() {
                alpha[((y + b) * nw + x + b) as usize] = px[3];
            }
            let alpha = dilate(&alpha, nw as usize, nh as usize, b as usize);
            let [r, g, bl, a] = self.colour.0;
            RgbaImage::from_fn(nw, nh, |x, y| {
                let m = alpha[(y * nw + x) as usize] as u32;
                Rgba([r, g, bl, (a as u32 * m / 255) as u8])
            })
        } else {
            RgbaImage::from_pixel(nw, nh, self.colour.rgba())
        };
        imageops::overlay(&mut canvas, &src, b as i64, b as i64);
        Ok(DynamicImage::ImageRgba8(canvas))
    }
}

/// Separable max filter with radius `r`.
fn dilate(alpha: &[u8], w: usize, h: usize, r: usize) -> Vec<u8> {
    let mut horizontal = vec![0u8; alpha.len()];
    for y in 0..h {
        let row = &alpha[y * w..(y + 1) * w];
        for x in 0..w {
            let lo = x.saturating_sub(r);
            let hi = (x + r).min(w - 1);
            horizontal[y * w + x] = row[lo..=hi].iter().copied().max().unwrap_or(0);
        }
    }
    let mut out = vec![0u8; alpha.len()];
    for x in 0..w {
        for y in 0..h {
            let lo = y.saturating_sub(r);
            let hi = (y + r).min(h - 1);
            out[y * w + x] = (lo..=hi).map(|yy| horizontal[yy * w + x]).max().unwrap_or(0);
        }
    }
    out
}

/// Mirrored copy below the image, fading from `start_opacity` to
/// `end_opacity` (percent).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reflection {
    pub gap: u32,
    pub start_opacity: f64,
    pub end_opacity: f64,
    /// Reflection height as a percentage of the image height.
    pub height_pct: f64,
}

impl Reflection {
    /// `<gap>|<start_opacity>|<end_opacity>|<height%>`, defaults `0|80|0|50`.
    pub fn parse(value: &str) -> Self {
        let fields: Vec<f64> = value
            .split('|')
            .map(|f| f.trim().trim_end_matches('%').parse().unwrap_or(f64::NAN))
            .collect();
        let field = |i: usize, default: f64| {
            fields
                .get(i)
                .copied()
                .filter(|v| v.is_finite() && *v >= 0.0)
                .unwrap_or(default)
        };
        Self {
            gap: field(0, 0.0) as u32,
            start_opacity: field(1, 80.0).min(100.0),
            end_opacity: field(2, 0.0).min(100.0),
            height_pct: field(3, 50.0).min(100.0),
        }
    }
}

impl Transform for Reflection {
    fn name(&self) -> &str {
        "reflection"
    }

    fn apply(&self, img: DynamicImage) -> Result<DynamicImage, ImagingError> {
        let src = img.to_rgba8();
        let (w, h) = src.dimensions();
        let rh = ((h as f64 * self.height_pct / 100.0).round() as u32).clamp(1, h);
        let mut canvas = RgbaImage::new(w, h + self.gap + rh);
        imageops::overlay(&mut canvas, &src, 0, 0);
        for y in 0..rh {
            let t = y as f64 / rh as f64;
            let opacity = (self.start_opacity + (self.end_opacity - self.start_opacity) * t) / 100.0;
            for x in 0..w {
                let mut px = *src.get_pixel(x, h - 1 - y);
                px[3] = (px[3] as f64 * opacity).round() as u8;
                canvas.put_pixel(x, h + self.gap + y, px);
            }
        }
        Ok(DynamicImage::ImageRgba8(canvas))
    }
}

/// Clockwise rotation. Right angles are lossless; other angles expand the
/// canvas and leave the corners transparent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rotate {
    pub degrees: f64,
}

impl Transform for Rotate {
    fn name(&self) -> &str {
        "rotate"
    }

    fn apply(&self, img: DynamicImage) -> Result<DynamicImage, ImagingError> {
        let deg = self.degrees.rem_euclid(360.0);
        if deg.abs() < f64::EPSILON {
            return Ok(img);
        }
        for (right, f) in [
            (90.0, DynamicImage::rotate90 as fn(&DynamicImage) -> DynamicImage),
            (180.0, DynamicImage::rotate180),
            (270.0, DynamicImage::rotate270),
        ] {
            if (deg - right).abs() < f64::EPSILON {
                return Ok(f(&img));
            }
        }

        let src = img.to_rgba8();
        let (w, h) = (src.width() as f64, src.height() as f64);
        let (sin, cos) = deg.to_radians().sin_cos();
        let nw = (w * cos.abs() + h * sin.abs()).ceil().max(1.0);
        let nh = (w * sin.abs() + h * cos.abs()).ceil().max(1.0);
        let (cx, cy, ncx, ncy) = (w / 2.0, h / 2.0, nw / 2.0, nh / 2.0);
        let out = RgbaImage::from_fn(nw as u32, nh as u32, |x, y| {
            let dx = x as f64 + 0.5 - ncx;
            let dy = y as f64 + 0.5 - ncy;
            // Inverse rotation back into source space.
            let sx = dx * cos + dy * sin + cx;
            let sy = -dx * sin + dy * cos + cy;
            if sx >= 0.0 && sy >= 0.0 && sx < w && sy < h {
                *src.get_pixel(sx as u32, sy as u32)
            } else {
                Rgba([0, 0, 0, 0])
            }
        });
        Ok(DynamicImage::ImageRgba8(out))
    }
}

/// Where an overlay lands: `bottom_right`, `top-left`, `center`, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub horizontal: Anchor,
    pub vertical: Anchor,
}

impl Default for Placement {
    fn default() -> Self {
        Self {
            horizontal: Anchor::End,
            vertical: Anchor::End,
        }
    }
}

impl Placement {
    pub fn parse(value: &str) -> Self {
        let mut placement = Self {
            horizontal: Anchor::Center,
            vertical: Anchor::Center,
        };
        let mut matched = false;
        for word in value.split(['-', '_', ',', ' ']).map(str::trim) {
            match word.to_ascii_lowercase().as_str() {
                "left" => placement.horizontal = Anchor::Start,
                "right" => placement.horizontal = Anchor::End,
                "top" => placement.vertical = Anchor::Start,
                "bottom" => placement.vertical = Anchor::End,
                "center" | "centre" | "middle" => {}
                _ => continue,
            }
            matched = true;
        }
        if matched { placement } else { Self::default() }
    }

    /// Top-left position of an overlay of `size` inside `canvas`.
    pub fn position(&self, canvas: (u32, u32), size: (u32, u32), margin: u32) -> (i64, i64) {
        let axis = |anchor: Anchor, full: u32, len: u32| -> i64 {
            let (full, len, margin) = (full as i64, len as i64, margin as i64);
            match anchor {
                Anchor::Start => margin,
                Anchor::End => full - len - margin,
                Anchor::Center | Anchor::Face => (full - len) / 2,
            }
        };
        (
            axis(self.horizontal, canvas.0, size.0),
            axis(self.vertical, canvas.1, size.1),
        )
    }
}

/// Overlay another image at a placement with an opacity (percent).
#[derive(Clone)]
pub struct Watermark {
    pub mark: Arc<DynamicImage>,
    pub placement: Placement,
    pub opacity: f64,
    pub margin: u32,
}

impl Transform for Watermark {
    fn name(&self) -> &str {
        "watermark"
    }

    fn apply(&self, img: DynamicImage) -> Result<DynamicImage, ImagingError> {
        let mut base = img.to_rgba8();
        let mut mark = self.mark.to_rgba8();
        let opacity = (self.opacity / 100.0).clamp(0.0, 1.0);
        for px in mark.pixels_mut() {
            px[3] = (px[3] as f64 * opacity).round() as u8;
        }
        let (x, y) = self
            .placement
            .position(base.dimensions(), mark.dimensions(), self.margin);
        imageops::overlay(&mut base, &mark, x, y);
        Ok(DynamicImage::ImageRgba8(base))
    }
}

/// Parsed `text` parameter: `<message>|<size>|<colour>|<position>`.
#[derive(Debug, Clone, PartialEq)]
pub struct TextSpec {
    pub message: String,
    pub size: f32,
    pub colour: Colour,
    pub placement: Placement,
}

impl TextSpec {
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.split('|');
        let message = parts.next()?.trim();
        if message.is_empty() {
            return None;
        }
        let size = parts
            .next()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(24.0);
        let colour = parts
            .next()
            .and_then(Colour::parse)
            .unwrap_or(Colour::WHITE);
        let placement = parts.next().map(Placement::parse).unwrap_or_default();
        Some(Self {
            message: message.to_string(),
            size,
            colour,
            placement,
        })
    }
}

/// Draws text onto an image. Fonts and shaping are the renderer's business.
pub trait TextRenderer: Send + Sync {
    fn render(&self, img: DynamicImage, text: &TextSpec) -> Result<DynamicImage, ImagingError>;
}

/// Queue adapter around a [`TextRenderer`].
pub struct TextOverlay {
    pub renderer: Arc<dyn TextRenderer>,
    pub spec: TextSpec,
}

impl Transform for TextOverlay {
    fn name(&self) -> &str {
        "text"
    }

    fn apply(&self, img: DynamicImage) -> Result<DynamicImage, ImagingError> {
        self.renderer.render(img, &self.spec)
    }
}
