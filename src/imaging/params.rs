//! Parameter types for image operations.
//!
//! These types describe *what* to do, not *how* to do it. They are parsed
//! from tag parameter strings and consumed by the calculations, the codec, and
//! the transformation queue.
//!
//! ## Types
//!
//! - [`Quality`]: Lossy encoding quality (1–100). Clamped on construction.
//! - [`Sharpening`]: Unsharp-mask parameters (sigma + threshold).
//! - [`OutputFormat`]: Encoded output format, with alpha/lossy capabilities.
//! - [`Compression`]: Quality / PNG level / lossless request for one encode.
//! - [`Fit`]: How requested width and height reconcile with the source ratio.
//! - [`Length`]: Pixel or percentage length from a tag parameter.
//! - [`Colour`]: RGBA colour parsed from `#rgb`, `#rrggbb`, `#rrggbbaa` or a name.
//! - [`CropSpec`]: Parsed `crop` parameter with per-field defaults.

use image::Rgba;
use std::fmt;

/// Quality setting for lossy image encoding (1-100).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quality(pub u32);

impl Quality {
    pub fn new(value: u32) -> Self {
        Self(value.clamp(1, 100))
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl Default for Quality {
    fn default() -> Self {
        Self(85)
    }
}

/// Sharpening parameters for unsharp mask.
///
/// - `sigma`: Standard deviation of the Gaussian blur (higher = more sharpening)
/// - `threshold`: Minimum brightness difference to sharpen (0 = sharpen all pixels)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sharpening {
    pub sigma: f32,
    pub threshold: i32,
}

impl Sharpening {
    /// Light sharpening, used after large downscales.
    pub fn light() -> Self {
        Self {
            sigma: 0.5,
            threshold: 0,
        }
    }
}

/// Output encodings the codec can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    Jpeg,
    Png,
    WebP,
    Gif,
    Bmp,
    /// Passthrough only; SVG is never rasterised.
    Svg,
}

impl OutputFormat {
    /// Parse a `save_as` value or file extension.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "webp" => Some(Self::WebP),
            "gif" => Some(Self::Gif),
            "bmp" => Some(Self::Bmp),
            "svg" => Some(Self::Svg),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::WebP => "webp",
            Self::Gif => "gif",
            Self::Bmp => "bmp",
            Self::Svg => "svg",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::WebP => "image/webp",
            Self::Gif => "image/gif",
            Self::Bmp => "image/bmp",
            Self::Svg => "image/svg+xml",
        }
    }

    /// Whether the encoding can carry an alpha channel.
    pub fn supports_alpha(self) -> bool {
        matches!(self, Self::Png | Self::WebP | Self::Gif | Self::Svg)
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Compression request for one encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// Lossy quality (JPEG).
    Quality(Quality),
    /// PNG compression level 0-9.
    PngLevel(u8),
    /// Best lossless encoding the format offers. JPEG degrades to quality 100.
    Lossless,
}

/// Everything the codec needs to serialise an image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncodeOptions {
    pub format: OutputFormat,
    pub compression: Compression,
    /// Composited under transparent pixels when the format has no alpha.
    pub background: Option<Colour>,
}

impl EncodeOptions {
    pub fn new(format: OutputFormat, compression: Compression) -> Self {
        Self {
            format,
            compression,
            background: None,
        }
    }

    pub fn with_background(mut self, background: Option<Colour>) -> Self {
        self.background = background;
        self
    }
}

/// How requested `width` and `height` reconcile with the source ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fit {
    /// Fit entirely inside the requested box.
    #[default]
    Contain,
    /// Fill the requested box, overflowing on one axis.
    Cover,
    /// Use both numbers verbatim.
    Distort,
}

impl Fit {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "contain" => Some(Self::Contain),
            "cover" => Some(Self::Cover),
            "distort" | "stretch" => Some(Self::Distort),
            _ => None,
        }
    }
}

/// A length from a tag parameter: `300`, `300px`, or `50%`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Length {
    Px(f64),
    Percent(f64),
}

impl Length {
    pub fn parse(value: &str) -> Option<Self> {
        let v = value.trim().to_ascii_lowercase();
        if let Some(p) = v.strip_suffix('%') {
            let n: f64 = p.trim().parse().ok()?;
            return (n.is_finite() && n >= 0.0).then_some(Self::Percent(n));
        }
        let n: f64 = v.trim_end_matches("px").trim().parse().ok()?;
        (n.is_finite() && n >= 0.0).then_some(Self::Px(n))
    }

    /// Resolve against a reference dimension (used for percentages).
    pub fn resolve(self, reference: u32) -> f64 {
        match self {
            Self::Px(n) => n,
            Self::Percent(p) => reference as f64 * p / 100.0,
        }
    }
}

/// Parse an aspect ratio written as `W_H`, `W:H`, `W/H`, or a decimal.
pub fn parse_aspect_ratio(value: &str) -> Option<f64> {
    let v = value.trim();
    let ratio = match v.split_once(['_', ':', '/', 'x']) {
        Some((w, h)) => {
            let w: f64 = w.trim().parse().ok()?;
            let h: f64 = h.trim().parse().ok()?;
            if h == 0.0 {
                return None;
            }
            w / h
        }
        None => v.parse().ok()?,
    };
    (ratio.is_finite() && ratio > 0.0).then_some(ratio)
}

/// RGBA colour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Colour(pub [u8; 4]);

impl Colour {
    pub const WHITE: Colour = Colour([255, 255, 255, 255]);
    pub const BLACK: Colour = Colour([0, 0, 0, 255]);

    /// Parse `#rgb`, `#rrggbb`, `#rrggbbaa` (hash optional) or a basic name.
    pub fn parse(value: &str) -> Option<Self> {
        let v = value.trim().to_ascii_lowercase();
        match v.as_str() {
            "white" => return Some(Self::WHITE),
            "black" => return Some(Self::BLACK),
            "red" => return Some(Self([255, 0, 0, 255])),
            "green" => return Some(Self([0, 128, 0, 255])),
            "blue" => return Some(Self([0, 0, 255, 255])),
            "grey" | "gray" => return Some(Self([128, 128, 128, 255])),
            "transparent" => return Some(Self([0, 0, 0, 0])),
            _ => {}
        }
        let hex = v.trim_start_matches('#');
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        let byte = |s: &str| u8::from_str_radix(s, 16).ok();
        match hex.len() {
            3 => {
                let mut out = [0u8; 4];
                for (i, c) in hex.chars().enumerate() {
                    let d = c.to_digit(16)? as u8;
                    out[i] = d * 17;
                }
                out[3] = 255;
                Some(Self(out))
            }
            6 => Some(Self([
                byte(&hex[0..2])?,
                byte(&hex[2..4])?,
                byte(&hex[4..6])?,
                255,
            ])),
            8 => Some(Self([
                byte(&hex[0..2])?,
                byte(&hex[2..4])?,
                byte(&hex[4..6])?,
                byte(&hex[6..8])?,
            ])),
            _ => None,
        }
    }

    pub fn rgba(self) -> Rgba<u8> {
        Rgba(self.0)
    }

    /// `#rrggbb` (alpha dropped).
    pub fn to_hex(self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.0[0], self.0[1], self.0[2])
    }
}

/// Anchor of a crop window along one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    Start,
    Center,
    End,
    /// Centre on detected faces, falling back to `Center` when none are found.
    Face,
}

impl Anchor {
    fn parse(value: &str, start: &str, end: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "center" | "centre" | "middle" => Some(Self::Center),
            "face_detect" | "face" => Some(Self::Face),
            v if v == start => Some(Self::Start),
            v if v == end => Some(Self::End),
            _ => None,
        }
    }
}

/// Parsed `crop` parameter: `enabled|position|offset|smart_scale|face_sensitivity`.
///
/// Every field has a default (`y|center,center|0,0|y|3`); a missing or
/// malformed field falls back to its default with a warning, it never fails
/// the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropSpec {
    pub enabled: bool,
    pub horizontal: Anchor,
    pub vertical: Anchor,
    pub offset: (i32, i32),
    /// Cover-resize to the crop box before cropping.
    pub smart_scale: bool,
    pub face_sensitivity: u32,
}

impl Default for CropSpec {
    fn default() -> Self {
        Self {
            enabled: true,
            horizontal: Anchor::Center,
            vertical: Anchor::Center,
            offset: (0, 0),
            smart_scale: true,
            face_sensitivity: 3,
        }
    }
}

impl CropSpec {
    pub fn parse(value: &str) -> Self {
        let mut spec = Self::default();
        let fields: Vec<&str> = value.split('|').map(str::trim).collect();

        if let Some(enabled) = fields.first().filter(|f| !f.is_empty()) {
            spec.enabled = crate::params::is_truthy(enabled);
        }

        if let Some(position) = fields.get(1).filter(|f| !f.is_empty()) {
            let (h, v) = position.split_once(',').unwrap_or((*position, "center"));
            match (
                Anchor::parse(h, "left", "right"),
                Anchor::parse(v, "top", "bottom"),
            ) {
                (Some(h), Some(v)) => {
                    spec.horizontal = h;
                    spec.vertical = v;
                }
                _ => tracing::warn!(position, "malformed crop position, using center,center"),
            }
        }

        if let Some(offset) = fields.get(2).filter(|f| !f.is_empty()) {
            let parsed = offset
                .split_once(',')
                .and_then(|(x, y)| Some((x.trim().parse().ok()?, y.trim().parse().ok()?)));
            match parsed {
                Some(o) => spec.offset = o,
                None => tracing::warn!(offset, "malformed crop offset, using 0,0"),
            }
        }

        if let Some(smart) = fields.get(3).filter(|f| !f.is_empty()) {
            spec.smart_scale = crate::params::is_truthy(smart);
        }

        if let Some(sensitivity) = fields.get(4).filter(|f| !f.is_empty()) {
            match sensitivity.parse() {
                Ok(s) => spec.face_sensitivity = s,
                Err(_) => tracing::warn!(sensitivity, "malformed face sensitivity, using 3"),
            }
        }

        spec
    }

    pub fn uses_faces(&self) -> bool {
        self.horizontal == Anchor::Face || self.vertical == Anchor::Face
    }
}

impl serde::Serialize for OutputFormat {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.extension())
    }
}

impl serde::Serialize for Colour {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_hex())
    }
}
