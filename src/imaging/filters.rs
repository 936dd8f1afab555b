//! Filter registry and the `filter` parameter grammar.
//!
//! The `filter` parameter is a pipe-delimited chain of comma-delimited calls:
//! `blur,3|grayscale|brightness,-20`. Parsing is a thin layer in front of a
//! [`FilterRegistry`] that maps each name to a constructor, so adding a filter
//! is a single [`FilterRegistry::register`] call.
//!
//! ## Built-in filters
//!
//! | Name | Arguments | Effect |
//! |---|---|---|
//! | `blur` | `sigma=2` | Gaussian blur |
//! | `sharpen` | `sigma=1`, `threshold=0` | Unsharp mask |
//! | `auto_sharpen` | | Light unsharp mask |
//! | `grayscale` / `greyscale` | | Desaturate |
//! | `negate` | | Invert colours |
//! | `brightness` | `amount` | Add to every channel |
//! | `contrast` | `amount` | Adjust contrast |
//! | `colorize` | `r,g,b` | Add per-channel offsets |
//! | `sepia` | | Sepia tone |
//! | `pixelate` | `block=8` | Block pixelation |
//! | `hue_rotate` | `degrees` | Rotate hue |
//! | `opacity` | `percent` | Scale alpha |
//! | `face_detect` | `colour=#ff0000` | Outline detected faces |

use super::codec::ImagingError;
use super::faces::DetectedFaces;
use super::params::{Colour, Sharpening};
use super::transforms::Transform;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, Rgba};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum FilterError {
    #[error("unknown filter: {0}")]
    Unknown(String),
    #[error("invalid arguments for {name}: {message}")]
    InvalidArgs { name: String, message: String },
}

/// One call parsed from the `filter` parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterCall {
    pub name: String,
    pub args: Vec<String>,
}

/// Parse `name,arg,arg|name` into calls. Blank segments are dropped; names
/// are lower-cased.
pub fn parse_filter_chain(value: &str) -> Vec<FilterCall> {
    value
        .split('|')
        .filter_map(|segment| {
            let mut parts = segment.split(',').map(str::trim);
            let name = parts.next()?.to_ascii_lowercase();
            if name.is_empty() {
                return None;
            }
            Some(FilterCall {
                name,
                args: parts.map(str::to_string).collect(),
            })
        })
        .collect()
}

/// Whether any call needs face detection results.
pub fn chain_uses_faces(calls: &[FilterCall]) -> bool {
    calls.iter().any(|c| c.name == "face_detect")
}

/// Everything a filter constructor may read.
pub struct FilterInput<'a> {
    pub args: &'a [String],
    pub faces: Option<&'a DetectedFaces>,
}

impl FilterInput<'_> {
    /// Parse argument `i`, using `default` when absent or blank.
    pub fn arg<T: std::str::FromStr>(&self, i: usize, name: &str, default: T) -> Result<T, FilterError> {
        match self.args.get(i).map(|s| s.trim()).filter(|s| !s.is_empty()) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|_| FilterError::InvalidArgs {
                name: name.to_string(),
                message: format!("argument {} is not valid: {raw}", i + 1),
            }),
        }
    }
}

type PixelFn = dyn Fn(DynamicImage) -> DynamicImage + Send + Sync;

/// A filter as a queue operation.
pub struct FilterTransform {
    name: String,
    f: Box<PixelFn>,
}

impl FilterTransform {
    pub fn new(
        name: impl Into<String>,
        f: impl Fn(DynamicImage) -> DynamicImage + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            f: Box::new(f),
        }
    }
}

impl Transform for FilterTransform {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, img: DynamicImage) -> Result<DynamicImage, ImagingError> {
        Ok((self.f)(img))
    }
}

pub type FilterConstructor =
    Box<dyn Fn(&FilterInput<'_>) -> Result<FilterTransform, FilterError> + Send + Sync>;

/// Filter name → constructor.
pub struct FilterRegistry {
    constructors: BTreeMap<String, FilterConstructor>,
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl FilterRegistry {
    /// A registry with no filters.
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        register_builtins(&mut registry);
        registry
    }

    pub fn register(
        &mut self,
        name: &str,
        constructor: impl Fn(&FilterInput<'_>) -> Result<FilterTransform, FilterError>
        + Send
        + Sync
        + 'static,
    ) {
        self.constructors
            .insert(name.to_ascii_lowercase(), Box::new(constructor));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    pub fn build(&self, call: &FilterCall, faces: Option<&DetectedFaces>) -> Result<FilterTransform, FilterError> {
        let constructor = self
            .constructors
            .get(&call.name)
            .ok_or_else(|| FilterError::Unknown(call.name.clone()))?;
        constructor(&FilterInput {
            args: &call.args,
            faces,
        })
    }
}

fn register_builtins(r: &mut FilterRegistry) {
    r.register("blur", |input| {
        let sigma: f32 = input.arg(0, "blur", 2.0)?;
        Ok(FilterTransform::new("blur", move |img| img.blur(sigma)))
    });
    r.register("sharpen", |input| {
        let sharpening = Sharpening {
            sigma: input.arg(0, "sharpen", 1.0)?,
            threshold: input.arg(1, "sharpen", 0)?,
        };
        Ok(FilterTransform::new("sharpen", move |img| {
            img.unsharpen(sharpening.sigma, sharpening.threshold)
        }))
    });
    r.register("auto_sharpen", |_| {
        let sharpening = Sharpening::light();
        Ok(FilterTransform::new("auto_sharpen", move |img| {
            img.unsharpen(sharpening.sigma, sharpening.threshold)
        }))
    });
    for name in ["grayscale", "greyscale"] {
        r.register(name, |_| {
            Ok(FilterTransform::new("grayscale", |img| {
                let alpha = img.color().has_alpha();
                let grey = img.grayscale();
                if alpha {
                    DynamicImage::ImageRgba8(grey.to_rgba8())
                } else {
                    DynamicImage::ImageRgb8(grey.to_rgb8())
                }
            }))
        });
    }
    r.register("negate", |_| {
        Ok(FilterTransform::new("negate", |mut img| {
            img.invert();
            img
        }))
    });
    r.register("brightness", |input| {
        let amount: i32 = input.arg(0, "brightness", 0)?;
        Ok(FilterTransform::new("brightness", move |img| img.brighten(amount)))
    });
    r.register("contrast", |input| {
        let amount: f32 = input.arg(0, "contrast", 0.0)?;
        Ok(FilterTransform::new("contrast", move |img| img.adjust_contrast(amount)))
    });
    r.register("colorize", |input| {
        let offsets: [i32; 3] = [
            input.arg(0, "colorize", 0)?,
            input.arg(1, "colorize", 0)?,
            input.arg(2, "colorize", 0)?,
        ];
        Ok(FilterTransform::new("colorize", move |img| {
            map_rgba(img, |px| {
                for (c, o) in px.0.iter_mut().take(3).zip(offsets) {
                    *c = (*c as i32 + o).clamp(0, 255) as u8;
                }
            })
        }))
    });
    r.register("sepia", |_| {
        Ok(FilterTransform::new("sepia", |img| {
            map_rgba(img, |px| {
                let [r, g, b, _] = px.0.map(|c| c as f32);
                px.0[0] = (0.393 * r + 0.769 * g + 0.189 * b).min(255.0) as u8;
                px.0[1] = (0.349 * r + 0.686 * g + 0.168 * b).min(255.0) as u8;
                px.0[2] = (0.272 * r + 0.534 * g + 0.131 * b).min(255.0) as u8;
            })
        }))
    });
    r.register("pixelate", |input| {
        let block: u32 = input.arg(0, "pixelate", 8)?;
        if block == 0 {
            return Err(FilterError::InvalidArgs {
                name: "pixelate".into(),
                message: "block size must be positive".into(),
            });
        }
        Ok(FilterTransform::new("pixelate", move |img| {
            let (w, h) = img.dimensions();
            let small = img.resize_exact((w / block).max(1), (h / block).max(1), FilterType::Triangle);
            small.resize_exact(w, h, FilterType::Nearest)
        }))
    });
    r.register("hue_rotate", |input| {
        let degrees: i32 = input.arg(0, "hue_rotate", 0)?;
        Ok(FilterTransform::new("hue_rotate", move |img| img.huerotate(degrees)))
    });
    r.register("opacity", |input| {
        let percent: f64 = input.arg(0, "opacity", 100.0)?;
        let factor = (percent / 100.0).clamp(0.0, 1.0);
        Ok(FilterTransform::new("opacity", move |img| {
            map_rgba(img, |px| px.0[3] = (px.0[3] as f64 * factor).round() as u8)
        }))
    });
    r.register("face_detect", |input| {
        let colour = input
            .args
            .first()
            .and_then(|c| Colour::parse(c))
            .unwrap_or(Colour([255, 0, 0, 255]));
        let faces = input.faces.cloned();
        Ok(FilterTransform::new("face_detect", move |img| match &faces {
            Some(faces) if !faces.is_empty() => outline_faces(img, faces, colour),
            _ => img,
        }))
    });
}

fn map_rgba(img: DynamicImage, f: impl Fn(&mut Rgba<u8>)) -> DynamicImage {
    let mut rgba = img.to_rgba8();
    rgba.pixels_mut().for_each(f);
    DynamicImage::ImageRgba8(rgba)
}

fn outline_faces(img: DynamicImage, faces: &DetectedFaces, colour: Colour) -> DynamicImage {
    let mut rgba = img.to_rgba8();
    let (w, h) = rgba.dimensions();
    let thickness = (w.min(h) / 200).max(1);
    for region in faces.scaled_to((w, h)) {
        let right = (region.x + region.width).min(w);
        let bottom = (region.y + region.height).min(h);
        for x in region.x.min(w)..right {
            for t in 0..thickness {
                for y in [region.y + t, bottom.saturating_sub(1 + t)] {
                    if y < h {
                        rgba.put_pixel(x, y, colour.rgba());
                    }
                }
            }
        }
        for y in region.y.min(h)..bottom {
            for t in 0..thickness {
                for x in [region.x + t, right.saturating_sub(1 + t)] {
                    if x < w {
                        rgba.put_pixel(x, y, colour.rgba());
                    }
                }
            }
        }
    }
    DynamicImage::ImageRgba8(rgba)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::faces::FaceRegion;
    use image::RgbaImage;

    fn solid(px: [u8; 4]) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(16, 16, Rgba(px)))
    }

    #[test]
    fn parse_chain() {
        let calls = parse_filter_chain("Blur,3 | grayscale||brightness, -20");
        assert_eq!(
            calls,
            vec![
                FilterCall { name: "blur".into(), args: vec!["3".into()] },
                FilterCall { name: "grayscale".into(), args: vec![] },
                FilterCall { name: "brightness".into(), args: vec!["-20".into()] },
            ]
        );
    }

    #[test]
    fn chain_face_usage() {
        assert!(chain_uses_faces(&parse_filter_chain("blur|face_detect")));
        assert!(!chain_uses_faces(&parse_filter_chain("blur")));
    }

    #[test]
    fn unknown_filter_errors() {
        let registry = FilterRegistry::default();
        let call = FilterCall { name: "vignette".into(), args: vec![] };
        assert_eq!(
            registry.build(&call, None).err(),
            Some(FilterError::Unknown("vignette".into()))
        );
    }

    #[test]
    fn bad_arguments_error() {
        let registry = FilterRegistry::default();
        let call = FilterCall { name: "blur".into(), args: vec!["lots".into()] };
        assert!(matches!(
            registry.build(&call, None),
            Err(FilterError::InvalidArgs { .. })
        ));
    }

    #[test]
    fn custom_registration() {
        let mut registry = FilterRegistry::empty();
        assert!(!registry.contains("noop"));
        registry.register("noop", |_| Ok(FilterTransform::new("noop", |img| img)));
        assert!(registry.contains("noop"));
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["noop"]);
    }

    #[test]
    fn negate_inverts() {
        let registry = FilterRegistry::default();
        let op = registry
            .build(&FilterCall { name: "negate".into(), args: vec![] }, None)
            .unwrap();
        let out = op.apply(solid([10, 20, 30, 255])).unwrap().to_rgba8();
        assert_eq!(out.get_pixel(0, 0).0, [245, 235, 225, 255]);
    }

    #[test]
    fn grayscale_equalises_channels() {
        let registry = FilterRegistry::default();
        let op = registry
            .build(&FilterCall { name: "greyscale".into(), args: vec![] }, None)
            .unwrap();
        let out = op.apply(solid([200, 10, 10, 255])).unwrap().to_rgba8();
        let px = out.get_pixel(3, 3);
        assert_eq!(px[0], px[1]);
        assert_eq!(px[1], px[2]);
    }

    #[test]
    fn opacity_scales_alpha() {
        let registry = FilterRegistry::default();
        let op = registry
            .build(&FilterCall { name: "opacity".into(), args: vec!["50".into()] }, None)
            .unwrap();
        let out = op.apply(solid([0, 0, 0, 200])).unwrap().to_rgba8();
        assert_eq!(out.get_pixel(0, 0)[3], 100);
    }

    #[test]
    fn pixelate_rejects_zero_block() {
        let registry = FilterRegistry::default();
        let call = FilterCall { name: "pixelate".into(), args: vec!["0".into()] };
        assert!(registry.build(&call, None).is_err());
    }

    #[test]
    fn face_detect_outlines_regions() {
        let faces = DetectedFaces {
            regions: vec![FaceRegion { x: 4, y: 4, width: 8, height: 8 }],
            image_size: (16, 16),
        };
        let registry = FilterRegistry::default();
        let op = registry
            .build(&FilterCall { name: "face_detect".into(), args: vec![] }, Some(&faces))
            .unwrap();
        let out = op.apply(solid([0, 0, 0, 255])).unwrap().to_rgba8();
        assert_eq!(out.get_pixel(4, 4).0, [255, 0, 0, 255]);
        assert_eq!(out.get_pixel(8, 8).0, [0, 0, 0, 255]);
    }

    #[test]
    fn face_detect_without_faces_is_identity() {
        let registry = FilterRegistry::default();
        let op = registry
            .build(&FilterCall { name: "face_detect".into(), args: vec![] }, None)
            .unwrap();
        let out = op.apply(solid([1, 2, 3, 255])).unwrap().to_rgba8();
        assert_eq!(out.get_pixel(0, 0).0, [1, 2, 3, 255]);
    }
}
