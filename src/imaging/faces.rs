//! Face detection collaborator.
//!
//! Detection itself is pluggable through [`FaceDetector`]; the shipped
//! [`NoFaceDetector`] finds nothing, which makes face anchors fall back to
//! centre. Results are recorded together with the size of the image they were
//! computed on, so consumers working at a different scale can map them.

use image::DynamicImage;
use serde::{Deserialize, Serialize};

/// Axis-aligned face bounding box in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

pub trait FaceDetector: Send + Sync {
    /// Find faces. Higher `sensitivity` finds more, less certain, faces.
    fn detect(&self, img: &DynamicImage, sensitivity: u32) -> Vec<FaceRegion>;
}

/// Detector that never finds a face.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFaceDetector;

impl FaceDetector for NoFaceDetector {
    fn detect(&self, _img: &DynamicImage, _sensitivity: u32) -> Vec<FaceRegion> {
        Vec::new()
    }
}

/// Detection result plus the image size it was computed against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFaces {
    pub regions: Vec<FaceRegion>,
    pub image_size: (u32, u32),
}

impl DetectedFaces {
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Regions mapped onto an image of `size`.
    pub fn scaled_to(&self, size: (u32, u32)) -> Vec<FaceRegion> {
        let sx = size.0 as f64 / self.image_size.0.max(1) as f64;
        let sy = size.1 as f64 / self.image_size.1.max(1) as f64;
        self.regions
            .iter()
            .map(|r| FaceRegion {
                x: (r.x as f64 * sx).round() as u32,
                y: (r.y as f64 * sy).round() as u32,
                width: (r.width as f64 * sx).round() as u32,
                height: (r.height as f64 * sy).round() as u32,
            })
            .collect()
    }

    /// Regions as seen through a `size` window at `origin` of an image of
    /// `frame` size. Regions are clipped to the window; those entirely
    /// outside it are dropped.
    pub fn cropped(&self, frame: (u32, u32), origin: (u32, u32), size: (u32, u32)) -> DetectedFaces {
        let regions = self
            .scaled_to(frame)
            .into_iter()
            .filter_map(|r| {
                let left = r.x.max(origin.0);
                let top = r.y.max(origin.1);
                let right = (r.x + r.width).min(origin.0 + size.0);
                let bottom = (r.y + r.height).min(origin.1 + size.1);
                (right > left && bottom > top).then(|| FaceRegion {
                    x: left - origin.0,
                    y: top - origin.1,
                    width: right - left,
                    height: bottom - top,
                })
            })
            .collect();
        DetectedFaces {
            regions,
            image_size: size,
        }
    }

    /// Regions after the image is mirrored.
    pub fn mirrored(&self, horizontal: bool, vertical: bool) -> DetectedFaces {
        let (w, h) = self.image_size;
        let regions = self
            .regions
            .iter()
            .map(|r| FaceRegion {
                x: if horizontal { w.saturating_sub(r.x + r.width) } else { r.x },
                y: if vertical { h.saturating_sub(r.y + r.height) } else { r.y },
                ..*r
            })
            .collect();
        DetectedFaces {
            regions,
            image_size: self.image_size,
        }
    }

    /// Centre of the union of all regions on an image of `size`.
    pub fn centre_in(&self, size: (u32, u32)) -> Option<(f64, f64)> {
        let regions = self.scaled_to(size);
        let left = regions.iter().map(|r| r.x).min()?;
        let top = regions.iter().map(|r| r.y).min()?;
        let right = regions.iter().map(|r| r.x + r.width).max()?;
        let bottom = regions.iter().map(|r| r.y + r.height).max()?;
        Some(((left + right) as f64 / 2.0, (top + bottom) as f64 / 2.0))
    }
}
