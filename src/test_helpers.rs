//! Shared test utilities for the pictor test suite.
//!
//! Synthetic images are generated in memory so no binary fixtures are needed,
//! and every fixture that touches disk lives in its own [`TempDir`].
//!
//! # Usage
//!
//! ```rust
//! use crate::test_helpers::*;
//!
//! let fx = Fixture::new();
//! fx.write_source("photo.jpg", &jpeg_bytes(1200, 800));
//! let services = fx.services();
//! let ctx = fx.context(&[("src", "photo.jpg"), ("width", "300")]);
//! ```

use crate::config::Settings;
use crate::context::ProcessingContext;
use crate::params::TagParams;
use crate::services::ServiceBundle;
use crate::storage::{LocalStorage, StorageAdapter};
use image::codecs::gif::GifEncoder;
use image::{DynamicImage, Delay, Frame, ImageFormat, Rgba, RgbaImage};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

// =========================================================================
// Synthetic images
// =========================================================================

/// A horizontal gradient, so resizes and crops change the pixels.
pub fn gradient(width: u32, height: u32) -> DynamicImage {
    let img = RgbaImage::from_fn(width, height, |x, y| {
        let r = (x * 255 / width.max(1)) as u8;
        let g = (y * 255 / height.max(1)) as u8;
        Rgba([r, g, 128, 255])
    });
    DynamicImage::ImageRgba8(img)
}

fn encode(img: &DynamicImage, format: ImageFormat) -> Vec<u8> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), format).unwrap();
    buf
}

pub fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
    encode(&DynamicImage::ImageRgb8(gradient(width, height).to_rgb8()), ImageFormat::Jpeg)
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    encode(&gradient(width, height), ImageFormat::Png)
}

/// A three-frame GIF.
pub fn animated_gif_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let mut encoder = GifEncoder::new(&mut buf);
        let frames = [[255, 0, 0, 255], [0, 255, 0, 255], [0, 0, 255, 255]].map(|px| {
            Frame::from_parts(
                RgbaImage::from_pixel(width, height, Rgba(px)),
                0,
                0,
                Delay::from_numer_denom_ms(100, 1),
            )
        });
        encoder.encode_frames(frames).unwrap();
    }
    buf
}

// =========================================================================
// Pipeline fixtures
// =========================================================================

/// Settings rooted in a temp directory: sources live under `<tmp>/`, the
/// `local` connection writes to `<tmp>/public/`.
pub struct Fixture {
    pub tmp: TempDir,
    pub settings: Settings,
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new()
    }
}

impl Fixture {
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let mut settings = Settings::default();
        settings.base_path = tmp.path().to_path_buf();
        settings.defaults.quality = 90;
        Self { tmp, settings }
    }

    pub fn root(&self) -> &Path {
        self.tmp.path()
    }

    pub fn public(&self) -> PathBuf {
        self.tmp.path().join("public")
    }

    pub fn write_source(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.tmp.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, bytes).unwrap();
        path
    }

    pub fn services(&self) -> ServiceBundle {
        ServiceBundle::from_settings(self.settings.clone())
    }

    pub fn context(&self, pairs: &[(&str, &str)]) -> ProcessingContext {
        ProcessingContext::new(TagParams::from_pairs(pairs.iter().copied()))
    }

    pub fn storage(&self) -> Box<dyn StorageAdapter> {
        Box::new(LocalStorage::new(self.public(), "/"))
    }

    /// Files written below the public root, relative and sorted.
    pub fn public_files(&self) -> Vec<String> {
        self.storage().list("").unwrap()
    }
}
