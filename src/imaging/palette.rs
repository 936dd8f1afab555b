//! Colour palette extraction.
//!
//! Pixels are bucketed on a 4-bit-per-channel grid after downsampling; each
//! bucket's colour is the mean of its pixels. Mostly transparent pixels are
//! ignored.

use super::params::Colour;
use image::DynamicImage;
use image::imageops::FilterType;
use serde::Serialize;
use std::collections::HashMap;

/// Longest side sampled.
const SAMPLE_EDGE: u32 = 100;
/// Pixels with less alpha than this do not count.
const MIN_ALPHA: u8 = 128;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaletteEntry {
    pub colour: String,
    /// Share of counted pixels, 0.0-1.0.
    pub share: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Palette {
    pub dominant: Colour,
    /// Ranked by share, most common first.
    pub colours: Vec<PaletteEntry>,
}

/// Extract up to `size` colours. A fully transparent image yields white.
pub fn extract_palette(img: &DynamicImage, size: usize) -> Palette {
    let sample = if img.width().max(img.height()) > SAMPLE_EDGE {
        img.resize(SAMPLE_EDGE, SAMPLE_EDGE, FilterType::Triangle)
    } else {
        img.clone()
    };
    let rgba = sample.to_rgba8();

    let mut buckets: HashMap<[u8; 3], (u64, [u64; 3])> = HashMap::new();
    let mut counted = 0u64;
    for px in rgba.pixels() {
        if px[3] < MIN_ALPHA {
            continue;
        }
        counted += 1;
        let key = [px[0] >> 4, px[1] >> 4, px[2] >> 4];
        let entry = buckets.entry(key).or_insert((0, [0; 3]));
        entry.0 += 1;
        for c in 0..3 {
            entry.1[c] += px[c] as u64;
        }
    }

    let mut ranked: Vec<(u64, Colour)> = buckets
        .into_iter()
        .map(|(_, (n, sum))| {
            let mean = |c: usize| (sum[c] / n) as u8;
            (n, Colour([mean(0), mean(1), mean(2), 255]))
        })
        .collect();
    // Ties broken by colour so the ranking is deterministic.
    ranked.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.0.cmp(&b.1.0)));
    ranked.truncate(size.max(1));

    let dominant = ranked.first().map(|(_, c)| *c).unwrap_or(Colour::WHITE);
    let colours = ranked
        .into_iter()
        .map(|(n, c)| PaletteEntry {
            colour: c.to_hex(),
            share: n as f64 / counted.max(1) as f64,
        })
        .collect();
    Palette { dominant, colours }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[test]
    fn dominant_is_majority_colour() {
        let img = RgbaImage::from_fn(10, 10, |x, _| {
            if x < 7 {
                Rgba([200, 10, 10, 255])
            } else {
                Rgba([10, 10, 200, 255])
            }
        });
        let palette = extract_palette(&DynamicImage::ImageRgba8(img), 8);
        assert_eq!(palette.dominant, Colour([200, 10, 10, 255]));
        assert_eq!(palette.colours.len(), 2);
        assert_eq!(palette.colours[0].colour, "#c80a0a");
        assert!((palette.colours[0].share - 0.7).abs() < 1e-9);
    }

    #[test]
    fn transparent_pixels_ignored() {
        let img = RgbaImage::from_fn(4, 4, |x, _| {
            if x == 0 {
                Rgba([0, 255, 0, 255])
            } else {
                Rgba([255, 0, 0, 0])
            }
        });
        let palette = extract_palette(&DynamicImage::ImageRgba8(img), 8);
        assert_eq!(palette.dominant, Colour([0, 255, 0, 255]));
        assert_eq!(palette.colours.len(), 1);
    }

    #[test]
    fn fully_transparent_is_white() {
        let img = RgbaImage::from_pixel(4, 4, Rgba([0, 0, 0, 0]));
        let palette = extract_palette(&DynamicImage::ImageRgba8(img), 8);
        assert_eq!(palette.dominant, Colour::WHITE);
        assert!(palette.colours.is_empty());
    }

    #[test]
    fn size_limits_entries() {
        let img = RgbaImage::from_fn(64, 1, |x, _| Rgba([(x * 4) as u8, 0, 0, 255]));
        let palette = extract_palette(&DynamicImage::ImageRgba8(img), 3);
        assert_eq!(palette.colours.len(), 3);
    }
}
