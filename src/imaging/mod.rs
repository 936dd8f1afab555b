//! Image processing: pure Rust on top of the `image` crate.
//!
//! | Operation | Crate / function |
//! |---|---|
//! | **Sniff** | `image::guess_format`, `GifDecoder` frame count, `ftyp` brand |
//! | **Dimensions** | `ImageReader::into_dimensions` |
//! | **Resize / crop** | Lanczos3 `resize_exact` + `crop_imm` |
//! | **Filters** | `image::imageops` via the [`FilterRegistry`] |
//! | **Encode** | JPEG / PNG / WebP / GIF / BMP encoders |
//! | **HEIC** | external converter commands |
//!
//! The module is split into:
//! - **Calculations**: Pure functions for dimension math (unit testable)
//! - **Parameters**: Data structures describing image operations
//! - **Codec**: decode, encode, and source sniffing
//! - **Transforms / Filters / Queue**: the operations a request applies, and
//!   the ordered batch that runs them
//! - **Faces / Palette / HEIC**: collaborators used by specific requests

mod calculations;
pub mod codec;
pub mod faces;
pub mod filters;
pub mod heic;
pub mod palette;
mod params;
pub mod queue;
pub mod transforms;

pub use calculations::{
    DimensionRequest, ResponsiveSize, calculate_auto_adjust, calculate_crop_dimensions,
    calculate_crop_origin, calculate_dimensions, calculate_fill_dimensions,
    calculate_responsive_sizes,
};
pub use codec::{ImagingError, SourceKind};
pub use faces::{DetectedFaces, FaceDetector, FaceRegion, NoFaceDetector};
pub use filters::{FilterCall, FilterError, FilterRegistry};
pub use heic::{CommandHeicConverter, HeicConverter};
pub use palette::{Palette, extract_palette};
pub use params::{
    Anchor, Colour, Compression, CropSpec, EncodeOptions, Fit, Length, OutputFormat, Quality,
    Sharpening, parse_aspect_ratio,
};
pub use queue::{OpTiming, Priority, TransformQueue};
pub use transforms::{TextRenderer, TextSpec, Transform};
