//! Pure calculation functions for image dimensions.
//!
//! All functions here are pure and testable without any I/O or images.
//! Ratios are `width / height`.

use super::params::{Anchor, CropSpec, Fit, Length};

/// Ratios closer than this are treated as equal.
const RATIO_EPSILON: f64 = 0.01;

/// Everything the dimension algorithm reads from the tag parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DimensionRequest {
    pub width: Option<Length>,
    pub height: Option<Length>,
    pub fit: Fit,
    /// Explicit `aspect_ratio` override.
    pub aspect_ratio: Option<f64>,
    pub min: Option<Length>,
    pub max: Option<Length>,
    pub min_width: Option<Length>,
    pub max_width: Option<Length>,
    pub min_height: Option<Length>,
    pub max_height: Option<Length>,
    pub allow_scale_larger: bool,
}

/// Calculate output dimensions for a resize.
///
/// 1. Neither width nor height: the original dimensions.
/// 2. One of them: the other follows from the effective ratio (the
///    `aspect_ratio` override, else the original's).
/// 3. Both, with a ratio differing from the original's: `contain` shrinks
///    the binding axis to fit inside the box, `cover` grows it to fill the box,
///    `distort` keeps both numbers.
/// 4. `min`/`max` constrain the currently smaller/larger side, then
///    `min_width`/`max_width`/`min_height`/`max_height` override them.
/// 5. Without `allow_scale_larger`, neither axis may exceed the original.
///
/// Percentages resolve against the original's corresponding axis.
///
/// # Examples
/// ```
/// # use pictor::imaging::{DimensionRequest, Length, Fit, calculate_dimensions};
/// let req = DimensionRequest {
///     width: Some(Length::Px(300.0)),
///     height: Some(Length::Px(300.0)),
///     fit: Fit::Contain,
///     ..Default::default()
/// };
/// assert_eq!(calculate_dimensions((1200, 800), &req), (300, 200));
/// ```
pub fn calculate_dimensions(original: (u32, u32), req: &DimensionRequest) -> (u32, u32) {
    let (w, h) = requested_box(original, req);
    let (w, h) = match (req.width.is_some(), req.height.is_some()) {
        (true, true) => reconcile_fit((w, h), original_ratio(original), req.fit),
        _ => (w, h),
    };
    let proportional = req.fit != Fit::Distort;
    let (w, h) = apply_constraints(original, (w, h), req, proportional);
    let (w, h) = if req.allow_scale_larger {
        (w, h)
    } else {
        guard_scale(original, (w, h), proportional)
    };
    finish((w, h))
}

/// Calculate the literal crop box.
///
/// Unlike [`calculate_dimensions`] the requested box is never reshaped by the
/// fit mode: the crop step samples exactly this box out of a cover-scaled
/// working image. When the box exceeds the original and scaling up is not
/// allowed, it shrinks proportionally so its shape is kept.
///
/// With neither width nor height but an `aspect_ratio`, the box is the
/// largest one of that ratio that fits inside the original.
pub fn calculate_crop_dimensions(original: (u32, u32), req: &DimensionRequest) -> (u32, u32) {
    let (w, h) = if req.width.is_none() && req.height.is_none() {
        match req.aspect_ratio {
            Some(ratio) => largest_box_with_ratio(original, ratio),
            None => (original.0 as f64, original.1 as f64),
        }
    } else {
        requested_box(original, req)
    };
    let (w, h) = apply_constraints(original, (w, h), req, false);
    let (w, h) = if req.allow_scale_larger {
        (w, h)
    } else {
        guard_scale(original, (w, h), true)
    };
    finish((w, h))
}

/// Calculate dimensions needed to fill a target area (resize before crop).
///
/// Returns dimensions that completely cover the target area while maintaining
/// the source aspect ratio. One dimension will match exactly, the other may exceed.
///
/// # Arguments
/// * `source` - Original image dimensions (width, height)
/// * `target` - Target area dimensions (width, height)
///
/// # Returns
/// * `(width, height)` - Fill dimensions (at least one matches target)
pub fn calculate_fill_dimensions(source: (u32, u32), target: (u32, u32)) -> (u32, u32) {
    let (src_w, src_h) = source;
    let (tgt_w, tgt_h) = target;

    let src_aspect = src_w as f64 / src_h as f64;
    let tgt_aspect = tgt_w as f64 / tgt_h as f64;

    if src_aspect > tgt_aspect {
        // Source is wider: height will match, width will exceed
        let h = tgt_h;
        let w = ((h as f64 * src_aspect).round() as u32).max(tgt_w);
        (w, h)
    } else {
        // Source is taller: width will match, height will exceed
        let w = tgt_w;
        let h = ((w as f64 / src_aspect).round() as u32).max(tgt_h);
        (w, h)
    }
}

/// Top-left corner of a `crop` box inside an image of `image` size.
///
/// `faces` is the centre of the detected face regions (already scaled to
/// `image`); face anchors without faces fall back to centre. Offsets are
/// added after anchoring and the result is clamped inside the image.
pub fn calculate_crop_origin(
    image: (u32, u32),
    crop: (u32, u32),
    spec: &CropSpec,
    faces: Option<(f64, f64)>,
) -> (u32, u32) {
    let axis = |anchor: Anchor, full: u32, size: u32, face: Option<f64>, offset: i32| -> u32 {
        let slack = full.saturating_sub(size) as i64;
        let base = match anchor {
            Anchor::Start => 0,
            Anchor::End => slack,
            Anchor::Center => slack / 2,
            Anchor::Face => match face {
                Some(c) => (c - size as f64 / 2.0).round() as i64,
                None => slack / 2,
            },
        };
        (base + offset as i64).clamp(0, slack) as u32
    };
    (
        axis(spec.horizontal, image.0, crop.0, faces.map(|f| f.0), spec.offset.0),
        axis(spec.vertical, image.1, crop.1, faces.map(|f| f.1), spec.offset.1),
    )
}

/// Dimensions after the auto-adjust bounds, or `None` when within bounds.
///
/// Dimension limits take priority: when the image is too large on either
/// axis it is fitted inside `max_dims` and the file-size limit is not
/// considered. Otherwise an over-size file is scaled by `sqrt(limit / size)`,
/// since encoded size grows roughly with pixel count. A `0` limit disables
/// that check.
pub fn calculate_auto_adjust(
    dims: (u32, u32),
    file_size: u64,
    max_dims: (u32, u32),
    max_file_size: u64,
) -> Option<(u32, u32)> {
    let (w, h) = dims;
    let (max_w, max_h) = max_dims;
    let too_wide = max_w > 0 && w > max_w;
    let too_tall = max_h > 0 && h > max_h;
    if too_wide || too_tall {
        let fx = if max_w > 0 { max_w as f64 / w as f64 } else { 1.0 };
        let fy = if max_h > 0 { max_h as f64 / h as f64 } else { 1.0 };
        let f = fx.min(fy);
        return Some(finish((w as f64 * f, h as f64 * f)));
    }
    if max_file_size > 0 && file_size > max_file_size {
        let f = (max_file_size as f64 / file_size as f64).sqrt();
        return Some(finish((w as f64 * f, h as f64 * f)));
    }
    None
}

/// Represents a single responsive size to generate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponsiveSize {
    /// Requested breakpoint width.
    pub target: u32,
    /// Calculated output width.
    pub width: u32,
    /// Calculated output height.
    pub height: u32,
}

/// Calculate which `srcset` widths to generate for an image of `base` size.
///
/// Heights follow the base's shape. Widths above `limit`, the width of the
/// source the base was made from, are skipped unless `allow_larger` is set.
/// Duplicates and zero widths are dropped; order follows the request.
pub fn calculate_responsive_sizes(
    base: (u32, u32),
    widths: &[u32],
    limit: u32,
    allow_larger: bool,
) -> Vec<ResponsiveSize> {
    let (base_w, base_h) = base;
    let mut seen = Vec::new();
    widths
        .iter()
        .copied()
        .filter(|&w| w > 0 && (allow_larger || w <= limit))
        .filter(|w| {
            let fresh = !seen.contains(w);
            seen.push(*w);
            fresh
        })
        .map(|target| {
            let ratio = target as f64 / base_w.max(1) as f64;
            ResponsiveSize {
                target,
                width: target,
                height: ((base_h as f64 * ratio).round() as u32).max(1),
            }
        })
        .collect()
}

// =============================================================================
// Helpers
// =============================================================================

fn original_ratio(original: (u32, u32)) -> f64 {
    original.0 as f64 / original.1.max(1) as f64
}

fn effective_ratio(original: (u32, u32), req: &DimensionRequest) -> f64 {
    req.aspect_ratio.unwrap_or_else(|| original_ratio(original))
}

/// The box before fit reconciliation, missing axes derived from the ratio.
fn requested_box(original: (u32, u32), req: &DimensionRequest) -> (f64, f64) {
    let ratio = effective_ratio(original, req);
    let w = req.width.map(|l| l.resolve(original.0));
    let h = req.height.map(|l| l.resolve(original.1));
    match (w, h) {
        (Some(w), Some(h)) => (w, h),
        (Some(w), None) => (w, w / ratio),
        (None, Some(h)) => (h * ratio, h),
        (None, None) => (original.0 as f64, original.1 as f64),
    }
}

fn reconcile_fit((w, h): (f64, f64), ratio: f64, fit: Fit) -> (f64, f64) {
    if h <= 0.0 || ((w / h) - ratio).abs() <= RATIO_EPSILON {
        return (w, h);
    }
    let box_is_wider = w / h > ratio;
    match (fit, box_is_wider) {
        // Height binds.
        (Fit::Contain, true) | (Fit::Cover, false) => (h * ratio, h),
        // Width binds.
        (Fit::Contain, false) | (Fit::Cover, true) => (w, w / ratio),
        (Fit::Distort, _) => (w, h),
    }
}

fn largest_box_with_ratio(original: (u32, u32), ratio: f64) -> (f64, f64) {
    let (ow, oh) = (original.0 as f64, original.1 as f64);
    if ow / oh > ratio {
        (oh * ratio, oh)
    } else {
        (ow, ow / ratio)
    }
}

/// Apply general then axis-specific min/max.
///
/// With `proportional`, hitting a limit scales both axes; otherwise only the
/// constrained axis changes.
fn apply_constraints(
    original: (u32, u32),
    (mut w, mut h): (f64, f64),
    req: &DimensionRequest,
    proportional: bool,
) -> (f64, f64) {
    let (ow, oh) = original;
    let long_ref = ow.max(oh);
    let short_ref = ow.min(oh);

    if let Some(min) = req.min.map(|l| l.resolve(short_ref)) {
        let short = w.min(h);
        if short > 0.0 && short < min {
            let f = min / short;
            (w, h) = scale_axis(w, h, f, w <= h, proportional);
        }
    }
    if let Some(max) = req.max.map(|l| l.resolve(long_ref)) {
        let long = w.max(h);
        if max > 0.0 && long > max {
            let f = max / long;
            (w, h) = scale_axis(w, h, f, w >= h, proportional);
        }
    }

    if let Some(min_w) = req.min_width.map(|l| l.resolve(ow))
        && w > 0.0
        && w < min_w
    {
        (w, h) = scale_axis(w, h, min_w / w, true, proportional);
    }
    if let Some(max_w) = req.max_width.map(|l| l.resolve(ow))
        && max_w > 0.0
        && w > max_w
    {
        (w, h) = scale_axis(w, h, max_w / w, true, proportional);
    }
    if let Some(min_h) = req.min_height.map(|l| l.resolve(oh))
        && h > 0.0
        && h < min_h
    {
        (w, h) = scale_axis(w, h, min_h / h, false, proportional);
    }
    if let Some(max_h) = req.max_height.map(|l| l.resolve(oh))
        && max_h > 0.0
        && h > max_h
    {
        (w, h) = scale_axis(w, h, max_h / h, false, proportional);
    }
    (w, h)
}

fn scale_axis(w: f64, h: f64, f: f64, width_axis: bool, proportional: bool) -> (f64, f64) {
    match (proportional, width_axis) {
        (true, _) => (w * f, h * f),
        (false, true) => (w * f, h),
        (false, false) => (w, h * f),
    }
}

fn guard_scale(original: (u32, u32), (w, h): (f64, f64), proportional: bool) -> (f64, f64) {
    let (ow, oh) = (original.0 as f64, original.1 as f64);
    if proportional {
        let f = (ow / w).min(oh / h).min(1.0);
        (w * f, h * f)
    } else {
        (w.min(ow), h.min(oh))
    }
}

fn finish((w, h): (f64, f64)) -> (u32, u32) {
    ((w.round() as u32).max(1), (h.round() as u32).max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn px(n: f64) -> Option<Length> {
        Some(Length::Px(n))
    }

    fn req(width: Option<Length>, height: Option<Length>, fit: Fit) -> DimensionRequest {
        DimensionRequest {
            width,
            height,
            fit,
            ..Default::default()
        }
    }

    // =========================================================================
    // calculate_dimensions tests
    // =========================================================================

    #[test]
    fn no_dimensions_keeps_original() {
        assert_eq!(calculate_dimensions((1200, 800), &DimensionRequest::default()), (1200, 800));
    }

    #[test]
    fn width_only_derives_height() {
        assert_eq!(calculate_dimensions((1200, 800), &req(px(300.0), None, Fit::Contain)), (300, 200));
    }

    #[test]
    fn height_only_derives_width() {
        assert_eq!(calculate_dimensions((1200, 800), &req(None, px(200.0), Fit::Contain)), (300, 200));
    }

    #[test]
    fn contain_width_binds() {
        // Box 1:1 is narrower than 3:2, width binds
        assert_eq!(
            calculate_dimensions((1200, 800), &req(px(300.0), px(300.0), Fit::Contain)),
            (300, 200)
        );
    }

    #[test]
    fn contain_height_binds() {
        // Box 3:1 is wider than 3:2, height binds
        assert_eq!(
            calculate_dimensions((1200, 800), &req(px(600.0), px(200.0), Fit::Contain)),
            (300, 200)
        );
    }

    #[test]
    fn cover_fills_box() {
        assert_eq!(
            calculate_dimensions((1200, 800), &req(px(300.0), px(300.0), Fit::Cover)),
            (450, 300)
        );
    }

    #[test]
    fn distort_is_exact() {
        assert_eq!(
            calculate_dimensions((1200, 800), &req(px(300.0), px(300.0), Fit::Distort)),
            (300, 300)
        );
    }

    #[test]
    fn matching_ratio_is_untouched() {
        assert_eq!(
            calculate_dimensions((1200, 800), &req(px(600.0), px(400.0), Fit::Cover)),
            (600, 400)
        );
    }

    #[test]
    fn scale_guard_clamps_width() {
        assert_eq!(calculate_dimensions((1200, 800), &req(px(2000.0), None, Fit::Contain)), (1200, 800));
    }

    #[test]
    fn scale_guard_allows_larger_when_requested() {
        let mut r = req(px(2400.0), None, Fit::Contain);
        r.allow_scale_larger = true;
        assert_eq!(calculate_dimensions((1200, 800), &r), (2400, 1600));
    }

    #[test]
    fn scale_guard_distort_clamps_per_axis() {
        assert_eq!(
            calculate_dimensions((1200, 800), &req(px(2000.0), px(300.0), Fit::Distort)),
            (1200, 300)
        );
    }

    #[test]
    fn percentages_resolve_against_original() {
        let r = req(Some(Length::Percent(50.0)), None, Fit::Contain);
        assert_eq!(calculate_dimensions((1200, 800), &r), (600, 400));
    }

    #[test]
    fn aspect_ratio_override_derives_missing_axis() {
        let mut r = req(px(400.0), None, Fit::Contain);
        r.aspect_ratio = Some(1.0);
        assert_eq!(calculate_dimensions((1200, 800), &r), (400, 400));
    }

    #[test]
    fn both_axes_reconcile_against_the_original_shape() {
        // The override only derives a missing axis; a full box keeps the
        // source's own proportions.
        let mut r = req(px(300.0), px(300.0), Fit::Contain);
        r.aspect_ratio = Some(16.0 / 9.0);
        assert_eq!(calculate_dimensions((1200, 800), &r), (300, 200));

        let mut r = req(px(300.0), px(300.0), Fit::Cover);
        r.aspect_ratio = Some(16.0 / 9.0);
        assert_eq!(calculate_dimensions((1200, 800), &r), (450, 300));
    }

    #[test]
    fn general_max_limits_longer_side() {
        let mut r = DimensionRequest::default();
        r.max = px(600.0);
        assert_eq!(calculate_dimensions((1200, 800), &r), (600, 400));
    }

    #[test]
    fn general_min_raises_shorter_side_within_guard() {
        let mut r = req(px(150.0), None, Fit::Contain);
        r.min = px(200.0);
        assert_eq!(calculate_dimensions((1200, 800), &r), (300, 200));
    }

    #[test]
    fn axis_specific_overrides_general() {
        let mut r = DimensionRequest::default();
        r.max = px(900.0);
        r.max_width = px(300.0);
        assert_eq!(calculate_dimensions((1200, 800), &r), (300, 200));
    }

    #[test]
    fn never_zero() {
        assert_eq!(calculate_dimensions((1200, 10), &req(px(10.0), None, Fit::Contain)), (10, 1));
    }

    #[test]
    fn contain_never_exceeds_box() {
        for (bw, bh) in [(300.0, 300.0), (50.0, 400.0), (700.0, 90.0), (1000.0, 1000.0)] {
            let (w, h) = calculate_dimensions((1200, 800), &req(px(bw), px(bh), Fit::Contain));
            assert!(w as f64 <= bw && h as f64 <= bh, "{w}x{h} exceeds {bw}x{bh}");
        }
    }

    // =========================================================================
    // crop tests
    // =========================================================================

    #[test]
    fn crop_keeps_literal_box() {
        assert_eq!(
            calculate_crop_dimensions((1200, 800), &req(px(200.0), px(200.0), Fit::Contain)),
            (200, 200)
        );
    }

    #[test]
    fn crop_box_larger_than_original_shrinks_proportionally() {
        assert_eq!(
            calculate_crop_dimensions((1200, 800), &req(px(1600.0), px(1600.0), Fit::Contain)),
            (800, 800)
        );
    }

    #[test]
    fn crop_aspect_ratio_only() {
        let mut r = DimensionRequest::default();
        r.aspect_ratio = Some(1.0);
        assert_eq!(calculate_crop_dimensions((1200, 800), &r), (800, 800));
    }

    #[test]
    fn crop_origin_center() {
        let spec = CropSpec::default();
        assert_eq!(calculate_crop_origin((300, 200), (200, 200), &spec, None), (50, 0));
    }

    #[test]
    fn crop_origin_end_with_offset_is_clamped() {
        let spec = CropSpec {
            horizontal: Anchor::End,
            offset: (40, 0),
            ..Default::default()
        };
        assert_eq!(calculate_crop_origin((300, 200), (200, 200), &spec, None), (100, 0));
    }

    #[test]
    fn crop_origin_face_centres_on_faces() {
        let spec = CropSpec {
            horizontal: Anchor::Face,
            ..Default::default()
        };
        assert_eq!(
            calculate_crop_origin((600, 200), (200, 200), &spec, Some((450.0, 100.0))),
            (350, 0)
        );
        // No faces: centre
        assert_eq!(calculate_crop_origin((600, 200), (200, 200), &spec, None), (200, 0));
    }

    // =========================================================================
    // calculate_fill_dimensions tests
    // =========================================================================

    #[test]
    fn fill_wider_source_to_portrait_target() {
        // 800x600 (4:3) → 400x500 target
        // Source is wider, so height matches: 500, width = 500 * (4/3) = 667
        assert_eq!(calculate_fill_dimensions((800, 600), (400, 500)), (667, 500));
    }

    #[test]
    fn fill_taller_source_to_landscape_target() {
        assert_eq!(calculate_fill_dimensions((600, 800), (500, 400)), (500, 667));
    }

    #[test]
    fn fill_square_crop_from_landscape() {
        assert_eq!(calculate_fill_dimensions((1200, 800), (200, 200)), (300, 200));
    }

    // =========================================================================
    // calculate_auto_adjust tests
    // =========================================================================

    #[test]
    fn auto_adjust_within_bounds() {
        assert_eq!(calculate_auto_adjust((800, 600), 1000, (4000, 4000), 0), None);
    }

    #[test]
    fn auto_adjust_dimensions_take_priority() {
        assert_eq!(
            calculate_auto_adjust((8000, 4000), 100, (4000, 4000), 10),
            Some((4000, 2000))
        );
    }

    #[test]
    fn auto_adjust_file_size() {
        // 4x over the limit → half each side
        assert_eq!(calculate_auto_adjust((1000, 800), 400, (4000, 4000), 100), Some((500, 400)));
    }

    // =========================================================================
    // calculate_responsive_sizes tests
    // =========================================================================

    #[test]
    fn responsive_skips_widths_above_the_source() {
        let sizes = calculate_responsive_sizes((1000, 800), &[400, 800, 1400], 1000, false);
        let targets: Vec<u32> = sizes.iter().map(|s| s.target).collect();
        assert_eq!(targets, vec![400, 800]);
        assert_eq!(sizes[0].height, 320);
    }

    #[test]
    fn responsive_allows_larger_when_requested() {
        let sizes = calculate_responsive_sizes((1000, 800), &[1500], 1000, true);
        assert_eq!(sizes, vec![ResponsiveSize { target: 1500, width: 1500, height: 1200 }]);
    }

    #[test]
    fn responsive_may_exceed_a_downscaled_base() {
        // A 300x200 primary made from a 1200px source.
        let sizes = calculate_responsive_sizes((300, 200), &[150, 600, 1200, 1600], 1200, false);
        let dims: Vec<(u32, u32)> = sizes.iter().map(|s| (s.width, s.height)).collect();
        assert_eq!(dims, vec![(150, 100), (600, 400), (1200, 800)]);
    }

    #[test]
    fn responsive_drops_duplicates_and_zero() {
        let sizes = calculate_responsive_sizes((1000, 800), &[0, 400, 400], 1000, false);
        assert_eq!(sizes.len(), 1);
    }
}
