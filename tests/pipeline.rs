//! End-to-end runs of the standard pipeline against local storage in a temp
//! directory.

use image::codecs::gif::GifEncoder;
use image::{Delay, Frame, ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};
use pictor::action::{encode_packet, serve_packet};
use pictor::cache::generate_cache_key;
use pictor::config::Settings;
use pictor::context::{Flag, ProcessingContext};
use pictor::markup::Rendered;
use pictor::params::TagParams;
use pictor::pipeline::{Pipeline, PipelineError};
use pictor::services::ServiceBundle;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

struct Site {
    tmp: TempDir,
    services: Arc<ServiceBundle>,
}

impl Site {
    fn new() -> Self {
        Self::with(|_| {})
    }

    fn with(configure: impl FnOnce(&mut Settings)) -> Self {
        let tmp = TempDir::new().unwrap();
        let mut settings = Settings::default();
        settings.base_path = tmp.path().to_path_buf();
        configure(&mut settings);
        let services = Arc::new(ServiceBundle::from_settings(settings));
        Self { tmp, services }
    }

    fn write(&self, name: &str, bytes: &[u8]) {
        std::fs::write(self.tmp.path().join(name), bytes).unwrap();
    }

    fn public(&self) -> PathBuf {
        self.tmp.path().join("public")
    }

    fn artifact(&self, ctx: &ProcessingContext) -> Vec<u8> {
        let path = ctx.metadata.cache_path.as_deref().unwrap();
        std::fs::read(self.public().join(path)).unwrap()
    }

    fn run(&self, pairs: &[(&str, &str)]) -> Result<ProcessingContext, PipelineError> {
        let mut ctx = ProcessingContext::new(TagParams::from_pairs(pairs.iter().copied()));
        Pipeline::standard(self.services.clone()).run(&mut ctx)?;
        Ok(ctx)
    }
}

fn jpeg(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x * 255 / width) as u8, (y * 255 / height) as u8, 128])
    });
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Jpeg)
        .unwrap();
    buf
}

fn animated_gif(width: u32, height: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let mut encoder = GifEncoder::new(&mut buf);
        let frames = [[255, 0, 0, 255], [0, 0, 255, 255]].map(|px| {
            Frame::from_parts(
                RgbaImage::from_pixel(width, height, Rgba(px)),
                0,
                0,
                Delay::from_numer_denom_ms(80, 1),
            )
        });
        encoder.encode_frames(frames).unwrap();
    }
    buf
}

fn decoded_dimensions(bytes: &[u8]) -> (u32, u32) {
    let img = image::load_from_memory(bytes).unwrap();
    (img.width(), img.height())
}

fn files_under(root: &Path) -> usize {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .count()
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn width_only_then_served_from_cache() {
    let site = Site::new();
    site.write("photo.jpg", &jpeg(1200, 800));

    let first = site.run(&[("src", "photo.jpg"), ("width", "300")]).unwrap();
    assert_eq!(first.metadata.final_width, Some(300));
    assert_eq!(first.metadata.final_height, Some(200));
    assert_eq!(first.metadata.queue_runs, 1);
    assert!(!first.has_flag(Flag::UsingCacheCopy));
    let path = first.metadata.cache_path.clone().unwrap();
    assert!(path.starts_with("images/cache/photo_"));
    assert!(path.ends_with(".jpg"));
    let bytes = site.artifact(&first);
    assert_eq!(decoded_dimensions(&bytes), (300, 200));

    let second = site.run(&[("src", "photo.jpg"), ("width", "300")]).unwrap();
    assert!(second.has_flag(Flag::EarlyCacheHit));
    assert_eq!(second.metadata.queue_runs, 0);
    assert_eq!(second.cache_key(), first.cache_key());
    assert_eq!(second.metadata.cache_path, Some(path));
    assert_eq!(second.metadata.final_width, Some(300));
    assert_eq!(second.metadata.final_height, Some(200));
    assert_eq!(second.output, first.output);
}

#[test]
fn regenerated_artifact_is_byte_identical() {
    let site = Site::new();
    site.write("photo.jpg", &jpeg(400, 300));
    let first = site.run(&[("src", "photo.jpg"), ("width", "100")]).unwrap();
    let original = site.artifact(&first);

    let forced = site
        .run(&[("src", "photo.jpg"), ("width", "100"), ("overwrite", "yes")])
        .unwrap();
    assert_eq!(forced.metadata.queue_runs, 1);
    assert_eq!(site.artifact(&forced), original);
}

#[test]
fn contain_keeps_the_aspect_ratio() {
    let site = Site::new();
    site.write("photo.jpg", &jpeg(1200, 800));
    let ctx = site
        .run(&[("src", "photo.jpg"), ("width", "300"), ("height", "300"), ("fit", "contain")])
        .unwrap();
    assert_eq!(ctx.metadata.final_width, Some(300));
    assert_eq!(ctx.metadata.final_height, Some(200));
    assert_eq!(decoded_dimensions(&site.artifact(&ctx)), (300, 200));
}

#[test]
fn upscaling_is_clamped_to_the_original() {
    let site = Site::new();
    site.write("photo.jpg", &jpeg(1200, 800));
    let ctx = site.run(&[("src", "photo.jpg"), ("width", "2000")]).unwrap();
    assert_eq!(ctx.metadata.final_width, Some(1200));
    assert_eq!(ctx.metadata.final_height, Some(800));
}

#[test]
fn distort_hits_the_exact_box() {
    let site = Site::new();
    site.write("photo.jpg", &jpeg(1200, 800));
    let ctx = site
        .run(&[("src", "photo.jpg"), ("width", "300"), ("height", "300"), ("fit", "distort")])
        .unwrap();
    assert_eq!(decoded_dimensions(&site.artifact(&ctx)), (300, 300));
}

#[test]
fn centred_crop_fills_the_box() {
    let site = Site::new();
    site.write("photo.jpg", &jpeg(1200, 800));
    let ctx = site
        .run(&[
            ("src", "photo.jpg"),
            ("crop", "y|center,center|0,0|y|3"),
            ("width", "200"),
            ("height", "200"),
        ])
        .unwrap();
    assert!(ctx.has_flag(Flag::ItsACrop));
    assert_eq!(decoded_dimensions(&site.artifact(&ctx)), (200, 200));
}

// =============================================================================
// Cache keys
// =============================================================================

#[test]
fn markup_parameters_share_an_artifact() {
    let site = Site::new();
    site.write("photo.jpg", &jpeg(200, 100));
    let plain = site.run(&[("src", "photo.jpg"), ("width", "50")]).unwrap();
    let styled = site
        .run(&[("src", "photo.jpg"), ("width", "50"), ("alt", "Dusk"), ("class", "hero")])
        .unwrap();
    assert_eq!(styled.metadata.cache_path, plain.metadata.cache_path);
    assert!(styled.has_flag(Flag::EarlyCacheHit));

    let wider = site.run(&[("src", "photo.jpg"), ("width", "60")]).unwrap();
    assert_ne!(wider.cache_key(), plain.cache_key());
}

#[test]
fn keys_are_deterministic() {
    let params = TagParams::from_pairs([("width", "300"), ("debug", "yes")]);
    let same = TagParams::from_pairs([("width", "300")]);
    assert_eq!(generate_cache_key("photo", &params), generate_cache_key("photo", &same));
    assert_ne!(generate_cache_key("photo", &same), generate_cache_key("other", &same));
}

// =============================================================================
// Sources
// =============================================================================

#[test]
fn animated_gif_is_stored_verbatim() {
    let site = Site::new();
    let source = animated_gif(8, 6);
    site.write("spin.gif", &source);
    let ctx = site
        .run(&[("src", "spin.gif"), ("width", "4")])
        .unwrap();
    assert!(ctx.has_flag(Flag::AnimatedGif));
    assert!(ctx.metadata.cache_path.as_deref().unwrap().ends_with(".gif"));
    assert_eq!(site.artifact(&ctx), source);
    assert_eq!(ctx.metadata.final_width, Some(4));
    assert_eq!(ctx.metadata.final_height, Some(3));
    assert_eq!(ctx.metadata.queue_runs, 0);
}

#[test]
fn animated_gif_skips_variants_even_when_cached() {
    let site = Site::new();
    site.write("spin.gif", &animated_gif(40, 20));
    let pairs = [("src", "spin.gif"), ("srcset", "20"), ("lazy", "lqip")];
    let first = site.run(&pairs).unwrap();
    assert!(first.metadata.srcset.is_empty());
    assert!(first.metadata.placeholder.is_none());

    let second = site.run(&pairs).unwrap();
    assert!(second.has_flag(Flag::EarlyCacheHit));
    assert!(second.has_flag(Flag::AnimatedGif));
    assert!(second.metadata.srcset.is_empty());
}

#[test]
fn static_gif_gets_responsive_variants() {
    let site = Site::new();
    let mut still = Vec::new();
    RgbaImage::from_pixel(40, 20, Rgba([0, 128, 0, 255]))
        .write_to(&mut Cursor::new(&mut still), ImageFormat::Gif)
        .unwrap();
    site.write("still.gif", &still);

    let pairs = [("src", "still.gif"), ("srcset", "20")];
    let first = site.run(&pairs).unwrap();
    assert!(!first.has_flag(Flag::AnimatedGif));
    let widths: Vec<u32> = first.metadata.srcset.iter().map(|v| v.width).collect();
    assert_eq!(widths, [20]);
    let variant = &first.metadata.srcset[0];
    assert!(variant.path.ends_with("_20w.gif"));
    let bytes = std::fs::read(site.public().join(&variant.path)).unwrap();
    assert_eq!(decoded_dimensions(&bytes), (20, 10));

    let second = site.run(&pairs).unwrap();
    assert!(second.has_flag(Flag::EarlyCacheHit));
    assert_eq!(second.metadata.srcset, first.metadata.srcset);
}

#[test]
fn srcset_reaches_past_the_primary_width() {
    let site = Site::new();
    site.write("photo.jpg", &jpeg(1200, 800));
    let pairs = [("src", "photo.jpg"), ("width", "300"), ("srcset", "150|600|1200|2400")];

    let first = site.run(&pairs).unwrap();
    assert_eq!(first.metadata.final_width, Some(300));
    let widths: Vec<u32> = first.metadata.srcset.iter().map(|v| v.width).collect();
    assert_eq!(widths, [150, 600, 1200]);
    for variant in &first.metadata.srcset {
        let bytes = std::fs::read(site.public().join(&variant.path)).unwrap();
        assert_eq!(decoded_dimensions(&bytes), (variant.width, variant.height));
    }
    assert_eq!(first.metadata.srcset[1].height, 400);

    let second = site.run(&pairs).unwrap();
    assert!(second.has_flag(Flag::EarlyCacheHit));
    assert_eq!(second.metadata.srcset, first.metadata.srcset);
}

#[test]
fn srcset_past_the_source_needs_allow_scale_larger() {
    let site = Site::new();
    site.write("wide.jpg", &jpeg(400, 200));
    let widths = |pairs: &[(&str, &str)]| -> Vec<u32> {
        let ctx = site.run(pairs).unwrap();
        ctx.metadata.srcset.iter().map(|v| v.width).collect()
    };
    assert_eq!(widths(&[("src", "wide.jpg"), ("srcset", "200|800")]), [200]);
    assert_eq!(
        widths(&[("src", "wide.jpg"), ("srcset", "200|800"), ("allow_scale_larger", "yes")]),
        [200, 800]
    );
}

#[test]
fn exhausted_fallbacks_are_fatal() {
    let site = Site::new();
    let err = site
        .run(&[("src", "missing.jpg"), ("fallback_src", "")])
        .unwrap_err();
    assert!(matches!(err, PipelineError::NoValidSource(_)));
    assert_eq!(files_under(&site.public()), 0);
}

#[test]
fn configured_fallback_source_is_used() {
    let site = Site::with(|s| s.fallback.src = "placeholder.jpg".into());
    site.write("placeholder.jpg", &jpeg(100, 100));
    let ctx = site.run(&[("src", "missing.jpg"), ("width", "20")]).unwrap();
    assert!(ctx.has_flag(Flag::UsedFallback));
    assert_eq!(ctx.metadata.source_path.as_deref(), Some("placeholder.jpg"));
    assert_eq!(decoded_dimensions(&site.artifact(&ctx)), (20, 20));
}

// =============================================================================
// Cache control
// =============================================================================

#[test]
fn cache_zero_regenerates_but_still_writes() {
    let site = Site::new();
    site.write("photo.jpg", &jpeg(200, 100));
    site.run(&[("src", "photo.jpg"), ("width", "40")]).unwrap();

    let ctx = site
        .run(&[("src", "photo.jpg"), ("width", "40"), ("cache", "0")])
        .unwrap();
    assert!(ctx.has_flag(Flag::CacheDisabled));
    assert!(!ctx.has_flag(Flag::UsingCacheCopy));
    assert_eq!(ctx.metadata.queue_runs, 1);
    assert_eq!(decoded_dimensions(&site.artifact(&ctx)), (40, 20));
}

#[test]
fn concurrent_runs_agree() {
    let site = Site::new();
    site.write("photo.jpg", &jpeg(300, 200));
    let paths: Vec<String> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                scope.spawn(|| {
                    let ctx = site.run(&[("src", "photo.jpg"), ("width", "150")]).unwrap();
                    ctx.metadata.cache_path.unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert!(paths.windows(2).all(|w| w[0] == w[1]));
    let bytes = std::fs::read(site.public().join(&paths[0])).unwrap();
    assert_eq!(decoded_dimensions(&bytes), (150, 100));
}

// =============================================================================
// Direct fetch
// =============================================================================

fn link_parts(url: &str) -> (String, String) {
    let query = url.split_once('?').unwrap().1;
    let (packet, sig) = query.split_once("&sig=").unwrap();
    (packet.trim_start_matches("packet=").to_string(), sig.to_string())
}

#[test]
fn action_link_serves_the_image() {
    let site = Site::with(|s| s.action.secret = "s3cret".into());
    site.write("photo.jpg", &jpeg(120, 80));
    let ctx = site
        .run(&[("src", "photo.jpg"), ("width", "60"), ("action_link", "yes")])
        .unwrap();
    let Some(Rendered::Url(url)) = &ctx.output else {
        panic!("expected an action link");
    };
    assert!(url.starts_with("/pictor?packet="));

    let (packet, sig) = link_parts(url);
    let response = serve_packet(&site.services, &packet, &sig);
    assert_eq!(response.status, 200);
    assert_eq!(response.content_type, "image/jpeg");
    assert_eq!(decoded_dimensions(&response.body), (60, 40));
}

#[test]
fn direct_fetch_failures_have_no_body() {
    let site = Site::with(|s| s.action.secret = "s3cret".into());
    let params = TagParams::from_pairs([("src", "missing.jpg")]);
    let (packet, sig) = encode_packet(&params, "s3cret").unwrap();

    let missing = serve_packet(&site.services, &packet, &sig);
    assert_eq!(missing.status, 404);
    assert!(missing.body.is_empty());

    let (forged, _) = encode_packet(&TagParams::from_pairs([("src", "other.jpg")]), "s3cret").unwrap();
    let tampered = serve_packet(&site.services, &forged, &sig);
    assert_eq!(tampered.status, 400);
    assert!(tampered.body.is_empty());

    let bad_width = TagParams::from_pairs([("src", "missing.jpg"), ("width", "wide")]);
    let (packet, sig) = encode_packet(&bad_width, "s3cret").unwrap();
    assert_eq!(serve_packet(&site.services, &packet, &sig).status, 400);
}
