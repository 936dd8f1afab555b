//! CLI output formatting.
//!
//! # Output Format
//!
//! ## Render
//!
//! ```text
//! <img src="/images/cache/photo_3f9a….jpg" alt="" width="300" height="200">
//!
//! photo.jpg → images/cache/photo_3f9a….jpg
//!     1200x800 → 300x200 jpg, 18734 bytes
//!     Cache: miss, queue ran 1 time
//!     Derived: 2 srcset, placeholder
//!     resize: 4.1ms
//! ```
//!
//! ## Cache list
//!
//! ```text
//! images/cache/photo_3f9a….jpg  18734 bytes  fresh  300x200 from photo.jpg
//! images/cache/stray.png  512 bytes  untracked
//!
//! 1 fresh, 0 stale, 1 untracked (2 files, 19246 bytes)
//! ```
//!
//! # Architecture
//!
//! Each command has a `format_*` function (returns `Vec<String>`) for
//! testability and a `print_*` wrapper that writes to stdout. Format
//! functions are pure: no I/O, no side effects.

use crate::action::DirectResponse;
use crate::cache::{CacheStats, CachedArtifact};
use crate::context::{Flag, ProcessingContext};
use crate::markup::Rendered;

/// Return indentation string: 4 spaces per depth level.
fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

fn dims(w: Option<u32>, h: Option<u32>) -> Option<String> {
    Some(format!("{}x{}", w?, h?))
}

// ============================================================================
// Render
// ============================================================================

/// The rendered output itself, one entry per line.
pub fn format_rendered(rendered: Option<&Rendered>) -> Vec<String> {
    match rendered {
        None | Some(Rendered::Empty) => Vec::new(),
        Some(Rendered::Html(s)) | Some(Rendered::Url(s)) | Some(Rendered::Template(s)) => {
            vec![s.clone()]
        }
        Some(Rendered::Variables(vars)) => vars.iter().map(|(k, v)| format!("{k} = {v}")).collect(),
        Some(Rendered::Bytes { content_type, body }) => {
            vec![format!("<{} bytes of {}>", body.len(), content_type)]
        }
    }
}

/// Summary of a render: where the artifact came from, its dimensions, and
/// how the cache behaved.
pub fn format_render_summary(ctx: &ProcessingContext) -> Vec<String> {
    let meta = &ctx.metadata;
    let mut lines = Vec::new();
    let source = meta.source_path.as_deref().unwrap_or("(no source)");
    match &meta.cache_path {
        Some(path) => lines.push(format!("{source} → {path}")),
        None => lines.push(source.to_string()),
    }

    let mut size_line = String::new();
    if let Some(original) = dims(meta.original_width, meta.original_height) {
        size_line.push_str(&original);
    }
    if let Some(final_dims) = dims(meta.final_width, meta.final_height) {
        if !size_line.is_empty() {
            size_line.push_str(" → ");
        }
        size_line.push_str(&final_dims);
    }
    if let Some(format) = meta.output_format {
        size_line.push_str(&format!(" {}", format.extension()));
    }
    if let Some(bytes) = meta.final_filesize {
        size_line.push_str(&format!(", {bytes} bytes"));
    }
    if !size_line.is_empty() {
        lines.push(format!("{}{}", indent(1), size_line.trim_start()));
    }

    let cache = if ctx.has_flag(Flag::EarlyCacheHit) {
        "early hit"
    } else if ctx.has_flag(Flag::UsingCacheCopy) {
        "hit"
    } else if ctx.has_flag(Flag::PaletteMode) {
        "not cached"
    } else {
        "miss"
    };
    let runs = match meta.queue_runs {
        1 => "1 time".to_string(),
        n => format!("{n} times"),
    };
    lines.push(format!("{}Cache: {cache}, queue ran {runs}", indent(1)));

    let mut derived = Vec::new();
    if !meta.srcset.is_empty() {
        derived.push(format!("{} srcset", meta.srcset.len()));
    }
    if meta.placeholder.is_some() {
        derived.push("placeholder".to_string());
    }
    if meta.jpeg_fallback.is_some() {
        derived.push("jpeg fallback".to_string());
    }
    if !derived.is_empty() {
        lines.push(format!("{}Derived: {}", indent(1), derived.join(", ")));
    }
    if ctx.has_flag(Flag::UsedFallback) {
        lines.push(format!("{}Used fallback source", indent(1)));
    }

    for timing in &meta.timings {
        lines.push(format!(
            "{}{}: {:.1}ms",
            indent(1),
            timing.name,
            timing.elapsed.as_secs_f64() * 1000.0
        ));
    }
    for error in ctx.errors() {
        let level = if error.critical { "error" } else { "warning" };
        lines.push(format!("{}{level}: {}", indent(1), error.message));
    }
    lines
}

pub fn print_render_output(ctx: &ProcessingContext) {
    for line in format_rendered(ctx.output.as_ref()) {
        println!("{}", line);
    }
    println!();
    for line in format_render_summary(ctx) {
        println!("{}", line);
    }
}

// ============================================================================
// Direct fetch
// ============================================================================

pub fn format_fetch_output(response: &DirectResponse, written_to: Option<&str>) -> Vec<String> {
    if response.status != 200 {
        return vec![format!("HTTP {}", response.status)];
    }
    let mut line = format!(
        "HTTP 200 {}, {} bytes",
        response.content_type,
        response.body.len()
    );
    if let Some(path) = written_to {
        line.push_str(&format!(" → {path}"));
    }
    vec![line]
}

pub fn print_fetch_output(response: &DirectResponse, written_to: Option<&str>) {
    for line in format_fetch_output(response, written_to) {
        println!("{}", line);
    }
}

// ============================================================================
// Cache maintenance
// ============================================================================

/// One line per artifact followed by the directory summary.
pub fn format_cache_list(artifacts: &[CachedArtifact]) -> Vec<String> {
    let mut lines = Vec::new();
    for a in artifacts {
        let mut line = format!("{}  {} bytes  ", a.path, a.size);
        match &a.row {
            None => line.push_str("untracked"),
            Some(row) => {
                line.push_str(if a.fresh { "fresh" } else { "stale" });
                line.push_str(&format!("  {}x{}", row.width, row.height));
                if !row.source_path.is_empty() {
                    line.push_str(&format!(" from {}", row.source_path));
                }
            }
        }
        lines.push(line);
    }
    if !lines.is_empty() {
        lines.push(String::new());
    }
    lines.push(CacheStats::from_artifacts(artifacts).to_string());
    lines
}

pub fn print_cache_list(artifacts: &[CachedArtifact]) {
    for line in format_cache_list(artifacts) {
        println!("{}", line);
    }
}

pub fn format_cache_cleared(cache_dir: &str, removed: usize) -> String {
    match removed {
        0 => format!("{cache_dir}: nothing to clear"),
        1 => format!("{cache_dir}: removed 1 file"),
        n => format!("{cache_dir}: removed {n} files"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::log::CacheRow;
    use crate::imaging::{OpTiming, OutputFormat};
    use crate::params::TagParams;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn row(width: u32, height: u32) -> CacheRow {
        CacheRow {
            source_path: "photo.jpg".into(),
            width,
            height,
            filesize: 100,
            mime_type: "image/jpeg".into(),
            created: 0,
            freshness_window: 0,
            processing_time_ms: 0.0,
            template_variables: BTreeMap::new(),
        }
    }

    // =========================================================================
    // Render
    // =========================================================================

    #[test]
    fn rendered_variants() {
        assert!(format_rendered(None).is_empty());
        assert!(format_rendered(Some(&Rendered::Empty)).is_empty());
        assert_eq!(format_rendered(Some(&Rendered::Url("/a.jpg".into()))), vec!["/a.jpg"]);

        let mut vars = BTreeMap::new();
        vars.insert("width".to_string(), "10".to_string());
        vars.insert("height".to_string(), "5".to_string());
        assert_eq!(
            format_rendered(Some(&Rendered::Variables(vars))),
            vec!["height = 5", "width = 10"]
        );

        let bytes = Rendered::Bytes {
            content_type: "image/png".into(),
            body: vec![0; 12],
        };
        assert_eq!(format_rendered(Some(&bytes)), vec!["<12 bytes of image/png>"]);
    }

    #[test]
    fn render_summary_for_a_miss() {
        let mut ctx = ProcessingContext::new(TagParams::new());
        let meta = &mut ctx.metadata;
        meta.source_path = Some("photo.jpg".into());
        meta.cache_path = Some("images/cache/photo_abc.jpg".into());
        meta.original_width = Some(1200);
        meta.original_height = Some(800);
        meta.final_width = Some(300);
        meta.final_height = Some(200);
        meta.final_filesize = Some(1234);
        meta.output_format = Some(OutputFormat::Jpeg);
        meta.queue_runs = 1;
        meta.timings.push(OpTiming {
            name: "resize".into(),
            elapsed: Duration::from_micros(4100),
        });
        ctx.add_error("lqip failed", false);

        assert_eq!(
            format_render_summary(&ctx),
            vec![
                "photo.jpg → images/cache/photo_abc.jpg",
                "    1200x800 → 300x200 jpg, 1234 bytes",
                "    Cache: miss, queue ran 1 time",
                "    resize: 4.1ms",
                "    warning: lqip failed",
            ]
        );
    }

    #[test]
    fn render_summary_for_an_early_hit() {
        let mut ctx = ProcessingContext::new(TagParams::new());
        ctx.set_flag(Flag::EarlyCacheHit);
        ctx.set_flag(Flag::UsingCacheCopy);
        ctx.metadata.source_path = Some("photo.jpg".into());
        let lines = format_render_summary(&ctx);
        assert_eq!(lines[0], "photo.jpg");
        assert_eq!(lines[1], "    Cache: early hit, queue ran 0 times");
    }

    // =========================================================================
    // Fetch and cache
    // =========================================================================

    #[test]
    fn fetch_lines() {
        let ok = DirectResponse {
            status: 200,
            content_type: "image/jpeg".into(),
            body: vec![1, 2, 3],
        };
        assert_eq!(
            format_fetch_output(&ok, Some("out.jpg")),
            vec!["HTTP 200 image/jpeg, 3 bytes → out.jpg"]
        );
        let missing = DirectResponse {
            status: 404,
            content_type: String::new(),
            body: Vec::new(),
        };
        assert_eq!(format_fetch_output(&missing, None), vec!["HTTP 404"]);
    }

    #[test]
    fn cache_list_lines() {
        let artifacts = vec![
            CachedArtifact {
                path: "c/a.jpg".into(),
                size: 100,
                fresh: true,
                row: Some(row(30, 20)),
            },
            CachedArtifact {
                path: "c/stray.png".into(),
                size: 50,
                fresh: false,
                row: None,
            },
        ];
        assert_eq!(
            format_cache_list(&artifacts),
            vec![
                "c/a.jpg  100 bytes  fresh  30x20 from photo.jpg",
                "c/stray.png  50 bytes  untracked",
                "",
                "1 fresh, 0 stale, 1 untracked (2 files, 150 bytes)",
            ]
        );
        assert_eq!(format_cache_list(&[]), vec!["cache empty"]);
    }

    #[test]
    fn cleared_message() {
        assert_eq!(format_cache_cleared("c", 0), "c: nothing to clear");
        assert_eq!(format_cache_cleared("c", 1), "c: removed 1 file");
        assert_eq!(format_cache_cleared("c", 3), "c: removed 3 files");
    }
}
