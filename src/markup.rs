//! Output rendering: `<img>` tags, template variables, and paired templates.
//!
//! ## Attribute sources
//!
//! An `<img>` tag is assembled from, in order:
//!
//! 1. `src` (the cached artifact's public URL)
//! 2. explicit `alt`, `title`, `id`, `class`, `style` parameters
//! 3. `[defaults] class`
//! 4. the free-form `attributes="k=\"v\" …"` parameter
//! 5. `srcset`/`sizes` for responsive variants
//! 6. `width`/`height` (unless `add_dimensions=no`)
//! 7. lazy-loading attributes
//!
//! `class`, `style` and `alt` accumulate: a contribution already contained
//! in the current value is not appended again. Other attributes keep their
//! first value. `exclude_class=yes` / `exclude_style=yes` drop the attribute
//! entirely. All values are HTML-escaped through maud.
//!
//! ## Variables
//!
//! The variables written to the cache log on a miss ([`base_variables`]) are
//! replayed on a hit and overlaid with anything this request computed
//! ([`output_variables`]). Every name carries the context's variable prefix.

use crate::config::Settings;
use crate::context::{Flag, Metadata, ProcessingContext};
use crate::params::parse_attribute_pairs;
use crate::variants::{LazyMode, PlaceholderKind, srcset_value};
use maud::{PreEscaped, html};
use std::collections::BTreeMap;

/// What a run produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Rendered {
    Html(String),
    Url(String),
    /// A paired tag's `tag_data` with variables substituted.
    Template(String),
    Variables(BTreeMap<String, String>),
    /// Raw bytes for a direct fetch.
    Bytes {
        content_type: String,
        body: Vec<u8>,
    },
    /// `create_tag=no`.
    Empty,
}

impl Rendered {
    /// Textual output, if this is a textual variant.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Rendered::Html(s) | Rendered::Url(s) | Rendered::Template(s) => Some(s),
            Rendered::Empty => Some(""),
            Rendered::Variables(_) | Rendered::Bytes { .. } => None,
        }
    }
}

/// Host-supplied variable substitution for paired tags.
pub trait TemplateParser: Send + Sync {
    fn parse_variables(&self, template: &str, variables: &BTreeMap<String, String>) -> String;
}

/// Replaces `{name}` with the variable's value; unknown names are left as
/// they are.
#[derive(Debug, Default, Clone, Copy)]
pub struct BraceTemplateParser;

impl TemplateParser for BraceTemplateParser {
    fn parse_variables(&self, template: &str, variables: &BTreeMap<String, String>) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            match after.find('}') {
                Some(close) if variables.contains_key(&after[..close]) => {
                    out.push_str(&variables[&after[..close]]);
                    rest = &after[close + 1..];
                }
                _ => {
                    out.push('{');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    }
}

pub fn escape(value: &str) -> String {
    html! { (value) }.into_string()
}

// =============================================================================
// Attributes
// =============================================================================

/// Ordered attribute list with `class`/`style`/`alt` accumulation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes(Vec<(String, String)>);

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
    }

    /// Set, replacing any existing value.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.0.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = value,
            None => self.0.push((name.to_string(), value)),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let pos = self.0.iter().position(|(n, _)| n == name)?;
        Some(self.0.remove(pos).1)
    }

    /// Add a contribution from one attribute source.
    pub fn merge(&mut self, name: &str, value: &str) {
        let name = name.trim().to_ascii_lowercase();
        let value = value.trim();
        let separator = match name.as_str() {
            "class" | "alt" => " ",
            "style" => "; ",
            _ => {
                if self.get(&name).is_none() {
                    self.0.push((name.clone(), value.to_string()));
                }
                return;
            }
        };
        match self.get(&name) {
            None => self.0.push((name.clone(), value.to_string())),
            Some(current) if value.is_empty() || current.contains(value) => {}
            Some(current) if current.trim().is_empty() => self.set(&name, value),
            Some(current) => {
                let current = if name == "style" {
                    current.trim_end().trim_end_matches(';')
                } else {
                    current.trim_end()
                };
                let joined = format!("{current}{separator}{value}");
                self.set(&name, joined);
            }
        }
    }

    /// ` name="value"` pairs; empty values other than `alt` render bare.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.0 {
            out.push(' ');
            out.push_str(&escape(name));
            if !value.is_empty() || name == "alt" {
                out.push_str("=\"");
                out.push_str(&escape(value));
                out.push('"');
            }
        }
        out
    }
}

// =============================================================================
// Variables
// =============================================================================

fn insert_some<T: ToString>(vars: &mut BTreeMap<String, String>, name: &str, value: Option<T>) {
    if let Some(v) = value {
        vars.insert(name.to_string(), v.to_string());
    }
}

/// Variables describing the primary artifact, recorded in the cache log.
pub fn base_variables(meta: &Metadata) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    insert_some(&mut vars, "url", meta.cache_url.as_ref());
    insert_some(&mut vars, "path", meta.cache_path.as_ref());
    insert_some(&mut vars, "width", meta.final_width);
    insert_some(&mut vars, "height", meta.final_height);
    insert_some(&mut vars, "filesize", meta.final_filesize);
    insert_some(&mut vars, "format", meta.output_format.map(|f| f.extension()));
    insert_some(&mut vars, "mime_type", meta.output_format.map(|f| f.mime_type()));
    insert_some(&mut vars, "source", meta.source_path.as_ref());
    insert_some(&mut vars, "original_width", meta.original_width);
    insert_some(&mut vars, "original_height", meta.original_height);
    insert_some(&mut vars, "original_filesize", meta.original_filesize);
    if let (Some(w), Some(h)) = (meta.final_width, meta.final_height)
        && h > 0
    {
        vars.insert("aspect_ratio".into(), format!("{:.4}", w as f64 / h as f64));
    }
    insert_some(&mut vars, "dominant_color", meta.dominant_colour.as_ref());
    vars
}

/// Every variable this run exposes, prefixed.
pub fn output_variables(ctx: &ProcessingContext) -> BTreeMap<String, String> {
    let meta = &ctx.metadata;
    let mut vars = meta.template_variables.clone();
    vars.extend(base_variables(meta));

    if let Some(placeholder) = &meta.placeholder {
        vars.insert("placeholder_url".into(), placeholder.url.clone());
    }
    if let Some(fallback) = &meta.jpeg_fallback {
        vars.insert("jpeg_fallback_url".into(), fallback.url.clone());
    }
    if !meta.srcset.is_empty()
        && let (Some(url), Some(w)) = (&meta.cache_url, meta.final_width)
    {
        vars.insert("srcset".into(), srcset_value(&meta.srcset, url, w));
    }
    if let Some(sizes) = ctx.params.get("sizes") {
        vars.insert("sizes".into(), sizes.to_string());
    }
    if let Some(palette) = &meta.palette {
        vars.insert("dominant_color".into(), palette.dominant.to_hex());
        vars.insert("palette_count".into(), palette.colours.len().to_string());
        let list: Vec<&str> = palette.colours.iter().map(|c| c.colour.as_str()).collect();
        vars.insert("palette".into(), list.join(","));
        for (i, entry) in palette.colours.iter().enumerate() {
            vars.insert(format!("color_{}", i + 1), entry.colour.clone());
        }
    }
    vars.insert(
        "cache_hit".into(),
        if ctx.has_flag(Flag::UsingCacheCopy) { "yes" } else { "no" }.into(),
    );

    let prefix = ctx.variable_prefix();
    vars.into_iter().map(|(k, v)| (format!("{prefix}{k}"), v)).collect()
}

// =============================================================================
// <img> tags
// =============================================================================

/// Render the `<img>` tag (plus a `<noscript>` copy for JavaScript lazy
/// modes).
pub fn render_img(ctx: &ProcessingContext, settings: &Settings, lazy: LazyMode) -> Option<String> {
    let meta = &ctx.metadata;
    let params = &ctx.params;
    let url = meta.cache_url.as_deref()?;

    let mut attrs = Attributes::new();
    attrs.set("src", url);
    for name in ["alt", "title", "id", "class", "style"] {
        if let Some(v) = params.get(name) {
            attrs.merge(name, v);
        }
    }
    if !settings.defaults.class.is_empty() {
        attrs.merge("class", &settings.defaults.class);
    }
    if let Some(raw) = params.get("attributes") {
        for (name, value) in parse_attribute_pairs(raw) {
            attrs.merge(&name, &value);
        }
    }
    if attrs.get("alt").is_none() {
        attrs.set("alt", "");
    }

    let srcset = match (&meta.srcset[..], meta.final_width) {
        ([], _) | (_, None) => None,
        (variants, Some(w)) => Some(srcset_value(variants, url, w)),
    };
    if let Some(srcset) = &srcset {
        attrs.merge("srcset", srcset);
        if let Some(sizes) = params.get("sizes") {
            attrs.merge("sizes", sizes);
        }
    }
    if params.flag_or("add_dimensions", settings.defaults.add_dimensions)
        && let (Some(w), Some(h)) = (meta.final_width, meta.final_height)
    {
        attrs.merge("width", &w.to_string());
        attrs.merge("height", &h.to_string());
    }

    let noscript = apply_lazy(&mut attrs, ctx, lazy, url, srcset.as_deref());

    if params.flag("exclude_class") {
        attrs.remove("class");
    }
    if params.flag("exclude_style") {
        attrs.remove("style");
    }

    let noscript = noscript.map(|mut fallback| {
        if params.flag("exclude_class") {
            fallback.remove("class");
        }
        if params.flag("exclude_style") {
            fallback.remove("style");
        }
        fallback
    });
    // Attribute values are escaped by `Attributes::render`.
    let img = |a: &Attributes| PreEscaped(format!("<img{}>", a.render()));
    let markup = html! {
        (img(&attrs))
        @if let Some(fallback) = &noscript {
            noscript { (img(fallback)) }
        }
    };
    Some(markup.into_string())
}

/// Add lazy-loading attributes. Returns the `<noscript>` attributes for
/// JavaScript modes.
fn apply_lazy(
    attrs: &mut Attributes,
    ctx: &ProcessingContext,
    lazy: LazyMode,
    url: &str,
    srcset: Option<&str>,
) -> Option<Attributes> {
    let meta = &ctx.metadata;
    let background = || -> Option<String> {
        match lazy.placeholder()? {
            PlaceholderKind::Lqip => meta
                .placeholder
                .as_ref()
                .map(|p| format!("background-image:url('{}');background-size:cover", p.url)),
            PlaceholderKind::DominantColour => meta
                .dominant_colour
                .as_ref()
                .map(|c| format!("background-color:{c}")),
        }
    };

    match lazy {
        LazyMode::No => None,
        LazyMode::Html5 => {
            attrs.merge("loading", "lazy");
            None
        }
        LazyMode::Lqip | LazyMode::DominantColor => {
            attrs.merge("loading", "lazy");
            if let Some(style) = background() {
                attrs.merge("style", &style);
            }
            None
        }
        LazyMode::JsLqip | LazyMode::JsDominantColor => {
            let mut fallback = attrs.clone();
            if let Some(jpeg) = &meta.jpeg_fallback {
                fallback.set("src", jpeg.url.clone());
            }
            let placeholder = meta.placeholder.as_ref().map(|p| p.url.clone());
            attrs.set("src", placeholder.unwrap_or_else(|| url.to_string()));
            attrs.merge("data-src", url);
            if let Some(srcset) = srcset {
                attrs.remove("srcset");
                attrs.merge("data-srcset", srcset);
            }
            attrs.merge("class", "lazyload");
            if lazy == LazyMode::JsDominantColor
                && let Some(style) = background()
            {
                attrs.merge("style", &style);
            }
            Some(fallback)
        }
    }
}
