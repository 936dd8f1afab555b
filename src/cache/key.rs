//! Cache key derivation.
//!
//! A key is a pure function of the source's base identifier and the
//! *cache-relevant* parameters: the ones that change the produced bytes.
//! Output-only parameters (`class`, `alt`, `lazy`, `url_only`, `debug`,
//! `action_link`, ...) never take part, so the same artifact serves every tag
//! that differs only in markup.
//!
//! The key is the first 32 hex digits (128 bits) of a SHA-256 over a
//! versioned domain tag, the base identifier, and the sorted, normalised
//! `name=value` pairs, NUL separated.

use crate::params::{TagParams, is_truthy};
use sha2::{Digest, Sha256};

/// Parameters whose values affect the produced artifact.
pub const CACHE_KEY_PARAMS: &[&str] = &[
    "allow_scale_larger",
    "aspect_ratio",
    "bg_color",
    "border",
    "cache_dir",
    "colour_fill",
    "connection",
    "crop",
    "fallback_src",
    "filter",
    "fit",
    "flip",
    "height",
    "max",
    "max_height",
    "max_width",
    "min",
    "min_height",
    "min_width",
    "png_quality",
    "quality",
    "reflection",
    "rotate",
    "rounded_corners",
    "save_as",
    "save_type",
    "src",
    "text",
    "watermark",
    "width",
];

/// Bump to invalidate every existing key.
const KEY_DOMAIN: &[u8] = b"pictor-cache-v1";

/// Hex digits kept from the digest.
const KEY_LENGTH: usize = 32;

pub fn is_cache_relevant(name: &str) -> bool {
    CACHE_KEY_PARAMS.binary_search(&name).is_ok()
}

/// Derive the cache key for a source identifier and parameter set.
///
/// Deterministic across runs. Blank values count as absent, so `width=""`
/// and a missing `width` produce the same key.
pub fn generate_cache_key(base_identifier: &str, params: &TagParams) -> String {
    let mut hasher = Sha256::new();
    hasher.update(KEY_DOMAIN);
    hasher.update(b"\0");
    hasher.update(base_identifier.as_bytes());
    // CACHE_KEY_PARAMS is sorted, so iteration order is stable.
    for name in CACHE_KEY_PARAMS {
        if let Some(value) = params.get(name) {
            hasher.update(b"\0");
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(normalise(name, value).as_bytes());
        }
    }
    let digest = hex::encode(hasher.finalize());
    digest[..KEY_LENGTH].to_string()
}

fn normalise(name: &str, value: &str) -> String {
    match name {
        "allow_scale_larger" => if is_truthy(value) { "yes" } else { "no" }.to_string(),
        "fit" | "save_as" | "save_type" | "flip" | "bg_color" => value.to_ascii_lowercase(),
        _ => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> TagParams {
        TagParams::from_pairs(pairs.iter().copied())
    }

    #[test]
    fn allowlist_is_sorted() {
        let mut sorted = CACHE_KEY_PARAMS.to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted, CACHE_KEY_PARAMS);
    }

    #[test]
    fn key_is_deterministic() {
        let p = params(&[("src", "photo.jpg"), ("width", "300")]);
        assert_eq!(generate_cache_key("photo", &p), generate_cache_key("photo", &p));
        assert_eq!(generate_cache_key("photo", &p).len(), 32);
    }

    #[test]
    fn relevant_param_changes_key() {
        let a = params(&[("src", "photo.jpg"), ("width", "300")]);
        let b = params(&[("src", "photo.jpg"), ("width", "301")]);
        assert_ne!(generate_cache_key("photo", &a), generate_cache_key("photo", &b));
    }

    #[test]
    fn irrelevant_param_keeps_key() {
        let a = params(&[("src", "photo.jpg"), ("width", "300")]);
        let b = params(&[
            ("src", "photo.jpg"),
            ("width", "300"),
            ("debug", "yes"),
            ("action_link", "yes"),
            ("class", "hero"),
            ("lazy", "lqip"),
        ]);
        assert_eq!(generate_cache_key("photo", &a), generate_cache_key("photo", &b));
    }

    #[test]
    fn base_identifier_changes_key() {
        let p = params(&[("width", "300")]);
        assert_ne!(generate_cache_key("a", &p), generate_cache_key("b", &p));
    }

    #[test]
    fn insertion_order_does_not_matter() {
        let a = params(&[("width", "300"), ("height", "200")]);
        let b = params(&[("height", "200"), ("width", "300")]);
        assert_eq!(generate_cache_key("x", &a), generate_cache_key("x", &b));
    }

    #[test]
    fn blank_equals_missing() {
        let a = params(&[("width", "300"), ("height", "")]);
        let b = params(&[("width", "300")]);
        assert_eq!(generate_cache_key("x", &a), generate_cache_key("x", &b));
    }

    #[test]
    fn boolean_spellings_normalised() {
        let a = params(&[("allow_scale_larger", "yes")]);
        let b = params(&[("allow_scale_larger", "TRUE")]);
        assert_eq!(generate_cache_key("x", &a), generate_cache_key("x", &b));
    }

    #[test]
    fn value_boundary_is_unambiguous() {
        // "width=3" + "00" must not collide with "width=300"
        let a = params(&[("width", "3"), ("height", "00")]);
        let b = params(&[("width", "300")]);
        assert_ne!(generate_cache_key("x", &a), generate_cache_key("x", &b));
    }
}
