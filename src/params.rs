//! Tag parameters: the string-keyed map every pipeline run starts from.
//!
//! Hosts hand the pipeline a flat map of `name → value` strings, usually
//! lifted straight from a template tag such as
//! `{pictor src="photo.jpg" width="300" crop="y|center,center"}`. Values are
//! always strings: numeric-looking values are kept verbatim and parsed where
//! they are consumed, so the snapshot taken at context construction can be
//! replayed byte-for-byte (see [`crate::action`]).
//!
//! ## Value conventions
//!
//! | Kind | Accepted | Accessor |
//! |---|---|---|
//! | Boolean | `yes`, `y`, `true`, `on`, `1` (case-insensitive) | [`TagParams::flag`] |
//! | Integer | `300`, `300px` | [`TagParams::parse_u32`] |
//! | List | pipe-delimited `a\|b\|c` | [`TagParams::list`] |
//!
//! Empty values are treated as absent by every accessor.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Ordered map of tag parameters.
///
/// `BTreeMap` keeps iteration order stable, which matters for cache-key
/// derivation and for serialising action-link packets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagParams(BTreeMap<String, String>);

impl TagParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(key, value)` pairs. Keys are lower-cased and trimmed.
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: AsRef<str>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut params = Self::new();
        for (k, v) in pairs {
            params.set(k.as_ref(), v);
        }
        params
    }

    /// Parse `key=value` arguments as given on the command line.
    ///
    /// Arguments without `=` are treated as boolean switches (`key=yes`).
    pub fn from_args<S: AsRef<str>>(args: &[S]) -> Self {
        let mut params = Self::new();
        for arg in args {
            let arg = arg.as_ref();
            match arg.split_once('=') {
                Some((k, v)) => params.set(k, unquote(v)),
                None => params.set(arg, "yes"),
            }
        }
        params
    }

    /// Parse a tag parameter string: `src="a.jpg" width='300' lazy=lqip`.
    ///
    /// Double- and single-quoted values may contain spaces and the other
    /// quote character. Malformed trailing fragments are ignored.
    pub fn parse_tag(input: &str) -> Self {
        let mut params = Self::new();
        for (k, v) in parse_attribute_pairs(input) {
            params.set(&k, v);
        }
        params
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(key.trim().to_ascii_lowercase(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    /// Raw lookup, returning `None` for missing or blank values.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Boolean parameter. Missing values are `false`.
    pub fn flag(&self, key: &str) -> bool {
        self.get(key).is_some_and(is_truthy)
    }

    /// Boolean parameter with an explicit default for missing values.
    pub fn flag_or(&self, key: &str, default: bool) -> bool {
        self.get(key).map(is_truthy).unwrap_or(default)
    }

    /// Parse an unsigned integer, tolerating a `px` suffix.
    ///
    /// Returns `Ok(None)` when absent and `Err(raw)` when present but not a
    /// non-negative integer, so callers can decide between failing and
    /// degrading.
    pub fn parse_u32(&self, key: &str) -> Result<Option<u32>, String> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => {
                let trimmed = raw.trim_end_matches("px").trim();
                trimmed
                    .parse::<u32>()
                    .map(Some)
                    .map_err(|_| raw.to_string())
            }
        }
    }

    /// Pipe-delimited list, blank entries removed.
    pub fn list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| {
                v.split('|')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for TagParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.0 {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            write!(f, "{}=\"{}\"", k, v.replace('"', "&quot;"))?;
        }
        Ok(())
    }
}

pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "yes" | "y" | "true" | "on" | "1"
    )
}

fn unquote(value: &str) -> String {
    let v = value.trim();
    let quoted = v.len() >= 2
        && ((v.starts_with('"') && v.ends_with('"')) || (v.starts_with('\'') && v.ends_with('\'')));
    if quoted {
        v[1..v.len() - 1].to_string()
    } else {
        v.to_string()
    }
}

/// Split an HTML-attribute-like string into `(name, value)` pairs.
///
/// Shared by tag parsing and by the free-form `attributes` parameter in
/// [`crate::markup`]. Bare names (`async`, `hidden`) yield an empty value.
pub fn parse_attribute_pairs(input: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        while i < chars.len() && chars[i].is_whitespace() {
            i += 1;
        }
        let start = i;
        while i < chars.len() && !chars[i].is_whitespace() && chars[i] != '=' {
            i += 1;
        }
        let name: String = chars[start..i].iter().collect();
        if name.is_empty() {
            i += 1;
            continue;
        }
        while i < chars.len() && chars[i].is_whitespace() {
            i += 1;
        }
        if i >= chars.len() || chars[i] != '=' {
            pairs.push((name, String::new()));
            continue;
        }
        i += 1;
        while i < chars.len() && chars[i].is_whitespace() {
            i += 1;
        }
        let value = if i < chars.len() && (chars[i] == '"' || chars[i] == '\'') {
            let quote = chars[i];
            i += 1;
            let vstart = i;
            while i < chars.len() && chars[i] != quote {
                i += 1;
            }
            let v: String = chars[vstart..i].iter().collect();
            i += 1;
            v
        } else {
            let vstart = i;
            while i < chars.len() && !chars[i].is_whitespace() {
                i += 1;
            }
            chars[vstart..i].iter().collect()
        };
        pairs.push((name, value));
    }

    pairs
}
