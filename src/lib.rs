//! # Pictor
//!
//! On-demand image transformation with a persistent artifact cache. A
//! template tag hands over a bag of `key=value` parameters; Pictor loads the
//! source, runs the requested transformations, stores the result under a
//! deterministic name, and renders an `<img>` tag, a URL, or template
//! variables pointing at it. Repeat requests are served from the cache
//! without touching the source.
//!
//! # Architecture: Staged Pipeline
//!
//! Every request flows through six stages sharing one
//! [`context::ProcessingContext`]:
//!
//! ```text
//! 1. Initialize        parameters  →  defaults folded in, cache key fixed
//! 2. Early cache check key         →  artifact exists? skip to Output
//! 3. Load source       src chain   →  decoded source (or fallback)
//! 4. Process image     source      →  transformed image
//! 5. Cache             image       →  artifact + derived variants + log row
//! 6. Output            metadata    →  <img>, URL, variables, or bytes
//! ```
//!
//! A stage either continues, skips the rest (the early cache hit), or fails.
//! Output runs even after a skip, so a cache hit renders the same tag as the
//! miss that produced it.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`params`] | Tag parameter map, boolean and list grammar, tag-string parser |
//! | [`context`] | Per-request state: parameters, typed metadata, flags, recorded errors |
//! | [`pipeline`] | `Stage` trait, `Pipeline` runner, and the six stages |
//! | [`cache`] | Cache keys, artifact paths, the cache log, listing |
//! | [`storage`] | Storage adapter trait, local-disk adapter, named connections |
//! | [`imaging`] | Dimension maths, codecs, transformations, filters, faces, palettes |
//! | [`source`] | Source resolution: local, remote, colour fill; auto-adjust |
//! | [`variants`] | Responsive widths, LQIP and dominant-colour placeholders, JPEG fallback |
//! | [`markup`] | `<img>` rendering, attribute merging, template variables |
//! | [`action`] | Signed action-link packets and direct fetch |
//! | [`services`] | The collaborators a pipeline runs against |
//! | [`config`] | `pictor.toml` loading, merging, and validation |
//! | [`output`] | CLI output formatting |
//!
//! # Design Decisions
//!
//! ## The Key Is the Identity
//!
//! An artifact's name is `<source>_<key>.<ext>`, where the key hashes the
//! source identifier with every cache-relevant parameter *after* defaults
//! are folded in. Changing a configured default therefore changes the key,
//! and stale artifacts are simply never looked up again. Parameters that
//! only affect markup (`alt`, `class`, lazy-loading) are excluded, so they
//! share one artifact.
//!
//! ## Early Exit Before Decoding
//!
//! The expensive part of a request is loading and decoding the source,
//! especially when it is remote. When the output extension can be predicted
//! from the parameters, the early check looks for the artifact before any of
//! that happens. A warm cache never touches the source.
//!
//! ## Collaborators Behind Traits
//!
//! Face detection, text rendering, HEIC conversion, remote fetching, template
//! parsing, and storage are traits held by [`services::ServiceBundle`]. The
//! stock bundle ships working defaults; hosts and tests swap in their own.

pub mod action;
pub mod cache;
pub mod config;
pub mod context;
pub mod imaging;
pub mod markup;
pub mod output;
pub mod params;
pub mod pipeline;
pub mod services;
pub mod source;
pub mod storage;
pub mod variants;

#[cfg(test)]
pub(crate) mod test_helpers;
