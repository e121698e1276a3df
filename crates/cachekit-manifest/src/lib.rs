//! # CacheKit Manifest
//!
//! Cache manifest data model and incremental parser for the CacheKit
//! offline-cache engine.
//!
//! ## Features
//!
//! - **Manifest**: immutable parsed cache declaration (CACHE / NETWORK /
//!   FALLBACK sections plus a content hash for change detection)
//! - **ManifestParser**: chunk-resumable text parser that can be fed bytes
//!   as they arrive from the network
//! - **Namespace matching**: longest-prefix fallback and network-namespace
//!   lookup with lexicographic tie-break
//!
//! ## Wire format
//!
//! ```text
//! CACHE MANIFEST
//! # comment
//! CACHE:
//! /app.js
//! NETWORK:
//! *
//! FALLBACK:
//! /articles/ /offline.html
//! ```

use thiserror::Error;

mod manifest;
mod parser;

pub use manifest::Manifest;
pub use parser::ManifestParser;

/// Errors that can occur while parsing a manifest.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManifestError {
    /// The first line was not the `CACHE MANIFEST` signature. Terminal: the
    /// parser accepts no further input once this has been reported.
    #[error("Missing 'CACHE MANIFEST' signature")]
    MissingSignature,

    /// `feed` was called after a terminal failure.
    #[error("Parser already failed")]
    AlreadyFailed,

    /// `finish` was called before the signature line was seen.
    #[error("Manifest incomplete: signature never validated")]
    Incomplete,
}

/// Result type alias for manifest parsing.
pub type ParseResult<T> = std::result::Result<T, ManifestError>;
