//! Incremental, chunk-resumable manifest parser.
//!
//! The parser is fed raw bytes as they arrive from the network. Each call to
//! [`ManifestParser::feed`] consumes a whole number of complete lines (unless
//! the chunk is final) and returns how many bytes it consumed; the caller
//! re-presents unconsumed bytes prepended to the next chunk. A running
//! content hash is maintained over every consumed byte so that two fetches of
//! the same manifest can be compared without keeping the text around.

use std::collections::HashSet;

use sha2::{Digest, Sha256};
use tracing::{debug, trace};
use url::Url;

use crate::manifest::NamespaceTable;
use crate::{Manifest, ManifestError, ParseResult};

/// The manifest signature line.
const SIGNATURE: &str = "CACHE MANIFEST";

/// Parser state across `feed` calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// The signature line has not been seen yet.
    AwaitingSignature,
    /// Signature validated, consuming section/URL lines.
    Lines,
    /// Terminal failure; all further input is rejected.
    Failed,
}

/// The active manifest section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Cache,
    Network,
    Fallback,
    /// Unrecognized section header: URL lines are discarded until a known
    /// header reappears.
    Unknown,
}

/// Incremental manifest parser.
pub struct ManifestParser {
    manifest_url: Url,
    state: State,
    section: Section,
    hasher: Sha256,
    cache_entries: HashSet<Url>,
    fallback_entries: NamespaceTable,
    network_entries: NamespaceTable,
    online_whitelist_open: bool,
}

impl ManifestParser {
    /// Create a parser for a manifest fetched from `manifest_url`. Relative
    /// URLs in the manifest body resolve against this URL.
    pub fn new(manifest_url: Url) -> Self {
        Self {
            manifest_url,
            state: State::AwaitingSignature,
            // URL lines before the first section header are explicit entries.
            section: Section::Cache,
            hasher: Sha256::new(),
            cache_entries: HashSet::new(),
            fallback_entries: NamespaceTable::default(),
            network_entries: NamespaceTable::default(),
            online_whitelist_open: false,
        }
    }

    /// Parse a complete manifest in one call.
    pub fn parse(manifest_url: Url, bytes: &[u8]) -> ParseResult<Manifest> {
        let mut parser = Self::new(manifest_url);
        parser.feed(bytes, true)?;
        parser.finish()
    }

    /// The URL the manifest is being fetched from.
    pub fn manifest_url(&self) -> &Url {
        &self.manifest_url
    }

    /// Feed a chunk of manifest bytes.
    ///
    /// Returns the number of bytes consumed, always a whole number of
    /// complete lines unless `is_final` is set. The caller must re-present
    /// unconsumed bytes prepended to the next chunk.
    pub fn feed(&mut self, bytes: &[u8], is_final: bool) -> ParseResult<usize> {
        if self.state == State::Failed {
            return Err(ManifestError::AlreadyFailed);
        }

        let mut consumed = 0;
        while consumed < bytes.len() {
            let rest = &bytes[consumed..];
            let (line, advance) = match rest.iter().position(|&b| b == b'\n') {
                Some(pos) => (&rest[..pos], pos + 1),
                None if is_final => (rest, rest.len()),
                None => break,
            };

            // The content hash covers every consumed byte, newline included.
            self.hasher.update(&rest[..advance]);
            consumed += advance;

            let line = String::from_utf8_lossy(line);
            let line = line.trim_end_matches('\r');

            match self.state {
                State::AwaitingSignature => {
                    if !Self::is_signature_line(line) {
                        self.state = State::Failed;
                        return Err(ManifestError::MissingSignature);
                    }
                    self.state = State::Lines;
                }
                State::Lines => self.consume_line(line.trim()),
                State::Failed => unreachable!(),
            }
        }

        Ok(consumed)
    }

    /// Finish parsing and build the [`Manifest`].
    pub fn finish(self) -> ParseResult<Manifest> {
        match self.state {
            State::Lines => {}
            State::Failed => return Err(ManifestError::AlreadyFailed),
            State::AwaitingSignature => return Err(ManifestError::Incomplete),
        }

        let digest = self.hasher.finalize();
        let mut content_hash = String::with_capacity(digest.len() * 2);
        for byte in digest {
            use std::fmt::Write;
            let _ = write!(content_hash, "{byte:02x}");
        }

        debug!(
            url = %self.manifest_url,
            cache_entries = self.cache_entries.len(),
            hash = %content_hash,
            "Manifest parsed"
        );

        Ok(Manifest::new(
            self.manifest_url,
            self.cache_entries,
            self.fallback_entries,
            self.network_entries,
            self.online_whitelist_open,
            content_hash,
        ))
    }

    /// The signature is the literal `CACHE MANIFEST` immediately followed by
    /// whitespace or the end of the line; anything after the whitespace is
    /// ignored.
    fn is_signature_line(line: &str) -> bool {
        match line.strip_prefix(SIGNATURE) {
            Some(rest) => rest.is_empty() || rest.starts_with([' ', '\t']),
            None => false,
        }
    }

    fn consume_line(&mut self, line: &str) {
        if line.is_empty() || line.starts_with('#') {
            return;
        }

        if line.ends_with(':') {
            self.section = match line {
                "CACHE:" => Section::Cache,
                "NETWORK:" => Section::Network,
                "FALLBACK:" => Section::Fallback,
                other => {
                    trace!(header = other, "Unknown manifest section");
                    Section::Unknown
                }
            };
            return;
        }

        let mut tokens = line.split_whitespace();
        let Some(first) = tokens.next() else {
            return;
        };

        match self.section {
            Section::Cache => {
                if let Some(url) = self.resolve_checked(first, true) {
                    self.cache_entries.insert(url);
                }
            }
            Section::Network => {
                if first == "*" {
                    self.online_whitelist_open = true;
                } else if let Some(url) = self.resolve_checked(first, false) {
                    self.network_entries.insert(url.to_string(), None);
                }
            }
            Section::Fallback => {
                // Two tokens required; a lone namespace is ignored.
                let Some(second) = tokens.next() else {
                    return;
                };
                let (Some(namespace), Some(target)) = (
                    self.resolve_checked(first, false),
                    self.resolve_checked(second, true),
                ) else {
                    return;
                };
                // The target joins the cache entries unless it is already a
                // cache or network entry.
                if !self.cache_entries.contains(&target)
                    && !self.network_entries.contains(target.as_str())
                {
                    self.cache_entries.insert(target.clone());
                }
                self.fallback_entries
                    .insert(namespace.to_string(), Some(target));
            }
            Section::Unknown => {
                trace!(line, "Discarding line in unknown section");
            }
        }
    }

    /// Resolve `token` against the manifest URL and apply the same-origin
    /// and path checks. Rejects are silently dropped per the format rules.
    fn resolve_checked(&self, token: &str, require_path: bool) -> Option<Url> {
        let mut url = self.manifest_url.join(token).ok()?;
        url.set_fragment(None);

        let origin_matches = url.scheme() == self.manifest_url.scheme()
            && url.host_str() == self.manifest_url.host_str()
            && url.port_or_known_default() == self.manifest_url.port_or_known_default();
        if !origin_matches {
            trace!(url = %url, "Dropping cross-origin manifest entry");
            return None;
        }
        if require_path && url.path().is_empty() {
            return None;
        }
        Some(url)
    }
}
