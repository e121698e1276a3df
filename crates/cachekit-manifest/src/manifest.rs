//! The parsed manifest data model.

use std::collections::HashSet;
use url::Url;

/// A namespace table: URL-prefix namespaces, each optionally mapped to a
/// target URL (fallback entries carry a target, network entries do not).
///
/// Entries are kept in a lexicographically sorted array rebuilt lazily after
/// mutation. Lookup scans the sorted order and keeps the *last* namespace
/// that is a prefix of the query, which yields the longest match and breaks
/// ties in favor of the namespace that sorts last.
#[derive(Debug, Clone, Default)]
pub(crate) struct NamespaceTable {
    entries: Vec<(String, Option<Url>)>,
    dirty: bool,
}

impl NamespaceTable {
    pub(crate) fn insert(&mut self, namespace: String, target: Option<Url>) {
        if self.entries.iter().any(|(ns, _)| *ns == namespace) {
            return;
        }
        self.entries.push((namespace, target));
        self.dirty = true;
    }

    pub(crate) fn rebuild(&mut self) {
        if self.dirty {
            self.entries.sort_by(|a, b| a.0.cmp(&b.0));
            self.dirty = false;
        }
    }

    pub(crate) fn longest_match(&self, query: &str) -> Option<&(String, Option<Url>)> {
        debug_assert!(!self.dirty, "namespace table queried before rebuild");
        let mut found = None;
        for entry in &self.entries {
            if query.starts_with(entry.0.as_str()) {
                found = Some(entry);
            }
        }
        found
    }

    pub(crate) fn contains(&self, namespace: &str) -> bool {
        self.entries.iter().any(|(ns, _)| ns == namespace)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &(String, Option<Url>)> {
        self.entries.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// An immutable parsed cache manifest.
///
/// Produced by [`crate::ManifestParser::finish`]. Holds the explicit cache
/// entries (including fallback targets), the fallback and network namespace
/// tables, the online-whitelist wildcard flag, and a content hash over the
/// raw manifest bytes used for change detection between fetch attempts.
#[derive(Debug, Clone)]
pub struct Manifest {
    manifest_url: Url,
    cache_entries: HashSet<Url>,
    fallback_entries: NamespaceTable,
    network_entries: NamespaceTable,
    online_whitelist_open: bool,
    content_hash: String,
}

impl Manifest {
    pub(crate) fn new(
        manifest_url: Url,
        cache_entries: HashSet<Url>,
        mut fallback_entries: NamespaceTable,
        mut network_entries: NamespaceTable,
        online_whitelist_open: bool,
        content_hash: String,
    ) -> Self {
        fallback_entries.rebuild();
        network_entries.rebuild();
        Self {
            manifest_url,
            cache_entries,
            fallback_entries,
            network_entries,
            online_whitelist_open,
            content_hash,
        }
    }

    /// The URL this manifest was fetched from.
    pub fn manifest_url(&self) -> &Url {
        &self.manifest_url
    }

    /// Hex digest over every byte of the manifest text.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// True if the NETWORK section contained the `*` wildcard.
    pub fn online_whitelist_open(&self) -> bool {
        self.online_whitelist_open
    }

    /// Explicit cache entries, fallback targets included.
    pub fn cache_entries(&self) -> impl Iterator<Item = &Url> {
        self.cache_entries.iter()
    }

    /// Number of cache entries.
    pub fn cache_entry_count(&self) -> usize {
        self.cache_entries.len()
    }

    /// Whether `url` is governed by the CACHE section (or is a fallback
    /// target).
    pub fn contains_cache_entry(&self, url: &Url) -> bool {
        self.cache_entries.contains(url)
    }

    /// Fallback namespace pairs, sorted by namespace.
    pub fn fallback_entries(&self) -> impl Iterator<Item = (&str, &Url)> {
        self.fallback_entries
            .iter()
            .filter_map(|(ns, target)| target.as_ref().map(|t| (ns.as_str(), t)))
    }

    /// Network namespaces, sorted.
    pub fn network_entries(&self) -> impl Iterator<Item = &str> {
        self.network_entries.iter().map(|(ns, _)| ns.as_str())
    }

    /// Find the fallback target for `url`: the target of the longest
    /// fallback namespace that is a prefix of `url`.
    pub fn match_fallback(&self, url: &Url) -> Option<&Url> {
        self.fallback_entries
            .longest_match(url.as_str())
            .and_then(|(_, target)| target.as_ref())
    }

    /// Find the network namespace matching `url`, if any.
    pub fn match_network_namespace(&self, url: &Url) -> Option<&str> {
        self.network_entries
            .longest_match(url.as_str())
            .map(|(ns, _)| ns.as_str())
    }

    /// Whether `url` falls under an explicit NETWORK namespace. The `*`
    /// wildcard is reported separately by [`Manifest::online_whitelist_open`].
    pub fn is_online_whitelisted(&self, url: &Url) -> bool {
        self.match_network_namespace(url).is_some()
    }

    /// Serialize back to manifest text. Entry order within sections is not
    /// preserved from the original input.
    pub fn serialize(&self) -> String {
        let mut out = String::from("CACHE MANIFEST\n");

        if !self.cache_entries.is_empty() {
            out.push_str("CACHE:\n");
            let mut entries: Vec<&Url> = self.cache_entries.iter().collect();
            entries.sort_by(|a, b| a.as_str().cmp(b.as_str()));
            for url in entries {
                out.push_str(url.as_str());
                out.push('\n');
            }
        }

        if self.online_whitelist_open || self.network_entries.len() > 0 {
            out.push_str("NETWORK:\n");
            if self.online_whitelist_open {
                out.push_str("*\n");
            }
            for (ns, _) in self.network_entries.iter() {
                out.push_str(ns);
                out.push('\n');
            }
        }

        if self.fallback_entries.len() > 0 {
            out.push_str("FALLBACK:\n");
            for (ns, target) in self.fallback_entries.iter() {
                if let Some(target) = target {
                    out.push_str(ns);
                    out.push(' ');
                    out.push_str(target.as_str());
                    out.push('\n');
                }
            }
        }

        out
    }
}
