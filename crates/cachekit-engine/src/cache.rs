//! The immutable, versioned cache snapshot.

use cachekit_manifest::Manifest;
use hashbrown::{HashMap, HashSet};
use tracing::debug;
use url::Url;

use crate::transport::Validators;
use crate::{CacheId, ContextId, EngineError, HostId, Result};

/// Per-resource bookkeeping inside one cache version.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub size_bytes: u64,
    /// Governed by the manifest (or a master entry): the transport layer
    /// never evicts it.
    pub cache_governed: bool,
    /// Survives even when the manifest stops listing it (master documents).
    pub persistent: bool,
    /// Loaded under a mismatched manifest context; excluded from navigation
    /// selection.
    pub foreign: bool,
}

/// One immutable snapshot of the resources governed by a manifest, plus the
/// master documents that use it. Created incomplete by the group's update
/// algorithm; `complete` flips exactly once, after which the snapshot never
/// changes. Only the newest version in a group may be incomplete.
pub struct Cache {
    id: CacheId,
    context: ContextId,
    manifest: Option<Manifest>,
    manifest_validators: Validators,
    master_urls: HashSet<Url>,
    hosts: HashSet<HostId>,
    complete: bool,
    obsolete: bool,
    disk_size_bytes: u64,
    entries: HashMap<Url, StoredEntry>,
    /// Resources that already took their one network attempt before fallback
    /// applies.
    fallback_latched: HashSet<Url>,
}

impl Cache {
    /// Create a fresh, incomplete cache version under a new storage context.
    pub fn new(context: ContextId) -> Self {
        Self {
            id: CacheId::next(),
            context,
            manifest: None,
            manifest_validators: Validators::default(),
            master_urls: HashSet::new(),
            hosts: HashSet::new(),
            complete: false,
            obsolete: false,
            disk_size_bytes: 0,
            entries: HashMap::new(),
            fallback_latched: HashSet::new(),
        }
    }

    /// Reconstruct a complete cache from persisted state without opening its
    /// bodies. Master URLs are registered as present; the manifest is
    /// refreshed by the next update.
    pub(crate) fn restored(context: ContextId, master_urls: Vec<Url>, size_kb: u64) -> Self {
        let mut cache = Self::new(context);
        for url in master_urls {
            cache.entries.insert(
                url.clone(),
                StoredEntry {
                    size_bytes: 0,
                    cache_governed: true,
                    persistent: true,
                    foreign: false,
                },
            );
            cache.master_urls.insert(url);
        }
        cache.disk_size_bytes = size_kb * 1024;
        cache.complete = true;
        cache
    }

    pub fn id(&self) -> CacheId {
        self.id
    }

    pub fn context(&self) -> &ContextId {
        &self.context
    }

    pub fn manifest(&self) -> Option<&Manifest> {
        self.manifest.as_ref()
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn is_obsolete(&self) -> bool {
        self.obsolete
    }

    pub(crate) fn set_obsolete(&mut self) {
        self.obsolete = true;
    }

    /// Accounted size of stored entries, rounded up to whole kB.
    pub fn disk_size_kb(&self) -> u64 {
        self.disk_size_bytes.div_ceil(1024)
    }

    pub fn disk_size_bytes(&self) -> u64 {
        self.disk_size_bytes
    }

    // ==================== Manifest ====================

    pub(crate) fn set_manifest(&mut self, manifest: Manifest) {
        debug_assert!(!self.complete, "manifest assigned after completion");
        self.manifest = Some(manifest);
    }

    pub(crate) fn set_manifest_validators(&mut self, validators: Validators) {
        self.manifest_validators = validators;
    }

    pub(crate) fn manifest_validators(&self) -> &Validators {
        &self.manifest_validators
    }

    // ==================== Hosts ====================

    /// Attach a consumer. Returns false if already attached.
    pub fn attach_host(&mut self, host: HostId) -> bool {
        self.hosts.insert(host)
    }

    /// Detach a consumer. Returns false if it was not attached.
    pub fn detach_host(&mut self, host: HostId) -> bool {
        self.hosts.remove(&host)
    }

    pub fn has_host(&self, host: HostId) -> bool {
        self.hosts.contains(&host)
    }

    pub fn hosts(&self) -> impl Iterator<Item = HostId> + '_ {
        self.hosts.iter().copied()
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    // ==================== Master URLs ====================

    /// Add a document URL that uses this cache without being listed in the
    /// manifest. Idempotent.
    pub fn add_master_url(&mut self, url: Url) -> bool {
        self.master_urls.insert(url)
    }

    /// Remove a master URL. Idempotent; returns whether it was present.
    pub fn remove_master_url(&mut self, url: &Url) -> bool {
        self.master_urls.remove(url)
    }

    pub fn is_master(&self, url: &Url) -> bool {
        self.master_urls.contains(url)
    }

    pub fn master_urls(&self) -> impl Iterator<Item = &Url> {
        self.master_urls.iter()
    }

    // ==================== Entries ====================

    /// Record a stored body. Replaces any previous record for the URL and
    /// adjusts the accounted size.
    pub(crate) fn record_entry(
        &mut self,
        url: Url,
        size_bytes: u64,
        cache_governed: bool,
        persistent: bool,
    ) {
        if let Some(old) = self.entries.get(&url) {
            self.disk_size_bytes = self.disk_size_bytes.saturating_sub(old.size_bytes);
        }
        self.disk_size_bytes += size_bytes;
        self.entries.insert(
            url,
            StoredEntry {
                size_bytes,
                cache_governed,
                persistent,
                foreign: false,
            },
        );
    }

    pub fn has_entry(&self, url: &Url) -> bool {
        self.entries.contains_key(url)
    }

    pub fn entry(&self, url: &Url) -> Option<&StoredEntry> {
        self.entries.get(url)
    }

    pub fn entry_urls(&self) -> impl Iterator<Item = &Url> {
        self.entries.keys()
    }

    /// Mark a resource foreign: it was loaded while this cache was selected
    /// but is not governed by this cache's manifest. Returns whether the
    /// entry exists.
    pub fn mark_foreign(&mut self, url: &Url) -> bool {
        match self.entries.get_mut(url) {
            Some(entry) => {
                entry.foreign = true;
                true
            }
            None => {
                // Track foreignness even for bodies not stored here so later
                // selections skip the URL.
                self.entries.insert(
                    url.clone(),
                    StoredEntry {
                        size_bytes: 0,
                        cache_governed: false,
                        persistent: false,
                        foreign: true,
                    },
                );
                true
            }
        }
    }

    pub fn is_foreign(&self, url: &Url) -> bool {
        self.entries.get(url).is_some_and(|e| e.foreign)
    }

    // ==================== Queries ====================

    /// Whether `url` is served from this cache: declared by the manifest (or
    /// a master URL) **and** its body is present, not merely declared.
    pub fn is_cached(&self, url: &Url) -> bool {
        if !self.has_entry(url) {
            return false;
        }
        if self.master_urls.contains(url) {
            return true;
        }
        self.manifest
            .as_ref()
            .is_some_and(|m| m.contains_cache_entry(url))
    }

    /// The fallback target for `url` per the manifest's longest-prefix rule.
    pub fn match_fallback(&self, url: &Url) -> Option<&Url> {
        self.manifest.as_ref().and_then(|m| m.match_fallback(url))
    }

    /// Whether `url` matches an explicit NETWORK namespace. The `*` wildcard
    /// is a separate, lower-priority rule in the network model.
    pub fn is_whitelisted(&self, url: &Url) -> bool {
        self.manifest
            .as_ref()
            .is_some_and(|m| m.is_online_whitelisted(url))
    }

    pub fn online_whitelist_open(&self) -> bool {
        self.manifest
            .as_ref()
            .is_some_and(|m| m.online_whitelist_open())
    }

    /// Fallback network latch: the first call for a URL returns false (take
    /// the one network attempt), every later call returns true (serve the
    /// fallback).
    pub(crate) fn latch_fallback(&mut self, url: &Url) -> bool {
        if self.fallback_latched.contains(url) {
            return true;
        }
        self.fallback_latched.insert(url.clone());
        false
    }

    /// Flip the completeness flag, exactly once. The caller registers the
    /// entry and master URLs in the registry's resource index afterwards.
    pub(crate) fn mark_complete(&mut self) -> Result<()> {
        if self.complete {
            return Err(EngineError::AlreadyComplete);
        }
        if self.manifest.is_none() {
            return Err(EngineError::storage("cache completed without a manifest"));
        }
        self.complete = true;
        debug!(
            cache = self.id.raw(),
            entries = self.entries.len(),
            size_kb = self.disk_size_kb(),
            "Cache complete"
        );
        Ok(())
    }
}
