//! The cache registry: owner of every cache group, the lookup indexes over
//! them, and the engine's single event loop entry point.
//!
//! The registry is passed explicitly to everything that needs it; it is
//! constructed at startup and torn down at shutdown. Groups own their cache
//! versions; the indexes hold ids, never owning references.

use std::path::PathBuf;

use hashbrown::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::Cache;
use crate::group::{CacheGroup, GroupEffect, GroupState, StubInfo};
use crate::host::{CacheHost, HostEvent};
use crate::policy::{Policy, PromptAnswer, PromptBroker, PromptKind};
use crate::store;
use crate::transport::{FetchEvent, FetchRequest, Transport};
use crate::{
    CacheId, ContextId, EngineError, EngineEvent, EngineSender, FetchId, GroupId, HostId, Result,
    Timers, UpdateConfig,
};

// ==================== Decisions ====================

/// Outcome of cache selection for a navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationSelection {
    /// Serve the navigation under this cache.
    Cache { group: GroupId, cache: CacheId },
    /// The document is foreign to the cache it would have selected; reload
    /// it from the network.
    ReloadFromNetwork,
    /// No applicable cache.
    NoCache,
}

/// Fetch-time network-model decision for a resource request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkDecision {
    /// Not cache-governed; load as if no cache existed.
    LoadNormally,
    /// The body is in the cache; serve it from there.
    ServeFromCache,
    /// Whitelisted; go to the network.
    LoadFromNetwork,
    /// The one network attempt was already taken; serve the fallback body.
    ServeFallback(Url),
    /// Not cached, not whitelisted, no fallback: the load must fail.
    FailLoad,
}

/// One installed group, for a settings/storage surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredGroupInfo {
    pub manifest_url: Url,
    pub size_kb: u64,
}

// ==================== Engine context ====================

/// Collaborator and index borrows handed to a group for one state
/// transition. Built by [`CacheRegistry::split`] so the group table stays
/// independently borrowable.
pub(crate) struct EngineCtx<'a> {
    pub(crate) transport: &'a mut dyn Transport,
    pub(crate) timers: &'a mut dyn Timers,
    pub(crate) hosts: &'a mut HashMap<HostId, Box<dyn CacheHost>>,
    pub(crate) prompts: &'a mut PromptBroker,
    pub(crate) config: &'a UpdateConfig,
    pub(crate) fetch_index: &'a mut HashMap<FetchId, GroupId>,
    pub(crate) events: &'a EngineSender,
}

impl EngineCtx<'_> {
    pub(crate) fn notify(&mut self, host: HostId, event: HostEvent) {
        if let Some(h) = self.hosts.get(&host) {
            h.notify(event);
        }
    }

    pub(crate) fn start_fetch(&mut self, group: GroupId, request: FetchRequest) -> FetchId {
        let id = FetchId::next();
        debug!(group = group.raw(), fetch = id.raw(), url = %request.url, "Fetch started");
        self.fetch_index.insert(id, group);
        self.transport.fetch(id, request, self.events.clone());
        id
    }

    pub(crate) fn stop_fetch(&mut self, id: FetchId) {
        self.fetch_index.remove(&id);
        self.transport.stop(id);
    }
}

// ==================== Registry ====================

pub struct CacheRegistry {
    groups: HashMap<GroupId, CacheGroup>,
    manifest_index: HashMap<Url, GroupId>,
    /// Obsoleted groups, kept for event suppression until their last cache
    /// is dropped.
    obsolete_index: HashMap<Url, GroupId>,
    master_index: HashMap<Url, GroupId>,
    host_index: HashMap<HostId, (GroupId, CacheId)>,
    context_index: HashMap<ContextId, (GroupId, CacheId)>,
    /// Resource URL to the most recently completed cache containing it.
    resource_index: HashMap<Url, (GroupId, CacheId)>,
    fetch_index: HashMap<FetchId, GroupId>,
    hosts: HashMap<HostId, Box<dyn CacheHost>>,
    transport: Box<dyn Transport>,
    timers: Box<dyn Timers>,
    prompts: PromptBroker,
    config: UpdateConfig,
    events: EngineSender,
    store_path: Option<PathBuf>,
}

impl CacheRegistry {
    /// Create the registry and the event receiver the embedder drains into
    /// [`CacheRegistry::handle_event`].
    pub fn new(
        transport: Box<dyn Transport>,
        policy: Box<dyn Policy>,
        timers: Box<dyn Timers>,
        config: UpdateConfig,
    ) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (events, rx) = EngineSender::new();
        let registry = Self {
            groups: HashMap::new(),
            manifest_index: HashMap::new(),
            obsolete_index: HashMap::new(),
            master_index: HashMap::new(),
            host_index: HashMap::new(),
            context_index: HashMap::new(),
            resource_index: HashMap::new(),
            fetch_index: HashMap::new(),
            hosts: HashMap::new(),
            transport,
            timers,
            prompts: PromptBroker::new(policy),
            config,
            events,
            store_path: None,
        };
        (registry, rx)
    }

    /// Register a cache host for event delivery.
    pub fn register_host(&mut self, host: Box<dyn CacheHost>) -> HostId {
        let id = HostId::next();
        self.hosts.insert(id, host);
        id
    }

    /// Where the registry state is persisted. Unset means no persistence.
    pub fn set_store_path(&mut self, path: PathBuf) {
        self.store_path = Some(path);
    }

    // ==================== Lookups ====================

    pub fn group_for_manifest(&self, manifest_url: &Url) -> Option<&CacheGroup> {
        self.manifest_index
            .get(manifest_url)
            .and_then(|gid| self.groups.get(gid))
    }

    pub fn is_group_obsolete(&self, manifest_url: &Url) -> bool {
        self.obsolete_index.contains_key(manifest_url)
    }

    pub fn cache_for_host(&self, host: HostId) -> Option<&Cache> {
        let (gid, cid) = self.host_index.get(&host)?;
        self.groups.get(gid)?.cache(*cid)
    }

    fn newest_complete(&self, gid: GroupId) -> Option<(GroupId, CacheId)> {
        self.groups
            .get(&gid)?
            .newest_complete_cache()
            .map(|c| (gid, c.id()))
    }

    // ==================== Event loop ====================

    /// The single mutation entry point for asynchronous continuations.
    pub fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Fetch { id, event } => {
                let terminal = matches!(
                    event,
                    FetchEvent::Done
                        | FetchEvent::NotModified
                        | FetchEvent::Failed { .. }
                        | FetchEvent::Redirected { .. }
                );
                if let Some(&gid) = self.fetch_index.get(&id) {
                    let mut effects = Vec::new();
                    {
                        let (mut ctx, groups) = self.split();
                        if let Some(group) = groups.get_mut(&gid) {
                            group.on_fetch_event(&mut ctx, id, event, &mut effects);
                        }
                    }
                    self.apply_effects(gid, effects);
                }
                if terminal {
                    self.fetch_index.remove(&id);
                }
            }
            EngineEvent::Timer {
                group,
                kind,
                generation,
            } => {
                let mut effects = Vec::new();
                {
                    let (mut ctx, groups) = self.split();
                    if let Some(g) = groups.get_mut(&group) {
                        g.on_timer(&mut ctx, kind, generation, &mut effects);
                    }
                }
                self.apply_effects(group, effects);
            }
            EngineEvent::Prompt { id, answer } => {
                let Some((manifest_url, kind, waiters)) = self.prompts.resolve(id) else {
                    return;
                };
                if matches!(kind, PromptKind::CheckForUpdate) {
                    if answer == PromptAnswer::Allowed {
                        for (gid, host) in waiters {
                            if self.groups.contains_key(&gid) {
                                self.start_update(host, &manifest_url, None);
                            }
                        }
                    }
                    return;
                }
                for (gid, _) in waiters {
                    let mut effects = Vec::new();
                    {
                        let (mut ctx, groups) = self.split();
                        if let Some(group) = groups.get_mut(&gid) {
                            group.on_prompt_answer(&mut ctx, id, kind, answer, &mut effects);
                        }
                    }
                    self.apply_effects(gid, effects);
                }
            }
        }
    }

    // ==================== Update entry points ====================

    /// Start (or coalesce into) an update for a manifest URL, creating the
    /// group on first use. `master` enqueues a racing master document.
    pub fn start_update(
        &mut self,
        host: Option<HostId>,
        manifest_url: &Url,
        master: Option<(Url, HostId)>,
    ) -> GroupId {
        let gid = match self.manifest_index.get(manifest_url) {
            Some(&gid) => gid,
            None => {
                let group = CacheGroup::new(manifest_url.clone(), self.config.default_quota_kb);
                let gid = group.id();
                info!(group = gid.raw(), url = %manifest_url, "Cache group created");
                self.groups.insert(gid, group);
                self.manifest_index.insert(manifest_url.clone(), gid);
                gid
            }
        };
        self.materialize_group(gid);

        let mut effects = Vec::new();
        {
            let (mut ctx, groups) = self.split();
            if let Some(group) = groups.get_mut(&gid) {
                group.start_update(&mut ctx, host, master, &mut effects);
            }
        }
        self.apply_effects(gid, effects);
        gid
    }

    /// Host-initiated update check (the `applicationCache.update()` entry).
    /// Routed through the policy's check-for-update prompt first.
    pub fn update_for_host(&mut self, host: HostId) -> Result<()> {
        let (gid, _) = self
            .host_index
            .get(&host)
            .copied()
            .ok_or(EngineError::HostNotAssociated)?;
        let group = self
            .groups
            .get(&gid)
            .ok_or(EngineError::HostNotAssociated)?;
        let manifest_url = group.manifest_url().clone();
        if group.is_obsolete() {
            return Err(EngineError::GroupObsolete(manifest_url));
        }
        self.prompts.ask(
            gid,
            Some(host),
            &manifest_url,
            PromptKind::CheckForUpdate,
            &self.events,
        );
        Ok(())
    }

    /// Move a host to the newest complete cache of its group.
    pub fn swap_cache(&mut self, host: HostId) -> Result<()> {
        let (gid, current) = self
            .host_index
            .get(&host)
            .copied()
            .ok_or(EngineError::HostNotAssociated)?;
        let group = self
            .groups
            .get_mut(&gid)
            .ok_or(EngineError::HostNotAssociated)?;
        if group.is_obsolete() {
            return Err(EngineError::GroupObsolete(group.manifest_url().clone()));
        }
        let newest = group
            .newest_complete_cache()
            .map(|c| c.id())
            .ok_or(EngineError::NoCompleteCache)?;
        if newest == current {
            return Err(EngineError::AlreadyNewest);
        }
        if let Some(cache) = group.cache_mut(current) {
            cache.detach_host(host);
        }
        if let Some(cache) = group.cache_mut(newest) {
            cache.attach_host(host);
        }
        self.host_index.insert(host, (gid, newest));
        info!(host = host.raw(), cache = newest.raw(), "Host swapped to newest cache");
        Ok(())
    }

    /// Abort any update running for this manifest URL.
    pub fn abort_update(&mut self, manifest_url: &Url) {
        let Some(&gid) = self.manifest_index.get(manifest_url) else {
            return;
        };
        let mut effects = Vec::new();
        {
            let (mut ctx, groups) = self.split();
            if let Some(group) = groups.get_mut(&gid) {
                group.abort_update(&mut ctx, &mut effects);
            }
        }
        self.apply_effects(gid, effects);
    }

    /// The embedder reports that a pending master document finished loading.
    pub fn master_document_loaded(&mut self, host: HostId, success: bool) {
        let Some(gid) = self
            .groups
            .iter()
            .find(|(_, g)| g.has_pending_host(host))
            .map(|(gid, _)| *gid)
        else {
            return;
        };
        let mut effects = Vec::new();
        {
            let (mut ctx, groups) = self.split();
            if let Some(group) = groups.get_mut(&gid) {
                group.master_document_loaded(&mut ctx, host, success, &mut effects);
            }
        }
        self.apply_effects(gid, effects);
    }

    /// A cache host was destroyed: detach it everywhere, cancel its prompts,
    /// and abort updates nobody is interested in anymore.
    pub fn host_destructed(&mut self, host: HostId) {
        self.prompts.cancel_host(host);
        self.host_index.remove(&host);

        let gids: Vec<GroupId> = self.groups.keys().copied().collect();
        for gid in gids {
            let mut effects = Vec::new();
            {
                let (mut ctx, groups) = self.split();
                if let Some(group) = groups.get_mut(&gid) {
                    let uninterested = group.host_destructed(&mut ctx, host, &mut effects);
                    if uninterested && group.state() != GroupState::Idle {
                        debug!(group = gid.raw(), "No interested hosts left, aborting update");
                        group.abort_update(&mut ctx, &mut effects);
                    }
                }
            }
            self.apply_effects(gid, effects);
        }
        self.hosts.remove(&host);
    }

    // ==================== Selection & network model ====================

    /// Pick the most appropriate cache for a navigation: a master/manifest
    /// match first, then the referrer's context, then the resource index
    /// validated for origin and foreignness. On a hit the host is attached.
    pub fn select_cache_for_navigation(
        &mut self,
        host: HostId,
        url: &Url,
        document_manifest: Option<&Url>,
        referrer_context: Option<&ContextId>,
    ) -> NavigationSelection {
        let mut candidate: Option<(GroupId, CacheId)> = None;

        if let Some(&gid) = self.master_index.get(url) {
            self.materialize_group(gid);
            candidate = self.newest_complete(gid).filter(|(g, c)| {
                !self
                    .groups
                    .get(g)
                    .and_then(|grp| grp.cache(*c))
                    .is_some_and(|cache| cache.is_foreign(url))
            });
        }
        if candidate.is_none() {
            if let Some(manifest) = document_manifest {
                if let Some(&gid) = self.manifest_index.get(manifest) {
                    self.materialize_group(gid);
                    candidate = self.newest_complete(gid);
                }
            }
        }
        if candidate.is_none() {
            candidate = referrer_context
                .and_then(|c| self.context_index.get(c).copied())
                .filter(|(g, c)| {
                    self.groups
                        .get(g)
                        .and_then(|grp| grp.cache(*c))
                        .is_some_and(|cache| cache.is_complete())
                });
        }
        if candidate.is_none() {
            candidate = self.resource_index.get(url).copied().filter(|(gid, cid)| {
                let Some(group) = self.groups.get(gid) else {
                    return false;
                };
                let Some(cache) = group.cache(*cid) else {
                    return false;
                };
                cache.is_complete()
                    && same_origin(group.manifest_url(), url)
                    && !cache.is_foreign(url)
            });
        }

        let Some((gid, cid)) = candidate else {
            return NavigationSelection::NoCache;
        };

        if let Some(named) = document_manifest {
            let mismatched = self
                .groups
                .get(&gid)
                .is_some_and(|g| g.manifest_url() != named);
            if mismatched {
                // Loaded under the wrong manifest: exclude the document from
                // this cache forever and reload it from the network.
                if let Some(cache) = self.groups.get_mut(&gid).and_then(|g| g.cache_mut(cid)) {
                    cache.mark_foreign(url);
                }
                warn!(url = %url, "Document is foreign to the selected cache");
                return NavigationSelection::ReloadFromNetwork;
            }
        }

        if let Some(cache) = self.groups.get_mut(&gid).and_then(|g| g.cache_mut(cid)) {
            cache.attach_host(host);
        }
        self.host_index.insert(host, (gid, cid));
        debug!(host = host.raw(), url = %url, cache = cid.raw(), "Cache selected for navigation");
        NavigationSelection::Cache {
            group: gid,
            cache: cid,
        }
    }

    /// The fetch-time decision for a resource request issued by `host`.
    pub fn check_network_model(
        &mut self,
        host: HostId,
        url: &Url,
        method: &str,
    ) -> NetworkDecision {
        let Some(&(gid, cid)) = self.host_index.get(&host) else {
            return NetworkDecision::LoadNormally;
        };
        let Some(group) = self.groups.get_mut(&gid) else {
            return NetworkDecision::LoadNormally;
        };
        let manifest_scheme = group.manifest_url().scheme().to_string();
        let Some(cache) = group.cache_mut(cid) else {
            return NetworkDecision::LoadNormally;
        };

        // Cache rules only apply once the snapshot is complete.
        if !cache.is_complete() {
            return NetworkDecision::LoadNormally;
        }
        if !method.eq_ignore_ascii_case("GET") {
            return NetworkDecision::LoadNormally;
        }
        if url.scheme() != manifest_scheme {
            return NetworkDecision::LoadNormally;
        }
        if cache.is_cached(url) {
            return NetworkDecision::ServeFromCache;
        }
        if cache.is_whitelisted(url) {
            return NetworkDecision::LoadFromNetwork;
        }
        if let Some(target) = cache.match_fallback(url).cloned() {
            // One network attempt, then the fallback body on every later
            // attempt for the same resource.
            return if cache.latch_fallback(url) {
                NetworkDecision::ServeFallback(target)
            } else {
                NetworkDecision::LoadFromNetwork
            };
        }
        if cache.online_whitelist_open() {
            return NetworkDecision::LoadFromNetwork;
        }
        NetworkDecision::FailLoad
    }

    // ==================== Storage management ====================

    /// Installed groups with a complete cache, for a settings surface.
    pub fn installed_groups(&self) -> Vec<StoredGroupInfo> {
        let mut groups: Vec<StoredGroupInfo> = self
            .groups
            .values()
            .filter(|g| !g.is_obsolete())
            .filter_map(|g| {
                let size_kb = match g.stub() {
                    Some(stub) => stub.size_kb,
                    None => g.newest_complete_cache()?.disk_size_kb(),
                };
                Some(StoredGroupInfo {
                    manifest_url: g.manifest_url().clone(),
                    size_kb,
                })
            })
            .collect();
        groups.sort_by(|a, b| a.manifest_url.as_str().cmp(b.manifest_url.as_str()));
        groups
    }

    /// Delete one group: abort its update, drop its storage, rewrite the
    /// persisted state. Returns whether a group existed.
    pub fn delete_group(&mut self, manifest_url: &Url) -> Result<bool> {
        let gid = self
            .manifest_index
            .get(manifest_url)
            .or_else(|| self.obsolete_index.get(manifest_url))
            .copied();
        let Some(gid) = gid else {
            return Ok(false);
        };

        let mut effects = Vec::new();
        {
            let (mut ctx, groups) = self.split();
            if let Some(group) = groups.get_mut(&gid) {
                group.abort_update(&mut ctx, &mut effects);
            }
        }
        self.apply_effects(gid, effects);

        if let Some(group) = self.groups.get(&gid) {
            let contexts: Vec<ContextId> =
                group.versions().iter().map(|c| c.context().clone()).collect();
            for context in &contexts {
                self.transport.delete_context(context);
            }
            self.destroy_group(gid);
        }
        info!(url = %manifest_url, "Cache group deleted");
        self.persist()?;
        Ok(true)
    }

    /// Delete every group.
    pub fn delete_all(&mut self) -> Result<()> {
        let urls: Vec<Url> = self
            .manifest_index
            .keys()
            .chain(self.obsolete_index.keys())
            .cloned()
            .collect();
        for url in urls {
            self.delete_group(&url)?;
        }
        Ok(())
    }

    // ==================== Persistence ====================

    /// Load persisted records as unloaded group stubs. Storage contexts stay
    /// closed until first access materializes them.
    pub fn load_persisted(&mut self) -> Result<usize> {
        let Some(path) = self.store_path.clone() else {
            return Ok(0);
        };
        if !path.exists() {
            return Ok(0);
        }
        let records = store::load(&path)?;
        let mut count = 0;
        for record in records {
            if record.master_urls.is_empty() {
                continue;
            }
            let Ok(manifest_url) = Url::parse(&record.manifest_url) else {
                warn!(url = %record.manifest_url, "Skipping record with invalid manifest URL");
                continue;
            };
            if self.manifest_index.contains_key(&manifest_url) {
                continue;
            }
            let master_urls: Vec<Url> = record
                .master_urls
                .iter()
                .filter_map(|u| Url::parse(u).ok())
                .collect();
            let stub = StubInfo {
                storage_location: record.storage_location,
                size_kb: record.size_kb,
                quota_kb: record.quota_kb,
                master_urls: master_urls.clone(),
            };
            let group =
                CacheGroup::from_stub(manifest_url.clone(), stub, self.config.default_quota_kb);
            let gid = group.id();
            for url in master_urls {
                self.master_index.insert(url, gid);
            }
            self.manifest_index.insert(manifest_url, gid);
            self.groups.insert(gid, group);
            count += 1;
        }
        info!(groups = count, "Persisted registry loaded");
        Ok(count)
    }

    /// Rewrite the persisted record list and prune unreferenced storage
    /// locations. Groups without masters are skipped.
    pub fn persist(&self) -> Result<()> {
        let Some(path) = &self.store_path else {
            return Ok(());
        };
        let mut records = Vec::new();
        for group in self.groups.values() {
            if group.is_obsolete() {
                continue;
            }
            if let Some(stub) = group.stub() {
                // Unmaterialized groups keep their persisted shape.
                records.push(store::GroupRecord {
                    manifest_url: group.manifest_url().to_string(),
                    storage_location: stub.storage_location.clone(),
                    size_kb: stub.size_kb,
                    quota_kb: stub.quota_kb,
                    master_urls: stub.master_urls.iter().map(|u| u.to_string()).collect(),
                });
                continue;
            }
            let Some(cache) = group.newest_complete_cache() else {
                continue;
            };
            let mut master_urls: Vec<String> =
                cache.master_urls().map(|u| u.to_string()).collect();
            if master_urls.is_empty() {
                continue;
            }
            master_urls.sort();
            records.push(store::GroupRecord {
                manifest_url: group.manifest_url().to_string(),
                storage_location: cache.context().location().to_string(),
                size_kb: cache.disk_size_kb(),
                quota_kb: Some(group.disk_quota_kb())
                    .filter(|q| *q != self.config.default_quota_kb),
                master_urls,
            });
        }
        records.sort_by(|a, b| a.manifest_url.cmp(&b.manifest_url));
        store::save(path, &records)
    }

    // ==================== Internals ====================

    fn split(&mut self) -> (EngineCtx<'_>, &mut HashMap<GroupId, CacheGroup>) {
        (
            EngineCtx {
                transport: self.transport.as_mut(),
                timers: self.timers.as_mut(),
                hosts: &mut self.hosts,
                prompts: &mut self.prompts,
                config: &self.config,
                fetch_index: &mut self.fetch_index,
                events: &self.events,
            },
            &mut self.groups,
        )
    }

    fn apply_effects(&mut self, gid: GroupId, effects: Vec<GroupEffect>) {
        let mut restarts = Vec::new();
        let mut persist = false;
        let mut destroy = false;

        for effect in effects {
            match effect {
                GroupEffect::CacheCompleted { cache } => {
                    self.index_completed_cache(gid, cache);
                }
                GroupEffect::AssociateHost { host, cache } => {
                    self.host_index.insert(host, (gid, cache));
                }
                GroupEffect::DetachHost { host } => {
                    if self.host_index.get(&host).is_some_and(|(g, _)| *g == gid) {
                        self.host_index.remove(&host);
                    }
                }
                GroupEffect::MasterRegistered { url } => {
                    self.master_index.insert(url, gid);
                }
                GroupEffect::MasterUnregistered { url } => {
                    if self.master_index.get(&url) == Some(&gid) {
                        self.master_index.remove(&url);
                    }
                }
                GroupEffect::GroupObsoleted => {
                    if let Some(group) = self.groups.get(&gid) {
                        let url = group.manifest_url().clone();
                        if self.manifest_index.get(&url) == Some(&gid) {
                            self.manifest_index.remove(&url);
                        }
                        self.obsolete_index.insert(url, gid);
                    }
                }
                GroupEffect::SelfDestruct => destroy = true,
                GroupEffect::PersistState => persist = true,
                GroupEffect::Restart { host, master } => restarts.push((host, master)),
            }
        }

        if destroy {
            self.destroy_group(gid);
        }
        if persist {
            if let Err(err) = self.persist() {
                warn!(error = %err, "Failed to persist registry state");
            }
        }
        for (host, master) in restarts {
            let Some(group) = self.groups.get(&gid) else {
                continue;
            };
            let url = group.manifest_url().clone();
            // Restart arguments must still be alive.
            let host = host.filter(|h| self.hosts.contains_key(h));
            let master = master.filter(|(_, h)| self.hosts.contains_key(h));
            self.start_update(host, &url, master);
        }
    }

    /// Register a freshly completed cache in the master, resource, and
    /// context indexes.
    fn index_completed_cache(&mut self, gid: GroupId, cache_id: CacheId) {
        let Some(cache) = self.groups.get(&gid).and_then(|g| g.cache(cache_id)) else {
            return;
        };
        let context = cache.context().clone();
        let governed: Vec<Url> = cache
            .entry_urls()
            .filter(|url| cache.entry(url).is_some_and(|e| e.cache_governed))
            .cloned()
            .collect();
        let masters: Vec<Url> = cache.master_urls().cloned().collect();

        self.context_index.insert(context, (gid, cache_id));
        for url in governed {
            self.resource_index.insert(url, (gid, cache_id));
        }
        for url in masters {
            self.master_index.insert(url.clone(), gid);
            self.resource_index.insert(url, (gid, cache_id));
        }
    }

    fn materialize_group(&mut self, gid: GroupId) {
        let Some(group) = self.groups.get_mut(&gid) else {
            return;
        };
        let Some(cache) = group.materialize() else {
            return;
        };
        let cache_id = cache.id();
        let context = cache.context().clone();
        let masters: Vec<Url> = cache.master_urls().cloned().collect();

        self.context_index.insert(context, (gid, cache_id));
        for url in masters {
            self.master_index.insert(url.clone(), gid);
            self.resource_index.insert(url, (gid, cache_id));
        }
    }

    fn destroy_group(&mut self, gid: GroupId) {
        if let Some(group) = self.groups.remove(&gid) {
            debug!(group = gid.raw(), url = %group.manifest_url(), "Cache group destroyed");
        }
        self.manifest_index.retain(|_, g| *g != gid);
        self.obsolete_index.retain(|_, g| *g != gid);
        self.master_index.retain(|_, g| *g != gid);
        self.resource_index.retain(|_, (g, _)| *g != gid);
        self.context_index.retain(|_, (g, _)| *g != gid);
        self.host_index.retain(|_, (g, _)| *g != gid);
        self.fetch_index.retain(|_, g| *g != gid);
    }
}

/// Same-origin: scheme, host, and port all equal.
fn same_origin(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme()
        && a.host_str() == b.host_str()
        && a.port_or_known_default() == b.port_or_known_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{Harness, ScriptedResponse};
    use crate::{PromptAnswer, TimerKind};

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn manifest_url() -> Url {
        url("https://example.com/app.manifest")
    }

    fn app_js() -> Url {
        url("https://example.com/app.js")
    }

    fn index_html() -> Url {
        url("https://example.com/index.html")
    }

    const MANIFEST_V1: &str = "CACHE MANIFEST\n# v1\n/app.js\n";
    const MANIFEST_V2: &str = "CACHE MANIFEST\n# v2\n/app.js\n";

    /// Script a full successful first install: manifest, entry body, and the
    /// byte-compare re-fetch answering 304.
    fn script_install(h: &Harness) {
        h.transport.script(
            &manifest_url(),
            ScriptedResponse::manifest(MANIFEST_V1).with_etag("v1"),
        );
        h.transport
            .script(&app_js(), ScriptedResponse::ok("application/javascript", b"app body"));
        h.transport
            .script(&manifest_url(), ScriptedResponse::not_modified());
    }

    /// Run the install to completion for a master document on `host`.
    fn install(h: &mut Harness, host: crate::HostId) {
        script_install(h);
        h.transport
            .seed_body(&ContextId::default_context(), &index_html(), 2048);
        h.registry
            .start_update(Some(host), &manifest_url(), Some((index_html(), host)));
        h.registry.master_document_loaded(host, true);
        h.pump();
    }

    #[test]
    fn test_cache_attempt_installs_first_version() {
        let mut h = Harness::new();
        let (host, events) = h.add_host();
        install(&mut h, host);

        let recorded = events.lock().unwrap();
        assert!(recorded.contains(&HostEvent::Checking));
        assert!(recorded.contains(&HostEvent::Downloading));
        assert!(recorded
            .iter()
            .any(|e| matches!(e, HostEvent::Progress { .. })));
        assert_eq!(recorded.last(), Some(&HostEvent::Cached));
        drop(recorded);

        let group = h.registry.group_for_manifest(&manifest_url()).unwrap();
        assert_eq!(group.versions().len(), 1);
        let cache = group.newest_complete_cache().unwrap();
        assert!(cache.is_cached(&app_js()));
        // Scenario D: the master document is served even though the
        // manifest never listed it.
        assert!(cache.is_cached(&index_html()));

        assert_eq!(
            h.registry.check_network_model(host, &app_js(), "GET"),
            NetworkDecision::ServeFromCache
        );
        assert_eq!(
            h.registry.check_network_model(host, &index_html(), "GET"),
            NetworkDecision::ServeFromCache
        );
    }

    #[test]
    fn test_manifest_gone_obsoletes_group() {
        let mut h = Harness::new();
        let (host, events) = h.add_host();

        h.transport
            .script(&manifest_url(), ScriptedResponse::status(404));
        h.registry
            .start_update(Some(host), &manifest_url(), Some((index_html(), host)));
        h.pump();

        let recorded = events.lock().unwrap();
        assert!(recorded.contains(&HostEvent::Obsolete));
        drop(recorded);

        // The group had no versions: destroyed outright, no cache created.
        assert!(h.registry.group_for_manifest(&manifest_url()).is_none());
        assert!(h.registry.installed_groups().is_empty());
    }

    #[test]
    fn test_unchanged_manifest_fires_noupdate() {
        let mut h = Harness::new();
        let (host, events) = h.add_host();
        install(&mut h, host);
        events.lock().unwrap().clear();

        // Upgrade check: the conditional fetch answers 304.
        h.transport
            .script(&manifest_url(), ScriptedResponse::not_modified());
        h.registry.start_update(Some(host), &manifest_url(), None);
        h.pump();

        let recorded = events.lock().unwrap();
        assert!(recorded.contains(&HostEvent::Checking));
        assert_eq!(recorded.last(), Some(&HostEvent::NoUpdate));
        drop(recorded);

        let group = h.registry.group_for_manifest(&manifest_url()).unwrap();
        assert_eq!(group.versions().len(), 1, "no new version appended");
    }

    #[test]
    fn test_failed_entry_preserves_previous_version() {
        let mut h = Harness::new();
        let (host, events) = h.add_host();
        install(&mut h, host);
        events.lock().unwrap().clear();

        h.transport.script(
            &manifest_url(),
            ScriptedResponse::manifest(MANIFEST_V2).with_etag("v2"),
        );
        h.transport.script(&app_js(), ScriptedResponse::status(500));
        h.registry.start_update(Some(host), &manifest_url(), None);
        h.pump();

        let recorded = events.lock().unwrap();
        assert_eq!(recorded.last(), Some(&HostEvent::Error));
        drop(recorded);

        // Only the complete version survives and still serves.
        let group = h.registry.group_for_manifest(&manifest_url()).unwrap();
        assert_eq!(group.versions().len(), 1);
        assert!(group.versions()[0].is_complete());
        assert_eq!(
            h.registry.check_network_model(host, &app_js(), "GET"),
            NetworkDecision::ServeFromCache
        );
    }

    #[test]
    fn test_quota_pause_and_resume() {
        let config = UpdateConfig::default().with_default_quota_kb(1);
        let mut h = Harness::with_config(config);
        h.policy.set_quota_answer(PromptAnswer::NewQuota(64));
        let (host, events) = h.add_host();

        let body = vec![b'x'; 2000];
        h.transport.script(
            &manifest_url(),
            ScriptedResponse::manifest(MANIFEST_V1).with_etag("v1"),
        );
        // First attempt trips the quota mid-body; the retry after the grant
        // succeeds.
        h.transport.script(
            &app_js(),
            ScriptedResponse::ok("application/javascript", &body).with_chunk_size(512),
        );
        h.transport
            .script(&app_js(), ScriptedResponse::ok("application/javascript", &body));
        h.transport
            .script(&manifest_url(), ScriptedResponse::not_modified());

        h.transport
            .seed_body(&ContextId::default_context(), &index_html(), 100);
        h.registry
            .start_update(Some(host), &manifest_url(), Some((index_html(), host)));
        h.registry.master_document_loaded(host, true);
        h.pump();

        assert!(h
            .policy
            .asked()
            .iter()
            .any(|k| matches!(k, PromptKind::IncreaseQuota { current_quota_kb: 1 })));
        assert_eq!(events.lock().unwrap().last(), Some(&HostEvent::Cached));

        let group = h.registry.group_for_manifest(&manifest_url()).unwrap();
        assert_eq!(group.disk_quota_kb(), 64);
        assert!(group.newest_complete_cache().unwrap().is_cached(&app_js()));
    }

    #[test]
    fn test_concurrent_start_update_coalesces() {
        let mut h = Harness::new();
        let (host, _) = h.add_host();

        h.transport.script(
            &manifest_url(),
            ScriptedResponse::manifest(MANIFEST_V1).with_etag("v1"),
        );
        h.registry.start_update(Some(host), &manifest_url(), None);
        h.registry.start_update(Some(host), &manifest_url(), None);

        // One manifest fetch despite two requests.
        assert_eq!(h.transport.fetch_count(&manifest_url()), 1);
    }

    #[test]
    fn test_swap_cache_moves_host_to_newest() {
        let mut h = Harness::new();
        let (host, events) = h.add_host();
        install(&mut h, host);
        let old_cache = h.registry.cache_for_host(host).unwrap().id();
        events.lock().unwrap().clear();

        // An upgrade produces a second version.
        h.transport.script(
            &manifest_url(),
            ScriptedResponse::manifest(MANIFEST_V2).with_etag("v2"),
        );
        h.transport
            .script(&app_js(), ScriptedResponse::ok("application/javascript", b"app v2"));
        h.transport
            .script(&manifest_url(), ScriptedResponse::not_modified());
        h.registry.start_update(Some(host), &manifest_url(), None);
        h.pump();

        assert_eq!(events.lock().unwrap().last(), Some(&HostEvent::UpdateReady));
        // Still on the old version until the swap.
        assert_eq!(h.registry.cache_for_host(host).unwrap().id(), old_cache);

        h.registry.swap_cache(host).unwrap();
        let new_cache = h.registry.cache_for_host(host).unwrap().id();
        assert_ne!(new_cache, old_cache);

        assert!(matches!(
            h.registry.swap_cache(host),
            Err(EngineError::AlreadyNewest)
        ));
    }

    #[test]
    fn test_foreign_document_forces_network_reload() {
        let mut h = Harness::new();
        let (host, _) = h.add_host();
        install(&mut h, host);

        // A second host navigates to the cached master but its document
        // names a different manifest.
        let (host2, _) = h.add_host();
        let other_manifest = url("https://example.com/other.manifest");
        let selection = h.registry.select_cache_for_navigation(
            host2,
            &index_html(),
            Some(&other_manifest),
            None,
        );
        assert_eq!(selection, NavigationSelection::ReloadFromNetwork);

        // Foreign entries are never picked by later navigations.
        let (host3, _) = h.add_host();
        let selection = h
            .registry
            .select_cache_for_navigation(host3, &index_html(), None, None);
        assert_eq!(selection, NavigationSelection::NoCache);
    }

    #[test]
    fn test_selection_via_resource_index_checks_origin() {
        let mut h = Harness::new();
        let (host, _) = h.add_host();
        install(&mut h, host);

        // Same-origin resource-index hit selects and attaches.
        let (host2, _) = h.add_host();
        let selection = h
            .registry
            .select_cache_for_navigation(host2, &app_js(), None, None);
        assert!(matches!(selection, NavigationSelection::Cache { .. }));
        assert!(h.registry.cache_for_host(host2).is_some());
    }

    #[test]
    fn test_network_model_rules() {
        let mut h = Harness::new();
        let (host, _) = h.add_host();

        let manifest = "CACHE MANIFEST\n/app.js\nNETWORK:\n/api/\nFALLBACK:\n/articles/ /offline.html\n";
        h.transport.script(
            &manifest_url(),
            ScriptedResponse::manifest(manifest).with_etag("v1"),
        );
        h.transport
            .script(&app_js(), ScriptedResponse::ok("application/javascript", b"app"));
        h.transport.script(
            &url("https://example.com/offline.html"),
            ScriptedResponse::ok("text/html", b"offline"),
        );
        h.transport
            .script(&manifest_url(), ScriptedResponse::not_modified());
        h.transport
            .seed_body(&ContextId::default_context(), &index_html(), 100);
        h.registry
            .start_update(Some(host), &manifest_url(), Some((index_html(), host)));
        h.registry.master_document_loaded(host, true);
        h.pump();

        assert_eq!(
            h.registry.check_network_model(host, &app_js(), "GET"),
            NetworkDecision::ServeFromCache
        );
        assert_eq!(
            h.registry
                .check_network_model(host, &url("https://example.com/api/v1"), "GET"),
            NetworkDecision::LoadFromNetwork
        );
        // Fallback: one network attempt, then the fallback body.
        let article = url("https://example.com/articles/a.html");
        assert_eq!(
            h.registry.check_network_model(host, &article, "GET"),
            NetworkDecision::LoadFromNetwork
        );
        assert_eq!(
            h.registry.check_network_model(host, &article, "GET"),
            NetworkDecision::ServeFallback(url("https://example.com/offline.html"))
        );
        // No wildcard: unlisted same-scheme resources fail.
        assert_eq!(
            h.registry
                .check_network_model(host, &url("https://example.com/unlisted.png"), "GET"),
            NetworkDecision::FailLoad
        );
        // Non-GET and unassociated hosts load normally.
        assert_eq!(
            h.registry.check_network_model(host, &app_js(), "POST"),
            NetworkDecision::LoadNormally
        );
        let (other, _) = h.add_host();
        assert_eq!(
            h.registry.check_network_model(other, &app_js(), "GET"),
            NetworkDecision::LoadNormally
        );
    }

    #[test]
    fn test_host_teardown_aborts_unwanted_update() {
        let mut h = Harness::new();
        let (host, _) = h.add_host();

        h.transport.script(
            &manifest_url(),
            ScriptedResponse::manifest(MANIFEST_V1).with_etag("v1"),
        );
        h.registry
            .start_update(Some(host), &manifest_url(), Some((index_html(), host)));

        // The only interested host dies before the update progresses.
        h.registry.host_destructed(host);
        h.pump();

        assert!(h.registry.group_for_manifest(&manifest_url()).is_none());
    }

    #[test]
    fn test_persist_and_reload_as_stub() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");

        let mut h = Harness::new();
        h.registry.set_store_path(path.clone());
        let (host, _) = h.add_host();
        install(&mut h, host);
        assert!(path.exists());

        // A fresh registry reloads the record as an unloaded stub.
        let mut h2 = Harness::new();
        h2.registry.set_store_path(path);
        assert_eq!(h2.registry.load_persisted().unwrap(), 1);

        let group = h2.registry.group_for_manifest(&manifest_url()).unwrap();
        assert!(group.is_stub());
        assert_eq!(h2.registry.installed_groups().len(), 1);

        // First access materializes and serves the master.
        let (host2, _) = h2.add_host();
        let selection = h2
            .registry
            .select_cache_for_navigation(host2, &index_html(), None, None);
        assert!(matches!(selection, NavigationSelection::Cache { .. }));
        assert_eq!(
            h2.registry.check_network_model(host2, &index_html(), "GET"),
            NetworkDecision::ServeFromCache
        );
    }

    #[test]
    fn test_update_for_host_asks_policy_first() {
        let mut h = Harness::new();
        let (host, events) = h.add_host();
        install(&mut h, host);
        events.lock().unwrap().clear();

        h.transport
            .script(&manifest_url(), ScriptedResponse::not_modified());
        h.registry.update_for_host(host).unwrap();
        h.pump();

        assert!(h
            .policy
            .asked()
            .iter()
            .any(|k| matches!(k, PromptKind::CheckForUpdate)));
        assert_eq!(events.lock().unwrap().last(), Some(&HostEvent::NoUpdate));
    }

    #[test]
    fn test_delete_group_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");

        let mut h = Harness::new();
        h.registry.set_store_path(path);
        let (host, _) = h.add_host();
        install(&mut h, host);
        assert_eq!(h.registry.installed_groups().len(), 1);

        assert!(h.registry.delete_group(&manifest_url()).unwrap());
        assert!(h.registry.installed_groups().is_empty());
        assert!(h.registry.group_for_manifest(&manifest_url()).is_none());
        assert_eq!(
            h.registry.check_network_model(host, &app_js(), "GET"),
            NetworkDecision::LoadNormally
        );
        assert!(!h.registry.delete_group(&manifest_url()).unwrap());
    }

    #[test]
    fn test_changed_refetch_schedules_restart() {
        let mut h = Harness::new();
        let (host, events) = h.add_host();
        install(&mut h, host);
        events.lock().unwrap().clear();

        // Upgrade whose manifest changes between the two fetches.
        h.transport.script(
            &manifest_url(),
            ScriptedResponse::manifest(MANIFEST_V2).with_etag("v2"),
        );
        h.transport
            .script(&app_js(), ScriptedResponse::ok("application/javascript", b"app v2"));
        h.transport.script(
            &manifest_url(),
            ScriptedResponse::manifest("CACHE MANIFEST\n# v3\n/app.js\n").with_etag("v3"),
        );
        h.registry.start_update(Some(host), &manifest_url(), None);
        h.pump();

        assert_eq!(events.lock().unwrap().last(), Some(&HostEvent::Error));
        let (group, kind, generation, _) = h.timers.last_scheduled().expect("restart scheduled");
        assert_eq!(kind, TimerKind::Restart);

        // The retry after the delay succeeds.
        h.transport.script(
            &manifest_url(),
            ScriptedResponse::manifest(MANIFEST_V2).with_etag("v2"),
        );
        h.transport
            .script(&app_js(), ScriptedResponse::ok("application/javascript", b"app v2"));
        h.transport
            .script(&manifest_url(), ScriptedResponse::not_modified());
        h.registry.handle_event(EngineEvent::Timer {
            group,
            kind,
            generation,
        });
        h.pump();

        assert_eq!(events.lock().unwrap().last(), Some(&HostEvent::UpdateReady));
        let group = h.registry.group_for_manifest(&manifest_url()).unwrap();
        assert_eq!(group.versions().len(), 2);
    }

    #[test]
    fn test_master_racing_mid_download_joins_cache() {
        let mut h = Harness::new();
        let (host, _) = h.add_host();
        let (host2, events2) = h.add_host();

        script_install(&h);
        h.transport
            .seed_body(&ContextId::default_context(), &index_html(), 2048);
        h.registry.start_update(Some(host), &manifest_url(), None);

        // Drain until the download phase, so the new version already exists.
        while h.step() {
            let downloading = h
                .registry
                .group_for_manifest(&manifest_url())
                .is_some_and(|g| g.state() == GroupState::Downloading);
            if downloading {
                break;
            }
        }

        // A document navigates against the same manifest while entries are
        // still downloading.
        h.registry
            .start_update(Some(host2), &manifest_url(), Some((index_html(), host2)));
        h.registry.master_document_loaded(host2, true);
        h.pump();

        assert_eq!(events2.lock().unwrap().last(), Some(&HostEvent::Cached));
        let cache = h
            .registry
            .cache_for_host(host2)
            .expect("late master attached to the new version");
        assert!(cache.is_cached(&index_html()));
    }

    #[test]
    fn test_selection_isolated_per_origin() {
        let mut h = Harness::new();
        let (host, _) = h.add_host();
        install(&mut h, host);

        // A second app on a different origin caching the same path.
        let other_manifest = url("https://other.net/app.manifest");
        let other_js = url("https://other.net/app.js");
        h.transport.script(
            &other_manifest,
            ScriptedResponse::manifest(MANIFEST_V1).with_etag("v1"),
        );
        h.transport
            .script(&other_js, ScriptedResponse::ok("application/javascript", b"other"));
        h.transport
            .script(&other_manifest, ScriptedResponse::not_modified());
        let (host2, _) = h.add_host();
        h.registry.start_update(Some(host2), &other_manifest, None);
        h.pump();

        let example_gid = h.registry.group_for_manifest(&manifest_url()).unwrap().id();
        let other_gid = h.registry.group_for_manifest(&other_manifest).unwrap().id();

        // Resource-index selection resolves each URL to the group of its
        // own origin, never the other one.
        let (host3, _) = h.add_host();
        match h
            .registry
            .select_cache_for_navigation(host3, &other_js, None, None)
        {
            NavigationSelection::Cache { group, .. } => assert_eq!(group, other_gid),
            other => panic!("expected a cache hit, got {other:?}"),
        }
        let (host4, _) = h.add_host();
        match h
            .registry
            .select_cache_for_navigation(host4, &app_js(), None, None)
        {
            NavigationSelection::Cache { group, .. } => assert_eq!(group, example_gid),
            other => panic!("expected a cache hit, got {other:?}"),
        }

        // The first origin's entries never leak into the other group.
        assert_eq!(
            h.registry.check_network_model(host3, &app_js(), "GET"),
            NetworkDecision::FailLoad
        );
    }

    #[test]
    fn test_watchdog_fails_stalled_manifest_fetch() {
        let mut h = Harness::new();
        let (host, events) = h.add_host();

        // No response ever arrives for the manifest.
        h.registry
            .start_update(Some(host), &manifest_url(), Some((index_html(), host)));
        let (group, kind, generation, delay) =
            h.timers.last_scheduled().expect("watchdog scheduled");
        assert_eq!(kind, TimerKind::Watchdog);
        assert_eq!(delay, UpdateConfig::default().response_timeout);

        h.registry.handle_event(EngineEvent::Timer {
            group,
            kind,
            generation,
        });
        h.pump();

        assert_eq!(events.lock().unwrap().last(), Some(&HostEvent::Error));
        // Cache attempt with nothing stored: the group self-destructed.
        assert!(h.registry.group_for_manifest(&manifest_url()).is_none());
    }

    #[test]
    fn test_watchdog_fails_stalled_entry_download() {
        let mut h = Harness::new();
        let (host, events) = h.add_host();

        h.transport.script(
            &manifest_url(),
            ScriptedResponse::manifest(MANIFEST_V1).with_etag("v1"),
        );
        h.transport
            .script(&app_js(), ScriptedResponse::ok("application/javascript", b"app body"));
        h.registry
            .start_update(Some(host), &manifest_url(), Some((index_html(), host)));

        // Stop right as the entry download begins, before its events land.
        while h.step() {
            let downloading = h
                .registry
                .group_for_manifest(&manifest_url())
                .is_some_and(|g| g.state() == GroupState::Downloading);
            if downloading {
                break;
            }
        }
        let (group, kind, generation, _) = h.timers.last_scheduled().expect("watchdog scheduled");
        assert_eq!(kind, TimerKind::Watchdog);

        h.registry.handle_event(EngineEvent::Timer {
            group,
            kind,
            generation,
        });
        h.pump();

        // First attempt with no fallback version: the entry failure fails
        // the whole attempt.
        assert_eq!(events.lock().unwrap().last(), Some(&HostEvent::Error));
        assert!(h.registry.group_for_manifest(&manifest_url()).is_none());
    }

    #[test]
    fn test_unrelated_prompt_answer_ignored() {
        let mut h = Harness::new();
        let (host, events) = h.add_host();

        script_install(&h);
        h.transport
            .seed_body(&ContextId::default_context(), &index_html(), 2048);
        h.registry
            .start_update(Some(host), &manifest_url(), Some((index_html(), host)));
        h.registry.master_document_loaded(host, true);

        // An answer carrying a prompt id the engine never issued must not
        // resolve the install consent.
        h.registry.handle_event(EngineEvent::Prompt {
            id: crate::PromptId::next(),
            answer: PromptAnswer::Denied,
        });
        h.pump();

        assert_eq!(events.lock().unwrap().last(), Some(&HostEvent::Cached));
    }

    #[test]
    fn test_unrelated_host_teardown_leaves_update_running() {
        let mut h = Harness::new();
        let (host, _) = h.add_host();
        let (bystander, _) = h.add_host();

        script_install(&h);
        h.registry.start_update(Some(host), &manifest_url(), None);

        // A host with no ties to the group dies while the update is in
        // flight.
        h.registry.host_destructed(bystander);
        h.pump();

        let group = h
            .registry
            .group_for_manifest(&manifest_url())
            .expect("update survives an unrelated teardown");
        assert_eq!(group.versions().len(), 1);
        assert!(group.newest_complete_cache().is_some());
    }

    #[test]
    fn test_same_origin() {
        assert!(same_origin(
            &url("https://example.com/a"),
            &url("https://example.com:443/b")
        ));
        assert!(!same_origin(
            &url("https://example.com/a"),
            &url("http://example.com/a")
        ));
        assert!(!same_origin(
            &url("https://example.com/a"),
            &url("https://other.example.net/a")
        ));
    }
}
