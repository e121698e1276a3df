//! The cache group: owner of all cache versions for one manifest URL and the
//! update state machine that produces them.
//!
//! The machine is `Idle → Checking → Downloading → Idle`. Its continuation is
//! an explicit [`Phase`] tagged union driven by events delivered through the
//! registry; at most one update runs per group at any time, and a second
//! request while one is in flight only re-notifies the caller of the current
//! phase.

use std::collections::VecDeque;
use std::mem;

use cachekit_manifest::ManifestParser;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::Cache;
use crate::host::HostEvent;
use crate::policy::{PromptAnswer, PromptKind};
use crate::registry::EngineCtx;
use crate::transport::{FetchEvent, FetchRequest, Validators};
use crate::{CacheId, ContextId, FetchId, GroupId, HostId, PromptId, TimerKind};

// ==================== State ====================

/// Coarse update state, visible to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    Idle,
    /// Manifest (re)fetch in flight.
    Checking,
    /// Resource downloads and/or pending-master wait in flight.
    Downloading,
}

/// Whether the running update started with a prior complete cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptKind {
    /// No complete cache existed when the update began.
    Cache,
    /// A complete cache existed; this is an upgrade check.
    Upgrade,
}

/// A master document load racing the update, awaiting association with
/// whichever cache version results.
#[derive(Debug)]
struct PendingMaster {
    document_url: Url,
    host: HostId,
    associated: bool,
    /// `Some(success)` once the embedder reported the document load done.
    outcome: Option<bool>,
}

/// Arguments needed to re-run the whole update after a delayed restart.
#[derive(Debug, Clone)]
struct RestartArgs {
    host: Option<HostId>,
    master: Option<(Url, HostId)>,
}

struct ManifestFetch {
    fetch: FetchId,
    parser: Option<ManifestParser>,
    buffer: Vec<u8>,
    validators: Validators,
}

#[derive(Debug, Clone)]
struct DownloadItem {
    url: Url,
    /// Listed in the manifest (CACHE entry or fallback target), as opposed
    /// to a master entry carried over from the previous version.
    explicit: bool,
}

struct InFlight {
    item: DownloadItem,
    fetch: FetchId,
    received: u64,
}

struct DownloadState {
    queue: VecDeque<DownloadItem>,
    current: Option<InFlight>,
    loaded: usize,
    total: usize,
    downloaded_bytes: u64,
    /// Validators from the first manifest response, for the conditional
    /// byte-compare re-fetch.
    manifest_validators: Validators,
}

/// What happens once every pending master entry has resolved.
enum FollowUp {
    /// Manifest was unchanged: fire `noupdate`, no new version.
    NoUpdate,
    /// Fresh download finished: re-fetch the manifest for the byte compare.
    Refetch { validators: Validators },
}

struct Refetch {
    fetch: FetchId,
    hasher: Sha256,
    expected_hash: String,
    validators: Validators,
}

enum EntryFailure {
    Status(u16),
    Redirect,
    Network,
}

/// The explicit continuation of the update algorithm.
enum Phase {
    Idle,
    FetchingManifest(ManifestFetch),
    AwaitingConsent {
        prompt: PromptId,
        validators: Validators,
    },
    Downloading(DownloadState),
    AwaitingQuota {
        download: DownloadState,
        prompt: PromptId,
    },
    WaitingMasters {
        follow_up: FollowUp,
        failed_any: bool,
    },
    RefetchingManifest(Refetch),
}

/// Index-registration side effects a group hands back to the registry after
/// a state transition.
#[derive(Debug)]
pub(crate) enum GroupEffect {
    /// A cache version completed: register its entries and masters.
    CacheCompleted { cache: CacheId },
    /// A host attached to a cache: update the host index.
    AssociateHost { host: HostId, cache: CacheId },
    /// A host detached from its cache.
    DetachHost { host: HostId },
    /// A master URL now resolves to this group.
    MasterRegistered { url: Url },
    /// A master URL no longer resolves to this group.
    MasterUnregistered { url: Url },
    /// The manifest is gone; move the group to the obsolete table.
    GroupObsoleted,
    /// The group has no versions left and must be removed.
    SelfDestruct,
    /// Rewrite the persisted registry state.
    PersistState,
    /// A delayed restart is due: re-invoke `start_update` with these args.
    Restart {
        host: Option<HostId>,
        master: Option<(Url, HostId)>,
    },
}

/// Persisted shape of a group that has not been materialized yet.
#[derive(Debug, Clone)]
pub(crate) struct StubInfo {
    pub storage_location: String,
    pub size_kb: u64,
    pub quota_kb: Option<u64>,
    pub master_urls: Vec<Url>,
}

// ==================== CacheGroup ====================

/// All cache versions for one manifest URL, oldest first, append-only. At
/// most the last version may be incomplete.
pub struct CacheGroup {
    id: GroupId,
    manifest_url: Url,
    versions: Vec<Cache>,
    state: GroupState,
    phase: Phase,
    attempt: AttemptKind,
    pending_masters: Vec<PendingMaster>,
    disk_quota_kb: u64,
    obsolete: bool,
    restart: Option<RestartArgs>,
    restart_generation: u64,
    watchdog_generation: u64,
    stub: Option<StubInfo>,
}

impl CacheGroup {
    pub(crate) fn new(manifest_url: Url, default_quota_kb: u64) -> Self {
        Self {
            id: GroupId::next(),
            manifest_url,
            versions: Vec::new(),
            state: GroupState::Idle,
            phase: Phase::Idle,
            attempt: AttemptKind::Cache,
            pending_masters: Vec::new(),
            disk_quota_kb: default_quota_kb,
            obsolete: false,
            restart: None,
            restart_generation: 0,
            watchdog_generation: 0,
            stub: None,
        }
    }

    /// Reconstruct an unloaded group from a persisted record. The cache
    /// version is not built until [`CacheGroup::materialize`].
    pub(crate) fn from_stub(manifest_url: Url, stub: StubInfo, default_quota_kb: u64) -> Self {
        let quota = stub.quota_kb.unwrap_or(default_quota_kb);
        let mut group = Self::new(manifest_url, quota);
        group.stub = Some(stub);
        group
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn manifest_url(&self) -> &Url {
        &self.manifest_url
    }

    pub fn state(&self) -> GroupState {
        self.state
    }

    pub fn attempt(&self) -> AttemptKind {
        self.attempt
    }

    pub fn is_obsolete(&self) -> bool {
        self.obsolete
    }

    pub fn disk_quota_kb(&self) -> u64 {
        self.disk_quota_kb
    }

    pub fn versions(&self) -> &[Cache] {
        &self.versions
    }

    pub fn is_stub(&self) -> bool {
        self.stub.is_some()
    }

    pub(crate) fn stub(&self) -> Option<&StubInfo> {
        self.stub.as_ref()
    }

    /// Build the restored cache version from the stub record. Returns the
    /// new version for the registry to index, or `None` if already
    /// materialized.
    pub(crate) fn materialize(&mut self) -> Option<&Cache> {
        let stub = self.stub.take()?;
        debug!(group = self.id.raw(), url = %self.manifest_url, "Materializing stub group");
        let cache = Cache::restored(
            ContextId::from_location(stub.storage_location),
            stub.master_urls,
            stub.size_kb,
        );
        self.versions.push(cache);
        self.versions.last()
    }

    pub fn cache(&self, id: CacheId) -> Option<&Cache> {
        self.versions.iter().find(|c| c.id() == id)
    }

    pub(crate) fn cache_mut(&mut self, id: CacheId) -> Option<&mut Cache> {
        self.versions.iter_mut().find(|c| c.id() == id)
    }

    pub fn newest_cache(&self) -> Option<&Cache> {
        self.versions.last()
    }

    pub fn newest_complete_cache(&self) -> Option<&Cache> {
        self.versions.iter().rev().find(|c| c.is_complete())
    }

    pub(crate) fn newest_complete_cache_mut(&mut self) -> Option<&mut Cache> {
        self.versions.iter_mut().rev().find(|c| c.is_complete())
    }

    pub(crate) fn find_cache_by_context(&self, context: &ContextId) -> Option<&Cache> {
        self.versions.iter().find(|c| c.context() == context)
    }

    /// Whether any host still cares about this group's update.
    pub(crate) fn has_interested_hosts(&self) -> bool {
        !self.pending_masters.is_empty() || self.versions.iter().any(|c| c.host_count() > 0)
    }

    pub(crate) fn has_pending_host(&self, host: HostId) -> bool {
        self.pending_masters.iter().any(|p| p.host == host)
    }

    // ==================== Entry point ====================

    /// Start (or coalesce into) an update. `master` enqueues a pending
    /// master entry for a document racing the update.
    pub(crate) fn start_update(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        host: Option<HostId>,
        master: Option<(Url, HostId)>,
        _effects: &mut Vec<GroupEffect>,
    ) {
        if self.obsolete {
            for h in host.iter().chain(master.iter().map(|(_, h)| h)) {
                self.notify_one(ctx, *h, HostEvent::Error);
            }
            return;
        }

        if let Some((url, mhost)) = &master {
            let already = self
                .pending_masters
                .iter()
                .any(|p| p.document_url == *url && p.host == *mhost);
            if !already {
                // A run past manifest processing already has its version in
                // place; a master racing in late joins it directly.
                let associated = !matches!(self.phase, Phase::Idle | Phase::FetchingManifest(_));
                self.pending_masters.push(PendingMaster {
                    document_url: url.clone(),
                    host: *mhost,
                    associated,
                    outcome: None,
                });
            }
        }

        if self.state != GroupState::Idle {
            // Coalesce: re-notify the caller of the running phase, never a
            // second concurrent run.
            let event = match self.state {
                GroupState::Checking => HostEvent::Checking,
                GroupState::Downloading => HostEvent::Downloading,
                GroupState::Idle => unreachable!(),
            };
            for h in host.iter().chain(master.iter().map(|(_, h)| h)) {
                self.notify_one(ctx, *h, event);
            }
            debug!(group = self.id.raw(), state = ?self.state, "Update already running, coalesced");
            return;
        }

        self.restart = Some(RestartArgs {
            host,
            master: master.clone(),
        });
        self.attempt = if self.newest_complete_cache().is_some() {
            AttemptKind::Upgrade
        } else {
            AttemptKind::Cache
        };
        self.state = GroupState::Checking;
        info!(group = self.id.raw(), url = %self.manifest_url, attempt = ?self.attempt, "Update started");

        let extra: Vec<HostId> = host.iter().copied().collect();
        self.notify_group_hosts(ctx, HostEvent::Checking, &extra);

        let conditional = match self.attempt {
            AttemptKind::Upgrade => self
                .newest_complete_cache()
                .map(|c| c.manifest_validators().clone())
                .filter(|v| !v.is_empty()),
            AttemptKind::Cache => None,
        };
        let fetch = ctx.start_fetch(
            self.id,
            FetchRequest {
                url: self.manifest_url.clone(),
                context: ContextId::default_context(),
                conditional,
            },
        );
        self.reset_watchdog(ctx);
        self.phase = Phase::FetchingManifest(ManifestFetch {
            fetch,
            parser: Some(ManifestParser::new(self.manifest_url.clone())),
            buffer: Vec::new(),
            validators: Validators::default(),
        });
    }

    /// Stop everything in flight and return to idle. Self-destructs the
    /// group if no versions remain.
    pub(crate) fn abort_update(&mut self, ctx: &mut EngineCtx<'_>, effects: &mut Vec<GroupEffect>) {
        self.stop_phase_fetches(ctx);
        ctx.prompts.cancel_group(self.id);
        let pending: Vec<PendingMaster> = self.pending_masters.drain(..).collect();
        for p in pending {
            if let Some(last) = self.versions.last_mut() {
                if last.detach_host(p.host) {
                    effects.push(GroupEffect::DetachHost { host: p.host });
                }
            }
        }
        self.discard_incomplete(ctx, effects);
        self.state = GroupState::Idle;
        if self.versions.is_empty() {
            effects.push(GroupEffect::SelfDestruct);
        }
    }

    // ==================== Event dispatch ====================

    pub(crate) fn on_fetch_event(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        id: FetchId,
        event: FetchEvent,
        effects: &mut Vec<GroupEffect>,
    ) {
        match &self.phase {
            Phase::FetchingManifest(mf) if mf.fetch == id => {
                self.on_manifest_event(ctx, event, effects)
            }
            Phase::Downloading(d) if d.current.as_ref().is_some_and(|c| c.fetch == id) => {
                self.on_entry_event(ctx, event, effects)
            }
            Phase::RefetchingManifest(r) if r.fetch == id => {
                self.on_refetch_event(ctx, event, effects)
            }
            _ => {
                debug!(group = self.id.raw(), fetch = id.raw(), "Stale fetch event ignored");
            }
        }
    }

    pub(crate) fn on_timer(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        kind: TimerKind,
        generation: u64,
        effects: &mut Vec<GroupEffect>,
    ) {
        match kind {
            TimerKind::Restart => {
                if generation != self.restart_generation {
                    return;
                }
                if let Some(args) = self.restart.take() {
                    info!(group = self.id.raw(), url = %self.manifest_url, "Delayed restart due");
                    effects.push(GroupEffect::Restart {
                        host: args.host,
                        master: args.master,
                    });
                }
            }
            TimerKind::Watchdog => {
                if generation != self.watchdog_generation {
                    return;
                }
                self.on_watchdog(ctx, effects);
            }
        }
    }

    fn on_watchdog(&mut self, ctx: &mut EngineCtx<'_>, effects: &mut Vec<GroupEffect>) {
        warn!(group = self.id.raw(), url = %self.manifest_url, "Update watchdog fired");
        match mem::replace(&mut self.phase, Phase::Idle) {
            Phase::FetchingManifest(mf) => {
                ctx.stop_fetch(mf.fetch);
                self.cache_failure(ctx, effects);
            }
            Phase::RefetchingManifest(r) => {
                ctx.stop_fetch(r.fetch);
                self.schedule_restart(ctx);
                self.cache_failure(ctx, effects);
            }
            Phase::Downloading(mut download) => {
                if let Some(inflight) = download.current.take() {
                    ctx.stop_fetch(inflight.fetch);
                    self.resolve_entry_failure(
                        ctx,
                        download,
                        inflight.item,
                        EntryFailure::Network,
                        effects,
                    );
                } else {
                    self.phase = Phase::Downloading(download);
                }
            }
            phase @ Phase::WaitingMasters { .. } => {
                self.phase = phase;
                // Give up on the still-loading entries; they resolve through
                // the normal per-entry failure path.
                for p in &mut self.pending_masters {
                    if p.associated && p.outcome.is_none() {
                        p.outcome = Some(false);
                    }
                }
                self.process_pending_masters(ctx, effects);
            }
            phase => {
                self.phase = phase;
            }
        }
    }

    pub(crate) fn on_prompt_answer(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        id: PromptId,
        kind: PromptKind,
        answer: PromptAnswer,
        effects: &mut Vec<GroupEffect>,
    ) {
        match mem::replace(&mut self.phase, Phase::Idle) {
            Phase::AwaitingConsent { prompt, validators } => {
                if prompt != id {
                    // An answer for a prompt this phase is not waiting on.
                    self.phase = Phase::AwaitingConsent { prompt, validators };
                    return;
                }
                if matches!(kind, PromptKind::Install | PromptKind::InstallUpdate)
                    && answer == PromptAnswer::Allowed
                {
                    self.begin_download(ctx, validators, effects);
                } else {
                    // Declined: silently drop the attempt, no events.
                    debug!(group = self.id.raw(), "Install declined, discarding attempt");
                    self.pending_masters.clear();
                    self.discard_incomplete(ctx, effects);
                    self.state = GroupState::Idle;
                    if self.versions.is_empty() {
                        effects.push(GroupEffect::SelfDestruct);
                    }
                }
            }
            Phase::AwaitingQuota { download, prompt } if prompt != id => {
                self.phase = Phase::AwaitingQuota { download, prompt };
            }
            Phase::AwaitingQuota { download, .. } => match answer {
                PromptAnswer::NewQuota(quota_kb) if quota_kb > self.disk_quota_kb => {
                    info!(
                        group = self.id.raw(),
                        old_kb = self.disk_quota_kb,
                        new_kb = quota_kb,
                        "Quota raised, resuming download"
                    );
                    self.disk_quota_kb = quota_kb;
                    self.phase = Phase::Downloading(download);
                    self.start_next_download(ctx, effects);
                }
                _ => {
                    self.cache_failure(ctx, effects);
                }
            },
            phase => {
                // Stale answer for a phase that has moved on.
                self.phase = phase;
            }
        }
    }

    /// The embedder reports that a pending master document finished loading.
    pub(crate) fn master_document_loaded(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        host: HostId,
        success: bool,
        effects: &mut Vec<GroupEffect>,
    ) {
        let Some(p) = self
            .pending_masters
            .iter_mut()
            .find(|p| p.host == host && p.outcome.is_none())
        else {
            return;
        };
        p.outcome = Some(success);
        if matches!(self.phase, Phase::WaitingMasters { .. }) {
            self.process_pending_masters(ctx, effects);
        } else if self.state == GroupState::Idle {
            // Resolved after the update completed (it raced the byte-compare
            // re-fetch): associate against the newest complete cache.
            if self.associate_resolved_masters(ctx, effects) > 0 {
                effects.push(GroupEffect::PersistState);
            }
        }
    }

    /// A host was destroyed: drop every reference to it. Returns true if
    /// the host was referenced here and the group is left with no
    /// interested hosts at all.
    pub(crate) fn host_destructed(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        host: HostId,
        effects: &mut Vec<GroupEffect>,
    ) -> bool {
        let mut referenced = self.pending_masters.iter().any(|p| p.host == host);
        self.pending_masters.retain(|p| p.host != host);
        if let Some(args) = &mut self.restart {
            if args.host == Some(host) {
                args.host = None;
                referenced = true;
            }
            if args.master.as_ref().is_some_and(|(_, h)| *h == host) {
                args.master = None;
                referenced = true;
            }
        }
        for cache in &mut self.versions {
            if cache.detach_host(host) {
                referenced = true;
            }
        }
        if matches!(self.phase, Phase::WaitingMasters { .. }) {
            self.process_pending_masters(ctx, effects);
        }
        referenced && !self.has_interested_hosts()
    }

    // ==================== Manifest fetch ====================

    fn on_manifest_event(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        event: FetchEvent,
        effects: &mut Vec<GroupEffect>,
    ) {
        let Phase::FetchingManifest(mut mf) = mem::replace(&mut self.phase, Phase::Idle) else {
            unreachable!()
        };
        match event {
            FetchEvent::Status {
                status,
                content_type,
                validators,
            } => {
                self.reset_watchdog(ctx);
                if status == 404 || status == 410 {
                    ctx.stop_fetch(mf.fetch);
                    self.make_obsolete(ctx, effects);
                    return;
                }
                if !(200..=299).contains(&status) {
                    warn!(group = self.id.raw(), status, "Manifest fetch failed");
                    ctx.stop_fetch(mf.fetch);
                    self.cache_failure(ctx, effects);
                    return;
                }
                if ctx.config.enforce_manifest_mime {
                    let is_manifest = content_type
                        .as_deref()
                        .and_then(|ct| ct.parse::<mime::Mime>().ok())
                        .is_some_and(|m| m.essence_str() == "text/cache-manifest");
                    if !is_manifest {
                        warn!(
                            group = self.id.raw(),
                            content_type = content_type.as_deref().unwrap_or("<none>"),
                            "Manifest served with wrong content type"
                        );
                        ctx.stop_fetch(mf.fetch);
                        self.cache_failure(ctx, effects);
                        return;
                    }
                }
                mf.validators = validators;
                self.phase = Phase::FetchingManifest(mf);
            }
            FetchEvent::Data { chunk } => {
                self.reset_watchdog(ctx);
                mf.buffer.extend_from_slice(&chunk);
                if let Some(parser) = mf.parser.as_mut() {
                    match parser.feed(&mf.buffer, false) {
                        Ok(consumed) => {
                            mf.buffer.drain(..consumed);
                            self.phase = Phase::FetchingManifest(mf);
                        }
                        Err(err) => {
                            warn!(group = self.id.raw(), error = %err, "Manifest parse failed");
                            ctx.stop_fetch(mf.fetch);
                            self.cache_failure(ctx, effects);
                        }
                    }
                } else {
                    self.phase = Phase::FetchingManifest(mf);
                }
            }
            FetchEvent::Done => {
                let Some(mut parser) = mf.parser.take() else {
                    self.cache_failure(ctx, effects);
                    return;
                };
                let manifest = parser
                    .feed(&mf.buffer, true)
                    .and_then(|_| parser.finish());
                match manifest {
                    Ok(manifest) => self.on_manifest_parsed(ctx, manifest, mf.validators, effects),
                    Err(err) => {
                        warn!(group = self.id.raw(), error = %err, "Manifest parse failed");
                        self.cache_failure(ctx, effects);
                    }
                }
            }
            FetchEvent::NotModified => {
                debug!(group = self.id.raw(), "Manifest not modified");
                self.manifest_unchanged(ctx, effects);
            }
            FetchEvent::Redirected { location } => {
                warn!(group = self.id.raw(), location = %location, "Manifest redirected");
                self.cache_failure(ctx, effects);
            }
            FetchEvent::Failed { message } => {
                warn!(group = self.id.raw(), error = %message, "Manifest fetch failed");
                self.cache_failure(ctx, effects);
            }
        }
    }

    fn on_manifest_parsed(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        manifest: cachekit_manifest::Manifest,
        validators: Validators,
        effects: &mut Vec<GroupEffect>,
    ) {
        if self.attempt == AttemptKind::Upgrade {
            let unchanged = self
                .newest_complete_cache()
                .and_then(|c| c.manifest())
                .is_some_and(|m| m.content_hash() == manifest.content_hash());
            if unchanged {
                debug!(group = self.id.raw(), "Manifest hash unchanged");
                self.manifest_unchanged(ctx, effects);
                return;
            }
        }

        let mut cache = Cache::new(ContextId::generate());
        cache.set_manifest(manifest);
        debug_assert!(
            self.versions.last().is_none_or(|c| c.is_complete()),
            "new version appended while another is incomplete"
        );
        self.versions.push(cache);

        for p in &mut self.pending_masters {
            p.associated = true;
        }

        let kind = match self.attempt {
            AttemptKind::Cache => PromptKind::Install,
            AttemptKind::Upgrade => PromptKind::InstallUpdate,
        };
        let host = self.restart.as_ref().and_then(|a| a.host);
        let prompt = ctx
            .prompts
            .ask(self.id, host, &self.manifest_url, kind, ctx.events);
        self.phase = Phase::AwaitingConsent { prompt, validators };
    }

    fn manifest_unchanged(&mut self, ctx: &mut EngineCtx<'_>, effects: &mut Vec<GroupEffect>) {
        for p in &mut self.pending_masters {
            p.associated = true;
        }
        self.enter_waiting_masters(ctx, FollowUp::NoUpdate, effects);
    }

    // ==================== Download phase ====================

    fn begin_download(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        validators: Validators,
        effects: &mut Vec<GroupEffect>,
    ) {
        self.state = GroupState::Downloading;
        self.notify_group_hosts(ctx, HostEvent::Downloading, &[]);

        let (queue, downloaded_bytes) = self.build_download_set(ctx, effects);
        let total = queue.len();
        info!(
            group = self.id.raw(),
            entries = total,
            copied_bytes = downloaded_bytes,
            "Download phase started"
        );
        let download = DownloadState {
            queue,
            current: None,
            loaded: 0,
            total,
            downloaded_bytes,
            manifest_validators: validators,
        };

        if self.over_quota(download.downloaded_bytes) {
            self.pause_for_quota(ctx, download);
        } else {
            self.phase = Phase::Downloading(download);
            self.start_next_download(ctx, effects);
        }
    }

    /// Build the download set: manifest cache entries and fallback targets,
    /// merged with the previous complete version's master URLs. Master
    /// bodies already stored are copied, not re-fetched.
    fn build_download_set(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        effects: &mut Vec<GroupEffect>,
    ) -> (VecDeque<DownloadItem>, u64) {
        let mut queue = VecDeque::new();
        let mut copied_bytes = 0u64;

        let last = self.versions.len() - 1;
        let prev_complete = self.versions[..last].iter().rposition(|c| c.is_complete());

        if let Some(prev_idx) = prev_complete {
            let (head, tail) = self.versions.split_at_mut(last);
            let prev = &head[prev_idx];
            let new_cache = &mut tail[0];
            let prev_context = prev.context().clone();
            let new_context = new_cache.context().clone();
            let masters: Vec<Url> = prev.master_urls().cloned().collect();

            for url in masters {
                match ctx
                    .transport
                    .copy_between_contexts(&url, &prev_context, &new_context)
                {
                    Ok(size) => {
                        new_cache.record_entry(url.clone(), size, true, true);
                        new_cache.add_master_url(url.clone());
                        copied_bytes += size;
                        effects.push(GroupEffect::MasterRegistered { url });
                    }
                    Err(_) => {
                        queue.push_back(DownloadItem {
                            url,
                            explicit: false,
                        });
                    }
                }
            }
        }

        let new_cache = &self.versions[last];
        let mut entries: Vec<Url> = new_cache
            .manifest()
            .map(|m| {
                m.cache_entries()
                    .filter(|url| !new_cache.has_entry(url))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        entries.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        for url in entries {
            queue.push_back(DownloadItem {
                url,
                explicit: true,
            });
        }

        (queue, copied_bytes)
    }

    fn start_next_download(&mut self, ctx: &mut EngineCtx<'_>, effects: &mut Vec<GroupEffect>) {
        let Phase::Downloading(mut download) = mem::replace(&mut self.phase, Phase::Idle) else {
            unreachable!()
        };
        match download.queue.pop_front() {
            Some(item) => {
                let context = self
                    .versions
                    .last()
                    .map(|c| c.context().clone())
                    .unwrap_or_else(ContextId::default_context);
                let fetch = ctx.start_fetch(
                    self.id,
                    FetchRequest {
                        url: item.url.clone(),
                        context,
                        conditional: None,
                    },
                );
                self.reset_watchdog(ctx);
                download.current = Some(InFlight {
                    item,
                    fetch,
                    received: 0,
                });
                self.phase = Phase::Downloading(download);
            }
            None => {
                self.enter_waiting_masters(
                    ctx,
                    FollowUp::Refetch {
                        validators: download.manifest_validators,
                    },
                    effects,
                );
            }
        }
    }

    fn on_entry_event(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        event: FetchEvent,
        effects: &mut Vec<GroupEffect>,
    ) {
        let Phase::Downloading(mut download) = mem::replace(&mut self.phase, Phase::Idle) else {
            unreachable!()
        };
        let mut inflight = download.current.take().expect("dispatch checked current");

        match event {
            FetchEvent::Status { status, .. } => {
                self.reset_watchdog(ctx);
                if (200..=299).contains(&status) {
                    download.current = Some(inflight);
                    self.phase = Phase::Downloading(download);
                } else {
                    ctx.stop_fetch(inflight.fetch);
                    self.resolve_entry_failure(
                        ctx,
                        download,
                        inflight.item,
                        EntryFailure::Status(status),
                        effects,
                    );
                }
            }
            FetchEvent::Data { chunk } => {
                self.reset_watchdog(ctx);
                inflight.received += chunk.len() as u64;
                if self.over_quota(download.downloaded_bytes + inflight.received) {
                    // Pause: the entry restarts from the queue front once a
                    // larger quota is granted.
                    ctx.stop_fetch(inflight.fetch);
                    download.queue.push_front(inflight.item);
                    self.pause_for_quota(ctx, download);
                } else {
                    download.current = Some(inflight);
                    self.phase = Phase::Downloading(download);
                }
            }
            FetchEvent::Done => {
                let InFlight {
                    item, received, ..
                } = inflight;
                let persistent = !item.explicit;
                if let Some(cache) = self.versions.last_mut() {
                    cache.record_entry(item.url.clone(), received, true, persistent);
                    if !item.explicit {
                        cache.add_master_url(item.url.clone());
                        effects.push(GroupEffect::MasterRegistered {
                            url: item.url.clone(),
                        });
                    }
                }
                download.downloaded_bytes += received;
                download.loaded += 1;
                debug!(
                    group = self.id.raw(),
                    url = %item.url,
                    size = received,
                    loaded = download.loaded,
                    total = download.total,
                    "Entry downloaded"
                );
                self.notify_group_hosts(
                    ctx,
                    HostEvent::Progress {
                        loaded: download.loaded,
                        total: download.total,
                    },
                    &[],
                );
                self.phase = Phase::Downloading(download);
                self.start_next_download(ctx, effects);
            }
            FetchEvent::Redirected { .. } => {
                ctx.stop_fetch(inflight.fetch);
                self.resolve_entry_failure(
                    ctx,
                    download,
                    inflight.item,
                    EntryFailure::Redirect,
                    effects,
                );
            }
            FetchEvent::Failed { message } => {
                warn!(group = self.id.raw(), url = %inflight.item.url, error = %message, "Entry fetch failed");
                self.resolve_entry_failure(
                    ctx,
                    download,
                    inflight.item,
                    EntryFailure::Network,
                    effects,
                );
            }
            FetchEvent::NotModified => {
                // Entry fetches are unconditional; treat as a protocol error.
                ctx.stop_fetch(inflight.fetch);
                self.resolve_entry_failure(
                    ctx,
                    download,
                    inflight.item,
                    EntryFailure::Network,
                    effects,
                );
            }
        }
    }

    fn resolve_entry_failure(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        mut download: DownloadState,
        item: DownloadItem,
        failure: EntryFailure,
        effects: &mut Vec<GroupEffect>,
    ) {
        match failure {
            // A broken explicit or fallback entry invalidates the whole
            // attempt.
            EntryFailure::Status(400..=599) | EntryFailure::Redirect if item.explicit => {
                warn!(group = self.id.raw(), url = %item.url, "Explicit entry failed, update aborted");
                self.cache_failure(ctx, effects);
            }
            // A vanished master entry is dropped silently.
            EntryFailure::Status(404) | EntryFailure::Status(410) => {
                debug!(group = self.id.raw(), url = %item.url, "Entry gone, dropped");
                download.loaded += 1;
                self.notify_group_hosts(
                    ctx,
                    HostEvent::Progress {
                        loaded: download.loaded,
                        total: download.total,
                    },
                    &[],
                );
                self.phase = Phase::Downloading(download);
                self.start_next_download(ctx, effects);
            }
            // Anything else: substitute the body from the newest complete
            // version if we have one.
            _ => {
                let last = self.versions.len() - 1;
                let prev_complete =
                    self.versions[..last].iter().rposition(|c| c.is_complete());
                let Some(prev_idx) = prev_complete else {
                    self.cache_failure(ctx, effects);
                    return;
                };
                let (head, tail) = self.versions.split_at_mut(last);
                let prev_context = head[prev_idx].context().clone();
                let new_cache = &mut tail[0];
                let new_context = new_cache.context().clone();
                match ctx
                    .transport
                    .copy_between_contexts(&item.url, &prev_context, &new_context)
                {
                    Ok(size) => {
                        debug!(group = self.id.raw(), url = %item.url, "Entry substituted from previous version");
                        new_cache.record_entry(item.url.clone(), size, true, !item.explicit);
                        if !item.explicit {
                            new_cache.add_master_url(item.url.clone());
                            effects.push(GroupEffect::MasterRegistered {
                                url: item.url.clone(),
                            });
                        }
                        download.downloaded_bytes += size;
                        download.loaded += 1;
                        self.notify_group_hosts(
                            ctx,
                            HostEvent::Progress {
                                loaded: download.loaded,
                                total: download.total,
                            },
                            &[],
                        );
                        self.phase = Phase::Downloading(download);
                        self.start_next_download(ctx, effects);
                    }
                    Err(_) => {
                        self.cache_failure(ctx, effects);
                    }
                }
            }
        }
    }

    fn over_quota(&self, bytes: u64) -> bool {
        bytes > self.disk_quota_kb.saturating_mul(1024)
    }

    fn pause_for_quota(&mut self, ctx: &mut EngineCtx<'_>, download: DownloadState) {
        info!(
            group = self.id.raw(),
            quota_kb = self.disk_quota_kb,
            "Quota exceeded, asking for more"
        );
        let host = self.restart.as_ref().and_then(|a| a.host);
        let prompt = ctx.prompts.ask(
            self.id,
            host,
            &self.manifest_url,
            PromptKind::IncreaseQuota {
                current_quota_kb: self.disk_quota_kb,
            },
            ctx.events,
        );
        self.phase = Phase::AwaitingQuota { download, prompt };
    }

    // ==================== Pending-master wait ====================

    fn enter_waiting_masters(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        follow_up: FollowUp,
        effects: &mut Vec<GroupEffect>,
    ) {
        self.state = GroupState::Downloading;
        self.phase = Phase::WaitingMasters {
            follow_up,
            failed_any: false,
        };
        self.process_pending_masters(ctx, effects);
        if matches!(self.phase, Phase::WaitingMasters { .. }) {
            self.reset_watchdog(ctx);
        }
    }

    /// Copy, associate, or fail every pending master that belongs to the
    /// running attempt and has a resolved outcome. Returns how many entries
    /// were settled.
    fn associate_resolved_masters(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        effects: &mut Vec<GroupEffect>,
    ) -> usize {
        let mut settled = 0;
        loop {
            let Some(idx) = self
                .pending_masters
                .iter()
                .position(|p| p.associated && p.outcome.is_some())
            else {
                break;
            };
            let p = self.pending_masters.remove(idx);
            settled += 1;
            let succeeded = p.outcome.unwrap_or(false);

            if succeeded {
                let Some(cache) = self.versions.last_mut() else {
                    continue;
                };
                let cache_id = cache.id();
                let context = cache.context().clone();
                let stored = if cache.has_entry(&p.document_url) {
                    Ok(0)
                } else {
                    ctx.transport.copy_between_contexts(
                        &p.document_url,
                        &ContextId::default_context(),
                        &context,
                    )
                };
                match stored {
                    Ok(size) => {
                        if size > 0 {
                            cache.record_entry(p.document_url.clone(), size, true, true);
                        }
                        cache.add_master_url(p.document_url.clone());
                        cache.attach_host(p.host);
                        debug!(group = self.id.raw(), url = %p.document_url, "Master entry associated");
                        effects.push(GroupEffect::MasterRegistered {
                            url: p.document_url,
                        });
                        effects.push(GroupEffect::AssociateHost {
                            host: p.host,
                            cache: cache_id,
                        });
                    }
                    Err(_) => {
                        self.fail_pending_master(ctx, p.host, effects);
                    }
                }
            } else {
                self.fail_pending_master(ctx, p.host, effects);
            }
        }
        settled
    }

    fn process_pending_masters(&mut self, ctx: &mut EngineCtx<'_>, effects: &mut Vec<GroupEffect>) {
        self.associate_resolved_masters(ctx, effects);

        let unresolved = self
            .pending_masters
            .iter()
            .any(|p| p.associated && p.outcome.is_none());
        if unresolved {
            return;
        }

        if let Phase::WaitingMasters {
            follow_up,
            failed_any,
        } = mem::replace(&mut self.phase, Phase::Idle)
        {
            // A cache attempt whose last master failed has nothing to
            // install.
            let no_masters = self
                .versions
                .last()
                .is_none_or(|c| c.master_urls().next().is_none());
            if failed_any
                && self.attempt == AttemptKind::Cache
                && matches!(follow_up, FollowUp::Refetch { .. })
                && no_masters
            {
                self.cache_failure(ctx, effects);
                return;
            }
            self.finish_masters(ctx, follow_up, effects);
        }
    }

    fn fail_pending_master(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        host: HostId,
        effects: &mut Vec<GroupEffect>,
    ) {
        if let Some(cache) = self.versions.last_mut() {
            if cache.detach_host(host) {
                effects.push(GroupEffect::DetachHost { host });
            }
        }
        self.notify_one(ctx, host, HostEvent::Error);
        if let Phase::WaitingMasters { failed_any, .. } = &mut self.phase {
            *failed_any = true;
        }
    }

    fn finish_masters(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        follow_up: FollowUp,
        effects: &mut Vec<GroupEffect>,
    ) {
        match follow_up {
            FollowUp::NoUpdate => {
                info!(group = self.id.raw(), url = %self.manifest_url, "No update");
                self.notify_group_hosts(ctx, HostEvent::NoUpdate, &[]);
                self.pending_masters.clear();
                self.state = GroupState::Idle;
                self.phase = Phase::Idle;
                effects.push(GroupEffect::PersistState);
            }
            FollowUp::Refetch { validators } => {
                let Some(cache) = self.versions.last() else {
                    self.cache_failure(ctx, effects);
                    return;
                };
                let expected_hash = cache
                    .manifest()
                    .map(|m| m.content_hash().to_string())
                    .unwrap_or_default();
                let conditional = Some(validators.clone()).filter(|v| !v.is_empty());
                let fetch = ctx.start_fetch(
                    self.id,
                    FetchRequest {
                        url: self.manifest_url.clone(),
                        context: cache.context().clone(),
                        conditional,
                    },
                );
                self.reset_watchdog(ctx);
                debug!(group = self.id.raw(), "Re-fetching manifest for byte compare");
                self.phase = Phase::RefetchingManifest(Refetch {
                    fetch,
                    hasher: Sha256::new(),
                    expected_hash,
                    validators,
                });
            }
        }
    }

    // ==================== Byte-compare re-fetch ====================

    fn on_refetch_event(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        event: FetchEvent,
        effects: &mut Vec<GroupEffect>,
    ) {
        let Phase::RefetchingManifest(mut refetch) = mem::replace(&mut self.phase, Phase::Idle)
        else {
            unreachable!()
        };
        match event {
            FetchEvent::Status { status, .. } => {
                self.reset_watchdog(ctx);
                if (200..=299).contains(&status) {
                    self.phase = Phase::RefetchingManifest(refetch);
                } else {
                    ctx.stop_fetch(refetch.fetch);
                    self.schedule_restart(ctx);
                    self.cache_failure(ctx, effects);
                }
            }
            FetchEvent::Data { chunk } => {
                self.reset_watchdog(ctx);
                refetch.hasher.update(&chunk);
                self.phase = Phase::RefetchingManifest(refetch);
            }
            FetchEvent::NotModified => {
                self.finalize(ctx, refetch.validators, effects);
            }
            FetchEvent::Done => {
                let digest = refetch.hasher.finalize();
                let hash = hex_digest(&digest);
                if hash == refetch.expected_hash {
                    self.finalize(ctx, refetch.validators, effects);
                } else {
                    info!(
                        group = self.id.raw(),
                        url = %self.manifest_url,
                        "Manifest changed during update, scheduling restart"
                    );
                    self.schedule_restart(ctx);
                    self.cache_failure(ctx, effects);
                }
            }
            FetchEvent::Redirected { .. } | FetchEvent::Failed { .. } => {
                self.schedule_restart(ctx);
                self.cache_failure(ctx, effects);
            }
        }
    }

    fn finalize(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        validators: Validators,
        effects: &mut Vec<GroupEffect>,
    ) {
        let Some(cache) = self.versions.last_mut() else {
            self.cache_failure(ctx, effects);
            return;
        };
        cache.set_manifest_validators(validators);
        let cache_id = cache.id();
        if let Err(err) = cache.mark_complete() {
            warn!(group = self.id.raw(), error = %err, "Failed to finalize cache");
            self.cache_failure(ctx, effects);
            return;
        }

        self.state = GroupState::Idle;
        self.phase = Phase::Idle;
        self.restart = None;
        // Masters that raced the byte-compare re-fetch join the completed
        // cache before the completion event goes out.
        self.associate_resolved_masters(ctx, effects);
        let event = match self.attempt {
            AttemptKind::Cache => HostEvent::Cached,
            AttemptKind::Upgrade => HostEvent::UpdateReady,
        };
        info!(group = self.id.raw(), url = %self.manifest_url, event = ?event, "Update complete");
        self.notify_group_hosts(ctx, event, &[]);
        effects.push(GroupEffect::CacheCompleted { cache: cache_id });
        effects.push(GroupEffect::PersistState);
    }

    // ==================== Failure paths ====================

    /// The cache-failure sub-routine: abandon the attempt, keep prior
    /// complete versions.
    fn cache_failure(&mut self, ctx: &mut EngineCtx<'_>, effects: &mut Vec<GroupEffect>) {
        warn!(group = self.id.raw(), url = %self.manifest_url, "Update failed");
        self.stop_phase_fetches(ctx);
        ctx.prompts.cancel_group(self.id);

        let pending: Vec<PendingMaster> = self.pending_masters.drain(..).collect();
        for p in &pending {
            if let Some(last) = self.versions.last_mut() {
                if last.detach_host(p.host) {
                    effects.push(GroupEffect::DetachHost { host: p.host });
                }
            }
        }
        let pending_hosts: Vec<HostId> = pending.iter().map(|p| p.host).collect();
        self.notify_group_hosts(ctx, HostEvent::Error, &pending_hosts);

        self.discard_incomplete(ctx, effects);
        self.state = GroupState::Idle;

        if self.attempt == AttemptKind::Cache && self.versions.is_empty() {
            effects.push(GroupEffect::SelfDestruct);
        }
    }

    /// The manifest is gone for good (404/410).
    fn make_obsolete(&mut self, ctx: &mut EngineCtx<'_>, effects: &mut Vec<GroupEffect>) {
        info!(group = self.id.raw(), url = %self.manifest_url, "Manifest gone, group obsolete");
        self.stop_phase_fetches(ctx);
        ctx.prompts.cancel_group(self.id);

        // Pending hosts hear `obsolete` with everyone else, then `error` for
        // their own racing load.
        self.notify_group_hosts(ctx, HostEvent::Obsolete, &[]);

        let pending: Vec<PendingMaster> = self.pending_masters.drain(..).collect();
        for p in &pending {
            if let Some(last) = self.versions.last_mut() {
                if last.detach_host(p.host) {
                    effects.push(GroupEffect::DetachHost { host: p.host });
                }
            }
            self.notify_one(ctx, p.host, HostEvent::Error);
        }

        self.obsolete = true;
        for cache in &mut self.versions {
            cache.set_obsolete();
        }

        self.discard_incomplete(ctx, effects);
        self.state = GroupState::Idle;
        effects.push(GroupEffect::GroupObsoleted);
        if self.versions.is_empty() {
            effects.push(GroupEffect::SelfDestruct);
        }
    }

    /// Drop the newest version if it never completed.
    fn discard_incomplete(&mut self, ctx: &mut EngineCtx<'_>, effects: &mut Vec<GroupEffect>) {
        let discard = self.versions.last().is_some_and(|c| !c.is_complete());
        if !discard {
            return;
        }
        let cache = self.versions.pop().expect("checked non-empty");
        for host in cache.hosts() {
            effects.push(GroupEffect::DetachHost { host });
        }
        for url in cache.master_urls() {
            let elsewhere = self.versions.iter().any(|c| c.is_master(url));
            if !elsewhere {
                effects.push(GroupEffect::MasterUnregistered { url: url.clone() });
            }
        }
        ctx.transport.delete_context(cache.context());
        debug!(group = self.id.raw(), cache = cache.id().raw(), "Incomplete version discarded");
    }

    fn schedule_restart(&mut self, ctx: &mut EngineCtx<'_>) {
        if self.restart.is_none() {
            return;
        }
        self.restart_generation += 1;
        ctx.timers.schedule(
            self.id,
            TimerKind::Restart,
            self.restart_generation,
            ctx.config.restart_delay,
            ctx.events.clone(),
        );
    }

    fn stop_phase_fetches(&mut self, ctx: &mut EngineCtx<'_>) {
        match mem::replace(&mut self.phase, Phase::Idle) {
            Phase::FetchingManifest(mf) => ctx.stop_fetch(mf.fetch),
            Phase::Downloading(d) => {
                if let Some(inflight) = d.current {
                    ctx.stop_fetch(inflight.fetch);
                }
            }
            Phase::RefetchingManifest(r) => ctx.stop_fetch(r.fetch),
            _ => {}
        }
    }

    // ==================== Notification ====================

    fn reset_watchdog(&mut self, ctx: &mut EngineCtx<'_>) {
        self.watchdog_generation += 1;
        ctx.timers.schedule(
            self.id,
            TimerKind::Watchdog,
            self.watchdog_generation,
            ctx.config.response_timeout,
            ctx.events.clone(),
        );
    }

    /// Notify every host attached to any version plus every pending-master
    /// host, de-duplicated. Obsolete groups suppress everything except
    /// `obsolete` and `error`.
    fn notify_group_hosts(&self, ctx: &mut EngineCtx<'_>, event: HostEvent, extra: &[HostId]) {
        if self.suppressed(event) {
            return;
        }
        let mut seen = hashbrown::HashSet::new();
        for cache in &self.versions {
            for host in cache.hosts() {
                seen.insert(host);
            }
        }
        for p in &self.pending_masters {
            seen.insert(p.host);
        }
        for host in extra {
            seen.insert(*host);
        }
        for host in seen {
            ctx.notify(host, event);
        }
    }

    fn notify_one(&self, ctx: &mut EngineCtx<'_>, host: HostId, event: HostEvent) {
        if self.suppressed(event) {
            return;
        }
        ctx.notify(host, event);
    }

    fn suppressed(&self, event: HostEvent) -> bool {
        self.obsolete && !matches!(event, HostEvent::Obsolete | HostEvent::Error)
    }
}

fn hex_digest(digest: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
