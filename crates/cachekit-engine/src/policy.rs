//! Policy collaborator: the permission surface that approves installs,
//! update checks, and quota increases.
//!
//! Prompts are asynchronous and de-duplicated per manifest URL through the
//! [`PromptBroker`]: while a prompt for a manifest is outstanding, further
//! identical requests attach to it as waiters instead of re-asking, and the
//! first answer resolves all of them.

use hashbrown::HashMap;
use tracing::debug;
use url::Url;

use crate::{EngineEvent, EngineSender, GroupId, HostId, PromptId};

/// What is being asked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    /// Install a first cache for this manifest.
    Install,
    /// Check the manifest for updates (host-initiated).
    CheckForUpdate,
    /// Install an updated cache version.
    InstallUpdate,
    /// Raise the disk quota beyond the current value.
    IncreaseQuota { current_quota_kb: u64 },
}

impl PromptKind {
    /// De-duplication key: quota amounts do not split prompts.
    fn key(&self) -> &'static str {
        match self {
            PromptKind::Install => "install",
            PromptKind::CheckForUpdate => "check",
            PromptKind::InstallUpdate => "install-update",
            PromptKind::IncreaseQuota { .. } => "quota",
        }
    }
}

/// The answer to a prompt, posted as [`EngineEvent::Prompt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptAnswer {
    Allowed,
    Denied,
    /// Quota prompts only: the granted quota in kB.
    NewQuota(u64),
}

/// The permission surface. Implementations answer asynchronously through the
/// [`EngineSender`] and must tolerate `cancel` for prompts they no longer
/// know about.
pub trait Policy: Send {
    fn ask(&mut self, id: PromptId, manifest_url: &Url, kind: PromptKind, events: EngineSender);
    fn cancel(&mut self, id: PromptId);
}

/// A policy that grants everything immediately. Quota requests are doubled.
pub struct AllowAllPolicy;

impl Policy for AllowAllPolicy {
    fn ask(&mut self, id: PromptId, _manifest_url: &Url, kind: PromptKind, events: EngineSender) {
        let answer = match kind {
            PromptKind::IncreaseQuota { current_quota_kb } => {
                PromptAnswer::NewQuota(current_quota_kb.saturating_mul(2).max(1))
            }
            _ => PromptAnswer::Allowed,
        };
        events.send(EngineEvent::Prompt { id, answer });
    }

    fn cancel(&mut self, _id: PromptId) {}
}

// ==================== Prompt broker ====================

struct Outstanding {
    manifest_url: Url,
    kind: PromptKind,
    waiters: Vec<(GroupId, Option<HostId>)>,
}

/// De-duplicates prompts per manifest URL and fans the first answer out to
/// every waiter.
pub(crate) struct PromptBroker {
    policy: Box<dyn Policy>,
    outstanding: HashMap<PromptId, Outstanding>,
    by_key: HashMap<(Url, &'static str), PromptId>,
}

impl PromptBroker {
    pub(crate) fn new(policy: Box<dyn Policy>) -> Self {
        Self {
            policy,
            outstanding: HashMap::new(),
            by_key: HashMap::new(),
        }
    }

    /// Ask, or attach to an already-outstanding identical prompt.
    pub(crate) fn ask(
        &mut self,
        group: GroupId,
        host: Option<HostId>,
        manifest_url: &Url,
        kind: PromptKind,
        events: &EngineSender,
    ) -> PromptId {
        let key = (manifest_url.clone(), kind.key());
        if let Some(&id) = self.by_key.get(&key) {
            if let Some(entry) = self.outstanding.get_mut(&id) {
                if !entry.waiters.iter().any(|(g, h)| *g == group && *h == host) {
                    entry.waiters.push((group, host));
                }
                debug!(prompt = id.raw(), url = %manifest_url, "Coalesced into outstanding prompt");
                return id;
            }
        }

        let id = PromptId::next();
        self.outstanding.insert(
            id,
            Outstanding {
                manifest_url: manifest_url.clone(),
                kind,
                waiters: vec![(group, host)],
            },
        );
        self.by_key.insert(key, id);
        debug!(prompt = id.raw(), url = %manifest_url, ?kind, "Asking policy");
        self.policy.ask(id, manifest_url, kind, events.clone());
        id
    }

    /// Resolve an answered prompt, returning its kind, manifest URL, and
    /// waiters. `None` for unknown/stale prompt ids.
    pub(crate) fn resolve(
        &mut self,
        id: PromptId,
    ) -> Option<(Url, PromptKind, Vec<(GroupId, Option<HostId>)>)> {
        let entry = self.outstanding.remove(&id)?;
        self.by_key.remove(&(entry.manifest_url.clone(), entry.kind.key()));
        Some((entry.manifest_url, entry.kind, entry.waiters))
    }

    /// Drop a group from every outstanding prompt; prompts left with no
    /// waiters are cancelled at the policy.
    pub(crate) fn cancel_group(&mut self, group: GroupId) {
        let mut orphaned = Vec::new();
        for (id, entry) in self.outstanding.iter_mut() {
            entry.waiters.retain(|(g, _)| *g != group);
            if entry.waiters.is_empty() {
                orphaned.push(*id);
            }
        }
        for id in orphaned {
            if let Some(entry) = self.outstanding.remove(&id) {
                self.by_key.remove(&(entry.manifest_url, entry.kind.key()));
            }
            self.policy.cancel(id);
        }
    }

    /// Drop a host from every outstanding prompt (host teardown). Prompts
    /// whose only waiter was that host are cancelled.
    pub(crate) fn cancel_host(&mut self, host: HostId) {
        let mut orphaned = Vec::new();
        for (id, entry) in self.outstanding.iter_mut() {
            entry.waiters.retain(|(_, h)| *h != Some(host));
            if entry.waiters.is_empty() {
                orphaned.push(*id);
            }
        }
        for id in orphaned {
            if let Some(entry) = self.outstanding.remove(&id) {
                self.by_key.remove(&(entry.manifest_url, entry.kind.key()));
            }
            self.policy.cancel(id);
        }
    }
}
