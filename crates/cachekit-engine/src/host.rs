//! Cache host collaborator: the document/runtime consumer that receives
//! update lifecycle events.

/// Lifecycle events delivered to attached cache hosts during an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    /// A manifest (re)fetch started.
    Checking,
    /// The manifest was byte-identical to the current version.
    NoUpdate,
    /// The resource download phase started.
    Downloading,
    /// One download-set entry resolved.
    Progress { loaded: usize, total: usize },
    /// A newer complete cache version is available (upgrade attempt).
    UpdateReady,
    /// The first complete cache version was installed (cache attempt).
    Cached,
    /// The manifest is gone (404/410); the whole group is obsolete.
    Obsolete,
    /// The update failed.
    Error,
}

/// A consumer of update lifecycle events. Implemented by the embedder for
/// each document that declared or selected a cache.
pub trait CacheHost: Send {
    fn notify(&self, event: HostEvent);
}
