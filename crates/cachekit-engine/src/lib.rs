//! # CacheKit Engine
//!
//! Offline cache-group update engine: downloads, versions, and activates
//! immutable snapshots of the resources an application needs to run offline,
//! keeps attached cache hosts informed of progress, and decides at fetch time
//! whether a request is served from cache, from the network, or fails.
//!
//! ## Features
//!
//! - **Cache**: one immutable, versioned snapshot of manifest-governed
//!   resources plus master documents
//! - **CacheGroup**: the per-manifest-URL update state machine
//!   (checking / downloading / pending-master wait / byte-compare re-fetch)
//! - **CacheRegistry**: indexes groups and caches, runs cache selection for
//!   navigations and the fetch-time network-model decision
//! - **Collaborator traits**: `Transport`, `Policy`, `Timers`, `CacheHost`,
//!   with a reqwest-backed `HttpTransport` and tokio-backed `TokioTimers`
//! - **Persistence**: JSON registry records with unloaded group stubs
//!
//! ## Architecture
//!
//! The engine is single-task cooperative: every mutation flows through
//! [`CacheRegistry::handle_event`] on one event loop. Collaborators run
//! asynchronously and post [`EngineEvent`]s back through an [`EngineSender`];
//! at most one update runs per group at any time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use url::Url;

pub mod cache;
pub mod group;
pub mod host;
pub mod http;
pub mod policy;
pub mod registry;
pub mod store;
pub mod transport;

#[cfg(test)]
pub(crate) mod testutil;

pub use cache::Cache;
pub use group::{AttemptKind, CacheGroup, GroupState};
pub use host::{CacheHost, HostEvent};
pub use http::{HttpTransport, TokioTimers};
pub use policy::{AllowAllPolicy, Policy, PromptAnswer, PromptKind};
pub use registry::{CacheRegistry, NavigationSelection, NetworkDecision, StoredGroupInfo};
pub use transport::{FetchEvent, FetchRequest, Transport, Validators};

// ==================== Errors ====================

/// Errors surfaced by the engine's synchronous entry points. Once an update
/// is running, failures flow to hosts as lifecycle events instead.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Cache group is obsolete: {0}")]
    GroupObsolete(Url),

    #[error("No cache group for manifest URL: {0}")]
    GroupNotFound(Url),

    #[error("Unknown cache host: {0:?}")]
    HostNotFound(HostId),

    #[error("Host is not associated with any cache")]
    HostNotAssociated,

    #[error("No complete cache version available")]
    NoCompleteCache,

    #[error("Host already uses the newest cache version")]
    AlreadyNewest,

    #[error("Cache is already complete")]
    AlreadyComplete,

    #[error("Resource not stored: {0}")]
    NotStored(Url),

    #[error("Storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Persisted state error: {0}")]
    Persist(#[from] serde_json::Error),
}

impl EngineError {
    /// Create a storage error without a source.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Create a storage error wrapping a source error.
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

// ==================== Identifiers ====================

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            /// Allocate the next unique id.
            pub fn next() -> Self {
                static COUNTER: AtomicU64 = AtomicU64::new(1);
                Self(COUNTER.fetch_add(1, Ordering::Relaxed))
            }

            /// Raw numeric value, for logging.
            pub fn raw(&self) -> u64 {
                self.0
            }
        }
    };
}

define_id!(
    /// Identifies a registered cache host (a document/runtime consumer).
    HostId
);
define_id!(
    /// Identifies a cache group (one per manifest URL).
    GroupId
);
define_id!(
    /// Identifies one cache version inside a group.
    CacheId
);
define_id!(
    /// Typed handle for an outstanding fetch.
    FetchId
);
define_id!(
    /// Typed handle for an outstanding policy prompt.
    PromptId
);

/// Handle for the storage context holding one cache version's resource
/// bodies. Backed by the on-disk location name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextId(String);

impl ContextId {
    /// Generate a fresh context with a 32-char lowercase hex location name.
    pub fn generate() -> Self {
        Self(store::new_storage_location())
    }

    /// Reconstruct a context from a persisted location name.
    pub fn from_location(location: impl Into<String>) -> Self {
        Self(location.into())
    }

    /// The shared un-contexted store that document loads land in before an
    /// update copies them into a cache version.
    pub fn default_context() -> Self {
        Self("default".to_string())
    }

    /// The on-disk location name.
    pub fn location(&self) -> &str {
        &self.0
    }
}

// ==================== Configuration ====================

/// Tuning knobs for the update algorithm.
#[derive(Debug, Clone)]
pub struct UpdateConfig {
    /// Watchdog timeout: reset on every inbound fetch progress event, fires
    /// the failure path for whatever phase it interrupts.
    pub response_timeout: Duration,
    /// Delay before re-running an update whose manifest changed between the
    /// first and second fetch.
    pub restart_delay: Duration,
    /// Default per-group disk quota in kB.
    pub default_quota_kb: u64,
    /// Treat a manifest response without `text/cache-manifest` content type
    /// as a fetch failure.
    pub enforce_manifest_mime: bool,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(30),
            restart_delay: Duration::from_millis(1000),
            default_quota_kb: 5120,
            enforce_manifest_mime: true,
        }
    }
}

impl UpdateConfig {
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    pub fn with_default_quota_kb(mut self, quota_kb: u64) -> Self {
        self.default_quota_kb = quota_kb;
        self
    }

    pub fn with_enforce_manifest_mime(mut self, enforce: bool) -> Self {
        self.enforce_manifest_mime = enforce;
        self
    }
}

// ==================== Events ====================

/// Which per-group timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// The fetch-progress watchdog.
    Watchdog,
    /// The delayed-restart timer.
    Restart,
}

/// An event posted back to the engine's single event loop by a collaborator.
#[derive(Debug)]
pub enum EngineEvent {
    /// Progress on an outstanding fetch.
    Fetch { id: FetchId, event: FetchEvent },
    /// A scheduled per-group timer fired. Stale generations are ignored.
    Timer {
        group: GroupId,
        kind: TimerKind,
        generation: u64,
    },
    /// A policy prompt was answered.
    Prompt { id: PromptId, answer: PromptAnswer },
}

/// Cloneable sender half collaborators use to post events back to the
/// engine. Send failures (engine torn down) are silently dropped.
#[derive(Debug, Clone)]
pub struct EngineSender {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl EngineSender {
    /// Create a sender and the receiver the embedder drains into
    /// [`CacheRegistry::handle_event`].
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}

/// Timer collaborator: schedules a one-shot timer that posts
/// [`EngineEvent::Timer`] after `delay`.
pub trait Timers: Send {
    fn schedule(
        &mut self,
        group: GroupId,
        kind: TimerKind,
        generation: u64,
        delay: Duration,
        events: EngineSender,
    );
}
