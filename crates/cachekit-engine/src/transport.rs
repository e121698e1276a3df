//! Transport collaborator: byte-level resource fetching and the per-context
//! body store.

use bytes::Bytes;
use url::Url;

use crate::{ContextId, EngineSender, FetchId, Result};

/// HTTP validators carried between a response and a later conditional fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Validators {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// A single fetch issued by the engine.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: Url,
    /// Storage context the body is persisted under.
    pub context: ContextId,
    /// Validators for a conditional fetch; `None` fetches unconditionally.
    pub conditional: Option<Validators>,
}

/// Events emitted for one fetch, posted as [`crate::EngineEvent::Fetch`].
///
/// Sequence: `Status` then zero or more `Data` then `Done`; or one of the
/// terminal events `Redirected`, `NotModified`, `Failed`.
#[derive(Debug, Clone)]
pub enum FetchEvent {
    /// The server answered with a redirect. Terminal: redirects are reported,
    /// never followed.
    Redirected { location: Url },
    /// Response headers arrived.
    Status {
        status: u16,
        content_type: Option<String>,
        validators: Validators,
    },
    /// A chunk of body bytes arrived (already persisted to the context).
    Data { chunk: Bytes },
    /// The body finished.
    Done,
    /// Conditional fetch: the resource is unchanged. Terminal.
    NotModified,
    /// Network-level failure (DNS, connect, timeout). Terminal.
    Failed { message: String },
}

/// The byte-level fetcher and per-context body store. Fetches are
/// fire-and-forget; progress comes back through the [`EngineSender`].
pub trait Transport: Send {
    /// Start a fetch. Events for it carry `id`.
    fn fetch(&mut self, id: FetchId, request: FetchRequest, events: EngineSender);

    /// Stop an outstanding fetch. No further events are delivered for it.
    fn stop(&mut self, id: FetchId);

    /// Copy a stored body between contexts without re-fetching. Returns the
    /// body size in bytes, or [`crate::EngineError::NotStored`].
    fn copy_between_contexts(&mut self, url: &Url, src: &ContextId, dst: &ContextId)
        -> Result<u64>;

    /// Delete a context and every body stored under it.
    fn delete_context(&mut self, context: &ContextId);
}
