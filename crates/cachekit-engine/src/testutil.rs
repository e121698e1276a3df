//! Test doubles for the engine's collaborators: a scripted transport, a
//! recording timer sink, an auto-answering policy, and an event-recording
//! host, wired together by [`Harness`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use hashbrown::HashMap;
use tokio::sync::mpsc;
use url::Url;

use crate::host::{CacheHost, HostEvent};
use crate::policy::{Policy, PromptAnswer, PromptKind};
use crate::registry::CacheRegistry;
use crate::transport::{FetchEvent, FetchRequest, Transport, Validators};
use crate::{
    ContextId, EngineError, EngineEvent, EngineSender, FetchId, GroupId, HostId, PromptId, Result,
    TimerKind, Timers, UpdateConfig,
};

// ==================== Scripted transport ====================

/// One scripted response, consumed in order per URL.
#[derive(Debug, Clone)]
pub(crate) struct ScriptedResponse {
    status: u16,
    content_type: Option<String>,
    etag: Option<String>,
    body: Vec<u8>,
    chunk_size: usize,
    not_modified: bool,
}

impl ScriptedResponse {
    pub(crate) fn ok(content_type: &str, body: impl AsRef<[u8]>) -> Self {
        Self {
            status: 200,
            content_type: Some(content_type.to_string()),
            etag: None,
            body: body.as_ref().to_vec(),
            chunk_size: usize::MAX,
            not_modified: false,
        }
    }

    /// A 200 with the manifest content type.
    pub(crate) fn manifest(text: &str) -> Self {
        Self::ok("text/cache-manifest", text.as_bytes())
    }

    /// A bodyless response with this status code.
    pub(crate) fn status(status: u16) -> Self {
        Self {
            status,
            content_type: None,
            etag: None,
            body: Vec::new(),
            chunk_size: usize::MAX,
            not_modified: false,
        }
    }

    /// Answer a conditional fetch with 304.
    pub(crate) fn not_modified() -> Self {
        Self {
            not_modified: true,
            ..Self::status(304)
        }
    }

    pub(crate) fn with_etag(mut self, etag: &str) -> Self {
        self.etag = Some(etag.to_string());
        self
    }

    /// Deliver the body in chunks of at most this many bytes.
    pub(crate) fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }
}

#[derive(Default)]
struct TransportState {
    scripts: HashMap<Url, VecDeque<ScriptedResponse>>,
    fetch_counts: HashMap<Url, usize>,
    /// Stored bodies keyed by (context location, url), value is the size.
    stored: HashMap<(String, Url), u64>,
}

/// Transport double that answers fetches from a per-URL script queue. All
/// events for a fetch are posted synchronously; the engine's stale-fetch
/// handling drops whatever arrives after a `stop`.
#[derive(Clone, Default)]
pub(crate) struct MockTransport {
    state: Arc<Mutex<TransportState>>,
}

impl MockTransport {
    pub(crate) fn script(&self, url: &Url, response: ScriptedResponse) {
        self.state
            .lock()
            .unwrap()
            .scripts
            .entry(url.clone())
            .or_default()
            .push_back(response);
    }

    /// Pretend a body of `size` bytes is already stored under `context`.
    pub(crate) fn seed_body(&self, context: &ContextId, url: &Url, size: u64) {
        self.state
            .lock()
            .unwrap()
            .stored
            .insert((context.location().to_string(), url.clone()), size);
    }

    pub(crate) fn fetch_count(&self, url: &Url) -> usize {
        self.state
            .lock()
            .unwrap()
            .fetch_counts
            .get(url)
            .copied()
            .unwrap_or(0)
    }
}

impl Transport for MockTransport {
    fn fetch(&mut self, id: FetchId, request: FetchRequest, events: EngineSender) {
        let mut state = self.state.lock().unwrap();
        *state.fetch_counts.entry(request.url.clone()).or_insert(0) += 1;

        let Some(response) = state
            .scripts
            .get_mut(&request.url)
            .and_then(|q| q.pop_front())
        else {
            drop(state);
            events.send(EngineEvent::Fetch {
                id,
                event: FetchEvent::Failed {
                    message: format!("no scripted response for {}", request.url),
                },
            });
            return;
        };

        if response.not_modified {
            drop(state);
            events.send(EngineEvent::Fetch {
                id,
                event: FetchEvent::NotModified,
            });
            return;
        }

        if (200..=299).contains(&response.status) {
            state.stored.insert(
                (request.context.location().to_string(), request.url.clone()),
                response.body.len() as u64,
            );
        }
        drop(state);

        events.send(EngineEvent::Fetch {
            id,
            event: FetchEvent::Status {
                status: response.status,
                content_type: response.content_type.clone(),
                validators: Validators {
                    etag: response.etag.clone(),
                    last_modified: None,
                },
            },
        });
        if (200..=299).contains(&response.status) {
            for chunk in response.body.chunks(response.chunk_size) {
                events.send(EngineEvent::Fetch {
                    id,
                    event: FetchEvent::Data {
                        chunk: Bytes::copy_from_slice(chunk),
                    },
                });
            }
        }
        events.send(EngineEvent::Fetch {
            id,
            event: FetchEvent::Done,
        });
    }

    fn stop(&mut self, _id: FetchId) {}

    fn copy_between_contexts(
        &mut self,
        url: &Url,
        src: &ContextId,
        dst: &ContextId,
    ) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let size = state
            .stored
            .get(&(src.location().to_string(), url.clone()))
            .copied()
            .ok_or_else(|| EngineError::NotStored(url.clone()))?;
        state
            .stored
            .insert((dst.location().to_string(), url.clone()), size);
        Ok(size)
    }

    fn delete_context(&mut self, context: &ContextId) {
        self.state
            .lock()
            .unwrap()
            .stored
            .retain(|(location, _), _| location != context.location());
    }
}

// ==================== Recording timers ====================

/// Timer double that records every schedule and fires nothing on its own.
/// Tests replay a timer by posting the recorded [`EngineEvent::Timer`].
#[derive(Clone, Default)]
pub(crate) struct MockTimers {
    scheduled: Arc<Mutex<Vec<(GroupId, TimerKind, u64, Duration)>>>,
}

impl MockTimers {
    pub(crate) fn last_scheduled(&self) -> Option<(GroupId, TimerKind, u64, Duration)> {
        self.scheduled.lock().unwrap().last().cloned()
    }
}

impl Timers for MockTimers {
    fn schedule(
        &mut self,
        group: GroupId,
        kind: TimerKind,
        generation: u64,
        delay: Duration,
        _events: EngineSender,
    ) {
        self.scheduled
            .lock()
            .unwrap()
            .push((group, kind, generation, delay));
    }
}

// ==================== Scripted policy ====================

#[derive(Default)]
struct PolicyState {
    asked: Vec<PromptKind>,
    cancelled: Vec<PromptId>,
    quota_answer: Option<PromptAnswer>,
}

/// Policy double: allows installs and update checks immediately, denies
/// quota increases unless an answer was scripted.
#[derive(Clone, Default)]
pub(crate) struct ScriptedPolicy {
    state: Arc<Mutex<PolicyState>>,
}

impl ScriptedPolicy {
    pub(crate) fn set_quota_answer(&self, answer: PromptAnswer) {
        self.state.lock().unwrap().quota_answer = Some(answer);
    }

    pub(crate) fn asked(&self) -> Vec<PromptKind> {
        self.state.lock().unwrap().asked.clone()
    }
}

impl Policy for ScriptedPolicy {
    fn ask(&mut self, id: PromptId, _manifest_url: &Url, kind: PromptKind, events: EngineSender) {
        let mut state = self.state.lock().unwrap();
        state.asked.push(kind);
        let answer = match kind {
            PromptKind::IncreaseQuota { .. } => {
                state.quota_answer.unwrap_or(PromptAnswer::Denied)
            }
            _ => PromptAnswer::Allowed,
        };
        drop(state);
        events.send(EngineEvent::Prompt { id, answer });
    }

    fn cancel(&mut self, id: PromptId) {
        self.state.lock().unwrap().cancelled.push(id);
    }
}

// ==================== Recording host ====================

struct RecordingHost {
    events: Arc<Mutex<Vec<HostEvent>>>,
}

impl CacheHost for RecordingHost {
    fn notify(&self, event: HostEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Honors `RUST_LOG` when a test run wants engine traces.
fn init_test_logging() {
    let _ = cachekit_common::init_logging(&cachekit_common::LogConfig::for_tests());
}

// ==================== Harness ====================

/// A registry wired to the mock collaborators, with an inline event pump.
pub(crate) struct Harness {
    pub(crate) registry: CacheRegistry,
    pub(crate) transport: MockTransport,
    pub(crate) timers: MockTimers,
    pub(crate) policy: ScriptedPolicy,
    rx: mpsc::UnboundedReceiver<EngineEvent>,
}

impl Harness {
    pub(crate) fn new() -> Self {
        Self::with_config(UpdateConfig::default())
    }

    pub(crate) fn with_config(config: UpdateConfig) -> Self {
        init_test_logging();
        let transport = MockTransport::default();
        let timers = MockTimers::default();
        let policy = ScriptedPolicy::default();
        let (registry, rx) = CacheRegistry::new(
            Box::new(transport.clone()),
            Box::new(policy.clone()),
            Box::new(timers.clone()),
            config,
        );
        Self {
            registry,
            transport,
            timers,
            policy,
            rx,
        }
    }

    /// Register a host that records every event it receives.
    pub(crate) fn add_host(&mut self) -> (HostId, Arc<Mutex<Vec<HostEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let id = self.registry.register_host(Box::new(RecordingHost {
            events: events.clone(),
        }));
        (id, events)
    }

    /// Handle the next queued engine event, if any. Lets a test stop at a
    /// particular point mid-update and inject calls there.
    pub(crate) fn step(&mut self) -> bool {
        match self.rx.try_recv() {
            Ok(event) => {
                self.registry.handle_event(event);
                true
            }
            Err(_) => false,
        }
    }

    /// Drain every queued engine event, including those posted while
    /// handling earlier ones.
    pub(crate) fn pump(&mut self) {
        while self.step() {}
    }
}
