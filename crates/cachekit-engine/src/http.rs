//! Production collaborators: a reqwest-backed [`Transport`] that streams
//! bodies into per-context storage directories, and tokio-backed [`Timers`].
//!
//! Each fetch runs as its own tokio task posting [`FetchEvent`]s back through
//! the [`EngineSender`]; redirects are reported, never followed.

use std::path::{Path, PathBuf};
use std::time::Duration;

use cachekit_common::retry::{retry_with_backoff, with_timeout, RetryConfig};
use futures::StreamExt;
use hashbrown::HashMap;
use http::header::{CONTENT_TYPE, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED, LOCATION};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use url::Url;

use crate::transport::{FetchEvent, FetchRequest, Transport, Validators};
use crate::{
    ContextId, EngineError, EngineEvent, EngineSender, FetchId, GroupId, Result, TimerKind, Timers,
};

// ==================== HTTP transport ====================

/// Transport backed by a shared reqwest client. Bodies are persisted under
/// `storage_root/<context location>/<body file name>` as they stream in.
pub struct HttpTransport {
    client: reqwest::Client,
    storage_root: PathBuf,
    response_timeout: Duration,
    retry: RetryConfig,
    tasks: HashMap<FetchId, tokio::task::JoinHandle<()>>,
}

impl HttpTransport {
    pub fn new(storage_root: PathBuf, response_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| EngineError::storage_with_source("failed to build HTTP client", e))?;
        Ok(Self {
            client,
            storage_root,
            response_timeout,
            retry: RetryConfig::default(),
            tasks: HashMap::new(),
        })
    }

    /// Replace the backoff schedule used when the initial request fails to
    /// go out. Body streaming is never retried; the engine's own failure
    /// rules govern that.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn context_dir(&self, context: &ContextId) -> PathBuf {
        self.storage_root.join(context.location())
    }
}

impl Transport for HttpTransport {
    fn fetch(&mut self, id: FetchId, request: FetchRequest, events: EngineSender) {
        // Completed tasks linger in the map until their id is reused for
        // cleanup; drop the finished ones opportunistically.
        self.tasks.retain(|_, task| !task.is_finished());

        let client = self.client.clone();
        let dir = self.context_dir(&request.context);
        let timeout = self.response_timeout;
        let retry = self.retry.clone();
        let task = tokio::spawn(async move {
            if let Err(message) =
                run_fetch(&client, &request, &dir, timeout, &retry, id, &events).await
            {
                events.send(EngineEvent::Fetch {
                    id,
                    event: FetchEvent::Failed { message },
                });
            }
        });
        self.tasks.insert(id, task);
    }

    fn stop(&mut self, id: FetchId) {
        if let Some(task) = self.tasks.remove(&id) {
            task.abort();
        }
    }

    fn copy_between_contexts(
        &mut self,
        url: &Url,
        src: &ContextId,
        dst: &ContextId,
    ) -> Result<u64> {
        let name = body_file_name(url);
        let from = self.context_dir(src).join(&name);
        if !from.exists() {
            return Err(EngineError::NotStored(url.clone()));
        }
        let dst_dir = self.context_dir(dst);
        std::fs::create_dir_all(&dst_dir)?;
        let size = std::fs::copy(&from, dst_dir.join(&name))?;
        debug!(url = %url, src = src.location(), dst = dst.location(), size, "Body copied");
        Ok(size)
    }

    fn delete_context(&mut self, context: &ContextId) {
        let dir = self.context_dir(context);
        if !dir.exists() {
            return;
        }
        if let Err(err) = std::fs::remove_dir_all(&dir) {
            warn!(location = context.location(), error = %err, "Failed to delete context");
        }
    }
}

async fn run_fetch(
    client: &reqwest::Client,
    request: &FetchRequest,
    dir: &Path,
    timeout: Duration,
    retry: &RetryConfig,
    id: FetchId,
    events: &EngineSender,
) -> std::result::Result<(), String> {
    let mut builder = client.get(request.url.clone());
    if let Some(validators) = &request.conditional {
        if let Some(etag) = &validators.etag {
            builder = builder.header(IF_NONE_MATCH, etag);
        }
        if let Some(modified) = &validators.last_modified {
            builder = builder.header(IF_MODIFIED_SINCE, modified);
        }
    }
    let outgoing = builder.build().map_err(|e| e.to_string())?;

    // Only the initial request is retried; once a response status is on the
    // wire the engine owns the failure semantics.
    let response = retry_with_backoff(retry, || {
        let attempt = outgoing.try_clone();
        async move {
            let attempt = attempt.ok_or_else(|| "request not retryable".to_string())?;
            with_timeout(timeout, || client.execute(attempt))
                .await
                .map_err(|e| e.to_string())?
                .map_err(|e| e.to_string())
        }
    })
    .await?;

    let status = response.status();
    if status == http::StatusCode::NOT_MODIFIED && request.conditional.is_some() {
        events.send(EngineEvent::Fetch {
            id,
            event: FetchEvent::NotModified,
        });
        return Ok(());
    }
    if status.is_redirection() {
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| request.url.join(v).ok())
            .ok_or_else(|| format!("redirect without usable location from {}", request.url))?;
        events.send(EngineEvent::Fetch {
            id,
            event: FetchEvent::Redirected { location },
        });
        return Ok(());
    }

    let header_str = |name| {
        response
            .headers()
            .get(name)
            .and_then(|v: &http::HeaderValue| v.to_str().ok())
            .map(str::to_string)
    };
    events.send(EngineEvent::Fetch {
        id,
        event: FetchEvent::Status {
            status: status.as_u16(),
            content_type: header_str(CONTENT_TYPE),
            validators: Validators {
                etag: header_str(ETAG),
                last_modified: header_str(LAST_MODIFIED),
            },
        },
    });

    if !status.is_success() {
        // The engine acts on the status alone; the error body is not stored.
        events.send(EngineEvent::Fetch {
            id,
            event: FetchEvent::Done,
        });
        return Ok(());
    }

    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| e.to_string())?;
    let path = dir.join(body_file_name(&request.url));
    let mut file = tokio::fs::File::create(&path)
        .await
        .map_err(|e| e.to_string())?;

    let mut stream = response.bytes_stream();
    loop {
        let next = with_timeout(timeout, || stream.next())
            .await
            .map_err(|e| e.to_string())?;
        let Some(chunk) = next else {
            break;
        };
        let chunk = chunk.map_err(|e| e.to_string())?;
        file.write_all(&chunk).await.map_err(|e| e.to_string())?;
        events.send(EngineEvent::Fetch {
            id,
            event: FetchEvent::Data { chunk },
        });
    }
    file.flush().await.map_err(|e| e.to_string())?;

    events.send(EngineEvent::Fetch {
        id,
        event: FetchEvent::Done,
    });
    Ok(())
}

/// Stored body file name: hex SHA-256 of the URL.
fn body_file_name(url: &Url) -> String {
    let digest = Sha256::digest(url.as_str().as_bytes());
    use std::fmt::Write;
    let mut out = String::with_capacity(64);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

// ==================== Tokio timers ====================

/// [`Timers`] backed by `tokio::time`. Each schedule is an independent task;
/// stale generations are filtered by the group on delivery.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioTimers;

impl Timers for TokioTimers {
    fn schedule(
        &mut self,
        group: GroupId,
        kind: TimerKind,
        generation: u64,
        delay: Duration,
        events: EngineSender,
    ) {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            events.send(EngineEvent::Timer {
                group,
                kind,
                generation,
            });
        });
    }
}
