//! Request/response channel to the isolated worker
//!
//! The channel spawns the worker lazily through a [`WorkerFactory`], waits for
//! its handshake, and correlates each request with its response by id. Every
//! request carries its own timeout. Concurrent callers of
//! [`WorkerChannel::ensure_ready`] share a single initialization attempt.

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::config::IsolationConfig;
use crate::engine::{WorkerEnvelope, WorkerEvent, WorkerFactory, WorkerInterrupt, WorkerLink, WorkerRequest};
use crate::error::{LoaderError, LoaderResult};

/// Channel lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Uninitialized,
    Initializing,
    Ready,
    /// The worker exited or reported a fatal error
    Terminated,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelState::Uninitialized => "uninitialized",
            ChannelState::Initializing => "initializing",
            ChannelState::Ready => "ready",
            ChannelState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

type InitFuture = Shared<BoxFuture<'static, LoaderResult<()>>>;

struct PendingRequest {
    reply: oneshot::Sender<LoaderResult<serde_json::Value>>,
    timer: AbortHandle,
}

struct ChannelCore {
    state: ChannelState,
    /// Bumped whenever the worker link is torn down; stale tasks compare against it
    generation: u64,
    init: Option<InitFuture>,
    link: Option<mpsc::UnboundedSender<WorkerEnvelope>>,
    interrupt: Option<WorkerInterrupt>,
    pending: HashMap<u64, PendingRequest>,
    dispatcher: Option<JoinHandle<()>>,
}

struct ChannelInner {
    factory: Arc<dyn WorkerFactory>,
    config: IsolationConfig,
    core: Mutex<ChannelCore>,
    next_id: AtomicU64,
}

enum StartError {
    Timeout,
    Fatal(LoaderError),
}

/// Channel to the isolated worker
#[derive(Clone)]
pub struct WorkerChannel {
    inner: Arc<ChannelInner>,
}

impl WorkerChannel {
    pub fn new(factory: Arc<dyn WorkerFactory>, config: IsolationConfig) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                factory,
                config,
                core: Mutex::new(ChannelCore {
                    state: ChannelState::Uninitialized,
                    generation: 0,
                    init: None,
                    link: None,
                    interrupt: None,
                    pending: HashMap::new(),
                    dispatcher: None,
                }),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> ChannelState {
        self.inner.core.lock().state
    }

    pub fn pending_count(&self) -> usize {
        self.inner.core.lock().pending.len()
    }

    /// Start the worker if needed and wait for its handshake
    pub async fn ensure_ready(&self) -> LoaderResult<()> {
        let init = {
            let mut core = self.inner.core.lock();
            if core.state == ChannelState::Ready {
                return Ok(());
            }
            match &core.init {
                Some(init) => init.clone(),
                None => {
                    let inner = Arc::clone(&self.inner);
                    let generation = core.generation;
                    let init = async move { inner.initialize(generation).await }
                        .boxed()
                        .shared();
                    core.state = ChannelState::Initializing;
                    core.init = Some(init.clone());
                    init
                }
            }
        };
        init.await
    }

    /// Send a request with the configured request timeout
    pub async fn send(&self, request: WorkerRequest) -> LoaderResult<serde_json::Value> {
        let timeout = self.inner.config.request_timeout();
        self.send_with_timeout(request, timeout).await
    }

    /// Send a request and wait for its correlated response
    pub async fn send_with_timeout(
        &self,
        request: WorkerRequest,
        timeout: Duration,
    ) -> LoaderResult<serde_json::Value> {
        let kind = request.kind();
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (reply, response) = oneshot::channel();

        {
            let mut core = self.inner.core.lock();
            if core.state != ChannelState::Ready {
                return Err(LoaderError::Channel(format!(
                    "cannot send {} while channel is {}",
                    kind, core.state
                )));
            }
            let Some(link) = core.link.clone() else {
                return Err(LoaderError::Channel("worker link missing".to_string()));
            };

            let weak = Arc::downgrade(&self.inner);
            let timer = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(inner) = weak.upgrade() {
                    inner.expire(id, kind, timeout);
                }
            })
            .abort_handle();
            core.pending.insert(id, PendingRequest { reply, timer });

            if link.send(WorkerEnvelope { id, request }).is_err() {
                if let Some(pending) = core.pending.remove(&id) {
                    pending.timer.abort();
                }
                return Err(LoaderError::Channel("worker is not running".to_string()));
            }
            debug!("Sent worker request #{} ({})", id, kind);
        }

        response.await.unwrap_or(Err(LoaderError::Terminated))
    }

    /// Stop the worker and reject every outstanding request.
    ///
    /// Guest code still running on the worker is interrupted, so a worker
    /// stuck in a request exits instead of holding its thread.
    pub fn terminate(&self) {
        let (link, interrupt, pending, dispatcher) = {
            let mut core = self.inner.core.lock();
            core.generation += 1;
            core.state = ChannelState::Uninitialized;
            core.init = None;
            (
                core.link.take(),
                core.interrupt.take(),
                std::mem::take(&mut core.pending),
                core.dispatcher.take(),
            )
        };

        if let Some(link) = link {
            let _ = link.send(WorkerEnvelope {
                id: 0,
                request: WorkerRequest::Shutdown,
            });
        }
        if let Some(interrupt) = interrupt {
            interrupt.interrupt();
        }
        if let Some(dispatcher) = dispatcher {
            dispatcher.abort();
        }

        let rejected = pending.len();
        for (_, request) in pending {
            request.timer.abort();
            let _ = request.reply.send(Err(LoaderError::Terminated));
        }
        info!("Worker channel terminated ({} pending request(s) rejected)", rejected);
    }
}

impl ChannelInner {
    async fn initialize(self: Arc<Self>, generation: u64) -> LoaderResult<()> {
        let attempts = self.config.init_retries + 1;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.start_worker(generation).await {
                Ok(()) => {
                    info!("Worker channel ready (attempt {}/{})", attempt, attempts);
                    return Ok(());
                }
                Err(StartError::Fatal(e)) => {
                    error!("Worker failed to start: {}", e);
                    self.reset_after_failed_init(generation);
                    return Err(match e {
                        LoaderError::ChannelInitializationFailure(_) | LoaderError::Terminated => e,
                        other => LoaderError::ChannelInitializationFailure(other.to_string()),
                    });
                }
                Err(StartError::Timeout) => {
                    last_error = format!(
                        "no handshake within {}ms",
                        self.config.init_timeout_ms
                    );
                    warn!(
                        "Worker handshake attempt {}/{} timed out",
                        attempt, attempts
                    );
                    if attempt < attempts {
                        tokio::time::sleep(self.config.init_backoff() * attempt).await;
                    }
                }
            }
        }

        self.reset_after_failed_init(generation);
        Err(LoaderError::ChannelInitializationFailure(format!(
            "worker did not become ready after {} attempt(s): {}",
            attempts, last_error
        )))
    }

    async fn start_worker(self: &Arc<Self>, generation: u64) -> Result<(), StartError> {
        let WorkerLink {
            requests,
            mut events,
            interrupt,
        } = self.factory.spawn().map_err(StartError::Fatal)?;

        let handshake = tokio::time::timeout(self.config.init_timeout(), events.recv()).await;
        match handshake {
            Ok(Some(WorkerEvent::Ready)) => {
                let mut core = self.core.lock();
                if core.generation != generation {
                    return Err(StartError::Fatal(LoaderError::Terminated));
                }
                let dispatcher = tokio::spawn(dispatch(Arc::downgrade(self), events, generation));
                core.link = Some(requests);
                core.interrupt = interrupt;
                core.dispatcher = Some(dispatcher);
                core.state = ChannelState::Ready;
                core.init = None;
                Ok(())
            }
            Ok(Some(WorkerEvent::Error(message))) => {
                Err(StartError::Fatal(LoaderError::Channel(message)))
            }
            Ok(Some(WorkerEvent::Response { id, .. })) => Err(StartError::Fatal(LoaderError::Channel(
                format!("worker answered request #{} before its handshake", id),
            ))),
            Ok(None) => Err(StartError::Fatal(LoaderError::Channel(
                "worker exited before its handshake".to_string(),
            ))),
            Err(_) => Err(StartError::Timeout),
        }
    }

    fn reset_after_failed_init(&self, generation: u64) {
        let mut core = self.core.lock();
        if core.generation == generation {
            core.state = ChannelState::Uninitialized;
            core.init = None;
        }
    }

    fn resolve(&self, id: u64, result: LoaderResult<serde_json::Value>) {
        let pending = self.core.lock().pending.remove(&id);
        match pending {
            Some(request) => {
                request.timer.abort();
                let _ = request.reply.send(result);
            }
            None => debug!("Ignoring response for unknown request #{}", id),
        }
    }

    fn expire(&self, id: u64, kind: &'static str, timeout: Duration) {
        let pending = self.core.lock().pending.remove(&id);
        if let Some(request) = pending {
            warn!("Worker request #{} ({}) timed out", id, kind);
            let _ = request.reply.send(Err(LoaderError::ChannelTimeout {
                request_id: id,
                kind: kind.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }));
        }
    }

    /// The worker is gone: reject everything outstanding
    fn fail(&self, generation: u64, error: LoaderError) {
        let pending = {
            let mut core = self.core.lock();
            if core.generation != generation {
                return;
            }
            core.generation += 1;
            core.state = ChannelState::Terminated;
            core.init = None;
            core.link = None;
            core.interrupt = None;
            core.dispatcher = None;
            std::mem::take(&mut core.pending)
        };

        error!("Worker channel failed: {}", error);
        for (_, request) in pending {
            request.timer.abort();
            let _ = request.reply.send(Err(error.clone()));
        }
    }
}

async fn dispatch(
    inner: Weak<ChannelInner>,
    mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    generation: u64,
) {
    while let Some(event) = events.recv().await {
        let Some(channel) = inner.upgrade() else {
            return;
        };
        match event {
            WorkerEvent::Response { id, result } => channel.resolve(id, result),
            WorkerEvent::Error(message) => {
                channel.fail(generation, LoaderError::Channel(message));
                return;
            }
            WorkerEvent::Ready => debug!("Ignoring repeated worker handshake"),
        }
    }

    if let Some(channel) = inner.upgrade() {
        channel.fail(generation, LoaderError::Channel("worker exited".to_string()));
    }
}
