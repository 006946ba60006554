//! Isolated worker runtime
//!
//! The worker owns its own wasmtime engine and instances and is reachable
//! only through message passing: [`WorkerEnvelope`]s in, [`WorkerEvent`]s out.
//! It announces itself with [`WorkerEvent::Ready`] and then serves requests
//! one at a time until told to shut down or its request channel closes.

use serde_json::json;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use wasmtime::{Config, Engine};

use super::WasmModuleInstance;
use crate::config::ReadinessConfig;
use crate::descriptor::{ModuleArg, ModuleDescriptor};
use crate::error::{LoaderError, LoaderResult};

/// Request understood by the worker
#[derive(Clone)]
pub enum WorkerRequest {
    /// Instantiate a module in a fresh store and wait for its readiness signal
    LoadModule {
        descriptor: ModuleDescriptor,
        /// Load generation; an instance of a newer generation is never replaced
        generation: u64,
        bytes: Arc<Vec<u8>>,
        readiness: ReadinessConfig,
    },
    Invoke {
        module: String,
        function: String,
        args: Vec<ModuleArg>,
    },
    /// Drop the module if it is still at `generation`
    Unload {
        module: String,
        generation: u64,
    },
    Status,
    Shutdown,
}

impl WorkerRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerRequest::LoadModule { .. } => "load_module",
            WorkerRequest::Invoke { .. } => "invoke",
            WorkerRequest::Unload { .. } => "unload",
            WorkerRequest::Status => "status",
            WorkerRequest::Shutdown => "shutdown",
        }
    }
}

/// Correlated request
#[derive(Clone)]
pub struct WorkerEnvelope {
    pub id: u64,
    pub request: WorkerRequest,
}

/// Message from the worker
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// Handshake: the worker is accepting requests
    Ready,
    Response {
        id: u64,
        result: Result<serde_json::Value, LoaderError>,
    },
    /// Unrecoverable worker failure; the worker exits after sending it
    Error(String),
}

/// Stops guest code running on a worker.
///
/// The worker's engine runs with epoch interruption; bumping the epoch traps
/// whatever call is in progress, so a module stuck in a loop releases the
/// worker thread.
#[derive(Clone)]
pub struct WorkerInterrupt {
    engine: Engine,
}

impl WorkerInterrupt {
    pub fn interrupt(&self) {
        self.engine.increment_epoch();
    }
}

/// Caller side of a worker connection
pub struct WorkerLink {
    pub requests: mpsc::UnboundedSender<WorkerEnvelope>,
    pub events: mpsc::UnboundedReceiver<WorkerEvent>,
    /// Present when the worker's guest code can be interrupted
    pub interrupt: Option<WorkerInterrupt>,
}

/// Worker side of a worker connection
pub struct WorkerEndpoint {
    pub requests: mpsc::UnboundedReceiver<WorkerEnvelope>,
    pub events: mpsc::UnboundedSender<WorkerEvent>,
}

impl WorkerLink {
    /// Connected link/endpoint pair
    pub fn pair() -> (WorkerLink, WorkerEndpoint) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            WorkerLink {
                requests: request_tx,
                events: event_rx,
                interrupt: None,
            },
            WorkerEndpoint {
                requests: request_rx,
                events: event_tx,
            },
        )
    }
}

/// Creates isolated workers
pub trait WorkerFactory: Send + Sync {
    /// Whether isolated execution is possible on this host
    fn is_supported(&self) -> bool;

    fn spawn(&self) -> LoaderResult<WorkerLink>;
}

/// Runs each worker on a dedicated OS thread
#[derive(Debug, Clone)]
pub struct ThreadWorkerFactory {
    thread_name: String,
}

impl ThreadWorkerFactory {
    pub fn new() -> Self {
        Self {
            thread_name: "kiln-worker".to_string(),
        }
    }

    pub fn with_thread_name(mut self, name: &str) -> Self {
        self.thread_name = name.to_string();
        self
    }
}

impl Default for ThreadWorkerFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerFactory for ThreadWorkerFactory {
    fn is_supported(&self) -> bool {
        true
    }

    fn spawn(&self) -> LoaderResult<WorkerLink> {
        let engine = Engine::new(Config::new().epoch_interruption(true)).map_err(|e| {
            LoaderError::ChannelInitializationFailure(format!("failed to create worker engine: {}", e))
        })?;

        let (mut link, endpoint) = WorkerLink::pair();
        link.interrupt = Some(WorkerInterrupt {
            engine: engine.clone(),
        });
        std::thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || run_worker_with_engine(endpoint, engine))
            .map_err(|e| {
                LoaderError::ChannelInitializationFailure(format!("failed to spawn worker thread: {}", e))
            })?;
        Ok(link)
    }
}

/// Worker main loop on a default engine; blocks the calling thread
pub fn run_worker(endpoint: WorkerEndpoint) {
    run_worker_with_engine(endpoint, Engine::default())
}

/// Worker main loop; blocks the calling thread
pub fn run_worker_with_engine(endpoint: WorkerEndpoint, engine: Engine) {
    let WorkerEndpoint {
        mut requests,
        events,
    } = endpoint;
    let mut runtime = WorkerRuntime::new(engine);

    if events.send(WorkerEvent::Ready).is_err() {
        return;
    }
    info!("Worker started");

    while let Some(WorkerEnvelope { id, request }) = requests.blocking_recv() {
        if matches!(request, WorkerRequest::Shutdown) {
            debug!("Worker received shutdown");
            break;
        }

        let kind = request.kind();
        match panic::catch_unwind(AssertUnwindSafe(|| runtime.handle(request))) {
            Ok(result) => {
                if events.send(WorkerEvent::Response { id, result }).is_err() {
                    break;
                }
            }
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!("Worker panicked while handling {} #{}: {}", kind, id, message);
                let _ = events.send(WorkerEvent::Error(format!("worker panicked: {}", message)));
                break;
            }
        }
    }

    info!("Worker exiting");
}

struct HostedModule {
    generation: u64,
    instance: WasmModuleInstance,
}

struct WorkerRuntime {
    engine: Engine,
    modules: HashMap<String, HostedModule>,
    started_at: Instant,
    handled: u64,
}

impl WorkerRuntime {
    fn new(engine: Engine) -> Self {
        Self {
            engine,
            modules: HashMap::new(),
            started_at: Instant::now(),
            handled: 0,
        }
    }

    fn handle(&mut self, request: WorkerRequest) -> LoaderResult<serde_json::Value> {
        self.handled += 1;
        match request {
            WorkerRequest::LoadModule {
                descriptor,
                generation,
                bytes,
                readiness,
            } => self.load(&descriptor, generation, &bytes, &readiness),
            WorkerRequest::Invoke {
                module,
                function,
                args,
            } => self
                .modules
                .get_mut(&module)
                .ok_or(LoaderError::ModuleNotLoaded(module))?
                .instance
                .invoke(&function, &args)
                .map(serde_json::Value::String),
            WorkerRequest::Unload { module, generation } => {
                let unloaded = self
                    .modules
                    .get(&module)
                    .is_some_and(|hosted| hosted.generation == generation);
                if unloaded {
                    self.modules.remove(&module);
                }
                Ok(json!({ "module": module, "unloaded": unloaded }))
            }
            WorkerRequest::Status => {
                let mut modules: Vec<&String> = self.modules.keys().collect();
                modules.sort();
                Ok(json!({
                    "modules": modules,
                    "handled": self.handled,
                    "uptime_ms": self.started_at.elapsed().as_millis() as u64,
                }))
            }
            WorkerRequest::Shutdown => Ok(serde_json::Value::Null),
        }
    }

    fn load(
        &mut self,
        descriptor: &ModuleDescriptor,
        generation: u64,
        bytes: &[u8],
        readiness: &ReadinessConfig,
    ) -> LoaderResult<serde_json::Value> {
        if let Some(current) = self.modules.get(&descriptor.id)
            && current.generation > generation
        {
            return Err(LoaderError::Superseded {
                module: descriptor.id.clone(),
                current: current.generation,
            });
        }
        // A retried load never reuses state from the previous attempt.
        self.modules.remove(&descriptor.id);

        let mut instance = WasmModuleInstance::instantiate(&self.engine, descriptor, bytes)?;

        let started = Instant::now();
        while !instance.is_ready() {
            if started.elapsed() >= readiness.timeout() {
                return Err(LoaderError::ReadinessTimeout {
                    module: descriptor.id.clone(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            std::thread::sleep(readiness.poll_interval());
        }

        let exports = instance.exports().to_vec();
        self.modules
            .insert(descriptor.id.clone(), HostedModule { generation, instance });
        debug!("Worker loaded module {} (generation {})", descriptor.id, generation);
        Ok(json!({ "module": descriptor.id, "generation": generation, "exports": exports }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::wasm::tests::ECHO_WAT;

    async fn request(
        link: &mut WorkerLink,
        id: u64,
        request: WorkerRequest,
    ) -> Result<serde_json::Value, LoaderError> {
        link.requests.send(WorkerEnvelope { id, request }).unwrap();
        match link.events.recv().await.unwrap() {
            WorkerEvent::Response { id: got, result } => {
                assert_eq!(got, id);
                result
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_thread_worker_lifecycle() {
        let mut link = ThreadWorkerFactory::new().spawn().unwrap();
        assert!(matches!(link.events.recv().await, Some(WorkerEvent::Ready)));

        let descriptor = ModuleDescriptor::new("crypto", "wasm/crypto.wasm", "1");
        let loaded = request(
            &mut link,
            1,
            WorkerRequest::LoadModule {
                descriptor,
                generation: 1,
                bytes: Arc::new(ECHO_WAT.as_bytes().to_vec()),
                readiness: ReadinessConfig::default(),
            },
        )
        .await
        .unwrap();
        assert_eq!(loaded["module"], "crypto");

        let echoed = request(
            &mut link,
            2,
            WorkerRequest::Invoke {
                module: "crypto".to_string(),
                function: "echo".to_string(),
                args: vec!["ping".into()],
            },
        )
        .await
        .unwrap();
        assert_eq!(echoed, json!("ping"));

        let status = request(&mut link, 3, WorkerRequest::Status).await.unwrap();
        assert_eq!(status["modules"], json!(["crypto"]));

        let missing = request(
            &mut link,
            4,
            WorkerRequest::Invoke {
                module: "identity".to_string(),
                function: "prove".to_string(),
                args: vec![],
            },
        )
        .await;
        assert!(matches!(missing, Err(LoaderError::ModuleNotLoaded(_))));

        link.requests
            .send(WorkerEnvelope {
                id: 5,
                request: WorkerRequest::Shutdown,
            })
            .unwrap();
        assert!(link.events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_worker_readiness_timeout() {
        let mut link = ThreadWorkerFactory::new().spawn().unwrap();
        assert!(matches!(link.events.recv().await, Some(WorkerEvent::Ready)));

        let wat = r#"(module (global (export "crypto_ready") (mut i32) (i32.const 0)))"#;
        let result = request(
            &mut link,
            1,
            WorkerRequest::LoadModule {
                descriptor: ModuleDescriptor::new("crypto", "wasm/crypto.wasm", "1"),
                generation: 1,
                bytes: Arc::new(wat.as_bytes().to_vec()),
                readiness: ReadinessConfig {
                    poll_interval_ms: 5,
                    timeout_ms: 25,
                },
            },
        )
        .await;
        assert!(matches!(result, Err(LoaderError::ReadinessTimeout { .. })));
    }

    #[tokio::test]
    async fn test_worker_exits_when_link_dropped() {
        let WorkerLink {
            requests, mut events, ..
        } = ThreadWorkerFactory::new().spawn().unwrap();
        assert!(matches!(events.recv().await, Some(WorkerEvent::Ready)));
        drop(requests);
        assert!(events.recv().await.is_none());
    }

    fn load(generation: u64, wat: &str) -> WorkerRequest {
        WorkerRequest::LoadModule {
            descriptor: ModuleDescriptor::new("crypto", "wasm/crypto.wasm", "1"),
            generation,
            bytes: Arc::new(wat.as_bytes().to_vec()),
            readiness: ReadinessConfig::default(),
        }
    }

    #[tokio::test]
    async fn test_worker_keeps_newest_generation() {
        let mut link = ThreadWorkerFactory::new().spawn().unwrap();
        assert!(matches!(link.events.recv().await, Some(WorkerEvent::Ready)));

        request(&mut link, 1, load(2, ECHO_WAT)).await.unwrap();
        let stale = request(&mut link, 2, load(1, ECHO_WAT)).await;
        assert!(matches!(stale, Err(LoaderError::Superseded { current: 2, .. })));

        let unload = |generation| WorkerRequest::Unload {
            module: "crypto".to_string(),
            generation,
        };
        let kept = request(&mut link, 3, unload(1)).await.unwrap();
        assert_eq!(kept["unloaded"], false);
        let dropped = request(&mut link, 4, unload(2)).await.unwrap();
        assert_eq!(dropped["unloaded"], true);
    }

    #[tokio::test]
    async fn test_interrupt_stops_runaway_entry_point() {
        let mut link = ThreadWorkerFactory::new().spawn().unwrap();
        assert!(matches!(link.events.recv().await, Some(WorkerEvent::Ready)));
        let interrupt = link.interrupt.clone().expect("thread workers are interruptible");

        let spinning = r#"(module (func (export "_initialize") (loop $forever (br $forever))))"#;
        link.requests
            .send(WorkerEnvelope {
                id: 1,
                request: load(1, spinning),
            })
            .unwrap();

        // keep interrupting until the spinning entry point has been reached
        let response = loop {
            interrupt.interrupt();
            if let Ok(event) =
                tokio::time::timeout(std::time::Duration::from_millis(20), link.events.recv()).await
            {
                break event;
            }
        };
        match response {
            Some(WorkerEvent::Response { id: 1, result }) => {
                assert!(matches!(result, Err(LoaderError::Instantiation { .. })));
            }
            other => panic!("unexpected event {:?}", other),
        }

        // the worker thread is free again
        let status = request(&mut link, 2, WorkerRequest::Status).await.unwrap();
        assert_eq!(status["modules"], json!([]));
    }
}
