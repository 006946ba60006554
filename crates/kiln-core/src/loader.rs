//! Module loader
//!
//! Coordinates cache, fetcher and execution environments:
//!
//! 1. a module that is already `Ready` returns immediately
//! 2. concurrent loads of one module share a single in-flight attempt
//! 3. isolated execution is chosen when the worker is available, the loader
//!    has not been downgraded and the payload fits under the large-payload
//!    threshold
//! 4. bytes come from the cache, else from the network with retries
//! 5. any isolated failure downgrades the loader to inline for the rest of its
//!    life and the module is retried once inline with the bytes already fetched
//!
//! A worker that dies or stops answering after modules loaded on it has the
//! same effect: the loader downgrades, stops the worker and marks its modules
//! `NotLoaded`, so the next `load` brings them back inline.

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{CacheManager, CacheStats};
use crate::config::LoaderConfig;
use crate::descriptor::{ModuleArg, ModuleDescriptor, ModuleHandle, ModuleRegistry};
use crate::engine::{
    ExecutionEnvironment, ExecutionMode, InlineEnvironment, IsolatedEnvironment, ThreadWorkerFactory,
    WorkerFactory, parse_result,
};
use crate::error::{LoaderError, LoaderResult};
use crate::events::{EventBus, EventRecord, LoaderEvent};
use crate::fetch::{HttpFetcher, ModuleFetcher, fetch_with_retry};
use crate::progress::{ProgressCallback, ProgressTracker};

/// Per-module load lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    NotLoaded,
    Loading,
    Ready,
    Failed,
}

/// Status of one module
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModuleStatus {
    pub state: LoadState,
    pub mode: Option<ExecutionMode>,
    pub last_error: Option<String>,
}

/// Loader-wide status snapshot
#[derive(Debug, Clone, Serialize)]
pub struct LoaderStatus {
    pub session_id: Uuid,
    pub mode: ExecutionMode,
    pub isolated_available: bool,
    pub downgraded: bool,
    pub modules: BTreeMap<String, ModuleStatus>,
    pub worker: Option<serde_json::Value>,
    pub cache: CacheStats,
}

/// Loader counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoaderStats {
    pub loads_started: u64,
    pub loads_succeeded: u64,
    pub loads_failed: u64,
    pub fetches: u64,
    pub fallbacks: u64,
    pub invocations: u64,
}

type SharedLoad = Shared<BoxFuture<'static, LoaderResult<ExecutionMode>>>;

#[derive(Default)]
struct ModuleSlot {
    state: Option<LoadState>,
    mode: Option<ExecutionMode>,
    handle: Option<ModuleHandle>,
    last_error: Option<String>,
    in_flight: Option<SharedLoad>,
}

impl ModuleSlot {
    fn state(&self) -> LoadState {
        self.state.unwrap_or(LoadState::NotLoaded)
    }
}

#[derive(Default)]
struct LoaderState {
    modules: HashMap<String, ModuleSlot>,
    downgraded: bool,
    /// Bumped by `reset_execution_mode`; loads started earlier do not record results
    epoch: u64,
}

#[derive(Default)]
struct Counters {
    loads_started: AtomicU64,
    loads_succeeded: AtomicU64,
    loads_failed: AtomicU64,
    fetches: AtomicU64,
    fallbacks: AtomicU64,
    invocations: AtomicU64,
}

struct LoaderInner {
    config: LoaderConfig,
    registry: ModuleRegistry,
    cache: Arc<CacheManager>,
    fetcher: Arc<dyn ModuleFetcher>,
    factory: Arc<dyn WorkerFactory>,
    inline: InlineEnvironment,
    isolated: IsolatedEnvironment,
    state: Mutex<LoaderState>,
    events: EventBus,
    counters: Counters,
    /// Source of per-load instance generations
    generations: AtomicU64,
    session_id: Uuid,
}

/// Builder for [`ModuleLoader`]
pub struct ModuleLoaderBuilder {
    config: LoaderConfig,
    cache: Option<Arc<CacheManager>>,
    fetcher: Option<Arc<dyn ModuleFetcher>>,
    factory: Option<Arc<dyn WorkerFactory>>,
}

impl ModuleLoaderBuilder {
    pub fn with_cache(mut self, cache: Arc<CacheManager>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn ModuleFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn with_worker_factory(mut self, factory: Arc<dyn WorkerFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub async fn build(self) -> LoaderResult<ModuleLoader> {
        let config = self.config;
        config.validate()?;
        let registry = config.registry()?;

        let cache = match self.cache {
            Some(cache) => cache,
            None => Arc::new(CacheManager::open(&config.cache).await),
        };
        let fetcher = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(
                HttpFetcher::new(config.origin_url()?, &config.fetch)?.with_cache(Arc::clone(&cache)),
            ),
        };
        let factory = self
            .factory
            .unwrap_or_else(|| Arc::new(ThreadWorkerFactory::new()));

        let isolated = IsolatedEnvironment::new(
            Arc::clone(&factory),
            config.isolation.clone(),
            config.readiness.clone(),
        );
        let session_id = Uuid::now_v7();
        info!(
            "Module loader {} initialized with {} module(s), cache: {}",
            session_id,
            registry.len(),
            cache.backend()
        );

        Ok(ModuleLoader {
            inner: Arc::new(LoaderInner {
                events: EventBus::new(config.events_capacity),
                config,
                registry,
                cache,
                fetcher,
                factory,
                inline: InlineEnvironment::new(),
                isolated,
                state: Mutex::new(LoaderState::default()),
                counters: Counters::default(),
                generations: AtomicU64::new(0),
                session_id,
            }),
        })
    }
}

/// Loads modules and routes invocations to the environment they run in
#[derive(Clone)]
pub struct ModuleLoader {
    inner: Arc<LoaderInner>,
}

impl ModuleLoader {
    pub fn builder(config: LoaderConfig) -> ModuleLoaderBuilder {
        ModuleLoaderBuilder {
            config,
            cache: None,
            fetcher: None,
            factory: None,
        }
    }

    /// Loader with the filesystem cache, HTTP fetcher and thread worker
    pub async fn new(config: LoaderConfig) -> LoaderResult<Self> {
        Self::builder(config).build().await
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.inner.registry
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.inner.cache
    }

    pub fn session_id(&self) -> Uuid {
        self.inner.session_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.inner.events.subscribe()
    }

    /// Load a module; a no-op when it is already ready
    pub async fn load(&self, id: &str) -> LoaderResult<()> {
        self.load_inner(id, None).await
    }

    /// Load a module, reporting progress to `progress`.
    ///
    /// Progress is reported only by the call that starts the load; callers
    /// joining an in-flight load see the final 100 when it completes.
    pub async fn load_with_progress(&self, id: &str, progress: ProgressCallback) -> LoaderResult<()> {
        self.load_inner(id, Some(progress)).await
    }

    /// Load several modules concurrently
    pub async fn load_many(&self, ids: &[&str]) -> LoaderResult<()> {
        futures::future::try_join_all(ids.iter().map(|id| self.load(id))).await?;
        Ok(())
    }

    async fn load_inner(&self, id: &str, progress: Option<ProgressCallback>) -> LoaderResult<()> {
        let descriptor = self.inner.registry.get(id)?;
        let tracker = ProgressTracker::new(progress);
        self.inner.check_worker();

        let load = {
            let mut state = self.inner.state.lock();
            let epoch = state.epoch;
            let slot = state.modules.entry(descriptor.id.clone()).or_default();

            if slot.state() == LoadState::Ready {
                None
            } else if let Some(in_flight) = &slot.in_flight {
                Some(in_flight.clone())
            } else {
                slot.state = Some(LoadState::Loading);
                slot.last_error = None;

                let inner = Arc::clone(&self.inner);
                let load_tracker = tracker.clone();
                // Spawned so the load completes even if every caller goes away.
                let task = tokio::spawn(async move { inner.run_load(descriptor, load_tracker, epoch).await });
                let shared = async move {
                    task.await
                        .unwrap_or_else(|e| Err(LoaderError::Channel(format!("load task failed: {}", e))))
                }
                .boxed()
                .shared();
                slot.in_flight = Some(shared.clone());
                Some(shared)
            }
        };

        if let Some(load) = load {
            load.await?;
        }
        tracker.complete("ready");
        Ok(())
    }

    /// Call `function` on a loaded module; the text result is parsed as JSON
    /// when possible
    pub async fn invoke(
        &self,
        id: &str,
        function: &str,
        args: &[ModuleArg],
    ) -> LoaderResult<serde_json::Value> {
        let (handle, mode, epoch) = {
            let state = self.inner.state.lock();
            match state.modules.get(id) {
                Some(slot) if slot.state() == LoadState::Ready => match (&slot.handle, slot.mode) {
                    (Some(handle), Some(mode)) => (handle.clone(), mode, state.epoch),
                    _ => return Err(LoaderError::ModuleNotLoaded(id.to_string())),
                },
                _ => return Err(LoaderError::ModuleNotLoaded(id.to_string())),
            }
        };

        let started = Instant::now();
        let text = match self.inner.environment(mode).invoke(&handle, function, args).await {
            Ok(text) => text,
            Err(e) => {
                if mode == ExecutionMode::Isolated && e.is_worker_failure() {
                    self.inner.abandon_worker(epoch, &e.to_string());
                }
                return Err(e);
            }
        };

        self.inner.counters.invocations.fetch_add(1, Ordering::Relaxed);
        self.inner.events.emit(LoaderEvent::Invoked {
            module: id.to_string(),
            function: function.to_string(),
            mode,
            elapsed_ms: started.elapsed().as_millis() as u64,
        });
        Ok(parse_result(&text))
    }

    pub fn status(&self, id: &str) -> LoadState {
        self.inner
            .state
            .lock()
            .modules
            .get(id)
            .map(ModuleSlot::state)
            .unwrap_or(LoadState::NotLoaded)
    }

    /// Mode new loads would start in
    pub fn execution_mode(&self) -> ExecutionMode {
        if self.inner.isolation_available() && !self.inner.state.lock().downgraded {
            ExecutionMode::Isolated
        } else {
            ExecutionMode::Inline
        }
    }

    /// Mode a loaded module runs in
    pub fn module_mode(&self, id: &str) -> Option<ExecutionMode> {
        self.inner.state.lock().modules.get(id).and_then(|slot| slot.mode)
    }

    /// Prefer isolated execution again, discarding every loaded module.
    ///
    /// Loads still in flight finish but do not record their result.
    pub async fn reset_execution_mode(&self) {
        let loaded: Vec<(ModuleHandle, ExecutionMode)> = {
            let mut state = self.inner.state.lock();
            state.epoch += 1;
            state.downgraded = false;
            state
                .modules
                .drain()
                .filter_map(|(_, slot)| slot.handle.zip(slot.mode))
                .collect()
        };

        for (handle, mode) in &loaded {
            self.inner.environment(*mode).discard(handle).await;
        }
        self.inner.isolated.terminate();
        self.inner.events.emit(LoaderEvent::ModeReset);
    }

    pub async fn loader_status(&self) -> LoaderStatus {
        self.inner.check_worker();
        let (downgraded, modules) = {
            let state = self.inner.state.lock();
            let modules = self
                .inner
                .registry
                .ids()
                .into_iter()
                .map(|id| {
                    let status = match state.modules.get(&id) {
                        Some(slot) => ModuleStatus {
                            state: slot.state(),
                            mode: slot.mode,
                            last_error: slot.last_error.clone(),
                        },
                        None => ModuleStatus {
                            state: LoadState::NotLoaded,
                            mode: None,
                            last_error: None,
                        },
                    };
                    (id, status)
                })
                .collect();
            (state.downgraded, modules)
        };

        LoaderStatus {
            session_id: self.inner.session_id,
            mode: self.execution_mode(),
            isolated_available: self.inner.isolation_available(),
            downgraded,
            modules,
            worker: self.inner.isolated.status().await,
            cache: self.inner.cache.stats().await,
        }
    }

    pub fn stats(&self) -> LoaderStats {
        let c = &self.inner.counters;
        LoaderStats {
            loads_started: c.loads_started.load(Ordering::Relaxed),
            loads_succeeded: c.loads_succeeded.load(Ordering::Relaxed),
            loads_failed: c.loads_failed.load(Ordering::Relaxed),
            fetches: c.fetches.load(Ordering::Relaxed),
            fallbacks: c.fallbacks.load(Ordering::Relaxed),
            invocations: c.invocations.load(Ordering::Relaxed),
        }
    }
}

impl LoaderInner {
    fn isolation_available(&self) -> bool {
        self.config.isolation.enabled && self.factory.is_supported()
    }

    fn environment(&self, mode: ExecutionMode) -> &dyn ExecutionEnvironment {
        match mode {
            ExecutionMode::Inline => &self.inline,
            ExecutionMode::Isolated => &self.isolated,
        }
    }

    async fn run_load(
        self: Arc<Self>,
        descriptor: Arc<ModuleDescriptor>,
        tracker: ProgressTracker,
        epoch: u64,
    ) -> LoaderResult<ExecutionMode> {
        let started = Instant::now();
        let handle = ModuleHandle::new(
            &descriptor.id,
            self.generations.fetch_add(1, Ordering::Relaxed) + 1,
        );
        self.counters.loads_started.fetch_add(1, Ordering::Relaxed);
        self.events.emit(LoaderEvent::LoadStarted {
            module: descriptor.id.clone(),
        });
        tracker.report(0.0, "starting");

        let result = self.load_module(&descriptor, &handle, &tracker, epoch).await;

        let current = {
            let mut state = self.state.lock();
            if state.epoch == epoch {
                let slot = state.modules.entry(descriptor.id.clone()).or_default();
                slot.in_flight = None;
                match &result {
                    Ok(mode) => {
                        slot.state = Some(LoadState::Ready);
                        slot.mode = Some(*mode);
                        slot.handle = Some(handle.clone());
                        slot.last_error = None;
                    }
                    Err(e) => {
                        slot.state = Some(LoadState::Failed);
                        slot.mode = None;
                        slot.handle = None;
                        slot.last_error = Some(e.to_string());
                    }
                }
                true
            } else {
                false
            }
        };

        if !current {
            debug!("Load {} finished after a mode reset; discarding", handle);
            // Only this load's own instance goes; a newer one is left alone.
            if let Ok(mode) = &result {
                self.environment(*mode).discard(&handle).await;
            }
            return Err(LoaderError::ModuleNotLoaded(descriptor.id.clone()));
        }

        match &result {
            Ok(mode) => {
                self.counters.loads_succeeded.fetch_add(1, Ordering::Relaxed);
                self.events.emit(LoaderEvent::Ready {
                    module: descriptor.id.clone(),
                    mode: *mode,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
            }
            Err(e) => {
                self.counters.loads_failed.fetch_add(1, Ordering::Relaxed);
                self.events.emit(LoaderEvent::Failed {
                    module: descriptor.id.clone(),
                    error: e.to_string(),
                });
            }
        }
        result
    }

    async fn load_module(
        &self,
        descriptor: &ModuleDescriptor,
        handle: &ModuleHandle,
        tracker: &ProgressTracker,
        epoch: u64,
    ) -> LoaderResult<ExecutionMode> {
        let mut bytes: Option<Arc<Vec<u8>>> = None;

        if let Some(reason) = self.isolated_choice(descriptor).await {
            self.events.emit(LoaderEvent::ModeSelected {
                module: descriptor.id.clone(),
                mode: ExecutionMode::Isolated,
                reason,
            });

            match self
                .attempt(ExecutionMode::Isolated, descriptor, handle, tracker, &mut bytes)
                .await
            {
                Ok(()) => return Ok(ExecutionMode::Isolated),
                Err(e) => self.fall_back(descriptor, handle, &e, epoch).await,
            }
        }

        self.attempt(ExecutionMode::Inline, descriptor, handle, tracker, &mut bytes)
            .await?;
        Ok(ExecutionMode::Inline)
    }

    /// `Some(reason)` when the module should be loaded isolated
    async fn isolated_choice(&self, descriptor: &ModuleDescriptor) -> Option<String> {
        let inline = |reason: String| {
            self.events.emit(LoaderEvent::ModeSelected {
                module: descriptor.id.clone(),
                mode: ExecutionMode::Inline,
                reason,
            });
            None
        };

        if !self.isolation_available() {
            return inline("isolated execution unavailable".to_string());
        }
        if self.state.lock().downgraded {
            return inline("loader downgraded to inline".to_string());
        }

        let threshold = self.config.isolation.large_payload_threshold;
        let size = match self.cache.peek_size(&descriptor.path, &descriptor.version).await {
            Some(size) => Some(size),
            None => self.fetcher.remote_size(descriptor).await,
        };

        match size {
            Some(size) if size > threshold => inline(format!(
                "payload of {} bytes exceeds the {} byte isolation threshold",
                size, threshold
            )),
            Some(size) => Some(format!("payload of {} bytes", size)),
            None => Some("payload size unknown".to_string()),
        }
    }

    async fn attempt(
        &self,
        mode: ExecutionMode,
        descriptor: &ModuleDescriptor,
        handle: &ModuleHandle,
        tracker: &ProgressTracker,
        bytes: &mut Option<Arc<Vec<u8>>>,
    ) -> LoaderResult<()> {
        let data = match bytes {
            Some(data) => Arc::clone(data),
            None => {
                let data = Arc::new(self.obtain_bytes(descriptor, &tracker.scaled(0.0, 70.0)).await?);
                *bytes = Some(Arc::clone(&data));
                data
            }
        };

        tracker.report(70.0, "instantiating");
        let environment = self.environment(mode);
        environment.instantiate(handle, descriptor, data).await?;
        self.events.emit(LoaderEvent::Instantiated {
            module: descriptor.id.clone(),
            mode,
        });

        tracker.report(90.0, "waiting for module");
        if let Err(e) = environment
            .wait_until_ready(handle, &self.config.readiness)
            .await
        {
            environment.discard(handle).await;
            return Err(e);
        }
        Ok(())
    }

    async fn obtain_bytes(
        &self,
        descriptor: &ModuleDescriptor,
        tracker: &ProgressTracker,
    ) -> LoaderResult<Vec<u8>> {
        if let Some(data) = self.cache.get_module(descriptor).await {
            self.events.emit(LoaderEvent::CacheHit {
                module: descriptor.id.clone(),
                bytes: data.len(),
            });
            tracker.complete("loaded from cache");
            return Ok(data);
        }

        self.events.emit(LoaderEvent::CacheMiss {
            module: descriptor.id.clone(),
        });
        self.counters.fetches.fetch_add(1, Ordering::Relaxed);
        let data = fetch_with_retry(self.fetcher.as_ref(), descriptor, tracker, &self.config.fetch).await?;
        self.events.emit(LoaderEvent::Downloaded {
            module: descriptor.id.clone(),
            bytes: data.len(),
        });
        Ok(data)
    }

    /// Downgrade to inline after an isolated load failed and clean up the worker
    async fn fall_back(
        &self,
        descriptor: &ModuleDescriptor,
        handle: &ModuleHandle,
        error: &LoaderError,
        epoch: u64,
    ) {
        warn!("Isolated load of {} failed: {}", descriptor.id, error);
        self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);

        if error.is_worker_failure() {
            // The worker may still be stuck on this load; no further round trips.
            self.abandon_worker(epoch, &error.to_string());
        } else {
            self.downgrade(epoch, &error.to_string());
            self.isolated.discard(handle).await;
            if self.isolated.hosted_count() == 0 {
                self.isolated.terminate();
            }
        }

        self.events.emit(LoaderEvent::FallbackToInline {
            module: descriptor.id.clone(),
            reason: error.to_string(),
        });
    }

    /// Prefer inline from now on; ignored for loads started before a reset
    fn downgrade(&self, epoch: u64, reason: &str) {
        let newly_downgraded = {
            let mut state = self.state.lock();
            state.epoch == epoch && !std::mem::replace(&mut state.downgraded, true)
        };
        if newly_downgraded {
            warn!("Downgrading to inline execution: {}", reason);
            self.events.emit(LoaderEvent::ModeDowngraded {
                reason: reason.to_string(),
            });
        }
    }

    /// The worker died or stopped answering: downgrade, stop it and mark every
    /// module it hosted `NotLoaded`
    fn abandon_worker(&self, epoch: u64, reason: &str) {
        let stranded: Vec<String> = {
            let mut state = self.state.lock();
            if state.epoch != epoch {
                return;
            }
            state
                .modules
                .iter_mut()
                .filter(|(_, slot)| {
                    slot.state() == LoadState::Ready && slot.mode == Some(ExecutionMode::Isolated)
                })
                .map(|(id, slot)| {
                    slot.state = Some(LoadState::NotLoaded);
                    slot.mode = None;
                    slot.handle = None;
                    slot.last_error = Some(reason.to_string());
                    id.clone()
                })
                .collect()
        };

        self.downgrade(epoch, reason);
        self.isolated.terminate();
        if !stranded.is_empty() {
            warn!(
                "Isolated worker lost; {} will reload inline: {}",
                stranded.join(", "),
                reason
            );
        }
    }

    /// Abandon the worker if it exited while modules were loaded on it
    fn check_worker(&self) {
        let lost = {
            let state = self.state.lock();
            state
                .modules
                .values()
                .filter(|slot| {
                    slot.state() == LoadState::Ready && slot.mode == Some(ExecutionMode::Isolated)
                })
                .filter_map(|slot| slot.handle.as_ref())
                .any(|handle| !self.isolated.hosts(handle))
                .then_some(state.epoch)
        };
        if let Some(epoch) = lost {
            self.abandon_worker(epoch, "isolated worker is no longer running");
        }
    }
}
