//! End-to-end loader scenarios against a mock module origin.
//!
//! Each test serves a WAT module from a [`wiremock`] server and drives a
//! [`ModuleLoader`] built the same way applications build one: filesystem
//! cache, HTTP fetcher and the thread worker (or a worker stand-in).
//!
//! ```bash
//! cargo test -p kiln-core --test loader_scenarios
//! ```

use std::sync::Arc;

use kiln_core::config::CacheConfig;
use kiln_core::engine::{WorkerEndpoint, WorkerFactory, WorkerLink};
use kiln_core::{
    CacheManager, ExecutionMode, FunctionInvoker, LoadState, LoaderConfig, LoaderError, LoaderEvent,
    LoaderResult, ModuleDescriptor, ModuleLoader,
};
use parking_lot::Mutex;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const MODULE_PATH: &str = "/wasm/crypto.wasm";

/// Echo module that signals readiness through the host import and carries a
/// data segment of `padding` bytes.
fn crypto_module(padding: usize) -> Vec<u8> {
    let pages = 2 + padding / 65536 + 1;
    format!(
        r#"(module
  (import "env" "signal_ready" (func $signal_ready))
  (memory (export "memory") {pages})
  (global $heap (mut i32) (i32.const 1024))
  (data (i32.const 65536) "{padding}")
  (func (export "alloc") (param $len i32) (result i32)
    (local $ptr i32)
    global.get $heap
    local.set $ptr
    global.get $heap
    local.get $len
    i32.add
    global.set $heap
    local.get $ptr)
  (func (export "_start")
    call $signal_ready)
  (func (export "echo") (param $ptr i32) (param $len i32) (result i64)
    local.get $ptr
    i64.extend_i32_u
    i64.const 32
    i64.shl
    local.get $len
    i64.extend_i32_u
    i64.or))
"#,
        pages = pages,
        padding = "a".repeat(padding),
    )
    .into_bytes()
}

fn descriptor(version: &str) -> ModuleDescriptor {
    ModuleDescriptor::new("crypto", MODULE_PATH.trim_start_matches('/'), version).with_functions(["echo"])
}

fn config(server: &MockServer, cache_dir: &std::path::Path, version: &str) -> LoaderConfig {
    let mut config = LoaderConfig::new(&format!("{}/", server.uri()))
        .with_module(descriptor(version))
        .with_cache_dir(cache_dir);
    config.fetch.retry_initial_ms = 10;
    config.isolation.init_timeout_ms = 50;
    config.isolation.init_backoff_ms = 1;
    config.readiness.poll_interval_ms = 5;
    config.readiness.timeout_ms = 2000;
    config
}

async fn serve(server: &MockServer, body: Vec<u8>, expected: u64) {
    Mock::given(method("GET"))
        .and(path(MODULE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .expect(expected)
        .mount(server)
        .await;
}

/// Worker that accepts the connection but never completes the handshake
#[derive(Default)]
struct SilentWorkerFactory {
    endpoints: Mutex<Vec<WorkerEndpoint>>,
}

impl WorkerFactory for SilentWorkerFactory {
    fn is_supported(&self) -> bool {
        true
    }

    fn spawn(&self) -> LoaderResult<WorkerLink> {
        let (link, endpoint) = WorkerLink::pair();
        self.endpoints.lock().push(endpoint);
        Ok(link)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Concurrent loads
// ─────────────────────────────────────────────────────────────────────────────

/// Two callers racing on a cold cache trigger one download and one cache
/// write, and both observe the module as ready.
#[tokio::test]
async fn concurrent_cold_loads_download_once() {
    let server = MockServer::start().await;
    serve(&server, crypto_module(2 * 1024 * 1024), 1).await;
    let cache_dir = tempfile::tempdir().unwrap();

    let loader = ModuleLoader::new(config(&server, cache_dir.path(), "1")).await.unwrap();
    let (a, b) = tokio::join!(loader.load("crypto"), loader.load("crypto"));
    a.unwrap();
    b.unwrap();

    assert_eq!(loader.status("crypto"), LoadState::Ready);
    assert_eq!(loader.module_mode("crypto"), Some(ExecutionMode::Isolated));
    assert_eq!(loader.stats().loads_started, 1);
    assert_eq!(loader.stats().fetches, 1);

    let cache = loader.cache().stats().await;
    assert_eq!(cache.writes, 1);
    assert_eq!(cache.entries, 1);

    let value = loader.invoke("crypto", "echo", &["did:key:z6Mk".into()]).await.unwrap();
    assert_eq!(value, json!("did:key:z6Mk"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Fallback
// ─────────────────────────────────────────────────────────────────────────────

/// A worker that never answers the handshake downgrades the loader; the module
/// still loads inline and later loads skip isolation entirely.
#[tokio::test]
async fn silent_worker_falls_back_to_inline() {
    let server = MockServer::start().await;
    serve(&server, crypto_module(0), 1).await;
    let cache_dir = tempfile::tempdir().unwrap();

    let loader = ModuleLoader::builder(config(&server, cache_dir.path(), "1"))
        .with_worker_factory(Arc::new(SilentWorkerFactory::default()))
        .build()
        .await
        .unwrap();
    let mut events = loader.subscribe();

    loader.load("crypto").await.unwrap();
    assert_eq!(loader.module_mode("crypto"), Some(ExecutionMode::Inline));
    assert_eq!(loader.execution_mode(), ExecutionMode::Inline);

    let invoker = FunctionInvoker::new(loader.clone());
    assert_eq!(invoker.invoke("echo", &["hi".into()]).await.unwrap(), json!("hi"));

    let mut downgraded = 0;
    let mut fell_back = 0;
    while let Ok(record) = events.try_recv() {
        match record.event {
            LoaderEvent::ModeDowngraded { .. } => downgraded += 1,
            LoaderEvent::FallbackToInline { .. } => fell_back += 1,
            _ => {}
        }
    }
    assert_eq!(downgraded, 1);
    assert_eq!(fell_back, 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Cache versioning
// ─────────────────────────────────────────────────────────────────────────────

/// A payload cached at the same version is served without touching the origin.
#[tokio::test]
async fn cached_payload_skips_download() {
    let server = MockServer::start().await;
    serve(&server, crypto_module(0), 0).await;
    let cache_dir = tempfile::tempdir().unwrap();

    let config = config(&server, cache_dir.path(), "1");
    let cache = Arc::new(CacheManager::open(&config.cache).await);
    cache.put_module(&descriptor("1"), &crypto_module(0)).await;

    let loader = ModuleLoader::builder(config).with_cache(cache).build().await.unwrap();
    loader.load("crypto").await.unwrap();

    assert_eq!(loader.stats().fetches, 0);
    assert_eq!(loader.cache().stats().await.hits, 1);
}

/// Bumping the version invalidates the cached payload.
#[tokio::test]
async fn version_bump_refetches() {
    let server = MockServer::start().await;
    serve(&server, crypto_module(0), 1).await;
    let cache_dir = tempfile::tempdir().unwrap();

    let cache_config = CacheConfig {
        dir: Some(cache_dir.path().to_path_buf()),
        ..CacheConfig::default()
    };
    let seeded = CacheManager::open(&cache_config).await;
    seeded.put_module(&descriptor("1"), &crypto_module(0)).await;

    let loader = ModuleLoader::new(config(&server, cache_dir.path(), "2")).await.unwrap();
    loader.load("crypto").await.unwrap();

    assert_eq!(loader.stats().fetches, 1);
    assert!(loader.cache().get_module(&descriptor("2")).await.is_some());
    assert!(loader.cache().get_module(&descriptor("1")).await.is_some());
}

// ─────────────────────────────────────────────────────────────────────────────
// Failures
// ─────────────────────────────────────────────────────────────────────────────

/// A missing module is a permanent failure: no retries, no cache entry and the
/// error is kept on the module status. The first load asks once for the
/// isolated attempt and once for the inline retry; after the downgrade only
/// the inline attempt remains.
#[tokio::test]
async fn missing_module_fails_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(MODULE_PATH))
        .respond_with(ResponseTemplate::new(404))
        .expect(3)
        .mount(&server)
        .await;
    let cache_dir = tempfile::tempdir().unwrap();

    let loader = ModuleLoader::new(config(&server, cache_dir.path(), "1")).await.unwrap();
    let err = loader.load("crypto").await.unwrap_err();

    assert!(matches!(err, LoaderError::Network { transient: false, .. }));
    assert_eq!(loader.status("crypto"), LoadState::Failed);
    assert_eq!(loader.cache().stats().await.entries, 0);

    // failed loads are retried on the next request
    assert!(loader.load("crypto").await.is_err());
    assert_eq!(loader.stats().loads_started, 2);
    assert_eq!(loader.stats().fetches, 3);
}

/// Configuration files drive the same loader.
#[tokio::test]
async fn loader_from_config_file() {
    let server = MockServer::start().await;
    serve(&server, crypto_module(0), 1).await;
    let dir = tempfile::tempdir().unwrap();

    let config_path = dir.path().join("kiln.yaml");
    std::fs::write(
        &config_path,
        format!(
            r#"
origin: "{origin}/"
modules:
  - id: crypto
    path: wasm/crypto.wasm
    version: "1"
    functions: [echo]
cache:
  dir: "{cache}"
isolation:
  enabled: false
"#,
            origin = server.uri(),
            cache = dir.path().join("cache").display(),
        ),
    )
    .unwrap();

    let config = LoaderConfig::from_file(config_path.to_str().unwrap()).unwrap();
    let invoker = FunctionInvoker::new(ModuleLoader::new(config).await.unwrap());

    assert_eq!(invoker.invoke("echo", &["z6Mk".into()]).await.unwrap(), json!("z6Mk"));
    assert_eq!(invoker.loader().module_mode("crypto"), Some(ExecutionMode::Inline));
}
