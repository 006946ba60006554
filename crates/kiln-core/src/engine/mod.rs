//! Execution environments
//!
//! A module runs either inline (on the caller's task) or isolated (on a
//! dedicated worker thread reached through the [`crate::channel`]). Both
//! variants implement [`ExecutionEnvironment`].

pub mod inline;
pub mod isolated;
pub mod wasm;
pub mod worker;

pub use inline::InlineEnvironment;
pub use isolated::IsolatedEnvironment;
pub use wasm::WasmModuleInstance;
pub use worker::{
    ThreadWorkerFactory, WorkerEndpoint, WorkerEnvelope, WorkerEvent, WorkerFactory, WorkerInterrupt, WorkerLink,
    WorkerRequest, run_worker,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;

use crate::config::ReadinessConfig;
use crate::descriptor::{ModuleArg, ModuleDescriptor, ModuleHandle};
use crate::error::{LoaderError, LoaderResult};

/// Where a module's code runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Inline,
    Isolated,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Inline => write!(f, "inline"),
            ExecutionMode::Isolated => write!(f, "isolated"),
        }
    }
}

/// Host for instantiated modules
#[async_trait]
pub trait ExecutionEnvironment: Send + Sync {
    fn mode(&self) -> ExecutionMode;

    /// Instantiate `bytes` as `handle`.
    ///
    /// An older instance of the same module is replaced; a newer one is kept
    /// and the call fails with [`LoaderError::Superseded`].
    async fn instantiate(
        &self,
        handle: &ModuleHandle,
        descriptor: &ModuleDescriptor,
        bytes: Arc<Vec<u8>>,
    ) -> LoaderResult<()>;

    async fn is_ready(&self, handle: &ModuleHandle) -> LoaderResult<bool>;

    /// Poll [`is_ready`](Self::is_ready) until it holds or the timeout elapses
    async fn wait_until_ready(
        &self,
        handle: &ModuleHandle,
        readiness: &ReadinessConfig,
    ) -> LoaderResult<()> {
        let started = Instant::now();
        loop {
            if self.is_ready(handle).await? {
                return Ok(());
            }
            if started.elapsed() >= readiness.timeout() {
                return Err(LoaderError::ReadinessTimeout {
                    module: handle.id().to_string(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            tokio::time::sleep(readiness.poll_interval()).await;
        }
    }

    /// Call an exported function, returning its raw text result
    async fn invoke(
        &self,
        handle: &ModuleHandle,
        function: &str,
        args: &[ModuleArg],
    ) -> LoaderResult<String>;

    /// Drop the instance `handle` refers to; a no-op once it was replaced
    async fn discard(&self, handle: &ModuleHandle);

    /// Environment-specific diagnostics
    async fn status(&self) -> Option<serde_json::Value>;
}

/// Parse a module's text result as JSON, falling back to the raw text.
///
/// An empty result (a function with no return value) maps to `null`.
pub fn parse_result(text: &str) -> serde_json::Value {
    if text.is_empty() {
        return serde_json::Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| serde_json::Value::String(text.to_string()))
}
