//! Kiln core: loading and running WebAssembly compute modules
//!
//! - Versioned payload cache with age-based expiry
//! - Streaming fetcher with progress reporting and retries
//! - Inline and isolated (worker thread) execution environments
//! - Correlated request/response channel to the worker
//! - Loader that deduplicates concurrent loads and falls back to inline
//!   execution when the worker fails
//!
//! ```rust,ignore
//! use kiln_core::{FunctionInvoker, LoaderConfig, ModuleLoader};
//!
//! let config = LoaderConfig::from_file("kiln.yaml")?;
//! let invoker = FunctionInvoker::new(ModuleLoader::new(config).await?);
//! let did = invoker.invoke("create_did", &["seed".into()]).await?;
//! ```

pub mod cache;
pub mod channel;
pub mod config;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod events;
pub mod fetch;
pub mod invoke;
pub mod loader;
pub mod progress;

pub use cache::{CacheManager, CacheStats, CacheStore};
pub use channel::{ChannelState, WorkerChannel};
pub use config::LoaderConfig;
pub use descriptor::{ModuleArg, ModuleDescriptor, ModuleHandle, ModuleRegistry};
pub use engine::{ExecutionEnvironment, ExecutionMode, ThreadWorkerFactory, WorkerFactory, parse_result};
pub use error::{LoaderError, LoaderResult};
pub use events::{EventRecord, LoaderEvent};
pub use fetch::{HttpFetcher, ModuleFetcher};
pub use invoke::FunctionInvoker;
pub use loader::{LoadState, LoaderStats, LoaderStatus, ModuleLoader, ModuleStatus};
pub use progress::{ProgressCallback, ProgressTracker};
