//! Loader configuration
//!
//! All sections are optional in configuration files; missing values fall back
//! to the defaults below. Files are read by [`loader`], which also applies
//! `${VAR}` substitution and `KILN_*` environment overrides.

pub mod loader;

pub use loader::{detect_format, from_str, load_config, load_with_env, substitute_env_vars};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::descriptor::{ModuleDescriptor, ModuleRegistry};
use crate::error::{LoaderError, LoaderResult};

/// Seven days, in seconds
pub const DEFAULT_RETENTION_SECS: u64 = 7 * 24 * 60 * 60;

/// Payloads above this size are always run inline
pub const DEFAULT_LARGE_PAYLOAD_THRESHOLD: u64 = 15 * 1024 * 1024;

/// Top-level loader configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Base URL module paths are resolved against
    pub origin: String,
    /// Modules known to the loader
    pub modules: Vec<ModuleDescriptor>,
    pub cache: CacheConfig,
    pub isolation: IsolationConfig,
    pub readiness: ReadinessConfig,
    pub fetch: FetchConfig,
    /// Capacity of the diagnostic event channel
    pub events_capacity: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            origin: "http://localhost:8080/".to_string(),
            modules: Vec::new(),
            cache: CacheConfig::default(),
            isolation: IsolationConfig::default(),
            readiness: ReadinessConfig::default(),
            fetch: FetchConfig::default(),
            events_capacity: 256,
        }
    }
}

/// Persistent payload cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Cache directory; defaults to `<platform cache dir>/kiln/modules`
    pub dir: Option<PathBuf>,
    /// Key namespace prefix
    pub prefix: String,
    /// Entries older than this are purged on read
    pub retention_secs: u64,
    /// Store payloads gzip-compressed under the `-compressed` key variant
    pub compress: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            prefix: "kiln-wasm".to_string(),
            retention_secs: DEFAULT_RETENTION_SECS,
            compress: false,
        }
    }
}

impl CacheConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    /// Configured directory, or the platform default
    pub fn resolved_dir(&self) -> Option<PathBuf> {
        self.dir
            .clone()
            .or_else(|| dirs::cache_dir().map(|d| d.join("kiln").join("modules")))
    }
}

/// Isolated (worker thread) execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationConfig {
    /// Prefer isolated execution when available
    pub enabled: bool,
    /// Payload size in bytes above which modules run inline
    pub large_payload_threshold: u64,
    /// Time allowed for the worker handshake, per attempt
    pub init_timeout_ms: u64,
    /// Additional handshake attempts after the first one
    pub init_retries: u32,
    /// Backoff step between handshake attempts
    pub init_backoff_ms: u64,
    /// Budget for a single worker round trip
    pub request_timeout_ms: u64,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            large_payload_threshold: DEFAULT_LARGE_PAYLOAD_THRESHOLD,
            init_timeout_ms: 10_000,
            init_retries: 2,
            init_backoff_ms: 500,
            request_timeout_ms: 60_000,
        }
    }
}

impl IsolationConfig {
    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn init_backoff(&self) -> Duration {
        Duration::from_millis(self.init_backoff_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Readiness polling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    pub poll_interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            timeout_ms: 45_000,
        }
    }
}

impl ReadinessConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Network fetch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Whole-request timeout for a download
    pub timeout_secs: u64,
    /// Retries for transient failures
    pub retries: u32,
    /// First retry delay; doubles on each retry
    pub retry_initial_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            retries: 2,
            retry_initial_ms: 250,
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl LoaderConfig {
    pub fn new(origin: &str) -> Self {
        Self {
            origin: origin.to_string(),
            ..Default::default()
        }
    }

    pub fn with_module(mut self, descriptor: ModuleDescriptor) -> Self {
        self.modules.push(descriptor);
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache.dir = Some(dir.into());
        self
    }

    /// Load from a file (YAML, TOML or JSON) with `KILN_*` environment overrides
    pub fn from_file(path: &str) -> LoaderResult<Self> {
        let config: Self = load_with_env(path, "KILN")?;
        config.validate()?;
        Ok(config)
    }

    /// Parsed origin URL
    pub fn origin_url(&self) -> LoaderResult<Url> {
        Url::parse(&self.origin)
            .map_err(|e| LoaderError::Config(format!("invalid origin '{}': {}", self.origin, e)))
    }

    /// Build the module registry
    pub fn registry(&self) -> LoaderResult<ModuleRegistry> {
        ModuleRegistry::new(self.modules.clone())
    }

    /// Check the configuration for values the loader cannot work with
    pub fn validate(&self) -> LoaderResult<()> {
        self.origin_url()?;
        self.registry()?;

        let zero = [
            ("isolation.init_timeout_ms", self.isolation.init_timeout_ms),
            ("isolation.request_timeout_ms", self.isolation.request_timeout_ms),
            ("readiness.poll_interval_ms", self.readiness.poll_interval_ms),
            ("readiness.timeout_ms", self.readiness.timeout_ms),
            ("fetch.timeout_secs", self.fetch.timeout_secs),
        ]
        .into_iter()
        .find(|(_, v)| *v == 0);

        if let Some((name, _)) = zero {
            return Err(LoaderError::Config(format!("{} must be greater than 0", name)));
        }

        if self.events_capacity == 0 {
            return Err(LoaderError::Config(
                "events_capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
