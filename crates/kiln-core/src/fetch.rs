//! Network fetcher for module binaries
//!
//! Downloads a module from the configured origin, streaming the body so that
//! progress can be reported per chunk. `file://` origins are read from disk.

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use backoff::future::retry;
use futures::StreamExt;
use reqwest::header::CONTENT_LENGTH;
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::CacheManager;
use crate::config::FetchConfig;
use crate::descriptor::ModuleDescriptor;
use crate::error::{LoaderError, LoaderResult};
use crate::progress::ProgressTracker;

/// Source of module binaries
#[async_trait]
pub trait ModuleFetcher: Send + Sync {
    /// Download the module's bytes, reporting progress as they arrive
    async fn fetch(
        &self,
        descriptor: &ModuleDescriptor,
        progress: &ProgressTracker,
    ) -> LoaderResult<Vec<u8>>;

    /// Payload size if the origin declares it; `None` when unknown
    async fn remote_size(&self, descriptor: &ModuleDescriptor) -> Option<u64>;
}

/// HTTP(S) and `file://` fetcher
pub struct HttpFetcher {
    client: Client,
    origin: Url,
    cache: Option<Arc<CacheManager>>,
}

impl HttpFetcher {
    pub fn new(origin: Url, config: &FetchConfig) -> LoaderResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| LoaderError::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            origin,
            cache: None,
        })
    }

    /// Store successful downloads in `cache`
    pub fn with_cache(mut self, cache: Arc<CacheManager>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Cache-busting URL for a module
    pub fn module_url(&self, descriptor: &ModuleDescriptor) -> LoaderResult<Url> {
        let mut url = self.origin.join(&descriptor.path).map_err(|e| {
            LoaderError::network(&descriptor.id, format!("invalid module path: {}", e), false)
        })?;
        if url.scheme() != "file" {
            url.query_pairs_mut().append_pair("v", &descriptor.version);
        }
        Ok(url)
    }

    async fn read_file(
        &self,
        descriptor: &ModuleDescriptor,
        url: &Url,
        progress: &ProgressTracker,
    ) -> LoaderResult<Vec<u8>> {
        let path = url.to_file_path().map_err(|_| {
            LoaderError::network(&descriptor.id, format!("not a local path: {}", url), false)
        })?;
        progress.stage("reading");
        let data = tokio::fs::read(&path).await.map_err(|e| {
            LoaderError::network(&descriptor.id, format!("{:?}: {}", path, e), false)
        })?;
        progress.complete("download complete");
        Ok(data)
    }

    async fn download(
        &self,
        descriptor: &ModuleDescriptor,
        url: Url,
        progress: &ProgressTracker,
    ) -> LoaderResult<Vec<u8>> {
        let module = descriptor.id.as_str();
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| request_error(module, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LoaderError::network(
                module,
                format!("HTTP {}", status),
                is_transient_status(status),
            ));
        }

        let total_size = response.content_length().filter(|len| *len > 0);
        debug!("Download size for {}: {:?} bytes", module, total_size);

        let mut data = Vec::with_capacity(total_size.unwrap_or(0) as usize);
        let mut stream = response.bytes_stream();

        progress.report(0.0, "downloading");
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                LoaderError::network(module, format!("download interrupted: {}", e), true)
            })?;
            data.extend_from_slice(&chunk);

            if let Some(total) = total_size {
                let percent = data.len() as f64 / total as f64 * 100.0;
                progress.report(percent, "downloading");
            }
        }

        if total_size.is_some() {
            progress.complete("download complete");
        } else {
            progress.stage("download complete");
        }

        Ok(data)
    }
}

#[async_trait]
impl ModuleFetcher for HttpFetcher {
    async fn fetch(
        &self,
        descriptor: &ModuleDescriptor,
        progress: &ProgressTracker,
    ) -> LoaderResult<Vec<u8>> {
        let url = self.module_url(descriptor)?;
        info!("Fetching module {} from {}", descriptor.id, url);

        let data = if url.scheme() == "file" {
            self.read_file(descriptor, &url, progress).await?
        } else {
            self.download(descriptor, url, progress).await?
        };

        info!("Fetched module {} ({} bytes)", descriptor.id, data.len());

        if let Some(cache) = &self.cache {
            cache.put_module(descriptor, &data).await;
        }

        Ok(data)
    }

    async fn remote_size(&self, descriptor: &ModuleDescriptor) -> Option<u64> {
        let url = self.module_url(descriptor).ok()?;

        if url.scheme() == "file" {
            let path = url.to_file_path().ok()?;
            return tokio::fs::metadata(path).await.ok().map(|m| m.len());
        }

        let response = match self.client.head(url).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                debug!("Size lookup for {} returned {}", descriptor.id, response.status());
                return None;
            }
            Err(e) => {
                debug!("Size lookup for {} failed: {}", descriptor.id, e);
                return None;
            }
        };

        response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn request_error(module: &str, err: reqwest::Error) -> LoaderError {
    let transient = err.is_timeout() || err.is_connect() || err.is_request() || err.is_body();
    LoaderError::network(module, err.to_string(), transient)
}

/// Fetch with exponential backoff on transient network failures.
///
/// At most `config.retries` retries; permanent failures surface immediately.
pub async fn fetch_with_retry(
    fetcher: &dyn ModuleFetcher,
    descriptor: &ModuleDescriptor,
    progress: &ProgressTracker,
    config: &FetchConfig,
) -> LoaderResult<Vec<u8>> {
    let policy = ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(config.retry_initial_ms))
        .with_max_elapsed_time(None)
        .build();
    let attempts = AtomicU32::new(0);

    retry(policy, || {
        let attempt = attempts.fetch_add(1, Ordering::SeqCst);
        async move {
            fetcher.fetch(descriptor, progress).await.map_err(|e| {
                if e.is_transient() && attempt < config.retries {
                    warn!(
                        "Fetch attempt {} for {} failed, retrying: {}",
                        attempt + 1,
                        descriptor.id,
                        e
                    );
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn descriptor() -> ModuleDescriptor {
        ModuleDescriptor::new("crypto", "wasm/crypto.wasm", "3")
    }

    fn fetcher(server: &MockServer) -> HttpFetcher {
        let origin = Url::parse(&format!("{}/", server.uri())).unwrap();
        HttpFetcher::new(origin, &FetchConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_reports_progress_and_caches() {
        let server = MockServer::start().await;
        let body = vec![7u8; 256 * 1024];
        Mock::given(method("GET"))
            .and(path("/wasm/crypto.wasm"))
            .and(query_param("v", "3"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let cache = Arc::new(CacheManager::in_memory(&Default::default()));
        let fetcher = fetcher(&server).with_cache(Arc::clone(&cache));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let progress = ProgressTracker::new(Some(Arc::new(move |p: f64, _: &str| {
            sink.lock().push(p)
        })));

        let data = fetcher.fetch(&descriptor(), &progress).await.unwrap();
        assert_eq!(data, body);

        let values = seen.lock().clone();
        assert!(values.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(values.last().copied(), Some(100.0));

        assert_eq!(cache.get_module(&descriptor()).await, Some(body));
    }

    #[tokio::test]
    async fn test_fetch_classifies_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/wasm/crypto.wasm"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/wasm/identity.wasm"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let fetcher = fetcher(&server);
        let progress = ProgressTracker::silent();

        let err = fetcher.fetch(&descriptor(), &progress).await.unwrap_err();
        assert!(matches!(err, LoaderError::Network { transient: false, .. }));

        let identity = ModuleDescriptor::new("identity", "wasm/identity.wasm", "1");
        let err = fetcher.fetch(&identity, &progress).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok".to_vec()))
            .mount(&server)
            .await;

        let config = FetchConfig {
            retries: 2,
            retry_initial_ms: 10,
            ..Default::default()
        };
        let data = fetch_with_retry(
            &fetcher(&server),
            &descriptor(),
            &ProgressTracker::silent(),
            &config,
        )
        .await
        .unwrap();
        assert_eq!(data, b"ok");
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let config = FetchConfig {
            retries: 2,
            retry_initial_ms: 5,
            ..Default::default()
        };
        let err = fetch_with_retry(
            &fetcher(&server),
            &descriptor(),
            &ProgressTracker::silent(),
            &config,
        )
        .await
        .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;

        let config = FetchConfig {
            retry_initial_ms: 5,
            ..Default::default()
        };
        let result = fetch_with_retry(
            &fetcher(&server),
            &descriptor(),
            &ProgressTracker::silent(),
            &config,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_remote_size_unknown_on_error() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        assert_eq!(fetcher(&server).remote_size(&descriptor()).await, None);
    }

    #[tokio::test]
    async fn test_file_origin() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("wasm")).unwrap();
        std::fs::write(dir.path().join("wasm/crypto.wasm"), b"local bytes").unwrap();

        let origin = Url::from_directory_path(dir.path()).unwrap();
        let fetcher = HttpFetcher::new(origin, &FetchConfig::default()).unwrap();

        assert_eq!(fetcher.remote_size(&descriptor()).await, Some(11));
        let data = fetcher
            .fetch(&descriptor(), &ProgressTracker::silent())
            .await
            .unwrap();
        assert_eq!(data, b"local bytes");
    }
}
