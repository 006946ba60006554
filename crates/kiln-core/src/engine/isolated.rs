//! Isolated execution: modules run on the worker, reached over the channel

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::{ExecutionEnvironment, ExecutionMode, WorkerFactory, WorkerRequest};
use crate::channel::{ChannelState, WorkerChannel};
use crate::config::{IsolationConfig, ReadinessConfig};
use crate::descriptor::{ModuleArg, ModuleDescriptor, ModuleHandle};
use crate::error::{LoaderError, LoaderResult};

/// Isolated execution environment
pub struct IsolatedEnvironment {
    channel: WorkerChannel,
    config: IsolationConfig,
    readiness: ReadinessConfig,
    /// Module id to the generation the worker hosts
    hosted: Mutex<HashMap<String, u64>>,
}

impl IsolatedEnvironment {
    pub fn new(
        factory: Arc<dyn WorkerFactory>,
        config: IsolationConfig,
        readiness: ReadinessConfig,
    ) -> Self {
        Self {
            channel: WorkerChannel::new(factory, config.clone()),
            config,
            readiness,
            hosted: Mutex::new(HashMap::new()),
        }
    }

    pub fn channel(&self) -> &WorkerChannel {
        &self.channel
    }

    /// Number of modules currently hosted by the worker
    pub fn hosted_count(&self) -> usize {
        self.hosted.lock().len()
    }

    /// Whether the worker is running and still hosts `handle`'s instance
    pub fn hosts(&self, handle: &ModuleHandle) -> bool {
        self.channel.state() == ChannelState::Ready
            && self.hosted.lock().get(handle.id()) == Some(&handle.generation())
    }

    /// Stop the worker; every hosted module is lost
    pub fn terminate(&self) {
        self.hosted.lock().clear();
        self.channel.terminate();
    }
}

#[async_trait]
impl ExecutionEnvironment for IsolatedEnvironment {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Isolated
    }

    async fn instantiate(
        &self,
        handle: &ModuleHandle,
        descriptor: &ModuleDescriptor,
        bytes: Arc<Vec<u8>>,
    ) -> LoaderResult<()> {
        self.channel.ensure_ready().await?;

        // Readiness is observed inside the worker, so the load may take as
        // long as the readiness window on top of the round trip.
        let timeout = self.config.request_timeout() + self.readiness.timeout();
        self.channel
            .send_with_timeout(
                WorkerRequest::LoadModule {
                    descriptor: descriptor.clone(),
                    generation: handle.generation(),
                    bytes,
                    readiness: self.readiness.clone(),
                },
                timeout,
            )
            .await?;

        let mut hosted = self.hosted.lock();
        let current = hosted.entry(handle.id().to_string()).or_insert(handle.generation());
        if *current > handle.generation() {
            return Err(LoaderError::Superseded {
                module: handle.id().to_string(),
                current: *current,
            });
        }
        *current = handle.generation();
        Ok(())
    }

    async fn is_ready(&self, handle: &ModuleHandle) -> LoaderResult<bool> {
        Ok(self.hosts(handle))
    }

    async fn invoke(
        &self,
        handle: &ModuleHandle,
        function: &str,
        args: &[ModuleArg],
    ) -> LoaderResult<String> {
        if self.hosted.lock().get(handle.id()) != Some(&handle.generation()) {
            return Err(LoaderError::ModuleNotLoaded(handle.id().to_string()));
        }
        let value = self
            .channel
            .send(WorkerRequest::Invoke {
                module: handle.id().to_string(),
                function: function.to_string(),
                args: args.to_vec(),
            })
            .await?;

        Ok(match value {
            serde_json::Value::String(text) => text,
            other => other.to_string(),
        })
    }

    async fn discard(&self, handle: &ModuleHandle) {
        {
            let mut hosted = self.hosted.lock();
            if hosted.get(handle.id()) != Some(&handle.generation()) {
                return;
            }
            hosted.remove(handle.id());
        }
        if self.channel.state() != ChannelState::Ready {
            return;
        }

        // A worker busy with another request answers late or never; the
        // unload is best effort and bounded by the handshake window.
        if let Err(e) = self
            .channel
            .send_with_timeout(
                WorkerRequest::Unload {
                    module: handle.id().to_string(),
                    generation: handle.generation(),
                },
                self.config.init_timeout(),
            )
            .await
        {
            debug!("Failed to unload {} from worker: {}", handle, e);
        }
    }

    async fn status(&self) -> Option<serde_json::Value> {
        let state = self.channel.state();
        let mut status = json!({
            "state": state,
            "pending": self.channel.pending_count(),
        });
        if state == ChannelState::Ready
            && let Ok(worker) = self.channel.send(WorkerRequest::Status).await
        {
            status["worker"] = worker;
        }
        Some(status)
    }
}
