//! Inline execution: modules run on the caller's task

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use wasmtime::Engine;

use super::{ExecutionEnvironment, ExecutionMode, WasmModuleInstance};
use crate::descriptor::{ModuleArg, ModuleDescriptor, ModuleHandle};
use crate::error::{LoaderError, LoaderResult};

struct InlineInstance {
    generation: u64,
    instance: Arc<Mutex<WasmModuleInstance>>,
}

/// Inline execution environment
pub struct InlineEnvironment {
    engine: Engine,
    instances: Mutex<HashMap<String, InlineInstance>>,
}

impl InlineEnvironment {
    pub fn new() -> Self {
        Self {
            engine: Engine::default(),
            instances: Mutex::new(HashMap::new()),
        }
    }

    fn instance(&self, handle: &ModuleHandle) -> LoaderResult<Arc<Mutex<WasmModuleInstance>>> {
        self.instances
            .lock()
            .get(handle.id())
            .filter(|slot| slot.generation == handle.generation())
            .map(|slot| Arc::clone(&slot.instance))
            .ok_or_else(|| LoaderError::ModuleNotLoaded(handle.id().to_string()))
    }

    pub fn loaded(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.instances.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Default for InlineEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionEnvironment for InlineEnvironment {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Inline
    }

    async fn instantiate(
        &self,
        handle: &ModuleHandle,
        descriptor: &ModuleDescriptor,
        bytes: Arc<Vec<u8>>,
    ) -> LoaderResult<()> {
        let instance = WasmModuleInstance::instantiate(&self.engine, descriptor, &bytes)?;

        let mut instances = self.instances.lock();
        if let Some(current) = instances.get(handle.id())
            && current.generation > handle.generation()
        {
            debug!("Dropping {}: generation {} is already loaded", handle, current.generation);
            return Err(LoaderError::Superseded {
                module: handle.id().to_string(),
                current: current.generation,
            });
        }
        instances.insert(
            handle.id().to_string(),
            InlineInstance {
                generation: handle.generation(),
                instance: Arc::new(Mutex::new(instance)),
            },
        );
        Ok(())
    }

    async fn is_ready(&self, handle: &ModuleHandle) -> LoaderResult<bool> {
        Ok(self.instance(handle)?.lock().is_ready())
    }

    async fn invoke(
        &self,
        handle: &ModuleHandle,
        function: &str,
        args: &[ModuleArg],
    ) -> LoaderResult<String> {
        self.instance(handle)?.lock().invoke(function, args)
    }

    async fn discard(&self, handle: &ModuleHandle) {
        let mut instances = self.instances.lock();
        if instances
            .get(handle.id())
            .is_some_and(|slot| slot.generation == handle.generation())
        {
            instances.remove(handle.id());
            debug!("Discarded inline instance {}", handle);
        }
    }

    async fn status(&self) -> Option<serde_json::Value> {
        Some(json!({ "modules": self.loaded() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReadinessConfig;
    use crate::engine::wasm::tests::ECHO_WAT;

    fn crypto() -> ModuleDescriptor {
        ModuleDescriptor::new("crypto", "wasm/crypto.wasm", "1")
    }

    fn echo() -> Arc<Vec<u8>> {
        Arc::new(ECHO_WAT.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn test_instantiate_and_invoke() {
        let env = InlineEnvironment::new();
        let handle = ModuleHandle::new("crypto", 1);
        env.instantiate(&handle, &crypto(), echo()).await.unwrap();

        env.wait_until_ready(&handle, &ReadinessConfig::default())
            .await
            .unwrap();
        assert_eq!(env.invoke(&handle, "echo", &["abc".into()]).await.unwrap(), "abc");
        assert_eq!(env.status().await.unwrap(), json!({"modules": ["crypto"]}));

        env.discard(&handle).await;
        assert!(matches!(
            env.invoke(&handle, "echo", &["abc".into()]).await,
            Err(LoaderError::ModuleNotLoaded(_))
        ));
    }

    #[tokio::test]
    async fn test_late_generation_never_replaces_newer() {
        let env = InlineEnvironment::new();
        let stale = ModuleHandle::new("crypto", 1);
        let current = ModuleHandle::new("crypto", 2);

        env.instantiate(&current, &crypto(), echo()).await.unwrap();
        let err = env.instantiate(&stale, &crypto(), echo()).await.unwrap_err();
        assert_eq!(
            err,
            LoaderError::Superseded {
                module: "crypto".to_string(),
                current: 2,
            }
        );

        // the stale handle neither reaches nor drops the current instance
        assert!(matches!(
            env.invoke(&stale, "echo", &["x".into()]).await,
            Err(LoaderError::ModuleNotLoaded(_))
        ));
        env.discard(&stale).await;
        assert_eq!(env.invoke(&current, "echo", &["x".into()]).await.unwrap(), "x");
    }

    #[tokio::test]
    async fn test_newer_generation_replaces_older() {
        let env = InlineEnvironment::new();
        let first = ModuleHandle::new("crypto", 1);
        let second = ModuleHandle::new("crypto", 2);

        env.instantiate(&first, &crypto(), echo()).await.unwrap();
        env.instantiate(&second, &crypto(), echo()).await.unwrap();

        env.discard(&first).await;
        assert_eq!(env.loaded(), vec!["crypto".to_string()]);
        assert!(env.is_ready(&second).await.unwrap());
    }

    #[tokio::test]
    async fn test_readiness_timeout() {
        let env = InlineEnvironment::new();
        let wat = r#"(module (global (export "crypto_ready") (mut i32) (i32.const 0)))"#;
        let handle = ModuleHandle::new("crypto", 1);
        env.instantiate(&handle, &crypto(), Arc::new(wat.as_bytes().to_vec()))
            .await
            .unwrap();

        let readiness = ReadinessConfig {
            poll_interval_ms: 5,
            timeout_ms: 30,
        };
        let err = env.wait_until_ready(&handle, &readiness).await.unwrap_err();
        assert!(matches!(err, LoaderError::ReadinessTimeout { ref module, .. } if module == "crypto"));
    }
}
