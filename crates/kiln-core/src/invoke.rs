//! Function invocation helper
//!
//! Callers name a function; the helper finds the module that declares it,
//! loads that module if needed and invokes the function. Failures are wrapped
//! with the name of the operation so the caller sees what was attempted.

use serde::de::DeserializeOwned;

use crate::descriptor::ModuleArg;
use crate::error::{LoaderError, LoaderResult};
use crate::loader::ModuleLoader;

/// Load-then-invoke helper over a [`ModuleLoader`]
#[derive(Clone)]
pub struct FunctionInvoker {
    loader: ModuleLoader,
}

impl FunctionInvoker {
    pub fn new(loader: ModuleLoader) -> Self {
        Self { loader }
    }

    pub fn loader(&self) -> &ModuleLoader {
        &self.loader
    }

    /// Invoke `function` on the module that declares it
    pub async fn invoke(&self, function: &str, args: &[ModuleArg]) -> LoaderResult<serde_json::Value> {
        let module = self
            .loader
            .registry()
            .owner_of(function)
            .ok_or_else(|| LoaderError::UnknownFunction(function.to_string()).during(function))?
            .to_string();
        self.call(&module, function, args).await
    }

    /// Invoke `function` on an explicitly named module
    pub async fn call(
        &self,
        module: &str,
        function: &str,
        args: &[ModuleArg],
    ) -> LoaderResult<serde_json::Value> {
        self.load_and_invoke(module, function, args)
            .await
            .map_err(|e| e.during(function))
    }

    async fn load_and_invoke(
        &self,
        module: &str,
        function: &str,
        args: &[ModuleArg],
    ) -> LoaderResult<serde_json::Value> {
        self.loader.load(module).await?;
        self.loader.invoke(module, function, args).await
    }

    /// Invoke and deserialize the result
    pub async fn call_as<T: DeserializeOwned>(&self, function: &str, args: &[ModuleArg]) -> LoaderResult<T> {
        let value = self.invoke(function, args).await?;
        serde_json::from_value(value).map_err(|e| {
            LoaderError::execution(function, format!("unexpected result shape: {}", e)).during(function)
        })
    }

    /// Load modules ahead of their first use
    pub async fn preload(&self, modules: &[&str]) -> LoaderResult<()> {
        self.loader.load_many(modules).await
    }
}
