//! Module descriptors and the registry built from configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{LoaderError, LoaderResult};

/// Static description of a loadable compute module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    /// Logical identifier (e.g. "crypto", "identity")
    pub id: String,
    /// Path of the binary relative to the configured origin
    pub path: String,
    /// Version tag used for cache keys and cache-busting requests
    pub version: String,
    /// Name of the readiness flag the module raises once initialized.
    /// Defaults to `<id>_ready`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_signal: Option<String>,
    /// Functions this module exports to callers
    #[serde(default)]
    pub functions: Vec<String>,
}

impl ModuleDescriptor {
    pub fn new(id: &str, path: &str, version: &str) -> Self {
        Self {
            id: id.to_string(),
            path: path.to_string(),
            version: version.to_string(),
            ready_signal: None,
            functions: Vec::new(),
        }
    }

    pub fn with_ready_signal(mut self, signal: &str) -> Self {
        self.ready_signal = Some(signal.to_string());
        self
    }

    pub fn with_functions<I, S>(mut self, functions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.functions = functions.into_iter().map(Into::into).collect();
        self
    }

    /// Readiness flag name, falling back to `<id>_ready`
    pub fn ready_signal(&self) -> String {
        self.ready_signal
            .clone()
            .unwrap_or_else(|| format!("{}_ready", self.id))
    }
}

impl fmt::Display for ModuleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} ({})", self.id, self.version, self.path)
    }
}

/// Handle to one instantiation of a module inside an execution environment.
///
/// Every load gets a fresh generation. An environment holds at most one
/// instance per module id and only acts on handles of that instance's
/// generation, so a late load can never replace or drop a newer one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleHandle {
    id: String,
    generation: u64,
}

impl ModuleHandle {
    pub fn new(id: &str, generation: u64) -> Self {
        Self {
            id: id.to_string(),
            generation,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl fmt::Display for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.id, self.generation)
    }
}

/// Argument passed to an exported module function
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModuleArg {
    Text(String),
    Bytes(Vec<u8>),
}

impl ModuleArg {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            ModuleArg::Text(s) => s.as_bytes(),
            ModuleArg::Bytes(b) => b,
        }
    }
}

impl From<&str> for ModuleArg {
    fn from(v: &str) -> Self {
        ModuleArg::Text(v.to_string())
    }
}

impl From<String> for ModuleArg {
    fn from(v: String) -> Self {
        ModuleArg::Text(v)
    }
}

impl From<Vec<u8>> for ModuleArg {
    fn from(v: Vec<u8>) -> Self {
        ModuleArg::Bytes(v)
    }
}

impl From<&serde_json::Value> for ModuleArg {
    fn from(v: &serde_json::Value) -> Self {
        match v {
            serde_json::Value::String(s) => ModuleArg::Text(s.clone()),
            other => ModuleArg::Text(other.to_string()),
        }
    }
}

/// Descriptors indexed by module id, plus a function-name to owner index
#[derive(Debug, Clone, Default)]
pub struct ModuleRegistry {
    modules: HashMap<String, Arc<ModuleDescriptor>>,
    owners: HashMap<String, String>,
}

impl ModuleRegistry {
    pub fn new(descriptors: Vec<ModuleDescriptor>) -> LoaderResult<Self> {
        let mut registry = Self::default();
        for descriptor in descriptors {
            registry.register(descriptor)?;
        }
        Ok(registry)
    }

    fn register(&mut self, descriptor: ModuleDescriptor) -> LoaderResult<()> {
        if descriptor.id.trim().is_empty() {
            return Err(LoaderError::Config("module id must not be empty".to_string()));
        }
        if self.modules.contains_key(&descriptor.id) {
            return Err(LoaderError::Config(format!(
                "duplicate module id '{}'",
                descriptor.id
            )));
        }

        for function in &descriptor.functions {
            if let Some(owner) = self.owners.get(function) {
                return Err(LoaderError::Config(format!(
                    "function '{}' is declared by both '{}' and '{}'",
                    function, owner, descriptor.id
                )));
            }
            self.owners.insert(function.clone(), descriptor.id.clone());
        }

        self.modules
            .insert(descriptor.id.clone(), Arc::new(descriptor));
        Ok(())
    }

    pub fn get(&self, id: &str) -> LoaderResult<Arc<ModuleDescriptor>> {
        self.modules
            .get(id)
            .cloned()
            .ok_or_else(|| LoaderError::UnknownModule(id.to_string()))
    }

    /// Module that declares `function`
    pub fn owner_of(&self, function: &str) -> Option<&str> {
        self.owners.get(function).map(String::as_str)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.modules.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_signal_default() {
        let desc = ModuleDescriptor::new("crypto", "wasm/crypto.wasm", "3");
        assert_eq!(desc.ready_signal(), "crypto_ready");

        let desc = desc.with_ready_signal("cryptoReady");
        assert_eq!(desc.ready_signal(), "cryptoReady");
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let result = ModuleRegistry::new(vec![
            ModuleDescriptor::new("crypto", "a.wasm", "1"),
            ModuleDescriptor::new("crypto", "b.wasm", "1"),
        ]);
        assert!(matches!(result, Err(LoaderError::Config(_))));
    }

    #[test]
    fn test_registry_function_owner() {
        let registry = ModuleRegistry::new(vec![
            ModuleDescriptor::new("crypto", "crypto.wasm", "1").with_functions(["sign", "verify"]),
            ModuleDescriptor::new("identity", "identity.wasm", "1").with_functions(["prove"]),
        ])
        .unwrap();

        assert_eq!(registry.owner_of("verify"), Some("crypto"));
        assert_eq!(registry.owner_of("prove"), Some("identity"));
        assert_eq!(registry.owner_of("missing"), None);
        assert_eq!(registry.ids(), vec!["crypto", "identity"]);
        assert!(matches!(
            registry.get("did"),
            Err(LoaderError::UnknownModule(_))
        ));
    }

    #[test]
    fn test_module_arg_conversions() {
        assert_eq!(ModuleArg::from("abc").as_bytes(), b"abc");
        assert_eq!(ModuleArg::from(vec![1u8, 2]).as_bytes(), &[1, 2]);
        assert_eq!(
            ModuleArg::from(&serde_json::json!({"a": 1})),
            ModuleArg::Text("{\"a\":1}".to_string())
        );
    }
}
