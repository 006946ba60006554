//! wasmtime-backed module instance
//!
//! Module ABI:
//! - exports `memory` and `alloc(len: i32) -> i32`
//! - optional entry point `_initialize` or `_start`
//! - readiness through an exported mutable `i32` global named after the
//!   descriptor's ready signal, or a call to `env.signal_ready()`
//! - functions take one `(ptr, len)` pair per argument and return an `i64`
//!   packing `(ptr << 32) | len` of UTF-8 text, an `i32`, or nothing
//! - host imports `env.signal_ready`, `env.host_log` and `env.host_now_ms`;
//!   any other import traps when called

use chrono::Utc;
use tracing::{debug, error, info, trace, warn};
use wasmtime::{Caller, Engine, Extern, ExternType, Func, Instance, Linker, Module, Store, Val, ValType};

use crate::descriptor::{ModuleArg, ModuleDescriptor};
use crate::error::{LoaderError, LoaderResult};

const ENTRY_POINTS: [&str; 2] = ["_initialize", "_start"];

/// Per-store host state
#[derive(Debug)]
pub struct HostState {
    module: String,
    ready: bool,
}

/// A single instantiated module with its own store
pub struct WasmModuleInstance {
    module_id: String,
    ready_signal: String,
    store: Store<HostState>,
    instance: Instance,
    exports: Vec<String>,
}

impl WasmModuleInstance {
    /// Compile, link, instantiate and run the module's entry point
    pub fn instantiate(
        engine: &Engine,
        descriptor: &ModuleDescriptor,
        bytes: &[u8],
    ) -> LoaderResult<Self> {
        let id = descriptor.id.as_str();
        let module = Module::new(engine, bytes).map_err(|e| LoaderError::instantiation(id, format!("{:#}", e)))?;

        let exports = module
            .exports()
            .filter(|e| matches!(e.ty(), ExternType::Func(_)))
            .map(|e| e.name().to_string())
            .collect();

        let mut store = Store::new(
            engine,
            HostState {
                module: id.to_string(),
                ready: false,
            },
        );
        // Only consulted by engines with epoch interruption enabled: the next
        // epoch bump traps any call in progress.
        store.set_epoch_deadline(1);

        let mut linker = Linker::new(engine);
        Self::add_host_functions(&mut linker).map_err(|e| LoaderError::instantiation(id, e))?;
        linker
            .define_unknown_imports_as_traps(&module)
            .map_err(|e| LoaderError::instantiation(id, e))?;

        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|e| LoaderError::instantiation(id, format!("{:#}", e)))?;

        let mut this = Self {
            module_id: id.to_string(),
            ready_signal: descriptor.ready_signal(),
            store,
            instance,
            exports,
        };
        this.run_entry_point()?;

        info!("Instantiated module {} ({} bytes)", this.module_id, bytes.len());
        Ok(this)
    }

    fn add_host_functions(linker: &mut Linker<HostState>) -> wasmtime::Result<()> {
        linker.func_wrap("env", "signal_ready", |mut caller: Caller<'_, HostState>| {
            debug!("Module {} signalled readiness", caller.data().module);
            caller.data_mut().ready = true;
        })?;

        linker.func_wrap(
            "env",
            "host_log",
            |mut caller: Caller<'_, HostState>, level: i32, ptr: i32, len: i32| {
                let message = caller
                    .get_export("memory")
                    .and_then(Extern::into_memory)
                    .and_then(|memory| {
                        let data = memory.data(&caller);
                        let start = ptr as u32 as usize;
                        let end = start.checked_add(len as u32 as usize)?;
                        data.get(start..end)
                            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                    })
                    .unwrap_or_else(|| format!("<invalid log buffer {}+{}>", ptr, len));

                let module = &caller.data().module;
                match level {
                    0 => error!("[{}] {}", module, message),
                    1 => warn!("[{}] {}", module, message),
                    2 => info!("[{}] {}", module, message),
                    3 => debug!("[{}] {}", module, message),
                    _ => trace!("[{}] {}", module, message),
                }
            },
        )?;

        linker.func_wrap("env", "host_now_ms", |_caller: Caller<'_, HostState>| -> i64 {
            Utc::now().timestamp_millis()
        })?;

        Ok(())
    }

    fn run_entry_point(&mut self) -> LoaderResult<()> {
        for name in ENTRY_POINTS {
            let Some(func) = self.instance.get_func(&mut self.store, name) else {
                continue;
            };
            let entry = func
                .typed::<(), ()>(&self.store)
                .map_err(|e| LoaderError::instantiation(&self.module_id, format!("{}: {}", name, e)))?;
            entry
                .call(&mut self.store, ())
                .map_err(|e| LoaderError::instantiation(&self.module_id, format!("{} trapped: {:#}", name, e)))?;
            debug!("Ran {} for module {}", name, self.module_id);
            return Ok(());
        }
        Ok(())
    }

    pub fn module_id(&self) -> &str {
        &self.module_id
    }

    /// Exported function names
    pub fn exports(&self) -> &[String] {
        &self.exports
    }

    /// Whether the module has raised its readiness signal
    pub fn is_ready(&mut self) -> bool {
        if self.store.data().ready {
            return true;
        }

        match self
            .instance
            .get_global(&mut self.store, &self.ready_signal)
            .map(|g| g.get(&mut self.store))
        {
            Some(Val::I32(v)) => v != 0,
            Some(Val::I64(v)) => v != 0,
            _ => false,
        }
    }

    fn function(&mut self, function: &str) -> LoaderResult<Func> {
        self.instance
            .get_export(&mut self.store, function)
            .and_then(Extern::into_func)
            .ok_or_else(|| LoaderError::FunctionNotAvailable {
                module: self.module_id.clone(),
                function: function.to_string(),
            })
    }

    /// Call an exported function and decode its text result
    pub fn invoke(&mut self, function: &str, args: &[ModuleArg]) -> LoaderResult<String> {
        let func = self.function(function)?;
        let ty = func.ty(&self.store);

        let params: Vec<ValType> = ty.params().collect();
        if params.len() != args.len() * 2 || !params.iter().all(|p| matches!(p, ValType::I32)) {
            return Err(LoaderError::execution(
                function,
                format!(
                    "expects {} i32 parameters, called with {} argument(s)",
                    params.len(),
                    args.len()
                ),
            ));
        }

        let mut call_args = Vec::with_capacity(params.len());
        for arg in args {
            let (ptr, len) = self.write_arg(function, arg.as_bytes())?;
            call_args.push(Val::I32(ptr));
            call_args.push(Val::I32(len));
        }

        let mut results = ty
            .results()
            .map(|t| match t {
                ValType::I32 => Ok(Val::I32(0)),
                ValType::I64 => Ok(Val::I64(0)),
                other => Err(LoaderError::execution(
                    function,
                    format!("unsupported return type {:?}", other),
                )),
            })
            .collect::<LoaderResult<Vec<Val>>>()?;

        trace!("Calling {}::{} with {} argument(s)", self.module_id, function, args.len());
        func.call(&mut self.store, &call_args, &mut results)
            .map_err(|e| LoaderError::execution(function, format!("{:#}", e)))?;

        match results.as_slice() {
            [] => Ok(String::new()),
            [Val::I32(v)] => Ok(v.to_string()),
            [Val::I64(packed)] => {
                let packed = *packed as u64;
                self.read_text(function, (packed >> 32) as usize, (packed & 0xffff_ffff) as usize)
            }
            _ => Err(LoaderError::execution(function, "multiple return values are not supported")),
        }
    }

    fn write_arg(&mut self, function: &str, bytes: &[u8]) -> LoaderResult<(i32, i32)> {
        let memory = self
            .instance
            .get_memory(&mut self.store, "memory")
            .ok_or_else(|| LoaderError::execution(function, "module does not export memory"))?;
        let alloc = self
            .instance
            .get_typed_func::<i32, i32>(&mut self.store, "alloc")
            .map_err(|e| LoaderError::execution(function, format!("alloc unavailable: {}", e)))?;

        let len = i32::try_from(bytes.len())
            .map_err(|_| LoaderError::execution(function, "argument too large"))?;
        let ptr = alloc
            .call(&mut self.store, len)
            .map_err(|e| LoaderError::execution(function, format!("alloc trapped: {:#}", e)))?;

        memory
            .write(&mut self.store, ptr as u32 as usize, bytes)
            .map_err(|e| LoaderError::execution(function, e))?;
        Ok((ptr, len))
    }

    fn read_text(&mut self, function: &str, ptr: usize, len: usize) -> LoaderResult<String> {
        let memory = self
            .instance
            .get_memory(&mut self.store, "memory")
            .ok_or_else(|| LoaderError::execution(function, "module does not export memory"))?;

        let data = memory.data(&self.store);
        let bytes = ptr
            .checked_add(len)
            .and_then(|end| data.get(ptr..end))
            .ok_or_else(|| {
                LoaderError::execution(
                    function,
                    format!(
                        "result {}+{} is outside linear memory of {} bytes",
                        ptr,
                        len,
                        data.len()
                    ),
                )
            })?;
        String::from_utf8(bytes.to_vec()).map_err(|e| LoaderError::execution(function, e))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Test module implementing the ABI; ready once `_initialize` runs
    pub(crate) const ECHO_WAT: &str = r#"
(module
  (import "env" "host_log" (func $host_log (param i32 i32 i32)))
  (memory (export "memory") 1)
  (global $heap (mut i32) (i32.const 1024))
  (global (export "crypto_ready") (mut i32) (i32.const 0))
  (data (i32.const 16) "{\"ok\":true}")
  (data (i32.const 64) "booting")
  (func (export "alloc") (param $len i32) (result i32)
    (local $ptr i32)
    global.get $heap
    local.set $ptr
    global.get $heap
    local.get $len
    i32.add
    global.set $heap
    local.get $ptr)
  (func (export "_initialize")
    i32.const 2
    i32.const 64
    i32.const 7
    call $host_log
    i32.const 1
    global.set 1)
  (func (export "echo") (param $ptr i32) (param $len i32) (result i64)
    local.get $ptr
    i64.extend_i32_u
    i64.const 32
    i64.shl
    local.get $len
    i64.extend_i32_u
    i64.or)
  (func (export "status") (result i64)
    i64.const 68719476747)
  (func (export "length") (param i32 i32) (result i32)
    local.get 1)
  (func (export "noop"))
  (func (export "boom")
    unreachable))
"#;

    fn instantiate(wat: &str, descriptor: &ModuleDescriptor) -> LoaderResult<WasmModuleInstance> {
        WasmModuleInstance::instantiate(&Engine::default(), descriptor, wat.as_bytes())
    }

    fn crypto() -> ModuleDescriptor {
        ModuleDescriptor::new("crypto", "wasm/crypto.wasm", "1")
    }

    #[test]
    fn test_ready_global_after_initialize() {
        let mut instance = instantiate(ECHO_WAT, &crypto()).unwrap();
        assert!(instance.is_ready());
        assert!(instance.exports().contains(&"echo".to_string()));
    }

    #[test]
    fn test_invoke_return_shapes() {
        let mut instance = instantiate(ECHO_WAT, &crypto()).unwrap();

        assert_eq!(
            instance.invoke("echo", &["hello".into()]).unwrap(),
            "hello"
        );
        assert_eq!(instance.invoke("status", &[]).unwrap(), "{\"ok\":true}");
        assert_eq!(
            instance.invoke("length", &[vec![1u8, 2, 3, 4].into()]).unwrap(),
            "4"
        );
        assert_eq!(instance.invoke("noop", &[]).unwrap(), "");
    }

    #[test]
    fn test_result_outside_memory() {
        // one page of memory; results claim 4 GiB and a span past the end
        let wat = r#"
(module
  (memory (export "memory") 1)
  (func (export "huge") (result i64)
    i64.const 0xffffffff)
  (func (export "past_end") (result i64)
    i64.const 0x0000fff000000100))
"#;
        let mut instance = instantiate(wat, &crypto()).unwrap();

        let err = instance.invoke("huge", &[]).unwrap_err();
        assert!(matches!(err, LoaderError::Execution { ref message, .. } if message.contains("outside linear memory")));
        assert!(matches!(
            instance.invoke("past_end", &[]),
            Err(LoaderError::Execution { .. })
        ));
    }

    #[test]
    fn test_missing_function() {
        let mut instance = instantiate(ECHO_WAT, &crypto()).unwrap();
        let err = instance.invoke("sign", &[]).unwrap_err();
        assert!(matches!(err, LoaderError::FunctionNotAvailable { .. }));

        // globals are exports too, but not functions
        let err = instance.invoke("crypto_ready", &[]).unwrap_err();
        assert!(matches!(err, LoaderError::FunctionNotAvailable { .. }));
    }

    #[test]
    fn test_arity_and_trap_errors() {
        let mut instance = instantiate(ECHO_WAT, &crypto()).unwrap();
        assert!(matches!(
            instance.invoke("echo", &[]),
            Err(LoaderError::Execution { .. })
        ));
        assert!(matches!(
            instance.invoke("boom", &[]),
            Err(LoaderError::Execution { .. })
        ));
    }

    #[test]
    fn test_signal_ready_import_and_unknown_imports() {
        let wat = r#"
(module
  (import "env" "signal_ready" (func $signal_ready))
  (import "env" "random_bytes" (func $random (param i32 i32)))
  (func (export "_start") call $signal_ready))
"#;
        let desc = ModuleDescriptor::new("identity", "wasm/identity.wasm", "1");
        let mut instance = instantiate(wat, &desc).unwrap();
        assert!(instance.is_ready());
    }

    #[test]
    fn test_not_ready_without_signal() {
        let wat = r#"(module (global (export "crypto_ready") (mut i32) (i32.const 0)))"#;
        let mut instance = instantiate(wat, &crypto()).unwrap();
        assert!(!instance.is_ready());
    }

    #[test]
    fn test_invalid_bytes() {
        let err = WasmModuleInstance::instantiate(&Engine::default(), &crypto(), b"not wasm")
            .err()
            .unwrap();
        assert!(matches!(err, LoaderError::Instantiation { .. }));
    }

    #[test]
    fn test_trapping_entry_point() {
        let wat = r#"(module (func (export "_initialize") unreachable))"#;
        assert!(matches!(
            instantiate(wat, &crypto()),
            Err(LoaderError::Instantiation { .. })
        ));
    }
}
