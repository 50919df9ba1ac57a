//! Sandbox runtime using wasmtime.
//!
//! Each [`WasmInstance`] owns a store whose data is a [`WasmHostState`]: the
//! per-instance [`BridgeContext`], the host environment and the guest exports
//! the bridge calls back into. Guests may additionally import WASI preview1.

use super::config::{WasiCapabilities, WasmConfig};
use super::imports;
use crate::bridge::{BridgeContext, BridgeStats};
use crate::closure::GuestClosures;
use crate::codec::{self, EncodedString, GuestAllocator};
use crate::error::{BridgeError, Result};
use crate::host::{HeadlessHost, HostEnvironment};
use crate::memory::{GuestMemory, MemoryViews, RawMemory};
use crate::value::HostValue;

use std::path::Path;
use std::time::Instant;

use wasmtime::*;

/// Guest allocator export.
pub const MALLOC_EXPORT: &str = "__hostlink_malloc";
/// Optional guest reallocator export; selects the incremental string encoder.
pub const REALLOC_EXPORT: &str = "__hostlink_realloc";
/// Guest deallocator export.
pub const FREE_EXPORT: &str = "__hostlink_free";
/// Optional guest export receiving host exceptions as handles.
pub const EXN_STORE_EXPORT: &str = "__hostlink_exn_store";
/// Function table holding closure trampolines and destructors.
pub const TABLE_EXPORT: &str = "__indirect_function_table";

/// Store data for one sandbox instance.
pub struct WasmHostState<H> {
    pub(crate) bridge: BridgeContext,
    pub(crate) host: H,
    pub(crate) exports: Option<GuestExports>,
    wasi: wasmtime_wasi::preview1::WasiP1Ctx,
    limits: StoreLimits,
}

/// Guest exports resolved after instantiation.
#[derive(Clone)]
pub(crate) struct GuestExports {
    memory: Memory,
    malloc: Option<TypedFunc<u32, u32>>,
    realloc: Option<TypedFunc<(u32, u32, u32), u32>>,
    free: Option<TypedFunc<(u32, u32), ()>>,
    pub(crate) exn_store: Option<TypedFunc<u32, ()>>,
    table: Option<Table>,
}

impl GuestExports {
    fn resolve<T>(instance: &Instance, store: &mut Store<T>) -> Result<Self> {
        let memory = instance
            .get_memory(&mut *store, "memory")
            .ok_or_else(|| BridgeError::MissingExport("memory".to_string()))?;

        Ok(Self {
            memory,
            malloc: optional_func(instance, store, MALLOC_EXPORT)?,
            realloc: optional_func(instance, store, REALLOC_EXPORT)?,
            free: optional_func(instance, store, FREE_EXPORT)?,
            exn_store: optional_func(instance, store, EXN_STORE_EXPORT)?,
            table: instance.get_table(&mut *store, TABLE_EXPORT),
        })
    }
}

fn optional_func<T, P, R>(instance: &Instance, store: &mut Store<T>, name: &str) -> Result<Option<TypedFunc<P, R>>>
where
    P: WasmParams,
    R: WasmResults,
{
    match instance.get_func(&mut *store, name) {
        None => Ok(None),
        Some(func) => func.typed::<P, R>(&*store).map(Some).map_err(|e| {
            BridgeError::WasmError(format!("export '{}' has the wrong signature: {}", name, e))
        }),
    }
}

/// Recover a bridge error that crossed the guest boundary, or wrap a trap.
pub(crate) fn guest_error(e: wasmtime::Error) -> BridgeError {
    match e.downcast::<BridgeError>() {
        Ok(bridge) => bridge,
        Err(e) => BridgeError::WasmError(format!("{:#}", e)),
    }
}

/// The guest as seen from inside a store: memory, allocator and closures.
pub(crate) struct WasmGuest<'a, H: 'static> {
    ctx: StoreContextMut<'a, WasmHostState<H>>,
    exports: GuestExports,
}

impl<'a, H: 'static> WasmGuest<'a, H> {
    pub(crate) fn new(mut ctx: StoreContextMut<'a, WasmHostState<H>>) -> Result<Self> {
        let exports = ctx
            .data_mut()
            .exports
            .clone()
            .ok_or_else(|| BridgeError::WasmError("guest called the bridge before instantiation finished".into()))?;
        Ok(Self { ctx, exports })
    }

    pub(crate) fn state(&mut self) -> &mut WasmHostState<H> {
        self.ctx.data_mut()
    }

    fn table_func(&mut self, index: u32) -> Result<Func> {
        let table = self
            .exports
            .table
            .ok_or_else(|| BridgeError::MissingExport(TABLE_EXPORT.to_string()))?;
        match table.get(&mut self.ctx, index.into()) {
            Some(Ref::Func(Some(func))) => Ok(func),
            _ => Err(BridgeError::WasmError(format!(
                "no function at table index {}",
                index
            ))),
        }
    }
}

impl<H: 'static> GuestMemory for WasmGuest<'_, H> {
    fn split(&mut self) -> (&mut MemoryViews, RawMemory<'_>) {
        let (bytes, state) = self.exports.memory.data_and_store_mut(&mut self.ctx);
        (&mut state.bridge.views, RawMemory::new(bytes))
    }
}

impl<H: 'static> GuestAllocator for WasmGuest<'_, H> {
    fn malloc(&mut self, size: u32) -> Result<u32> {
        let malloc = self
            .exports
            .malloc
            .as_ref()
            .ok_or_else(|| BridgeError::MissingExport(MALLOC_EXPORT.to_string()))?;
        malloc.call(&mut self.ctx, size).map_err(guest_error)
    }

    fn has_realloc(&self) -> bool {
        self.exports.realloc.is_some()
    }

    fn realloc(&mut self, ptr: u32, old_size: u32, new_size: u32) -> Result<u32> {
        let realloc = self
            .exports
            .realloc
            .as_ref()
            .ok_or_else(|| BridgeError::MissingExport(REALLOC_EXPORT.to_string()))?;
        realloc
            .call(&mut self.ctx, (ptr, old_size, new_size))
            .map_err(guest_error)
    }

    fn free(&mut self, ptr: u32, size: u32) -> Result<()> {
        let free = self
            .exports
            .free
            .as_ref()
            .ok_or_else(|| BridgeError::MissingExport(FREE_EXPORT.to_string()))?;
        free.call(&mut self.ctx, (ptr, size)).map_err(guest_error)
    }
}

impl<H: 'static> GuestClosures for WasmGuest<'_, H> {
    fn call_trampoline(&mut self, trampoline: u32, a: u32, b: u32, arg: u32) -> Result<()> {
        let func = self.table_func(trampoline)?;
        let func = func
            .typed::<(u32, u32, u32), ()>(&self.ctx)
            .map_err(|e| BridgeError::WasmError(format!("closure trampoline {}: {}", trampoline, e)))?;
        func.call(&mut self.ctx, (a, b, arg)).map_err(guest_error)
    }

    fn call_destructor(&mut self, dtor: u32, a: u32, b: u32) -> Result<()> {
        let func = self.table_func(dtor)?;
        let func = func
            .typed::<(u32, u32), ()>(&self.ctx)
            .map_err(|e| BridgeError::WasmError(format!("closure destructor {}: {}", dtor, e)))?;
        func.call(&mut self.ctx, (a, b)).map_err(guest_error)?;
        self.state().bridge.note_finalized();
        Ok(())
    }
}

/// A WebAssembly sandbox that links guests against the host capability table.
pub struct WasmSandbox {
    engine: Engine,
    config: WasmConfig,
}

/// A compiled WebAssembly module.
pub struct WasmModule {
    module: Module,
    name: String,
}

/// An instantiated guest bound to a host environment.
pub struct WasmInstance<H: 'static> {
    store: Store<WasmHostState<H>>,
    instance: Instance,
}

/// Result of a guest call with timing information.
#[derive(Debug, Clone)]
pub struct WasmCallResult<T> {
    /// The return value
    pub value: T,
    /// Execution time in microseconds
    pub execution_time_us: u64,
    /// Fuel consumed (if fuel metering enabled)
    pub fuel_consumed: Option<u64>,
}

impl WasmSandbox {
    /// Create a new sandbox with the given configuration.
    pub fn new(config: WasmConfig) -> Result<Self> {
        config.validate()?;
        let mut engine_config = Config::new();

        engine_config.cranelift_opt_level(match config.optimization_level {
            0 => OptLevel::None,
            1 => OptLevel::Speed,
            _ => OptLevel::SpeedAndSize,
        });
        engine_config.wasm_simd(config.enable_simd);
        if config.fuel_limit.is_some() {
            engine_config.consume_fuel(true);
        }

        let engine = Engine::new(&engine_config)
            .map_err(|e| BridgeError::WasmError(format!("engine creation failed: {}", e)))?;

        Ok(Self { engine, config })
    }

    /// Load a module from a `.wasm` or `.wat` file.
    pub fn load_module(&self, path: impl AsRef<Path>) -> Result<WasmModule> {
        let path = path.as_ref();
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string();

        let module = Module::from_file(&self.engine, path)
            .map_err(|e| BridgeError::WasmError(format!("module load failed: {}", e)))?;

        Ok(WasmModule { module, name })
    }

    /// Load a module from binary or text bytes.
    pub fn load_module_bytes(&self, name: &str, bytes: impl AsRef<[u8]>) -> Result<WasmModule> {
        let module = Module::new(&self.engine, bytes)
            .map_err(|e| BridgeError::WasmError(format!("module creation failed: {}", e)))?;

        Ok(WasmModule {
            module,
            name: name.to_string(),
        })
    }

    /// Instantiate a module against a host environment.
    pub fn instantiate<H: HostEnvironment + 'static>(&self, module: &WasmModule, host: H) -> Result<WasmInstance<H>> {
        let state = WasmHostState {
            bridge: BridgeContext::new(),
            host,
            exports: None,
            wasi: self.build_wasi(&self.config.capabilities)?,
            limits: StoreLimitsBuilder::new()
                .memory_size(self.config.max_memory)
                .build(),
        };
        let mut store = Store::new(&self.engine, state);
        store.limiter(|state| &mut state.limits);

        if let Some(fuel) = self.config.fuel_limit {
            store
                .set_fuel(fuel)
                .map_err(|e| BridgeError::WasmError(format!("fuel setup failed: {}", e)))?;
        }

        let linker = self.linker::<H>()?;
        let instance = linker
            .instantiate(&mut store, &module.module)
            .map_err(|e| BridgeError::WasmError(format!("instantiation failed: {:#}", e)))?;

        let exports = GuestExports::resolve(&instance, &mut store)?;
        tracing::debug!(
            module = module.name(),
            realloc = exports.realloc.is_some(),
            exn_store = exports.exn_store.is_some(),
            table = exports.table.is_some(),
            "guest instantiated"
        );
        store.data_mut().exports = Some(exports);

        Ok(WasmInstance { store, instance })
    }

    /// Instantiate a module against a fresh [`HeadlessHost`] using the
    /// configured viewport.
    pub fn instantiate_headless(&self, module: &WasmModule) -> Result<WasmInstance<HeadlessHost>> {
        self.instantiate(module, HeadlessHost::new(self.config.viewport.clone()))
    }

    fn linker<H: HostEnvironment + 'static>(&self) -> Result<Linker<WasmHostState<H>>> {
        let mut linker: Linker<WasmHostState<H>> = Linker::new(&self.engine);
        if self.config.link_wasi {
            wasmtime_wasi::preview1::add_to_linker_sync(&mut linker, |state| &mut state.wasi)
                .map_err(|e| BridgeError::WasmError(format!("WASI link failed: {}", e)))?;
        }
        imports::register(&mut linker, &self.config.import_module)?;
        Ok(linker)
    }

    fn build_wasi(&self, caps: &WasiCapabilities) -> Result<wasmtime_wasi::preview1::WasiP1Ctx> {
        let mut builder = wasmtime_wasi::WasiCtxBuilder::new();

        if caps.stdout {
            builder.inherit_stdout();
        }
        if caps.stderr {
            builder.inherit_stderr();
        }
        for (key, value) in &caps.env_vars {
            builder.env(key, value);
        }
        builder.args(&caps.args);

        for dir in &caps.preopened_dirs_ro {
            builder
                .preopened_dir(
                    dir,
                    dir.to_string_lossy(),
                    wasmtime_wasi::DirPerms::READ,
                    wasmtime_wasi::FilePerms::READ,
                )
                .map_err(|e| BridgeError::WasmError(format!("failed to open dir {:?}: {}", dir, e)))?;
        }

        Ok(builder.build_p1())
    }

    /// Get the configuration.
    pub fn config(&self) -> &WasmConfig {
        &self.config
    }
}

impl WasmModule {
    /// Get the module name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get exported function names.
    pub fn exports(&self) -> impl Iterator<Item = &str> {
        self.module.exports().filter_map(|e| {
            if matches!(e.ty(), ExternType::Func(_)) {
                Some(e.name())
            } else {
                None
            }
        })
    }

    /// Function imports as `(module, name, type)`.
    pub fn function_imports(&self) -> Vec<(String, String, FuncType)> {
        self.module
            .imports()
            .filter_map(|i| match i.ty() {
                ExternType::Func(ty) => Some((i.module().to_string(), i.name().to_string(), ty)),
                _ => None,
            })
            .collect()
    }
}

impl<H: HostEnvironment + 'static> WasmInstance<H> {
    /// Call an export with typed parameters and results.
    pub fn call<P, R>(&mut self, name: &str, params: P) -> Result<WasmCallResult<R>>
    where
        P: WasmParams,
        R: WasmResults,
    {
        let func = self.get_typed_func::<P, R>(name)?;
        let start = Instant::now();
        let fuel_before = self.store.get_fuel().ok();

        let value = func.call(&mut self.store, params).map_err(|e| {
            tracing::debug!(export = name, "guest call failed: {:#}", e);
            guest_error(e)
        })?;

        let fuel_after = self.store.get_fuel().ok();
        let fuel_consumed = fuel_before.zip(fuel_after).map(|(b, a)| b - a);

        Ok(WasmCallResult {
            value,
            execution_time_us: start.elapsed().as_micros() as u64,
            fuel_consumed,
        })
    }

    /// Encode `text` into guest memory and call `name(ptr, len)`. The guest
    /// owns the span afterwards.
    pub fn call_str<R: WasmResults>(&mut self, name: &str, text: &str) -> Result<WasmCallResult<R>> {
        let span = self.pass_string(text)?;
        self.call::<(u32, u32), R>(name, (span.ptr, span.len))
    }

    /// Encode `text` into a fresh guest allocation.
    pub fn pass_string(&mut self, text: &str) -> Result<EncodedString> {
        let mut guest = self.guest()?;
        codec::encode(&mut guest, text)
    }

    /// Decode a UTF-8 span from guest memory.
    pub fn read_string(&mut self, ptr: u32, len: u32) -> Result<String> {
        let mut guest = self.guest()?;
        codec::decode(&mut guest, ptr, len)
    }

    /// Hand a value to the guest, returning its handle.
    pub fn add_value(&mut self, value: HostValue) -> u32 {
        self.store.data_mut().bridge.add(value)
    }

    /// Look at the value behind a handle.
    pub fn value(&self, handle: u32) -> Result<HostValue> {
        self.store.data().bridge.get(handle)
    }

    /// Take ownership of the value behind a handle.
    pub fn take_value(&mut self, handle: u32) -> Result<HostValue> {
        self.store.data_mut().bridge.take(handle)
    }

    /// Release a handle.
    pub fn drop_value(&mut self, handle: u32) -> Result<()> {
        self.store.data_mut().bridge.drop_handle(handle)
    }

    /// Invoke a guest closure with an argument; the guest owns the argument
    /// handle it receives.
    pub fn invoke_closure(&mut self, callback: &HostValue, arg: HostValue) -> Result<()> {
        let closure = callback.as_closure().ok_or(BridgeError::TypeMismatch {
            expected: "closure",
            found: callback.type_name(),
        })?;
        closure.check_callable()?;
        let state = self.store.data_mut();
        let arg = state.bridge.add(arg);
        state.bridge.note_invocation();

        let mut guest = self.guest()?;
        closure.invoke(&mut guest, arg)
    }

    /// Drop the host's reference to a guest closure. Runs the guest
    /// destructor and returns `true` if that was the last reference.
    pub fn release_closure(&mut self, callback: &HostValue) -> Result<bool> {
        let closure = callback.as_closure().ok_or(BridgeError::TypeMismatch {
            expected: "closure",
            found: callback.type_name(),
        })?;
        let mut guest = self.guest()?;
        closure.release_and_finalize(&mut guest)
    }

    /// Deliver `event` to every listener registered for `event_type` on
    /// `target`. Returns how many listeners ran.
    ///
    /// A failing listener does not stop the others; the first failure is
    /// returned once all of them have run.
    pub fn dispatch_event(&mut self, target: &HostValue, event_type: &str, event: HostValue) -> Result<usize> {
        let listeners = self.store.data().host.listeners(target, event_type);
        tracing::trace!(event_type, listeners = listeners.len(), "dispatching event");
        let mut first_error = None;
        for listener in &listeners {
            if let Err(e) = self.run_callback(listener, event.clone()) {
                tracing::warn!(event_type, "event listener failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(listeners.len()),
        }
    }

    /// Run every callback the host reports as ready. Returns how many ran.
    ///
    /// The ready queue is drained up front, so every entry runs even when an
    /// earlier one fails; the first failure is returned afterwards.
    pub fn run_ready_callbacks(&mut self) -> Result<usize> {
        let ready = self.store.data_mut().host.take_ready();
        let mut first_error = None;
        for entry in &ready {
            if let Err(e) = self.run_callback(&entry.callback, entry.arg.clone()) {
                tracing::warn!("ready callback failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(ready.len()),
        }
    }

    fn run_callback(&mut self, callback: &HostValue, arg: HostValue) -> Result<()> {
        if callback.as_closure().is_some() {
            return self.invoke_closure(callback, arg);
        }
        let state = self.store.data_mut();
        state
            .host
            .call_function(callback, &arg)
            .map(drop)
            .map_err(|thrown| BridgeError::UncaughtHostException {
                capability: "callback",
                message: thrown.debug_string(),
            })
    }

    /// The host environment.
    pub fn host(&self) -> &H {
        &self.store.data().host
    }

    /// The host environment, mutably.
    pub fn host_mut(&mut self) -> &mut H {
        &mut self.store.data_mut().host
    }

    /// Bridge statistics.
    pub fn stats(&self) -> BridgeStats {
        self.store.data().bridge.stats()
    }

    /// Current guest memory size in bytes.
    pub fn memory_size(&mut self) -> Result<usize> {
        let memory = self.get_memory()?;
        Ok(memory.data_size(&self.store))
    }

    /// Get remaining fuel (if fuel metering enabled).
    pub fn remaining_fuel(&self) -> Option<u64> {
        self.store.get_fuel().ok()
    }

    /// Get list of exported function names.
    pub fn exported_functions(&mut self) -> Vec<String> {
        let names: Vec<_> = self
            .instance
            .exports(&mut self.store)
            .map(|e| e.name().to_string())
            .collect();
        names
            .into_iter()
            .filter(|name| self.instance.get_func(&mut self.store, name).is_some())
            .collect()
    }

    fn guest(&mut self) -> Result<WasmGuest<'_, H>> {
        WasmGuest::new(self.store.as_context_mut())
    }

    fn get_typed_func<P, R>(&mut self, name: &str) -> Result<TypedFunc<P, R>>
    where
        P: WasmParams,
        R: WasmResults,
    {
        self.instance
            .get_typed_func::<P, R>(&mut self.store, name)
            .map_err(|e| BridgeError::WasmError(format!("function '{}' not found: {}", name, e)))
    }

    fn get_memory(&mut self) -> Result<Memory> {
        self.instance
            .get_memory(&mut self.store, "memory")
            .ok_or_else(|| BridgeError::MissingExport("memory".to_string()))
    }
}

impl WasmInstance<HeadlessHost> {
    /// Advance the headless clock by `ms` and run whatever became ready.
    pub fn advance(&mut self, ms: f64) -> Result<usize> {
        self.host_mut().advance(ms);
        self.run_ready_callbacks()
    }
}
