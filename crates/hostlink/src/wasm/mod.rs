//! Bridge wiring for a wasmtime sandbox.
//!
//! The core bridge is runtime-agnostic; this module supplies the pieces that
//! bind it to wasmtime: the capability table the guest imports, a store
//! holding the per-instance bridge state, and typed entry points for the
//! host to call into the guest.
//!
//! ## Guest contract
//!
//! A guest exports `memory`, `__hostlink_malloc`, `__hostlink_free` and
//! `__indirect_function_table`, and optionally `__hostlink_realloc` (enables
//! the incremental string encoder) and `__hostlink_exn_store` (receives host
//! exceptions instead of trapping).
//!
//! ## Usage
//!
//! ```rust,ignore
//! use hostlink::wasm::{WasmConfig, WasmSandbox};
//!
//! let sandbox = WasmSandbox::new(WasmConfig::default())?;
//! let module = sandbox.load_module("app.wasm")?;
//! let mut instance = sandbox.instantiate_headless(&module)?;
//!
//! instance.call::<(), ()>("start", ())?;
//! instance.advance(16.0)?; // run one animation frame
//! ```

mod config;
mod imports;
mod runtime;

pub use config::{WasiCapabilities, WasmConfig, DEFAULT_IMPORT_MODULE};
pub use imports::{check_import, AbiSignature, AbiType, Capability, ImportCheck, ABI_VERSION};
pub use runtime::{
    WasmCallResult, WasmHostState, WasmInstance, WasmModule, WasmSandbox, EXN_STORE_EXPORT, FREE_EXPORT,
    MALLOC_EXPORT, REALLOC_EXPORT, TABLE_EXPORT,
};

#[cfg(test)]
mod tests;
