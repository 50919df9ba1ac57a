//! # hostlink
//!
//! Object and value bridge between a linear-memory WebAssembly guest and a
//! managed host environment.
//!
//! The guest can only exchange numbers with the host. Everything else
//! crosses the boundary through four pieces:
//!
//! | Piece | Module | Role |
//! |-------|--------|------|
//! | Host object table | [`heap`] | Host values behind `u32` handles |
//! | Memory view cache | [`memory`] | Typed views over guest memory, rebuilt after growth |
//! | String codec | [`codec`] | UTF-8 spans in guest memory |
//! | Closure bridge | [`closure`] | Reference-counted guest callbacks |
//!
//! The [`wasm`] module (feature `wasm`, on by default) binds these to
//! wasmtime and registers the host capability table the guest imports.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use hostlink::wasm::{WasmConfig, WasmSandbox};
//!
//! let sandbox = WasmSandbox::new(WasmConfig::default())?;
//! let module = sandbox.load_module("app.wasm")?;
//! let mut instance = sandbox.instantiate_headless(&module)?;
//!
//! instance.call_str::<()>("greet", "héllo")?;
//! for entry in instance.host().console_entries() {
//!     println!("{:?}: {}", entry.level, entry.text);
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod bridge;
pub mod closure;
pub mod codec;
pub mod error;
pub mod heap;
pub mod host;
pub mod memory;
pub mod value;

#[cfg(feature = "wasm")]
pub mod wasm;

#[cfg(test)]
mod test_support;

// Re-export main types
pub use bridge::{BridgeContext, BridgeStats};
pub use closure::{ClosureLifecycle, ClosureRef, GuestClosure, GuestClosures};
pub use codec::{EncodedString, GuestAllocator};
pub use error::{BridgeError, Result};
pub use heap::{Handle, HostHeap};
pub use host::{ConsoleEntry, ConsoleLevel, HeadlessHost, HostEnvironment, ViewportConfig};
pub use memory::{GuestMemory, MemoryViews};
pub use value::{HostObject, HostValue};
