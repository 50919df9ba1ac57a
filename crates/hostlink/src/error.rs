//! Error types for the bridge crate.

use thiserror::Error;

/// Bridge error type
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Handle refers to a free slot or to an earlier occupant of the slot
    #[error("stale host handle {handle:#x}")]
    StaleHandle {
        /// Raw ABI handle value
        handle: u32,
    },

    /// Handle index is past the end of the object table
    #[error("unknown host handle {handle:#x}")]
    UnknownHandle {
        /// Raw ABI handle value
        handle: u32,
    },

    /// Byte span is not valid UTF-8
    #[error("invalid UTF-8 in guest string at {ptr:#x}+{len}: {source}")]
    InvalidUtf8 {
        /// Span start
        ptr: u32,
        /// Span length in bytes
        len: u32,
        /// Underlying decode failure
        source: std::str::Utf8Error,
    },

    /// Access outside the guest linear memory
    #[error("guest memory access out of bounds: {offset:#x}+{len} (memory is {memory_len} bytes)")]
    OutOfBounds {
        /// Byte offset of the access
        offset: usize,
        /// Length of the access in bytes
        len: usize,
        /// Current memory size in bytes
        memory_len: usize,
    },

    /// Closure was invoked or released after its destructor ran
    #[error("closure invoked after being destroyed")]
    ClosureDestroyed,

    /// Closure was re-entered while an invocation of it was still running
    #[error("closure invoked recursively or after being released")]
    ClosureBusy,

    /// Host value has the wrong type for the requested operation
    #[error("expected {expected}, found {found}")]
    TypeMismatch {
        /// What the operation needed
        expected: &'static str,
        /// What the handle actually held
        found: &'static str,
    },

    /// Guest module lacks an export the bridge needs
    #[error("guest does not export `{0}`")]
    MissingExport(String),

    /// Guest raised an error through the `throw` capability
    #[error("guest error: {0}")]
    GuestThrow(String),

    /// Host capability failed and the guest has no exception store
    #[error("uncaught host exception in `{capability}`: {message}")]
    UncaughtHostException {
        /// Capability that failed
        capability: &'static str,
        /// Debug rendering of the thrown value
        message: String,
    },

    /// JSON text passed by the guest did not parse
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebAssembly runtime error
    #[error("WASM runtime error: {0}")]
    WasmError(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
