//! Host capabilities the sandbox can reach through the bridge.
//!
//! The bridge does not implement DOM, canvas or timer semantics itself; it
//! marshals calls to a [`HostEnvironment`]. [`HeadlessHost`] is an
//! in-process implementation with a virtual clock, suitable for tests and
//! for running modules outside a browser.
//!
//! Failures are returned as thrown host values (`Err(HostValue)`), which the
//! call shims forward to the guest's exception store.

mod headless;

pub use headless::{ConsoleEntry, HeadlessHost, MethodCall, ViewportConfig};

use serde::{Deserialize, Serialize};

use crate::value::HostValue;

/// Result of a host operation: a value, or a thrown value.
pub type HostResult<T = HostValue> = std::result::Result<T, HostValue>;

/// Console severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    /// `console.debug`
    Debug,
    /// `console.log`
    Log,
    /// `console.info`
    Info,
    /// `console.warn`
    Warn,
    /// `console.error`
    Error,
}

impl ConsoleLevel {
    /// Decode the numeric level used across the ABI.
    pub fn from_abi(level: i32) -> Option<Self> {
        Some(match level {
            0 => ConsoleLevel::Debug,
            1 => ConsoleLevel::Log,
            2 => ConsoleLevel::Info,
            3 => ConsoleLevel::Warn,
            4 => ConsoleLevel::Error,
            _ => return None,
        })
    }
}

/// A callback the host wants run, with its argument.
#[derive(Debug, Clone)]
pub struct ReadyCallback {
    /// Callable to invoke
    pub callback: HostValue,
    /// Argument to pass (e.g. the frame timestamp)
    pub arg: HostValue,
}

/// The host side of the bridge.
///
/// Lives in the sandbox store, which WASI linking requires to be `Send`.
pub trait HostEnvironment: Send {
    /// Look up a global binding (`window`, `document`, `globalThis`, ...).
    fn global(&mut self, name: &str) -> HostResult;

    /// Read a property.
    fn get(&mut self, target: &HostValue, key: &str) -> HostResult;

    /// Write a property.
    fn set(&mut self, target: &HostValue, key: &str, value: HostValue) -> HostResult<()>;

    /// Call a method on a host object.
    fn call_method(&mut self, target: &HostValue, method: &str, args: &[HostValue]) -> HostResult;

    /// `instanceof` check against a host class name.
    fn instance_of(&self, target: &HostValue, class: &str) -> bool;

    /// Write to the console.
    fn console(&mut self, level: ConsoleLevel, args: &[HostValue]);

    /// Schedule `callback` after `delay_ms`; returns the timer id.
    fn set_timeout(&mut self, callback: HostValue, delay_ms: i32) -> HostResult<i32>;

    /// Schedule `callback` for the next frame; returns the request id.
    fn request_animation_frame(&mut self, callback: HostValue) -> HostResult<i32>;

    /// Register an event listener.
    fn add_event_listener(&mut self, target: &HostValue, event_type: &str, callback: HostValue) -> HostResult<()>;

    /// Unregister an event listener, returning the removed callback.
    fn remove_event_listener(
        &mut self,
        target: &HostValue,
        event_type: &str,
        callback: &HostValue,
    ) -> HostResult<Option<HostValue>>;

    /// Listeners currently registered for `event_type` on `target`.
    fn listeners(&self, target: &HostValue, event_type: &str) -> Vec<HostValue>;

    /// Drain callbacks that are due (expired timers, pending frames).
    fn take_ready(&mut self) -> Vec<ReadyCallback>;

    /// High-resolution timestamp in milliseconds.
    fn now(&self) -> f64;

    /// Create a function from source text.
    fn compile_function(&mut self, source: &str) -> HostResult;

    /// Call a host function with a `this` value. Guest closures never reach
    /// this method; the bridge invokes those itself.
    fn call_function(&mut self, function: &HostValue, this: &HostValue) -> HostResult;
}
