//! Per-instance bridge state.
//!
//! Every sandbox instance owns one [`BridgeContext`]; nothing is global, so
//! two instances never share handles or cached views.

use serde::Serialize;

use crate::error::{BridgeError, Result};
use crate::heap::{Handle, HostHeap};
use crate::memory::MemoryViews;
use crate::value::HostValue;

/// Object table, view cache and counters for one sandbox instance.
#[derive(Debug, Default)]
pub struct BridgeContext {
    /// Host object table
    pub heap: HostHeap,
    /// Memory view cache
    pub views: MemoryViews,
    counters: Counters,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    exceptions_stored: u64,
    closures_invoked: u64,
    closures_finalized: u64,
}

/// Point-in-time bridge statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BridgeStats {
    /// Live, non-reserved handles
    pub live_handles: usize,
    /// Memory view (re)builds
    pub view_rebuilds: u64,
    /// Host exceptions handed to the guest's exception store
    pub exceptions_stored: u64,
    /// Closure invocations started by the host
    pub closures_invoked: u64,
    /// Closure destructors run by the host
    pub closures_finalized: u64,
}

impl BridgeContext {
    /// Fresh context with only the reserved constants.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value and return its raw ABI handle. `undefined`, `null` and
    /// booleans map to their reserved handles without taking a slot.
    pub fn add(&mut self, value: HostValue) -> u32 {
        let handle = match value {
            HostValue::Undefined => Handle::UNDEFINED,
            HostValue::Null => Handle::NULL,
            HostValue::Bool(b) => Handle::from_bool(b),
            value => self.heap.add(value),
        };
        handle.to_abi()
    }

    /// Clone the value behind a raw handle.
    pub fn get(&self, raw: u32) -> Result<HostValue> {
        self.heap.get(Handle::from_abi(raw)).cloned()
    }

    /// Take the value behind a raw handle.
    pub fn take(&mut self, raw: u32) -> Result<HostValue> {
        self.heap.take(Handle::from_abi(raw))
    }

    /// Release a raw handle.
    pub fn drop_handle(&mut self, raw: u32) -> Result<()> {
        self.heap.drop_handle(Handle::from_abi(raw))
    }

    /// String behind a raw handle.
    pub fn get_string(&self, raw: u32) -> Result<String> {
        match self.heap.get(Handle::from_abi(raw))? {
            HostValue::String(s) => Ok(s.clone()),
            other => Err(BridgeError::TypeMismatch {
                expected: "string",
                found: other.type_name(),
            }),
        }
    }

    pub(crate) fn note_exception(&mut self) {
        self.counters.exceptions_stored += 1;
    }

    pub(crate) fn note_invocation(&mut self) {
        self.counters.closures_invoked += 1;
    }

    pub(crate) fn note_finalized(&mut self) {
        self.counters.closures_finalized += 1;
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            live_handles: self.heap.live_count(),
            view_rebuilds: self.views.rebuilds(),
            exceptions_stored: self.counters.exceptions_stored,
            closures_invoked: self.counters.closures_invoked,
            closures_finalized: self.counters.closures_finalized,
        }
    }
}
