//! Host object table.
//!
//! The guest refers to host values by small integer handles. Slots form an
//! intrusive free list: a free slot stores the index of the next free slot,
//! so allocation and release are O(1) without a side structure.
//!
//! Handles are generation-tagged: the low 24 bits select the slot and the
//! high 8 bits must match the slot's current generation. Releasing a slot
//! bumps its generation, so a stale or double-dropped handle is caught
//! instead of silently aliasing whatever value reuses the slot.
//!
//! Indices 0..=3 hold `undefined`, `null`, `true` and `false` for the life
//! of the table and are never handed out by [`HostHeap::add`].

use std::fmt;

use crate::error::{BridgeError, Result};
use crate::value::HostValue;

const INDEX_BITS: u32 = 24;
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;

/// Number of reserved constant slots at the bottom of the table.
pub const RESERVED_SLOTS: u32 = 4;

/// Generation-tagged reference into the [`HostHeap`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u32);

impl Handle {
    /// `undefined`
    pub const UNDEFINED: Handle = Handle(0);
    /// `null`
    pub const NULL: Handle = Handle(1);
    /// `true`
    pub const TRUE: Handle = Handle(2);
    /// `false`
    pub const FALSE: Handle = Handle(3);

    /// Largest slot index a handle can address.
    pub const MAX_INDEX: u32 = INDEX_MASK;

    fn new(index: u32, generation: u8) -> Self {
        Handle(((generation as u32) << INDEX_BITS) | index)
    }

    /// Reinterpret a raw value received across the ABI.
    pub fn from_abi(raw: u32) -> Self {
        Handle(raw)
    }

    /// Raw value passed across the ABI.
    pub fn to_abi(self) -> u32 {
        self.0
    }

    /// Slot index.
    pub fn index(self) -> u32 {
        self.0 & INDEX_MASK
    }

    /// Generation tag.
    pub fn generation(self) -> u8 {
        (self.0 >> INDEX_BITS) as u8
    }

    /// Whether this names one of the permanent constants.
    pub fn is_reserved(self) -> bool {
        self.0 < RESERVED_SLOTS
    }

    /// Reserved handle for a boolean.
    pub fn from_bool(b: bool) -> Self {
        if b { Handle::TRUE } else { Handle::FALSE }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}#{})", self.index(), self.generation())
    }
}

#[derive(Debug)]
enum Slot {
    Live { generation: u8, value: HostValue },
    Free { generation: u8, next: u32 },
}

/// Growable slot table mapping handles to host values.
#[derive(Debug)]
pub struct HostHeap {
    slots: Vec<Slot>,
    /// Head of the free list; equal to `slots.len()` when the list is empty.
    next_free: u32,
    live: usize,
}

impl Default for HostHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl HostHeap {
    /// Create a table holding only the reserved constants.
    pub fn new() -> Self {
        let slots = [
            HostValue::Undefined,
            HostValue::Null,
            HostValue::Bool(true),
            HostValue::Bool(false),
        ]
        .into_iter()
        .map(|value| Slot::Live { generation: 0, value })
        .collect::<Vec<_>>();

        Self {
            next_free: slots.len() as u32,
            slots,
            live: 0,
        }
    }

    /// Store a value and return a fresh handle for it.
    ///
    /// # Panics
    ///
    /// Panics if every one of the `Handle::MAX_INDEX + 1` slots (2^24) is
    /// live at once; the handle ABI has no index bits left to address more.
    pub fn add(&mut self, value: HostValue) -> Handle {
        if self.next_free as usize == self.slots.len() {
            assert!(self.next_free <= Handle::MAX_INDEX, "host object table exhausted");
            self.slots.push(Slot::Free {
                generation: 0,
                next: self.next_free + 1,
            });
        }

        let index = self.next_free;
        let slot = &mut self.slots[index as usize];
        let (generation, next) = match *slot {
            Slot::Free { generation, next } => (generation, next),
            Slot::Live { .. } => unreachable!("free list points at a live slot"),
        };
        *slot = Slot::Live { generation, value };
        self.next_free = next;
        self.live += 1;

        let handle = Handle::new(index, generation);
        tracing::trace!(?handle, "heap add");
        handle
    }

    /// Borrow the value behind a handle without consuming it.
    pub fn get(&self, handle: Handle) -> Result<&HostValue> {
        match self.slots.get(handle.index() as usize) {
            Some(Slot::Live { generation, value }) if *generation == handle.generation() => Ok(value),
            Some(_) => Err(BridgeError::StaleHandle { handle: handle.to_abi() }),
            None => Err(BridgeError::UnknownHandle { handle: handle.to_abi() }),
        }
    }

    /// Remove the value behind a handle and release the slot.
    ///
    /// Taking a reserved constant returns it and leaves the slot in place.
    pub fn take(&mut self, handle: Handle) -> Result<HostValue> {
        if handle.is_reserved() {
            return self.get(handle).cloned();
        }
        self.get(handle)?;

        let index = handle.index();
        let next = self.next_free;
        let slot = &mut self.slots[index as usize];
        let generation = handle.generation().wrapping_add(1);
        let old = std::mem::replace(slot, Slot::Free { generation, next });
        self.next_free = index;
        self.live -= 1;

        tracing::trace!(?handle, "heap release");
        match old {
            Slot::Live { value, .. } => Ok(value),
            Slot::Free { .. } => unreachable!("validated above"),
        }
    }

    /// Release a handle, discarding its value. Reserved handles are ignored.
    pub fn drop_handle(&mut self, handle: Handle) -> Result<()> {
        if handle.is_reserved() {
            return Ok(());
        }
        self.take(handle).map(drop)
    }

    /// Issue a second handle for the same value.
    pub fn clone_ref(&mut self, handle: Handle) -> Result<Handle> {
        let value = self.get(handle)?.clone();
        Ok(self.add(value))
    }

    /// Number of live, non-reserved handles.
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Total slots, including reserved and free ones.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}
