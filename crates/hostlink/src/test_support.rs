//! In-process guest used by unit tests.

use crate::closure::GuestClosures;
use crate::codec::GuestAllocator;
use crate::error::{BridgeError, Result};
use crate::memory::{GuestMemory, MemoryViews, RawMemory};

/// Guest with a `Vec<u8>` linear memory and a bump allocator.
pub(crate) struct VecGuest {
    pub bytes: Vec<u8>,
    pub views: MemoryViews,
    next: u32,
    realloc_enabled: bool,
    grow_on_malloc: Option<usize>,
    pub mallocs: usize,
    pub reallocs: usize,
    pub frees: Vec<(u32, u32)>,
    /// `(trampoline, a, b, arg)` per trampoline call
    pub calls: Vec<(u32, u32, u32, u32)>,
    /// `(dtor, a, b)` per destructor call
    pub destroyed: Vec<(u32, u32, u32)>,
    /// Runs inside every trampoline call, before it returns
    pub on_call: Option<Box<dyn FnMut()>>,
    pub fail_calls: bool,
}

impl VecGuest {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![0; size],
            views: MemoryViews::new(),
            next: 8,
            realloc_enabled: true,
            grow_on_malloc: None,
            mallocs: 0,
            reallocs: 0,
            frees: Vec::new(),
            calls: Vec::new(),
            destroyed: Vec::new(),
            on_call: None,
            fail_calls: false,
        }
    }

    pub fn without_realloc(mut self) -> Self {
        self.realloc_enabled = false;
        self
    }

    /// Grow memory to `size` on the first allocation.
    pub fn grow_on_malloc(mut self, size: usize) -> Self {
        self.grow_on_malloc = Some(size);
        self
    }

    /// Replace the buffer with a larger copy, like a linear memory grow.
    pub fn grow(&mut self, size: usize) {
        let mut bigger = vec![0; size];
        bigger[..self.bytes.len()].copy_from_slice(&self.bytes);
        self.bytes = bigger;
    }
}

impl GuestMemory for VecGuest {
    fn split(&mut self) -> (&mut MemoryViews, RawMemory<'_>) {
        (&mut self.views, RawMemory::new(&mut self.bytes))
    }
}

impl GuestAllocator for VecGuest {
    fn malloc(&mut self, size: u32) -> Result<u32> {
        self.mallocs += 1;
        if let Some(size) = self.grow_on_malloc.take() {
            self.grow(size);
        }
        let ptr = (self.next + 7) & !7;
        let end = ptr as usize + size as usize;
        if end > self.bytes.len() {
            self.grow(end.max(self.bytes.len() * 2));
        }
        self.next = end as u32;
        Ok(ptr)
    }

    fn has_realloc(&self) -> bool {
        self.realloc_enabled
    }

    fn realloc(&mut self, ptr: u32, old_size: u32, new_size: u32) -> Result<u32> {
        if !self.realloc_enabled {
            return Err(BridgeError::MissingExport("realloc".into()));
        }
        self.reallocs += 1;
        let new_ptr = self.malloc(new_size)?;
        self.mallocs -= 1;
        let keep = old_size.min(new_size) as usize;
        self.bytes
            .copy_within(ptr as usize..ptr as usize + keep, new_ptr as usize);
        Ok(new_ptr)
    }

    fn free(&mut self, ptr: u32, size: u32) -> Result<()> {
        self.frees.push((ptr, size));
        Ok(())
    }
}

impl GuestClosures for VecGuest {
    fn call_trampoline(&mut self, trampoline: u32, a: u32, b: u32, arg: u32) -> Result<()> {
        self.calls.push((trampoline, a, b, arg));
        if let Some(hook) = self.on_call.as_mut() {
            hook();
        }
        if self.fail_calls {
            return Err(BridgeError::GuestThrow("trampoline failed".into()));
        }
        Ok(())
    }

    fn call_destructor(&mut self, dtor: u32, a: u32, b: u32) -> Result<()> {
        self.destroyed.push((dtor, a, b));
        Ok(())
    }
}
