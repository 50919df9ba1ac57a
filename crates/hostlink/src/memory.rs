//! Typed views over guest linear memory.
//!
//! The guest's memory is a single contiguous buffer that may be replaced
//! whenever guest code runs (growth reallocates it). A [`MemoryViews`] cache
//! remembers the identity of the buffer each view kind was last built over
//! and rebuilds that view lazily the next time it is requested against a
//! different buffer. Views borrow the buffer, so the borrow checker keeps a
//! view from outliving any call back into the guest.
//!
//! Offsets are logical guest addresses and stay meaningful across growth;
//! only the host-side buffer identity changes.

use crate::error::{BridgeError, Result};

/// Identity of a guest memory buffer: base address and length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferId {
    base: usize,
    len: usize,
}

impl BufferId {
    /// Identity of a byte slice.
    pub fn of(bytes: &[u8]) -> Self {
        Self {
            base: bytes.as_ptr() as usize,
            len: bytes.len(),
        }
    }
}

/// Borrowed guest memory together with its identity.
pub struct RawMemory<'m> {
    id: BufferId,
    bytes: &'m mut [u8],
}

impl<'m> RawMemory<'m> {
    /// Wrap the current guest buffer.
    pub fn new(bytes: &'m mut [u8]) -> Self {
        Self {
            id: BufferId::of(bytes),
            bytes,
        }
    }

    /// Buffer identity.
    pub fn id(&self) -> BufferId {
        self.id
    }
}

/// The three numeric view kinds the bridge materialises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewKind {
    /// Byte-addressed
    U8,
    /// 32-bit-word-addressed
    I32,
    /// 64-bit-float-addressed
    F64,
}

/// Per-instance cache of view identities.
#[derive(Debug, Default)]
pub struct MemoryViews {
    u8: Option<BufferId>,
    i32: Option<BufferId>,
    f64: Option<BufferId>,
    rebuilds: u64,
}

impl MemoryViews {
    /// Empty cache; every view is built on first use.
    pub fn new() -> Self {
        Self::default()
    }

    /// Byte view over the current buffer.
    pub fn u8<'m>(&mut self, memory: RawMemory<'m>) -> U8View<'m> {
        self.refresh(ViewKind::U8, memory.id);
        U8View { bytes: memory.bytes }
    }

    /// 32-bit integer view over the current buffer.
    pub fn i32<'m>(&mut self, memory: RawMemory<'m>) -> I32View<'m> {
        self.refresh(ViewKind::I32, memory.id);
        I32View { bytes: memory.bytes }
    }

    /// 64-bit float view over the current buffer.
    pub fn f64<'m>(&mut self, memory: RawMemory<'m>) -> F64View<'m> {
        self.refresh(ViewKind::F64, memory.id);
        F64View { bytes: memory.bytes }
    }

    /// Buffer the given view kind was last built over.
    pub fn cached(&self, kind: ViewKind) -> Option<BufferId> {
        match kind {
            ViewKind::U8 => self.u8,
            ViewKind::I32 => self.i32,
            ViewKind::F64 => self.f64,
        }
    }

    /// How many times any view has been (re)built.
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    /// Forget all cached views, e.g. when the guest instance is replaced.
    pub fn invalidate(&mut self) {
        self.u8 = None;
        self.i32 = None;
        self.f64 = None;
    }

    fn refresh(&mut self, kind: ViewKind, id: BufferId) {
        let slot = match kind {
            ViewKind::U8 => &mut self.u8,
            ViewKind::I32 => &mut self.i32,
            ViewKind::F64 => &mut self.f64,
        };
        if *slot != Some(id) {
            tracing::trace!(?kind, len = id.len, "rebuilding memory view");
            *slot = Some(id);
            self.rebuilds += 1;
        }
    }
}

fn check(offset: usize, len: usize, memory_len: usize) -> Result<std::ops::Range<usize>> {
    match offset.checked_add(len) {
        Some(end) if end <= memory_len => Ok(offset..end),
        _ => Err(BridgeError::OutOfBounds {
            offset,
            len,
            memory_len,
        }),
    }
}

/// Byte-addressed view.
pub struct U8View<'m> {
    bytes: &'m mut [u8],
}

impl U8View<'_> {
    /// Memory size in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the memory is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Borrow `len` bytes at `ptr`.
    pub fn slice(&self, ptr: u32, len: u32) -> Result<&[u8]> {
        let range = check(ptr as usize, len as usize, self.bytes.len())?;
        Ok(&self.bytes[range])
    }

    /// Mutably borrow `len` bytes at `ptr`.
    pub fn slice_mut(&mut self, ptr: u32, len: u32) -> Result<&mut [u8]> {
        let range = check(ptr as usize, len as usize, self.bytes.len())?;
        Ok(&mut self.bytes[range])
    }

    /// Copy `data` into memory at `ptr`.
    pub fn write(&mut self, ptr: u32, data: &[u8]) -> Result<()> {
        self.slice_mut(ptr, data.len() as u32)?.copy_from_slice(data);
        Ok(())
    }
}

/// 32-bit signed integer view, indexed in elements (byte offset / 4).
pub struct I32View<'m> {
    bytes: &'m mut [u8],
}

impl I32View<'_> {
    /// Element count.
    pub fn len(&self) -> usize {
        self.bytes.len() / 4
    }

    /// Whether the view has no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read element `index`.
    pub fn get(&self, index: u32) -> Result<i32> {
        let range = check(index as usize * 4, 4, self.len() * 4)?;
        let mut word = [0u8; 4];
        word.copy_from_slice(&self.bytes[range]);
        Ok(i32::from_le_bytes(word))
    }

    /// Write element `index`.
    pub fn set(&mut self, index: u32, value: i32) -> Result<()> {
        let range = check(index as usize * 4, 4, self.len() * 4)?;
        self.bytes[range].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }
}

/// 64-bit float view, indexed in elements (byte offset / 8).
pub struct F64View<'m> {
    bytes: &'m mut [u8],
}

impl F64View<'_> {
    /// Element count.
    pub fn len(&self) -> usize {
        self.bytes.len() / 8
    }

    /// Whether the view has no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read element `index`.
    pub fn get(&self, index: u32) -> Result<f64> {
        let range = check(index as usize * 8, 8, self.len() * 8)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(&self.bytes[range]);
        Ok(f64::from_le_bytes(word))
    }

    /// Write element `index`.
    pub fn set(&mut self, index: u32, value: f64) -> Result<()> {
        let range = check(index as usize * 8, 8, self.len() * 8)?;
        self.bytes[range].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }
}

/// Access to a guest's linear memory and the view cache that goes with it.
///
/// Implementors hand out the cache and the current buffer together so that
/// every access re-checks buffer identity.
pub trait GuestMemory {
    /// Split into the view cache and the current buffer.
    fn split(&mut self) -> (&mut MemoryViews, RawMemory<'_>);

    /// Byte view, rebuilt if the buffer changed.
    fn u8_view(&mut self) -> U8View<'_> {
        let (views, memory) = self.split();
        views.u8(memory)
    }

    /// 32-bit view, rebuilt if the buffer changed.
    fn i32_view(&mut self) -> I32View<'_> {
        let (views, memory) = self.split();
        views.i32(memory)
    }

    /// Float view, rebuilt if the buffer changed.
    fn f64_view(&mut self) -> F64View<'_> {
        let (views, memory) = self.split();
        views.f64(memory)
    }
}
