//! UTF-8 string marshalling across the guest memory boundary.
//!
//! Decoding is strict: a malformed span is an error, never a replacement
//! character, because a bad span from the guest usually means a corrupted
//! pointer or length.
//!
//! Encoding has two strategies, picked by whether the guest exports a
//! reallocator:
//!
//! - without one, the string is encoded up front and copied into an
//!   allocation of exactly its UTF-8 length;
//! - with one, the allocation is first sized to the string's length in
//!   UTF-16 code units and ASCII is copied byte-for-byte. On the first
//!   non-ASCII character the buffer is grown to `offset + remaining * 3`
//!   (no UTF-16 unit expands to more than three UTF-8 bytes) and the rest
//!   is encoded into the grown region.

use crate::error::{BridgeError, Result};
use crate::memory::GuestMemory;

/// Guest-side allocator entry points.
pub trait GuestAllocator: GuestMemory {
    /// Allocate `size` bytes in guest memory.
    fn malloc(&mut self, size: u32) -> Result<u32>;

    /// Whether [`GuestAllocator::realloc`] is available.
    fn has_realloc(&self) -> bool;

    /// Resize an allocation, returning its (possibly moved) address.
    fn realloc(&mut self, ptr: u32, old_size: u32, new_size: u32) -> Result<u32>;

    /// Return an allocation to the guest.
    fn free(&mut self, ptr: u32, size: u32) -> Result<()>;
}

/// A `(ptr, len)` UTF-8 span written into guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedString {
    /// Start of the span
    pub ptr: u32,
    /// Bytes of UTF-8 written
    pub len: u32,
    /// Size of the allocation backing the span
    pub capacity: u32,
}

/// Decode `len` bytes at `ptr` as UTF-8.
pub fn decode<M: GuestMemory + ?Sized>(memory: &mut M, ptr: u32, len: u32) -> Result<String> {
    let view = memory.u8_view();
    let bytes = view.slice(ptr, len)?;
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|source| BridgeError::InvalidUtf8 { ptr, len, source })
}

/// Encode `text` into a fresh guest allocation.
pub fn encode<G: GuestAllocator + ?Sized>(guest: &mut G, text: &str) -> Result<EncodedString> {
    if !guest.has_realloc() {
        let bytes = text.as_bytes();
        let len = bytes.len() as u32;
        let ptr = guest.malloc(len)?;
        guest.u8_view().write(ptr, bytes)?;
        return Ok(EncodedString { ptr, len, capacity: len });
    }

    let mut capacity = text.encode_utf16().count() as u32;
    let mut ptr = guest.malloc(capacity)?;

    // allocation may have grown memory; the view is re-checked here
    let ascii = text.bytes().take_while(u8::is_ascii).count();
    guest.u8_view().write(ptr, &text.as_bytes()[..ascii])?;
    let mut offset = ascii as u32;

    if offset != capacity {
        let rest = &text[ascii..];
        let new_capacity = offset + rest.encode_utf16().count() as u32 * 3;
        ptr = guest.realloc(ptr, capacity, new_capacity)?;
        capacity = new_capacity;
        guest.u8_view().write(ptr + offset, rest.as_bytes())?;
        offset += rest.len() as u32;
    }

    Ok(EncodedString {
        ptr,
        len: offset,
        capacity,
    })
}
