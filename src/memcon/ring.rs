// SPSC index queues (§3.5 "Queues", §4.6.1, §5 "Shared-memory concurrency").
//
// Same cache-line-padded header and acquire/release discipline as
// `ring_raw::ShmRing`, generalized to a runtime capacity (a channel's
// `NumSlots` is a configuration value, not a compile-time constant) and
// taking a raw pointer into an already-mapped region rather than owning
// its own `ShmHandle` — the region comes from a `MemoryExchangeHandle`
// the caller mapped, per §4.6.1's three-region layout.
//
// Capacity need not be a power of two; slot addressing uses modulo instead
// of a bitmask, trading one division per push/pop for that flexibility.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[repr(C)]
struct Header {
    write_idx: AtomicU64,
    _pad0: [u8; 64 - 8],
    read_idx: AtomicU64,
    _pad1: [u8; 64 - 8],
    constructed: AtomicBool,
    _pad2: [u8; 64 - 1],
}

const HEADER_SIZE: usize = std::mem::size_of::<Header>();

/// A view onto an SPSC `u32` index queue backed by a raw memory region.
/// Carries no ownership of that region: the caller is responsible for
/// keeping the backing `MemoryExchangeHandle` mapped for the view's
/// lifetime.
pub struct IndexQueue {
    base: *mut u8,
    capacity: u32,
}

unsafe impl Send for IndexQueue {}

impl IndexQueue {
    /// Bytes a queue of `capacity` entries needs, header included.
    pub fn required_size(capacity: u32) -> usize {
        HEADER_SIZE + capacity as usize * std::mem::size_of::<u32>()
    }

    /// Attach to an already-initialized region (the non-allocating side).
    ///
    /// # Safety
    /// `base` must point to at least `Self::required_size(capacity)` bytes,
    /// previously initialized by a call to [`Self::init`] somewhere (this
    /// process or a peer mapping the same memory).
    pub unsafe fn attach(base: *mut u8, capacity: u32) -> Self {
        IndexQueue { base, capacity }
    }

    /// Zero the region and mark it constructed (the allocating side).
    ///
    /// # Safety
    /// `base` must point to at least `Self::required_size(capacity)` bytes
    /// that this call exclusively owns until `constructed` is observed true
    /// by any other mapper.
    pub unsafe fn init(base: *mut u8, capacity: u32) -> Self {
        std::ptr::write_bytes(base, 0, Self::required_size(capacity));
        let hdr = &*(base as *const Header);
        hdr.constructed.store(true, Ordering::Release);
        IndexQueue { base, capacity }
    }

    fn hdr(&self) -> &Header {
        unsafe { &*(self.base as *const Header) }
    }

    fn slot_ptr(&self, idx: u64) -> *mut u32 {
        let offset = HEADER_SIZE + (idx % self.capacity as u64) as usize * std::mem::size_of::<u32>();
        unsafe { self.base.add(offset) as *mut u32 }
    }

    /// Push `value`. Returns `false` if the queue is full (single writer).
    pub fn push(&self, value: u32) -> bool {
        let hdr = self.hdr();
        let w = hdr.write_idx.load(Ordering::Relaxed);
        let r = hdr.read_idx.load(Ordering::Acquire);
        if w.wrapping_sub(r) >= self.capacity as u64 {
            return false;
        }
        unsafe { std::ptr::write(self.slot_ptr(w), value) };
        hdr.write_idx.fetch_add(1, Ordering::Release);
        true
    }

    /// Pop the next value. Returns `None` if empty (single reader).
    pub fn pop(&self) -> Option<u32> {
        let hdr = self.hdr();
        let r = hdr.read_idx.load(Ordering::Relaxed);
        let w = hdr.write_idx.load(Ordering::Acquire);
        if r >= w {
            return None;
        }
        let value = unsafe { std::ptr::read(self.slot_ptr(r)) };
        hdr.read_idx.fetch_add(1, Ordering::Release);
        Some(value)
    }

    pub fn len(&self) -> usize {
        let hdr = self.hdr();
        let w = hdr.write_idx.load(Ordering::Acquire);
        let r = hdr.read_idx.load(Ordering::Acquire);
        w.wrapping_sub(r) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity as usize
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}
