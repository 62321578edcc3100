// Slot memory layout (§3.5, §4.6.1, §4.6.4 step 6).
//
// One generation counter plus the user payload per slot, laid out
// contiguously and rounded up to `slot_content_alignment` the same way
// `ring.rs`/`ring_raw.rs` round their headers up to a cache line. The
// generation lives in the slot itself (not a side table) so a client that
// only ever maps the slot region read-only can still observe it bump.

use std::sync::atomic::{AtomicU32, Ordering};

/// A view onto the slot table backing one MemCon channel. Carries no
/// ownership of the region: the caller keeps the backing
/// `MemoryExchangeHandle` mapped for the view's lifetime.
pub struct SlotTable {
    base: *mut u8,
    num_slots: u32,
    content_size: u32,
    stride: usize,
}

unsafe impl Send for SlotTable {}
unsafe impl Sync for SlotTable {}

impl SlotTable {
    fn stride_for(content_size: u32, alignment: u32) -> usize {
        let align = alignment.max(1) as usize;
        let raw = std::mem::size_of::<AtomicU32>() + content_size as usize;
        (raw + align - 1) / align * align
    }

    /// Bytes the whole table needs.
    pub fn required_size(num_slots: u32, content_size: u32, alignment: u32) -> usize {
        Self::stride_for(content_size, alignment) * num_slots as usize
    }

    /// Attach to an already-initialized table.
    ///
    /// # Safety
    /// `base` must point to at least `Self::required_size(num_slots,
    /// content_size, alignment)` bytes, initialized by a prior call to
    /// [`Self::init`] in this process or a peer mapping the same memory.
    pub unsafe fn attach(base: *mut u8, num_slots: u32, content_size: u32, alignment: u32) -> Self {
        SlotTable { base, num_slots, content_size, stride: Self::stride_for(content_size, alignment) }
    }

    /// Zero the region (every slot starts at generation 0, free).
    ///
    /// # Safety
    /// Same obligations as [`Self::attach`], except this call exclusively
    /// owns the region until a peer observes it through its own `attach`.
    pub unsafe fn init(base: *mut u8, num_slots: u32, content_size: u32, alignment: u32) -> Self {
        let table = Self::attach(base, num_slots, content_size, alignment);
        std::ptr::write_bytes(base, 0, table.stride * num_slots as usize);
        table
    }

    fn slot_base(&self, idx: u32) -> *mut u8 {
        unsafe { self.base.add(idx as usize * self.stride) }
    }

    fn generation_ptr(&self, idx: u32) -> *const AtomicU32 {
        self.slot_base(idx) as *const AtomicU32
    }

    pub fn num_slots(&self) -> u32 {
        self.num_slots
    }

    pub fn generation(&self, idx: u32) -> u32 {
        unsafe { (*self.generation_ptr(idx)).load(Ordering::Acquire) }
    }

    /// Recycle a slot: callers invoke this only once all class refcounts
    /// for it have dropped to zero (§4.6.4 step 6).
    pub fn bump_generation(&self, idx: u32) -> u32 {
        unsafe { (*self.generation_ptr(idx)).fetch_add(1, Ordering::AcqRel) + 1 }
    }

    pub fn content(&self, idx: u32) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.slot_base(idx).add(std::mem::size_of::<AtomicU32>()), self.content_size as usize) }
    }

    /// # Safety
    /// The caller must ensure no concurrent reader is accessing this slot's
    /// content while the write is in progress (server-only, before the
    /// publish-store makes the slot visible to any receiver).
    pub unsafe fn content_mut(&self, idx: u32) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.slot_base(idx).add(std::mem::size_of::<AtomicU32>()), self.content_size as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc_table(num_slots: u32, content_size: u32, alignment: u32) -> (Vec<u8>, SlotTable) {
        let mut buf = vec![0u8; SlotTable::required_size(num_slots, content_size, alignment)];
        let table = unsafe { SlotTable::init(buf.as_mut_ptr(), num_slots, content_size, alignment) };
        (buf, table)
    }

    #[test]
    fn fresh_slots_start_at_generation_zero() {
        let (_buf, table) = alloc_table(4, 16, 8);
        for i in 0..4 {
            assert_eq!(table.generation(i), 0);
        }
    }

    #[test]
    fn bump_generation_is_monotonic_per_slot() {
        let (_buf, table) = alloc_table(2, 16, 8);
        assert_eq!(table.bump_generation(0), 1);
        assert_eq!(table.bump_generation(0), 2);
        assert_eq!(table.generation(1), 0);
    }

    #[test]
    fn content_write_is_visible_through_read_view() {
        let (_buf, table) = alloc_table(2, 8, 8);
        unsafe { table.content_mut(1).copy_from_slice(b"zerocopy") };
        assert_eq!(table.content(1), b"zerocopy");
    }
}
