// Bump-pointer scratch allocator for the SD sender's per-call encode buffer
// (SPEC_FULL.md §B: "a direct implementation of this spec's own §9 Design
// Notes"), mirroring the teacher's own `monotonic_buffer_resource`-style
// `BumpArena`.
//
// The arena is not `Send`; one is created per `ServiceDiscoverySender::send`
// call rather than shared across threads.

/// A bump-pointer arena backed by `bumpalo::Bump`.
///
/// - `alloc_bytes` never frees individual allocations.
/// - `reset()` releases all memory at once (equivalent to C++
///   `monotonic_buffer_resource::release()`).
pub struct BumpArena {
    bump: bumpalo::Bump,
}

impl BumpArena {
    pub fn new() -> Self {
        Self { bump: bumpalo::Bump::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { bump: bumpalo::Bump::with_capacity(capacity) }
    }

    /// Allocate `len` zeroed bytes aligned to `align`.
    ///
    /// # Panics
    /// Panics if `align` is not a power of two.
    pub fn alloc_bytes(&self, len: usize, align: usize) -> &mut [u8] {
        let layout = std::alloc::Layout::from_size_align(len, align).expect("invalid layout");
        let ptr = self.bump.alloc_layout(layout);
        let slice = unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), len) };
        slice.fill(0);
        slice
    }

    /// Release all allocations and reset the arena to its initial state.
    pub fn reset(&mut self) {
        self.bump.reset();
    }
}

impl Default for BumpArena {
    fn default() -> Self {
        Self::new()
    }
}
