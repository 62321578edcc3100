// Memory-exchange handles (§6.3).
//
// An opaque, transferable reference to a shared-memory region. The core
// never maps memory itself; it asks a `MemoryExchangeFactory` for a handle,
// serializes that handle's wire representation into a control message
// (§6.2), and the peer turns the bytes back into a handle with its own
// factory. This keeps `memcon` testable against an in-process test double
// instead of a real OS mapping (SPEC_FULL.md §D, C6).

use crate::error::{MemConError, MemConResult};

/// Wire size of a serialized handle: large enough for a shm name hash plus
/// size/alignment, small enough to fit comfortably in a control message
/// (§6.2 "at most a few tens of bytes").
pub const HANDLE_WIRE_SIZE: usize = 24;

pub type HandleWireBytes = [u8; HANDLE_WIRE_SIZE];

/// A mapped (or mappable) shared-memory region, handed across the side
/// channel as an opaque blob and reconstructed by the peer's factory.
pub trait MemoryExchangeHandle: Send + Sync + std::fmt::Debug {
    fn size(&self) -> usize;
    fn alignment(&self) -> usize;

    /// Map (or return the already-mapped) region read-only.
    fn map_read(&self) -> MemConResult<*const u8>;

    /// Map (or return the already-mapped) region read-write. Only the
    /// allocating side is expected to call this.
    fn map_read_write(&self) -> MemConResult<*mut u8>;

    /// Serialize into the fixed-size representation carried by a control
    /// message.
    fn to_wire(&self) -> HandleWireBytes;
}

/// Creates and resolves handles. One implementation per platform/transport;
/// `memcon` is built and tested against this trait, never a concrete type.
pub trait MemoryExchangeFactory {
    type Handle: MemoryExchangeHandle;

    /// Allocate a fresh region of `size` bytes aligned to `alignment`.
    fn create(&self, size: usize, alignment: usize) -> MemConResult<Self::Handle>;

    /// Reconstruct a handle from bytes received over the side channel.
    fn from_wire(&self, bytes: &HandleWireBytes) -> MemConResult<Self::Handle>;
}

/// An in-process test double: backs handles with a plain heap allocation
/// instead of a named OS shared-memory segment, and resolves wire bytes
/// through a registry shared between the two ends of a test.
#[cfg(test)]
pub mod test_double {
    use super::*;
    use std::alloc::{alloc_zeroed, dealloc, Layout};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Debug)]
    struct Region {
        ptr: *mut u8,
        layout: Layout,
    }

    unsafe impl Send for Region {}
    unsafe impl Sync for Region {}

    impl Drop for Region {
        fn drop(&mut self) {
            unsafe { dealloc(self.ptr, self.layout) };
        }
    }

    #[derive(Debug, Clone)]
    pub struct TestHandle {
        id: u64,
        size: usize,
        alignment: usize,
        registry: Arc<Mutex<HashMap<u64, Arc<Region>>>>,
    }

    impl MemoryExchangeHandle for TestHandle {
        fn size(&self) -> usize {
            self.size
        }
        fn alignment(&self) -> usize {
            self.alignment
        }
        fn map_read(&self) -> MemConResult<*const u8> {
            let registry = self.registry.lock().unwrap();
            let region = registry.get(&self.id).ok_or_else(|| {
                MemConError::Memory(std::io::Error::new(std::io::ErrorKind::NotFound, "unknown handle id"))
            })?;
            Ok(region.ptr as *const u8)
        }
        fn map_read_write(&self) -> MemConResult<*mut u8> {
            let registry = self.registry.lock().unwrap();
            let region = registry.get(&self.id).ok_or_else(|| {
                MemConError::Memory(std::io::Error::new(std::io::ErrorKind::NotFound, "unknown handle id"))
            })?;
            Ok(region.ptr)
        }
        fn to_wire(&self) -> HandleWireBytes {
            let mut out = [0u8; HANDLE_WIRE_SIZE];
            out[0..8].copy_from_slice(&self.id.to_be_bytes());
            out[8..16].copy_from_slice(&(self.size as u64).to_be_bytes());
            out[16..24].copy_from_slice(&(self.alignment as u64).to_be_bytes());
            out
        }
    }

    #[derive(Default, Clone)]
    pub struct TestFactory {
        registry: Arc<Mutex<HashMap<u64, Arc<Region>>>>,
        next_id: Arc<Mutex<u64>>,
    }

    impl MemoryExchangeFactory for TestFactory {
        type Handle = TestHandle;

        fn create(&self, size: usize, alignment: usize) -> MemConResult<TestHandle> {
            let layout = Layout::from_size_align(size, alignment)
                .map_err(|e| MemConError::Memory(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;
            let ptr = unsafe { alloc_zeroed(layout) };
            let mut id_guard = self.next_id.lock().unwrap();
            let id = *id_guard;
            *id_guard += 1;
            self.registry.lock().unwrap().insert(id, Arc::new(Region { ptr, layout }));
            Ok(TestHandle { id, size, alignment, registry: self.registry.clone() })
        }

        fn from_wire(&self, bytes: &HandleWireBytes) -> MemConResult<TestHandle> {
            let id = u64::from_be_bytes(bytes[0..8].try_into().unwrap());
            let size = u64::from_be_bytes(bytes[8..16].try_into().unwrap()) as usize;
            let alignment = u64::from_be_bytes(bytes[16..24].try_into().unwrap()) as usize;
            if !self.registry.lock().unwrap().contains_key(&id) {
                return Err(MemConError::Memory(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "unknown handle id in this process",
                )));
            }
            Ok(TestHandle { id, size, alignment, registry: self.registry.clone() })
        }
    }
}
