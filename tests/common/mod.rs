// Shared test support for the MemCon integration tests: a heap-backed
// `MemoryExchangeFactory` and an `mpsc`-backed `SideChannel`, built only
// from `memcon`'s public trait surface (§6.2, §6.3) rather than the
// crate's own `#[cfg(test)]`-only in-process doubles, which an external
// integration test cannot see.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};

use someip_sd_core::error::{MemConError, MemConResult};
use someip_sd_core::memcon::control::ControlMessage;
use someip_sd_core::memcon::memory_exchange::{
    HandleWireBytes, MemoryExchangeFactory, MemoryExchangeHandle, HANDLE_WIRE_SIZE,
};
use someip_sd_core::memcon::side_channel::SideChannel;

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
pub struct HeapHandle {
    id: u64,
    size: usize,
    alignment: usize,
    registry: Arc<Mutex<HashMap<u64, Arc<Region>>>>,
}

impl MemoryExchangeHandle for HeapHandle {
    fn size(&self) -> usize {
        self.size
    }
    fn alignment(&self) -> usize {
        self.alignment
    }
    fn map_read(&self) -> MemConResult<*const u8> {
        self.map_read_write().map(|p| p as *const u8)
    }
    fn map_read_write(&self) -> MemConResult<*mut u8> {
        let registry = self.registry.lock().unwrap();
        let region = registry
            .get(&self.id)
            .ok_or_else(|| MemConError::Memory(std::io::Error::new(std::io::ErrorKind::NotFound, "unknown handle")))?;
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
pub struct HeapFactory {
    registry: Arc<Mutex<HashMap<u64, Arc<Region>>>>,
    next_id: Arc<Mutex<u64>>,
}

impl MemoryExchangeFactory for HeapFactory {
    type Handle = HeapHandle;

    fn create(&self, size: usize, alignment: usize) -> MemConResult<HeapHandle> {
        let layout = Layout::from_size_align(size.max(1), alignment.max(1))
            .map_err(|e| MemConError::Memory(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;
        let ptr = unsafe { alloc_zeroed(layout) };
        let mut id_guard = self.next_id.lock().unwrap();
        let id = *id_guard;
        *id_guard += 1;
        self.registry.lock().unwrap().insert(id, Arc::new(Region { ptr, layout }));
        Ok(HeapHandle { id, size, alignment, registry: self.registry.clone() })
    }

    fn from_wire(&self, bytes: &HandleWireBytes) -> MemConResult<HeapHandle> {
        let id = u64::from_be_bytes(bytes[0..8].try_into().unwrap());
        let size = u64::from_be_bytes(bytes[8..16].try_into().unwrap()) as usize;
        let alignment = u64::from_be_bytes(bytes[16..24].try_into().unwrap()) as usize;
        if !self.registry.lock().unwrap().contains_key(&id) {
            return Err(MemConError::Memory(std::io::Error::new(std::io::ErrorKind::NotFound, "unknown handle id")));
        }
        Ok(HeapHandle { id, size, alignment, registry: self.registry.clone() })
    }
}

enum Frame {
    Message(ControlMessage),
    Crash,
}

pub struct MpscSideChannel {
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
}

pub fn channel_pair() -> (MpscSideChannel, MpscSideChannel) {
    let (tx_a, rx_b) = std::sync::mpsc::channel();
    let (tx_b, rx_a) = std::sync::mpsc::channel();
    (MpscSideChannel { tx: tx_a, rx: rx_a }, MpscSideChannel { tx: tx_b, rx: rx_b })
}

impl MpscSideChannel {
    pub fn simulate_crash(&self) {
        let _ = self.tx.send(Frame::Crash);
    }
}

impl SideChannel for MpscSideChannel {
    fn send(&mut self, msg: &ControlMessage) -> MemConResult<()> {
        self.tx.send(Frame::Message(msg.clone())).map_err(|_| MemConError::PeerDisconnected)
    }

    fn try_receive(&mut self) -> MemConResult<Option<ControlMessage>> {
        match self.rx.try_recv() {
            Ok(Frame::Message(msg)) => Ok(Some(msg)),
            Ok(Frame::Crash) => Err(MemConError::PeerCrashed),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(MemConError::PeerCrashed),
        }
    }

    fn notify(&mut self) -> MemConResult<()> {
        self.tx.send(Frame::Message(ControlMessage::Notify)).map_err(|_| MemConError::DroppedNotification("peer gone".into()))
    }
}

/// Drive a freshly-registered receiver through the full §4.6.2/§4.6.3
/// handshake to `Connected` on both ends.
pub fn connect(
    server: &mut someip_sd_core::memcon::server::Server<HeapFactory>,
    factory: &HeapFactory,
    id: someip_sd_core::memcon::server::ReceiverId,
    class: someip_sd_core::memcon::types::ClassId,
) -> someip_sd_core::memcon::client::Client<HeapFactory> {
    use someip_sd_core::memcon::client::{Client, ClientState};
    use someip_sd_core::memcon::server::ReceiverState;

    let (server_side, client_side) = channel_pair();
    server.add_receiver(id, class, Box::new(server_side)).unwrap();
    let mut client = Client::new(factory.clone(), Box::new(client_side));
    client.connect().unwrap();
    server.begin_connect(id).unwrap();
    client.poll().unwrap(); // ConnectionRequestSlotMemory
    client.poll().unwrap(); // ConnectionRequestQueueMemory
    server.poll_receiver(id).unwrap(); // AckConnection
    client.poll().unwrap(); // AckQueueInitialization
    assert_eq!(client.state(), ClientState::Connected);
    assert_eq!(server.receiver_state(id), Some(ReceiverState::Connected));
    client
}
