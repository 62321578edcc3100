// MemCon client state machine (§4.6.2).
//
// Drives `ClientState::Connecting → Connected → {DisconnectedRemote |
// Disconnected | Corrupted}` off side-channel events, the way `server.rs`'s
// SD state machine drives its own states off `ServerEvent`s — events are
// matched against `(state, message)` and either advance the state or, for
// anything unexpected outside a terminal state, drop straight to
// `Corrupted`.

use crate::error::{MemConError, MemConResult};
use crate::memcon::control::ControlMessage;
use crate::memcon::memory_exchange::{MemoryExchangeFactory, MemoryExchangeHandle};
use crate::memcon::ring::IndexQueue;
use crate::memcon::side_channel::SideChannel;
use crate::memcon::slot_table::SlotTable;
use crate::memcon::types::SlotToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connecting,
    Connected,
    DisconnectedRemote,
    Disconnected,
    Corrupted,
}

struct PendingSlotMemory<H> {
    handle: H,
    num_slots: u32,
    content_size: u32,
    alignment: u32,
}

struct PendingQueueMemory<H> {
    handle: H,
    available_capacity: u32,
}

/// One client's half of a MemCon channel. Generic over the memory-exchange
/// factory (§6.3) so it can be exercised against the in-process test double
/// without any real OS mapping.
pub struct Client<F: MemoryExchangeFactory> {
    factory: F,
    side_channel: Box<dyn SideChannel>,
    state: ClientState,
    started: bool,
    callback_in_flight: bool,

    pending_slot: Option<PendingSlotMemory<F::Handle>>,
    pending_queue: Option<PendingQueueMemory<F::Handle>>,

    // Kept alive for the connection's lifetime; dropping any of these would
    // unmap memory the other side still reads from.
    _slot_memory: Option<F::Handle>,
    _queue_memory: Option<F::Handle>,
    _free_memory: Option<F::Handle>,

    slot_table: Option<SlotTable>,
    available_queue: Option<IndexQueue>,
    free_queue: Option<IndexQueue>,

    listening: bool,
    notify_cb: Option<Box<dyn FnMut() + Send>>,
    on_state_transition: Option<Box<dyn FnMut(ClientState) + Send>>,
    slot_tokens_given_out: u32,
}

impl<F: MemoryExchangeFactory> Client<F> {
    pub fn new(factory: F, side_channel: Box<dyn SideChannel>) -> Self {
        Client {
            factory,
            side_channel,
            state: ClientState::Connecting,
            started: false,
            callback_in_flight: false,
            pending_slot: None,
            pending_queue: None,
            _slot_memory: None,
            _queue_memory: None,
            _free_memory: None,
            slot_table: None,
            available_queue: None,
            free_queue: None,
            listening: false,
            notify_cb: None,
            on_state_transition: None,
            slot_tokens_given_out: 0,
        }
    }

    pub fn on_state_transition(&mut self, cb: Box<dyn FnMut(ClientState) + Send>) {
        self.on_state_transition = Some(cb);
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// "Not yet `Disconnected`, or the reception callback is still
    /// executing" (§4.6.2). A client must not be torn down while this is
    /// true; enforcing that is the caller's job, this is just the signal.
    pub fn is_in_use(&self) -> bool {
        self.state != ClientState::Disconnected || self.callback_in_flight
    }

    /// May only be called once, while `Connecting`. Everything after this
    /// is driven by repeated calls to [`Self::poll`].
    pub fn connect(&mut self) -> MemConResult<()> {
        if self.started {
            return Err(MemConError::ApiMisuse("connect() called more than once".into()));
        }
        self.started = true;
        Ok(())
    }

    /// Register the notification callback and tell the server this client
    /// wants to receive publishes. At most one callback may be registered
    /// at a time.
    pub fn start_listening(&mut self, cb: Box<dyn FnMut() + Send>) -> MemConResult<()> {
        if self.state != ClientState::Connected {
            return Err(MemConError::ApiMisuse("start_listening() outside Connected".into()));
        }
        if self.notify_cb.is_some() {
            return Err(MemConError::ApiMisuse("a listening callback is already registered".into()));
        }
        self.side_channel.send(&ControlMessage::StartListening)?;
        self.notify_cb = Some(cb);
        self.listening = true;
        Ok(())
    }

    pub fn stop_listening(&mut self) -> MemConResult<()> {
        if !self.listening {
            return Ok(());
        }
        self.side_channel.send(&ControlMessage::StopListening)?;
        self.notify_cb = None;
        self.listening = false;
        Ok(())
    }

    /// Pull the next available slot, if any. `None` is not an error
    /// (§8 boundary behaviour).
    pub fn receive_slot(&mut self) -> MemConResult<Option<SlotToken>> {
        if self.state != ClientState::Connected {
            return Err(MemConError::ApiMisuse("receive_slot() outside Connected".into()));
        }
        let queue = self.available_queue.as_ref().expect("Connected implies queues are mapped");
        let table = self.slot_table.as_ref().expect("Connected implies slot table is mapped");
        match queue.pop() {
            Some(index) => {
                let generation = table.generation(index);
                self.slot_tokens_given_out += 1;
                Ok(Some(SlotToken { index, generation }))
            }
            None => Ok(None),
        }
    }

    /// Read-only view of a slot's content, valid only while `token`'s
    /// generation matches the slot's current generation.
    pub fn access_slot_content(&self, token: &SlotToken) -> MemConResult<&[u8]> {
        let table = self
            .slot_table
            .as_ref()
            .ok_or_else(|| MemConError::ApiMisuse("access_slot_content() before connected".into()))?;
        let live = table.generation(token.index);
        if live != token.generation {
            return Err(MemConError::StaleToken { token_gen: token.generation, slot_gen: live });
        }
        Ok(table.content(token.index))
    }

    /// Hand a slot back to the server via the Free queue.
    pub fn release_slot(&mut self, token: SlotToken) -> MemConResult<()> {
        let queue = self
            .free_queue
            .as_ref()
            .ok_or_else(|| MemConError::ApiMisuse("release_slot() before connected".into()))?;
        if !queue.push(token.index) {
            return Err(MemConError::ApiMisuse("free queue is full".into()));
        }
        self.slot_tokens_given_out = self.slot_tokens_given_out.saturating_sub(1);
        Ok(())
    }

    pub fn slot_tokens_given_out(&self) -> u32 {
        self.slot_tokens_given_out
    }

    /// Idempotent. Transitions to `Disconnected` once the side channel
    /// confirms the shutdown handshake completed (driven by `poll`).
    pub fn disconnect(&mut self) -> MemConResult<()> {
        if matches!(self.state, ClientState::Disconnected | ClientState::Corrupted) {
            return Ok(());
        }
        self.side_channel.send(&ControlMessage::Shutdown)
    }

    /// Process one pending side-channel event, if any. The reactor thread
    /// (§5) calls this repeatedly; it never blocks.
    pub fn poll(&mut self) -> MemConResult<()> {
        if !self.started || matches!(self.state, ClientState::Disconnected | ClientState::Corrupted) {
            return Ok(());
        }
        match self.side_channel.try_receive() {
            Ok(Some(msg)) => self.handle_message(msg),
            Ok(None) => Ok(()),
            Err(MemConError::PeerDisconnected) => {
                self.on_peer_gone_gracefully();
                Ok(())
            }
            Err(MemConError::PeerCrashed) => {
                self.go_corrupted();
                Err(MemConError::PeerCrashed)
            }
            Err(e) => Err(e),
        }
    }

    fn handle_message(&mut self, msg: ControlMessage) -> MemConResult<()> {
        match (self.state, msg) {
            (ClientState::Connecting, ControlMessage::ConnectionRequestSlotMemory { handle, num_slots, slot_content_size, slot_content_alignment }) => {
                let handle = self.factory.from_wire(&handle)?;
                self.pending_slot = Some(PendingSlotMemory { handle, num_slots, content_size: slot_content_size, alignment: slot_content_alignment });
                self.try_finish_handshake()
            }
            (ClientState::Connecting, ControlMessage::ConnectionRequestQueueMemory { handle, available_capacity }) => {
                let handle = self.factory.from_wire(&handle)?;
                self.pending_queue = Some(PendingQueueMemory { handle, available_capacity });
                self.try_finish_handshake()
            }
            (ClientState::Connecting, ControlMessage::AckQueueInitialization) => {
                if self.slot_table.is_none() || self.available_queue.is_none() {
                    self.go_corrupted();
                    return Err(MemConError::ProtocolViolation("AckQueueInitialization before memory handshake completed".into()));
                }
                self.transition(ClientState::Connected);
                Ok(())
            }
            (ClientState::Connecting, ControlMessage::Shutdown) => {
                self.transition(ClientState::Disconnected);
                Ok(())
            }
            (ClientState::Connected, ControlMessage::Shutdown) => {
                self.transition(ClientState::DisconnectedRemote);
                Ok(())
            }
            (ClientState::DisconnectedRemote, ControlMessage::Shutdown) => {
                self.go_corrupted();
                Err(MemConError::ProtocolViolation("second Shutdown after DisconnectedRemote".into()))
            }
            (ClientState::Connected, ControlMessage::Notify) => {
                if self.listening {
                    self.fire_notification();
                }
                Ok(())
            }
            (ClientState::Disconnected | ClientState::Corrupted, _) => Ok(()),
            (_, other) => {
                self.go_corrupted();
                Err(MemConError::ProtocolViolation(format!("unexpected {other:?} in state {:?}", self.state)))
            }
        }
    }

    fn try_finish_handshake(&mut self) -> MemConResult<()> {
        let (slot, queue) = match (&self.pending_slot, &self.pending_queue) {
            (Some(s), Some(q)) => (s, q),
            _ => return Ok(()),
        };

        let slot_ptr = slot.handle.map_read()? as *mut u8;
        let slot_table = unsafe { SlotTable::attach(slot_ptr, slot.num_slots, slot.content_size, slot.alignment) };

        let queue_ptr = queue.handle.map_read_write()?;
        let available_queue = unsafe { IndexQueue::attach(queue_ptr, queue.available_capacity) };

        let free_capacity = slot.num_slots;
        let free_handle = self.factory.create(IndexQueue::required_size(free_capacity), std::mem::size_of::<u64>())?;
        let free_ptr = free_handle.map_read_write()?;
        let free_queue = unsafe { IndexQueue::init(free_ptr, free_capacity) };
        let free_wire = free_handle.to_wire();

        let slot_memory = self.pending_slot.take().unwrap().handle;
        let queue_memory = self.pending_queue.take().unwrap().handle;

        self.slot_table = Some(slot_table);
        self.available_queue = Some(available_queue);
        self.free_queue = Some(free_queue);
        self._slot_memory = Some(slot_memory);
        self._queue_memory = Some(queue_memory);
        self._free_memory = Some(free_handle);

        self.side_channel.send(&ControlMessage::AckConnection { handle: free_wire, free_capacity })
    }

    fn fire_notification(&mut self) {
        if let Some(mut cb) = self.notify_cb.take() {
            self.callback_in_flight = true;
            cb();
            self.callback_in_flight = false;
            self.notify_cb = Some(cb);
        }
    }

    fn on_peer_gone_gracefully(&mut self) {
        match self.state {
            ClientState::Connecting => self.transition(ClientState::Disconnected),
            ClientState::Connected => self.transition(ClientState::DisconnectedRemote),
            ClientState::DisconnectedRemote => self.go_corrupted(),
            ClientState::Disconnected | ClientState::Corrupted => {}
        }
    }

    fn go_corrupted(&mut self) {
        if self.state == ClientState::Corrupted {
            return;
        }
        // §4.6.6: any token this side still holds is forfeit.
        self.slot_tokens_given_out = 0;
        self.transition(ClientState::Corrupted);
    }

    fn transition(&mut self, new_state: ClientState) {
        self.state = new_state;
        if let Some(mut cb) = self.on_state_transition.take() {
            self.callback_in_flight = true;
            cb(new_state);
            self.callback_in_flight = false;
            self.on_state_transition = Some(cb);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memcon::memory_exchange::test_double::TestFactory;
    use crate::memcon::side_channel::test_double::{pair, InProcessSideChannel};
    use std::sync::{Arc, Mutex};

    fn harness() -> (Client<TestFactory>, InProcessSideChannel) {
        let (client_side, server_side) = pair();
        let client = Client::new(TestFactory::default(), Box::new(client_side));
        (client, server_side)
    }

    fn drive_handshake(client: &mut Client<TestFactory>, server_side: &mut InProcessSideChannel, num_slots: u32) {
        client.connect().unwrap();
        let factory = client.factory.clone();
        let slot_handle = factory.create(SlotTable::required_size(num_slots, 16, 8), 8).unwrap();
        let queue_handle = factory.create(IndexQueue::required_size(num_slots), 8).unwrap();
        unsafe {
            SlotTable::init(slot_handle.map_read_write().unwrap(), num_slots, 16, 8);
            IndexQueue::init(queue_handle.map_read_write().unwrap(), num_slots);
        }
        server_side
            .send(&ControlMessage::ConnectionRequestSlotMemory {
                handle: slot_handle.to_wire(),
                num_slots,
                slot_content_size: 16,
                slot_content_alignment: 8,
            })
            .unwrap();
        client.poll().unwrap();
        server_side
            .send(&ControlMessage::ConnectionRequestQueueMemory { handle: queue_handle.to_wire(), available_capacity: num_slots })
            .unwrap();
        client.poll().unwrap();
        assert!(matches!(server_side.try_receive().unwrap(), Some(ControlMessage::AckConnection { .. })));
        server_side.send(&ControlMessage::AckQueueInitialization).unwrap();
        client.poll().unwrap();
        assert_eq!(client.state(), ClientState::Connected);
    }

    #[test]
    fn handshake_reaches_connected() {
        let (mut client, mut server_side) = harness();
        drive_handshake(&mut client, &mut server_side, 4);
    }

    #[test]
    fn receive_slot_returns_none_when_available_queue_is_empty() {
        let (mut client, mut server_side) = harness();
        drive_handshake(&mut client, &mut server_side, 4);
        assert_eq!(client.receive_slot().unwrap(), None);
    }

    #[test]
    fn stale_token_is_rejected_after_generation_bump() {
        let (mut client, mut server_side) = harness();
        drive_handshake(&mut client, &mut server_side, 2);
        let table = client.slot_table.as_ref().unwrap();
        let stale = SlotToken { index: 0, generation: table.generation(0) };
        table.bump_generation(0);
        assert!(matches!(client.access_slot_content(&stale), Err(MemConError::StaleToken { .. })));
    }

    #[test]
    fn shutdown_from_connected_reaches_disconnected_remote_then_corrupted() {
        let (mut client, mut server_side) = harness();
        drive_handshake(&mut client, &mut server_side, 2);
        server_side.send(&ControlMessage::Shutdown).unwrap();
        client.poll().unwrap();
        assert_eq!(client.state(), ClientState::DisconnectedRemote);
        server_side.send(&ControlMessage::Shutdown).unwrap();
        assert!(client.poll().is_err());
        assert_eq!(client.state(), ClientState::Corrupted);
    }

    #[test]
    fn notify_fires_registered_callback_only_while_listening() {
        let (mut client, mut server_side) = harness();
        drive_handshake(&mut client, &mut server_side, 2);
        let fired = Arc::new(Mutex::new(0));
        let fired_cb = fired.clone();
        client.start_listening(Box::new(move || *fired_cb.lock().unwrap() += 1)).unwrap();
        assert!(matches!(server_side.try_receive().unwrap(), Some(ControlMessage::StartListening)));
        server_side.send(&ControlMessage::Notify).unwrap();
        client.poll().unwrap();
        assert_eq!(*fired.lock().unwrap(), 1);
    }

    #[test]
    fn simulated_crash_forfeits_slot_tokens() {
        let (mut client, mut server_side) = harness();
        drive_handshake(&mut client, &mut server_side, 2);
        server_side.simulate_crash();
        assert!(client.poll().is_err());
        assert_eq!(client.state(), ClientState::Corrupted);
        assert_eq!(client.slot_tokens_given_out(), 0);
    }
}
