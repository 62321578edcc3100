// MemCon server: per-receiver state machine (§4.6.3), slot lifecycle
// (§4.6.4), class-quota enforcement (§4.6.5), and peer-crash handling
// (§4.6.6).
//
// One `Server` owns the channel's slot table and serves any number of
// receivers, each independently walking `Uninitialised → Connecting →
// Connected → {Disconnected | Corrupted}` the way `client.rs`'s `Client`
// walks its own four-state machine off the same eight-message control
// protocol, just from the other end of the handshake.

use std::collections::{HashMap, VecDeque};

use crate::config::ReceiverClassConfig;
use crate::error::{MemConError, MemConResult};
use crate::memcon::control::ControlMessage;
use crate::memcon::memory_exchange::{MemoryExchangeFactory, MemoryExchangeHandle};
use crate::memcon::ring::IndexQueue;
use crate::memcon::side_channel::SideChannel;
use crate::memcon::slot_table::SlotTable;
use crate::memcon::types::{ClassId, ReceiverClass, SlotIndex, SlotState};

pub type ReceiverId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Uninitialised,
    Connecting,
    Connected,
    Disconnected,
    Corrupted,
}

struct Receiver<H> {
    class: ClassId,
    state: ReceiverState,
    listening: bool,
    side_channel: Box<dyn SideChannel>,
    _available_memory: Option<H>,
    available_queue: Option<IndexQueue>,
    _free_memory: Option<H>,
    free_queue: Option<IndexQueue>,
    /// Slots currently published to this receiver and not yet released,
    /// forfeited in one batch on disconnect/crash (§4.6.6).
    held_slots: std::collections::HashSet<SlotIndex>,
}

/// The server side of one MemCon channel (one slot table, any number of
/// receivers, each with its own class and side channel).
pub struct Server<F: MemoryExchangeFactory> {
    factory: F,
    _slot_memory: F::Handle,
    slot_table: SlotTable,
    num_slots: u32,
    slot_content_size: u32,
    slot_content_alignment: u32,
    available_capacity: u32,
    classes: HashMap<ClassId, ReceiverClass>,
    slot_states: Vec<SlotState>,
    free_pool: VecDeque<SlotIndex>,
    receivers: HashMap<ReceiverId, Receiver<F::Handle>>,
    on_receiver_transition: Option<Box<dyn FnMut(ReceiverId, ReceiverState) + Send>>,
}

impl<F: MemoryExchangeFactory> Server<F> {
    pub fn new(
        factory: F,
        num_slots: u32,
        slot_content_size: u32,
        slot_content_alignment: u32,
        classes: &[ReceiverClassConfig],
    ) -> MemConResult<Self> {
        let slot_memory = factory.create(
            SlotTable::required_size(num_slots, slot_content_size, slot_content_alignment),
            slot_content_alignment as usize,
        )?;
        let table_ptr = slot_memory.map_read_write()?;
        let slot_table = unsafe { SlotTable::init(table_ptr, num_slots, slot_content_size, slot_content_alignment) };
        let classes = classes.iter().map(|c| (c.class_id, ReceiverClass::new(c.class_id, c.max_slots_in_use))).collect();
        let slot_states = (0..num_slots).map(|_| SlotState::new()).collect();
        let free_pool = (0..num_slots).collect();
        Ok(Server {
            factory,
            _slot_memory: slot_memory,
            slot_table,
            num_slots,
            slot_content_size,
            slot_content_alignment,
            available_capacity: num_slots,
            classes,
            slot_states,
            free_pool,
            receivers: HashMap::new(),
            on_receiver_transition: None,
        })
    }

    pub fn on_receiver_transition(&mut self, cb: Box<dyn FnMut(ReceiverId, ReceiverState) + Send>) {
        self.on_receiver_transition = Some(cb);
    }

    pub fn receiver_state(&self, id: ReceiverId) -> Option<ReceiverState> {
        self.receivers.get(&id).map(|r| r.state)
    }

    pub fn class_slots_in_use(&self, class: ClassId) -> Option<u32> {
        self.classes.get(&class).map(|c| c.slots_in_use)
    }

    pub fn add_receiver(&mut self, id: ReceiverId, class: ClassId, side_channel: Box<dyn SideChannel>) -> MemConResult<()> {
        if !self.classes.contains_key(&class) {
            return Err(MemConError::ApiMisuse(format!("unknown receiver class {class}")));
        }
        if self.receivers.contains_key(&id) {
            return Err(MemConError::ApiMisuse(format!("receiver {id} already registered")));
        }
        self.receivers.insert(
            id,
            Receiver {
                class,
                state: ReceiverState::Uninitialised,
                listening: false,
                side_channel,
                _available_memory: None,
                available_queue: None,
                _free_memory: None,
                free_queue: None,
                held_slots: std::collections::HashSet::new(),
            },
        );
        Ok(())
    }

    /// Begin the handshake for a registered receiver: offer the slot table
    /// and a freshly-allocated Available queue (§4.6.1, §4.6.3).
    pub fn begin_connect(&mut self, id: ReceiverId) -> MemConResult<()> {
        {
            let receiver = self.receivers.get(&id).ok_or_else(|| MemConError::ApiMisuse(format!("unknown receiver {id}")))?;
            if receiver.state != ReceiverState::Uninitialised {
                return Err(MemConError::ApiMisuse("begin_connect() called outside Uninitialised".into()));
            }
        }

        let slot_wire = self._slot_memory.to_wire();
        let available_memory = self.factory.create(IndexQueue::required_size(self.available_capacity), std::mem::size_of::<u64>())?;
        let queue_ptr = available_memory.map_read_write()?;
        let available_queue = unsafe { IndexQueue::init(queue_ptr, self.available_capacity) };
        let available_wire = available_memory.to_wire();

        let receiver = self.receivers.get_mut(&id).unwrap();
        receiver.side_channel.send(&ControlMessage::ConnectionRequestSlotMemory {
            handle: slot_wire,
            num_slots: self.num_slots,
            slot_content_size: self.slot_content_size,
            slot_content_alignment: self.slot_content_alignment,
        })?;
        receiver.side_channel.send(&ControlMessage::ConnectionRequestQueueMemory {
            handle: available_wire,
            available_capacity: self.available_capacity,
        })?;
        receiver._available_memory = Some(available_memory);
        receiver.available_queue = Some(available_queue);
        receiver.state = ReceiverState::Connecting;
        Ok(())
    }

    /// Process one pending side-channel event for `id`, if any.
    pub fn poll_receiver(&mut self, id: ReceiverId) -> MemConResult<()> {
        let state = match self.receivers.get(&id) {
            Some(r) => r.state,
            None => return Err(MemConError::ApiMisuse(format!("unknown receiver {id}"))),
        };
        if matches!(state, ReceiverState::Disconnected | ReceiverState::Corrupted) {
            return Ok(());
        }
        let class = self.receivers[&id].class;
        let received = self.receivers.get_mut(&id).unwrap().side_channel.try_receive();
        match received {
            Ok(Some(msg)) => self.handle_receiver_message(id, state, class, msg),
            Ok(None) => Ok(()),
            Err(MemConError::PeerDisconnected) => {
                self.forfeit_tokens(id, class);
                self.receivers.get_mut(&id).unwrap().state = ReceiverState::Disconnected;
                self.fire_receiver_transition(id, ReceiverState::Disconnected);
                Ok(())
            }
            Err(MemConError::PeerCrashed) => {
                self.go_receiver_corrupted(id, class);
                Err(MemConError::PeerCrashed)
            }
            Err(e) => Err(e),
        }
    }

    fn handle_receiver_message(&mut self, id: ReceiverId, state: ReceiverState, class: ClassId, msg: ControlMessage) -> MemConResult<()> {
        match (state, msg) {
            (ReceiverState::Connecting, ControlMessage::AckConnection { handle, free_capacity }) => {
                let free_handle = self.factory.from_wire(&handle)?;
                let free_ptr = free_handle.map_read_write()?;
                let free_queue = unsafe { IndexQueue::attach(free_ptr, free_capacity) };
                let receiver = self.receivers.get_mut(&id).unwrap();
                receiver._free_memory = Some(free_handle);
                receiver.free_queue = Some(free_queue);
                receiver.side_channel.send(&ControlMessage::AckQueueInitialization)?;
                receiver.state = ReceiverState::Connected;
                self.fire_receiver_transition(id, ReceiverState::Connected);
                Ok(())
            }
            (ReceiverState::Connected, ControlMessage::StartListening) => {
                self.receivers.get_mut(&id).unwrap().listening = true;
                Ok(())
            }
            (ReceiverState::Connected, ControlMessage::StopListening) => {
                self.receivers.get_mut(&id).unwrap().listening = false;
                Ok(())
            }
            (ReceiverState::Connected, ControlMessage::Shutdown) => {
                self.forfeit_tokens(id, class);
                self.receivers.get_mut(&id).unwrap().state = ReceiverState::Disconnected;
                self.fire_receiver_transition(id, ReceiverState::Disconnected);
                Ok(())
            }
            (ReceiverState::Disconnected | ReceiverState::Corrupted, _) => Ok(()),
            (other_state, other_msg) => {
                self.go_receiver_corrupted(id, class);
                Err(MemConError::ProtocolViolation(format!(
                    "unexpected {other_msg:?} for receiver {id} in state {other_state:?}"
                )))
            }
        }
    }

    fn go_receiver_corrupted(&mut self, id: ReceiverId, class: ClassId) {
        if matches!(self.receivers.get(&id), Some(r) if r.state == ReceiverState::Corrupted) {
            return;
        }
        self.forfeit_tokens(id, class);
        if let Some(r) = self.receivers.get_mut(&id) {
            r.state = ReceiverState::Corrupted;
        }
        self.fire_receiver_transition(id, ReceiverState::Corrupted);
    }

    fn fire_receiver_transition(&mut self, id: ReceiverId, state: ReceiverState) {
        if let Some(mut cb) = self.on_receiver_transition.take() {
            cb(id, state);
            self.on_receiver_transition = Some(cb);
        }
    }

    /// §4.6.4 step 1: find (or allocate) a slot nobody currently holds.
    pub fn acquire_slot(&mut self) -> Option<SlotIndex> {
        self.free_pool.pop_front()
    }

    /// §4.6.4 step 2.
    pub fn write_slot(&mut self, idx: SlotIndex, content: &[u8]) -> MemConResult<()> {
        let dest = unsafe { self.slot_table.content_mut(idx) };
        if content.len() > dest.len() {
            return Err(MemConError::ApiMisuse(format!(
                "content of {} bytes exceeds slot capacity of {} bytes",
                content.len(),
                dest.len()
            )));
        }
        dest[..content.len()].copy_from_slice(content);
        Ok(())
    }

    /// §4.6.4 step 3: fan out to every receiver allowed by class quota and
    /// currently `Connected`+listening.
    pub fn publish(&mut self, slot_index: SlotIndex) {
        let ids: Vec<ReceiverId> = self.receivers.keys().copied().collect();
        for id in ids {
            self.publish_to_receiver(id, slot_index);
        }
    }

    fn publish_to_receiver(&mut self, id: ReceiverId, slot_index: SlotIndex) {
        let (class, connected_listening) = {
            let r = &self.receivers[&id];
            (r.class, r.state == ReceiverState::Connected && r.listening)
        };
        if !connected_listening {
            return;
        }

        let already_charged = self.slot_states[slot_index as usize].is_charged_to(class);
        if !already_charged && !self.classes.get(&class).map(ReceiverClass::has_quota).unwrap_or(false) {
            return; // §4.6.5: class at quota, this slot is not already one of its charges
        }

        let pushed = {
            let receiver = self.receivers.get(&id).unwrap();
            receiver.available_queue.as_ref().map(|q| q.push(slot_index)).unwrap_or(false)
        };
        if !pushed {
            return;
        }

        self.slot_states[slot_index as usize].charge(class);
        if !already_charged {
            if let Some(c) = self.classes.get_mut(&class) {
                c.slots_in_use += 1;
            }
        }
        let receiver = self.receivers.get_mut(&id).unwrap();
        receiver.held_slots.insert(slot_index);
        let _ = receiver.side_channel.notify();
    }

    /// §4.6.4 step 5: drain everything `id` has released since the last
    /// call. Recycles slots whose ref-count across all classes hits zero.
    pub fn drain_releases(&mut self, id: ReceiverId) {
        let class = match self.receivers.get(&id) {
            Some(r) => r.class,
            None => return,
        };
        loop {
            let popped = self.receivers.get(&id).and_then(|r| r.free_queue.as_ref()).and_then(|q| q.pop());
            let Some(idx) = popped else { break };
            self.release_slot_from_receiver(id, class, idx);
        }
    }

    fn release_slot_from_receiver(&mut self, id: ReceiverId, class: ClassId, idx: SlotIndex) {
        if let Some(r) = self.receivers.get_mut(&id) {
            r.held_slots.remove(&idx);
        }
        let state = &mut self.slot_states[idx as usize];
        let became_fully_free = state.discharge(class);
        let class_now_zero = !state.is_charged_to(class);
        if class_now_zero {
            if let Some(c) = self.classes.get_mut(&class) {
                c.slots_in_use = c.slots_in_use.saturating_sub(1);
            }
        }
        if became_fully_free {
            // §4.6.4 step 6: any token minted before this point is now stale.
            self.slot_table.bump_generation(idx);
            self.free_pool.push_back(idx);
        }
    }

    /// §4.6.6: discharge every slot `id` still held, as if it had released
    /// them all, without waiting for a Free-queue write that will never
    /// come.
    fn forfeit_tokens(&mut self, id: ReceiverId, class: ClassId) {
        let held: Vec<SlotIndex> = match self.receivers.get_mut(&id) {
            Some(r) => r.held_slots.drain().collect(),
            None => return,
        };
        for idx in held {
            self.release_slot_from_receiver(id, class, idx);
        }
    }
}
