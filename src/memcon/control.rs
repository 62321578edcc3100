// MemCon side-channel control protocol (§3.6, §6.2).
//
// Every message is a 1-byte tag followed by a fixed, trivially-copyable
// payload for that tag. Two connection messages carry a `MemoryExchangeHandle`
// in its wire form (§6.3); the rest carry only whatever scalar fields the
// handshake needs.

use crate::error::{MemConError, MemConResult};
use crate::memcon::memory_exchange::{HandleWireBytes, HANDLE_WIRE_SIZE};

const TAG_CONNECTION_REQUEST_SLOT_MEMORY: u8 = 0x00;
const TAG_CONNECTION_REQUEST_QUEUE_MEMORY: u8 = 0x01;
const TAG_ACK_CONNECTION: u8 = 0x02;
const TAG_ACK_QUEUE_INITIALIZATION: u8 = 0x03;
const TAG_START_LISTENING: u8 = 0x04;
const TAG_STOP_LISTENING: u8 = 0x05;
const TAG_SHUTDOWN: u8 = 0x06;
const TAG_TERMINATION: u8 = 0x07;
const TAG_NOTIFY: u8 = 0x08;

/// Largest encoded message, for transport buffer sizing (§6.2 "at most a
/// few tens of bytes").
pub const MAX_MESSAGE_SIZE: usize = 1 + HANDLE_WIRE_SIZE + 12;

#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// Offers the slot-table memory handle and the invariants from §3.5 the
    /// receiving side must itself validate before mapping it.
    ConnectionRequestSlotMemory {
        handle: HandleWireBytes,
        num_slots: u32,
        slot_content_size: u32,
        slot_content_alignment: u32,
    },
    /// Offers the server-allocated Available-queue memory handle.
    ConnectionRequestQueueMemory { handle: HandleWireBytes, available_capacity: u32 },
    /// The client's reply: its own client-allocated Free-queue memory
    /// handle (§4.6.1 "client-queue memory... client-allocated").
    AckConnection { handle: HandleWireBytes, free_capacity: u32 },
    AckQueueInitialization,
    StartListening,
    StopListening,
    Shutdown,
    Termination,
    /// Best-effort slot-published wake signal (§4.6.3, §6.2 requirement 4):
    /// sent over the same framing but never retried or buffered by the
    /// side channel, unlike every other variant here.
    Notify,
}

impl ControlMessage {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.clear();
        match self {
            ControlMessage::ConnectionRequestSlotMemory { handle, num_slots, slot_content_size, slot_content_alignment } => {
                out.push(TAG_CONNECTION_REQUEST_SLOT_MEMORY);
                out.extend_from_slice(handle);
                out.extend_from_slice(&num_slots.to_be_bytes());
                out.extend_from_slice(&slot_content_size.to_be_bytes());
                out.extend_from_slice(&slot_content_alignment.to_be_bytes());
            }
            ControlMessage::ConnectionRequestQueueMemory { handle, available_capacity } => {
                out.push(TAG_CONNECTION_REQUEST_QUEUE_MEMORY);
                out.extend_from_slice(handle);
                out.extend_from_slice(&available_capacity.to_be_bytes());
            }
            ControlMessage::AckConnection { handle, free_capacity } => {
                out.push(TAG_ACK_CONNECTION);
                out.extend_from_slice(handle);
                out.extend_from_slice(&free_capacity.to_be_bytes());
            }
            ControlMessage::AckQueueInitialization => out.push(TAG_ACK_QUEUE_INITIALIZATION),
            ControlMessage::StartListening => out.push(TAG_START_LISTENING),
            ControlMessage::StopListening => out.push(TAG_STOP_LISTENING),
            ControlMessage::Shutdown => out.push(TAG_SHUTDOWN),
            ControlMessage::Termination => out.push(TAG_TERMINATION),
            ControlMessage::Notify => out.push(TAG_NOTIFY),
        }
    }

    pub fn decode(buf: &[u8]) -> MemConResult<Self> {
        let Some((&tag, rest)) = buf.split_first() else {
            return Err(MemConError::ProtocolViolation("empty control message".into()));
        };
        match tag {
            TAG_CONNECTION_REQUEST_SLOT_MEMORY => {
                let (handle, rest) = take_handle(rest)?;
                let (num_slots, rest) = take_u32(rest)?;
                let (slot_content_size, rest) = take_u32(rest)?;
                let (slot_content_alignment, _) = take_u32(rest)?;
                Ok(ControlMessage::ConnectionRequestSlotMemory {
                    handle,
                    num_slots,
                    slot_content_size,
                    slot_content_alignment,
                })
            }
            TAG_CONNECTION_REQUEST_QUEUE_MEMORY => {
                let (handle, rest) = take_handle(rest)?;
                let (available_capacity, _) = take_u32(rest)?;
                Ok(ControlMessage::ConnectionRequestQueueMemory { handle, available_capacity })
            }
            TAG_ACK_CONNECTION => {
                let (handle, rest) = take_handle(rest)?;
                let (free_capacity, _) = take_u32(rest)?;
                Ok(ControlMessage::AckConnection { handle, free_capacity })
            }
            TAG_ACK_QUEUE_INITIALIZATION => Ok(ControlMessage::AckQueueInitialization),
            TAG_START_LISTENING => Ok(ControlMessage::StartListening),
            TAG_STOP_LISTENING => Ok(ControlMessage::StopListening),
            TAG_SHUTDOWN => Ok(ControlMessage::Shutdown),
            TAG_TERMINATION => Ok(ControlMessage::Termination),
            TAG_NOTIFY => Ok(ControlMessage::Notify),
            other => Err(MemConError::ProtocolViolation(format!("unknown control message tag {other:#x}"))),
        }
    }
}

fn take_handle(buf: &[u8]) -> MemConResult<(HandleWireBytes, &[u8])> {
    if buf.len() < HANDLE_WIRE_SIZE {
        return Err(MemConError::ProtocolViolation("truncated memory-exchange handle".into()));
    }
    let mut handle = [0u8; HANDLE_WIRE_SIZE];
    handle.copy_from_slice(&buf[..HANDLE_WIRE_SIZE]);
    Ok((handle, &buf[HANDLE_WIRE_SIZE..]))
}

fn take_u32(buf: &[u8]) -> MemConResult<(u32, &[u8])> {
    if buf.len() < 4 {
        return Err(MemConError::ProtocolViolation("truncated control message field".into()));
    }
    let value = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    Ok((value, &buf[4..]))
}
