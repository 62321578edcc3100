// The reliable 1:1 control transport underlying MemCon's side channel
// (§3.6, §6.2), adapted from the teacher's broadcast `channel::Route`:
// ordered delivery, a send that survives the sender's own crash (the
// message already sits in the receiver's shared-memory ring), and a
// distinction between a peer that said `Shutdown` and one that simply
// stopped responding.

use crate::channel::{Mode, Route};
use crate::error::{MemConError, MemConResult};
use crate::memcon::control::ControlMessage;

/// A reliable, ordered, 1:1 message transport between one MemCon client and
/// its server. §6.2's five transport requirements are this trait's
/// contract; `ShmSideChannel` is the production implementation, built on
/// two `channel::Route`s (one per direction) from the shared-memory ring
/// the teacher crate already provides.
pub trait SideChannel: Send {
    /// Send `msg`. An `Err` here always means the message was not
    /// delivered (§6.2 requirement 1: delivered in order or not at all).
    fn send(&mut self, msg: &ControlMessage) -> MemConResult<()>;

    /// Non-blocking receive. `Ok(None)` means nothing pending; `Err`
    /// distinguishes a peer that sent `Shutdown`/closed cleanly
    /// (`PeerDisconnected`) from one that stopped responding without doing
    /// so (`PeerCrashed`).
    fn try_receive(&mut self) -> MemConResult<Option<ControlMessage>>;

    /// Best-effort wake signal (§6.2 requirement 4): unlike `send`, a
    /// failure to deliver is not fatal to the channel, only to this one
    /// notification.
    fn notify(&mut self) -> MemConResult<()>;
}

/// Liveness window used to turn "no reply within this long" into a
/// `PeerCrashed` verdict; `channel::Route` itself has no process-death
/// notification, so this is the chosen approximation (documented in
/// DESIGN.md rather than left implicit).
const CRASH_LIVENESS_TIMEOUT_MS: u64 = 5_000;

pub struct ShmSideChannel {
    outbound: Route,
    inbound: Route,
    buf: Vec<u8>,
}

impl ShmSideChannel {
    /// `local_to_peer` and `peer_to_local` are the two one-way ring names;
    /// callers on both ends must agree on which name is whose outbound.
    pub fn connect(local_to_peer: &str, peer_to_local: &str) -> std::io::Result<Self> {
        let outbound = Route::connect(local_to_peer, Mode::Sender)?;
        let inbound = Route::connect(peer_to_local, Mode::Receiver)?;
        Ok(ShmSideChannel { outbound, inbound, buf: Vec::with_capacity(crate::memcon::control::MAX_MESSAGE_SIZE) })
    }
}

impl SideChannel for ShmSideChannel {
    fn send(&mut self, msg: &ControlMessage) -> MemConResult<()> {
        msg.encode(&mut self.buf);
        let delivered = self
            .outbound
            .send(&self.buf, CRASH_LIVENESS_TIMEOUT_MS)
            .map_err(MemConError::Memory)?;
        if !delivered {
            return Err(MemConError::PeerCrashed);
        }
        Ok(())
    }

    fn try_receive(&mut self) -> MemConResult<Option<ControlMessage>> {
        match self.inbound.try_recv() {
            Ok(buf) if buf.is_empty() => Ok(None),
            Ok(buf) => {
                let msg = ControlMessage::decode(buf.data())?;
                if msg == ControlMessage::Shutdown || msg == ControlMessage::Termination {
                    return Ok(Some(msg));
                }
                Ok(Some(msg))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Err(MemConError::PeerDisconnected),
            Err(e) => Err(MemConError::Memory(e)),
        }
    }

    fn notify(&mut self) -> MemConResult<()> {
        ControlMessage::Notify.encode(&mut self.buf);
        match self.outbound.try_send(&self.buf) {
            Ok(true) => Ok(()),
            Ok(false) => Err(MemConError::DroppedNotification("receiver queue full".into())),
            Err(e) => Err(MemConError::DroppedNotification(e.to_string())),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_double::pair;
    use super::*;

    #[test]
    fn messages_are_delivered_in_order() {
        let (mut a, mut b) = pair();
        a.send(&ControlMessage::StartListening).unwrap();
        a.send(&ControlMessage::StopListening).unwrap();
        assert_eq!(b.try_receive().unwrap(), Some(ControlMessage::StartListening));
        assert_eq!(b.try_receive().unwrap(), Some(ControlMessage::StopListening));
        assert_eq!(b.try_receive().unwrap(), None);
    }

    #[test]
    fn simulated_disconnect_surfaces_as_peer_disconnected() {
        let (a, mut b) = pair();
        a.simulate_disconnect();
        assert!(matches!(b.try_receive(), Err(MemConError::PeerDisconnected)));
    }

    #[test]
    fn simulated_crash_surfaces_as_peer_crashed() {
        let (a, mut b) = pair();
        a.simulate_crash();
        assert!(matches!(b.try_receive(), Err(MemConError::PeerCrashed)));
    }
}
