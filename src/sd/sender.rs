// SD message sender facade, generalized from `original_source/`'s
// `service_discovery_message_sender_interface.h` (SPEC_FULL.md §C.2).
//
// Owns the one `SessionGenerator`/`RebootDetection` pair for this node's SD
// traffic and ties C1 (codec) + C2 (session/reboot) + C3 (packing) to an
// injected `net::SdSocket`. C4's timer callbacks call `send_multicast`/
// `send_unicast`; the inbound dispatch pipeline calls `receive` to decode a
// datagram and learn whether it signals a peer reboot.

use tracing::{trace, warn};

use crate::mem::BumpArena;
use crate::net::{PeerAddr, SdSocket};
use crate::sd::builder::{pack, EntrySpec};
use crate::sd::reboot::{OutboundStreamKey, RebootDetection, SessionGenerator};
use crate::sd::wire::codec::{decode_sd_message, encode_sd_message};
use crate::sd::wire::message::SdMessage;
use crate::error::SdResult;

pub struct ServiceDiscoverySender {
    mtu: usize,
    session_gen: SessionGenerator,
    reboot_detection: RebootDetection,
}

impl ServiceDiscoverySender {
    pub fn new(mtu: usize) -> Self {
        ServiceDiscoverySender {
            mtu,
            session_gen: SessionGenerator::new(),
            reboot_detection: RebootDetection::new(),
        }
    }

    /// Stamp, pack, and send `specs` on the multicast stream. Returns the
    /// number of datagrams actually handed to the socket (a send failure on
    /// one datagram does not stop the rest — §4.4 "Failure semantics").
    pub fn send_multicast(&mut self, specs: Vec<EntrySpec>, socket: &dyn SdSocket) -> usize {
        self.send(specs, OutboundStreamKey::Multicast, socket)
    }

    /// Same as [`Self::send_multicast`] but on the unicast stream to `to`.
    pub fn send_unicast(&mut self, specs: Vec<EntrySpec>, to: PeerAddr, socket: &dyn SdSocket) -> usize {
        self.send(specs, OutboundStreamKey::Unicast(to), socket)
    }

    fn send(&mut self, specs: Vec<EntrySpec>, key: OutboundStreamKey, socket: &dyn SdSocket) -> usize {
        if specs.is_empty() {
            return 0;
        }
        let (session_id, reboot) = self.session_gen.next(key);
        let messages = pack(specs, session_id, reboot, self.mtu);
        let mut sent = 0;
        // One arena per packing pass: every message in `messages` gets its
        // own scratch slice out of it, the whole thing dropped once every
        // datagram has been handed to the socket.
        let mut arena = BumpArena::with_capacity(self.mtu + 64);
        for msg in &messages {
            let buf = arena.alloc_bytes(self.mtu + 64, 1);
            let ok = match encode_sd_message(msg, buf) {
                Ok(n) => match key {
                    OutboundStreamKey::Multicast => socket.send_multicast(&buf[..n]),
                    OutboundStreamKey::Unicast(peer) => socket.send_unicast(peer, &buf[..n]),
                },
                Err(e) => {
                    warn!(error = %e, "failed to encode SD message, dropping");
                    false
                }
            };
            if ok {
                sent += 1;
            }
        }
        arena.reset();
        sent
    }

    /// Decode an inbound datagram from `from` and feed its session/reboot
    /// pair to the reboot tracker. Returns the decoded message plus whether
    /// this datagram declares a reboot on that stream (§4.2).
    pub fn receive(&mut self, from: PeerAddr, is_multicast: bool, bytes: &[u8]) -> SdResult<(SdMessage, bool)> {
        let msg = decode_sd_message(bytes)?;
        let rebooted =
            self.reboot_detection.observe(from, is_multicast, msg.header.session_id, msg.flags.reboot);
        if rebooted {
            trace!(%from, is_multicast, session_id = msg.header.session_id, "peer reboot declared");
        }
        Ok((msg, rebooted))
    }
}
