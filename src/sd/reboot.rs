// C2 — Reboot/Session Tracker (§4.2).
//
// Two independent halves: `SessionGenerator` (outbound) hands out
// monotonically increasing `(session_id, reboot_flag)` pairs per stream;
// `RebootDetection` (inbound) observes peer streams and declares reboots.

use crate::net::PeerAddr;
use crate::sd::wire::primitives::{next_session_id, SESSION_ID_INITIAL};
use std::collections::HashMap;

/// One outbound stream's session/reboot state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OutboundStream {
    session_id: u16,
    reboot_flag: bool,
}

impl Default for OutboundStream {
    fn default() -> Self {
        OutboundStream { session_id: SESSION_ID_INITIAL, reboot_flag: true }
    }
}

/// Identifies one outbound stream: the singleton multicast stream, or a
/// unicast stream per destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutboundStreamKey {
    Multicast,
    Unicast(PeerAddr),
}

/// Hands out `(session_id, reboot_flag)` pairs for outbound SD messages.
///
/// §4.2: "On each send the tracker returns the current pair and then
/// increments. When `session_id` is about to wrap from `0xFFFF` back to
/// `0x0001`, it clears `reboot_flag`; thereafter `reboot_flag = false`
/// permanently for that stream."
#[derive(Default)]
pub struct SessionGenerator {
    streams: HashMap<OutboundStreamKey, OutboundStream>,
}

impl SessionGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the pair to stamp on the message about to be sent, then
    /// advance the stream's state for next time.
    pub fn next(&mut self, key: OutboundStreamKey) -> (u16, bool) {
        let stream = self.streams.entry(key).or_default();
        let current = (stream.session_id, stream.reboot_flag);
        let (next_id, wrapped) = next_session_id(stream.session_id);
        stream.session_id = next_id;
        if wrapped {
            stream.reboot_flag = false;
        }
        current
    }
}

/// Identifies one inbound stream for reboot detection: multicast or unicast
/// from a given peer, tracked separately (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InboundStreamKey {
    pub peer: PeerAddr,
    pub multicast: bool,
}

#[derive(Debug, Clone, Copy)]
struct InboundStream {
    session_id: u16,
    reboot_flag: bool,
}

/// Tracks the last observed `(session_id, reboot_flag)` per inbound stream
/// and declares reboots (§4.2, §8 scenario 3).
#[derive(Default)]
pub struct RebootDetection {
    streams: HashMap<InboundStreamKey, InboundStream>,
}

impl RebootDetection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe one inbound message's `(session_id, reboot_flag)` on the
    /// given stream. Returns whether a reboot is declared.
    ///
    /// A reboot is declared when either `reboot_flag` flipped false→true,
    /// or `session_id` went backward while `reboot_flag` was already true
    /// and remains true. On a declared reboot, the companion (opposite
    /// cast-type) stream state for the same peer is cleared so it doesn't
    /// re-trigger on the next message of that cast type.
    pub fn observe(&mut self, peer: PeerAddr, is_multicast: bool, session_id: u16, reboot_flag: bool) -> bool {
        let key = InboundStreamKey { peer, multicast: is_multicast };
        let rebooted = match self.streams.get(&key) {
            None => reboot_flag,
            Some(prev) => {
                (!prev.reboot_flag && reboot_flag)
                    || (prev.reboot_flag && reboot_flag && session_id < prev.session_id)
            }
        };
        self.streams.insert(key, InboundStream { session_id, reboot_flag });
        if rebooted {
            let companion = InboundStreamKey { peer, multicast: !is_multicast };
            self.streams.remove(&companion);
        }
        rebooted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn session_generator_starts_at_one_with_reboot_true() {
        let mut gen = SessionGenerator::new();
        let (id, reboot) = gen.next(OutboundStreamKey::Multicast);
        assert_eq!(id, 1);
        assert!(reboot);
    }

    #[test]
    fn session_generator_clears_reboot_flag_after_wrap() {
        let mut gen = SessionGenerator::new();
        let key = OutboundStreamKey::Multicast;
        // Drive the stream right up to the wrap boundary.
        for _ in 0..0xFFFF {
            gen.next(key);
        }
        let (id, reboot) = gen.next(key);
        assert_eq!(id, 0xFFFF);
        assert!(reboot);
        let (id, reboot) = gen.next(key);
        assert_eq!(id, 0x0001);
        assert!(!reboot);
    }

    #[test]
    fn reboot_scenario_from_spec() {
        let mut det = RebootDetection::new();
        let peer = PeerAddr::v4(Ipv4Addr::new(203, 0, 113, 7), 30490);
        assert!(det.observe(peer, false, 5, true));
        assert!(!det.observe(peer, false, 6, true));
        assert!(det.observe(peer, false, 2, true));
    }

    #[test]
    fn declared_reboot_clears_companion_stream() {
        let mut det = RebootDetection::new();
        let peer = PeerAddr::v4(Ipv4Addr::new(203, 0, 113, 7), 30490);
        det.observe(peer, true, 5, false);
        assert!(det.observe(peer, false, 1, true));
        // Companion (multicast) state was cleared; a fresh true-flag
        // observation there would again count as first-observation reboot.
        assert!(det.observe(peer, true, 1, true));
    }
}
