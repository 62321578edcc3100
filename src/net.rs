// External UDP socket collaborator (§6.1) and the address-pair key type.
//
// Per the REDESIGN FLAGS in spec.md's Design Notes ("Maps keyed by address
// pairs... A systems-language rewrite should key by a tagged enum
// `{V4(u32,u16), V6([u8;16],u16)}` to avoid per-lookup string formatting"),
// peers are identified by `PeerAddr` rather than by stringified IP/port
// pairs, so the reboot tracker (`sd::reboot`) and the scheduler's one-shot
// unicast timer map (`sd::scheduler`) can use it directly as a hash key.

use std::net::{Ipv4Addr, Ipv6Addr};

/// A tagged peer address, stack-allocated, hashable without formatting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerAddr {
    V4(u32, u16),
    V6([u8; 16], u16),
}

impl PeerAddr {
    pub fn v4(ip: Ipv4Addr, port: u16) -> Self {
        PeerAddr::V4(u32::from_be_bytes(ip.octets()), port)
    }

    pub fn v6(ip: Ipv6Addr, port: u16) -> Self {
        PeerAddr::V6(ip.octets(), port)
    }

    pub fn port(&self) -> u16 {
        match self {
            PeerAddr::V4(_, p) => *p,
            PeerAddr::V6(_, p) => *p,
        }
    }

    pub fn ip_octets(&self) -> Vec<u8> {
        match self {
            PeerAddr::V4(ip, _) => ip.to_be_bytes().to_vec(),
            PeerAddr::V6(ip, _) => ip.to_vec(),
        }
    }
}

impl std::fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerAddr::V4(ip, port) => write!(f, "{}:{port}", Ipv4Addr::from(*ip)),
            PeerAddr::V6(ip, port) => write!(f, "{}:{port}", Ipv6Addr::from(*ip)),
        }
    }
}

/// The external UDP transport collaborator. Configuration of the multicast
/// group, interface selection, IP TTL, SO_REUSEADDR and join-group behaviour
/// are inputs to whatever implements this trait; the SD engine only ever
/// calls `send_unicast`/`send_multicast` and is pushed datagrams through
/// `SdDatagramSink::on_datagram`.
pub trait SdSocket {
    /// Send `bytes` to a single unicast peer. Returns `false` on failure
    /// (the scheduler logs and discards — §4.4 "Failure semantics").
    fn send_unicast(&self, to: PeerAddr, bytes: &[u8]) -> bool;

    /// Send `bytes` to the configured SD multicast group.
    fn send_multicast(&self, bytes: &[u8]) -> bool;
}

/// Pushed datagram notification, implemented by whatever owns the inbound
/// dispatch pipeline (C1 decode → C2 reboot check → C5 dispatch).
pub trait SdDatagramSink {
    fn on_datagram(&mut self, from: PeerAddr, bytes: &[u8]);
}
