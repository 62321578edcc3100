// C1 — Wire Codec (§4.1): SOME/IP-SD datagram encode/decode.

pub mod codec;
pub mod entry;
pub mod header;
pub mod message;
pub mod option;
pub mod primitives;
