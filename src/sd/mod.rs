//! SOME/IP Service Discovery engine (§3, §4).
//!
//! `wire` is C1, `reboot` is C2, `builder` is C3, `scheduler` is C4,
//! `server` is C5, and `sender` ties C1-C3 to an injected socket.

pub mod builder;
pub mod reboot;
pub mod scheduler;
pub mod sender;
pub mod server;
pub mod wire;
