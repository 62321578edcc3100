// Crate-wide error taxonomy.
//
// Mirrors the distinctions demanded by the error-handling design: wire-level
// parse failures are locally recoverable, protocol violations and peer loss
// drive state transitions, and API misuse is a programming error the caller
// must not paper over.

use thiserror::Error;

/// Errors from the SOME/IP-SD wire codec and the components built on it
/// (message builder, scheduler, server state machine).
#[derive(Debug, Error)]
pub enum SdError {
    /// `EntriesLength` or `OptionsLength` did not fit the rest of the datagram,
    /// or `EntriesLength` was not a multiple of 16.
    #[error("malformed SD message: {0}")]
    MalformedMessage(String),

    /// An entry referenced an option range outside the options array, or
    /// carried conflicting TCP/UDP endpoints.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The caller-supplied buffer is too small to hold the encoded message.
    #[error("output buffer too small: need {needed}, have {available}")]
    BufferTooSmall { needed: usize, available: usize },
}

/// Errors from the zero-copy channel (MemCon).
#[derive(Debug, Error)]
pub enum MemConError {
    /// The peer sent a message that violates the connection handshake's
    /// expected sequence.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The side channel reported that the peer closed cleanly.
    #[error("peer disconnected")]
    PeerDisconnected,

    /// The side channel reported that the peer is gone without a clean
    /// shutdown handshake (crash, kill -9, ...).
    #[error("peer crashed")]
    PeerCrashed,

    /// Mapping or allocating a shared-memory region failed.
    #[error("shared memory error: {0}")]
    Memory(#[from] std::io::Error),

    /// A best-effort notification could not be delivered.
    #[error("notification dropped: {0}")]
    DroppedNotification(String),

    /// A `SlotToken`'s generation no longer matches the slot's generation.
    #[error("stale slot token: token generation {token_gen}, slot generation {slot_gen}")]
    StaleToken { token_gen: u32, slot_gen: u32 },

    /// Caller violated an API precondition. Implementations abort rather than
    /// attempt to continue, since the violated invariant is load-bearing for
    /// memory safety (e.g. destroying a client while `is_in_use()`).
    #[error("API misuse: {0}")]
    ApiMisuse(String),
}

pub type SdResult<T> = Result<T, SdError>;
pub type MemConResult<T> = Result<T, MemConError>;
