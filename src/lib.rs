// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// SOME/IP service discovery (SD) engine plus a zero-copy shared-memory IPC
// channel (MemCon), sharing the same low-level shared-memory and
// synchronization primitives cpp-ipc's Rust port already provides.

pub mod shm_name;

mod platform;

mod shm;
pub use shm::{ShmHandle, ShmOpenMode};

mod mutex;
pub use mutex::IpcMutex;

mod condition;
pub use condition::IpcCondition;

mod spin_lock;
pub use spin_lock::SpinLock;

mod rw_lock;
pub use rw_lock::RwLock;

mod scoped_access;
pub use scoped_access::ScopedAccess;

mod mem;
mod chunk_storage;
mod waiter;

pub mod buffer;
pub mod channel;

pub mod error;
pub mod clock;
pub mod net;
pub mod config;

pub mod sd;
pub mod memcon;
